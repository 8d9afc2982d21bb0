//! Virtual-host HTTP surface (§4.D): `<identity>.<agent-domain>` requests
//! are dispatched to the matching agent's local target over an opened
//! mux stream. Unauthenticated browsers are bounced through the OIDC
//! authorization-code flow anchored at `/auth/login` and `/auth/callback`,
//! using an `oauth2` exchange and the JWKS verifier from
//! [`crate::identity`].

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{header, Request, StatusCode};
use axum::response::{IntoResponse, Redirect, Response};
use axum_extra::extract::cookie::{Cookie, CookieJar};
use hyper_util::rt::TokioIo;
use relay_protocol::{AgentIdentity, ErrorKind};
use serde::Deserialize;

use crate::gateway_stdio::resolve_session;
use crate::respond::error_response;
use crate::state::AppState;

const COOKIE_NAME: &str = "relay_session";
const COOKIE_TTL_SECS: u64 = 8 * 3600;

fn identity_for_host(agent_domain: &str, host: &str) -> Option<AgentIdentity> {
    let host = host.split(':').next().unwrap_or(host);
    let sub = host.strip_suffix(agent_domain)?.strip_suffix('.')?;
    AgentIdentity::parse(sub).ok()
}

pub async fn dispatch(State(state): State<AppState>, jar: CookieJar, req: Request<Body>) -> Response {
    let Some(host) = req
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
    else {
        return (StatusCode::BAD_REQUEST, "missing Host header").into_response();
    };

    let Some(identity) = identity_for_host(&state.config.server.agent_domain, &host) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let principal = match jar.get(COOKIE_NAME).and_then(|c| state.cookies.resolve(c.value())) {
        Some(p) => p,
        None => {
            let original_url = format!("https://{host}{}", req.uri());
            let auth_url = state.oidc.begin(original_url);
            return Redirect::temporary(&auth_url).into_response();
        }
    };

    if !principal.owns(&identity) {
        return error_response(ErrorKind::Forbidden, "principal does not own this identity");
    }

    let session = match resolve_session(&state, &identity).await {
        Ok(s) => s,
        Err(kind) => return error_response(kind, "agent session unavailable"),
    };

    let mux_stream = match session.open_stream().await {
        Ok(s) => s,
        Err(_) => return error_response(ErrorKind::QuotaExceeded, "stream quota exceeded"),
    };
    state
        .metrics
        .streams_opened
        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

    let io = TokioIo::new(mux_stream);
    let (mut sender, conn) = match hyper::client::conn::http1::handshake(io).await {
        Ok(pair) => pair,
        Err(e) => {
            return error_response(ErrorKind::UpstreamFailed, format!("dial failed: {e}"));
        }
    };
    let session_for_close = session.clone();
    tokio::spawn(async move {
        let _ = conn.await;
        session_for_close.on_stream_closed();
    });

    let result = sender.send_request(req).await;
    session.bump_activity();
    match result {
        Ok(resp) => resp.map(Body::new),
        Err(e) => error_response(ErrorKind::UpstreamFailed, format!("upstream error: {e}")),
    }
}

#[derive(Debug, Deserialize)]
pub struct CallbackParams {
    code: String,
    state: String,
}

pub async fn auth_callback(
    State(state): State<AppState>,
    Query(params): Query<CallbackParams>,
) -> Response {
    state
        .metrics
        .logins_attempted
        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

    let (original_url, access_token) = match state.oidc.exchange(&params.state, params.code).await {
        Ok(pair) => pair,
        Err(e) => {
            state
                .metrics
                .logins_failed
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            tracing::warn!(error = %e, "oidc exchange failed");
            return error_response(ErrorKind::Unauthenticated, "oidc exchange failed");
        }
    };

    let principal = match state.verifier.verify(&access_token).await {
        Ok(p) => p,
        Err(_) => {
            state
                .metrics
                .logins_failed
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            return error_response(ErrorKind::Unauthenticated, "token verification failed");
        }
    };

    let (cookie_id, _expires_at) = state.cookies.mint(principal, COOKIE_TTL_SECS);
    let cookie = Cookie::build((COOKIE_NAME, cookie_id))
        .domain(format!(".{}", state.config.server.agent_domain))
        .path("/")
        .secure(true)
        .http_only(true)
        .same_site(axum_extra::extract::cookie::SameSite::Lax)
        .max_age(time::Duration::seconds(COOKIE_TTL_SECS as i64))
        .build();

    (CookieJar::new().add(cookie), Redirect::temporary(&original_url)).into_response()
}
