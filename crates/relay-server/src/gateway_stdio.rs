//! stdio-over-WebSocket surface (§4.D): `relay proxy <identity>` dials
//! `/v1/proxy`, authenticates with a bearer token and an `X-Relay-Identity`
//! header, and gets back a duplex byte channel onto the agent's local
//! target. The WebSocket carries no application protocol of its own —
//! binary frames are raw bytes, spliced directly onto an opened
//! [`relay_mux::MuxStream`].

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum_extra::headers::{Authorization, authorization::Bearer};
use axum_extra::TypedHeader;
use futures_util::{SinkExt, StreamExt};
use relay_protocol::{AgentIdentity, ErrorKind};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::registry::AgentSession;
use crate::respond::error_response;
use crate::state::AppState;

const IDENTITY_HEADER: &str = "x-relay-identity";

pub async fn proxy(
    State(state): State<AppState>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(identity) = headers
        .get(IDENTITY_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| AgentIdentity::parse(s).ok())
    else {
        return error_response(ErrorKind::Forbidden, "missing or invalid X-Relay-Identity header");
    };

    let principal = match state.verifier.verify(auth.token()).await {
        Ok(p) => p,
        Err(_) => return error_response(ErrorKind::Unauthenticated, "invalid or expired token"),
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

    ws.on_upgrade(move |socket| bridge(socket, mux_stream, session))
}

/// Registry lookup with the wake coupling to the Workspace Controller
/// (§4.E): a miss fires a wake request and retries the lookup for up to
/// `stream_open_timeout_secs` before giving up with `AgentOffline`.
pub(crate) async fn resolve_session(
    state: &AppState,
    identity: &AgentIdentity,
) -> Result<Arc<AgentSession>, ErrorKind> {
    if let Some(session) = state.registry.lookup(identity) {
        return Ok(session);
    }

    state
        .metrics
        .wakes_requested
        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    state.wake.wake(identity).await;

    let deadline = std::time::Instant::now()
        + Duration::from_secs(state.config.server.stream_open_timeout_secs);
    while std::time::Instant::now() < deadline {
        if let Some(session) = state.registry.lookup(identity) {
            return Ok(session);
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    Err(ErrorKind::AgentOffline)
}

async fn bridge(socket: WebSocket, mux_stream: relay_mux::MuxStream, session: Arc<AgentSession>) {
    let (mut ws_sink, mut ws_stream) = socket.split();
    let (mut mux_read, mut mux_write) = tokio::io::split(mux_stream);

    let to_mux = async {
        while let Some(Ok(msg)) = ws_stream.next().await {
            match msg {
                Message::Binary(bytes) => {
                    if mux_write.write_all(&bytes).await.is_err() {
                        break;
                    }
                    session.bump_activity();
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
        let _ = mux_write.shutdown().await;
    };

    let to_ws = async {
        let mut buf = [0u8; 16 * 1024];
        loop {
            match mux_read.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if ws_sink.send(Message::Binary(buf[..n].to_vec().into())).await.is_err() {
                        break;
                    }
                    session.bump_activity();
                }
            }
        }
    };

    tokio::join!(to_mux, to_ws);
    session.on_stream_closed();
}
