//! Agent control channel (§4.C Registration protocol): the long-lived
//! WebSocket an agent dials to register an identity and start accepting
//! multiplexed user streams.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::Response;
use axum_extra::headers::authorization::Bearer;
use axum_extra::headers::Authorization;
use axum_extra::TypedHeader;
use relay_mux::{MuxTransport, Role, Session, TransportError};
use relay_protocol::{AgentIdentity, Frame};

use crate::respond::error_response;
use crate::state::AppState;
use relay_protocol::ErrorKind;

const IDENTITY_HEADER: &str = "x-relay-identity";

pub async fn control(
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

    let handshake_timeout = std::time::Duration::from_secs(state.config.server.handshake_timeout_secs);
    let verify = tokio::time::timeout(handshake_timeout, state.verifier.verify(auth.token()));
    let principal = match verify.await {
        Ok(Ok(p)) => p,
        Ok(Err(_)) => return error_response(ErrorKind::Unauthenticated, "invalid or expired token"),
        Err(_) => return error_response(ErrorKind::Unauthenticated, "registration handshake timed out"),
    };
    if principal.owner != identity.owner_prefix() {
        return error_response(ErrorKind::Forbidden, "owner claim does not match identity prefix");
    }

    ws.on_upgrade(move |socket| register(socket, state, identity, principal))
}

/// Adapts an [`axum::extract::ws::WebSocket`] to [`MuxTransport`], encoding
/// each [`Frame`] as one binary WebSocket message.
struct WsTransport(WebSocket);

impl MuxTransport for WsTransport {
    async fn send_frame(&mut self, frame: Frame) -> Result<(), TransportError> {
        let bytes = frame.encode();
        self.0
            .send(Message::Binary(bytes.into()))
            .await
            .map_err(|e| TransportError::Io(e.to_string()))
    }

    async fn recv_frame(&mut self) -> Result<Option<Frame>, TransportError> {
        loop {
            match self.0.recv().await {
                Some(Ok(Message::Binary(bytes))) => return Ok(Some(Frame::decode(&bytes)?)),
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(TransportError::Io(e.to_string())),
            }
        }
    }
}

async fn register(
    socket: WebSocket,
    state: AppState,
    identity: AgentIdentity,
    principal: relay_protocol::UserPrincipal,
) {
    let (session, join) = Session::new(WsTransport(socket), Role::Even);
    let (new_session, prior) = state.registry.register(identity.clone(), principal, session);

    if let Some(prior) = prior {
        tracing::info!(%identity, "evicting prior session on reconnect");
        prior.session.close().await;
    }

    tracing::info!(target: "audit", %identity, event = "agent_session_started");
    crate::registry::spawn_liveness_task(state.registry.clone(), identity, new_session, join);
}
