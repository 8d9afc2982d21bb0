//! Management interface (§6) consumed by the Workspace Controller to poll
//! liveness/activity for its idle-TTL state machine: `GET /v1/agents` and
//! `GET /v1/agents/{identity}`. Unauthenticated on the loopback-only admin
//! listener; this surface never leaves the cluster network.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use relay_protocol::{AgentIdentity, ErrorKind};
use serde::Serialize;

use crate::respond::error_response;
use crate::state::AppState;

#[derive(Serialize)]
struct AgentListEntry {
    identity: AgentIdentity,
    #[serde(flatten)]
    status: crate::registry::AgentStatus,
}

pub async fn list_agents(State(state): State<AppState>) -> Json<Vec<AgentListEntry>> {
    let entries = state
        .registry
        .list()
        .into_iter()
        .map(|(identity, status)| AgentListEntry { identity, status })
        .collect();
    Json(entries)
}

pub async fn get_agent(State(state): State<AppState>, Path(identity): Path<String>) -> Response {
    let Ok(identity) = AgentIdentity::parse(&identity) else {
        return error_response(ErrorKind::Forbidden, "malformed agent identity");
    };
    if state.registry.lookup(&identity).is_none() {
        return StatusCode::NOT_FOUND.into_response();
    }
    Json(state.registry.status(&identity)).into_response()
}
