//! The controller side of wake-up coupling (§4.E): `POST
//! /v1/agents/{identity}:wake`, called by `relay-server`'s
//! `relay_server::wake::WakeClient` on a registry miss for a known-
//! `ScaledDown` identity. Patches the owning `WorkspaceAgent`'s status to
//! request a replica; the watch on that patch requeues the reconcile
//! loop, which then re-applies the `Deployment` at `replicas: 1`.
//!
//! Concurrent wakes for the same identity are coalesced through the same
//! `DashMap<AgentIdentity, Notify>` in-flight pattern as the gateway's own
//! `WakeClient`.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use dashmap::DashMap;
use relay_protocol::{AgentIdentity, WorkspaceAgentPhase};
use tokio::sync::Notify;

use crate::orchestrator::WorkloadOrchestrator;
use crate::reconcile::Context;

pub struct WakeState<O: WorkloadOrchestrator> {
    pub ctx: Arc<Context<O>>,
    in_flight: DashMap<AgentIdentity, Arc<Notify>>,
}

impl<O: WorkloadOrchestrator> WakeState<O> {
    pub fn new(ctx: Arc<Context<O>>) -> Self {
        Self { ctx, in_flight: DashMap::new() }
    }
}

pub async fn wake<O: WorkloadOrchestrator + 'static>(
    State(state): State<Arc<WakeState<O>>>,
    Path(identity_action): Path<String>,
) -> Response {
    // `identity:wake` arrives as a single path segment — axum's `{..}`
    // captures up to the next `/`, not up to `:` — so the `:wake` suffix
    // is stripped here rather than matched in the route.
    let Some(raw_identity) = identity_action.strip_suffix(":wake") else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let Ok(identity) = AgentIdentity::parse(raw_identity) else {
        return StatusCode::BAD_REQUEST.into_response();
    };

    if let Some(notify) = state.in_flight.get(&identity) {
        let notify = notify.clone();
        drop(state.in_flight.get(&identity));
        notify.notified().await;
        return StatusCode::ACCEPTED.into_response();
    }

    let notify = Arc::new(Notify::new());
    state.in_flight.insert(identity.clone(), notify.clone());
    let result = do_wake(&state.ctx, &identity).await;
    state.in_flight.remove(&identity);
    notify.notify_waiters();

    match result {
        Ok(true) => StatusCode::ACCEPTED.into_response(),
        Ok(false) => StatusCode::NOT_FOUND.into_response(),
        Err(err) => {
            tracing::warn!(%identity, %err, "wake request failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn do_wake<O: WorkloadOrchestrator>(ctx: &Context<O>, identity: &AgentIdentity) -> Result<bool, crate::orchestrator::OrchestratorError> {
    let Some(entry) = ctx.identity_index.get(identity) else {
        return Ok(false);
    };
    let (namespace, name) = entry.value().clone();
    drop(entry);

    let status = serde_json::json!({
        "phase": WorkspaceAgentPhase::Pending,
        "replicas": 1,
        "pending_wake_at": (ctx.now)(),
    });
    ctx.orchestrator.patch_status(&namespace, &name, &status).await?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::MockOrchestrator;
    use crate::registry_client::AgentRegistryClient;
    use std::time::Duration;

    fn context_with_index() -> Arc<Context<MockOrchestrator>> {
        let ctx = Context::new(
            MockOrchestrator::new(),
            AgentRegistryClient::new("http://127.0.0.1:1"),
            "relaytun/relay-agent:latest".to_string(),
            Duration::from_secs(30),
            Arc::new(DashMap::new()),
            120,
        );
        let identity = AgentIdentity::parse("alpha-ws1").unwrap();
        ctx.identity_index.insert(identity, ("default".to_string(), "ws1".to_string()));
        Arc::new(ctx)
    }

    #[tokio::test]
    async fn unknown_identity_returns_false() {
        let ctx = context_with_index();
        let unknown = AgentIdentity::parse("alpha-ws2").unwrap();
        assert!(!do_wake(&ctx, &unknown).await.unwrap());
    }

    #[tokio::test]
    async fn known_identity_patches_status() {
        let ctx = context_with_index();
        let identity = AgentIdentity::parse("alpha-ws1").unwrap();
        assert!(do_wake(&ctx, &identity).await.unwrap());
        assert!(ctx.orchestrator.statuses.contains_key("ws1"));
    }
}
