//! The `kube::runtime::Controller` reconcile loop (§4.E). Desired-state
//! translation and change detection live in [`crate::desired`]; the
//! idle-TTL policy lives in [`crate::ttl`]; this module is the glue that
//! calls both against a [`crate::orchestrator::WorkloadOrchestrator`] and
//! the Agent Registry.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use relay_protocol::{AgentIdentity, WorkspaceAgent, WorkspaceAgentCondition, WorkspaceAgentStatus};

use crate::desired::{desired_deployment, desired_pvc, normalize};
use crate::orchestrator::WorkloadOrchestrator;
use crate::registry_client::AgentRegistryClient;
use crate::ttl::next_state;

/// Maps an `AgentIdentity` to the `(namespace, object name)` of the
/// `WorkspaceAgent` that owns it, kept current by every reconcile so the
/// wake endpoint (§4.E) can find the right object without re-deriving the
/// name-hash scheme from the identity string, which is lossy (the owner
/// and workspace name can themselves contain `-`).
pub type IdentityIndex = Arc<DashMap<AgentIdentity, (String, String)>>;

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("orchestrator error: {0}")]
    Orchestrator(#[from] crate::orchestrator::OrchestratorError),
    #[error("identity error: {0}")]
    Identity(#[from] relay_protocol::IdentityFormatError),
}

pub struct Context<O: WorkloadOrchestrator> {
    pub orchestrator: O,
    pub registry_client: AgentRegistryClient,
    pub agent_image: String,
    pub reconcile_tick: Duration,
    pub identity_index: IdentityIndex,
    pub wake_grace_secs: u64,
    pub now: fn() -> u64,
}

fn now_secs() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

impl<O: WorkloadOrchestrator> Context<O> {
    pub fn new(
        orchestrator: O,
        registry_client: AgentRegistryClient,
        agent_image: String,
        reconcile_tick: Duration,
        identity_index: IdentityIndex,
        wake_grace_secs: u64,
    ) -> Self {
        Self {
            orchestrator,
            registry_client,
            agent_image,
            reconcile_tick,
            identity_index,
            wake_grace_secs,
            now: now_secs,
        }
    }
}

pub async fn reconcile<O: WorkloadOrchestrator>(agent: Arc<WorkspaceAgent>, ctx: Arc<Context<O>>) -> Result<Action, ReconcileError> {
    let ns = agent.namespace().unwrap_or_else(|| "default".to_string());
    let spec = &agent.spec;
    let identity = AgentIdentity::parse(format!("{}-{}", spec.owner, spec.name))?;
    let current_status = agent.status.clone().unwrap_or_default();
    ctx.identity_index.insert(identity.clone(), (ns.clone(), agent.name_any()));

    let now = (ctx.now)();
    let snapshot = ctx.registry_client.snapshot(&identity).await;

    let within_wake_grace = current_status
        .pending_wake_at
        .is_some_and(|woken_at| now.saturating_sub(woken_at) < ctx.wake_grace_secs);

    let ttl = if current_status.replicas == 0 || within_wake_grace {
        // Either a freshly created record with nothing to poll yet, or a
        // just-woken one still inside its registration grace window: both
        // go straight to ensuring the workload exists rather than having
        // the idle-TTL policy revert a not-yet-registered agent to
        // `ScaledDown` before its pod can start.
        None
    } else {
        Some(&spec.ttl)
    };

    let (phase, replicas) = match ttl {
        None => (relay_protocol::WorkspaceAgentPhase::Pending, 1),
        Some(ttl) => next_state(ttl, &current_status, snapshot, now),
    };

    let pending_wake_at = match current_status.pending_wake_at {
        Some(woken_at) if now.saturating_sub(woken_at) >= ctx.wake_grace_secs => None,
        Some(_) if snapshot.is_some_and(|s| s.session_count > 0) => None,
        other => other,
    };

    let pvc = desired_pvc(&spec.owner, &spec.name, spec);
    ctx.orchestrator.apply_pvc(&ns, &pvc).await?;

    let deployment = desired_deployment(&spec.owner, &spec.name, spec, replicas, &ctx.agent_image);
    let changed = match ctx.orchestrator.current_deployment(&ns, deployment.metadata.name.as_deref().unwrap_or_default()).await? {
        Some(live) => normalize(&live) != normalize(&deployment),
        None => true,
    };
    if changed {
        ctx.orchestrator.apply_deployment(&ns, &deployment).await?;
    }

    let mut conditions = current_status.conditions.clone();
    if current_status.phase != phase {
        conditions.push(WorkspaceAgentCondition {
            kind: "PhaseTransition".to_string(),
            message: format!("{:?} -> {:?}", current_status.phase, phase),
            observed_at: now,
        });
        conditions.truncate(conditions.len().min(20));
    }

    let new_status = WorkspaceAgentStatus {
        phase,
        replicas,
        last_activity: snapshot.map(|s| s.last_activity).unwrap_or(current_status.last_activity),
        conditions,
        pending_wake_at,
    };

    let name = agent.name_any();
    ctx.orchestrator.patch_status(&ns, &name, &serde_json::to_value(&new_status).unwrap_or_default()).await?;

    Ok(Action::requeue(ctx.reconcile_tick))
}

pub fn error_policy<O: WorkloadOrchestrator>(_agent: Arc<WorkspaceAgent>, err: &ReconcileError, ctx: Arc<Context<O>>) -> Action {
    tracing::warn!(%err, "reconcile failed, retrying");
    Action::requeue(ctx.reconcile_tick.min(Duration::from_secs(30)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::MockOrchestrator;
    use relay_protocol::{ResourceRequirements, StorageSpec, WorkspaceAgentSpec};

    fn test_agent() -> Arc<WorkspaceAgent> {
        let spec = WorkspaceAgentSpec {
            name: "ws1".into(),
            owner: "alpha".into(),
            image: "ghcr.io/example/dev:latest".into(),
            local_target: "127.0.0.1:22".into(),
            storage: StorageSpec { size: "10Gi".into(), storage_class: None, mount_path: "/home/user".into() },
            resources: ResourceRequirements::default(),
            ..Default::default()
        };
        let mut agent = WorkspaceAgent::new("ws1", spec);
        agent.meta_mut().namespace = Some("default".to_string());
        Arc::new(agent)
    }

    fn test_context() -> Arc<Context<MockOrchestrator>> {
        Arc::new(Context::new(
            MockOrchestrator::new(),
            AgentRegistryClient::new("http://127.0.0.1:1"),
            "relaytun/relay-agent:latest".to_string(),
            Duration::from_secs(30),
            Arc::new(DashMap::new()),
            120,
        ))
    }

    #[tokio::test]
    async fn first_reconcile_creates_deployment_and_pvc() {
        let agent = test_agent();
        let ctx = test_context();
        reconcile(agent.clone(), ctx.clone()).await.unwrap();
        assert_eq!(ctx.orchestrator.deployments.len(), 1);
        assert_eq!(ctx.orchestrator.pvcs.len(), 1);
        assert_eq!(ctx.orchestrator.statuses.len(), 1);
    }

    #[tokio::test]
    async fn identity_index_is_populated_on_reconcile() {
        let agent = test_agent();
        let ctx = test_context();
        reconcile(agent, ctx.clone()).await.unwrap();
        let identity = AgentIdentity::parse("alpha-ws1").unwrap();
        assert!(ctx.identity_index.contains_key(&identity));
    }

    #[tokio::test]
    async fn unchanged_desired_state_skips_reapply() {
        let agent = test_agent();
        let ctx = test_context();
        reconcile(agent.clone(), ctx.clone()).await.unwrap();
        let before = ctx.orchestrator.deployments.len();
        // Second reconcile against the same agent and an orchestrator that
        // already reports the matching deployment: no redundant apply.
        let mut second_agent = (*agent).clone();
        second_agent.status = Some(WorkspaceAgentStatus { phase: relay_protocol::WorkspaceAgentPhase::Pending, replicas: 1, ..Default::default() });
        reconcile(Arc::new(second_agent), ctx.clone()).await.unwrap();
        assert_eq!(ctx.orchestrator.deployments.len(), before);
    }

    #[tokio::test]
    async fn wake_grace_window_suspends_ttl_for_unregistered_agent() {
        let agent = test_agent();
        let ctx = test_context();
        reconcile(agent.clone(), ctx.clone()).await.unwrap();

        // A wake just patched replicas to 1 and stamped `pending_wake_at`;
        // the registry has nothing registered yet and the TTL is tiny, so
        // an unprotected reconcile would immediately revert to ScaledDown.
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs();
        let mut woken_agent = (*agent).clone();
        woken_agent.spec.ttl = relay_protocol::Ttl::Seconds(1);
        woken_agent.status = Some(WorkspaceAgentStatus {
            phase: relay_protocol::WorkspaceAgentPhase::Pending,
            replicas: 1,
            pending_wake_at: Some(now),
            ..Default::default()
        });

        reconcile(Arc::new(woken_agent), ctx.clone()).await.unwrap();
        let patched = ctx.orchestrator.statuses.get("ws1").unwrap();
        assert_eq!(patched.get("replicas").and_then(|v| v.as_u64()), Some(1));
        assert_eq!(patched.get("phase").and_then(|v| v.as_str()), Some("Pending"));
    }

    #[tokio::test]
    async fn expired_wake_grace_allows_ttl_to_scale_down() {
        let agent = test_agent();
        let ctx = test_context();
        reconcile(agent.clone(), ctx.clone()).await.unwrap();

        let mut woken_agent = (*agent).clone();
        woken_agent.spec.ttl = relay_protocol::Ttl::Seconds(1);
        woken_agent.status = Some(WorkspaceAgentStatus {
            phase: relay_protocol::WorkspaceAgentPhase::Pending,
            replicas: 1,
            // Woken well over `wake_grace_secs` (120) ago: grace has
            // elapsed and the agent never registered, so TTL applies.
            pending_wake_at: Some(0),
            ..Default::default()
        });

        reconcile(Arc::new(woken_agent), ctx.clone()).await.unwrap();
        let patched = ctx.orchestrator.statuses.get("ws1").unwrap();
        assert_eq!(patched.get("replicas").and_then(|v| v.as_u64()), Some(0));
        assert_eq!(patched.get("phase").and_then(|v| v.as_str()), Some("ScaledDown"));
    }
}
