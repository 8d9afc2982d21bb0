//! Idle-TTL state machine (§4.E): pure function from the current desired
//! state plus an observed registry snapshot to the next desired state.
//! Kept free of any `kube`/`reqwest` I/O so it is directly unit-testable
//! as a plain synchronous function.

use relay_protocol::{Ttl, WorkspaceAgentPhase, WorkspaceAgentStatus};

/// What the Agent Registry reports for an identity, or `None` if it has
/// never registered. `session_count` is the number of open proxy streams
/// against the agent's control connection, not whether that connection
/// itself is open — the control WebSocket stays up independent of user
/// traffic, so it cannot stand in for idleness.
#[derive(Debug, Clone, Copy)]
pub struct AgentStatusSnapshot {
    pub online: bool,
    pub last_activity: u64,
    pub session_count: u32,
}

/// Decides the next `(phase, replicas)` for a `WorkspaceAgent` given its
/// current status, `ttl`, and a registry snapshot. `snapshot` is `None`
/// only when the registry couldn't be reached or answered something
/// unparseable — the current state is preserved rather than guessed at,
/// and the next reconcile tick tries again.
pub fn next_state(
    ttl: &Ttl,
    status: &WorkspaceAgentStatus,
    snapshot: Option<AgentStatusSnapshot>,
    now: u64,
) -> (WorkspaceAgentPhase, u32) {
    match snapshot {
        None => (status.phase, status.replicas),
        Some(s) if s.session_count > 0 => (WorkspaceAgentPhase::Running, status.replicas.max(1)),
        Some(s) => match ttl {
            Ttl::Disabled => (WorkspaceAgentPhase::Running, status.replicas.max(1)),
            Ttl::Seconds(ttl_secs) => {
                if now.saturating_sub(s.last_activity) >= *ttl_secs {
                    (WorkspaceAgentPhase::ScaledDown, 0)
                } else {
                    (WorkspaceAgentPhase::Running, status.replicas.max(1))
                }
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(replicas: u32) -> WorkspaceAgentStatus {
        WorkspaceAgentStatus {
            replicas,
            ..Default::default()
        }
    }

    #[test]
    fn unreachable_registry_preserves_current_state() {
        let mut current = status(0);
        current.phase = WorkspaceAgentPhase::Pending;
        let (phase, replicas) = next_state(&Ttl::Seconds(3600), &current, None, 1000);
        assert_eq!(phase, WorkspaceAgentPhase::Pending);
        assert_eq!(replicas, 0);
    }

    #[test]
    fn never_registered_snapshot_past_ttl_scales_down() {
        let snapshot = AgentStatusSnapshot { online: false, last_activity: 0, session_count: 0 };
        let (phase, replicas) = next_state(&Ttl::Seconds(3600), &status(1), Some(snapshot), 4000);
        assert_eq!(phase, WorkspaceAgentPhase::ScaledDown);
        assert_eq!(replicas, 0);
    }

    #[test]
    fn open_session_is_running_regardless_of_idle_duration() {
        // The control connection alone never implies activity; an open
        // proxy stream does, even if `last_activity` is old (a long-lived
        // stream that itself carries no more bytes after the initial burst).
        let snapshot = AgentStatusSnapshot { online: true, last_activity: 0, session_count: 1 };
        let (phase, replicas) = next_state(&Ttl::Seconds(3600), &status(1), Some(snapshot), 1_000_000);
        assert_eq!(phase, WorkspaceAgentPhase::Running);
        assert_eq!(replicas, 1);
    }

    #[test]
    fn online_with_no_sessions_past_ttl_scales_down() {
        // The control WebSocket staying open must not keep the workload
        // alive once every proxy session has closed and the TTL lapses.
        let snapshot = AgentStatusSnapshot { online: true, last_activity: 0, session_count: 0 };
        let (phase, replicas) = next_state(&Ttl::Seconds(3600), &status(1), Some(snapshot), 4000);
        assert_eq!(phase, WorkspaceAgentPhase::ScaledDown);
        assert_eq!(replicas, 0);
    }

    #[test]
    fn idle_past_ttl_scales_down() {
        let snapshot = AgentStatusSnapshot { online: false, last_activity: 0, session_count: 0 };
        let (phase, replicas) = next_state(&Ttl::Seconds(3600), &status(1), Some(snapshot), 4000);
        assert_eq!(phase, WorkspaceAgentPhase::ScaledDown);
        assert_eq!(replicas, 0);
    }

    #[test]
    fn idle_within_ttl_stays_running() {
        let snapshot = AgentStatusSnapshot { online: false, last_activity: 3999, session_count: 0 };
        let (phase, replicas) = next_state(&Ttl::Seconds(3600), &status(1), Some(snapshot), 4000);
        assert_eq!(phase, WorkspaceAgentPhase::Running);
        assert_eq!(replicas, 1);
    }

    #[test]
    fn disabled_ttl_never_scales_down() {
        let snapshot = AgentStatusSnapshot { online: false, last_activity: 0, session_count: 0 };
        let (phase, replicas) = next_state(&Ttl::Disabled, &status(1), Some(snapshot), 1_000_000);
        assert_eq!(phase, WorkspaceAgentPhase::Running);
        assert_eq!(replicas, 1);
    }
}
