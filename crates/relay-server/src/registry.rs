//! Agent Registry (§4.C): the identity → session map, its uniqueness
//! invariant, liveness monitoring and the query interface consumed by the
//! Workspace Controller and the User Gateway.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use relay_mux::Session;
use relay_protocol::{AgentIdentity, UserPrincipal};
use tokio::sync::Semaphore;

pub struct AgentSession {
    pub identity: AgentIdentity,
    pub principal: UserPrincipal,
    pub session: Session,
    pub registered_at: Instant,
    last_activity_secs: AtomicU64,
    last_bumped_at_secs: AtomicU64,
    stream_count: AtomicU32,
    open_counter: AtomicU64,
    stream_permits: Semaphore,
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct AgentStatus {
    pub online: bool,
    pub last_activity: u64,
    pub session_count: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("stream quota exceeded for this agent")]
    QuotaExceeded,
    #[error("session gone")]
    SessionGone,
}

fn now_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

impl AgentSession {
    fn new(identity: AgentIdentity, principal: UserPrincipal, session: Session, max_streams: u32) -> Self {
        Self {
            identity,
            principal,
            session,
            registered_at: Instant::now(),
            last_activity_secs: AtomicU64::new(now_secs()),
            last_bumped_at_secs: AtomicU64::new(0),
            stream_count: AtomicU32::new(0),
            open_counter: AtomicU64::new(0),
            stream_permits: Semaphore::new(max_streams as usize),
        }
    }

    /// Bumped on every byte flowing through a PendingStream, throttled to
    /// at most once per second per session (§4.C Activity Accounting).
    pub fn bump_activity(&self) {
        let now = now_secs();
        let last = self.last_bumped_at_secs.load(Ordering::Relaxed);
        if now > last {
            self.last_bumped_at_secs.store(now, Ordering::Relaxed);
            self.last_activity_secs.store(now, Ordering::Relaxed);
        }
    }

    pub fn last_activity(&self) -> u64 {
        self.last_activity_secs.load(Ordering::Relaxed)
    }

    pub fn stream_count(&self) -> u32 {
        self.stream_count.load(Ordering::Relaxed)
    }

    /// Opens a stream on this session's multiplexer, enforcing the
    /// per-agent concurrent stream cap (default 64, §5) without blocking
    /// the other 63 already-open streams.
    pub async fn open_stream(&self) -> Result<relay_mux::MuxStream, RegistryError> {
        let permit = self
            .stream_permits
            .clone()
            .try_acquire_owned()
            .map_err(|_| RegistryError::QuotaExceeded)?;
        let stream = self
            .session
            .open()
            .await
            .map_err(|_| RegistryError::SessionGone)?;
        self.stream_count.fetch_add(1, Ordering::Relaxed);
        self.open_counter.fetch_add(1, Ordering::Relaxed);
        // MuxStream carries no registry awareness, so the permit can't ride
        // along with it; release is manual via `on_stream_closed`.
        permit.forget();
        Ok(stream)
    }

    pub fn on_stream_closed(&self) {
        self.stream_count.fetch_sub(1, Ordering::Relaxed);
        self.stream_permits.add_permits(1);
    }
}

/// `AgentIdentity → AgentSession`, with the uniqueness invariant: at most
/// one live session per identity (§3).
pub struct AgentRegistry {
    sessions: DashMap<AgentIdentity, Arc<AgentSession>>,
    max_streams_per_agent: u32,
}

impl AgentRegistry {
    pub fn new(max_streams_per_agent: u32) -> Arc<Self> {
        Arc::new(Self {
            sessions: DashMap::new(),
            max_streams_per_agent,
        })
    }

    /// Step 3 of the registration protocol (§4.C): newest-wins eviction of
    /// any prior session under the identity's exclusive section, then
    /// insertion of the new one. Returns the evicted prior session, if any,
    /// so the caller can close its multiplexer outside the critical
    /// section (closing while holding the shard lock would violate §5's
    /// "must not perform I/O while holding the lock").
    pub fn register(
        &self,
        identity: AgentIdentity,
        principal: UserPrincipal,
        session: Session,
    ) -> (Arc<AgentSession>, Option<Arc<AgentSession>>) {
        let new_session = Arc::new(AgentSession::new(
            identity.clone(),
            principal,
            session,
            self.max_streams_per_agent,
        ));
        let prior = self.sessions.insert(identity, new_session.clone());
        (new_session, prior)
    }

    pub fn lookup(&self, identity: &AgentIdentity) -> Option<Arc<AgentSession>> {
        self.sessions.get(identity).map(|e| e.value().clone())
    }

    pub fn status(&self, identity: &AgentIdentity) -> AgentStatus {
        match self.lookup(identity) {
            Some(s) => AgentStatus {
                online: true,
                last_activity: s.last_activity(),
                session_count: s.stream_count(),
            },
            None => AgentStatus {
                online: false,
                last_activity: 0,
                session_count: 0,
            },
        }
    }

    /// Administrative override (§4.C `evict`).
    pub fn evict(&self, identity: &AgentIdentity) -> Option<Arc<AgentSession>> {
        self.sessions.remove(identity).map(|(_, s)| s)
    }

    /// Removes the entry only if it still points at `expected` — guards
    /// against a liveness task racing a newer registration for the same
    /// identity and evicting the wrong session.
    pub fn remove_if_current(&self, identity: &AgentIdentity, expected: &Arc<AgentSession>) {
        self.sessions.remove_if(identity, |_, v| Arc::ptr_eq(v, expected));
    }

    pub fn list(&self) -> Vec<(AgentIdentity, AgentStatus)> {
        self.sessions
            .iter()
            .map(|e| {
                let status = AgentStatus {
                    online: true,
                    last_activity: e.value().last_activity(),
                    session_count: e.value().stream_count(),
                };
                (e.key().clone(), status)
            })
            .collect()
    }

    /// Closes every live session and clears the map, for graceful shutdown.
    /// Closing propagates to each session's open streams (and, through
    /// them, the connected agents and user-facing gateway connections),
    /// rather than dropping the process out from under them.
    pub async fn drain(&self) {
        let sessions: Vec<Arc<AgentSession>> = self.sessions.iter().map(|e| e.value().clone()).collect();
        self.sessions.clear();
        for session in sessions {
            session.session.close().await;
        }
    }
}

/// Spawns the per-session liveness task (§4.C Liveness): owns no heartbeat,
/// just waits on the multiplexer's pump handle and removes the entry when
/// it ends.
pub fn spawn_liveness_task(
    registry: Arc<AgentRegistry>,
    identity: AgentIdentity,
    session: Arc<AgentSession>,
    mux_join: tokio::task::JoinHandle<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let _ = mux_join.await;
        registry.remove_if_current(&identity, &session);
        tracing::info!(target: "audit", identity = %identity, event = "agent_session_ended");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_mux::Role;

    fn principal(owner: &str) -> UserPrincipal {
        UserPrincipal {
            subject: format!("sub-{owner}"),
            owner: owner.to_string(),
            roles: vec![],
            expiry: u64::MAX,
        }
    }

    struct NullTransport;
    impl relay_mux::MuxTransport for NullTransport {
        async fn send_frame(&mut self, _: relay_protocol::Frame) -> Result<(), relay_mux::TransportError> {
            Ok(())
        }
        async fn recv_frame(&mut self) -> Result<Option<relay_protocol::Frame>, relay_mux::TransportError> {
            std::future::pending().await
        }
    }

    fn fake_session() -> Session {
        Session::new(NullTransport, Role::Even).0
    }

    #[tokio::test]
    async fn registering_twice_evicts_prior_and_keeps_one_session() {
        let registry = AgentRegistry::new(64);
        let id = AgentIdentity::parse("alpha-ws1").unwrap();

        let (first, prior) = registry.register(id.clone(), principal("alpha"), fake_session());
        assert!(prior.is_none());
        assert!(registry.lookup(&id).is_some());

        let (second, prior) = registry.register(id.clone(), principal("alpha"), fake_session());
        assert!(Arc::ptr_eq(&prior.unwrap(), &first));
        assert!(Arc::ptr_eq(&registry.lookup(&id).unwrap(), &second));
        assert!(!Arc::ptr_eq(&second, &first));
    }

    #[tokio::test]
    async fn status_reports_offline_for_unknown_identity() {
        let registry = AgentRegistry::new(64);
        let id = AgentIdentity::parse("alpha-ws1").unwrap();
        let status = registry.status(&id);
        assert!(!status.online);
        assert_eq!(status.session_count, 0);
    }

    #[tokio::test]
    async fn drain_closes_all_sessions_and_clears_registry() {
        let registry = AgentRegistry::new(64);
        let a = AgentIdentity::parse("alpha-ws1").unwrap();
        let b = AgentIdentity::parse("alpha-ws2").unwrap();
        registry.register(a.clone(), principal("alpha"), fake_session());
        registry.register(b.clone(), principal("alpha"), fake_session());

        registry.drain().await;

        assert!(registry.lookup(&a).is_none());
        assert!(registry.lookup(&b).is_none());
        assert!(registry.list().is_empty());
    }

    #[tokio::test]
    async fn evict_removes_the_session() {
        let registry = AgentRegistry::new(64);
        let id = AgentIdentity::parse("alpha-ws1").unwrap();
        registry.register(id.clone(), principal("alpha"), fake_session());
        assert!(registry.evict(&id).is_some());
        assert!(registry.lookup(&id).is_none());
    }

    #[tokio::test]
    async fn stream_cap_rejects_after_limit_without_closing_existing() {
        let registry = AgentRegistry::new(2);
        let id = AgentIdentity::parse("alpha-ws1").unwrap();
        let (session, _) = registry.register(id.clone(), principal("alpha"), fake_session());

        // NullTransport's send_frame succeeds but recv_frame never resolves,
        // so session.open() would hang; instead check the permit gate only.
        let p1 = session.stream_permits.clone().try_acquire_owned();
        let p2 = session.stream_permits.clone().try_acquire_owned();
        let p3 = session.stream_permits.clone().try_acquire_owned();
        assert!(p1.is_ok());
        assert!(p2.is_ok());
        assert!(p3.is_err());
    }
}
