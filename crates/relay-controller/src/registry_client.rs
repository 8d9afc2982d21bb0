//! Thin client for `relay-server`'s management interface (§6), polled by
//! the idle-TTL state machine. Mirrors `relay-server::wake::WakeClient`'s
//! shape on the opposite side of the same relationship.

use relay_protocol::AgentIdentity;
use serde::Deserialize;

use crate::ttl::AgentStatusSnapshot;

#[derive(Debug, Deserialize)]
struct AgentStatusWire {
    online: bool,
    last_activity: u64,
    session_count: u32,
}

pub struct AgentRegistryClient {
    http: reqwest::Client,
    base_url: String,
}

impl AgentRegistryClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self { http: reqwest::Client::new(), base_url: base_url.into() }
    }

    /// `relay-server`'s `/v1/agents/{identity}` answers `404` for an
    /// identity it has never seen — that is a confirmed, not-yet-registered
    /// snapshot (`Some` with all-zero fields), distinct from `None`, which
    /// means only "couldn't reach or parse the response".
    pub async fn snapshot(&self, identity: &AgentIdentity) -> Option<AgentStatusSnapshot> {
        let url = format!("{}/v1/agents/{}", self.base_url.trim_end_matches('/'), identity.as_str());
        let resp = match self.http.get(&url).send().await {
            Ok(r) => r,
            Err(err) => {
                tracing::warn!(%identity, %err, "failed to reach relay-server management interface");
                return None;
            }
        };
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Some(AgentStatusSnapshot { online: false, last_activity: 0, session_count: 0 });
        }
        match resp.json::<AgentStatusWire>().await {
            Ok(wire) => Some(AgentStatusSnapshot {
                online: wire.online,
                last_activity: wire.last_activity,
                session_count: wire.session_count,
            }),
            Err(err) => {
                tracing::warn!(%identity, %err, "malformed response from relay-server management interface");
                None
            }
        }
    }
}
