//! Wake-up coupling (§4.E): when the gateway sees `NotFound` for an
//! identity that a `WorkspaceAgent` says is `ScaledDown`, it calls the
//! controller's wake endpoint. Concurrent requests for the same identity
//! are coalesced (the Open Question on idempotence is resolved in favor
//! of coalescing; see DESIGN.md) rather than firing one wake per request.

use std::sync::Arc;

use dashmap::DashMap;
use relay_protocol::AgentIdentity;
use tokio::sync::Notify;

pub struct WakeClient {
    http: reqwest::Client,
    base_url: Option<String>,
    in_flight: DashMap<AgentIdentity, Arc<Notify>>,
}

impl WakeClient {
    pub fn new(base_url: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url,
            in_flight: DashMap::new(),
        }
    }

    /// Issues a wake request for `identity`, or waits on an already
    /// in-flight one for the same identity. Returns `false` if no
    /// controller URL is configured or the request failed.
    pub async fn wake(&self, identity: &AgentIdentity) -> bool {
        let Some(base) = &self.base_url else {
            return false;
        };

        if let Some(notify) = self.in_flight.get(identity) {
            let notify = notify.clone();
            drop(self.in_flight.get(identity));
            notify.notified().await;
            return true;
        }

        let notify = Arc::new(Notify::new());
        self.in_flight.insert(identity.clone(), notify.clone());

        let url = format!("{}/v1/agents/{}:wake", base.trim_end_matches('/'), identity);
        let ok = matches!(self.http.post(url).send().await, Ok(resp) if resp.status().is_success());

        self.in_flight.remove(identity);
        notify.notify_waiters();
        ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn no_controller_url_configured_returns_false() {
        let client = WakeClient::new(None);
        let id = AgentIdentity::parse("alpha-ws1").unwrap();
        assert!(!client.wake(&id).await);
    }
}
