use std::sync::Arc;

use relay_protocol::RelayConfig;

use crate::cookies::CookieStore;
use crate::identity::IdentityVerifier;
use crate::oidc::OidcClient;
use crate::registry::AgentRegistry;
use crate::wake::WakeClient;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<RelayConfig>,
    pub registry: Arc<AgentRegistry>,
    pub verifier: Arc<IdentityVerifier>,
    pub cookies: Arc<CookieStore>,
    pub oidc: Arc<OidcClient>,
    pub wake: Arc<WakeClient>,
    pub started_at: std::time::Instant,
    pub metrics: Arc<Metrics>,
}

#[derive(Default)]
pub struct Metrics {
    pub logins_attempted: std::sync::atomic::AtomicU64,
    pub logins_failed: std::sync::atomic::AtomicU64,
    pub streams_opened: std::sync::atomic::AtomicU64,
    pub wakes_requested: std::sync::atomic::AtomicU64,
}
