//! Process configuration, shared shape for `relay-server` and
//! `relay-controller`. Follows the enumerated configuration surface of the
//! external interfaces: every field has a serde default and the struct
//! validates itself into a list of actionable issue strings rather than
//! failing fast, so `main` can decide what's fatal.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub server: ServerConfig,
    pub oidc: OidcConfig,
    pub registry: RegistryConfig,
    pub controller: ControllerConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            oidc: OidcConfig::default(),
            registry: RegistryConfig::default(),
            controller: ControllerConfig::default(),
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0".into()
}
fn default_port() -> u16 {
    8443
}
fn default_agent_domain() -> String {
    "agents.example.com".into()
}
fn default_public_url() -> String {
    "https://relay.example.com".into()
}
fn default_stream_open_timeout_secs() -> u64 {
    30
}
fn default_handshake_timeout_secs() -> u64 {
    10
}
fn default_max_streams_per_agent() -> u32 {
    64
}
fn default_oidc_timeout_secs() -> u64 {
    10
}
fn default_jwks_refresh_secs() -> u64 {
    600
}
fn default_cookie_capacity() -> usize {
    10_000
}
fn default_reconcile_tick_secs() -> u64 {
    30
}
fn default_ttl_default_secs() -> u64 {
    3600
}
fn default_reconcile_budget_secs() -> u64 {
    60
}
fn default_wake_grace_secs() -> u64 {
    120
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    #[serde(default = "default_public_url")]
    pub public_url: String,
    #[serde(default = "default_agent_domain")]
    pub agent_domain: String,
    #[serde(default = "default_stream_open_timeout_secs")]
    pub stream_open_timeout_secs: u64,
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
    #[serde(default)]
    pub metrics_require_auth: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            tls_cert: None,
            tls_key: None,
            public_url: default_public_url(),
            agent_domain: default_agent_domain(),
            stream_open_timeout_secs: default_stream_open_timeout_secs(),
            handshake_timeout_secs: default_handshake_timeout_secs(),
            metrics_require_auth: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OidcConfig {
    pub issuer_url: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub owner_claim: String,
    #[serde(default = "default_oidc_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_jwks_refresh_secs")]
    pub jwks_refresh_secs: u64,
}

impl Default for OidcConfig {
    fn default() -> Self {
        Self {
            issuer_url: None,
            client_id: None,
            client_secret: None,
            owner_claim: "owner".into(),
            timeout_secs: default_oidc_timeout_secs(),
            jwks_refresh_secs: default_jwks_refresh_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    #[serde(default = "default_max_streams_per_agent")]
    pub max_streams_per_agent: u32,
    #[serde(default = "default_cookie_capacity")]
    pub cookie_store_capacity: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_streams_per_agent: default_max_streams_per_agent(),
            cookie_store_capacity: default_cookie_capacity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    #[serde(default = "default_reconcile_tick_secs")]
    pub reconcile_tick_secs: u64,
    #[serde(default = "default_ttl_default_secs")]
    pub ttl_default_secs: u64,
    #[serde(default = "default_reconcile_budget_secs")]
    pub reconcile_budget_secs: u64,
    /// How long after a wake request the idle-TTL policy stays suspended
    /// for that workspace, giving the pod time to start and its agent
    /// time to register before reconcile would otherwise see a
    /// not-yet-registered snapshot and scale it straight back down.
    #[serde(default = "default_wake_grace_secs")]
    pub wake_grace_secs: u64,
    pub agent_server_url: Option<String>,
    /// Base URL of the controller's management API, used by the gateway to
    /// issue wake requests (§4.E Wake-up coupling).
    pub wake_url: Option<String>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            reconcile_tick_secs: default_reconcile_tick_secs(),
            ttl_default_secs: default_ttl_default_secs(),
            reconcile_budget_secs: default_reconcile_budget_secs(),
            wake_grace_secs: default_wake_grace_secs(),
            agent_server_url: None,
            wake_url: None,
        }
    }
}

impl RelayConfig {
    /// Collects actionable issue strings, prefixed `ERROR:` (fatal, the
    /// caller should refuse to start) or `WARNING:` (degraded but usable).
    pub fn validate(&self) -> Vec<String> {
        let mut issues = Vec::new();

        match (&self.server.tls_cert, &self.server.tls_key) {
            (Some(_), None) | (None, Some(_)) => {
                issues.push("ERROR: tls_cert and tls_key must both be set or both omitted".into());
            }
            (Some(cert), Some(key)) => {
                if !std::path::Path::new(cert).exists() {
                    issues.push(format!("ERROR: tls_cert not found: {cert}"));
                }
                if !std::path::Path::new(key).exists() {
                    issues.push(format!("ERROR: tls_key not found: {key}"));
                }
            }
            (None, None) => {
                issues.push(
                    "WARNING: no TLS cert/key configured; a self-signed certificate will be generated"
                        .into(),
                );
            }
        }

        if self.oidc.issuer_url.is_none() {
            issues.push("ERROR: oidc.issuer_url is required".into());
        }
        if self.oidc.client_id.is_none() || self.oidc.client_secret.is_none() {
            issues.push("ERROR: oidc.client_id and oidc.client_secret are required for the HTTP surface".into());
        }

        if self.registry.max_streams_per_agent == 0 {
            issues.push("ERROR: registry.max_streams_per_agent must be > 0".into());
        }

        issues
    }

    pub fn has_fatal_issues(issues: &[String]) -> bool {
        issues.iter().any(|i| i.starts_with("ERROR:"))
    }
}

pub fn load_config(path: &str) -> anyhow::Result<RelayConfig> {
    use anyhow::Context;
    if !std::path::Path::new(path).exists() {
        tracing::warn!(path, "config file not found, using defaults");
        return Ok(RelayConfig::default());
    }
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading config file {path}"))?;
    toml::from_str(&raw).with_context(|| format!("parsing config file {path}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse_from_empty_toml() {
        let cfg: RelayConfig = toml::from_str("").unwrap();
        assert_eq!(cfg.server.port, 8443);
        assert_eq!(cfg.registry.max_streams_per_agent, 64);
        assert_eq!(cfg.controller.reconcile_tick_secs, 30);
        assert_eq!(cfg.controller.wake_grace_secs, 120);
    }

    #[test]
    fn validate_flags_missing_oidc() {
        let cfg = RelayConfig::default();
        let issues = cfg.validate();
        assert!(issues.iter().any(|i| i.contains("oidc.issuer_url")));
        assert!(RelayConfig::has_fatal_issues(&issues));
    }

    #[test]
    fn validate_warns_on_missing_tls() {
        let mut cfg = RelayConfig::default();
        cfg.oidc.issuer_url = Some("https://issuer.example.com".into());
        cfg.oidc.client_id = Some("id".into());
        cfg.oidc.client_secret = Some("secret".into());
        let issues = cfg.validate();
        assert!(!RelayConfig::has_fatal_issues(&issues));
        assert!(issues.iter().any(|i| i.starts_with("WARNING:")));
    }

    #[test]
    fn validate_rejects_zero_stream_cap() {
        let mut cfg = RelayConfig::default();
        cfg.registry.max_streams_per_agent = 0;
        assert!(RelayConfig::has_fatal_issues(&cfg.validate()));
    }
}
