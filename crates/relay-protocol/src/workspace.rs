//! The declarative `WorkspaceAgent` record (§3) and its reconciliation
//! status block, shared between the management HTTP interface and the
//! Kubernetes CRD wrapper in `relay-controller`.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize, schemars::JsonSchema)]
pub struct ResourceRequirements {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_request: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_limit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_request: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_limit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_limit: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, schemars::JsonSchema)]
pub struct StorageSpec {
    /// e.g. "20Gi".
    pub size: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,
    pub mount_path: String,
}

/// `Ttl::Disabled` is distinct from a zero-duration TTL: a zero TTL would
/// scale down immediately, `disabled` means the idle-TTL state machine
/// never transitions `Running` to `ScaledDown` for this record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Ttl {
    Disabled,
    Seconds(u64),
}

impl Default for Ttl {
    fn default() -> Self {
        Ttl::Seconds(3600)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, schemars::JsonSchema, kube::CustomResource)]
#[kube(
    group = "relaytun.io",
    version = "v1",
    kind = "WorkspaceAgent",
    namespaced,
    status = "WorkspaceAgentStatus",
    shortname = "wsa"
)]
pub struct WorkspaceAgentSpec {
    pub name: String,
    pub owner: String,
    pub image: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<EnvVar>,
    #[serde(default)]
    pub ssh_public_keys: Vec<String>,
    /// `host:port` the agent dials within the workload pod's network namespace.
    pub local_target: String,
    #[serde(default)]
    pub resources: ResourceRequirements,
    pub storage: StorageSpec,
    #[serde(default)]
    pub ttl: Ttl,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "PascalCase")]
pub enum WorkspaceAgentPhase {
    Pending,
    Running,
    ScaledDown,
    Failed,
}

impl Default for WorkspaceAgentPhase {
    fn default() -> Self {
        WorkspaceAgentPhase::Pending
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, schemars::JsonSchema)]
pub struct WorkspaceAgentCondition {
    pub kind: String,
    pub message: String,
    /// Unix seconds; stamped by the caller since controller scripts cannot
    /// call `Instant`/`SystemTime::now()` from within a reconciliation test
    /// fixture and must stay deterministic there.
    pub observed_at: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, schemars::JsonSchema)]
pub struct WorkspaceAgentStatus {
    #[serde(default)]
    pub phase: WorkspaceAgentPhase,
    #[serde(default)]
    pub replicas: u32,
    #[serde(default)]
    pub last_activity: u64,
    #[serde(default)]
    pub conditions: Vec<WorkspaceAgentCondition>,
    /// Unix seconds a wake request was last issued for this workspace, or
    /// `None` outside of one. While set and within the controller's wake
    /// grace window, the idle-TTL policy is suspended so a just-woken,
    /// not-yet-registered agent isn't immediately scaled back down.
    #[serde(default)]
    pub pending_wake_at: Option<u64>,
}

impl WorkspaceAgentSpec {
    /// `USER_PASSWORD` when the spec doesn't set one: a fixed, documented
    /// (not secret) function of `owner`, per §4.E. Not intended to resist
    /// a determined attacker — it exists so the workload container always
    /// boots with *some* password rather than none.
    pub fn derived_password(&self) -> String {
        use std::fmt::Write;
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        std::hash::Hash::hash(&self.owner, &mut hasher);
        let mut out = String::new();
        let _ = write!(out, "ws-{:016x}", std::hash::Hasher::finish(&hasher));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_password_is_deterministic_in_owner() {
        let mut spec = WorkspaceAgentSpec::default();
        spec.owner = "alpha".into();
        let a = spec.derived_password();
        let b = spec.derived_password();
        assert_eq!(a, b);
        spec.owner = "bravo".into();
        assert_ne!(a, spec.derived_password());
    }

    #[test]
    fn ttl_default_is_not_disabled() {
        assert_eq!(Ttl::default(), Ttl::Seconds(3600));
    }

    #[test]
    fn phase_default_is_pending() {
        assert_eq!(WorkspaceAgentPhase::default(), WorkspaceAgentPhase::Pending);
    }
}
