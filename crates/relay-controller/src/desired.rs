//! Desired-state translation: `WorkspaceAgentSpec` to a `Deployment` + a
//! `PersistentVolumeClaim`, plus the `normalize()` step that change
//! detection in [`crate::reconcile`] diffs against instead of the raw
//! server objects (§4.E's "no spurious update" invariant).

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, EnvVar as K8sEnvVar, PersistentVolumeClaim,
    PersistentVolumeClaimSpec, PodSpec, PodTemplateSpec, ResourceRequirements as K8sResources,
    Volume, VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use relay_protocol::WorkspaceAgentSpec;

/// The name shared by the `Deployment`, its `PersistentVolumeClaim`, and
/// the label selector tying them together. Deterministic in `(owner,
/// name)` so re-reconciling the same `WorkspaceAgent` always resolves the
/// same objects rather than leaking orphans on a name collision.
pub fn resource_name(owner: &str, name: &str) -> String {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    std::hash::Hash::hash(&(owner, name), &mut hasher);
    format!("wsa-{owner}-{name}-{:08x}", std::hash::Hasher::finish(&hasher) as u32)
}

fn labels(owner: &str, name: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert("relaytun.io/owner".to_string(), owner.to_string());
    labels.insert("relaytun.io/workspace".to_string(), name.to_string());
    labels
}

/// Names `workload_env` always sets itself; a `spec.env` entry with one of
/// these names is dropped rather than appended, since Kubernetes resolves
/// duplicate container env names to the last-listed value and would let a
/// user-supplied entry silently override the mandated credential.
const MANDATED_ENV_NAMES: [&str; 3] = ["USER_NAME", "USER_PASSWORD", "PUBLIC_KEY"];

/// The environment every workload container boots with, per §4.E:
/// `USER_NAME`, `PUBLIC_KEY` (first configured key, if any) and a
/// `USER_PASSWORD` fallback derived from the owner when the spec sets
/// none.
fn workload_env(spec: &WorkspaceAgentSpec) -> Vec<K8sEnvVar> {
    let mut env = vec![
        K8sEnvVar { name: "USER_NAME".into(), value: Some(spec.owner.clone()), value_from: None },
        K8sEnvVar {
            name: "USER_PASSWORD".into(),
            value: Some(spec.derived_password()),
            value_from: None,
        },
    ];
    if let Some(key) = spec.ssh_public_keys.first() {
        env.push(K8sEnvVar { name: "PUBLIC_KEY".into(), value: Some(key.clone()), value_from: None });
    }
    for e in spec.env.iter().filter(|e| !MANDATED_ENV_NAMES.contains(&e.name.as_str())) {
        env.push(K8sEnvVar { name: e.name.clone(), value: Some(e.value.clone()), value_from: None });
    }
    env
}

fn resource_requirements(spec: &relay_protocol::ResourceRequirements) -> K8sResources {
    let mut requests = BTreeMap::new();
    let mut limits = BTreeMap::new();
    if let Some(v) = &spec.cpu_request {
        requests.insert("cpu".to_string(), Quantity(v.clone()));
    }
    if let Some(v) = &spec.memory_request {
        requests.insert("memory".to_string(), Quantity(v.clone()));
    }
    if let Some(v) = &spec.cpu_limit {
        limits.insert("cpu".to_string(), Quantity(v.clone()));
    }
    if let Some(v) = &spec.memory_limit {
        limits.insert("memory".to_string(), Quantity(v.clone()));
    }
    if let Some(v) = &spec.gpu_limit {
        limits.insert("nvidia.com/gpu".to_string(), Quantity(v.clone()));
    }
    K8sResources {
        requests: (!requests.is_empty()).then_some(requests),
        limits: (!limits.is_empty()).then_some(limits),
        ..Default::default()
    }
}

pub fn desired_pvc(owner: &str, name: &str, spec: &WorkspaceAgentSpec) -> PersistentVolumeClaim {
    let rn = resource_name(owner, name);
    let mut requests = BTreeMap::new();
    requests.insert("storage".to_string(), Quantity(spec.storage.size.clone()));
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(rn.clone()),
            labels: Some(labels(owner, name)),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            storage_class_name: spec.storage.storage_class.clone(),
            resources: Some(VolumeResourceRequirements {
                requests: Some(requests),
                limits: None,
            }),
            ..Default::default()
        }),
        status: None,
    }
}

/// Two containers per §3.E: `agent` runs the relay agent binary,
/// `workload` is the user's image. They share the PVC at
/// `spec.storage.mount_path` and the loopback network namespace, so the
/// agent's `local_target` (e.g. `127.0.0.1:22`) reaches the workload
/// container directly.
pub fn desired_deployment(owner: &str, name: &str, spec: &WorkspaceAgentSpec, replicas: u32, agent_image: &str) -> Deployment {
    let rn = resource_name(owner, name);
    let sel = labels(owner, name);
    let volume_name = "workspace-data".to_string();

    let workload = Container {
        name: "workload".into(),
        image: Some(spec.image.clone()),
        command: (!spec.command.is_empty()).then(|| spec.command.clone()),
        args: (!spec.args.is_empty()).then(|| spec.args.clone()),
        env: Some(workload_env(spec)),
        resources: Some(resource_requirements(&spec.resources)),
        volume_mounts: Some(vec![VolumeMount {
            name: volume_name.clone(),
            mount_path: spec.storage.mount_path.clone(),
            ..Default::default()
        }]),
        ..Default::default()
    };

    // credentials secret reference (§3.E): a Secret named after this
    // workspace, provisioned out of band, holding the agent's bearer
    // token under the `token` key.
    let agent_token_env = K8sEnvVar {
        name: "RELAY_AGENT_TOKEN".into(),
        value: None,
        value_from: Some(k8s_openapi::api::core::v1::EnvVarSource {
            secret_key_ref: Some(k8s_openapi::api::core::v1::SecretKeySelector {
                name: format!("{rn}-token"),
                key: "token".into(),
                optional: None,
            }),
            ..Default::default()
        }),
    };

    let agent = Container {
        name: "agent".into(),
        image: Some(agent_image.to_string()),
        args: Some(vec![
            "--identity".into(),
            format!("{owner}-{name}"),
            "--local-target".into(),
            spec.local_target.clone(),
        ]),
        env: Some(vec![agent_token_env]),
        ..Default::default()
    };

    Deployment {
        metadata: ObjectMeta {
            name: Some(rn.clone()),
            labels: Some(sel.clone()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(replicas as i32),
            selector: LabelSelector { match_labels: Some(sel.clone()), ..Default::default() },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta { labels: Some(sel), ..Default::default() }),
                spec: Some(PodSpec {
                    containers: vec![workload, agent],
                    volumes: Some(vec![Volume {
                        name: volume_name,
                        persistent_volume_claim: Some(
                            k8s_openapi::api::core::v1::PersistentVolumeClaimVolumeSource {
                                claim_name: rn,
                                read_only: None,
                            },
                        ),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    }
}

/// Reduces a `Deployment` to the fields reconciliation cares about,
/// dropping everything the apiserver fills in on its own (`resourceVersion`,
/// `status`, defaulted fields we didn't set). Two deployments that
/// `normalize()` to the same value are considered equivalent — no patch
/// is issued.
pub fn normalize(d: &Deployment) -> serde_json::Value {
    let spec = d.spec.as_ref();
    serde_json::json!({
        "name": d.metadata.name,
        "replicas": spec.and_then(|s| s.replicas),
        "containers": spec.map(|s| s.template.spec.as_ref().map(|p| {
            p.containers.iter().map(|c| serde_json::json!({
                "name": c.name,
                "image": c.image,
                "command": c.command,
                "args": c.args,
                "env": c.env.as_ref().map(|envs| {
                    // Keyed by name rather than left in apiserver order, so
                    // a round-trip reordering isn't mistaken for a diff.
                    envs.iter().map(|e| (e.name.clone(), e.value.clone())).collect::<BTreeMap<_, _>>()
                }),
                "resources": c.resources.as_ref().map(|r| serde_json::json!({
                    "requests": r.requests.as_ref().map(|m| m.iter().map(|(k, v)| (k.clone(), v.0.clone())).collect::<BTreeMap<_, _>>()),
                    "limits": r.limits.as_ref().map(|m| m.iter().map(|(k, v)| (k.clone(), v.0.clone())).collect::<BTreeMap<_, _>>()),
                })),
            })).collect::<Vec<_>>()
        })),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_protocol::{ResourceRequirements, StorageSpec};

    fn spec() -> WorkspaceAgentSpec {
        WorkspaceAgentSpec {
            name: "ws1".into(),
            owner: "alpha".into(),
            image: "ghcr.io/example/dev:latest".into(),
            local_target: "127.0.0.1:22".into(),
            storage: StorageSpec { size: "10Gi".into(), storage_class: None, mount_path: "/home/user".into() },
            resources: ResourceRequirements::default(),
            ..Default::default()
        }
    }

    #[test]
    fn resource_name_is_stable() {
        assert_eq!(resource_name("alpha", "ws1"), resource_name("alpha", "ws1"));
        assert_ne!(resource_name("alpha", "ws1"), resource_name("alpha", "ws2"));
    }

    #[test]
    fn normalize_is_stable_under_unset_optional_fields() {
        let a = desired_deployment("alpha", "ws1", &spec(), 1, "relay/agent:latest");
        let mut b = a.clone();
        b.metadata.resource_version = Some("123".into());
        b.status = Some(Default::default());
        assert_eq!(normalize(&a), normalize(&b));
    }

    #[test]
    fn normalize_detects_replica_change() {
        let a = desired_deployment("alpha", "ws1", &spec(), 1, "relay/agent:latest");
        let b = desired_deployment("alpha", "ws1", &spec(), 0, "relay/agent:latest");
        assert_ne!(normalize(&a), normalize(&b));
    }

    #[test]
    fn normalize_detects_resource_change() {
        let a = desired_deployment("alpha", "ws1", &spec(), 1, "relay/agent:latest");
        let mut changed = spec();
        changed.resources.cpu_limit = Some("2".into());
        let b = desired_deployment("alpha", "ws1", &changed, 1, "relay/agent:latest");
        assert_ne!(normalize(&a), normalize(&b));
    }

    #[test]
    fn normalize_is_stable_under_env_reordering() {
        let mut s = spec();
        s.env = vec![
            relay_protocol::EnvVar { name: "B".into(), value: "2".into() },
            relay_protocol::EnvVar { name: "A".into(), value: "1".into() },
        ];
        let a = desired_deployment("alpha", "ws1", &s, 1, "relay/agent:latest");

        s.env.reverse();
        let b = desired_deployment("alpha", "ws1", &s, 1, "relay/agent:latest");

        assert_eq!(normalize(&a), normalize(&b));
    }

    #[test]
    fn workload_env_rejects_mandated_name_override() {
        let mut s = spec();
        s.env = vec![relay_protocol::EnvVar { name: "USER_PASSWORD".into(), value: "hacked".into() }];
        let env = workload_env(&s);
        let password = env.iter().find(|e| e.name == "USER_PASSWORD").unwrap();
        assert_eq!(password.value.as_deref(), Some(s.derived_password().as_str()));
        assert_eq!(env.iter().filter(|e| e.name == "USER_PASSWORD").count(), 1);
    }
}
