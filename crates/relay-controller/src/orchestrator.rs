//! `WorkloadOrchestrator`: the seam between reconciliation policy and the
//! Kubernetes API, so [`crate::reconcile`] is testable against a mock
//! without a live cluster.

use std::future::Future;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::api::{Api, Patch, PatchParams};
use kube::Client;
use relay_protocol::WorkspaceAgent;

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),
}

/// The seam reconciliation calls through instead of `kube::Api` directly,
/// following [`relay_mux::MuxTransport`]'s return-position-`impl Future`
/// shape so a mock implementation can stand in during tests without `dyn`
/// boxing.
pub trait WorkloadOrchestrator: Send + Sync {
    fn apply_deployment(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> impl Future<Output = Result<(), OrchestratorError>> + Send;

    fn apply_pvc(
        &self,
        namespace: &str,
        pvc: &PersistentVolumeClaim,
    ) -> impl Future<Output = Result<(), OrchestratorError>> + Send;

    fn current_deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> impl Future<Output = Result<Option<Deployment>, OrchestratorError>> + Send;

    /// Merge-patches `status` on the `WorkspaceAgent` itself — kept on
    /// this trait (rather than reconciliation calling `kube::Api`
    /// directly) so `reconcile` and the wake endpoint are both testable
    /// against [`MockOrchestrator`] without a live apiserver.
    fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &serde_json::Value,
    ) -> impl Future<Output = Result<(), OrchestratorError>> + Send;
}

pub struct KubeOrchestrator {
    client: Client,
}

impl KubeOrchestrator {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

const FIELD_MANAGER: &str = "relay-controller";

impl WorkloadOrchestrator for KubeOrchestrator {
    async fn apply_deployment(&self, namespace: &str, deployment: &Deployment) -> Result<(), OrchestratorError> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let name = deployment.metadata.name.as_deref().unwrap_or_default();
        api.patch(name, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(deployment))
            .await?;
        Ok(())
    }

    async fn apply_pvc(&self, namespace: &str, pvc: &PersistentVolumeClaim) -> Result<(), OrchestratorError> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        let name = pvc.metadata.name.as_deref().unwrap_or_default();
        api.patch(name, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(pvc))
            .await?;
        Ok(())
    }

    async fn current_deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>, OrchestratorError> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        match api.get_opt(name).await {
            Ok(d) => Ok(d),
            Err(e) => Err(e.into()),
        }
    }

    async fn patch_status(&self, namespace: &str, name: &str, status: &serde_json::Value) -> Result<(), OrchestratorError> {
        let api: Api<WorkspaceAgent> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({ "status": status });
        api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch)).await?;
        Ok(())
    }
}

#[cfg(test)]
pub struct MockOrchestrator {
    pub deployments: dashmap::DashMap<String, Deployment>,
    pub pvcs: dashmap::DashMap<String, PersistentVolumeClaim>,
    pub statuses: dashmap::DashMap<String, serde_json::Value>,
}

#[cfg(test)]
impl MockOrchestrator {
    pub fn new() -> Self {
        Self {
            deployments: dashmap::DashMap::new(),
            pvcs: dashmap::DashMap::new(),
            statuses: dashmap::DashMap::new(),
        }
    }
}

#[cfg(test)]
impl WorkloadOrchestrator for MockOrchestrator {
    async fn apply_deployment(&self, _namespace: &str, deployment: &Deployment) -> Result<(), OrchestratorError> {
        let name = deployment.metadata.name.clone().unwrap_or_default();
        self.deployments.insert(name, deployment.clone());
        Ok(())
    }

    async fn apply_pvc(&self, _namespace: &str, pvc: &PersistentVolumeClaim) -> Result<(), OrchestratorError> {
        let name = pvc.metadata.name.clone().unwrap_or_default();
        self.pvcs.insert(name, pvc.clone());
        Ok(())
    }

    async fn current_deployment(&self, _namespace: &str, name: &str) -> Result<Option<Deployment>, OrchestratorError> {
        Ok(self.deployments.get(name).map(|d| d.clone()))
    }

    async fn patch_status(&self, _namespace: &str, name: &str, status: &serde_json::Value) -> Result<(), OrchestratorError> {
        self.statuses.insert(name.to_string(), status.clone());
        Ok(())
    }
}
