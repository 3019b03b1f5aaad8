use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::Mutex;

use pkg_types::deployment::{DeploymentSummary, selector_matches};
use pkg_types::service::ServiceAddresses;

use crate::Cluster;

#[derive(Default)]
struct State {
    service: ServiceAddresses,
    deployments: BTreeMap<(String, String), DeploymentSummary>,
    statuses: HashMap<String, String>,
    scale_calls: Vec<(String, String, i32)>,
    ready_on_scale: bool,
    fail_status: bool,
}

/// In-process cluster for local runs and tests.
///
/// Scaling a deployment up marks its replicas ready immediately unless
/// [`MemoryCluster::set_ready_on_scale`] turns that off.
pub struct MemoryCluster {
    state: Mutex<State>,
}

impl Default for MemoryCluster {
    fn default() -> Self {
        Self {
            state: Mutex::new(State {
                ready_on_scale: true,
                ..Default::default()
            }),
        }
    }
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_router_service(&self, service: ServiceAddresses) {
        self.state.lock().await.service = service;
    }

    pub async fn add_deployment(&self, deployment: DeploymentSummary) {
        let key = (deployment.namespace.clone(), deployment.name.clone());
        self.state.lock().await.deployments.insert(key, deployment);
    }

    pub async fn deployment(&self, namespace: &str, name: &str) -> Option<DeploymentSummary> {
        let state = self.state.lock().await;
        state
            .deployments
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub async fn set_ready(&self, namespace: &str, name: &str, ready: i32) {
        let mut state = self.state.lock().await;
        if let Some(d) = state
            .deployments
            .get_mut(&(namespace.to_string(), name.to_string()))
        {
            d.ready_replicas = ready;
        }
    }

    pub async fn set_ready_on_scale(&self, ready: bool) {
        self.state.lock().await.ready_on_scale = ready;
    }

    /// Make every ingress status update fail.
    pub async fn set_fail_status(&self, fail: bool) {
        self.state.lock().await.fail_status = fail;
    }

    /// Published status address for `namespace/name`.
    pub async fn ingress_status(&self, key: &str) -> Option<String> {
        self.state.lock().await.statuses.get(key).cloned()
    }

    /// Every `update_scale` call in order.
    pub async fn scale_calls(&self) -> Vec<(String, String, i32)> {
        self.state.lock().await.scale_calls.clone()
    }
}

#[async_trait]
impl Cluster for MemoryCluster {
    async fn router_service(&self) -> anyhow::Result<ServiceAddresses> {
        Ok(self.state.lock().await.service.clone())
    }

    async fn list_deployments(
        &self,
        namespace: &str,
        selector: &str,
    ) -> anyhow::Result<Vec<DeploymentSummary>> {
        let state = self.state.lock().await;
        Ok(state
            .deployments
            .values()
            .filter(|d| d.namespace == namespace && selector_matches(selector, &d.labels))
            .cloned()
            .collect())
    }

    async fn get_scale(&self, namespace: &str, name: &str) -> anyhow::Result<i32> {
        let state = self.state.lock().await;
        state
            .deployments
            .get(&(namespace.to_string(), name.to_string()))
            .map(|d| d.replicas)
            .ok_or_else(|| anyhow::anyhow!("deployment {}/{} not found", namespace, name))
    }

    async fn update_scale(&self, namespace: &str, name: &str, replicas: i32) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        state
            .scale_calls
            .push((namespace.to_string(), name.to_string(), replicas));
        let ready_on_scale = state.ready_on_scale;
        let d = state
            .deployments
            .get_mut(&(namespace.to_string(), name.to_string()))
            .ok_or_else(|| anyhow::anyhow!("deployment {}/{} not found", namespace, name))?;
        d.replicas = replicas;
        if ready_on_scale || replicas == 0 {
            d.ready_replicas = replicas;
        }
        Ok(())
    }

    async fn update_ingress_status(&self, namespace: &str, name: &str, ip: &str) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        if state.fail_status {
            anyhow::bail!("ingress status update rejected");
        }
        state
            .statuses
            .insert(format!("{}/{}", namespace, name), ip.to_string());
        Ok(())
    }
}
