//! The router's view of the orchestrator.
//!
//! [`Cluster`] covers the calls the controllers make: reading the router's
//! own service, listing and scaling deployments, and publishing ingress
//! status. [`kubernetes::KubeCluster`] talks to a live API server;
//! [`memory::MemoryCluster`] is an in-process stand-in.

pub mod kubernetes;
pub mod leader;
pub mod memory;

use async_trait::async_trait;

use pkg_types::deployment::DeploymentSummary;
use pkg_types::ingress::Ingress;
use pkg_types::service::ServiceAddresses;

/// A change observed on the label-filtered ingress set.
#[derive(Debug, Clone, PartialEq)]
pub enum IngressEvent {
    Applied(Ingress),
    Deleted(Ingress),
    /// The watch (re)listed; this is the complete current set.
    Restarted(Vec<Ingress>),
}

#[async_trait]
pub trait Cluster: Send + Sync {
    /// Addresses of the router's own service.
    async fn router_service(&self) -> anyhow::Result<ServiceAddresses>;

    /// Deployments in `namespace` matching an equality label selector.
    async fn list_deployments(
        &self,
        namespace: &str,
        selector: &str,
    ) -> anyhow::Result<Vec<DeploymentSummary>>;

    /// Desired replicas from the deployment's scale subresource.
    async fn get_scale(&self, namespace: &str, name: &str) -> anyhow::Result<i32>;

    async fn update_scale(&self, namespace: &str, name: &str, replicas: i32)
        -> anyhow::Result<()>;

    /// Publish `ip` as the ingress object's load-balancer address.
    async fn update_ingress_status(&self, namespace: &str, name: &str, ip: &str)
        -> anyhow::Result<()>;
}
