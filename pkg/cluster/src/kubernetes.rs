use async_trait::async_trait;
use futures_util::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Secret, Service};
use k8s_openapi::api::networking::v1 as networking;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::runtime::{WatchStreamExt, watcher};
use serde_json::json;
use std::collections::BTreeMap;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use pkg_constants::cluster::INGRESS_LABEL_SELECTOR;
use pkg_types::deployment::DeploymentSummary;
use pkg_types::ingress::{
    Ingress, IngressBackend, IngressHTTP, IngressPath, IngressRule, IngressSpec,
};
use pkg_types::service::ServiceAddresses;

use crate::{Cluster, IngressEvent};

/// Cluster access through the Kubernetes API.
#[derive(Clone)]
pub struct KubeCluster {
    client: kube::Client,
    namespace: String,
    service_name: String,
}

impl KubeCluster {
    pub fn new(client: kube::Client, namespace: &str, service_name: &str) -> Self {
        Self {
            client,
            namespace: namespace.to_string(),
            service_name: service_name.to_string(),
        }
    }

    /// Connect using in-cluster config or the local kubeconfig.
    pub async fn try_default(namespace: &str, service_name: &str) -> anyhow::Result<Self> {
        let client = kube::Client::try_default().await?;
        Ok(Self::new(client, namespace, service_name))
    }

    pub fn client(&self) -> kube::Client {
        self.client.clone()
    }

    /// Read `tls.crt` / `tls.key` from a secret in the router's namespace.
    pub async fn load_ca_secret(&self, name: &str) -> anyhow::Result<(String, String)> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), &self.namespace);
        let secret = api.get(name).await?;
        let data = secret.data.unwrap_or_default();

        let field = |key: &str| -> anyhow::Result<String> {
            let bytes = data
                .get(key)
                .ok_or_else(|| anyhow::anyhow!("secret {}/{} has no {}", self.namespace, name, key))?;
            Ok(String::from_utf8(bytes.0.clone())?)
        };

        info!(secret = %name, namespace = %self.namespace, "Loaded CA secret");
        Ok((field("tls.crt")?, field("tls.key")?))
    }

    /// Watch `system=convox` ingresses in every namespace and forward changes.
    ///
    /// Returns when the receiver is dropped.
    pub async fn watch_ingresses(&self, tx: mpsc::Sender<IngressEvent>) -> anyhow::Result<()> {
        let api: Api<networking::Ingress> = Api::all(self.client.clone());
        let config = watcher::Config::default().labels(INGRESS_LABEL_SELECTOR);
        let mut stream = watcher(api, config).default_backoff().boxed();

        let mut listing: Vec<Ingress> = Vec::new();
        info!(selector = INGRESS_LABEL_SELECTOR, "Ingress watch started");

        while let Some(event) = stream.next().await {
            let event = match event {
                Ok(watcher::Event::Apply(obj)) => from_kube_ingress(&obj).map(IngressEvent::Applied),
                Ok(watcher::Event::Delete(obj)) => from_kube_ingress(&obj).map(IngressEvent::Deleted),
                Ok(watcher::Event::Init) => {
                    listing.clear();
                    None
                }
                Ok(watcher::Event::InitApply(obj)) => {
                    listing.extend(from_kube_ingress(&obj));
                    None
                }
                Ok(watcher::Event::InitDone) => {
                    debug!(count = listing.len(), "Ingress relist complete");
                    Some(IngressEvent::Restarted(std::mem::take(&mut listing)))
                }
                Err(e) => {
                    warn!(error = %e, "Ingress watch error");
                    None
                }
            };

            if let Some(event) = event {
                if tx.send(event).await.is_err() {
                    break;
                }
            }
        }
        Ok(())
    }
}

/// Convert an API ingress into the router's model. Backends that name a port
/// instead of numbering it, or reference a resource, are skipped.
pub fn from_kube_ingress(obj: &networking::Ingress) -> Option<Ingress> {
    let name = obj.metadata.name.clone()?;
    let namespace = obj.metadata.namespace.clone().unwrap_or_default();

    let rules = obj
        .spec
        .as_ref()
        .and_then(|s| s.rules.as_ref())
        .map(|rules| {
            rules
                .iter()
                .map(|rule| IngressRule {
                    host: rule.host.clone().unwrap_or_default(),
                    http: IngressHTTP {
                        paths: rule
                            .http
                            .as_ref()
                            .map(|http| http.paths.iter().filter_map(convert_path).collect())
                            .unwrap_or_default(),
                    },
                })
                .collect()
        })
        .unwrap_or_default();

    Some(Ingress {
        name,
        namespace,
        labels: obj.metadata.labels.clone().unwrap_or_default(),
        annotations: obj.metadata.annotations.clone().unwrap_or_default(),
        spec: IngressSpec { rules },
    })
}

fn convert_path(path: &networking::HTTPIngressPath) -> Option<IngressPath> {
    let service = path.backend.service.as_ref()?;
    let number = service.port.as_ref()?.number?;
    Some(IngressPath {
        path: path.path.clone().unwrap_or_default(),
        backend: IngressBackend {
            service_name: service.name.clone(),
            service_port: u16::try_from(number).ok()?,
        },
    })
}

#[async_trait]
impl Cluster for KubeCluster {
    async fn router_service(&self) -> anyhow::Result<ServiceAddresses> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), &self.namespace);
        let svc = api.get(&self.service_name).await?;

        let mut addresses = ServiceAddresses {
            cluster_ip: svc
                .spec
                .and_then(|s| s.cluster_ip)
                .filter(|ip| !ip.is_empty() && ip != "None"),
            ..Default::default()
        };
        let lb = svc
            .status
            .and_then(|s| s.load_balancer)
            .and_then(|lb| lb.ingress)
            .unwrap_or_default();
        for entry in lb {
            addresses.external_ips.extend(entry.ip);
            addresses.external_hostnames.extend(entry.hostname);
        }
        Ok(addresses)
    }

    async fn list_deployments(
        &self,
        namespace: &str,
        selector: &str,
    ) -> anyhow::Result<Vec<DeploymentSummary>> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let list = api.list(&ListParams::default().labels(selector)).await?;

        Ok(list
            .items
            .into_iter()
            .map(|d| DeploymentSummary {
                namespace: d.metadata.namespace.unwrap_or_else(|| namespace.to_string()),
                name: d.metadata.name.unwrap_or_default(),
                labels: d.metadata.labels.unwrap_or_else(BTreeMap::new),
                replicas: d.spec.and_then(|s| s.replicas).unwrap_or(1),
                ready_replicas: d.status.and_then(|s| s.ready_replicas).unwrap_or(0),
            })
            .collect())
    }

    async fn get_scale(&self, namespace: &str, name: &str) -> anyhow::Result<i32> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let scale = api.get_scale(name).await?;
        Ok(scale.spec.and_then(|s| s.replicas).unwrap_or(0))
    }

    async fn update_scale(&self, namespace: &str, name: &str, replicas: i32) -> anyhow::Result<()> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let patch = json!({ "spec": { "replicas": replicas } });
        api.patch_scale(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        debug!(namespace = %namespace, deployment = %name, replicas, "Scaled deployment");
        Ok(())
    }

    async fn update_ingress_status(&self, namespace: &str, name: &str, ip: &str) -> anyhow::Result<()> {
        let api: Api<networking::Ingress> = Api::namespaced(self.client.clone(), namespace);
        let patch = json!({
            "status": { "loadBalancer": { "ingress": [ { "ip": ip } ] } }
        });
        api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}
