use serde::{Deserialize, Serialize};

/// Addresses published on the router's own service object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceAddresses {
    /// spec.clusterIP
    #[serde(default)]
    pub cluster_ip: Option<String>,
    /// status.loadBalancer.ingress[].ip
    #[serde(default)]
    pub external_ips: Vec<String>,
    /// status.loadBalancer.ingress[].hostname
    #[serde(default)]
    pub external_hostnames: Vec<String>,
}
