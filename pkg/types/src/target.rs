use serde::{Deserialize, Serialize};
use url::Url;

use pkg_constants::cluster::CLUSTER_DOMAIN_SUFFIX;

/// An upstream URL a host routes to, e.g. `http://web.myapp.svc.cluster.local:3000`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub scheme: String,
    pub host: String,
    pub port: u16,
}

/// The deployment a target's service name resolves to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceRef {
    pub namespace: String,
    pub name: String,
}

impl Target {
    /// Parse a target URL. Only `http` and `https` are accepted.
    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        let url = Url::parse(raw).map_err(|e| anyhow::anyhow!("invalid target {}: {}", raw, e))?;

        let scheme = url.scheme().to_string();
        if scheme != "http" && scheme != "https" {
            anyhow::bail!("unsupported target scheme {} in {}", scheme, raw);
        }

        let host = url
            .host_str()
            .ok_or_else(|| anyhow::anyhow!("target {} has no host", raw))?
            .to_string();
        let port = url
            .port_or_known_default()
            .ok_or_else(|| anyhow::anyhow!("target {} has no port", raw))?;

        Ok(Self { scheme, host, port })
    }

    pub fn is_tls(&self) -> bool {
        self.scheme == "https"
    }

    /// `host:port` for dialing.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// `service.namespace.svc.cluster.local` → (namespace, service).
    pub fn service(&self) -> Option<ServiceRef> {
        let prefix = self
            .host
            .strip_suffix(CLUSTER_DOMAIN_SUFFIX)?
            .strip_suffix('.')?;
        let (name, namespace) = prefix.split_once('.')?;
        if name.is_empty() || namespace.is_empty() || namespace.contains('.') {
            return None;
        }
        Some(ServiceRef {
            namespace: namespace.to_string(),
            name: name.to_string(),
        })
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}
