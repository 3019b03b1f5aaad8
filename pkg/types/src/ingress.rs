use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use pkg_constants::cluster::{
    ANNOTATION_IDLES, ANNOTATION_PROTOCOL_SUFFIX, ANNOTATION_SERVICE_PREFIX, CLUSTER_DOMAIN_SUFFIX,
};

/// Backend service target for an Ingress path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngressBackend {
    pub service_name: String,
    pub service_port: u16,
}

/// A single path rule within an Ingress HTTP rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngressPath {
    #[serde(default)]
    pub path: String,
    pub backend: IngressBackend,
}

/// HTTP rules for a host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngressHTTP {
    pub paths: Vec<IngressPath>,
}

/// A single host-based Ingress rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngressRule {
    pub host: String,
    #[serde(default)]
    pub http: IngressHTTP,
}

/// Ingress specification.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngressSpec {
    pub rules: Vec<IngressRule>,
}

/// Declarative routing object observed from the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ingress {
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    pub spec: IngressSpec,
}

impl Ingress {
    /// `namespace/name`, unique per object.
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    /// Whether `convox.idles` is set to "true".
    pub fn idles_allowed(&self) -> bool {
        self.annotations
            .get(ANNOTATION_IDLES)
            .is_some_and(|v| v.trim() == "true")
    }

    /// Upstream scheme for a backend, from
    /// `convox.ingress.service.<service>.<port>.protocol` (default `http`).
    pub fn backend_protocol(&self, backend: &IngressBackend) -> String {
        let key = format!(
            "{}{}.{}{}",
            ANNOTATION_SERVICE_PREFIX,
            backend.service_name,
            backend.service_port,
            ANNOTATION_PROTOCOL_SUFFIX
        );
        match self.annotations.get(&key) {
            Some(proto) if !proto.trim().is_empty() => proto.trim().to_lowercase(),
            _ => "http".to_string(),
        }
    }

    /// Target URL for a backend of this object.
    pub fn target_for(&self, backend: &IngressBackend) -> String {
        format!(
            "{}://{}.{}.{}:{}",
            self.backend_protocol(backend),
            backend.service_name,
            self.namespace,
            CLUSTER_DOMAIN_SUFFIX,
            backend.service_port
        )
    }

    /// Normalized hosts referenced by this object's rules.
    pub fn hosts(&self) -> BTreeSet<String> {
        self.spec
            .rules
            .iter()
            .map(|r| normalize_host(&r.host))
            .filter(|h| !h.is_empty())
            .collect()
    }

    /// Every (host, target) pair this object asks the router to serve.
    pub fn routes(&self) -> BTreeSet<(String, String)> {
        let mut routes = BTreeSet::new();
        for rule in &self.spec.rules {
            let host = normalize_host(&rule.host);
            if host.is_empty() {
                continue;
            }
            for path in &rule.http.paths {
                routes.insert((host.clone(), self.target_for(&path.backend)));
            }
        }
        routes
    }

    /// Two observations with equal spec and annotations need no reconcile.
    pub fn same_desired_state(&self, other: &Ingress) -> bool {
        self.spec == other.spec && self.annotations == other.annotations
    }
}

/// Lowercase a host and strip any port and trailing dot.
pub fn normalize_host(raw: &str) -> String {
    let raw = raw.trim();
    let host = if raw.starts_with('[') {
        // IPv6 literal: keep the brackets, drop the port
        match raw.find(']') {
            Some(end) => &raw[..=end],
            None => raw,
        }
    } else {
        raw.split(':').next().unwrap_or(raw)
    };
    host.trim_end_matches('.').to_lowercase()
}
