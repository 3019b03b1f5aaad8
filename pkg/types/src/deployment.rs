use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The slice of a deployment the router reads: desired and ready replicas.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentSummary {
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// spec.replicas
    pub replicas: i32,
    /// status.readyReplicas
    #[serde(default)]
    pub ready_replicas: i32,
}

/// Match `labels` against an equality selector such as `system=convox,type=service`.
/// An empty selector matches everything.
pub fn selector_matches(selector: &str, labels: &BTreeMap<String, String>) -> bool {
    selector
        .split(',')
        .map(str::trim)
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((k, v)) => labels.get(k.trim()).is_some_and(|l| l == v.trim()),
            None => labels.contains_key(term),
        })
}
