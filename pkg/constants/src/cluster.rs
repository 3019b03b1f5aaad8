//! Orchestrator-facing names: labels, annotations, object names.

/// Label selector every routed ingress object must match.
pub const INGRESS_LABEL_SELECTOR: &str = "system=convox";

/// Label selector for application deployments the router may scale.
pub const DEPLOYMENT_LABEL_SELECTOR: &str = "system=convox";

/// Annotation enabling idling for every host of an ingress object.
pub const ANNOTATION_IDLES: &str = "convox.idles";

/// Prefix of the per-backend protocol annotation:
/// `convox.ingress.service.<service>.<port>.protocol`.
pub const ANNOTATION_SERVICE_PREFIX: &str = "convox.ingress.service.";

/// Suffix of the per-backend protocol annotation.
pub const ANNOTATION_PROTOCOL_SUFFIX: &str = ".protocol";

/// DNS suffix of in-cluster service names.
pub const CLUSTER_DOMAIN_SUFFIX: &str = "svc.cluster.local";

/// Default namespace of the router's own service, CA secret and leader lock.
pub const DEFAULT_ROUTER_NAMESPACE: &str = "convox-system";

/// Default name of the router's own service object.
pub const DEFAULT_ROUTER_SERVICE: &str = "router";

/// Default name of the secret holding the root CA (`tls.crt` / `tls.key`).
pub const DEFAULT_CA_SECRET: &str = "ca";
