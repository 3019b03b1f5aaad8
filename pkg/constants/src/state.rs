//! Route storage / leader election constants.

/// Key prefix of per-host rows in the external route table.
pub const ROUTE_KEY_PREFIX: &str = "/routes/";

/// Key prefix of ACME material in the certificate cache.
pub const AUTOCERT_KEY_PREFIX: &str = "/autocert/";

/// Name of the ConfigMap used as the leader lock.
pub const LEADER_LOCK_NAME: &str = "router-leader";

/// Annotation on the lock ConfigMap that carries the leader record.
pub const LEADER_ANNOTATION: &str = "control-plane.alpha.kubernetes.io/leader";

/// How long a leader lease is valid, in seconds.
pub const LEADER_LEASE_TTL_SECS: u64 = 15;

/// The lease is renewed every `TTL / LEADER_RENEW_INTERVAL_DIVISOR` seconds.
pub const LEADER_RENEW_INTERVAL_DIVISOR: u64 = 3;
