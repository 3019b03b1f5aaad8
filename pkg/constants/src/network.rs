//! Network-related constants.

/// Port the HTTPS listener terminates TLS on.
pub const DEFAULT_HTTPS_PORT: u16 = 443;

/// Port the HTTP redirector (and ACME HTTP-01 responder) listens on.
pub const DEFAULT_HTTP_PORT: u16 = 80;

/// DNS port used in development.
pub const DEFAULT_DNS_PORT: u16 = 5453;

/// DNS port used in production installs.
pub const PRODUCTION_DNS_PORT: u16 = 53;

/// Resolver that queries for unknown hosts are forwarded to (over TCP).
pub const DEFAULT_DNS_UPSTREAM: &str = "8.8.8.8:53";

/// TTL attached to synthesized A/AAAA answers.
pub const DNS_ANSWER_TTL_SECS: u32 = 60;

/// Deadline for a single upstream DNS exchange.
pub const DNS_FORWARD_TIMEOUT_SECS: u64 = 5;

/// Largest UDP datagram the DNS server reads.
pub const DNS_MAX_DATAGRAM: usize = 4096;

/// Address the ingress status points at in single-node installs.
pub const LOOPBACK_INGRESS_IP: &str = "127.0.0.1";
