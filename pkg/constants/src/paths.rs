//! Filesystem path constants.

/// Default config file path for the router.
pub const DEFAULT_ROUTER_CONFIG: &str = "/etc/router/config.yaml";

/// Default location of the external route table.
pub const DEFAULT_ROUTES_DIR: &str = "/var/lib/router/routes";

/// Default location of the ACME certificate cache.
pub const DEFAULT_CACHE_DIR: &str = "/var/lib/router/cache";
