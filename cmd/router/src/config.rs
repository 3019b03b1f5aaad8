use clap::Parser;
use std::net::SocketAddr;
use std::time::Duration;

use pkg_constants::cluster::{DEFAULT_CA_SECRET, DEFAULT_ROUTER_NAMESPACE, DEFAULT_ROUTER_SERVICE};
use pkg_constants::idle::DEFAULT_UNIDLE_TIMEOUT_SECS;
use pkg_constants::network::{
    DEFAULT_DNS_PORT, DEFAULT_DNS_UPSTREAM, DEFAULT_HTTP_PORT, DEFAULT_HTTPS_PORT,
    PRODUCTION_DNS_PORT,
};
use pkg_constants::paths::{DEFAULT_CACHE_DIR, DEFAULT_ROUTER_CONFIG, DEFAULT_ROUTES_DIR};
use pkg_constants::tls::DEFAULT_ACME_DIRECTORY;
use pkg_types::config::RouterConfigFile;

#[derive(Parser, Debug, Default)]
#[command(name = "router", about = "Edge router: HTTPS, DNS and idling for routed hosts")]
pub struct Cli {
    /// Path to YAML config file
    #[arg(long, short, default_value = DEFAULT_ROUTER_CONFIG)]
    pub config: String,

    /// Route table backend: dynamodb/slatedb for the external store, anything else for memory
    #[arg(long, env = "BACKEND")]
    pub backend: Option<String>,

    /// Issue certificates through ACME instead of the cluster CA
    #[arg(long, env = "AUTOCERT")]
    pub autocert: Option<bool>,

    /// Location of the ACME certificate cache
    #[arg(long, env = "ROUTER_CACHE")]
    pub router_cache: Option<String>,

    /// Location of the external route table
    #[arg(long, env = "ROUTER_ROUTES")]
    pub router_routes: Option<String>,

    /// This pod's IP; its /16 is the internal client prefix
    #[arg(long, env = "POD_IP")]
    pub pod_ip: Option<String>,

    /// DNS name whose first A record is the external IP
    #[arg(long, env = "SERVICE_HOST")]
    pub service_host: Option<String>,

    #[arg(long, env = "NAMESPACE")]
    pub namespace: Option<String>,

    #[arg(long)]
    pub service_name: Option<String>,

    /// Secret holding the root CA
    #[arg(long)]
    pub ca_secret: Option<String>,

    #[arg(long, env = "ACME_DIRECTORY")]
    pub acme_directory: Option<String>,

    #[arg(long, env = "ACME_EMAIL")]
    pub acme_email: Option<String>,

    #[arg(long)]
    pub https_port: Option<u16>,

    #[arg(long)]
    pub http_port: Option<u16>,

    #[arg(long)]
    pub dns_port: Option<u16>,

    /// Serve DNS on port 53
    #[arg(long)]
    pub production: bool,

    /// Resolver unknown hosts are forwarded to
    #[arg(long)]
    pub dns_upstream: Option<String>,

    /// Seconds a request waits for an idle host to wake
    #[arg(long)]
    pub unidle_timeout: Option<u64>,

    /// `json` switches to JSON log records
    #[arg(long, env = "LOG_FORMAT")]
    pub log_format: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backend {
    Memory,
    /// Keyed external store (`dynamodb` is accepted as an alias).
    External,
}

/// Fully resolved settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub backend: Backend,
    pub autocert: bool,
    pub router_cache: String,
    pub router_routes: String,
    pub pod_ip: Option<String>,
    pub service_host: Option<String>,
    pub namespace: String,
    pub service_name: String,
    pub ca_secret: String,
    pub acme_directory: String,
    pub acme_email: Option<String>,
    pub https_port: u16,
    pub http_port: u16,
    pub dns_addr: SocketAddr,
    pub dns_upstream: SocketAddr,
    pub unidle_timeout: Duration,
    pub json_logs: bool,
}

impl Settings {
    /// Merge: CLI args / env > config file > defaults
    pub fn resolve(cli: Cli, file: RouterConfigFile) -> anyhow::Result<Self> {
        let backend = match cli.backend.or(file.backend).as_deref() {
            Some("dynamodb") | Some("slatedb") => Backend::External,
            _ => Backend::Memory,
        };

        let dns_default = if cli.production {
            PRODUCTION_DNS_PORT
        } else {
            DEFAULT_DNS_PORT
        };
        let dns_port = cli.dns_port.or(file.dns_port).unwrap_or(dns_default);

        let dns_upstream = cli
            .dns_upstream
            .or(file.dns_upstream)
            .unwrap_or_else(|| DEFAULT_DNS_UPSTREAM.to_string());
        let dns_upstream: SocketAddr = dns_upstream
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid dns upstream {}: {}", dns_upstream, e))?;

        Ok(Self {
            backend,
            autocert: cli.autocert.or(file.autocert).unwrap_or(false),
            router_cache: cli
                .router_cache
                .or(file.router_cache)
                .unwrap_or_else(|| DEFAULT_CACHE_DIR.to_string()),
            router_routes: cli
                .router_routes
                .or(file.router_routes)
                .unwrap_or_else(|| DEFAULT_ROUTES_DIR.to_string()),
            pod_ip: cli.pod_ip.or(file.pod_ip).filter(|s| !s.is_empty()),
            service_host: cli.service_host.or(file.service_host).filter(|s| !s.is_empty()),
            namespace: cli
                .namespace
                .or(file.namespace)
                .unwrap_or_else(|| DEFAULT_ROUTER_NAMESPACE.to_string()),
            service_name: cli
                .service_name
                .or(file.service_name)
                .unwrap_or_else(|| DEFAULT_ROUTER_SERVICE.to_string()),
            ca_secret: cli
                .ca_secret
                .or(file.ca_secret)
                .unwrap_or_else(|| DEFAULT_CA_SECRET.to_string()),
            acme_directory: cli
                .acme_directory
                .or(file.acme_directory)
                .unwrap_or_else(|| DEFAULT_ACME_DIRECTORY.to_string()),
            acme_email: cli.acme_email.or(file.acme_email).filter(|s| !s.is_empty()),
            https_port: cli.https_port.or(file.https_port).unwrap_or(DEFAULT_HTTPS_PORT),
            http_port: cli.http_port.or(file.http_port).unwrap_or(DEFAULT_HTTP_PORT),
            dns_addr: SocketAddr::from(([0, 0, 0, 0], dns_port)),
            dns_upstream,
            unidle_timeout: Duration::from_secs(
                cli.unidle_timeout
                    .or(file.unidle_timeout)
                    .unwrap_or(DEFAULT_UNIDLE_TIMEOUT_SECS),
            ),
            json_logs: cli.log_format.or(file.log_format).as_deref() == Some("json"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> Cli {
        let mut argv = vec!["router"];
        argv.extend_from_slice(args);
        Cli::parse_from(argv)
    }

    #[test]
    fn test_defaults() {
        let s = Settings::resolve(Cli::default(), RouterConfigFile::default()).unwrap();
        assert_eq!(s.backend, Backend::Memory);
        assert!(!s.autocert);
        assert_eq!(s.namespace, "convox-system");
        assert_eq!(s.https_port, 443);
        assert_eq!(s.http_port, 80);
        assert_eq!(s.dns_addr.port(), 5453);
        assert_eq!(s.dns_upstream.to_string(), "8.8.8.8:53");
        assert_eq!(s.unidle_timeout, Duration::from_secs(60));
        assert!(!s.json_logs);
    }

    #[test]
    fn test_production_dns_port() {
        let s = Settings::resolve(cli(&["--production"]), RouterConfigFile::default()).unwrap();
        assert_eq!(s.dns_addr.port(), 53);
    }

    #[test]
    fn test_backend_aliases() {
        for name in ["dynamodb", "slatedb"] {
            let s = Settings::resolve(cli(&["--backend", name]), RouterConfigFile::default())
                .unwrap();
            assert_eq!(s.backend, Backend::External);
        }
        let s = Settings::resolve(cli(&["--backend", "other"]), RouterConfigFile::default())
            .unwrap();
        assert_eq!(s.backend, Backend::Memory);
    }

    #[test]
    fn test_cli_overrides_file() {
        let file = RouterConfigFile {
            https_port: Some(8443),
            http_port: Some(8080),
            namespace: Some("from-file".to_string()),
            log_format: Some("json".to_string()),
            ..Default::default()
        };
        let s = Settings::resolve(cli(&["--https-port", "9443"]), file).unwrap();
        assert_eq!(s.https_port, 9443);
        assert_eq!(s.http_port, 8080);
        assert_eq!(s.namespace, "from-file");
        assert!(s.json_logs);
    }

    #[test]
    fn test_invalid_upstream_is_rejected() {
        let file = RouterConfigFile {
            dns_upstream: Some("not-an-address".to_string()),
            ..Default::default()
        };
        assert!(Settings::resolve(Cli::default(), file).is_err());
    }
}
