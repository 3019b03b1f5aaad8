use serde::{Deserialize, Serialize};

/// Router configuration file (YAML). Every field is optional; CLI flags and
/// environment variables take precedence.
///
/// Example `config.yaml`:
/// ```yaml
/// backend: slatedb
/// autocert: false
/// router-routes: /var/lib/router/routes
/// namespace: convox-system
/// dns-port: 53
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RouterConfigFile {
    #[serde(default)]
    pub backend: Option<String>,
    #[serde(default)]
    pub autocert: Option<bool>,
    #[serde(default, alias = "router_cache")]
    pub router_cache: Option<String>,
    #[serde(default, alias = "router_routes")]
    pub router_routes: Option<String>,
    #[serde(default, alias = "pod_ip")]
    pub pod_ip: Option<String>,
    #[serde(default, alias = "service_host")]
    pub service_host: Option<String>,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default, alias = "service_name")]
    pub service_name: Option<String>,
    #[serde(default, alias = "ca_secret")]
    pub ca_secret: Option<String>,
    #[serde(default, alias = "acme_directory")]
    pub acme_directory: Option<String>,
    #[serde(default, alias = "acme_email")]
    pub acme_email: Option<String>,
    #[serde(default, alias = "https_port")]
    pub https_port: Option<u16>,
    #[serde(default, alias = "http_port")]
    pub http_port: Option<u16>,
    #[serde(default, alias = "dns_port")]
    pub dns_port: Option<u16>,
    #[serde(default, alias = "dns_upstream")]
    pub dns_upstream: Option<String>,
    #[serde(default, alias = "unidle_timeout")]
    pub unidle_timeout: Option<u64>,
    #[serde(default, alias = "log_format")]
    pub log_format: Option<String>,
}

/// Load a YAML config file, returning the default if the file doesn't exist.
pub fn load_config_file<T: serde::de::DeserializeOwned + Default>(path: &str) -> anyhow::Result<T> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(T::default());
        }
        Err(e) => return Err(e.into()),
    };
    let config: T = serde_yaml::from_str(&content)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_is_default() {
        let cfg: RouterConfigFile = load_config_file("/nonexistent/router.yaml").unwrap();
        assert!(cfg.backend.is_none());
        assert!(cfg.dns_port.is_none());
    }

    #[test]
    fn test_parse_kebab_case() {
        let cfg: RouterConfigFile = serde_yaml::from_str(
            "backend: slatedb\nautocert: true\nrouter-routes: /data/routes\ndns-port: 53\n",
        )
        .unwrap();
        assert_eq!(cfg.backend.as_deref(), Some("slatedb"));
        assert_eq!(cfg.autocert, Some(true));
        assert_eq!(cfg.router_routes.as_deref(), Some("/data/routes"));
        assert_eq!(cfg.dns_port, Some(53));
    }
}
