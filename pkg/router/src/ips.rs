use std::net::{IpAddr, Ipv4Addr};
use tracing::{debug, info, warn};

use pkg_cluster::Cluster;
use pkg_constants::network::LOOPBACK_INGRESS_IP;

/// The router's own addresses.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouterIps {
    /// Cluster-internal service IP.
    pub internal: Option<IpAddr>,
    /// Externally routable (load-balancer) IP.
    pub external: Option<IpAddr>,
    /// Clients inside this /16 are handed the internal IP.
    pub internal_prefix: Option<[u8; 2]>,
}

impl RouterIps {
    /// Resolve from the router's service record, falling back to the first
    /// IPv4 address of `service_host` (then of any load-balancer hostname)
    /// for the external IP.
    pub async fn resolve(
        cluster: &dyn Cluster,
        service_host: Option<&str>,
        pod_ip: Option<&str>,
    ) -> Self {
        let svc = match cluster.router_service().await {
            Ok(svc) => svc,
            Err(e) => {
                warn!(stage = "resolve-ips", error = %e, "Could not read router service");
                Default::default()
            }
        };

        let internal = svc.cluster_ip.as_deref().and_then(|ip| ip.parse().ok());
        let mut external = svc.external_ips.iter().find_map(|ip| ip.parse().ok());

        if external.is_none() {
            let names = service_host
                .map(str::to_string)
                .into_iter()
                .chain(svc.external_hostnames.iter().cloned());
            for name in names {
                if let Some(ip) = lookup_ipv4(&name).await {
                    external = Some(IpAddr::V4(ip));
                    break;
                }
            }
        }

        let ips = Self {
            internal,
            external,
            internal_prefix: pod_ip.and_then(prefix_of),
        };
        info!(
            internal = ?ips.internal,
            external = ?ips.external,
            "Resolved router addresses"
        );
        ips
    }

    /// The address DNS hands to `client`: internal for clients inside the
    /// pod network, external otherwise. Each falls back to the other.
    pub fn ip_for(&self, client: IpAddr) -> Option<IpAddr> {
        let inside = match (self.internal_prefix, client) {
            (Some(prefix), IpAddr::V4(v4)) => v4.octets()[..2] == prefix,
            (Some(prefix), IpAddr::V6(v6)) => v6
                .to_ipv4_mapped()
                .is_some_and(|v4| v4.octets()[..2] == prefix),
            (None, _) => false,
        };
        if inside {
            self.internal.or(self.external)
        } else {
            self.external.or(self.internal)
        }
    }

    /// Address published on ingress status: the cluster IP when known,
    /// loopback on single-node installs.
    pub fn ingress_ip(&self) -> String {
        match self.internal {
            Some(ip) => ip.to_string(),
            None => LOOPBACK_INGRESS_IP.to_string(),
        }
    }
}

/// First two octets of an IPv4 pod address.
fn prefix_of(pod_ip: &str) -> Option<[u8; 2]> {
    match pod_ip.trim().parse::<Ipv4Addr>() {
        Ok(ip) => {
            let o = ip.octets();
            Some([o[0], o[1]])
        }
        Err(e) => {
            warn!(pod_ip = %pod_ip, error = %e, "Ignoring unparseable pod IP");
            None
        }
    }
}

async fn lookup_ipv4(name: &str) -> Option<Ipv4Addr> {
    match tokio::net::lookup_host((name, 0)).await {
        Ok(addrs) => addrs.into_iter().find_map(|a| match a.ip() {
            IpAddr::V4(v4) => Some(v4),
            IpAddr::V6(_) => None,
        }),
        Err(e) => {
            debug!(host = %name, error = %e, "lookup failed");
            None
        }
    }
}
