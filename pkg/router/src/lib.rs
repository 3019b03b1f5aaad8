//! The router facade shared by the listeners, the DNS server and the
//! controllers: address identity, target selection, certificate lookup and
//! routing-table forwarding.

pub mod ips;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use pkg_controllers::idle::IdleController;
use pkg_controllers::ingress::RouteTable;
use pkg_pki::{Certificates, IssuedCert};
use pkg_storage::Storage;

pub use ips::RouterIps;

pub struct Router {
    storage: Arc<dyn Storage>,
    certs: Arc<dyn Certificates>,
    idle: Arc<IdleController>,
    ips: RouterIps,
    rng: Mutex<StdRng>,
}

impl Router {
    pub fn new(
        storage: Arc<dyn Storage>,
        certs: Arc<dyn Certificates>,
        idle: Arc<IdleController>,
        ips: RouterIps,
    ) -> Self {
        Self::with_rng(storage, certs, idle, ips, StdRng::from_os_rng())
    }

    pub fn with_rng(
        storage: Arc<dyn Storage>,
        certs: Arc<dyn Certificates>,
        idle: Arc<IdleController>,
        ips: RouterIps,
        rng: StdRng,
    ) -> Self {
        Self {
            storage,
            certs,
            idle,
            ips,
            rng: Mutex::new(rng),
        }
    }

    /// Pick one of the host's targets uniformly at random.
    pub async fn route(&self, host: &str) -> anyhow::Result<Option<String>> {
        let mut targets = self.storage.target_list(host).await?;
        if targets.is_empty() {
            return Ok(None);
        }
        // Storage order is unspecified; sort so a seeded RNG is reproducible.
        targets.sort();
        let idx = self.rng.lock().await.random_range(0..targets.len());
        Ok(Some(targets.swap_remove(idx)))
    }

    /// Whether any target is registered for `host`.
    pub async fn is_known(&self, host: &str) -> anyhow::Result<bool> {
        Ok(!self.storage.target_list(host).await?.is_empty())
    }

    /// The router address DNS answers `client` with.
    pub fn ip_for(&self, client: IpAddr) -> Option<IpAddr> {
        self.ips.ip_for(client)
    }

    pub async fn certificate(&self, host: &str) -> anyhow::Result<Arc<IssuedCert>> {
        self.certs.certificate(host).await
    }

    pub fn challenge_response(&self, token: &str) -> Option<String> {
        self.certs.challenge_response(token)
    }

    pub async fn request_begin(&self, host: &str) -> anyhow::Result<()> {
        debug!(host = %host, "request begin");
        self.storage.request_begin(host).await
    }

    pub async fn request_end(&self, host: &str) -> anyhow::Result<()> {
        debug!(host = %host, "request end");
        self.storage.request_end(host).await
    }

    pub async fn idle_get(&self, host: &str) -> anyhow::Result<bool> {
        self.storage.idle_get(host).await
    }

    /// Wake an idle host. Unbounded; the caller supplies the deadline.
    pub async fn unidle(&self, host: &str) -> anyhow::Result<()> {
        self.idle.unidle(host).await
    }
}

#[async_trait]
impl RouteTable for Router {
    async fn target_add(&self, host: &str, target: &str) -> anyhow::Result<()> {
        info!(host = %host, target = %target, "Adding target");
        self.storage.target_add(host, target).await
    }

    async fn target_remove(&self, host: &str, target: &str) -> anyhow::Result<()> {
        info!(host = %host, target = %target, "Removing target");
        self.storage.target_remove(host, target).await
    }

    fn set_idles_allowed(&self, host: &str, allowed: bool) {
        self.idle.set_idles_allowed(host, allowed);
    }

    fn ingress_ip(&self) -> String {
        self.ips.ingress_ip()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pkg_cluster::memory::MemoryCluster;
    use pkg_pki::ca::{CaCertificates, ClusterCA};
    use pkg_storage::memory::MemoryStorage;
    use std::collections::BTreeMap;

    fn router(seed: u64) -> Router {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let cluster = Arc::new(MemoryCluster::new());
        let idle = Arc::new(IdleController::new(storage.clone(), cluster));
        let certs = Arc::new(CaCertificates::new(ClusterCA::new().unwrap()));
        Router::with_rng(
            storage,
            certs,
            idle,
            RouterIps::default(),
            StdRng::seed_from_u64(seed),
        )
    }

    #[tokio::test]
    async fn test_route_unknown_host() {
        let r = router(1);
        assert_eq!(r.route("unknown.example.com").await.unwrap(), None);
        assert!(!r.is_known("unknown.example.com").await.unwrap());
    }

    #[tokio::test]
    async fn test_route_single_target() {
        let r = router(1);
        r.target_add("svc.example.com", "http://api.default.svc.cluster.local:80")
            .await
            .unwrap();
        assert_eq!(
            r.route("svc.example.com").await.unwrap().as_deref(),
            Some("http://api.default.svc.cluster.local:80")
        );
        assert!(r.is_known("svc.example.com").await.unwrap());
    }

    #[tokio::test]
    async fn test_route_spreads_across_targets() {
        let r = router(7);
        for t in ["http://a:80", "http://b:80", "http://c:80"] {
            r.target_add("svc.example.com", t).await.unwrap();
        }
        let mut hits: BTreeMap<String, usize> = BTreeMap::new();
        for _ in 0..300 {
            let t = r.route("svc.example.com").await.unwrap().unwrap();
            *hits.entry(t).or_default() += 1;
        }
        assert_eq!(hits.len(), 3);
        assert!(hits.values().all(|n| *n > 50), "skewed: {:?}", hits);
    }

    #[tokio::test]
    async fn test_seeded_selection_is_reproducible() {
        let a = router(42);
        let b = router(42);
        for t in ["http://a:80", "http://b:80", "http://c:80", "http://d:80"] {
            a.target_add("h", t).await.unwrap();
            b.target_add("h", t).await.unwrap();
        }
        for _ in 0..20 {
            assert_eq!(a.route("h").await.unwrap(), b.route("h").await.unwrap());
        }
    }

    #[tokio::test]
    async fn test_route_table_forwards_idles_flag() {
        let r = router(1);
        r.set_idles_allowed("svc.example.com", true);
        assert!(r.idle.idles_allowed("svc.example.com"));
        assert_eq!(r.ingress_ip(), "127.0.0.1");
    }

    #[tokio::test]
    async fn test_certificate_delegates() {
        let r = router(1);
        let cert = r.certificate("svc.example.com").await.unwrap();
        assert!(cert.cert_chain_pem.contains("BEGIN CERTIFICATE"));
        assert!(r.challenge_response("token").is_none());
    }
}
