use chrono::Utc;
use dashmap::{DashMap, DashSet};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use pkg_cluster::Cluster;
use pkg_constants::cluster::DEPLOYMENT_LABEL_SELECTOR;
use pkg_constants::idle::{
    DEFAULT_UNIDLE_TIMEOUT_SECS, IDLE_TICK_SECS, IDLE_TIMEOUT_SECS, SCALE_TIMEOUT_SECS,
    UNIDLE_POLL_MILLIS, UNIDLE_SETTLE_MILLIS,
};
use pkg_storage::Storage;
use pkg_storage::locks::KeyedLocks;
use pkg_types::target::{ServiceRef, Target};

/// Scale-to-zero controller.
///
/// A periodic sweep scales the deployments behind quiet hosts down to zero
/// and marks them idle. The HTTPS listener calls [`IdleController::unidle`]
/// on the first request to an idle host.
pub struct IdleController {
    storage: Arc<dyn Storage>,
    cluster: Arc<dyn Cluster>,
    idles_allowed: DashMap<String, bool>,
    /// Hosts with a sweep transition in flight.
    idling: DashSet<String>,
    /// Hosts this process has idled and not yet seen woken.
    idled: DashSet<String>,
    /// Serialises idle transitions and wake-ups per host.
    host_locks: KeyedLocks,
    check_interval: Duration,
    idle_timeout: chrono::Duration,
}

impl IdleController {
    pub fn new(storage: Arc<dyn Storage>, cluster: Arc<dyn Cluster>) -> Self {
        Self {
            storage,
            cluster,
            idles_allowed: DashMap::new(),
            idling: DashSet::new(),
            idled: DashSet::new(),
            host_locks: KeyedLocks::new(),
            check_interval: Duration::from_secs(IDLE_TICK_SECS),
            idle_timeout: chrono::Duration::seconds(IDLE_TIMEOUT_SECS as i64),
        }
    }

    pub fn set_idles_allowed(&self, host: &str, allowed: bool) {
        self.idles_allowed.insert(host.to_string(), allowed);
    }

    pub fn idles_allowed(&self, host: &str) -> bool {
        self.idles_allowed.get(host).is_some_and(|v| *v)
    }

    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                interval_secs = self.check_interval.as_secs(),
                timeout_mins = self.idle_timeout.num_minutes(),
                "IdleController started"
            );
            let mut interval = tokio::time::interval(self.check_interval);
            loop {
                interval.tick().await;
                if let Err(e) = self.sweep().await {
                    warn!(stage = "idle-sweep", error = %e, "IdleController sweep error");
                }
            }
        })
    }

    /// One pass: wake idle hosts that still have requests in flight, then
    /// idle hosts with no activity since the cutoff.
    pub async fn sweep(&self) -> anyhow::Result<()> {
        self.wake_busy().await;

        let cutoff = Utc::now() - self.idle_timeout;
        for host in self.storage.idle_ready(cutoff).await? {
            if !self.idles_allowed(&host) {
                continue;
            }
            // Another sweep already owns this host.
            if !self.idling.insert(host.clone()) {
                continue;
            }
            let result = self.idle_host(&host, cutoff).await;
            self.idling.remove(&host);
            if let Err(e) = result {
                warn!(host = %host, stage = "idle", error = %e, "Failed to idle host");
            }
        }
        Ok(())
    }

    /// An idle host must not keep a request in flight past one sweep.
    async fn wake_busy(&self) {
        let hosts: Vec<String> = self.idled.iter().map(|h| h.key().clone()).collect();
        for host in hosts {
            match self.storage.idle_get(&host).await {
                Ok(false) => {
                    self.idled.remove(&host);
                    continue;
                }
                Ok(true) => {}
                Err(e) => {
                    debug!(host = %host, error = %e, "idle flag read failed");
                    continue;
                }
            }
            let busy = match self.storage.activity_get(&host).await {
                Ok(activity) => activity.is_some_and(|a| a.active > 0),
                Err(e) => {
                    debug!(host = %host, error = %e, "activity read failed");
                    continue;
                }
            };
            if !busy {
                continue;
            }

            info!(host = %host, "Idle host has requests in flight, waking");
            let wake = self.unidle(&host);
            match tokio::time::timeout(Duration::from_secs(DEFAULT_UNIDLE_TIMEOUT_SECS), wake).await
            {
                Ok(Ok(())) => {
                    self.idled.remove(&host);
                }
                Ok(Err(e)) => {
                    warn!(host = %host, stage = "wake", error = %e, "Failed to wake busy host")
                }
                Err(_) => warn!(host = %host, stage = "wake", "Waking busy host timed out"),
            }
        }
    }

    async fn idle_host(&self, host: &str, cutoff: chrono::DateTime<Utc>) -> anyhow::Result<()> {
        // idle_ready may return a superset; re-check before acting.
        if self.storage.idle_get(host).await? || self.recently_active(host, cutoff).await? {
            return Ok(());
        }

        let services = self.services(host).await?;
        let mut running = false;
        for svc in &services {
            match self.cluster.get_scale(&svc.namespace, &svc.name).await {
                Ok(replicas) if replicas > 0 => running = true,
                Ok(_) => {}
                Err(e) => {
                    debug!(host = %host, namespace = %svc.namespace, deployment = %svc.name, error = %e, "get scale failed")
                }
            }
        }
        if !running {
            return Ok(());
        }

        let _guard = self.host_locks.lock(host).await;

        self.storage.idle_set(host, true).await?;
        // A request that began before the flag was set keeps the host up.
        if self.recently_active(host, cutoff).await? {
            self.storage.idle_set(host, false).await?;
            debug!(host = %host, "Request arrived while idling, rolled back");
        } else {
            info!(host = %host, deployments = services.len(), "Idling host");
            for svc in &services {
                self.scale(host, svc, 0).await;
            }
            self.idled.insert(host.to_string());
        }
        Ok(())
    }

    async fn recently_active(
        &self,
        host: &str,
        cutoff: chrono::DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        Ok(self
            .storage
            .activity_get(host)
            .await?
            .is_some_and(|a| a.active > 0 || a.last_request >= cutoff))
    }

    /// Wake an idle host: scale its deployments to one replica, wait until any
    /// reports ready, then clear the idle flag.
    ///
    /// Concurrent callers for the same host share one wake-up. The wait has no
    /// deadline of its own; callers bound it.
    pub async fn unidle(&self, host: &str) -> anyhow::Result<()> {
        let _guard = self.host_locks.lock(host).await;
        if !self.storage.idle_get(host).await? {
            return Ok(());
        }

        let services = self.services(host).await?;
        info!(host = %host, deployments = services.len(), "Unidling host");
        for svc in &services {
            self.scale(host, svc, 1).await;
        }

        if !services.is_empty() {
            while !self.any_ready(host, &services).await {
                tokio::time::sleep(Duration::from_millis(UNIDLE_POLL_MILLIS)).await;
            }
            tokio::time::sleep(Duration::from_millis(UNIDLE_SETTLE_MILLIS)).await;
        }

        self.storage.idle_set(host, false).await?;
        info!(host = %host, "Host is active");
        Ok(())
    }

    /// Cluster services behind a host's targets.
    async fn services(&self, host: &str) -> anyhow::Result<Vec<ServiceRef>> {
        let mut services = BTreeSet::new();
        for raw in self.storage.target_list(host).await? {
            match Target::parse(&raw) {
                Ok(target) => services.extend(target.service()),
                Err(e) => debug!(host = %host, target = %raw, error = %e, "unparseable target"),
            }
        }
        Ok(services.into_iter().collect())
    }

    async fn scale(&self, host: &str, svc: &ServiceRef, replicas: i32) {
        let call = self
            .cluster
            .update_scale(&svc.namespace, &svc.name, replicas);
        match tokio::time::timeout(Duration::from_secs(SCALE_TIMEOUT_SECS), call).await {
            Ok(Ok(())) => {
                info!(host = %host, namespace = %svc.namespace, deployment = %svc.name, replicas, "Scaled deployment")
            }
            Ok(Err(e)) => {
                warn!(host = %host, namespace = %svc.namespace, deployment = %svc.name, stage = "scale", error = %e, "Scale failed")
            }
            Err(_) => {
                warn!(host = %host, namespace = %svc.namespace, deployment = %svc.name, stage = "scale", "Scale timed out")
            }
        }
    }

    async fn any_ready(&self, host: &str, services: &[ServiceRef]) -> bool {
        let namespaces: BTreeSet<&str> = services.iter().map(|s| s.namespace.as_str()).collect();
        for ns in namespaces {
            match self
                .cluster
                .list_deployments(ns, DEPLOYMENT_LABEL_SELECTOR)
                .await
            {
                Ok(deployments) => {
                    let ready = deployments.iter().any(|d| {
                        d.ready_replicas >= 1
                            && services
                                .iter()
                                .any(|s| s.namespace == d.namespace && s.name == d.name)
                    });
                    if ready {
                        return true;
                    }
                }
                Err(e) => {
                    debug!(host = %host, namespace = %ns, error = %e, "list deployments failed")
                }
            }
        }
        false
    }
}
