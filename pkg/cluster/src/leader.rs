use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, PostParams};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tracing::{info, warn};

use pkg_constants::state::{
    LEADER_ANNOTATION, LEADER_LEASE_TTL_SECS, LEADER_RENEW_INTERVAL_DIVISOR,
};

/// Leader record stored on the lock object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderRecord {
    pub holder_identity: String,
    pub lease_duration_seconds: u64,
    pub acquire_time: DateTime<Utc>,
    pub renew_time: DateTime<Utc>,
    #[serde(default)]
    pub leader_transitions: u32,
}

impl LeaderRecord {
    pub fn is_expired(&self) -> bool {
        let expiry = self.renew_time + chrono::Duration::seconds(self.lease_duration_seconds as i64);
        Utc::now() > expiry
    }
}

/// Storage for the leader record with optimistic concurrency.
#[async_trait]
pub trait LeaseLock: Send + Sync {
    /// Current record and its version.
    async fn get(&self) -> anyhow::Result<Option<(LeaderRecord, String)>>;

    /// Write `record` if the lock is still at `version` (`None`: must not
    /// exist yet). `Ok(false)` means another writer got there first.
    async fn put(&self, record: &LeaderRecord, version: Option<&str>) -> anyhow::Result<bool>;
}

/// Leader lock kept as an annotation on a ConfigMap.
pub struct ConfigMapLock {
    api: Api<ConfigMap>,
    name: String,
}

impl ConfigMapLock {
    pub fn new(client: kube::Client, namespace: &str, name: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            name: name.to_string(),
        }
    }
}

fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == 409)
}

#[async_trait]
impl LeaseLock for ConfigMapLock {
    async fn get(&self) -> anyhow::Result<Option<(LeaderRecord, String)>> {
        let Some(cm) = self.api.get_opt(&self.name).await? else {
            return Ok(None);
        };
        let version = cm.metadata.resource_version.clone().unwrap_or_default();
        let record = cm
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(LEADER_ANNOTATION))
            .map(|raw| serde_json::from_str::<LeaderRecord>(raw))
            .transpose()?
            // An unannotated lock object is up for grabs.
            .unwrap_or_else(|| LeaderRecord {
                holder_identity: String::new(),
                lease_duration_seconds: 0,
                acquire_time: DateTime::<Utc>::default(),
                renew_time: DateTime::<Utc>::default(),
                leader_transitions: 0,
            });
        Ok(Some((record, version)))
    }

    async fn put(&self, record: &LeaderRecord, version: Option<&str>) -> anyhow::Result<bool> {
        let cm = ConfigMap {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                annotations: Some(BTreeMap::from([(
                    LEADER_ANNOTATION.to_string(),
                    serde_json::to_string(record)?,
                )])),
                resource_version: version.map(str::to_string),
                ..Default::default()
            },
            ..Default::default()
        };

        let result = match version {
            Some(_) => self
                .api
                .replace(&self.name, &PostParams::default(), &cm)
                .await
                .map(|_| ()),
            None => self.api.create(&PostParams::default(), &cm).await.map(|_| ()),
        };
        match result {
            Ok(()) => Ok(true),
            Err(e) if is_conflict(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

/// Leader lock held in process memory, for single-replica runs and tests.
#[derive(Default)]
pub struct MemoryLock {
    slot: Mutex<Option<(LeaderRecord, u64)>>,
}

impl MemoryLock {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LeaseLock for MemoryLock {
    async fn get(&self) -> anyhow::Result<Option<(LeaderRecord, String)>> {
        let slot = self.slot.lock().await;
        Ok(slot.as_ref().map(|(r, v)| (r.clone(), v.to_string())))
    }

    async fn put(&self, record: &LeaderRecord, version: Option<&str>) -> anyhow::Result<bool> {
        let mut slot = self.slot.lock().await;
        let current = slot.as_ref().map(|(_, v)| v.to_string());
        if current.as_deref() != version {
            return Ok(false);
        }
        let next = slot.as_ref().map_or(1, |(_, v)| v + 1);
        *slot = Some((record.clone(), next));
        Ok(true)
    }
}

/// Random holder identity for this process.
pub fn new_identity() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Leader election over a [`LeaseLock`].
///
/// Only the leader reconciles ingresses; every replica serves traffic.
pub struct LeaderElection {
    lock: Box<dyn LeaseLock>,
    identity: String,
    ttl: Duration,
    renew_interval: Duration,
    leader_tx: watch::Sender<bool>,
    leader_rx: watch::Receiver<bool>,
}

impl LeaderElection {
    pub fn new(lock: Box<dyn LeaseLock>, identity: String) -> Self {
        Self::with_ttl(lock, identity, Duration::from_secs(LEADER_LEASE_TTL_SECS))
    }

    pub fn with_ttl(lock: Box<dyn LeaseLock>, identity: String, ttl: Duration) -> Self {
        let renew_interval = ttl / LEADER_RENEW_INTERVAL_DIVISOR as u32;
        let (leader_tx, leader_rx) = watch::channel(false);
        Self {
            lock,
            identity,
            ttl,
            renew_interval,
            leader_tx,
            leader_rx,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.leader_rx.clone()
    }

    pub fn is_leader(&self) -> bool {
        *self.leader_rx.borrow()
    }

    fn fresh_record(&self, transitions: u32) -> LeaderRecord {
        let now = Utc::now();
        LeaderRecord {
            holder_identity: self.identity.clone(),
            lease_duration_seconds: self.ttl.as_secs().max(1),
            acquire_time: now,
            renew_time: now,
            leader_transitions: transitions,
        }
    }

    /// Try to acquire or renew the lease. Returns true if we are the leader.
    async fn try_acquire_or_renew(&self) -> anyhow::Result<bool> {
        match self.lock.get().await? {
            Some((record, version)) => {
                if record.holder_identity == self.identity {
                    let renewed = LeaderRecord {
                        renew_time: Utc::now(),
                        ..record
                    };
                    self.lock.put(&renewed, Some(&version)).await
                } else if record.is_expired() {
                    info!(
                        previous = %record.holder_identity,
                        identity = %self.identity,
                        "Leader lease expired, taking over"
                    );
                    let taken = self.fresh_record(record.leader_transitions + 1);
                    self.lock.put(&taken, Some(&version)).await
                } else {
                    Ok(false)
                }
            }
            None => {
                info!(identity = %self.identity, "No leader lease found, acquiring");
                self.lock.put(&self.fresh_record(0), None).await
            }
        }
    }

    /// Record the outcome of one round. Subscribers are woken only on a
    /// change of leadership.
    fn publish(&self, is_leader: bool) -> bool {
        let changed = self.leader_tx.send_if_modified(|current| {
            if *current == is_leader {
                return false;
            }
            *current = is_leader;
            true
        });
        if changed && is_leader {
            info!(identity = %self.identity, "Became leader");
        } else if changed {
            warn!(identity = %self.identity, "Lost leadership");
        }
        changed
    }

    /// Run the election loop in the background.
    pub fn start(self) -> (tokio::task::JoinHandle<()>, watch::Receiver<bool>) {
        let rx = self.leader_rx.clone();
        let handle = tokio::spawn(async move {
            info!(
                identity = %self.identity,
                ttl_secs = self.ttl.as_secs(),
                "Leader election started"
            );

            let mut interval = tokio::time::interval(self.renew_interval);
            loop {
                interval.tick().await;

                let is_leader = match self.try_acquire_or_renew().await {
                    Ok(is_leader) => is_leader,
                    Err(e) => {
                        warn!(error = %e, "Leader election error");
                        false
                    }
                };
                self.publish(is_leader);
            }
        });

        (handle, rx)
    }
}
