use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tokio::sync::Mutex;
use tracing::debug;

use pkg_constants::state::ROUTE_KEY_PREFIX;

use crate::kv::KvStore;
use crate::{Activity, Storage};

/// One row per host in the external route table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostRecord {
    #[serde(default)]
    pub targets: BTreeSet<String>,
    #[serde(default)]
    pub idle: bool,
    #[serde(default)]
    pub activity: Option<DateTime<Utc>>,
    #[serde(default)]
    pub active: u64,
}

impl HostRecord {
    /// A row with no targets, no idle flag and nothing in flight carries no state.
    fn is_vacant(&self) -> bool {
        self.targets.is_empty() && !self.idle && self.active == 0
    }
}

/// Keyed external route table backed by SlateDB.
///
/// Reads go straight to the store; every mutation is a read-modify-write of
/// the host's row under `write_lock`.
pub struct SlateStorage {
    kv: KvStore,
    write_lock: Mutex<()>,
}

impl SlateStorage {
    pub fn new(kv: KvStore) -> Self {
        Self {
            kv,
            write_lock: Mutex::new(()),
        }
    }

    /// Open the table rooted at `path`.
    pub async fn open(path: &str) -> anyhow::Result<Self> {
        Ok(Self::new(KvStore::open(path).await?))
    }

    fn key(host: &str) -> String {
        format!("{}{}", ROUTE_KEY_PREFIX, host)
    }

    async fn load(&self, host: &str) -> anyhow::Result<Option<HostRecord>> {
        match self.kv.get(&Self::key(host)).await? {
            Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
            None => Ok(None),
        }
    }

    async fn save(&self, host: &str, record: &HostRecord) -> anyhow::Result<()> {
        if record.is_vacant() {
            debug!(host = %host, "dropping vacant route row");
            return self.kv.delete(&Self::key(host)).await;
        }
        let data = serde_json::to_vec(record)?;
        self.kv.put(&Self::key(host), &data).await
    }

    /// Apply `f` to the host's row and persist the result.
    async fn update<F>(&self, host: &str, f: F) -> anyhow::Result<()>
    where
        F: FnOnce(&mut HostRecord) + Send,
    {
        let _guard = self.write_lock.lock().await;
        let mut record = self.load(host).await?.unwrap_or_default();
        f(&mut record);
        self.save(host, &record).await
    }
}

#[async_trait]
impl Storage for SlateStorage {
    async fn target_add(&self, host: &str, target: &str) -> anyhow::Result<()> {
        self.update(host, |r| {
            if r.activity.is_none() {
                r.activity = Some(Utc::now());
            }
            r.targets.insert(target.to_string());
        })
        .await
    }

    async fn target_remove(&self, host: &str, target: &str) -> anyhow::Result<()> {
        self.update(host, |r| {
            r.targets.remove(target);
        })
        .await
    }

    async fn target_list(&self, host: &str) -> anyhow::Result<Vec<String>> {
        Ok(self
            .load(host)
            .await?
            .map(|r| r.targets.into_iter().collect())
            .unwrap_or_default())
    }

    async fn idle_get(&self, host: &str) -> anyhow::Result<bool> {
        Ok(self.load(host).await?.is_some_and(|r| r.idle))
    }

    async fn idle_set(&self, host: &str, idle: bool) -> anyhow::Result<()> {
        self.update(host, |r| r.idle = idle).await
    }

    async fn request_begin(&self, host: &str) -> anyhow::Result<()> {
        self.update(host, |r| {
            r.activity = Some(Utc::now());
            r.active += 1;
        })
        .await
    }

    async fn request_end(&self, host: &str) -> anyhow::Result<()> {
        self.update(host, |r| {
            r.activity = Some(Utc::now());
            r.active = r.active.saturating_sub(1);
        })
        .await
    }

    async fn activity_get(&self, host: &str) -> anyhow::Result<Option<Activity>> {
        Ok(self.load(host).await?.and_then(|r| {
            r.activity.map(|last_request| Activity {
                last_request,
                active: r.active,
            })
        }))
    }

    async fn idle_ready(&self, cutoff: DateTime<Utc>) -> anyhow::Result<Vec<String>> {
        let rows = self.kv.list_prefix(ROUTE_KEY_PREFIX).await?;
        let mut hosts = Vec::new();
        for (key, value) in rows {
            let record: HostRecord = match serde_json::from_slice(&value) {
                Ok(r) => r,
                Err(_) => continue,
            };
            let stale = record.activity.is_none_or(|at| at < cutoff);
            if stale && !record.idle && !record.targets.is_empty() {
                if let Some(host) = key.strip_prefix(ROUTE_KEY_PREFIX) {
                    hosts.push(host.to_string());
                }
            }
        }
        Ok(hosts)
    }
}
