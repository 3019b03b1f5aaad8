//! Routing table storage: host → targets, idle flags and request activity.
//!
//! Two drivers implement [`Storage`]: [`memory::MemoryStorage`] (per-process,
//! the default) and [`slate::SlateStorage`] (one keyed row per host in a
//! SlateDB table).

pub mod kv;
pub mod locks;
pub mod memory;
pub mod slate;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Request activity for a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Activity {
    /// Time of the most recent request begin or end.
    pub last_request: DateTime<Utc>,
    /// Requests currently in flight.
    pub active: u64,
}

/// Storage driver for the routing table.
///
/// All methods are safe to call concurrently. External drivers surface
/// transient errors unchanged; callers retry on their next natural event.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Add a target to a host. Adding a present target is a no-op.
    async fn target_add(&self, host: &str, target: &str) -> anyhow::Result<()>;

    /// Remove a target from a host. Removing an absent target is a no-op.
    async fn target_remove(&self, host: &str, target: &str) -> anyhow::Result<()>;

    /// Point-in-time snapshot of a host's targets, in no particular order.
    async fn target_list(&self, host: &str) -> anyhow::Result<Vec<String>>;

    async fn idle_get(&self, host: &str) -> anyhow::Result<bool>;

    async fn idle_set(&self, host: &str, idle: bool) -> anyhow::Result<()>;

    /// Atomically set `last_request = now` and `active += 1`.
    async fn request_begin(&self, host: &str) -> anyhow::Result<()>;

    /// Atomically set `last_request = now` and decrement `active` if positive.
    async fn request_end(&self, host: &str) -> anyhow::Result<()>;

    async fn activity_get(&self, host: &str) -> anyhow::Result<Option<Activity>>;

    /// Hosts with `last_request < cutoff`, not idle, and at least one target.
    /// May return a superset; callers re-check each host before acting.
    async fn idle_ready(&self, cutoff: DateTime<Utc>) -> anyhow::Result<Vec<String>>;
}
