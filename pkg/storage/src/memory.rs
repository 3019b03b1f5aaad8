use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use tokio::sync::{Mutex, RwLock};

use crate::{Activity, Storage};

/// Per-process routing table.
///
/// One lock per logical map. When more than one is held they are always
/// taken in the order targets → idle → activity. Counter updates are
/// serialized under the activity lock.
#[derive(Default)]
pub struct MemoryStorage {
    targets: RwLock<HashMap<String, HashSet<String>>>,
    idle: RwLock<HashMap<String, bool>>,
    activity: Mutex<HashMap<String, Activity>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn target_add(&self, host: &str, target: &str) -> anyhow::Result<()> {
        let mut targets = self.targets.write().await;
        targets
            .entry(host.to_string())
            .or_default()
            .insert(target.to_string());

        // A freshly routed host gets a full idle window.
        let mut activity = self.activity.lock().await;
        activity.entry(host.to_string()).or_insert(Activity {
            last_request: Utc::now(),
            active: 0,
        });
        Ok(())
    }

    async fn target_remove(&self, host: &str, target: &str) -> anyhow::Result<()> {
        let mut targets = self.targets.write().await;
        let Some(set) = targets.get_mut(host) else {
            return Ok(());
        };
        set.remove(target);
        if !set.is_empty() {
            return Ok(());
        }
        targets.remove(host);

        // Last target gone: drop the host unless it is idle or serving.
        let idle = self.idle.read().await;
        if idle.get(host).copied().unwrap_or(false) {
            return Ok(());
        }
        let mut activity = self.activity.lock().await;
        if activity.get(host).is_none_or(|a| a.active == 0) {
            activity.remove(host);
        }
        Ok(())
    }

    async fn target_list(&self, host: &str) -> anyhow::Result<Vec<String>> {
        let targets = self.targets.read().await;
        Ok(targets
            .get(host)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn idle_get(&self, host: &str) -> anyhow::Result<bool> {
        let idle = self.idle.read().await;
        Ok(idle.get(host).copied().unwrap_or(false))
    }

    async fn idle_set(&self, host: &str, value: bool) -> anyhow::Result<()> {
        let mut idle = self.idle.write().await;
        if value {
            idle.insert(host.to_string(), true);
        } else {
            idle.remove(host);
        }
        Ok(())
    }

    async fn request_begin(&self, host: &str) -> anyhow::Result<()> {
        let mut activity = self.activity.lock().await;
        let entry = activity.entry(host.to_string()).or_insert(Activity {
            last_request: Utc::now(),
            active: 0,
        });
        entry.last_request = Utc::now();
        entry.active += 1;
        Ok(())
    }

    async fn request_end(&self, host: &str) -> anyhow::Result<()> {
        let mut activity = self.activity.lock().await;
        if let Some(entry) = activity.get_mut(host) {
            entry.last_request = Utc::now();
            entry.active = entry.active.saturating_sub(1);
        }
        Ok(())
    }

    async fn activity_get(&self, host: &str) -> anyhow::Result<Option<Activity>> {
        let activity = self.activity.lock().await;
        Ok(activity.get(host).copied())
    }

    async fn idle_ready(&self, cutoff: DateTime<Utc>) -> anyhow::Result<Vec<String>> {
        let targets = self.targets.read().await;
        let idle = self.idle.read().await;
        let activity = self.activity.lock().await;

        Ok(targets
            .iter()
            .filter(|(_, set)| !set.is_empty())
            .filter(|(host, _)| !idle.get(host.as_str()).copied().unwrap_or(false))
            .filter(|(host, _)| {
                activity
                    .get(host.as_str())
                    .is_none_or(|a| a.last_request < cutoff)
            })
            .map(|(host, _)| host.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::BTreeSet;

    #[tokio::test]
    async fn test_target_add_is_idempotent() {
        let store = MemoryStorage::new();
        store.target_add("a.example.com", "http://web.app.svc.cluster.local:80").await.unwrap();
        store.target_add("a.example.com", "http://web.app.svc.cluster.local:80").await.unwrap();

        let list = store.target_list("a.example.com").await.unwrap();
        assert_eq!(list.len(), 1);
    }

    #[tokio::test]
    async fn test_remove_absent_target_is_noop() {
        let store = MemoryStorage::new();
        store.target_remove("nobody.example.com", "http://x:80").await.unwrap();
        store.target_add("a.example.com", "http://x:80").await.unwrap();
        store.target_remove("a.example.com", "http://y:80").await.unwrap();
        assert_eq!(store.target_list("a.example.com").await.unwrap(), vec!["http://x:80"]);
    }

    #[tokio::test]
    async fn test_request_end_does_not_underflow() {
        let store = MemoryStorage::new();
        store.request_end("a.example.com").await.unwrap();
        assert!(store.activity_get("a.example.com").await.unwrap().is_none());

        store.request_begin("a.example.com").await.unwrap();
        store.request_end("a.example.com").await.unwrap();
        store.request_end("a.example.com").await.unwrap();
        let activity = store.activity_get("a.example.com").await.unwrap().unwrap();
        assert_eq!(activity.active, 0);
    }

    #[tokio::test]
    async fn test_idle_flag_last_write_wins() {
        let store = MemoryStorage::new();
        assert!(!store.idle_get("a.example.com").await.unwrap());
        store.idle_set("a.example.com", true).await.unwrap();
        assert!(store.idle_get("a.example.com").await.unwrap());
        store.idle_set("a.example.com", false).await.unwrap();
        assert!(!store.idle_get("a.example.com").await.unwrap());
    }

    #[tokio::test]
    async fn test_idle_ready_filters() {
        let store = MemoryStorage::new();
        store.target_add("old.example.com", "http://x:80").await.unwrap();
        store.target_add("idle.example.com", "http://x:80").await.unwrap();
        store.idle_set("idle.example.com", true).await.unwrap();
        // Activity but no targets: never eligible.
        store.request_begin("orphan.example.com").await.unwrap();
        store.request_end("orphan.example.com").await.unwrap();

        let future_cutoff = Utc::now() + chrono::Duration::seconds(5);
        let ready = store.idle_ready(future_cutoff).await.unwrap();
        assert_eq!(ready, vec!["old.example.com".to_string()]);

        let past_cutoff = Utc::now() - chrono::Duration::minutes(60);
        assert!(store.idle_ready(past_cutoff).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_recent_request_defers_idling() {
        let store = MemoryStorage::new();
        store.target_add("a.example.com", "http://x:80").await.unwrap();
        let cutoff = Utc::now() + chrono::Duration::milliseconds(1);
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        store.request_begin("a.example.com").await.unwrap();
        assert!(store.idle_ready(cutoff).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_last_target_removal_drops_host() {
        let store = MemoryStorage::new();
        store.target_add("a.example.com", "http://x:80").await.unwrap();
        store.target_remove("a.example.com", "http://x:80").await.unwrap();
        assert!(store.target_list("a.example.com").await.unwrap().is_empty());
        assert!(store.activity_get("a.example.com").await.unwrap().is_none());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Add(u8, u8),
        Remove(u8, u8),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u8..3, 0u8..4).prop_map(|(h, t)| Op::Add(h, t)),
            (0u8..3, 0u8..4).prop_map(|(h, t)| Op::Remove(h, t)),
        ]
    }

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
    }

    proptest! {
        #[test]
        fn prop_target_list_matches_model(ops in proptest::collection::vec(op_strategy(), 0..64)) {
            let rt = runtime();
            rt.block_on(async {
                let store = MemoryStorage::new();
                let mut model: Vec<BTreeSet<String>> = vec![BTreeSet::new(); 3];
                for op in &ops {
                    match op {
                        Op::Add(h, t) => {
                            let target = format!("http://t{}:80", t);
                            store.target_add(&format!("h{}", h), &target).await.unwrap();
                            model[*h as usize].insert(target);
                        }
                        Op::Remove(h, t) => {
                            let target = format!("http://t{}:80", t);
                            store.target_remove(&format!("h{}", h), &target).await.unwrap();
                            model[*h as usize].remove(&target);
                        }
                    }
                }
                for (h, expected) in model.iter().enumerate() {
                    let got: BTreeSet<String> = store
                        .target_list(&format!("h{}", h))
                        .await
                        .unwrap()
                        .into_iter()
                        .collect();
                    assert_eq!(&got, expected);
                }
            });
        }

        #[test]
        fn prop_balanced_requests_leave_zero_active(n in 1usize..32, interleave in any::<bool>()) {
            let rt = runtime();
            rt.block_on(async {
                let store = MemoryStorage::new();
                if interleave {
                    for _ in 0..n {
                        store.request_begin("h").await.unwrap();
                        store.request_end("h").await.unwrap();
                    }
                } else {
                    for _ in 0..n {
                        store.request_begin("h").await.unwrap();
                    }
                    assert_eq!(store.activity_get("h").await.unwrap().unwrap().active, n as u64);
                    for _ in 0..n {
                        store.request_end("h").await.unwrap();
                    }
                }
                assert_eq!(store.activity_get("h").await.unwrap().unwrap().active, 0);
            });
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_begin_end_balances() {
        let store = std::sync::Arc::new(MemoryStorage::new());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..50 {
                    store.request_begin("busy.example.com").await.unwrap();
                    tokio::task::yield_now().await;
                    store.request_end("busy.example.com").await.unwrap();
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        let activity = store.activity_get("busy.example.com").await.unwrap().unwrap();
        assert_eq!(activity.active, 0);
    }
}
