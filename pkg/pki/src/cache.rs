use async_trait::async_trait;
use dashmap::DashMap;

use pkg_constants::state::AUTOCERT_KEY_PREFIX;
use pkg_storage::kv::KvStore;

/// Autocert-style key-value cache for ACME material. Keys are opaque.
#[async_trait]
pub trait CertCache: Send + Sync {
    async fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>>;
    async fn put(&self, key: &str, data: &[u8]) -> anyhow::Result<()>;
    async fn delete(&self, key: &str) -> anyhow::Result<()>;
}

/// Cache kept in process memory; material is lost on restart.
#[derive(Default)]
pub struct MemoryCertCache {
    entries: DashMap<String, Vec<u8>>,
}

impl MemoryCertCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CertCache for MemoryCertCache {
    async fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(self.entries.get(key).map(|v| v.clone()))
    }

    async fn put(&self, key: &str, data: &[u8]) -> anyhow::Result<()> {
        self.entries.insert(key.to_string(), data.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        self.entries.remove(key);
        Ok(())
    }
}

/// Cache persisted in a SlateDB table under `/autocert/`.
#[derive(Clone)]
pub struct KvCertCache {
    kv: KvStore,
}

impl KvCertCache {
    pub fn new(kv: KvStore) -> Self {
        Self { kv }
    }

    fn key(key: &str) -> String {
        format!("{}{}", AUTOCERT_KEY_PREFIX, key)
    }
}

#[async_trait]
impl CertCache for KvCertCache {
    async fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        self.kv.get(&Self::key(key)).await
    }

    async fn put(&self, key: &str, data: &[u8]) -> anyhow::Result<()> {
        self.kv.put(&Self::key(key), data).await
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        self.kv.delete(&Self::key(key)).await
    }
}
