use slatedb::Db;
use slatedb::object_store::local::LocalFileSystem;
use slatedb::object_store::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Byte-keyed table on SlateDB over a local or mounted directory.
///
/// Backs both the external route table and the ACME certificate cache.
/// Clones share one database handle.
#[derive(Clone)]
pub struct KvStore {
    db: Db,
    root: Arc<str>,
}

fn slate_err(op: &str, root: &str, e: impl std::fmt::Display) -> anyhow::Error {
    anyhow::anyhow!("kv {} on {}: {}", op, root, e)
}

impl KvStore {
    /// Open the table rooted at `root`, creating the directory if needed.
    pub async fn open(root: &str) -> anyhow::Result<Self> {
        std::fs::create_dir_all(root).map_err(|e| slate_err("mkdir", root, e))?;
        let objects = LocalFileSystem::new_with_prefix(root).map_err(|e| slate_err("mount", root, e))?;
        let db = Db::open(Path::from("/"), Arc::new(objects))
            .await
            .map_err(|e| slate_err("open", root, e))?;

        info!(root = %root, "Opened kv table");
        Ok(Self {
            db,
            root: Arc::from(root),
        })
    }

    pub async fn put(&self, key: &str, value: &[u8]) -> anyhow::Result<()> {
        self.db
            .put(key.as_bytes(), value)
            .await
            .map(|_| ())
            .map_err(|e| slate_err("put", &self.root, e))
    }

    /// `None` when the key is absent.
    pub async fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        let value = self
            .db
            .get(key.as_bytes())
            .await
            .map_err(|e| slate_err("get", &self.root, e))?;
        Ok(value.map(|b| b.to_vec()))
    }

    pub async fn delete(&self, key: &str) -> anyhow::Result<()> {
        self.db
            .delete(key.as_bytes())
            .await
            .map(|_| ())
            .map_err(|e| slate_err("delete", &self.root, e))
    }

    /// Every `(key, value)` whose key starts with `prefix`, in key order.
    pub async fn list_prefix(&self, prefix: &str) -> anyhow::Result<Vec<(String, Vec<u8>)>> {
        let mut iter = self
            .db
            .scan_prefix(prefix.as_bytes())
            .await
            .map_err(|e| slate_err("scan", &self.root, e))?;

        let mut rows = Vec::new();
        while let Some(kv) = iter
            .next()
            .await
            .map_err(|e| slate_err("scan", &self.root, e))?
        {
            rows.push((String::from_utf8_lossy(&kv.key).into_owned(), kv.value.to_vec()));
        }
        debug!(prefix = %prefix, rows = rows.len(), "kv scan");
        Ok(rows)
    }

    /// Flush and close. Other clones must not be used afterwards.
    pub async fn close(self) -> anyhow::Result<()> {
        info!(root = %self.root, "Closing kv table");
        self.db
            .close()
            .await
            .map_err(|e| slate_err("close", &self.root, e))
    }
}
