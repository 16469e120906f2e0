//! etcd v3 store backend.
//!
//! The cluster layout is directory-shaped; etcd v3 has a flat keyspace, so
//! directories are emulated: `set_dir` writes a marker key `<key>/` and
//! `list` prefix-scans for the marker and the children beneath it. The
//! configured root prefix is applied here and nowhere else.

use super::{BootStore, Result, StoreError, OP_TIMEOUT};
use async_trait::async_trait;
use etcd_client::{Client, GetOptions};
use std::collections::BTreeSet;
use std::future::Future;
use tokio::time::timeout;

pub struct EtcdStore {
    client: Client,
    prefix: String,
}

impl EtcdStore {
    /// `prefix` roots every key, e.g. `anvil`.
    pub fn new(client: Client, prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        Self {
            client,
            prefix: prefix.trim_matches('/').to_string(),
        }
    }

    fn prefixify(&self, key: &str) -> String {
        format!("{}/{}", self.prefix, key.trim_start_matches('/'))
    }

    async fn deadline<T, F>(op: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, etcd_client::Error>>,
    {
        match timeout(OP_TIMEOUT, op).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(StoreError::Transport(err.to_string())),
            Err(_) => Err(StoreError::Transport(format!(
                "operation exceeded the {}s deadline",
                OP_TIMEOUT.as_secs()
            ))),
        }
    }
}

#[async_trait]
impl BootStore for EtcdStore {
    async fn get(&self, key: &str) -> Result<String> {
        let full = self.prefixify(key);
        let mut client = self.client.clone();
        let resp = Self::deadline(client.get(full.as_str(), None)).await?;
        let kv = resp
            .kvs()
            .first()
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        kv.value_str()
            .map(str::to_string)
            .map_err(|err| StoreError::Transport(err.to_string()))
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let full = self.prefixify(key);
        let mut client = self.client.clone();
        Self::deadline(client.put(full, value, None)).await?;
        Ok(())
    }

    async fn set_dir(&self, key: &str) -> Result<()> {
        let marker = format!("{}/", self.prefixify(key));
        let mut client = self.client.clone();
        Self::deadline(client.put(marker, "", None)).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let full = self.prefixify(key);
        let mut client = self.client.clone();
        let resp = Self::deadline(client.delete(full, None)).await?;
        if resp.deleted() == 0 {
            return Err(StoreError::NotFound(key.to_string()));
        }
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let dir = format!("{}/", self.prefixify(prefix));
        let mut client = self.client.clone();
        let resp =
            Self::deadline(client.get(dir.as_str(), Some(GetOptions::new().with_prefix()))).await?;
        if resp.kvs().is_empty() {
            return Err(StoreError::NotFound(prefix.to_string()));
        }

        let mut children = BTreeSet::new();
        for kv in resp.kvs() {
            let key = kv
                .key_str()
                .map_err(|err| StoreError::Transport(err.to_string()))?;
            if let Some(name) = child_name(&dir, key) {
                children.insert(name.to_string());
            }
        }
        Ok(children.into_iter().collect())
    }
}

/// First path segment of `key` below `dir`, or None for the directory
/// marker itself.
fn child_name<'a>(dir: &str, key: &'a str) -> Option<&'a str> {
    let rest = key.strip_prefix(dir)?;
    let first = rest.split('/').next().unwrap_or_default();
    (!first.is_empty()).then_some(first)
}
