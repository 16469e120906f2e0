//! In-memory store backend.
//!
//! Backs tests and development; mirrors the directory semantics the etcd
//! backend emulates, including the empty-versus-absent distinction on
//! `list`.

use super::{BootStore, Result, StoreError};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::RwLock;

pub struct MemoryStore {
    entries: RwLock<BTreeMap<String, String>>,
    dirs: RwLock<BTreeSet<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            dirs: RwLock::new(BTreeSet::new()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn poisoned<E: std::fmt::Display>(err: E) -> StoreError {
    StoreError::Transport(format!("lock poisoned: {err}"))
}

#[async_trait]
impl BootStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<String> {
        let entries = self.entries.read().map_err(poisoned)?;
        entries
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = self.entries.write().map_err(poisoned)?;
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn set_dir(&self, key: &str) -> Result<()> {
        let mut dirs = self.dirs.write().map_err(poisoned)?;
        dirs.insert(key.trim_end_matches('/').to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        {
            let mut entries = self.entries.write().map_err(poisoned)?;
            if entries.remove(key).is_some() {
                return Ok(());
            }
        }
        let mut dirs = self.dirs.write().map_err(poisoned)?;
        if dirs.remove(key.trim_end_matches('/')) {
            return Ok(());
        }
        Err(StoreError::NotFound(key.to_string()))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let prefix = prefix.trim_end_matches('/');
        let lead = format!("{prefix}/");
        let entries = self.entries.read().map_err(poisoned)?;
        let dirs = self.dirs.read().map_err(poisoned)?;

        let mut children = BTreeSet::new();
        for key in entries.keys().chain(dirs.iter()) {
            if let Some(rest) = key.strip_prefix(&lead) {
                let first = rest.split('/').next().unwrap_or_default();
                if !first.is_empty() {
                    children.insert(first.to_string());
                }
            }
        }

        if children.is_empty() && !dirs.contains(prefix) {
            return Err(StoreError::NotFound(prefix.to_string()));
        }
        Ok(children.into_iter().collect())
    }
}
