//! Persistent key/value capability for the boot coordinator.
//!
//! All cluster state lives behind the [`BootStore`] trait: a hierarchical
//! key/value surface with directory semantics, rooted at a configured
//! prefix. [`EtcdStore`] talks to the backing etcd cluster; [`MemoryStore`]
//! backs tests and development.

mod etcd;
mod memory;

pub use etcd::EtcdStore;
pub use memory::MemoryStore;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Deadline applied to every backend operation.
pub const OP_TIMEOUT: Duration = Duration::from_secs(3);

/// Errors from store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The key or directory does not exist. A data condition, not a
    /// failure.
    #[error("key not found: {0}")]
    NotFound(String),

    /// The backing store is unreachable, slow, or rejected the operation.
    #[error("store transport error: {0}")]
    Transport(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Hierarchical key/value store used for all persistent cluster state.
///
/// Keys are `/`-separated paths relative to the store's root prefix.
/// `list` enumerates immediate children only; a missing prefix is
/// `NotFound`, an existing empty directory is an empty vec.
#[async_trait]
pub trait BootStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<String>;

    /// Create or overwrite a key.
    async fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Ensure a directory-like prefix exists.
    async fn set_dir(&self, key: &str) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Names of the immediate children under `prefix`.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Read a key and remove it. Not atomic; the read value wins.
    async fn get_and_delete(&self, key: &str) -> Result<String> {
        let value = self.get(key).await?;
        self.delete(key).await?;
        Ok(value)
    }
}
