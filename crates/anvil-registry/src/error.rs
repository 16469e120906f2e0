//! Error types for the registry and allocator.

use crate::MacAddr;
use anvil_store::StoreError;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use thiserror::Error;

/// Errors from the node registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A stored field cannot be parsed. Surfaced for the admin layer;
    /// never auto-repaired.
    #[error("corrupt store field {key}: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("invalid MAC address: {0}")]
    InvalidMac(String),

    #[error("node {0} is already registered")]
    AlreadyExists(MacAddr),

    #[error("address {0} is already bound")]
    IpInUse(Ipv4Addr),
}

/// Errors from the lease allocator.
#[derive(Debug, Error)]
pub enum LeaseError {
    /// Every address in the pool is bound. The discover goes unanswered.
    #[error("lease pool exhausted")]
    PoolFull,

    /// The requested binding half-matches an existing one. The caller
    /// answers with a NAK.
    #[error("lease mismatch for {mac} requesting {ip}")]
    Conflict { mac: MacAddr, ip: Ipv4Addr },

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl LeaseError {
    /// True when the failure is the backing store, not a lease decision.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            LeaseError::Registry(RegistryError::Store(StoreError::Transport(_)))
        )
    }
}

/// Errors reading the workspace initial configuration.
#[derive(Debug, Error)]
pub enum InitialConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("initial configuration must name an OS version")]
    MissingVersion,
}
