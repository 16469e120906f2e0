//! Typed access to the machines tree.

use crate::node::MACHINES_DIR;
use crate::{Clock, InitialConfigError, MacAddr, Node, RegistryError, SystemClock};
use anvil_store::BootStore;
use serde::Deserialize;
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

const OS_VERSION_KEY: &str = "coreos-version";

type Result<T> = std::result::Result<T, RegistryError>;

/// Typed accessors over the store for machines, their attributes, and
/// their flags.
#[derive(Clone)]
pub struct NodeRegistry {
    store: Arc<dyn BootStore>,
    clock: Arc<dyn Clock>,
}

impl NodeRegistry {
    pub fn new(store: Arc<dyn BootStore>) -> Self {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    pub fn with_clock(store: Arc<dyn BootStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    pub(crate) fn handle(&self, mac: MacAddr) -> Node {
        Node::new(mac, Arc::clone(&self.store), Arc::clone(&self.clock))
    }

    /// Ensure the machines directory exists. Called once at startup.
    pub async fn ensure_layout(&self) -> Result<()> {
        Ok(self.store.set_dir(MACHINES_DIR).await?)
    }

    /// Every known node. A child entry that does not parse back into a MAC
    /// is store corruption and fails the whole enumeration.
    pub async fn list_nodes(&self) -> Result<Vec<Node>> {
        let children = self.store.list(MACHINES_DIR).await?;
        let mut nodes = Vec::with_capacity(children.len());
        for child in children {
            let mac =
                MacAddr::from_node_name(&child).map_err(|_| RegistryError::Corrupt {
                    key: format!("{MACHINES_DIR}/{child}"),
                    reason: "directory entry is not a node name".to_string(),
                })?;
            nodes.push(self.handle(mac));
        }
        Ok(nodes)
    }

    pub async fn get_node(&self, mac: MacAddr) -> Result<Option<Node>> {
        let dir = format!("{MACHINES_DIR}/{}", mac.node_name());
        match self.store.list(&dir).await {
            Ok(_) => Ok(Some(self.handle(mac))),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Create a node bound to `ip`, writing the built-in fields and the
    /// initial `state` flag. The allocator serialises concurrent creators;
    /// the snapshot re-check here means racing callers still observe at
    /// most one success.
    pub async fn create_node(&self, mac: MacAddr, ip: Ipv4Addr) -> Result<Node> {
        for node in self.list_nodes().await? {
            if node.mac() == mac {
                return Err(RegistryError::AlreadyExists(mac));
            }
            if node.ip().await? == ip {
                return Err(RegistryError::IpInUse(ip));
            }
        }

        let node = self.handle(mac);
        self.store
            .set_dir(&format!("{MACHINES_DIR}/{}", node.name()))
            .await?;
        node.initialise(ip).await?;
        info!(mac = %mac, ip = %ip, "registered node");
        Ok(node)
    }

    /// Remove a node and every field and flag beneath it. Only the
    /// eviction policy deletes nodes; the DHCP path never does.
    pub async fn delete_node(&self, node: &Node) -> Result<()> {
        let dir = format!("{MACHINES_DIR}/{}", node.name());
        for child in self.store.list(&dir).await? {
            self.store.delete(&format!("{dir}/{child}")).await?;
        }
        self.store.delete(&format!("{dir}/")).await?;
        Ok(())
    }

    /// The store-held OS image version.
    pub async fn os_version(&self) -> Result<String> {
        Ok(self.store.get(OS_VERSION_KEY).await?)
    }

    /// Read the store-held OS version, seeding it from the initial
    /// configuration when the key is absent. Returns the effective
    /// version.
    pub async fn ensure_os_version(&self, initial: &str) -> Result<String> {
        match self.store.get(OS_VERSION_KEY).await {
            Ok(version) => Ok(version),
            Err(err) if err.is_not_found() => {
                self.store.set(OS_VERSION_KEY, initial).await?;
                info!(version = initial, "seeded OS version");
                Ok(initial.to_string())
            }
            Err(err) => Err(err.into()),
        }
    }
}

/// `initial.yaml` at the workspace root, read once at startup.
#[derive(Debug, Deserialize)]
pub struct InitialConfig {
    #[serde(rename = "coreos-version")]
    pub coreos_version: String,
}

impl InitialConfig {
    pub fn load(workspace: &Path) -> std::result::Result<Self, InitialConfigError> {
        let path = workspace.join("initial.yaml");
        let data = std::fs::read_to_string(&path).map_err(|source| InitialConfigError::Read {
            path: path.clone(),
            source,
        })?;
        let config: Self =
            serde_yaml::from_str(&data).map_err(|source| InitialConfigError::Parse { path, source })?;
        if config.coreos_version.is_empty() {
            return Err(InitialConfigError::MissingVersion);
        }
        Ok(config)
    }
}
