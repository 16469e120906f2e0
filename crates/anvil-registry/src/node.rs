//! Store-backed node handle.
//!
//! A node is one client machine. Its MAC is the primary key; everything
//! else lives under `machines/<name>/` in the store. Built-in fields carry
//! a leading underscore to keep them apart from user flags in the same
//! directory.

use crate::{Clock, MacAddr, RegistryError};
use anvil_store::BootStore;
use chrono::{DateTime, Utc};
use std::net::Ipv4Addr;
use std::sync::Arc;

pub(crate) const MACHINES_DIR: &str = "machines";

const IP_FIELD: &str = "_IP";
const MAC_FIELD: &str = "_mac";
const FIRST_SEEN_FIELD: &str = "_first_seen";
const LAST_SEEN_FIELD: &str = "_last_seen";

const STATE_FLAG: &str = "state";
const STATE_UNKNOWN: &str = "unknown";

type Result<T> = std::result::Result<T, RegistryError>;

/// Accessor for one machine's record in the store.
#[derive(Clone)]
pub struct Node {
    mac: MacAddr,
    store: Arc<dyn BootStore>,
    clock: Arc<dyn Clock>,
}

impl Node {
    pub(crate) fn new(mac: MacAddr, store: Arc<dyn BootStore>, clock: Arc<dyn Clock>) -> Self {
        Self { mac, store, clock }
    }

    pub fn mac(&self) -> MacAddr {
        self.mac
    }

    /// Directory name in the store, `node` plus the bare hex MAC.
    pub fn name(&self) -> String {
        self.mac.node_name()
    }

    fn field_key(&self, field: &str) -> String {
        format!("{MACHINES_DIR}/{}/{}", self.name(), field)
    }

    /// Currently assigned address. Legacy records may carry a CIDR suffix;
    /// it is stripped on read.
    pub async fn ip(&self) -> Result<Ipv4Addr> {
        let key = self.field_key(IP_FIELD);
        let raw = self.store.get(&key).await?;
        let text = raw.split_once('/').map_or(raw.as_str(), |(ip, _)| ip);
        text.parse().map_err(|_| RegistryError::Corrupt {
            key,
            reason: format!("not an IPv4 address: {raw}"),
        })
    }

    pub async fn first_seen(&self) -> Result<DateTime<Utc>> {
        let nanos = self.read_nanos(FIRST_SEEN_FIELD).await?;
        Ok(DateTime::from_timestamp_nanos(nanos))
    }

    pub async fn last_seen(&self) -> Result<DateTime<Utc>> {
        let nanos = self.last_seen_nanos().await?;
        Ok(DateTime::from_timestamp_nanos(nanos))
    }

    pub(crate) async fn last_seen_nanos(&self) -> Result<i64> {
        self.read_nanos(LAST_SEEN_FIELD).await
    }

    async fn read_nanos(&self, field: &str) -> Result<i64> {
        let key = self.field_key(field);
        let raw = self.store.get(&key).await?;
        raw.parse().map_err(|_| RegistryError::Corrupt {
            key,
            reason: format!("not a nanosecond timestamp: {raw}"),
        })
    }

    /// Record a successful interaction now.
    pub async fn touch(&self) -> Result<()> {
        let now = self.clock.now_nanos().to_string();
        Ok(self.store.set(&self.field_key(LAST_SEEN_FIELD), &now).await?)
    }

    /// Update the binding and the interaction timestamp together.
    pub async fn rebind(&self, ip: Ipv4Addr) -> Result<()> {
        self.store
            .set(&self.field_key(IP_FIELD), &ip.to_string())
            .await?;
        self.touch().await
    }

    pub async fn get_flag(&self, key: &str) -> Result<String> {
        Ok(self.store.get(&self.field_key(key)).await?)
    }

    pub async fn set_flag(&self, key: &str, value: &str) -> Result<()> {
        Ok(self.store.set(&self.field_key(key), value).await?)
    }

    pub async fn delete_flag(&self, key: &str) -> Result<()> {
        Ok(self.store.delete(&self.field_key(key)).await?)
    }

    /// Read a flag and remove it in one call.
    pub async fn get_and_delete_flag(&self, key: &str) -> Result<String> {
        Ok(self.store.get_and_delete(&self.field_key(key)).await?)
    }

    /// Write the built-in fields of a freshly created record. The textual
    /// `_mac` field is never read back; lookups key off the directory name.
    pub(crate) async fn initialise(&self, ip: Ipv4Addr) -> Result<()> {
        self.store
            .set(&self.field_key(IP_FIELD), &ip.to_string())
            .await?;
        self.store
            .set(&self.field_key(MAC_FIELD), &self.mac.to_string())
            .await?;
        self.store
            .set(
                &self.field_key(FIRST_SEEN_FIELD),
                &self.clock.now_nanos().to_string(),
            )
            .await?;
        self.touch().await?;
        self.set_flag(STATE_FLAG, STATE_UNKNOWN).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NodeRegistry;
    use anvil_store::MemoryStore;

    struct FixedClock(i64);

    impl Clock for FixedClock {
        fn now_nanos(&self) -> i64 {
            self.0
        }
    }

    const NOW: i64 = 1_700_000_000_000_000_000;

    fn test_registry() -> (Arc<MemoryStore>, NodeRegistry) {
        let store = Arc::new(MemoryStore::new());
        let registry = NodeRegistry::with_clock(
            Arc::clone(&store) as Arc<dyn BootStore>,
            Arc::new(FixedClock(NOW)),
        );
        (store, registry)
    }

    fn mac1() -> MacAddr {
        MacAddr::new([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x01])
    }

    #[tokio::test]
    async fn built_in_fields_after_creation() {
        let (store, registry) = test_registry();
        registry.ensure_layout().await.unwrap();
        let node = registry
            .create_node(mac1(), Ipv4Addr::new(10, 0, 0, 10))
            .await
            .unwrap();

        assert_eq!(node.ip().await.unwrap(), Ipv4Addr::new(10, 0, 0, 10));
        assert_eq!(node.first_seen().await.unwrap(), node.last_seen().await.unwrap());
        assert_eq!(node.get_flag("state").await.unwrap(), "unknown");
        assert_eq!(
            store.get("machines/nodeaabbccddee01/_mac").await.unwrap(),
            "aa:bb:cc:dd:ee:01"
        );
        assert_eq!(
            store
                .get("machines/nodeaabbccddee01/_first_seen")
                .await
                .unwrap(),
            NOW.to_string()
        );
    }

    #[tokio::test]
    async fn ip_read_strips_legacy_cidr_suffix() {
        let (store, registry) = test_registry();
        store
            .set("machines/nodeaabbccddee01/_IP", "10.0.0.5/24")
            .await
            .unwrap();

        let node = registry.handle(mac1());
        assert_eq!(node.ip().await.unwrap(), Ipv4Addr::new(10, 0, 0, 5));
    }

    #[tokio::test]
    async fn unparseable_fields_surface_as_corrupt() {
        let (store, registry) = test_registry();
        store
            .set("machines/nodeaabbccddee01/_IP", "not-an-address")
            .await
            .unwrap();
        store
            .set("machines/nodeaabbccddee01/_last_seen", "yesterday")
            .await
            .unwrap();

        let node = registry.handle(mac1());
        assert!(matches!(
            node.ip().await,
            Err(RegistryError::Corrupt { .. })
        ));
        assert!(matches!(
            node.last_seen().await,
            Err(RegistryError::Corrupt { .. })
        ));
    }

    #[tokio::test]
    async fn flag_lifecycle() {
        let (_store, registry) = test_registry();
        registry.ensure_layout().await.unwrap();
        let node = registry
            .create_node(mac1(), Ipv4Addr::new(10, 0, 0, 10))
            .await
            .unwrap();

        node.set_flag("coreos-version", "1068.8.0").await.unwrap();
        assert_eq!(node.get_flag("coreos-version").await.unwrap(), "1068.8.0");

        let taken = node.get_and_delete_flag("coreos-version").await.unwrap();
        assert_eq!(taken, "1068.8.0");
        assert!(node.get_flag("coreos-version").await.is_err());

        node.set_flag("reboot", "requested").await.unwrap();
        node.delete_flag("reboot").await.unwrap();
        assert!(node.get_flag("reboot").await.is_err());
    }

    #[tokio::test]
    async fn rebind_updates_address_and_timestamp() {
        let (store, registry) = test_registry();
        registry.ensure_layout().await.unwrap();
        let node = registry
            .create_node(mac1(), Ipv4Addr::new(10, 0, 0, 10))
            .await
            .unwrap();

        node.rebind(Ipv4Addr::new(10, 0, 0, 12)).await.unwrap();
        assert_eq!(node.ip().await.unwrap(), Ipv4Addr::new(10, 0, 0, 12));
        assert_eq!(
            store
                .get("machines/nodeaabbccddee01/_last_seen")
                .await
                .unwrap(),
            NOW.to_string()
        );
    }
}
