//! Lease allocation policy.
//!
//! The allocator is the only component that mutates address bindings. The
//! `assign_lock` serialises every read-then-write sequence against the
//! store, which has no transactions; `data_lock` covers pure metadata
//! refreshes. Lock order when both are needed: assign first, then data.

use crate::{Clock, LeaseError, MacAddr, Node, NodeRegistry};
use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};

type Result<T> = std::result::Result<T, LeaseError>;

/// How long a declined address stays out of circulation.
const DECLINE_COOLDOWN: Duration = Duration::from_secs(600);

/// The range of addresses the allocator may hand out:
/// `[start, start + range)`.
#[derive(Debug, Clone, Copy)]
pub struct LeasePool {
    start: Ipv4Addr,
    range: u32,
}

impl LeasePool {
    pub fn new(start: Ipv4Addr, range: u32) -> Self {
        Self { start, range }
    }

    pub fn start(&self) -> Ipv4Addr {
        self.start
    }

    pub fn range(&self) -> u32 {
        self.range
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        let offset = u32::from(ip).wrapping_sub(u32::from(self.start));
        offset < self.range
    }

    fn iter(&self) -> impl Iterator<Item = Ipv4Addr> + '_ {
        (0..self.range).map(|i| Ipv4Addr::from(u32::from(self.start).wrapping_add(i)))
    }
}

/// Chooses an address for a MAC against the current registry snapshot and
/// serialises every binding mutation.
pub struct LeaseAllocator {
    registry: NodeRegistry,
    pool: LeasePool,
    clock: Arc<dyn Clock>,
    reclaim_after: Option<Duration>,
    assign_lock: Mutex<()>,
    data_lock: Mutex<()>,
    quarantined: StdMutex<HashMap<Ipv4Addr, i64>>,
}

impl LeaseAllocator {
    pub fn new(registry: NodeRegistry, pool: LeasePool) -> Self {
        let clock = registry.clock();
        Self {
            registry,
            pool,
            clock,
            reclaim_after: None,
            assign_lock: Mutex::new(()),
            data_lock: Mutex::new(()),
            quarantined: StdMutex::new(HashMap::new()),
        }
    }

    /// Reclaim the address of a node idle for longer than `window` once
    /// the pool is exhausted. Off by default: every discover from a new
    /// MAC then consumes a pool slot permanently.
    pub fn with_reclaim_after(mut self, window: Duration) -> Self {
        self.reclaim_after = Some(window);
        self
    }

    pub fn pool(&self) -> LeasePool {
        self.pool
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    /// Answer a discover: re-offer the existing binding for a known MAC,
    /// or bind the first free address of the pool, scanning upward from
    /// the start.
    pub async fn assign(&self, mac: MacAddr) -> Result<Ipv4Addr> {
        let _assign = self.assign_lock.lock().await;

        let bindings = self.snapshot().await?;
        let mut taken = HashSet::with_capacity(bindings.len());
        for (node, ip) in &bindings {
            if node.mac() == mac {
                self.refresh_binding(node, *ip).await;
                return Ok(*ip);
            }
            taken.insert(*ip);
        }

        for candidate in self.pool.iter() {
            if taken.contains(&candidate) || self.is_quarantined(candidate) {
                continue;
            }
            self.registry.create_node(mac, candidate).await?;
            return Ok(candidate);
        }

        if let Some(freed) = self.try_reclaim(&bindings).await? {
            self.registry.create_node(mac, freed).await?;
            return Ok(freed);
        }

        warn!(mac = %mac, "lease pool exhausted");
        Err(LeaseError::PoolFull)
    }

    /// Answer a request: reaffirm the exact binding, reject a half-match,
    /// or adopt a machine unknown on both sides.
    pub async fn request(&self, mac: MacAddr, requested: Ipv4Addr) -> Result<Ipv4Addr> {
        let _assign = self.assign_lock.lock().await;

        let mut mac_known = false;
        let mut ip_known = false;
        for (node, ip) in self.snapshot().await? {
            let mac_match = node.mac() == mac;
            let ip_match = ip == requested;
            if mac_match && ip_match {
                self.refresh_binding(&node, ip).await;
                return Ok(requested);
            }
            mac_known = mac_known || mac_match;
            ip_known = ip_known || ip_match;
        }

        if mac_known || ip_known {
            return Err(LeaseError::Conflict { mac, ip: requested });
        }

        // Unknown on both sides: adopt the machine at the address it asked
        // for, even outside the pool. Compatibility behavior; see
        // DESIGN.md.
        self.registry.create_node(mac, requested).await?;
        Ok(requested)
    }

    /// A released machine keeps its binding; only the interaction
    /// timestamp is recorded.
    pub async fn release(&self, mac: MacAddr) -> Result<()> {
        let _data = self.data_lock.lock().await;
        if let Some(node) = self.registry.get_node(mac).await? {
            node.touch().await?;
        }
        Ok(())
    }

    /// A declined address goes into quarantine for a cooldown so the
    /// scanner stops offering it.
    pub async fn decline(&self, mac: MacAddr, ip: Option<Ipv4Addr>) -> Result<()> {
        if let Some(ip) = ip {
            let until = self.clock.now_nanos() + DECLINE_COOLDOWN.as_nanos() as i64;
            let mut quarantined = self.quarantined.lock().unwrap_or_else(|e| e.into_inner());
            quarantined.insert(ip, until);
            info!(mac = %mac, ip = %ip, "address quarantined after decline");
        }
        let _data = self.data_lock.lock().await;
        if let Some(node) = self.registry.get_node(mac).await? {
            node.touch().await?;
        }
        Ok(())
    }

    /// Registry view the decisions are made against: every node with its
    /// current address.
    async fn snapshot(&self) -> Result<Vec<(Node, Ipv4Addr)>> {
        let nodes = self.registry.list_nodes().await?;
        let mut bindings = Vec::with_capacity(nodes.len());
        for node in nodes {
            let ip = node.ip().await?;
            bindings.push((node, ip));
        }
        Ok(bindings)
    }

    /// Best-effort metadata refresh for an already-decided binding. A
    /// store failure here is logged and does not withdraw the address.
    async fn refresh_binding(&self, node: &Node, ip: Ipv4Addr) {
        let _data = self.data_lock.lock().await;
        if let Err(err) = node.rebind(ip).await {
            warn!(mac = %node.mac(), error = %err, "failed to refresh lease metadata");
        }
    }

    fn is_quarantined(&self, ip: Ipv4Addr) -> bool {
        let now = self.clock.now_nanos();
        let mut quarantined = self.quarantined.lock().unwrap_or_else(|e| e.into_inner());
        match quarantined.get(&ip) {
            Some(&until) if until > now => true,
            Some(_) => {
                quarantined.remove(&ip);
                false
            }
            None => false,
        }
    }

    /// With reclamation enabled and the pool exhausted, free the address
    /// of the least-recently-seen node that has been idle past the
    /// window.
    async fn try_reclaim(&self, bindings: &[(Node, Ipv4Addr)]) -> Result<Option<Ipv4Addr>> {
        let Some(window) = self.reclaim_after else {
            return Ok(None);
        };
        let now = self.clock.now_nanos();

        let mut stalest: Option<(i64, &Node, Ipv4Addr)> = None;
        for (node, ip) in bindings {
            if !self.pool.contains(*ip) {
                continue;
            }
            let last_seen = node.last_seen_nanos().await?;
            if now.saturating_sub(last_seen) < window.as_nanos() as i64 {
                continue;
            }
            if stalest.map_or(true, |(seen, _, _)| last_seen < seen) {
                stalest = Some((last_seen, node, *ip));
            }
        }

        let Some((_, node, ip)) = stalest else {
            return Ok(None);
        };
        info!(mac = %node.mac(), ip = %ip, "reclaiming idle lease");
        self.registry.delete_node(node).await?;
        Ok(Some(ip))
    }
}
