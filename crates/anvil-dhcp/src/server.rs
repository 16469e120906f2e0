//! DHCP/PXE service: packet listener and per-message dispatch.
//!
//! Packet handling is stateless across packets; every decision reads the
//! registry through the allocator. Negative outcomes in the hot path all
//! collapse to "no reply" or a NAK at this boundary.

use crate::config::DhcpConfig;
use crate::error::{DhcpError, Result};
use crate::packet::{BootRequest, ReplyBuilder};
use anvil_registry::{LeaseAllocator, LeaseError};
use dhcproto::v4::{Message, MessageType};
use dhcproto::Encodable;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

const DHCP_SERVER_PORT: u16 = 67;
const DHCP_CLIENT_PORT: u16 = 68;

/// Bounds for the randomised lease duration, in hours. Spreading lease
/// expiry avoids synchronised renewals across a freshly booted fleet.
const MIN_LEASE_HOURS: u32 = 24;
const MAX_LEASE_HOURS: u32 = 48;

/// The DHCP service: one listener, stateless dispatch, lease decisions
/// delegated to the allocator.
pub struct DhcpService {
    config: DhcpConfig,
    allocator: Arc<LeaseAllocator>,
    lease_rng: Mutex<StdRng>,
}

impl DhcpService {
    pub fn new(config: DhcpConfig, allocator: Arc<LeaseAllocator>) -> Self {
        Self::with_rng(config, allocator, StdRng::from_entropy())
    }

    /// Service with a caller-supplied RNG, for deterministic lease times.
    pub fn with_rng(config: DhcpConfig, allocator: Arc<LeaseAllocator>, rng: StdRng) -> Self {
        Self {
            config,
            allocator,
            lease_rng: Mutex::new(rng),
        }
    }

    /// Run the listener until shutdown. A socket that cannot be set up is
    /// fatal; the caller decides the exit code.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let socket = self.create_socket()?;
        info!(
            port = DHCP_SERVER_PORT,
            interface = self.config.interface.as_deref().unwrap_or("*"),
            server_ip = %self.config.server_ip,
            "DHCP service listening"
        );

        let mut buf = [0u8; 1500];
        loop {
            tokio::select! {
                result = socket.recv_from(&mut buf) => {
                    match result {
                        Ok((len, _src)) => {
                            if let Some((payload, dest)) = self.handle_packet(&buf[..len]).await {
                                if let Err(err) = socket.send_to(&payload, dest).await {
                                    error!(error = %err, dest = %dest, "failed to send reply");
                                }
                            }
                        }
                        Err(err) => {
                            error!(error = %err, "error receiving packet");
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("DHCP service shutting down");
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Set up the UDP socket: address reuse and broadcast before bind,
    /// optional interface binding, then hand over to tokio.
    fn create_socket(&self) -> Result<UdpSocket> {
        let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, DHCP_SERVER_PORT);
        let bind_failed = |source| DhcpError::BindFailed {
            addr: bind_addr.into(),
            source,
        };

        let socket = socket2::Socket::new(
            socket2::Domain::IPV4,
            socket2::Type::DGRAM,
            Some(socket2::Protocol::UDP),
        )
        .map_err(bind_failed)?;

        socket.set_reuse_address(true).ok();
        socket.set_broadcast(true).ok();

        if let Some(interface) = &self.config.interface {
            bind_to_device(&socket, interface)?;
        }

        socket.bind(&bind_addr.into()).map_err(bind_failed)?;
        socket.set_nonblocking(true).map_err(bind_failed)?;

        let std_socket: std::net::UdpSocket = socket.into();
        UdpSocket::from_std(std_socket).map_err(bind_failed)
    }

    /// Handle one datagram: the encoded reply and where to send it, if a
    /// reply is due at all.
    pub async fn handle_packet(&self, data: &[u8]) -> Option<(Vec<u8>, SocketAddr)> {
        let request = match BootRequest::parse(data) {
            Ok(request) => request,
            Err(err) => {
                debug!(error = %err, "ignoring unparseable packet");
                return None;
            }
        };

        let reply = self.handle_message(&request).await?;
        match reply.to_vec() {
            Ok(payload) => Some((payload, reply_destination(&request))),
            Err(err) => {
                error!(error = %err, "failed to encode reply");
                None
            }
        }
    }

    /// Decide the reply for one message. All state lives in the registry.
    pub async fn handle_message(&self, request: &BootRequest) -> Option<Message> {
        match request.message_type {
            MessageType::Discover => self.handle_discover(request).await,
            MessageType::Request => self.handle_request(request).await,
            MessageType::Release => {
                if let Err(err) = self.allocator.release(request.mac).await {
                    debug!(mac = %request.mac, error = %err, "release bookkeeping failed");
                }
                None
            }
            MessageType::Decline => {
                let declined = request.requested_address();
                if let Err(err) = self.allocator.decline(request.mac, declined).await {
                    debug!(mac = %request.mac, error = %err, "decline bookkeeping failed");
                }
                None
            }
            _ => None,
        }
    }

    async fn handle_discover(&self, request: &BootRequest) -> Option<Message> {
        let ip = match self.allocator.assign(request.mac).await {
            Ok(ip) => ip,
            Err(LeaseError::PoolFull) => {
                debug!(mac = %request.mac, "no address to offer");
                return None;
            }
            Err(err) => {
                warn!(mac = %request.mac, error = %err, "discover dropped");
                return None;
            }
        };

        info!(mac = %request.mac, ip = %ip, pxe = request.is_pxe(), "offer");
        Some(self.positive_reply(request, MessageType::Offer, ip))
    }

    async fn handle_request(&self, request: &BootRequest) -> Option<Message> {
        // Another server's transaction; stay silent.
        if let Some(server) = request.server_identifier {
            if server != self.config.server_ip {
                return None;
            }
        }

        let Some(requested) = request.requested_address() else {
            debug!(mac = %request.mac, "request without a usable address");
            return None;
        };

        match self.allocator.request(request.mac, requested).await {
            Ok(ip) => {
                info!(mac = %request.mac, ip = %ip, pxe = request.is_pxe(), "ack");
                Some(self.positive_reply(request, MessageType::Ack, ip))
            }
            Err(LeaseError::Conflict { .. }) => {
                info!(mac = %request.mac, ip = %requested, "nak");
                Some(ReplyBuilder::new(request, MessageType::Nak, self.config.server_ip).build())
            }
            Err(err) => {
                warn!(mac = %request.mac, error = %err, "request dropped");
                None
            }
        }
    }

    fn positive_reply(
        &self,
        request: &BootRequest,
        message_type: MessageType,
        ip: Ipv4Addr,
    ) -> Message {
        let hostname = format!("{}.{}", request.mac.node_name(), self.config.cluster_name);
        let mut builder = ReplyBuilder::new(request, message_type, self.config.server_ip)
            .with_yiaddr(ip)
            .with_lease(self.random_lease_secs())
            .with_network(&self.config)
            .with_hostname(hostname);
        if let Some(guid) = &request.pxe_guid {
            builder = builder.with_pxe(guid, &self.config.boot_message);
        }
        builder.build()
    }

    fn random_lease_secs(&self) -> u32 {
        let mut rng = self.lease_rng.lock().unwrap_or_else(|e| e.into_inner());
        rng.gen_range(MIN_LEASE_HOURS..MAX_LEASE_HOURS) * 3600
    }
}

/// Replies go unicast to a client that already has an address, otherwise
/// to the local broadcast.
fn reply_destination(request: &BootRequest) -> SocketAddr {
    if request.ciaddr != Ipv4Addr::UNSPECIFIED {
        SocketAddr::new(request.ciaddr.into(), DHCP_CLIENT_PORT)
    } else {
        SocketAddr::new(Ipv4Addr::BROADCAST.into(), DHCP_CLIENT_PORT)
    }
}

#[cfg(target_os = "linux")]
fn bind_to_device(socket: &socket2::Socket, interface: &str) -> Result<()> {
    use std::os::fd::AsRawFd;

    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_BINDTODEVICE,
            interface.as_ptr() as *const libc::c_void,
            interface.len() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(DhcpError::BindToDevice {
            interface: interface.to_string(),
            source: std::io::Error::last_os_error(),
        });
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn bind_to_device(_socket: &socket2::Socket, interface: &str) -> Result<()> {
    Err(DhcpError::BindToDeviceUnsupported(interface.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::pxe_vendor_options;
    use anvil_registry::{Clock, LeasePool, NodeRegistry};
    use anvil_store::{BootStore, MemoryStore, StoreError};
    use dhcproto::v4::{DhcpOption, Flags, HType, Opcode, OptionCode};

    const MAC1: [u8; 6] = [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x01];
    const MAC2: [u8; 6] = [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x02];
    const MAC3: [u8; 6] = [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x03];
    const SERVER_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);

    struct FixedClock(i64);

    impl Clock for FixedClock {
        fn now_nanos(&self) -> i64 {
            self.0
        }
    }

    fn service_with_store(
        store: Arc<dyn BootStore>,
        lease_start: Ipv4Addr,
        lease_range: u32,
    ) -> DhcpService {
        let registry = NodeRegistry::with_clock(store, Arc::new(FixedClock(1_700_000_000_000_000_000)));
        let allocator = LeaseAllocator::new(registry, LeasePool::new(lease_start, lease_range));
        let config = DhcpConfig::new(SERVER_IP)
            .with_subnet_mask(Ipv4Addr::new(255, 255, 255, 0))
            .with_router(Ipv4Addr::new(10, 0, 0, 254))
            .with_dns_server(Ipv4Addr::new(10, 0, 0, 53))
            .with_cluster_name("forge")
            .with_boot_message("Anvil (test)");
        DhcpService::with_rng(config, Arc::new(allocator), StdRng::seed_from_u64(7))
    }

    async fn test_service(lease_start: Ipv4Addr, lease_range: u32) -> DhcpService {
        let store: Arc<dyn BootStore> = Arc::new(MemoryStore::new());
        let service = service_with_store(store, lease_start, lease_range);
        service
            .allocator
            .registry()
            .ensure_layout()
            .await
            .unwrap();
        service
    }

    fn base_message(mac: [u8; 6], message_type: MessageType) -> Message {
        let mut msg = Message::default();
        msg.set_opcode(Opcode::BootRequest)
            .set_htype(HType::Eth)
            .set_xid(0x1234_5678)
            .set_flags(Flags::default().set_broadcast());
        let mut chaddr = [0u8; 16];
        chaddr[..6].copy_from_slice(&mac);
        msg.set_chaddr(&chaddr);
        msg.opts_mut()
            .insert(DhcpOption::MessageType(message_type));
        msg
    }

    fn with_guid(mut msg: Message, guid: &[u8]) -> Message {
        msg.opts_mut()
            .insert(DhcpOption::ClientMachineIdentifier(guid.to_vec()));
        msg
    }

    fn with_requested(mut msg: Message, ip: Ipv4Addr) -> Message {
        msg.opts_mut().insert(DhcpOption::RequestedIpAddress(ip));
        msg
    }

    fn parse(msg: Message) -> BootRequest {
        BootRequest::parse(&msg.to_vec().unwrap()).unwrap()
    }

    fn message_type_of(reply: &Message) -> MessageType {
        match reply.opts().get(OptionCode::MessageType) {
            Some(DhcpOption::MessageType(mt)) => *mt,
            other => panic!("reply without a message type: {other:?}"),
        }
    }

    fn lease_secs_of(reply: &Message) -> u32 {
        match reply.opts().get(OptionCode::AddressLeaseTime) {
            Some(DhcpOption::AddressLeaseTime(secs)) => *secs,
            other => panic!("reply without a lease time: {other:?}"),
        }
    }

    #[tokio::test]
    async fn discover_offers_the_first_free_address() {
        let store: Arc<dyn BootStore> = Arc::new(MemoryStore::new());
        let service = service_with_store(Arc::clone(&store), Ipv4Addr::new(10, 0, 0, 10), 4);
        service.allocator.registry().ensure_layout().await.unwrap();

        let request = parse(base_message(MAC1, MessageType::Discover));
        let reply = service
            .handle_message(&request)
            .await
            .expect("expected an offer");

        assert_eq!(reply.opcode(), Opcode::BootReply);
        assert_eq!(message_type_of(&reply), MessageType::Offer);
        assert_eq!(reply.yiaddr(), Ipv4Addr::new(10, 0, 0, 10));
        assert_eq!(reply.siaddr(), SERVER_IP);
        assert_eq!(reply.xid(), 0x1234_5678);

        let lease = lease_secs_of(&reply);
        assert!((86_400..172_800).contains(&lease));
        assert!(reply.opts().get(OptionCode::SubnetMask).is_some());
        assert!(reply.opts().get(OptionCode::Router).is_some());
        assert!(reply.opts().get(OptionCode::DomainNameServer).is_some());

        // Not a PXE client: none of the PXE options.
        assert!(reply.opts().get(OptionCode::ClassIdentifier).is_none());
        assert!(reply.opts().get(OptionCode::ClientMachineIdentifier).is_none());
        assert!(reply.opts().get(OptionCode::VendorExtensions).is_none());

        // The node record landed in the store.
        assert_eq!(
            store.get("machines/nodeaabbccddee01/_IP").await.unwrap(),
            "10.0.0.10"
        );
        assert_eq!(
            store.get("machines/nodeaabbccddee01/state").await.unwrap(),
            "unknown"
        );
    }

    #[tokio::test]
    async fn pxe_discover_carries_the_boot_options() {
        let service = test_service(Ipv4Addr::new(10, 0, 0, 10), 4).await;

        let first = parse(base_message(MAC1, MessageType::Discover));
        service.handle_message(&first).await.unwrap();

        let mut guid = vec![0u8];
        guid.extend_from_slice(&[0x11; 16]);
        let request = parse(with_guid(base_message(MAC2, MessageType::Discover), &guid));
        let reply = service
            .handle_message(&request)
            .await
            .expect("expected an offer");

        assert_eq!(reply.yiaddr(), Ipv4Addr::new(10, 0, 0, 11));
        match reply.opts().get(OptionCode::ClassIdentifier) {
            Some(DhcpOption::ClassIdentifier(class)) => assert_eq!(class, b"PXEClient"),
            other => panic!("missing vendor class: {other:?}"),
        }
        match reply.opts().get(OptionCode::ClientMachineIdentifier) {
            Some(DhcpOption::ClientMachineIdentifier(echo)) => assert_eq!(echo, &guid[1..]),
            other => panic!("missing guid echo: {other:?}"),
        }
        match reply.opts().get(OptionCode::VendorExtensions) {
            Some(DhcpOption::VendorExtensions(blob)) => {
                assert_eq!(blob, &pxe_vendor_options(SERVER_IP, "Anvil (test)"));
            }
            other => panic!("missing vendor options: {other:?}"),
        }
    }

    #[tokio::test]
    async fn repeated_discover_reoffers_without_growing_the_registry() {
        let service = test_service(Ipv4Addr::new(10, 0, 0, 10), 4).await;

        let request = parse(base_message(MAC1, MessageType::Discover));
        let first = service.handle_message(&request).await.unwrap();
        let second = service.handle_message(&request).await.unwrap();

        assert_eq!(first.yiaddr(), second.yiaddr());
        assert_eq!(
            service.allocator.registry().list_nodes().await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn request_acks_the_bound_address_and_naks_a_mismatch() {
        let service = test_service(Ipv4Addr::new(10, 0, 0, 10), 4).await;

        let discover = parse(base_message(MAC1, MessageType::Discover));
        service.handle_message(&discover).await.unwrap();

        let good = parse(with_requested(
            base_message(MAC1, MessageType::Request),
            Ipv4Addr::new(10, 0, 0, 10),
        ));
        let reply = service.handle_message(&good).await.unwrap();
        assert_eq!(message_type_of(&reply), MessageType::Ack);
        assert_eq!(reply.yiaddr(), Ipv4Addr::new(10, 0, 0, 10));
        match reply.opts().get(OptionCode::Hostname) {
            Some(DhcpOption::Hostname(name)) => assert_eq!(name, "nodeaabbccddee01.forge"),
            other => panic!("missing hostname: {other:?}"),
        }

        let bad = parse(with_requested(
            base_message(MAC1, MessageType::Request),
            Ipv4Addr::new(10, 0, 0, 42),
        ));
        let reply = service.handle_message(&bad).await.unwrap();
        assert_eq!(message_type_of(&reply), MessageType::Nak);
        assert_eq!(reply.yiaddr(), Ipv4Addr::UNSPECIFIED);
    }

    #[tokio::test]
    async fn request_from_an_unknown_machine_adopts_it() {
        // Both sides unknown: the machine is adopted at the address it
        // asked for, even outside the pool.
        let service = test_service(Ipv4Addr::new(10, 0, 0, 10), 4).await;

        let request = parse(with_requested(
            base_message([0xff, 0xff, 0xff, 0x00, 0x00, 0x01], MessageType::Request),
            Ipv4Addr::new(10, 0, 0, 50),
        ));
        let reply = service.handle_message(&request).await.unwrap();
        assert_eq!(message_type_of(&reply), MessageType::Ack);
        assert_eq!(reply.yiaddr(), Ipv4Addr::new(10, 0, 0, 50));
    }

    #[tokio::test]
    async fn exhausted_pool_drops_the_discover() {
        let service = test_service(Ipv4Addr::new(10, 0, 0, 10), 2).await;

        for mac in [MAC1, MAC2] {
            let request = parse(base_message(mac, MessageType::Discover));
            assert!(service.handle_message(&request).await.is_some());
        }

        let request = parse(base_message(MAC3, MessageType::Discover));
        assert!(service.handle_message(&request).await.is_none());
    }

    #[tokio::test]
    async fn foreign_server_identifier_is_ignored() {
        let service = test_service(Ipv4Addr::new(10, 0, 0, 10), 4).await;

        let mut msg = with_requested(
            base_message(MAC1, MessageType::Request),
            Ipv4Addr::new(10, 0, 0, 10),
        );
        msg.opts_mut()
            .insert(DhcpOption::ServerIdentifier(Ipv4Addr::new(10, 0, 0, 9)));
        assert!(service.handle_message(&parse(msg)).await.is_none());

        // Addressed to us it goes through the normal path.
        let mut msg = with_requested(
            base_message(MAC1, MessageType::Request),
            Ipv4Addr::new(10, 0, 0, 10),
        );
        msg.opts_mut()
            .insert(DhcpOption::ServerIdentifier(SERVER_IP));
        let reply = service.handle_message(&parse(msg)).await.unwrap();
        assert_eq!(message_type_of(&reply), MessageType::Ack);
    }

    #[tokio::test]
    async fn request_without_a_usable_address_is_dropped() {
        let service = test_service(Ipv4Addr::new(10, 0, 0, 10), 4).await;

        let request = parse(base_message(MAC1, MessageType::Request));
        assert!(service.handle_message(&request).await.is_none());
    }

    #[tokio::test]
    async fn release_and_decline_stay_silent() {
        let service = test_service(Ipv4Addr::new(10, 0, 0, 10), 4).await;

        let discover = parse(base_message(MAC1, MessageType::Discover));
        service.handle_message(&discover).await.unwrap();

        let release = parse(base_message(MAC1, MessageType::Release));
        assert!(service.handle_message(&release).await.is_none());

        let decline = parse(with_requested(
            base_message(MAC1, MessageType::Decline),
            Ipv4Addr::new(10, 0, 0, 10),
        ));
        assert!(service.handle_message(&decline).await.is_none());
    }

    #[tokio::test]
    async fn inform_gets_no_reply() {
        let service = test_service(Ipv4Addr::new(10, 0, 0, 10), 4).await;
        let inform = parse(base_message(MAC1, MessageType::Inform));
        assert!(service.handle_message(&inform).await.is_none());
    }

    #[tokio::test]
    async fn store_outage_drops_packets_silently() {
        struct DownStore;

        #[async_trait::async_trait]
        impl BootStore for DownStore {
            async fn get(&self, _key: &str) -> anvil_store::Result<String> {
                Err(StoreError::Transport("etcd offline".into()))
            }
            async fn set(&self, _key: &str, _value: &str) -> anvil_store::Result<()> {
                Err(StoreError::Transport("etcd offline".into()))
            }
            async fn set_dir(&self, _key: &str) -> anvil_store::Result<()> {
                Err(StoreError::Transport("etcd offline".into()))
            }
            async fn delete(&self, _key: &str) -> anvil_store::Result<()> {
                Err(StoreError::Transport("etcd offline".into()))
            }
            async fn list(&self, _prefix: &str) -> anvil_store::Result<Vec<String>> {
                Err(StoreError::Transport("etcd offline".into()))
            }
        }

        let service = service_with_store(Arc::new(DownStore), Ipv4Addr::new(10, 0, 0, 10), 4);

        let discover = parse(base_message(MAC1, MessageType::Discover));
        assert!(service.handle_message(&discover).await.is_none());

        let request = parse(with_requested(
            base_message(MAC1, MessageType::Request),
            Ipv4Addr::new(10, 0, 0, 10),
        ));
        assert!(service.handle_message(&request).await.is_none());
    }

    #[tokio::test]
    async fn handle_packet_picks_the_broadcast_destination() {
        let service = test_service(Ipv4Addr::new(10, 0, 0, 10), 4).await;

        let msg = base_message(MAC1, MessageType::Discover);
        let (_, dest) = service
            .handle_packet(&msg.to_vec().unwrap())
            .await
            .expect("expected a reply");
        assert_eq!(
            dest,
            SocketAddr::new(Ipv4Addr::BROADCAST.into(), DHCP_CLIENT_PORT)
        );

        // Garbage never produces a reply.
        assert!(service.handle_packet(&[0u8; 8]).await.is_none());
    }

    #[tokio::test]
    async fn renewing_client_is_answered_unicast() {
        let service = test_service(Ipv4Addr::new(10, 0, 0, 10), 4).await;

        let discover = parse(base_message(MAC1, MessageType::Discover));
        service.handle_message(&discover).await.unwrap();

        let mut msg = base_message(MAC1, MessageType::Request);
        msg.set_ciaddr(Ipv4Addr::new(10, 0, 0, 10));
        let (_, dest) = service
            .handle_packet(&msg.to_vec().unwrap())
            .await
            .expect("expected an ack");
        assert_eq!(
            dest,
            SocketAddr::new(Ipv4Addr::new(10, 0, 0, 10).into(), DHCP_CLIENT_PORT)
        );
    }

    #[test]
    fn lease_times_span_24_to_48_hours() {
        let store: Arc<dyn BootStore> = Arc::new(MemoryStore::new());
        let service = service_with_store(store, Ipv4Addr::new(10, 0, 0, 10), 4);

        let mut seen_low = false;
        let mut seen_high = false;
        for _ in 0..1000 {
            let secs = service.random_lease_secs();
            assert!((86_400..172_800).contains(&secs));
            assert_eq!(secs % 3600, 0);
            seen_low |= secs < 100_000;
            seen_high |= secs > 150_000;
        }
        assert!(seen_low && seen_high);
    }
}
