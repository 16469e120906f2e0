//! DHCP packet parsing and reply construction.
//!
//! Parsing pulls out the handful of fields the dispatcher decides on;
//! reply construction goes through [`ReplyBuilder`], which honors the
//! client's parameter request list and staples the PXE options onto
//! replies for PXE-capable clients.

use crate::config::DhcpConfig;
use crate::error::{DhcpError, Result};
use anvil_registry::MacAddr;
use dhcproto::v4::{DhcpOption, Message, MessageType, Opcode, OptionCode};
use dhcproto::{Decodable, Encodable};
use std::net::Ipv4Addr;

/// Longest boot message embedded in the PXE vendor options; the menu and
/// prompt sub-options carry single length bytes.
const MAX_BOOT_MESSAGE: usize = 128;

/// Parsed inbound packet with the fields the dispatcher needs.
#[derive(Debug, Clone)]
pub struct BootRequest {
    /// The full decoded message.
    pub message: Message,

    pub message_type: MessageType,

    /// Client hardware address from `chaddr`.
    pub mac: MacAddr,

    /// Requested address (option 50).
    pub requested_ip: Option<Ipv4Addr>,

    /// Server identifier (option 54), when the client names a server.
    pub server_identifier: Option<Ipv4Addr>,

    /// Parameter request list (option 55).
    pub param_request_list: Option<Vec<OptionCode>>,

    /// Raw machine-identifier payload (option 97), type byte included.
    /// Present iff the client is PXE-capable.
    pub pxe_guid: Option<Vec<u8>>,

    pub ciaddr: Ipv4Addr,
    pub xid: u32,
}

impl BootRequest {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let message =
            Message::from_bytes(data).map_err(|e| DhcpError::ParseError(e.to_string()))?;

        let message_type = message
            .opts()
            .get(OptionCode::MessageType)
            .and_then(|opt| match opt {
                DhcpOption::MessageType(mt) => Some(*mt),
                _ => None,
            })
            .ok_or_else(|| DhcpError::ParseError("missing message type".to_string()))?;

        let mac = MacAddr::from_chaddr(message.chaddr())
            .ok_or_else(|| DhcpError::ParseError("short chaddr".to_string()))?;

        let requested_ip = message
            .opts()
            .get(OptionCode::RequestedIpAddress)
            .and_then(|opt| match opt {
                DhcpOption::RequestedIpAddress(ip) => Some(*ip),
                _ => None,
            });

        let server_identifier = message
            .opts()
            .get(OptionCode::ServerIdentifier)
            .and_then(|opt| match opt {
                DhcpOption::ServerIdentifier(ip) => Some(*ip),
                _ => None,
            });

        let param_request_list = message
            .opts()
            .get(OptionCode::ParameterRequestList)
            .and_then(|opt| match opt {
                DhcpOption::ParameterRequestList(codes) => Some(codes.clone()),
                _ => None,
            });

        let pxe_guid = message
            .opts()
            .get(OptionCode::ClientMachineIdentifier)
            .and_then(|opt| match opt {
                DhcpOption::ClientMachineIdentifier(bytes) => Some(bytes.clone()),
                _ => None,
            });

        Ok(Self {
            message_type,
            mac,
            requested_ip,
            server_identifier,
            param_request_list,
            pxe_guid,
            ciaddr: message.ciaddr(),
            xid: message.xid(),
            message,
        })
    }

    /// PXE clients announce themselves with a machine-identifier GUID.
    pub fn is_pxe(&self) -> bool {
        self.pxe_guid.is_some()
    }

    /// The address a request is asking for: option 50, falling back to
    /// `ciaddr`. None when both are absent or zero.
    pub fn requested_address(&self) -> Option<Ipv4Addr> {
        let ip = self.requested_ip.unwrap_or(self.ciaddr);
        (ip != Ipv4Addr::UNSPECIFIED).then_some(ip)
    }
}

/// Builder for outbound replies.
///
/// Network options respect the client's parameter request list;
/// protocol-mandatory options are always present.
pub struct ReplyBuilder<'a> {
    request: &'a BootRequest,
    message_type: MessageType,
    server_ip: Ipv4Addr,
    yiaddr: Option<Ipv4Addr>,
    lease_secs: Option<u32>,
    subnet_mask: Option<Ipv4Addr>,
    router: Option<Ipv4Addr>,
    dns_servers: Vec<Ipv4Addr>,
    hostname: Option<String>,
    pxe: Option<PxeReply>,
}

struct PxeReply {
    guid: Vec<u8>,
    vendor: Vec<u8>,
}

impl<'a> ReplyBuilder<'a> {
    pub fn new(request: &'a BootRequest, message_type: MessageType, server_ip: Ipv4Addr) -> Self {
        Self {
            request,
            message_type,
            server_ip,
            yiaddr: None,
            lease_secs: None,
            subnet_mask: None,
            router: None,
            dns_servers: Vec::new(),
            hostname: None,
            pxe: None,
        }
    }

    /// The address offered or acknowledged to the client.
    pub fn with_yiaddr(mut self, ip: Ipv4Addr) -> Self {
        self.yiaddr = Some(ip);
        self
    }

    pub fn with_lease(mut self, seconds: u32) -> Self {
        self.lease_secs = Some(seconds);
        self
    }

    /// Subnet mask, router, and DNS from the service configuration.
    pub fn with_network(mut self, config: &DhcpConfig) -> Self {
        self.subnet_mask = Some(config.subnet_mask);
        self.router = config.router;
        self.dns_servers = config.dns_servers.clone();
        self
    }

    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    /// Staple the PXE options onto the reply: vendor class, the client's
    /// GUID echoed back minus its type byte, and the vendor-options blob.
    pub fn with_pxe(mut self, guid: &[u8], boot_message: &str) -> Self {
        self.pxe = Some(PxeReply {
            guid: guid.get(1..).unwrap_or_default().to_vec(),
            vendor: pxe_vendor_options(self.server_ip, boot_message),
        });
        self
    }

    pub fn build(self) -> Message {
        let ReplyBuilder {
            request,
            message_type,
            server_ip,
            yiaddr,
            lease_secs,
            subnet_mask,
            router,
            dns_servers,
            hostname,
            pxe,
        } = self;

        // No parameter request list means the client takes everything.
        let wants = |code: OptionCode| match &request.param_request_list {
            Some(list) => list.contains(&code),
            None => true,
        };

        let mut reply = Message::default();
        reply
            .set_opcode(Opcode::BootReply)
            .set_xid(request.xid)
            .set_flags(request.message.flags())
            .set_chaddr(request.message.chaddr())
            .set_siaddr(server_ip);
        if let Some(ip) = yiaddr {
            reply.set_yiaddr(ip);
        }

        let opts = reply.opts_mut();
        opts.insert(DhcpOption::MessageType(message_type));
        opts.insert(DhcpOption::ServerIdentifier(server_ip));
        if let Some(seconds) = lease_secs {
            opts.insert(DhcpOption::AddressLeaseTime(seconds));
        }
        if let (Some(mask), true) = (subnet_mask, wants(OptionCode::SubnetMask)) {
            opts.insert(DhcpOption::SubnetMask(mask));
        }
        if let (Some(router), true) = (router, wants(OptionCode::Router)) {
            opts.insert(DhcpOption::Router(vec![router]));
        }
        if !dns_servers.is_empty() && wants(OptionCode::DomainNameServer) {
            opts.insert(DhcpOption::DomainNameServer(dns_servers));
        }
        if let Some(hostname) = hostname {
            opts.insert(DhcpOption::Hostname(hostname));
        }
        if let Some(PxeReply { guid, vendor }) = pxe {
            opts.insert(DhcpOption::ClassIdentifier(b"PXEClient".to_vec()));
            opts.insert(DhcpOption::ClientMachineIdentifier(guid));
            opts.insert(DhcpOption::VendorExtensions(vendor));
        }

        reply
    }

    pub fn build_bytes(self) -> Result<Vec<u8>> {
        self.build()
            .to_vec()
            .map_err(|e| DhcpError::EncodeError(e.to_string()))
    }
}

/// PXE vendor-options payload (option 43).
///
/// Layout, in order: discovery control disabling broadcast and multicast
/// boot-server discovery; one boot-server entry of type 0x8000 at our
/// address; a single-entry boot menu referencing it; a menu prompt with a
/// two-second timeout; the end marker. The menu and prompt labels carry
/// the boot message, and the length bytes cover it.
pub fn pxe_vendor_options(server_ip: Ipv4Addr, boot_message: &str) -> Vec<u8> {
    let msg = boot_message.as_bytes();
    let msg = &msg[..msg.len().min(MAX_BOOT_MESSAGE)];

    let mut blob = Vec::with_capacity(24 + 2 * msg.len());
    // Discovery Control.
    blob.extend_from_slice(&[6, 1, 3]);
    // Boot server list.
    blob.extend_from_slice(&[8, 7, 0x80, 0x00, 1]);
    blob.extend_from_slice(&server_ip.octets());
    // Boot menu.
    blob.push(9);
    blob.push((3 + msg.len()) as u8);
    blob.extend_from_slice(&[0x80, 0x00, 9]);
    blob.extend_from_slice(msg);
    // Menu prompt, two-second timeout.
    blob.push(10);
    blob.push((1 + msg.len()) as u8);
    blob.push(2);
    blob.extend_from_slice(msg);
    blob.push(255);
    blob
}
