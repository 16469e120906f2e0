//! DHCP service configuration.

use std::net::Ipv4Addr;

/// DHCP service configuration, immutable after startup.
#[derive(Debug, Clone)]
pub struct DhcpConfig {
    /// Interface to serve on. None listens on all interfaces.
    pub interface: Option<String>,

    /// Our address: server identifier, `siaddr`, and PXE boot server.
    pub server_ip: Ipv4Addr,

    /// Subnet mask handed to clients.
    pub subnet_mask: Ipv4Addr,

    /// Default router handed to clients, if any.
    pub router: Option<Ipv4Addr>,

    /// DNS servers handed to clients.
    pub dns_servers: Vec<Ipv4Addr>,

    /// Cluster name; suffix of the hostname option handed to clients.
    pub cluster_name: String,

    /// Label shown in the PXE boot menu.
    pub boot_message: String,
}

impl DhcpConfig {
    pub fn new(server_ip: Ipv4Addr) -> Self {
        Self {
            interface: None,
            server_ip,
            subnet_mask: Ipv4Addr::new(255, 255, 255, 0),
            router: None,
            dns_servers: Vec::new(),
            cluster_name: "anvil".to_string(),
            boot_message: format!("Anvil ({})", env!("CARGO_PKG_VERSION")),
        }
    }

    pub fn with_interface(mut self, interface: impl Into<String>) -> Self {
        self.interface = Some(interface.into());
        self
    }

    pub fn with_subnet_mask(mut self, mask: Ipv4Addr) -> Self {
        self.subnet_mask = mask;
        self
    }

    pub fn with_router(mut self, router: Ipv4Addr) -> Self {
        self.router = Some(router);
        self
    }

    /// Add a DNS server.
    pub fn with_dns_server(mut self, dns: Ipv4Addr) -> Self {
        self.dns_servers.push(dns);
        self
    }

    pub fn with_cluster_name(mut self, name: impl Into<String>) -> Self {
        self.cluster_name = name.into();
        self
    }

    pub fn with_boot_message(mut self, message: impl Into<String>) -> Self {
        self.boot_message = message.into();
        self
    }
}
