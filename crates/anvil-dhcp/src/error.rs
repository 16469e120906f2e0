//! Error types for the DHCP service.

use std::net::SocketAddr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DhcpError {
    /// Failed to bind the listener socket.
    #[error("failed to bind to {addr}: {source}")]
    BindFailed {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// Failed to bind the socket to a named interface.
    #[error("failed to bind to interface {interface}: {source}")]
    BindToDevice {
        interface: String,
        #[source]
        source: std::io::Error,
    },

    /// Interface binding is a Linux-only facility.
    #[error("binding to interface {0} is not supported on this platform")]
    BindToDeviceUnsupported(String),

    /// Failed to parse a DHCP packet.
    #[error("failed to parse DHCP packet: {0}")]
    ParseError(String),

    /// Failed to encode a DHCP packet.
    #[error("failed to encode DHCP packet: {0}")]
    EncodeError(String),

    /// Socket send error.
    #[error("failed to send packet: {0}")]
    SendError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DhcpError>;
