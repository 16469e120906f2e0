//! DHCP/PXE boot service.
//!
//! Answers discovery and request traffic from bare-metal machines on a
//! local segment and walks PXE-capable clients into the boot chain. Lease
//! policy lives in `anvil-registry`; this crate owns the wire format and
//! the packet listener.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────┐
//! │                 DhcpService                    │
//! │  ┌──────────────────────────────────────────┐  │
//! │  │  Listener (UDP 67, optional interface)   │  │
//! │  └──────────────────────────────────────────┘  │
//! │                      │                         │
//! │                      ▼                         │
//! │  ┌──────────────────────────────────────────┐  │
//! │  │  Dispatch: Discover / Request /          │  │
//! │  │  Release / Decline                       │  │
//! │  └──────────────────────────────────────────┘  │
//! │                      │                         │
//! │                      ▼                         │
//! │  ┌──────────────────────────────────────────┐  │
//! │  │  LeaseAllocator                          │  │
//! │  │  MAC → address binding in the store      │  │
//! │  └──────────────────────────────────────────┘  │
//! └────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod error;
pub mod packet;
pub mod server;

pub use config::*;
pub use error::*;
pub use packet::*;
pub use server::*;
