//! Node registry and lease allocation for the boot coordinator.
//!
//! Every machine that has ever spoken DHCP to us is a [`Node`]: a durable
//! record in the store, keyed by its MAC. The [`NodeRegistry`] provides
//! typed access to those records; the [`LeaseAllocator`] is the only
//! component allowed to create or move address bindings.

mod allocator;
mod clock;
mod error;
mod mac;
mod node;
mod registry;

pub use allocator::{LeaseAllocator, LeasePool};
pub use clock::{Clock, SystemClock};
pub use error::{InitialConfigError, LeaseError, RegistryError};
pub use mac::MacAddr;
pub use node::Node;
pub use registry::{InitialConfig, NodeRegistry};
