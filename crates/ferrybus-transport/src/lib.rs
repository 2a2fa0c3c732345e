//! Ferrybus Transport Layer
//!
//! Traits every physical link adapter implements, plus:
//! - Memory (in-process links for page bridges, hub connections and tests)

pub mod error;
pub mod traits;

#[cfg(feature = "memory")]
pub mod memory;

pub use error::{Result, TransportError};
pub use traits::{
    BoxedReceiver, BoxedSender, Connector, TransportEvent, TransportReceiver, TransportSender,
    TransportServer,
};

#[cfg(feature = "memory")]
pub use memory::{memory_pair, MemoryListener, MemoryNetwork, MemoryReceiver, MemorySender};
