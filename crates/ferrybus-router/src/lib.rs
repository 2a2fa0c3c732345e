//! Ferrybus Router
//!
//! The routing and transaction engine every context runs:
//! - Request/reply correlation ([`TransactionTable`], [`PendingReply`])
//! - Local dispatch vs. forwarding with hop stamps ([`Router`])
//! - Fire-and-forget event fan-out through the hub ([`BroadcastRelay`])
//! - A leaf's resilient link to the hub ([`PersistentChannel`])
//! - The hub's side of that link ([`HubSwitch`])
//!
//! Routers and relays never talk to a transport directly. They hand packets
//! to a [`PacketRoute`], which the context adapter binds to a channel, a page
//! bridge or the hub switch.

pub mod broadcast;
pub mod channel;
pub mod delivery;
pub mod error;
pub mod hub;
pub mod router;
pub mod transaction;

pub use broadcast::{BroadcastRelay, ListenerHandle, WeakRelay};
pub use channel::{ChannelConfig, DeliveryFailure, PersistentChannel};
pub use delivery::{Backlog, DeliveryLog, Queued, QueuedMessage};
pub use error::{HandlerError, Result, RouterError};
pub use hub::{connection_key, HubSwitch, WeakHub};
pub use router::{HandlerHandle, PacketRoute, Router, WeakRouter};
pub use transaction::{PendingReply, TransactionTable};
