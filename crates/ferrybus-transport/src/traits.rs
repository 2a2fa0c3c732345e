//! Transport trait definitions

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use ferrybus_core::ConnectionArgs;

use crate::error::Result;

/// Events that can occur on a transport
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Connection established
    Connected,
    /// Connection closed (clean or error)
    Disconnected { reason: Option<String> },
    /// Data received
    Data(Bytes),
    /// Error occurred
    Error(String),
}

/// Trait for sending data
pub trait TransportSender: Send + Sync {
    /// Best-effort send. Never blocks; the link may queue internally.
    fn send(&self, data: Bytes) -> Result<()>;

    /// Check if connected
    fn is_connected(&self) -> bool;

    /// Close the link; the peer observes `Disconnected`
    fn close(&self);
}

/// Trait for receiving data
#[async_trait]
pub trait TransportReceiver: Send {
    /// Receive the next event
    async fn recv(&mut self) -> Option<TransportEvent>;
}

pub type BoxedSender = Arc<dyn TransportSender>;
pub type BoxedReceiver = Box<dyn TransportReceiver>;

/// Opens a leaf's link to the hub. Called again after every disconnect.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, args: &ConnectionArgs) -> Result<(BoxedSender, BoxedReceiver)>;
}

/// Trait for the hub side: accepts leaf links
#[async_trait]
pub trait TransportServer: Send {
    /// Accept a new connection together with the identity the leaf announced
    async fn accept(&mut self) -> Result<(BoxedSender, BoxedReceiver, ConnectionArgs)>;
}
