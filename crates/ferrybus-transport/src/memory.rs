//! In-process memory transport
//!
//! Links are FIFO and unbounded. A [`MemoryNetwork`] plays the part of the
//! platform connection API: leaves connect through it, the hub accepts from
//! the [`MemoryListener`] it hands out, and tests can sever every live link to
//! simulate the hub being suspended.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use ferrybus_core::ConnectionArgs;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{Result, TransportError};
use crate::traits::{
    BoxedReceiver, BoxedSender, Connector, TransportEvent, TransportReceiver, TransportSender,
    TransportServer,
};

struct LinkState {
    connected: AtomicBool,
    to_a: mpsc::UnboundedSender<TransportEvent>,
    to_b: mpsc::UnboundedSender<TransportEvent>,
}

impl LinkState {
    fn close(&self, reason: &str) {
        if self.connected.swap(false, Ordering::SeqCst) {
            let event = TransportEvent::Disconnected {
                reason: Some(reason.to_string()),
            };
            let _ = self.to_a.send(event.clone());
            let _ = self.to_b.send(event);
        }
    }
}

#[derive(Clone, Copy)]
enum Side {
    A,
    B,
}

/// Sending half of a memory link
pub struct MemorySender {
    link: Arc<LinkState>,
    side: Side,
}

impl TransportSender for MemorySender {
    fn send(&self, data: Bytes) -> Result<()> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        let peer = match self.side {
            Side::A => &self.link.to_b,
            Side::B => &self.link.to_a,
        };
        peer.send(TransportEvent::Data(data))
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    fn is_connected(&self) -> bool {
        self.link.connected.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.link.close("closed by peer");
    }
}

impl Drop for MemorySender {
    fn drop(&mut self) {
        self.link.close("sender dropped");
    }
}

/// Receiving half of a memory link
pub struct MemoryReceiver {
    rx: mpsc::UnboundedReceiver<TransportEvent>,
}

#[async_trait]
impl TransportReceiver for MemoryReceiver {
    async fn recv(&mut self) -> Option<TransportEvent> {
        self.rx.recv().await
    }
}

/// Create a connected pair of link ends
pub fn memory_pair() -> ((MemorySender, MemoryReceiver), (MemorySender, MemoryReceiver)) {
    let (to_a, rx_a) = mpsc::unbounded_channel();
    let (to_b, rx_b) = mpsc::unbounded_channel();
    let link = Arc::new(LinkState {
        connected: AtomicBool::new(true),
        to_a,
        to_b,
    });

    let a = (
        MemorySender {
            link: Arc::clone(&link),
            side: Side::A,
        },
        MemoryReceiver { rx: rx_a },
    );
    let b = (MemorySender { link, side: Side::B }, MemoryReceiver { rx: rx_b });
    (a, b)
}

struct PendingConnection {
    name: String,
    sender: MemorySender,
    receiver: MemoryReceiver,
}

#[derive(Default)]
struct NetworkState {
    listener: Option<mpsc::UnboundedSender<PendingConnection>>,
    links: Vec<Weak<LinkState>>,
}

/// Stand-in for the platform's connect/accept API
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start accepting connections. Replaces any previous listener.
    pub fn listen(&self) -> MemoryListener {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().listener = Some(tx);
        MemoryListener { rx }
    }

    /// Stop accepting; connect attempts fail until `listen` is called again
    pub fn shutdown(&self) {
        self.state.lock().listener = None;
    }

    /// Close every live link, as when the hub process is recycled
    pub fn sever_all(&self) {
        let links: Vec<_> = {
            let mut state = self.state.lock();
            state.links.retain(|l| l.strong_count() > 0);
            state.links.iter().filter_map(Weak::upgrade).collect()
        };
        debug!("Severing {} memory links", links.len());
        for link in links {
            link.close("link severed");
        }
    }

    /// Number of links still open
    pub fn live_links(&self) -> usize {
        self.state
            .lock()
            .links
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|l| l.connected.load(Ordering::SeqCst))
            .count()
    }
}

#[async_trait]
impl Connector for MemoryNetwork {
    async fn connect(&self, args: &ConnectionArgs) -> Result<(BoxedSender, BoxedReceiver)> {
        let name = args.encode()?;
        let ((leaf_tx, leaf_rx), (hub_tx, hub_rx)) = memory_pair();

        let mut state = self.state.lock();
        let listener = state.listener.clone().ok_or(TransportError::NoListener)?;

        state.links.push(Arc::downgrade(&leaf_tx.link));
        listener
            .send(PendingConnection {
                name,
                sender: hub_tx,
                receiver: hub_rx,
            })
            .map_err(|_| TransportError::NoListener)?;

        Ok((Arc::new(leaf_tx), Box::new(leaf_rx)))
    }
}

/// Hub side of a [`MemoryNetwork`]
pub struct MemoryListener {
    rx: mpsc::UnboundedReceiver<PendingConnection>,
}

#[async_trait]
impl TransportServer for MemoryListener {
    async fn accept(&mut self) -> Result<(BoxedSender, BoxedReceiver, ConnectionArgs)> {
        loop {
            let pending = self.rx.recv().await.ok_or(TransportError::ConnectionClosed)?;
            match ConnectionArgs::decode(&pending.name) {
                Some(args) => {
                    return Ok((Arc::new(pending.sender), Box::new(pending.receiver), args));
                }
                None => {
                    warn!("Rejecting connection with malformed name {:?}", pending.name);
                    pending.sender.close();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferrybus_core::Fingerprint;

    #[tokio::test]
    async fn test_pair_is_fifo() {
        let ((a_tx, _a_rx), (_b_tx, mut b_rx)) = memory_pair();
        for i in 0..3u8 {
            a_tx.send(Bytes::from(vec![i])).unwrap();
        }
        for i in 0..3u8 {
            match b_rx.recv().await {
                Some(TransportEvent::Data(d)) => assert_eq!(d.as_ref(), &[i]),
                other => panic!("unexpected event {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_close_notifies_both_sides() {
        let ((a_tx, mut a_rx), (b_tx, mut b_rx)) = memory_pair();
        a_tx.close();
        assert!(matches!(a_rx.recv().await, Some(TransportEvent::Disconnected { .. })));
        assert!(matches!(b_rx.recv().await, Some(TransportEvent::Disconnected { .. })));
        assert!(matches!(b_tx.send(Bytes::new()), Err(TransportError::NotConnected)));
    }

    #[tokio::test]
    async fn test_connect_without_listener_fails() {
        let net = MemoryNetwork::new();
        let args = ConnectionArgs::new("popup", Fingerprint::generate());
        assert!(matches!(net.connect(&args).await, Err(TransportError::NoListener)));
    }

    #[tokio::test]
    async fn test_accept_and_sever() {
        let net = MemoryNetwork::new();
        let mut listener = net.listen();
        let args = ConnectionArgs::new("options", Fingerprint::generate());

        let (_leaf_tx, mut leaf_rx) = net.connect(&args).await.unwrap();
        let (_hub_tx, _hub_rx, accepted) = listener.accept().await.unwrap();
        assert_eq!(accepted, args);
        assert_eq!(net.live_links(), 1);

        net.sever_all();
        assert!(matches!(leaf_rx.recv().await, Some(TransportEvent::Disconnected { .. })));
        assert_eq!(net.live_links(), 0);
    }
}
