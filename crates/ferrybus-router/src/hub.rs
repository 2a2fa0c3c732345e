//! Hub switch
//!
//! The hub's side of every persistent channel. It keeps one connection per
//! leaf endpoint, stamps origins with the tab/frame of the connection they
//! came from, delivers packets to the connection their destination resolves
//! to, and runs the delivery protocol: receipts for delivered requests,
//! undeliverable/deliverable notices, and terminated notices when a leaf's
//! connection goes away.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use dashmap::DashMap;
use ferrybus_core::{
    codec, ChannelRequest, ChannelStatus, ConnectionArgs, ContextKind, DeliveryReceipt, Endpoint,
    Fingerprint, Packet, ReceiptOrigin,
};
use ferrybus_transport::{BoxedReceiver, BoxedSender, TransportEvent, TransportServer};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::broadcast::BroadcastRelay;
use crate::delivery::{Backlog, DeliveryLog, Queued};
use crate::error::{Result, RouterError};
use crate::router::{PacketRoute, Router};

/// Key of the connection an endpoint is reached through.
///
/// A page has no connection of its own; it is reached through the content
/// script in its frame. A missing frame means the top frame.
pub fn connection_key(endpoint: &Endpoint) -> String {
    match (endpoint.context, endpoint.tab_id) {
        (ContextKind::Window | ContextKind::ContentScript, Some(tab)) => format!(
            "{}@{}.{}",
            ContextKind::ContentScript,
            tab,
            endpoint.frame_id.unwrap_or(0)
        ),
        _ => endpoint.format(),
    }
}

#[derive(Clone)]
struct Connection {
    serial: u64,
    endpoint: Endpoint,
    fingerprint: Fingerprint,
    sender: BoxedSender,
}

impl Connection {
    fn send(&self, status: &ChannelStatus) {
        match codec::encode(status) {
            Ok(bytes) => {
                if let Err(e) = self.sender.send(bytes) {
                    debug!("Send to {} failed: {}", self.fingerprint, e);
                }
            }
            Err(e) => warn!("Failed to encode status frame: {}", e),
        }
    }
}

struct HubInner {
    /// Stands in for a connection fingerprint on the hub's own receipts
    fingerprint: Fingerprint,
    next_serial: AtomicU64,
    connections: DashMap<String, Connection>,
    by_fingerprint: DashMap<Fingerprint, String>,
    /// Destination key -> leaves told it was undeliverable
    waiting: Mutex<HashMap<String, Vec<Fingerprint>>>,
    /// Destination key -> (receipted target, leaf holding the receipt)
    watched: Mutex<HashMap<String, Vec<(Fingerprint, Fingerprint)>>>,
    /// Hub-originated packets whose destination is not connected
    backlog: Mutex<Backlog>,
    /// Hub-originated requests delivered but not yet answered
    receipts: Mutex<DeliveryLog>,
    router: OnceLock<Router>,
    relay: OnceLock<BroadcastRelay>,
    running: AtomicBool,
}

/// Connection table and delivery protocol of the hub
#[derive(Clone)]
pub struct HubSwitch {
    inner: Arc<HubInner>,
}

impl HubSwitch {
    pub fn new(max_backlog: usize) -> Self {
        Self {
            inner: Arc::new(HubInner {
                fingerprint: Fingerprint::generate(),
                next_serial: AtomicU64::new(1),
                connections: DashMap::new(),
                by_fingerprint: DashMap::new(),
                waiting: Mutex::new(HashMap::new()),
                watched: Mutex::new(HashMap::new()),
                backlog: Mutex::new(Backlog::new(max_backlog)),
                receipts: Mutex::new(DeliveryLog::new()),
                router: OnceLock::new(),
                relay: OnceLock::new(),
                running: AtomicBool::new(false),
            }),
        }
    }

    /// Route for the hub's own router and relay. It does not keep the switch
    /// alive, since the switch holds both of them.
    pub fn downgrade(&self) -> WeakHub {
        WeakHub {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Attach the hub's own router and relay. Both route through this switch,
    /// so they are bound after construction. Later calls are ignored.
    pub fn bind(&self, router: Router, relay: BroadcastRelay) {
        if self.inner.router.set(router).is_err() || self.inner.relay.set(relay).is_err() {
            warn!("Hub switch already bound");
        }
    }

    pub fn connection_count(&self) -> usize {
        self.inner.connections.len()
    }

    pub fn is_connected(&self, key: &str) -> bool {
        self.inner.connections.contains_key(key)
    }

    pub fn backlog_len(&self) -> usize {
        self.inner.backlog.lock().len()
    }

    /// Hub-originated requests delivered and still awaiting a reply
    pub fn receipt_count(&self) -> usize {
        self.inner.receipts.lock().len()
    }

    // =========================================================================
    // Accepting
    // =========================================================================

    /// Accept leaf connections until [`stop`](Self::stop) or the server closes
    pub async fn serve_on<S>(&self, mut server: S) -> Result<()>
    where
        S: TransportServer + 'static,
    {
        info!("Hub accepting connections");
        self.inner.running.store(true, Ordering::SeqCst);

        while self.inner.running.load(Ordering::SeqCst) {
            match server.accept().await {
                Ok((sender, _, _)) if !self.inner.running.load(Ordering::SeqCst) => {
                    sender.close();
                    break;
                }
                Ok((sender, receiver, args)) => self.handle_connection(sender, receiver, args),
                Err(ferrybus_transport::TransportError::ConnectionClosed) => {
                    info!("Hub listener closed");
                    break;
                }
                Err(e) => error!("Accept error: {}", e),
            }
        }

        Ok(())
    }

    /// Stop accepting and close every leaf link
    pub fn stop(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        for conn in self.inner.connections.iter() {
            conn.sender.close();
        }
    }

    /// Take over one accepted leaf link
    pub fn handle_connection(&self, sender: BoxedSender, mut receiver: BoxedReceiver, args: ConnectionArgs) {
        let endpoint = match args.endpoint() {
            Ok(ep) => ep,
            Err(e) => {
                warn!("Rejecting connection {:?}: {}", args.endpoint_name, e);
                sender.close();
                return;
            }
        };
        let key = connection_key(&endpoint);
        let conn = Connection {
            serial: self.inner.next_serial.fetch_add(1, Ordering::Relaxed),
            endpoint,
            fingerprint: args.fingerprint.clone(),
            sender,
        };
        info!("Leaf {} connected as {}", key, conn.fingerprint);
        self.register(key.clone(), conn.clone());

        let hub = self.clone();
        tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                match event {
                    TransportEvent::Data(data) => match codec::decode::<ChannelRequest>(&data) {
                        Ok(frame) => hub.handle_frame(&conn, frame),
                        Err(e) => warn!("Bad frame from {}: {}", key, e),
                    },
                    TransportEvent::Disconnected { reason } => {
                        debug!("Leaf {} disconnected: {:?}", key, reason);
                        break;
                    }
                    TransportEvent::Error(e) => warn!("Transport error from {}: {}", key, e),
                    TransportEvent::Connected => {}
                }
            }
            hub.unregister(&key, &conn);
        });
    }

    fn register(&self, key: String, conn: Connection) {
        let fingerprint = conn.fingerprint.clone();
        self.inner
            .by_fingerprint
            .insert(fingerprint.clone(), key.clone());

        if let Some(previous) = self.inner.connections.insert(key.clone(), conn) {
            previous.sender.close();
            if previous.fingerprint != fingerprint {
                info!("{} replaced by new connection, dropping {}", key, previous.fingerprint);
                self.inner.by_fingerprint.remove(&previous.fingerprint);
                self.announce_terminated(&previous.fingerprint);
            }
        }

        let watchers = self.inner.watched.lock().remove(&key).unwrap_or_default();
        for (target, watcher) in watchers {
            if target != fingerprint {
                self.send_to_fingerprint(&watcher, &ChannelStatus::Terminated { fingerprint: target });
            }
        }

        let waiting = self.inner.waiting.lock().remove(&key).unwrap_or_default();
        for leaf in waiting {
            self.send_to_fingerprint(
                &leaf,
                &ChannelStatus::Deliverable {
                    deliverable_to: key.clone(),
                },
            );
        }

        let held = self.inner.backlog.lock().take_for(&key);
        for packet in held {
            self.deliver(packet);
        }
    }

    fn unregister(&self, key: &str, conn: &Connection) {
        let removed = self
            .inner
            .connections
            .remove_if(key, |_, c| c.serial == conn.serial)
            .is_some();
        if removed {
            info!("Leaf {} ({}) gone", key, conn.fingerprint);
            self.inner.by_fingerprint.remove(&conn.fingerprint);
            self.announce_terminated(&conn.fingerprint);
        }
    }

    /// Tell every leaf, and the hub's own transactions, that a connection ended
    fn announce_terminated(&self, fingerprint: &Fingerprint) {
        let status = ChannelStatus::Terminated {
            fingerprint: fingerprint.clone(),
        };
        for entry in self.inner.connections.iter() {
            if &entry.fingerprint != fingerprint {
                entry.send(&status);
            }
        }

        let orphaned = self.inner.receipts.lock().take_destined_to(fingerprint);
        if let Some(router) = self.inner.router.get() {
            for receipt in orphaned {
                let id = receipt.message.transaction_id;
                router.fail_transaction(&id, RouterError::Terminated(id.clone()));
            }
        }
    }

    fn send_to_fingerprint(&self, fingerprint: &Fingerprint, status: &ChannelStatus) {
        let Some(key) = self.inner.by_fingerprint.get(fingerprint).map(|k| k.value().clone()) else {
            return;
        };
        if let Some(conn) = self.inner.connections.get(&key) {
            if &conn.fingerprint == fingerprint {
                conn.send(status);
            }
        }
    }

    fn connection_for(&self, endpoint: &Endpoint) -> Option<Connection> {
        self.inner
            .connections
            .get(&connection_key(endpoint))
            .map(|c| c.value().clone())
    }

    // =========================================================================
    // Frames from leaves
    // =========================================================================

    fn handle_frame(&self, conn: &Connection, frame: ChannelRequest) {
        match frame {
            ChannelRequest::Sync {
                pending_responses,
                pending_deliveries,
            } => self.handle_sync(conn, pending_responses, pending_deliveries),
            ChannelRequest::Deliver { mut message } => {
                message.origin = message.origin.scoped_like(&conn.endpoint);
                if message.is_broadcast() {
                    match self.inner.relay.get() {
                        Some(relay) => relay.handle_event(message),
                        None => warn!("Hub relay not bound, dropping event '{}'", message.id),
                    }
                    return;
                }

                if message.is_reply() && message.destination.is_some_and(|d| d.context.is_hub()) {
                    self.inner
                        .receipts
                        .lock()
                        .remove_transaction(&message.transaction_id);
                }
                match self.inner.router.get() {
                    Some(router) => router.handle_message(message),
                    None => warn!("Hub router not bound, dropping '{}'", message.id),
                }
            }
        }
    }

    fn handle_sync(
        &self,
        conn: &Connection,
        pending_responses: Vec<DeliveryReceipt>,
        pending_deliveries: Vec<String>,
    ) {
        debug!(
            "Sync from {}: {} receipt(s), {} held destination(s)",
            conn.fingerprint,
            pending_responses.len(),
            pending_deliveries.len()
        );

        for key in pending_deliveries {
            if self.inner.connections.contains_key(&key) {
                conn.send(&ChannelStatus::Deliverable { deliverable_to: key });
            } else {
                let mut waiting = self.inner.waiting.lock();
                let leaves = waiting.entry(key).or_default();
                if !leaves.contains(&conn.fingerprint) {
                    leaves.push(conn.fingerprint.clone());
                }
            }
        }

        for receipt in pending_responses {
            let Some(destination) = receipt.message.destination else {
                continue;
            };
            let key = connection_key(&destination);
            let current = self
                .inner
                .connections
                .get(&key)
                .map(|c| c.fingerprint.clone());
            match current {
                Some(fp) if fp == receipt.to => {}
                Some(_) => conn.send(&ChannelStatus::Terminated {
                    fingerprint: receipt.to,
                }),
                None => self
                    .inner
                    .watched
                    .lock()
                    .entry(key)
                    .or_default()
                    .push((receipt.to, conn.fingerprint.clone())),
            }
        }
    }

    // =========================================================================
    // Delivery
    // =========================================================================

    fn deliver(&self, packet: Packet) {
        let Some(destination) = packet.destination else {
            warn!("Dropping '{}' without destination", packet.id);
            return;
        };

        if destination.context.is_hub() {
            match self.inner.router.get() {
                Some(router) => router.handle_message(packet),
                None => warn!("Hub router not bound, dropping '{}'", packet.id),
            }
            return;
        }

        let key = connection_key(&destination);
        match self.connection_for(&destination) {
            Some(target) => {
                // receipt first: the reply may come back before this returns
                if packet.is_request() {
                    self.issue_receipt(packet.clone(), &target);
                }
                target.send(&ChannelStatus::Incoming { message: packet });
            }
            None => self.hold(packet, key),
        }
    }

    fn issue_receipt(&self, packet: Packet, target: &Connection) {
        if packet.origin.context.is_hub() {
            self.inner.receipts.lock().add(DeliveryReceipt {
                message: packet,
                to: target.fingerprint.clone(),
                from: ReceiptOrigin {
                    endpoint_id: ContextKind::Coordinator.to_string(),
                    fingerprint: self.inner.fingerprint.clone(),
                },
            });
            return;
        }

        let Some(origin) = self.connection_for(&packet.origin) else {
            debug!("Origin of '{}' gone, no receipt", packet.id);
            return;
        };
        let receipt = DeliveryReceipt {
            message: packet,
            to: target.fingerprint.clone(),
            from: ReceiptOrigin {
                endpoint_id: connection_key(&origin.endpoint),
                fingerprint: origin.fingerprint.clone(),
            },
        };
        origin.send(&ChannelStatus::Delivered { receipt });
    }

    fn hold(&self, packet: Packet, key: String) {
        if packet.origin.context.is_hub() {
            debug!("Holding '{}' until {} connects", packet.id, key);
            let queued = self.inner.backlog.lock().push(key, packet);
            if let Queued::Evicted(old) = queued {
                warn!("Hub backlog full, dropping '{}'", old.id);
                if let Some(router) = self.inner.router.get() {
                    let id = old.transaction_id;
                    router.fail_transaction(&id, RouterError::BacklogOverflow(id.clone()));
                }
            }
            return;
        }

        match self.connection_for(&packet.origin) {
            Some(origin) => {
                debug!("'{}' undeliverable to {}", packet.id, key);
                {
                    let mut waiting = self.inner.waiting.lock();
                    let leaves = waiting.entry(key.clone()).or_default();
                    if !leaves.contains(&origin.fingerprint) {
                        leaves.push(origin.fingerprint.clone());
                    }
                }
                origin.send(&ChannelStatus::Undeliverable {
                    message: packet,
                    resolved_destination: key,
                });
            }
            None => warn!(
                "Dropping '{}': neither {} nor its origin is connected",
                packet.id, key
            ),
        }
    }

    /// Send an event to every leaf, and to the hub's own listeners unless
    /// the hub emitted it.
    fn fan_out(&self, packet: Packet) {
        let status = ChannelStatus::Incoming {
            message: packet.clone(),
        };
        for conn in self.inner.connections.iter() {
            conn.send(&status);
        }

        if !packet.origin.context.is_hub() {
            if let Some(relay) = self.inner.relay.get() {
                relay.handle_event(packet);
            }
        }
    }
}

impl PacketRoute for HubSwitch {
    fn route(&self, packet: Packet) {
        if packet.is_broadcast() {
            self.fan_out(packet);
        } else {
            self.deliver(packet);
        }
    }
}

/// Non-owning route into a [`HubSwitch`]
#[derive(Clone)]
pub struct WeakHub {
    inner: Weak<HubInner>,
}

impl PacketRoute for WeakHub {
    fn route(&self, packet: Packet) {
        match self.inner.upgrade() {
            Some(inner) => HubSwitch { inner }.route(packet),
            None => debug!("Hub gone, dropping '{}'", packet.id),
        }
    }
}
