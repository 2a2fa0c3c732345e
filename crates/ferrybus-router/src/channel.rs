//! Persistent channel: a leaf's self-healing link to the hub
//!
//! The channel keeps one fingerprint for its lifetime and reconnects whenever
//! the link drops. On every (re)connect it sends a sync frame with the
//! destinations it is still waiting on and the receipts of requests still
//! awaiting replies, so a restarted hub can rebuild its view of the leaf.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ferrybus_core::{
    codec, ChannelRequest, ChannelStatus, ConnectionArgs, DeliveryReceipt, Fingerprint, Packet,
};
use ferrybus_transport::{BoxedReceiver, BoxedSender, Connector, TransportEvent};
use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::delivery::{Backlog, DeliveryLog, Queued};

/// Channel tuning
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Wait before reconnecting after a drop or failed attempt
    pub reconnect_interval: Duration,
    /// Most packets kept at once, both in the undeliverable backlog and in
    /// the outbox filled while the hub is unreachable
    pub max_backlog: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            reconnect_interval: Duration::from_millis(500),
            max_backlog: 256,
        }
    }
}

/// Why a packet will never get an answer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryFailure {
    /// Its destination connection went away after delivery
    Terminated,
    /// It was pushed out of a full backlog
    BacklogOverflow,
}

type MessageCallback = Arc<dyn Fn(Packet) + Send + Sync>;
type FailureCallback = Arc<dyn Fn(Packet, DeliveryFailure) + Send + Sync>;

#[derive(Default)]
struct LinkState {
    sender: Option<BoxedSender>,
    /// Packets posted while disconnected, in post order
    outbox: VecDeque<Packet>,
}

struct ChannelInner {
    args: ConnectionArgs,
    connector: Arc<dyn Connector>,
    config: ChannelConfig,
    link: Mutex<LinkState>,
    backlog: Mutex<Backlog>,
    receipts: Mutex<DeliveryLog>,
    message_listeners: RwLock<Vec<MessageCallback>>,
    failure_listeners: RwLock<Vec<FailureCallback>>,
    closed: AtomicBool,
    shutdown: Notify,
}

/// Leaf side of the hub link
#[derive(Clone)]
pub struct PersistentChannel {
    inner: Arc<ChannelInner>,
}

impl PersistentChannel {
    /// Create the channel and start connecting in the background
    pub fn open(name: impl Into<String>, connector: Arc<dyn Connector>, config: ChannelConfig) -> Self {
        let backlog = Backlog::new(config.max_backlog);
        let channel = Self {
            inner: Arc::new(ChannelInner {
                args: ConnectionArgs::new(name, Fingerprint::generate()),
                connector,
                config,
                link: Mutex::new(LinkState::default()),
                backlog: Mutex::new(backlog),
                receipts: Mutex::new(DeliveryLog::new()),
                message_listeners: RwLock::new(Vec::new()),
                failure_listeners: RwLock::new(Vec::new()),
                closed: AtomicBool::new(false),
                shutdown: Notify::new(),
            }),
        };

        let inner = Arc::clone(&channel.inner);
        tokio::spawn(async move {
            inner.run().await;
        });

        channel
    }

    pub fn name(&self) -> &str {
        &self.inner.args.endpoint_name
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.inner.args.fingerprint
    }

    pub fn is_connected(&self) -> bool {
        self.inner
            .link
            .lock()
            .sender
            .as_ref()
            .is_some_and(|s| s.is_connected())
    }

    /// Receipts of delivered requests still waiting for a reply
    pub fn pending_receipts(&self) -> Vec<DeliveryReceipt> {
        self.inner.receipts.lock().entries().to_vec()
    }

    pub fn backlog_len(&self) -> usize {
        self.inner.backlog.lock().len()
    }

    /// Packets waiting for the link to come back
    pub fn outbox_len(&self) -> usize {
        self.inner.link.lock().outbox.len()
    }

    /// Send a packet to the hub. While disconnected it is queued and sent,
    /// in order, after the next sync.
    pub fn post_packet(&self, packet: Packet) {
        self.inner.post(packet);
    }

    /// Called with every packet the hub delivers to this leaf
    pub fn on_message<F>(&self, callback: F)
    where
        F: Fn(Packet) + Send + Sync + 'static,
    {
        self.inner.message_listeners.write().push(Arc::new(callback));
    }

    /// Called for every packet that will never be answered
    pub fn on_failure<F>(&self, callback: F)
    where
        F: Fn(Packet, DeliveryFailure) + Send + Sync + 'static,
    {
        self.inner.failure_listeners.write().push(Arc::new(callback));
    }

    /// Stop reconnecting and drop the link
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.shutdown.notify_one();
        if let Some(sender) = self.inner.link.lock().sender.take() {
            sender.close();
        }
        info!("Channel {} closed", self.inner.args.endpoint_name);
    }
}

impl ChannelInner {
    async fn run(self: Arc<Self>) {
        let name = self.args.endpoint_name.clone();

        while !self.closed.load(Ordering::SeqCst) {
            let connected = tokio::select! {
                res = self.connector.connect(&self.args) => res,
                _ = self.shutdown.notified() => break,
            };

            let (sender, receiver) = match connected {
                Ok(pair) => pair,
                Err(e) => {
                    debug!("Channel {} connect failed: {}", name, e);
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.reconnect_interval) => continue,
                        _ = self.shutdown.notified() => break,
                    }
                }
            };

            info!("Channel {} connected as {}", name, self.args.fingerprint);
            self.attach(sender);
            let keep_running = self.pump(receiver).await;
            self.link.lock().sender = None;
            if !keep_running {
                break;
            }
            info!("Channel {} disconnected, reconnecting", name);
            tokio::select! {
                _ = tokio::time::sleep(self.config.reconnect_interval) => {}
                _ = self.shutdown.notified() => break,
            }
        }

        debug!("Channel {} run loop ended", name);
    }

    /// Install a fresh link: sync first, then everything posted meanwhile
    fn attach(&self, sender: BoxedSender) {
        let sync = ChannelRequest::Sync {
            pending_responses: self.receipts.lock().entries().to_vec(),
            pending_deliveries: self.backlog.lock().pending_destinations(),
        };

        let mut link = self.link.lock();
        send_frame(&sender, &sync);
        for message in link.outbox.drain(..) {
            send_frame(&sender, &ChannelRequest::Deliver { message });
        }
        link.sender = Some(sender);
    }

    /// Returns `false` once the channel was closed
    async fn pump(&self, mut receiver: BoxedReceiver) -> bool {
        loop {
            let event = tokio::select! {
                ev = receiver.recv() => ev,
                _ = self.shutdown.notified() => return false,
            };
            match event {
                Some(TransportEvent::Data(data)) => match codec::decode::<ChannelStatus>(&data) {
                    Ok(status) => self.handle_status(status),
                    Err(e) => warn!("Channel {} got bad frame: {}", self.args.endpoint_name, e),
                },
                Some(TransportEvent::Disconnected { reason }) => {
                    debug!("Channel {} link down: {:?}", self.args.endpoint_name, reason);
                    return !self.closed.load(Ordering::SeqCst);
                }
                Some(TransportEvent::Error(e)) => {
                    warn!("Channel {} transport error: {}", self.args.endpoint_name, e);
                }
                Some(TransportEvent::Connected) => {}
                None => return !self.closed.load(Ordering::SeqCst),
            }
        }
    }

    fn post(&self, message: Packet) {
        let evicted = {
            let mut link = self.link.lock();
            match &link.sender {
                Some(sender) if sender.is_connected() && link.outbox.is_empty() => {
                    send_frame(sender, &ChannelRequest::Deliver { message });
                    None
                }
                _ => {
                    link.outbox.push_back(message);
                    if link.outbox.len() > self.config.max_backlog.max(1) {
                        link.outbox.pop_front()
                    } else {
                        None
                    }
                }
            }
        };

        if let Some(old) = evicted {
            warn!(
                "Channel {} outbox full, dropping '{}' ({})",
                self.args.endpoint_name, old.id, old.transaction_id
            );
            self.notify_failure(old, DeliveryFailure::BacklogOverflow);
        }
    }

    fn handle_status(&self, status: ChannelStatus) {
        match status {
            ChannelStatus::Undeliverable {
                message,
                resolved_destination,
            } => {
                debug!(
                    "'{}' undeliverable to {}, holding",
                    message.id, resolved_destination
                );
                let queued = self.backlog.lock().push(resolved_destination, message);
                if let Queued::Evicted(old) = queued {
                    warn!("Backlog full, dropping '{}' ({})", old.id, old.transaction_id);
                    self.notify_failure(old, DeliveryFailure::BacklogOverflow);
                }
            }
            ChannelStatus::Deliverable { deliverable_to } => {
                let ready = self.backlog.lock().take_for(&deliverable_to);
                debug!("{} held packet(s) now deliverable to {}", ready.len(), deliverable_to);
                for message in ready {
                    self.post(message);
                }
            }
            ChannelStatus::Delivered { receipt } => {
                if receipt.message.is_request() {
                    self.receipts.lock().add(receipt);
                }
            }
            ChannelStatus::Incoming { message } => {
                if message.is_reply() {
                    self.receipts.lock().remove_transaction(&message.transaction_id);
                }
                let listeners = self.message_listeners.read().clone();
                for listener in listeners {
                    listener(message.clone());
                }
            }
            ChannelStatus::Terminated { fingerprint } => {
                let orphaned = self.receipts.lock().take_destined_to(&fingerprint);
                if !orphaned.is_empty() {
                    info!(
                        "{} request(s) orphaned by terminated connection {}",
                        orphaned.len(),
                        fingerprint
                    );
                }
                for receipt in orphaned {
                    self.notify_failure(receipt.message, DeliveryFailure::Terminated);
                }
            }
        }
    }

    fn notify_failure(&self, packet: Packet, reason: DeliveryFailure) {
        let listeners = self.failure_listeners.read().clone();
        for listener in listeners {
            listener(packet.clone(), reason);
        }
    }
}

fn send_frame(sender: &BoxedSender, frame: &ChannelRequest) {
    match codec::encode(frame) {
        Ok(bytes) => {
            if let Err(e) = sender.send(bytes) {
                warn!("Failed to send channel frame: {}", e);
            }
        }
        Err(e) => warn!("Failed to encode channel frame: {}", e),
    }
}
