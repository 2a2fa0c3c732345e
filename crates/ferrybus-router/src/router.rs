//! Message router
//!
//! Every context runs one [`Router`]. It owns the context's request handlers
//! and open transactions, and decides for each packet whether to handle it
//! here or pass it along through its [`PacketRoute`].
//!
//! Loop freedom comes from hop stamps: a router forwards a packet it cannot
//! handle at most once, and answers with a terminal "no handler" error the
//! second time the packet finds it.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use ferrybus_core::{ContextKind, Endpoint, IncomingMessage, Packet, RuntimeInstance, Value};
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::error::{HandlerError, Result, RouterError};
use crate::transaction::{PendingReply, TransactionTable};

/// Where a router or relay hands packets it does not consume locally.
///
/// Implementations must not block; they post to a link or queue.
pub trait PacketRoute: Send + Sync {
    fn route(&self, packet: Packet);
}

impl<F> PacketRoute for F
where
    F: Fn(Packet) + Send + Sync,
{
    fn route(&self, packet: Packet) {
        self(packet)
    }
}

pub(crate) type BoxedHandler =
    Arc<dyn Fn(IncomingMessage) -> BoxFuture<'static, std::result::Result<Value, HandlerError>> + Send + Sync>;

struct RouterInner {
    instance: RuntimeInstance,
    /// Full address of this context, tab/frame included where it has one
    address: Endpoint,
    stamp: String,
    route: Arc<dyn PacketRoute>,
    transactions: TransactionTable,
    handlers: RwLock<HashMap<String, (u64, BoxedHandler)>>,
    next_handler: AtomicU64,
}

/// Per-context message router
#[derive(Clone)]
pub struct Router {
    inner: Arc<RouterInner>,
}

impl Router {
    pub fn new(instance: RuntimeInstance, route: Arc<dyn PacketRoute>) -> Self {
        let address = Endpoint::bare(instance.kind());
        Self::with_address(instance, address, route)
    }

    /// Router for a context living at a tab/frame-scoped address
    pub fn with_address(instance: RuntimeInstance, address: Endpoint, route: Arc<dyn PacketRoute>) -> Self {
        let stamp = instance.stamp();
        Self {
            inner: Arc::new(RouterInner {
                instance,
                address,
                stamp,
                route,
                transactions: TransactionTable::new(),
                handlers: RwLock::new(HashMap::new()),
                next_handler: AtomicU64::new(1),
            }),
        }
    }

    pub fn kind(&self) -> ContextKind {
        self.inner.instance.kind()
    }

    pub fn instance(&self) -> &RuntimeInstance {
        &self.inner.instance
    }

    /// Endpoint this router answers as, without tab or frame
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::bare(self.kind())
    }

    pub fn address(&self) -> Endpoint {
        self.inner.address
    }

    /// Handle that does not keep the router alive
    pub fn downgrade(&self) -> WeakRouter {
        WeakRouter {
            inner: Arc::downgrade(&self.inner),
        }
    }

    // =========================================================================
    // Handlers
    // =========================================================================

    /// Register the handler for a message name, replacing any previous one
    pub fn on<F, Fut>(&self, message_id: impl Into<String>, handler: F) -> HandlerHandle
    where
        F: Fn(IncomingMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Value, HandlerError>> + Send + 'static,
    {
        let message_id = message_id.into();
        let id = self.inner.next_handler.fetch_add(1, Ordering::Relaxed);
        let boxed: BoxedHandler = Arc::new(move |msg| handler(msg).boxed());

        if self
            .inner
            .handlers
            .write()
            .insert(message_id.clone(), (id, boxed))
            .is_some()
        {
            debug!("Replaced handler for '{}'", message_id);
        }

        HandlerHandle {
            router: Arc::downgrade(&self.inner),
            message_id,
            id,
        }
    }

    pub fn has_handler(&self, message_id: &str) -> bool {
        self.inner.handlers.read().contains_key(message_id)
    }

    // =========================================================================
    // Requests
    // =========================================================================

    /// Send a request to an endpoint given as text.
    ///
    /// Fails immediately if the destination does not parse.
    pub fn send(&self, message_id: &str, data: Value, destination: &str) -> Result<PendingReply> {
        let destination = Endpoint::parse(destination)?;
        Ok(self.send_to(message_id, data, destination))
    }

    pub fn send_to(&self, message_id: &str, data: Value, destination: Endpoint) -> PendingReply {
        let packet = Packet::request(message_id, data, self.endpoint(), destination);
        let pending = self.inner.transactions.open(&packet.transaction_id);
        debug!(
            "Request '{}' ({}) to {}",
            packet.id, packet.transaction_id, destination
        );
        self.handle_message(packet);
        pending
    }

    /// Reject a pending transaction as ended by the caller
    pub fn end_transaction(&self, transaction_id: &str) -> bool {
        self.fail_transaction(
            transaction_id,
            RouterError::TransactionEnded(transaction_id.to_string()),
        )
    }

    /// Reject a pending transaction with a specific error
    pub fn fail_transaction(&self, transaction_id: &str, error: RouterError) -> bool {
        self.inner.transactions.settle(transaction_id, Err(error))
    }

    pub fn pending_transactions(&self) -> usize {
        self.inner.transactions.len()
    }

    // =========================================================================
    // Routing
    // =========================================================================

    /// Entry point for every request or reply this context sees, whether it
    /// was created here or arrived over a link.
    pub fn handle_message(&self, mut packet: Packet) {
        let Some(destination) = packet.destination else {
            warn!("Dropping '{}' without destination", packet.id);
            return;
        };

        if !self.is_local(&destination) {
            packet.push_hop(&self.inner.stamp);
            self.inner.route.route(packet);
            return;
        }

        if packet.is_request() {
            self.handle_request(packet, destination);
        } else if packet.is_reply() {
            self.handle_reply(packet);
        } else {
            warn!("Router got broadcast '{}', ignoring", packet.id);
        }
    }

    fn is_local(&self, destination: &Endpoint) -> bool {
        destination.reaches(&self.inner.address)
    }

    fn handle_request(&self, mut packet: Packet, destination: Endpoint) {
        let handler = self
            .inner
            .handlers
            .read()
            .get(&packet.id)
            .map(|(_, h)| Arc::clone(h));

        match handler {
            Some(handler) => {
                let router = self.clone();
                tokio::spawn(async move {
                    let outcome = AssertUnwindSafe(handler(IncomingMessage::from(&packet)))
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|_| {
                            Err(HandlerError::new(
                                "HandlerPanic",
                                format!("handler for '{}' panicked", packet.id),
                            ))
                        });
                    if let Err(e) = &outcome {
                        debug!("Handler for '{}' failed: {}", packet.id, e);
                    }
                    let reply = packet.reply(router.endpoint(), outcome.map_err(|e| e.to_wire()));
                    router.handle_message(reply);
                });
            }
            None if !packet.has_visited(&self.inner.stamp) => {
                debug!(
                    "No handler for '{}' here, forwarding once",
                    packet.id
                );
                packet.push_hop(&self.inner.stamp);
                self.inner.route.route(packet);
            }
            None => {
                let error = RouterError::NoHandler {
                    message_id: packet.id.clone(),
                    destination: destination.format(),
                };
                warn!("{}", error);
                let reply = packet.reply(self.endpoint(), Err(error.to_wire()));
                self.handle_message(reply);
            }
        }
    }

    fn handle_reply(&self, mut packet: Packet) {
        let transaction_id = packet.transaction_id.clone();
        if self.inner.transactions.contains(&transaction_id) {
            let outcome = match packet.error.take() {
                Some(err) => Err(RouterError::from_wire(err)),
                None => Ok(packet.data),
            };
            self.inner.transactions.settle(&transaction_id, outcome);
        } else if !packet.has_visited(&self.inner.stamp) {
            packet.push_hop(&self.inner.stamp);
            self.inner.route.route(packet);
        } else {
            debug!(
                "Dropping reply for unknown transaction {} ('{}')",
                transaction_id, packet.id
            );
        }
    }
}

/// Non-owning router handle, for callbacks stored by something the router
/// itself routes through
#[derive(Clone)]
pub struct WeakRouter {
    inner: Weak<RouterInner>,
}

impl WeakRouter {
    pub fn upgrade(&self) -> Option<Router> {
        self.inner.upgrade().map(|inner| Router { inner })
    }
}

/// Keeps a handler registration; [`HandlerHandle::remove`] unregisters it
pub struct HandlerHandle {
    router: Weak<RouterInner>,
    message_id: String,
    id: u64,
}

impl HandlerHandle {
    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    /// Unregister, unless the handler has since been replaced
    pub fn remove(&self) -> bool {
        let Some(inner) = self.router.upgrade() else {
            return false;
        };
        let mut handlers = inner.handlers.write();
        match handlers.get(&self.message_id) {
            Some((id, _)) if *id == self.id => {
                handlers.remove(&self.message_id);
                true
            }
            _ => false,
        }
    }
}
