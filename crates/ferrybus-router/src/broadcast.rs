//! Broadcast relay
//!
//! Events are fire-and-forget. A leaf never runs its own listeners for an
//! event it emits; it stamps the packet and sends it to the hub, and local
//! listeners only fire when the hub's fan-out comes back. The hub runs its
//! listeners for events it originates and for every relayed event.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use ferrybus_core::{ContextKind, Endpoint, IncomingMessage, Packet, RuntimeInstance, Value};
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::error::{HandlerError, Result, RouterError};
use crate::router::PacketRoute;

type BoxedListener =
    Arc<dyn Fn(IncomingMessage) -> BoxFuture<'static, std::result::Result<(), HandlerError>> + Send + Sync>;

struct RelayInner {
    instance: RuntimeInstance,
    stamp: String,
    route: Arc<dyn PacketRoute>,
    local_event: Option<Arc<dyn PacketRoute>>,
    listeners: RwLock<HashMap<String, Vec<(u64, BoxedListener)>>>,
    next_listener: AtomicU64,
}

/// Per-context broadcast relay
#[derive(Clone)]
pub struct BroadcastRelay {
    inner: Arc<RelayInner>,
}

#[derive(Clone)]
pub struct WeakRelay {
    inner: Weak<RelayInner>,
}

impl WeakRelay {
    pub fn upgrade(&self) -> Option<BroadcastRelay> {
        self.inner.upgrade().map(|inner| BroadcastRelay { inner })
    }
}

impl BroadcastRelay {
    pub fn new(instance: RuntimeInstance, route: Arc<dyn PacketRoute>) -> Self {
        Self::build(instance, route, None)
    }

    /// Relay with a hook that sees every event before local listeners run.
    ///
    /// A content script uses this to mirror hub events into its page.
    pub fn with_local_event(
        instance: RuntimeInstance,
        route: Arc<dyn PacketRoute>,
        local_event: Arc<dyn PacketRoute>,
    ) -> Self {
        Self::build(instance, route, Some(local_event))
    }

    fn build(
        instance: RuntimeInstance,
        route: Arc<dyn PacketRoute>,
        local_event: Option<Arc<dyn PacketRoute>>,
    ) -> Self {
        let stamp = instance.stamp();
        Self {
            inner: Arc::new(RelayInner {
                instance,
                stamp,
                route,
                local_event,
                listeners: RwLock::new(HashMap::new()),
                next_listener: AtomicU64::new(1),
            }),
        }
    }

    pub fn kind(&self) -> ContextKind {
        self.inner.instance.kind()
    }

    /// Handle that does not keep the relay alive
    pub fn downgrade(&self) -> WeakRelay {
        WeakRelay {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Add a listener; listeners for one event run in registration order
    pub fn on_event<F, Fut>(&self, event_id: impl Into<String>, listener: F) -> ListenerHandle
    where
        F: Fn(IncomingMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), HandlerError>> + Send + 'static,
    {
        let boxed: BoxedListener = Arc::new(move |msg| listener(msg).boxed());
        let handle = ListenerHandle {
            relay: Arc::downgrade(&self.inner),
            event_id: event_id.into(),
            id: AtomicU64::new(0),
            listener: boxed,
            attached: AtomicBool::new(false),
        };
        handle.restore();
        handle
    }

    pub fn listener_count(&self, event_id: &str) -> usize {
        self.inner
            .listeners
            .read()
            .get(event_id)
            .map_or(0, Vec::len)
    }

    /// Emit an event from this context.
    ///
    /// On the hub, local listeners run before this resolves and any listener
    /// failures come back as one aggregate error.
    pub async fn emit(&self, event_id: &str, data: Value) -> Result<()> {
        let packet = Packet::broadcast(event_id, data, Endpoint::bare(self.kind()));
        match self.accept(packet) {
            Some(local) => self.dispatch(&local).await,
            None => Ok(()),
        }
    }

    /// Handle a broadcast that arrived over a link. Local listeners run in
    /// a spawned task; failures are logged.
    pub fn handle_event(&self, packet: Packet) {
        if let Some(local) = self.accept(packet) {
            let relay = self.clone();
            tokio::spawn(async move {
                if let Err(e) = relay.dispatch(&local).await {
                    warn!("{}", e);
                }
            });
        }
    }

    /// Forward as needed and return the packet if local listeners should run
    fn accept(&self, mut packet: Packet) -> Option<Packet> {
        let relayed = packet.relayed_via_hub();
        let hub_origin = self.kind().is_hub() && packet.origin.context == self.kind();

        if relayed || hub_origin {
            if let Some(hook) = &self.inner.local_event {
                hook.route(packet.clone());
            }
            if relayed {
                return Some(packet);
            }
            let local = packet.clone();
            packet.push_hop(&self.inner.stamp);
            self.inner.route.route(packet);
            return Some(local);
        }

        packet.push_hop(&self.inner.stamp);
        self.inner.route.route(packet);
        None
    }

    /// Run every listener for the event, in order, then report failures
    pub async fn dispatch(&self, packet: &Packet) -> Result<()> {
        let listeners: Vec<BoxedListener> = self
            .inner
            .listeners
            .read()
            .get(&packet.id)
            .map(|ls| ls.iter().map(|(_, l)| Arc::clone(l)).collect())
            .unwrap_or_default();

        if listeners.is_empty() {
            debug!("No listeners for event '{}'", packet.id);
            return Ok(());
        }

        let message = IncomingMessage::from(packet);
        let mut errors = Vec::new();
        for listener in listeners {
            let outcome = AssertUnwindSafe(listener(message.clone()))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(HandlerError::new("HandlerPanic", "listener panicked")));
            if let Err(e) = outcome {
                errors.push(e);
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(RouterError::AggregateBroadcast {
                event_id: packet.id.clone(),
                errors,
            })
        }
    }
}

/// A listener registration that can be detached and re-attached
pub struct ListenerHandle {
    relay: Weak<RelayInner>,
    event_id: String,
    id: AtomicU64,
    listener: BoxedListener,
    attached: AtomicBool,
}

impl ListenerHandle {
    pub fn event_id(&self) -> &str {
        &self.event_id
    }

    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::SeqCst)
    }

    /// Detach the listener
    pub fn remove(&self) -> bool {
        let Some(inner) = self.relay.upgrade() else {
            return false;
        };
        if !self.attached.swap(false, Ordering::SeqCst) {
            return false;
        }
        let id = self.id.load(Ordering::SeqCst);
        let mut listeners = inner.listeners.write();
        if let Some(list) = listeners.get_mut(&self.event_id) {
            list.retain(|(lid, _)| *lid != id);
            if list.is_empty() {
                listeners.remove(&self.event_id);
            }
        }
        true
    }

    /// Re-attach after [`remove`](Self::remove). The listener goes to the
    /// back of the order.
    pub fn restore(&self) -> bool {
        let Some(inner) = self.relay.upgrade() else {
            return false;
        };
        if self.attached.swap(true, Ordering::SeqCst) {
            return false;
        }
        let id = inner.next_listener.fetch_add(1, Ordering::Relaxed);
        self.id.store(id, Ordering::SeqCst);
        inner
            .listeners
            .write()
            .entry(self.event_id.clone())
            .or_default()
            .push((id, Arc::clone(&self.listener)));
        true
    }
}
