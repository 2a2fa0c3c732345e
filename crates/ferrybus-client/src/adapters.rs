//! Context adapters
//!
//! Wire a context's router and relay to its links: the hub switch for the
//! coordinator, a persistent channel for every other extension context, and
//! a page bridge between a content script and the page it is injected into.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use ferrybus_core::{codec, BridgeFrame, ContextKind, Endpoint, Packet, RuntimeInstance};
use ferrybus_router::{
    BroadcastRelay, DeliveryFailure, HubSwitch, PacketRoute, PersistentChannel, Router,
    RouterError, WeakRelay, WeakRouter,
};
use parking_lot::Mutex;
use ferrybus_transport::{BoxedReceiver, BoxedSender, Connector, TransportEvent, TransportServer};
use tracing::{debug, warn};

use crate::config::FabricConfig;

/// Both ends a content script or page holds of the bridge between them
pub type PageLink = (BoxedSender, BoxedReceiver);

/// Sending side of a page bridge
#[derive(Clone)]
pub struct PageBridge {
    sender: BoxedSender,
}

impl PageBridge {
    pub fn new(sender: BoxedSender) -> Self {
        Self { sender }
    }

    pub fn post(&self, frame: &BridgeFrame) {
        match codec::encode(frame) {
            Ok(bytes) => {
                if let Err(e) = self.sender.send(bytes) {
                    debug!("Page bridge send failed: {}", e);
                }
            }
            Err(e) => warn!("Failed to encode bridge frame: {}", e),
        }
    }

    pub fn post_packet(&self, packet: Packet) {
        self.post(&BridgeFrame::Packet { packet });
    }

    pub fn close(&self) {
        self.sender.close();
    }
}

impl PacketRoute for PageBridge {
    fn route(&self, packet: Packet) {
        self.post_packet(packet);
    }
}

/// Everything one initialized context holds
#[derive(Clone)]
pub(crate) struct Bindings {
    pub router: Router,
    pub relay: BroadcastRelay,
    pub channel: Option<PersistentChannel>,
    pub hub: Option<HubSwitch>,
    pub page: Option<PageBridge>,
}

impl Bindings {
    pub fn kind(&self) -> ContextKind {
        self.router.kind()
    }
}

fn end_on_failure(router: &Router, packet: &Packet, reason: DeliveryFailure) {
    let id = packet.transaction_id.clone();
    let error = match reason {
        DeliveryFailure::Terminated => RouterError::Terminated(id.clone()),
        DeliveryFailure::BacklogOverflow => RouterError::BacklogOverflow(id.clone()),
    };
    if router.fail_transaction(&id, error) {
        debug!("Transaction {} ('{}') failed: {:?}", id, packet.id, reason);
    }
}

/// Feed packets the hub delivers into the router or relay
fn dispatch_inbound(router: &Router, relay: &BroadcastRelay, packet: Packet) {
    if packet.is_broadcast() {
        relay.handle_event(packet);
    } else {
        router.handle_message(packet);
    }
}

/// Channel callbacks hold the router and relay weakly, as the channel is
/// itself held by their route
fn on_channel_message(channel: &PersistentChannel, router: WeakRouter, relay: WeakRelay) {
    channel.on_message(move |packet| match (router.upgrade(), relay.upgrade()) {
        (Some(r), Some(b)) => dispatch_inbound(&r, &b, packet),
        _ => debug!("Context gone, dropping '{}'", packet.id),
    });
}

// =========================================================================
// Coordinator
// =========================================================================

pub(crate) fn coordinator<S>(server: S, config: &FabricConfig) -> Bindings
where
    S: TransportServer + 'static,
{
    let instance = RuntimeInstance::new(ContextKind::Coordinator);
    let hub = HubSwitch::new(config.max_backlog);
    let route: Arc<dyn PacketRoute> = Arc::new(hub.downgrade());
    let router = Router::new(instance.clone(), Arc::clone(&route));
    let relay = BroadcastRelay::new(instance, route);
    hub.bind(router.clone(), relay.clone());

    let serving = hub.clone();
    tokio::spawn(async move {
        if let Err(e) = serving.serve_on(server).await {
            warn!("Hub stopped: {}", e);
        }
    });

    Bindings {
        router,
        relay,
        channel: None,
        hub: Some(hub),
        page: None,
    }
}

// =========================================================================
// Popup / options / devtools
// =========================================================================

pub(crate) fn extension_leaf(
    endpoint: Endpoint,
    connector: Arc<dyn Connector>,
    config: &FabricConfig,
) -> Bindings {
    let instance = RuntimeInstance::new(endpoint.context);
    let channel = PersistentChannel::open(endpoint.format(), connector, config.channel_config());

    let outbound = channel.clone();
    let route: Arc<dyn PacketRoute> = Arc::new(move |packet: Packet| outbound.post_packet(packet));
    let router = Router::with_address(instance.clone(), endpoint, Arc::clone(&route));
    let relay = BroadcastRelay::new(instance, route);

    on_channel_message(&channel, router.downgrade(), relay.downgrade());
    let r = router.downgrade();
    channel.on_failure(move |packet, reason| {
        if let Some(r) = r.upgrade() {
            end_on_failure(&r, &packet, reason);
        }
    });

    Bindings {
        router,
        relay,
        channel: Some(channel),
        hub: None,
        page: None,
    }
}

// =========================================================================
// Content script
// =========================================================================

/// Origins of requests the content script passed into its page, by
/// transaction id
///
/// The page cannot claim any origin but `window` for what it sends. A request
/// the page forwards back out unhandled keeps the origin it went in with, so
/// its eventual reply still finds the caller. Oldest entries go first once
/// `capacity` is reached.
struct PageOrigins {
    origins: HashMap<String, Endpoint>,
    order: VecDeque<String>,
    capacity: usize,
}

impl PageOrigins {
    fn new(capacity: usize) -> Self {
        Self {
            origins: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    fn record(&mut self, transaction_id: &str, origin: Endpoint) {
        if self.origins.insert(transaction_id.to_string(), origin).is_none() {
            self.order.push_back(transaction_id.to_string());
        }
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.origins.remove(&oldest);
            }
        }
    }

    /// Origin to give a packet coming out of the page
    fn restore(&mut self, packet: &Packet) -> Endpoint {
        let page = Endpoint::bare(ContextKind::Window);
        if packet.is_request() {
            self.origins
                .get(&packet.transaction_id)
                .copied()
                .unwrap_or(page)
        } else {
            if packet.is_reply() && self.origins.remove(&packet.transaction_id).is_some() {
                self.order.retain(|id| id != &packet.transaction_id);
            }
            page
        }
    }
}

/// Sends page-bound packets over the bridge, the rest to the hub
struct ContentScriptRoute {
    /// The page this script is injected into, as the hub addresses it
    page_address: Endpoint,
    channel: PersistentChannel,
    page: Option<PageBridge>,
    origins: Arc<Mutex<PageOrigins>>,
}

impl PacketRoute for ContentScriptRoute {
    fn route(&self, mut packet: Packet) {
        if !packet.destination.is_some_and(|d| d.reaches(&self.page_address)) {
            self.channel.post_packet(packet);
            return;
        }

        match &self.page {
            Some(page) => {
                if packet.is_request() {
                    self.origins.lock().record(&packet.transaction_id, packet.origin);
                }
                // the page only knows itself as a bare window
                packet.destination = Some(Endpoint::bare(ContextKind::Window));
                page.post_packet(packet);
            }
            None if packet.is_request() => {
                let error = RouterError::NoHandler {
                    message_id: packet.id.clone(),
                    destination: self.page_address.format(),
                };
                warn!("{}: no page attached", error);
                let reply = packet.reply(self.page_address, Err(error.to_wire()));
                self.channel.post_packet(reply);
            }
            None => warn!(
                "No page attached, dropping '{}' for {}",
                packet.id, self.page_address
            ),
        }
    }
}

pub(crate) fn content_script(
    tab_id: u32,
    frame_id: u32,
    connector: Arc<dyn Connector>,
    page: Option<PageLink>,
    config: &FabricConfig,
) -> Bindings {
    let endpoint = Endpoint::in_frame(ContextKind::ContentScript, tab_id, frame_id);
    let instance = RuntimeInstance::new(ContextKind::ContentScript);
    let channel = PersistentChannel::open(endpoint.format(), connector, config.channel_config());
    let origins = Arc::new(Mutex::new(PageOrigins::new(config.max_backlog)));

    let (bridge, page_rx) = match page {
        Some((tx, rx)) => (Some(PageBridge::new(tx)), Some(rx)),
        None => (None, None),
    };

    let route: Arc<dyn PacketRoute> = Arc::new(ContentScriptRoute {
        page_address: Endpoint::in_frame(ContextKind::Window, tab_id, frame_id),
        channel: channel.clone(),
        page: bridge.clone(),
        origins: Arc::clone(&origins),
    });
    let router = Router::with_address(instance.clone(), endpoint, Arc::clone(&route));
    let relay = match &bridge {
        Some(b) => BroadcastRelay::with_local_event(instance, route, Arc::new(b.clone())),
        None => BroadcastRelay::new(instance, route),
    };

    on_channel_message(&channel, router.downgrade(), relay.downgrade());

    let r = router.downgrade();
    let failure_page = bridge.clone();
    channel.on_failure(move |packet, reason| match &failure_page {
        Some(page) if packet.origin.context == ContextKind::Window => {
            debug!("Telling page transaction {} won't complete", packet.transaction_id);
            page.post(&BridgeFrame::EndpointWontRespond {
                transaction_id: packet.transaction_id,
            });
        }
        _ => {
            if let Some(r) = r.upgrade() {
                end_on_failure(&r, &packet, reason);
            }
        }
    });

    if let Some(rx) = page_rx {
        let (r, b) = (router.clone(), relay.clone());
        spawn_bridge_pump("content-script", rx, move |frame| match frame {
            BridgeFrame::Packet { mut packet } => {
                packet.origin = origins.lock().restore(&packet);
                dispatch_inbound(&r, &b, packet);
            }
            BridgeFrame::EndpointWontRespond { transaction_id } => {
                debug!("Ignoring won't-respond for {} from page", transaction_id);
            }
        });
    }

    Bindings {
        router,
        relay,
        channel: Some(channel),
        hub: None,
        page: bridge,
    }
}

// =========================================================================
// Window
// =========================================================================

pub(crate) fn window(page: PageLink) -> Bindings {
    let (tx, rx) = page;
    let instance = RuntimeInstance::new(ContextKind::Window);
    let bridge = PageBridge::new(tx);
    let route: Arc<dyn PacketRoute> = Arc::new(bridge.clone());
    let router = Router::new(instance.clone(), Arc::clone(&route));
    let relay = BroadcastRelay::new(instance, route);

    let (r, b) = (router.clone(), relay.clone());
    spawn_bridge_pump("window", rx, move |frame| match frame {
        BridgeFrame::Packet { packet } => dispatch_inbound(&r, &b, packet),
        BridgeFrame::EndpointWontRespond { transaction_id } => {
            let error = RouterError::Terminated(transaction_id.clone());
            r.fail_transaction(&transaction_id, error);
        }
    });

    Bindings {
        router,
        relay,
        channel: None,
        hub: None,
        page: Some(bridge),
    }
}

fn spawn_bridge_pump<F>(side: &'static str, mut rx: BoxedReceiver, on_frame: F)
where
    F: Fn(BridgeFrame) + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                TransportEvent::Data(data) => match codec::decode::<BridgeFrame>(&data) {
                    Ok(frame) => on_frame(frame),
                    Err(e) => warn!("{} bridge: bad frame: {}", side, e),
                },
                TransportEvent::Disconnected { reason } => {
                    debug!("{} bridge closed: {:?}", side, reason);
                    break;
                }
                TransportEvent::Error(e) => warn!("{} bridge error: {}", side, e),
                TransportEvent::Connected => {}
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn popup_request() -> Packet {
        Packet::request(
            "ping",
            json!(1),
            Endpoint::bare(ContextKind::Popup),
            Endpoint::in_tab(ContextKind::Window, 4),
        )
    }

    #[test]
    fn test_page_keeps_origin_of_forwarded_requests() {
        let mut origins = PageOrigins::new(8);
        let req = popup_request();
        origins.record(&req.transaction_id, req.origin);

        let mut from_page = req.clone();
        from_page.origin = Endpoint::bare(ContextKind::Window);
        assert_eq!(origins.restore(&from_page), Endpoint::bare(ContextKind::Popup));

        // the page's reply ends the entry
        let reply = req.reply(Endpoint::bare(ContextKind::Popup), Ok(json!(2)));
        assert_eq!(origins.restore(&reply), Endpoint::bare(ContextKind::Window));
        assert_eq!(origins.restore(&from_page), Endpoint::bare(ContextKind::Window));
    }

    #[test]
    fn test_page_requests_are_window() {
        let mut origins = PageOrigins::new(8);
        let forged = popup_request();
        assert_eq!(origins.restore(&forged), Endpoint::bare(ContextKind::Window));
    }

    #[test]
    fn test_page_origins_bounded() {
        let mut origins = PageOrigins::new(2);
        let reqs: Vec<Packet> = (0..3).map(|_| popup_request()).collect();
        for req in &reqs {
            origins.record(&req.transaction_id, req.origin);
        }
        assert_eq!(origins.origins.len(), 2);
        assert_eq!(origins.restore(&reqs[0]), Endpoint::bare(ContextKind::Window));
        assert_eq!(origins.restore(&reqs[2]), Endpoint::bare(ContextKind::Popup));
    }
}
