//! The per-context messaging entry point

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use ferrybus_core::{ContextKind, Endpoint, IncomingMessage, Value};
use ferrybus_router::{
    BroadcastRelay, HandlerError, HandlerHandle, HubSwitch, ListenerHandle, PendingReply,
    PersistentChannel, Router,
};
use ferrybus_transport::{Connector, TransportServer};
use tracing::info;

use crate::adapters::{self, Bindings, PageLink};
use crate::builder::FabricBuilder;
use crate::config::FabricConfig;
use crate::error::{ClientError, Result};

/// Messaging for one execution context.
///
/// Construct it, initialize it exactly once for the context it runs in, then
/// use it. Every `init_*` spawns background tasks and needs a tokio runtime.
pub struct Fabric {
    config: FabricConfig,
    initializing: AtomicBool,
    bindings: OnceLock<Bindings>,
}

impl Default for Fabric {
    fn default() -> Self {
        Self::new(FabricConfig::default())
    }
}

impl Fabric {
    pub fn new(config: FabricConfig) -> Self {
        Self {
            config,
            initializing: AtomicBool::new(false),
            bindings: OnceLock::new(),
        }
    }

    /// Create a builder
    pub fn builder() -> FabricBuilder {
        FabricBuilder::new()
    }

    pub fn config(&self) -> &FabricConfig {
        &self.config
    }

    // =========================================================================
    // Initialization
    // =========================================================================

    /// Run as the hub, accepting leaf connections from `server`
    pub fn init_coordinator<S>(&self, server: S) -> Result<()>
    where
        S: TransportServer + 'static,
    {
        self.install(|config| adapters::coordinator(server, config))
    }

    pub fn init_popup(&self, connector: Arc<dyn Connector>) -> Result<()> {
        self.install(|config| {
            adapters::extension_leaf(Endpoint::bare(ContextKind::Popup), connector, config)
        })
    }

    pub fn init_options(&self, connector: Arc<dyn Connector>) -> Result<()> {
        self.install(|config| {
            adapters::extension_leaf(Endpoint::bare(ContextKind::Options), connector, config)
        })
    }

    /// Devtools panel inspecting `tab_id`
    pub fn init_devtools(&self, connector: Arc<dyn Connector>, tab_id: u32) -> Result<()> {
        self.install(|config| {
            adapters::extension_leaf(
                Endpoint::in_tab(ContextKind::Devtools, tab_id),
                connector,
                config,
            )
        })
    }

    /// Content script in a tab/frame, optionally bridged to its page
    pub fn init_content_script(
        &self,
        connector: Arc<dyn Connector>,
        tab_id: u32,
        frame_id: u32,
        page: Option<PageLink>,
    ) -> Result<()> {
        self.install(|config| adapters::content_script(tab_id, frame_id, connector, page, config))
    }

    /// Page script, reachable only through its content script's bridge
    pub fn init_window(&self, page: PageLink) -> Result<()> {
        self.install(|_| adapters::window(page))
    }

    fn install<F>(&self, build: F) -> Result<()>
    where
        F: FnOnce(&FabricConfig) -> Bindings,
    {
        if self.initializing.swap(true, Ordering::SeqCst) {
            return Err(ClientError::AlreadyInitialized);
        }
        let bindings = build(&self.config);
        info!("Fabric initialized as {}", bindings.kind());
        let _ = self.bindings.set(bindings);
        Ok(())
    }

    fn bindings(&self) -> Result<&Bindings> {
        self.bindings.get().ok_or(ClientError::NotInitialized)
    }

    // =========================================================================
    // Messaging
    // =========================================================================

    /// Send a request. Fails at once if the destination does not parse.
    pub fn send(&self, message_id: &str, data: Value, destination: &str) -> Result<PendingReply> {
        Ok(self.bindings()?.router.send(message_id, data, destination)?)
    }

    /// Send a request and wait for its reply
    pub async fn request(&self, message_id: &str, data: Value, destination: &str) -> Result<Value> {
        let pending = self.send(message_id, data, destination)?;
        Ok(pending.await?)
    }

    /// Register the handler for a message name
    pub fn on<F, Fut>(&self, message_id: &str, handler: F) -> Result<HandlerHandle>
    where
        F: Fn(IncomingMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Value, HandlerError>> + Send + 'static,
    {
        Ok(self.bindings()?.router.on(message_id, handler))
    }

    /// Broadcast an event
    pub async fn emit(&self, event_id: &str, data: Value) -> Result<()> {
        let relay = self.bindings()?.relay.clone();
        Ok(relay.emit(event_id, data).await?)
    }

    pub fn on_event<F, Fut>(&self, event_id: &str, listener: F) -> Result<ListenerHandle>
    where
        F: Fn(IncomingMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), HandlerError>> + Send + 'static,
    {
        Ok(self.bindings()?.relay.on_event(event_id, listener))
    }

    /// Give up on a pending request; its future rejects as ended
    pub fn end_transaction(&self, transaction_id: &str) -> Result<bool> {
        Ok(self.bindings()?.router.end_transaction(transaction_id))
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    pub fn is_initialized(&self) -> bool {
        self.bindings.get().is_some()
    }

    pub fn kind(&self) -> Option<ContextKind> {
        self.bindings.get().map(Bindings::kind)
    }

    pub fn router(&self) -> Result<Router> {
        Ok(self.bindings()?.router.clone())
    }

    pub fn relay(&self) -> Result<BroadcastRelay> {
        Ok(self.bindings()?.relay.clone())
    }

    pub fn channel(&self) -> Result<PersistentChannel> {
        let bindings = self.bindings()?;
        bindings
            .channel
            .clone()
            .ok_or(ClientError::Unsupported(bindings.kind(), "hub channel"))
    }

    pub fn hub(&self) -> Result<HubSwitch> {
        let bindings = self.bindings()?;
        bindings
            .hub
            .clone()
            .ok_or(ClientError::Unsupported(bindings.kind(), "hub switch"))
    }

    /// Drop this context's links. A hub closes every leaf link and stops
    /// accepting once its pending accept returns.
    pub fn shutdown(&self) {
        let Some(bindings) = self.bindings.get() else {
            return;
        };
        if let Some(channel) = &bindings.channel {
            channel.close();
        }
        if let Some(page) = &bindings.page {
            page.close();
        }
        if let Some(hub) = &bindings.hub {
            hub.stop();
        }
        info!("Fabric for {} shut down", bindings.kind());
    }
}
