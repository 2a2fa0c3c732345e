//! Common test helpers and utilities for ferrybus tests
//!
//! This crate provides:
//! - Condition-based waiting (no hardcoded sleeps)
//! - An in-memory extension topology with a restartable hub
//! - Collectors for events and messages seen by listeners

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Once};
use std::time::{Duration, Instant};

use ferrybus_client::{Fabric, FabricConfig, PageLink};
use ferrybus_core::{IncomingMessage, Value};
use ferrybus_router::HandlerError;
use ferrybus_transport::{memory_pair, Connector, MemoryNetwork};

/// Default test timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default condition check interval
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_millis(10);

// ============================================================================
// Logging
// ============================================================================

static TRACING: Once = Once::new();

/// Install a test-friendly subscriber once; honours `RUST_LOG`
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

// ============================================================================
// Condition-Based Waiting
// ============================================================================

/// Wait for a condition with timeout - condition-based, not time-based
pub async fn wait_for<F, Fut>(check: F, interval: Duration, max_wait: Duration) -> bool
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let start = Instant::now();
    while start.elapsed() < max_wait {
        if check().await {
            return true;
        }
        tokio::time::sleep(interval).await;
    }
    false
}

/// Wait for an atomic counter to reach a target value
pub async fn wait_for_count(counter: &AtomicU32, target: u32, max_wait: Duration) -> bool {
    wait_for(
        || async { counter.load(Ordering::SeqCst) >= target },
        DEFAULT_CHECK_INTERVAL,
        max_wait,
    )
    .await
}

// ============================================================================
// Test Topology
// ============================================================================

/// An in-memory extension: one network, one hub, any number of leaves.
///
/// The hub can be restarted to simulate the coordinator being recycled.
pub struct TestTopology {
    network: MemoryNetwork,
    config: FabricConfig,
    hub: Fabric,
}

impl TestTopology {
    /// Start a hub with a short reconnect interval
    pub fn start() -> Self {
        Self::start_with_config(FabricConfig {
            reconnect_interval_ms: 20,
            ..FabricConfig::default()
        })
    }

    pub fn start_with_config(config: FabricConfig) -> Self {
        init_tracing();
        let network = MemoryNetwork::new();
        let hub = Self::new_hub(&network, &config);
        Self {
            network,
            config,
            hub,
        }
    }

    fn new_hub(network: &MemoryNetwork, config: &FabricConfig) -> Fabric {
        let hub = Fabric::new(config.clone());
        hub.init_coordinator(network.listen())
            .unwrap_or_else(|e| panic!("hub init failed: {}", e));
        hub
    }

    pub fn network(&self) -> &MemoryNetwork {
        &self.network
    }

    pub fn hub(&self) -> &Fabric {
        &self.hub
    }

    fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(self.network.clone())
    }

    fn leaf(&self) -> Fabric {
        Fabric::new(self.config.clone())
    }

    pub fn popup(&self) -> Fabric {
        let fabric = self.leaf();
        fabric
            .init_popup(self.connector())
            .unwrap_or_else(|e| panic!("popup init failed: {}", e));
        fabric
    }

    pub fn options(&self) -> Fabric {
        let fabric = self.leaf();
        fabric
            .init_options(self.connector())
            .unwrap_or_else(|e| panic!("options init failed: {}", e));
        fabric
    }

    pub fn devtools(&self, tab_id: u32) -> Fabric {
        let fabric = self.leaf();
        fabric
            .init_devtools(self.connector(), tab_id)
            .unwrap_or_else(|e| panic!("devtools init failed: {}", e));
        fabric
    }

    pub fn content_script(&self, tab_id: u32, frame_id: u32) -> Fabric {
        let fabric = self.leaf();
        fabric
            .init_content_script(self.connector(), tab_id, frame_id, None)
            .unwrap_or_else(|e| panic!("content script init failed: {}", e));
        fabric
    }

    /// A content script and the page it is bridged to
    pub fn content_script_with_page(&self, tab_id: u32, frame_id: u32) -> (Fabric, Fabric) {
        let ((cs_tx, cs_rx), (page_tx, page_rx)) = memory_pair();
        let script_end: PageLink = (Arc::new(cs_tx), Box::new(cs_rx));
        let page_end: PageLink = (Arc::new(page_tx), Box::new(page_rx));

        let content_script = self.leaf();
        content_script
            .init_content_script(self.connector(), tab_id, frame_id, Some(script_end))
            .unwrap_or_else(|e| panic!("content script init failed: {}", e));

        let window = self.leaf();
        window
            .init_window(page_end)
            .unwrap_or_else(|e| panic!("window init failed: {}", e));

        (content_script, window)
    }

    /// Wait until the hub holds `n` leaf connections
    pub async fn wait_for_connections(&self, n: usize) -> bool {
        let hub = match self.hub.hub() {
            Ok(hub) => hub,
            Err(_) => return false,
        };
        wait_for(
            || async { hub.connection_count() == n },
            DEFAULT_CHECK_INTERVAL,
            DEFAULT_TIMEOUT,
        )
        .await
    }

    /// Replace the hub with a fresh instance. Every leaf link is severed and
    /// leaves reconnect to the new hub on their own.
    pub fn restart_hub(&mut self) -> &Fabric {
        self.network.shutdown();
        self.hub.shutdown();
        self.network.sever_all();
        self.hub = Self::new_hub(&self.network, &self.config);
        &self.hub
    }
}

// ============================================================================
// Collectors
// ============================================================================

/// Records every message a listener or handler sees
#[derive(Clone, Default)]
pub struct MessageCollector {
    messages: Arc<parking_lot::Mutex<Vec<IncomingMessage>>>,
    count: Arc<AtomicU32>,
}

impl MessageCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// A broadcast listener that records and succeeds
    pub fn listener(
        &self,
    ) -> impl Fn(IncomingMessage) -> std::future::Ready<Result<(), HandlerError>> + Send + Sync + 'static
    {
        let collector = self.clone();
        move |msg| {
            collector.record(msg);
            std::future::ready(Ok(()))
        }
    }

    /// A request handler that records and answers `reply`
    pub fn handler(
        &self,
        reply: Value,
    ) -> impl Fn(IncomingMessage) -> std::future::Ready<Result<Value, HandlerError>> + Send + Sync + 'static
    {
        let collector = self.clone();
        move |msg| {
            collector.record(msg);
            std::future::ready(Ok(reply.clone()))
        }
    }

    pub fn record(&self, msg: IncomingMessage) {
        self.messages.lock().push(msg);
        self.count.fetch_add(1, Ordering::SeqCst);
    }

    pub fn count(&self) -> u32 {
        self.count.load(Ordering::SeqCst)
    }

    /// Wait for at least n messages
    pub async fn wait_for_count(&self, n: u32, max_wait: Duration) -> bool {
        wait_for_count(&self.count, n, max_wait).await
    }

    pub fn messages(&self) -> Vec<IncomingMessage> {
        self.messages.lock().clone()
    }

    pub fn last(&self) -> Option<IncomingMessage> {
        self.messages.lock().last().cloned()
    }

    pub fn clear(&self) {
        self.messages.lock().clear();
        self.count.store(0, Ordering::SeqCst);
    }
}
