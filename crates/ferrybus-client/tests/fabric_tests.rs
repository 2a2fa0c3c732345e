//! Fabric Tests (ferrybus-client)
//!
//! End-to-end messaging across an in-memory extension:
//! - Requests between leaves through the hub
//! - Broadcast fan-out and listener errors
//! - Failure paths (no handler, termination, ended transactions)
//! - Hub restart recovery
//! - Page bridge through a content script

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ferrybus_client::{ClientError, Fabric, FabricConfig};
use ferrybus_core::{ContextKind, Endpoint};
use ferrybus_router::{HandlerError, RouterError};
use ferrybus_test_utils::{wait_for, MessageCollector, TestTopology, DEFAULT_CHECK_INTERVAL, DEFAULT_TIMEOUT};
use serde_json::json;
use tokio::time::timeout;

fn ping_handler(
    msg: ferrybus_core::IncomingMessage,
) -> std::future::Ready<Result<serde_json::Value, HandlerError>> {
    let outcome = msg
        .data
        .get("n")
        .and_then(|n| n.as_i64())
        .ok_or_else(|| anyhow::anyhow!("missing n"))
        .map(|n| json!(n + 1))
        .map_err(HandlerError::from);
    std::future::ready(outcome)
}

// ============================================================================
// Requests
// ============================================================================

#[tokio::test]
async fn test_request_between_leaves() {
    let topo = TestTopology::start();
    let popup = topo.popup();
    let cs = topo.content_script(7, 0);
    cs.on("ping", ping_handler).unwrap();
    assert!(topo.wait_for_connections(2).await);

    let reply = timeout(DEFAULT_TIMEOUT, popup.request("ping", json!({"n": 1}), "content-script@7"))
        .await
        .expect("request timed out")
        .expect("request failed");
    assert_eq!(reply, json!(2));
}

#[tokio::test]
async fn test_hub_handler_and_sender() {
    let topo = TestTopology::start();
    let collector = MessageCollector::new();
    topo.hub().on("whoami", collector.handler(json!("hub"))).unwrap();
    let devtools = topo.devtools(3);

    let reply = timeout(DEFAULT_TIMEOUT, devtools.request("whoami", json!(null), "coordinator"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply, json!("hub"));

    let seen = collector.last().unwrap();
    assert_eq!(seen.sender, Endpoint::in_tab(ContextKind::Devtools, 3));
}

#[tokio::test]
async fn test_request_waits_for_destination() {
    let topo = TestTopology::start();
    let popup = topo.popup();
    assert!(topo.wait_for_connections(1).await);

    let pending = popup.send("ping", json!({"n": 41}), "content-script@9").unwrap();
    assert!(wait_for(
        || async { popup.channel().map(|c| c.backlog_len() == 1).unwrap_or(false) },
        DEFAULT_CHECK_INTERVAL,
        DEFAULT_TIMEOUT,
    )
    .await);

    let calls = Arc::new(AtomicU32::new(0));
    let counted = Arc::clone(&calls);
    let cs = topo.content_script(9, 0);
    cs.on("ping", move |msg| {
        counted.fetch_add(1, Ordering::SeqCst);
        ping_handler(msg)
    })
    .unwrap();

    let reply = timeout(DEFAULT_TIMEOUT, pending).await.unwrap().unwrap();
    assert_eq!(reply, json!(42));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_handler_error_reaches_caller() {
    let topo = TestTopology::start();
    let options = topo.options();
    let cs = topo.content_script(2, 0);
    cs.on("validate", |_| async {
        Err(HandlerError::new("ValidationError", "field is required").with_field("field", "email"))
    })
    .unwrap();
    cs.on("ping", ping_handler).unwrap();
    assert!(topo.wait_for_connections(2).await);

    match options.request("validate", json!({}), "content-script@2").await {
        Err(ClientError::Router(RouterError::Handler(e))) => {
            assert_eq!(e.name, "ValidationError");
            assert_eq!(e.message, "field is required");
            assert_eq!(e.fields["field"], "email");
        }
        other => panic!("unexpected {:?}", other),
    }

    // anyhow errors surface under the generic name
    match options.request("ping", json!({}), "content-script@2").await {
        Err(ClientError::Router(RouterError::Handler(e))) => {
            assert_eq!(e.name, "Error");
            assert_eq!(e.message, "missing n");
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn test_no_handler_rejects() {
    let topo = TestTopology::start();
    let popup = topo.popup();
    let _cs = topo.content_script(4, 0);
    assert!(topo.wait_for_connections(2).await);

    let outcome = timeout(DEFAULT_TIMEOUT, popup.request("ping", json!({"n": 1}), "content-script@4"))
        .await
        .expect("no-handler reply never arrived");
    match outcome {
        Err(ClientError::Router(RouterError::NoHandler {
            message_id,
            destination,
        })) => {
            assert_eq!(message_id, "ping");
            assert!(destination.starts_with("content-script@4"), "{}", destination);
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn test_bad_destination_fails_immediately() {
    let topo = TestTopology::start();
    let popup = topo.popup();
    assert!(matches!(
        popup.send("ping", json!(null), "popup@3"),
        Err(ClientError::Router(RouterError::Core(_)))
    ));
    assert!(popup.send("ping", json!(null), "nowhere").is_err());
}

#[tokio::test]
async fn test_end_transaction() {
    let topo = TestTopology::start();
    let popup = topo.popup();

    let pending = popup.send("ping", json!({"n": 1}), "content-script@12").unwrap();
    let id = pending.transaction_id().to_string();
    assert!(popup.end_transaction(&id).unwrap());
    assert!(!popup.end_transaction(&id).unwrap());

    match timeout(DEFAULT_TIMEOUT, pending).await.unwrap() {
        Err(RouterError::TransactionEnded(ended)) => assert_eq!(ended, id),
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn test_destination_terminated() {
    let topo = TestTopology::start();
    let popup = topo.popup();
    let cs = topo.content_script(5, 0);
    let collector = MessageCollector::new();
    let seen = collector.clone();
    cs.on("slow", move |msg| {
        seen.record(msg);
        async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(json!("too late"))
        }
    })
    .unwrap();
    assert!(topo.wait_for_connections(2).await);

    let pending = popup.send("slow", json!(null), "content-script@5").unwrap();
    assert!(collector.wait_for_count(1, DEFAULT_TIMEOUT).await);
    let channel = popup.channel().unwrap();
    assert!(wait_for(
        || async { channel.pending_receipts().len() == 1 },
        DEFAULT_CHECK_INTERVAL,
        DEFAULT_TIMEOUT,
    )
    .await);

    cs.shutdown();
    match timeout(DEFAULT_TIMEOUT, pending).await.unwrap() {
        Err(RouterError::Terminated(_)) => {}
        other => panic!("unexpected {:?}", other),
    }
}

// ============================================================================
// Broadcasts
// ============================================================================

#[tokio::test]
async fn test_broadcast_reaches_everyone_once() {
    let topo = TestTopology::start();
    let popup = topo.popup();
    let options = topo.options();
    let cs = topo.content_script(1, 0);
    assert!(topo.wait_for_connections(3).await);

    let collectors: Vec<MessageCollector> = (0..4).map(|_| MessageCollector::new()).collect();
    topo.hub().on_event("theme", collectors[0].listener()).unwrap();
    popup.on_event("theme", collectors[1].listener()).unwrap();
    options.on_event("theme", collectors[2].listener()).unwrap();
    cs.on_event("theme", collectors[3].listener()).unwrap();

    popup.emit("theme", json!("dark")).await.unwrap();

    for collector in &collectors {
        assert!(collector.wait_for_count(1, DEFAULT_TIMEOUT).await);
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    for collector in &collectors {
        assert_eq!(collector.count(), 1);
        let msg = collector.last().unwrap();
        assert_eq!(msg.data, json!("dark"));
        assert_eq!(msg.sender, Endpoint::bare(ContextKind::Popup));
    }
}

#[tokio::test]
async fn test_listener_errors_aggregate() {
    let topo = TestTopology::start();
    let hub = topo.hub();
    let first = MessageCollector::new();
    let third = MessageCollector::new();
    hub.on_event("sync", first.listener()).unwrap();
    hub.on_event("sync", |_| async { Err(HandlerError::msg("listener two broke")) })
        .unwrap();
    hub.on_event("sync", third.listener()).unwrap();

    match hub.emit("sync", json!(1)).await {
        Err(ClientError::Router(RouterError::AggregateBroadcast { event_id, errors })) => {
            assert_eq!(event_id, "sync");
            assert_eq!(errors.len(), 1);
            assert_eq!(errors[0].message, "listener two broke");
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(first.count(), 1);
    assert_eq!(third.count(), 1);
}

#[tokio::test]
async fn test_removed_listener_stops_hearing() {
    let topo = TestTopology::start();
    let popup = topo.popup();
    let options = topo.options();
    assert!(topo.wait_for_connections(2).await);

    let collector = MessageCollector::new();
    let handle = options.on_event("tick", collector.listener()).unwrap();
    popup.emit("tick", json!(1)).await.unwrap();
    assert!(collector.wait_for_count(1, DEFAULT_TIMEOUT).await);

    assert!(handle.remove());
    popup.emit("tick", json!(2)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(collector.count(), 1);

    assert!(handle.restore());
    popup.emit("tick", json!(3)).await.unwrap();
    assert!(collector.wait_for_count(2, DEFAULT_TIMEOUT).await);
}

// ============================================================================
// Hub Restart
// ============================================================================

#[tokio::test]
async fn test_pending_request_survives_hub_restart() {
    let mut topo = TestTopology::start();
    let popup = topo.popup();
    assert!(topo.wait_for_connections(1).await);

    let pending = popup.send("ping", json!({"n": 9}), "content-script@6").unwrap();
    let channel = popup.channel().unwrap();
    assert!(wait_for(
        || async { channel.backlog_len() == 1 },
        DEFAULT_CHECK_INTERVAL,
        DEFAULT_TIMEOUT,
    )
    .await);

    topo.restart_hub();
    assert!(topo.wait_for_connections(1).await);

    let cs = topo.content_script(6, 0);
    cs.on("ping", ping_handler).unwrap();

    let reply = timeout(DEFAULT_TIMEOUT, pending).await.unwrap().unwrap();
    assert_eq!(reply, json!(10));
}

#[tokio::test]
async fn test_leaves_reconnect_after_restart() {
    let mut topo = TestTopology::start();
    let popup = topo.popup();
    let cs = topo.content_script(8, 0);
    cs.on("ping", ping_handler).unwrap();
    assert!(topo.wait_for_connections(2).await);

    topo.restart_hub();
    assert!(topo.wait_for_connections(2).await);

    let reply = timeout(DEFAULT_TIMEOUT, popup.request("ping", json!({"n": 0}), "content-script@8.0"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply, json!(1));
}

// ============================================================================
// Page Bridge
// ============================================================================

#[tokio::test]
async fn test_window_to_extension_and_back() {
    let topo = TestTopology::start();
    let popup = topo.popup();
    let (_cs, window) = topo.content_script_with_page(11, 0);
    assert!(topo.wait_for_connections(2).await);

    let from_page = MessageCollector::new();
    popup.on("hello", from_page.handler(json!("hi page"))).unwrap();
    let reply = timeout(DEFAULT_TIMEOUT, window.request("hello", json!(null), "popup"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply, json!("hi page"));
    assert_eq!(
        from_page.last().unwrap().sender,
        Endpoint::in_frame(ContextKind::Window, 11, 0)
    );

    window.on("ping", ping_handler).unwrap();
    let reply = timeout(DEFAULT_TIMEOUT, popup.request("ping", json!({"n": 5}), "window@11"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply, json!(6));
}

#[tokio::test]
async fn test_window_hears_broadcasts_once() {
    let topo = TestTopology::start();
    let popup = topo.popup();
    let (_cs, window) = topo.content_script_with_page(13, 0);
    assert!(topo.wait_for_connections(2).await);

    let page_events = MessageCollector::new();
    let popup_events = MessageCollector::new();
    window.on_event("nav", page_events.listener()).unwrap();
    popup.on_event("nav", popup_events.listener()).unwrap();

    popup.emit("nav", json!("/a")).await.unwrap();
    window.emit("nav", json!("/b")).await.unwrap();

    assert!(page_events.wait_for_count(2, DEFAULT_TIMEOUT).await);
    assert!(popup_events.wait_for_count(2, DEFAULT_TIMEOUT).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(page_events.count(), 2);
    assert_eq!(popup_events.count(), 2);
}

#[tokio::test]
async fn test_window_request_ends_when_destination_terminates() {
    let topo = TestTopology::start();
    let options = topo.options();
    let (_cs, window) = topo.content_script_with_page(14, 0);
    let reached = MessageCollector::new();
    let seen = reached.clone();
    options
        .on("slow", move |msg| {
            seen.record(msg);
            async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(json!(null))
            }
        })
        .unwrap();
    assert!(topo.wait_for_connections(2).await);

    let pending = window.send("slow", json!(null), "options").unwrap();
    assert!(reached.wait_for_count(1, DEFAULT_TIMEOUT).await);
    tokio::time::sleep(Duration::from_millis(50)).await;

    options.shutdown();
    match timeout(DEFAULT_TIMEOUT, pending).await.unwrap() {
        Err(RouterError::Terminated(_)) => {}
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn test_window_without_handler_rejects_caller() {
    let topo = TestTopology::start();
    let popup = topo.popup();
    let (_cs, _window) = topo.content_script_with_page(4, 0);
    assert!(topo.wait_for_connections(2).await);

    let outcome = timeout(DEFAULT_TIMEOUT, popup.request("ping", json!({"n": 1}), "window@4"))
        .await
        .expect("no-handler reply never came back out of the page");
    match outcome {
        Err(ClientError::Router(RouterError::NoHandler {
            message_id,
            destination,
        })) => {
            assert_eq!(message_id, "ping");
            assert!(destination.starts_with("window"), "{}", destination);
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn test_content_script_without_page_rejects_window_requests() {
    let topo = TestTopology::start();
    let popup = topo.popup();
    let _cs = topo.content_script(5, 0);
    assert!(topo.wait_for_connections(2).await);

    let outcome = timeout(DEFAULT_TIMEOUT, popup.request("ping", json!({"n": 1}), "window@5.0"))
        .await
        .expect("request for a missing page never settled");
    match outcome {
        Err(ClientError::Router(RouterError::NoHandler {
            message_id,
            destination,
        })) => {
            assert_eq!(message_id, "ping");
            assert_eq!(destination, "window@5.0");
        }
        other => panic!("unexpected {:?}", other),
    }

    // nothing keeps circling through the hub
    let channel = popup.channel().unwrap();
    assert!(wait_for(
        || async { channel.pending_receipts().is_empty() },
        DEFAULT_CHECK_INTERVAL,
        DEFAULT_TIMEOUT,
    )
    .await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(channel.pending_receipts().is_empty());
}

#[tokio::test]
async fn test_window_request_ends_when_evicted_from_backlog() {
    let topo = TestTopology::start_with_config(FabricConfig {
        reconnect_interval_ms: 20,
        max_backlog: 1,
    });
    let (cs, window) = topo.content_script_with_page(20, 0);
    assert!(topo.wait_for_connections(1).await);

    let first = window.send("ping", json!({"n": 1}), "content-script@30").unwrap();
    let channel = cs.channel().unwrap();
    assert!(wait_for(
        || async { channel.backlog_len() == 1 },
        DEFAULT_CHECK_INTERVAL,
        DEFAULT_TIMEOUT,
    )
    .await);
    let _second = window.send("ping", json!({"n": 2}), "content-script@31").unwrap();

    match timeout(DEFAULT_TIMEOUT, first).await.expect("page was never told") {
        Err(RouterError::Terminated(_)) => {}
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(window.router().unwrap().pending_transactions(), 1);
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn test_use_before_init() {
    let fabric = Fabric::default();
    assert!(!fabric.is_initialized());
    assert!(matches!(
        fabric.send("ping", json!(null), "popup"),
        Err(ClientError::NotInitialized)
    ));
    assert!(matches!(fabric.emit("tick", json!(null)).await, Err(ClientError::NotInitialized)));
}

#[tokio::test]
async fn test_init_only_once() {
    let topo = TestTopology::start();
    let popup = topo.popup();
    assert_eq!(popup.kind(), Some(ContextKind::Popup));
    assert!(matches!(
        popup.init_options(Arc::new(topo.network().clone())),
        Err(ClientError::AlreadyInitialized)
    ));
    assert_eq!(popup.kind(), Some(ContextKind::Popup));
}

#[tokio::test]
async fn test_unsupported_accessors() {
    let topo = TestTopology::start();
    let popup = topo.popup();
    assert!(matches!(popup.hub(), Err(ClientError::Unsupported(ContextKind::Popup, _))));
    assert!(topo.hub().channel().is_err());
    assert!(topo.hub().hub().is_ok());
}

#[tokio::test]
async fn test_builder_config_reaches_fabric() {
    let fabric = Fabric::builder().reconnect_interval(50).max_backlog(8).build();
    assert_eq!(
        fabric.config(),
        &FabricConfig {
            reconnect_interval_ms: 50,
            max_backlog: 8,
        }
    );
}
