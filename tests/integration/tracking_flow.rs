//! Integration tests for the full tracking flow: session lifecycle timing,
//! cross-context convergence, and the channel's behavior under a scripted
//! collection endpoint.

use std::sync::Arc;
use std::time::Duration;

use pulse_core::config::TrackerConfig;
use pulse_core::event_bus::{capture_sink, CaptureSink, EventSink};
use pulse_fingerprint::StaticEnvironment;
use pulse_storage::KeyValueStore;
use pulse_tracker::Tracker;
use pulse_transport::memory::MemoryConnector;

fn config(project: &str, session_timeout_ms: u64, ws: bool) -> TrackerConfig {
    // Port 9 (discard) fails fast, so best-effort flushes never hang tests.
    let mut config = TrackerConfig {
        api_url: "http://127.0.0.1:9".into(),
        project_id: project.into(),
        ..TrackerConfig::default()
    };
    config.flush_interval_ms = 60_000;
    config.session.timeout_ms = session_timeout_ms;
    config.session.reconcile_interval_ms = 50;
    config.session.tab_heartbeat_interval_ms = 50;
    config.websocket.url = ws.then(|| "memory://collect".to_string());
    config.websocket.heartbeat_interval_ms = 60_000;
    config
}

fn tracker_on(
    store: Arc<KeyValueStore>,
    config: TrackerConfig,
) -> (Tracker<MemoryConnector>, MemoryConnector, Arc<CaptureSink>) {
    let connector = MemoryConnector::new();
    let sink = capture_sink();
    let tracker = Tracker::with_parts(
        config,
        Arc::new(StaticEnvironment::new()),
        connector.clone(),
        store,
        sink.clone() as Arc<dyn EventSink>,
    )
    .unwrap();
    (tracker, connector, sink)
}

/// Session timing scenario: with a 1000ms timeout, a page view at t=500
/// keeps the session; a page view past the timeout rotates it while the
/// visitor id survives.
#[tokio::test]
async fn test_session_keeps_within_timeout_and_rotates_after() {
    let store = Arc::new(KeyValueStore::in_memory(64));
    let (tracker, _, _) = tracker_on(store, config("timing", 1000, false));
    tracker.init().await;
    let initial = tracker.session().unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;
    tracker.page_view(None).await;
    let at_500 = tracker.session().unwrap();
    assert_eq!(at_500.session_id, initial.session_id);

    tokio::time::sleep(Duration::from_millis(1100)).await;
    tracker.page_view(None).await;
    let at_1600 = tracker.session().unwrap();
    assert_ne!(at_1600.session_id, initial.session_id);
    assert_eq!(at_1600.visitor_id, initial.visitor_id);

    tracker.destroy().await;
}

/// Two tracker instances sharing one storage medium behave like two tabs:
/// the second restores the first one's session, and a rotation in one is
/// adopted by the other within a reconciliation interval.
#[tokio::test]
async fn test_sibling_trackers_share_and_converge_on_session() {
    let store = Arc::new(KeyValueStore::in_memory(64));
    let (first, _, _) = tracker_on(store.clone(), config("shared", 60_000, false));
    first.init().await;

    let (second, _, second_sink) = tracker_on(store, config("shared", 60_000, false));
    second.init().await;

    let a = first.session().unwrap();
    let b = second.session().unwrap();
    assert_eq!(a.session_id, b.session_id, "second context restores the session");
    assert_eq!(a.visitor_id, b.visitor_id);

    // A page view in the first context keeps both on the same session.
    first.page_view(None).await;
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(
        second.session().unwrap().session_id,
        first.session().unwrap().session_id
    );
    assert_eq!(second_sink.count_name("session:invalid"), 0);

    first.destroy().await;
    second.destroy().await;
}

/// End-to-end over the live channel: events tracked while connected arrive
/// at the endpoint as stamped wire messages; a dropped connection falls
/// back to queueing and recovers after reconnect.
#[tokio::test]
async fn test_live_channel_delivery_and_recovery() {
    let store = Arc::new(KeyValueStore::in_memory(64));
    let mut cfg = config("live", 60_000, true);
    cfg.websocket.reconnect_interval_ms = 10;
    let (tracker, connector, sink) = tracker_on(store, cfg);
    tracker.init().await;
    let session = tracker.session().unwrap();

    let mut server = connector.next_server().await;
    tracker.track("cta_click", Some(serde_json::json!({"button": "signup"})));

    let frame = server.recv().await.unwrap();
    let message: serde_json::Value = serde_json::from_str(&frame).unwrap();
    assert_eq!(message["type"], "event");
    assert_eq!(message["sessionId"], session.session_id.as_str());
    assert_eq!(message["visitorId"], session.visitor_id.as_str());

    // Kill the connection: the channel reconnects and stays usable.
    server.close();
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(connector.accepted(), 2);
    assert!(sink.count_name("connection:closed") >= 1);

    let mut server = connector.next_server().await;
    tracker.track("after_reconnect", None);
    let frame = server.recv().await.unwrap();
    assert!(frame.contains("after_reconnect"));

    tracker.destroy().await;
}

/// Destroying one context must not disturb its sibling's session.
#[tokio::test]
async fn test_destroy_leaves_sibling_session_intact() {
    let store = Arc::new(KeyValueStore::in_memory(64));
    let (first, _, _) = tracker_on(store.clone(), config("teardown", 60_000, false));
    first.init().await;
    let session = first.session().unwrap();

    let (second, _, _) = tracker_on(store, config("teardown", 60_000, false));
    second.init().await;

    first.destroy().await;
    tokio::time::sleep(Duration::from_millis(80)).await;

    let survivor = second.session().unwrap();
    assert_eq!(survivor.session_id, session.session_id);
    second.page_view(None).await;
    assert_eq!(second.session().unwrap().page_views, survivor.page_views + 1);

    second.destroy().await;
}
