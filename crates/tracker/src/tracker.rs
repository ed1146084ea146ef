//! The tracker facade.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use uuid::Uuid;

use pulse_core::config::TrackerConfig;
use pulse_core::event_bus::{noop_sink, EventSink, TrackerEvent};
use pulse_core::events::{EventBatch, TrackedEvent, TrackedEventType};
use pulse_core::{PulseError, PulseResult};
use pulse_fingerprint::Environment;
use pulse_session::{SessionManager, VisitorSession};
use pulse_storage::KeyValueStore;
use pulse_transport::{
    ConnectionMetrics, ConnectionState, Connector, FallbackTransport, WebSocketManager, WsConnector,
};

use crate::consent::ConsentManager;
use crate::modules::{Instrument, PerformanceTiming, TechnologyDetector};

struct TrackerShared<C: Connector> {
    config: TrackerConfig,
    env: Arc<dyn Environment>,
    sink: Arc<dyn EventSink>,
    store: Arc<KeyValueStore>,
    consent: ConsentManager,
    session: SessionManager,
    channel: Option<WebSocketManager<C>>,
    modules: Mutex<Vec<Arc<dyn Instrument>>>,
    queue: Mutex<VecDeque<TrackedEvent>>,
    http: reqwest::Client,
    initialized: AtomicBool,
    destroyed: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// An owned tracker instance. Constructed by the embedding host (there is
/// no global singleton) and torn down with [`Tracker::destroy`].
pub struct Tracker<C: Connector = WsConnector> {
    shared: Arc<TrackerShared<C>>,
}

impl Tracker<WsConnector> {
    /// Build a tracker with the production WebSocket connector and the
    /// standard storage tiers. The only failure mode is invalid required
    /// configuration.
    pub fn new(config: TrackerConfig, env: Arc<dyn Environment>) -> PulseResult<Self> {
        let store = Arc::new(KeyValueStore::new(&config.storage));
        Self::with_parts(config, env, WsConnector, store, noop_sink())
    }
}

impl<C: Connector> Tracker<C> {
    /// Fully explicit construction: custom connector, shared storage, and
    /// event sink. Used by embedding hosts and tests.
    pub fn with_parts(
        config: TrackerConfig,
        env: Arc<dyn Environment>,
        connector: C,
        store: Arc<KeyValueStore>,
        sink: Arc<dyn EventSink>,
    ) -> PulseResult<Self> {
        config.validate()?;

        let consent = ConsentManager::new(
            store.clone(),
            config.storage_key("consent"),
            config.enable_gdpr,
        );
        let session = SessionManager::new(&config, store.clone(), env.clone(), sink.clone());
        let channel = config
            .websocket
            .url
            .is_some()
            .then(|| WebSocketManager::new(config.websocket.clone(), connector, sink.clone()));

        Ok(Self {
            shared: Arc::new(TrackerShared {
                config,
                env,
                sink,
                store,
                consent,
                session,
                channel,
                modules: Mutex::new(vec![
                    Arc::new(TechnologyDetector) as Arc<dyn Instrument>,
                    Arc::new(PerformanceTiming) as Arc<dyn Instrument>,
                ]),
                queue: Mutex::new(VecDeque::new()),
                http: reqwest::Client::new(),
                initialized: AtomicBool::new(false),
                destroyed: AtomicBool::new(false),
                tasks: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Attach an additional instrumentation module.
    pub fn register_module(&self, module: Arc<dyn Instrument>) {
        self.shared.modules.lock().push(module);
    }

    /// Bring the tracker up: session, live channel, background flushing.
    /// Idempotent — a second call changes nothing.
    pub async fn init(&self) {
        let shared = &self.shared;
        if shared.initialized.swap(true, Ordering::SeqCst)
            || shared.destroyed.load(Ordering::SeqCst)
        {
            return;
        }

        let session = shared.session.initialize_session().await;
        shared.session.start();

        if let Some(channel) = &shared.channel {
            channel.set_identity(session.session_id.as_str(), session.visitor_id.as_str());
            if let Err(e) = channel.connect(None).await {
                tracing::warn!(error = %e, "live channel unavailable, batch path only");
            }
        }

        let flush_shared = self.shared.clone();
        shared.tasks.lock().push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_millis(
                flush_shared.config.flush_interval_ms,
            ));
            tick.tick().await;
            loop {
                tick.tick().await;
                if flush_shared.destroyed.load(Ordering::SeqCst) {
                    break;
                }
                if let Err(e) = TrackerShared::flush_batch(&flush_shared).await {
                    tracing::debug!(error = %e, "interval flush failed");
                }
            }
        }));

        tracing::info!(project_id = %shared.config.project_id, "tracker initialized");
    }

    /// Record a custom event. No-op before `init`, after `destroy`, or
    /// without consent.
    pub fn track(&self, event: &str, data: Option<serde_json::Value>) {
        let shared = &self.shared;
        if !shared.tracking_allowed() {
            return;
        }
        let Some(session) = shared.session.current_session() else {
            return;
        };
        let tracked = TrackedEvent::custom(
            event,
            data,
            session.session_id.as_str(),
            session.visitor_id.as_str(),
        );
        metrics::counter!("tracker.events_tracked").increment(1);
        TrackerShared::dispatch(shared, tracked);
    }

    /// Record a page view: validates/rotates the session, bumps activity,
    /// and lets every instrumentation module contribute derived events.
    pub async fn page_view(&self, data: Option<serde_json::Value>) {
        let shared = &self.shared;
        if !shared.tracking_allowed() {
            return;
        }

        let session = shared.session.touch().await;
        if let Some(channel) = &shared.channel {
            channel.set_identity(session.session_id.as_str(), session.visitor_id.as_str());
        }

        let page = shared.env.page();
        TrackerShared::dispatch(shared, TrackedEvent {
            id: Uuid::new_v4(),
            event_type: TrackedEventType::Pageview,
            element: None,
            value: data.clone(),
            url: Some(page.url.clone()),
            title: Some(page.title.clone()),
            referrer: page.referrer.clone(),
            timestamp: Utc::now(),
            session_id: session.session_id.clone(),
            visitor_id: session.visitor_id.clone(),
            metadata: data,
        });

        let modules = shared.modules.lock().clone();
        for module in modules {
            for (event_type, payload) in module.on_page_view(shared.env.as_ref()) {
                TrackerShared::dispatch(shared, TrackedEvent {
                    id: Uuid::new_v4(),
                    event_type,
                    element: Some(module.name().to_string()),
                    value: Some(payload.clone()),
                    url: Some(page.url.clone()),
                    title: Some(page.title.clone()),
                    referrer: page.referrer.clone(),
                    timestamp: Utc::now(),
                    session_id: session.session_id.clone(),
                    visitor_id: session.visitor_id.clone(),
                    metadata: Some(payload),
                });
            }
        }
    }

    /// Drain the batch queue to the collection endpoint.
    pub async fn flush(&self) -> PulseResult<()> {
        TrackerShared::flush_batch(&self.shared).await
    }

    /// Best-effort flush, then deterministic teardown of the channel, the
    /// session manager, and all background tasks. Idempotent.
    pub async fn destroy(&self) {
        let shared = &self.shared;
        if shared.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = TrackerShared::flush_batch(shared).await {
            tracing::debug!(error = %e, "final flush failed");
        }
        if let Some(channel) = &shared.channel {
            channel.destroy();
        }
        shared.session.destroy();
        for task in shared.tasks.lock().drain(..) {
            task.abort();
        }
        tracing::info!("tracker destroyed");
    }

    pub fn set_consent(&self, granted: bool) {
        self.shared.consent.set_consent(granted);
    }

    pub fn has_consent(&self) -> bool {
        self.shared.consent.has_consent()
    }

    pub fn session(&self) -> Option<VisitorSession> {
        self.shared.session.current_session()
    }

    pub fn events_queued(&self) -> usize {
        self.shared.queue.lock().len()
    }

    pub fn connection_state(&self) -> Option<ConnectionState> {
        self.shared.channel.as_ref().map(|c| c.state())
    }

    pub fn connection_metrics(&self) -> Option<ConnectionMetrics> {
        self.shared.channel.as_ref().map(|c| c.metrics())
    }

    pub fn fallback(&self) -> Option<FallbackTransport> {
        self.shared.channel.as_ref().and_then(|c| c.fallback())
    }

    /// The storage medium backing this tracker. Hosts use it to share
    /// storage between sibling tracker instances and to run maintenance.
    pub fn store(&self) -> Arc<KeyValueStore> {
        self.shared.store.clone()
    }
}

impl<C: Connector> TrackerShared<C> {
    fn tracking_allowed(&self) -> bool {
        if !self.initialized.load(Ordering::SeqCst) || self.destroyed.load(Ordering::SeqCst) {
            tracing::debug!("tracker not active, ignoring event");
            return false;
        }
        if !self.consent.has_consent() {
            tracing::debug!("no consent, ignoring event");
            return false;
        }
        true
    }

    /// Push live when the channel is up, otherwise into the batch queue.
    fn dispatch(shared: &Arc<Self>, event: TrackedEvent) {
        if let Some(channel) = &shared.channel {
            if channel.is_connected() && !channel.fallback_active() {
                match serde_json::to_value(&event) {
                    Ok(value) => {
                        if channel.send_event(value) {
                            return;
                        }
                    }
                    Err(e) => tracing::debug!(error = %e, "event not serializable for live push"),
                }
            }
        }
        Self::enqueue(shared, event);
    }

    fn enqueue(shared: &Arc<Self>, event: TrackedEvent) {
        let should_flush = {
            let mut queue = shared.queue.lock();
            queue.push_back(event);
            queue.len() >= shared.config.batch_size
        };
        if should_flush {
            // Capacity reached: flush out of band, like the interval does.
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let task_shared = shared.clone();
                handle.spawn(async move {
                    if let Err(e) = Self::flush_batch(&task_shared).await {
                        tracing::debug!(error = %e, "capacity flush failed");
                    }
                });
            }
        }
    }

    async fn flush_batch(shared: &Arc<Self>) -> PulseResult<()> {
        let events: Vec<TrackedEvent> = {
            let mut queue = shared.queue.lock();
            queue.drain(..).collect()
        };
        if events.is_empty() {
            return Ok(());
        }

        let session = shared.session.current_session();
        let batch = EventBatch {
            project_id: shared.config.project_id.clone(),
            session_id: session
                .as_ref()
                .map(|s| s.session_id.clone())
                .unwrap_or_default(),
            visitor_id: session
                .as_ref()
                .map(|s| s.visitor_id.clone())
                .unwrap_or_default(),
            events,
            sent_at: Utc::now(),
        };
        let count = batch.events.len();
        let url = format!("{}/events", shared.config.api_url.trim_end_matches('/'));

        let outcome = shared.http.post(&url).json(&batch).send().await;
        match outcome {
            Ok(response) if response.status().is_success() => {
                metrics::counter!("tracker.events_flushed").increment(count as u64);
                tracing::debug!(count, "flushed event batch");
                Ok(())
            }
            Ok(response) => {
                let status = response.status();
                shared.requeue_at_head(batch.events);
                shared.sink.emit(TrackerEvent::EventsFailed { count });
                Err(PulseError::Flush(format!("collector returned {status}")))
            }
            Err(e) => {
                shared.requeue_at_head(batch.events);
                shared.sink.emit(TrackerEvent::EventsFailed { count });
                Err(PulseError::Flush(e.to_string()))
            }
        }
    }

    /// Failed batches go back to the head so ordering survives the retry.
    fn requeue_at_head(&self, events: Vec<TrackedEvent>) {
        let mut queue = self.queue.lock();
        for event in events.into_iter().rev() {
            queue.push_front(event);
        }
    }
}
