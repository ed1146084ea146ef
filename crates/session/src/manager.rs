//! The session manager: owns the visitor/session identity lifecycle for one
//! tracking context and keeps sibling contexts converged.
//!
//! Convergence uses the storage medium itself as the broadcast channel —
//! there is no central coordinator. A context that observes a foreign write
//! with a different session id adopts it; a periodic reconciliation tick
//! re-reads the stored session in case a broadcast was missed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use pulse_core::config::{FingerprintField, SessionConfig, TrackerConfig};
use pulse_core::event_bus::{EventSink, TrackerEvent};
use pulse_fingerprint::{Environment, FingerprintGenerator, SessionFingerprint};
use pulse_storage::KeyValueStore;

use crate::registry::ActiveTabRegistry;
use crate::session::{generate_session_id, generate_tab_id, SessionValidation, VisitorSession};

/// Storage keys for this project's session records.
#[derive(Debug, Clone)]
struct SessionKeys {
    session: String,
    visitor: String,
    fingerprint: String,
    active_tabs: String,
    heartbeat: String,
}

impl SessionKeys {
    fn new(config: &TrackerConfig) -> Self {
        Self {
            session: config.storage_key("session"),
            visitor: config.storage_key("visitor"),
            fingerprint: config.storage_key("fingerprint"),
            active_tabs: config.storage_key("active_tabs"),
            heartbeat: config.storage_key("heartbeat"),
        }
    }
}

struct SessionInner {
    config: SessionConfig,
    critical_fields: Vec<FingerprintField>,
    keys: SessionKeys,
    store: Arc<KeyValueStore>,
    env: Arc<dyn Environment>,
    generator: Option<FingerprintGenerator>,
    sink: Arc<dyn EventSink>,
    tab_id: String,
    current: RwLock<Option<VisitorSession>>,
    destroyed: AtomicBool,
}

/// Owns the session lifecycle for one tracking context.
pub struct SessionManager {
    inner: Arc<SessionInner>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SessionManager {
    pub fn new(
        config: &TrackerConfig,
        store: Arc<KeyValueStore>,
        env: Arc<dyn Environment>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        let generator = config
            .fingerprint
            .enabled
            .then(|| FingerprintGenerator::new(config.fingerprint.clone()));
        Self {
            inner: Arc::new(SessionInner {
                config: config.session.clone(),
                critical_fields: config.fingerprint.critical_fields.clone(),
                keys: SessionKeys::new(config),
                store,
                env,
                generator,
                sink,
                tab_id: generate_tab_id(),
                current: RwLock::new(None),
                destroyed: AtomicBool::new(false),
            }),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Restore the persisted session when it validates, otherwise create a
    /// fresh one. Storage failures degrade to an unpersisted in-memory
    /// session — this never fails.
    pub async fn initialize_session(&self) -> VisitorSession {
        if let Some(session) = self.inner.restore_session().await {
            let session_id = session.session_id.clone();
            *self.inner.current.write() = Some(session.clone());
            self.inner.register_tab(&session_id);
            self.inner
                .sink
                .emit(TrackerEvent::SessionRestored { session_id });
            return session;
        }
        self.inner.create_session().await
    }

    /// Bump `last_activity` and the page-view counter, then persist.
    pub fn update_activity(&self) {
        let mut guard = self.inner.current.write();
        if let Some(session) = guard.as_mut() {
            session.last_activity = Utc::now();
            session.page_views += 1;
            self.inner.persist_session(session);
        }
    }

    /// Activity signal from the facade: validates the current session,
    /// rotates it when invalid, then records the activity.
    pub async fn touch(&self) -> VisitorSession {
        let current = self.inner.current.read().clone();
        let needs_new = match current {
            None => true,
            Some(session) => {
                let validation = self.inner.validate(&session).await;
                if validation.is_valid {
                    false
                } else {
                    self.inner.sink.emit(TrackerEvent::SessionInvalid {
                        reasons: validation.reasons,
                    });
                    self.inner.store.remove(&self.inner.keys.session);
                    true
                }
            }
        };
        if needs_new {
            self.inner.create_session().await;
        }
        self.update_activity();
        match self.inner.current.read().clone() {
            Some(session) => session,
            None => self.inner.create_session().await,
        }
    }

    /// Validate the current session (idle timeout + fingerprint drift).
    pub async fn validate_session(&self) -> SessionValidation {
        match self.inner.current.read().clone() {
            Some(session) => self.inner.validate(&session).await,
            None => SessionValidation::invalid(vec!["no active session".into()], None),
        }
    }

    /// Drop the current session and its persisted record.
    pub fn invalidate_session(&self) {
        *self.inner.current.write() = None;
        self.inner.store.remove(&self.inner.keys.session);
        self.inner.sink.emit(TrackerEvent::SessionInvalid {
            reasons: vec!["explicitly invalidated".into()],
        });
        tracing::info!("session invalidated");
    }

    /// Forget the durable visitor identity as well. The next session starts
    /// with a fresh visitor id.
    pub fn reset_visitor(&self) {
        self.inner.store.remove(&self.inner.keys.visitor);
        self.invalidate_session();
    }

    /// Start the background loops: storage-change listener, reconciliation
    /// tick, and registry heartbeat/GC. Idempotent.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() || self.inner.destroyed.load(Ordering::SeqCst) {
            return;
        }

        // Subscribe synchronously so no write can slip between start() and
        // the listener becoming active.
        let inner = self.inner.clone();
        let mut changes = inner.store.subscribe();
        tasks.push(tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(change) => {
                        if inner.destroyed.load(Ordering::SeqCst) {
                            break;
                        }
                        if change.key == inner.keys.session {
                            if let Some(raw) = change.value {
                                inner.adopt_if_foreign(&raw);
                            }
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "storage change listener lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }));

        let inner = self.inner.clone();
        tasks.push(tokio::spawn(async move {
            let mut tick =
                tokio::time::interval(Duration::from_millis(inner.config.reconcile_interval_ms));
            loop {
                tick.tick().await;
                if inner.destroyed.load(Ordering::SeqCst) {
                    break;
                }
                inner.reconcile();
            }
        }));

        let inner = self.inner.clone();
        tasks.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_millis(
                inner.config.tab_heartbeat_interval_ms,
            ));
            loop {
                tick.tick().await;
                if inner.destroyed.load(Ordering::SeqCst) {
                    break;
                }
                inner.registry_maintenance();
            }
        }));
    }

    /// Stop the background loops and deregister this context. Idempotent.
    pub fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        let mut registry = ActiveTabRegistry::load(&self.inner.store, &self.inner.keys.active_tabs);
        registry.remove(&self.inner.tab_id);
        registry.save(&self.inner.store, &self.inner.keys.active_tabs);
        tracing::debug!(tab_id = %self.inner.tab_id, "session manager destroyed");
    }

    pub fn current_session(&self) -> Option<VisitorSession> {
        self.inner.current.read().clone()
    }

    pub fn visitor_id(&self) -> Option<String> {
        self.inner.current.read().as_ref().map(|s| s.visitor_id.clone())
    }

    pub fn tab_id(&self) -> &str {
        &self.inner.tab_id
    }
}

impl SessionInner {
    async fn restore_session(&self) -> Option<VisitorSession> {
        let raw = self.store.get(&self.keys.session)?;
        let session: VisitorSession = match serde_json::from_str(&raw) {
            Ok(session) => session,
            Err(e) => {
                tracing::debug!(error = %e, "corrupt persisted session, discarding");
                self.store.remove(&self.keys.session);
                return None;
            }
        };
        let validation = self.validate(&session).await;
        if validation.is_valid {
            Some(session)
        } else {
            tracing::info!(reasons = ?validation.reasons, "persisted session failed validation");
            self.sink.emit(TrackerEvent::SessionInvalid {
                reasons: validation.reasons,
            });
            self.store.remove(&self.keys.session);
            None
        }
    }

    async fn create_session(&self) -> VisitorSession {
        let visitor_id = match self.store.get(&self.keys.visitor) {
            Some(id) if !id.is_empty() => id,
            _ => {
                let id = uuid::Uuid::new_v4().to_string();
                self.store.set(&self.keys.visitor, &id, None);
                id
            }
        };

        let device = self.env.device();
        let page = self.env.page();
        let now = Utc::now();
        let session = VisitorSession {
            session_id: generate_session_id(),
            visitor_id: visitor_id.clone(),
            started_at: now,
            last_activity: now,
            page_views: 0,
            platform: device.platform,
            user_agent: device.user_agent,
            referrer: page.referrer,
            landing_page: page.url,
        };

        self.persist_session(&session);
        if let Some(generator) = &self.generator {
            let fingerprint = generator.generate(self.env.as_ref()).await;
            if let Ok(raw) = serde_json::to_string(&fingerprint) {
                self.store.set(&self.keys.fingerprint, &raw, None);
            }
        }
        self.register_tab(&session.session_id);
        *self.current.write() = Some(session.clone());

        tracing::info!(
            session_id = %session.session_id,
            visitor_id = %visitor_id,
            "session created"
        );
        self.sink.emit(TrackerEvent::SessionCreated {
            session_id: session.session_id.clone(),
            visitor_id,
        });
        session
    }

    async fn validate(&self, session: &VisitorSession) -> SessionValidation {
        let mut reasons = Vec::new();

        let idle = session.idle_ms();
        if idle > self.config.timeout_ms as i64 {
            reasons.push(format!(
                "session idle for {idle}ms (timeout {}ms)",
                self.config.timeout_ms
            ));
        }

        let mut fresh = None;
        if let Some(generator) = &self.generator {
            let fingerprint = generator.generate(self.env.as_ref()).await;
            if let Some(stored) = self.stored_fingerprint() {
                for field in stored.diff(&fingerprint) {
                    if self.critical_fields.contains(&field) {
                        reasons.push(format!(
                            "fingerprint mismatch on critical field: {field:?}"
                        ));
                    } else {
                        tracing::debug!(field = ?field, "tolerated fingerprint drift");
                    }
                }
            }
            fresh = Some(fingerprint);
        }

        if reasons.is_empty() {
            SessionValidation::valid(fresh)
        } else {
            SessionValidation::invalid(reasons, fresh)
        }
    }

    fn stored_fingerprint(&self) -> Option<SessionFingerprint> {
        self.store
            .get(&self.keys.fingerprint)
            .and_then(|raw| serde_json::from_str(&raw).ok())
    }

    fn persist_session(&self, session: &VisitorSession) {
        match serde_json::to_string(session) {
            Ok(raw) => self.store.set(&self.keys.session, &raw, None),
            Err(e) => tracing::debug!(error = %e, "failed to encode session"),
        }
    }

    /// Adopt a session written by a sibling context when its id differs
    /// from ours. A broadcast of our own write carries our own id and is a
    /// natural no-op.
    fn adopt_if_foreign(&self, raw: &str) {
        let Ok(session) = serde_json::from_str::<VisitorSession>(raw) else {
            return;
        };
        let mut guard = self.current.write();
        let foreign = guard
            .as_ref()
            .map_or(true, |current| current.session_id != session.session_id);
        if !foreign {
            return;
        }
        let session_id = session.session_id.clone();
        *guard = Some(session);
        drop(guard);
        tracing::debug!(session_id = %session_id, "adopted session from sibling context");
        self.sink
            .emit(TrackerEvent::SessionSynchronized { session_id });
    }

    fn reconcile(&self) {
        if let Some(raw) = self.store.get(&self.keys.session) {
            self.adopt_if_foreign(&raw);
        }
    }

    fn register_tab(&self, session_id: &str) {
        let mut registry = ActiveTabRegistry::load(&self.store, &self.keys.active_tabs);
        registry.heartbeat(&self.tab_id, session_id);
        registry.save(&self.store, &self.keys.active_tabs);
    }

    fn registry_maintenance(&self) {
        let mut registry = ActiveTabRegistry::load(&self.store, &self.keys.active_tabs);
        if let Some(session) = self.current.read().as_ref() {
            registry.heartbeat(&self.tab_id, &session.session_id);
        }
        registry.prune_stale(Duration::from_millis(self.config.tab_stale_after_ms));
        registry.save(&self.store, &self.keys.active_tabs);
        // Liveness stamp, kept short-lived so it reads as absent once this
        // context goes away.
        self.store.set(
            &self.keys.heartbeat,
            &Utc::now().timestamp_millis().to_string(),
            Some(Duration::from_millis(self.config.tab_stale_after_ms)),
        );
    }
}
