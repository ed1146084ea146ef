//! The connection channel state machine.
//!
//! One logical bidirectional channel per manager. Writer and reader loops
//! own their connection halves; every other concern (heartbeat, retry
//! processing, reconnect scheduling) is a tokio task feeding the writer
//! through an mpsc seam. A connection generation counter (`epoch`)
//! invalidates tasks belonging to torn-down connections, so a late failure
//! from an old socket can never disturb the current one.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use pulse_core::config::WebSocketConfig;
use pulse_core::event_bus::{EventSink, TrackerEvent};
use pulse_core::events::{HeartbeatPing, MessageType, Priority, WireMessage};
use pulse_core::{PulseError, PulseResult};

use crate::connector::{Connection, ConnectionReceiver, ConnectionSender, Connector};
use crate::queue::MessageQueue;
use crate::state::{
    reconnect_delay, ConnectionMetrics, ConnectionState, ConnectionStatus, FallbackTransport,
};
use crate::WsConnector;

/// An outbound message before the channel stamps identity and timing onto it.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub message_type: MessageType,
    pub data: Option<serde_json::Value>,
    pub priority: Priority,
    pub retry: bool,
}

impl OutboundMessage {
    pub fn event(data: serde_json::Value) -> Self {
        Self {
            message_type: MessageType::Event,
            data: Some(data),
            priority: Priority::Normal,
            retry: true,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn non_retryable(mut self) -> Self {
        self.retry = false;
        self
    }
}

struct ChannelInner<C: Connector> {
    config: WebSocketConfig,
    connector: C,
    sink: Arc<dyn EventSink>,
    state: RwLock<ConnectionState>,
    metrics: RwLock<ConnectionMetrics>,
    queue: Mutex<MessageQueue>,
    pending_pings: Mutex<HashMap<String, chrono::DateTime<Utc>>>,
    missed_heartbeats: AtomicU32,
    /// `(session_id, visitor_id)` stamped onto outbound messages.
    identity: RwLock<(String, String)>,
    writer: Mutex<Option<mpsc::UnboundedSender<String>>>,
    /// Connection generation; bumped on every open/teardown.
    epoch: AtomicU64,
    destroyed: AtomicBool,
    fallback_active: AtomicBool,
    processor_started: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Resilient bidirectional event channel to a collection endpoint.
pub struct WebSocketManager<C: Connector = WsConnector> {
    inner: Arc<ChannelInner<C>>,
}

impl<C: Connector> WebSocketManager<C> {
    pub fn new(config: WebSocketConfig, connector: C, sink: Arc<dyn EventSink>) -> Self {
        let queue_size = config.message_queue_size;
        Self {
            inner: Arc::new(ChannelInner {
                config,
                connector,
                sink,
                state: RwLock::new(ConnectionState::default()),
                metrics: RwLock::new(ConnectionMetrics::default()),
                queue: Mutex::new(MessageQueue::new(queue_size)),
                pending_pings: Mutex::new(HashMap::new()),
                missed_heartbeats: AtomicU32::new(0),
                identity: RwLock::new((String::new(), String::new())),
                writer: Mutex::new(None),
                epoch: AtomicU64::new(0),
                destroyed: AtomicBool::new(false),
                fallback_active: AtomicBool::new(false),
                processor_started: AtomicBool::new(false),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Update the session context stamped onto outbound messages.
    pub fn set_identity(&self, session_id: impl Into<String>, visitor_id: impl Into<String>) {
        *self.inner.identity.write() = (session_id.into(), visitor_id.into());
    }

    /// Open the channel. No-op when already connected to the same URL;
    /// otherwise any existing connection is torn down first. Resolves when
    /// the handshake completes; rejects on handshake error or timeout.
    pub async fn connect(&self, url: Option<&str>) -> PulseResult<()> {
        let inner = &self.inner;
        if inner.destroyed.load(Ordering::SeqCst) {
            return Err(PulseError::Destroyed);
        }
        let url = url
            .map(str::to_string)
            .or_else(|| inner.config.url.clone())
            .ok_or_else(|| PulseError::Config("websocket url not configured".into()))?;

        {
            let state = inner.state.read();
            if state.status == ConnectionStatus::Connected
                && state.url.as_deref() == Some(url.as_str())
            {
                return Ok(());
            }
        }

        self.ensure_processor();
        ChannelInner::teardown(inner);
        {
            let mut state = inner.state.write();
            state.status = ConnectionStatus::Connecting;
            state.url = Some(url.clone());
        }
        ChannelInner::dial(inner, url, false).await
    }

    /// Graceful close: stop timers, cancel pending pings, send a normal
    /// closure, and stay disconnected (no auto-reconnect).
    pub fn disconnect(&self) {
        let inner = &self.inner;
        ChannelInner::teardown(inner);
        let mut state = inner.state.write();
        if state.status != ConnectionStatus::Closed {
            state.status = ConnectionStatus::Disconnected;
        }
        state.disconnected_at = Some(Utc::now());
        tracing::info!("channel disconnected by caller");
    }

    /// Terminal teardown. Idempotent; bars any further sends or reconnects.
    pub fn destroy(&self) {
        let inner = &self.inner;
        if inner.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        ChannelInner::teardown(inner);
        {
            let mut state = inner.state.write();
            state.status = ConnectionStatus::Closed;
            state.disconnected_at = Some(Utc::now());
        }
        for task in inner.tasks.lock().drain(..) {
            task.abort();
        }
        tracing::debug!("channel destroyed");
    }

    /// Send an `event` message with normal priority.
    pub fn send_event(&self, data: serde_json::Value) -> bool {
        self.send_message(OutboundMessage::event(data))
    }

    /// Stamp and send a message. Returns whether it was handed to the
    /// socket immediately; `false` means it was queued (or dropped, when
    /// marked non-retryable). Never an acknowledgement guarantee.
    pub fn send_message(&self, out: OutboundMessage) -> bool {
        self.inner.send_message(out)
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.read().clone()
    }

    /// Metrics snapshot with `uptime_ms` recomputed from `connected_at`.
    pub fn metrics(&self) -> ConnectionMetrics {
        let mut snapshot = self.inner.metrics.read().clone();
        let state = self.inner.state.read();
        if state.status == ConnectionStatus::Connected {
            if let Some(connected_at) = state.connected_at {
                snapshot.uptime_ms = (Utc::now() - connected_at).num_milliseconds().max(0) as u64;
            }
        }
        snapshot
    }

    pub fn is_connected(&self) -> bool {
        self.inner.state.read().status == ConnectionStatus::Connected
    }

    pub fn queue_len(&self) -> usize {
        self.inner.queue.lock().len()
    }

    pub fn fallback_active(&self) -> bool {
        self.inner.fallback_active.load(Ordering::SeqCst)
    }

    /// The fallback record, once activated.
    pub fn fallback(&self) -> Option<FallbackTransport> {
        if !self.fallback_active() {
            return None;
        }
        self.inner.config.fallback_url.clone().map(|url| FallbackTransport {
            url,
            retry_interval_ms: self.inner.config.fallback_retry_interval_ms,
        })
    }

    fn ensure_processor(&self) {
        if self.inner.processor_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let inner = self.inner.clone();
        self.inner.track(tokio::spawn(ChannelInner::run_queue_processor(inner)));
    }

    #[cfg(test)]
    fn enqueue_for_test(&self, message: WireMessage) {
        self.inner.enqueue(message);
    }
}

impl<C: Connector> ChannelInner<C> {
    /// Dial `url` under the connect timeout. `from_retry` distinguishes the
    /// reconnect cycle (keeps retrying with backoff) from a caller-driven
    /// `connect` (fails fast).
    async fn dial(inner: &Arc<Self>, url: String, from_retry: bool) -> PulseResult<()> {
        let timeout = Duration::from_millis(inner.config.connect_timeout_ms);
        match tokio::time::timeout(timeout, inner.connector.connect(&url)).await {
            Ok(Ok(conn)) => {
                Self::on_open(inner, url, conn);
                Ok(())
            }
            Ok(Err(e)) => {
                let message = e.to_string();
                Self::on_dial_failure(inner, &message, from_retry);
                Err(PulseError::Connection(message))
            }
            // The elapsed timeout drops the in-flight connect future,
            // aborting the half-open attempt.
            Err(_) => {
                let message = format!("connect timeout after {}ms", timeout.as_millis());
                Self::on_dial_failure(inner, &message, from_retry);
                Err(PulseError::ConnectTimeout(timeout.as_millis() as u64))
            }
        }
    }

    fn on_dial_failure(inner: &Arc<Self>, message: &str, from_retry: bool) {
        {
            let mut state = inner.state.write();
            state.last_error = Some(message.to_string());
            // Inside the retry cycle the channel is still logically
            // reconnecting; a caller-driven connect lands in `error`.
            if !from_retry {
                state.status = ConnectionStatus::Error;
            }
        }
        inner.metrics.write().errors += 1;
        metrics::counter!("transport.connect_failures").increment(1);
        tracing::warn!(error = %message, "channel connect failed");
        inner.sink.emit(TrackerEvent::ConnectionError {
            message: message.to_string(),
        });
        if from_retry && !inner.destroyed.load(Ordering::SeqCst) {
            Self::schedule_reconnect(inner);
        }
    }

    fn on_open(inner: &Arc<Self>, url: String, conn: C::Conn) {
        let epoch = inner.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let (writer_tx, writer_rx) = mpsc::unbounded_channel::<String>();
        *inner.writer.lock() = Some(writer_tx);
        inner.missed_heartbeats.store(0, Ordering::SeqCst);
        {
            let mut state = inner.state.write();
            state.status = ConnectionStatus::Connected;
            state.url = Some(url.clone());
            state.connected_at = Some(Utc::now());
            state.disconnected_at = None;
            state.last_error = None;
            state.reconnect_attempts = 0;
        }
        inner.metrics.write().touch();
        metrics::counter!("transport.connections_opened").increment(1);
        tracing::info!(url = %url, "channel connected");
        inner.sink.emit(TrackerEvent::ConnectionOpen { url });

        let (sender, receiver) = conn.split();
        inner.track(tokio::spawn(Self::run_writer(
            inner.clone(),
            sender,
            writer_rx,
            epoch,
        )));
        inner.track(tokio::spawn(Self::run_reader(inner.clone(), receiver, epoch)));
        inner.track(tokio::spawn(Self::run_heartbeat(inner.clone(), epoch)));

        inner.flush_queue_on_open();
    }

    async fn run_writer(
        inner: Arc<Self>,
        mut sender: <C::Conn as Connection>::Sender,
        mut writer_rx: mpsc::UnboundedReceiver<String>,
        epoch: u64,
    ) {
        loop {
            match writer_rx.recv().await {
                Some(text) => {
                    if let Err(e) = sender.send(text).await {
                        tracing::debug!(error = %e, "socket write failed");
                        Self::on_connection_lost(&inner, epoch, Some(e.to_string()));
                        break;
                    }
                }
                // Teardown dropped the writer handle: close gracefully.
                None => {
                    sender.close().await;
                    break;
                }
            }
        }
    }

    async fn run_reader(
        inner: Arc<Self>,
        mut receiver: <C::Conn as Connection>::Receiver,
        epoch: u64,
    ) {
        loop {
            match receiver.recv().await {
                Ok(Some(text)) => inner.handle_incoming(&text),
                Ok(None) => {
                    Self::on_connection_lost(&inner, epoch, None);
                    break;
                }
                Err(e) => {
                    inner.metrics.write().errors += 1;
                    inner.sink.emit(TrackerEvent::ConnectionError {
                        message: e.to_string(),
                    });
                    Self::on_connection_lost(&inner, epoch, Some(e.to_string()));
                    break;
                }
            }
        }
    }

    /// First loser wins: whichever loop notices the connection die first
    /// performs the transition; the epoch CAS makes the other a no-op, as
    /// well as anything belonging to an already torn-down connection.
    fn on_connection_lost(inner: &Arc<Self>, epoch: u64, error: Option<String>) {
        if inner
            .epoch
            .compare_exchange(epoch, epoch + 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        *inner.writer.lock() = None;
        inner.pending_pings.lock().clear();

        let (url, was_connected) = {
            let mut state = inner.state.write();
            let was_connected = state.status == ConnectionStatus::Connected;
            state.status = ConnectionStatus::Disconnected;
            state.disconnected_at = Some(Utc::now());
            if let Some(error) = error {
                state.last_error = Some(error);
            }
            (state.url.clone().unwrap_or_default(), was_connected)
        };
        tracing::info!(url = %url, "channel connection lost");
        inner.sink.emit(TrackerEvent::ConnectionClosed { url });

        if was_connected && inner.config.reconnect && !inner.destroyed.load(Ordering::SeqCst) {
            Self::schedule_reconnect(inner);
        }
    }

    fn schedule_reconnect(inner: &Arc<Self>) {
        let attempts = inner.state.read().reconnect_attempts;
        if attempts >= inner.config.max_reconnect_attempts {
            if inner.config.enable_fallback && inner.config.fallback_url.is_some() {
                Self::activate_fallback(inner);
            } else {
                let mut state = inner.state.write();
                state.status = ConnectionStatus::Error;
                state.last_error = Some("reconnect attempts exhausted".into());
                tracing::warn!("reconnect attempts exhausted, channel giving up");
            }
            return;
        }

        let delay = reconnect_delay(
            Duration::from_millis(inner.config.reconnect_interval_ms),
            attempts,
        );
        tracing::debug!(
            attempt = attempts + 1,
            delay_ms = delay.as_millis() as u64,
            "scheduling reconnect"
        );
        let task_inner = inner.clone();
        inner.track(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if task_inner.destroyed.load(Ordering::SeqCst) {
                return;
            }
            Self::reconnect(&task_inner).await;
        }));
    }

    async fn reconnect(inner: &Arc<Self>) {
        if inner.destroyed.load(Ordering::SeqCst) || inner.fallback_active.load(Ordering::SeqCst) {
            return;
        }
        let Some(url) = inner.state.read().url.clone() else {
            return;
        };
        {
            let mut state = inner.state.write();
            state.reconnect_attempts += 1;
            state.status = ConnectionStatus::Reconnecting;
        }
        inner.metrics.write().reconnections += 1;
        metrics::counter!("transport.reconnections").increment(1);
        let _ = Self::dial(inner, url, true).await;
    }

    fn activate_fallback(inner: &Arc<Self>) {
        if inner.fallback_active.swap(true, Ordering::SeqCst) {
            return;
        }
        let url = inner.config.fallback_url.clone().unwrap_or_default();
        {
            let mut state = inner.state.write();
            state.status = ConnectionStatus::Disconnected;
            state.last_error = Some("reconnect attempts exhausted, fallback active".into());
        }
        tracing::warn!(url = %url, "live channel unavailable, HTTP fallback activated");
        inner.sink.emit(TrackerEvent::FallbackActivated { url });
    }

    async fn run_heartbeat(inner: Arc<Self>, epoch: u64) {
        let mut tick =
            tokio::time::interval(Duration::from_millis(inner.config.heartbeat_interval_ms));
        // Consume the immediate first tick; the first ping goes out one
        // full interval after the connection opens.
        tick.tick().await;
        loop {
            tick.tick().await;
            if inner.destroyed.load(Ordering::SeqCst)
                || inner.epoch.load(Ordering::SeqCst) != epoch
                || inner.state.read().status != ConnectionStatus::Connected
            {
                break;
            }

            let ping_id = uuid::Uuid::new_v4().to_string();
            let now = Utc::now();
            let (session_id, visitor_id) = inner.identity.read().clone();
            let ping = WireMessage {
                id: uuid::Uuid::new_v4().to_string(),
                message_type: MessageType::Heartbeat,
                data: serde_json::to_value(HeartbeatPing {
                    ping_id: ping_id.clone(),
                    timestamp: now.timestamp_millis(),
                })
                .ok(),
                timestamp: now.timestamp_millis(),
                session_id,
                visitor_id,
                priority: Some(Priority::Critical),
                retry: Some(false),
            };
            inner.pending_pings.lock().insert(ping_id.clone(), now);
            // Critical priority: straight to the writer, never queued.
            if inner.write_direct(&ping).is_err() {
                break;
            }

            let watchdog = inner.clone();
            let timeout = Duration::from_millis(inner.config.heartbeat_timeout_ms);
            inner.track(tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                Self::on_ping_deadline(&watchdog, epoch, &ping_id);
            }));
        }
    }

    fn on_ping_deadline(inner: &Arc<Self>, epoch: u64, ping_id: &str) {
        if inner.destroyed.load(Ordering::SeqCst) || inner.epoch.load(Ordering::SeqCst) != epoch {
            return;
        }
        // Still pending means the pong never arrived.
        if inner.pending_pings.lock().remove(ping_id).is_none() {
            return;
        }
        let missed = inner.missed_heartbeats.fetch_add(1, Ordering::SeqCst) + 1;
        metrics::counter!("transport.heartbeats_missed").increment(1);
        tracing::warn!(missed, "heartbeat unanswered");
        if missed < inner.config.max_missed_heartbeats {
            return;
        }

        // The connection is silently dead. Tear it down (the epoch CAS
        // guarantees a single winner) and reconnect once, immediately.
        if inner
            .epoch
            .compare_exchange(epoch, epoch + 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        *inner.writer.lock() = None;
        inner.pending_pings.lock().clear();
        inner.missed_heartbeats.store(0, Ordering::SeqCst);
        let url = {
            let mut state = inner.state.write();
            state.status = ConnectionStatus::Disconnected;
            state.disconnected_at = Some(Utc::now());
            state.last_error = Some("heartbeat timeout".into());
            state.url.clone().unwrap_or_default()
        };
        tracing::warn!(url = %url, "connection presumed dead after missed heartbeats");
        inner.sink.emit(TrackerEvent::ConnectionClosed { url });

        let task_inner = inner.clone();
        inner.track(tokio::spawn(async move {
            Self::reconnect(&task_inner).await;
        }));
    }

    fn handle_incoming(&self, text: &str) {
        {
            let mut metrics = self.metrics.write();
            metrics.messages_received += 1;
            metrics.touch();
        }
        let message: WireMessage = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!(error = %e, "undecodable frame from server");
                return;
            }
        };

        match message.message_type {
            MessageType::Heartbeat => {
                let Some(ping_id) = message.heartbeat_ping_id() else {
                    return;
                };
                if let Some(sent_at) = self.pending_pings.lock().remove(&ping_id) {
                    let latency = (Utc::now() - sent_at).num_milliseconds().max(0) as u64;
                    self.missed_heartbeats.store(0, Ordering::SeqCst);
                    self.state.write().latency_ms = Some(latency);
                    self.metrics.write().record_latency(latency);
                    tracing::debug!(latency_ms = latency, "heartbeat answered");
                }
            }
            MessageType::Ack => {
                if let Some(message_id) = message.ack_message_id() {
                    if self.queue.lock().ack(&message_id) {
                        tracing::debug!(message_id = %message_id, "queued message acknowledged");
                    }
                }
            }
            MessageType::Error => {
                let detail = message
                    .data
                    .as_ref()
                    .and_then(|data| data.get("message"))
                    .and_then(|value| value.as_str())
                    .unwrap_or("server reported an error")
                    .to_string();
                self.metrics.write().errors += 1;
                self.sink.emit(TrackerEvent::ConnectionError { message: detail });
            }
            MessageType::Command => {
                self.sink.emit(TrackerEvent::CommandReceived {
                    data: message.data.unwrap_or(serde_json::Value::Null),
                });
            }
            MessageType::Event => {
                tracing::debug!(id = %message.id, "ignoring event frame from server");
            }
        }
    }

    fn send_message(&self, out: OutboundMessage) -> bool {
        if self.destroyed.load(Ordering::SeqCst) {
            return false;
        }
        let message = self.stamp(out);
        if self.state.read().status == ConnectionStatus::Connected
            && self.write_direct(&message).is_ok()
        {
            let mut metrics = self.metrics.write();
            metrics.messages_sent += 1;
            metrics.touch();
            metrics::counter!("transport.messages_sent").increment(1);
            return true;
        }
        if message.retryable() {
            self.enqueue(message);
        } else {
            tracing::debug!(id = %message.id, "dropping non-retryable message while disconnected");
        }
        false
    }

    fn stamp(&self, out: OutboundMessage) -> WireMessage {
        let (session_id, visitor_id) = self.identity.read().clone();
        WireMessage {
            id: uuid::Uuid::new_v4().to_string(),
            message_type: out.message_type,
            data: out.data,
            timestamp: Utc::now().timestamp_millis(),
            session_id,
            visitor_id,
            priority: Some(out.priority),
            retry: Some(out.retry),
        }
    }

    fn write_direct(&self, message: &WireMessage) -> anyhow::Result<()> {
        let raw = serde_json::to_string(message)?;
        match self.writer.lock().as_ref() {
            Some(writer) => writer
                .send(raw)
                .map_err(|_| anyhow::anyhow!("writer closed")),
            None => anyhow::bail!("not connected"),
        }
    }

    fn enqueue(&self, message: WireMessage) {
        let dropped = self.queue.lock().push(message, self.config.max_retries);
        if let Some(dropped) = dropped {
            metrics::counter!("transport.queue_dropped").increment(1);
            tracing::debug!(message_id = %dropped.message.id, "queue full, evicted oldest message");
            self.sink.emit(TrackerEvent::QueueFull {
                dropped_id: dropped.message.id,
            });
        }
    }

    fn flush_queue_on_open(&self) {
        let entries = self.queue.lock().drain_for_flush();
        if entries.is_empty() {
            return;
        }
        tracing::debug!(count = entries.len(), "flushing queued messages after connect");
        for entry in entries {
            match self.write_direct(&entry.message) {
                Ok(()) => {
                    self.metrics.write().messages_sent += 1;
                }
                Err(_) => {
                    let id = entry.message.id.clone();
                    let attempts = entry.attempts + 1;
                    if !self.queue.lock().requeue_failed(entry) {
                        self.sink.emit(TrackerEvent::MessageFailed { id, attempts });
                    }
                }
            }
        }
    }

    async fn run_queue_processor(inner: Arc<Self>) {
        let mut tick =
            tokio::time::interval(Duration::from_millis(inner.config.queue_process_interval_ms));
        loop {
            tick.tick().await;
            if inner.destroyed.load(Ordering::SeqCst) {
                break;
            }
            if inner.state.read().status != ConnectionStatus::Connected {
                continue;
            }
            let due = inner.queue.lock().take_due(Utc::now());
            for entry in due {
                match inner.write_direct(&entry.message) {
                    Ok(()) => {
                        let mut metrics = inner.metrics.write();
                        metrics.messages_sent += 1;
                        metrics.touch();
                    }
                    Err(_) => {
                        let id = entry.message.id.clone();
                        let attempts = entry.attempts + 1;
                        if !inner.queue.lock().requeue_failed(entry) {
                            metrics::counter!("transport.messages_failed").increment(1);
                            tracing::warn!(
                                message_id = %id,
                                attempts,
                                "message dropped after exhausting retries"
                            );
                            inner.sink.emit(TrackerEvent::MessageFailed { id, attempts });
                        }
                    }
                }
            }
        }
    }

    /// Invalidate the current connection (if any): the writer loop sees its
    /// channel close and sends a normal closure; reader/heartbeat loops go
    /// stale via the epoch bump.
    fn teardown(inner: &Arc<Self>) {
        inner.epoch.fetch_add(1, Ordering::SeqCst);
        *inner.writer.lock() = None;
        inner.pending_pings.lock().clear();
        inner.missed_heartbeats.store(0, Ordering::SeqCst);
    }

    fn track(&self, handle: JoinHandle<()>) {
        let mut tasks = self.tasks.lock();
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryConnector, MemoryServer};
    use pulse_core::event_bus::{capture_sink, CaptureSink};

    fn test_config() -> WebSocketConfig {
        WebSocketConfig {
            url: Some("memory://collect".into()),
            reconnect: true,
            reconnect_interval_ms: 10,
            max_reconnect_attempts: 3,
            heartbeat_interval_ms: 60_000,
            heartbeat_timeout_ms: 1_000,
            max_missed_heartbeats: 3,
            message_queue_size: 100,
            max_retries: 3,
            connect_timeout_ms: 500,
            enable_fallback: false,
            fallback_url: None,
            fallback_retry_interval_ms: 1_000,
            queue_process_interval_ms: 20,
        }
    }

    fn channel(
        config: WebSocketConfig,
    ) -> (
        WebSocketManager<MemoryConnector>,
        MemoryConnector,
        Arc<CaptureSink>,
    ) {
        let connector = MemoryConnector::new();
        let sink = capture_sink();
        let manager =
            WebSocketManager::new(config, connector.clone(), sink.clone() as Arc<dyn EventSink>);
        manager.set_identity("s-1", "v-1");
        (manager, connector, sink)
    }

    /// Echo heartbeat frames back so the connection stays alive.
    fn spawn_heartbeat_echo(mut server: MemoryServer) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(frame) = server.recv().await {
                if frame.contains("\"heartbeat\"") {
                    server.send(frame);
                }
            }
        })
    }

    #[tokio::test]
    async fn test_connect_opens_channel() {
        let (manager, connector, sink) = channel(test_config());

        manager.connect(None).await.unwrap();

        assert!(manager.is_connected());
        assert_eq!(connector.accepted(), 1);
        assert_eq!(sink.count_name("connection:open"), 1);
        manager.destroy();
    }

    #[tokio::test]
    async fn test_connect_to_same_url_is_noop() {
        let (manager, connector, _) = channel(test_config());

        manager.connect(None).await.unwrap();
        manager.connect(None).await.unwrap();

        assert_eq!(connector.accepted(), 1);
        manager.destroy();
    }

    #[tokio::test]
    async fn test_connect_timeout_never_leaves_status_connecting() {
        let mut config = test_config();
        config.connect_timeout_ms = 50;
        let (manager, connector, _) = channel(config);
        connector.hang_connects(true);

        let result = manager.connect(None).await;

        assert!(matches!(result, Err(PulseError::ConnectTimeout(50))));
        let status = manager.state().status;
        assert_ne!(status, ConnectionStatus::Connecting);
        assert!(matches!(
            status,
            ConnectionStatus::Error | ConnectionStatus::Disconnected
        ));
        manager.destroy();
    }

    #[tokio::test]
    async fn test_connect_failure_surfaces_error_event() {
        let (manager, connector, sink) = channel(test_config());
        connector.fail_next_connects(1);

        let result = manager.connect(None).await;

        assert!(matches!(result, Err(PulseError::Connection(_))));
        assert_eq!(manager.state().status, ConnectionStatus::Error);
        assert_eq!(sink.count_name("connection:error"), 1);
        assert_eq!(manager.metrics().errors, 1);
        manager.destroy();
    }

    #[tokio::test]
    async fn test_send_while_connected_reaches_server_with_identity() {
        let (manager, connector, _) = channel(test_config());
        manager.connect(None).await.unwrap();
        let mut server = connector.next_server().await;

        assert!(manager.send_event(serde_json::json!({"kind": "click"})));

        let frame = server.recv().await.unwrap();
        let message: WireMessage = serde_json::from_str(&frame).unwrap();
        assert_eq!(message.message_type, MessageType::Event);
        assert_eq!(message.session_id, "s-1");
        assert_eq!(message.visitor_id, "v-1");
        assert!(!message.id.is_empty());
        assert_eq!(manager.metrics().messages_sent, 1);
        manager.destroy();
    }

    #[tokio::test]
    async fn test_send_while_disconnected_queues() {
        let (manager, _, _) = channel(test_config());

        assert!(!manager.send_event(serde_json::json!({"kind": "click"})));
        assert_eq!(manager.queue_len(), 1);
        manager.destroy();
    }

    #[tokio::test]
    async fn test_non_retryable_message_is_dropped_not_queued() {
        let (manager, _, _) = channel(test_config());

        let sent = manager.send_message(
            OutboundMessage::event(serde_json::json!({})).non_retryable(),
        );

        assert!(!sent);
        assert_eq!(manager.queue_len(), 0);
        manager.destroy();
    }

    #[tokio::test]
    async fn test_queue_overflow_evicts_oldest_with_one_event_each() {
        let mut config = test_config();
        config.message_queue_size = 2;
        let (manager, _, sink) = channel(config);

        manager.send_event(serde_json::json!({"n": 1}));
        manager.send_event(serde_json::json!({"n": 2}));
        assert_eq!(sink.count_name("queue:full"), 0);

        manager.send_event(serde_json::json!({"n": 3}));
        assert_eq!(sink.count_name("queue:full"), 1);
        assert_eq!(manager.queue_len(), 2);

        manager.send_event(serde_json::json!({"n": 4}));
        assert_eq!(sink.count_name("queue:full"), 2);
        assert_eq!(manager.queue_len(), 2);
        manager.destroy();
    }

    #[tokio::test]
    async fn test_queued_messages_flush_on_connect() {
        let (manager, connector, _) = channel(test_config());
        manager.send_event(serde_json::json!({"n": 1}));
        manager.send_event(serde_json::json!({"n": 2}));
        assert_eq!(manager.queue_len(), 2);

        manager.connect(None).await.unwrap();
        let mut server = connector.next_server().await;

        let first: WireMessage =
            serde_json::from_str(&server.recv().await.unwrap()).unwrap();
        let second: WireMessage =
            serde_json::from_str(&server.recv().await.unwrap()).unwrap();
        assert_eq!(first.data, Some(serde_json::json!({"n": 1})));
        assert_eq!(second.data, Some(serde_json::json!({"n": 2})));
        assert_eq!(manager.queue_len(), 0);
        manager.destroy();
    }

    #[tokio::test]
    async fn test_ack_removes_pending_entry_without_retry() {
        let mut config = test_config();
        // Park the retry processor so the ack is the only removal path.
        config.queue_process_interval_ms = 60_000;
        let (manager, connector, _) = channel(config);
        manager.connect(None).await.unwrap();
        let server = connector.next_server().await;

        let pending = WireMessage {
            id: "m-pending".into(),
            message_type: MessageType::Event,
            data: None,
            timestamp: Utc::now().timestamp_millis(),
            session_id: "s-1".into(),
            visitor_id: "v-1".into(),
            priority: None,
            retry: Some(true),
        };
        manager.enqueue_for_test(pending);
        assert_eq!(manager.queue_len(), 1);

        server.send(
            serde_json::json!({
                "id": "srv-1",
                "type": "ack",
                "data": {"messageId": "m-pending"},
                "timestamp": 0,
                "sessionId": "s-1",
                "visitorId": "v-1"
            })
            .to_string(),
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(manager.queue_len(), 0);
        manager.destroy();
    }

    #[tokio::test]
    async fn test_unexpected_close_triggers_auto_reconnect() {
        let (manager, connector, sink) = channel(test_config());
        manager.connect(None).await.unwrap();
        let mut server = connector.next_server().await;

        server.close();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(connector.accepted(), 2);
        assert!(manager.is_connected());
        assert!(sink.count_name("connection:closed") >= 1);
        assert!(manager.metrics().reconnections >= 1);
        manager.destroy();
    }

    #[tokio::test]
    async fn test_exhausted_reconnects_activate_fallback() {
        let mut config = test_config();
        config.max_reconnect_attempts = 2;
        config.reconnect_interval_ms = 5;
        config.enable_fallback = true;
        config.fallback_url = Some("https://collect.example.com/batch".into());
        let (manager, connector, sink) = channel(config);

        manager.connect(None).await.unwrap();
        connector.fail_next_connects(100);
        let mut server = connector.next_server().await;
        server.close();

        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(manager.fallback_active());
        assert_eq!(sink.count_name("fallback:activated"), 1);
        assert_eq!(
            manager.fallback(),
            Some(FallbackTransport {
                url: "https://collect.example.com/batch".into(),
                retry_interval_ms: 1_000,
            })
        );
        assert_eq!(connector.accepted(), 1);
        manager.destroy();
    }

    #[tokio::test]
    async fn test_heartbeat_keeps_connection_alive_and_tracks_latency() {
        let mut config = test_config();
        config.heartbeat_interval_ms = 30;
        config.heartbeat_timeout_ms = 25;
        config.max_missed_heartbeats = 2;
        let (manager, connector, _) = channel(config);

        manager.connect(None).await.unwrap();
        let echo = spawn_heartbeat_echo(connector.next_server().await);

        tokio::time::sleep(Duration::from_millis(150)).await;

        assert!(manager.is_connected());
        assert_eq!(connector.accepted(), 1, "no reconnect while pongs arrive");
        let metrics = manager.metrics();
        assert!(metrics.latency_samples >= 1);
        assert!(manager.state().latency_ms.is_some());
        manager.destroy();
        echo.abort();
    }

    #[tokio::test]
    async fn test_missed_heartbeats_trigger_exactly_one_reconnect() {
        let mut config = test_config();
        config.heartbeat_interval_ms = 30;
        config.heartbeat_timeout_ms = 25;
        config.max_missed_heartbeats = 2;
        let (manager, connector, _) = channel(config);

        manager.connect(None).await.unwrap();
        // First server stays silent: pings go unanswered.
        let silent = connector.next_server().await;

        // Second connection gets a well-behaved server.
        let echo_connector = connector.clone();
        let echo = tokio::spawn(async move {
            let server = echo_connector.next_server().await;
            spawn_heartbeat_echo(server).await.ok();
        });

        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(connector.accepted(), 2, "exactly one reconnect");
        assert!(manager.is_connected());
        assert_eq!(manager.metrics().reconnections, 1);
        drop(silent);
        manager.destroy();
        echo.abort();
    }

    #[tokio::test]
    async fn test_destroy_bars_reconnect_and_sends() {
        let (manager, connector, _) = channel(test_config());
        manager.connect(None).await.unwrap();
        let mut server = connector.next_server().await;

        manager.destroy();
        manager.destroy();
        server.close();
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert_eq!(connector.accepted(), 1);
        assert_eq!(manager.state().status, ConnectionStatus::Closed);
        assert!(!manager.send_event(serde_json::json!({})));
    }

    #[tokio::test]
    async fn test_disconnect_is_quiet() {
        let (manager, connector, _) = channel(test_config());
        manager.connect(None).await.unwrap();

        manager.disconnect();
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert_eq!(manager.state().status, ConnectionStatus::Disconnected);
        assert_eq!(connector.accepted(), 1, "no reconnect after caller disconnect");
        manager.destroy();
    }
}
