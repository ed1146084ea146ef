use serde::{Deserialize, Serialize};

use crate::error::{PulseError, PulseResult};

/// Root tracker configuration. Loaded from environment variables with the
/// prefix `CONVERT_PULSE__`, or built programmatically by the embedding host.
#[derive(Debug, Clone, Deserialize)]
pub struct TrackerConfig {
    /// Collection endpoint for the HTTP batch path. Required.
    #[serde(default)]
    pub api_url: String,
    /// Project identifier, namespaces all persisted keys. Required.
    #[serde(default)]
    pub project_id: String,
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub enable_gdpr: bool,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub websocket: WebSocketConfig,
    #[serde(default)]
    pub fingerprint: FingerprintConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Idle time after which a session is rotated.
    #[serde(default = "default_session_timeout_ms")]
    pub timeout_ms: u64,
    /// Cross-context reconciliation cadence.
    #[serde(default = "default_reconcile_interval_ms")]
    pub reconcile_interval_ms: u64,
    /// Cadence at which this context writes its registry heartbeat.
    #[serde(default = "default_tab_heartbeat_interval_ms")]
    pub tab_heartbeat_interval_ms: u64,
    /// Registry entries with heartbeats older than this are pruned.
    #[serde(default = "default_tab_stale_after_ms")]
    pub tab_stale_after_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebSocketConfig {
    /// Live channel endpoint. The channel stays disabled when unset.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_true")]
    pub reconnect: bool,
    /// Base reconnect delay; attempt k waits `base * 1.5^(k-1)`.
    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,
    #[serde(default = "default_max_missed_heartbeats")]
    pub max_missed_heartbeats: u32,
    #[serde(default = "default_message_queue_size")]
    pub message_queue_size: usize,
    /// Per-message resend budget for queued messages.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default)]
    pub enable_fallback: bool,
    #[serde(default)]
    pub fallback_url: Option<String>,
    #[serde(default = "default_fallback_retry_interval_ms")]
    pub fallback_retry_interval_ms: u64,
    /// Cadence of the queued-message retry processor.
    #[serde(default = "default_queue_process_interval_ms")]
    pub queue_process_interval_ms: u64,
}

/// Fingerprint elements that can participate in session validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FingerprintField {
    Platform,
    Browser,
    Resolution,
    Timezone,
    Language,
    Plugins,
    Canvas,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FingerprintConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub include_canvas: bool,
    /// A mismatch on any of these fields invalidates the stored session.
    /// Drift on the remaining fields is tolerated.
    #[serde(default = "default_critical_fields")]
    pub critical_fields: Vec<FingerprintField>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Directory for the durable file backend. File tier is skipped when unset.
    #[serde(default)]
    pub namespace_dir: Option<String>,
    /// Capacity bound of the in-memory fallback tier.
    #[serde(default = "default_memory_capacity")]
    pub memory_capacity: usize,
}

// Default functions
fn default_true() -> bool {
    true
}
fn default_batch_size() -> usize {
    50
}
fn default_flush_interval_ms() -> u64 {
    10_000
}
fn default_session_timeout_ms() -> u64 {
    30 * 60 * 1000
}
fn default_reconcile_interval_ms() -> u64 {
    5_000
}
fn default_tab_heartbeat_interval_ms() -> u64 {
    10_000
}
fn default_tab_stale_after_ms() -> u64 {
    60_000
}
fn default_reconnect_interval_ms() -> u64 {
    1_000
}
fn default_max_reconnect_attempts() -> u32 {
    5
}
fn default_heartbeat_interval_ms() -> u64 {
    30_000
}
fn default_heartbeat_timeout_ms() -> u64 {
    5_000
}
fn default_max_missed_heartbeats() -> u32 {
    3
}
fn default_message_queue_size() -> usize {
    100
}
fn default_max_retries() -> u32 {
    3
}
fn default_connect_timeout_ms() -> u64 {
    10_000
}
fn default_fallback_retry_interval_ms() -> u64 {
    30_000
}
fn default_queue_process_interval_ms() -> u64 {
    1_000
}
fn default_critical_fields() -> Vec<FingerprintField> {
    vec![
        FingerprintField::Platform,
        FingerprintField::Browser,
        FingerprintField::Resolution,
    ]
}
fn default_memory_capacity() -> usize {
    500
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_session_timeout_ms(),
            reconcile_interval_ms: default_reconcile_interval_ms(),
            tab_heartbeat_interval_ms: default_tab_heartbeat_interval_ms(),
            tab_stale_after_ms: default_tab_stale_after_ms(),
        }
    }
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            url: None,
            reconnect: default_true(),
            reconnect_interval_ms: default_reconnect_interval_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            max_missed_heartbeats: default_max_missed_heartbeats(),
            message_queue_size: default_message_queue_size(),
            max_retries: default_max_retries(),
            connect_timeout_ms: default_connect_timeout_ms(),
            enable_fallback: false,
            fallback_url: None,
            fallback_retry_interval_ms: default_fallback_retry_interval_ms(),
            queue_process_interval_ms: default_queue_process_interval_ms(),
        }
    }
}

impl Default for FingerprintConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            include_canvas: false,
            critical_fields: default_critical_fields(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            namespace_dir: None,
            memory_capacity: default_memory_capacity(),
        }
    }
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            api_url: String::new(),
            project_id: String::new(),
            debug: false,
            enable_gdpr: false,
            batch_size: default_batch_size(),
            flush_interval_ms: default_flush_interval_ms(),
            session: SessionConfig::default(),
            websocket: WebSocketConfig::default(),
            fingerprint: FingerprintConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

impl TrackerConfig {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder().add_source(
            config::Environment::with_prefix("CONVERT_PULSE")
                .separator("__")
                .try_parsing(true)
                .list_separator(","),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Validate required fields. The only condition the tracker is allowed to
    /// fail fast on.
    pub fn validate(&self) -> PulseResult<()> {
        if self.api_url.trim().is_empty() {
            return Err(PulseError::Config("api_url is required".into()));
        }
        url::Url::parse(&self.api_url)
            .map_err(|e| PulseError::Config(format!("api_url is not a valid URL: {e}")))?;
        if self.project_id.trim().is_empty() {
            return Err(PulseError::Config("project_id is required".into()));
        }
        if let Some(ws_url) = &self.websocket.url {
            url::Url::parse(ws_url)
                .map_err(|e| PulseError::Config(format!("websocket.url is not a valid URL: {e}")))?;
        }
        Ok(())
    }

    /// Storage key under the per-project prefix, e.g. `cp_proj1_session`.
    pub fn storage_key(&self, suffix: &str) -> String {
        format!("cp_{}_{}", self.project_id, suffix)
    }
}
