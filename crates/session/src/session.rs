//! Session records and identity token generation.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use pulse_fingerprint::SessionFingerprint;

/// One visitor session. `visitor_id` survives session rotation; everything
/// else is scoped to the current session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VisitorSession {
    pub session_id: String,
    pub visitor_id: String,
    pub started_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub page_views: u64,
    pub platform: String,
    pub user_agent: String,
    pub referrer: Option<String>,
    pub landing_page: String,
}

impl VisitorSession {
    /// Milliseconds since the last recorded activity.
    pub fn idle_ms(&self) -> i64 {
        (Utc::now() - self.last_activity).num_milliseconds().max(0)
    }
}

/// Result of validating a session. Produced on demand, never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct SessionValidation {
    pub is_valid: bool,
    pub reasons: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<SessionFingerprint>,
    pub last_validated: DateTime<Utc>,
}

impl SessionValidation {
    pub fn valid(fingerprint: Option<SessionFingerprint>) -> Self {
        Self {
            is_valid: true,
            reasons: Vec::new(),
            fingerprint,
            last_validated: Utc::now(),
        }
    }

    pub fn invalid(reasons: Vec<String>, fingerprint: Option<SessionFingerprint>) -> Self {
        Self {
            is_valid: false,
            reasons,
            fingerprint,
            last_validated: Utc::now(),
        }
    }
}

/// Opaque, time-sortable session token: 13 hex digits of epoch millis
/// followed by 8 random hex chars.
pub fn generate_session_id() -> String {
    let ms = Utc::now().timestamp_millis();
    let suffix: [u8; 4] = rand::thread_rng().gen();
    format!("{ms:013x}{}", hex::encode(suffix))
}

/// Identifier for one tracking context (one tab/process instance).
pub fn generate_tab_id() -> String {
    let suffix: [u8; 4] = rand::thread_rng().gen();
    format!("tab-{}", hex::encode(suffix))
}
