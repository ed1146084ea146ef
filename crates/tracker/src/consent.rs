//! GDPR consent gate. When gating is disabled in configuration, consent is
//! implicit; when enabled, tracking is a no-op until the host records an
//! affirmative grant.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use pulse_storage::KeyValueStore;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ConsentRecord {
    granted: bool,
    timestamp: DateTime<Utc>,
}

pub struct ConsentManager {
    store: Arc<KeyValueStore>,
    key: String,
    gdpr_enabled: bool,
}

impl ConsentManager {
    pub fn new(store: Arc<KeyValueStore>, key: String, gdpr_enabled: bool) -> Self {
        Self {
            store,
            key,
            gdpr_enabled,
        }
    }

    /// Whether tracking may proceed right now.
    pub fn has_consent(&self) -> bool {
        if !self.gdpr_enabled {
            return true;
        }
        self.store
            .get(&self.key)
            .and_then(|raw| serde_json::from_str::<ConsentRecord>(&raw).ok())
            .map(|record| record.granted)
            .unwrap_or(false)
    }

    /// Record the host's consent decision.
    pub fn set_consent(&self, granted: bool) {
        let record = ConsentRecord {
            granted,
            timestamp: Utc::now(),
        };
        if let Ok(raw) = serde_json::to_string(&record) {
            self.store.set(&self.key, &raw, None);
        }
        tracing::info!(granted, "consent recorded");
    }

    /// Forget the stored decision entirely.
    pub fn clear(&self) {
        self.store.remove(&self.key);
    }
}
