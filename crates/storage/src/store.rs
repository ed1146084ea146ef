//! The layered key/value store and its change broadcast.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::backend::{FileBackend, MemoryBackend, StorageBackend};
use pulse_core::config::StorageConfig;

/// A write observed on the shared storage medium. `value: None` means the
/// key was removed.
#[derive(Debug, Clone)]
pub struct StorageChange {
    pub key: String,
    pub value: Option<String>,
}

/// Expiry envelope wrapped around every persisted value.
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expires_at: Option<i64>,
}

/// Best-effort layered store. All operations are infallible from the
/// caller's perspective: a failing tier is skipped with a debug log, and the
/// final in-memory tier cannot fail.
///
/// Sibling tracking contexts share one instance; every effective write is
/// published on the change broadcast, which is how contexts observe each
/// other without a central coordinator.
pub struct KeyValueStore {
    backends: Vec<Arc<dyn StorageBackend>>,
    changes: broadcast::Sender<StorageChange>,
}

impl KeyValueStore {
    /// Build the standard tier stack: configured durable directory (when
    /// set), then a temp-dir tier, then the bounded memory fallback.
    pub fn new(config: &StorageConfig) -> Self {
        let mut backends: Vec<Arc<dyn StorageBackend>> = Vec::new();
        if let Some(dir) = &config.namespace_dir {
            backends.push(Arc::new(FileBackend::new("file", dir)));
        }
        backends.push(Arc::new(FileBackend::new(
            "temp",
            std::env::temp_dir().join("convertpulse"),
        )));
        backends.push(Arc::new(MemoryBackend::new(config.memory_capacity)));
        Self::with_backends(backends)
    }

    /// Build from an explicit tier stack (tests, embedded hosts).
    pub fn with_backends(backends: Vec<Arc<dyn StorageBackend>>) -> Self {
        let (changes, _) = broadcast::channel(64);
        Self { backends, changes }
    }

    /// A memory-only store, for hosts that opt out of persistence entirely.
    pub fn in_memory(capacity: usize) -> Self {
        Self::with_backends(vec![Arc::new(MemoryBackend::new(capacity))])
    }

    /// Read a value, consulting tiers in durability order. Expired entries
    /// self-delete and read as absent.
    pub fn get(&self, key: &str) -> Option<String> {
        for backend in &self.backends {
            let raw = match backend.get(key) {
                Ok(Some(raw)) => raw,
                Ok(None) => continue,
                Err(e) => {
                    tracing::debug!(tier = backend.name(), key, error = %e, "storage read failed");
                    metrics::counter!("storage.tier_read_failed").increment(1);
                    continue;
                }
            };
            let envelope: Envelope = match serde_json::from_str(&raw) {
                Ok(envelope) => envelope,
                Err(e) => {
                    tracing::debug!(tier = backend.name(), key, error = %e, "corrupt storage entry");
                    let _ = backend.remove(key);
                    continue;
                }
            };
            if let Some(expires_at) = envelope.expires_at {
                if now_ms() >= expires_at {
                    metrics::counter!("storage.expired").increment(1);
                    self.remove_silent(key);
                    return None;
                }
            }
            return Some(envelope.value);
        }
        None
    }

    /// Write a value with an optional time-to-live. The write lands on the
    /// first tier that accepts it and is then broadcast.
    pub fn set(&self, key: &str, value: &str, ttl: Option<Duration>) {
        let envelope = Envelope {
            value: value.to_string(),
            expires_at: ttl.map(|ttl| now_ms() + ttl.as_millis() as i64),
        };
        let raw = match serde_json::to_string(&envelope) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(key, error = %e, "failed to encode storage envelope");
                return;
            }
        };

        for backend in &self.backends {
            match backend.set(key, &raw) {
                Ok(()) => {
                    let _ = self.changes.send(StorageChange {
                        key: key.to_string(),
                        value: Some(value.to_string()),
                    });
                    return;
                }
                Err(e) => {
                    tracing::debug!(tier = backend.name(), key, error = %e, "storage write failed");
                    metrics::counter!("storage.tier_write_failed").increment(1);
                }
            }
        }
        tracing::warn!(key, "all storage tiers rejected write; value dropped");
    }

    /// Remove a key from every tier and broadcast the removal.
    pub fn remove(&self, key: &str) {
        self.remove_silent(key);
        let _ = self.changes.send(StorageChange {
            key: key.to_string(),
            value: None,
        });
    }

    /// Clear every tier. Does not broadcast per-key removals.
    pub fn clear(&self) {
        for backend in &self.backends {
            if let Err(e) = backend.clear() {
                tracing::debug!(tier = backend.name(), error = %e, "storage clear failed");
            }
        }
    }

    /// Observe writes made through this store (by any sharing context).
    pub fn subscribe(&self) -> broadcast::Receiver<StorageChange> {
        self.changes.subscribe()
    }

    /// Sweep expired envelopes from every tier. Returns the number removed.
    pub fn purge_expired(&self) -> usize {
        let now = now_ms();
        let mut purged = 0;
        for backend in &self.backends {
            let keys = match backend.keys() {
                Ok(keys) => keys,
                Err(_) => continue,
            };
            for key in keys {
                let Ok(Some(raw)) = backend.get(&key) else {
                    continue;
                };
                let expired = serde_json::from_str::<Envelope>(&raw)
                    .map(|envelope| envelope.expires_at.is_some_and(|at| now >= at))
                    .unwrap_or(true);
                if expired && backend.remove(&key).is_ok() {
                    purged += 1;
                }
            }
        }
        purged
    }

    fn remove_silent(&self, key: &str) {
        for backend in &self.backends {
            if let Err(e) = backend.remove(key) {
                tracing::debug!(tier = backend.name(), key, error = %e, "storage remove failed");
            }
        }
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingBackend;

    impl StorageBackend for FailingBackend {
        fn name(&self) -> &'static str {
            "failing"
        }
        fn get(&self, _key: &str) -> anyhow::Result<Option<String>> {
            anyhow::bail!("quota exceeded")
        }
        fn set(&self, _key: &str, _value: &str) -> anyhow::Result<()> {
            anyhow::bail!("quota exceeded")
        }
        fn remove(&self, _key: &str) -> anyhow::Result<()> {
            anyhow::bail!("quota exceeded")
        }
        fn clear(&self) -> anyhow::Result<()> {
            anyhow::bail!("quota exceeded")
        }
        fn keys(&self) -> anyhow::Result<Vec<String>> {
            anyhow::bail!("quota exceeded")
        }
    }

    fn memory_store() -> KeyValueStore {
        KeyValueStore::in_memory(16)
    }

    #[test]
    fn test_set_get_round_trip() {
        let store = memory_store();
        store.set("k", "v", None);
        assert_eq!(store.get("k"), Some("v".into()));
    }

    #[test]
    fn test_get_missing_returns_none() {
        let store = memory_store();
        assert_eq!(store.get("nope"), None);
    }

    #[test]
    fn test_expired_entry_reads_as_absent_and_self_deletes() {
        let store = memory_store();
        store.set("k", "v", Some(Duration::from_millis(0)));
        std::thread::sleep(Duration::from_millis(5));

        assert_eq!(store.get("k"), None);
        // The expired envelope must be gone, not merely masked.
        assert_eq!(store.get("k"), None);
    }

    #[test]
    fn test_unexpired_ttl_value_is_readable() {
        let store = memory_store();
        store.set("k", "v", Some(Duration::from_secs(3600)));
        assert_eq!(store.get("k"), Some("v".into()));
    }

    #[test]
    fn test_failing_tier_degrades_to_next() {
        let store = KeyValueStore::with_backends(vec![
            Arc::new(FailingBackend),
            Arc::new(MemoryBackend::new(16)),
        ]);

        // Write must fall through the broken tier without surfacing an error.
        store.set("k", "v", None);
        assert_eq!(store.get("k"), Some("v".into()));

        store.remove("k");
        assert_eq!(store.get("k"), None);
    }

    #[test]
    fn test_all_operations_are_infallible_with_only_broken_tiers() {
        let store = KeyValueStore::with_backends(vec![Arc::new(FailingBackend)]);
        store.set("k", "v", None);
        assert_eq!(store.get("k"), None);
        store.remove("k");
        store.clear();
        assert_eq!(store.purge_expired(), 0);
    }

    #[test]
    fn test_purge_expired_counts_removed_entries() {
        let store = memory_store();
        store.set("a", "1", Some(Duration::from_millis(0)));
        store.set("b", "2", Some(Duration::from_millis(0)));
        store.set("c", "3", None);
        std::thread::sleep(Duration::from_millis(5));

        assert_eq!(store.purge_expired(), 2);
        assert_eq!(store.get("c"), Some("3".into()));
    }

    #[tokio::test]
    async fn test_subscribe_observes_writes_and_removals() {
        let store = memory_store();
        let mut rx = store.subscribe();

        store.set("k", "v", None);
        let change = rx.recv().await.unwrap();
        assert_eq!(change.key, "k");
        assert_eq!(change.value, Some("v".into()));

        store.remove("k");
        let change = rx.recv().await.unwrap();
        assert_eq!(change.key, "k");
        assert_eq!(change.value, None);
    }

    #[tokio::test]
    async fn test_two_handles_share_one_broadcast() {
        let store = Arc::new(memory_store());
        let mut rx = store.subscribe();

        let writer = store.clone();
        writer.set("session", "{}", None);

        let change = rx.recv().await.unwrap();
        assert_eq!(change.key, "session");
    }
}
