//! Active-context registry — which tabs/processes currently hold the
//! session, keyed by tab id.
//!
//! Stored as one JSON document and updated read-modify-write. Writes are
//! last-writer-wins; the periodic heartbeat makes the registry self-healing,
//! so no cross-context locking is needed.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use pulse_storage::KeyValueStore;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TabEntry {
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub session_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ActiveTabRegistry {
    pub tabs: HashMap<String, TabEntry>,
}

impl ActiveTabRegistry {
    /// Load the registry from storage; a missing or corrupt document reads
    /// as empty.
    pub fn load(store: &KeyValueStore, key: &str) -> Self {
        store
            .get(key)
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default()
    }

    pub fn save(&self, store: &KeyValueStore, key: &str) {
        match serde_json::to_string(self) {
            Ok(raw) => store.set(key, &raw, None),
            Err(e) => tracing::debug!(error = %e, "failed to encode tab registry"),
        }
    }

    /// Record liveness for a tab, creating its entry on first contact.
    pub fn heartbeat(&mut self, tab_id: &str, session_id: &str) {
        let now = Utc::now();
        self.tabs
            .entry(tab_id.to_string())
            .and_modify(|entry| {
                entry.last_heartbeat = now;
                entry.session_id = session_id.to_string();
            })
            .or_insert(TabEntry {
                started_at: now,
                last_heartbeat: now,
                session_id: session_id.to_string(),
            });
    }

    /// Drop entries whose heartbeat is older than the liveness window.
    /// Returns the pruned tab ids.
    pub fn prune_stale(&mut self, stale_after: Duration) -> Vec<String> {
        let cutoff = Utc::now()
            - chrono::Duration::milliseconds(stale_after.as_millis() as i64);
        let stale: Vec<String> = self
            .tabs
            .iter()
            .filter(|(_, entry)| entry.last_heartbeat < cutoff)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            self.tabs.remove(id);
            tracing::debug!(tab_id = %id, "pruned stale tab registry entry");
        }
        stale
    }

    pub fn remove(&mut self, tab_id: &str) {
        self.tabs.remove(tab_id);
    }

    pub fn len(&self) -> usize {
        self.tabs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tabs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heartbeat_creates_then_refreshes_entry() {
        let mut registry = ActiveTabRegistry::default();
        registry.heartbeat("tab-1", "s-1");
        assert_eq!(registry.len(), 1);

        let first = registry.tabs["tab-1"].clone();
        std::thread::sleep(Duration::from_millis(5));
        registry.heartbeat("tab-1", "s-2");

        let second = &registry.tabs["tab-1"];
        assert_eq!(second.started_at, first.started_at);
        assert!(second.last_heartbeat > first.last_heartbeat);
        assert_eq!(second.session_id, "s-2");
    }

    #[test]
    fn test_prune_stale_removes_only_dead_tabs() {
        let mut registry = ActiveTabRegistry::default();
        registry.heartbeat("alive", "s-1");
        registry.tabs.insert(
            "dead".into(),
            TabEntry {
                started_at: Utc::now() - chrono::Duration::minutes(5),
                last_heartbeat: Utc::now() - chrono::Duration::minutes(5),
                session_id: "s-1".into(),
            },
        );

        let pruned = registry.prune_stale(Duration::from_secs(60));
        assert_eq!(pruned, vec!["dead".to_string()]);
        assert!(registry.tabs.contains_key("alive"));
    }

    #[test]
    fn test_load_defaults_on_missing_or_corrupt_document() {
        let store = KeyValueStore::in_memory(8);
        assert!(ActiveTabRegistry::load(&store, "active_tabs").is_empty());

        store.set("active_tabs", "not json", None);
        assert!(ActiveTabRegistry::load(&store, "active_tabs").is_empty());
    }

    #[test]
    fn test_save_load_round_trip() {
        let store = KeyValueStore::in_memory(8);
        let mut registry = ActiveTabRegistry::default();
        registry.heartbeat("tab-1", "s-1");
        registry.save(&store, "active_tabs");

        let loaded = ActiveTabRegistry::load(&store, "active_tabs");
        assert_eq!(loaded, registry);
    }
}
