//! Storage backends, ordered by durability preference.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

/// A single storage tier. Implementations are fallible; the layering in
/// [`crate::KeyValueStore`] is what turns failures into silent degradation.
pub trait StorageBackend: Send + Sync {
    /// Short tier name for logs and metrics.
    fn name(&self) -> &'static str;

    fn get(&self, key: &str) -> anyhow::Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> anyhow::Result<()>;
    fn remove(&self, key: &str) -> anyhow::Result<()>;
    fn clear(&self) -> anyhow::Result<()>;

    /// All keys currently held by this tier. Used by the expiry sweep.
    fn keys(&self) -> anyhow::Result<Vec<String>>;
}

/// File-per-key backend rooted at a namespace directory. Serves both the
/// durable tier (host-configured directory) and the best-effort temp tier.
pub struct FileBackend {
    name: &'static str,
    dir: PathBuf,
}

impl FileBackend {
    pub fn new(name: &'static str, dir: impl Into<PathBuf>) -> Self {
        Self {
            name,
            dir: dir.into(),
        }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        // Keys are prefix-namespaced identifiers; defang anything else.
        let safe: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{safe}.json"))
    }
}

impl StorageBackend for FileBackend {
    fn name(&self) -> &'static str {
        self.name
    }

    fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        match std::fs::read_to_string(self.path_for(key)) {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set(&self, key: &str, value: &str) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        std::fs::write(self.path_for(key), value)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> anyhow::Result<()> {
        match std::fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn clear(&self) -> anyhow::Result<()> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                let _ = std::fs::remove_file(path);
            }
        }
        Ok(())
    }

    fn keys(&self) -> anyhow::Result<Vec<String>> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut keys = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    keys.push(stem.to_string());
                }
            }
        }
        Ok(keys)
    }
}

struct MemoryEntry {
    value: String,
    seq: u64,
}

/// Bounded in-memory fallback tier. Never fails; once capacity is reached
/// the oldest entry (by insertion order) is evicted to make room.
pub struct MemoryBackend {
    entries: DashMap<String, MemoryEntry>,
    capacity: usize,
    seq: AtomicU64,
}

impl MemoryBackend {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: DashMap::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
            seq: AtomicU64::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn evict_oldest(&self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|e| e.value().seq)
            .map(|e| e.key().clone());
        if let Some(key) = oldest {
            self.entries.remove(&key);
            tracing::debug!(key = %key, "memory tier full, evicted oldest entry");
        }
    }
}

impl StorageBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        Ok(self.entries.get(key).map(|e| e.value.clone()))
    }

    fn set(&self, key: &str, value: &str) -> anyhow::Result<()> {
        if self.entries.len() >= self.capacity && !self.entries.contains_key(key) {
            self.evict_oldest();
        }
        self.entries.insert(
            key.to_string(),
            MemoryEntry {
                value: value.to_string(),
                seq: self.seq.fetch_add(1, Ordering::Relaxed),
            },
        );
        Ok(())
    }

    fn remove(&self, key: &str) -> anyhow::Result<()> {
        self.entries.remove(key);
        Ok(())
    }

    fn clear(&self) -> anyhow::Result<()> {
        self.entries.clear();
        Ok(())
    }

    fn keys(&self) -> anyhow::Result<Vec<String>> {
        Ok(self.entries.iter().map(|e| e.key().clone()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_backend_round_trip() {
        let backend = MemoryBackend::new(10);
        backend.set("a", "1").unwrap();
        assert_eq!(backend.get("a").unwrap(), Some("1".into()));
        backend.remove("a").unwrap();
        assert_eq!(backend.get("a").unwrap(), None);
    }

    #[test]
    fn test_memory_backend_evicts_oldest_at_capacity() {
        let backend = MemoryBackend::new(3);
        backend.set("a", "1").unwrap();
        backend.set("b", "2").unwrap();
        backend.set("c", "3").unwrap();
        backend.set("d", "4").unwrap();

        assert_eq!(backend.len(), 3);
        assert_eq!(backend.get("a").unwrap(), None, "oldest should be evicted");
        assert_eq!(backend.get("d").unwrap(), Some("4".into()));
    }

    #[test]
    fn test_memory_backend_overwrite_does_not_evict() {
        let backend = MemoryBackend::new(2);
        backend.set("a", "1").unwrap();
        backend.set("b", "2").unwrap();
        // Overwriting an existing key at capacity must not drop anything.
        backend.set("a", "1b").unwrap();

        assert_eq!(backend.len(), 2);
        assert_eq!(backend.get("a").unwrap(), Some("1b".into()));
        assert_eq!(backend.get("b").unwrap(), Some("2".into()));
    }

    #[test]
    fn test_file_backend_round_trip() {
        let dir = std::env::temp_dir().join(format!("pulse-storage-{}", uuid::Uuid::new_v4()));
        let backend = FileBackend::new("file", &dir);

        assert_eq!(backend.get("session").unwrap(), None);
        backend.set("session", "{\"v\":1}").unwrap();
        assert_eq!(backend.get("session").unwrap(), Some("{\"v\":1}".into()));
        assert_eq!(backend.keys().unwrap(), vec!["session".to_string()]);

        backend.remove("session").unwrap();
        assert_eq!(backend.get("session").unwrap(), None);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_file_backend_sanitizes_keys() {
        let dir = std::env::temp_dir().join(format!("pulse-storage-{}", uuid::Uuid::new_v4()));
        let backend = FileBackend::new("file", &dir);

        backend.set("../evil/key", "x").unwrap();
        assert_eq!(backend.get("../evil/key").unwrap(), Some("x".into()));
        // The write must land inside the namespace directory.
        assert_eq!(backend.keys().unwrap().len(), 1);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_file_backend_clear_removes_all_entries() {
        let dir = std::env::temp_dir().join(format!("pulse-storage-{}", uuid::Uuid::new_v4()));
        let backend = FileBackend::new("file", &dir);
        backend.set("a", "1").unwrap();
        backend.set("b", "2").unwrap();

        backend.clear().unwrap();
        assert!(backend.keys().unwrap().is_empty());

        let _ = std::fs::remove_dir_all(&dir);
    }
}
