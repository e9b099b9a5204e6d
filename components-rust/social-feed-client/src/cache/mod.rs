//! Snapshots of store state kept in local key-value storage.

use crate::common::snapshot;
use crate::common::sync::lock;
use crate::error::{Error, Result};
use crate::telemetry::{Event, Telemetry};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;

    fn set(&self, key: &str, value: &str) -> Result<()>;

    fn remove(&self, key: &str) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(lock(&self.values).get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        lock(&self.values).insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        lock(&self.values).remove(key);
        Ok(())
    }
}

/// One file per key under a directory.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .map_err(|e| Error::Storage(format!("cannot create {}: {e}", dir.display())))?;
        Ok(FileStore { dir })
    }

    fn path(&self, key: &str) -> PathBuf {
        let name: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{name}.json"))
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        match std::fs::read_to_string(self.path(key)) {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Storage(format!("cannot read {key}: {e}"))),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        std::fs::write(self.path(key), value)
            .map_err(|e| Error::Storage(format!("cannot write {key}: {e}")))
    }

    fn remove(&self, key: &str) -> Result<()> {
        match std::fs::remove_file(self.path(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Storage(format!("cannot remove {key}: {e}"))),
        }
    }
}

/// Domain-prefixed snapshots over a [`KeyValueStore`]. Reads never fail: missing
/// or unreadable data yields the empty default.
#[derive(Clone)]
pub struct PersistedCache {
    store: Arc<dyn KeyValueStore>,
    prefix: String,
    telemetry: Arc<dyn Telemetry>,
}

impl PersistedCache {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        prefix: impl Into<String>,
        telemetry: Arc<dyn Telemetry>,
    ) -> Self {
        PersistedCache {
            store,
            prefix: prefix.into(),
            telemetry,
        }
    }

    pub fn key(&self, domain: &str) -> String {
        format!("{}:{domain}", self.prefix)
    }

    pub fn load<T>(&self, domain: &'static str) -> T
    where
        T: DeserializeOwned + Default,
    {
        let key = self.key(domain);
        let text = match self.store.get(&key) {
            Ok(Some(text)) => text,
            Ok(None) => return T::default(),
            Err(err) => {
                self.corrupted(domain, &key, err.to_string());
                return T::default();
            }
        };

        match snapshot::deserialize(&text) {
            Ok(state) => {
                self.telemetry
                    .record(Event::new(domain, "cache.restored").field("key", &key));
                state
            }
            Err(err) => {
                self.corrupted(domain, &key, err);
                T::default()
            }
        }
    }

    /// Overwrites the snapshot; a failed write is reported and otherwise ignored.
    pub fn save<T>(&self, domain: &'static str, state: &T)
    where
        T: Serialize,
    {
        let key = self.key(domain);
        let result = snapshot::serialize(state)
            .map_err(Error::Decode)
            .and_then(|text| self.store.set(&key, &text));

        if let Err(err) = result {
            self.telemetry.record(
                Event::warn(domain, "cache.write_failed")
                    .field("key", &key)
                    .field("error", err),
            );
        }
    }

    pub fn clear(&self, domain: &'static str) {
        let key = self.key(domain);
        if let Err(err) = self.store.remove(&key) {
            self.telemetry.record(
                Event::warn(domain, "cache.write_failed")
                    .field("key", &key)
                    .field("error", err),
            );
        }
    }

    fn corrupted(&self, domain: &'static str, key: &str, error: String) {
        self.telemetry.record(
            Event::warn(domain, "cache.corrupted")
                .field("key", key)
                .field("error", error),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::RecordingTelemetry;
    use serde::Deserialize;

    #[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
    struct Snapshot {
        items: Vec<String>,
    }

    #[test]
    fn missing_and_corrupted_snapshots_are_empty() {
        let store = Arc::new(MemoryStore::new());
        let telemetry = Arc::new(RecordingTelemetry::new());
        let cache = PersistedCache::new(store.clone(), "app", telemetry.clone());

        assert_eq!(cache.load::<Snapshot>("search"), Snapshot::default());
        assert_eq!(telemetry.count("search", "cache.corrupted"), 0);

        store.set("app:search", "v1\n{\"items\": 3}").unwrap();
        assert_eq!(cache.load::<Snapshot>("search"), Snapshot::default());
        assert_eq!(telemetry.count("search", "cache.corrupted"), 1);
    }

    #[test]
    fn save_then_load() {
        let telemetry = Arc::new(RecordingTelemetry::new());
        let cache = PersistedCache::new(Arc::new(MemoryStore::new()), "app", telemetry);
        let state = Snapshot {
            items: vec!["a".to_string(), "b".to_string()],
        };

        cache.save("activity", &state);
        assert_eq!(cache.load::<Snapshot>("activity"), state);

        cache.clear("activity");
        assert_eq!(cache.load::<Snapshot>("activity"), Snapshot::default());
    }

    #[test]
    fn file_store_roundtrip() {
        let dir = std::env::temp_dir().join(format!("social-feed-{}", uuid::Uuid::new_v4()));
        let store = FileStore::new(&dir).unwrap();

        assert_eq!(store.get("app:profile").unwrap(), None);
        store.set("app:profile", "v1\n{}").unwrap();
        assert_eq!(store.get("app:profile").unwrap().as_deref(), Some("v1\n{}"));
        store.remove("app:profile").unwrap();
        store.remove("app:profile").unwrap();
        assert_eq!(store.get("app:profile").unwrap(), None);

        let _ = std::fs::remove_dir_all(dir);
    }
}
