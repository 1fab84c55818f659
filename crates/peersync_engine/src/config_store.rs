//! Key/value persistence for sync settings.

use crate::error::{SyncError, SyncResult};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// External key/value store the orchestrator persists its settings into.
pub trait ConfigStore: Send + Sync {
    /// Reads a value.
    fn get(&self, key: &str) -> SyncResult<Option<String>>;

    /// Writes a value durably.
    fn set(&self, key: &str, value: &str) -> SyncResult<()>;
}

/// A config store kept in memory.
#[derive(Debug, Default)]
pub struct MemoryConfigStore {
    values: RwLock<BTreeMap<String, String>>,
}

impl MemoryConfigStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store seeded with values.
    pub fn with_values<K, V>(values: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            values: RwLock::new(
                values
                    .into_iter()
                    .map(|(k, v)| (k.into(), v.into()))
                    .collect(),
            ),
        }
    }
}

impl ConfigStore for MemoryConfigStore {
    fn get(&self, key: &str) -> SyncResult<Option<String>> {
        Ok(self.values.read().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> SyncResult<()> {
        self.values.write().insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// A config store backed by a flat JSON object on disk.
///
/// The whole file is rewritten on every `set`, through a temporary file
/// renamed into place.
#[derive(Debug)]
pub struct JsonFileConfigStore {
    path: PathBuf,
    values: RwLock<BTreeMap<String, String>>,
}

impl JsonFileConfigStore {
    /// Opens the store at `path`, starting empty if the file does not exist.
    pub fn open(path: impl AsRef<Path>) -> SyncResult<Self> {
        let path = path.as_ref().to_path_buf();
        let values = match fs::read(&path) {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => BTreeMap::new(),
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                SyncError::Configuration(format!("cannot parse {}: {e}", path.display()))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            path,
            values: RwLock::new(values),
        })
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns a copy of every stored value.
    pub fn entries(&self) -> BTreeMap<String, String> {
        self.values.read().clone()
    }

    fn flush(&self, values: &BTreeMap<String, String>) -> SyncResult<()> {
        let json = serde_json::to_vec_pretty(values)
            .map_err(|e| SyncError::Configuration(e.to_string()))?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl ConfigStore for JsonFileConfigStore {
    fn get(&self, key: &str) -> SyncResult<Option<String>> {
        Ok(self.values.read().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> SyncResult<()> {
        let mut values = self.values.write();
        let previous = values.insert(key.to_string(), value.to_string());
        if let Err(e) = self.flush(&values) {
            match previous {
                Some(old) => values.insert(key.to_string(), old),
                None => values.remove(key),
            };
            return Err(e);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn memory_store_roundtrip() {
        let store = MemoryConfigStore::with_values([("sync.role", "CLIENT")]);
        assert_eq!(store.get("sync.role").unwrap().as_deref(), Some("CLIENT"));
        assert_eq!(store.get("sync.hybrid_mode").unwrap(), None);

        store.set("sync.role", "SERVER").unwrap();
        assert_eq!(store.get("sync.role").unwrap().as_deref(), Some("SERVER"));
    }

    #[test]
    fn json_store_persists_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("sync.json");

        let store = JsonFileConfigStore::open(&path).unwrap();
        assert!(store.entries().is_empty());
        store.set("sync.interval_minutes", "15").unwrap();
        store.set("sync.role", "BOTH").unwrap();
        drop(store);

        let reopened = JsonFileConfigStore::open(&path).unwrap();
        assert_eq!(
            reopened.get("sync.interval_minutes").unwrap().as_deref(),
            Some("15")
        );
        assert_eq!(reopened.entries().len(), 2);
    }

    #[test]
    fn json_store_rejects_garbage() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sync.json");
        fs::write(&path, b"not json").unwrap();

        assert!(matches!(
            JsonFileConfigStore::open(&path),
            Err(SyncError::Configuration(_))
        ));
    }
}
