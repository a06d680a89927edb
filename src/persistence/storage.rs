use crate::error::{DocFiscalResult, TypedError};
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

/// Durable string key/value storage (the session storage of the host)
pub trait KeyValueStorage: Send + Sync {
    fn get(&self, key: &str) -> DocFiscalResult<Option<String>>;
    fn set(&self, key: &str, value: &str) -> DocFiscalResult<()>;
    fn remove(&self, key: &str) -> DocFiscalResult<()>;
    fn keys(&self) -> DocFiscalResult<Vec<String>>;
}

/// In-process storage; lives as long as the value does
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: DashMap<String, String>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStorage for MemoryStorage {
    fn get(&self, key: &str) -> DocFiscalResult<Option<String>> {
        Ok(self.entries.get(key).map(|v| v.value().clone()))
    }

    fn set(&self, key: &str, value: &str) -> DocFiscalResult<()> {
        self.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> DocFiscalResult<()> {
        self.entries.remove(key);
        Ok(())
    }

    fn keys(&self) -> DocFiscalResult<Vec<String>> {
        let mut keys: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        Ok(keys)
    }
}

/// Storage backed by a single JSON document on disk.
///
/// Every write rewrites the document through a temporary file and a rename,
/// so a crash never leaves a half-written file behind.
#[derive(Debug)]
pub struct FileStorage {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileStorage {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> DocFiscalResult<BTreeMap<String, String>> {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) if contents.trim().is_empty() => Ok(BTreeMap::new()),
            Ok(contents) => serde_json::from_str(&contents).map_err(|e| {
                TypedError::client(format!("Corrupt storage file: {e}"))
                    .with_context("path", self.path.display().to_string())
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(TypedError::client(format!("Failed to read storage file: {e}"))
                .with_context("path", self.path.display().to_string())),
        }
    }

    fn store(&self, entries: &BTreeMap<String, String>) -> DocFiscalResult<()> {
        let serialized = serde_json::to_string_pretty(entries)?;
        let tmp = self.path.with_extension("tmp");

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    TypedError::client(format!("Failed to create storage directory: {e}"))
                })?;
            }
        }

        std::fs::write(&tmp, serialized)
            .and_then(|_| std::fs::rename(&tmp, &self.path))
            .map_err(|e| {
                TypedError::client(format!("Failed to persist storage file: {e}"))
                    .with_context("path", self.path.display().to_string())
            })?;

        debug!(path = %self.path.display(), entries = entries.len(), "Storage persisted");
        Ok(())
    }

    fn with_entries<T>(
        &self,
        f: impl FnOnce(&mut BTreeMap<String, String>) -> (T, bool),
    ) -> DocFiscalResult<T> {
        let _guard = self.lock.lock().unwrap_or_else(|p| p.into_inner());
        let mut entries = self.load()?;
        let (out, dirty) = f(&mut entries);
        if dirty {
            self.store(&entries)?;
        }
        Ok(out)
    }
}

impl KeyValueStorage for FileStorage {
    fn get(&self, key: &str) -> DocFiscalResult<Option<String>> {
        self.with_entries(|entries| (entries.get(key).cloned(), false))
    }

    fn set(&self, key: &str, value: &str) -> DocFiscalResult<()> {
        self.with_entries(|entries| {
            entries.insert(key.to_string(), value.to_string());
            ((), true)
        })
    }

    fn remove(&self, key: &str) -> DocFiscalResult<()> {
        self.with_entries(|entries| {
            let removed = entries.remove(key).is_some();
            ((), removed)
        })
    }

    fn keys(&self) -> DocFiscalResult<Vec<String>> {
        self.with_entries(|entries| (entries.keys().cloned().collect(), false))
    }
}
