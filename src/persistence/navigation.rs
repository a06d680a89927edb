use super::KeyValueStorage;
use crate::error::DocFiscalResult;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

pub const NAVIGATION_STATE_STORAGE_KEY: &str = "docfiscal-navigation-state";
pub const PAGE_STATE_STORAGE_KEY: &str = "docfiscal-page-state";

/// State saved for one path
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NavigationEntry {
    pub path: String,
    pub data: Value,
    pub saved_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    Pending,
    Uploading,
    Completed,
    Failed,
}

/// Progress of one in-flight upload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadProgress {
    pub upload_id: String,
    pub file_name: String,
    pub bytes_uploaded: u64,
    pub total_bytes: u64,
    pub status: UploadStatus,
    #[serde(default)]
    pub order_id: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl UploadProgress {
    pub fn new<I: Into<String>, F: Into<String>>(upload_id: I, file_name: F, total_bytes: u64) -> Self {
        Self {
            upload_id: upload_id.into(),
            file_name: file_name.into(),
            bytes_uploaded: 0,
            total_bytes,
            status: UploadStatus::Pending,
            order_id: None,
            updated_at: Utc::now(),
        }
    }

    /// Fraction uploaded in `0.0..=1.0`
    pub fn fraction(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        (self.bytes_uploaded as f64 / self.total_bytes as f64).min(1.0)
    }
}

/// Document stored under [`PAGE_STATE_STORAGE_KEY`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PageStateDocument {
    #[serde(default)]
    pub pages: BTreeMap<String, NavigationEntry>,
    #[serde(default)]
    pub uploads: BTreeMap<String, UploadProgress>,
}

/// Durable store for in-flight UI state, keyed by path and upload id.
///
/// Entries older than the configured TTL are treated as absent and removed by
/// [`NavigationStatePersistence::cleanup_expired`].
pub struct NavigationStatePersistence {
    storage: Arc<dyn KeyValueStorage>,
    ttl: ChronoDuration,
    lock: Mutex<()>,
}

impl NavigationStatePersistence {
    pub fn new(storage: Arc<dyn KeyValueStorage>, ttl: Duration) -> Self {
        Self {
            storage,
            ttl: ChronoDuration::from_std(ttl).unwrap_or(ChronoDuration::MAX),
            lock: Mutex::new(()),
        }
    }

    pub fn storage(&self) -> &Arc<dyn KeyValueStorage> {
        &self.storage
    }

    fn is_fresh(&self, at: DateTime<Utc>) -> bool {
        Utc::now().signed_duration_since(at) <= self.ttl
    }

    fn read<T: DeserializeOwned + Default>(&self, key: &str) -> DocFiscalResult<T> {
        match self.storage.get(key)? {
            Some(raw) => match serde_json::from_str(&raw) {
                Ok(doc) => Ok(doc),
                Err(e) => {
                    // A corrupt document is dropped rather than blocking the session
                    warn!(key, error = %e, "Discarding unreadable persisted state");
                    self.storage.remove(key)?;
                    Ok(T::default())
                }
            },
            None => Ok(T::default()),
        }
    }

    fn write<T: Serialize>(&self, key: &str, doc: &T) -> DocFiscalResult<()> {
        let raw = serde_json::to_string(doc)?;
        self.storage.set(key, &raw)
    }

    fn update<T, R>(&self, key: &str, f: impl FnOnce(&mut T) -> R) -> DocFiscalResult<R>
    where
        T: DeserializeOwned + Serialize + Default,
    {
        let _guard = self.lock.lock().unwrap_or_else(|p| p.into_inner());
        let mut doc: T = self.read(key)?;
        let out = f(&mut doc);
        self.write(key, &doc)?;
        Ok(out)
    }

    /// Save navigation state for a path, replacing any previous entry
    pub fn save_navigation_state(&self, path: &str, data: Value) -> DocFiscalResult<()> {
        self.update(
            NAVIGATION_STATE_STORAGE_KEY,
            |doc: &mut BTreeMap<String, NavigationEntry>| {
                doc.insert(
                    path.to_string(),
                    NavigationEntry {
                        path: path.to_string(),
                        data,
                        saved_at: Utc::now(),
                    },
                );
            },
        )?;
        debug!(path, "Navigation state saved");
        Ok(())
    }

    pub fn get_navigation_state(&self, path: &str) -> DocFiscalResult<Option<NavigationEntry>> {
        let doc: BTreeMap<String, NavigationEntry> = self.read(NAVIGATION_STATE_STORAGE_KEY)?;
        Ok(doc.get(path).filter(|e| self.is_fresh(e.saved_at)).cloned())
    }

    pub fn clear_navigation_state(&self, path: &str) -> DocFiscalResult<bool> {
        self.update(
            NAVIGATION_STATE_STORAGE_KEY,
            |doc: &mut BTreeMap<String, NavigationEntry>| doc.remove(path).is_some(),
        )
    }

    /// Save page-level state (form contents, selected tab, ...) for a path
    pub fn save_page_state(&self, path: &str, data: Value) -> DocFiscalResult<()> {
        self.update(PAGE_STATE_STORAGE_KEY, |doc: &mut PageStateDocument| {
            doc.pages.insert(
                path.to_string(),
                NavigationEntry {
                    path: path.to_string(),
                    data,
                    saved_at: Utc::now(),
                },
            );
        })
    }

    pub fn get_page_state(&self, path: &str) -> DocFiscalResult<Option<NavigationEntry>> {
        let doc: PageStateDocument = self.read(PAGE_STATE_STORAGE_KEY)?;
        Ok(doc
            .pages
            .get(path)
            .filter(|e| self.is_fresh(e.saved_at))
            .cloned())
    }

    pub fn save_upload_progress(&self, progress: UploadProgress) -> DocFiscalResult<()> {
        let mut progress = progress;
        progress.updated_at = Utc::now();
        let upload_id = progress.upload_id.clone();
        self.update(PAGE_STATE_STORAGE_KEY, |doc: &mut PageStateDocument| {
            doc.uploads.insert(progress.upload_id.clone(), progress);
        })?;
        debug!(upload_id = %upload_id, "Upload progress saved");
        Ok(())
    }

    pub fn get_upload_progress(&self, upload_id: &str) -> DocFiscalResult<Option<UploadProgress>> {
        let doc: PageStateDocument = self.read(PAGE_STATE_STORAGE_KEY)?;
        Ok(doc
            .uploads
            .get(upload_id)
            .filter(|p| self.is_fresh(p.updated_at))
            .cloned())
    }

    /// All fresh uploads, oldest first
    pub fn list_upload_progress(&self) -> DocFiscalResult<Vec<UploadProgress>> {
        let doc: PageStateDocument = self.read(PAGE_STATE_STORAGE_KEY)?;
        let mut uploads: Vec<UploadProgress> = doc
            .uploads
            .into_values()
            .filter(|p| self.is_fresh(p.updated_at))
            .collect();
        uploads.sort_by_key(|p| p.updated_at);
        Ok(uploads)
    }

    pub fn clear_upload_progress(&self, upload_id: &str) -> DocFiscalResult<bool> {
        self.update(PAGE_STATE_STORAGE_KEY, |doc: &mut PageStateDocument| {
            doc.uploads.remove(upload_id).is_some()
        })
    }

    /// Drop every persisted upload; returns how many were removed
    pub fn clear_all_upload_progress(&self) -> DocFiscalResult<usize> {
        let removed = self.update(PAGE_STATE_STORAGE_KEY, |doc: &mut PageStateDocument| {
            let count = doc.uploads.len();
            doc.uploads.clear();
            count
        })?;
        if removed > 0 {
            info!(removed, "Cleared persisted upload progress");
        }
        Ok(removed)
    }

    /// Remove every entry older than the TTL; returns how many were removed
    pub fn cleanup_expired(&self) -> DocFiscalResult<usize> {
        let nav_removed = self.update(
            NAVIGATION_STATE_STORAGE_KEY,
            |doc: &mut BTreeMap<String, NavigationEntry>| {
                let before = doc.len();
                doc.retain(|_, e| self.is_fresh(e.saved_at));
                before - doc.len()
            },
        )?;

        let page_removed = self.update(PAGE_STATE_STORAGE_KEY, |doc: &mut PageStateDocument| {
            let before = doc.pages.len() + doc.uploads.len();
            doc.pages.retain(|_, e| self.is_fresh(e.saved_at));
            doc.uploads.retain(|_, p| self.is_fresh(p.updated_at));
            before - (doc.pages.len() + doc.uploads.len())
        })?;

        let removed = nav_removed + page_removed;
        if removed > 0 {
            info!(removed, "Removed expired persisted state");
        }
        Ok(removed)
    }
}
