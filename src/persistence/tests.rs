// Persistence Tests
// "What survives a reload"

use super::*;
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const TTL: Duration = Duration::from_secs(30 * 60);

fn memory() -> Arc<dyn KeyValueStorage> {
    Arc::new(MemoryStorage::new())
}

#[test]
fn test_memory_storage_roundtrip() {
    let storage = MemoryStorage::new();

    storage.set("b", "2").unwrap();
    storage.set("a", "1").unwrap();
    assert_eq!(storage.get("a").unwrap().as_deref(), Some("1"));
    assert_eq!(storage.keys().unwrap(), vec!["a", "b"]);

    storage.remove("a").unwrap();
    assert!(storage.get("a").unwrap().is_none());
    // Removing a missing key is fine
    storage.remove("a").unwrap();
}

#[test]
fn test_file_storage_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("session").join("state.json");

    let storage = FileStorage::new(&path);
    storage.set("docfiscal-auth-token", "abc").unwrap();
    storage.set("other", "x").unwrap();
    storage.remove("other").unwrap();
    drop(storage);

    let reopened = FileStorage::new(&path);
    assert_eq!(
        reopened.get("docfiscal-auth-token").unwrap().as_deref(),
        Some("abc")
    );
    assert_eq!(reopened.keys().unwrap(), vec!["docfiscal-auth-token"]);
    assert!(!path.with_extension("tmp").exists());
}

#[test]
fn test_file_storage_reports_corruption() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("state.json");
    std::fs::write(&path, "{ broken").unwrap();

    let storage = FileStorage::new(&path);
    assert!(storage.get("anything").is_err());
}

#[test]
fn test_auth_token_store() {
    let tokens = AuthTokenStore::new(memory());

    assert_eq!(tokens.token().unwrap(), None);
    tokens.set_token("bearer-123").unwrap();
    assert_eq!(tokens.token().unwrap().as_deref(), Some("bearer-123"));
    tokens.clear().unwrap();
    assert_eq!(tokens.token().unwrap(), None);
}

#[test]
fn test_navigation_state_roundtrip() {
    let persistence = NavigationStatePersistence::new(memory(), TTL);

    persistence
        .save_navigation_state("/orders/o1", json!({"scroll": 120}))
        .unwrap();
    let entry = persistence
        .get_navigation_state("/orders/o1")
        .unwrap()
        .unwrap();
    assert_eq!(entry.data, json!({"scroll": 120}));
    assert!(persistence.get_navigation_state("/other").unwrap().is_none());

    assert!(persistence.clear_navigation_state("/orders/o1").unwrap());
    assert!(!persistence.clear_navigation_state("/orders/o1").unwrap());
}

#[test]
fn test_page_state_and_uploads_share_a_document() {
    let storage = memory();
    let persistence = NavigationStatePersistence::new(Arc::clone(&storage), TTL);

    persistence
        .save_page_state("/upload", json!({"step": 2}))
        .unwrap();
    let mut progress = UploadProgress::new("up-1", "invoice.pdf", 200);
    progress.bytes_uploaded = 50;
    progress.status = UploadStatus::Uploading;
    persistence.save_upload_progress(progress).unwrap();

    let raw = storage.get(PAGE_STATE_STORAGE_KEY).unwrap().unwrap();
    let doc: PageStateDocument = serde_json::from_str(&raw).unwrap();
    assert!(doc.pages.contains_key("/upload"));
    assert_eq!(doc.uploads["up-1"].bytes_uploaded, 50);

    let saved = persistence.get_upload_progress("up-1").unwrap().unwrap();
    assert_eq!(saved.status, UploadStatus::Uploading);
    assert!((saved.fraction() - 0.25).abs() < f64::EPSILON);
    assert_eq!(persistence.list_upload_progress().unwrap().len(), 1);
}

#[test]
fn test_clear_upload_progress() {
    let persistence = NavigationStatePersistence::new(memory(), TTL);
    for id in ["up-1", "up-2", "up-3"] {
        persistence
            .save_upload_progress(UploadProgress::new(id, "f.pdf", 10))
            .unwrap();
    }

    assert!(persistence.clear_upload_progress("up-2").unwrap());
    assert_eq!(persistence.list_upload_progress().unwrap().len(), 2);

    assert_eq!(persistence.clear_all_upload_progress().unwrap(), 2);
    assert!(persistence.list_upload_progress().unwrap().is_empty());
    assert_eq!(persistence.clear_all_upload_progress().unwrap(), 0);
}

#[test]
fn test_expired_entries_are_hidden_and_cleaned() {
    let storage = memory();
    let stale = Utc::now() - ChronoDuration::hours(2);

    let mut navigation = BTreeMap::new();
    navigation.insert(
        "/old".to_string(),
        NavigationEntry {
            path: "/old".to_string(),
            data: json!({}),
            saved_at: stale,
        },
    );
    storage
        .set(
            NAVIGATION_STATE_STORAGE_KEY,
            &serde_json::to_string(&navigation).unwrap(),
        )
        .unwrap();

    let mut old_upload = UploadProgress::new("up-old", "old.pdf", 10);
    old_upload.updated_at = stale;
    let mut page = PageStateDocument::default();
    page.uploads.insert("up-old".to_string(), old_upload);
    storage
        .set(PAGE_STATE_STORAGE_KEY, &serde_json::to_string(&page).unwrap())
        .unwrap();

    let persistence = NavigationStatePersistence::new(Arc::clone(&storage), TTL);
    persistence
        .save_navigation_state("/fresh", json!({"ok": true}))
        .unwrap();

    assert!(persistence.get_navigation_state("/old").unwrap().is_none());
    assert!(persistence.get_upload_progress("up-old").unwrap().is_none());

    assert_eq!(persistence.cleanup_expired().unwrap(), 2);
    assert!(persistence.get_navigation_state("/fresh").unwrap().is_some());
    assert_eq!(persistence.cleanup_expired().unwrap(), 0);
}

#[test]
fn test_corrupt_document_is_discarded() {
    let storage = memory();
    storage.set(PAGE_STATE_STORAGE_KEY, "[1, 2").unwrap();
    let persistence = NavigationStatePersistence::new(Arc::clone(&storage), TTL);

    assert!(persistence.get_page_state("/upload").unwrap().is_none());
    assert!(storage.get(PAGE_STATE_STORAGE_KEY).unwrap().is_none());

    persistence
        .save_page_state("/upload", json!({"step": 1}))
        .unwrap();
    assert!(persistence.get_page_state("/upload").unwrap().is_some());
}
