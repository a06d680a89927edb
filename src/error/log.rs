// Error Log
// "Raw messages belong in the log, never on the screen"

use super::{ErrorContext, ErrorKind, ErrorSeverity, TypedError};
use crate::persistence::KeyValueStorage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tracing::warn;
use uuid::Uuid;

pub const ERROR_LOG_STORAGE_KEY: &str = "docfiscal-error-logs";
pub const DEFAULT_ERROR_LOG_CAPACITY: usize = 50;

/// One persisted error log record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorLogEntry {
    pub correlation_id: Uuid,
    pub kind: ErrorKind,
    pub severity: ErrorSeverity,
    pub message: String,
    pub error_context: ErrorContext,
    /// Context supplied by the caller at logging time
    pub log_context: ErrorContext,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_trace: Option<String>,
    pub occurred_at: DateTime<Utc>,
    pub logged_at: DateTime<Utc>,
}

impl ErrorLogEntry {
    fn from_error(error: &TypedError, log_context: ErrorContext) -> Self {
        Self {
            correlation_id: error.correlation_id,
            kind: error.kind,
            severity: error.severity,
            message: error.message.clone(),
            error_context: error.context.clone(),
            log_context,
            source_trace: error.source_trace.clone(),
            occurred_at: error.timestamp,
            logged_at: Utc::now(),
        }
    }
}

/// Emits a structured tracing event for every error and keeps the most recent
/// ones in a capped ring buffer persisted to session storage.
pub struct ErrorLogger {
    storage: Arc<dyn KeyValueStorage>,
    capacity: usize,
    lock: Mutex<()>,
}

impl ErrorLogger {
    pub fn new(storage: Arc<dyn KeyValueStorage>) -> Self {
        Self::with_capacity(storage, DEFAULT_ERROR_LOG_CAPACITY)
    }

    pub fn with_capacity(storage: Arc<dyn KeyValueStorage>, capacity: usize) -> Self {
        Self {
            storage,
            capacity: capacity.max(1),
            lock: Mutex::new(()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Log an error. Persistence failures are reported through tracing only.
    pub fn log_error(&self, error: &TypedError, context: ErrorContext) {
        crate::log_error!(
            error,
            "DocFiscal error",
            category = error.category(),
            log_context = ?context
        );

        if let Err(e) = self.append(ErrorLogEntry::from_error(error, context)) {
            warn!(error = %e, "Failed to persist error log entry");
        }
    }

    fn append(&self, entry: ErrorLogEntry) -> Result<(), TypedError> {
        let _guard = self.lock.lock().unwrap_or_else(|p| p.into_inner());

        let mut entries = self.load()?;
        entries.push_back(entry);
        while entries.len() > self.capacity {
            entries.pop_front();
        }

        let raw = serde_json::to_string(&entries)?;
        self.storage.set(ERROR_LOG_STORAGE_KEY, &raw)
    }

    fn load(&self) -> Result<VecDeque<ErrorLogEntry>, TypedError> {
        match self.storage.get(ERROR_LOG_STORAGE_KEY)? {
            Some(raw) => Ok(serde_json::from_str(&raw).unwrap_or_else(|e| {
                warn!(error = %e, "Error log unreadable, starting a new one");
                VecDeque::new()
            })),
            None => Ok(VecDeque::new()),
        }
    }

    /// Persisted entries, oldest first
    pub fn recent_errors(&self) -> Vec<ErrorLogEntry> {
        let _guard = self.lock.lock().unwrap_or_else(|p| p.into_inner());
        match self.load() {
            Ok(entries) => entries.into_iter().collect(),
            Err(e) => {
                warn!(error = %e, "Failed to read error log");
                Vec::new()
            }
        }
    }

    pub fn clear(&self) {
        let _guard = self.lock.lock().unwrap_or_else(|p| p.into_inner());
        if let Err(e) = self.storage.remove(ERROR_LOG_STORAGE_KEY) {
            warn!(error = %e, "Failed to clear error log");
        }
    }
}
