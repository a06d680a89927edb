// Error Handling Module
// "Every failure gets a name before it reaches the user"

mod classification;
pub mod global;
pub mod log;
pub mod messages;
pub mod recovery;

pub use classification::{
    assess, classify_error, classify_http_status, ClassificationRule, ErrorClassifier, RawFailure,
    DEFAULT_RULES,
};
pub use messages::user_friendly_message;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Free-form metadata attached to a [`TypedError`]
pub type ErrorContext = BTreeMap<String, Value>;

/// Error kinds understood by the recovery pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    Network,
    Validation,
    Authentication,
    Authorization,
    NotFound,
    Server,
    Client,
    Upload,
    Payment,
    Unknown,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 10] = [
        ErrorKind::Network,
        ErrorKind::Validation,
        ErrorKind::Authentication,
        ErrorKind::Authorization,
        ErrorKind::NotFound,
        ErrorKind::Server,
        ErrorKind::Client,
        ErrorKind::Upload,
        ErrorKind::Payment,
        ErrorKind::Unknown,
    ];

    /// Stable lowercase name used in logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Validation => "validation",
            Self::Authentication => "authentication",
            Self::Authorization => "authorization",
            Self::NotFound => "not_found",
            Self::Server => "server",
            Self::Client => "client",
            Self::Upload => "upload",
            Self::Payment => "payment",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How loudly an error should be reported
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl ErrorSeverity {
    /// Tracing level used when the error is logged
    pub fn level(&self) -> tracing::Level {
        match self {
            Self::Low => tracing::Level::INFO,
            Self::Medium => tracing::Level::WARN,
            Self::High | Self::Critical => tracing::Level::ERROR,
        }
    }
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// Structured error carried through every layer of the crate.
///
/// `severity` and `retryable` are never set directly: they are derived from
/// `kind`, `message` and `context` by [`assess`] whenever one of those inputs
/// changes, so two errors built from the same inputs always agree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind} error: {message}")]
pub struct TypedError {
    pub kind: ErrorKind,
    pub severity: ErrorSeverity,
    pub message: String,
    pub context: ErrorContext,
    pub timestamp: DateTime<Utc>,
    pub correlation_id: Uuid,
    pub retryable: bool,
    /// Rendered source chain or backtrace of the value this error was built from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_trace: Option<String>,
}

/// Result type alias for convenience
pub type DocFiscalResult<T> = Result<T, TypedError>;

impl TypedError {
    /// Build an error of the given kind with an empty context
    pub fn new<S: Into<String>>(kind: ErrorKind, message: S) -> Self {
        Self::with_context_map(kind, message, ErrorContext::new())
    }

    /// Build an error of the given kind with a prepared context
    pub fn with_context_map<S: Into<String>>(
        kind: ErrorKind,
        message: S,
        context: ErrorContext,
    ) -> Self {
        let message = message.into();
        let (severity, retryable) = assess(kind, &message, &context);

        Self {
            kind,
            severity,
            message,
            context,
            timestamp: Utc::now(),
            correlation_id: Uuid::new_v4(),
            retryable,
            source_trace: None,
        }
    }

    /// Create a network error
    pub fn network<S: Into<String>>(message: S) -> Self {
        Self::new(ErrorKind::Network, message)
    }

    /// Create a validation error
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    /// Create an authentication error
    pub fn authentication<S: Into<String>>(message: S) -> Self {
        Self::new(ErrorKind::Authentication, message)
    }

    /// Create an authorization error
    pub fn authorization<S: Into<String>>(message: S) -> Self {
        Self::new(ErrorKind::Authorization, message)
    }

    /// Create a not found error
    pub fn not_found<S: Into<String>>(message: S) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    /// Create a server error
    pub fn server<S: Into<String>>(message: S) -> Self {
        Self::new(ErrorKind::Server, message)
    }

    /// Create a client error
    pub fn client<S: Into<String>>(message: S) -> Self {
        Self::new(ErrorKind::Client, message)
    }

    /// Create an upload error
    pub fn upload<S: Into<String>>(message: S) -> Self {
        Self::new(ErrorKind::Upload, message)
    }

    /// Create a payment error
    pub fn payment<S: Into<String>>(message: S) -> Self {
        Self::new(ErrorKind::Payment, message)
    }

    /// Create an unknown error
    pub fn unknown<S: Into<String>>(message: S) -> Self {
        Self::new(ErrorKind::Unknown, message)
    }

    /// Attach a context value, re-deriving severity and retryability
    pub fn with_context<K: Into<String>, V: Into<Value>>(mut self, key: K, value: V) -> Self {
        self.context.insert(key.into(), value.into());
        self.reassess();
        self
    }

    /// Attach the rendered source chain of the originating value
    pub fn with_source_trace<S: Into<String>>(mut self, trace: S) -> Self {
        self.source_trace = Some(trace.into());
        self
    }

    fn reassess(&mut self) {
        let (severity, retryable) = assess(self.kind, &self.message, &self.context);
        self.severity = severity;
        self.retryable = retryable;
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Get error category for metrics and logging
    pub fn category(&self) -> &'static str {
        self.kind.as_str()
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    /// Get severity level for logging
    pub fn level(&self) -> tracing::Level {
        self.severity.level()
    }

    /// The canned message shown to users for this error's kind
    pub fn user_message(&self) -> &'static str {
        user_friendly_message(self.kind)
    }
}

impl From<std::io::Error> for TypedError {
    fn from(error: std::io::Error) -> Self {
        classify_error(RawFailure::from(error))
    }
}

impl From<serde_json::Error> for TypedError {
    fn from(error: serde_json::Error) -> Self {
        TypedError::validation(format!("Invalid JSON payload: {error}"))
            .with_context("line", error.line())
            .with_context("column", error.column())
    }
}

impl From<config::ConfigError> for TypedError {
    fn from(error: config::ConfigError) -> Self {
        TypedError::validation(format!("Configuration error: {error}"))
            .with_context("component", "config")
    }
}

impl From<reqwest::Error> for TypedError {
    fn from(error: reqwest::Error) -> Self {
        let url = error.url().map(|u| u.to_string());
        let typed = match error.status() {
            Some(status) => classify_http_status(status.as_u16(), error.to_string()),
            None if error.is_decode() => {
                TypedError::server(format!("Unreadable response body: {error}"))
            }
            None if error.is_builder() => {
                TypedError::client(format!("Invalid request: {error}"))
            }
            None => {
                let mut typed = TypedError::network(format!("Request failed: {error}"));
                if error.is_timeout() {
                    typed = typed.with_context("timeout", true);
                }
                if error.is_connect() {
                    typed = typed.with_context("connect", true);
                }
                typed
            }
        };

        match url {
            Some(url) => typed.with_context("url", url),
            None => typed,
        }
    }
}

impl From<anyhow::Error> for TypedError {
    fn from(error: anyhow::Error) -> Self {
        classify_error(RawFailure::from(error))
    }
}

/// Macro for creating errors through the kind constructors
#[macro_export]
macro_rules! typed_error {
    ($kind:ident, $($arg:expr),*) => {
        $crate::error::TypedError::$kind($($arg),*)
    };
}

/// Macro for logging a typed error at its severity level with extra fields
#[macro_export]
macro_rules! log_error {
    ($error:expr, $msg:literal $(, $($field:tt)*)?) => {{
        let error: &$crate::error::TypedError = $error;
        match error.level() {
            tracing::Level::ERROR => tracing::error!(
                kind = %error.kind,
                severity = %error.severity,
                retryable = error.retryable,
                correlation_id = %error.correlation_id,
                error = %error.message,
                $($($field)*,)?
                $msg
            ),
            tracing::Level::WARN => tracing::warn!(
                kind = %error.kind,
                severity = %error.severity,
                retryable = error.retryable,
                correlation_id = %error.correlation_id,
                error = %error.message,
                $($($field)*,)?
                $msg
            ),
            tracing::Level::INFO => tracing::info!(
                kind = %error.kind,
                severity = %error.severity,
                retryable = error.retryable,
                correlation_id = %error.correlation_id,
                error = %error.message,
                $($($field)*,)?
                $msg
            ),
            _ => tracing::debug!(
                kind = %error.kind,
                severity = %error.severity,
                retryable = error.retryable,
                correlation_id = %error.correlation_id,
                error = %error.message,
                $($($field)*,)?
                $msg
            ),
        }
    }};
}

/// Macro for early return with error logging
#[macro_export]
macro_rules! typed_bail {
    ($error:expr) => {{
        let error: $crate::error::TypedError = $error;
        $crate::log_error!(&error, "Operation failed");
        return Err(error.into());
    }};
}
