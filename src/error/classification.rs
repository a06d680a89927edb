// Error Classification and Analysis
// "Understanding the nature of our errors"

use super::{ErrorContext, ErrorKind, ErrorSeverity, TypedError};
use serde_json::Value;
use std::any::Any;
use tracing::trace;

/// Anything that can fail: the input side of [`ErrorClassifier::classify`]
#[derive(Debug, Clone)]
pub enum RawFailure {
    /// Already classified; passes through unchanged
    Typed(TypedError),
    /// A real error value with a message and optional source chain
    Error {
        message: String,
        trace: Option<String>,
    },
    /// A non-error value (string, object, null) that was used as a failure
    Value(Value),
}

impl RawFailure {
    /// Capture an error together with its `source()` chain
    pub fn from_error<E: std::error::Error + ?Sized>(error: &E) -> Self {
        let mut chain = Vec::new();
        let mut source = error.source();
        while let Some(cause) = source {
            chain.push(cause.to_string());
            source = cause.source();
        }

        Self::Error {
            message: error.to_string(),
            trace: if chain.is_empty() {
                None
            } else {
                Some(chain.join("\ncaused by: "))
            },
        }
    }

    /// Convert a panic payload caught from a task, a panic hook or `catch_unwind`
    pub fn from_panic(payload: &(dyn Any + Send)) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "task panicked with a non-string payload".to_string()
        };

        Self::Error {
            message: format!("panic: {message}"),
            trace: None,
        }
    }
}

impl From<TypedError> for RawFailure {
    fn from(error: TypedError) -> Self {
        Self::Typed(error)
    }
}

impl From<std::io::Error> for RawFailure {
    fn from(error: std::io::Error) -> Self {
        Self::from_error(&error)
    }
}

impl From<anyhow::Error> for RawFailure {
    fn from(error: anyhow::Error) -> Self {
        if let Some(typed) = error.downcast_ref::<TypedError>() {
            return Self::Typed(typed.clone());
        }

        let chain: Vec<String> = error.chain().skip(1).map(|c| c.to_string()).collect();
        Self::Error {
            message: error.to_string(),
            trace: if chain.is_empty() {
                None
            } else {
                Some(chain.join("\ncaused by: "))
            },
        }
    }
}

impl From<Value> for RawFailure {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

impl From<String> for RawFailure {
    fn from(value: String) -> Self {
        Self::Value(Value::String(value))
    }
}

impl From<&str> for RawFailure {
    fn from(value: &str) -> Self {
        Self::Value(Value::String(value.to_string()))
    }
}

/// One entry of the keyword rule table
#[derive(Clone, Copy)]
pub struct ClassificationRule {
    pub name: &'static str,
    pub kind: ErrorKind,
    /// Receives the lowercased message
    pub predicate: fn(&str) -> bool,
}

impl std::fmt::Debug for ClassificationRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClassificationRule")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .finish()
    }
}

fn contains_any(message: &str, needles: &[&str]) -> bool {
    needles.iter().any(|needle| message.contains(needle))
}

fn is_payment(message: &str) -> bool {
    contains_any(message, &["payment", "pix", "pagamento", "checkout"])
}

fn is_upload(message: &str) -> bool {
    contains_any(message, &["upload"])
}

fn is_authentication(message: &str) -> bool {
    contains_any(
        message,
        &[
            "unauthorized",
            "unauthenticated",
            "authentication",
            "not authenticated",
            "token expired",
            "session expired",
            "login required",
        ],
    )
}

fn is_network(message: &str) -> bool {
    contains_any(
        message,
        &[
            "network",
            "fetch",
            "timeout",
            "timed out",
            "connection",
            "offline",
            "no internet",
            "econnrefused",
            "dns",
        ],
    )
}

fn is_validation(message: &str) -> bool {
    contains_any(message, &["validation", "invalid", "required", "must be"])
}

fn is_file_related(message: &str) -> bool {
    contains_any(message, &["file", "pdf", "size", "format"])
}

/// Keyword rules, most specific first
pub const DEFAULT_RULES: &[ClassificationRule] = &[
    ClassificationRule {
        name: "payment",
        kind: ErrorKind::Payment,
        predicate: is_payment,
    },
    ClassificationRule {
        name: "upload",
        kind: ErrorKind::Upload,
        predicate: is_upload,
    },
    ClassificationRule {
        name: "authentication",
        kind: ErrorKind::Authentication,
        predicate: is_authentication,
    },
    ClassificationRule {
        name: "network",
        kind: ErrorKind::Network,
        predicate: is_network,
    },
    ClassificationRule {
        name: "validation",
        kind: ErrorKind::Validation,
        predicate: is_validation,
    },
    ClassificationRule {
        name: "file",
        kind: ErrorKind::Validation,
        predicate: is_file_related,
    },
];

fn is_offline(message: &str, context: &ErrorContext) -> bool {
    if context.get("offline").and_then(Value::as_bool) == Some(true) {
        return true;
    }

    let mentions_offline = |text: &str| {
        let text = text.to_lowercase();
        text.contains("offline") || text.contains("no internet")
    };

    mentions_offline(message)
        || context
            .get("original_message")
            .and_then(Value::as_str)
            .is_some_and(mentions_offline)
}

fn status_code(context: &ErrorContext) -> Option<u64> {
    context.get("status_code").and_then(Value::as_u64)
}

/// Derive `(severity, retryable)` for an error.
///
/// A pure function of its inputs: the taxonomy default for `kind`, adjusted by
/// contextual heuristics (offline network, transient 5xx, panics).
pub fn assess(kind: ErrorKind, message: &str, context: &ErrorContext) -> (ErrorSeverity, bool) {
    let (severity, retryable) = match kind {
        ErrorKind::Network => {
            if is_offline(message, context) {
                (ErrorSeverity::High, true)
            } else {
                (ErrorSeverity::Medium, true)
            }
        }
        ErrorKind::Validation => (ErrorSeverity::Low, false),
        ErrorKind::Authentication => (ErrorSeverity::High, true),
        ErrorKind::Authorization => (ErrorSeverity::High, false),
        ErrorKind::NotFound => (ErrorSeverity::Medium, false),
        ErrorKind::Server => {
            let transient = matches!(status_code(context), Some(502..=504));
            (ErrorSeverity::Medium, transient)
        }
        ErrorKind::Client => (ErrorSeverity::Medium, false),
        ErrorKind::Upload => (ErrorSeverity::Medium, true),
        ErrorKind::Payment => (ErrorSeverity::High, false),
        ErrorKind::Unknown => (ErrorSeverity::Medium, false),
    };

    if context.get("panic").and_then(Value::as_bool) == Some(true) {
        return (ErrorSeverity::Critical, false);
    }

    (severity, retryable)
}

/// Maps arbitrary failures onto [`TypedError`] using an ordered rule table
#[derive(Debug, Clone)]
pub struct ErrorClassifier {
    rules: Vec<ClassificationRule>,
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self {
            rules: DEFAULT_RULES.to_vec(),
        }
    }
}

impl ErrorClassifier {
    /// Classifier with a custom rule table evaluated in the given order
    pub fn with_rules(rules: Vec<ClassificationRule>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &[ClassificationRule] {
        &self.rules
    }

    /// First matching rule for a message, if any
    pub fn match_kind(&self, message: &str) -> Option<ErrorKind> {
        let lowered = message.to_lowercase();
        self.rules
            .iter()
            .find(|rule| (rule.predicate)(&lowered))
            .map(|rule| {
                trace!(rule = rule.name, kind = %rule.kind, "Classification rule matched");
                rule.kind
            })
    }

    /// Classify any failure. Already typed errors are returned unchanged.
    pub fn classify<F: Into<RawFailure>>(&self, failure: F) -> TypedError {
        match failure.into() {
            RawFailure::Typed(error) => error,
            RawFailure::Error { message, trace } => {
                let kind = self.match_kind(&message).unwrap_or(ErrorKind::Unknown);
                let mut context = ErrorContext::new();
                context.insert("original_message".to_string(), Value::String(message.clone()));
                if message.starts_with("panic: ") {
                    context.insert("panic".to_string(), Value::Bool(true));
                }

                let error = TypedError::with_context_map(kind, message, context);
                match trace {
                    Some(trace) => error.with_source_trace(trace),
                    None => error,
                }
            }
            RawFailure::Value(value) => {
                let message = stringify_value(&value);
                let mut context = ErrorContext::new();
                context.insert("original_value".to_string(), value);
                TypedError::with_context_map(ErrorKind::Unknown, message, context)
            }
        }
    }
}

fn stringify_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

/// Classify with the default rule table
pub fn classify_error<F: Into<RawFailure>>(failure: F) -> TypedError {
    ErrorClassifier::default().classify(failure)
}

/// Classify a non-success HTTP response from the API routes
pub fn classify_http_status<S: Into<String>>(status: u16, message: S) -> TypedError {
    let kind = match status {
        400 | 422 => ErrorKind::Validation,
        401 => ErrorKind::Authentication,
        403 => ErrorKind::Authorization,
        404 => ErrorKind::NotFound,
        402 => ErrorKind::Payment,
        408 => ErrorKind::Network,
        400..=499 => ErrorKind::Client,
        500..=599 => ErrorKind::Server,
        _ => ErrorKind::Unknown,
    };

    let mut context = ErrorContext::new();
    context.insert("status_code".to_string(), Value::from(status));
    TypedError::with_context_map(kind, message, context)
}
