// DocFiscal Core - Resilient Client State
// "Failures are named, retried, or rolled back; never swallowed"

pub mod cache;
pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod logging;
pub mod payment;
pub mod persistence;
pub mod retry;
pub mod scheduler;
pub mod service;
pub mod state;

// Re-export commonly used types
pub use cache::{query_keys, QueryCache, QueryKey};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use config::Config;
pub use error::global::GlobalErrorHandler;
pub use error::log::ErrorLogger;
pub use error::recovery::ErrorRecoveryManager;
pub use error::{DocFiscalResult, ErrorKind, ErrorSeverity, TypedError};
pub use logging::{init_logging, LoggingConfig};
pub use payment::{PaymentStatusPoller, PollerConfig, PollerState};
pub use retry::{retry_with_backoff, RetryPolicy};
pub use scheduler::Scheduler;
pub use service::{DocFiscalService, HttpDocFiscalClient, PaymentFlow};
pub use state::EnhancedStateManager;
