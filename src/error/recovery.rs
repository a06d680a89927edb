// Error Recovery Strategies
// "How to recover from different types of errors"

use super::{DocFiscalResult, ErrorKind, TypedError};
use crate::persistence::{AuthTokenStore, NavigationStatePersistence};
use crate::scheduler::Scheduler;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Delay the network strategy waits before signalling the caller to retry
pub const DEFAULT_NETWORK_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Path the authentication strategy sends the user to
pub const LOGIN_PATH: &str = "/login";

/// A recovery action that can be attempted for a typed error
#[async_trait]
pub trait RecoveryStrategy: Send + Sync {
    /// Whether this strategy applies to the error
    fn can_handle(&self, error: &TypedError) -> bool;

    /// Attempt recovery. An `Err` lets the manager move on to the next strategy.
    async fn recover(&self, error: &TypedError) -> DocFiscalResult<()>;

    /// Human readable description shown next to the option in the UI
    fn description(&self) -> &str;
}

/// Navigation primitive used by recovery strategies
pub trait Navigator: Send + Sync {
    fn redirect_to(&self, path: &str) -> DocFiscalResult<()>;
}

/// [`Navigator`] that forwards redirect requests over a channel to whoever
/// owns the routing surface.
#[derive(Debug, Clone)]
pub struct ChannelNavigator {
    tx: mpsc::UnboundedSender<String>,
}

impl ChannelNavigator {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Navigator for ChannelNavigator {
    fn redirect_to(&self, path: &str) -> DocFiscalResult<()> {
        self.tx.send(path.to_string()).map_err(|_| {
            TypedError::client("Navigation receiver dropped").with_context("path", path)
        })
    }
}

/// Waits before letting the caller retry a transient network failure
pub struct NetworkRetryStrategy {
    scheduler: Scheduler,
    delay: Duration,
}

impl NetworkRetryStrategy {
    pub fn new(scheduler: Scheduler, delay: Duration) -> Self {
        Self { scheduler, delay }
    }
}

#[async_trait]
impl RecoveryStrategy for NetworkRetryStrategy {
    fn can_handle(&self, error: &TypedError) -> bool {
        error.kind == ErrorKind::Network && error.retryable
    }

    async fn recover(&self, _error: &TypedError) -> DocFiscalResult<()> {
        debug!(delay_ms = self.delay.as_millis() as u64, "Waiting before network retry");
        self.scheduler.sleep(self.delay).await;
        Ok(())
    }

    fn description(&self) -> &str {
        "Retry after a short delay"
    }
}

/// Drops the stored credentials and sends the user to the login page
pub struct AuthenticationRedirectStrategy {
    tokens: Option<AuthTokenStore>,
    navigator: Arc<dyn Navigator>,
    login_path: String,
}

impl AuthenticationRedirectStrategy {
    pub fn new(tokens: Option<AuthTokenStore>, navigator: Arc<dyn Navigator>) -> Self {
        Self {
            tokens,
            navigator,
            login_path: LOGIN_PATH.to_string(),
        }
    }

    pub fn with_login_path<S: Into<String>>(mut self, path: S) -> Self {
        self.login_path = path.into();
        self
    }
}

#[async_trait]
impl RecoveryStrategy for AuthenticationRedirectStrategy {
    fn can_handle(&self, error: &TypedError) -> bool {
        error.kind == ErrorKind::Authentication
    }

    async fn recover(&self, _error: &TypedError) -> DocFiscalResult<()> {
        if let Some(tokens) = &self.tokens {
            tokens.clear()?;
        }
        self.navigator.redirect_to(&self.login_path)
    }

    fn description(&self) -> &str {
        "Sign in again"
    }
}

/// Forgets persisted upload progress so the user can start the upload over
pub struct UploadResetStrategy {
    persistence: Arc<NavigationStatePersistence>,
}

impl UploadResetStrategy {
    pub fn new(persistence: Arc<NavigationStatePersistence>) -> Self {
        Self { persistence }
    }
}

#[async_trait]
impl RecoveryStrategy for UploadResetStrategy {
    fn can_handle(&self, error: &TypedError) -> bool {
        error.kind == ErrorKind::Upload
    }

    async fn recover(&self, error: &TypedError) -> DocFiscalResult<()> {
        match error.context.get("upload_id").and_then(|v| v.as_str()) {
            Some(upload_id) => {
                self.persistence.clear_upload_progress(upload_id)?;
            }
            None => {
                let cleared = self.persistence.clear_all_upload_progress()?;
                debug!(cleared, "Cleared all persisted upload progress");
            }
        }
        Ok(())
    }

    fn description(&self) -> &str {
        "Reset the upload and try again"
    }
}

/// Collaborators needed by the built-in strategies. Strategies whose
/// collaborator is missing are not registered.
#[derive(Clone, Default)]
pub struct RecoveryDependencies {
    pub scheduler: Scheduler,
    pub network_retry_delay: Option<Duration>,
    pub auth_tokens: Option<AuthTokenStore>,
    pub navigator: Option<Arc<dyn Navigator>>,
    pub navigation_state: Option<Arc<NavigationStatePersistence>>,
}

/// Ordered list of recovery strategies tried against typed errors
pub struct ErrorRecoveryManager {
    strategies: RwLock<Vec<Arc<dyn RecoveryStrategy>>>,
    disposed: AtomicBool,
}

impl ErrorRecoveryManager {
    /// Create a manager with no strategies registered
    pub fn new() -> Self {
        Self {
            strategies: RwLock::new(Vec::new()),
            disposed: AtomicBool::new(false),
        }
    }

    /// Create a manager with the built-in strategies in their standard order:
    /// network retry, authentication redirect, upload reset.
    pub fn create(deps: RecoveryDependencies) -> Arc<Self> {
        let manager = Self::new();

        manager.add_strategy(Arc::new(NetworkRetryStrategy::new(
            deps.scheduler.clone(),
            deps.network_retry_delay.unwrap_or(DEFAULT_NETWORK_RETRY_DELAY),
        )));

        if let Some(navigator) = deps.navigator {
            manager.add_strategy(Arc::new(AuthenticationRedirectStrategy::new(
                deps.auth_tokens,
                navigator,
            )));
        }

        if let Some(persistence) = deps.navigation_state {
            manager.add_strategy(Arc::new(UploadResetStrategy::new(persistence)));
        }

        info!(
            strategies = manager.strategy_count(),
            "🛡️ Error recovery manager created"
        );
        Arc::new(manager)
    }

    /// Append a strategy after the ones already registered
    pub fn add_strategy(&self, strategy: Arc<dyn RecoveryStrategy>) {
        if let Ok(mut strategies) = self.strategies.write() {
            strategies.push(strategy);
        }
    }

    pub fn strategy_count(&self) -> usize {
        self.strategies.read().map(|s| s.len()).unwrap_or(0)
    }

    /// Strategies that can handle the error, in registration order, without
    /// running any of them.
    pub fn recovery_options(&self, error: &TypedError) -> Vec<Arc<dyn RecoveryStrategy>> {
        if self.disposed.load(Ordering::Acquire) {
            return Vec::new();
        }
        match self.strategies.read() {
            Ok(strategies) => strategies
                .iter()
                .filter(|strategy| strategy.can_handle(error))
                .cloned()
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Try every matching strategy in order until one completes.
    ///
    /// Returns `true` as soon as a strategy succeeds, `false` if none matched or
    /// all of them failed.
    pub async fn attempt_recovery(&self, error: &TypedError) -> bool {
        let candidates = self.recovery_options(error);
        if candidates.is_empty() {
            debug!(kind = %error.kind, "No recovery strategy for error");
            return false;
        }

        for strategy in candidates {
            if self.disposed.load(Ordering::Acquire) {
                return false;
            }
            match strategy.recover(error).await {
                Ok(()) => {
                    info!(
                        kind = %error.kind,
                        correlation_id = %error.correlation_id,
                        strategy = strategy.description(),
                        "✅ Recovered from error"
                    );
                    return true;
                }
                Err(recovery_error) => {
                    warn!(
                        kind = %error.kind,
                        correlation_id = %error.correlation_id,
                        strategy = strategy.description(),
                        error = %recovery_error,
                        "⚠️ Recovery strategy failed, trying next"
                    );
                }
            }
        }

        warn!(
            kind = %error.kind,
            correlation_id = %error.correlation_id,
            "❌ All recovery strategies failed"
        );
        false
    }

    /// Drop every registered strategy. Later recovery attempts return `false`.
    pub fn dispose(&self) {
        self.disposed.store(true, Ordering::Release);
        if let Ok(mut strategies) = self.strategies.write() {
            strategies.clear();
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

impl Default for ErrorRecoveryManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Explicit choices the UI can offer next to an error message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    Retry,
    Reset,
    GoHome,
}

impl RecoveryAction {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Retry => "Try again",
            Self::Reset => "Start over",
            Self::GoHome => "Go to home page",
        }
    }
}

impl TypedError {
    /// User-initiated actions that make sense for this error
    pub fn recovery_actions(&self) -> Vec<RecoveryAction> {
        let mut actions = Vec::with_capacity(3);
        if self.retryable || matches!(self.kind, ErrorKind::Payment | ErrorKind::Server) {
            actions.push(RecoveryAction::Retry);
        }
        if matches!(
            self.kind,
            ErrorKind::Upload | ErrorKind::Validation | ErrorKind::Client
        ) {
            actions.push(RecoveryAction::Reset);
        }
        actions.push(RecoveryAction::GoHome);
        actions
    }
}
