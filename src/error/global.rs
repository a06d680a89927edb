// Global Error Handler
// "Nothing falls through the floor unannounced"

use super::log::ErrorLogger;
use super::recovery::ErrorRecoveryManager;
use super::{ErrorClassifier, ErrorContext, RawFailure, TypedError};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::debug;

tokio::task_local! {
    static CALLER_REPORTS_PANICS: ();
}

/// Run `future` with its panics left to the caller to report.
///
/// The hook from [`GlobalErrorHandler::install_panic_hook`] skips panics
/// raised while such a future is polled, so each panic is logged once.
pub async fn caller_reports_panics<F: Future>(future: F) -> F::Output {
    CALLER_REPORTS_PANICS.scope((), future).await
}

fn panic_reported_by_caller() -> bool {
    CALLER_REPORTS_PANICS.try_with(|_| ()).is_ok()
}

/// Catch-all for failures that escaped component-level handling.
///
/// Every failure is classified, logged once, and offered to the recovery
/// manager. Nothing is re-raised afterwards.
pub struct GlobalErrorHandler {
    classifier: ErrorClassifier,
    logger: Arc<ErrorLogger>,
    recovery: Arc<ErrorRecoveryManager>,
}

impl GlobalErrorHandler {
    pub fn new(logger: Arc<ErrorLogger>, recovery: Arc<ErrorRecoveryManager>) -> Self {
        Self {
            classifier: ErrorClassifier::default(),
            logger,
            recovery,
        }
    }

    pub fn logger(&self) -> &Arc<ErrorLogger> {
        &self.logger
    }

    pub fn recovery(&self) -> &Arc<ErrorRecoveryManager> {
        &self.recovery
    }

    /// Classify, log and attempt recovery for an unhandled failure
    pub async fn handle<F: Into<RawFailure>>(&self, failure: F) -> TypedError {
        let error = self.classifier.classify(failure);

        let mut context = ErrorContext::new();
        context.insert("handler".to_string(), Value::from("global"));
        self.logger.log_error(&error, context);

        let recovered = self.recovery.attempt_recovery(&error).await;
        debug!(
            correlation_id = %error.correlation_id,
            recovered,
            "Unhandled error processed"
        );
        error
    }

    /// Run a task whose error or panic is routed through [`Self::handle`].
    ///
    /// The returned handle resolves to `Some(value)` on success and `None`
    /// when the task failed, panicked or was cancelled.
    pub fn spawn_supervised<F, T, E>(self: &Arc<Self>, task: F) -> JoinHandle<Option<T>>
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Into<RawFailure> + Send + 'static,
    {
        let handler = Arc::clone(self);
        let inner = tokio::spawn(caller_reports_panics(task));

        tokio::spawn(async move {
            match inner.await {
                Ok(Ok(value)) => Some(value),
                Ok(Err(error)) => {
                    handler.handle(error).await;
                    None
                }
                Err(join_error) if join_error.is_panic() => {
                    let payload = join_error.into_panic();
                    handler.handle(RawFailure::from_panic(&*payload)).await;
                    None
                }
                Err(_) => {
                    debug!("Supervised task cancelled");
                    None
                }
            }
        })
    }

    /// Log panics from any thread through the classifier before the default
    /// hook prints them. Panics inside supervised tasks are left to
    /// [`Self::spawn_supervised`].
    pub fn install_panic_hook(self: &Arc<Self>) {
        let logger = Arc::clone(&self.logger);
        let classifier = self.classifier.clone();
        let previous = std::panic::take_hook();

        std::panic::set_hook(Box::new(move |info| {
            if panic_reported_by_caller() {
                previous(info);
                return;
            }

            let mut error = classifier.classify(RawFailure::from_panic(info.payload()));
            if let Some(location) = info.location() {
                error = error.with_context("location", location.to_string());
            }

            let mut context = ErrorContext::new();
            context.insert("handler".to_string(), Value::from("panic_hook"));
            logger.log_error(&error, context);

            previous(info);
        }));
    }
}
