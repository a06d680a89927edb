use crate::cache::query_keys;
use crate::error::global::caller_reports_panics;
use crate::error::{ErrorClassifier, RawFailure, TypedError};
use crate::scheduler::{ScheduledTask, Scheduler};
use crate::service::{PaymentStatus, PaymentStatusResponse, SharedService};
use crate::state::EnhancedStateManager;
use futures::FutureExt;
use serde_json::{Map, Value};
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Polling cadence and limits
#[derive(Debug, Clone, PartialEq)]
pub struct PollerConfig {
    pub initial_interval: Duration,
    /// Factor applied to the interval after every tick
    pub backoff_multiplier: f64,
    pub max_interval: Duration,
    /// Session length after which polling gives up as timed out
    pub max_duration: Duration,
    /// Consecutive failed queries tolerated before the session fails
    pub max_consecutive_errors: u32,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(2),
            backoff_multiplier: 2.0,
            max_interval: Duration::from_secs(30),
            max_duration: Duration::from_secs(10 * 60),
            max_consecutive_errors: 5,
        }
    }
}

impl PollerConfig {
    /// Interval used after `current`; never shrinks, never exceeds the cap
    pub fn next_interval(&self, current: Duration) -> Duration {
        let grown =
            Duration::try_from_secs_f64(current.as_secs_f64() * self.backoff_multiplier.max(1.0))
                .unwrap_or(self.max_interval);
        grown.min(self.max_interval).max(current.min(self.max_interval))
    }
}

/// Lifecycle of a polling session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerState {
    Idle,
    Polling,
    /// Payment confirmed
    Completed,
    /// Payment failed or expired, or too many query errors
    Failed,
    Cancelled,
    TimedOut,
}

impl PollerState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::TimedOut
        )
    }

    fn for_status(status: PaymentStatus) -> Self {
        match status {
            PaymentStatus::Pending => Self::Polling,
            PaymentStatus::Paid => Self::Completed,
            PaymentStatus::Failed | PaymentStatus::Expired => Self::Failed,
            PaymentStatus::Cancelled => Self::Cancelled,
        }
    }
}

pub type StatusCallback = Arc<dyn Fn(&PaymentStatusResponse) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(&TypedError) + Send + Sync>;

struct Session {
    generation: u64,
    is_active: bool,
    state: PollerState,
    current_interval: Duration,
    attempts: u32,
    consecutive_errors: u32,
    started_at: Option<Instant>,
    last_status: Option<PaymentStatus>,
    last_error: Option<TypedError>,
    timer: Option<ScheduledTask>,
}

struct Shared {
    payment_id: String,
    service: SharedService,
    scheduler: Scheduler,
    config: PollerConfig,
    classifier: ErrorClassifier,
    on_status_change: Option<StatusCallback>,
    on_error: Option<ErrorCallback>,
    state_manager: Option<EnhancedStateManager>,
    session: Mutex<Session>,
    state_tx: watch::Sender<PollerState>,
}

impl Shared {
    fn session(&self) -> MutexGuard<'_, Session> {
        self.session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_current(session: &Session, generation: u64) -> bool {
        session.is_active && session.generation == generation
    }

    fn emit_error(&self, error: &TypedError) {
        if let Some(on_error) = &self.on_error {
            on_error(error);
        }
    }

    fn emit_status(&self, response: &PaymentStatusResponse) {
        if let Some(on_status_change) = &self.on_status_change {
            on_status_change(response);
        }
    }

    /// Publish a state for `generation` unless a newer session has started.
    /// Sent under the session lock so transitions reach watchers in order.
    fn publish(&self, generation: u64, state: PollerState) {
        let session = self.session();
        if session.generation == generation {
            self.state_tx.send_replace(state);
        }
    }
}

type TickFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

fn tick(shared: Arc<Shared>, generation: u64) -> TickFuture {
    Box::pin(async move {
        let outcome = caller_reports_panics(
            AssertUnwindSafe(run_tick(Arc::clone(&shared), generation)).catch_unwind(),
        )
        .await;
        if let Err(payload) = outcome {
            settle_after_panic(&shared, generation, &*payload);
        }
    })
}

/// A tick that panicked still has to leave the session settled, or watchers
/// would wait on a session with no timer.
fn settle_after_panic(shared: &Shared, generation: u64, payload: &(dyn Any + Send)) {
    let (state, was_active) = {
        let mut session = shared.session();
        if session.generation != generation {
            return;
        }
        let was_active = session.is_active;
        if was_active {
            session.is_active = false;
            session.state = PollerState::Failed;
            session.timer.take();
        }
        (session.state, was_active)
    };

    let error = shared
        .classifier
        .classify(RawFailure::from_panic(payload))
        .with_context("payment_id", shared.payment_id.clone());
    warn!(
        payment_id = %shared.payment_id,
        error = %error.message,
        "💥 Payment polling tick panicked"
    );

    shared.publish(generation, state);
    if was_active {
        let mut session = shared.session();
        session.last_error = Some(error.clone());
        drop(session);
        shared.emit_error(&error);
    }
}

/// One poll: query, report, then either finish or schedule the next tick.
/// The session is re-checked after every suspension point so a stopped or
/// restarted session never acts on a stale response.
async fn run_tick(shared: Arc<Shared>, generation: u64) {
    {
        let mut session = shared.session();
        if !Shared::is_current(&session, generation) {
            return;
        }

        let elapsed = session
            .started_at
            .map(|t| t.elapsed())
            .unwrap_or_default();
        if elapsed >= shared.config.max_duration {
            session.is_active = false;
            session.state = PollerState::TimedOut;
            session.timer.take();
            drop(session);

            let error = TypedError::network("Payment status polling timed out")
                .with_context("payment_id", shared.payment_id.clone())
                .with_context("timed_out", true)
                .with_context("elapsed_ms", elapsed.as_millis() as u64);
            warn!(payment_id = %shared.payment_id, "⏰ Payment polling timed out");
            shared.emit_error(&error);
            shared.publish(generation, PollerState::TimedOut);
            return;
        }

        session.attempts += 1;
        debug!(
            payment_id = %shared.payment_id,
            attempt = session.attempts,
            "Polling payment status"
        );
    }

    let result = shared.service.get_payment_status(&shared.payment_id).await;

    {
        let mut session = shared.session();
        if !Shared::is_current(&session, generation) {
            debug!(payment_id = %shared.payment_id, "Discarding response for stopped session");
            return;
        }
        match &result {
            Ok(response) => {
                session.consecutive_errors = 0;
                session.last_status = Some(response.status);
                if response.status.is_terminal() {
                    session.is_active = false;
                    session.state = PollerState::for_status(response.status);
                    session.timer.take();
                }
            }
            Err(error) => {
                session.consecutive_errors += 1;
                session.last_error = Some(error.clone());
            }
        }
    }

    match result {
        Ok(response) if response.status.is_terminal() => {
            finish(&shared, generation, response).await;
        }
        Ok(response) => {
            shared.emit_status(&response);
            if let Some(state_manager) = &shared.state_manager {
                if let Ok(value) = serde_json::to_value(&response) {
                    state_manager
                        .cache()
                        .set_query_data(query_keys::payment_status(&shared.payment_id), value);
                }
            }
            schedule_next(&shared, generation);
        }
        Err(error) => {
            let error = shared.classifier.classify(error);
            shared.emit_error(&error);

            let exhausted = {
                let mut session = shared.session();
                if !Shared::is_current(&session, generation) {
                    return;
                }
                if session.consecutive_errors > shared.config.max_consecutive_errors {
                    session.is_active = false;
                    session.state = PollerState::Failed;
                    session.timer.take();
                    Some(session.consecutive_errors)
                } else {
                    None
                }
            };

            match exhausted {
                Some(count) => {
                    let failure = TypedError::network(format!(
                        "Payment status unavailable after {count} consecutive errors"
                    ))
                    .with_context("payment_id", shared.payment_id.clone())
                    .with_context("consecutive_errors", count)
                    .with_context("last_error", error.message.clone());
                    warn!(payment_id = %shared.payment_id, count, "❌ Payment polling failed");
                    shared.emit_error(&failure);
                    shared.publish(generation, PollerState::Failed);
                }
                None => schedule_next(&shared, generation),
            }
        }
    }
}

/// Deliver the terminal status and propagate a confirmed payment
async fn finish(shared: &Arc<Shared>, generation: u64, response: PaymentStatusResponse) {
    let state = PollerState::for_status(response.status);
    info!(
        payment_id = %shared.payment_id,
        status = %response.status,
        "🏁 Payment reached terminal status"
    );
    shared.emit_status(&response);

    if let Some(state_manager) = &shared.state_manager {
        let cache = state_manager.cache();
        if let Ok(value) = serde_json::to_value(&response) {
            cache.set_query_data(query_keys::payment_status(&shared.payment_id), value);
        }
        cache.invalidate_queries(&query_keys::payment(&shared.payment_id));

        if let (PaymentStatus::Paid, Some(order_id)) = (response.status, &response.order_id) {
            let mut patch = Map::new();
            patch.insert("status".to_string(), Value::from("paid"));
            state_manager.propagate_state_changes(order_id, &patch);

            if let Err(e) = state_manager.ensure_data_consistency(order_id).await {
                warn!(order_id = %order_id, error = %e, "Order refresh after payment failed");
            }
        }
    }

    shared.publish(generation, state);
}

fn schedule_next(shared: &Arc<Shared>, generation: u64) {
    let mut session = shared.session();
    if !Shared::is_current(&session, generation) {
        return;
    }

    let mut delay = session.current_interval;
    if let Some(started_at) = session.started_at {
        let remaining = shared.config.max_duration.saturating_sub(started_at.elapsed());
        delay = delay.min(remaining);
    }
    session.current_interval = shared.config.next_interval(session.current_interval);

    let task = shared
        .scheduler
        .schedule(delay, tick(Arc::clone(shared), generation));
    session.timer = Some(task);
}

/// Polls a payment's status until it settles.
///
/// Exactly one timer is pending while a session is active. Dropping the
/// poller stops polling.
pub struct PaymentStatusPoller {
    shared: Arc<Shared>,
}

impl PaymentStatusPoller {
    pub fn builder<S: Into<String>>(payment_id: S, service: SharedService) -> PaymentStatusPollerBuilder {
        PaymentStatusPollerBuilder {
            payment_id: payment_id.into(),
            service,
            scheduler: Scheduler::new(),
            config: PollerConfig::default(),
            on_status_change: None,
            on_error: None,
            state_manager: None,
        }
    }

    pub fn payment_id(&self) -> &str {
        &self.shared.payment_id
    }

    /// Begin a new session. Ignored while one is already active.
    pub fn start_polling(&self) {
        let shared = &self.shared;
        let mut session = shared.session();
        if session.is_active {
            debug!(payment_id = %shared.payment_id, "Polling already active");
            return;
        }

        if let Some(timer) = session.timer.take() {
            timer.cancel();
        }
        session.generation += 1;
        session.is_active = true;
        session.state = PollerState::Polling;
        session.current_interval = shared.config.initial_interval;
        session.attempts = 0;
        session.consecutive_errors = 0;
        session.started_at = Some(shared.scheduler.now());
        session.last_status = None;
        session.last_error = None;

        shared.state_tx.send_replace(PollerState::Polling);

        let generation = session.generation;
        session.timer = Some(
            shared
                .scheduler
                .schedule(Duration::ZERO, tick(Arc::clone(shared), generation)),
        );
        drop(session);

        info!(payment_id = %shared.payment_id, "🔍 Payment polling started");
    }

    /// Stop the session and cancel its timer. Safe to call repeatedly or
    /// before polling ever started.
    pub fn stop_polling(&self) {
        let shared = &self.shared;
        let mut session = shared.session();
        if let Some(timer) = session.timer.take() {
            timer.cancel();
        }
        if !session.is_active {
            return;
        }
        // Responses still in flight belong to the old generation and are dropped
        session.generation += 1;
        session.is_active = false;
        session.state = PollerState::Idle;
        shared.state_tx.send_replace(PollerState::Idle);
        drop(session);

        info!(payment_id = %shared.payment_id, "⏹️ Payment polling stopped");
    }

    pub fn is_active(&self) -> bool {
        self.shared.session().is_active
    }

    /// Delay before the next tick
    pub fn current_interval(&self) -> Duration {
        self.shared.session().current_interval
    }

    pub fn attempts(&self) -> u32 {
        self.shared.session().attempts
    }

    pub fn state(&self) -> PollerState {
        self.shared.session().state
    }

    pub fn last_status(&self) -> Option<PaymentStatus> {
        self.shared.session().last_status
    }

    pub fn last_error(&self) -> Option<TypedError> {
        self.shared.session().last_error.clone()
    }

    /// Resolve once the session is no longer polling
    pub async fn wait_until_settled(&self) -> PollerState {
        let mut rx = self.shared.state_tx.subscribe();
        let settled = rx.wait_for(|state| *state != PollerState::Polling).await;
        match settled {
            Ok(state) => *state,
            Err(_) => self.state(),
        }
    }

    /// Watch state transitions
    pub fn subscribe(&self) -> watch::Receiver<PollerState> {
        self.shared.state_tx.subscribe()
    }
}

impl Drop for PaymentStatusPoller {
    fn drop(&mut self) {
        self.stop_polling();
    }
}

pub struct PaymentStatusPollerBuilder {
    payment_id: String,
    service: SharedService,
    scheduler: Scheduler,
    config: PollerConfig,
    on_status_change: Option<StatusCallback>,
    on_error: Option<ErrorCallback>,
    state_manager: Option<EnhancedStateManager>,
}

impl PaymentStatusPollerBuilder {
    pub fn config(mut self, config: PollerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn scheduler(mut self, scheduler: Scheduler) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn on_status_change<F>(mut self, callback: F) -> Self
    where
        F: Fn(&PaymentStatusResponse) + Send + Sync + 'static,
    {
        self.on_status_change = Some(Arc::new(callback));
        self
    }

    pub fn on_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(&TypedError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(callback));
        self
    }

    /// Cache to update and propagate into when the payment settles
    pub fn state_manager(mut self, state_manager: EnhancedStateManager) -> Self {
        self.state_manager = Some(state_manager);
        self
    }

    pub fn build(self) -> PaymentStatusPoller {
        let (state_tx, _) = watch::channel(PollerState::Idle);
        let initial_interval = self.config.initial_interval;

        PaymentStatusPoller {
            shared: Arc::new(Shared {
                payment_id: self.payment_id,
                service: self.service,
                scheduler: self.scheduler,
                config: self.config,
                classifier: ErrorClassifier::default(),
                on_status_change: self.on_status_change,
                on_error: self.on_error,
                state_manager: self.state_manager,
                session: Mutex::new(Session {
                    generation: 0,
                    is_active: false,
                    state: PollerState::Idle,
                    current_interval: initial_interval,
                    attempts: 0,
                    consecutive_errors: 0,
                    started_at: None,
                    last_status: None,
                    last_error: None,
                    timer: None,
                }),
                state_tx,
            }),
        }
    }
}
