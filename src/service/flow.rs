// Payment Flow
// "Start the payment, then watch it land"

use super::{PaymentInitiation, PaymentRequest, PaymentStatus, SharedService};
use crate::error::DocFiscalResult;
use crate::payment::{PaymentStatusPoller, PaymentStatusPollerBuilder, PollerConfig, PollerState};
use crate::retry::{retry_retryable, RetryPolicy};
use crate::scheduler::Scheduler;
use crate::state::EnhancedStateManager;
use serde_json::{Map, Value};
use tracing::{info, instrument};

/// Result of a payment that was initiated and then polled until it settled
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentFlowOutcome {
    pub initiation: PaymentInitiation,
    pub final_state: PollerState,
    pub last_status: Option<PaymentStatus>,
}

impl PaymentFlowOutcome {
    pub fn is_paid(&self) -> bool {
        self.final_state == PollerState::Completed
    }
}

/// Initiates payments and hands out pollers that share one configuration.
///
/// Initiation is retried with backoff only while failures classify as
/// retryable; a declined or invalid request fails on the first attempt.
#[derive(Clone)]
pub struct PaymentFlow {
    service: SharedService,
    retry: RetryPolicy,
    poller_config: PollerConfig,
    scheduler: Scheduler,
    state_manager: Option<EnhancedStateManager>,
}

impl PaymentFlow {
    pub fn new(service: SharedService) -> Self {
        Self {
            service,
            retry: RetryPolicy::default(),
            poller_config: PollerConfig::default(),
            scheduler: Scheduler::new(),
            state_manager: None,
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_poller_config(mut self, config: PollerConfig) -> Self {
        self.poller_config = config;
        self
    }

    pub fn with_scheduler(mut self, scheduler: Scheduler) -> Self {
        self.scheduler = scheduler;
        self
    }

    /// Cache the flow records payment ids into and pollers propagate into
    pub fn with_state_manager(mut self, state_manager: EnhancedStateManager) -> Self {
        self.state_manager = Some(state_manager);
        self
    }

    #[instrument(skip(self, request))]
    pub async fn initiate(
        &self,
        order_id: &str,
        request: &PaymentRequest,
    ) -> DocFiscalResult<PaymentInitiation> {
        let service = &self.service;
        let initiation = retry_retryable(&self.retry, move || {
            service.initiate_payment(order_id, request)
        })
        .await?;

        info!(
            order_id = %order_id,
            payment_id = %initiation.payment_id,
            "💳 Payment initiated"
        );

        if let Some(state_manager) = &self.state_manager {
            let mut patch = Map::new();
            patch.insert(
                "payment_id".to_string(),
                Value::from(initiation.payment_id.clone()),
            );
            state_manager.propagate_state_changes(order_id, &patch);
        }

        Ok(initiation)
    }

    /// Poller builder preset with this flow's configuration
    pub fn poller(&self, payment_id: &str) -> PaymentStatusPollerBuilder {
        let builder = PaymentStatusPoller::builder(payment_id, self.service.clone())
            .config(self.poller_config.clone())
            .scheduler(self.scheduler.clone());
        match &self.state_manager {
            Some(state_manager) => builder.state_manager(state_manager.clone()),
            None => builder,
        }
    }

    /// Initiate a payment and poll it until it settles
    pub async fn run(
        &self,
        order_id: &str,
        request: &PaymentRequest,
    ) -> DocFiscalResult<PaymentFlowOutcome> {
        let initiation = self.initiate(order_id, request).await?;

        let poller = self.poller(&initiation.payment_id).build();
        poller.start_polling();
        let final_state = poller.wait_until_settled().await;
        let last_status = poller.last_status();

        Ok(PaymentFlowOutcome {
            initiation,
            final_state,
            last_status,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{query_keys, QueryCache};
    use crate::error::{ErrorKind, TypedError};
    use crate::service::testing::MockService;
    use crate::service::{Order, OrderStatus, PaymentStatusResponse};
    use serde_json::json;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::time::Duration;

    fn request() -> PaymentRequest {
        PaymentRequest {
            return_url: "https://docfiscal.example/return".to_string(),
            cancel_url: "https://docfiscal.example/cancel".to_string(),
        }
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(100)).with_max_jitter(Duration::ZERO)
    }

    #[tokio::test(start_paused = true)]
    async fn test_initiate_retries_transient_failures() {
        let service = Arc::new(MockService::new());
        service.push_initiate(Err(TypedError::network("connection reset")));
        service.push_initiate(Err(TypedError::server("Bad gateway").with_context("status_code", 502)));

        let flow = PaymentFlow::new(service.clone()).with_retry_policy(fast_retry());
        let initiation = flow.initiate("o1", &request()).await.unwrap();

        assert_eq!(initiation.order_id, "o1");
        assert_eq!(service.initiate_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_initiate_gives_up_on_permanent_failure() {
        let service = Arc::new(MockService::new());
        service.push_initiate(Err(TypedError::validation("Order already paid")));

        let flow = PaymentFlow::new(service.clone()).with_retry_policy(fast_retry());
        let error = flow.initiate("o1", &request()).await.unwrap_err();

        assert_eq!(error.kind, ErrorKind::Validation);
        assert_eq!(service.initiate_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_polls_until_paid() {
        let service = Arc::new(MockService::new().with_order(Order::new("o1", OrderStatus::Paid)));
        service.push_status(Ok(PaymentStatusResponse::new(PaymentStatus::Pending)));
        service.push_status(Ok(
            PaymentStatusResponse::new(PaymentStatus::Paid).with_order_id("o1")
        ));

        let cache = Arc::new(QueryCache::new());
        cache.set_query_data(
            query_keys::order("o1"),
            json!({"id": "o1", "status": "pending_payment"}),
        );
        let manager = EnhancedStateManager::new(Arc::clone(&cache), service.clone());

        let flow = PaymentFlow::new(service.clone())
            .with_retry_policy(fast_retry())
            .with_state_manager(manager);
        let outcome = flow.run("o1", &request()).await.unwrap();

        assert!(outcome.is_paid());
        assert_eq!(outcome.last_status, Some(PaymentStatus::Paid));
        assert_eq!(outcome.initiation.payment_id, "pay-0");
        assert_eq!(service.status_calls(), 2);
        assert_eq!(
            cache.get_query_data(&query_keys::order("o1")).unwrap()["status"],
            json!("paid")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_initiate_records_payment_id() {
        let service = Arc::new(MockService::new());
        let cache = Arc::new(QueryCache::new());
        cache.set_query_data(
            query_keys::orders(),
            json!([{"id": "o1", "status": "pending_payment"}]),
        );
        let manager = EnhancedStateManager::new(Arc::clone(&cache), service.clone());

        let flow = PaymentFlow::new(service).with_state_manager(manager);
        let initiation = flow.initiate("o1", &request()).await.unwrap();

        assert_eq!(
            cache.get_query_data(&query_keys::orders()).unwrap()[0]["payment_id"],
            json!(initiation.payment_id)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_reports_declined_payment() {
        let service = Arc::new(MockService::new());
        service.push_status(Ok(PaymentStatusResponse::new(PaymentStatus::Failed)));

        let flow = PaymentFlow::new(service).with_poller_config(PollerConfig {
            initial_interval: Duration::from_millis(500),
            ..PollerConfig::default()
        });
        let outcome = flow.run("o1", &request()).await.unwrap();

        assert!(!outcome.is_paid());
        assert_eq!(outcome.final_state, PollerState::Failed);
        assert_eq!(outcome.last_status, Some(PaymentStatus::Failed));
    }
}
