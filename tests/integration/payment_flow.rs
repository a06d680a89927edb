use crate::{order_json, start_mock_server};
use docfiscal::cache::{query_keys, QueryCache};
use docfiscal::retry::RetryPolicy;
use docfiscal::service::{
    HttpDocFiscalClient, PaymentFlow, PaymentRequest, PaymentStatus, SharedService,
};
use docfiscal::{EnhancedStateManager, PollerConfig, PollerState};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn fast_poller() -> PollerConfig {
    PollerConfig {
        initial_interval: Duration::from_millis(20),
        backoff_multiplier: 1.5,
        max_interval: Duration::from_millis(50),
        max_duration: Duration::from_millis(400),
        max_consecutive_errors: 2,
    }
}

fn request() -> PaymentRequest {
    PaymentRequest {
        return_url: "https://app/return".to_string(),
        cancel_url: "https://app/cancel".to_string(),
    }
}

fn service(base_url: &str) -> SharedService {
    Arc::new(HttpDocFiscalClient::new(base_url, Duration::from_secs(5)).unwrap())
}

#[tokio::test]
async fn test_paid_payment_updates_cached_order() {
    let mut server = match start_mock_server("test_paid_payment_updates_cached_order") {
        Some(server) => server,
        None => return,
    };

    let _initiate = server
        .mock("POST", "/api/payments/initiate")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            json!({"payment_id": "pay-9", "payment_url": "https://pay/9", "order_id": "o1"})
                .to_string(),
        )
        .create_async()
        .await;
    let _status = server
        .mock("GET", "/api/payments/pay-9/status")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(json!({"status": "paid", "order_id": "o1"}).to_string())
        .create_async()
        .await;
    let refresh = server
        .mock("GET", "/api/orders/o1")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(order_json("o1", "processing"))
        .expect(1)
        .create_async()
        .await;

    let service = service(&server.url());
    let cache = Arc::new(QueryCache::new());
    cache.set_query_data(
        query_keys::orders(),
        json!([{"id": "o1", "status": "pending_payment"}]),
    );
    let manager = EnhancedStateManager::new(Arc::clone(&cache), Arc::clone(&service));

    let flow = PaymentFlow::new(service)
        .with_poller_config(fast_poller())
        .with_state_manager(manager);
    let outcome = flow.run("o1", &request()).await.unwrap();

    assert!(outcome.is_paid());
    assert_eq!(outcome.initiation.payment_id, "pay-9");
    assert_eq!(outcome.last_status, Some(PaymentStatus::Paid));

    // The server's copy wins once it has been refetched
    assert_eq!(
        cache.get_query_data(&query_keys::order("o1")).unwrap()["status"],
        json!("processing")
    );
    assert_eq!(
        cache.get_query_data(&query_keys::orders()).unwrap()[0]["status"],
        json!("processing")
    );
    refresh.assert_async().await;
}

#[tokio::test]
async fn test_pending_payment_times_out() {
    let mut server = match start_mock_server("test_pending_payment_times_out") {
        Some(server) => server,
        None => return,
    };

    let _status = server
        .mock("GET", "/api/payments/pay-1/status")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(json!({"status": "pending"}).to_string())
        .create_async()
        .await;

    let flow = PaymentFlow::new(service(&server.url())).with_poller_config(fast_poller());
    let poller = flow.poller("pay-1").build();
    poller.start_polling();

    assert_eq!(poller.wait_until_settled().await, PollerState::TimedOut);
    assert!(poller.attempts() > 1);
    assert_eq!(poller.last_status(), Some(PaymentStatus::Pending));
}

#[tokio::test]
async fn test_unavailable_status_route_fails_session() {
    let mut server = match start_mock_server("test_unavailable_status_route_fails_session") {
        Some(server) => server,
        None => return,
    };

    let mock = server
        .mock("GET", "/api/payments/pay-1/status")
        .with_status(503)
        .expect(3)
        .create_async()
        .await;

    let flow = PaymentFlow::new(service(&server.url())).with_poller_config(fast_poller());
    let poller = flow.poller("pay-1").build();
    poller.start_polling();

    assert_eq!(poller.wait_until_settled().await, PollerState::Failed);
    assert_eq!(poller.last_error().unwrap().kind, docfiscal::ErrorKind::Server);
    mock.assert_async().await;
}

#[tokio::test]
async fn test_declined_initiation_is_not_retried() {
    let mut server = match start_mock_server("test_declined_initiation_is_not_retried") {
        Some(server) => server,
        None => return,
    };

    let mock = server
        .mock("POST", "/api/payments/initiate")
        .with_status(400)
        .with_header("content-type", "application/json")
        .with_body(json!({"error": "Order already paid"}).to_string())
        .expect(1)
        .create_async()
        .await;

    let flow = PaymentFlow::new(service(&server.url()))
        .with_retry_policy(RetryPolicy::new(3, Duration::from_millis(10)));
    let error = flow.run("o1", &request()).await.unwrap_err();

    assert_eq!(error.kind, docfiscal::ErrorKind::Validation);
    assert_eq!(error.message, "Order already paid");
    mock.assert_async().await;
}
