use crate::{order_json, start_mock_server, Matcher};
use docfiscal::circuit_breaker::{CircuitBreaker, CircuitBreakerState};
use docfiscal::config::ApiConfig;
use docfiscal::service::{
    DocFiscalService, HttpDocFiscalClient, OrderStatus, PaymentRequest, PaymentStatus,
};
use docfiscal::ErrorKind;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn client(base_url: &str) -> HttpDocFiscalClient {
    HttpDocFiscalClient::new(base_url, Duration::from_secs(5)).unwrap()
}

#[tokio::test]
async fn test_get_order_sends_bearer_token() {
    let mut server = match start_mock_server("test_get_order_sends_bearer_token") {
        Some(server) => server,
        None => return,
    };

    let mock = server
        .mock("GET", "/api/orders/o1")
        .match_header("authorization", "Bearer secret")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(order_json("o1", "pending_payment"))
        .expect(1)
        .create_async()
        .await;

    let config = ApiConfig {
        base_url: format!("{}/", server.url()),
        token: Some("secret".to_string()),
        timeout_ms: 5_000,
    };
    let client = HttpDocFiscalClient::from_config(&config).unwrap();
    let order = client.get_order("o1").await.unwrap();

    assert_eq!(order.status, OrderStatus::PendingPayment);
    assert_eq!(order.file_name.as_deref(), Some("invoice.pdf"));
    assert_eq!(order.extra["page_count"], json!(3));
    mock.assert_async().await;
}

#[tokio::test]
async fn test_update_order_status_patches_status() {
    let mut server = match start_mock_server("test_update_order_status_patches_status") {
        Some(server) => server,
        None => return,
    };

    let mock = server
        .mock("PATCH", "/api/orders/o1")
        .match_body(Matcher::Json(json!({"status": "cancelled"})))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(order_json("o1", "cancelled"))
        .create_async()
        .await;

    let order = client(&server.url())
        .update_order_status("o1", OrderStatus::Cancelled)
        .await
        .unwrap();

    assert_eq!(order.status, OrderStatus::Cancelled);
    mock.assert_async().await;
}

#[tokio::test]
async fn test_initiate_payment_and_status() {
    let mut server = match start_mock_server("test_initiate_payment_and_status") {
        Some(server) => server,
        None => return,
    };

    let initiate = server
        .mock("POST", "/api/payments/initiate")
        .match_body(Matcher::Json(json!({
            "order_id": "o1",
            "return_url": "https://app/return",
            "cancel_url": "https://app/cancel"
        })))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            json!({"payment_id": "pay-1", "payment_url": "https://pay/1", "order_id": "o1"})
                .to_string(),
        )
        .create_async()
        .await;
    let status = server
        .mock("GET", "/api/payments/pay-1/status")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(json!({"status": "paid", "order_id": "o1"}).to_string())
        .create_async()
        .await;

    let client = client(&server.url());
    let request = PaymentRequest {
        return_url: "https://app/return".to_string(),
        cancel_url: "https://app/cancel".to_string(),
    };
    let initiation = client.initiate_payment("o1", &request).await.unwrap();
    assert_eq!(initiation.payment_id, "pay-1");

    let response = client.get_payment_status("pay-1").await.unwrap();
    assert_eq!(response.status, PaymentStatus::Paid);
    assert_eq!(response.order_id.as_deref(), Some("o1"));

    initiate.assert_async().await;
    status.assert_async().await;
}

#[tokio::test]
async fn test_error_statuses_are_classified() {
    let mut server = match start_mock_server("test_error_statuses_are_classified") {
        Some(server) => server,
        None => return,
    };

    let cases = [
        ("bad", 400, ErrorKind::Validation),
        ("anon", 401, ErrorKind::Authentication),
        ("forbidden", 403, ErrorKind::Authorization),
        ("missing", 404, ErrorKind::NotFound),
        ("conflict", 409, ErrorKind::Client),
        ("broken", 500, ErrorKind::Server),
    ];
    let mut mocks = Vec::new();
    for (id, status, _) in &cases {
        let mock = server
            .mock("GET", format!("/api/orders/{id}").as_str())
            .with_status(*status)
            .with_header("content-type", "application/json")
            .with_body(json!({"error": format!("order {id} unavailable")}).to_string())
            .create_async()
            .await;
        mocks.push(mock);
    }

    let client = client(&server.url());
    for (id, status, kind) in cases {
        let error = client.get_order(id).await.unwrap_err();
        assert_eq!(error.kind, kind, "status {status}");
        assert_eq!(error.message, format!("order {id} unavailable"));
        assert_eq!(error.context["status_code"], json!(status));
    }
}

#[tokio::test]
async fn test_transient_server_errors_are_retryable() {
    let mut server = match start_mock_server("test_transient_server_errors_are_retryable") {
        Some(server) => server,
        None => return,
    };

    let _mock = server
        .mock("GET", "/api/payments/pay-1/status")
        .with_status(503)
        .with_body("Service Unavailable")
        .create_async()
        .await;

    let error = client(&server.url())
        .get_payment_status("pay-1")
        .await
        .unwrap_err();

    assert_eq!(error.kind, ErrorKind::Server);
    assert!(error.retryable);
    assert!(error.message.contains("503"));
}

#[tokio::test]
async fn test_breaker_opens_on_server_errors() {
    let mut server = match start_mock_server("test_breaker_opens_on_server_errors") {
        Some(server) => server,
        None => return,
    };

    let mock = server
        .mock("GET", "/api/orders/o1")
        .with_status(502)
        .expect(2)
        .create_async()
        .await;

    let breaker = Arc::new(CircuitBreaker::with_threshold(
        "orders-api",
        2,
        Duration::from_secs(60),
    ));
    let client = client(&server.url()).with_circuit_breaker(Arc::clone(&breaker));

    for _ in 0..2 {
        let error = client.get_order("o1").await.unwrap_err();
        assert_eq!(error.kind, ErrorKind::Server);
    }
    assert_eq!(breaker.get_state().state, CircuitBreakerState::Open);

    let rejected = client.get_order("o1").await.unwrap_err();
    assert_eq!(rejected.kind, ErrorKind::Network);
    assert!(rejected.message.contains("rejected"));
    mock.assert_async().await;
}

#[tokio::test]
async fn test_client_errors_do_not_trip_breaker() {
    let mut server = match start_mock_server("test_client_errors_do_not_trip_breaker") {
        Some(server) => server,
        None => return,
    };

    let mock = server
        .mock("GET", "/api/orders/gone")
        .with_status(404)
        .expect(3)
        .create_async()
        .await;

    let breaker = Arc::new(CircuitBreaker::with_threshold(
        "orders-api",
        1,
        Duration::from_secs(60),
    ));
    let client = client(&server.url()).with_circuit_breaker(Arc::clone(&breaker));

    for _ in 0..3 {
        let error = client.get_order("gone").await.unwrap_err();
        assert_eq!(error.kind, ErrorKind::NotFound);
    }
    let state = breaker.get_state();
    assert_eq!(state.state, CircuitBreakerState::Closed);
    assert_eq!(state.failure_count, 0);
    mock.assert_async().await;
}

#[tokio::test]
async fn test_unreachable_host_is_network_error() {
    // Nothing listens on the discard port
    let error = client("http://127.0.0.1:9")
        .get_order("o1")
        .await
        .unwrap_err();

    assert_eq!(error.kind, ErrorKind::Network);
    assert!(error.retryable);
}
