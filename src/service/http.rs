use super::types::{InitiatePaymentBody, UpdateOrderStatusRequest};
use super::{
    DocFiscalService, Order, OrderStatus, PaymentInitiation, PaymentRequest,
    PaymentStatusResponse,
};
use crate::circuit_breaker::SharedCircuitBreaker;
use crate::config::ApiConfig;
use crate::error::{classify_http_status, DocFiscalResult, TypedError};
use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, instrument};

/// [`DocFiscalService`] over the application's HTTP API routes.
///
/// Transport failures and 5xx responses count against the optional circuit
/// breaker; 4xx responses are the caller's problem and do not.
#[derive(Clone)]
pub struct HttpDocFiscalClient {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
    breaker: Option<SharedCircuitBreaker>,
}

impl HttpDocFiscalClient {
    pub fn new<S: Into<String>>(base_url: S, timeout: Duration) -> DocFiscalResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("docfiscal-core/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: None,
            breaker: None,
        })
    }

    pub fn from_config(config: &ApiConfig) -> DocFiscalResult<Self> {
        let client = Self::new(config.base_url.clone(), config.timeout())?;
        Ok(match &config.token {
            Some(token) => client.with_token(token.clone()),
            None => client,
        })
    }

    pub fn with_token<S: Into<String>>(mut self, token: S) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_circuit_breaker(mut self, breaker: SharedCircuitBreaker) -> Self {
        self.breaker = Some(breaker);
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self
            .client
            .request(method, format!("{}{}", self.base_url, path));
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> DocFiscalResult<T> {
        let call = async move {
            let response = request.send().await.map_err(TypedError::from)?;
            if response.status().is_server_error() {
                return Err(status_error(response).await);
            }
            Ok(response)
        };

        let response = match &self.breaker {
            Some(breaker) => breaker.execute(call).await?,
            None => call.await?,
        };

        if !response.status().is_success() {
            return Err(status_error(response).await);
        }

        Ok(response.json::<T>().await?)
    }
}

/// Classify a non-success response using its status and error body
async fn status_error(response: Response) -> TypedError {
    let status = response.status();
    let url = response.url().to_string();
    let body = response.text().await.unwrap_or_default();

    let message = serde_json::from_str::<Value>(&body)
        .ok()
        .and_then(|v| {
            v.get("error")
                .or_else(|| v.get("message"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| format!("Request failed with status {status}"));

    debug!(status = status.as_u16(), url = %url, "API request failed");
    classify_http_status(status.as_u16(), message).with_context("url", url)
}

#[async_trait]
impl DocFiscalService for HttpDocFiscalClient {
    #[instrument(skip(self))]
    async fn get_order(&self, order_id: &str) -> DocFiscalResult<Order> {
        self.send(self.request(Method::GET, &format!("/api/orders/{order_id}")))
            .await
    }

    #[instrument(skip(self))]
    async fn update_order_status(
        &self,
        order_id: &str,
        status: OrderStatus,
    ) -> DocFiscalResult<Order> {
        let request = self
            .request(Method::PATCH, &format!("/api/orders/{order_id}"))
            .json(&UpdateOrderStatusRequest { status });
        self.send(request).await
    }

    #[instrument(skip(self, request))]
    async fn initiate_payment(
        &self,
        order_id: &str,
        request: &PaymentRequest,
    ) -> DocFiscalResult<PaymentInitiation> {
        let body = InitiatePaymentBody {
            order_id,
            return_url: &request.return_url,
            cancel_url: &request.cancel_url,
        };
        self.send(
            self.request(Method::POST, "/api/payments/initiate")
                .json(&body),
        )
        .await
    }

    #[instrument(skip(self))]
    async fn get_payment_status(&self, payment_id: &str) -> DocFiscalResult<PaymentStatusResponse> {
        self.send(self.request(Method::GET, &format!("/api/payments/{payment_id}/status")))
            .await
    }
}
