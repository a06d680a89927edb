// Remote Service Layer
// "Orders and payments, one request at a time"

mod flow;
mod http;
mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use flow::{PaymentFlow, PaymentFlowOutcome};
pub use http::HttpDocFiscalClient;
pub use types::{
    Order, OrderStatus, PaymentInitiation, PaymentRequest, PaymentStatus, PaymentStatusResponse,
    UpdateOrderStatusRequest,
};

use crate::cache::{QueryFetcher, QueryKey};
use crate::error::{DocFiscalResult, TypedError};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// Calls the client makes against the DocFiscal API
#[async_trait]
pub trait DocFiscalService: Send + Sync {
    async fn get_order(&self, order_id: &str) -> DocFiscalResult<Order>;

    async fn update_order_status(
        &self,
        order_id: &str,
        status: OrderStatus,
    ) -> DocFiscalResult<Order>;

    async fn initiate_payment(
        &self,
        order_id: &str,
        request: &PaymentRequest,
    ) -> DocFiscalResult<PaymentInitiation>;

    async fn get_payment_status(&self, payment_id: &str) -> DocFiscalResult<PaymentStatusResponse>;
}

pub type SharedService = Arc<dyn DocFiscalService>;

/// Fills `["orders", id]` and `["payments", id, "status"]` cache entries from
/// the service.
pub struct ServiceQueryFetcher {
    service: SharedService,
}

impl ServiceQueryFetcher {
    pub fn new(service: SharedService) -> Self {
        Self { service }
    }
}

#[async_trait]
impl QueryFetcher for ServiceQueryFetcher {
    async fn fetch(&self, key: &QueryKey) -> DocFiscalResult<Value> {
        match key.segments() {
            [root, order_id] if root == "orders" => {
                let order = self.service.get_order(order_id).await?;
                Ok(serde_json::to_value(order)?)
            }
            [root, payment_id, leaf] if root == "payments" && leaf == "status" => {
                let status = self.service.get_payment_status(payment_id).await?;
                Ok(serde_json::to_value(status)?)
            }
            _ => Err(TypedError::client("No remote source for query")
                .with_context("query_key", key.to_string())),
        }
    }
}
