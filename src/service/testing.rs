//! Scripted in-memory service for unit tests

use super::{
    DocFiscalService, Order, OrderStatus, PaymentInitiation, PaymentRequest, PaymentStatus,
    PaymentStatusResponse,
};
use crate::error::{DocFiscalResult, TypedError};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Default)]
pub(crate) struct MockService {
    orders: Mutex<HashMap<String, Order>>,
    update_failures: Mutex<VecDeque<TypedError>>,
    initiate_script: Mutex<VecDeque<DocFiscalResult<PaymentInitiation>>>,
    status_script: Mutex<VecDeque<DocFiscalResult<PaymentStatusResponse>>>,
    status_delay: Mutex<Option<Duration>>,
    pub get_order_calls: AtomicU32,
    pub update_calls: AtomicU32,
    pub initiate_calls: AtomicU32,
    pub status_calls: AtomicU32,
}

impl MockService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_order(self, order: Order) -> Self {
        self.put_order(order);
        self
    }

    pub fn put_order(&self, order: Order) {
        self.orders
            .lock()
            .unwrap()
            .insert(order.id.clone(), order);
    }

    pub fn order(&self, id: &str) -> Option<Order> {
        self.orders.lock().unwrap().get(id).cloned()
    }

    /// Next update call fails with `error`
    pub fn fail_next_update(&self, error: TypedError) {
        self.update_failures.lock().unwrap().push_back(error);
    }

    pub fn push_initiate(&self, result: DocFiscalResult<PaymentInitiation>) {
        self.initiate_script.lock().unwrap().push_back(result);
    }

    /// Queue a status response; once the script is empty `pending` is returned
    pub fn push_status(&self, result: DocFiscalResult<PaymentStatusResponse>) {
        self.status_script.lock().unwrap().push_back(result);
    }

    /// Make every status call take this long on the runtime clock
    pub fn set_status_delay(&self, delay: Duration) {
        *self.status_delay.lock().unwrap() = Some(delay);
    }

    pub fn status_calls(&self) -> u32 {
        self.status_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DocFiscalService for MockService {
    async fn get_order(&self, order_id: &str) -> DocFiscalResult<Order> {
        self.get_order_calls.fetch_add(1, Ordering::SeqCst);
        self.order(order_id)
            .ok_or_else(|| TypedError::not_found(format!("Order {order_id} not found")))
    }

    async fn update_order_status(
        &self,
        order_id: &str,
        status: OrderStatus,
    ) -> DocFiscalResult<Order> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;

        if let Some(error) = self.update_failures.lock().unwrap().pop_front() {
            return Err(error);
        }

        let mut orders = self.orders.lock().unwrap();
        let order = orders
            .get_mut(order_id)
            .ok_or_else(|| TypedError::not_found(format!("Order {order_id} not found")))?;
        order.status = status;
        Ok(order.clone())
    }

    async fn initiate_payment(
        &self,
        order_id: &str,
        _request: &PaymentRequest,
    ) -> DocFiscalResult<PaymentInitiation> {
        let n = self.initiate_calls.fetch_add(1, Ordering::SeqCst);
        let scripted = self.initiate_script.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| {
            Ok(PaymentInitiation {
                payment_id: format!("pay-{n}"),
                payment_url: format!("https://pay.example/{n}"),
                order_id: order_id.to_string(),
            })
        })
    }

    async fn get_payment_status(&self, _payment_id: &str) -> DocFiscalResult<PaymentStatusResponse> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.status_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let scripted = self.status_script.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| Ok(PaymentStatusResponse::new(PaymentStatus::Pending)))
    }
}
