#[path = "common/mod.rs"]
mod common;

pub(crate) use common::*;

#[path = "integration/http_client.rs"]
mod http_client;
#[path = "integration/payment_flow.rs"]
mod payment_flow;
