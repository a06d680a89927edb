// Payment Tracking
// "Ask again, a little less often, until the answer is final"

mod poller;


pub use poller::{
    ErrorCallback, PaymentStatusPoller, PaymentStatusPollerBuilder, PollerConfig, PollerState,
    StatusCallback,
};
