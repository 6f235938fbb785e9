//! Services module for payment lifecycle logic

pub mod locks;
pub mod payment_engine;

pub use payment_engine::{
    InitiatePaymentRequest, PaymentEngine, PaymentInitiated, PaymentStatusView, RefundCommand,
    RefundOutcome, WebhookOutcome,
};
