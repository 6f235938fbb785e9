//! UPI payment transaction lifecycle engine
//!
//! Validates payer VPAs, verifies gateway webhooks, keeps an auditable ledger
//! of every payment and refund, and drives each transaction through its
//! lifecycle against a UPI gateway.

pub mod api;
pub mod config;
pub mod database;
pub mod error;
pub mod logging;
pub mod middleware;
pub mod payments;
pub mod services;
pub mod workers;

pub use error::{PaymentError, PaymentResult};
