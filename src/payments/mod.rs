//! UPI payment domain: records, VPA and signature checks, webhook payloads
//! and the gateway client

pub mod gateway;
pub mod signature;
pub mod types;
pub mod vpa;
pub mod webhook;
