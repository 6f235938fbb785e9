//! Background workers

pub mod reconciliation;
