//! Middleware modules for the UPI payments backend
//!
//! Provides request/response logging and call timing helpers

pub mod logging;
