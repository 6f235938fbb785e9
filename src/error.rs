//! Error taxonomy for the payment engine
//!
//! Every engine operation returns `PaymentError`. Each variant knows its HTTP
//! status, stable error code and whether the caller may retry.

use serde::Serialize;

use crate::database::error::DatabaseError;
use crate::payments::gateway::GatewayError;

#[derive(Debug, thiserror::Error)]
pub enum PaymentError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("invalid state for transaction {transaction_id}: {reason}")]
    InvalidState {
        transaction_id: String,
        reason: String,
    },

    #[error("state conflict on transaction {transaction_id}: {reason}")]
    StateConflict {
        transaction_id: String,
        reason: String,
    },

    #[error("webhook authentication failed")]
    AuthenticationFailure,

    #[error("payment gateway unavailable: {0}")]
    GatewayUnavailable(String),

    #[error("payment gateway rejected the request: {0}")]
    GatewayRejected(String),

    #[error("lock acquisition timeout for transaction {transaction_id}")]
    LockTimeout { transaction_id: String },

    #[error("ledger error: {0}")]
    Ledger(#[from] DatabaseError),
}

/// Stable machine-readable codes returned to API callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidInput,
    NotFound,
    InvalidState,
    StateConflict,
    AuthenticationFailure,
    GatewayUnavailable,
    GatewayRejected,
    Busy,
    InternalError,
}

impl PaymentError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        PaymentError::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            PaymentError::InvalidInput(_) => 400,
            PaymentError::NotFound { .. } => 404,
            PaymentError::InvalidState { .. } => 422,
            PaymentError::StateConflict { .. } => 409,
            PaymentError::AuthenticationFailure => 401,
            PaymentError::GatewayUnavailable(_) => 503,
            PaymentError::GatewayRejected(_) => 502,
            PaymentError::LockTimeout { .. } => 503,
            PaymentError::Ledger(_) => 500,
        }
    }

    pub fn error_code(&self) -> ErrorCode {
        match self {
            PaymentError::InvalidInput(_) => ErrorCode::InvalidInput,
            PaymentError::NotFound { .. } => ErrorCode::NotFound,
            PaymentError::InvalidState { .. } => ErrorCode::InvalidState,
            PaymentError::StateConflict { .. } => ErrorCode::StateConflict,
            PaymentError::AuthenticationFailure => ErrorCode::AuthenticationFailure,
            PaymentError::GatewayUnavailable(_) => ErrorCode::GatewayUnavailable,
            PaymentError::GatewayRejected(_) => ErrorCode::GatewayRejected,
            PaymentError::LockTimeout { .. } => ErrorCode::Busy,
            PaymentError::Ledger(_) => ErrorCode::InternalError,
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            PaymentError::GatewayUnavailable(_) | PaymentError::LockTimeout { .. } => true,
            PaymentError::Ledger(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// Message safe to show to API callers. Storage details stay in the logs.
    pub fn user_message(&self) -> String {
        match self {
            PaymentError::AuthenticationFailure => "Invalid webhook signature".to_string(),
            PaymentError::Ledger(_) => {
                "An internal error occurred. Please try again later.".to_string()
            }
            other => other.to_string(),
        }
    }
}

impl From<GatewayError> for PaymentError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::Transient(msg) | GatewayError::Unknown(msg) => {
                PaymentError::GatewayUnavailable(msg)
            }
            GatewayError::Rejected(msg) => PaymentError::GatewayRejected(msg),
        }
    }
}

pub type PaymentResult<T> = Result<T, PaymentError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_follow_taxonomy() {
        assert_eq!(PaymentError::InvalidInput("x".into()).status_code(), 400);
        assert_eq!(PaymentError::not_found("transaction", "t1").status_code(), 404);
        assert_eq!(PaymentError::AuthenticationFailure.status_code(), 401);
        assert_eq!(
            PaymentError::StateConflict {
                transaction_id: "t1".into(),
                reason: "regression".into()
            }
            .status_code(),
            409
        );
    }

    #[test]
    fn retryable_errors() {
        assert!(PaymentError::GatewayUnavailable("timeout".into()).is_retryable());
        assert!(PaymentError::LockTimeout {
            transaction_id: "t1".into()
        }
        .is_retryable());
        assert!(!PaymentError::GatewayRejected("bad vpa".into()).is_retryable());
        assert!(!PaymentError::AuthenticationFailure.is_retryable());
    }

    #[test]
    fn gateway_errors_map_to_payment_errors() {
        let err: PaymentError = GatewayError::Transient("503".into()).into();
        assert!(matches!(err, PaymentError::GatewayUnavailable(_)));

        let err: PaymentError = GatewayError::Rejected("invalid vpa".into()).into();
        assert!(matches!(err, PaymentError::GatewayRejected(_)));
        assert_eq!(err.error_code(), ErrorCode::GatewayRejected);
    }

    #[test]
    fn ledger_details_are_hidden_from_users() {
        let err = PaymentError::Ledger(DatabaseError::Storage {
            message: "connection reset by peer".into(),
            is_retryable: true,
        });
        assert!(!err.user_message().contains("connection reset"));
        assert!(err.is_retryable());
    }
}
