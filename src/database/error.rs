//! Ledger storage errors

use crate::payments::types::TransactionStatus;

#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("transaction not found: {transaction_id}")]
    TransactionNotFound { transaction_id: String },

    #[error("refund not found: {refund_id}")]
    RefundNotFound { refund_id: String },

    #[error("order {order_id} already has a payment transaction")]
    DuplicateOrder { order_id: String },

    #[error("transaction {transaction_id} is {actual}, expected {expected}")]
    StaleState {
        transaction_id: String,
        expected: TransactionStatus,
        actual: TransactionStatus,
    },

    #[error("gateway reference already set on transaction {transaction_id}")]
    GatewayReferenceAlreadySet { transaction_id: String },

    #[error("transaction {transaction_id} already has an active refund")]
    ActiveRefundExists { transaction_id: String },

    #[error("storage error: {message}")]
    Storage { message: String, is_retryable: bool },
}

impl DatabaseError {
    pub fn is_retryable(&self) -> bool {
        match self {
            DatabaseError::Storage { is_retryable, .. } => *is_retryable,
            DatabaseError::StaleState { .. } => true,
            _ => false,
        }
    }
}

#[cfg(feature = "database")]
impl From<sqlx::Error> for DatabaseError {
    fn from(err: sqlx::Error) -> Self {
        let is_retryable = matches!(
            err,
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_)
        );
        DatabaseError::Storage {
            message: err.to_string(),
            is_retryable,
        }
    }
}

pub type DatabaseResult<T> = Result<T, DatabaseError>;
