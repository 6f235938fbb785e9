use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::{ErrorCode, PaymentError};
use crate::payments::types::{
    format_minor_units, to_minor_units, Page, PaymentTransaction, RefundRecord, RefundStatus,
    StatusChange, TransactionFilter, TransactionStatus, TransitionSource,
};
use crate::services::payment_engine::{
    InitiatePaymentRequest, PaymentInitiated, PaymentStatusView, RefundCommand, RefundOutcome,
    WebhookOutcome,
};

fn default_currency() -> String {
    "INR".to_string()
}

// ============================================================================
// Initiation
// ============================================================================

/// Request to start a UPI collect payment
#[derive(Debug, Deserialize)]
pub struct InitiatePaymentBody {
    pub order_id: String,
    pub user_id: String,
    pub payer_vpa: String,
    /// Major units, e.g. "500.00"
    pub amount: BigDecimal,
    #[serde(default = "default_currency")]
    pub currency: String,
}

impl InitiatePaymentBody {
    pub fn into_request(self) -> Result<InitiatePaymentRequest, PaymentError> {
        Ok(InitiatePaymentRequest {
            amount_minor: to_minor_units(&self.amount)?,
            order_id: self.order_id.trim().to_string(),
            user_id: self.user_id.trim().to_string(),
            payer_vpa: self.payer_vpa.trim().to_string(),
            currency: self.currency.trim().to_uppercase(),
        })
    }
}

#[derive(Debug, Serialize)]
pub struct InitiatePaymentResponse {
    pub transaction_id: String,
    pub order_id: String,
    pub status: TransactionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway_reference: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub message: String,
}

impl From<PaymentInitiated> for InitiatePaymentResponse {
    fn from(result: PaymentInitiated) -> Self {
        Self {
            message: status_message(result.status).to_string(),
            transaction_id: result.transaction_id,
            order_id: result.order_id,
            status: result.status,
            gateway_reference: result.gateway_reference,
            failure_reason: result.failure_reason,
        }
    }
}

// ============================================================================
// Status
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct TransactionDetail {
    pub transaction_id: String,
    pub order_id: String,
    pub user_id: String,
    pub payer_vpa: String,
    pub amount: String,
    pub currency: String,
    pub status: TransactionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway_reference: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<PaymentTransaction> for TransactionDetail {
    fn from(tx: PaymentTransaction) -> Self {
        Self {
            amount: format_minor_units(tx.amount_minor),
            transaction_id: tx.transaction_id,
            order_id: tx.order_id,
            user_id: tx.user_id,
            payer_vpa: tx.payer_vpa,
            currency: tx.currency,
            status: tx.status,
            gateway_reference: tx.gateway_reference,
            failure_reason: tx.failure_reason,
            created_at: tx.created_at,
            updated_at: tx.updated_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RefundDetail {
    pub refund_id: String,
    pub amount: String,
    pub reason: String,
    pub status: RefundStatus,
    pub initiated_by: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway_refund_reference: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<RefundRecord> for RefundDetail {
    fn from(refund: RefundRecord) -> Self {
        Self {
            amount: format_minor_units(refund.amount_minor),
            refund_id: refund.refund_id,
            reason: refund.reason,
            status: refund.status,
            initiated_by: refund.initiated_by,
            gateway_refund_reference: refund.gateway_refund_reference,
            failure_reason: refund.failure_reason,
            created_at: refund.created_at,
            updated_at: refund.updated_at,
        }
    }
}

/// Timeline entry for transaction history
#[derive(Debug, Clone, Serialize)]
pub struct TimelineEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_status: Option<TransactionStatus>,
    pub status: TransactionStatus,
    pub source: TransitionSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    pub note: String,
    pub timestamp: DateTime<Utc>,
}

impl From<StatusChange> for TimelineEntry {
    fn from(change: StatusChange) -> Self {
        Self {
            from_status: change.from_status,
            status: change.to_status,
            source: change.source,
            event_id: change.event_id,
            note: change.note,
            timestamp: change.changed_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct PaymentStatusResponse {
    pub message: String,
    pub transaction: TransactionDetail,
    pub refunds: Vec<RefundDetail>,
    pub timeline: Vec<TimelineEntry>,
    pub reconciled: bool,
}

impl From<PaymentStatusView> for PaymentStatusResponse {
    fn from(view: PaymentStatusView) -> Self {
        Self {
            message: status_message(view.transaction.status).to_string(),
            transaction: view.transaction.into(),
            refunds: view.refunds.into_iter().map(Into::into).collect(),
            timeline: view.history.into_iter().map(Into::into).collect(),
            reconciled: view.reconciled,
        }
    }
}

/// User-facing message for a status
pub fn status_message(status: TransactionStatus) -> &'static str {
    match status {
        TransactionStatus::Created => "Payment created. Waiting for the gateway to accept it.",
        TransactionStatus::Pending => "Approve the collect request in your UPI app.",
        TransactionStatus::Success => "Payment received.",
        TransactionStatus::Failed => "Payment failed. No money was taken.",
        TransactionStatus::RefundPending => "Refund in progress.",
        TransactionStatus::Refunded => "Payment refunded.",
        TransactionStatus::RefundFailed => "Refund failed. It can be retried.",
    }
}

// ============================================================================
// Webhook
// ============================================================================

#[derive(Debug, Serialize)]
pub struct WebhookAck {
    pub transaction_id: String,
    pub event_id: String,
    pub applied: bool,
    pub status: TransactionStatus,
}

impl From<WebhookOutcome> for WebhookAck {
    fn from(outcome: WebhookOutcome) -> Self {
        Self {
            transaction_id: outcome.transaction_id,
            event_id: outcome.event_id,
            applied: outcome.applied,
            status: outcome.status,
        }
    }
}

// ============================================================================
// Refunds
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct RefundBody {
    /// Major units; the full amount when omitted
    #[serde(default)]
    pub amount: Option<BigDecimal>,
    pub reason: String,
    pub initiated_by: String,
}

impl RefundBody {
    pub fn into_command(self, transaction_id: String) -> Result<RefundCommand, PaymentError> {
        let amount_minor = self.amount.as_ref().map(to_minor_units).transpose()?;
        Ok(RefundCommand {
            transaction_id,
            amount_minor,
            reason: self.reason,
            initiated_by: self.initiated_by,
        })
    }
}

#[derive(Debug, Serialize)]
pub struct RefundResponse {
    pub refund_id: String,
    pub transaction_id: String,
    pub amount: String,
    pub refund_status: RefundStatus,
    pub transaction_status: TransactionStatus,
}

impl From<RefundOutcome> for RefundResponse {
    fn from(outcome: RefundOutcome) -> Self {
        Self {
            amount: format_minor_units(outcome.amount_minor),
            refund_id: outcome.refund_id,
            transaction_id: outcome.transaction_id,
            refund_status: outcome.refund_status,
            transaction_status: outcome.transaction_status,
        }
    }
}

// ============================================================================
// Listing
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct TransactionListQuery {
    pub status: Option<String>,
    pub order_id: Option<String>,
    pub user_id: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub page: Option<u32>,
    pub per_page: Option<u32>,
}

impl TransactionListQuery {
    pub fn into_filter(self) -> Result<TransactionFilter, PaymentError> {
        let status = self
            .status
            .as_deref()
            .map(TransactionStatus::from_str)
            .transpose()?;
        Ok(TransactionFilter {
            status,
            order_id: self.order_id,
            user_id: self.user_id,
            created_from: self.from,
            created_to: self.to,
            page: self.page,
            per_page: self.per_page,
        })
    }
}

#[derive(Debug, Serialize)]
pub struct Pagination {
    pub page: u32,
    pub per_page: u32,
    pub total: u64,
    pub total_pages: u32,
}

#[derive(Debug, Serialize)]
pub struct TransactionListResponse {
    pub transactions: Vec<TransactionDetail>,
    pub pagination: Pagination,
}

impl From<Page<PaymentTransaction>> for TransactionListResponse {
    fn from(page: Page<PaymentTransaction>) -> Self {
        Self {
            pagination: Pagination {
                page: page.page,
                per_page: page.per_page,
                total: page.total,
                total_pages: page.total_pages,
            },
            transactions: page.items.into_iter().map(Into::into).collect(),
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}
