//! Payment ledger types
//!
//! Transactions, refunds, status history and the state machine that governs
//! them. Amounts are always held in minor units (paise for INR).

use bigdecimal::{BigDecimal, ToPrimitive};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::PaymentError;

/// Currencies the UPI rail settles in
pub const SUPPORTED_CURRENCIES: &[&str] = &["INR"];

/// Minor units per major unit for every supported currency
const MINOR_UNITS_PER_MAJOR: i64 = 100;

// ============================================================================
// Transaction State Machine
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    /// Local record exists, gateway has not acknowledged the collect request
    Created,
    /// Gateway accepted the collect request, awaiting payer action
    Pending,
    Success,
    Failed,
    RefundPending,
    Refunded,
    RefundFailed,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Created => "CREATED",
            TransactionStatus::Pending => "PENDING",
            TransactionStatus::Success => "SUCCESS",
            TransactionStatus::Failed => "FAILED",
            TransactionStatus::RefundPending => "REFUND_PENDING",
            TransactionStatus::Refunded => "REFUNDED",
            TransactionStatus::RefundFailed => "REFUND_FAILED",
        }
    }

    /// Forward edges of the lifecycle. Anything not listed is a conflict.
    pub fn can_transition_to(&self, next: &TransactionStatus) -> bool {
        use TransactionStatus::*;
        matches!(
            (self, next),
            (Created, Pending)
                | (Created, Failed)
                | (Pending, Success)
                | (Pending, Failed)
                | (Success, RefundPending)
                | (RefundPending, Refunded)
                | (RefundPending, RefundFailed)
                // refund retry, only taken by an explicit refund request
                | (RefundFailed, RefundPending)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionStatus::Failed | TransactionStatus::Refunded | TransactionStatus::RefundFailed
        )
    }

    /// The payment has been captured and no refund is in flight
    pub fn is_refund_eligible(&self) -> bool {
        matches!(self, TransactionStatus::Success | TransactionStatus::RefundFailed)
    }

    /// States that reconciliation may resolve by asking the gateway
    pub fn needs_reconciliation(&self) -> bool {
        matches!(
            self,
            TransactionStatus::Created | TransactionStatus::Pending | TransactionStatus::RefundPending
        )
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionStatus {
    type Err = PaymentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "CREATED" => Ok(TransactionStatus::Created),
            "PENDING" => Ok(TransactionStatus::Pending),
            "SUCCESS" => Ok(TransactionStatus::Success),
            "FAILED" => Ok(TransactionStatus::Failed),
            "REFUND_PENDING" => Ok(TransactionStatus::RefundPending),
            "REFUNDED" => Ok(TransactionStatus::Refunded),
            "REFUND_FAILED" => Ok(TransactionStatus::RefundFailed),
            other => Err(PaymentError::InvalidInput(format!(
                "unknown transaction status '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RefundStatus {
    Pending,
    Succeeded,
    Failed,
}

impl RefundStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefundStatus::Pending => "PENDING",
            RefundStatus::Succeeded => "SUCCEEDED",
            RefundStatus::Failed => "FAILED",
        }
    }

    pub fn is_active(&self) -> bool {
        !matches!(self, RefundStatus::Failed)
    }
}

impl fmt::Display for RefundStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RefundStatus {
    type Err = PaymentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Ok(RefundStatus::Pending),
            "SUCCEEDED" => Ok(RefundStatus::Succeeded),
            "FAILED" => Ok(RefundStatus::Failed),
            other => Err(PaymentError::InvalidInput(format!(
                "unknown refund status '{}'",
                other
            ))),
        }
    }
}

/// Who or what caused a status change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionSource {
    Initiation,
    Webhook,
    Reconciliation,
    Refund,
}

impl TransitionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransitionSource::Initiation => "initiation",
            TransitionSource::Webhook => "webhook",
            TransitionSource::Reconciliation => "reconciliation",
            TransitionSource::Refund => "refund",
        }
    }
}

impl FromStr for TransitionSource {
    type Err = PaymentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initiation" => Ok(TransitionSource::Initiation),
            "webhook" => Ok(TransitionSource::Webhook),
            "reconciliation" => Ok(TransitionSource::Reconciliation),
            "refund" => Ok(TransitionSource::Refund),
            other => Err(PaymentError::InvalidInput(format!(
                "unknown transition source '{}'",
                other
            ))),
        }
    }
}

// ============================================================================
// Records
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PaymentTransaction {
    pub transaction_id: String,
    pub order_id: String,
    pub user_id: String,
    pub payer_vpa: String,
    pub amount_minor: i64,
    pub currency: String,
    pub status: TransactionStatus,
    pub gateway_reference: Option<String>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PaymentTransaction {
    /// Fresh CREATED record with a generated identifier
    pub fn new(
        order_id: &str,
        user_id: &str,
        payer_vpa: &str,
        amount_minor: i64,
        currency: &str,
    ) -> Self {
        let now = Utc::now();
        Self {
            transaction_id: format!("upi_{}", uuid::Uuid::new_v4().simple()),
            order_id: order_id.to_string(),
            user_id: user_id.to_string(),
            payer_vpa: payer_vpa.to_string(),
            amount_minor,
            currency: currency.to_string(),
            status: TransactionStatus::Created,
            gateway_reference: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RefundRecord {
    pub refund_id: String,
    pub transaction_id: String,
    pub amount_minor: i64,
    pub reason: String,
    pub status: RefundStatus,
    pub initiated_by: String,
    pub gateway_refund_reference: Option<String>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RefundRecord {
    pub fn new(transaction_id: &str, amount_minor: i64, reason: &str, initiated_by: &str) -> Self {
        let now = Utc::now();
        Self {
            refund_id: format!("rfnd_{}", uuid::Uuid::new_v4().simple()),
            transaction_id: transaction_id.to_string(),
            amount_minor,
            reason: reason.to_string(),
            status: RefundStatus::Pending,
            initiated_by: initiated_by.to_string(),
            gateway_refund_reference: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// One entry of a transaction's ordered status history
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusChange {
    pub transaction_id: String,
    pub from_status: Option<TransactionStatus>,
    pub to_status: TransactionStatus,
    pub source: TransitionSource,
    pub event_id: Option<String>,
    pub note: String,
    pub changed_at: DateTime<Utc>,
}

// ============================================================================
// Listing
// ============================================================================

pub const DEFAULT_PAGE_SIZE: u32 = 20;
pub const MAX_PAGE_SIZE: u32 = 100;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TransactionFilter {
    pub status: Option<TransactionStatus>,
    pub order_id: Option<String>,
    pub user_id: Option<String>,
    pub created_from: Option<DateTime<Utc>>,
    pub created_to: Option<DateTime<Utc>>,
    pub page: Option<u32>,
    pub per_page: Option<u32>,
}

impl TransactionFilter {
    /// 1-based page number
    pub fn page(&self) -> u32 {
        self.page.unwrap_or(1).max(1)
    }

    pub fn per_page(&self) -> u32 {
        self.per_page
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .clamp(1, MAX_PAGE_SIZE)
    }

    pub fn offset(&self) -> u64 {
        (self.page() as u64 - 1) * self.per_page() as u64
    }

    pub fn matches(&self, tx: &PaymentTransaction) -> bool {
        self.status.map_or(true, |s| tx.status == s)
            && self.order_id.as_ref().map_or(true, |o| &tx.order_id == o)
            && self.user_id.as_ref().map_or(true, |u| &tx.user_id == u)
            && self.created_from.map_or(true, |from| tx.created_at >= from)
            && self.created_to.map_or(true, |to| tx.created_at <= to)
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: u32,
    pub per_page: u32,
    pub total_pages: u32,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, total: u64, page: u32, per_page: u32) -> Self {
        let total_pages = total.div_ceil(per_page.max(1) as u64) as u32;
        Self {
            items,
            total,
            page,
            per_page,
            total_pages,
        }
    }
}

// ============================================================================
// Amount helpers
// ============================================================================

/// Most integer digits a major-unit amount can have and still fit i64 paise
const MAX_MAJOR_DIGITS: i64 = 17;

/// Convert a decimal major-unit amount ("500.00") into minor units.
/// Rejects negative values and anything finer than one paisa.
///
/// The magnitude and precision are bounded from the digit count and exponent
/// before any rescaling, so inputs like `1e9000000` are refused without
/// expanding them.
pub fn to_minor_units(amount: &BigDecimal) -> Result<i64, PaymentError> {
    let out_of_range = || PaymentError::InvalidInput("amount is out of range".to_string());
    let too_precise =
        || PaymentError::InvalidInput("amount has more than two decimal places".to_string());

    let (int_val, scale) = amount.as_bigint_and_exponent();
    if amount.digits() as i64 - scale > MAX_MAJOR_DIGITS {
        return Err(out_of_range());
    }

    let amount = if scale > 2 {
        // drop trailing zeros so "500.000" is accepted
        let digits = int_val.to_string();
        let significant = digits.trim_end_matches('0');
        if significant.is_empty() || significant == "-" {
            return Err(PaymentError::InvalidInput(
                "amount must be greater than zero".to_string(),
            ));
        }
        let scale = scale - (digits.len() - significant.len()) as i64;
        if scale > 2 {
            return Err(too_precise());
        }
        BigDecimal::from_str(&format!("{}e{}", significant, -scale)).map_err(|_| out_of_range())?
    } else {
        amount.clone()
    };

    let scaled = amount * BigDecimal::from(MINOR_UNITS_PER_MAJOR);
    if scaled.with_scale(0) != scaled {
        return Err(too_precise());
    }
    let minor = scaled.to_i64().ok_or_else(out_of_range)?;
    if minor <= 0 {
        return Err(PaymentError::InvalidInput(
            "amount must be greater than zero".to_string(),
        ));
    }
    Ok(minor)
}

/// Render minor units as a major-unit decimal string
pub fn format_minor_units(amount_minor: i64) -> String {
    let sign = if amount_minor < 0 { "-" } else { "" };
    let abs = amount_minor.unsigned_abs();
    let per = MINOR_UNITS_PER_MAJOR as u64;
    format!("{}{}.{:02}", sign, abs / per, abs % per)
}
