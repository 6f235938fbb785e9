//! Payment ledger repository interface
//!
//! The engine only talks to storage through [`PaymentLedger`]. Every status
//! change goes through [`PaymentLedger::commit_transition`], which applies the
//! new status, the history entry, the webhook dedupe record and any refund
//! change as one atomic unit.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::database::error::DatabaseResult;
use crate::payments::types::{
    Page, PaymentTransaction, RefundRecord, RefundStatus, StatusChange, TransactionFilter,
    TransactionStatus, TransitionSource,
};
use crate::payments::webhook::WebhookEvent;

/// Refund-side effect committed together with a status change
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefundChange {
    /// Open a new PENDING refund
    Open(RefundRecord),
    /// Settle an existing refund
    Settle {
        refund_id: String,
        status: RefundStatus,
        gateway_refund_reference: Option<String>,
        failure_reason: Option<String>,
    },
}

/// A single guarded status change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub transaction_id: String,
    /// Status the caller observed; the commit fails if it moved
    pub from: TransactionStatus,
    pub to: TransactionStatus,
    pub source: TransitionSource,
    pub note: String,
    /// Set once; a different value on an already-referenced row is refused
    pub gateway_reference: Option<String>,
    pub failure_reason: Option<String>,
    /// Dedupe record committed with the change
    pub event: Option<WebhookEvent>,
    pub refund: Option<RefundChange>,
}

impl Transition {
    pub fn new(
        transaction_id: &str,
        from: TransactionStatus,
        to: TransactionStatus,
        source: TransitionSource,
        note: impl Into<String>,
    ) -> Self {
        Self {
            transaction_id: transaction_id.to_string(),
            from,
            to,
            source,
            note: note.into(),
            gateway_reference: None,
            failure_reason: None,
            event: None,
            refund: None,
        }
    }

    pub fn with_gateway_reference(mut self, reference: impl Into<String>) -> Self {
        self.gateway_reference = Some(reference.into());
        self
    }

    pub fn with_failure_reason(mut self, reason: Option<String>) -> Self {
        self.failure_reason = reason;
        self
    }

    pub fn with_event(mut self, event: WebhookEvent) -> Self {
        self.event = Some(event);
        self
    }

    pub fn with_refund(mut self, change: RefundChange) -> Self {
        self.refund = Some(change);
        self
    }

    pub(crate) fn history_entry(&self, changed_at: DateTime<Utc>) -> StatusChange {
        StatusChange {
            transaction_id: self.transaction_id.clone(),
            from_status: Some(self.from),
            to_status: self.to,
            source: self.source,
            event_id: self.event.as_ref().map(|e| e.event_id.clone()),
            note: self.note.clone(),
            changed_at,
        }
    }
}

/// Result of a commit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    Applied(PaymentTransaction),
    /// The event id was already recorded; nothing changed
    DuplicateEvent(PaymentTransaction),
}

impl CommitOutcome {
    pub fn transaction(&self) -> &PaymentTransaction {
        match self {
            CommitOutcome::Applied(tx) | CommitOutcome::DuplicateEvent(tx) => tx,
        }
    }

    pub fn into_transaction(self) -> PaymentTransaction {
        match self {
            CommitOutcome::Applied(tx) | CommitOutcome::DuplicateEvent(tx) => tx,
        }
    }

    pub fn was_applied(&self) -> bool {
        matches!(self, CommitOutcome::Applied(_))
    }
}

#[async_trait]
pub trait PaymentLedger: Send + Sync {
    /// Persist a new CREATED transaction. Fails with `DuplicateOrder` when the
    /// order already has one.
    async fn insert_transaction(&self, tx: &PaymentTransaction) -> DatabaseResult<()>;

    async fn find_by_id(&self, transaction_id: &str) -> DatabaseResult<Option<PaymentTransaction>>;

    async fn find_by_order(&self, order_id: &str) -> DatabaseResult<Option<PaymentTransaction>>;

    async fn find_by_gateway_reference(
        &self,
        gateway_reference: &str,
    ) -> DatabaseResult<Option<PaymentTransaction>>;

    async fn commit_transition(&self, transition: Transition) -> DatabaseResult<CommitOutcome>;

    async fn is_event_applied(&self, transaction_id: &str, event_id: &str) -> DatabaseResult<bool>;

    async fn set_refund_reference(
        &self,
        refund_id: &str,
        gateway_refund_reference: &str,
    ) -> DatabaseResult<()>;

    async fn find_refund(&self, refund_id: &str) -> DatabaseResult<Option<RefundRecord>>;

    /// Refunds of a transaction, oldest first
    async fn find_refunds(&self, transaction_id: &str) -> DatabaseResult<Vec<RefundRecord>>;

    /// Status history of a transaction, oldest first
    async fn history(&self, transaction_id: &str) -> DatabaseResult<Vec<StatusChange>>;

    async fn list(&self, filter: &TransactionFilter) -> DatabaseResult<Page<PaymentTransaction>>;

    /// Transactions in `statuses` not updated since `updated_before`, oldest first
    async fn find_stale(
        &self,
        statuses: &[TransactionStatus],
        updated_before: DateTime<Utc>,
        limit: i64,
    ) -> DatabaseResult<Vec<PaymentTransaction>>;
}
