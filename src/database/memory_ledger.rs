//! In-memory payment ledger
//!
//! Same guarantees as the Postgres ledger within one process: every commit
//! happens under a single write guard, so the dedupe record and the state
//! change it guards can never be observed apart.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;

use crate::database::error::{DatabaseError, DatabaseResult};
use crate::database::repository::{CommitOutcome, PaymentLedger, RefundChange, Transition};
use crate::payments::types::{
    Page, PaymentTransaction, RefundRecord, StatusChange, TransactionFilter, TransactionStatus,
    TransitionSource,
};
use crate::payments::webhook::WebhookEvent;

#[derive(Default)]
struct LedgerState {
    transactions: HashMap<String, PaymentTransaction>,
    by_order: HashMap<String, String>,
    by_gateway_reference: HashMap<String, String>,
    history: HashMap<String, Vec<StatusChange>>,
    /// keyed by (transaction_id, event_id)
    events: HashMap<(String, String), WebhookEvent>,
    refunds: HashMap<String, RefundRecord>,
    refunds_by_transaction: HashMap<String, Vec<String>>,
}

#[derive(Default)]
pub struct InMemoryLedger {
    state: RwLock<LedgerState>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of recorded webhook events for a transaction
    pub async fn event_count(&self, transaction_id: &str) -> usize {
        let state = self.state.read().await;
        state
            .events
            .keys()
            .filter(|(tx_id, _)| tx_id == transaction_id)
            .count()
    }

    /// Backdate `updated_at`, used to exercise staleness handling
    pub async fn set_updated_at(&self, transaction_id: &str, updated_at: DateTime<Utc>) {
        let mut state = self.state.write().await;
        if let Some(tx) = state.transactions.get_mut(transaction_id) {
            tx.updated_at = updated_at;
        }
    }
}

impl LedgerState {
    fn apply(&mut self, transition: Transition) -> DatabaseResult<CommitOutcome> {
        let tx_id = transition.transaction_id.clone();
        let current = self
            .transactions
            .get(&tx_id)
            .cloned()
            .ok_or_else(|| DatabaseError::TransactionNotFound {
                transaction_id: tx_id.clone(),
            })?;

        if let Some(event) = &transition.event {
            if self
                .events
                .contains_key(&(tx_id.clone(), event.event_id.clone()))
            {
                return Ok(CommitOutcome::DuplicateEvent(current));
            }
        }

        if current.status != transition.from {
            return Err(DatabaseError::StaleState {
                transaction_id: tx_id,
                expected: transition.from,
                actual: current.status,
            });
        }

        if let Some(reference) = &transition.gateway_reference {
            match &current.gateway_reference {
                Some(existing) if existing != reference => {
                    return Err(DatabaseError::GatewayReferenceAlreadySet {
                        transaction_id: tx_id,
                    });
                }
                _ => {}
            }
            if let Some(owner) = self.by_gateway_reference.get(reference) {
                if owner != &tx_id {
                    return Err(DatabaseError::GatewayReferenceAlreadySet {
                        transaction_id: owner.clone(),
                    });
                }
            }
        }

        // validate the refund side before mutating anything
        match &transition.refund {
            Some(RefundChange::Open(_)) => {
                let has_active = self
                    .refunds_by_transaction
                    .get(&tx_id)
                    .into_iter()
                    .flatten()
                    .filter_map(|id| self.refunds.get(id))
                    .any(|r| r.status.is_active());
                if has_active {
                    return Err(DatabaseError::ActiveRefundExists {
                        transaction_id: tx_id,
                    });
                }
            }
            Some(RefundChange::Settle { refund_id, .. }) => {
                if !self.refunds.contains_key(refund_id) {
                    return Err(DatabaseError::RefundNotFound {
                        refund_id: refund_id.clone(),
                    });
                }
            }
            None => {}
        }

        let now = Utc::now();
        self.history
            .entry(tx_id.clone())
            .or_default()
            .push(transition.history_entry(now));

        let mut updated = current;
        updated.status = transition.to;
        updated.updated_at = now;
        if updated.gateway_reference.is_none() {
            if let Some(reference) = transition.gateway_reference {
                self.by_gateway_reference
                    .insert(reference.clone(), tx_id.clone());
                updated.gateway_reference = Some(reference);
            }
        }
        if transition.failure_reason.is_some() {
            updated.failure_reason = transition.failure_reason;
        }
        self.transactions.insert(tx_id.clone(), updated.clone());

        if let Some(event) = transition.event {
            self.events
                .insert((tx_id.clone(), event.event_id.clone()), event);
        }

        match transition.refund {
            Some(RefundChange::Open(refund)) => {
                self.refunds_by_transaction
                    .entry(tx_id)
                    .or_default()
                    .push(refund.refund_id.clone());
                self.refunds.insert(refund.refund_id.clone(), refund);
            }
            Some(RefundChange::Settle {
                refund_id,
                status,
                gateway_refund_reference,
                failure_reason,
            }) => {
                if let Some(refund) = self.refunds.get_mut(&refund_id) {
                    refund.status = status;
                    refund.updated_at = now;
                    if refund.gateway_refund_reference.is_none() {
                        refund.gateway_refund_reference = gateway_refund_reference;
                    }
                    if failure_reason.is_some() {
                        refund.failure_reason = failure_reason;
                    }
                }
            }
            None => {}
        }

        Ok(CommitOutcome::Applied(updated))
    }
}

#[async_trait]
impl PaymentLedger for InMemoryLedger {
    async fn insert_transaction(&self, tx: &PaymentTransaction) -> DatabaseResult<()> {
        let mut state = self.state.write().await;
        if state.by_order.contains_key(&tx.order_id) {
            return Err(DatabaseError::DuplicateOrder {
                order_id: tx.order_id.clone(),
            });
        }
        state
            .by_order
            .insert(tx.order_id.clone(), tx.transaction_id.clone());
        if let Some(reference) = &tx.gateway_reference {
            state
                .by_gateway_reference
                .insert(reference.clone(), tx.transaction_id.clone());
        }
        state.history.insert(
            tx.transaction_id.clone(),
            vec![StatusChange {
                transaction_id: tx.transaction_id.clone(),
                from_status: None,
                to_status: tx.status,
                source: TransitionSource::Initiation,
                event_id: None,
                note: "Transaction created".to_string(),
                changed_at: tx.created_at,
            }],
        );
        state
            .transactions
            .insert(tx.transaction_id.clone(), tx.clone());
        Ok(())
    }

    async fn find_by_id(&self, transaction_id: &str) -> DatabaseResult<Option<PaymentTransaction>> {
        let state = self.state.read().await;
        Ok(state.transactions.get(transaction_id).cloned())
    }

    async fn find_by_order(&self, order_id: &str) -> DatabaseResult<Option<PaymentTransaction>> {
        let state = self.state.read().await;
        Ok(state
            .by_order
            .get(order_id)
            .and_then(|id| state.transactions.get(id))
            .cloned())
    }

    async fn find_by_gateway_reference(
        &self,
        gateway_reference: &str,
    ) -> DatabaseResult<Option<PaymentTransaction>> {
        let state = self.state.read().await;
        Ok(state
            .by_gateway_reference
            .get(gateway_reference)
            .and_then(|id| state.transactions.get(id))
            .cloned())
    }

    async fn commit_transition(&self, transition: Transition) -> DatabaseResult<CommitOutcome> {
        let mut state = self.state.write().await;
        state.apply(transition)
    }

    async fn is_event_applied(&self, transaction_id: &str, event_id: &str) -> DatabaseResult<bool> {
        let state = self.state.read().await;
        Ok(state
            .events
            .contains_key(&(transaction_id.to_string(), event_id.to_string())))
    }

    async fn set_refund_reference(
        &self,
        refund_id: &str,
        gateway_refund_reference: &str,
    ) -> DatabaseResult<()> {
        let mut state = self.state.write().await;
        let refund = state
            .refunds
            .get_mut(refund_id)
            .ok_or_else(|| DatabaseError::RefundNotFound {
                refund_id: refund_id.to_string(),
            })?;
        if refund.gateway_refund_reference.is_none() {
            refund.gateway_refund_reference = Some(gateway_refund_reference.to_string());
            refund.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn find_refund(&self, refund_id: &str) -> DatabaseResult<Option<RefundRecord>> {
        let state = self.state.read().await;
        Ok(state.refunds.get(refund_id).cloned())
    }

    async fn find_refunds(&self, transaction_id: &str) -> DatabaseResult<Vec<RefundRecord>> {
        let state = self.state.read().await;
        Ok(state
            .refunds_by_transaction
            .get(transaction_id)
            .into_iter()
            .flatten()
            .filter_map(|id| state.refunds.get(id).cloned())
            .collect())
    }

    async fn history(&self, transaction_id: &str) -> DatabaseResult<Vec<StatusChange>> {
        let state = self.state.read().await;
        Ok(state
            .history
            .get(transaction_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn list(&self, filter: &TransactionFilter) -> DatabaseResult<Page<PaymentTransaction>> {
        let state = self.state.read().await;
        let mut matching: Vec<&PaymentTransaction> = state
            .transactions
            .values()
            .filter(|tx| filter.matches(tx))
            .collect();
        // newest first, id as tie-breaker for a stable order
        matching.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.transaction_id.cmp(&b.transaction_id))
        });

        let total = matching.len() as u64;
        let items = matching
            .into_iter()
            .skip(filter.offset() as usize)
            .take(filter.per_page() as usize)
            .cloned()
            .collect();
        Ok(Page::new(items, total, filter.page(), filter.per_page()))
    }

    async fn find_stale(
        &self,
        statuses: &[TransactionStatus],
        updated_before: DateTime<Utc>,
        limit: i64,
    ) -> DatabaseResult<Vec<PaymentTransaction>> {
        let wanted: HashSet<TransactionStatus> = statuses.iter().copied().collect();
        let state = self.state.read().await;
        let mut stale: Vec<PaymentTransaction> = state
            .transactions
            .values()
            .filter(|tx| wanted.contains(&tx.status) && tx.updated_at < updated_before)
            .cloned()
            .collect();
        stale.sort_by_key(|tx| tx.updated_at);
        stale.truncate(limit.max(0) as usize);
        Ok(stale)
    }
}
