//! UPI Payment Lifecycle Engine
//!
//! Orchestrates every status change of a payment transaction:
//! - Initiation: create the ledger record, send the collect request
//! - Webhooks: verify, deduplicate and apply gateway callbacks
//! - Status reads: return the ledger view, reconciling stale records inline
//! - Refunds: open a refund and drive it through the gateway
//!
//! All read-modify-write work on one transaction runs under that
//! transaction's lock, and every status change is committed through the
//! ledger's guarded transition so no path can skip or reverse a state.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, instrument, warn};

use crate::config::EngineConfig;
use crate::database::error::DatabaseError;
use crate::database::repository::{CommitOutcome, PaymentLedger, RefundChange, Transition};
use crate::error::{PaymentError, PaymentResult};
use crate::log_transaction;
use crate::logging::mask_vpa;
use crate::payments::gateway::{
    CollectRequest, CollectResponse, GatewayError, GatewayPaymentStatus, GatewayRefundStatus,
    GatewayResult, RefundRequest, RefundResponse, StatusQuery, UpiGateway,
};
use crate::payments::signature;
use crate::payments::types::{
    Page, PaymentTransaction, RefundRecord, RefundStatus, StatusChange, TransactionFilter,
    TransactionStatus, TransitionSource, SUPPORTED_CURRENCIES,
};
use crate::payments::vpa::validate_vpa;
use crate::payments::webhook::{payload_digest, WebhookEvent, WebhookPayload, WebhookStatus};
use crate::services::locks::TransactionLocks;

// ============================================================================
// Request / Result Types
// ============================================================================

#[derive(Debug, Clone)]
pub struct InitiatePaymentRequest {
    pub order_id: String,
    pub user_id: String,
    pub payer_vpa: String,
    pub amount_minor: i64,
    pub currency: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PaymentInitiated {
    pub transaction_id: String,
    pub order_id: String,
    pub status: TransactionStatus,
    pub gateway_reference: Option<String>,
    pub failure_reason: Option<String>,
}

impl From<&PaymentTransaction> for PaymentInitiated {
    fn from(tx: &PaymentTransaction) -> Self {
        Self {
            transaction_id: tx.transaction_id.clone(),
            order_id: tx.order_id.clone(),
            status: tx.status,
            gateway_reference: tx.gateway_reference.clone(),
            failure_reason: tx.failure_reason.clone(),
        }
    }
}

/// Ledger view of one transaction
#[derive(Debug, Clone, Serialize)]
pub struct PaymentStatusView {
    pub transaction: PaymentTransaction,
    pub refunds: Vec<RefundRecord>,
    pub history: Vec<StatusChange>,
    /// The gateway was consulted while serving this read
    pub reconciled: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct WebhookOutcome {
    pub transaction_id: String,
    pub event_id: String,
    /// False for redeliveries and no-op events
    pub applied: bool,
    pub status: TransactionStatus,
}

#[derive(Debug, Clone)]
pub struct RefundCommand {
    pub transaction_id: String,
    /// Defaults to the full captured amount
    pub amount_minor: Option<i64>,
    pub reason: String,
    pub initiated_by: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RefundOutcome {
    pub refund_id: String,
    pub transaction_id: String,
    pub amount_minor: i64,
    pub refund_status: RefundStatus,
    pub transaction_status: TransactionStatus,
}

// ============================================================================
// Engine
// ============================================================================

pub struct PaymentEngine {
    ledger: Arc<dyn PaymentLedger>,
    gateway: Arc<dyn UpiGateway>,
    locks: TransactionLocks,
    config: EngineConfig,
}

impl PaymentEngine {
    pub fn new(
        ledger: Arc<dyn PaymentLedger>,
        gateway: Arc<dyn UpiGateway>,
        config: EngineConfig,
    ) -> Self {
        Self {
            ledger,
            gateway,
            locks: TransactionLocks::new(config.lock_timeout),
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ------------------------------------------------------------------------
    // Initiation
    // ------------------------------------------------------------------------

    /// Create a transaction for `order_id` and send the collect request.
    ///
    /// A gateway rejection is a normal outcome and comes back as a FAILED
    /// transaction. When the gateway stays unreachable the record is left in
    /// CREATED and `GatewayUnavailable` is returned; calling again with the
    /// same details retries the collect request for that record.
    #[instrument(skip(self, request), fields(order_id = %request.order_id))]
    pub async fn initiate_payment(
        &self,
        request: InitiatePaymentRequest,
    ) -> PaymentResult<PaymentInitiated> {
        validate_initiation(&request)?;

        if let Some(existing) = self.ledger.find_by_order(&request.order_id).await? {
            return self.resume_initiation(existing, &request).await;
        }

        let tx = PaymentTransaction::new(
            &request.order_id,
            &request.user_id,
            &request.payer_vpa,
            request.amount_minor,
            &request.currency,
        );

        // the guard must exist before the record is visible to other callers
        let guard = self.locks.acquire(&tx.transaction_id).await?;
        match self.ledger.insert_transaction(&tx).await {
            Ok(()) => {}
            Err(DatabaseError::DuplicateOrder { .. }) => {
                drop(guard);
                debug!("Concurrent initiation won the race for this order");
                let existing = self
                    .ledger
                    .find_by_order(&request.order_id)
                    .await?
                    .ok_or_else(|| PaymentError::not_found("order", &request.order_id))?;
                return self.resume_initiation(existing, &request).await;
            }
            Err(e) => return Err(e.into()),
        }

        log_transaction!(
            event = "payment_created",
            transaction_id = tx.transaction_id,
            order_id = tx.order_id,
            payer_vpa = mask_vpa(&tx.payer_vpa),
            amount_minor = tx.amount_minor,
            currency = tx.currency,
        );

        let tx = self.submit_collect(tx).await?;
        drop(guard);
        Ok(PaymentInitiated::from(&tx))
    }

    async fn resume_initiation(
        &self,
        existing: PaymentTransaction,
        request: &InitiatePaymentRequest,
    ) -> PaymentResult<PaymentInitiated> {
        let same_details = existing.user_id == request.user_id
            && existing.payer_vpa == request.payer_vpa
            && existing.amount_minor == request.amount_minor
            && existing.currency == request.currency;

        if !same_details {
            warn!(
                tx_id = %existing.transaction_id,
                "Order already has a payment transaction with different details"
            );
            return Err(PaymentError::InvalidState {
                transaction_id: existing.transaction_id,
                reason: "order already has a payment transaction with different details"
                    .to_string(),
            });
        }

        if existing.status != TransactionStatus::Created {
            debug!(
                tx_id = %existing.transaction_id,
                status = %existing.status,
                "Returning existing transaction for repeated initiation"
            );
            return Ok(PaymentInitiated::from(&existing));
        }

        let _guard = self.locks.acquire(&existing.transaction_id).await?;
        let current = self.load(&existing.transaction_id).await?;
        if current.status != TransactionStatus::Created {
            return Ok(PaymentInitiated::from(&current));
        }

        info!(tx_id = %current.transaction_id, "Retrying collect request for CREATED transaction");
        let tx = self.submit_collect(current).await?;
        Ok(PaymentInitiated::from(&tx))
    }

    async fn send_collect(&self, tx: &PaymentTransaction) -> GatewayResult<CollectResponse> {
        let request = CollectRequest {
            transaction_id: tx.transaction_id.clone(),
            order_id: tx.order_id.clone(),
            payer_vpa: tx.payer_vpa.clone(),
            amount_minor: tx.amount_minor,
            currency: tx.currency.clone(),
        };
        let gateway = self.gateway.clone();
        self.call_gateway("initiate", &tx.transaction_id, || {
            let gateway = gateway.clone();
            let request = request.clone();
            async move { gateway.initiate(request).await }
        })
        .await
    }

    async fn reject_collect(
        &self,
        tx: PaymentTransaction,
        reason: String,
        source: TransitionSource,
    ) -> PaymentResult<PaymentTransaction> {
        info!(
            tx_id = %tx.transaction_id,
            reason = %reason,
            "Gateway rejected collect request"
        );
        let transition = Transition::new(
            &tx.transaction_id,
            tx.status,
            TransactionStatus::Failed,
            source,
            "Collect request rejected by gateway",
        )
        .with_failure_reason(Some(reason));
        self.commit(transition).await
    }

    /// Send the collect request for a CREATED record. Caller holds the lock.
    async fn submit_collect(&self, tx: PaymentTransaction) -> PaymentResult<PaymentTransaction> {
        let result = self.send_collect(&tx).await;

        match result {
            Ok(response) => {
                self.apply_gateway_status(
                    tx,
                    Some(response.gateway_reference),
                    response.status,
                    TransitionSource::Initiation,
                )
                .await
            }
            Err(GatewayError::Rejected(reason)) => {
                self.reject_collect(tx, reason, TransitionSource::Initiation)
                    .await
            }
            Err(GatewayError::Transient(message)) => {
                warn!(
                    tx_id = %tx.transaction_id,
                    error = %message,
                    "Gateway unavailable, transaction left in CREATED"
                );
                Err(PaymentError::GatewayUnavailable(message))
            }
            Err(GatewayError::Unknown(message)) => {
                warn!(
                    tx_id = %tx.transaction_id,
                    error = %message,
                    "Ambiguous collect response, querying gateway status"
                );
                match self.query_and_apply(tx.clone()).await {
                    Ok(updated) => Ok(updated),
                    Err(e) => {
                        warn!(
                            tx_id = %tx.transaction_id,
                            error = %e,
                            "Status query inconclusive, leaving transaction for reconciliation"
                        );
                        Ok(tx)
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------------
    // Status
    // ------------------------------------------------------------------------

    /// Ledger view of the order's transaction. Stale non-final records are
    /// reconciled against the gateway first when nobody else is working on
    /// them; reconciliation errors never fail the read.
    #[instrument(skip(self))]
    pub async fn check_payment_status(&self, order_id: &str) -> PaymentResult<PaymentStatusView> {
        let tx = self
            .ledger
            .find_by_order(order_id)
            .await?
            .ok_or_else(|| PaymentError::not_found("order", order_id))?;

        let mut reconciled = false;
        let tx = if self.is_stale(&tx, Utc::now()) {
            match self.locks.try_acquire(&tx.transaction_id) {
                Some(_guard) => {
                    let current = self.load(&tx.transaction_id).await?;
                    match self.reconcile_locked(current.clone()).await {
                        Ok(updated) => {
                            reconciled = true;
                            updated
                        }
                        Err(e) => {
                            warn!(
                                tx_id = %tx.transaction_id,
                                error = %e,
                                "Inline reconciliation failed, returning ledger state"
                            );
                            current
                        }
                    }
                }
                None => {
                    debug!(tx_id = %tx.transaction_id, "Transaction busy, skipping inline reconciliation");
                    tx
                }
            }
        } else {
            tx
        };

        let refunds = self.ledger.find_refunds(&tx.transaction_id).await?;
        let history = self.ledger.history(&tx.transaction_id).await?;

        Ok(PaymentStatusView {
            transaction: tx,
            refunds,
            history,
            reconciled,
        })
    }

    pub async fn get_transactions(
        &self,
        filter: &TransactionFilter,
    ) -> PaymentResult<Page<PaymentTransaction>> {
        if let (Some(from), Some(to)) = (filter.created_from, filter.created_to) {
            if from > to {
                return Err(PaymentError::InvalidInput(
                    "created_from must not be after created_to".to_string(),
                ));
            }
        }
        Ok(self.ledger.list(filter).await?)
    }

    // ------------------------------------------------------------------------
    // Webhooks
    // ------------------------------------------------------------------------

    /// Apply a gateway callback. The signature is checked over the exact raw
    /// bytes before anything is parsed. Redeliveries and events naming the
    /// current status succeed with `applied = false`.
    #[instrument(skip(self, payload, signature_header), fields(payload_len = payload.len()))]
    pub async fn handle_webhook(
        &self,
        payload: &[u8],
        signature_header: &str,
    ) -> PaymentResult<WebhookOutcome> {
        if !signature::verify(payload, signature_header, &self.config.webhook_secret) {
            warn!(
                security_event = true,
                event_type = "webhook_signature_invalid",
                payload_digest = %payload_digest(payload),
                "Rejected webhook with invalid signature"
            );
            return Err(PaymentError::AuthenticationFailure);
        }

        let parsed = WebhookPayload::parse(payload)?;
        let event_id = parsed.resolve_event_id(payload);
        let located = self.locate_webhook_transaction(&parsed).await?;

        let _guard = self.locks.acquire(&located.transaction_id).await?;
        let tx = self.load(&located.transaction_id).await?;

        if self
            .ledger
            .is_event_applied(&tx.transaction_id, &event_id)
            .await?
        {
            info!(
                tx_id = %tx.transaction_id,
                event_id = %event_id,
                "Duplicate webhook delivery ignored"
            );
            return Ok(WebhookOutcome {
                transaction_id: tx.transaction_id,
                event_id,
                applied: false,
                status: tx.status,
            });
        }

        let target = parsed.status.target_status();
        if tx.status == target {
            debug!(
                tx_id = %tx.transaction_id,
                event_id = %event_id,
                status = %target,
                "Webhook reports current status, nothing to apply"
            );
            return Ok(WebhookOutcome {
                transaction_id: tx.transaction_id,
                event_id,
                applied: false,
                status: tx.status,
            });
        }

        if target == TransactionStatus::Success {
            if let Some(amount) = parsed.amount {
                if amount != tx.amount_minor {
                    error!(
                        security_event = true,
                        tx_id = %tx.transaction_id,
                        expected = tx.amount_minor,
                        received = amount,
                        "Webhook amount does not match ledger amount"
                    );
                    return Err(PaymentError::StateConflict {
                        transaction_id: tx.transaction_id,
                        reason: format!(
                            "webhook amount {} does not match transaction amount {}",
                            amount, tx.amount_minor
                        ),
                    });
                }
            }
        }

        let event = WebhookEvent::new(&event_id, &tx.transaction_id, payload, signature_header);
        let outcome = if parsed.status.is_refund_event() {
            self.apply_refund_webhook(tx, &parsed, event).await?
        } else {
            self.apply_payment_webhook(tx, &parsed, event).await?
        };

        let applied = outcome.was_applied();
        let tx = outcome.into_transaction();
        if applied {
            log_transaction!(
                event = "webhook_applied",
                transaction_id = tx.transaction_id,
                event_id = event_id,
                status = tx.status.as_str(),
            );
        } else {
            info!(tx_id = %tx.transaction_id, event_id = %event_id, "Webhook recorded concurrently elsewhere");
        }

        Ok(WebhookOutcome {
            transaction_id: tx.transaction_id,
            event_id,
            applied,
            status: tx.status,
        })
    }

    async fn locate_webhook_transaction(
        &self,
        payload: &WebhookPayload,
    ) -> PaymentResult<PaymentTransaction> {
        if let Some(reference) = &payload.gateway_reference {
            if let Some(tx) = self.ledger.find_by_gateway_reference(reference).await? {
                return Ok(tx);
            }
        }
        if let Some(transaction_id) = &payload.transaction_id {
            if let Some(tx) = self.ledger.find_by_id(transaction_id).await? {
                return Ok(tx);
            }
        }

        let reference = payload
            .gateway_reference
            .clone()
            .or_else(|| payload.transaction_id.clone())
            .unwrap_or_default();
        warn!(reference = %reference, "Webhook for unknown transaction");
        Err(PaymentError::not_found("transaction", reference))
    }

    async fn apply_payment_webhook(
        &self,
        tx: PaymentTransaction,
        payload: &WebhookPayload,
        event: WebhookEvent,
    ) -> PaymentResult<CommitOutcome> {
        let target = payload.status.target_status();
        let mut tx = tx;

        // a CREATED record whose collect response was lost still needs the
        // PENDING step before it can succeed
        if tx.status == TransactionStatus::Created && target == TransactionStatus::Success {
            let reference = payload.gateway_reference.clone().ok_or_else(|| {
                PaymentError::StateConflict {
                    transaction_id: tx.transaction_id.clone(),
                    reason: "success webhook for CREATED transaction without gateway reference"
                        .to_string(),
                }
            })?;
            let step = Transition::new(
                &tx.transaction_id,
                TransactionStatus::Created,
                TransactionStatus::Pending,
                TransitionSource::Webhook,
                "Gateway acknowledged collect request",
            )
            .with_gateway_reference(reference);
            tx = self.commit(step).await?;
        }

        self.ensure_transition(&tx, target)?;

        let note = match payload.status {
            WebhookStatus::Pending => "Gateway reported collect request pending",
            WebhookStatus::Success => "Payer approved payment",
            _ => "Gateway reported payment failure",
        };
        let mut transition = Transition::new(
            &tx.transaction_id,
            tx.status,
            target,
            TransitionSource::Webhook,
            note,
        )
        .with_event(event);
        if tx.gateway_reference.is_none() {
            if let Some(reference) = &payload.gateway_reference {
                transition = transition.with_gateway_reference(reference.clone());
            }
        }
        if target == TransactionStatus::Failed {
            transition = transition.with_failure_reason(
                payload
                    .reason
                    .clone()
                    .or_else(|| Some("Payment failed at gateway".to_string())),
            );
        }

        self.commit_outcome(transition).await
    }

    async fn apply_refund_webhook(
        &self,
        tx: PaymentTransaction,
        payload: &WebhookPayload,
        event: WebhookEvent,
    ) -> PaymentResult<CommitOutcome> {
        let target = payload.status.target_status();
        self.ensure_transition(&tx, target)?;

        let refund = self
            .active_refund(&tx.transaction_id, payload.refund_id.as_deref())
            .await?;

        let (refund_status, note) = if payload.status == WebhookStatus::Refunded {
            (RefundStatus::Succeeded, "Gateway confirmed refund")
        } else {
            (RefundStatus::Failed, "Gateway reported refund failure")
        };
        let failure_reason = match refund_status {
            RefundStatus::Failed => payload
                .reason
                .clone()
                .or_else(|| Some("Refund failed at gateway".to_string())),
            _ => None,
        };

        let transition = Transition::new(
            &tx.transaction_id,
            tx.status,
            target,
            TransitionSource::Webhook,
            note,
        )
        .with_event(event)
        .with_failure_reason(failure_reason.clone())
        .with_refund(RefundChange::Settle {
            refund_id: refund.refund_id,
            status: refund_status,
            gateway_refund_reference: payload.gateway_refund_reference.clone(),
            failure_reason,
        });

        self.commit_outcome(transition).await
    }

    /// Refuse anything the lifecycle does not allow. The refund retry edge is
    /// reserved for explicit refund requests.
    fn ensure_transition(
        &self,
        tx: &PaymentTransaction,
        target: TransactionStatus,
    ) -> PaymentResult<()> {
        let refund_retry = tx.status == TransactionStatus::RefundFailed
            && target == TransactionStatus::RefundPending;
        if tx.status.can_transition_to(&target) && !refund_retry {
            return Ok(());
        }

        error!(
            tx_id = %tx.transaction_id,
            current = %tx.status,
            requested = %target,
            "Rejected illegal status transition, needs operator review"
        );
        Err(PaymentError::StateConflict {
            transaction_id: tx.transaction_id.clone(),
            reason: format!("cannot move from {} to {}", tx.status, target),
        })
    }

    async fn active_refund(
        &self,
        transaction_id: &str,
        refund_id: Option<&str>,
    ) -> PaymentResult<RefundRecord> {
        let refunds = self.ledger.find_refunds(transaction_id).await?;
        let found = match refund_id {
            Some(id) => refunds.into_iter().find(|r| r.refund_id == id),
            None => refunds
                .into_iter()
                .rev()
                .find(|r| r.status == RefundStatus::Pending),
        };

        match found {
            Some(refund) if refund.status == RefundStatus::Pending => Ok(refund),
            Some(refund) => Err(PaymentError::StateConflict {
                transaction_id: transaction_id.to_string(),
                reason: format!("refund {} is already {}", refund.refund_id, refund.status),
            }),
            None => Err(PaymentError::not_found(
                "refund",
                refund_id.unwrap_or(transaction_id),
            )),
        }
    }

    // ------------------------------------------------------------------------
    // Refunds
    // ------------------------------------------------------------------------

    /// Open a refund on a captured payment and send it to the gateway.
    ///
    /// The transaction moves to REFUND_PENDING before the gateway is called.
    /// A gateway refusal settles the refund as failed; an unreachable gateway
    /// leaves it pending for reconciliation, which re-sends the same refund id.
    #[instrument(skip(self, command), fields(tx_id = %command.transaction_id))]
    pub async fn initiate_refund(&self, command: RefundCommand) -> PaymentResult<RefundOutcome> {
        if command.reason.trim().is_empty() {
            return Err(PaymentError::InvalidInput(
                "refund reason is required".to_string(),
            ));
        }
        if command.initiated_by.trim().is_empty() {
            return Err(PaymentError::InvalidInput(
                "refund initiator is required".to_string(),
            ));
        }

        // surface NotFound without waiting on the lock
        self.load(&command.transaction_id).await?;

        let _guard = self.locks.acquire(&command.transaction_id).await?;
        let tx = self.load(&command.transaction_id).await?;

        if !tx.status.is_refund_eligible() {
            return Err(PaymentError::InvalidState {
                transaction_id: tx.transaction_id,
                reason: format!("transaction in status {} cannot be refunded", tx.status),
            });
        }

        let amount = command.amount_minor.unwrap_or(tx.amount_minor);
        if amount <= 0 || amount > tx.amount_minor {
            return Err(PaymentError::InvalidInput(format!(
                "refund amount must be between 1 and {} minor units",
                tx.amount_minor
            )));
        }

        let gateway_reference =
            tx.gateway_reference
                .clone()
                .ok_or_else(|| PaymentError::InvalidState {
                    transaction_id: tx.transaction_id.clone(),
                    reason: "transaction has no gateway reference".to_string(),
                })?;

        let refund = RefundRecord::new(
            &tx.transaction_id,
            amount,
            command.reason.trim(),
            &command.initiated_by,
        );
        let transition = Transition::new(
            &tx.transaction_id,
            tx.status,
            TransactionStatus::RefundPending,
            TransitionSource::Refund,
            format!("Refund requested: {}", refund.reason),
        )
        .with_refund(RefundChange::Open(refund.clone()));
        let tx = self.commit(transition).await?;

        log_transaction!(
            event = "refund_initiated",
            transaction_id = tx.transaction_id,
            refund_id = refund.refund_id,
            amount_minor = refund.amount_minor,
            initiated_by = refund.initiated_by,
        );

        let response = self.send_refund(&tx, &refund, &gateway_reference).await;
        let (tx, refund_status) = self.settle_refund(tx, &refund, response).await?;

        Ok(RefundOutcome {
            refund_id: refund.refund_id,
            transaction_id: tx.transaction_id,
            amount_minor: refund.amount_minor,
            refund_status,
            transaction_status: tx.status,
        })
    }

    async fn send_refund(
        &self,
        tx: &PaymentTransaction,
        refund: &RefundRecord,
        gateway_reference: &str,
    ) -> GatewayResult<RefundResponse> {
        let request = RefundRequest {
            refund_id: refund.refund_id.clone(),
            transaction_id: tx.transaction_id.clone(),
            gateway_reference: gateway_reference.to_string(),
            amount_minor: refund.amount_minor,
            currency: tx.currency.clone(),
            reason: refund.reason.clone(),
        };
        let gateway = self.gateway.clone();
        self.call_gateway("refund", &tx.transaction_id, || {
            let gateway = gateway.clone();
            let request = request.clone();
            async move { gateway.refund(request).await }
        })
        .await
    }

    /// Record the gateway's answer to a refund. Caller holds the lock.
    async fn settle_refund(
        &self,
        tx: PaymentTransaction,
        refund: &RefundRecord,
        response: GatewayResult<RefundResponse>,
    ) -> PaymentResult<(PaymentTransaction, RefundStatus)> {
        let (status, reference, reason) = match response {
            Ok(RefundResponse {
                gateway_refund_reference,
                status: GatewayRefundStatus::Succeeded,
            }) => (RefundStatus::Succeeded, gateway_refund_reference, None),
            Ok(RefundResponse {
                gateway_refund_reference,
                status: GatewayRefundStatus::Failed { reason },
            }) => (
                RefundStatus::Failed,
                gateway_refund_reference,
                Some(reason.unwrap_or_else(|| "Refund failed at gateway".to_string())),
            ),
            Err(GatewayError::Rejected(reason)) => (RefundStatus::Failed, None, Some(reason)),
            Ok(RefundResponse {
                gateway_refund_reference,
                status: GatewayRefundStatus::Pending,
            }) => {
                if let Some(reference) = gateway_refund_reference {
                    self.ledger
                        .set_refund_reference(&refund.refund_id, &reference)
                        .await?;
                }
                info!(tx_id = %tx.transaction_id, refund_id = %refund.refund_id, "Refund accepted, awaiting settlement");
                return Ok((tx, RefundStatus::Pending));
            }
            Err(e) => {
                warn!(
                    tx_id = %tx.transaction_id,
                    refund_id = %refund.refund_id,
                    error = %e,
                    "Refund outcome unknown, left pending for reconciliation"
                );
                return Ok((tx, RefundStatus::Pending));
            }
        };

        let (target, note) = match status {
            RefundStatus::Succeeded => (TransactionStatus::Refunded, "Refund completed"),
            _ => (TransactionStatus::RefundFailed, "Refund failed"),
        };
        let transition = Transition::new(
            &tx.transaction_id,
            tx.status,
            target,
            TransitionSource::Refund,
            note,
        )
        .with_failure_reason(reason.clone())
        .with_refund(RefundChange::Settle {
            refund_id: refund.refund_id.clone(),
            status,
            gateway_refund_reference: reference,
            failure_reason: reason,
        });
        let tx = self.commit(transition).await?;

        log_transaction!(
            event = "refund_settled",
            transaction_id = tx.transaction_id,
            refund_id = refund.refund_id,
            refund_status = status.as_str(),
        );
        Ok((tx, status))
    }

    // ------------------------------------------------------------------------
    // Reconciliation
    // ------------------------------------------------------------------------

    /// Resolve a non-final transaction against the gateway
    #[instrument(skip(self))]
    pub async fn reconcile_transaction(
        &self,
        transaction_id: &str,
    ) -> PaymentResult<PaymentTransaction> {
        let _guard = self.locks.acquire(transaction_id).await?;
        let tx = self.load(transaction_id).await?;
        self.reconcile_locked(tx).await
    }

    /// Non-final transactions untouched for longer than `older_than`
    pub async fn stale_transactions(
        &self,
        older_than: Duration,
        limit: i64,
    ) -> PaymentResult<Vec<PaymentTransaction>> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(older_than)
                .unwrap_or_else(|_| chrono::Duration::seconds(60));
        let statuses = [
            TransactionStatus::Created,
            TransactionStatus::Pending,
            TransactionStatus::RefundPending,
        ];
        Ok(self.ledger.find_stale(&statuses, cutoff, limit).await?)
    }

    async fn reconcile_locked(&self, tx: PaymentTransaction) -> PaymentResult<PaymentTransaction> {
        match tx.status {
            TransactionStatus::Created | TransactionStatus::Pending => {
                self.query_and_apply(tx).await
            }
            TransactionStatus::RefundPending => self.resume_refund(tx).await,
            _ => Ok(tx),
        }
    }

    async fn query_and_apply(&self, tx: PaymentTransaction) -> PaymentResult<PaymentTransaction> {
        let query = StatusQuery {
            transaction_id: tx.transaction_id.clone(),
            gateway_reference: tx.gateway_reference.clone(),
        };
        let gateway = self.gateway.clone();
        let result = self
            .call_gateway("query_status", &tx.transaction_id, || {
                let gateway = gateway.clone();
                let query = query.clone();
                async move { gateway.query_status(query).await }
            })
            .await;

        match result {
            Ok(response) => {
                self.apply_gateway_status(
                    tx,
                    response.gateway_reference,
                    response.status,
                    TransitionSource::Reconciliation,
                )
                .await
            }
            // the gateway never registered the collect request
            Err(GatewayError::Rejected(reason)) if tx.status == TransactionStatus::Created => {
                info!(
                    tx_id = %tx.transaction_id,
                    reason = %reason,
                    "Gateway has no record of collect request, resubmitting"
                );
                self.resubmit_collect(tx).await
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn resubmit_collect(&self, tx: PaymentTransaction) -> PaymentResult<PaymentTransaction> {
        match self.send_collect(&tx).await {
            Ok(response) => {
                self.apply_gateway_status(
                    tx,
                    Some(response.gateway_reference),
                    response.status,
                    TransitionSource::Reconciliation,
                )
                .await
            }
            Err(GatewayError::Rejected(reason)) => {
                self.reject_collect(tx, reason, TransitionSource::Reconciliation)
                    .await
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Re-send the pending refund. The refund id is the gateway idempotency
    /// key so this never refunds twice.
    async fn resume_refund(&self, tx: PaymentTransaction) -> PaymentResult<PaymentTransaction> {
        let refund = self.active_refund(&tx.transaction_id, None).await?;
        let gateway_reference =
            tx.gateway_reference
                .clone()
                .ok_or_else(|| PaymentError::InvalidState {
                    transaction_id: tx.transaction_id.clone(),
                    reason: "transaction has no gateway reference".to_string(),
                })?;

        let response = self.send_refund(&tx, &refund, &gateway_reference).await;
        let (tx, _) = self.settle_refund(tx, &refund, response).await?;
        Ok(tx)
    }

    /// Move a CREATED or PENDING record to what the gateway reports
    async fn apply_gateway_status(
        &self,
        tx: PaymentTransaction,
        gateway_reference: Option<String>,
        status: GatewayPaymentStatus,
        source: TransitionSource,
    ) -> PaymentResult<PaymentTransaction> {
        let (target, failure_reason) = match status {
            GatewayPaymentStatus::Pending => (TransactionStatus::Pending, None),
            GatewayPaymentStatus::Success => (TransactionStatus::Success, None),
            GatewayPaymentStatus::Failed { reason } => (
                TransactionStatus::Failed,
                Some(reason.unwrap_or_else(|| "Payment failed at gateway".to_string())),
            ),
        };

        if tx.status == target {
            return Ok(tx);
        }

        let mut tx = tx;
        if tx.status == TransactionStatus::Created && target != TransactionStatus::Failed {
            let Some(reference) = gateway_reference.clone() else {
                warn!(
                    tx_id = %tx.transaction_id,
                    "Gateway reported progress without a reference, leaving CREATED"
                );
                return Ok(tx);
            };
            let step = Transition::new(
                &tx.transaction_id,
                TransactionStatus::Created,
                TransactionStatus::Pending,
                source,
                "Gateway acknowledged collect request",
            )
            .with_gateway_reference(reference);
            tx = self.commit(step).await?;
            if target == TransactionStatus::Pending {
                return Ok(tx);
            }
        }

        self.ensure_transition(&tx, target)?;

        let note = match target {
            TransactionStatus::Success => "Gateway reported payment success",
            _ => "Gateway reported payment failure",
        };
        let mut transition = Transition::new(&tx.transaction_id, tx.status, target, source, note)
            .with_failure_reason(failure_reason);
        if tx.gateway_reference.is_none() {
            if let Some(reference) = gateway_reference {
                transition = transition.with_gateway_reference(reference);
            }
        }
        let tx = self.commit(transition).await?;

        log_transaction!(
            event = "payment_status_changed",
            transaction_id = tx.transaction_id,
            status = tx.status.as_str(),
            source = source.as_str(),
        );
        Ok(tx)
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    async fn load(&self, transaction_id: &str) -> PaymentResult<PaymentTransaction> {
        self.ledger
            .find_by_id(transaction_id)
            .await?
            .ok_or_else(|| PaymentError::not_found("transaction", transaction_id))
    }

    fn is_stale(&self, tx: &PaymentTransaction, now: DateTime<Utc>) -> bool {
        if !tx.status.needs_reconciliation() {
            return false;
        }
        let threshold = chrono::Duration::from_std(self.config.staleness_threshold)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
        now - tx.updated_at > threshold
    }

    async fn commit(&self, transition: Transition) -> PaymentResult<PaymentTransaction> {
        Ok(self.commit_outcome(transition).await?.into_transaction())
    }

    async fn commit_outcome(&self, transition: Transition) -> PaymentResult<CommitOutcome> {
        let transaction_id = transition.transaction_id.clone();
        self.ledger
            .commit_transition(transition)
            .await
            .map_err(|e| match e {
                DatabaseError::StaleState {
                    expected, actual, ..
                } => PaymentError::StateConflict {
                    transaction_id,
                    reason: format!(
                        "status changed concurrently (expected {}, found {})",
                        expected, actual
                    ),
                },
                DatabaseError::GatewayReferenceAlreadySet { .. } => PaymentError::StateConflict {
                    transaction_id,
                    reason: "gateway reference conflicts with the recorded one".to_string(),
                },
                DatabaseError::ActiveRefundExists { .. } => PaymentError::InvalidState {
                    transaction_id,
                    reason: "a refund is already in progress".to_string(),
                },
                other => PaymentError::Ledger(other),
            })
    }

    /// Run a gateway call with a per-attempt timeout, retrying transient
    /// failures with backoff. A timed out attempt counts as transient.
    async fn call_gateway<T, F, Fut>(
        &self,
        operation: &'static str,
        transaction_id: &str,
        mut call: F,
    ) -> GatewayResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = GatewayResult<T>>,
    {
        let mut retry_count = 0;

        loop {
            let result = match timeout(self.config.gateway_call_timeout, call()).await {
                Ok(result) => result,
                Err(_) => Err(GatewayError::Transient(format!(
                    "{} timed out after {}ms",
                    operation,
                    self.config.gateway_call_timeout.as_millis()
                ))),
            };

            match result {
                Err(GatewayError::Transient(message))
                    if retry_count < self.config.gateway_max_retries =>
                {
                    let backoff = self.config.backoff_for(retry_count);
                    warn!(
                        tx_id = %transaction_id,
                        operation = operation,
                        retry = retry_count + 1,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %message,
                        "Transient gateway error, retrying"
                    );
                    sleep(backoff).await;
                    retry_count += 1;
                }
                Err(GatewayError::Transient(message)) => {
                    error!(
                        tx_id = %transaction_id,
                        operation = operation,
                        retries = retry_count,
                        "Max retries exceeded for gateway call"
                    );
                    return Err(GatewayError::Transient(message));
                }
                other => return other,
            }
        }
    }
}

fn validate_initiation(request: &InitiatePaymentRequest) -> PaymentResult<()> {
    if request.order_id.trim().is_empty() {
        return Err(PaymentError::InvalidInput("order_id is required".to_string()));
    }
    if request.user_id.trim().is_empty() {
        return Err(PaymentError::InvalidInput("user_id is required".to_string()));
    }
    if !validate_vpa(&request.payer_vpa) {
        return Err(PaymentError::InvalidInput(format!(
            "invalid VPA '{}'",
            mask_vpa(&request.payer_vpa)
        )));
    }
    if request.amount_minor <= 0 {
        return Err(PaymentError::InvalidInput(
            "amount must be greater than zero".to_string(),
        ));
    }
    if !SUPPORTED_CURRENCIES.contains(&request.currency.as_str()) {
        return Err(PaymentError::InvalidInput(format!(
            "unsupported currency '{}'",
            request.currency
        )));
    }
    Ok(())
}
