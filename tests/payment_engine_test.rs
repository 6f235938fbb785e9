//! Integration tests for the payment lifecycle engine
//!
//! Tests cover:
//! - Initiation outcomes (accepted, rejected, unreachable, ambiguous)
//! - Webhook authentication, idempotence and monotonic status
//! - Concurrent duplicate deliveries
//! - Refund eligibility, settlement and retry
//! - Reconciliation of stale transactions

mod common;

#[cfg(test)]
mod tests {
    use super::common::*;
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use upi_payments_backend::database::{InMemoryLedger, PaymentLedger};
    use upi_payments_backend::error::PaymentError;
    use upi_payments_backend::payments::gateway::{
        CollectRequest, CollectResponse, GatewayError, GatewayPaymentStatus, GatewayRefundStatus,
        GatewayResult, RefundRequest, RefundResponse, StatusQuery, StatusResponse, UpiGateway,
    };
    use upi_payments_backend::payments::types::{
        RefundStatus, TransactionFilter, TransactionStatus, TransitionSource,
    };
    use upi_payments_backend::services::{PaymentEngine, RefundCommand};
    use upi_payments_backend::workers::reconciliation::{
        ReconciliationConfig, ReconciliationWorker,
    };

    fn success_webhook(event_id: &str, reference: &str) -> String {
        format!(
            r#"{{"event_id":"{}","gateway_reference":"{}","status":"SUCCESS","amount":50000}}"#,
            event_id, reference
        )
    }

    fn refund_command(transaction_id: &str) -> RefundCommand {
        RefundCommand {
            transaction_id: transaction_id.to_string(),
            amount_minor: None,
            reason: "customer request".to_string(),
            initiated_by: "ops@merchant".to_string(),
        }
    }

    /// Gateway that never answers within the engine's call timeout
    #[derive(Default)]
    struct StalledGateway {
        calls: AtomicUsize,
    }

    impl StalledGateway {
        async fn stall<T: Send>(&self) -> GatewayResult<T> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(30)).await;
            Err(GatewayError::Rejected("answered too late".to_string()))
        }
    }

    #[async_trait]
    impl UpiGateway for StalledGateway {
        async fn initiate(&self, _request: CollectRequest) -> GatewayResult<CollectResponse> {
            self.stall().await
        }

        async fn query_status(&self, _query: StatusQuery) -> GatewayResult<StatusResponse> {
            self.stall().await
        }

        async fn refund(&self, _request: RefundRequest) -> GatewayResult<RefundResponse> {
            self.stall().await
        }
    }

    /// Initiate `order_id` and confirm it through a SUCCESS webhook
    async fn paid_transaction(h: &Harness, order_id: &str, reference: &str) -> String {
        h.gateway.push_initiate(accept(reference));
        let initiated = h
            .engine
            .initiate_payment(payment_request(order_id))
            .await
            .unwrap();
        let (body, signature) = signed(&success_webhook(&format!("evt_{}", order_id), reference));
        let outcome = h.engine.handle_webhook(&body, &signature).await.unwrap();
        assert_eq!(outcome.status, TransactionStatus::Success);
        initiated.transaction_id
    }

    // ------------------------------------------------------------------------
    // Initiation
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_accepted_collect_request_moves_to_pending() {
        let h = harness();
        h.gateway.push_initiate(accept("GW123"));

        let result = h.engine.initiate_payment(payment_request("O1")).await.unwrap();

        assert_eq!(result.status, TransactionStatus::Pending);
        assert_eq!(result.gateway_reference.as_deref(), Some("GW123"));
        assert!(result.transaction_id.starts_with("upi_"));

        let history = h.ledger.history(&result.transaction_id).await.unwrap();
        let statuses: Vec<_> = history.iter().map(|c| c.to_status).collect();
        assert_eq!(
            statuses,
            vec![TransactionStatus::Created, TransactionStatus::Pending]
        );
        assert_eq!(history[1].source, TransitionSource::Initiation);
    }

    #[tokio::test]
    async fn test_repeated_initiation_returns_existing_transaction() {
        let h = harness();
        h.gateway.push_initiate(accept("GW123"));

        let first = h.engine.initiate_payment(payment_request("O1")).await.unwrap();
        let second = h.engine.initiate_payment(payment_request("O1")).await.unwrap();

        assert_eq!(first.transaction_id, second.transaction_id);
        assert_eq!(second.status, TransactionStatus::Pending);
        assert_eq!(h.gateway.initiate_count(), 1);
    }

    #[tokio::test]
    async fn test_initiation_with_different_details_for_same_order_is_refused() {
        let h = harness();
        h.engine.initiate_payment(payment_request("O1")).await.unwrap();

        let mut other = payment_request("O1");
        other.amount_minor = 10_000;
        let err = h.engine.initiate_payment(other).await.unwrap_err();
        assert!(matches!(err, PaymentError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn test_invalid_vpa_is_rejected_before_any_record_exists() {
        let h = harness();
        let mut request = payment_request("O1");
        request.payer_vpa = "alice@".to_string();

        let err = h.engine.initiate_payment(request).await.unwrap_err();
        assert!(matches!(err, PaymentError::InvalidInput(_)));
        assert!(h.ledger.find_by_order("O1").await.unwrap().is_none());
        assert_eq!(h.gateway.initiate_count(), 0);
    }

    #[tokio::test]
    async fn test_gateway_rejection_fails_transaction() {
        let h = harness();
        h.gateway
            .push_initiate(Err(GatewayError::Rejected("U16: risk threshold".to_string())));

        let result = h.engine.initiate_payment(payment_request("O1")).await.unwrap();

        assert_eq!(result.status, TransactionStatus::Failed);
        assert_eq!(result.failure_reason.as_deref(), Some("U16: risk threshold"));
        assert_eq!(h.gateway.initiate_count(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_gateway_leaves_transaction_created() {
        let h = harness();
        for _ in 0..3 {
            h.gateway
                .push_initiate(Err(GatewayError::Transient("503".to_string())));
        }

        let err = h.engine.initiate_payment(payment_request("O1")).await.unwrap_err();
        assert!(matches!(err, PaymentError::GatewayUnavailable(_)));
        assert!(err.is_retryable());
        // first attempt plus two retries
        assert_eq!(h.gateway.initiate_count(), 3);

        let tx = h.ledger.find_by_order("O1").await.unwrap().unwrap();
        assert_eq!(tx.status, TransactionStatus::Created);

        // a later call with the same details retries the collect request
        let retried = h.engine.initiate_payment(payment_request("O1")).await.unwrap();
        assert_eq!(retried.transaction_id, tx.transaction_id);
        assert_eq!(retried.status, TransactionStatus::Pending);
    }

    #[tokio::test]
    async fn test_gateway_timeout_is_treated_as_unavailable() {
        let ledger = Arc::new(InMemoryLedger::new());
        let gateway = Arc::new(StalledGateway::default());
        let mut config = engine_config();
        config.gateway_call_timeout = Duration::from_millis(20);
        let engine = PaymentEngine::new(ledger.clone(), gateway.clone(), config);

        let started = std::time::Instant::now();
        let err = engine
            .initiate_payment(payment_request("O1"))
            .await
            .unwrap_err();

        // every attempt times out; none is mistaken for an answer
        assert!(matches!(err, PaymentError::GatewayUnavailable(_)));
        assert_eq!(gateway.calls.load(Ordering::SeqCst), 3);
        assert!(started.elapsed() < Duration::from_secs(5));

        let tx = ledger.find_by_order("O1").await.unwrap().unwrap();
        assert_eq!(tx.status, TransactionStatus::Created);
        assert!(tx.gateway_reference.is_none());
    }

    #[tokio::test]
    async fn test_ambiguous_collect_response_is_resolved_by_status_query() {
        let h = harness();
        h.gateway
            .push_initiate(Err(GatewayError::Unknown("connection reset".to_string())));
        h.gateway.push_status(Ok(StatusResponse {
            gateway_reference: Some("GW9".to_string()),
            status: GatewayPaymentStatus::Success,
        }));

        let result = h.engine.initiate_payment(payment_request("O1")).await.unwrap();

        assert_eq!(result.status, TransactionStatus::Success);
        assert_eq!(result.gateway_reference.as_deref(), Some("GW9"));
        assert_eq!(h.gateway.status_count(), 1);

        let history = h.ledger.history(&result.transaction_id).await.unwrap();
        assert_eq!(history.len(), 3);
    }

    // ------------------------------------------------------------------------
    // Webhooks
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_success_webhook_is_applied_once() {
        let h = harness();
        h.gateway.push_initiate(accept("GW123"));
        let initiated = h.engine.initiate_payment(payment_request("O1")).await.unwrap();

        let (body, signature) = signed(&success_webhook("evt_1", "GW123"));
        let first = h.engine.handle_webhook(&body, &signature).await.unwrap();
        assert!(first.applied);
        assert_eq!(first.status, TransactionStatus::Success);

        let second = h.engine.handle_webhook(&body, &signature).await.unwrap();
        assert!(!second.applied);
        assert_eq!(second.status, TransactionStatus::Success);

        let view = h.engine.check_payment_status("O1").await.unwrap();
        assert_eq!(view.transaction.status, TransactionStatus::Success);
        assert_eq!(view.history.len(), 3);
        assert_eq!(view.history[2].event_id.as_deref(), Some("evt_1"));
        assert_eq!(h.ledger.event_count(&initiated.transaction_id).await, 1);
    }

    #[tokio::test]
    async fn test_invalid_signature_changes_nothing() {
        let h = harness();
        h.gateway.push_initiate(accept("GW123"));
        let initiated = h.engine.initiate_payment(payment_request("O1")).await.unwrap();

        let body = success_webhook("evt_1", "GW123");
        let forged = upi_payments_backend::payments::signature::sign(body.as_bytes(), "wrong");
        let err = h
            .engine
            .handle_webhook(body.as_bytes(), &forged)
            .await
            .unwrap_err();
        assert!(matches!(err, PaymentError::AuthenticationFailure));

        let err = h.engine.handle_webhook(body.as_bytes(), "").await.unwrap_err();
        assert!(matches!(err, PaymentError::AuthenticationFailure));

        let tx = h.ledger.find_by_order("O1").await.unwrap().unwrap();
        assert_eq!(tx.status, TransactionStatus::Pending);
        assert_eq!(h.ledger.event_count(&initiated.transaction_id).await, 0);

        // the genuine delivery still applies afterwards
        let (body, signature) = signed(&body);
        assert!(h.engine.handle_webhook(&body, &signature).await.unwrap().applied);
    }

    #[tokio::test]
    async fn test_status_never_regresses() {
        let h = harness();
        paid_transaction(&h, "O1", "GW123").await;

        let (body, signature) = signed(
            r#"{"event_id":"evt_late","gateway_reference":"GW123","status":"FAILED","reason":"timeout"}"#,
        );
        let err = h.engine.handle_webhook(&body, &signature).await.unwrap_err();
        assert!(matches!(err, PaymentError::StateConflict { .. }));

        let (body, signature) =
            signed(r#"{"event_id":"evt_old","gateway_reference":"GW123","status":"PENDING"}"#);
        let err = h.engine.handle_webhook(&body, &signature).await.unwrap_err();
        assert!(matches!(err, PaymentError::StateConflict { .. }));

        let tx = h.ledger.find_by_order("O1").await.unwrap().unwrap();
        assert_eq!(tx.status, TransactionStatus::Success);
    }

    #[tokio::test]
    async fn test_webhook_amount_mismatch_is_a_conflict() {
        let h = harness();
        h.gateway.push_initiate(accept("GW123"));
        h.engine.initiate_payment(payment_request("O1")).await.unwrap();

        let (body, signature) = signed(
            r#"{"event_id":"evt_1","gateway_reference":"GW123","status":"SUCCESS","amount":100}"#,
        );
        let err = h.engine.handle_webhook(&body, &signature).await.unwrap_err();
        assert!(matches!(err, PaymentError::StateConflict { .. }));

        let tx = h.ledger.find_by_order("O1").await.unwrap().unwrap();
        assert_eq!(tx.status, TransactionStatus::Pending);
    }

    #[tokio::test]
    async fn test_failure_webhook_records_reason() {
        let h = harness();
        h.gateway.push_initiate(accept("GW123"));
        h.engine.initiate_payment(payment_request("O1")).await.unwrap();

        let (body, signature) = signed(
            r#"{"event_id":"evt_1","gateway_reference":"GW123","status":"FAILED","reason":"U30: debit declined"}"#,
        );
        let outcome = h.engine.handle_webhook(&body, &signature).await.unwrap();
        assert!(outcome.applied);
        assert_eq!(outcome.status, TransactionStatus::Failed);

        let tx = h.ledger.find_by_order("O1").await.unwrap().unwrap();
        assert_eq!(tx.failure_reason.as_deref(), Some("U30: debit declined"));
    }

    #[tokio::test]
    async fn test_webhook_without_event_id_is_deduplicated_by_body() {
        let h = harness();
        h.gateway.push_initiate(accept("GW123"));
        h.engine.initiate_payment(payment_request("O1")).await.unwrap();

        let (body, signature) = signed(r#"{"gateway_reference":"GW123","status":"SUCCESS"}"#);
        let first = h.engine.handle_webhook(&body, &signature).await.unwrap();
        let second = h.engine.handle_webhook(&body, &signature).await.unwrap();

        assert!(first.applied);
        assert!(!second.applied);
        assert!(first.event_id.starts_with("sha256:"));
        assert_eq!(first.event_id, second.event_id);
    }

    #[tokio::test]
    async fn test_webhook_for_unknown_transaction_is_not_found() {
        let h = harness();
        let (body, signature) = signed(&success_webhook("evt_1", "GW-missing"));
        let err = h.engine.handle_webhook(&body, &signature).await.unwrap_err();
        assert!(matches!(err, PaymentError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_malformed_webhook_is_invalid_input() {
        let h = harness();
        let (body, signature) = signed("not json");
        let err = h.engine.handle_webhook(&body, &signature).await.unwrap_err();
        assert!(matches!(err, PaymentError::InvalidInput(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_duplicate_deliveries_apply_exactly_once() {
        let h = harness();
        h.gateway.push_initiate(accept("GW123"));
        let initiated = h.engine.initiate_payment(payment_request("O1")).await.unwrap();

        let (body, signature) = signed(&success_webhook("evt_1", "GW123"));
        let mut handles = Vec::new();
        for _ in 0..100 {
            let engine = h.engine.clone();
            let body = body.clone();
            let signature = signature.clone();
            handles.push(tokio::spawn(async move {
                engine.handle_webhook(&body, &signature).await
            }));
        }

        let mut applied = 0;
        for handle in handles {
            let outcome = handle.await.unwrap().unwrap();
            assert_eq!(outcome.status, TransactionStatus::Success);
            if outcome.applied {
                applied += 1;
            }
        }
        assert_eq!(applied, 1);

        let history = h.ledger.history(&initiated.transaction_id).await.unwrap();
        let successes = history
            .iter()
            .filter(|c| c.to_status == TransactionStatus::Success)
            .count();
        assert_eq!(successes, 1);
        assert_eq!(h.ledger.event_count(&initiated.transaction_id).await, 1);
    }

    // ------------------------------------------------------------------------
    // Refunds
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_refund_requires_captured_payment() {
        let h = harness();
        let initiated = h.engine.initiate_payment(payment_request("O1")).await.unwrap();

        let err = h
            .engine
            .initiate_refund(refund_command(&initiated.transaction_id))
            .await
            .unwrap_err();
        assert!(matches!(err, PaymentError::InvalidState { .. }));
        assert_eq!(h.gateway.refund_count(), 0);

        // a payment the gateway never acknowledged cannot be refunded either
        for _ in 0..3 {
            h.gateway
                .push_initiate(Err(GatewayError::Transient("503".to_string())));
        }
        h.engine
            .initiate_payment(payment_request("O2"))
            .await
            .unwrap_err();
        let created = h.ledger.find_by_order("O2").await.unwrap().unwrap();
        assert_eq!(created.status, TransactionStatus::Created);
        let err = h
            .engine
            .initiate_refund(refund_command(&created.transaction_id))
            .await
            .unwrap_err();
        assert!(matches!(err, PaymentError::InvalidState { .. }));
        assert_eq!(h.gateway.refund_count(), 0);

        let err = h
            .engine
            .initiate_refund(refund_command("upi_missing"))
            .await
            .unwrap_err();
        assert!(matches!(err, PaymentError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_refund_completes_synchronously() {
        let h = harness();
        let tx_id = paid_transaction(&h, "O1", "GW123").await;
        h.gateway.push_refund(Ok(RefundResponse {
            gateway_refund_reference: Some("RF1".to_string()),
            status: GatewayRefundStatus::Succeeded,
        }));

        let outcome = h.engine.initiate_refund(refund_command(&tx_id)).await.unwrap();

        assert_eq!(outcome.refund_status, RefundStatus::Succeeded);
        assert_eq!(outcome.transaction_status, TransactionStatus::Refunded);
        assert_eq!(outcome.amount_minor, 50_000);

        let refunds = h.ledger.find_refunds(&tx_id).await.unwrap();
        assert_eq!(refunds.len(), 1);
        assert_eq!(refunds[0].gateway_refund_reference.as_deref(), Some("RF1"));

        // a refunded payment cannot be refunded again
        let err = h.engine.initiate_refund(refund_command(&tx_id)).await.unwrap_err();
        assert!(matches!(err, PaymentError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn test_pending_refund_settles_through_webhook() {
        let h = harness();
        let tx_id = paid_transaction(&h, "O1", "GW123").await;

        let outcome = h.engine.initiate_refund(refund_command(&tx_id)).await.unwrap();
        assert_eq!(outcome.refund_status, RefundStatus::Pending);
        assert_eq!(outcome.transaction_status, TransactionStatus::RefundPending);

        // a second refund while one is in flight is refused
        let err = h.engine.initiate_refund(refund_command(&tx_id)).await.unwrap_err();
        assert!(matches!(err, PaymentError::InvalidState { .. }));

        let (body, signature) = signed(&format!(
            r#"{{"event_id":"evt_rf","gateway_reference":"GW123","status":"REFUNDED","refund_id":"{}","gateway_refund_reference":"RF7"}}"#,
            outcome.refund_id
        ));
        let applied = h.engine.handle_webhook(&body, &signature).await.unwrap();
        assert!(applied.applied);
        assert_eq!(applied.status, TransactionStatus::Refunded);

        let refund = h.ledger.find_refund(&outcome.refund_id).await.unwrap().unwrap();
        assert_eq!(refund.status, RefundStatus::Succeeded);
        assert_eq!(refund.gateway_refund_reference.as_deref(), Some("RF7"));
    }

    #[tokio::test]
    async fn test_failed_refund_can_be_retried() {
        let h = harness();
        let tx_id = paid_transaction(&h, "O1", "GW123").await;
        h.gateway
            .push_refund(Err(GatewayError::Rejected("insufficient balance".to_string())));

        let first = h.engine.initiate_refund(refund_command(&tx_id)).await.unwrap();
        assert_eq!(first.refund_status, RefundStatus::Failed);
        assert_eq!(first.transaction_status, TransactionStatus::RefundFailed);

        h.gateway.push_refund(Ok(RefundResponse {
            gateway_refund_reference: Some("RF2".to_string()),
            status: GatewayRefundStatus::Succeeded,
        }));
        let second = h.engine.initiate_refund(refund_command(&tx_id)).await.unwrap();
        assert_ne!(first.refund_id, second.refund_id);
        assert_eq!(second.transaction_status, TransactionStatus::Refunded);

        let refunds = h.ledger.find_refunds(&tx_id).await.unwrap();
        assert_eq!(refunds.len(), 2);
        assert_eq!(refunds[0].status, RefundStatus::Failed);
        assert_eq!(refunds[1].status, RefundStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_refund_amount_is_bounded_by_capture() {
        let h = harness();
        let tx_id = paid_transaction(&h, "O1", "GW123").await;

        let mut command = refund_command(&tx_id);
        command.amount_minor = Some(50_001);
        let err = h.engine.initiate_refund(command).await.unwrap_err();
        assert!(matches!(err, PaymentError::InvalidInput(_)));

        let mut command = refund_command(&tx_id);
        command.reason = "  ".to_string();
        let err = h.engine.initiate_refund(command).await.unwrap_err();
        assert!(matches!(err, PaymentError::InvalidInput(_)));

        let tx = h.ledger.find_by_id(&tx_id).await.unwrap().unwrap();
        assert_eq!(tx.status, TransactionStatus::Success);
    }

    // ------------------------------------------------------------------------
    // Reconciliation
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_stale_pending_transaction_is_reconciled_on_read() {
        let h = harness();
        h.gateway.push_initiate(accept("GW123"));
        let initiated = h.engine.initiate_payment(payment_request("O1")).await.unwrap();

        // fresh records are served straight from the ledger
        let view = h.engine.check_payment_status("O1").await.unwrap();
        assert!(!view.reconciled);
        assert_eq!(h.gateway.status_count(), 0);

        h.ledger
            .set_updated_at(
                &initiated.transaction_id,
                Utc::now() - ChronoDuration::minutes(10),
            )
            .await;
        h.gateway.push_status(Ok(StatusResponse {
            gateway_reference: Some("GW123".to_string()),
            status: GatewayPaymentStatus::Success,
        }));

        let view = h.engine.check_payment_status("O1").await.unwrap();
        assert!(view.reconciled);
        assert_eq!(view.transaction.status, TransactionStatus::Success);
        assert_eq!(
            view.history.last().map(|c| c.source),
            Some(TransitionSource::Reconciliation)
        );
    }

    #[tokio::test]
    async fn test_reconciliation_errors_do_not_fail_status_reads() {
        let h = harness();
        h.gateway.push_initiate(accept("GW123"));
        let initiated = h.engine.initiate_payment(payment_request("O1")).await.unwrap();
        h.ledger
            .set_updated_at(
                &initiated.transaction_id,
                Utc::now() - ChronoDuration::minutes(10),
            )
            .await;
        for _ in 0..3 {
            h.gateway
                .push_status(Err(GatewayError::Transient("503".to_string())));
        }

        let view = h.engine.check_payment_status("O1").await.unwrap();
        assert!(!view.reconciled);
        assert_eq!(view.transaction.status, TransactionStatus::Pending);

        let err = h.engine.check_payment_status("O-unknown").await.unwrap_err();
        assert!(matches!(err, PaymentError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_pending_refund_is_resent_with_same_id() {
        let h = harness();
        let tx_id = paid_transaction(&h, "O1", "GW123").await;
        for _ in 0..3 {
            h.gateway
                .push_refund(Err(GatewayError::Transient("timeout".to_string())));
        }

        let outcome = h.engine.initiate_refund(refund_command(&tx_id)).await.unwrap();
        assert_eq!(outcome.transaction_status, TransactionStatus::RefundPending);

        h.gateway.push_refund(Ok(RefundResponse {
            gateway_refund_reference: Some("RF3".to_string()),
            status: GatewayRefundStatus::Succeeded,
        }));
        let tx = h.engine.reconcile_transaction(&tx_id).await.unwrap();
        assert_eq!(tx.status, TransactionStatus::Refunded);

        let requests = h.gateway.refund_requests.lock().unwrap().clone();
        assert_eq!(requests.len(), 4);
        assert!(requests.iter().all(|r| r.refund_id == outcome.refund_id));
    }

    #[tokio::test]
    async fn test_worker_cycle_resolves_stale_transactions() {
        let h = harness();
        h.gateway.push_initiate(accept("GW1"));
        let stale = h.engine.initiate_payment(payment_request("O1")).await.unwrap();
        h.gateway.push_initiate(accept("GW2"));
        h.engine.initiate_payment(payment_request("O2")).await.unwrap();

        h.ledger
            .set_updated_at(&stale.transaction_id, Utc::now() - ChronoDuration::minutes(10))
            .await;
        h.gateway.push_status(Ok(StatusResponse {
            gateway_reference: Some("GW1".to_string()),
            status: GatewayPaymentStatus::Failed {
                reason: Some("expired".to_string()),
            },
        }));

        let worker = ReconciliationWorker::new(
            h.engine.clone(),
            ReconciliationConfig {
                poll_interval_secs: 1,
                stale_after_secs: 120,
                batch_size: 10,
                max_concurrent: 2,
            },
        );
        let report = worker.run_cycle().await.unwrap();

        assert_eq!(report.examined, 1);
        assert_eq!(report.resolved, 1);
        assert_eq!(report.failed, 0);

        let tx = h.ledger.find_by_id(&stale.transaction_id).await.unwrap().unwrap();
        assert_eq!(tx.status, TransactionStatus::Failed);
        assert_eq!(tx.failure_reason.as_deref(), Some("expired"));
    }

    #[tokio::test]
    async fn test_worker_stops_on_shutdown() {
        let h = harness();
        let worker = ReconciliationWorker::new(h.engine.clone(), ReconciliationConfig::default());
        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

        let handle = tokio::spawn(async move { worker.run(shutdown_rx).await });
        shutdown_tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("worker did not stop")
            .unwrap();
    }

    // ------------------------------------------------------------------------
    // Listing
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_transactions_are_filtered_by_status() {
        let h = harness();
        paid_transaction(&h, "O1", "GW1").await;
        h.gateway.push_initiate(accept("GW2"));
        h.engine.initiate_payment(payment_request("O2")).await.unwrap();

        let page = h
            .engine
            .get_transactions(&TransactionFilter {
                status: Some(TransactionStatus::Success),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.items[0].order_id, "O1");

        let all = h
            .engine
            .get_transactions(&TransactionFilter::default())
            .await
            .unwrap();
        assert_eq!(all.total, 2);

        let now = Utc::now();
        let err = h
            .engine
            .get_transactions(&TransactionFilter {
                created_from: Some(now),
                created_to: Some(now - ChronoDuration::hours(1)),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, PaymentError::InvalidInput(_)));
    }
}
