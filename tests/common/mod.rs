//! Shared fixtures: a scripted gateway and an engine over the in-memory ledger

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use upi_payments_backend::config::EngineConfig;
use upi_payments_backend::database::InMemoryLedger;
use upi_payments_backend::payments::gateway::{
    CollectRequest, CollectResponse, GatewayPaymentStatus, GatewayRefundStatus, GatewayResult,
    RefundRequest, RefundResponse, StatusQuery, StatusResponse, UpiGateway,
};
use upi_payments_backend::payments::signature;
use upi_payments_backend::services::{InitiatePaymentRequest, PaymentEngine};

pub const WEBHOOK_SECRET: &str = "whsec_test_secret";

/// Gateway that replays queued responses, falling back to PENDING answers
#[derive(Default)]
pub struct MockGateway {
    initiate_responses: Mutex<VecDeque<GatewayResult<CollectResponse>>>,
    status_responses: Mutex<VecDeque<GatewayResult<StatusResponse>>>,
    refund_responses: Mutex<VecDeque<GatewayResult<RefundResponse>>>,
    pub initiate_calls: AtomicUsize,
    pub status_calls: AtomicUsize,
    pub refund_calls: AtomicUsize,
    pub refund_requests: Mutex<Vec<RefundRequest>>,
}

impl MockGateway {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_initiate(&self, response: GatewayResult<CollectResponse>) {
        self.initiate_responses.lock().unwrap().push_back(response);
    }

    pub fn push_status(&self, response: GatewayResult<StatusResponse>) {
        self.status_responses.lock().unwrap().push_back(response);
    }

    pub fn push_refund(&self, response: GatewayResult<RefundResponse>) {
        self.refund_responses.lock().unwrap().push_back(response);
    }

    pub fn initiate_count(&self) -> usize {
        self.initiate_calls.load(Ordering::SeqCst)
    }

    pub fn status_count(&self) -> usize {
        self.status_calls.load(Ordering::SeqCst)
    }

    pub fn refund_count(&self) -> usize {
        self.refund_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UpiGateway for MockGateway {
    async fn initiate(&self, request: CollectRequest) -> GatewayResult<CollectResponse> {
        self.initiate_calls.fetch_add(1, Ordering::SeqCst);
        self.initiate_responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| {
                Ok(CollectResponse {
                    gateway_reference: format!("GW-{}", request.transaction_id),
                    status: GatewayPaymentStatus::Pending,
                })
            })
    }

    async fn query_status(&self, _query: StatusQuery) -> GatewayResult<StatusResponse> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        self.status_responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(StatusResponse {
                gateway_reference: None,
                status: GatewayPaymentStatus::Pending,
            }))
    }

    async fn refund(&self, request: RefundRequest) -> GatewayResult<RefundResponse> {
        self.refund_calls.fetch_add(1, Ordering::SeqCst);
        self.refund_requests.lock().unwrap().push(request);
        self.refund_responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(RefundResponse {
                gateway_refund_reference: None,
                status: GatewayRefundStatus::Pending,
            }))
    }
}

pub fn engine_config() -> EngineConfig {
    EngineConfig {
        webhook_secret: WEBHOOK_SECRET.to_string(),
        staleness_threshold: Duration::from_secs(60),
        gateway_call_timeout: Duration::from_secs(2),
        gateway_max_retries: 2,
        gateway_retry_backoff_ms: vec![1, 1],
        lock_timeout: Duration::from_secs(5),
    }
}

pub struct Harness {
    pub engine: Arc<PaymentEngine>,
    pub ledger: Arc<InMemoryLedger>,
    pub gateway: Arc<MockGateway>,
}

pub fn harness() -> Harness {
    let ledger = Arc::new(InMemoryLedger::new());
    let gateway = MockGateway::new();
    let engine = Arc::new(PaymentEngine::new(
        ledger.clone(),
        gateway.clone(),
        engine_config(),
    ));
    Harness {
        engine,
        ledger,
        gateway,
    }
}

pub fn payment_request(order_id: &str) -> InitiatePaymentRequest {
    InitiatePaymentRequest {
        order_id: order_id.to_string(),
        user_id: "U1".to_string(),
        payer_vpa: "alice@okhdfc".to_string(),
        amount_minor: 50_000,
        currency: "INR".to_string(),
    }
}

pub fn accept(reference: &str) -> GatewayResult<CollectResponse> {
    Ok(CollectResponse {
        gateway_reference: reference.to_string(),
        status: GatewayPaymentStatus::Pending,
    })
}

pub fn signed(body: &str) -> (Vec<u8>, String) {
    let bytes = body.as_bytes().to_vec();
    let signature = signature::sign(&bytes, WEBHOOK_SECRET);
    (bytes, signature)
}
