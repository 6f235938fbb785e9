//! Payment API endpoints
//!
//! Thin HTTP layer over the payment engine: decimal amounts are converted to
//! minor units here, engine errors are mapped to status codes and a stable
//! error body.

pub mod models;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use std::sync::Arc;
use tracing::{info, Instrument};

use crate::error::PaymentError;
use crate::middleware::logging::extract_client_ip;
use crate::request_span;
use crate::services::payment_engine::PaymentEngine;

use models::{
    ErrorDetail, ErrorResponse, InitiatePaymentBody, InitiatePaymentResponse,
    PaymentStatusResponse, RefundBody, RefundResponse, TransactionListQuery,
    TransactionListResponse, WebhookAck,
};

/// Seconds a client should wait before retrying a retryable failure
const RETRY_AFTER_SECS: u64 = 5;

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<ErrorResponse>)>;

/// Shared state for the payment routes
#[derive(Clone)]
pub struct PaymentsState {
    pub engine: Arc<PaymentEngine>,
    /// Header carrying the webhook signature
    pub signature_header: String,
}

pub fn router(state: PaymentsState) -> Router {
    Router::new()
        .route("/api/payments/initiate", post(initiate_payment))
        .route("/api/payments/status/{order_id}", get(get_payment_status))
        .route("/api/payments/webhook", post(payment_webhook))
        .route("/api/payments/{transaction_id}/refund", post(initiate_refund))
        .route("/api/payments/transactions", get(list_transactions))
        .with_state(state)
}

fn error_response(
    err: PaymentError,
    transaction_id: Option<String>,
) -> (StatusCode, Json<ErrorResponse>) {
    let status_code =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if status_code.is_server_error() {
        tracing::error!(error = %err, "Payment request failed");
    }
    let error_response = ErrorResponse {
        error: ErrorDetail {
            code: err.error_code(),
            message: err.user_message(),
            transaction_id,
            retry_after: if err.is_retryable() {
                Some(RETRY_AFTER_SECS)
            } else {
                None
            },
        },
    };
    (status_code, Json(error_response))
}

/// POST /api/payments/initiate
pub async fn initiate_payment(
    State(state): State<PaymentsState>,
    Json(body): Json<InitiatePaymentBody>,
) -> ApiResult<InitiatePaymentResponse> {
    info!(order_id = %body.order_id, "POST /api/payments/initiate");

    let request = body.into_request().map_err(|e| error_response(e, None))?;
    state
        .engine
        .initiate_payment(request)
        .await
        .map(|result| Json(result.into()))
        .map_err(|e| error_response(e, None))
}

/// GET /api/payments/status/{order_id}
pub async fn get_payment_status(
    State(state): State<PaymentsState>,
    Path(order_id): Path<String>,
) -> ApiResult<PaymentStatusResponse> {
    info!(order_id = %order_id, "GET /api/payments/status");

    state
        .engine
        .check_payment_status(&order_id)
        .await
        .map(|view| Json(view.into()))
        .map_err(|e| error_response(e, None))
}

/// POST /api/payments/webhook
///
/// The body is taken as raw bytes so the signature is checked over exactly
/// what the gateway sent.
pub async fn payment_webhook(
    State(state): State<PaymentsState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<WebhookAck> {
    let client_ip = extract_client_ip(&headers).unwrap_or_else(|| "unknown".to_string());
    let span = request_span!(
        "payment_webhook",
        client_ip = client_ip,
        payload_len = body.len(),
    );

    let signature = headers
        .get(state.signature_header.as_str())
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    state
        .engine
        .handle_webhook(&body, signature)
        .instrument(span)
        .await
        .map(|outcome| Json(outcome.into()))
        .map_err(|e| error_response(e, None))
}

/// POST /api/payments/{transaction_id}/refund
pub async fn initiate_refund(
    State(state): State<PaymentsState>,
    Path(transaction_id): Path<String>,
    Json(body): Json<RefundBody>,
) -> ApiResult<RefundResponse> {
    info!(tx_id = %transaction_id, "POST /api/payments/refund");

    let command = body
        .into_command(transaction_id.clone())
        .map_err(|e| error_response(e, Some(transaction_id.clone())))?;
    state
        .engine
        .initiate_refund(command)
        .await
        .map(|outcome| Json(outcome.into()))
        .map_err(|e| error_response(e, Some(transaction_id)))
}

/// GET /api/payments/transactions
pub async fn list_transactions(
    State(state): State<PaymentsState>,
    Query(query): Query<TransactionListQuery>,
) -> ApiResult<TransactionListResponse> {
    let filter = query.into_filter().map_err(|e| error_response(e, None))?;
    state
        .engine
        .get_transactions(&filter)
        .await
        .map(|page| Json(page.into()))
        .map_err(|e| error_response(e, None))
}
