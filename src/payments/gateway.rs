//! UPI gateway client
//!
//! Defines the interface the engine uses to reach the UPI payment service
//! provider, plus an HTTP adapter. Every failure is normalized into one of three
//! kinds so the engine can decide between retrying, failing and reconciling.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use crate::logging::redact_sensitive_data;
use crate::middleware::logging::log_external_call;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    /// Safe to retry with backoff (timeouts, 5xx, throttling)
    #[error("transient gateway error: {0}")]
    Transient(String),

    /// Terminal refusal from the provider, do not retry
    #[error("gateway rejected request: {0}")]
    Rejected(String),

    /// Outcome unknown; reconcile through a status query
    #[error("ambiguous gateway response: {0}")]
    Unknown(String),
}

pub type GatewayResult<T> = Result<T, GatewayError>;

// ============================================================================
// Request / Response Types
// ============================================================================

/// Collect request sent to the payer's PSP
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CollectRequest {
    /// Our transaction id, echoed back by the gateway as merchant reference
    pub transaction_id: String,
    pub order_id: String,
    pub payer_vpa: String,
    pub amount_minor: i64,
    pub currency: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "state", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GatewayPaymentStatus {
    Pending,
    Success,
    Failed { reason: Option<String> },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CollectResponse {
    pub gateway_reference: String,
    pub status: GatewayPaymentStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusQuery {
    pub transaction_id: String,
    pub gateway_reference: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusResponse {
    /// Absent when the gateway never registered the collect request
    pub gateway_reference: Option<String>,
    pub status: GatewayPaymentStatus,
}

/// Refund request. `refund_id` doubles as the gateway idempotency key, so
/// re-sending it returns the outcome of the original refund.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RefundRequest {
    pub refund_id: String,
    pub transaction_id: String,
    pub gateway_reference: String,
    pub amount_minor: i64,
    pub currency: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "state", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GatewayRefundStatus {
    Pending,
    Succeeded,
    Failed { reason: Option<String> },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RefundResponse {
    pub gateway_refund_reference: Option<String>,
    pub status: GatewayRefundStatus,
}

// ============================================================================
// Gateway Trait
// ============================================================================

#[async_trait]
pub trait UpiGateway: Send + Sync {
    /// Start a collect request against the payer's VPA
    async fn initiate(&self, request: CollectRequest) -> GatewayResult<CollectResponse>;

    /// Current status of a payment
    async fn query_status(&self, query: StatusQuery) -> GatewayResult<StatusResponse>;

    /// Refund (part of) a captured payment
    async fn refund(&self, request: RefundRequest) -> GatewayResult<RefundResponse>;
}

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub base_url: String,
    pub api_key: String,
    /// Per-request timeout enforced by the HTTP client
    pub request_timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: "https://sandbox.upi-gateway.example".to_string(),
            api_key: String::new(),
            request_timeout: Duration::from_secs(10),
        }
    }
}

impl GatewayConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        cfg.base_url = std::env::var("UPI_GATEWAY_BASE_URL").unwrap_or(cfg.base_url);
        cfg.api_key = std::env::var("UPI_GATEWAY_API_KEY").unwrap_or_default();
        cfg.request_timeout = Duration::from_secs(
            std::env::var("UPI_GATEWAY_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(cfg.request_timeout.as_secs()),
        );
        cfg
    }

    pub fn validate(&self) -> Result<(), GatewayError> {
        if self.api_key.is_empty() {
            return Err(GatewayError::Rejected(
                "UPI_GATEWAY_API_KEY is required".to_string(),
            ));
        }
        if !self.base_url.starts_with("http") {
            return Err(GatewayError::Rejected(format!(
                "invalid gateway base url '{}'",
                self.base_url
            )));
        }
        Ok(())
    }
}

// ============================================================================
// HTTP Adapter
// ============================================================================

#[derive(Debug, Deserialize)]
struct GatewayErrorBody {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    code: Option<String>,
}

pub struct HttpUpiGateway {
    client: reqwest::Client,
    config: GatewayConfig,
}

impl HttpUpiGateway {
    pub fn new(config: GatewayConfig) -> GatewayResult<Self> {
        config.validate()?;
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| GatewayError::Rejected(format!("failed to build http client: {}", e)))?;
        Ok(Self { client, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    async fn send<T>(&self, builder: reqwest::RequestBuilder) -> GatewayResult<T>
    where
        T: for<'de> Deserialize<'de>,
    {
        let response = builder
            .bearer_auth(&self.config.api_key)
            .send()
            .await
            .map_err(classify_transport_error)?;

        let status = response.status();
        if status.is_success() {
            return response.json::<T>().await.map_err(|e| {
                warn!(status = %status, error = %e, "Unparseable gateway success response");
                GatewayError::Unknown(format!("unparseable response body: {}", e))
            });
        }

        let raw = response.text().await.unwrap_or_default();
        let body = error_message(status, &raw);

        Err(classify_status(status, body))
    }
}

/// Summarize a gateway error body; the raw body is only logged redacted
fn error_message(status: StatusCode, raw: &str) -> String {
    debug!(
        status = %status,
        body = %redact_sensitive_data(raw),
        "Gateway returned error response"
    );
    serde_json::from_str::<GatewayErrorBody>(raw)
        .ok()
        .and_then(|b| match (b.code, b.message) {
            (Some(code), Some(message)) => Some(format!("{}: {}", code, message)),
            (None, Some(message)) => Some(message),
            (Some(code), None) => Some(code),
            (None, None) => None,
        })
        .unwrap_or_else(|| status.to_string())
}

fn classify_transport_error(err: reqwest::Error) -> GatewayError {
    if err.is_timeout() || err.is_connect() {
        GatewayError::Transient(err.to_string())
    } else if err.is_request() {
        // the request may have reached the gateway before failing
        GatewayError::Unknown(err.to_string())
    } else {
        GatewayError::Transient(err.to_string())
    }
}

fn classify_status(status: StatusCode, message: String) -> GatewayError {
    if status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
    {
        GatewayError::Transient(message)
    } else if status.is_client_error() {
        GatewayError::Rejected(message)
    } else {
        GatewayError::Unknown(message)
    }
}

#[async_trait]
impl UpiGateway for HttpUpiGateway {
    async fn initiate(&self, request: CollectRequest) -> GatewayResult<CollectResponse> {
        debug!(tx_id = %request.transaction_id, "Sending UPI collect request");
        let builder = self
            .client
            .post(self.url("/v1/collect"))
            .header("Idempotency-Key", request.transaction_id.as_str())
            .json(&request);
        log_external_call("UPI Gateway", "POST /v1/collect", self.send(builder)).await
    }

    async fn query_status(&self, query: StatusQuery) -> GatewayResult<StatusResponse> {
        let reference = query
            .gateway_reference
            .clone()
            .unwrap_or_else(|| query.transaction_id.clone());
        let builder = self
            .client
            .get(self.url(&format!("/v1/transactions/{}", reference)));
        log_external_call(
            "UPI Gateway",
            "GET /v1/transactions/{reference}",
            self.send(builder),
        )
        .await
    }

    async fn refund(&self, request: RefundRequest) -> GatewayResult<RefundResponse> {
        let builder = self
            .client
            .post(self.url("/v1/refunds"))
            .header("Idempotency-Key", request.refund_id.as_str())
            .json(&request);
        log_external_call("UPI Gateway", "POST /v1/refunds", self.send(builder)).await
    }
}
