//! Inbound gateway webhook payloads
//!
//! Parsing happens only after the signature over the raw bytes has been
//! verified.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::PaymentError;
use crate::payments::types::TransactionStatus;

/// Status reported by the gateway in a webhook body
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WebhookStatus {
    Pending,
    Success,
    Failed,
    Refunded,
    RefundFailed,
}

impl WebhookStatus {
    /// Ledger status this event asks for
    pub fn target_status(&self) -> TransactionStatus {
        match self {
            WebhookStatus::Pending => TransactionStatus::Pending,
            WebhookStatus::Success => TransactionStatus::Success,
            WebhookStatus::Failed => TransactionStatus::Failed,
            WebhookStatus::Refunded => TransactionStatus::Refunded,
            WebhookStatus::RefundFailed => TransactionStatus::RefundFailed,
        }
    }

    pub fn is_refund_event(&self) -> bool {
        matches!(self, WebhookStatus::Refunded | WebhookStatus::RefundFailed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WebhookPayload {
    /// Provider event id; absent on some gateways
    #[serde(default)]
    pub event_id: Option<String>,
    #[serde(default)]
    pub gateway_reference: Option<String>,
    /// Our transaction id echoed back as the merchant reference
    #[serde(default)]
    pub transaction_id: Option<String>,
    pub status: WebhookStatus,
    /// Amount in minor units as settled by the gateway
    #[serde(default)]
    pub amount: Option<i64>,
    #[serde(default)]
    pub refund_id: Option<String>,
    #[serde(default)]
    pub gateway_refund_reference: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

impl WebhookPayload {
    pub fn parse(raw: &[u8]) -> Result<Self, PaymentError> {
        let payload: WebhookPayload = serde_json::from_slice(raw)
            .map_err(|e| PaymentError::InvalidInput(format!("malformed webhook payload: {}", e)))?;

        if payload.gateway_reference.is_none() && payload.transaction_id.is_none() {
            return Err(PaymentError::InvalidInput(
                "webhook carries neither gateway_reference nor transaction_id".to_string(),
            ));
        }
        Ok(payload)
    }

    /// Provider event id, or a stable digest of the raw body when omitted
    pub fn resolve_event_id(&self, raw: &[u8]) -> String {
        match self.event_id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => payload_digest(raw),
        }
    }
}

/// SHA-256 hex digest of a raw webhook body
pub fn payload_digest(raw: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw);
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

/// A webhook delivery recorded as applied to a transaction
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WebhookEvent {
    pub event_id: String,
    pub transaction_id: String,
    pub payload: String,
    pub signature: String,
    pub received_at: DateTime<Utc>,
}

impl WebhookEvent {
    pub fn new(event_id: &str, transaction_id: &str, raw: &[u8], signature: &str) -> Self {
        Self {
            event_id: event_id.to_string(),
            transaction_id: transaction_id.to_string(),
            payload: String::from_utf8_lossy(raw).into_owned(),
            signature: signature.to_string(),
            received_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_gateway_payload() {
        let raw = br#"{"event_id":"evt_1","gateway_reference":"GW123","status":"SUCCESS","amount":50000}"#;
        let payload = WebhookPayload::parse(raw).unwrap();
        assert_eq!(payload.status, WebhookStatus::Success);
        assert_eq!(payload.gateway_reference.as_deref(), Some("GW123"));
        assert_eq!(payload.amount, Some(50_000));
        assert_eq!(payload.resolve_event_id(raw), "evt_1");
    }

    #[test]
    fn missing_event_id_falls_back_to_payload_digest() {
        let raw = br#"{"gateway_reference":"GW123","status":"FAILED"}"#;
        let payload = WebhookPayload::parse(raw).unwrap();
        let first = payload.resolve_event_id(raw);
        assert!(first.starts_with("sha256:"));
        assert_eq!(first, payload.resolve_event_id(raw));

        let other = br#"{"gateway_reference":"GW123","status":"SUCCESS"}"#;
        assert_ne!(first, payload_digest(other));
    }

    #[test]
    fn rejects_payload_without_reference() {
        let raw = br#"{"event_id":"evt_1","status":"SUCCESS"}"#;
        assert!(matches!(
            WebhookPayload::parse(raw),
            Err(PaymentError::InvalidInput(_))
        ));
        assert!(WebhookPayload::parse(b"not json").is_err());
        assert!(WebhookPayload::parse(br#"{"gateway_reference":"GW1","status":"SETTLED"}"#).is_err());
    }

    #[test]
    fn maps_events_to_ledger_states() {
        assert_eq!(WebhookStatus::Success.target_status(), TransactionStatus::Success);
        assert_eq!(
            WebhookStatus::RefundFailed.target_status(),
            TransactionStatus::RefundFailed
        );
        assert!(WebhookStatus::Refunded.is_refund_event());
        assert!(!WebhookStatus::Failed.is_refund_event());
    }
}
