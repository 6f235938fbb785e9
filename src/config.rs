//! Runtime configuration
//!
//! Component settings (`EngineConfig`, the gateway and reconciliation configs)
//! read plain environment variables with defaults, the same way every worker
//! config does. Process-level settings for the HTTP server are layered with the
//! `config` crate: built-in defaults, an optional `config/upi-payments` file,
//! then `UPI_`-prefixed environment variables.

use serde::Deserialize;
use std::time::Duration;

use crate::error::PaymentError;

// ============================================================================
// Engine Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Shared secret for webhook HMAC verification
    pub webhook_secret: String,
    /// CREATED/PENDING/REFUND_PENDING records older than this are reconciled
    /// on status reads
    pub staleness_threshold: Duration,
    /// Upper bound for a single gateway call
    pub gateway_call_timeout: Duration,
    /// Retries after the first attempt, transient errors only
    pub gateway_max_retries: u32,
    /// Delay before each retry (milliseconds); the last entry repeats
    pub gateway_retry_backoff_ms: Vec<u64>,
    /// How long an operation waits for a busy transaction
    pub lock_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            webhook_secret: String::new(),
            staleness_threshold: Duration::from_secs(60),
            gateway_call_timeout: Duration::from_secs(15),
            gateway_max_retries: 3,
            gateway_retry_backoff_ms: vec![200, 400, 800],
            lock_timeout: Duration::from_secs(10),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        cfg.webhook_secret = std::env::var("UPI_WEBHOOK_SECRET").unwrap_or_default();
        cfg.staleness_threshold = Duration::from_secs(
            std::env::var("UPI_STALENESS_THRESHOLD_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(cfg.staleness_threshold.as_secs()),
        );
        cfg.gateway_call_timeout = Duration::from_secs(
            std::env::var("UPI_GATEWAY_CALL_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(cfg.gateway_call_timeout.as_secs()),
        );
        cfg.gateway_max_retries = std::env::var("UPI_GATEWAY_MAX_RETRIES")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(cfg.gateway_max_retries);
        if let Ok(raw) = std::env::var("UPI_GATEWAY_RETRY_BACKOFF_MS") {
            let parsed: Vec<u64> = raw
                .split(',')
                .filter_map(|v| v.trim().parse().ok())
                .collect();
            if !parsed.is_empty() {
                cfg.gateway_retry_backoff_ms = parsed;
            }
        }
        cfg.lock_timeout = Duration::from_millis(
            std::env::var("UPI_LOCK_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(cfg.lock_timeout.as_millis() as u64),
        );
        cfg
    }

    pub fn validate(&self) -> Result<(), PaymentError> {
        if self.webhook_secret.trim().is_empty() {
            return Err(PaymentError::InvalidInput(
                "UPI_WEBHOOK_SECRET must be set".to_string(),
            ));
        }
        if self.gateway_call_timeout.is_zero() || self.lock_timeout.is_zero() {
            return Err(PaymentError::InvalidInput(
                "gateway and lock timeouts must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Delay before retry number `attempt` (0-based)
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let ms = self
            .gateway_retry_backoff_ms
            .get(attempt as usize)
            .or_else(|| self.gateway_retry_backoff_ms.last())
            .copied()
            .unwrap_or(0);
        Duration::from_millis(ms)
    }
}

// ============================================================================
// Server Settings
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub database_max_connections: u32,
    /// Header carrying the gateway's webhook signature
    pub webhook_signature_header: String,
}

impl ServerSettings {
    pub fn load() -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .set_default("host", "0.0.0.0")?
            .set_default("port", 8000)?
            .set_default("database_url", "postgres://localhost/upi_payments")?
            .set_default("database_max_connections", 10)?
            .set_default("webhook_signature_header", "x-upi-signature")?
            .add_source(config::File::with_name("config/upi-payments").required(false))
            .add_source(config::Environment::with_prefix("UPI").try_parsing(true))
            .build()?
            .try_deserialize()
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
