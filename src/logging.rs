//! Logging and tracing configuration for the UPI payments backend
//!
//! Provides structured logging with JSON formatting in production and
//! human-readable output in development, plus helpers that keep payer
//! identifiers and secrets out of log lines.

use std::env;
use std::sync::OnceLock;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Environment types for logging configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Staging,
    Production,
}

impl Environment {
    /// Detect environment from ENV variable
    pub fn from_env() -> Self {
        Self::parse(
            &env::var("ENVIRONMENT")
                .or_else(|_| env::var("ENV"))
                .unwrap_or_else(|_| "development".to_string()),
        )
    }

    pub fn parse(value: &str) -> Self {
        match value.to_lowercase().as_str() {
            "prod" | "production" => Self::Production,
            "staging" | "stage" => Self::Staging,
            _ => Self::Development,
        }
    }

    /// Get default log level for environment
    pub fn default_log_level(&self) -> Level {
        match self {
            Self::Development => Level::DEBUG,
            Self::Staging => Level::INFO,
            Self::Production => Level::INFO,
        }
    }

    pub fn is_production(&self) -> bool {
        matches!(self, Self::Production)
    }
}

/// Initialize the tracing subscriber with appropriate formatting
///
/// # Environment Variables
/// - `ENVIRONMENT` or `ENV`: "production", "staging" or "development"
/// - `RUST_LOG`: Override log level (e.g., "info", "debug", "warn")
/// - `LOG_FORMAT`: Force format to "json" or "pretty"
pub fn init_tracing() {
    let environment = Environment::from_env();

    let use_json = env::var("LOG_FORMAT")
        .map(|f| f.to_lowercase() == "json")
        .unwrap_or_else(|_| environment.is_production());

    let default_directives = format!(
        "{}={},tower_http=debug,axum=debug,sqlx=warn,hyper=warn,reqwest=warn",
        env!("CARGO_PKG_NAME").replace('-', "_"),
        environment.default_log_level()
    );
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&default_directives))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    if use_json {
        let json_layer = fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_span_list(false)
            .with_target(true)
            .with_level(true)
            .with_file(false)
            .with_line_number(false)
            .with_filter(env_filter);

        tracing_subscriber::registry().with(json_layer).init();
    } else {
        let pretty_layer = fmt::layer()
            .pretty()
            .with_target(true)
            .with_level(true)
            .with_file(true)
            .with_line_number(true)
            .with_span_events(FmtSpan::CLOSE)
            .with_filter(env_filter);

        tracing_subscriber::registry().with(pretty_layer).init();
    }

    tracing::info!(
        environment = ?environment,
        format = if use_json { "json" } else { "pretty" },
        "Tracing initialized"
    );
}

/// Mask the handle of a VPA for logging, keeping the PSP suffix
///
/// # Examples
/// ```
/// # use upi_payments_backend::logging::mask_vpa;
/// assert_eq!(mask_vpa("alice.sharma@okhdfc"), "al***@okhdfc");
/// assert_eq!(mask_vpa("not-a-vpa"), "****");
/// ```
pub fn mask_vpa(vpa: &str) -> String {
    match vpa.split_once('@') {
        Some((handle, psp)) if !handle.is_empty() => {
            let visible: String = handle.chars().take(2).collect();
            format!("{}***@{}", visible, psp)
        }
        _ => "****".to_string(),
    }
}

fn sensitive_patterns() -> &'static Vec<(regex::Regex, String)> {
    static PATTERNS: OnceLock<Vec<(regex::Regex, String)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        let sensitive_keys = [
            "secret",
            "webhook_secret",
            "password",
            "token",
            "api_key",
            "apiKey",
            "authorization",
            "signature",
            "payer_vpa",
            "upi_pin",
            "pin",
        ];

        let mut patterns = Vec::new();
        for key in &sensitive_keys {
            for pattern in [
                format!(r#""{}":\s*"[^"]*""#, key),
                format!(r#"'{}': '[^']*'"#, key),
            ] {
                if let Ok(re) = regex::Regex::new(&pattern) {
                    patterns.push((re, format!(r#""{}": "[REDACTED]""#, key)));
                }
            }
        }
        patterns
    })
}

/// Redact sensitive fields from JSON-like text before it is logged
pub fn redact_sensitive_data(text: &str) -> String {
    let mut result = text.to_string();
    for (re, replacement) in sensitive_patterns() {
        result = re.replace_all(&result, replacement.as_str()).to_string();
    }
    result
}

/// Log a transaction event with consistent structure
///
/// # Examples
/// ```no_run
/// # use upi_payments_backend::log_transaction;
/// log_transaction!(
///     event = "payment_created",
///     transaction_id = "upi_123",
///     amount_minor = 50_000,
/// );
/// ```
#[macro_export]
macro_rules! log_transaction {
    ($($key:tt = $value:expr),* $(,)?) => {
        tracing::info!(
            event_type = "transaction",
            $($key = tracing::field::debug(&$value)),*
        );
    };
}

/// Log a performance metric
///
/// # Examples
/// ```no_run
/// # use upi_payments_backend::log_performance;
/// log_performance!(
///     operation = "reconciliation_cycle",
///     duration_ms = 145,
/// );
/// ```
#[macro_export]
macro_rules! log_performance {
    ($($key:tt = $value:expr),* $(,)?) => {
        tracing::debug!(
            event_type = "performance",
            $($key = tracing::field::debug(&$value)),*
        );
    };
}

/// Create a tracing span for a request with context
///
/// # Examples
/// ```no_run
/// # use upi_payments_backend::request_span;
/// let span = request_span!("payment_webhook", client_ip = "10.0.0.1");
/// let _guard = span.enter();
/// ```
#[macro_export]
macro_rules! request_span {
    ($name:expr, $($key:tt = $value:expr),* $(,)?) => {
        tracing::info_span!(
            $name,
            $($key = tracing::field::debug(&$value)),*
        )
    };
}
