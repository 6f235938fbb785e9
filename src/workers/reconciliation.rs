//! Reconciliation Worker
//!
//! Polling fallback for missed webhooks. Each cycle picks CREATED, PENDING and
//! REFUND_PENDING transactions that have not moved for a while and asks the
//! engine to resolve them against the gateway. Errors on one transaction are
//! logged and never stop the cycle.

use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{debug, error, info, instrument, warn};

use crate::error::PaymentResult;
use crate::log_performance;
use crate::services::payment_engine::PaymentEngine;

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct ReconciliationConfig {
    /// How often the worker wakes up (seconds)
    pub poll_interval_secs: u64,
    /// Only transactions untouched for this long are reconciled (seconds)
    pub stale_after_secs: u64,
    /// Maximum transactions handled per cycle
    pub batch_size: i64,
    /// Transactions reconciled in parallel within a cycle
    pub max_concurrent: usize,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 30,
            stale_after_secs: 120,
            batch_size: 50,
            max_concurrent: 4,
        }
    }
}

impl ReconciliationConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        cfg.poll_interval_secs = std::env::var("UPI_RECONCILE_POLL_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(cfg.poll_interval_secs);
        cfg.stale_after_secs = std::env::var("UPI_RECONCILE_STALE_AFTER_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(cfg.stale_after_secs);
        cfg.batch_size = std::env::var("UPI_RECONCILE_BATCH_SIZE")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(cfg.batch_size);
        cfg.max_concurrent = std::env::var("UPI_RECONCILE_CONCURRENCY")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(cfg.max_concurrent);
        cfg
    }
}

/// Counts from one reconciliation cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub examined: usize,
    /// Status moved during the cycle
    pub resolved: usize,
    pub failed: usize,
}

// ============================================================================
// Worker
// ============================================================================

pub struct ReconciliationWorker {
    engine: Arc<PaymentEngine>,
    config: ReconciliationConfig,
}

impl ReconciliationWorker {
    pub fn new(engine: Arc<PaymentEngine>, config: ReconciliationConfig) -> Self {
        Self { engine, config }
    }

    /// Main worker loop - runs until the shutdown flag flips
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            poll_interval_secs = self.config.poll_interval_secs,
            stale_after_secs = self.config.stale_after_secs,
            batch_size = self.config.batch_size,
            "Reconciliation worker started"
        );

        let mut ticker = interval(Duration::from_secs(self.config.poll_interval_secs.max(1)));

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    info!("Shutdown signal received, stopping reconciliation worker");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.run_cycle().await {
                        error!(error = %e, "Error in reconciliation cycle");
                    }
                }
            }
        }

        info!("Reconciliation worker stopped");
    }

    /// Single reconciliation pass
    #[instrument(skip(self), fields(worker = "reconciliation"))]
    pub async fn run_cycle(&self) -> PaymentResult<CycleReport> {
        let started = Instant::now();
        let stale = self
            .engine
            .stale_transactions(
                Duration::from_secs(self.config.stale_after_secs),
                self.config.batch_size,
            )
            .await?;

        let mut report = CycleReport {
            examined: stale.len(),
            ..Default::default()
        };

        let engine = &self.engine;
        let results: Vec<_> = stream::iter(stale)
            .map(|tx| async move {
                debug!(
                    tx_id = %tx.transaction_id,
                    status = %tx.status,
                    updated_at = %tx.updated_at,
                    "Reconciling stale transaction"
                );
                let result = engine.reconcile_transaction(&tx.transaction_id).await;
                (tx, result)
            })
            .buffer_unordered(self.config.max_concurrent.max(1))
            .collect()
            .await;

        for (tx, result) in results {
            match result {
                Ok(updated) if updated.status != tx.status => {
                    info!(
                        tx_id = %tx.transaction_id,
                        from = %tx.status,
                        to = %updated.status,
                        "Reconciliation resolved transaction"
                    );
                    report.resolved += 1;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(
                        tx_id = %tx.transaction_id,
                        error = %e,
                        "Failed to reconcile transaction"
                    );
                    report.failed += 1;
                }
            }
        }

        log_performance!(
            operation = "reconciliation_cycle",
            duration_ms = started.elapsed().as_millis(),
            examined = report.examined,
            resolved = report.resolved,
            failed = report.failed,
        );
        Ok(report)
    }
}
