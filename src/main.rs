use anyhow::Context;
use dotenv::dotenv;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

use upi_payments_backend::api::{self, payments::PaymentsState};
use upi_payments_backend::config::{EngineConfig, ServerSettings};
use upi_payments_backend::database::{PgLedger, PoolConfig};
use upi_payments_backend::logging::init_tracing;
use upi_payments_backend::payments::gateway::{GatewayConfig, HttpUpiGateway};
use upi_payments_backend::services::PaymentEngine;
use upi_payments_backend::workers::reconciliation::{ReconciliationConfig, ReconciliationWorker};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    init_tracing();
    info!("Starting UPI payments backend");

    let settings = ServerSettings::load().context("failed to load server settings")?;

    let pool_config = PoolConfig {
        max_connections: settings.database_max_connections,
        ..PoolConfig::default()
    };
    let ledger = PgLedger::connect(&settings.database_url, pool_config)
        .await
        .context("failed to connect to the payment ledger")?;

    let gateway = HttpUpiGateway::new(GatewayConfig::from_env()).map_err(|e| {
        error!(error = %e, "Failed to initialize UPI gateway client");
        anyhow::anyhow!(e)
    })?;

    let engine_config = EngineConfig::from_env();
    engine_config
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid engine configuration: {}", e))?;

    let engine = Arc::new(PaymentEngine::new(
        Arc::new(ledger),
        Arc::new(gateway),
        engine_config,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = ReconciliationWorker::new(engine.clone(), ReconciliationConfig::from_env());
    let worker_handle = tokio::spawn(async move { worker.run(shutdown_rx).await });

    let app = api::app(PaymentsState {
        engine,
        signature_header: settings.webhook_signature_header.clone(),
    });

    let addr = settings.bind_address();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!(address = %addr, "Server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for shutdown signal");
            }
            info!("Shutdown signal received");
        })
        .await
        .context("server error")?;

    let _ = shutdown_tx.send(true);
    if let Err(e) = worker_handle.await {
        error!(error = %e, "Reconciliation worker panicked");
    }

    info!("UPI payments backend stopped");
    Ok(())
}
