use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;

use tranche_collateral::CollateralManager;
use tranche_collateral::ledger::InMemoryLedger;
use tranche_common::config::AppConfig;
use tranche_common::halt::HaltFlag;
use tranche_daemon::market::SharedMarketData;
use tranche_daemon::orchestrator::Orchestrator;
use tranche_daemon::seed;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "tranche_daemon=info,tranche_collateral=info,tranche_engine=info".into()
            }),
        )
        .json()
        .init();

    tracing::info!("Tranche risk daemon starting...");

    // Load configuration
    let config = AppConfig::from_env()?;
    config.validate()?;

    // Build the pool
    let pool = seed::load_pool_seed(config.pool_seed_path.as_deref())?.into_pool()?;
    tracing::info!(
        tranches = pool.virtual_tranches.len(),
        capital = %pool.total_capital_usd,
        reserves = %pool.usd_reserves,
        "Pool loaded"
    );
    let manager = CollateralManager::new(pool, config.collateral.clone(), HaltFlag::new());

    let market = SharedMarketData::new(seed::load_market_seed(config.market_seed_path.as_deref())?);
    let ledger = Arc::new(InMemoryLedger::new());

    let (orchestrator, handle) = Orchestrator::new(config, manager, ledger, Arc::new(market));

    // Mirror published events into the log
    let mut events = handle.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(json) => tracing::debug!(event = event.name(), payload = %json, "Daemon event"),
                    Err(e) => tracing::warn!(error = %e, "Failed to serialize daemon event"),
                },
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event log lagged behind publisher");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    let mut daemon = tokio::spawn(orchestrator.run());

    // Run with graceful shutdown on Ctrl+C
    tokio::select! {
        result = &mut daemon => {
            result??;
            return Ok(());
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal, stopping at next cycle boundary...");
            handle.shutdown();
        }
    }

    daemon.await??;
    tracing::info!("Tranche risk daemon stopped.");
    Ok(())
}
