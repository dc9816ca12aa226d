//! Token ledger daemon: runs the background expiration sweep

use std::error::Error;
use std::sync::Arc;
use token_ledger::{spawn_sweep_scheduler, Config, TokenLedger};
use tokio::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    tracing::info!("Starting token ledger daemon");

    let config = match std::env::args().nth(1) {
        Some(path) => Config::from_file(path)?,
        None => Config::from_env()?,
    };
    let sweep = config.sweep.clone();

    let ledger = Arc::new(TokenLedger::open(config)?);
    tracing::info!("Ledger opened successfully");

    let handle = if sweep.enabled {
        Some(spawn_sweep_scheduler(
            ledger,
            Duration::from_secs(sweep.expire_interval_secs),
        ))
    } else {
        tracing::warn!("Background sweep disabled by configuration");
        None
    };

    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down token ledger daemon");
    if let Some(handle) = handle {
        handle.shutdown().await?;
    }
    Ok(())
}
