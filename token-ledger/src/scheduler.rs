//! Background sweep scheduling
//!
//! One tokio task drives the expiration sweep on an interval. Request-serving
//! code never runs sweeps; it talks to the ledger directly. The handle
//! supports triggering an immediate sweep and graceful shutdown.

use crate::{sweep::SweepReport, Error, Result, TokenLedger};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, Duration, MissedTickBehavior};

/// Message sent to the sweep task
enum SweepMessage {
    /// Run an expiration sweep now
    RunNow {
        response: oneshot::Sender<Result<SweepReport>>,
    },

    /// Stop the task
    Shutdown,
}

/// Handle for the background sweep task
#[derive(Debug, Clone)]
pub struct SweepHandle {
    sender: mpsc::Sender<SweepMessage>,
}

impl SweepHandle {
    /// Trigger an immediate expiration sweep and wait for its report
    pub async fn run_now(&self) -> Result<SweepReport> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SweepMessage::RunNow { response: tx })
            .await
            .map_err(|_| Error::Storage("Sweep task mailbox closed".to_string()))?;

        rx.await
            .map_err(|_| Error::Storage("Sweep response channel closed".to_string()))?
    }

    /// Stop the sweep task
    pub async fn shutdown(&self) -> Result<()> {
        self.sender
            .send(SweepMessage::Shutdown)
            .await
            .map_err(|_| Error::Storage("Sweep task mailbox closed".to_string()))?;
        Ok(())
    }
}

/// Spawn the background sweep task
pub fn spawn_sweep_scheduler(ledger: Arc<TokenLedger>, period: Duration) -> SweepHandle {
    let (tx, mut rx) = mpsc::channel::<SweepMessage>(16);

    tokio::spawn(async move {
        let mut timer = interval(period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it so tests control timing
        timer.tick().await;

        loop {
            tokio::select! {
                Some(msg) = rx.recv() => {
                    match msg {
                        SweepMessage::RunNow { response } => {
                            let result = ledger.expire_pools(chrono::Utc::now());
                            let _ = response.send(result);
                        }
                        SweepMessage::Shutdown => break,
                    }
                }

                _ = timer.tick() => {
                    if let Err(e) = ledger.expire_pools(chrono::Utc::now()) {
                        tracing::error!("Scheduled expiration sweep failed: {}", e);
                    }
                }

                else => break,
            }
        }

        tracing::info!("Sweep scheduler stopped");
    });

    SweepHandle { sender: tx }
}
