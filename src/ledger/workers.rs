//! Background mining and levy loops

use crate::ledger::facade::{Ledger, LedgerError};
use chrono::Utc;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};

/// Handles of the spawned worker tasks
pub struct Workers {
    pub miner: JoinHandle<()>,
    pub levy: JoinHandle<()>,
}

impl Workers {
    /// Wait for both loops to exit after `Ledger::shutdown`
    pub async fn join(self) {
        let _ = self.miner.await;
        let _ = self.levy.await;
    }
}

/// Spawn the mining and levy loops on the current runtime
pub fn spawn(ledger: Arc<Ledger>) -> Workers {
    Workers {
        miner: tokio::spawn(mining_loop(ledger.clone())),
        levy: tokio::spawn(levy_loop(ledger)),
    }
}

/// Mine whenever work is queued, and periodically in case a wake-up was missed
async fn mining_loop(ledger: Arc<Ledger>) {
    let shutdown = ledger.shutdown_token();
    let idle = ledger.config().mine_interval;
    log::info!("Mining worker started");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ledger.work_queued() => {}
            _ = sleep(idle) => {}
        }

        // Drain the queue one block at a time
        loop {
            match ledger.mine_pending().await {
                Ok(Some(block)) => {
                    log::debug!("Worker mined block #{}", block.index);
                }
                Ok(None) => break,
                Err(LedgerError::ShuttingDown) => break,
                Err(e) => {
                    log::error!("Mining failed: {}", e);
                    break;
                }
            }
        }
    }

    log::info!("Mining worker stopped");
}

async fn levy_loop(ledger: Arc<Ledger>) {
    let shutdown = ledger.shutdown_token();
    let mut ticker = interval(ledger.config().levy_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    log::info!("Levy worker started");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = ledger.run_levy_tick(Utc::now()).await {
                    log::error!("Levy tick failed: {}", e);
                }
            }
        }
    }

    log::info!("Levy worker stopped");
}
