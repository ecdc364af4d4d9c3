//! Block assembly and proof-of-work
//!
//! The assembler turns the pending queue into a candidate block. The miner
//! searches nonces for it on a pool of worker threads and gives up as soon
//! as its stop flag is raised, which the ledger does when the tip moves.

use crate::core::{Block, Rejection, Transaction, UtxoSet, Validator};
use chrono::{DateTime, Duration, Utc};
use log::{debug, info};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

/// How many nonces a worker tries between checks of the stop flag
const STOP_CHECK_INTERVAL: u64 = 1024;

// =============================================================================
// Assembler
// =============================================================================

/// Result of walking the pending queue
#[derive(Debug, Default)]
pub struct BatchSelection {
    /// Transactions for the next block, in queue order
    pub accepted: Vec<Transaction>,
    /// Queued transactions that conflict with committed state or the batch
    pub dropped: Vec<(Transaction, Rejection)>,
}

#[derive(Debug, Clone)]
pub struct Assembler {
    validator: Validator,
    max_block_txs: usize,
    difficulty: u32,
}

impl Assembler {
    pub fn new(validator: Validator, max_block_txs: usize, difficulty: u32) -> Self {
        Self {
            validator,
            max_block_txs: max_block_txs.max(1),
            difficulty,
        }
    }

    /// Re-validate queued transactions in order against a fresh trial view
    ///
    /// Each accepted transaction seeds the view, so a later one spending the
    /// same input is dropped with `DoubleSpend`.
    pub fn select_batch<'a>(
        &self,
        pending: impl IntoIterator<Item = &'a Transaction>,
        utxos: &UtxoSet,
    ) -> BatchSelection {
        let mut view = utxos.begin_trial();
        let mut selection = BatchSelection::default();

        for tx in pending {
            if selection.accepted.len() >= self.max_block_txs {
                break;
            }
            match self.validator.admit(tx, &mut view) {
                Ok(validated) => selection.accepted.push(validated.into_inner()),
                Err(reason) => selection.dropped.push((tx.clone(), reason)),
            }
        }

        selection
    }

    /// Unmined block extending `tip`
    pub fn assemble(&self, tip: &Block, batch: Vec<Transaction>, now: DateTime<Utc>) -> Block {
        let timestamp = now.max(tip.timestamp());
        Block::assemble(
            tip.index + 1,
            tip.hash.clone(),
            timestamp,
            self.difficulty,
            batch,
        )
    }
}

// =============================================================================
// Miner
// =============================================================================

/// Mining statistics
#[derive(Debug, Clone)]
pub struct MiningStats {
    /// Number of hash attempts across all workers
    pub hash_attempts: u64,
    /// Time taken in milliseconds
    pub time_ms: u128,
    /// Hash rate (hashes per second)
    pub hash_rate: f64,
    pub threads: usize,
}

#[derive(Debug)]
pub enum MiningOutcome {
    Mined(Block, MiningStats),
    Cancelled,
}

/// Multi-threaded nonce search
#[derive(Debug, Clone)]
pub struct Miner {
    threads: usize,
    /// Last nonce tried before the timestamp is refreshed
    max_nonce: u64,
}

impl Miner {
    pub fn new(threads: usize) -> Self {
        Self {
            threads: threads.max(1),
            max_nonce: u64::MAX,
        }
    }

    /// Cap the nonce space per timestamp
    pub fn with_max_nonce(mut self, max_nonce: u64) -> Self {
        self.max_nonce = max_nonce;
        self
    }

    /// Search for a nonce until one meets the difficulty or `stop` is raised
    ///
    /// Worker `t` tries nonces `t, t + n, t + 2n, ...`. When the nonce space
    /// is exhausted the timestamp is refreshed and the search restarts.
    pub fn mine(&self, mut block: Block, stop: &AtomicBool) -> MiningOutcome {
        let start = Instant::now();
        let attempts = AtomicU64::new(0);

        info!(
            "Mining block {} with difficulty {} on {} threads...",
            block.index, block.header.difficulty, self.threads
        );

        loop {
            if stop.load(Ordering::Relaxed) {
                info!("Mining of block {} cancelled", block.index);
                return MiningOutcome::Cancelled;
            }

            let prefix = block.pow_prefix();
            let difficulty = block.header.difficulty;
            let found = AtomicBool::new(false);
            let winning_nonce = AtomicU64::new(0);

            std::thread::scope(|scope| {
                for worker in 0..self.threads {
                    let (prefix, found, winning_nonce, attempts) =
                        (&prefix, &found, &winning_nonce, &attempts);
                    scope.spawn(move || {
                        let mut tried = 0u64;
                        let nonces = (worker as u64..=self.max_nonce).step_by(self.threads);
                        for nonce in nonces {
                            tried += 1;
                            if tried % STOP_CHECK_INTERVAL == 0
                                && (stop.load(Ordering::Relaxed) || found.load(Ordering::Relaxed))
                            {
                                break;
                            }
                            let hash = Block::hash_with_nonce(prefix, nonce);
                            if crate::crypto::meets_difficulty(&hash, difficulty) {
                                if found
                                    .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                                    .is_ok()
                                {
                                    winning_nonce.store(nonce, Ordering::SeqCst);
                                }
                                break;
                            }
                        }
                        attempts.fetch_add(tried, Ordering::Relaxed);
                    });
                }
            });

            if found.load(Ordering::SeqCst) {
                block.header.nonce = winning_nonce.load(Ordering::SeqCst);
                block.hash = block.calculate_hash();
                break;
            }

            debug!("Nonce space exhausted for block {}, refreshing timestamp", block.index);
            block.header.timestamp =
                Utc::now().max(block.header.timestamp + Duration::milliseconds(1));
        }

        let hash_attempts = attempts.load(Ordering::Relaxed);
        let elapsed = start.elapsed().as_millis();
        let hash_rate = if elapsed > 0 {
            (hash_attempts as f64) / (elapsed as f64 / 1000.0)
        } else {
            hash_attempts as f64
        };

        info!(
            "Block {} mined in {}ms ({} attempts, {:.2} H/s)",
            block.index, elapsed, hash_attempts, hash_rate
        );

        MiningOutcome::Mined(
            block,
            MiningStats {
                hash_attempts,
                time_ms: elapsed,
                hash_rate,
                threads: self.threads,
            },
        )
    }
}
