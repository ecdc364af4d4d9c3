//! Pending transaction queue
//!
//! Validated transactions waiting for a block, in arrival order. The queue
//! also remembers recently dropped transactions and why, so a client polling
//! for status can learn that a queued transfer will never commit.

use crate::core::{Rejection, Transaction};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use thiserror::Error;

// =============================================================================
// Configuration
// =============================================================================

/// Default maximum number of queued transactions
pub const DEFAULT_QUEUE_SIZE: usize = 10_000;

/// How many dropped transactions are remembered for status queries
pub const MAX_DROPPED_RECORDS: usize = 1_000;

// =============================================================================
// Error Types
// =============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("Transaction already queued: {0}")]
    DuplicateTransaction(String),
    #[error("Pending queue full ({0} transactions)")]
    QueueFull(usize),
}

// =============================================================================
// Queue Entry
// =============================================================================

#[derive(Debug, Clone)]
pub struct PendingEntry {
    pub tx: Transaction,
    /// When the transaction entered the queue
    pub queued_at: DateTime<Utc>,
}

/// A transaction that left the queue without committing
#[derive(Debug, Clone)]
pub struct DroppedEntry {
    pub tx: Transaction,
    pub reason: Rejection,
    pub dropped_at: DateTime<Utc>,
}

// =============================================================================
// Pending Queue
// =============================================================================

#[derive(Debug)]
pub struct PendingQueue {
    entries: HashMap<String, PendingEntry>,
    /// Hashes in arrival order
    order: VecDeque<String>,
    dropped: HashMap<String, DroppedEntry>,
    /// Dropped hashes, oldest first, for eviction
    dropped_order: VecDeque<String>,
    max_size: usize,
}

impl Default for PendingQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_QUEUE_SIZE)
    }

    pub fn with_capacity(max_size: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            dropped: HashMap::new(),
            dropped_order: VecDeque::new(),
            max_size,
        }
    }

    /// Append a validated transaction
    pub fn push(&mut self, tx: Transaction) -> Result<(), QueueError> {
        if self.entries.contains_key(&tx.hash) {
            return Err(QueueError::DuplicateTransaction(tx.hash));
        }
        if self.entries.len() >= self.max_size {
            return Err(QueueError::QueueFull(self.max_size));
        }

        let hash = tx.hash.clone();
        if self.dropped.remove(&hash).is_some() {
            self.dropped_order.retain(|h| h != &hash);
        }
        self.order.push_back(hash.clone());
        self.entries.insert(
            hash,
            PendingEntry {
                tx,
                queued_at: Utc::now(),
            },
        );
        Ok(())
    }

    pub fn contains(&self, hash: &str) -> bool {
        self.entries.contains_key(hash)
    }

    pub fn get(&self, hash: &str) -> Option<&PendingEntry> {
        self.entries.get(hash)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Queued transactions, oldest first
    pub fn transactions(&self) -> impl Iterator<Item = &Transaction> {
        self.order
            .iter()
            .filter_map(move |hash| self.entries.get(hash))
            .map(|entry| &entry.tx)
    }

    /// Owned copy of the queue, oldest first
    pub fn snapshot(&self) -> Vec<Transaction> {
        self.transactions().cloned().collect()
    }

    /// Queued transactions the wallet sends or receives
    pub fn involving<'a>(&'a self, wallet_id: &'a str) -> impl Iterator<Item = &'a PendingEntry> {
        self.order
            .iter()
            .filter_map(move |hash| self.entries.get(hash))
            .filter(move |entry| entry.tx.involves(wallet_id))
    }

    /// Forget transactions that made it into a block
    pub fn remove_committed<'a>(&mut self, hashes: impl IntoIterator<Item = &'a str>) {
        let mut removed = false;
        for hash in hashes {
            removed |= self.entries.remove(hash).is_some();
        }
        if removed {
            let entries = &self.entries;
            self.order.retain(|hash| entries.contains_key(hash));
        }
    }

    /// Remove a transaction that can no longer commit and remember why
    pub fn drop_transaction(&mut self, hash: &str, reason: Rejection) -> Option<Transaction> {
        let entry = self.entries.remove(hash)?;
        self.order.retain(|h| h != hash);

        log::warn!("Dropped pending transaction {}: {}", hash, reason);
        self.record_dropped(entry.tx.clone(), reason);
        Some(entry.tx)
    }

    fn record_dropped(&mut self, tx: Transaction, reason: Rejection) {
        let hash = tx.hash.clone();
        if self.dropped.len() >= MAX_DROPPED_RECORDS {
            if let Some(oldest) = self.dropped_order.pop_front() {
                self.dropped.remove(&oldest);
            }
        }
        self.dropped_order.push_back(hash.clone());
        self.dropped.insert(
            hash,
            DroppedEntry {
                tx,
                reason,
                dropped_at: Utc::now(),
            },
        );
    }

    pub fn dropped(&self, hash: &str) -> Option<&DroppedEntry> {
        self.dropped.get(hash)
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            tx_count: self.entries.len(),
            total_fees: self.entries.values().map(|e| e.tx.fee).sum(),
            dropped_count: self.dropped.len(),
            oldest: self.order.front().and_then(|h| self.entries.get(h)).map(|e| e.queued_at),
        }
    }
}

/// Pending queue statistics
#[derive(Debug, Clone)]
pub struct QueueStats {
    pub tx_count: usize,
    pub total_fees: u64,
    pub dropped_count: usize,
    pub oldest: Option<DateTime<Utc>>,
}

// =============================================================================
// Tests
// =============================================================================
