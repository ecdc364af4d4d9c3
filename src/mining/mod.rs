//! Mining module for block assembly and the pending queue

pub mod mempool;
pub mod miner;

pub use mempool::{DroppedEntry, PendingEntry, PendingQueue, QueueError, QueueStats};
pub use miner::{Assembler, BatchSelection, Miner, MiningOutcome, MiningStats};
