//! Ledger facade, events and background workers

pub mod events;
pub mod facade;
pub mod workers;

pub use events::{EventBus, LedgerEvent};
pub use facade::{
    ChainInfo, ChainValidation, HistoryEntry, HistoryKind, HistoryStatus, Ledger, LedgerError,
    LedgerState, LevyOutcome, MerkleStep, TransactionRecord, TransactionStatus, WalletSnapshot,
};
pub use workers::{spawn as spawn_workers, Workers};
