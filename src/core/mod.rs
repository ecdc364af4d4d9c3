//! Core ledger components
//!
//! - Amounts (integer minor units, decimal parsing at the edges)
//! - Transactions (transfer, levy, issuance)
//! - Blocks (proof of work over a merkle-committed header)
//! - UTXO set (commit, rollback, trial views)
//! - Validator (ordered rejection checks)
//! - Chain store (append, lookups, replay)

pub mod amount;
pub mod block;
pub mod chain;
pub mod transaction;
pub mod utxo;
pub mod validator;

pub use amount::{format_amount, parse_amount, Amount};
pub use block::{
    Block, BlockHeader, GENESIS_PREVIOUS_HASH, GENESIS_TIMESTAMP, MAX_BLOCK_TXS, MAX_DIFFICULTY,
};
pub use chain::{ChainAppendFailure, ChainStats, ChainStore, ChainTransaction, DEFAULT_DIFFICULTY};
pub use transaction::{
    utxo_id, Transaction, TransactionBuilder, TransactionError, TransactionOutput, TxKind,
    LEVY_SINK, TX_VERSION,
};
pub use utxo::{TrialView, Utxo, UtxoError, UtxoSet, UtxoStatus};
pub use validator::{Rejection, ValidatedTransaction, Validator};
