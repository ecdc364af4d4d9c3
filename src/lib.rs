//! Zakat Ledger: a custodial UTXO wallet ledger with a periodic levy
//!
//! This crate provides:
//! - SHA-256 hashing and secp256k1 ECDSA signatures
//! - A UTXO set with read-isolated trial views for validation
//! - Transaction validation with closed rejection reasons
//! - Cancellable multi-threaded proof-of-work block assembly
//! - An append-only chain store with JSON persistence
//! - A 2.5% zakat levy scheduled per wallet
//! - An async ledger facade, REST API and WebSocket event stream
//!
//! # Example
//!
//! ```no_run
//! use zakat_ledger::config::LedgerConfig;
//! use zakat_ledger::ledger::Ledger;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let ledger = Ledger::open(LedgerConfig::in_dir("/tmp/zakat").with_difficulty(8))?;
//! let alice = ledger.register_wallet(Some("alice")).await?.wallet_id;
//! let bob = ledger.register_wallet(Some("bob")).await?.wallet_id;
//!
//! ledger.issue(&alice, 10_000).await?;
//! ledger.mine_pending().await?;
//!
//! let hash = ledger.submit_transfer(&alice, &bob, 7_000, "rent").await?;
//! ledger.mine_pending().await?;
//! println!("{:?}", ledger.transaction_status(&hash).await);
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod cli;
pub mod config;
pub mod core;
pub mod crypto;
pub mod ledger;
pub mod levy;
pub mod mining;
pub mod storage;
pub mod wallet;

// Re-export commonly used types
pub use api::{create_router, ApiState};
pub use config::LedgerConfig;
pub use core::{Block, Rejection, Transaction, TxKind, DEFAULT_DIFFICULTY};
pub use crypto::KeyPair;
pub use ledger::{Ledger, LedgerError, LedgerEvent};
pub use levy::{LevyPolicy, LevyScheduler};
pub use mining::{Assembler, Miner, PendingQueue};
pub use storage::Storage;
pub use wallet::{Wallet, WalletRegistry};
