//! REST API module
//!
//! HTTP access to the ledger. Amounts are decimal strings in display units.
//!
//! # Endpoints
//!
//! ## Wallets
//! - `GET /api/wallets` - List wallets
//! - `POST /api/wallets` - Register a wallet
//! - `GET /api/wallet/{walletId}` - Balance, UTXOs and owed zakat
//! - `GET /api/wallet/{walletId}/balance` - Balance only
//!
//! ## Transactions
//! - `POST /api/transactions/send` - Sign and queue a transfer
//! - `POST /api/transactions/submit` - Queue a client-signed transaction
//! - `GET /api/transactions/history/{walletId}` - Wallet history
//! - `GET /api/transactions/pending/list` - Pending transactions
//! - `GET /api/transactions/{hash}` - Transaction and commit status
//!
//! ## Chain
//! - `GET /api/blockchain/blocks` - All blocks
//! - `GET /api/blockchain/blocks/{hash}` - One block
//! - `GET /api/blockchain/status` - Tip and queue size
//! - `GET /api/blockchain/info` - Chain statistics
//! - `GET /api/blockchain/validate` - Re-verify the chain
//! - `POST /api/blockchain/mine-pending` - Mine one block now
//!
//! ## Zakat
//! - `POST /api/zakat/process/{walletId}` - Levy one wallet now
//! - `POST /api/treasury/issue` - Mint funds to a wallet
//!
//! ## WebSocket
//! - `GET /ws` - Ledger events (TransactionQueued, TransactionDropped,
//!   BlockCommitted, LevyScheduled)

pub mod handlers;
pub mod routes;
pub mod websocket;

pub use handlers::ApiState;
pub use routes::create_router;
