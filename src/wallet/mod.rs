//! Wallet module for custodial keys

pub mod registry;
pub mod wallet;

pub use registry::WalletRegistry;
pub use wallet::{Wallet, WalletError, WalletInfo};
