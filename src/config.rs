//! Ledger configuration
//!
//! Plain defaults; the CLI overrides individual fields from flags.

use crate::core::{Amount, DEFAULT_DIFFICULTY, MAX_BLOCK_TXS, MAX_DIFFICULTY};
use crate::levy::LevyPolicy;
use crate::storage::StorageConfig;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Default REST API port
pub const DEFAULT_API_PORT: u16 = 3001;

/// Default maximum transactions per block
pub const DEFAULT_MAX_BLOCK_TXS: usize = 100;

/// Fractional digits of the display unit
pub const DEFAULT_DECIMALS: u32 = 2;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Difficulty {0} exceeds {MAX_DIFFICULTY} bits")]
    DifficultyTooHigh(u32),
    #[error("Block size must be between 1 and {MAX_BLOCK_TXS} transactions, got {0}")]
    BlockSize(usize),
}

#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// Required leading zero bits of every new block hash
    pub difficulty: u32,
    pub max_block_txs: usize,
    /// Fee every transfer carries, in minor units
    pub transfer_fee: Amount,
    pub decimals: u32,
    pub levy: LevyPolicy,
    pub mining_threads: usize,
    /// How often the mining worker checks the queue without being woken
    pub mine_interval: Duration,
    pub levy_interval: Duration,
    pub storage: StorageConfig,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        let mining_threads = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            .min(4);

        Self {
            difficulty: DEFAULT_DIFFICULTY,
            max_block_txs: DEFAULT_MAX_BLOCK_TXS,
            transfer_fee: 0,
            decimals: DEFAULT_DECIMALS,
            levy: LevyPolicy::default(),
            mining_threads,
            mine_interval: Duration::from_secs(2),
            levy_interval: Duration::from_secs(60),
            storage: StorageConfig::default(),
        }
    }
}

impl LedgerConfig {
    /// Defaults with all files under `data_dir`
    pub fn in_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            storage: StorageConfig::in_dir(data_dir),
            ..Default::default()
        }
    }

    pub fn with_difficulty(mut self, difficulty: u32) -> Self {
        self.difficulty = difficulty;
        self
    }

    /// Refuse settings no block could satisfy
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.difficulty > MAX_DIFFICULTY {
            return Err(ConfigError::DifficultyTooHigh(self.difficulty));
        }
        if self.max_block_txs == 0 || self.max_block_txs > MAX_BLOCK_TXS {
            return Err(ConfigError::BlockSize(self.max_block_txs));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = LedgerConfig::default();
        assert_eq!(config.difficulty, 16);
        assert_eq!(config.max_block_txs, 100);
        assert_eq!(config.decimals, 2);
        assert_eq!(config.levy.rate_bps, 250);
        assert!((1..=4).contains(&config.mining_threads));
        assert_eq!(config.storage.chain_file, "chain.json");
    }

    #[test]
    fn test_in_dir() {
        let config = LedgerConfig::in_dir("/tmp/ledger").with_difficulty(4);
        assert_eq!(config.storage.data_dir, PathBuf::from("/tmp/ledger"));
        assert_eq!(config.storage.wallets_dir(), PathBuf::from("/tmp/ledger/wallets"));
        assert_eq!(config.difficulty, 4);
    }

    #[test]
    fn test_validate_bounds() {
        assert!(LedgerConfig::default().validate().is_ok());
        assert!(LedgerConfig::default().with_difficulty(256).validate().is_ok());
        assert_eq!(
            LedgerConfig::default().with_difficulty(257).validate(),
            Err(ConfigError::DifficultyTooHigh(257))
        );

        let mut config = LedgerConfig::default();
        config.max_block_txs = MAX_BLOCK_TXS + 1;
        assert_eq!(config.validate(), Err(ConfigError::BlockSize(MAX_BLOCK_TXS + 1)));
        config.max_block_txs = 0;
        assert_eq!(config.validate(), Err(ConfigError::BlockSize(0)));
    }
}
