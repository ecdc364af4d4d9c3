//! Wallet registry
//!
//! Keeps every custodial wallet in memory and one JSON file per wallet under
//! `wallets/`. The treasury wallet lives in `wallets/treasury.json` and is
//! created on first start; it is the only wallet allowed to issue value.

use crate::wallet::wallet::{Wallet, WalletError, WalletInfo};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

const TREASURY_FILE: &str = "treasury.json";
const TREASURY_LABEL: &str = "treasury";

pub struct WalletRegistry {
    wallets_dir: PathBuf,
    wallets: HashMap<String, Wallet>,
    /// Wallet ids in registration order
    order: Vec<String>,
    treasury_id: String,
}

impl WalletRegistry {
    /// Load every wallet under `wallets_dir`, creating the treasury if absent
    pub fn open(wallets_dir: &Path) -> Result<Self, WalletError> {
        fs::create_dir_all(wallets_dir)?;

        let treasury_path = wallets_dir.join(TREASURY_FILE);
        let treasury = if treasury_path.exists() {
            Wallet::load(&treasury_path)?
        } else {
            let wallet = Wallet::new(Some(TREASURY_LABEL));
            wallet.save(&treasury_path)?;
            log::info!("Created treasury wallet {}", wallet.wallet_id());
            wallet
        };

        let mut loaded = Vec::new();
        for entry in fs::read_dir(wallets_dir)? {
            let path = entry?.path();
            let is_json = path.extension().map(|e| e == "json").unwrap_or(false);
            if !is_json || path.file_name().map(|n| n == TREASURY_FILE).unwrap_or(false) {
                continue;
            }
            match Wallet::load(&path) {
                Ok(wallet) => loaded.push(wallet),
                Err(e) => log::warn!("Skipping wallet file {}: {}", path.display(), e),
            }
        }
        loaded.sort_by_key(|w| w.created_at);

        let mut registry = Self {
            wallets_dir: wallets_dir.to_path_buf(),
            wallets: HashMap::new(),
            order: Vec::new(),
            treasury_id: treasury.wallet_id(),
        };
        registry.insert(treasury);
        for wallet in loaded {
            registry.insert(wallet);
        }

        log::info!("Loaded {} wallets", registry.len());
        Ok(registry)
    }

    fn insert(&mut self, wallet: Wallet) {
        let id = wallet.wallet_id();
        if self.wallets.insert(id.clone(), wallet).is_none() {
            self.order.push(id);
        }
    }

    /// Create, persist and register a new wallet
    pub fn register(&mut self, label: Option<&str>) -> Result<&Wallet, WalletError> {
        let wallet = Wallet::new(label);
        let id = wallet.wallet_id();
        wallet.save(&self.wallet_path(&id))?;
        self.insert(wallet);
        self.get(&id)
            .ok_or(WalletError::UnknownWallet(id))
    }

    fn wallet_path(&self, wallet_id: &str) -> PathBuf {
        self.wallets_dir.join(format!("{}.json", wallet_id))
    }

    pub fn get(&self, wallet_id: &str) -> Option<&Wallet> {
        self.wallets.get(wallet_id)
    }

    pub fn require(&self, wallet_id: &str) -> Result<&Wallet, WalletError> {
        self.get(wallet_id)
            .ok_or_else(|| WalletError::UnknownWallet(wallet_id.to_string()))
    }

    pub fn contains(&self, wallet_id: &str) -> bool {
        self.wallets.contains_key(wallet_id)
    }

    pub fn treasury(&self) -> Option<&Wallet> {
        self.wallets.get(&self.treasury_id)
    }

    pub fn treasury_id(&self) -> &str {
        &self.treasury_id
    }

    /// Wallets in registration order, treasury first
    pub fn iter(&self) -> impl Iterator<Item = &Wallet> {
        self.order.iter().filter_map(move |id| self.wallets.get(id))
    }

    pub fn list(&self) -> Vec<WalletInfo> {
        self.iter().map(Wallet::export_public_info).collect()
    }

    pub fn len(&self) -> usize {
        self.wallets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.wallets.is_empty()
    }
}
