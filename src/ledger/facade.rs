//! The wallet ledger facade
//!
//! `Ledger` owns all process state: the chain, the UTXO set, the pending
//! queue, the custodial wallets and the levy schedule. Every external
//! operation goes through it.
//!
//! Locks are always taken in the order wallets, state, pending, levy. The
//! state write lock is held only for the commit critical section; mining
//! runs outside every lock.

use crate::config::{ConfigError, LedgerConfig};
use crate::core::{
    format_amount, Amount, Block, ChainAppendFailure, ChainStore, Rejection, Transaction,
    TransactionError, TrialView, TxKind, Utxo, UtxoError, UtxoSet, Validator, LEVY_SINK,
};
use crate::levy::{LevyScheduler, LEVY_NOTE};
use crate::ledger::events::{EventBus, LedgerEvent};
use crate::mining::{Assembler, Miner, MiningOutcome, PendingQueue, QueueError};
use crate::storage::{Storage, StorageError};
use crate::wallet::{Wallet, WalletError, WalletInfo, WalletRegistry};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, watch, Mutex, Notify, RwLock};
use tokio_util::sync::CancellationToken;

/// Re-assembly attempts per `mine_pending` call when the tip keeps moving
const MAX_MINING_ATTEMPTS: usize = 5;

// =============================================================================
// Errors
// =============================================================================

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Transaction rejected: {0}")]
    Rejected(#[from] Rejection),
    #[error("Unknown wallet: {0}")]
    UnknownWallet(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Block rejected: {0}")]
    Append(#[from] ChainAppendFailure),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Wallet error: {0}")]
    Wallet(WalletError),
    #[error("UTXO error: {0}")]
    Utxo(#[from] UtxoError),
    #[error("Pending queue: {0}")]
    Queue(#[from] QueueError),
    #[error("Transaction error: {0}")]
    Transaction(#[from] TransactionError),
    #[error("Mining task failed: {0}")]
    Mining(String),
    #[error("Ledger is shutting down")]
    ShuttingDown,
}

impl From<WalletError> for LedgerError {
    fn from(e: WalletError) -> Self {
        match e {
            WalletError::UnknownWallet(id) => LedgerError::UnknownWallet(id),
            WalletError::TransactionError(e) => LedgerError::Transaction(e),
            other => LedgerError::Wallet(other),
        }
    }
}

// =============================================================================
// Views
// =============================================================================

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletSnapshot {
    pub wallet_id: String,
    pub balance: Amount,
    /// Unspent outputs, oldest first
    pub utxos: Vec<Utxo>,
    /// Levy the wallet would owe on its current balance
    pub pending_levy: Amount,
    pub next_levy_due: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryKind {
    Sent,
    Received,
    Levy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryStatus {
    Confirmed,
    Pending,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    /// Transaction hash
    pub id: String,
    #[serde(rename = "type")]
    pub kind: HistoryKind,
    pub amount: Amount,
    pub fee: Amount,
    pub counterparty: String,
    pub note: String,
    pub timestamp: DateTime<Utc>,
    pub status: HistoryStatus,
    pub block_hash: Option<String>,
}

impl HistoryEntry {
    fn from_transaction(
        wallet_id: &str,
        tx: &Transaction,
        status: HistoryStatus,
        block_hash: Option<String>,
    ) -> Self {
        let (kind, counterparty) = if tx.kind == TxKind::Levy {
            (HistoryKind::Levy, LEVY_SINK.to_string())
        } else if tx.sender_wallet_id == wallet_id {
            (HistoryKind::Sent, tx.recipient_wallet_id.clone())
        } else {
            (HistoryKind::Received, tx.sender_wallet_id.clone())
        };

        Self {
            id: tx.hash.clone(),
            kind,
            amount: tx.amount,
            fee: tx.fee,
            counterparty,
            note: tx.note.clone(),
            timestamp: tx.timestamp,
            status,
            block_hash,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum TransactionStatus {
    Pending,
    #[serde(rename_all = "camelCase")]
    Confirmed { block_hash: String, block_index: u64 },
    Dropped { reason: Rejection },
    Unknown,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MerkleStep {
    pub hash: String,
    /// Whether the sibling sits on the left
    pub left: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionRecord {
    pub transaction: Transaction,
    #[serde(flatten)]
    pub status: TransactionStatus,
    /// Inclusion proof against the block's merkle root, once confirmed
    pub merkle_proof: Option<Vec<MerkleStep>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainInfo {
    pub height: u64,
    pub total_blocks: u64,
    pub total_transactions: u64,
    pub difficulty: u32,
    pub latest_hash: String,
    pub total_unspent: String,
    pub unspent_outputs: usize,
    pub pending_transactions: usize,
    pub dropped_transactions: usize,
    pub wallets: usize,
    pub treasury_wallet_id: String,
    pub chain_file_bytes: u64,
    pub backups: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainValidation {
    pub valid: bool,
    pub height: u64,
    /// First block failing linkage, proof-of-work or merkle checks
    pub first_invalid: Option<u64>,
    /// Whether replaying the chain reproduces the live UTXO set
    pub utxo_replay_matches: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum LevyOutcome {
    #[serde(rename_all = "camelCase")]
    Queued { transaction_hash: String, amount: Amount },
    NothingOwed,
    #[serde(rename_all = "camelCase")]
    AlreadyQueued { transaction_hash: String },
}

// =============================================================================
// Ledger
// =============================================================================

pub struct LedgerState {
    pub chain: ChainStore,
    pub utxos: UtxoSet,
}

pub struct Ledger {
    config: LedgerConfig,
    validator: Validator,
    assembler: Assembler,
    miner: Miner,
    state: RwLock<LedgerState>,
    pending: Mutex<PendingQueue>,
    wallets: RwLock<WalletRegistry>,
    levy: Mutex<LevyScheduler>,
    storage: Storage,
    events: EventBus,
    /// Hash of the current tip; in-flight mining watches it
    tip: watch::Sender<String>,
    /// Wakes the mining worker when work is queued
    work: Notify,
    /// Serialises `mine_pending` callers
    mining: Mutex<()>,
    shutdown: CancellationToken,
}

impl Ledger {
    /// Load persisted state or start a fresh chain at genesis
    pub fn open(config: LedgerConfig) -> Result<Self, LedgerError> {
        config.validate()?;
        let storage = Storage::new(config.storage.clone())?;
        let wallets = WalletRegistry::open(&config.storage.wallets_dir())?;

        let (chain, utxos) = match storage.load()? {
            Some(blocks) => {
                info!("Loading chain from {}", config.storage.data_dir.display());
                ChainStore::from_blocks(blocks, config.difficulty)?
            }
            None => {
                let chain = ChainStore::new(config.difficulty);
                storage.save(chain.all_blocks())?;
                info!("Initialized new chain at genesis {}", chain.tip().hash);
                (chain, UtxoSet::new())
            }
        };

        let validator = Validator::new(config.transfer_fee).with_issuer(wallets.treasury_id());
        let assembler = Assembler::new(validator.clone(), config.max_block_txs, config.difficulty);
        let miner = Miner::new(config.mining_threads);

        let levy = LevyScheduler::restore(
            config.levy.clone(),
            wallets
                .iter()
                .filter(|w| w.wallet_id() != wallets.treasury_id())
                .map(|w| (w.wallet_id(), w.created_at)),
            &chain,
        );

        info!(
            "Ledger ready: height {}, {} wallets, difficulty {}",
            chain.height(),
            wallets.len(),
            config.difficulty
        );

        let (tip, _) = watch::channel(chain.tip().hash.clone());
        Ok(Self {
            config,
            validator,
            assembler,
            miner,
            state: RwLock::new(LedgerState { chain, utxos }),
            pending: Mutex::new(PendingQueue::new()),
            wallets: RwLock::new(wallets),
            levy: Mutex::new(levy),
            storage,
            events: EventBus::new(),
            tip,
            work: Notify::new(),
            mining: Mutex::new(()),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub fn format(&self, amount: Amount) -> String {
        format_amount(amount, self.config.decimals)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LedgerEvent> {
        self.events.subscribe()
    }

    /// Resolves when `shutdown` is called
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub(crate) async fn work_queued(&self) {
        self.work.notified().await
    }

    /// Stop workers and cancel in-flight mining
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.work.notify_waiters();
    }

    // =========================================================================
    // Wallets
    // =========================================================================

    pub async fn register_wallet(&self, label: Option<&str>) -> Result<WalletInfo, LedgerError> {
        let mut wallets = self.wallets.write().await;
        let info = wallets.register(label)?.export_public_info();
        self.levy.lock().await.track(&info.wallet_id, info.created_at);
        info!("Registered wallet {}", info.wallet_id);
        Ok(info)
    }

    pub async fn list_wallets(&self) -> Vec<WalletInfo> {
        self.wallets.read().await.list()
    }

    pub async fn treasury_id(&self) -> String {
        self.wallets.read().await.treasury_id().to_string()
    }

    pub async fn wallet_snapshot(&self, wallet_id: &str) -> Result<WalletSnapshot, LedgerError> {
        self.require_wallet(wallet_id).await?;

        let state = self.state.read().await;
        let balance = state.utxos.balance_of(wallet_id);
        let utxos = state
            .utxos
            .unspent_of(wallet_id)
            .into_iter()
            .cloned()
            .collect();
        drop(state);

        let levy = self.levy.lock().await;
        Ok(WalletSnapshot {
            wallet_id: wallet_id.to_string(),
            balance,
            utxos,
            pending_levy: levy.policy().levy_amount(balance),
            next_levy_due: levy.next_due(wallet_id),
        })
    }

    async fn require_wallet(&self, wallet_id: &str) -> Result<(), LedgerError> {
        if self.wallets.read().await.contains(wallet_id) {
            Ok(())
        } else {
            Err(LedgerError::UnknownWallet(wallet_id.to_string()))
        }
    }

    /// Confirmed transactions in chain order, then pending ones
    pub async fn history(&self, wallet_id: &str) -> Result<Vec<HistoryEntry>, LedgerError> {
        self.require_wallet(wallet_id).await?;

        let state = self.state.read().await;
        let pending = self.pending.lock().await;

        let mut entries: Vec<HistoryEntry> = state
            .chain
            .transactions_for(wallet_id)
            .into_iter()
            .map(|entry| {
                HistoryEntry::from_transaction(
                    wallet_id,
                    entry.transaction,
                    HistoryStatus::Confirmed,
                    Some(entry.block.hash.clone()),
                )
            })
            .collect();
        entries.extend(pending.involving(wallet_id).map(|entry| {
            HistoryEntry::from_transaction(wallet_id, &entry.tx, HistoryStatus::Pending, None)
        }));
        Ok(entries)
    }

    // =========================================================================
    // Submission
    // =========================================================================

    /// Sign a transfer with the sender's custodial key and queue it
    ///
    /// Inputs are chosen oldest first among outputs no pending transaction
    /// spends. Returns the transaction hash; the transfer commits later.
    pub async fn submit_transfer(
        &self,
        sender: &str,
        recipient: &str,
        amount: Amount,
        note: &str,
    ) -> Result<String, LedgerError> {
        let wallets = self.wallets.read().await;
        let wallet = wallets.require(sender)?;
        if !wallets.contains(recipient) {
            return Err(LedgerError::UnknownWallet(recipient.to_string()));
        }

        let state = self.state.read().await;
        let mut pending = self.pending.lock().await;
        let view = seeded_view(&state.utxos, &pending);

        let spendable = view.spendable_of(sender);
        let tx = wallet.build_transfer(
            recipient,
            amount,
            self.config.transfer_fee,
            note,
            &spendable,
        )?;
        let validated = self.validator.validate(&tx, &view)?;
        self.enqueue(&mut pending, validated.into_inner())
    }

    /// Queue a transaction signed elsewhere
    pub async fn submit_transaction(&self, tx: Transaction) -> Result<String, LedgerError> {
        let state = self.state.read().await;
        let mut pending = self.pending.lock().await;
        if pending.contains(&tx.hash) || state.chain.find_transaction(&tx.hash).is_some() {
            return Err(QueueError::DuplicateTransaction(tx.hash).into());
        }

        let view = seeded_view(&state.utxos, &pending);
        let validated = self.validator.validate(&tx, &view)?;

        let mut levy = self.levy.lock().await;
        check_levy_policy(&tx, &state.utxos, &levy, Utc::now())?;
        let hash = self.enqueue(&mut pending, validated.into_inner())?;
        if tx.kind == TxKind::Levy && levy.in_flight(&tx.sender_wallet_id).is_none() {
            levy.mark_in_flight(&tx.sender_wallet_id, &hash);
        }
        Ok(hash)
    }

    /// Mint `amount` to `recipient` from the treasury
    pub async fn issue(&self, recipient: &str, amount: Amount) -> Result<String, LedgerError> {
        let wallets = self.wallets.read().await;
        if !wallets.contains(recipient) {
            return Err(LedgerError::UnknownWallet(recipient.to_string()));
        }
        let treasury = wallets
            .treasury()
            .ok_or_else(|| LedgerError::UnknownWallet(wallets.treasury_id().to_string()))?;

        let tx = crate::core::TransactionBuilder::issuance(&treasury.wallet_id(), recipient, amount)
            .note("Treasury issuance")
            .build_and_sign(treasury.key_pair())?;

        let state = self.state.read().await;
        let mut pending = self.pending.lock().await;
        let view = seeded_view(&state.utxos, &pending);
        let validated = self.validator.validate(&tx, &view)?;
        self.enqueue(&mut pending, validated.into_inner())
    }

    fn enqueue(&self, pending: &mut PendingQueue, tx: Transaction) -> Result<String, LedgerError> {
        let event = LedgerEvent::TransactionQueued {
            hash: tx.hash.clone(),
            kind: tx.kind,
            sender_wallet_id: tx.sender_wallet_id.clone(),
            recipient_wallet_id: tx.recipient_wallet_id.clone(),
            amount: self.format(tx.amount),
        };
        let hash = tx.hash.clone();
        pending.push(tx)?;

        debug!("Queued transaction {}", hash);
        self.events.publish(event);
        self.work.notify_one();
        Ok(hash)
    }

    // =========================================================================
    // Lookups
    // =========================================================================

    pub async fn list_blocks(&self) -> Vec<Block> {
        self.state.read().await.chain.all_blocks().to_vec()
    }

    pub async fn block(&self, hash: &str) -> Option<Block> {
        self.state.read().await.chain.block_by_hash(hash).cloned()
    }

    pub async fn block_at(&self, index: u64) -> Option<Block> {
        self.state.read().await.chain.block_at(index).cloned()
    }

    pub async fn pending_transactions(&self) -> Vec<Transaction> {
        self.pending.lock().await.snapshot()
    }

    pub async fn transaction(&self, hash: &str) -> Option<TransactionRecord> {
        let state = self.state.read().await;
        if let Some(found) = state.chain.find_transaction(hash) {
            let merkle_proof = found.block.merkle_proof(hash).map(|proof| {
                proof
                    .siblings
                    .into_iter()
                    .map(|(sibling, left)| MerkleStep {
                        hash: hex::encode(sibling),
                        left,
                    })
                    .collect()
            });
            return Some(TransactionRecord {
                transaction: found.transaction.clone(),
                status: TransactionStatus::Confirmed {
                    block_hash: found.block.hash.clone(),
                    block_index: found.block.index,
                },
                merkle_proof,
            });
        }

        let pending = self.pending.lock().await;
        if let Some(entry) = pending.get(hash) {
            return Some(TransactionRecord {
                transaction: entry.tx.clone(),
                status: TransactionStatus::Pending,
                merkle_proof: None,
            });
        }
        pending.dropped(hash).map(|entry| TransactionRecord {
            transaction: entry.tx.clone(),
            status: TransactionStatus::Dropped {
                reason: entry.reason,
            },
            merkle_proof: None,
        })
    }

    pub async fn transaction_status(&self, hash: &str) -> TransactionStatus {
        self.transaction(hash)
            .await
            .map(|record| record.status)
            .unwrap_or(TransactionStatus::Unknown)
    }

    pub async fn chain_info(&self) -> ChainInfo {
        let wallets = self.wallets.read().await;
        let state = self.state.read().await;
        let queue = self.pending.lock().await.stats();
        let stats = state.chain.stats(&state.utxos);
        let (chain_file_bytes, backups) = match self.storage.stats() {
            Ok(disk) => (disk.file_size, disk.backup_count),
            Err(e) => {
                warn!("Cannot read storage stats: {}", e);
                (0, 0)
            }
        };

        ChainInfo {
            height: stats.height,
            total_blocks: stats.total_blocks,
            total_transactions: stats.total_transactions,
            difficulty: stats.difficulty,
            latest_hash: stats.latest_hash,
            total_unspent: format_total(stats.total_unspent, self.config.decimals),
            unspent_outputs: state.utxos.unspent_count(),
            pending_transactions: queue.tx_count,
            dropped_transactions: queue.dropped_count,
            wallets: wallets.len(),
            treasury_wallet_id: wallets.treasury_id().to_string(),
            chain_file_bytes,
            backups,
        }
    }

    /// Re-verify every block and check that replay reproduces the UTXO set
    pub async fn validate_chain(&self) -> ChainValidation {
        let state = self.state.read().await;
        let first_invalid = state.chain.verify().err();
        let utxo_replay_matches = UtxoSet::replay(state.chain.all_blocks())
            .map(|replayed| replayed == state.utxos)
            .unwrap_or(false);

        ChainValidation {
            valid: first_invalid.is_none() && utxo_replay_matches,
            height: state.chain.height(),
            first_invalid,
            utxo_replay_matches,
        }
    }

    // =========================================================================
    // Mining and commit
    // =========================================================================

    /// Assemble, mine and commit one block from the pending queue
    ///
    /// Returns `None` when nothing is pending. If the tip moves while mining,
    /// the candidate is discarded and the batch is re-assembled.
    pub async fn mine_pending(&self) -> Result<Option<Block>, LedgerError> {
        let _guard = self.mining.lock().await;

        for attempt in 1..=MAX_MINING_ATTEMPTS {
            if self.shutdown.is_cancelled() {
                return Err(LedgerError::ShuttingDown);
            }

            let candidate = {
                let state = self.state.read().await;
                let mut pending = self.pending.lock().await;
                let selection = self.assembler.select_batch(pending.transactions(), &state.utxos);
                if !selection.dropped.is_empty() {
                    let mut levy = self.levy.lock().await;
                    for (tx, reason) in &selection.dropped {
                        self.drop_pending(&mut pending, &mut levy, tx, *reason);
                    }
                }
                if selection.accepted.is_empty() {
                    return Ok(None);
                }
                self.assembler
                    .assemble(state.chain.tip(), selection.accepted, Utc::now())
            };

            let Some(block) = self.mine_candidate(candidate).await? else {
                info!("Tip moved during mining, re-assembling (attempt {})", attempt);
                continue;
            };

            match self.commit_block(block, false).await {
                Ok(block) => return Ok(Some(block)),
                Err(LedgerError::Append(e)) => {
                    warn!("Mined block not appended: {}", e);
                    continue;
                }
                Err(e) => return Err(e),
            }
        }

        warn!("Gave up mining after {} attempts", MAX_MINING_ATTEMPTS);
        Ok(None)
    }

    fn drop_pending(
        &self,
        pending: &mut PendingQueue,
        levy: &mut LevyScheduler,
        tx: &Transaction,
        reason: Rejection,
    ) {
        if pending.drop_transaction(&tx.hash, reason).is_some() {
            levy.on_dropped(tx);
            self.events.publish(LedgerEvent::TransactionDropped {
                hash: tx.hash.clone(),
                reason,
            });
        }
    }

    /// Run the nonce search on blocking threads; `None` if the tip moved
    async fn mine_candidate(&self, block: Block) -> Result<Option<Block>, LedgerError> {
        let parent = block.header.previous_hash.clone();
        let mut tip = self.tip.subscribe();

        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let miner = self.miner.clone();
        let mut task = tokio::task::spawn_blocking(move || miner.mine(block, &flag));

        let outcome = tokio::select! {
            result = &mut task => result,
            _ = tip_moved(&mut tip, &parent) => {
                stop.store(true, Ordering::Relaxed);
                (&mut task).await
            }
            _ = self.shutdown.cancelled() => {
                stop.store(true, Ordering::Relaxed);
                (&mut task).await
            }
        }
        .map_err(|e| LedgerError::Mining(e.to_string()))?;

        match outcome {
            MiningOutcome::Mined(block, stats) => {
                debug!("Mining stats: {:?}", stats);
                Ok(Some(block))
            }
            MiningOutcome::Cancelled if self.shutdown.is_cancelled() => {
                Err(LedgerError::ShuttingDown)
            }
            MiningOutcome::Cancelled => Ok(None),
        }
    }

    /// Append a block produced outside this process
    ///
    /// Every transaction is re-validated in order against the current UTXO
    /// set before the chain checks run.
    pub async fn append_block(&self, block: Block) -> Result<Block, LedgerError> {
        self.commit_block(block, true).await
    }

    /// The commit critical section
    ///
    /// Under the state write lock: chain checks, UTXO pre-check, persist,
    /// then append. A failure at any step leaves memory and disk unchanged.
    async fn commit_block(&self, block: Block, check_transactions: bool) -> Result<Block, LedgerError> {
        let mut state = self.state.write().await;

        if check_transactions {
            let levy = self.levy.lock().await;
            let not_after = block.timestamp().min(Utc::now());
            let mut view = state.utxos.begin_trial();
            for tx in &block.transactions {
                self.validator.admit(tx, &mut view)?;
                check_levy_policy(tx, &state.utxos, &levy, not_after)?;
            }
        }
        state.chain.validate_append(&block)?;
        state
            .utxos
            .check_commit(&block)
            .map_err(ChainAppendFailure::from)?;
        self.storage.persist(state.chain.all_blocks(), &block)?;

        let LedgerState { chain, utxos } = &mut *state;
        chain.append(block.clone(), utxos)?;

        let mut pending = self.pending.lock().await;
        pending.remove_committed(block.transactions.iter().map(|tx| tx.hash.as_str()));
        self.levy.lock().await.on_block_committed(&block);
        drop(pending);
        drop(state);

        self.tip.send_replace(block.hash.clone());
        info!(
            "Committed block #{} with {} transactions",
            block.index,
            block.tx_count()
        );
        self.events.publish(LedgerEvent::BlockCommitted {
            index: block.index,
            hash: block.hash.clone(),
            timestamp: block.timestamp(),
            transactions: block.transactions.iter().map(|tx| tx.hash.clone()).collect(),
        });
        Ok(block)
    }

    // =========================================================================
    // Levy
    // =========================================================================

    /// Queue a levy for every wallet whose period has elapsed
    ///
    /// Returns the hashes of the queued levy transactions. Wallets whose
    /// unreserved outputs cannot cover the levy are retried next tick.
    pub async fn run_levy_tick(&self, now: DateTime<Utc>) -> Result<Vec<String>, LedgerError> {
        let wallets = self.wallets.read().await;
        let state = self.state.read().await;
        let mut pending = self.pending.lock().await;
        let mut levy = self.levy.lock().await;

        let mut view = seeded_view(&state.utxos, &pending);
        let mut queued = Vec::new();

        for wallet_id in levy.due_wallets(now) {
            let Some(wallet) = wallets.get(&wallet_id) else {
                continue;
            };
            let amount = levy.policy().levy_amount(state.utxos.balance_of(&wallet_id));
            if amount == 0 {
                levy.skip_period(&wallet_id, now);
                continue;
            }

            match self.queue_levy(wallet, amount, now, &mut view, &mut pending, &mut levy) {
                Ok(hash) => queued.push(hash),
                Err(e) => debug!("Levy for {} deferred: {}", wallet_id, e),
            }
        }

        if !queued.is_empty() {
            info!("Levy tick queued {} deductions", queued.len());
        }
        Ok(queued)
    }

    /// Levy one wallet now, regardless of its schedule
    pub async fn levy_wallet(
        &self,
        wallet_id: &str,
        now: DateTime<Utc>,
    ) -> Result<LevyOutcome, LedgerError> {
        let wallets = self.wallets.read().await;
        let wallet = wallets.require(wallet_id)?;
        if wallet_id == wallets.treasury_id() {
            return Ok(LevyOutcome::NothingOwed);
        }

        let state = self.state.read().await;
        let mut pending = self.pending.lock().await;
        let mut levy = self.levy.lock().await;
        levy.track(wallet_id, wallet.created_at);

        if let Some(hash) = levy.in_flight(wallet_id) {
            return Ok(LevyOutcome::AlreadyQueued {
                transaction_hash: hash.to_string(),
            });
        }

        let amount = levy.policy().levy_amount(state.utxos.balance_of(wallet_id));
        if amount == 0 {
            levy.skip_period(wallet_id, now);
            return Ok(LevyOutcome::NothingOwed);
        }

        let mut view = seeded_view(&state.utxos, &pending);
        let hash = self.queue_levy(wallet, amount, now, &mut view, &mut pending, &mut levy)?;
        Ok(LevyOutcome::Queued {
            transaction_hash: hash,
            amount,
        })
    }

    fn queue_levy(
        &self,
        wallet: &Wallet,
        amount: Amount,
        now: DateTime<Utc>,
        view: &mut TrialView<'_>,
        pending: &mut PendingQueue,
        levy: &mut LevyScheduler,
    ) -> Result<String, LedgerError> {
        let wallet_id = wallet.wallet_id();
        let spendable = view.spendable_of(&wallet_id);
        let tx = match wallet.build_levy(amount, LEVY_NOTE, &spendable, now) {
            Ok(tx) => tx,
            Err(WalletError::InsufficientFunds { .. }) => {
                return Err(LedgerError::Rejected(Rejection::InsufficientFunds))
            }
            Err(e) => return Err(e.into()),
        };

        let validated = self.validator.admit(&tx, view)?;
        let hash = self.enqueue(pending, validated.into_inner())?;
        levy.mark_in_flight(&wallet_id, &hash);
        self.events.publish(LedgerEvent::LevyScheduled {
            wallet_id,
            hash: hash.clone(),
            amount: self.format(amount),
        });
        Ok(hash)
    }
}

/// A levy signed outside the scheduler must charge what the policy owes on
/// the committed balance and may not be dated after `not_after`
fn check_levy_policy(
    tx: &Transaction,
    utxos: &UtxoSet,
    levy: &LevyScheduler,
    not_after: DateTime<Utc>,
) -> Result<(), Rejection> {
    if tx.kind != TxKind::Levy || levy.in_flight(&tx.sender_wallet_id) == Some(tx.hash.as_str()) {
        return Ok(());
    }
    let owed = levy.policy().levy_amount(utxos.balance_of(&tx.sender_wallet_id));
    if tx.amount != owed || tx.timestamp > not_after {
        return Err(Rejection::MalformedAmount);
    }
    Ok(())
}

/// Trial view with every pending transaction applied
fn seeded_view<'a>(utxos: &'a UtxoSet, pending: &PendingQueue) -> TrialView<'a> {
    let mut view = utxos.begin_trial();
    for tx in pending.transactions() {
        view.apply(tx);
    }
    view
}

fn format_total(total: u128, decimals: u32) -> String {
    match Amount::try_from(total) {
        Ok(amount) => format_amount(amount, decimals),
        Err(_) => total.to_string(),
    }
}

/// Resolves once the watched tip differs from `parent`
async fn tip_moved(tip: &mut watch::Receiver<String>, parent: &str) {
    loop {
        if *tip.borrow_and_update() != parent {
            return;
        }
        if tip.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::TransactionBuilder;
    use chrono::Duration;
    use tempfile::TempDir;

    fn open_ledger(dir: &TempDir) -> Ledger {
        let mut config = LedgerConfig::in_dir(dir.path()).with_difficulty(4);
        config.mining_threads = 1;
        Ledger::open(config).unwrap()
    }

    async fn funded_wallet(ledger: &Ledger, amount: Amount) -> String {
        let wallet = ledger.register_wallet(Some("alice")).await.unwrap();
        ledger.issue(&wallet.wallet_id, amount).await.unwrap();
        ledger.mine_pending().await.unwrap().unwrap();
        wallet.wallet_id
    }

    async fn key_of(ledger: &Ledger, wallet_id: &str) -> crate::crypto::KeyPair {
        let wallets = ledger.wallets.read().await;
        wallets.require(wallet_id).unwrap().key_pair().clone()
    }

    /// Mine `transactions` on the current tip without going through the queue
    async fn external_block(ledger: &Ledger, transactions: Vec<Transaction>) -> Block {
        let tip = ledger.state.read().await.chain.tip().clone();
        let timestamp = Utc::now().max(tip.timestamp());
        let difficulty = ledger.config().difficulty;
        let mut block = Block::assemble(tip.index + 1, tip.hash, timestamp, difficulty, transactions);
        block.mine();
        block
    }

    #[tokio::test]
    async fn test_fresh_ledger_starts_at_genesis() {
        let dir = TempDir::new().unwrap();
        let ledger = open_ledger(&dir);

        let info = ledger.chain_info().await;
        assert_eq!(info.height, 0);
        assert_eq!(info.total_blocks, 1);
        assert_eq!(info.wallets, 1);
        assert_eq!(info.total_unspent, "0.00");
        assert!(ledger.mine_pending().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_transfer_commits_after_mining() {
        let dir = TempDir::new().unwrap();
        let ledger = open_ledger(&dir);
        let alice = funded_wallet(&ledger, 100).await;
        let bob = ledger.register_wallet(Some("bob")).await.unwrap().wallet_id;

        let hash = ledger.submit_transfer(&alice, &bob, 70, "rent").await.unwrap();
        assert_eq!(ledger.transaction_status(&hash).await, TransactionStatus::Pending);
        // Balances only move on commit
        assert_eq!(ledger.wallet_snapshot(&alice).await.unwrap().balance, 100);

        let block = ledger.mine_pending().await.unwrap().unwrap();
        assert_eq!(block.index, 2);
        assert_eq!(ledger.wallet_snapshot(&alice).await.unwrap().balance, 30);
        assert_eq!(ledger.wallet_snapshot(&bob).await.unwrap().balance, 70);
        assert!(ledger.pending_transactions().await.is_empty());

        let record = ledger.transaction(&hash).await.unwrap();
        assert_eq!(
            record.status,
            TransactionStatus::Confirmed {
                block_hash: block.hash.clone(),
                block_index: 2
            }
        );
        assert!(record.merkle_proof.is_some());

        let history = ledger.history(&alice).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].kind, HistoryKind::Sent);
        assert_eq!(history[1].counterparty, bob);
        assert_eq!(history[1].status, HistoryStatus::Confirmed);
    }

    #[tokio::test]
    async fn test_transfer_rejections() {
        let dir = TempDir::new().unwrap();
        let ledger = open_ledger(&dir);
        let alice = funded_wallet(&ledger, 100).await;
        let bob = ledger.register_wallet(None).await.unwrap().wallet_id;

        assert!(matches!(
            ledger.submit_transfer(&alice, &bob, 150, "").await,
            Err(LedgerError::Rejected(Rejection::InsufficientFunds))
        ));
        assert!(matches!(
            ledger.submit_transfer(&alice, &bob, 0, "").await,
            Err(LedgerError::Rejected(Rejection::MalformedAmount))
        ));
        assert!(matches!(
            ledger.submit_transfer(&alice, "nobody", 10, "").await,
            Err(LedgerError::UnknownWallet(_))
        ));
        assert!(matches!(
            ledger.wallet_snapshot("nobody").await,
            Err(LedgerError::UnknownWallet(_))
        ));
    }

    #[tokio::test]
    async fn test_pending_inputs_are_reserved() {
        let dir = TempDir::new().unwrap();
        let ledger = open_ledger(&dir);
        let alice = funded_wallet(&ledger, 100).await;
        let bob = ledger.register_wallet(None).await.unwrap().wallet_id;

        ledger.submit_transfer(&alice, &bob, 60, "").await.unwrap();
        // The only output is reserved by the first transfer
        assert!(matches!(
            ledger.submit_transfer(&alice, &bob, 10, "").await,
            Err(LedgerError::Rejected(Rejection::InsufficientFunds))
        ));
    }

    #[tokio::test]
    async fn test_external_double_spend_rejected() {
        let dir = TempDir::new().unwrap();
        let ledger = open_ledger(&dir);
        let alice_info = ledger.register_wallet(Some("alice")).await.unwrap();
        let alice_id = alice_info.wallet_id.clone();
        ledger.issue(&alice_id, 100).await.unwrap();
        ledger.mine_pending().await.unwrap().unwrap();
        let bob = ledger.register_wallet(None).await.unwrap().wallet_id;

        let utxo = ledger.wallet_snapshot(&alice_id).await.unwrap().utxos[0].clone();
        let key = {
            let wallets = ledger.wallets.read().await;
            wallets.require(&alice_id).unwrap().key_pair().clone()
        };
        let first = TransactionBuilder::transfer(&alice_id, &bob, 40)
            .add_input(&utxo)
            .note("first")
            .build_and_sign(&key)
            .unwrap();
        let second = TransactionBuilder::transfer(&alice_id, &bob, 50)
            .add_input(&utxo)
            .note("second")
            .build_and_sign(&key)
            .unwrap();

        ledger.submit_transaction(first.clone()).await.unwrap();
        assert!(matches!(
            ledger.submit_transaction(second).await,
            Err(LedgerError::Rejected(Rejection::DoubleSpend))
        ));
        assert!(matches!(
            ledger.submit_transaction(first).await,
            Err(LedgerError::Queue(QueueError::DuplicateTransaction(_)))
        ));
    }

    #[tokio::test]
    async fn test_levy_tick_deducts_after_period() {
        let dir = TempDir::new().unwrap();
        let ledger = open_ledger(&dir);
        let alice = funded_wallet(&ledger, 1000).await;

        assert!(ledger.run_levy_tick(Utc::now()).await.unwrap().is_empty());

        let later = Utc::now() + Duration::days(31);
        let queued = ledger.run_levy_tick(later).await.unwrap();
        assert_eq!(queued.len(), 1);
        // In flight: a second tick does not queue another
        assert!(ledger.run_levy_tick(later).await.unwrap().is_empty());

        ledger.mine_pending().await.unwrap().unwrap();
        let snapshot = ledger.wallet_snapshot(&alice).await.unwrap();
        assert_eq!(snapshot.balance, 975);
        assert_eq!(snapshot.next_levy_due, Some(later + Duration::days(30)));

        let history = ledger.history(&alice).await.unwrap();
        let levy = history.last().unwrap();
        assert_eq!(levy.kind, HistoryKind::Levy);
        assert_eq!(levy.amount, 25);
        assert_eq!(levy.counterparty, LEVY_SINK);
        assert_eq!(levy.note, LEVY_NOTE);
    }

    #[tokio::test]
    async fn test_levy_wallet_outcomes() {
        let dir = TempDir::new().unwrap();
        let ledger = open_ledger(&dir);
        let empty = ledger.register_wallet(None).await.unwrap().wallet_id;
        let alice = funded_wallet(&ledger, 1000).await;
        let now = Utc::now();

        assert_eq!(
            ledger.levy_wallet(&empty, now).await.unwrap(),
            LevyOutcome::NothingOwed
        );

        let LevyOutcome::Queued {
            transaction_hash,
            amount,
        } = ledger.levy_wallet(&alice, now).await.unwrap()
        else {
            panic!("expected a queued levy");
        };
        assert_eq!(amount, 25);
        assert_eq!(
            ledger.levy_wallet(&alice, now).await.unwrap(),
            LevyOutcome::AlreadyQueued { transaction_hash }
        );

        let treasury = ledger.treasury_id().await;
        assert_eq!(
            ledger.levy_wallet(&treasury, now).await.unwrap(),
            LevyOutcome::NothingOwed
        );
    }

    #[tokio::test]
    async fn test_append_block_rejects_stale_parent() {
        let dir = TempDir::new().unwrap();
        let ledger = open_ledger(&dir);
        let alice = funded_wallet(&ledger, 100).await;
        let genesis = ledger.block_at(0).await.unwrap();

        let treasury = {
            let wallets = ledger.wallets.read().await;
            wallets.treasury().unwrap().key_pair().clone()
        };
        let issue = TransactionBuilder::issuance(&treasury.wallet_id(), &alice, 5)
            .build_and_sign(&treasury)
            .unwrap();
        let mut stale = Block::assemble(1, genesis.hash.clone(), Utc::now(), 4, vec![issue]);
        stale.mine();

        assert!(matches!(
            ledger.append_block(stale).await,
            Err(LedgerError::Append(ChainAppendFailure::StaleParent { .. }))
        ));
        assert_eq!(ledger.chain_info().await.height, 1);
    }

    #[tokio::test]
    async fn test_replay_matches_live_state() {
        let dir = TempDir::new().unwrap();
        let ledger = open_ledger(&dir);
        let alice = funded_wallet(&ledger, 500).await;
        let bob = ledger.register_wallet(None).await.unwrap().wallet_id;
        ledger.submit_transfer(&alice, &bob, 120, "").await.unwrap();
        ledger.mine_pending().await.unwrap().unwrap();

        let validation = ledger.validate_chain().await;
        assert!(validation.valid);
        assert!(validation.utxo_replay_matches);
        assert_eq!(validation.first_invalid, None);
        assert_eq!(validation.height, 2);
    }

    #[tokio::test]
    async fn test_restart_reloads_chain_and_wallets() {
        let dir = TempDir::new().unwrap();
        let (alice, bob, tip) = {
            let ledger = open_ledger(&dir);
            let alice = funded_wallet(&ledger, 300).await;
            let bob = ledger.register_wallet(Some("bob")).await.unwrap().wallet_id;
            ledger.submit_transfer(&alice, &bob, 100, "").await.unwrap();
            let tip = ledger.mine_pending().await.unwrap().unwrap();
            (alice, bob, tip)
        };

        let ledger = open_ledger(&dir);
        let info = ledger.chain_info().await;
        assert_eq!(info.height, 2);
        assert_eq!(info.latest_hash, tip.hash);
        assert_eq!(info.wallets, 3);
        assert_eq!(ledger.wallet_snapshot(&alice).await.unwrap().balance, 200);
        assert_eq!(ledger.wallet_snapshot(&bob).await.unwrap().balance, 100);
        assert!(ledger.validate_chain().await.valid);
    }

    #[tokio::test]
    async fn test_events_follow_commits() {
        let dir = TempDir::new().unwrap();
        let ledger = open_ledger(&dir);
        let alice = ledger.register_wallet(None).await.unwrap().wallet_id;
        let mut events = ledger.subscribe();

        let hash = ledger.issue(&alice, 10).await.unwrap();
        let block = ledger.mine_pending().await.unwrap().unwrap();

        match events.recv().await.unwrap() {
            LedgerEvent::TransactionQueued { hash: queued, amount, .. } => {
                assert_eq!(queued, hash);
                assert_eq!(amount, "0.10");
            }
            other => panic!("unexpected event {:?}", other),
        }
        match events.recv().await.unwrap() {
            LedgerEvent::BlockCommitted { hash, transactions, .. } => {
                assert_eq!(hash, block.hash);
                assert_eq!(transactions.len(), 1);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_external_levy_must_match_policy() {
        let dir = TempDir::new().unwrap();
        let ledger = open_ledger(&dir);
        let alice = funded_wallet(&ledger, 1000).await;
        let key = key_of(&ledger, &alice).await;
        let utxo = ledger.wallet_snapshot(&alice).await.unwrap().utxos[0].clone();

        let token = TransactionBuilder::levy(&alice, 1)
            .add_input(&utxo)
            .build_and_sign(&key)
            .unwrap();
        assert!(matches!(
            ledger.submit_transaction(token.clone()).await,
            Err(LedgerError::Rejected(Rejection::MalformedAmount))
        ));

        let far_future = TransactionBuilder::levy(&alice, 25)
            .add_input(&utxo)
            .timestamp(Utc::now() + Duration::days(36_500))
            .build_and_sign(&key)
            .unwrap();
        assert!(matches!(
            ledger.submit_transaction(far_future).await,
            Err(LedgerError::Rejected(Rejection::MalformedAmount))
        ));

        // The same underpayment inside a mined block is refused too
        let block = external_block(&ledger, vec![token]).await;
        assert!(matches!(
            ledger.append_block(block).await,
            Err(LedgerError::Rejected(Rejection::MalformedAmount))
        ));
        assert_eq!(ledger.wallet_snapshot(&alice).await.unwrap().balance, 1000);
        assert!(ledger.pending_transactions().await.is_empty());

        let paid = TransactionBuilder::levy(&alice, 25)
            .add_input(&utxo)
            .note(LEVY_NOTE)
            .build_and_sign(&key)
            .unwrap();
        let hash = ledger.submit_transaction(paid).await.unwrap();
        assert_eq!(
            ledger.levy_wallet(&alice, Utc::now()).await.unwrap(),
            LevyOutcome::AlreadyQueued {
                transaction_hash: hash
            }
        );
        ledger.mine_pending().await.unwrap().unwrap();
        assert_eq!(ledger.wallet_snapshot(&alice).await.unwrap().balance, 975);

        // The next period is still charged
        let queued = ledger
            .run_levy_tick(Utc::now() + Duration::days(31))
            .await
            .unwrap();
        assert_eq!(queued.len(), 1);
    }

    #[tokio::test]
    async fn test_mining_reassembles_when_tip_moves() {
        let dir = TempDir::new().unwrap();
        let ledger = Arc::new(open_ledger(&dir));
        let alice = ledger.register_wallet(None).await.unwrap().wallet_id;
        let treasury = key_of(&ledger, &ledger.treasury_id().await).await;

        let outside = TransactionBuilder::issuance(&treasury.wallet_id(), &alice, 7)
            .note("mined elsewhere")
            .build_and_sign(&treasury)
            .unwrap();
        let competing = external_block(&ledger, vec![outside]).await;
        let queued = ledger.issue(&alice, 5).await.unwrap();

        let mining = tokio::spawn({
            let ledger = ledger.clone();
            async move { ledger.mine_pending().await }
        });
        // Let the miner assemble its candidate on genesis first
        tokio::task::yield_now().await;
        ledger.append_block(competing.clone()).await.unwrap();

        let mined = mining.await.unwrap().unwrap().unwrap();
        assert_eq!(mined.index, 2);
        assert_eq!(mined.header.previous_hash, competing.hash);
        assert_eq!(mined.transactions[0].hash, queued);
        assert_eq!(ledger.wallet_snapshot(&alice).await.unwrap().balance, 12);
        assert!(ledger.validate_chain().await.valid);
    }

    #[tokio::test]
    async fn test_append_block_revalidates_transactions() {
        let dir = TempDir::new().unwrap();
        let ledger = open_ledger(&dir);
        let alice = funded_wallet(&ledger, 100).await;
        let bob = ledger.register_wallet(None).await.unwrap().wallet_id;

        let mallory = crate::crypto::KeyPair::generate();
        let forged = TransactionBuilder::issuance(&mallory.wallet_id(), &bob, 1_000)
            .build_and_sign(&mallory)
            .unwrap();
        let block = external_block(&ledger, vec![forged]).await;
        assert!(matches!(
            ledger.append_block(block).await,
            Err(LedgerError::Rejected(Rejection::InvalidSignature))
        ));

        let key = key_of(&ledger, &alice).await;
        let utxo = ledger.wallet_snapshot(&alice).await.unwrap().utxos[0].clone();
        let mut inflated = TransactionBuilder::transfer(&alice, &bob, 40)
            .add_input(&utxo)
            .build()
            .unwrap();
        inflated.outputs[1].amount += 500;
        inflated.sign(&key).unwrap();
        let block = external_block(&ledger, vec![inflated]).await;
        assert!(matches!(
            ledger.append_block(block).await,
            Err(LedgerError::Rejected(Rejection::MalformedAmount))
        ));

        assert_eq!(ledger.chain_info().await.height, 1);
        assert_eq!(ledger.wallet_snapshot(&alice).await.unwrap().balance, 100);
        assert_eq!(ledger.wallet_snapshot(&bob).await.unwrap().balance, 0);
    }

    #[tokio::test]
    async fn test_failed_persist_leaves_state_unchanged() {
        let dir = TempDir::new().unwrap();
        let ledger = open_ledger(&dir);
        let alice = funded_wallet(&ledger, 100).await;
        let before = ledger.chain_info().await;

        // A directory where the temporary chain file goes makes the write fail
        let blocker = dir.path().join("chain.json.tmp");
        std::fs::create_dir(&blocker).unwrap();

        let hash = ledger.issue(&alice, 50).await.unwrap();
        assert!(matches!(
            ledger.mine_pending().await,
            Err(LedgerError::Storage(_))
        ));
        let after = ledger.chain_info().await;
        assert_eq!(after.height, before.height);
        assert_eq!(after.latest_hash, before.latest_hash);
        assert_eq!(ledger.wallet_snapshot(&alice).await.unwrap().balance, 100);
        assert_eq!(ledger.transaction_status(&hash).await, TransactionStatus::Pending);
        assert!(ledger.validate_chain().await.valid);

        std::fs::remove_dir(&blocker).unwrap();
        ledger.mine_pending().await.unwrap().unwrap();
        assert_eq!(ledger.wallet_snapshot(&alice).await.unwrap().balance, 150);
    }

    #[tokio::test]
    async fn test_levy_deferred_while_funds_reserved() {
        let dir = TempDir::new().unwrap();
        let ledger = open_ledger(&dir);
        let alice = funded_wallet(&ledger, 1000).await;
        let bob = ledger.register_wallet(None).await.unwrap().wallet_id;
        let later = Utc::now() + Duration::days(31);

        // The only output is reserved by the pending transfer
        ledger.submit_transfer(&alice, &bob, 100, "").await.unwrap();
        assert!(ledger.run_levy_tick(later).await.unwrap().is_empty());
        let due = ledger.wallet_snapshot(&alice).await.unwrap().next_levy_due.unwrap();
        assert!(due <= later);

        ledger.mine_pending().await.unwrap().unwrap();
        let queued = ledger.run_levy_tick(later).await.unwrap();
        assert_eq!(queued.len(), 1);
        ledger.mine_pending().await.unwrap().unwrap();

        // 2.5% of the 900 left after the transfer
        assert_eq!(ledger.wallet_snapshot(&alice).await.unwrap().balance, 878);
    }
}
