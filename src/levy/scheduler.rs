//! Periodic zakat levy
//!
//! Every wallet owes `rate_bps` of its committed balance once per period.
//! The scheduler only tracks when each wallet was last levied and whether a
//! levy transaction is still waiting for a block; the ledger builds, signs
//! and queues the transactions themselves.

use crate::core::{Amount, Block, ChainStore, Transaction, TxKind};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;

/// 2.5%
pub const DEFAULT_RATE_BPS: u32 = 250;

pub const DEFAULT_PERIOD_DAYS: i64 = 30;

/// Note carried by scheduled levy transactions
pub const LEVY_NOTE: &str = "Monthly Zakat Deduction (2.5%)";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LevyPolicy {
    /// Rate in basis points of the balance
    pub rate_bps: u32,
    /// Minimum time between two levies on the same wallet
    pub period: Duration,
    /// Balances at or below this are not levied
    pub threshold: Amount,
}

impl Default for LevyPolicy {
    fn default() -> Self {
        Self {
            rate_bps: DEFAULT_RATE_BPS,
            period: Duration::days(DEFAULT_PERIOD_DAYS),
            threshold: 0,
        }
    }
}

impl LevyPolicy {
    /// `balance * rate_bps / 10_000`, rounded down
    pub fn levy_amount(&self, balance: Amount) -> Amount {
        if balance <= self.threshold {
            return 0;
        }
        let levy = balance as u128 * self.rate_bps as u128 / 10_000;
        // rate_bps above 10_000 would levy more than the balance
        levy.min(balance as u128) as Amount
    }
}

#[derive(Debug, Clone)]
struct LevyState {
    last_levy: DateTime<Utc>,
    /// Hash of the queued levy transaction, if any
    in_flight: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LevyScheduler {
    policy: LevyPolicy,
    wallets: HashMap<String, LevyState>,
}

impl LevyScheduler {
    pub fn new(policy: LevyPolicy) -> Self {
        Self {
            policy,
            wallets: HashMap::new(),
        }
    }

    /// Scheduler state for existing wallets after a restart
    ///
    /// A wallet's last levy is the timestamp of its newest committed levy
    /// transaction, or its creation time if it has never been levied.
    pub fn restore(
        policy: LevyPolicy,
        wallets: impl IntoIterator<Item = (String, DateTime<Utc>)>,
        chain: &ChainStore,
    ) -> Self {
        let mut scheduler = Self::new(policy);
        for (wallet_id, created_at) in wallets {
            let last_levy = chain
                .transactions_for(&wallet_id)
                .into_iter()
                .filter(|entry| {
                    entry.transaction.kind == TxKind::Levy
                        && entry.transaction.sender_wallet_id == wallet_id
                })
                .map(|entry| entry.transaction.timestamp)
                .max()
                .unwrap_or(created_at);
            scheduler.wallets.insert(
                wallet_id,
                LevyState {
                    last_levy,
                    in_flight: None,
                },
            );
        }
        scheduler
    }

    pub fn policy(&self) -> &LevyPolicy {
        &self.policy
    }

    /// Start tracking a wallet; its first levy falls one period after `since`
    pub fn track(&mut self, wallet_id: &str, since: DateTime<Utc>) {
        self.wallets
            .entry(wallet_id.to_string())
            .or_insert(LevyState {
                last_levy: since,
                in_flight: None,
            });
    }

    pub fn last_levy(&self, wallet_id: &str) -> Option<DateTime<Utc>> {
        self.wallets.get(wallet_id).map(|s| s.last_levy)
    }

    pub fn next_due(&self, wallet_id: &str) -> Option<DateTime<Utc>> {
        self.last_levy(wallet_id).map(|t| t + self.policy.period)
    }

    pub fn in_flight(&self, wallet_id: &str) -> Option<&str> {
        self.wallets.get(wallet_id)?.in_flight.as_deref()
    }

    pub fn is_due(&self, wallet_id: &str, now: DateTime<Utc>) -> bool {
        self.wallets
            .get(wallet_id)
            .map(|s| s.in_flight.is_none() && now >= s.last_levy + self.policy.period)
            .unwrap_or(false)
    }

    /// Wallets whose period has elapsed and which have no levy queued
    pub fn due_wallets(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut due: Vec<String> = self
            .wallets
            .keys()
            .filter(|id| self.is_due(id, now))
            .cloned()
            .collect();
        due.sort();
        due
    }

    /// Nothing was owed for this period
    pub fn skip_period(&mut self, wallet_id: &str, now: DateTime<Utc>) {
        if let Some(state) = self.wallets.get_mut(wallet_id) {
            state.last_levy = now;
        }
    }

    pub fn mark_in_flight(&mut self, wallet_id: &str, tx_hash: &str) {
        if let Some(state) = self.wallets.get_mut(wallet_id) {
            state.in_flight = Some(tx_hash.to_string());
        }
    }

    /// Record every levy in a committed block
    pub fn on_block_committed(&mut self, block: &Block) {
        for tx in block.transactions.iter().filter(|tx| tx.kind == TxKind::Levy) {
            if let Some(state) = self.wallets.get_mut(&tx.sender_wallet_id) {
                state.last_levy = state.last_levy.max(tx.timestamp);
                if state.in_flight.as_deref() == Some(tx.hash.as_str()) {
                    state.in_flight = None;
                }
                log::info!(
                    "Levied {} from {} (next due {})",
                    tx.amount,
                    tx.sender_wallet_id,
                    state.last_levy + self.policy.period
                );
            }
        }
    }

    /// A queued levy was dropped; let the next tick retry
    pub fn on_dropped(&mut self, tx: &Transaction) {
        if tx.kind != TxKind::Levy {
            return;
        }
        if let Some(state) = self.wallets.get_mut(&tx.sender_wallet_id) {
            if state.in_flight.as_deref() == Some(tx.hash.as_str()) {
                state.in_flight = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{TransactionBuilder, Utxo};
    use crate::crypto::KeyPair;

    fn start() -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_710_000_000, 0).unwrap()
    }

    fn levy_tx(owner: &KeyPair, amount: Amount, at: DateTime<Utc>) -> Transaction {
        let utxo = Utxo::unspent(format!("{}:0", "cd".repeat(32)), &owner.wallet_id(), 1000, "b");
        TransactionBuilder::levy(&owner.wallet_id(), amount)
            .add_input(&utxo)
            .timestamp(at)
            .build_and_sign(owner)
            .unwrap()
    }

    #[test]
    fn test_levy_amount() {
        let policy = LevyPolicy::default();
        assert_eq!(policy.levy_amount(1000), 25);
        assert_eq!(policy.levy_amount(39), 0);
        assert_eq!(policy.levy_amount(0), 0);
        assert_eq!(policy.levy_amount(u64::MAX), u64::MAX / 40);
    }

    #[test]
    fn test_threshold() {
        let policy = LevyPolicy {
            threshold: 10_000,
            ..Default::default()
        };
        assert_eq!(policy.levy_amount(10_000), 0);
        assert_eq!(policy.levy_amount(10_001), 250);
    }

    #[test]
    fn test_due_after_period() {
        let mut scheduler = LevyScheduler::new(LevyPolicy::default());
        scheduler.track("alice", start());

        assert!(scheduler.due_wallets(start() + Duration::days(29)).is_empty());
        assert_eq!(scheduler.due_wallets(start() + Duration::days(30)), vec!["alice"]);
        assert_eq!(scheduler.next_due("alice"), Some(start() + Duration::days(30)));
    }

    #[test]
    fn test_in_flight_blocks_relevy_until_commit() {
        let alice = KeyPair::generate();
        let id = alice.wallet_id();
        let mut scheduler = LevyScheduler::new(LevyPolicy::default());
        scheduler.track(&id, start());

        let now = start() + Duration::days(31);
        let tx = levy_tx(&alice, 25, now);
        scheduler.mark_in_flight(&id, &tx.hash);
        assert!(scheduler.due_wallets(now).is_empty());
        assert_eq!(scheduler.last_levy(&id), Some(start()));

        let block = Block::new(1, "0".repeat(64), vec![tx], 0);
        scheduler.on_block_committed(&block);
        assert_eq!(scheduler.in_flight(&id), None);
        assert_eq!(scheduler.last_levy(&id), Some(now));
        assert!(!scheduler.is_due(&id, now + Duration::days(29)));
        assert!(scheduler.is_due(&id, now + Duration::days(30)));
    }

    #[test]
    fn test_drop_clears_in_flight() {
        let alice = KeyPair::generate();
        let id = alice.wallet_id();
        let mut scheduler = LevyScheduler::new(LevyPolicy::default());
        scheduler.track(&id, start());

        let now = start() + Duration::days(30);
        let tx = levy_tx(&alice, 25, now);
        scheduler.mark_in_flight(&id, &tx.hash);
        scheduler.on_dropped(&tx);

        assert_eq!(scheduler.last_levy(&id), Some(start()));
        assert!(scheduler.is_due(&id, now));
    }

    #[test]
    fn test_skip_period() {
        let mut scheduler = LevyScheduler::new(LevyPolicy::default());
        scheduler.track("empty", start());
        let now = start() + Duration::days(40);
        scheduler.skip_period("empty", now);
        assert_eq!(scheduler.last_levy("empty"), Some(now));
        assert!(scheduler.due_wallets(now).is_empty());
    }

    #[test]
    fn test_track_keeps_existing_state() {
        let mut scheduler = LevyScheduler::new(LevyPolicy::default());
        scheduler.track("alice", start());
        scheduler.track("alice", start() + Duration::days(10));
        assert_eq!(scheduler.last_levy("alice"), Some(start()));
    }

    #[test]
    fn test_restore_from_chain() {
        let alice = KeyPair::generate();
        let treasury = KeyPair::generate();
        let id = alice.wallet_id();

        let mut chain = ChainStore::new(0);
        let mut utxos = crate::core::UtxoSet::new();
        let issue = TransactionBuilder::issuance(&treasury.wallet_id(), &id, 1000)
            .build_and_sign(&treasury)
            .unwrap();
        let funding = Block::new(1, chain.tip().hash.clone(), vec![issue], 0);
        chain.append(funding, &mut utxos).unwrap();

        let utxo = utxos.unspent_of(&id)[0].clone();
        let levied_at = Utc::now();
        let levy = TransactionBuilder::levy(&id, 25)
            .add_input(&utxo)
            .timestamp(levied_at)
            .build_and_sign(&alice)
            .unwrap();
        let block = Block::new(2, chain.tip().hash.clone(), vec![levy], 0);
        chain.append(block, &mut utxos).unwrap();

        let scheduler = LevyScheduler::restore(
            LevyPolicy::default(),
            [(id.clone(), start()), ("fresh".to_string(), start())],
            &chain,
        );
        assert_eq!(scheduler.last_levy(&id), Some(levied_at));
        assert_eq!(scheduler.last_levy("fresh"), Some(start()));
    }
}
