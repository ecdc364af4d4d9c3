//! Ledger event bus
//!
//! Commits happen asynchronously after a transfer is accepted, so clients
//! learn about them either by polling transaction status or by subscribing
//! to these events. The WebSocket route forwards them as JSON.

use crate::core::{Rejection, TxKind};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

/// Maximum number of events to buffer per subscriber
const BROADCAST_CAPACITY: usize = 100;

/// Amounts are decimal strings in display units
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", content = "data")]
pub enum LedgerEvent {
    #[serde(rename_all = "camelCase")]
    TransactionQueued {
        hash: String,
        kind: TxKind,
        sender_wallet_id: String,
        recipient_wallet_id: String,
        amount: String,
    },
    #[serde(rename_all = "camelCase")]
    TransactionDropped { hash: String, reason: Rejection },
    #[serde(rename_all = "camelCase")]
    BlockCommitted {
        index: u64,
        hash: String,
        timestamp: DateTime<Utc>,
        transactions: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    LevyScheduled {
        wallet_id: String,
        hash: String,
        amount: String,
    },
}

#[derive(Debug)]
pub struct EventBus {
    sender: broadcast::Sender<LedgerEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self { sender }
    }

    pub fn publish(&self, event: LedgerEvent) {
        // No subscribers is not an error
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LedgerEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
