//! REST API handlers for ledger operations
//!
//! Amounts cross the HTTP boundary as decimal strings in display units.
//! Requests also accept a JSON number; both are parsed with the ledger's
//! precision and anything finer is rejected as `MalformedAmount`.

use crate::core::{parse_amount, Amount, Block, Rejection, Transaction, UtxoStatus};
use crate::ledger::{
    ChainInfo, ChainValidation, HistoryEntry, HistoryKind, HistoryStatus, Ledger, LedgerError,
    LevyOutcome, MerkleStep, TransactionStatus,
};
use crate::mining::QueueError;
use crate::wallet::WalletInfo;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Shared application state for API handlers
#[derive(Clone)]
pub struct ApiState {
    pub ledger: Arc<Ledger>,
}

impl ApiState {
    pub fn new(ledger: Arc<Ledger>) -> Self {
        Self { ledger }
    }

    fn format(&self, amount: Amount) -> String {
        self.ledger.format(amount)
    }

    fn parse(&self, amount: &AmountInput) -> Result<Amount, Rejection> {
        amount.to_minor(self.ledger.config().decimals)
    }
}

type ApiResult<T> = Result<T, (StatusCode, Json<ApiError>)>;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<Rejection>,
}

impl ApiError {
    fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            reason: None,
        }
    }
}

fn not_found(message: String) -> (StatusCode, Json<ApiError>) {
    (StatusCode::NOT_FOUND, Json(ApiError::new(message)))
}

fn rejected(reason: Rejection) -> (StatusCode, Json<ApiError>) {
    (
        StatusCode::UNPROCESSABLE_ENTITY,
        Json(ApiError {
            error: format!("Transaction rejected: {}", reason),
            reason: Some(reason),
        }),
    )
}

fn ledger_error(e: LedgerError) -> (StatusCode, Json<ApiError>) {
    let status = match &e {
        LedgerError::Rejected(reason) => return rejected(*reason),
        LedgerError::UnknownWallet(_) | LedgerError::NotFound(_) => StatusCode::NOT_FOUND,
        LedgerError::Queue(QueueError::DuplicateTransaction(_)) => StatusCode::CONFLICT,
        LedgerError::Queue(QueueError::QueueFull(_)) | LedgerError::ShuttingDown => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        LedgerError::Append(_) => StatusCode::BAD_REQUEST,
        _ => {
            log::error!("Request failed: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, Json(ApiError::new(e.to_string())))
}

// ============================================================================
// Request Types
// ============================================================================

/// A display-unit amount given as `"30.50"` or `30.5`
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum AmountInput {
    Text(String),
    Number(serde_json::Number),
}

impl AmountInput {
    pub fn to_minor(&self, decimals: u32) -> Result<Amount, Rejection> {
        match self {
            AmountInput::Text(text) => parse_amount(text.trim(), decimals),
            AmountInput::Number(number) => parse_amount(&number.to_string(), decimals),
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendRequest {
    pub sender_wallet_id: String,
    pub recipient_wallet_id: String,
    pub amount: AmountInput,
    #[serde(default)]
    pub note: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssueRequest {
    pub recipient_wallet_id: String,
    pub amount: AmountInput,
}

#[derive(Deserialize, Default)]
pub struct CreateWalletRequest {
    pub label: Option<String>,
}

// ============================================================================
// Response Types
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    pub transaction_hash: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UtxoView {
    pub id: String,
    pub amount: String,
    pub status: UtxoStatus,
    pub block_hash: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletResponse {
    pub wallet_id: String,
    pub balance: String,
    pub utxos: Vec<UtxoView>,
    pub zakat_deduction: String,
    pub next_zakat_due: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceResponse {
    pub wallet_id: String,
    pub balance: String,
    pub utxo_count: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryView {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: HistoryKind,
    pub amount: String,
    pub fee: String,
    pub counterparty: String,
    pub note: String,
    pub timestamp: DateTime<Utc>,
    pub status: HistoryStatus,
    pub block_hash: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputView {
    pub wallet_id: String,
    pub amount: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionView {
    pub hash: String,
    #[serde(rename = "type")]
    pub kind: crate::core::TxKind,
    pub sender_wallet_id: String,
    pub recipient_wallet_id: String,
    pub amount: String,
    pub fee: String,
    pub note: String,
    pub signature: String,
    pub inputs: Vec<String>,
    pub outputs: Vec<OutputView>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockView {
    pub index: u64,
    pub previous_hash: String,
    pub timestamp: DateTime<Utc>,
    pub nonce: u64,
    pub merkle_root: String,
    pub hash: String,
    pub difficulty: u32,
    pub transactions: Vec<TransactionView>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionDetail {
    pub transaction: TransactionView,
    #[serde(flatten)]
    pub status: TransactionStatus,
    pub merkle_proof: Option<Vec<MerkleStep>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingResponse {
    pub pending_transactions: usize,
    pub transactions: Vec<TransactionView>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub height: u64,
    pub latest_hash: String,
    pub difficulty: u32,
    pub pending_transactions: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MineResponse {
    pub mined: bool,
    pub block: Option<BlockView>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ZakatResponse {
    pub wallet_id: String,
    pub queued: bool,
    pub transaction_hash: Option<String>,
    pub amount: Option<String>,
    pub message: String,
}

impl ApiState {
    fn transaction_view(&self, tx: &Transaction) -> TransactionView {
        TransactionView {
            hash: tx.hash.clone(),
            kind: tx.kind,
            sender_wallet_id: tx.sender_wallet_id.clone(),
            recipient_wallet_id: tx.recipient_wallet_id.clone(),
            amount: self.format(tx.amount),
            fee: self.format(tx.fee),
            note: tx.note.clone(),
            signature: tx.signature.clone(),
            inputs: tx.inputs.clone(),
            outputs: tx
                .outputs
                .iter()
                .map(|output| OutputView {
                    wallet_id: output.wallet_id.clone(),
                    amount: self.format(output.amount),
                })
                .collect(),
            timestamp: tx.timestamp,
        }
    }

    fn block_view(&self, block: &Block) -> BlockView {
        BlockView {
            index: block.index,
            previous_hash: block.header.previous_hash.clone(),
            timestamp: block.header.timestamp,
            nonce: block.header.nonce,
            merkle_root: block.header.merkle_root.clone(),
            hash: block.hash.clone(),
            difficulty: block.header.difficulty,
            transactions: block
                .transactions
                .iter()
                .map(|tx| self.transaction_view(tx))
                .collect(),
        }
    }

    fn history_view(&self, entry: HistoryEntry) -> HistoryView {
        HistoryView {
            id: entry.id,
            kind: entry.kind,
            amount: self.format(entry.amount),
            fee: self.format(entry.fee),
            counterparty: entry.counterparty,
            note: entry.note,
            timestamp: entry.timestamp,
            status: entry.status,
            block_hash: entry.block_hash,
        }
    }
}

// ============================================================================
// Wallet Handlers
// ============================================================================

/// GET /api/wallet/{walletId} - Balance, unspent outputs and owed zakat
pub async fn get_wallet(
    State(state): State<ApiState>,
    Path(wallet_id): Path<String>,
) -> ApiResult<Json<WalletResponse>> {
    let snapshot = state
        .ledger
        .wallet_snapshot(&wallet_id)
        .await
        .map_err(ledger_error)?;

    Ok(Json(WalletResponse {
        wallet_id: snapshot.wallet_id,
        balance: state.format(snapshot.balance),
        utxos: snapshot
            .utxos
            .into_iter()
            .map(|utxo| UtxoView {
                amount: state.format(utxo.amount),
                id: utxo.id,
                status: utxo.status,
                block_hash: utxo.block_hash,
            })
            .collect(),
        zakat_deduction: state.format(snapshot.pending_levy),
        next_zakat_due: snapshot.next_levy_due,
    }))
}

/// GET /api/wallet/{walletId}/balance
pub async fn get_wallet_balance(
    State(state): State<ApiState>,
    Path(wallet_id): Path<String>,
) -> ApiResult<Json<BalanceResponse>> {
    let snapshot = state
        .ledger
        .wallet_snapshot(&wallet_id)
        .await
        .map_err(ledger_error)?;

    Ok(Json(BalanceResponse {
        wallet_id: snapshot.wallet_id,
        balance: state.format(snapshot.balance),
        utxo_count: snapshot.utxos.len(),
    }))
}

/// POST /api/wallets - Register a custodial wallet
pub async fn create_wallet(
    State(state): State<ApiState>,
    Json(req): Json<CreateWalletRequest>,
) -> ApiResult<(StatusCode, Json<WalletInfo>)> {
    let info = state
        .ledger
        .register_wallet(req.label.as_deref())
        .await
        .map_err(ledger_error)?;
    Ok((StatusCode::CREATED, Json(info)))
}

/// GET /api/wallets - List wallets, treasury first
pub async fn list_wallets(State(state): State<ApiState>) -> Json<Vec<WalletInfo>> {
    Json(state.ledger.list_wallets().await)
}

// ============================================================================
// Transaction Handlers
// ============================================================================

/// POST /api/transactions/send - Sign and queue a transfer
pub async fn send_transaction(
    State(state): State<ApiState>,
    Json(req): Json<SendRequest>,
) -> ApiResult<(StatusCode, Json<SubmitResponse>)> {
    let amount = state.parse(&req.amount).map_err(rejected)?;
    let transaction_hash = state
        .ledger
        .submit_transfer(
            &req.sender_wallet_id,
            &req.recipient_wallet_id,
            amount,
            &req.note,
        )
        .await
        .map_err(ledger_error)?;

    Ok((StatusCode::CREATED, Json(SubmitResponse { transaction_hash })))
}

/// POST /api/transactions/submit - Queue a transaction signed by the client
///
/// The body is the transaction itself, amounts in minor units, since the
/// signature covers them.
pub async fn submit_transaction(
    State(state): State<ApiState>,
    Json(tx): Json<Transaction>,
) -> ApiResult<(StatusCode, Json<SubmitResponse>)> {
    let transaction_hash = state
        .ledger
        .submit_transaction(tx)
        .await
        .map_err(ledger_error)?;
    Ok((StatusCode::CREATED, Json(SubmitResponse { transaction_hash })))
}

/// GET /api/transactions/history/{walletId}
pub async fn get_history(
    State(state): State<ApiState>,
    Path(wallet_id): Path<String>,
) -> ApiResult<Json<Vec<HistoryView>>> {
    let entries = state
        .ledger
        .history(&wallet_id)
        .await
        .map_err(ledger_error)?;
    Ok(Json(
        entries
            .into_iter()
            .map(|entry| state.history_view(entry))
            .collect(),
    ))
}

/// GET /api/transactions/{hash} - Transaction with its commit status
pub async fn get_transaction(
    State(state): State<ApiState>,
    Path(hash): Path<String>,
) -> ApiResult<Json<TransactionDetail>> {
    let record = state
        .ledger
        .transaction(&hash)
        .await
        .ok_or_else(|| not_found(format!("Transaction {} not found", hash)))?;

    Ok(Json(TransactionDetail {
        transaction: state.transaction_view(&record.transaction),
        status: record.status,
        merkle_proof: record.merkle_proof,
    }))
}

/// GET /api/transactions/pending/list
pub async fn get_pending(State(state): State<ApiState>) -> Json<PendingResponse> {
    let pending = state.ledger.pending_transactions().await;
    Json(PendingResponse {
        pending_transactions: pending.len(),
        transactions: pending
            .iter()
            .map(|tx| state.transaction_view(tx))
            .collect(),
    })
}

// ============================================================================
// Chain Handlers
// ============================================================================

/// GET /api/blockchain/blocks - All blocks from genesis
pub async fn get_blocks(State(state): State<ApiState>) -> Json<Vec<BlockView>> {
    let blocks = state.ledger.list_blocks().await;
    Json(blocks.iter().map(|block| state.block_view(block)).collect())
}

/// GET /api/blockchain/blocks/{hash}
pub async fn get_block(
    State(state): State<ApiState>,
    Path(hash): Path<String>,
) -> ApiResult<Json<BlockView>> {
    let block = state
        .ledger
        .block(&hash)
        .await
        .ok_or_else(|| not_found(format!("Block {} not found", hash)))?;
    Ok(Json(state.block_view(&block)))
}

/// GET /api/blockchain/status
pub async fn get_status(State(state): State<ApiState>) -> Json<StatusResponse> {
    let info = state.ledger.chain_info().await;
    Json(StatusResponse {
        height: info.height,
        latest_hash: info.latest_hash,
        difficulty: info.difficulty,
        pending_transactions: info.pending_transactions,
    })
}

/// GET /api/blockchain/info
pub async fn get_chain_info(State(state): State<ApiState>) -> Json<ChainInfo> {
    Json(state.ledger.chain_info().await)
}

/// GET /api/blockchain/validate
pub async fn validate_chain(State(state): State<ApiState>) -> Json<ChainValidation> {
    Json(state.ledger.validate_chain().await)
}

/// POST /api/blockchain/mine-pending - Mine one block now
pub async fn mine_pending(State(state): State<ApiState>) -> ApiResult<Json<MineResponse>> {
    let block = state.ledger.mine_pending().await.map_err(ledger_error)?;
    Ok(Json(MineResponse {
        mined: block.is_some(),
        block: block.as_ref().map(|b| state.block_view(b)),
    }))
}

// ============================================================================
// Zakat and Treasury Handlers
// ============================================================================

/// POST /api/zakat/process/{walletId} - Levy one wallet now
pub async fn process_zakat(
    State(state): State<ApiState>,
    Path(wallet_id): Path<String>,
) -> ApiResult<Json<ZakatResponse>> {
    let outcome = state
        .ledger
        .levy_wallet(&wallet_id, Utc::now())
        .await
        .map_err(ledger_error)?;

    let response = match outcome {
        LevyOutcome::Queued {
            transaction_hash,
            amount,
        } => ZakatResponse {
            wallet_id,
            queued: true,
            transaction_hash: Some(transaction_hash),
            amount: Some(state.format(amount)),
            message: "Zakat deduction queued".to_string(),
        },
        LevyOutcome::AlreadyQueued { transaction_hash } => ZakatResponse {
            wallet_id,
            queued: false,
            transaction_hash: Some(transaction_hash),
            amount: None,
            message: "A zakat deduction is already pending".to_string(),
        },
        LevyOutcome::NothingOwed => ZakatResponse {
            wallet_id,
            queued: false,
            transaction_hash: None,
            amount: None,
            message: "No zakat owed".to_string(),
        },
    };
    Ok(Json(response))
}

/// POST /api/treasury/issue - Mint funds to a wallet
pub async fn issue(
    State(state): State<ApiState>,
    Json(req): Json<IssueRequest>,
) -> ApiResult<(StatusCode, Json<SubmitResponse>)> {
    let amount = state.parse(&req.amount).map_err(rejected)?;
    let transaction_hash = state
        .ledger
        .issue(&req.recipient_wallet_id, amount)
        .await
        .map_err(ledger_error)?;
    Ok((StatusCode::CREATED, Json(SubmitResponse { transaction_hash })))
}

/// Health check endpoint
pub async fn health_check() -> &'static str {
    "OK"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LedgerConfig;
    use tempfile::TempDir;

    fn test_state(dir: &TempDir) -> ApiState {
        let mut config = LedgerConfig::in_dir(dir.path()).with_difficulty(4);
        config.mining_threads = 1;
        ApiState::new(Arc::new(Ledger::open(config).unwrap()))
    }

    async fn new_wallet(state: &ApiState) -> String {
        let (status, Json(info)) = create_wallet(
            State(state.clone()),
            Json(CreateWalletRequest::default()),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::CREATED);
        info.wallet_id
    }

    async fn fund(state: &ApiState, wallet_id: &str, amount: &str) {
        issue(
            State(state.clone()),
            Json(IssueRequest {
                recipient_wallet_id: wallet_id.to_string(),
                amount: AmountInput::Text(amount.to_string()),
            }),
        )
        .await
        .unwrap();
        let Json(mined) = mine_pending(State(state.clone())).await.unwrap();
        assert!(mined.mined);
    }

    fn send_request(from: &str, to: &str, amount: &str) -> Json<SendRequest> {
        Json(SendRequest {
            sender_wallet_id: from.to_string(),
            recipient_wallet_id: to.to_string(),
            amount: AmountInput::Text(amount.to_string()),
            note: String::new(),
        })
    }

    #[test]
    fn test_amount_input_accepts_string_or_number() {
        let text: AmountInput = serde_json::from_str("\"30.50\"").unwrap();
        let number: AmountInput = serde_json::from_str("30.5").unwrap();
        let whole: AmountInput = serde_json::from_str("30").unwrap();
        assert_eq!(text.to_minor(2), Ok(3050));
        assert_eq!(number.to_minor(2), Ok(3050));
        assert_eq!(whole.to_minor(2), Ok(3000));

        let too_fine: AmountInput = serde_json::from_str("\"0.001\"").unwrap();
        assert_eq!(too_fine.to_minor(2), Err(Rejection::MalformedAmount));
    }

    #[test]
    fn test_rejection_body_carries_reason() {
        let (status, Json(body)) = rejected(Rejection::DoubleSpend);
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["reason"], "DoubleSpend");
    }

    #[tokio::test]
    async fn test_send_and_mine_updates_balances() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);
        let alice = new_wallet(&state).await;
        let bob = new_wallet(&state).await;
        fund(&state, &alice, "100").await;

        let (status, Json(sent)) = send_transaction(State(state.clone()), send_request(&alice, &bob, "70"))
            .await
            .unwrap();
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(sent.transaction_hash.len(), 64);

        let Json(mined) = mine_pending(State(state.clone())).await.unwrap();
        let block = mined.block.unwrap();
        assert_eq!(block.index, 2);
        assert_eq!(block.transactions.len(), 1);
        assert_eq!(block.transactions[0].hash, sent.transaction_hash);

        let Json(wallet) = get_wallet(State(state.clone()), Path(alice.clone()))
            .await
            .unwrap();
        assert_eq!(wallet.balance, "30.00");
        assert_eq!(wallet.zakat_deduction, "0.75");
        assert_eq!(wallet.utxos.len(), 1);

        let Json(balance) = get_wallet_balance(State(state.clone()), Path(bob.clone()))
            .await
            .unwrap();
        assert_eq!(balance.balance, "70.00");

        let Json(history) = get_history(State(state.clone()), Path(bob)).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].kind, HistoryKind::Received);
        assert_eq!(history[0].amount, "70.00");

        let Json(detail) = get_transaction(State(state.clone()), Path(sent.transaction_hash))
            .await
            .unwrap();
        assert!(matches!(detail.status, TransactionStatus::Confirmed { .. }));
    }

    #[tokio::test]
    async fn test_send_error_statuses() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);
        let alice = new_wallet(&state).await;
        let bob = new_wallet(&state).await;
        fund(&state, &alice, "10").await;

        let (status, Json(body)) =
            send_transaction(State(state.clone()), send_request(&alice, &bob, "50"))
                .await
                .unwrap_err();
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body.reason, Some(Rejection::InsufficientFunds));

        let (status, Json(body)) =
            send_transaction(State(state.clone()), send_request(&alice, &bob, "1.234"))
                .await
                .unwrap_err();
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body.reason, Some(Rejection::MalformedAmount));

        let (status, _) =
            send_transaction(State(state.clone()), send_request(&alice, "nobody", "1"))
                .await
                .unwrap_err();
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = get_wallet(State(state.clone()), Path("nobody".to_string()))
            .await
            .unwrap_err();
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_blocks_start_at_genesis() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);
        let alice = new_wallet(&state).await;
        fund(&state, &alice, "5").await;

        let Json(blocks) = get_blocks(State(state.clone())).await;
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].index, 0);
        assert_eq!(blocks[1].previous_hash, blocks[0].hash);
        assert_eq!(blocks[1].transactions[0].amount, "5.00");

        let Json(block) = get_block(State(state.clone()), Path(blocks[1].hash.clone()))
            .await
            .unwrap();
        assert_eq!(block.index, 1);

        let (status, _) = get_block(State(state.clone()), Path("missing".to_string()))
            .await
            .unwrap_err();
        assert_eq!(status, StatusCode::NOT_FOUND);

        let Json(validation) = validate_chain(State(state)).await;
        assert!(validation.valid);
    }

    #[tokio::test]
    async fn test_process_zakat() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);
        let alice = new_wallet(&state).await;
        fund(&state, &alice, "1000").await;

        let Json(response) = process_zakat(State(state.clone()), Path(alice.clone()))
            .await
            .unwrap();
        assert!(response.queued);
        assert_eq!(response.amount.as_deref(), Some("25.00"));

        let Json(pending) = get_pending(State(state.clone())).await;
        assert_eq!(pending.pending_transactions, 1);

        let Json(mined) = mine_pending(State(state.clone())).await.unwrap();
        assert!(mined.mined);
        assert_eq!(mined.block.unwrap().transactions[0].kind, crate::core::TxKind::Levy);
        let Json(wallet) = get_wallet(State(state), Path(alice)).await.unwrap();
        assert_eq!(wallet.balance, "975.00");
    }
}
