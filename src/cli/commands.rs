//! CLI commands for the ledger
//!
//! Each command opens the ledger in-process. Nothing stays queued after the
//! process exits, so commands that queue transactions also mine them.

use crate::api::{create_router, ApiState};
use crate::config::LedgerConfig;
use crate::core::{parse_amount, Block};
use crate::ledger::{self, Ledger, LevyOutcome};
use chrono::Utc;
use std::net::SocketAddr;
use std::sync::Arc;

/// Result type for CLI operations
pub type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

/// First 16 characters of a hash
fn short(hash: &str) -> &str {
    hash.get(..16).unwrap_or(hash)
}

fn print_block(block: &Block) {
    println!("\n   Block {} committed!", block.index);
    println!("   ├─ Hash: {}", short(&block.hash));
    println!("   ├─ Transactions: {}", block.tx_count());
    println!("   ├─ Nonce: {}", block.header.nonce);
    println!(
        "   └─ Time: {}",
        block.header.timestamp.format("%Y-%m-%d %H:%M:%S")
    );
}

/// Mine until the queue is empty
async fn mine_all(ledger: &Ledger) -> CliResult<usize> {
    let mut mined = 0;
    while let Some(block) = ledger.mine_pending().await? {
        print_block(&block);
        mined += 1;
    }
    Ok(mined)
}

/// Initialize the data directory, treasury and genesis block
pub async fn cmd_init(config: LedgerConfig) -> CliResult<()> {
    let data_dir = config.storage.data_dir.clone();
    let ledger = Ledger::open(config)?;
    let info = ledger.chain_info().await;

    println!("✅ Ledger initialized!");
    println!("   📁 Data directory: {:?}", data_dir);
    println!("   🔧 Difficulty: {}", info.difficulty);
    println!("   🧱 Tip: #{} {}", info.height, info.latest_hash);
    println!("   🏦 Treasury wallet: {}", info.treasury_wallet_id);

    Ok(())
}

/// Run the REST API with the mining and levy workers
pub async fn cmd_serve(config: LedgerConfig, port: u16) -> CliResult<()> {
    let ledger = Arc::new(Ledger::open(config)?);
    let workers = ledger::spawn_workers(ledger.clone());
    let app = create_router(ApiState::new(ledger.clone()));

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    println!("🚀 REST API server starting on http://localhost:{}", port);
    println!("   🏦 Treasury wallet: {}", ledger.treasury_id().await);
    println!("   📡 Events: ws://localhost:{}/ws", port);

    let shutdown = ledger.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::signal::ctrl_c().await.ok();
            println!("\n📴 Shutting down...");
            shutdown.shutdown();
        })
        .await?;

    workers.join().await;
    println!("✅ Stopped cleanly");
    Ok(())
}

/// Create a new wallet
pub async fn cmd_wallet_new(ledger: &Ledger, label: Option<&str>) -> CliResult<()> {
    let wallet = ledger.register_wallet(label).await?;

    println!("🔐 New wallet created!");
    println!("   📍 Wallet ID: {}", wallet.wallet_id);
    println!("   🔑 Public Key: {}...", short(&wallet.public_key));
    if let Some(l) = &wallet.label {
        println!("   🏷️  Label: {}", l);
    }
    println!("\n   ⚠️  The private key is kept in the wallets directory.");

    Ok(())
}

/// List all wallets
pub async fn cmd_wallet_list(ledger: &Ledger) -> CliResult<()> {
    let wallets = ledger.list_wallets().await;

    println!("📋 Wallets:");
    for wallet in &wallets {
        let balance = ledger.wallet_snapshot(&wallet.wallet_id).await?.balance;
        let label = wallet.label.as_deref().unwrap_or("-");
        println!(
            "   {} ({}) - {}",
            wallet.wallet_id,
            label,
            ledger.format(balance)
        );
    }

    Ok(())
}

/// Show balance, outputs and owed zakat
pub async fn cmd_wallet_show(ledger: &Ledger, wallet_id: &str) -> CliResult<()> {
    let snapshot = ledger.wallet_snapshot(wallet_id).await?;

    println!("💰 Wallet {}", wallet_id);
    println!("   Balance: {}", ledger.format(snapshot.balance));
    println!("   Zakat owed now: {}", ledger.format(snapshot.pending_levy));
    if let Some(due) = snapshot.next_levy_due {
        println!("   Next zakat due: {}", due.format("%Y-%m-%d %H:%M:%S"));
    }
    println!("   UTXOs: {}", snapshot.utxos.len());

    for utxo in snapshot.utxos.iter().take(10) {
        println!("   └─ {} = {}", short(&utxo.id), ledger.format(utxo.amount));
    }
    if snapshot.utxos.len() > 10 {
        println!("   ... and {} more", snapshot.utxos.len() - 10);
    }

    let history = ledger.history(wallet_id).await?;
    if !history.is_empty() {
        println!("\n   History:");
        for entry in history.iter().rev().take(10) {
            println!(
                "   └─ {:?} {} {} ({:?})",
                entry.kind,
                ledger.format(entry.amount),
                entry.counterparty,
                entry.status
            );
        }
    }

    Ok(())
}

/// Mint funds from the treasury
pub async fn cmd_issue(ledger: &Ledger, to: &str, amount: &str) -> CliResult<()> {
    let amount = parse_amount(amount, ledger.config().decimals)?;
    let hash = ledger.issue(to, amount).await?;

    println!("🏦 Issuance queued: {}", hash);
    println!("   To: {}", to);
    println!("   Amount: {}", ledger.format(amount));
    mine_all(ledger).await?;

    Ok(())
}

/// Send funds between wallets
pub async fn cmd_send(
    ledger: &Ledger,
    from: &str,
    to: &str,
    amount: &str,
    note: &str,
) -> CliResult<()> {
    let amount = parse_amount(amount, ledger.config().decimals)?;
    let hash = ledger.submit_transfer(from, to, amount, note).await?;

    println!("📤 Transaction accepted:");
    println!("   Hash: {}", hash);
    println!("   From: {}", from);
    println!("   To: {}", to);
    println!("   Amount: {}", ledger.format(amount));
    mine_all(ledger).await?;

    Ok(())
}

/// Mine whatever is pending
pub async fn cmd_mine(ledger: &Ledger) -> CliResult<()> {
    println!("⛏️  Mining pending transactions...");
    if mine_all(ledger).await? == 0 {
        println!("   Nothing pending");
    }
    Ok(())
}

/// Run a levy tick, or levy one wallet immediately
pub async fn cmd_levy(ledger: &Ledger, wallet_id: Option<&str>) -> CliResult<()> {
    let now = Utc::now();

    match wallet_id {
        Some(wallet_id) => match ledger.levy_wallet(wallet_id, now).await? {
            LevyOutcome::Queued {
                transaction_hash,
                amount,
            } => {
                println!("🕌 Zakat of {} queued: {}", ledger.format(amount), transaction_hash);
            }
            LevyOutcome::AlreadyQueued { transaction_hash } => {
                println!("⏳ Zakat already pending: {}", transaction_hash);
            }
            LevyOutcome::NothingOwed => {
                println!("ℹ️  No zakat owed by {}", wallet_id);
            }
        },
        None => {
            let queued = ledger.run_levy_tick(now).await?;
            println!("🕌 {} wallet(s) due for zakat", queued.len());
            for hash in &queued {
                println!("   └─ {}", hash);
            }
        }
    }

    mine_all(ledger).await?;
    Ok(())
}

/// Display chain info
pub async fn cmd_chain_info(ledger: &Ledger) -> CliResult<()> {
    let info = ledger.chain_info().await;

    println!("⛓️  Ledger Info");
    println!("   ├─ Height: {}", info.height);
    println!("   ├─ Total blocks: {}", info.total_blocks);
    println!("   ├─ Total transactions: {}", info.total_transactions);
    println!("   ├─ Unspent value: {}", info.total_unspent);
    println!("   ├─ Unspent outputs: {}", info.unspent_outputs);
    println!("   ├─ Wallets: {}", info.wallets);
    println!("   ├─ Pending: {} ({} dropped)", info.pending_transactions, info.dropped_transactions);
    println!(
        "   ├─ Chain file: {} bytes, {} backups",
        info.chain_file_bytes, info.backups
    );
    println!("   ├─ Difficulty: {}", info.difficulty);
    println!("   └─ Latest hash: {}", info.latest_hash);

    Ok(())
}

/// List recent blocks
pub async fn cmd_chain_blocks(ledger: &Ledger, count: usize) -> CliResult<()> {
    let blocks = ledger.list_blocks().await;

    println!("🧱 Recent blocks:");
    for block in blocks.iter().rev().take(count) {
        println!(
            "   #{} | {} | {} tx | {}",
            block.index,
            short(&block.hash),
            block.tx_count(),
            block.header.timestamp.format("%Y-%m-%d %H:%M:%S")
        );
    }

    Ok(())
}

/// Validate the chain and the UTXO set
pub async fn cmd_validate(ledger: &Ledger) -> CliResult<()> {
    println!("🔍 Validating ledger...");
    let validation = ledger.validate_chain().await;

    if validation.valid {
        println!("✅ Ledger is valid!");
        println!("   {} blocks verified", validation.height + 1);
    } else {
        println!("❌ Ledger validation FAILED!");
        if let Some(index) = validation.first_invalid {
            println!("   First invalid block: #{}", index);
        }
        if !validation.utxo_replay_matches {
            println!("   Replaying the chain does not reproduce the UTXO set.");
        }
    }

    Ok(())
}

/// Show pending transactions
pub async fn cmd_pending(ledger: &Ledger) -> CliResult<()> {
    let pending = ledger.pending_transactions().await;

    println!("📬 Pending transactions: {}", pending.len());
    for tx in pending.iter().take(10) {
        println!(
            "   └─ {} {} {} -> {}",
            short(&tx.hash),
            tx.kind.as_str(),
            ledger.format(tx.amount),
            tx.recipient_wallet_id
        );
    }

    Ok(())
}
