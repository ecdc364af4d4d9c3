//! Zakat ledger CLI application
//!
//! Runs the REST API or operates on the ledger directly from the shell.

use clap::{Parser, Subcommand};
use zakat_ledger::cli::{self, CliResult};
use zakat_ledger::config::{LedgerConfig, DEFAULT_API_PORT};
use zakat_ledger::core::{parse_amount, MAX_BLOCK_TXS};
use zakat_ledger::ledger::Ledger;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "zakat-ledger")]
#[command(version)]
#[command(about = "A UTXO wallet ledger with periodic zakat deduction", long_about = None)]
struct Cli {
    /// Data directory for chain and wallet storage
    #[arg(short, long, default_value = ".zakat_ledger")]
    data_dir: PathBuf,

    /// Mining difficulty (number of leading zero bits)
    #[arg(long)]
    difficulty: Option<u32>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the data directory, treasury wallet and genesis block
    Init,

    /// Run the REST API with background mining and levy workers
    Serve {
        /// Port to listen on
        #[arg(short, long, default_value_t = DEFAULT_API_PORT)]
        port: u16,

        /// Mining threads
        #[arg(long)]
        threads: Option<usize>,

        /// Maximum transactions per block
        #[arg(long)]
        max_block_txs: Option<usize>,

        /// Balances at or below this amount owe no zakat
        #[arg(long)]
        levy_threshold: Option<String>,
    },

    /// Wallet operations
    Wallet {
        #[command(subcommand)]
        action: WalletCommands,
    },

    /// Issue funds from the treasury
    Issue {
        /// Recipient wallet id
        #[arg(short, long)]
        to: String,

        /// Amount in display units, e.g. 100.00
        #[arg(short, long)]
        amount: String,
    },

    /// Send funds between wallets
    Send {
        /// Sender wallet id
        #[arg(short, long)]
        from: String,

        /// Recipient wallet id
        #[arg(short, long)]
        to: String,

        /// Amount in display units, e.g. 30.50
        #[arg(short, long)]
        amount: String,

        /// Optional note
        #[arg(short, long, default_value = "")]
        note: String,
    },

    /// Mine pending transactions
    Mine,

    /// Run a zakat levy tick, or levy one wallet now
    Levy {
        /// Wallet to levy immediately
        #[arg(short, long)]
        wallet: Option<String>,
    },

    /// Display chain information
    Chain {
        #[command(subcommand)]
        action: Option<ChainCommands>,
    },

    /// Validate the chain and the UTXO set
    Validate,

    /// Show pending transactions
    Pending,
}

#[derive(Subcommand)]
enum WalletCommands {
    /// Create a new wallet
    New {
        /// Optional label for the wallet
        #[arg(short, long)]
        label: Option<String>,
    },

    /// List all wallets
    List,

    /// Show wallet balance, outputs and history
    Show {
        /// Wallet id
        #[arg(short, long)]
        id: String,
    },
}

#[derive(Subcommand)]
enum ChainCommands {
    /// Show detailed info
    Info,

    /// List recent blocks
    Blocks {
        /// Number of blocks to show
        #[arg(short, long, default_value = "10")]
        count: usize,
    },
}

fn main() -> CliResult<()> {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    let mut config = LedgerConfig::in_dir(&cli.data_dir);
    if let Some(difficulty) = cli.difficulty {
        config.difficulty = difficulty;
    }
    config.validate()?;

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cli.command, config))
}

async fn run(command: Commands, mut config: LedgerConfig) -> CliResult<()> {
    match command {
        Commands::Init => return cli::cmd_init(config).await,
        Commands::Serve {
            port,
            threads,
            max_block_txs,
            levy_threshold,
        } => {
            if let Some(threads) = threads {
                config.mining_threads = threads.max(1);
            }
            if let Some(max) = max_block_txs {
                config.max_block_txs = max.clamp(1, MAX_BLOCK_TXS);
            }
            if let Some(threshold) = levy_threshold {
                config.levy.threshold = parse_amount(&threshold, config.decimals)?;
            }
            return cli::cmd_serve(config, port).await;
        }
        _ => {}
    }

    let ledger = Ledger::open(config)?;

    match command {
        Commands::Init | Commands::Serve { .. } => {}

        Commands::Wallet { action } => match action {
            WalletCommands::New { label } => {
                cli::cmd_wallet_new(&ledger, label.as_deref()).await?;
            }
            WalletCommands::List => {
                cli::cmd_wallet_list(&ledger).await?;
            }
            WalletCommands::Show { id } => {
                cli::cmd_wallet_show(&ledger, &id).await?;
            }
        },

        Commands::Issue { to, amount } => {
            cli::cmd_issue(&ledger, &to, &amount).await?;
        }

        Commands::Send {
            from,
            to,
            amount,
            note,
        } => {
            cli::cmd_send(&ledger, &from, &to, &amount, &note).await?;
        }

        Commands::Mine => {
            cli::cmd_mine(&ledger).await?;
        }

        Commands::Levy { wallet } => {
            cli::cmd_levy(&ledger, wallet.as_deref()).await?;
        }

        Commands::Chain { action } => match action {
            None | Some(ChainCommands::Info) => {
                cli::cmd_chain_info(&ledger).await?;
            }
            Some(ChainCommands::Blocks { count }) => {
                cli::cmd_chain_blocks(&ledger, count).await?;
            }
        },

        Commands::Validate => {
            cli::cmd_validate(&ledger).await?;
        }

        Commands::Pending => {
            cli::cmd_pending(&ledger).await?;
        }
    }

    Ok(())
}
