//! ERC-20 Transfer indexer CLI.
//!
//! Indexes `Transfer` events of one token contract into a local ledger and
//! answers history and holder queries from it.
//!
//! # Usage
//!
//! ```bash
//! # Index continuously, falling back to a second endpoint
//! erc20-indexer run --rpc https://a.example.com,https://b.example.com \
//!     --contract 0x... --deployment-block 6082465
//!
//! # Latest transfers, oldest transfers and largest holders
//! erc20-indexer transfers --limit 20
//! erc20-indexer transfers --limit 20 --order asc
//! erc20-indexer holders --top 10
//!
//! # Check the stored ledger and dump it to Parquet
//! erc20-indexer verify
//! erc20-indexer export --out transfers.parquet
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use alloy::providers::ProviderBuilder;
use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use erc20_indexer::config::{Config, Settings};
use erc20_indexer::export;
use erc20_indexer::fetcher::RpcChain;
use erc20_indexer::gateway::Gateway;
use erc20_indexer::pipeline::{LoopOptions, run_with_fallback};
use erc20_indexer::projector::Projector;
use erc20_indexer::subscription::{Hub, Notification, Subscription};
use erc20_ledger::{Ledger, Order, SqliteStore, Store};
use tokio::sync::watch;

/// ERC-20 Transfer indexer.
#[derive(Debug, Parser)]
#[command(name = "erc20-indexer", version, about)]
struct Cli {
    /// TOML configuration file. Missing is fine.
    #[arg(long, global = true, env = "INDEXER_CONFIG", default_value = "indexer.toml")]
    config: PathBuf,

    /// Ledger database file, overriding the config file.
    #[arg(long, global = true, env = "INDEXER_STATE_PATH")]
    state_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

/// Available subcommands.
#[derive(Debug, Subcommand)]
enum Command {
    /// Index finalized transfers until interrupted.
    Run(RunArgs),

    /// Print a page of transfer history as JSON.
    Transfers {
        /// Page size.
        #[arg(long, default_value_t = 20)]
        limit: usize,

        /// Transfers to skip.
        #[arg(long, default_value_t = 0)]
        offset: usize,

        /// `desc` for newest first, `asc` for oldest first.
        #[arg(long, default_value_t = Order::Desc)]
        order: Order,
    },

    /// Print the largest holders as JSON.
    Holders {
        /// Number of holders.
        #[arg(long, default_value_t = 10)]
        top: usize,
    },

    /// Replay the stored history and check the ledger invariants.
    Verify,

    /// Write the committed history to a Parquet file.
    Export {
        /// Output file (e.g. `transfers.parquet`).
        #[arg(long)]
        out: PathBuf,
    },
}

/// Overrides for the `run` subcommand.
#[derive(Debug, Args)]
struct RunArgs {
    /// RPC endpoints in fallback order, comma separated.
    #[arg(long = "rpc", env = "INDEXER_RPC_URLS", value_delimiter = ',')]
    rpc_urls: Vec<String>,

    /// Token contract address.
    #[arg(long, env = "INDEXER_CONTRACT")]
    contract: Option<String>,

    /// Event signature hash.
    #[arg(long, env = "INDEXER_TOPIC0")]
    topic0: Option<String>,

    /// First block to index.
    #[arg(long, env = "INDEXER_DEPLOYMENT_BLOCK")]
    deployment_block: Option<u64>,

    /// Blocks to stay behind the chain head.
    #[arg(long, env = "INDEXER_FINALITY_CONFIRMATIONS")]
    finality_confirmations: Option<u64>,
}

impl RunArgs {
    fn into_config(self) -> Config {
        Config {
            rpc_urls: self.rpc_urls,
            contract: self.contract,
            topic0: self.topic0,
            deployment_block: self.deployment_block,
            finality_confirmations: self.finality_confirmations,
            ..Config::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured logging.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = Config::load(&cli.config)?.merge(Config {
        state_path: cli.state_path,
        ..Config::default()
    });

    match cli.command {
        Command::Run(args) => cmd_run(config.merge(args.into_config()).validate()?).await,
        Command::Transfers {
            limit,
            offset,
            order,
        } => {
            let ledger = load_ledger(&config.state_path())?;
            print_json(&Gateway::page_of(&ledger, limit, offset, order))
        }
        Command::Holders { top } => {
            let ledger = load_ledger(&config.state_path())?;
            print_json(&ledger.top_holders(top))
        }
        Command::Verify => cmd_verify(&config.state_path()),
        Command::Export { out } => {
            let ledger = load_ledger(&config.state_path())?;
            export::write(&out, ledger.transfers())?;
            Ok(())
        }
    }
}

/// Execute the `run` subcommand.
async fn cmd_run(settings: Settings) -> Result<()> {
    let hub = Arc::new(Hub::new(settings.subscriber_buffer));
    let store = SqliteStore::open(&settings.state_path)?;
    let projector = Projector::open(store, settings.deployment_block, Arc::clone(&hub))?;
    let gateway = Gateway::new(projector.ledger(), hub);

    let (stop, shutdown) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("shutdown requested"),
            Err(e) => tracing::error!(error = %e, "cannot listen for ctrl-c, stopping"),
        }
        stop.send_replace(true);
    });
    tokio::spawn(log_feed(gateway.subscribe_transfers()));

    let options = LoopOptions {
        poll_interval: settings.poll_interval,
        max_poll_interval: settings.max_poll_interval,
        max_storage_retries: settings.max_storage_retries,
    };
    let timeout = settings.fetch.request_timeout;
    let chains = settings.rpc_urls.iter().enumerate().map(|(endpoint, url)| {
        tracing::info!(endpoint, url = %url, "connecting");
        RpcChain::new(ProviderBuilder::new().connect_http(url.clone()), timeout)
    });

    let total = run_with_fallback(chains, projector, settings.fetch, options, shutdown).await?;

    tracing::info!(
        batches = total.batches,
        transfers = total.transfers,
        reorgs = total.reorgs,
        checkpoint = gateway.checkpoint().block_number,
        "stopped cleanly"
    );
    Ok(())
}

/// Log every pushed notification until the feed ends.
async fn log_feed(mut feed: Subscription) {
    let subscriber = feed.id();
    loop {
        match feed.next().await {
            Ok(Some(Notification::Transfer(e))) => tracing::debug!(
                block = e.block_number,
                log_index = e.log_index,
                from = %e.from,
                to = %e.to,
                value = %e.value,
                "transfer"
            ),
            Ok(Some(Notification::Retracted(e))) => tracing::debug!(
                block = e.block_number,
                log_index = e.log_index,
                "transfer retracted"
            ),
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(subscriber, error = %e, "live feed closed");
                break;
            }
        }
    }
}

/// Execute the `verify` subcommand.
#[allow(clippy::print_stdout)]
fn cmd_verify(state_path: &Path) -> Result<()> {
    let ledger = load_ledger(state_path)?;
    ledger.verify()?;
    let checkpoint = ledger.checkpoint();
    println!(
        "ok: {} transfers, {} holders, supply {}, checkpoint {} ({})",
        ledger.len(),
        ledger.holder_count(),
        ledger.total_supply(),
        checkpoint.block_number,
        checkpoint.block_hash,
    );
    Ok(())
}

/// Load and replay-check the stored ledger.
fn load_ledger(state_path: &Path) -> Result<Ledger> {
    if !state_path.exists() {
        bail!("no ledger at {}", state_path.display());
    }
    let snapshot = SqliteStore::open(state_path)?
        .load()?
        .with_context(|| format!("no ledger at {}", state_path.display()))?;
    Ledger::from_snapshot(snapshot)
        .with_context(|| format!("replaying {}", state_path.display()))
}

#[allow(clippy::print_stdout)]
fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
