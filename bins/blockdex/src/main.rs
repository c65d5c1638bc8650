//! blockdex — index a Bitcoin-family node and query the index.
//!
//! `blockdex run` keeps the index in step with the node until Ctrl+C. The
//! query subcommands open the same index and print JSON to stdout; they
//! cannot run while a daemon holds the database.

use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

use blockdex_api::types::{AccountDetails, AddressFilter, TokensToReturn, VoutFilter};
use blockdex_api::Worker;
use blockdex_bitcoin::{BitcoinParser, BitcoinRpc};
use blockdex_core::mempool::{Mempool, SharedMempool};
use blockdex_core::notify::Notifier;
use blockdex_core::traits::BackendClient;
use blockdex_core::types::FiatTicker;
use blockdex_db::{Indexer, IndexerConfig};
use blockdex_sync::{Daemon, MempoolSync, SyncWorker};

/// Blockdex blockchain indexer.
#[derive(Parser)]
#[command(name = "blockdex", version, about = "Blockchain indexer and query engine")]
struct Cli {
    /// Configuration file (TOML or JSON). `BLOCKDEX_*` variables override it.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Data directory, overrides the configuration.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Backend RPC URL, overrides the configuration.
    #[arg(long, global = true)]
    rpc_url: Option<String>,

    /// Log level (trace, debug, info, warn, error) or filter directives.
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Log output format ("text" or "json").
    #[arg(long, global = true)]
    log_format: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sync, then follow the node tip and mempool until Ctrl+C.
    Run,
    /// Sync once to the node tip and exit.
    Sync,
    /// Recount rows and sizes of every database column.
    ComputeStats,
    /// Index and backend status.
    Status,
    /// Balance and history of an address.
    Address(AddressArgs),
    /// Unspent outputs of an address.
    Utxo(UtxoArgs),
    /// Balance and history of an extended public key.
    Xpub(XpubArgs),
    /// Unspent outputs of an extended public key.
    XpubUtxo(XpubUtxoArgs),
    /// A transaction.
    Tx(TxArgs),
    /// A block by height or hash.
    Block(BlockArgs),
    /// Indexed blocks, newest first.
    Blocks(PageArgs),
    /// Balance history of an address or xpub.
    BalanceHistory(BalanceHistoryArgs),
    /// Fee statistics of a block.
    FeeStats(BlockIdArgs),
    /// Golomb address filter of a block, hex.
    BlockFilter(BlockIdArgs),
    /// Fee estimate for confirmation within a number of blocks.
    EstimateFee(EstimateFeeArgs),
    /// Broadcast a raw transaction.
    Send(SendArgs),
    /// Fiat rates, current or at given timestamps.
    FiatRates(FiatRatesArgs),
    /// Load fiat tickers from a JSON file.
    ImportRates(ImportRatesArgs),
}

#[derive(Args)]
struct PageArgs {
    #[arg(long, default_value_t = 1)]
    page: i64,
    #[arg(long, default_value_t = 25)]
    items: i64,
}

#[derive(Clone, Copy, ValueEnum)]
enum Details {
    Basic,
    Tokens,
    Txids,
    Light,
    Txs,
}

impl From<Details> for AccountDetails {
    fn from(d: Details) -> Self {
        match d {
            Details::Basic => Self::Basic,
            Details::Tokens => Self::TokenBalances,
            Details::Txids => Self::Txids,
            Details::Light => Self::TxHistoryLight,
            Details::Txs => Self::TxHistory,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum Side {
    Inputs,
    Outputs,
}

#[derive(Args)]
struct FilterArgs {
    #[arg(long, value_enum, default_value = "txids")]
    details: Details,
    #[arg(long, default_value_t = 0)]
    from_height: u32,
    /// Highest block height to include; 0 means no bound.
    #[arg(long, default_value_t = 0)]
    to_height: u32,
    /// Only list txs where the address is on this side.
    #[arg(long, value_enum)]
    side: Option<Side>,
    /// Only list txs touching this token contract.
    #[arg(long)]
    contract: Option<String>,
    #[arg(long)]
    only_confirmed: bool,
}

impl FilterArgs {
    fn filter(&self) -> AddressFilter {
        AddressFilter {
            vout: match self.side {
                None => VoutFilter::Off,
                Some(Side::Inputs) => VoutFilter::Inputs,
                Some(Side::Outputs) => VoutFilter::Outputs,
            },
            from_height: self.from_height,
            to_height: self.to_height,
            contract: self.contract.clone(),
            only_confirmed: self.only_confirmed,
        }
    }
}

#[derive(Args)]
struct AddressArgs {
    address: String,
    #[command(flatten)]
    page: PageArgs,
    #[command(flatten)]
    filter: FilterArgs,
}

#[derive(Args)]
struct UtxoArgs {
    address: String,
    #[arg(long)]
    confirmed: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum Tokens {
    Nonzero,
    Used,
    Derived,
}

impl From<Tokens> for TokensToReturn {
    fn from(t: Tokens) -> Self {
        match t {
            Tokens::Nonzero => Self::NonzeroBalance,
            Tokens::Used => Self::Used,
            Tokens::Derived => Self::Derived,
        }
    }
}

#[derive(Args)]
struct XpubArgs {
    xpub: String,
    #[command(flatten)]
    page: PageArgs,
    #[command(flatten)]
    filter: FilterArgs,
    /// Gap limit of unused addresses.
    #[arg(long)]
    gap: Option<u32>,
    #[arg(long, value_enum, default_value = "nonzero")]
    tokens: Tokens,
}

#[derive(Args)]
struct XpubUtxoArgs {
    xpub: String,
    #[arg(long)]
    confirmed: bool,
    #[arg(long)]
    gap: Option<u32>,
}

#[derive(Args)]
struct TxArgs {
    txid: String,
    /// Resolve the txs spending each output.
    #[arg(long)]
    spending: bool,
    /// Attach the backend's own representation.
    #[arg(long)]
    specific: bool,
}

#[derive(Args)]
struct BlockArgs {
    /// Height or hash.
    id: String,
    #[command(flatten)]
    page: PageArgs,
}

#[derive(Args)]
struct BalanceHistoryArgs {
    /// Address, or xpub with `--xpub`.
    descriptor: String,
    #[arg(long)]
    xpub: bool,
    /// Unix seconds, inclusive; 0 for no bound.
    #[arg(long, default_value_t = 0)]
    from: i64,
    /// Unix seconds, exclusive; 0 for no bound.
    #[arg(long, default_value_t = 0)]
    to: i64,
    /// Bucket width in seconds.
    #[arg(long, default_value_t = 3600)]
    group_by: u32,
    /// Fiat currencies to attach rates for.
    #[arg(long, value_delimiter = ',')]
    currency: Vec<String>,
    #[arg(long)]
    gap: Option<u32>,
}

#[derive(Args)]
struct BlockIdArgs {
    /// Block height or hash.
    id: String,
}

#[derive(Args)]
struct EstimateFeeArgs {
    #[arg(default_value_t = 6)]
    blocks: u32,
    #[arg(long)]
    conservative: bool,
}

#[derive(Args)]
struct SendArgs {
    /// Hex-encoded raw transaction.
    hex: String,
}

#[derive(Args)]
struct FiatRatesArgs {
    /// Unix timestamps; the latest rates if none.
    #[arg(value_delimiter = ',')]
    timestamps: Vec<i64>,
    #[arg(long, value_delimiter = ',')]
    currency: Vec<String>,
}

#[derive(Args)]
struct ImportRatesArgs {
    /// JSON array of `{ "timestamp", "rates" }` objects.
    file: PathBuf,
}

impl Cli {
    fn load_config(&self) -> Result<IndexerConfig> {
        let mut cfg = IndexerConfig::load(self.config.as_deref()).context("failed to load configuration")?;
        if let Some(dir) = &self.data_dir {
            cfg.data_dir = dir.clone();
        }
        if let Some(url) = &self.rpc_url {
            cfg.rpc_url = url.clone();
        }
        if let Some(level) = &self.log_level {
            cfg.log_level = level.clone();
        }
        if let Some(format) = &self.log_format {
            cfg.log_format = format.clone();
        }
        Ok(cfg)
    }
}

/// Everything a subcommand may need, wired over one opened index.
struct App {
    cfg: IndexerConfig,
    ix: Arc<Indexer>,
    rpc: Arc<BitcoinRpc>,
    backend: Arc<dyn BackendClient>,
    mempool: SharedMempool,
    notifier: Notifier,
}

impl App {
    fn open(cfg: IndexerConfig) -> Result<Self> {
        let network = if cfg.network.is_empty() { &cfg.coin_shortcut } else { &cfg.network };
        let parser = BitcoinParser::for_network(network).with_context(|| format!("network {network}"))?;
        std::fs::create_dir_all(&cfg.data_dir)
            .with_context(|| format!("failed to create data dir {}", cfg.data_dir.display()))?;
        let ix = Indexer::open(cfg.db_path(), Arc::new(parser), &cfg.coin, &cfg.coin_shortcut)
            .with_context(|| format!("failed to open index at {}", cfg.db_path().display()))?;
        let ix = ix.with_block_filters(cfg.filter_params().context("invalid block filter settings")?);
        let rpc = Arc::new(BitcoinRpc::new(&cfg.rpc_url, cfg.rpc_timeout()).context("invalid backend RPC URL")?);
        let backend: Arc<dyn BackendClient> = rpc.clone();
        Ok(Self { ix: Arc::new(ix), rpc, backend, mempool: Mempool::shared(), notifier: Notifier::new(), cfg })
    }

    fn sync_worker(&self, shutdown: watch::Receiver<bool>) -> Arc<SyncWorker> {
        Arc::new(SyncWorker::new(
            self.ix.clone(),
            self.backend.clone(),
            self.mempool.clone(),
            self.notifier.clone(),
            &self.cfg,
            shutdown,
        ))
    }

    fn worker(&self) -> Worker {
        Worker::new(self.ix.clone(), self.backend.clone(), self.mempool.clone(), &self.cfg)
    }
}

fn print<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Flip `shutdown` on Ctrl+C.
fn spawn_signal_handler(shutdown: watch::Sender<bool>) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("received Ctrl+C, shutting down...");
                let _ = shutdown.send(true);
            }
            Err(e) => error!(error = %e, "failed to install Ctrl+C handler"),
        }
    });
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let cfg = match cli.load_config() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("error: {e:#}");
            process::exit(1);
        }
    };
    init_logging(&cfg.log_level, &cfg.log_format);

    if let Err(e) = run(cli.command, cfg).await {
        error!("{e:#}");
        process::exit(1);
    }
}

async fn run(command: Commands, cfg: IndexerConfig) -> Result<()> {
    let app = App::open(cfg)?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    match command {
        Commands::Run => return run_daemon(app, shutdown_tx, shutdown_rx).await,
        Commands::Sync => {
            spawn_signal_handler(shutdown_tx);
            let sync = app.sync_worker(shutdown_rx);
            let result = sync.resync_index(true).await;
            app.ix.close()?;
            let synced = result.context("sync failed")?;
            info!(changed = synced.changed, best_height = app.ix.state().best_height(), "sync done");
        }
        Commands::ComputeStats => {
            let ix = app.ix.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    ix.stop_computing_stats();
                }
            });
            let ix = app.ix.clone();
            tokio::task::spawn_blocking(move || ix.compute_column_stats()).await??;
            print(&app.ix.state().snapshot())?;
        }
        Commands::Status => {
            match app.backend.get_chain_info().await {
                Ok(info) => app.ix.state().set_backend_info(info),
                Err(e) => app.ix.state().set_backend_error(e.to_string()),
            }
            print(&app.worker().get_system_info())?;
        }
        command => query(&app.worker(), &app, command).await?,
    }
    Ok(())
}

async fn query(w: &Worker, app: &App, command: Commands) -> Result<()> {
    match command {
        Commands::Address(a) => {
            print(&w.get_address(&a.address, a.page.page, a.page.items, a.filter.details.into(), &a.filter.filter()).await?)
        }
        Commands::Utxo(a) => print(&w.get_utxo(&a.address, a.confirmed).await?),
        Commands::Xpub(a) => print(
            &w.get_xpub_address(
                &a.xpub,
                a.page.page,
                a.page.items,
                a.filter.details.into(),
                &a.filter.filter(),
                a.gap,
                a.tokens.into(),
            )
            .await?,
        ),
        Commands::XpubUtxo(a) => print(&w.get_xpub_utxo(&a.xpub, a.confirmed, a.gap).await?),
        Commands::Tx(a) => print(&w.get_transaction(&a.txid, a.spending, a.specific).await?),
        Commands::Block(a) => print(&w.get_block(&a.id, a.page.page, a.page.items).await?),
        Commands::Blocks(p) => print(&w.get_blocks(p.page, p.items)?),
        Commands::BalanceHistory(a) => {
            let history = if a.xpub {
                w.get_xpub_balance_history(&a.descriptor, a.from, a.to, &a.currency, a.gap, a.group_by).await?
            } else {
                w.get_balance_history(&a.descriptor, a.from, a.to, &a.currency, a.group_by).await?
            };
            print(&history)
        }
        Commands::FeeStats(a) => print(&w.get_fee_stats(&a.id).await?),
        Commands::BlockFilter(a) => print(&w.get_block_filter(&a.id).await?),
        Commands::EstimateFee(a) => print(&w.estimate_smart_fee(a.blocks, a.conservative).await?.to_string()),
        Commands::Send(a) => print(&w.send_transaction(&a.hex).await?),
        Commands::FiatRates(a) => {
            if a.timestamps.is_empty() {
                print(&w.get_current_fiat_rates(&a.currency)?)
            } else {
                print(&w.get_fiat_rates_for_timestamps(&a.timestamps, &a.currency)?)
            }
        }
        Commands::ImportRates(a) => {
            let raw = std::fs::read_to_string(&a.file).with_context(|| format!("failed to read {}", a.file.display()))?;
            let tickers: Vec<FiatTicker> = serde_json::from_str(&raw).context("invalid ticker file")?;
            for t in &tickers {
                app.ix.store_ticker(t)?;
            }
            info!(count = tickers.len(), "fiat tickers imported");
            Ok(())
        }
        Commands::Run | Commands::Sync | Commands::ComputeStats | Commands::Status => {
            bail!("not a query command")
        }
    }
}

async fn run_daemon(app: App, shutdown_tx: watch::Sender<bool>, shutdown_rx: watch::Receiver<bool>) -> Result<()> {
    info!("Blockdex v{}", env!("CARGO_PKG_VERSION"));
    info!(coin = %app.cfg.coin, data_dir = ?app.cfg.data_dir, "starting indexer");
    info!(best_height = app.ix.state().best_height(), "index opened");
    spawn_signal_handler(shutdown_tx);

    let poller =
        app.rpc.spawn_tip_poller(Duration::from_secs(app.cfg.tip_poll_period_secs.max(1)), shutdown_rx.clone());

    let mut blocks = app.notifier.on_new_block();
    tokio::spawn(async move {
        loop {
            match blocks.recv().await {
                Ok(b) => debug!(height = b.height, hash = %b.hash, "block indexed"),
                Err(broadcast::error::RecvError::Lagged(n)) => debug!(skipped = n, "block log lagged"),
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let sync = app.sync_worker(shutdown_rx.clone());
    let mempool_sync = Arc::new(MempoolSync::new(
        app.ix.clone(),
        app.backend.clone(),
        app.mempool.clone(),
        app.notifier.clone(),
        &app.cfg,
        shutdown_rx.clone(),
    ));
    let daemon = Daemon::new(app.ix.clone(), app.backend.clone(), sync, mempool_sync, &app.cfg);
    info!("Blockdex running (Ctrl+C to stop)");
    let result = daemon.run(shutdown_rx).await;

    if let Err(e) = poller.await {
        warn!(error = %e, "tip poller task failed");
    }
    result.context("sync loop failed")?;
    info!("Blockdex shutdown complete");
    Ok(())
}

/// Initialize tracing subscriber with the given log level and output format.
///
/// `format = "json"` emits structured JSON lines; anything else is text.
fn init_logging(level_str: &str, format: &str) {
    use tracing_subscriber::filter::EnvFilter;
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level_str));

    if format == "json" {
        tracing_subscriber::registry().with(filter).with(fmt::layer().json().with_writer(std::io::stderr)).init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_level(true).with_writer(std::io::stderr))
            .init();
    }
}
