//! Indexer configuration.
//!
//! [`IndexerConfig`] carries defaults for every option. It can be built
//! programmatically or loaded with [`IndexerConfig::load`], which layers an
//! optional TOML/JSON file and `BLOCKDEX_*` environment variables over the
//! defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use blockdex_core::constants::{
    DEFAULT_BLOCK_ADDRESSES_TO_KEEP, DEFAULT_MEMPOOL_SUB_WORKERS, DEFAULT_MEMPOOL_TX_TIMEOUT_HOURS,
    DEFAULT_MEMPOOL_WORKERS, DEFAULT_MINIMUM_COINBASE_CONFIRMATIONS, DEFAULT_RPC_TIMEOUT_SECS,
    DEFAULT_SYNC_CHUNK, DEFAULT_SYNC_WORKERS, DEFAULT_XPUB_GAP, MAX_XPUB_GAP,
    MIN_BLOCK_ADDRESSES_TO_KEEP, XPUB_CACHE_IDLE_SECS,
};
use blockdex_core::error::ParseError;
use blockdex_core::golomb::{FilterParams, FilterScripts};
use serde::{Deserialize, Serialize};

/// Configuration for an indexer instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexerConfig {
    /// Coin name stored in the database; a mismatch refuses to open.
    pub coin: String,
    pub coin_shortcut: String,
    /// Network name if different from the coin shortcut.
    pub network: String,
    /// Backend JSON-RPC endpoint, credentials may be embedded in the URL.
    pub rpc_url: String,
    /// Backend call timeout, seconds.
    pub rpc_timeout: u64,
    /// Root directory for all persistent data.
    pub data_dir: PathBuf,
    /// Bound of the in-memory balance window during bulk connect.
    pub block_addresses_to_keep: u32,
    pub sync_workers: usize,
    pub sync_chunk: u32,
    /// Use cached bulk connect during initial parallel sync.
    pub bulk_connect: bool,
    pub sync_retry_attempts: u32,
    pub tip_poll_period_secs: u64,
    /// Whether the parser decodes raw blocks instead of backend JSON.
    pub parse: bool,
    /// Golomb filter parameter for per-block address filters; 0 disables them.
    pub block_golomb_filter_p: u8,
    /// "" for every script, "taproot" for P2TR outputs only.
    pub block_filter_scripts: String,
    pub block_filter_use_zeroed_key: bool,
    pub mempool_workers: usize,
    pub mempool_sub_workers: usize,
    pub mempool_tx_timeout_hours: u32,
    pub mempool_resync_period_secs: u64,
    /// Fetch each new mempool tx eagerly during resync.
    pub query_backend_on_mempool_resync: bool,
    pub xpub_cache_gap_default: u32,
    pub xpub_cache_gap_max: u32,
    pub xpub_cache_idle_secs: u64,
    /// Store confirmed transactions fetched from the backend.
    pub tx_cache: bool,
    pub minimum_coinbase_confirmations: u32,
    pub state_store_period_secs: u64,
    /// Log level filter string (e.g. "info", "blockdex_db=debug").
    pub log_level: String,
    /// "text" or "json".
    pub log_format: String,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("blockdex");

        Self {
            coin: "Bitcoin".to_string(),
            coin_shortcut: "BTC".to_string(),
            network: String::new(),
            rpc_url: "http://127.0.0.1:8332".to_string(),
            rpc_timeout: DEFAULT_RPC_TIMEOUT_SECS,
            data_dir,
            block_addresses_to_keep: DEFAULT_BLOCK_ADDRESSES_TO_KEEP,
            sync_workers: DEFAULT_SYNC_WORKERS,
            sync_chunk: DEFAULT_SYNC_CHUNK,
            bulk_connect: true,
            sync_retry_attempts: 5,
            tip_poll_period_secs: 5,
            parse: false,
            block_golomb_filter_p: 0,
            block_filter_scripts: String::new(),
            block_filter_use_zeroed_key: false,
            mempool_workers: DEFAULT_MEMPOOL_WORKERS,
            mempool_sub_workers: DEFAULT_MEMPOOL_SUB_WORKERS,
            mempool_tx_timeout_hours: DEFAULT_MEMPOOL_TX_TIMEOUT_HOURS,
            mempool_resync_period_secs: 60,
            query_backend_on_mempool_resync: true,
            xpub_cache_gap_default: DEFAULT_XPUB_GAP,
            xpub_cache_gap_max: MAX_XPUB_GAP,
            xpub_cache_idle_secs: XPUB_CACHE_IDLE_SECS,
            tx_cache: true,
            minimum_coinbase_confirmations: DEFAULT_MINIMUM_COINBASE_CONFIRMATIONS,
            state_store_period_secs: 60,
            log_level: "info".to_string(),
            log_format: "text".to_string(),
        }
    }
}

impl IndexerConfig {
    /// Load defaults, then `file` if given, then `BLOCKDEX_*` environment variables.
    pub fn load(file: Option<&Path>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(config::Environment::with_prefix("BLOCKDEX").try_parsing(true));
        let cfg: Self = builder.build()?.try_deserialize()?;
        Ok(cfg.sanitized())
    }

    /// Clamp tunables to their allowed ranges.
    pub fn sanitized(mut self) -> Self {
        self.block_addresses_to_keep = self.block_addresses_to_keep.max(MIN_BLOCK_ADDRESSES_TO_KEEP);
        self.sync_workers = self.sync_workers.max(1);
        self.sync_chunk = self.sync_chunk.max(1);
        self.mempool_workers = self.mempool_workers.max(1);
        self.mempool_sub_workers = self.mempool_sub_workers.max(1);
        self.xpub_cache_gap_max = self.xpub_cache_gap_max.clamp(1, MAX_XPUB_GAP);
        self.xpub_cache_gap_default = self.xpub_cache_gap_default.clamp(1, self.xpub_cache_gap_max);
        self.rpc_timeout = self.rpc_timeout.max(1);
        self
    }

    /// Golomb filter settings, `None` when filters are disabled.
    pub fn filter_params(&self) -> Result<Option<FilterParams>, ParseError> {
        if self.block_golomb_filter_p == 0 {
            return Ok(None);
        }
        let scripts: FilterScripts = self.block_filter_scripts.parse()?;
        FilterParams::new(self.block_golomb_filter_p, scripts, self.block_filter_use_zeroed_key).map(Some)
    }

    /// Path to the RocksDB index directory.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("db")
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc_timeout)
    }

    pub fn mempool_tx_timeout(&self) -> Duration {
        Duration::from_secs(self.mempool_tx_timeout_hours as u64 * 3600)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_log_level_is_info() {
        assert_eq!(IndexerConfig::default().log_level, "info");
    }

    #[test]
    fn default_data_dir_ends_with_blockdex() {
        let cfg = IndexerConfig::default();
        assert!(cfg.data_dir.ends_with("blockdex"));
    }

    #[test]
    fn db_path_appends_db() {
        let cfg = IndexerConfig { data_dir: PathBuf::from("/tmp/x"), ..Default::default() };
        assert_eq!(cfg.db_path(), PathBuf::from("/tmp/x/db"));
    }

    #[test]
    fn block_addresses_to_keep_is_clamped() {
        let cfg = IndexerConfig { block_addresses_to_keep: 5, ..Default::default() }.sanitized();
        assert_eq!(cfg.block_addresses_to_keep, MIN_BLOCK_ADDRESSES_TO_KEEP);
    }

    #[test]
    fn gap_default_never_exceeds_max() {
        let cfg = IndexerConfig { xpub_cache_gap_default: 500, xpub_cache_gap_max: 50, ..Default::default() }.sanitized();
        assert_eq!(cfg.xpub_cache_gap_default, 50);
        let cfg = IndexerConfig { xpub_cache_gap_max: 1_000_000, ..Default::default() }.sanitized();
        assert_eq!(cfg.xpub_cache_gap_max, MAX_XPUB_GAP);
    }

    #[test]
    fn zero_workers_become_one() {
        let cfg = IndexerConfig { sync_workers: 0, mempool_workers: 0, ..Default::default() }.sanitized();
        assert_eq!(cfg.sync_workers, 1);
        assert_eq!(cfg.mempool_workers, 1);
    }

    #[test]
    fn load_reads_toml_file_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blockdex.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "coin = \"Testnet\"\nsync_workers = 3\nquery_backend_on_mempool_resync = false").unwrap();
        let cfg = IndexerConfig::load(Some(&path)).unwrap();
        assert_eq!(cfg.coin, "Testnet");
        assert_eq!(cfg.sync_workers, 3);
        assert!(!cfg.query_backend_on_mempool_resync);
        assert_eq!(cfg.sync_chunk, DEFAULT_SYNC_CHUNK);
    }

    #[test]
    fn load_missing_file_fails() {
        assert!(IndexerConfig::load(Some(Path::new("/nonexistent/blockdex.toml"))).is_err());
    }

    #[test]
    fn mempool_timeout_in_hours() {
        let cfg = IndexerConfig { mempool_tx_timeout_hours: 2, ..Default::default() };
        assert_eq!(cfg.mempool_tx_timeout(), Duration::from_secs(7200));
    }

    #[test]
    fn config_is_clone_and_debug() {
        let cfg = IndexerConfig::default();
        let cloned = cfg.clone();
        assert_eq!(cfg, cloned);
        assert!(format!("{cfg:?}").contains("IndexerConfig"));
    }

    #[test]
    fn filters_are_off_by_default() {
        assert_eq!(IndexerConfig::default().filter_params().unwrap(), None);
        let cfg = IndexerConfig {
            block_golomb_filter_p: 20,
            block_filter_scripts: "taproot".into(),
            ..Default::default()
        };
        let params = cfg.filter_params().unwrap().unwrap();
        assert_eq!(params.p, 20);
        assert_eq!(params.scripts, FilterScripts::Taproot);
        let bad = IndexerConfig { block_golomb_filter_p: 20, block_filter_scripts: "bogus".into(), ..Default::default() };
        assert!(bad.filter_params().is_err());
    }
}
