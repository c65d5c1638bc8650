//! Indexer constants and tunable defaults.

/// On-disk layout version. Every column family records this value; a database
/// written with a different version is refused at startup.
pub const DB_VERSION: u32 = 7;

/// Default number of most recent blocks whose touched balances stay cached
/// during bulk connect.
pub const DEFAULT_BLOCK_ADDRESSES_TO_KEEP: u32 = 300;

/// Lower bound for `block_addresses_to_keep`.
pub const MIN_BLOCK_ADDRESSES_TO_KEEP: u32 = 100;

/// Default number of parallel block fetchers during initial sync.
pub const DEFAULT_SYNC_WORKERS: usize = 8;

/// Default stripe size; parallel sync starts only when the db is at least this
/// many blocks behind the backend.
pub const DEFAULT_SYNC_CHUNK: u32 = 100;

pub const DEFAULT_MEMPOOL_WORKERS: usize = 8;
pub const DEFAULT_MEMPOOL_SUB_WORKERS: usize = 2;

/// Mempool entries older than this are evicted.
pub const DEFAULT_MEMPOOL_TX_TIMEOUT_HOURS: u32 = 24 * 14;

pub const DEFAULT_XPUB_GAP: u32 = 20;
pub const MAX_XPUB_GAP: u32 = 10_000;

/// Idle time after which an xpub cache entry is dropped.
pub const XPUB_CACHE_IDLE_SECS: u64 = 3600;

/// Backend call timeout in seconds.
pub const DEFAULT_RPC_TIMEOUT_SECS: u64 = 25;

/// Coinbase outputs with fewer confirmations are flagged as immature.
pub const DEFAULT_MINIMUM_COINBASE_CONFIRMATIONS: u32 = 100;

/// Number of trailing blocks averaged for `avg_block_period`.
pub const AVG_BLOCK_PERIOD_WINDOW: usize = 100;

/// Sentinel returned by height lookups that have no answer.
pub const NO_HEIGHT: u32 = u32::MAX;

/// Estimate-fee results are cached for this many seconds per `(blocks, conservative)`.
pub const ESTIMATE_FEE_CACHE_TTL_SECS: i64 = 10;

/// `blocks` values at or above this bypass the estimate-fee cache.
pub const ESTIMATE_FEE_CACHE_SIZE: usize = 300;

/// Sequence numbers below this signal replace-by-fee.
pub const RBF_SEQUENCE_THRESHOLD: u32 = u32::MAX - 1;

/// Upper bound for `items_on_page` in paged queries.
pub const MAX_ITEMS_ON_PAGE: i64 = 1000;

/// Default page size for paged queries.
pub const DEFAULT_ITEMS_ON_PAGE: i64 = 1000;

/// Blocks whose Ethereum internal data failed are retried at most this many times.
pub const MAX_INTERNAL_DATA_RETRIES: u32 = 5;
