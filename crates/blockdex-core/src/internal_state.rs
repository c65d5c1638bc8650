//! Process-wide indexer status.
//!
//! Holds the sync and mempool flags, the best height, per-column statistics
//! and the height → block time index used to map timestamps to heights.
//! Counters read on hot paths are atomics; composite state sits behind a
//! mutex and is exposed as a [`StateSnapshot`].

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::constants::{AVG_BLOCK_PERIOD_WINDOW, NO_HEIGHT};
use crate::error::BlockdexError;
use crate::types::ChainInfo;

/// How far below a binary-search hit to look for an earlier block, since
/// block times are not strictly monotonic.
const BLOCK_TIME_SLACK: usize = 20;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DbState {
    #[default]
    Closed,
    Open,
    Inconsistent,
}

/// Statistics of one column family.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ColumnStats {
    pub name: String,
    pub version: u32,
    pub rows: i64,
    pub key_bytes: i64,
    pub value_bytes: i64,
    pub updated: DateTime<Utc>,
}

/// Persisted and reported part of the state.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshot {
    pub coin: String,
    pub coin_shortcut: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub network: String,
    pub db_state: DbState,
    pub initial_sync: bool,
    pub is_synchronized: bool,
    pub best_height: u32,
    pub last_sync: Option<DateTime<Utc>>,
    pub is_mempool_synchronized: bool,
    pub mempool_size: usize,
    pub last_mempool_sync: Option<DateTime<Utc>>,
    pub db_columns: Vec<ColumnStats>,
    pub last_store: Option<DateTime<Utc>>,
    #[serde(default)]
    pub historical_fiat_rates_time: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct BlockTimes {
    times: Vec<u32>,
    avg_period: u32,
}

impl BlockTimes {
    fn recompute_avg(&mut self) {
        let len = self.times.len();
        if len < AVG_BLOCK_PERIOD_WINDOW + 2 {
            return;
        }
        let last = len - 1;
        let first = last - AVG_BLOCK_PERIOD_WINDOW - 1;
        self.avg_period =
            self.times[last].saturating_sub(self.times[first]) / AVG_BLOCK_PERIOD_WINDOW as u32;
    }
}

pub struct InternalState {
    data: Mutex<StateSnapshot>,
    start_sync: Mutex<Option<DateTime<Utc>>>,
    block_times: Mutex<BlockTimes>,
    backend_info: Mutex<(Option<ChainInfo>, Option<String>)>,
    best_height: AtomicU32,
    is_synchronized: AtomicBool,
    is_mempool_synchronized: AtomicBool,
    in_shutdown: AtomicBool,
}

impl InternalState {
    pub fn new(coin: &str, coin_shortcut: &str) -> Self {
        Self::from_snapshot(StateSnapshot {
            coin: coin.to_string(),
            coin_shortcut: coin_shortcut.to_string(),
            ..Default::default()
        })
    }

    pub fn from_snapshot(s: StateSnapshot) -> Self {
        Self {
            best_height: AtomicU32::new(s.best_height),
            is_synchronized: AtomicBool::new(false),
            is_mempool_synchronized: AtomicBool::new(false),
            in_shutdown: AtomicBool::new(false),
            data: Mutex::new(StateSnapshot { is_synchronized: false, is_mempool_synchronized: false, ..s }),
            start_sync: Mutex::new(None),
            block_times: Mutex::new(BlockTimes::default()),
            backend_info: Mutex::new((None, None)),
        }
    }

    /// Current state with the atomic counters folded in.
    pub fn snapshot(&self) -> StateSnapshot {
        let mut s = self.data.lock().clone();
        s.best_height = self.best_height.load(Ordering::Acquire);
        s.is_synchronized = self.is_synchronized.load(Ordering::Acquire);
        s.is_mempool_synchronized = self.is_mempool_synchronized.load(Ordering::Acquire);
        s
    }

    pub fn coin(&self) -> String {
        self.data.lock().coin.clone()
    }

    /// Network name, defaulting to the coin shortcut.
    pub fn network(&self) -> String {
        let d = self.data.lock();
        if d.network.is_empty() { d.coin_shortcut.clone() } else { d.network.clone() }
    }

    pub fn set_network(&self, network: &str) {
        self.data.lock().network = network.to_string();
    }

    pub fn db_state(&self) -> DbState {
        self.data.lock().db_state
    }

    pub fn set_db_state(&self, state: DbState) {
        self.data.lock().db_state = state;
    }

    pub fn initial_sync(&self) -> bool {
        self.data.lock().initial_sync
    }

    pub fn set_initial_sync(&self, v: bool) {
        self.data.lock().initial_sync = v;
    }

    // --- Sync status ---

    pub fn started_sync(&self) {
        *self.start_sync.lock() = Some(Utc::now());
        self.is_synchronized.store(false, Ordering::Release);
    }

    pub fn finished_sync(&self, best_height: u32) {
        self.best_height.store(best_height, Ordering::Release);
        self.is_synchronized.store(true, Ordering::Release);
        self.data.lock().last_sync = Some(Utc::now());
    }

    pub fn update_best_height(&self, best_height: u32) {
        self.best_height.store(best_height, Ordering::Release);
        self.data.lock().last_sync = Some(Utc::now());
    }

    pub fn finished_sync_no_change(&self) {
        self.is_synchronized.store(true, Ordering::Release);
        self.data.lock().last_sync = Some(Utc::now());
    }

    /// Marks sync as lagging, e.g. after persistent backend failures.
    pub fn sync_failed(&self) {
        self.is_synchronized.store(false, Ordering::Release);
    }

    pub fn best_height(&self) -> u32 {
        self.best_height.load(Ordering::Acquire)
    }

    pub fn is_synchronized(&self) -> bool {
        self.is_synchronized.load(Ordering::Acquire)
    }

    pub fn sync_started_at(&self) -> Option<DateTime<Utc>> {
        *self.start_sync.lock()
    }

    pub fn started_mempool_sync(&self) {
        self.is_mempool_synchronized.store(false, Ordering::Release);
    }

    pub fn finished_mempool_sync(&self, mempool_size: usize) {
        let mut d = self.data.lock();
        d.mempool_size = mempool_size;
        d.last_mempool_sync = Some(Utc::now());
        self.is_mempool_synchronized.store(true, Ordering::Release);
    }

    pub fn is_mempool_synchronized(&self) -> bool {
        self.is_mempool_synchronized.load(Ordering::Acquire)
    }

    // --- Column statistics ---

    /// Make sure every named column has a stats row, keeping existing rows.
    pub fn ensure_columns(&self, names: &[&str], version: u32) {
        let mut d = self.data.lock();
        for name in names {
            if !d.db_columns.iter().any(|c| c.name == *name) {
                d.db_columns.push(ColumnStats {
                    name: name.to_string(),
                    version,
                    rows: 0,
                    key_bytes: 0,
                    value_bytes: 0,
                    updated: Utc::now(),
                });
            }
        }
    }

    pub fn add_db_column_stats(&self, column: usize, rows: i64, key_bytes: i64, value_bytes: i64) {
        let mut d = self.data.lock();
        if let Some(c) = d.db_columns.get_mut(column) {
            c.rows += rows;
            c.key_bytes += key_bytes;
            c.value_bytes += value_bytes;
            c.updated = Utc::now();
        }
    }

    pub fn set_db_column_stats(&self, column: usize, rows: i64, key_bytes: i64, value_bytes: i64) {
        let mut d = self.data.lock();
        if let Some(c) = d.db_columns.get_mut(column) {
            c.rows = rows;
            c.key_bytes = key_bytes;
            c.value_bytes = value_bytes;
            c.updated = Utc::now();
        }
    }

    pub fn column_stats(&self) -> Vec<ColumnStats> {
        self.data.lock().db_columns.clone()
    }

    pub fn db_size_total(&self) -> i64 {
        self.data.lock().db_columns.iter().map(|c| c.key_bytes + c.value_bytes).sum()
    }

    // --- Block times ---

    /// Replace the height → time index, returning the average block period.
    pub fn set_block_times(&self, times: Vec<u32>) -> u32 {
        let mut bt = self.block_times.lock();
        bt.times = times;
        bt.recompute_avg();
        info!(count = bt.times.len(), avg_block_period = bt.avg_period, "set block times");
        bt.avg_period
    }

    /// Record the time of `height`, filling any gap with the same time.
    pub fn set_block_time(&self, height: u32, time: u32) -> u32 {
        let mut bt = self.block_times.lock();
        let h = height as usize;
        if h >= bt.times.len() {
            bt.times.resize(h + 1, time);
        } else {
            bt.times[h] = time;
        }
        bt.recompute_avg();
        bt.avg_period
    }

    pub fn remove_last_block_times(&self, count: usize) {
        let mut bt = self.block_times.lock();
        let keep = bt.times.len().saturating_sub(count);
        bt.times.truncate(keep);
        bt.recompute_avg();
    }

    /// Time of the block at `height`, 0 if unknown.
    pub fn get_block_time(&self, height: u32) -> u32 {
        self.block_times.lock().times.get(height as usize).copied().unwrap_or(0)
    }

    pub fn get_last_block_time(&self) -> u32 {
        self.block_times.lock().times.last().copied().unwrap_or(0)
    }

    /// Height of the first block with time `>= time`, or [`NO_HEIGHT`].
    pub fn get_block_height_of_time(&self, time: u32) -> u32 {
        let bt = self.block_times.lock();
        let found = bt.times.partition_point(|t| *t < time);
        if found == bt.times.len() {
            return NO_HEIGHT;
        }
        let mut h = found.saturating_sub(BLOCK_TIME_SLACK);
        while h < found && bt.times[h] < time {
            h += 1;
        }
        h as u32
    }

    pub fn avg_block_period(&self) -> u32 {
        self.block_times.lock().avg_period
    }

    // --- Backend info ---

    pub fn set_backend_info(&self, info: ChainInfo) {
        *self.backend_info.lock() = (Some(info), None);
    }

    pub fn set_backend_error(&self, error: String) {
        self.backend_info.lock().1 = Some(error);
    }

    pub fn backend_info(&self) -> (Option<ChainInfo>, Option<String>) {
        self.backend_info.lock().clone()
    }

    pub fn set_historical_fiat_rates_time(&self, t: DateTime<Utc>) {
        self.data.lock().historical_fiat_rates_time = Some(t);
    }

    // --- Shutdown ---

    pub fn set_in_shutdown(&self) {
        self.in_shutdown.store(true, Ordering::Release);
    }

    pub fn is_in_shutdown(&self) -> bool {
        self.in_shutdown.load(Ordering::Acquire)
    }

    // --- Persistence ---

    pub fn pack(&self) -> Result<Vec<u8>, BlockdexError> {
        let mut s = self.snapshot();
        s.last_store = Some(Utc::now());
        self.data.lock().last_store = s.last_store;
        serde_json::to_vec(&s).map_err(|e| BlockdexError::Codec(e.to_string()))
    }

    pub fn unpack(buf: &[u8]) -> Result<Self, BlockdexError> {
        let s: StateSnapshot =
            serde_json::from_slice(buf).map_err(|e| BlockdexError::Codec(e.to_string()))?;
        Ok(Self::from_snapshot(s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_flags_follow_lifecycle() {
        let s = InternalState::new("Bitcoin", "BTC");
        assert!(!s.is_synchronized());
        s.started_sync();
        assert!(s.sync_started_at().is_some());
        s.finished_sync(42);
        assert!(s.is_synchronized());
        assert_eq!(s.best_height(), 42);
        s.sync_failed();
        assert!(!s.snapshot().is_synchronized);
    }

    #[test]
    fn mempool_sync_records_size() {
        let s = InternalState::new("Bitcoin", "BTC");
        s.started_mempool_sync();
        s.finished_mempool_sync(17);
        let snap = s.snapshot();
        assert!(snap.is_mempool_synchronized);
        assert_eq!(snap.mempool_size, 17);
        assert!(snap.last_mempool_sync.is_some());
    }

    #[test]
    fn network_defaults_to_shortcut() {
        let s = InternalState::new("Bitcoin Testnet", "TEST");
        assert_eq!(s.network(), "TEST");
        s.set_network("testnet3");
        assert_eq!(s.network(), "testnet3");
    }

    #[test]
    fn column_stats_add_and_total() {
        let s = InternalState::new("Bitcoin", "BTC");
        s.ensure_columns(&["height", "addresses"], 6);
        s.add_db_column_stats(0, 1, 4, 40);
        s.add_db_column_stats(1, 2, 10, 20);
        s.add_db_column_stats(1, -1, -5, -10);
        assert_eq!(s.db_size_total(), 4 + 40 + 5 + 10);
        s.set_db_column_stats(1, 0, 0, 0);
        assert_eq!(s.db_size_total(), 44);
        s.ensure_columns(&["height", "fiatRates"], 6);
        assert_eq!(s.column_stats().len(), 3);
    }

    #[test]
    fn set_block_time_extends_with_gap_fill() {
        let s = InternalState::new("Bitcoin", "BTC");
        s.set_block_time(0, 100);
        s.set_block_time(3, 400);
        assert_eq!(s.get_block_time(1), 400);
        assert_eq!(s.get_block_time(3), 400);
        assert_eq!(s.get_block_time(9), 0);
        assert_eq!(s.get_last_block_time(), 400);
        s.remove_last_block_times(2);
        assert_eq!(s.get_last_block_time(), 400);
        s.remove_last_block_times(10);
        assert_eq!(s.get_last_block_time(), 0);
    }

    #[test]
    fn block_height_of_time_finds_first_at_or_after() {
        let s = InternalState::new("Bitcoin", "BTC");
        s.set_block_times(vec![100, 200, 300, 400]);
        assert_eq!(s.get_block_height_of_time(50), 0);
        assert_eq!(s.get_block_height_of_time(200), 1);
        assert_eq!(s.get_block_height_of_time(201), 2);
        assert_eq!(s.get_block_height_of_time(400), 3);
        assert_eq!(s.get_block_height_of_time(401), NO_HEIGHT);
    }

    #[test]
    fn block_height_of_time_tolerates_unordered_times() {
        let s = InternalState::new("Bitcoin", "BTC");
        // height 2 is earlier than height 1
        s.set_block_times(vec![100, 300, 250, 400]);
        assert_eq!(s.get_block_height_of_time(260), 1);
    }

    #[test]
    fn avg_block_period_over_last_hundred_blocks() {
        let s = InternalState::new("Bitcoin", "BTC");
        let times: Vec<u32> = (0..150).map(|i| 1_000 + i * 600).collect();
        assert_eq!(s.set_block_times(times), 606);
        assert_eq!(s.avg_block_period(), 606);
    }

    #[test]
    fn pack_round_trips_persisted_fields() {
        let s = InternalState::new("Bitcoin", "BTC");
        s.set_db_state(DbState::Open);
        s.set_initial_sync(true);
        s.update_best_height(77);
        s.ensure_columns(&["height"], 6);
        let back = InternalState::unpack(&s.pack().unwrap()).unwrap();
        let snap = back.snapshot();
        assert_eq!(snap.coin, "Bitcoin");
        assert_eq!(snap.db_state, DbState::Open);
        assert!(snap.initial_sync);
        assert_eq!(snap.best_height, 77);
        assert_eq!(snap.db_columns.len(), 1);
        assert!(snap.last_store.is_some());
    }

    #[test]
    fn shutdown_flag() {
        let s = InternalState::new("Bitcoin", "BTC");
        assert!(!s.is_in_shutdown());
        s.set_in_shutdown();
        assert!(s.is_in_shutdown());
    }
}
