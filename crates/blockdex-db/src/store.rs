//! RocksDB-backed ordered key-value store.
//!
//! One database with a column family per key space (see [`Column`]). All
//! block-level mutations go through a [`StoreBatch`] so that every connect or
//! disconnect commits atomically across column families.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use rocksdb::{
    BlockBasedOptions, ColumnFamily, ColumnFamilyDescriptor, Direction, IteratorMode, Options,
    WriteBatch, DB,
};
use tracing::info;

use blockdex_core::error::BlockdexError;

/// Key spaces of the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Column {
    Height,
    BlockTxs,
    Addresses,
    TxAddresses,
    AddressBalance,
    AddressContracts,
    InternalData,
    FiatRates,
    Contracts,
    FourByte,
    Transactions,
    BlockInternalDataErrors,
    BlockFilters,
    InternalState,
}

impl Column {
    pub const ALL: [Column; 14] = [
        Column::Height,
        Column::BlockTxs,
        Column::Addresses,
        Column::TxAddresses,
        Column::AddressBalance,
        Column::AddressContracts,
        Column::InternalData,
        Column::FiatRates,
        Column::Contracts,
        Column::FourByte,
        Column::Transactions,
        Column::BlockInternalDataErrors,
        Column::BlockFilters,
        Column::InternalState,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Column::Height => "height",
            Column::BlockTxs => "block_txs",
            Column::Addresses => "addresses",
            Column::TxAddresses => "txAddresses",
            Column::AddressBalance => "addressBalance",
            Column::AddressContracts => "addressContracts",
            Column::InternalData => "internalData",
            Column::FiatRates => "fiatRates",
            Column::Contracts => "contracts",
            Column::FourByte => "fourByte",
            Column::Transactions => "transactions",
            Column::BlockInternalDataErrors => "blockInternalDataErrors",
            Column::BlockFilters => "blockFilters",
            Column::InternalState => "internalState",
        }
    }

    /// Position in [`Column::ALL`]; also the index of the column's stats row.
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn names() -> Vec<&'static str> {
        Self::ALL.iter().map(|c| c.name()).collect()
    }

    /// Point-lookup columns get a bloom filter.
    fn point_lookups(self) -> bool {
        matches!(
            self,
            Column::TxAddresses | Column::AddressBalance | Column::AddressContracts | Column::Transactions
        )
    }
}

/// Where an iteration starts.
#[derive(Debug, Clone, Copy)]
pub enum IterFrom<'k> {
    Start,
    End,
    Forward(&'k [u8]),
    Reverse(&'k [u8]),
}

pub type KvPair = (Box<[u8]>, Box<[u8]>);

/// RocksDB database holding all index column families.
pub struct RocksStore {
    db: DB,
    path: PathBuf,
}

impl RocksStore {
    /// Open or create the database at `path`, creating missing column families.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, BlockdexError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.increase_parallelism(4);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = Column::ALL
            .iter()
            .map(|col| {
                let mut opts = Options::default();
                if col.point_lookups() {
                    let mut bbo = BlockBasedOptions::default();
                    bbo.set_bloom_filter(10.0, false);
                    opts.set_block_based_table_factory(&bbo);
                }
                ColumnFamilyDescriptor::new(col.name(), opts)
            })
            .collect();

        let db = DB::open_cf_descriptors(&db_opts, path.as_ref(), cf_descriptors)
            .map_err(|e| BlockdexError::Storage(e.to_string()))?;
        info!(path = %path.as_ref().display(), "opened index database");
        Ok(Self { db, path: path.as_ref().to_path_buf() })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, col: Column, key: &[u8]) -> Result<Option<Vec<u8>>, BlockdexError> {
        let cf = self.cf_handle(col)?;
        self.db.get_cf(cf, key).map_err(|e| BlockdexError::Storage(e.to_string()))
    }

    /// Single-key write outside of a block batch.
    pub fn put(&self, col: Column, key: &[u8], value: &[u8]) -> Result<(), BlockdexError> {
        let cf = self.cf_handle(col)?;
        self.db.put_cf(cf, key, value).map_err(|e| BlockdexError::Storage(e.to_string()))
    }

    pub fn delete(&self, col: Column, key: &[u8]) -> Result<(), BlockdexError> {
        let cf = self.cf_handle(col)?;
        self.db.delete_cf(cf, key).map_err(|e| BlockdexError::Storage(e.to_string()))
    }

    pub fn batch(&self) -> StoreBatch<'_> {
        StoreBatch { store: self, wb: WriteBatch::default(), ops: 0 }
    }

    /// Commit a batch atomically.
    pub fn write(&self, batch: StoreBatch<'_>) -> Result<(), BlockdexError> {
        self.db.write(batch.wb).map_err(|e| BlockdexError::Storage(e.to_string()))
    }

    /// Iterate a column from the given position.
    pub fn iter<'a>(
        &'a self,
        col: Column,
        from: IterFrom<'_>,
    ) -> Result<impl Iterator<Item = Result<KvPair, BlockdexError>> + use<'a>, BlockdexError> {
        let cf = self.cf_handle(col)?;
        let mode = match from {
            IterFrom::Start => IteratorMode::Start,
            IterFrom::End => IteratorMode::End,
            IterFrom::Forward(k) => IteratorMode::From(k, Direction::Forward),
            IterFrom::Reverse(k) => IteratorMode::From(k, Direction::Reverse),
        };
        Ok(self
            .db
            .iterator_cf(cf, mode)
            .map(|item| item.map_err(|e| BlockdexError::Storage(e.to_string()))))
    }

    /// Last key/value of a column, if any.
    pub fn last(&self, col: Column) -> Result<Option<KvPair>, BlockdexError> {
        self.iter(col, IterFrom::End)?.next().transpose()
    }

    /// Consistent read view across all columns.
    pub fn snapshot(&self) -> StoreSnapshot<'_> {
        StoreSnapshot { store: self, snap: self.db.snapshot() }
    }

    /// Count rows and key/value bytes of a column. Returns `None` if `stop`
    /// was raised mid-scan.
    pub fn compute_column_size(
        &self,
        col: Column,
        stop: &AtomicBool,
    ) -> Result<Option<(i64, i64, i64)>, BlockdexError> {
        let (mut rows, mut key_bytes, mut value_bytes) = (0i64, 0i64, 0i64);
        for item in self.iter(col, IterFrom::Start)? {
            let (k, v) = item?;
            rows += 1;
            key_bytes += k.len() as i64;
            value_bytes += v.len() as i64;
            if rows % 100_000 == 0 && stop.load(Ordering::Relaxed) {
                return Ok(None);
            }
        }
        Ok(Some((rows, key_bytes, value_bytes)))
    }

    /// Full contents of a column; intended for diagnostics and tests.
    pub fn column_contents(&self, col: Column) -> Result<Vec<(Vec<u8>, Vec<u8>)>, BlockdexError> {
        self.iter(col, IterFrom::Start)?
            .map(|r| r.map(|(k, v)| (k.to_vec(), v.to_vec())))
            .collect()
    }

    /// Contents of every column except internal state; used to compare whole-store states.
    pub fn dump_index(&self) -> Result<BTreeMap<&'static str, Vec<(Vec<u8>, Vec<u8>)>>, BlockdexError> {
        let mut out = BTreeMap::new();
        for col in Column::ALL {
            if col != Column::InternalState {
                out.insert(col.name(), self.column_contents(col)?);
            }
        }
        Ok(out)
    }

    // --- Internal helpers ---

    fn cf_handle(&self, col: Column) -> Result<&ColumnFamily, BlockdexError> {
        self.db
            .cf_handle(col.name())
            .ok_or_else(|| BlockdexError::Storage(format!("missing column family: {}", col.name())))
    }
}

/// Write batch spanning all column families.
pub struct StoreBatch<'a> {
    store: &'a RocksStore,
    wb: WriteBatch,
    ops: usize,
}

impl StoreBatch<'_> {
    pub fn put(&mut self, col: Column, key: &[u8], value: &[u8]) -> Result<(), BlockdexError> {
        let cf = self.store.cf_handle(col)?;
        self.wb.put_cf(cf, key, value);
        self.ops += 1;
        Ok(())
    }

    pub fn delete(&mut self, col: Column, key: &[u8]) -> Result<(), BlockdexError> {
        let cf = self.store.cf_handle(col)?;
        self.wb.delete_cf(cf, key);
        self.ops += 1;
        Ok(())
    }

    /// Number of queued operations.
    pub fn len(&self) -> usize {
        self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.ops == 0
    }
}

/// Point-in-time read view.
pub struct StoreSnapshot<'a> {
    store: &'a RocksStore,
    snap: rocksdb::Snapshot<'a>,
}

impl StoreSnapshot<'_> {
    pub fn get(&self, col: Column, key: &[u8]) -> Result<Option<Vec<u8>>, BlockdexError> {
        let cf = self.store.cf_handle(col)?;
        self.snap.get_cf(cf, key).map_err(|e| BlockdexError::Storage(e.to_string()))
    }

    pub fn column_contents(&self, col: Column) -> Result<Vec<(Vec<u8>, Vec<u8>)>, BlockdexError> {
        let cf = self.store.cf_handle(col)?;
        self.snap
            .iterator_cf(cf, IteratorMode::Start)
            .map(|r| {
                r.map(|(k, v)| (k.to_vec(), v.to_vec()))
                    .map_err(|e| BlockdexError::Storage(e.to_string()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn temp_store() -> (RocksStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksStore::open(dir.path().join("db")).unwrap();
        (store, dir)
    }

    // ------------------------------------------------------------------
    // Tests
    // ------------------------------------------------------------------

    #[test]
    fn column_index_matches_position() {
        for (i, col) in Column::ALL.iter().enumerate() {
            assert_eq!(col.index(), i);
        }
        assert_eq!(Column::names().len(), Column::ALL.len());
    }

    #[test]
    fn put_get_delete() {
        let (store, _dir) = temp_store();
        store.put(Column::Height, b"k", b"v").unwrap();
        assert_eq!(store.get(Column::Height, b"k").unwrap(), Some(b"v".to_vec()));
        assert_eq!(store.get(Column::BlockTxs, b"k").unwrap(), None);
        store.delete(Column::Height, b"k").unwrap();
        assert_eq!(store.get(Column::Height, b"k").unwrap(), None);
    }

    #[test]
    fn batch_commits_across_columns() {
        let (store, _dir) = temp_store();
        let mut b = store.batch();
        b.put(Column::Height, &[0, 0, 0, 1], b"a").unwrap();
        b.put(Column::Addresses, b"x", b"b").unwrap();
        assert_eq!(b.len(), 2);
        assert_eq!(store.get(Column::Height, &[0, 0, 0, 1]).unwrap(), None);
        store.write(b).unwrap();
        assert!(store.get(Column::Height, &[0, 0, 0, 1]).unwrap().is_some());
        assert!(store.get(Column::Addresses, b"x").unwrap().is_some());
    }

    #[test]
    fn dropped_batch_writes_nothing() {
        let (store, _dir) = temp_store();
        {
            let mut b = store.batch();
            b.put(Column::Height, b"k", b"v").unwrap();
        }
        assert_eq!(store.get(Column::Height, b"k").unwrap(), None);
    }

    #[test]
    fn iteration_is_bytewise_ordered() {
        let (store, _dir) = temp_store();
        for h in [3u32, 1, 256, 2] {
            store.put(Column::Height, &h.to_be_bytes(), b"").unwrap();
        }
        let keys: Vec<u32> = store
            .iter(Column::Height, IterFrom::Start)
            .unwrap()
            .map(|r| u32::from_be_bytes(r.unwrap().0[..4].try_into().unwrap()))
            .collect();
        assert_eq!(keys, vec![1, 2, 3, 256]);
        let (last, _) = store.last(Column::Height).unwrap().unwrap();
        assert_eq!(&*last, &256u32.to_be_bytes());
    }

    #[test]
    fn reverse_iteration_from_key() {
        let (store, _dir) = temp_store();
        for h in [1u32, 5, 9] {
            store.put(Column::Height, &h.to_be_bytes(), b"").unwrap();
        }
        let first = store
            .iter(Column::Height, IterFrom::Reverse(&6u32.to_be_bytes()))
            .unwrap()
            .next()
            .unwrap()
            .unwrap();
        assert_eq!(&*first.0, &5u32.to_be_bytes());
    }

    #[test]
    fn snapshot_is_isolated_from_later_writes() {
        let (store, _dir) = temp_store();
        store.put(Column::Contracts, b"a", b"1").unwrap();
        let snap = store.snapshot();
        store.put(Column::Contracts, b"a", b"2").unwrap();
        store.put(Column::Contracts, b"b", b"3").unwrap();
        assert_eq!(snap.get(Column::Contracts, b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(snap.column_contents(Column::Contracts).unwrap().len(), 1);
    }

    #[test]
    fn compute_column_size_counts_bytes() {
        let (store, _dir) = temp_store();
        store.put(Column::FiatRates, b"ab", b"cde").unwrap();
        store.put(Column::FiatRates, b"f", b"g").unwrap();
        let stop = AtomicBool::new(false);
        assert_eq!(store.compute_column_size(Column::FiatRates, &stop).unwrap(), Some((2, 3, 4)));
    }

    #[test]
    fn reopen_keeps_data() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = RocksStore::open(dir.path().join("db")).unwrap();
            store.put(Column::FourByte, b"k", b"v").unwrap();
        }
        let store = RocksStore::open(dir.path().join("db")).unwrap();
        assert_eq!(store.get(Column::FourByte, b"k").unwrap(), Some(b"v".to_vec()));
    }
}
