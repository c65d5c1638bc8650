//! The indexer: owns the key schema and assembles one atomic write batch per
//! connected or disconnected block.
//!
//! Script-model chains maintain `txAddresses`, `addressBalance` (with the UTXO
//! set) and rollback rows in `block_txs`. Account-model chains maintain
//! `addressContracts` instead; see [`crate::index_eth`]. Both share the
//! `height` and `addresses` columns.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use blockdex_core::error::{BlockdexError, DbError};
use blockdex_core::golomb::FilterParams;
use blockdex_core::internal_state::InternalState;
use blockdex_core::traits::Parser;
use blockdex_core::types::{AddrDesc, Block, BlockInfo, ChainType, ContractInfo, Tx};

use crate::schema::{
    add_tx_index, pack_address_key, pack_block_info, pack_block_txs, pack_height_key,
    pack_tx_indexes, unpack_address_key, unpack_block_info, unpack_block_txs, unpack_tx_indexes,
    AddrBalance, AddrContracts, BalanceDetail, BlockTx, SpentOutpoint, TxAddresses, TxIndexes,
    TxInput, TxOutput, Utxo, MAX_ADDR_DESC_LEN,
};
use crate::store::{Column, IterFrom, RocksStore, StoreBatch};

/// Returned by address history callbacks to continue or end the iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterControl {
    Continue,
    Stop,
}

/// Per-block address rows: AD → txs of the block touching it.
pub(crate) type AddressRows = BTreeMap<AddrDesc, Vec<TxIndexes>>;

/// Balances and tx records read or produced while connecting blocks.
#[derive(Default)]
pub(crate) struct UtxoCache {
    /// AD → (balance, height of last touch).
    pub balances: HashMap<AddrDesc, (AddrBalance, u32)>,
    pub tx_addresses: HashMap<Vec<u8>, TxAddresses>,
}

/// Output of processing one script-model block.
pub(crate) struct UtxoBlockChanges {
    pub addresses: AddressRows,
    pub block_txs: Vec<BlockTx>,
}

/// Approximate row and byte deltas per column, applied to the column stats
/// after a batch commits.
#[derive(Default)]
pub(crate) struct ColumnDeltas([(i64, i64, i64); Column::ALL.len()]);

impl ColumnDeltas {
    pub fn add(&mut self, col: Column, key_len: usize, value_len: usize) {
        let d = &mut self.0[col.index()];
        d.0 += 1;
        d.1 += key_len as i64;
        d.2 += value_len as i64;
    }

    pub fn remove(&mut self, col: Column, key_len: usize, value_len: usize) {
        let d = &mut self.0[col.index()];
        d.0 -= 1;
        d.1 -= key_len as i64;
        d.2 -= value_len as i64;
    }

    pub fn apply(&self, state: &InternalState) {
        for (i, (rows, kb, vb)) in self.0.iter().enumerate() {
            if *rows != 0 || *kb != 0 || *vb != 0 {
                state.add_db_column_stats(i, *rows, *kb, *vb);
            }
        }
    }
}

/// Indexer over a [`RocksStore`].
///
/// Reads may run concurrently; block connects and disconnects are serialised
/// by an internal lock.
pub struct Indexer {
    pub(crate) store: RocksStore,
    pub(crate) parser: Arc<dyn Parser>,
    pub(crate) state: Arc<InternalState>,
    pub(crate) chain: ChainType,
    pub(crate) txid_len: usize,
    pub(crate) write_lock: Mutex<()>,
    pub(crate) stop: AtomicBool,
    pub(crate) filter: Option<FilterParams>,
}

impl Indexer {
    /// Open the index at `path` for `coin`.
    ///
    /// Fails if the database belongs to another coin, has a different schema
    /// version, or was left inconsistent by an interrupted bulk import.
    pub fn open(
        path: impl AsRef<Path>,
        parser: Arc<dyn Parser>,
        coin: &str,
        coin_shortcut: &str,
    ) -> Result<Self, BlockdexError> {
        let store = RocksStore::open(path)?;
        let state = Arc::new(crate::state::load_internal_state(&store, coin, coin_shortcut)?);
        let chain = parser.chain_type();
        let txid_len = parser.packed_txid_len();
        let indexer = Self {
            store,
            parser,
            state,
            chain,
            txid_len,
            write_lock: Mutex::new(()),
            stop: AtomicBool::new(false),
            filter: None,
        };
        let best = indexer.get_best_block()?;
        if let Some((height, _)) = &best {
            indexer.state.update_best_height(*height);
        }
        indexer.load_block_times()?;
        indexer.state.set_db_state(blockdex_core::internal_state::DbState::Open);
        indexer.store_internal_state()?;
        info!(coin, best_height = best.as_ref().map(|b| b.0), "index opened");
        Ok(indexer)
    }

    /// Build a Golomb filter of every block's addresses on connect.
    pub fn with_block_filters(mut self, params: Option<FilterParams>) -> Self {
        if self.chain == ChainType::Bitcoin {
            self.filter = params;
        }
        self
    }

    pub fn block_filter_params(&self) -> Option<FilterParams> {
        self.filter
    }

    pub fn parser(&self) -> &Arc<dyn Parser> {
        &self.parser
    }

    pub fn state(&self) -> &Arc<InternalState> {
        &self.state
    }

    pub fn store(&self) -> &RocksStore {
        &self.store
    }

    pub fn chain_type(&self) -> ChainType {
        self.chain
    }

    // --- Block metadata ---

    /// Height and hash of the last connected block, `None` for an empty index.
    pub fn get_best_block(&self) -> Result<Option<(u32, String)>, BlockdexError> {
        let Some((k, v)) = self.store.last(Column::Height)? else {
            return Ok(None);
        };
        let height = blockdex_core::pack::unpack_u32_be(&k)?;
        let info = unpack_block_info(&v, height)?;
        Ok(Some((height, info.hash)))
    }

    pub fn get_block_hash(&self, height: u32) -> Result<Option<String>, BlockdexError> {
        Ok(self.get_block_info(height)?.map(|i| i.hash))
    }

    pub fn get_block_info(&self, height: u32) -> Result<Option<BlockInfo>, BlockdexError> {
        match self.store.get(Column::Height, &pack_height_key(height))? {
            Some(v) => Ok(Some(unpack_block_info(&v, height)?)),
            None => Ok(None),
        }
    }

    /// Packed txids of the block at `height`, from its rollback row.
    /// Golomb filter of the block at `height`, if filters are on and the block had addresses.
    pub fn get_block_filter(&self, height: u32) -> Result<Option<Vec<u8>>, BlockdexError> {
        self.store.get(Column::BlockFilters, &pack_height_key(height))
    }

    pub fn get_block_txids(&self, height: u32) -> Result<Vec<String>, BlockdexError> {
        let Some(v) = self.store.get(Column::BlockTxs, &pack_height_key(height))? else {
            return Err(DbError::MissingRollbackData(height).into());
        };
        let btxids: Vec<Vec<u8>> = match self.chain {
            ChainType::Bitcoin => unpack_block_txs(&v, self.txid_len)?.into_iter().map(|t| t.btxid).collect(),
            ChainType::Ethereum => crate::schema::unpack_eth_block_txs(&v, self.txid_len)?
                .into_iter()
                .map(|t| t.btxid)
                .collect(),
        };
        btxids
            .iter()
            .map(|b| self.parser.unpack_txid(b).map_err(Into::into))
            .collect()
    }

    // --- Per-tx and per-address records ---

    pub fn get_tx_addresses(&self, txid: &str) -> Result<Option<TxAddresses>, BlockdexError> {
        let btxid = self.parser.pack_txid(txid)?;
        self.get_tx_addresses_packed(&btxid)
    }

    pub(crate) fn get_tx_addresses_packed(&self, btxid: &[u8]) -> Result<Option<TxAddresses>, BlockdexError> {
        match self.store.get(Column::TxAddresses, btxid)? {
            Some(v) => Ok(Some(TxAddresses::unpack(&v)?)),
            None => Ok(None),
        }
    }

    pub fn get_addr_desc_balance(
        &self,
        ad: &AddrDesc,
        detail: BalanceDetail,
    ) -> Result<Option<AddrBalance>, BlockdexError> {
        match self.store.get(Column::AddressBalance, ad.as_bytes())? {
            Some(v) => Ok(Some(AddrBalance::unpack(&v, self.txid_len, detail)?)),
            None => Ok(None),
        }
    }

    pub fn get_address_contracts(&self, ad: &AddrDesc) -> Result<Option<AddrContracts>, BlockdexError> {
        match self.store.get(Column::AddressContracts, ad.as_bytes())? {
            Some(v) => Ok(Some(AddrContracts::unpack(&v)?)),
            None => Ok(None),
        }
    }

    /// Call `f(txid, height, indexes)` for every tx touching `ad` in heights
    /// `lower..=higher`, ascending by height, until `f` returns
    /// [`IterControl::Stop`].
    pub fn get_addr_desc_transactions<F>(
        &self,
        ad: &AddrDesc,
        lower: u32,
        higher: u32,
        mut f: F,
    ) -> Result<(), BlockdexError>
    where
        F: FnMut(&str, u32, &[i32]) -> Result<IterControl, BlockdexError>,
    {
        let start = pack_address_key(ad.as_bytes(), lower);
        let stop = pack_address_key(ad.as_bytes(), higher);
        for item in self.store.iter(Column::Addresses, IterFrom::Forward(&start))? {
            let (key, value) = item?;
            if *key > *stop {
                break;
            }
            if key.len() != ad.len() + 4 {
                continue;
            }
            let (_, height) = unpack_address_key(&key)?;
            for group in unpack_tx_indexes(&value, self.txid_len)? {
                let txid = self.parser.unpack_txid(&group.btxid)?;
                if f(&txid, height, &group.indexes)? == IterControl::Stop {
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    /// Same as [`get_addr_desc_transactions`](Self::get_addr_desc_transactions)
    /// for a user supplied address.
    pub fn get_transactions<F>(&self, address: &str, lower: u32, higher: u32, f: F) -> Result<(), BlockdexError>
    where
        F: FnMut(&str, u32, &[i32]) -> Result<IterControl, BlockdexError>,
    {
        let ad = self.parser.get_addr_desc_from_address(address)?;
        self.get_addr_desc_transactions(&ad, lower, higher, f)
    }

    // --- Transaction cache ---

    /// Store a confirmed transaction in the `transactions` column.
    pub fn put_tx(&self, tx: &Tx, height: u32, block_time: i64) -> Result<(), BlockdexError> {
        let btxid = self.parser.pack_txid(&tx.txid)?;
        let packed = self.parser.pack_tx(tx, height, block_time)?;
        self.store.put(Column::Transactions, &btxid, &packed)
    }

    /// Cached transaction and its height.
    pub fn get_tx(&self, txid: &str) -> Result<Option<(Tx, u32)>, BlockdexError> {
        let btxid = self.parser.pack_txid(txid)?;
        match self.store.get(Column::Transactions, &btxid)? {
            Some(v) => Ok(Some(self.parser.unpack_tx(&v)?)),
            None => Ok(None),
        }
    }

    pub fn delete_tx(&self, txid: &str) -> Result<(), BlockdexError> {
        let btxid = self.parser.pack_txid(txid)?;
        self.store.delete(Column::Transactions, &btxid)
    }

    // --- Connect ---

    pub fn connect_block(&self, block: &Block) -> Result<(), BlockdexError> {
        self.connect_block_with_contracts(block, &[])
    }

    /// Connect `block` on top of the current best block. `contracts` carries
    /// metadata of token contracts first seen in the block; it is written in
    /// the same batch.
    pub fn connect_block_with_contracts(
        &self,
        block: &Block,
        contracts: &[ContractInfo],
    ) -> Result<(), BlockdexError> {
        let _guard = self.write_lock.lock();
        let height = block.header.height;
        self.check_next_height(height)?;

        let mut batch = self.store.batch();
        let mut deltas = ColumnDeltas::default();
        match self.chain {
            ChainType::Bitcoin => {
                let mut cache = UtxoCache::default();
                let changes = self.process_utxo_block(block, &mut cache)?;
                self.write_block_rows(&mut batch, &mut deltas, block, &changes.addresses, pack_block_txs(&changes.block_txs))?;
                self.write_utxo_cache(&mut batch, &mut deltas, cache.balances.into_iter().map(|(k, (v, _))| (k, v)), cache.tx_addresses)?;
            }
            ChainType::Ethereum => {
                self.connect_eth_block(&mut batch, &mut deltas, block, contracts)?;
            }
        }
        self.store.write(batch)?;
        deltas.apply(&self.state);
        self.state.set_block_time(height, block.header.time.max(0) as u32);
        self.state.update_best_height(height);
        debug!(height, hash = %block.header.hash, txs = block.txs.len(), "connected block");
        Ok(())
    }

    fn check_next_height(&self, height: u32) -> Result<(), BlockdexError> {
        if let Some((best, _)) = self.get_best_block()? {
            if height != best + 1 {
                return Err(DbError::HeightMismatch { expected: best + 1, got: height }.into());
            }
        }
        Ok(())
    }

    /// Height, rollback and address rows of one block.
    pub(crate) fn write_block_rows(
        &self,
        batch: &mut StoreBatch<'_>,
        deltas: &mut ColumnDeltas,
        block: &Block,
        addresses: &AddressRows,
        block_txs: Vec<u8>,
    ) -> Result<(), BlockdexError> {
        let height = block.header.height;
        let key = pack_height_key(height);
        let info = pack_block_info(&BlockInfo {
            hash: block.header.hash.clone(),
            time: block.header.time,
            txs: block.txs.len() as u32,
            size: block.header.size,
            height,
        })?;
        batch.put(Column::Height, &key, &info)?;
        deltas.add(Column::Height, key.len(), info.len());
        batch.put(Column::BlockTxs, &key, &block_txs)?;
        deltas.add(Column::BlockTxs, key.len(), block_txs.len());
        for (ad, groups) in addresses {
            let k = pack_address_key(ad.as_bytes(), height);
            let v = pack_tx_indexes(groups);
            batch.put(Column::Addresses, &k, &v)?;
            deltas.add(Column::Addresses, k.len(), v.len());
        }
        if let Some(filter) = self.block_filter(&block.header.hash, addresses)? {
            batch.put(Column::BlockFilters, &key, &filter)?;
            deltas.add(Column::BlockFilters, key.len(), filter.len());
        }
        Ok(())
    }

    /// Filter over the descriptors a block touched, keyed by its hash.
    pub(crate) fn block_filter(&self, hash: &str, addresses: &AddressRows) -> Result<Option<Vec<u8>>, BlockdexError> {
        let Some(params) = self.filter else { return Ok(None) };
        let mut gcs = params.builder();
        for ad in addresses.keys() {
            gcs.add_addr_desc(ad);
        }
        Ok(gcs.compute(hash)?)
    }

    /// Write balances and tx records; balances with no txs left are deleted.
    pub(crate) fn write_utxo_cache(
        &self,
        batch: &mut StoreBatch<'_>,
        deltas: &mut ColumnDeltas,
        balances: impl IntoIterator<Item = (AddrDesc, AddrBalance)>,
        tx_addresses: HashMap<Vec<u8>, TxAddresses>,
    ) -> Result<(), BlockdexError> {
        for (ad, ab) in balances {
            if ab.txs == 0 {
                batch.delete(Column::AddressBalance, ad.as_bytes())?;
            } else {
                batch.put(Column::AddressBalance, ad.as_bytes(), &ab.pack(self.txid_len))?;
            }
        }
        for (btxid, ta) in tx_addresses {
            let v = ta.pack();
            batch.put(Column::TxAddresses, &btxid, &v)?;
            deltas.add(Column::TxAddresses, btxid.len(), v.len());
        }
        Ok(())
    }

    /// Balance of `ad` from the cache, loading it from the store on first use.
    pub(crate) fn cached_balance<'c>(
        &self,
        cache: &'c mut UtxoCache,
        ad: &AddrDesc,
        height: u32,
    ) -> Result<&'c mut AddrBalance, BlockdexError> {
        if !cache.balances.contains_key(ad) {
            let ab = self.get_addr_desc_balance(ad, BalanceDetail::Utxo)?.unwrap_or_default();
            cache.balances.insert(ad.clone(), (ab, height));
        }
        let entry = cache
            .balances
            .get_mut(ad)
            .ok_or_else(|| BlockdexError::Storage("balance cache entry vanished".into()))?;
        entry.1 = height;
        Ok(&mut entry.0)
    }

    pub(crate) fn cached_tx_addresses<'c>(
        &self,
        cache: &'c mut HashMap<Vec<u8>, TxAddresses>,
        btxid: &[u8],
    ) -> Result<Option<&'c mut TxAddresses>, BlockdexError> {
        if !cache.contains_key(btxid) {
            match self.get_tx_addresses_packed(btxid)? {
                Some(ta) => {
                    cache.insert(btxid.to_vec(), ta);
                }
                None => return Ok(None),
            }
        }
        Ok(cache.get_mut(btxid))
    }

    /// Address descriptor of an output; undecodable outputs get an empty one.
    pub(crate) fn output_addr_desc(&self, tx: &Tx, vout: &blockdex_core::types::Vout) -> AddrDesc {
        match self.parser.get_addr_desc_from_vout(vout) {
            Ok(ad) if ad.len() > MAX_ADDR_DESC_LEN => {
                debug!(txid = %tx.txid, vout = vout.n, len = ad.len(), "address descriptor too long, skipped");
                AddrDesc::default()
            }
            Ok(ad) => ad,
            Err(e) => {
                debug!(txid = %tx.txid, vout = vout.n, error = %e, "cannot get address descriptor");
                AddrDesc::default()
            }
        }
    }

    /// Apply a script-model block to `cache`, returning its address rows and
    /// rollback data.
    pub(crate) fn process_utxo_block(
        &self,
        block: &Block,
        cache: &mut UtxoCache,
    ) -> Result<UtxoBlockChanges, BlockdexError> {
        let height = block.header.height;
        let mut addresses = AddressRows::new();
        let mut block_txs = Vec::with_capacity(block.txs.len());

        for tx in &block.txs {
            let btxid = self.parser.pack_txid(&tx.txid)?;
            let mut ta = TxAddresses {
                height,
                inputs: Vec::with_capacity(tx.vin.len()),
                outputs: Vec::with_capacity(tx.vout.len()),
            };

            for (i, vout) in tx.vout.iter().enumerate() {
                let ad = self.output_addr_desc(tx, vout);
                ta.outputs.push(TxOutput { addr_desc: ad.clone(), spent: false, value: vout.value_sat });
                if ad.is_empty() {
                    continue;
                }
                let counted = add_tx_index(addresses.entry(ad.clone()).or_default(), &btxid, i as i32);
                let ab = self.cached_balance(cache, &ad, height)?;
                if !counted {
                    ab.txs += 1;
                }
                ab.balance = ab.balance.saturating_add(vout.value_sat);
                ab.add_utxo(Utxo { btxid: btxid.clone(), vout: i as u32, height, value: vout.value_sat });
            }

            let mut spent = Vec::with_capacity(tx.vin.len());
            for (i, vin) in tx.vin.iter().enumerate() {
                if vin.is_coinbase() || vin.txid.is_empty() {
                    ta.inputs.push(TxInput::default());
                    spent.push(None);
                    continue;
                }
                let prev = match self.parser.pack_txid(&vin.txid) {
                    Ok(p) => p,
                    Err(e) => {
                        debug!(txid = %tx.txid, input = i, error = %e, "cannot pack input txid");
                        ta.inputs.push(TxInput::default());
                        spent.push(None);
                        continue;
                    }
                };
                let Some(prev_ta) = self.cached_tx_addresses(&mut cache.tx_addresses, &prev)? else {
                    warn!(height, txid = %tx.txid, input = i, prev = %vin.txid, "input tx not found in txAddresses");
                    ta.inputs.push(TxInput::default());
                    spent.push(None);
                    continue;
                };
                let Some(out) = prev_ta.outputs.get_mut(vin.vout as usize) else {
                    warn!(height, txid = %tx.txid, input = i, prev = %vin.txid, vout = vin.vout, "input vout out of bounds");
                    ta.inputs.push(TxInput::default());
                    spent.push(None);
                    continue;
                };
                ta.inputs.push(TxInput { addr_desc: out.addr_desc.clone(), value: out.value });
                if out.spent {
                    warn!(height, txid = %tx.txid, input = i, prev = %vin.txid, vout = vin.vout, "double spend");
                    spent.push(None);
                    continue;
                }
                out.spent = true;
                let (ad, value) = (out.addr_desc.clone(), out.value);
                spent.push(Some(SpentOutpoint { btxid: prev.clone(), vout: vin.vout }));
                if ad.is_empty() {
                    continue;
                }
                let counted = add_tx_index(addresses.entry(ad.clone()).or_default(), &btxid, !(i as i32));
                let ab = self.cached_balance(cache, &ad, height)?;
                if !counted {
                    ab.txs += 1;
                }
                if ab.balance < value {
                    warn!(height, address = %ad, balance = %ab.balance, value = %value, "balance would go negative, reset to 0");
                    ab.balance = 0;
                } else {
                    ab.balance -= value;
                }
                ab.sent = ab.sent.saturating_add(value);
                if ab.remove_utxo(&prev, vin.vout).is_none() {
                    warn!(height, address = %ad, prev = %vin.txid, vout = vin.vout, "spent utxo not found in balance");
                }
            }

            cache.tx_addresses.insert(btxid.clone(), ta);
            block_txs.push(BlockTx { btxid, inputs: spent });
        }
        Ok(UtxoBlockChanges { addresses, block_txs })
    }

    // --- Disconnect ---

    /// Disconnect blocks `higher` down to `lower`, one batch per block.
    /// `higher` must be the current best height.
    pub fn disconnect_block_range(&self, lower: u32, higher: u32) -> Result<(), BlockdexError> {
        let _guard = self.write_lock.lock();
        let best = self.get_best_block()?.map(|b| b.0);
        if best != Some(higher) || lower > higher {
            return Err(DbError::HeightMismatch { expected: best.unwrap_or(0), got: higher }.into());
        }
        info!(lower, higher, "disconnecting blocks");
        for height in (lower..=higher).rev() {
            match self.chain {
                ChainType::Bitcoin => self.disconnect_utxo_block(height)?,
                ChainType::Ethereum => self.disconnect_eth_block(height)?,
            }
            self.state.remove_last_block_times(1);
            self.state.update_best_height(height.saturating_sub(1));
        }
        self.store_internal_state()?;
        Ok(())
    }

    fn disconnect_utxo_block(&self, height: u32) -> Result<(), BlockdexError> {
        let key = pack_height_key(height);
        let info_raw = self.store.get(Column::Height, &key)?.ok_or(DbError::MissingBlock(height))?;
        let raw = self.store.get(Column::BlockTxs, &key)?.ok_or(DbError::MissingRollbackData(height))?;
        let block_txs = unpack_block_txs(&raw, self.txid_len)?;

        let mut balances: HashMap<AddrDesc, AddrBalance> = HashMap::new();
        let mut tx_addresses: HashMap<Vec<u8>, TxAddresses> = HashMap::new();
        let mut deleted: HashSet<Vec<u8>> = HashSet::new();
        let mut touched: HashSet<AddrDesc> = HashSet::new();
        let mut batch = self.store.batch();
        let mut deltas = ColumnDeltas::default();

        for btx in block_txs.iter().rev() {
            let Some(ta) = self.cached_tx_addresses(&mut tx_addresses, &btx.btxid)?.cloned() else {
                warn!(height, txid = %hex::encode(&btx.btxid), "tx of disconnected block not found in txAddresses");
                continue;
            };
            let mut seen: HashSet<AddrDesc> = HashSet::new();

            for (i, input) in btx.inputs.iter().enumerate().rev() {
                let Some(op) = input else { continue };
                let Some(tin) = ta.inputs.get(i) else {
                    warn!(height, input = i, "rollback input out of bounds");
                    continue;
                };
                let prev_height = match self.cached_tx_addresses(&mut tx_addresses, &op.btxid)? {
                    Some(prev) => {
                        if let Some(out) = prev.outputs.get_mut(op.vout as usize) {
                            out.spent = false;
                        }
                        prev.height
                    }
                    None => {
                        warn!(height, prev = %hex::encode(&op.btxid), "spent tx not found in txAddresses");
                        continue;
                    }
                };
                if tin.addr_desc.is_empty() {
                    continue;
                }
                touched.insert(tin.addr_desc.clone());
                let ab = self.disconnect_balance(&mut balances, &tin.addr_desc)?;
                if seen.insert(tin.addr_desc.clone()) {
                    ab.txs = ab.txs.saturating_sub(1);
                }
                ab.sent = ab.sent.saturating_sub(tin.value);
                ab.balance = ab.balance.saturating_add(tin.value);
                ab.add_utxo(Utxo { btxid: op.btxid.clone(), vout: op.vout, height: prev_height, value: tin.value });
            }

            for (i, out) in ta.outputs.iter().enumerate().rev() {
                if out.addr_desc.is_empty() {
                    continue;
                }
                touched.insert(out.addr_desc.clone());
                let ab = self.disconnect_balance(&mut balances, &out.addr_desc)?;
                if seen.insert(out.addr_desc.clone()) {
                    ab.txs = ab.txs.saturating_sub(1);
                }
                if ab.balance < out.value {
                    warn!(height, address = %out.addr_desc, "balance would go negative on disconnect, reset to 0");
                    ab.balance = 0;
                } else {
                    ab.balance -= out.value;
                }
                if ab.remove_utxo(&btx.btxid, i as u32).is_none() {
                    warn!(height, address = %out.addr_desc, vout = i, "utxo not found on disconnect");
                }
            }

            tx_addresses.remove(&btx.btxid);
            deleted.insert(btx.btxid.clone());
            batch.delete(Column::TxAddresses, &btx.btxid)?;
            deltas.remove(Column::TxAddresses, btx.btxid.len(), 0);
            batch.delete(Column::Transactions, &btx.btxid)?;
        }

        for ad in &touched {
            let k = pack_address_key(ad.as_bytes(), height);
            batch.delete(Column::Addresses, &k)?;
            deltas.remove(Column::Addresses, k.len(), 0);
        }
        for (ad, ab) in balances {
            if ab.txs == 0 {
                batch.delete(Column::AddressBalance, ad.as_bytes())?;
            } else {
                batch.put(Column::AddressBalance, ad.as_bytes(), &ab.pack(self.txid_len))?;
            }
        }
        for (btxid, ta) in tx_addresses {
            if !deleted.contains(&btxid) {
                batch.put(Column::TxAddresses, &btxid, &ta.pack())?;
            }
        }
        batch.delete(Column::Height, &key)?;
        deltas.remove(Column::Height, key.len(), info_raw.len());
        batch.delete(Column::BlockTxs, &key)?;
        deltas.remove(Column::BlockTxs, key.len(), raw.len());
        if let Some(filter) = self.store.get(Column::BlockFilters, &key)? {
            batch.delete(Column::BlockFilters, &key)?;
            deltas.remove(Column::BlockFilters, key.len(), filter.len());
        }

        self.store.write(batch)?;
        deltas.apply(&self.state);
        debug!(height, txs = block_txs.len(), "disconnected block");
        Ok(())
    }

    fn disconnect_balance<'c>(
        &self,
        balances: &'c mut HashMap<AddrDesc, AddrBalance>,
        ad: &AddrDesc,
    ) -> Result<&'c mut AddrBalance, BlockdexError> {
        if !balances.contains_key(ad) {
            let ab = match self.get_addr_desc_balance(ad, BalanceDetail::Utxo)? {
                Some(ab) => ab,
                None => {
                    warn!(address = %ad, "balance not found on disconnect");
                    AddrBalance::default()
                }
            };
            balances.insert(ad.clone(), ab);
        }
        balances
            .get_mut(ad)
            .ok_or_else(|| BlockdexError::Storage("balance cache entry vanished".into()))
    }

    // --- Block times ---

    /// Rebuild the height → time index from the `height` column.
    pub(crate) fn load_block_times(&self) -> Result<(), BlockdexError> {
        let mut times = Vec::new();
        for item in self.store.iter(Column::Height, IterFrom::Start)? {
            let (k, v) = item?;
            let height = blockdex_core::pack::unpack_u32_be(&k)?;
            let info = unpack_block_info(&v, height)?;
            let t = info.time.max(0) as u32;
            if height as usize >= times.len() {
                times.resize(height as usize + 1, t);
            }
            times[height as usize] = t;
        }
        self.state.set_block_times(times);
        Ok(())
    }
}
