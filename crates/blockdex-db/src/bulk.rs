//! Cached block connect for the initial import.
//!
//! Balances and tx records stay in memory across blocks so hot addresses are
//! read and written once per flush instead of once per block. Block rows are
//! buffered and written with the cache at every checkpoint.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info};

use blockdex_core::error::{BlockdexError, DbError};
use blockdex_core::types::{AddrDesc, Block, BlockInfo, ChainType};

use crate::index::{ColumnDeltas, Indexer, UtxoCache};
use crate::schema::{pack_address_key, pack_block_info, pack_block_txs, pack_height_key, pack_tx_indexes};
use crate::store::Column;

/// Cached balances above this count trigger a partial flush.
const MAX_BULK_BALANCES: usize = 80_000;
/// Cached tx records above this count trigger a partial flush.
const MAX_BULK_TX_ADDRESSES: usize = 500_000;

/// Rows of one connected block waiting for the next checkpoint.
struct PendingBlock {
    height: u32,
    rows: Vec<(Column, Vec<u8>, Vec<u8>)>,
}

pub struct BulkConnect {
    ix: Arc<Indexer>,
    cache: UtxoCache,
    pending: Vec<PendingBlock>,
    next_height: Option<u32>,
    chunk: u32,
    keep: u32,
}

impl BulkConnect {
    /// Start a bulk import on top of the current best block. `chunk` is the
    /// checkpoint interval in blocks and `keep` the idle age in blocks after
    /// which cached balances may be flushed.
    pub fn new(ix: Arc<Indexer>, chunk: u32, keep: u32) -> Result<Self, BlockdexError> {
        let next_height = ix.get_best_block()?.map(|(h, _)| h + 1);
        ix.start_bulk_state()?;
        info!(next_height, chunk, keep, "bulk connect started");
        Ok(Self {
            ix,
            cache: UtxoCache::default(),
            pending: Vec::new(),
            next_height,
            chunk: chunk.max(1),
            keep,
        })
    }

    pub fn connect_block(&mut self, block: &Block) -> Result<(), BlockdexError> {
        let height = block.header.height;
        if let Some(next) = self.next_height {
            if height != next {
                return Err(DbError::HeightMismatch { expected: next, got: height }.into());
            }
        }
        if self.ix.chain_type() == ChainType::Ethereum {
            // Account-model records are small; connect directly.
            self.flush()?;
            self.ix.connect_block(block)?;
            self.next_height = Some(height + 1);
            return Ok(());
        }

        let changes = {
            let _guard = self.ix.write_lock.lock();
            self.ix.process_utxo_block(block, &mut self.cache)?
        };
        let key = pack_height_key(height).to_vec();
        let info = pack_block_info(&BlockInfo {
            hash: block.header.hash.clone(),
            time: block.header.time,
            txs: block.txs.len() as u32,
            size: block.header.size,
            height,
        })?;
        let mut rows = Vec::with_capacity(changes.addresses.len() + 3);
        rows.push((Column::Height, key.clone(), info));
        rows.push((Column::BlockTxs, key, pack_block_txs(&changes.block_txs)));
        for (ad, groups) in &changes.addresses {
            rows.push((Column::Addresses, pack_address_key(ad.as_bytes(), height), pack_tx_indexes(groups)));
        }
        if let Some(filter) = self.ix.block_filter(&block.header.hash, &changes.addresses)? {
            rows.push((Column::BlockFilters, pack_height_key(height).to_vec(), filter));
        }
        self.pending.push(PendingBlock { height, rows });
        self.ix.state.set_block_time(height, block.header.time.max(0) as u32);
        self.next_height = Some(height + 1);

        if self.pending.len() as u32 >= self.chunk {
            self.flush()?;
        } else {
            if self.cache.tx_addresses.len() > MAX_BULK_TX_ADDRESSES {
                self.flush_tx_addresses()?;
            }
            if self.cache.balances.len() > MAX_BULK_BALANCES {
                self.flush_idle_balances(height)?;
            }
        }
        Ok(())
    }

    /// Write tx records whose outputs are all spent; if still over the bound,
    /// write all of them.
    fn flush_tx_addresses(&mut self) -> Result<(), BlockdexError> {
        let spent: Vec<Vec<u8>> = self
            .cache
            .tx_addresses
            .iter()
            .filter(|(_, ta)| ta.all_outputs_spent())
            .map(|(k, _)| k.clone())
            .collect();
        let mut out = HashMap::with_capacity(spent.len());
        for k in spent {
            if let Some(ta) = self.cache.tx_addresses.remove(&k) {
                out.insert(k, ta);
            }
        }
        if self.cache.tx_addresses.len() > MAX_BULK_TX_ADDRESSES {
            out.extend(self.cache.tx_addresses.drain());
        }
        debug!(count = out.len(), "bulk flush of tx addresses");
        self.write_cache(Vec::new(), out)
    }

    /// Write balances not touched within the last `keep` blocks.
    fn flush_idle_balances(&mut self, height: u32) -> Result<(), BlockdexError> {
        let limit = height.saturating_sub(self.keep);
        let idle: Vec<AddrDesc> = self
            .cache
            .balances
            .iter()
            .filter(|(_, (_, touched))| *touched < limit)
            .map(|(k, _)| k.clone())
            .collect();
        let balances: Vec<_> = idle
            .into_iter()
            .filter_map(|ad| self.cache.balances.remove(&ad).map(|(ab, _)| (ad, ab)))
            .collect();
        debug!(count = balances.len(), "bulk flush of idle balances");
        self.write_cache(balances, HashMap::new())
    }

    fn write_cache(
        &self,
        balances: Vec<(AddrDesc, crate::schema::AddrBalance)>,
        tx_addresses: HashMap<Vec<u8>, crate::schema::TxAddresses>,
    ) -> Result<(), BlockdexError> {
        let mut batch = self.ix.store.batch();
        let mut deltas = ColumnDeltas::default();
        self.ix.write_utxo_cache(&mut batch, &mut deltas, balances, tx_addresses)?;
        self.ix.store.write(batch)?;
        deltas.apply(&self.ix.state);
        Ok(())
    }

    /// Checkpoint: write every buffered block row and the whole cache in one batch.
    pub fn flush(&mut self) -> Result<(), BlockdexError> {
        if self.pending.is_empty() && self.cache.balances.is_empty() && self.cache.tx_addresses.is_empty() {
            return Ok(());
        }
        let _guard = self.ix.write_lock.lock();
        let mut batch = self.ix.store.batch();
        let mut deltas = ColumnDeltas::default();
        let last = self.pending.last().map(|p| p.height);
        for block in self.pending.drain(..) {
            for (col, k, v) in block.rows {
                batch.put(col, &k, &v)?;
                deltas.add(col, k.len(), v.len());
            }
        }
        let balances: Vec<_> = self.cache.balances.drain().map(|(k, (v, _))| (k, v)).collect();
        let tx_addresses = std::mem::take(&mut self.cache.tx_addresses);
        self.ix.write_utxo_cache(&mut batch, &mut deltas, balances, tx_addresses)?;
        self.ix.store.write(batch)?;
        deltas.apply(&self.ix.state);
        if let Some(h) = last {
            self.ix.state.update_best_height(h);
            info!(height = h, "bulk connect checkpoint");
        }
        Ok(())
    }

    /// Final checkpoint; marks the database consistent again.
    pub fn close(mut self) -> Result<(), BlockdexError> {
        self.flush()?;
        self.ix.finish_bulk_state()?;
        info!("bulk connect finished");
        Ok(())
    }
}
