//! Keeps the in-memory [`Mempool`](blockdex_core::mempool::Mempool) in step
//! with the backend.
//!
//! A resync diffs the backend txid list against the pool. New transactions
//! are fetched by a bounded set of tasks; each resolves its input addresses
//! from the index first, then from pooled parents, then from the backend.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use blockdex_core::error::{BlockdexError, SyncError};
use blockdex_core::mempool::{AddrIndex, MempoolEntry, SharedMempool};
use blockdex_core::notify::Notifier;
use blockdex_core::traits::BackendClient;
use blockdex_core::types::{AddrDesc, Amount, ChainType, Tx};
use blockdex_db::{Indexer, IndexerConfig};

use crate::retry::Retry;

pub struct MempoolSync {
    ix: Arc<Indexer>,
    backend: Arc<dyn BackendClient>,
    mempool: SharedMempool,
    notifier: Notifier,
    retry: Retry,
    workers: usize,
    sub_workers: usize,
    query_backend: bool,
    tx_timeout: Duration,
}

impl MempoolSync {
    pub fn new(
        ix: Arc<Indexer>,
        backend: Arc<dyn BackendClient>,
        mempool: SharedMempool,
        notifier: Notifier,
        cfg: &IndexerConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            ix,
            backend,
            mempool,
            notifier,
            retry: Retry::new(1, cfg.rpc_timeout(), shutdown),
            workers: cfg.mempool_workers.max(1),
            sub_workers: cfg.mempool_sub_workers.max(1),
            query_backend: cfg.query_backend_on_mempool_resync,
            tx_timeout: cfg.mempool_tx_timeout(),
        }
    }

    pub fn mempool(&self) -> &SharedMempool {
        &self.mempool
    }

    /// Diff the pool against the backend mempool. Returns the number of
    /// added plus removed transactions.
    pub async fn resync(self: &Arc<Self>) -> Result<usize, BlockdexError> {
        let state = self.ix.state();
        state.started_mempool_sync();
        let backend = &self.backend;
        let remote: HashSet<String> = self
            .retry
            .once(move || backend.get_mempool_transactions())
            .await?
            .into_iter()
            .collect();

        let (removed, fresh) = {
            let mut pool = self.mempool.lock();
            let local = pool.txids();
            let stale: Vec<&String> = local.difference(&remote).collect();
            let removed = pool.remove_transactions(stale.into_iter().map(String::as_str));
            let fresh: Vec<String> = remote
                .iter()
                .filter(|t| pool.get(t).is_none_or(|e| !e.is_resolved() && self.query_backend))
                .cloned()
                .collect();
            (removed, fresh)
        };

        let now = Utc::now().timestamp();
        let mut added = 0;
        if self.query_backend {
            let limit = Arc::new(Semaphore::new(self.workers));
            let mut tasks = JoinSet::new();
            for txid in fresh {
                self.retry.check_interrupted()?;
                let permit = limit.clone().acquire_owned().await.map_err(|_| SyncError::ChannelClosed)?;
                let this = Arc::clone(self);
                tasks.spawn(async move {
                    let _permit = permit;
                    let r = this.add_transaction_at(&txid, now).await;
                    (txid, r)
                });
            }
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok((_, Ok(true))) => added += 1,
                    Ok((_, Ok(false))) => {}
                    Ok((txid, Err(e))) => debug!(%txid, error = %e, "mempool tx not added"),
                    Err(e) => warn!(error = %e, "mempool fetch task failed"),
                }
            }
        } else {
            let mut pool = self.mempool.lock();
            for txid in fresh {
                if !pool.contains(&txid) {
                    pool.insert(MempoolEntry::unresolved(txid, now));
                    added += 1;
                }
            }
        }

        let size = self.mempool.lock().len();
        state.finished_mempool_sync(size);
        info!(size, added, removed, "mempool synchronized");
        Ok(added + removed)
    }

    /// Fetch and pool one transaction announced by the backend. Returns
    /// whether the pool changed.
    pub async fn add_transaction(self: &Arc<Self>, txid: &str) -> Result<bool, BlockdexError> {
        self.add_transaction_at(txid, Utc::now().timestamp()).await
    }

    async fn add_transaction_at(self: &Arc<Self>, txid: &str, first_seen: i64) -> Result<bool, BlockdexError> {
        if self.mempool.lock().get(txid).is_some_and(MempoolEntry::is_resolved) {
            return Ok(false);
        }
        let backend = &self.backend;
        let tx = match self.retry.once(move || backend.get_transaction_for_mempool(txid)).await {
            Ok(tx) => tx,
            Err(e) if e.is_not_found() => {
                self.mempool.lock().remove(txid);
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };
        if tx.confirmations > 0 || self.ix.get_tx_addresses(txid)?.is_some() {
            debug!(%txid, "tx already confirmed, not pooled");
            return Ok(false);
        }
        let entry = self.build_entry(tx, first_seen).await?;
        let mut touched: Vec<AddrDesc> = Vec::new();
        for ai in &entry.addr_indexes {
            if !touched.contains(&ai.addr_desc) {
                touched.push(ai.addr_desc.clone());
            }
        }
        let replaced = self.mempool.lock().insert(entry);
        if !replaced.is_empty() {
            debug!(%txid, replaced = ?replaced, "mempool tx replaced others");
        }
        for ad in &touched {
            self.notifier.notify_new_tx_addr(ad, txid);
        }
        self.notifier.notify_new_tx(txid);
        Ok(true)
    }

    async fn build_entry(self: &Arc<Self>, tx: Tx, first_seen: i64) -> Result<MempoolEntry, BlockdexError> {
        let (addr_indexes, sender) = match self.ix.chain_type() {
            ChainType::Bitcoin => (self.utxo_addr_indexes(&tx).await?, None),
            ChainType::Ethereum => self.account_addr_indexes(&tx),
        };
        let filter = self.tx_filter(&tx.txid, &addr_indexes);
        Ok(MempoolEntry { txid: tx.txid.clone(), first_seen, addr_indexes, tx: Some(tx), sender, filter })
    }

    /// Golomb filter over a pooled tx's input and output descriptors, keyed by its txid.
    fn tx_filter(&self, txid: &str, addr_indexes: &[AddrIndex]) -> Option<String> {
        let params = self.ix.block_filter_params()?;
        let mut gcs = params.builder();
        for ai in addr_indexes {
            gcs.add_addr_desc(&ai.addr_desc);
        }
        match gcs.compute_hex(txid) {
            Ok(filter) => filter,
            Err(e) => {
                warn!(%txid, error = %e, "cannot build mempool tx filter");
                None
            }
        }
    }

    async fn utxo_addr_indexes(self: &Arc<Self>, tx: &Tx) -> Result<Vec<AddrIndex>, BlockdexError> {
        let parser = self.ix.parser();
        let mut out = Vec::with_capacity(tx.vin.len() + tx.vout.len());
        for (i, vout) in tx.vout.iter().enumerate() {
            match parser.get_addr_desc_from_vout(vout) {
                Ok(ad) if !ad.is_empty() => out.push(AddrIndex { addr_desc: ad, index: i as i32, value: vout.value_sat }),
                Ok(_) => {}
                Err(e) => debug!(txid = %tx.txid, vout = i, error = %e, "output without address"),
            }
        }

        let limit = Arc::new(Semaphore::new(self.sub_workers));
        let mut tasks = JoinSet::new();
        for (i, vin) in tx.vin.iter().enumerate() {
            if vin.is_coinbase() || vin.txid.is_empty() {
                continue;
            }
            let permit = limit.clone().acquire_owned().await.map_err(|_| SyncError::ChannelClosed)?;
            let this = Arc::clone(self);
            let (prev, vout) = (vin.txid.clone(), vin.vout);
            tasks.spawn(async move {
                let _permit = permit;
                (i, this.resolve_input(&prev, vout).await)
            });
        }
        let mut inputs = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((i, Ok(Some((ad, value))))) => inputs.push(AddrIndex { addr_desc: ad, index: !(i as i32), value }),
                Ok((i, Ok(None))) => debug!(txid = %tx.txid, input = i, "input address unresolved"),
                Ok((i, Err(e))) => debug!(txid = %tx.txid, input = i, error = %e, "input lookup failed"),
                Err(e) => warn!(error = %e, "input lookup task failed"),
            }
        }
        // Inputs in input order, after the outputs.
        inputs.sort_by_key(|ai| !ai.index);
        out.extend(inputs);
        Ok(out)
    }

    /// Address and value of output `vout` of `prev`.
    async fn resolve_input(&self, prev: &str, vout: u32) -> Result<Option<(AddrDesc, Amount)>, BlockdexError> {
        if let Some(ta) = self.ix.get_tx_addresses(prev)? {
            return Ok(ta.outputs.get(vout as usize).map(|o| (o.addr_desc.clone(), o.value)));
        }
        let pooled = self
            .mempool
            .lock()
            .get(prev)
            .and_then(|e| e.tx.as_ref())
            .and_then(|t| t.vout.get(vout as usize).cloned());
        let out = match pooled {
            Some(o) => o,
            None => {
                let backend = &self.backend;
                match self.retry.once(move || backend.get_transaction(prev)).await {
                    Ok(t) => match t.vout.get(vout as usize) {
                        Some(o) => o.clone(),
                        None => return Ok(None),
                    },
                    Err(e) if e.is_not_found() => return Ok(None),
                    Err(e) => return Err(e.into()),
                }
            }
        };
        Ok(self.ix.parser().get_addr_desc_from_vout(&out).ok().map(|ad| (ad, out.value_sat)))
    }

    /// Native sender and recipient, then token transfer parties numbered
    /// from 1 in transfer order.
    fn account_addr_indexes(&self, tx: &Tx) -> (Vec<AddrIndex>, Option<AddrDesc>) {
        let parser = self.ix.parser();
        let desc = |a: &str| parser.get_addr_desc_from_address(a).ok().filter(|ad| !ad.is_empty());
        let value = tx.vout.first().map(|v| v.value_sat).unwrap_or(0);
        let from = tx.vin.first().and_then(|v| v.addresses.first()).and_then(|a| desc(a.as_str()));
        let to = tx.vout.first().and_then(|v| v.addresses.first()).and_then(|a| desc(a.as_str()));
        let mut out = Vec::new();
        if let Some(ad) = &to {
            out.push(AddrIndex { addr_desc: ad.clone(), index: 0, value });
        }
        if let Some(ad) = &from {
            out.push(AddrIndex { addr_desc: ad.clone(), index: !0, value });
        }
        if let Some(eth) = &tx.eth {
            for (i, t) in eth.token_transfers.iter().enumerate() {
                let n = i as i32 + 1;
                if let Some(ad) = desc(t.to.as_str()) {
                    out.push(AddrIndex { addr_desc: ad, index: n, value: 0 });
                }
                if let Some(ad) = desc(t.from.as_str()) {
                    out.push(AddrIndex { addr_desc: ad, index: !n, value: 0 });
                }
            }
        }
        (out, from)
    }

    /// Drop entries older than the configured timeout. Returns how many went.
    pub fn evict_stale(&self) -> usize {
        let cutoff = Utc::now().timestamp() - self.tx_timeout.as_secs() as i64;
        let evicted = self.mempool.lock().evict_older_than(cutoff);
        if !evicted.is_empty() {
            info!(count = evicted.len(), "evicted stale mempool txs");
        }
        evicted.len()
    }
}
