//! Block synchronization against a backend node.
//!
//! [`SyncWorker::resync_index`] brings the index up to the backend tip. When
//! far behind it fetches blocks with several striped fetchers that feed a
//! single writer in height order; near the tip it connects one block at a
//! time. A hash mismatch at the local best height starts fork resolution:
//! walk back to the last common block and disconnect everything above it.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use blockdex_core::constants::MAX_INTERNAL_DATA_RETRIES;
use blockdex_core::error::{BackendError, BlockdexError, DbError, SyncError};
use blockdex_core::mempool::SharedMempool;
use blockdex_core::notify::Notifier;
use blockdex_core::traits::BackendClient;
use blockdex_core::types::{AddrDesc, Block, BlockId, ChainType, ContractInfo};
use blockdex_db::{BulkConnect, Indexer, IndexerConfig};

use crate::retry::Retry;

/// Blocks each fetcher may have queued ahead of the writer.
const FETCH_QUEUE_DEPTH: usize = 4;

/// Progress is logged every this many blocks during parallel sync.
const PROGRESS_LOG_INTERVAL: u32 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Idle,
    ParallelSyncing,
    TipFollowing,
    Resolving,
    Interrupted,
}

/// Result of a successful [`SyncWorker::resync_index`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Synced {
    /// Whether any block was connected or disconnected.
    pub changed: bool,
}

/// A fetched block plus metadata of token contracts it introduces.
#[derive(Debug)]
pub struct FetchedBlock {
    pub block: Block,
    pub contracts: Vec<ContractInfo>,
}

/// How tip following ended.
enum TipOutcome {
    /// The backend has no block at the next height.
    ReachedTip,
    /// The next block does not build on the local best block.
    Fork,
}

/// Fetches blocks and their new contracts. Cloned into each fetcher task.
#[derive(Clone)]
struct Fetcher {
    ix: Arc<Indexer>,
    backend: Arc<dyn BackendClient>,
    retry: Retry,
    /// Decode raw blocks locally instead of taking the backend's JSON.
    parse: bool,
}

impl Fetcher {
    async fn fetch_block(&self, height: u32) -> Result<FetchedBlock, BlockdexError> {
        let block = if self.parse {
            self.fetch_raw_block(height).await?
        } else {
            let backend = &self.backend;
            let id = &BlockId::Height(height);
            self.retry.call("get_block", move || backend.get_block(id)).await?
        };
        if block.header.height != height {
            return Err(SyncError::UnrecoverableBlock {
                height,
                reason: format!("backend returned block at height {}", block.header.height),
            }
            .into());
        }
        let contracts = match self.ix.chain_type() {
            ChainType::Ethereum => self.new_contracts(&block).await?,
            ChainType::Bitcoin => Vec::new(),
        };
        Ok(FetchedBlock { block, contracts })
    }

    async fn fetch_raw_block(&self, height: u32) -> Result<Block, BlockdexError> {
        let backend = &self.backend;
        let hash = self.retry.call("get_block_hash", move || backend.get_block_hash(height)).await?;
        let h = hash.as_str();
        let raw = self.retry.call("get_block_raw", move || backend.get_block_raw(h)).await?;
        let bytes = hex::decode(raw.trim())
            .map_err(|e| SyncError::UnrecoverableBlock { height, reason: format!("raw block is not hex: {e}") })?;
        let mut block = self.ix.parser().parse_block(&bytes)?;
        if block.header.hash != hash {
            return Err(SyncError::UnrecoverableBlock {
                height,
                reason: format!("decoded hash {} differs from {hash}", block.header.hash),
            }
            .into());
        }
        block.header.height = height;
        for tx in &mut block.txs {
            tx.block_height = height;
        }
        Ok(block)
    }

    /// Metadata of token contracts referenced by `block` and not yet stored.
    async fn new_contracts(&self, block: &Block) -> Result<Vec<ContractInfo>, BlockdexError> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        let transfers = block.txs.iter().filter_map(|tx| tx.eth.as_ref()).flat_map(|eth| eth.token_transfers.iter());
        for t in transfers {
            if !seen.insert(t.contract.clone()) {
                continue;
            }
            let ad: AddrDesc = match self.ix.parser().get_addr_desc_from_address(&t.contract) {
                Ok(ad) => ad,
                Err(e) => {
                    debug!(contract = %t.contract, error = %e, "skipping contract with invalid address");
                    continue;
                }
            };
            if self.ix.get_contract_info(&ad)?.is_some() {
                continue;
            }
            let backend = &self.backend;
            let ad = &ad;
            match self.retry.call("get_contract_info", move || backend.get_contract_info(ad)).await {
                Ok(Some(info)) => out.push(info),
                Ok(None) => {}
                Err(BlockdexError::Backend(BackendError::Unsupported(_))) => return Ok(out),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    /// Fetch `start, start + step, ...` up to `to` and queue them in order.
    /// Stops after the first error or when the writer goes away.
    async fn run_stripe(
        self,
        start: u32,
        to: u32,
        step: u32,
        tx: mpsc::Sender<Result<FetchedBlock, BlockdexError>>,
    ) {
        let mut height = start;
        while height <= to {
            let r = self.fetch_block(height).await;
            let failed = r.is_err();
            if tx.send(r).await.is_err() || failed {
                return;
            }
            match height.checked_add(step) {
                Some(h) => height = h,
                None => return,
            }
        }
    }
}

pub struct SyncWorker {
    ix: Arc<Indexer>,
    fetcher: Fetcher,
    mempool: SharedMempool,
    notifier: Notifier,
    workers: usize,
    chunk: u32,
    bulk_connect: bool,
    block_addresses_to_keep: u32,
    phase: Mutex<SyncPhase>,
}

impl SyncWorker {
    pub fn new(
        ix: Arc<Indexer>,
        backend: Arc<dyn BackendClient>,
        mempool: SharedMempool,
        notifier: Notifier,
        cfg: &IndexerConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let retry = Retry::new(cfg.sync_retry_attempts, cfg.rpc_timeout(), shutdown);
        Self {
            fetcher: Fetcher {
                parse: cfg.parse && ix.chain_type() == ChainType::Bitcoin,
                ix: ix.clone(),
                backend,
                retry,
            },
            ix,
            mempool,
            notifier,
            workers: cfg.sync_workers.max(1),
            chunk: cfg.sync_chunk.max(1),
            bulk_connect: cfg.bulk_connect,
            block_addresses_to_keep: cfg.block_addresses_to_keep,
            phase: Mutex::new(SyncPhase::Idle),
        }
    }

    pub fn phase(&self) -> SyncPhase {
        *self.phase.lock()
    }

    pub fn indexer(&self) -> &Arc<Indexer> {
        &self.ix
    }

    fn set_phase(&self, phase: SyncPhase) {
        let mut p = self.phase.lock();
        if *p != phase {
            debug!(from = ?*p, to = ?phase, "sync phase");
            *p = phase;
        }
    }

    fn backend(&self) -> &Arc<dyn BackendClient> {
        &self.fetcher.backend
    }

    fn retry(&self) -> &Retry {
        &self.fetcher.retry
    }

    /// Bring the index to the backend tip, resolving forks on the way.
    ///
    /// `initial` allows cached bulk connect during a parallel catch-up.
    /// An interrupt returns [`SyncError::OperationInterrupted`] after the
    /// block being written is committed.
    pub async fn resync_index(&self, initial: bool) -> Result<Synced, BlockdexError> {
        let state = self.ix.state();
        state.started_sync();
        let r = self.resync_loop(initial).await;
        match &r {
            Ok(Synced { changed: true }) => {
                let best = self.ix.get_best_block()?;
                state.finished_sync(best.map(|b| b.0).unwrap_or(0));
                self.set_phase(SyncPhase::Idle);
            }
            Ok(Synced { changed: false }) => {
                state.finished_sync_no_change();
                self.set_phase(SyncPhase::Idle);
            }
            Err(e) if e.is_interrupted() => {
                info!("sync interrupted");
                state.sync_failed();
                self.set_phase(SyncPhase::Interrupted);
            }
            Err(e) => {
                error!(error = %e, "sync failed");
                state.sync_failed();
                self.set_phase(SyncPhase::Idle);
            }
        }
        r
    }

    async fn resync_loop(&self, initial: bool) -> Result<Synced, BlockdexError> {
        let mut changed = false;
        loop {
            self.retry().check_interrupted()?;
            let backend = self.backend();
            let remote_hash = self.retry().call("get_best_block_hash", move || backend.get_best_block_hash()).await?;
            let local = self.ix.get_best_block()?;
            let from = match &local {
                Some((_, hash)) if *hash == remote_hash => return Ok(Synced { changed }),
                None => 0,
                Some((height, hash)) => {
                    let height = *height;
                    match self.retry().call("get_block_hash", move || backend.get_block_hash(height)).await {
                        Ok(h) if h == *hash => height + 1,
                        Ok(_) => {
                            self.handle_fork(height).await?;
                            changed = true;
                            continue;
                        }
                        Err(e) if e.is_not_found() => {
                            self.handle_fork(height).await?;
                            changed = true;
                            continue;
                        }
                        Err(e) => return Err(e),
                    }
                }
            };
            let remote_height = self.retry().call("get_best_block_height", move || backend.get_best_block_height()).await?;
            if from > remote_height {
                // The backend moved between the two calls; try again.
                continue;
            }
            if self.workers > 1 && from.saturating_add(self.chunk) < remote_height {
                self.set_phase(SyncPhase::ParallelSyncing);
                self.connect_blocks_parallel(from, remote_height, initial).await?;
                changed = true;
                continue;
            }
            self.set_phase(SyncPhase::TipFollowing);
            let prev = local.map(|(_, hash)| hash);
            let (outcome, connected) = self.connect_blocks(from, prev).await?;
            changed |= connected > 0;
            match outcome {
                TipOutcome::Fork => {
                    let best = self.ix.get_best_block()?.map(|b| b.0).ok_or(DbError::MissingBlock(from))?;
                    self.handle_fork(best).await?;
                    changed = true;
                }
                TipOutcome::ReachedTip if connected == 0 => return Ok(Synced { changed }),
                TipOutcome::ReachedTip => {}
            }
        }
    }

    /// Connect blocks one by one from `from` until the backend has no more.
    /// Returns how tip following ended and the number of connected blocks.
    async fn connect_blocks(
        &self,
        from: u32,
        mut prev_hash: Option<String>,
    ) -> Result<(TipOutcome, u32), BlockdexError> {
        let mut height = from;
        let mut connected = 0;
        loop {
            self.retry().check_interrupted()?;
            let fetched = match self.fetcher.fetch_block(height).await {
                Ok(f) => f,
                Err(e) if e.is_not_found() => return Ok((TipOutcome::ReachedTip, connected)),
                Err(e) => return Err(e),
            };
            if let Some(prev) = &prev_hash {
                if fetched.block.header.prev != *prev {
                    info!(height, prev = %fetched.block.header.prev, local = %prev, "block does not extend local chain");
                    return Ok((TipOutcome::Fork, connected));
                }
            }
            self.connect(&fetched)?;
            info!(height, hash = %fetched.block.header.hash, txs = fetched.block.txs.len(), "connected block");
            prev_hash = Some(fetched.block.header.hash);
            connected += 1;
            height += 1;
        }
    }

    fn connect(&self, fetched: &FetchedBlock) -> Result<(), BlockdexError> {
        self.ix.connect_block_with_contracts(&fetched.block, &fetched.contracts)?;
        self.after_connect(&fetched.block);
        Ok(())
    }

    fn after_connect(&self, block: &Block) {
        let removed = self.mempool.lock().remove_transactions(block.txs.iter().map(|t| t.txid.as_str()));
        if removed > 0 {
            debug!(height = block.header.height, removed, "confirmed txs removed from mempool");
        }
        self.notifier.notify_new_block(block.header.height, &block.header.hash);
    }

    /// Fetch `[from, to]` with striped fetchers and connect in height order.
    async fn connect_blocks_parallel(&self, from: u32, to: u32, initial: bool) -> Result<(), BlockdexError> {
        let workers = self.workers.min((to - from) as usize + 1).max(1);
        info!(from, to, workers, "parallel sync started");
        let mut receivers = Vec::with_capacity(workers);
        for w in 0..workers {
            let (tx, rx) = mpsc::channel(FETCH_QUEUE_DEPTH);
            receivers.push(rx);
            let fetcher = self.fetcher.clone();
            tokio::spawn(fetcher.run_stripe(from + w as u32, to, workers as u32, tx));
        }

        let use_bulk = initial && self.bulk_connect && self.ix.chain_type() == ChainType::Bitcoin;
        let mut bulk = if use_bulk {
            Some(BulkConnect::new(self.ix.clone(), self.chunk, self.block_addresses_to_keep)?)
        } else {
            None
        };
        let mut prev_hash = self.ix.get_best_block()?.map(|b| b.1);
        let mut result = Ok(());
        for height in from..=to {
            if self.retry().is_interrupted() {
                result = Err(SyncError::OperationInterrupted.into());
                break;
            }
            let rx = &mut receivers[(height - from) as usize % workers];
            let fetched = match rx.recv().await {
                Some(Ok(f)) => f,
                Some(Err(e)) => {
                    result = Err(e);
                    break;
                }
                None => {
                    result = Err(SyncError::ChannelClosed.into());
                    break;
                }
            };
            if fetched.block.header.height != height {
                error!(expected = height, got = fetched.block.header.height, "out of order block delivery");
                result = Err(SyncError::OutOfOrder { expected: height, got: fetched.block.header.height }.into());
                break;
            }
            if prev_hash.as_ref().is_some_and(|p| *p != fetched.block.header.prev) {
                // The backend reorganized under us; the caller detects the fork.
                warn!(height, "chain changed during parallel sync");
                break;
            }
            let r = match &mut bulk {
                Some(b) => b.connect_block(&fetched.block).map(|_| self.after_connect(&fetched.block)),
                None => self.connect(&fetched),
            };
            if let Err(e) = r {
                result = Err(e);
                break;
            }
            if height % PROGRESS_LOG_INTERVAL == 0 {
                info!(height, to, "parallel sync progress");
            }
            prev_hash = Some(fetched.block.header.hash);
        }
        // Dropping the receivers stops the fetchers.
        drop(receivers);
        if let Some(b) = bulk {
            let closed = b.close();
            if result.is_ok() {
                closed?;
            } else if let Err(e) = closed {
                error!(error = %e, "bulk connect close failed");
            }
        }
        if result.is_ok() {
            info!(from, to, "parallel sync finished");
        }
        result
    }

    /// Find the highest block shared with the backend at or below
    /// `local_best` and disconnect everything above it. Returns the fork
    /// point height.
    pub async fn handle_fork(&self, local_best: u32) -> Result<u32, BlockdexError> {
        self.set_phase(SyncPhase::Resolving);
        let backend = self.backend();
        let mut height = local_best;
        let fork_hash = loop {
            self.retry().check_interrupted()?;
            let local = self.ix.get_block_hash(height)?.ok_or(DbError::MissingBlock(height))?;
            let remote = match self.retry().call("get_block_hash", move || backend.get_block_hash(height)).await {
                Ok(h) => Some(h),
                Err(e) if e.is_not_found() => None,
                Err(e) => return Err(e),
            };
            if remote.as_deref() == Some(local.as_str()) {
                break local;
            }
            if height == 0 {
                return Err(SyncError::ForkNotResolvable(local_best).into());
            }
            height -= 1;
        };
        if height < local_best {
            warn!(fork_height = height, local_best, "fork detected, disconnecting blocks");
            self.ix.disconnect_block_range(height + 1, local_best)?;
            self.notifier.notify_new_block(height, &fork_hash);
        }
        Ok(height)
    }

    /// Refetch blocks whose account-model internal data failed. Returns the
    /// number of blocks that are now clean.
    pub async fn refetch_internal_data(&self) -> Result<usize, BlockdexError> {
        if self.ix.chain_type() != ChainType::Ethereum {
            return Ok(0);
        }
        let backend = self.backend();
        let mut fixed = 0;
        for (height, e) in self.ix.get_block_internal_data_errors()? {
            self.retry().check_interrupted()?;
            if e.retries >= MAX_INTERNAL_DATA_RETRIES {
                continue;
            }
            let id = &BlockId::Hash(e.hash.clone());
            let block = match self.retry().call("get_block", move || backend.get_block(id)).await {
                Ok(b) => b,
                Err(err) if err.is_not_found() => {
                    debug!(height, hash = %e.hash, "block for internal data refetch not found");
                    continue;
                }
                Err(err) => return Err(err),
            };
            if block.header.height != height {
                warn!(height, got = block.header.height, "internal data refetch returned another height");
                continue;
            }
            if self.ix.update_block_internal_data(&block, e.retries + 1)? {
                debug!(height, retries = e.retries + 1, "internal data still failing");
            } else {
                info!(height, "internal data refetched");
                fixed += 1;
            }
        }
        Ok(fixed)
    }
}
