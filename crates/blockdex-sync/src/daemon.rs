//! Long-running sync loop: initial sync, then tip following driven by
//! backend notifications and a poll tick, with periodic mempool resync,
//! eviction and state persistence.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use blockdex_core::error::BlockdexError;
use blockdex_core::traits::BackendClient;
use blockdex_db::{Indexer, IndexerConfig};

use crate::mempool_sync::MempoolSync;
use crate::sync::{Synced, SyncWorker};

/// Stale mempool entries are looked for this often.
const EVICT_PERIOD: Duration = Duration::from_secs(5 * 60);
/// Failed internal data is refetched this often.
const INTERNAL_DATA_PERIOD: Duration = Duration::from_secs(10 * 60);

pub struct Daemon {
    ix: Arc<Indexer>,
    backend: Arc<dyn BackendClient>,
    sync: Arc<SyncWorker>,
    mempool: Arc<MempoolSync>,
    tip_poll: Duration,
    mempool_resync: Duration,
    state_store: Duration,
}

fn ticker(period: Duration) -> Interval {
    let mut t = interval_at(Instant::now() + period, period);
    t.set_missed_tick_behavior(MissedTickBehavior::Delay);
    t
}

impl Daemon {
    pub fn new(
        ix: Arc<Indexer>,
        backend: Arc<dyn BackendClient>,
        sync: Arc<SyncWorker>,
        mempool: Arc<MempoolSync>,
        cfg: &IndexerConfig,
    ) -> Self {
        Self {
            ix,
            backend,
            sync,
            mempool,
            tip_poll: Duration::from_secs(cfg.tip_poll_period_secs.max(1)),
            mempool_resync: Duration::from_secs(cfg.mempool_resync_period_secs.max(1)),
            state_store: Duration::from_secs(cfg.state_store_period_secs.max(1)),
        }
    }

    /// Run until `shutdown` flips to true, then persist state and close the index.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), BlockdexError> {
        self.refresh_backend_info().await;
        match self.sync.resync_index(true).await {
            Ok(Synced { changed }) => info!(changed, best_height = self.ix.state().best_height(), "initial sync done"),
            Err(e) if e.is_interrupted() => return self.close(),
            // Already logged; the tip tick retries.
            Err(_) => {}
        }
        self.resync_mempool().await;

        let mut new_blocks = self.backend.subscribe_new_block();
        let mut new_txs = self.backend.subscribe_new_tx();
        let (mut blocks_open, mut txs_open) = (true, true);
        let mut tip = ticker(self.tip_poll);
        let mut mempool = ticker(self.mempool_resync);
        let mut evict = ticker(EVICT_PERIOD);
        let mut store = ticker(self.state_store);
        let mut internal_data = ticker(INTERNAL_DATA_PERIOD);

        loop {
            tokio::select! {
                _ = shutdown.wait_for(|v| *v) => break,
                r = new_blocks.recv(), if blocks_open => match r {
                    Ok(header) => {
                        debug!(height = header.height, hash = %header.hash, "new block notification");
                        if !self.sync_tip().await {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!(skipped = n, "lagged behind on block notifications");
                        if !self.sync_tip().await {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        info!("block notification channel closed, polling only");
                        blocks_open = false;
                    }
                },
                r = new_txs.recv(), if txs_open => match r {
                    Ok(txid) => {
                        if let Err(e) = self.mempool.add_transaction(&txid).await {
                            debug!(%txid, error = %e, "mempool tx not added");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!(skipped = n, "lagged behind on tx notifications");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        info!("tx notification channel closed");
                        txs_open = false;
                    }
                },
                _ = tip.tick() => {
                    if !self.sync_tip().await {
                        break;
                    }
                }
                _ = mempool.tick() => self.resync_mempool().await,
                _ = evict.tick() => {
                    self.mempool.evict_stale();
                }
                _ = store.tick() => {
                    if let Err(e) = self.ix.store_internal_state() {
                        error!(error = %e, "failed to store internal state");
                    }
                }
                _ = internal_data.tick() => match self.sync.refetch_internal_data().await {
                    Ok(0) => {}
                    Ok(n) => info!(blocks = n, "internal data repaired"),
                    Err(e) if e.is_interrupted() => break,
                    Err(e) => warn!(error = %e, "internal data refetch failed"),
                },
            }
        }
        self.close()
    }

    /// Catch up with the backend tip. Returns false if interrupted.
    async fn sync_tip(&self) -> bool {
        match self.sync.resync_index(false).await {
            Ok(Synced { changed: true }) => {
                self.refresh_backend_info().await;
                self.resync_mempool().await;
                true
            }
            Ok(Synced { changed: false }) => true,
            Err(e) => !e.is_interrupted(),
        }
    }

    async fn resync_mempool(&self) {
        if let Err(e) = self.mempool.resync().await {
            if !e.is_interrupted() {
                warn!(error = %e, "mempool resync failed");
            }
        }
    }

    async fn refresh_backend_info(&self) {
        let state = self.ix.state();
        match self.backend.get_chain_info().await {
            Ok(info) => state.set_backend_info(info),
            Err(e) => {
                warn!(error = %e, "backend info unavailable");
                state.set_backend_error(e.to_string());
            }
        }
    }

    fn close(&self) -> Result<(), BlockdexError> {
        info!("shutting down sync loop");
        self.ix.state().set_in_shutdown();
        self.ix.close()
    }
}
