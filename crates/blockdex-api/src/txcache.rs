//! Read-through cache of confirmed transactions in the `transactions` column.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use blockdex_core::error::{BackendError, BlockdexError};
use blockdex_core::traits::BackendClient;
use blockdex_core::types::{ChainType, Tx};
use blockdex_db::Indexer;

/// Await a backend call, failing with [`BackendError::Timeout`] after `limit`.
pub(crate) async fn timed<T>(
    limit: Duration,
    fut: impl Future<Output = Result<T, BackendError>>,
) -> Result<T, BackendError> {
    tokio::time::timeout(limit, fut)
        .await
        .unwrap_or(Err(BackendError::Timeout(limit.as_secs())))
}

pub struct TxCache {
    ix: Arc<Indexer>,
    backend: Arc<dyn BackendClient>,
    enabled: bool,
    rpc_timeout: Duration,
}

impl TxCache {
    pub fn new(ix: Arc<Indexer>, backend: Arc<dyn BackendClient>, enabled: bool, rpc_timeout: Duration) -> Self {
        Self { ix, backend, enabled, rpc_timeout }
    }

    /// The transaction and its block height, `None` for mempool transactions.
    ///
    /// Confirmations are never stored; cached hits get them recomputed from
    /// the current best height.
    pub async fn get_transaction(&self, txid: &str) -> Result<(Tx, Option<u32>), BlockdexError> {
        let best = self.ix.state().best_height();
        if self.enabled {
            if let Some((mut tx, height)) = self.ix.get_tx(txid)? {
                tx.confirmations = (best + 1).saturating_sub(height);
                return Ok((tx, Some(height)));
            }
        }
        let tx = timed(self.rpc_timeout, self.backend.get_transaction(txid)).await?;
        if tx.confirmations == 0 {
            return Ok((tx, None));
        }
        let indexed = match self.ix.chain_type() {
            ChainType::Bitcoin => self.ix.get_tx_addresses(txid)?.map(|ta| ta.height),
            ChainType::Ethereum => match (&tx.block_hash, self.ix.get_block_hash(tx.block_height)?) {
                (Some(want), Some(have)) if *want == have => Some(tx.block_height),
                _ => None,
            },
        };
        let Some(height) = indexed else {
            // The index has not connected the tx's block yet.
            let height = match self.ix.chain_type() {
                ChainType::Ethereum if tx.block_height > 0 => tx.block_height,
                _ => (best + 1).saturating_sub(tx.confirmations),
            };
            return Ok((tx, Some(height)));
        };
        if self.enabled {
            self.ix.put_tx(&tx, height, tx.block_time)?;
            debug!(%txid, height, "tx cached");
        }
        Ok((tx, Some(height)))
    }
}

