//! Block fee statistics and the estimate-fee cache.

use chrono::Utc;
use tokio::sync::Mutex;

use blockdex_core::constants::{ESTIMATE_FEE_CACHE_SIZE, ESTIMATE_FEE_CACHE_TTL_SECS};
use blockdex_core::error::BackendError;
use blockdex_core::traits::BackendClient;
use blockdex_core::types::Amount;

use crate::types::FeeStats;

/// Nearest-rank position of decile `k` among `n` sorted values.
pub fn decile_index(k: usize, n: usize) -> usize {
    if n == 0 {
        return 0;
    }
    ((k * n).div_ceil(10)).saturating_sub(1).min(n - 1)
}

/// Fee per kilobyte of one transaction.
pub fn fee_per_kb(fee: Amount, size: u32) -> u64 {
    if size == 0 {
        return 0;
    }
    u64::try_from(fee.saturating_mul(1000) / size as Amount).unwrap_or(u64::MAX)
}

/// Fold `(fee, size)` of a block's non-coinbase txs into [`FeeStats`].
pub fn fee_stats(txs: &[(Amount, u32)]) -> FeeStats {
    let mut per_kb: Vec<u64> = txs.iter().map(|(f, s)| fee_per_kb(*f, *s)).collect();
    per_kb.sort_unstable();
    let total_fees = txs.iter().fold(0, |a: Amount, (f, _)| a.saturating_add(*f));
    let total_size: Amount = txs.iter().map(|(_, s)| *s as Amount).sum();
    let mut deciles = [0u64; 11];
    if !per_kb.is_empty() {
        for (k, d) in deciles.iter_mut().enumerate() {
            *d = per_kb[decile_index(k, per_kb.len())];
        }
    }
    let average = if total_size == 0 {
        0
    } else {
        u64::try_from(total_fees.saturating_mul(1000) / total_size).unwrap_or(u64::MAX)
    };
    FeeStats { tx_count: txs.len() as u32, total_fees, average_fee_per_kb: average, decile_fee_per_kb: deciles }
}

/// `estimate_smart_fee` results cached per `(blocks, conservative)`.
///
/// A slot stays locked while its backend call runs, so concurrent requests
/// for the same target share one call.
pub struct EstimateFeeCache {
    slots: Vec<Mutex<Option<(i64, Amount)>>>,
    ttl: i64,
}

impl Default for EstimateFeeCache {
    fn default() -> Self {
        Self::new()
    }
}

impl EstimateFeeCache {
    pub fn new() -> Self {
        Self {
            slots: (0..ESTIMATE_FEE_CACHE_SIZE * 2).map(|_| Mutex::new(None)).collect(),
            ttl: ESTIMATE_FEE_CACHE_TTL_SECS,
        }
    }

    pub async fn estimate_smart_fee(
        &self,
        backend: &dyn BackendClient,
        blocks: u32,
        conservative: bool,
    ) -> Result<Amount, BackendError> {
        self.estimate_at(backend, blocks, conservative, Utc::now().timestamp()).await
    }

    async fn estimate_at(
        &self,
        backend: &dyn BackendClient,
        blocks: u32,
        conservative: bool,
        now: i64,
    ) -> Result<Amount, BackendError> {
        let i = blocks as usize * 2 + usize::from(conservative);
        let Some(slot) = self.slots.get(i) else {
            return backend.estimate_smart_fee(blocks, conservative).await;
        };
        let mut slot = slot.lock().await;
        if let Some((at, fee)) = *slot {
            if now - at < self.ttl {
                return Ok(fee);
            }
        }
        let fee = backend.estimate_smart_fee(blocks, conservative).await?;
        *slot = Some((now, fee));
        Ok(fee)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use tokio::sync::broadcast;

    use blockdex_core::types::{Block, BlockHeader, BlockId, ChainInfo, Tx};

    // ------------------------------------------------------------------
    // Deciles
    // ------------------------------------------------------------------

    #[test]
    fn eleven_txs_give_their_own_deciles() {
        let txs: Vec<(Amount, u32)> = (1..=11).map(|i| (i * 10, 1000)).collect();
        let s = fee_stats(&txs);
        assert_eq!(s.decile_fee_per_kb, [10, 20, 30, 40, 50, 60, 70, 80, 90, 100, 110]);
        assert_eq!(s.tx_count, 11);
        assert_eq!(s.total_fees, 660);
        assert_eq!(s.average_fee_per_kb, 60);
    }

    #[test]
    fn decile_index_is_clamped() {
        assert_eq!(decile_index(0, 1), 0);
        assert_eq!(decile_index(10, 1), 0);
        assert_eq!(decile_index(5, 4), 1);
        assert_eq!(decile_index(10, 4), 3);
        assert_eq!(decile_index(3, 0), 0);
    }

    #[test]
    fn empty_block_has_zero_stats() {
        let s = fee_stats(&[]);
        assert_eq!(s, FeeStats::default());
    }

    #[test]
    fn fee_per_kb_scales_by_size() {
        assert_eq!(fee_per_kb(250, 250), 1000);
        assert_eq!(fee_per_kb(1, 0), 0);
    }

    // ------------------------------------------------------------------
    // Cache
    // ------------------------------------------------------------------

    #[derive(Default)]
    struct CountingBackend {
        calls: AtomicU32,
    }

    #[async_trait]
    impl BackendClient for CountingBackend {
        async fn get_chain_info(&self) -> Result<ChainInfo, BackendError> {
            Err(BackendError::Unsupported("test"))
        }
        async fn get_best_block_height(&self) -> Result<u32, BackendError> {
            Ok(0)
        }
        async fn get_best_block_hash(&self) -> Result<String, BackendError> {
            Ok(String::new())
        }
        async fn get_block_hash(&self, _height: u32) -> Result<String, BackendError> {
            Err(BackendError::NotFound("block".into()))
        }
        async fn get_block_header(&self, _hash: &str) -> Result<BlockHeader, BackendError> {
            Err(BackendError::NotFound("block".into()))
        }
        async fn get_block(&self, _id: &BlockId) -> Result<Block, BackendError> {
            Err(BackendError::NotFound("block".into()))
        }
        async fn get_transaction(&self, _txid: &str) -> Result<Tx, BackendError> {
            Err(BackendError::NotFound("tx".into()))
        }
        async fn get_transaction_specific(&self, _tx: &Tx) -> Result<serde_json::Value, BackendError> {
            Ok(serde_json::Value::Null)
        }
        async fn get_mempool_transactions(&self) -> Result<Vec<String>, BackendError> {
            Ok(Vec::new())
        }
        async fn estimate_fee(&self, _blocks: u32) -> Result<Amount, BackendError> {
            Ok(1)
        }
        async fn estimate_smart_fee(&self, blocks: u32, conservative: bool) -> Result<Amount, BackendError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) as Amount;
            Ok(blocks as Amount * 100 + Amount::from(conservative) * 10 + n)
        }
        async fn send_raw_transaction(&self, _hex: &str) -> Result<String, BackendError> {
            Err(BackendError::Unsupported("test"))
        }
        fn subscribe_new_block(&self) -> broadcast::Receiver<BlockHeader> {
            broadcast::channel(1).1
        }
        fn subscribe_new_tx(&self) -> broadcast::Receiver<String> {
            broadcast::channel(1).1
        }
    }

    #[tokio::test]
    async fn repeated_estimate_within_ttl_is_cached() {
        let b = CountingBackend::default();
        let cache = EstimateFeeCache::new();
        assert_eq!(cache.estimate_at(&b, 2, true, 1000).await.unwrap(), 210);
        assert_eq!(cache.estimate_at(&b, 2, true, 1005).await.unwrap(), 210);
        assert_eq!(b.calls.load(Ordering::SeqCst), 1);
        // Same target, other mode is a separate slot.
        assert_eq!(cache.estimate_at(&b, 2, false, 1005).await.unwrap(), 201);
        assert_eq!(b.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn expired_entry_is_refetched() {
        let b = CountingBackend::default();
        let cache = EstimateFeeCache::new();
        cache.estimate_at(&b, 3, false, 1000).await.unwrap();
        let fee = cache.estimate_at(&b, 3, false, 1000 + ESTIMATE_FEE_CACHE_TTL_SECS).await.unwrap();
        assert_eq!(fee, 301);
        assert_eq!(b.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn large_targets_bypass_the_cache() {
        let b = CountingBackend::default();
        let cache = EstimateFeeCache::new();
        let blocks = ESTIMATE_FEE_CACHE_SIZE as u32;
        cache.estimate_at(&b, blocks, false, 1000).await.unwrap();
        cache.estimate_at(&b, blocks, false, 1000).await.unwrap();
        assert_eq!(b.calls.load(Ordering::SeqCst), 2);
    }
}
