//! In-memory pool of unconfirmed transactions.
//!
//! The pool mirrors the backend mempool and provides:
//! - O(1) lookup by txid
//! - a per-address inverted index of `(txid, sign-encoded index)` pairs
//! - spent-outpoint and `(sender, nonce)` indexes for replacement detection
//! - eviction by confirmation, replacement or age
//!
//! Entries are built by the resync logic (which resolves input addresses);
//! the pool itself only maintains the maps.
//!
//! Not thread-safe; callers share it as [`SharedMempool`].

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::constants::RBF_SEQUENCE_THRESHOLD;
use crate::types::{AddrDesc, Amount, Tx};

pub type SharedMempool = Arc<Mutex<Mempool>>;

/// One occurrence of an address in a mempool transaction.
///
/// `index >= 0` is output `index`; `index < 0` is input `!index`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddrIndex {
    pub addr_desc: AddrDesc,
    pub index: i32,
    /// Value moved by this occurrence, if resolved.
    pub value: Amount,
}

/// A pending transaction.
#[derive(Debug, Clone)]
pub struct MempoolEntry {
    pub txid: String,
    /// Unix seconds when the transaction was first seen.
    pub first_seen: i64,
    pub addr_indexes: Vec<AddrIndex>,
    /// Full transaction; `None` while only the txid is known.
    pub tx: Option<Tx>,
    /// Sender of an account-model transaction.
    pub sender: Option<AddrDesc>,
    /// Hex Golomb filter of the tx's descriptors, when filters are enabled.
    pub filter: Option<String>,
}

impl MempoolEntry {
    /// Entry known only by txid, resolved later.
    pub fn unresolved(txid: impl Into<String>, first_seen: i64) -> Self {
        Self { txid: txid.into(), first_seen, addr_indexes: Vec::new(), tx: None, sender: None, filter: None }
    }

    pub fn is_resolved(&self) -> bool {
        self.tx.is_some()
    }

    fn spent_outpoints(&self) -> Vec<(String, u32)> {
        match &self.tx {
            Some(tx) if tx.eth.is_none() => tx
                .vin
                .iter()
                .filter(|v| !v.is_coinbase() && !v.txid.is_empty())
                .map(|v| (v.txid.clone(), v.vout))
                .collect(),
            _ => Vec::new(),
        }
    }

    fn nonce_key(&self) -> Option<(AddrDesc, u64)> {
        let nonce = self.tx.as_ref()?.eth.as_ref()?.nonce;
        Some((self.sender.clone()?, nonce))
    }

    /// True if any input opts in to replace-by-fee.
    pub fn signals_rbf(&self) -> bool {
        self.tx
            .as_ref()
            .is_some_and(|tx| tx.vin.iter().any(|v| v.sequence < RBF_SEQUENCE_THRESHOLD))
    }
}

/// `(txid, first_seen)` pair for enumeration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MempoolTxidEntry {
    pub txid: String,
    pub time: i64,
}

#[derive(Default)]
pub struct Mempool {
    entries: HashMap<String, MempoolEntry>,
    by_addr: HashMap<AddrDesc, Vec<(String, i32)>>,
    by_outpoint: HashMap<(String, u32), String>,
    by_nonce: HashMap<(AddrDesc, u64), String>,
}

impl Mempool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedMempool {
        Arc::new(Mutex::new(Self::new()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, txid: &str) -> bool {
        self.entries.contains_key(txid)
    }

    pub fn get(&self, txid: &str) -> Option<&MempoolEntry> {
        self.entries.get(txid)
    }

    pub fn txids(&self) -> HashSet<String> {
        self.entries.keys().cloned().collect()
    }

    /// First-seen time, `None` if the tx is not pooled.
    pub fn get_transaction_time(&self, txid: &str) -> Option<i64> {
        self.entries.get(txid).map(|e| e.first_seen)
    }

    /// Insert or replace an entry. Returns txids evicted because the new
    /// entry replaces them.
    ///
    /// An existing entry for the same txid keeps its original first-seen time.
    pub fn insert(&mut self, mut entry: MempoolEntry) -> Vec<String> {
        if let Some(old) = self.entries.get(&entry.txid) {
            entry.first_seen = old.first_seen;
            let txid = entry.txid.clone();
            self.unindex(&txid);
        }
        let mut replaced = Vec::new();
        for op in entry.spent_outpoints() {
            if let Some(other) = self.by_outpoint.get(&op) {
                if *other != entry.txid
                    && self.entries.get(other).is_some_and(|e| e.signals_rbf())
                    && !replaced.contains(other)
                {
                    replaced.push(other.clone());
                }
            }
        }
        if let Some(key) = entry.nonce_key() {
            if let Some(other) = self.by_nonce.get(&key) {
                if *other != entry.txid && !replaced.contains(other) {
                    replaced.push(other.clone());
                }
            }
        }
        for txid in &replaced {
            debug!(replaced = %txid, by = %entry.txid, "mempool replacement");
            self.remove(txid);
        }
        self.index(&entry);
        self.entries.insert(entry.txid.clone(), entry);
        replaced
    }

    /// Remove a transaction from all maps. Removing an unknown txid is a no-op.
    pub fn remove(&mut self, txid: &str) -> bool {
        if !self.entries.contains_key(txid) {
            return false;
        }
        self.unindex(txid);
        self.entries.remove(txid);
        true
    }

    /// Remove all listed txids, returning how many were pooled.
    pub fn remove_transactions<'a>(&mut self, txids: impl IntoIterator<Item = &'a str>) -> usize {
        txids.into_iter().filter(|t| self.remove(t)).count()
    }

    /// Evict entries first seen before `cutoff`. Returns the evicted txids.
    pub fn evict_older_than(&mut self, cutoff: i64) -> Vec<String> {
        let stale: Vec<String> = self
            .entries
            .values()
            .filter(|e| e.first_seen < cutoff)
            .map(|e| e.txid.clone())
            .collect();
        for txid in &stale {
            self.remove(txid);
        }
        stale
    }

    /// `(txid, sign-encoded index)` pairs for an address, newest first.
    pub fn get_addr_desc_transactions(&self, ad: &AddrDesc) -> Vec<(String, i32)> {
        self.by_addr
            .get(ad)
            .map(|v| v.iter().rev().cloned().collect())
            .unwrap_or_default()
    }

    /// Pooled tx spending `(txid, vout)`, if any.
    pub fn spent_by(&self, txid: &str, vout: u32) -> Option<&str> {
        self.by_outpoint.get(&(txid.to_string(), vout)).map(String::as_str)
    }

    /// All entries ordered by first-seen time, newest first; ties by txid descending.
    pub fn get_all_entries(&self) -> Vec<MempoolTxidEntry> {
        let mut out: Vec<MempoolTxidEntry> = self
            .entries
            .values()
            .map(|e| MempoolTxidEntry { txid: e.txid.clone(), time: e.first_seen })
            .collect();
        out.sort_by(|a, b| b.time.cmp(&a.time).then_with(|| b.txid.cmp(&a.txid)));
        out
    }

    /// Filters of entries first seen at or after `from_time`, by txid.
    pub fn get_txid_filter_entries(&self, from_time: i64) -> BTreeMap<String, String> {
        self.entries
            .values()
            .filter(|e| e.first_seen >= from_time)
            .filter_map(|e| e.filter.as_ref().map(|f| (e.txid.clone(), f.clone())))
            .collect()
    }

    // --- Internal helpers ---

    fn index(&mut self, entry: &MempoolEntry) {
        for ai in &entry.addr_indexes {
            self.by_addr
                .entry(ai.addr_desc.clone())
                .or_default()
                .push((entry.txid.clone(), ai.index));
        }
        for op in entry.spent_outpoints() {
            self.by_outpoint.insert(op, entry.txid.clone());
        }
        if let Some(key) = entry.nonce_key() {
            self.by_nonce.insert(key, entry.txid.clone());
        }
    }

    fn unindex(&mut self, txid: &str) {
        let Some(entry) = self.entries.get(txid) else { return };
        for ai in &entry.addr_indexes {
            if let Some(list) = self.by_addr.get_mut(&ai.addr_desc) {
                list.retain(|(t, _)| t != txid);
                if list.is_empty() {
                    self.by_addr.remove(&ai.addr_desc);
                }
            }
        }
        for op in entry.spent_outpoints() {
            if self.by_outpoint.get(&op).is_some_and(|t| t == txid) {
                self.by_outpoint.remove(&op);
            }
        }
        if let Some(key) = entry.nonce_key() {
            if self.by_nonce.get(&key).is_some_and(|t| t == txid) {
                self.by_nonce.remove(&key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EthereumTxData, Vin};

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn ad(b: u8) -> AddrDesc {
        AddrDesc::new(vec![b; 4])
    }

    fn entry(txid: &str, time: i64, idx: &[(u8, i32)]) -> MempoolEntry {
        MempoolEntry {
            txid: txid.into(),
            first_seen: time,
            addr_indexes: idx.iter().map(|(a, i)| AddrIndex { addr_desc: ad(*a), index: *i, value: 1 }).collect(),
            tx: Some(Tx { txid: txid.into(), ..Default::default() }),
            sender: None,
            filter: None,
        }
    }

    fn spending(txid: &str, prev: &str, vout: u32, sequence: u32) -> MempoolEntry {
        let mut e = entry(txid, 10, &[(1, !0)]);
        if let Some(tx) = e.tx.as_mut() {
            tx.vin = vec![Vin { txid: prev.into(), vout, sequence, ..Default::default() }];
        }
        e
    }

    // ------------------------------------------------------------------
    // Tests
    // ------------------------------------------------------------------

    #[test]
    fn insert_indexes_every_address_occurrence() {
        let mut m = Mempool::new();
        m.insert(entry("t1", 1, &[(1, 0), (2, !0), (1, 1)]));
        assert_eq!(m.get_addr_desc_transactions(&ad(1)), vec![("t1".into(), 1), ("t1".into(), 0)]);
        assert_eq!(m.get_addr_desc_transactions(&ad(2)), vec![("t1".into(), !0)]);
        assert!(m.get_addr_desc_transactions(&ad(3)).is_empty());
    }

    #[test]
    fn addr_transactions_are_newest_first() {
        let mut m = Mempool::new();
        m.insert(entry("a", 1, &[(1, 0)]));
        m.insert(entry("b", 2, &[(1, 0)]));
        let txids: Vec<_> = m.get_addr_desc_transactions(&ad(1)).into_iter().map(|(t, _)| t).collect();
        assert_eq!(txids, vec!["b", "a"]);
    }

    #[test]
    fn remove_cleans_both_maps_and_is_idempotent() {
        let mut m = Mempool::new();
        m.insert(entry("t1", 1, &[(1, 0)]));
        assert!(m.remove("t1"));
        assert!(!m.remove("t1"));
        assert!(m.get_addr_desc_transactions(&ad(1)).is_empty());
        assert!(m.is_empty());
    }

    #[test]
    fn reinsert_keeps_first_seen() {
        let mut m = Mempool::new();
        m.insert(MempoolEntry::unresolved("t1", 5));
        m.insert(entry("t1", 99, &[(1, 0)]));
        assert_eq!(m.get_transaction_time("t1"), Some(5));
        assert_eq!(m.get_addr_desc_transactions(&ad(1)).len(), 1);
    }

    #[test]
    fn all_entries_sorted_by_time_desc_then_txid_desc() {
        let mut m = Mempool::new();
        m.insert(entry("a", 10, &[]));
        m.insert(entry("c", 20, &[]));
        m.insert(entry("b", 10, &[]));
        let order: Vec<_> = m.get_all_entries().into_iter().map(|e| e.txid).collect();
        assert_eq!(order, vec!["c", "b", "a"]);
    }

    #[test]
    fn rbf_signalling_tx_is_replaced() {
        let mut m = Mempool::new();
        m.insert(spending("old", "prev", 0, 0xffff_fffd));
        let replaced = m.insert(spending("new", "prev", 0, u32::MAX));
        assert_eq!(replaced, vec!["old".to_string()]);
        assert!(!m.contains("old"));
        assert_eq!(m.spent_by("prev", 0), Some("new"));
    }

    #[test]
    fn final_sequence_tx_is_not_replaced() {
        let mut m = Mempool::new();
        m.insert(spending("old", "prev", 0, u32::MAX));
        let replaced = m.insert(spending("new", "prev", 0, u32::MAX));
        assert!(replaced.is_empty());
        assert!(m.contains("old"));
    }

    #[test]
    fn same_sender_and_nonce_replaces() {
        let mut m = Mempool::new();
        let eth = |txid: &str| {
            let mut e = entry(txid, 1, &[(7, !0)]);
            e.sender = Some(ad(7));
            if let Some(tx) = e.tx.as_mut() {
                tx.eth = Some(EthereumTxData { nonce: 3, ..Default::default() });
            }
            e
        };
        m.insert(eth("0xa"));
        assert_eq!(m.insert(eth("0xb")), vec!["0xa".to_string()]);
        assert_eq!(m.len(), 1);
    }

    #[test]
    fn eviction_by_age() {
        let mut m = Mempool::new();
        m.insert(entry("old", 100, &[(1, 0)]));
        m.insert(entry("new", 200, &[(1, 1)]));
        assert_eq!(m.evict_older_than(150), vec!["old".to_string()]);
        assert_eq!(m.get_addr_desc_transactions(&ad(1)), vec![("new".into(), 1)]);
    }

    #[test]
    fn remove_transactions_counts_only_pooled() {
        let mut m = Mempool::new();
        m.insert(entry("a", 1, &[]));
        assert_eq!(m.remove_transactions(["a", "zzz"]), 1);
    }

    #[test]
    fn filter_entries_respect_time_and_presence() {
        let mut m = Mempool::new();
        let mut old = entry("01", 10, &[(1, 0)]);
        old.filter = Some("aa".into());
        let mut new = entry("02", 20, &[(2, 0)]);
        new.filter = Some("bb".into());
        m.insert(old);
        m.insert(new);
        m.insert(entry("03", 30, &[(3, 0)]));
        let all = m.get_txid_filter_entries(0);
        assert_eq!(all.len(), 2);
        let recent = m.get_txid_filter_entries(15);
        assert_eq!(recent.into_iter().collect::<Vec<_>>(), vec![("02".to_string(), "bb".to_string())]);
    }
}
