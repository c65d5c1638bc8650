//! Extended-public-key queries and the per-xpub derivation cache.
//!
//! An entry remembers every derived address with its balance and, once
//! loaded, its txids. On access the entry is reused if the block it was
//! built at is still on the best chain; only history above the stored
//! height is then read. Otherwise it is rebuilt from scratch.

use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

use blockdex_core::types::{AddrDesc, Amount, ChainType};
use blockdex_db::schema::{AddrBalance, BalanceDetail};
use blockdex_db::IterControl;

use crate::address::{group_mempool_indexes, mempool_delta};
use crate::balance_history::{sort_and_aggregate, BalanceHistory};
use crate::error::ApiError;
use crate::paging::{compute_paging, sanitize_items_on_page, zero_based};
use crate::types::{AccountDetails, AddressFilter, AddressView, Token, TokensToReturn, UtxoView};
use crate::worker::Worker;

/// Both BIP-32 branches: external (0) and change (1).
const BRANCHES: u32 = 2;

#[derive(Clone, Debug, Default)]
pub(crate) struct XpubAddress {
    pub ad: AddrDesc,
    pub balance: Option<AddrBalance>,
    /// `(txid, height, indexes)`, newest first.
    pub txids: Vec<(String, u32, Vec<i32>)>,
    /// Whether `txids` holds the full history up to `max_height`.
    pub complete: bool,
    pub max_height: u32,
}

impl XpubAddress {
    fn new(ad: AddrDesc) -> Self {
        Self { ad, ..Default::default() }
    }

    pub fn is_used(&self) -> bool {
        self.balance.as_ref().is_some_and(|b| b.txs > 0)
    }
}

#[derive(Clone, Debug)]
pub(crate) struct XpubData {
    gap: u32,
    data_height: u32,
    data_hash: String,
    branches: [Vec<XpubAddress>; BRANCHES as usize],
    balance: Amount,
    sent: Amount,
    txs: u64,
    accessed: Instant,
}

impl XpubData {
    fn new(gap: u32) -> Self {
        Self {
            gap,
            data_height: 0,
            data_hash: String::new(),
            branches: Default::default(),
            balance: 0,
            sent: 0,
            txs: 0,
            accessed: Instant::now(),
        }
    }

    /// `(change, index, address)` over both branches.
    fn addresses(&self) -> impl Iterator<Item = (u32, u32, &XpubAddress)> {
        self.branches
            .iter()
            .enumerate()
            .flat_map(|(c, b)| b.iter().enumerate().map(move |(i, xa)| (c as u32, i as u32, xa)))
    }

    fn used(&self) -> impl Iterator<Item = &XpubAddress> {
        self.addresses().map(|(_, _, xa)| xa).filter(|xa| xa.is_used())
    }

    fn sum_totals(&mut self) {
        let (mut balance, mut sent, mut txs) = (0 as Amount, 0 as Amount, 0u64);
        for b in self.addresses().filter_map(|(_, _, xa)| xa.balance.as_ref()) {
            balance = balance.saturating_add(b.balance);
            sent = sent.saturating_add(b.sent);
            txs += u64::from(b.txs);
        }
        (self.balance, self.sent, self.txs) = (balance, sent, txs);
    }
}

/// Derived-address cache keyed by xpub. The map lock is never held while
/// deriving or reading the index.
pub struct XpubCache {
    entries: Mutex<HashMap<String, XpubData>>,
    gap_default: u32,
    gap_max: u32,
    idle: Duration,
}

impl XpubCache {
    pub fn new(gap_default: u32, gap_max: u32, idle: Duration) -> Self {
        Self { entries: Mutex::new(HashMap::new()), gap_default: gap_default.max(1), gap_max: gap_max.max(1), idle }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Gap limit for a request: the default for 0 or none, never above the maximum.
    pub fn gap(&self, requested: Option<u32>) -> u32 {
        requested.filter(|g| *g > 0).unwrap_or(self.gap_default).min(self.gap_max)
    }

    /// Drop entries not accessed within the idle period. Returns how many went.
    pub fn evict_idle(&self) -> usize {
        self.evict_idle_at(Instant::now())
    }

    fn evict_idle_at(&self, now: Instant) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, d| now.saturating_duration_since(d.accessed) < self.idle);
        let evicted = before - entries.len();
        if evicted > 0 {
            debug!(evicted, size = entries.len(), "evicted idle xpubs");
        }
        evicted
    }

    fn get(&self, xpub: &str) -> Option<XpubData> {
        self.entries.lock().get(xpub).cloned()
    }

    fn put(&self, xpub: &str, data: XpubData) {
        self.entries.lock().insert(xpub.to_string(), data);
    }
}

impl Worker {
    /// Derive and refresh the addresses of `xpub`, reusing the cached entry
    /// while its block is still on the best chain.
    fn xpub_data(&self, xpub: &str, gap: Option<u32>, with_txids: bool) -> Result<XpubData, ApiError> {
        let gap = self.xpubs.gap(gap);
        let (best, best_hash) = self.ix.get_best_block()?.unwrap_or_default();
        let mut data = match self.xpubs.get(xpub) {
            Some(d) if d.gap == gap && self.ix.get_block_hash(d.data_height)?.as_deref() == Some(d.data_hash.as_str()) => d,
            Some(d) => {
                debug!(xpub, height = d.data_height, "xpub cache entry reset");
                XpubData::new(gap)
            }
            None => XpubData::new(gap),
        };

        let parser = self.ix.parser();
        for change in 0..BRANCHES {
            let branch = &mut data.branches[change as usize];
            for xa in branch.iter_mut() {
                self.refresh_xpub_address(xa, with_txids, best)?;
            }
            loop {
                let last_used = branch.iter().rposition(XpubAddress::is_used);
                let want = last_used.map_or(0, |i| i + 1) + gap as usize;
                if branch.len() >= want {
                    break;
                }
                let ads = parser.derive_address_descriptors_from_to(xpub, change, branch.len() as u32, want as u32)?;
                if ads.is_empty() {
                    break;
                }
                for ad in ads {
                    let mut xa = XpubAddress::new(ad);
                    self.refresh_xpub_address(&mut xa, with_txids, best)?;
                    branch.push(xa);
                }
            }
        }
        data.data_height = best;
        data.data_hash = best_hash;
        data.accessed = Instant::now();
        data.sum_totals();
        self.xpubs.put(xpub, data.clone());
        Ok(data)
    }

    fn refresh_xpub_address(&self, xa: &mut XpubAddress, with_txids: bool, best: u32) -> Result<(), ApiError> {
        xa.balance = self.ix.get_addr_desc_balance(&xa.ad, BalanceDetail::NoUtxo)?;
        if !with_txids || !xa.is_used() || (xa.complete && xa.max_height >= best) {
            return Ok(());
        }
        let lower = if xa.complete { xa.max_height + 1 } else { 0 };
        if !xa.complete {
            xa.txids.clear();
        }
        let mut fresh = Vec::new();
        self.ix.get_addr_desc_transactions(&xa.ad, lower, best, |txid, height, indexes| {
            fresh.push((txid.to_string(), height, indexes.to_vec()));
            Ok(IterControl::Continue)
        })?;
        fresh.reverse();
        fresh.append(&mut xa.txids);
        xa.txids = fresh;
        xa.complete = true;
        xa.max_height = best;
        Ok(())
    }

    /// Summary and history of all addresses derived from `xpub`.
    #[allow(clippy::too_many_arguments)]
    pub async fn get_xpub_address(
        &self,
        xpub: &str,
        page: i64,
        items: i64,
        details: AccountDetails,
        filter: &AddressFilter,
        gap: Option<u32>,
        tokens: TokensToReturn,
    ) -> Result<AddressView, ApiError> {
        let page = zero_based(page);
        let items = sanitize_items_on_page(items);
        let data = self.xpub_data(xpub, gap, details >= AccountDetails::Txids)?;
        let mut view = AddressView {
            address: xpub.to_string(),
            balance: data.balance,
            total_sent: data.sent,
            total_received: data.balance.saturating_add(data.sent),
            txs: data.txs,
            ..Default::default()
        };

        let mut pending: Vec<String> = Vec::new();
        if !filter.only_confirmed {
            // Per txid: summed delta over own addresses, whether any occurrence matches.
            let mut listed: Vec<(String, i128, bool)> = Vec::new();
            {
                let pool = self.mempool.lock();
                let mut at: HashMap<String, usize> = HashMap::new();
                for (_, _, xa) in data.addresses() {
                    for (txid, indexes) in group_mempool_indexes(pool.get_addr_desc_transactions(&xa.ad)) {
                        let Some(entry) = pool.get(&txid) else {
                            continue;
                        };
                        let delta = mempool_delta(entry, &xa.ad, self.chain);
                        let matches = filter.to_height == 0 && filter.vout.matches(&indexes);
                        match at.get(&txid) {
                            Some(&i) => {
                                listed[i].1 += delta;
                                listed[i].2 |= matches;
                            }
                            None => {
                                at.insert(txid.clone(), listed.len());
                                listed.push((txid, delta, matches));
                            }
                        }
                    }
                }
            }
            for (txid, delta, matches) in listed {
                if self.chain == ChainType::Bitcoin && self.ix.get_tx_addresses(&txid)?.is_some() {
                    continue;
                }
                view.unconfirmed_txs += 1;
                view.unconfirmed_balance += delta;
                if page == 0 && details >= AccountDetails::Txids && matches {
                    pending.push(txid);
                }
            }
        }

        if details >= AccountDetails::Txids {
            let (lower, higher) = filter.height_range();
            let mut seen = HashSet::new();
            let mut confirmed: Vec<(&str, u32)> = Vec::new();
            for (_, _, xa) in data.addresses() {
                for (txid, height, indexes) in &xa.txids {
                    if (lower..=higher).contains(height) && filter.vout.matches(indexes) && seen.insert(txid.as_str()) {
                        confirmed.push((txid.as_str(), *height));
                    }
                }
            }
            view.txs = seen.len() as u64;
            confirmed.sort_by_key(|(_, h)| Reverse(*h));
            let slice = compute_paging(confirmed.len(), page, items);
            let mut paging = slice.paging;
            if filter.is_active() && confirmed.len() >= items as usize {
                paging.total_pages = -1;
            }
            view.paging = Some(paging);
            let on_page = confirmed[slice.from..slice.to].iter().map(|(t, _)| t.to_string());
            if details == AccountDetails::Txids {
                view.txids = pending.into_iter().chain(on_page).collect();
            } else {
                for txid in pending.into_iter().chain(on_page) {
                    if let Some(tx) = self.history_tx(&txid, details).await? {
                        view.transactions.push(tx);
                    }
                }
            }
        }

        if details >= AccountDetails::TokenBalances {
            let decimals = self.ix.parser().amount_decimals();
            view.used_tokens = Some(data.used().count());
            for (change, index, xa) in data.addresses() {
                let balance = xa.balance.as_ref().map_or(0, |b| b.balance);
                let listed = match tokens {
                    TokensToReturn::NonzeroBalance => balance > 0,
                    TokensToReturn::Used => xa.is_used(),
                    TokensToReturn::Derived => true,
                };
                if !listed {
                    continue;
                }
                let b = xa.balance.clone().unwrap_or_default();
                view.tokens.push(Token {
                    kind: "XPUBAddress".to_string(),
                    name: self.addresses_of(&xa.ad).0.into_iter().next().unwrap_or_default(),
                    path: format!("{change}/{index}"),
                    transfers: u64::from(b.txs),
                    decimals,
                    balance: Some(b.balance),
                    total_received: Some(b.received()),
                    total_sent: Some(b.sent),
                    ..Default::default()
                });
            }
        }
        Ok(view)
    }

    /// UTXOs of all addresses derived from `xpub`: pending first, then by
    /// height descending.
    pub async fn get_xpub_utxo(&self, xpub: &str, only_confirmed: bool, gap: Option<u32>) -> Result<Vec<UtxoView>, ApiError> {
        if self.chain != ChainType::Bitcoin {
            return Err(ApiError::Unsupported("utxo".into()));
        }
        let data = self.xpub_data(xpub, gap, false)?;
        let mut out = Vec::new();
        for (change, index, xa) in data.addresses() {
            if only_confirmed && !xa.is_used() {
                continue;
            }
            let address = self.addresses_of(&xa.ad).0.into_iter().next();
            for mut u in self.utxos_of(&xa.ad, only_confirmed)? {
                u.address = address.clone();
                u.path = Some(format!("{change}/{index}"));
                out.push(u);
            }
        }
        out.sort_by_key(|u| (u.confirmations != 0, Reverse(u.height)));
        Ok(out)
    }

    /// Balance history summed over the used addresses of `xpub`; transfers
    /// between them count as sent to self.
    pub async fn get_xpub_balance_history(
        &self,
        xpub: &str,
        from: i64,
        to: i64,
        currencies: &[String],
        gap: Option<u32>,
        group_by: u32,
    ) -> Result<Vec<BalanceHistory>, ApiError> {
        let data = self.xpub_data(xpub, gap, false)?;
        let used: Vec<&AddrDesc> = data.used().map(|xa| &xa.ad).collect();
        let own: HashSet<AddrDesc> = used.iter().map(|ad| (*ad).clone()).collect();
        let mut items = Vec::new();
        for ad in used {
            items.extend(self.balance_history_of(ad, &own, from, to).await?);
        }
        let mut out = sort_and_aggregate(items, group_by);
        self.attach_fiat_rates(&mut out, currencies)?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> XpubCache {
        XpubCache::new(20, 100, Duration::from_secs(3600))
    }

    #[test]
    fn gap_is_defaulted_and_capped() {
        let c = cache();
        assert_eq!(c.gap(None), 20);
        assert_eq!(c.gap(Some(0)), 20);
        assert_eq!(c.gap(Some(50)), 50);
        assert_eq!(c.gap(Some(1_000_000)), 100);
    }

    #[test]
    fn idle_entries_are_evicted() {
        let c = cache();
        c.put("xpub-a", XpubData::new(20));
        c.put("xpub-b", XpubData::new(20));
        assert_eq!(c.evict_idle_at(Instant::now()), 0);
        assert_eq!(c.evict_idle_at(Instant::now() + Duration::from_secs(3601)), 2);
        assert!(c.is_empty());
    }

    #[test]
    fn totals_sum_over_both_branches() {
        let mut d = XpubData::new(20);
        let bal = |balance, sent, txs| AddrBalance { txs, sent, balance, utxos: Vec::new() };
        d.branches[0].push(XpubAddress { balance: Some(bal(10, 5, 2)), ..XpubAddress::new(AddrDesc::new(b"a".to_vec())) });
        d.branches[0].push(XpubAddress::new(AddrDesc::new(b"b".to_vec())));
        d.branches[1].push(XpubAddress { balance: Some(bal(1, 0, 1)), ..XpubAddress::new(AddrDesc::new(b"c".to_vec())) });
        d.sum_totals();
        assert_eq!((d.balance, d.sent, d.txs), (11, 5, 3));
        assert_eq!(d.used().count(), 2);
        let paths: Vec<(u32, u32)> = d.addresses().map(|(c, i, _)| (c, i)).collect();
        assert_eq!(paths, vec![(0, 0), (0, 1), (1, 0)]);
    }
}
