//! Address, UTXO and balance-history queries.

use std::collections::HashSet;

use tracing::{debug, warn};

use blockdex_core::constants::NO_HEIGHT;
use blockdex_core::error::BackendError;
use blockdex_core::mempool::MempoolEntry;
use blockdex_core::types::{AddrDesc, Amount, ChainType, ContractInfo, NftMetadata, TokenStandard, Tx};
use blockdex_db::schema::{AddrContracts, BalanceDetail};
use blockdex_db::IterControl;

use crate::balance_history::{account_balance_history, sort_and_aggregate, utxo_balance_history, BalanceHistory};
use crate::error::ApiError;
use crate::paging::{compute_paging, sanitize_items_on_page, zero_based};
use crate::types::{AccountDetails, AddressFilter, AddressView, Token, TxView, UtxoView, VoutFilter};
use crate::worker::Worker;

pub(crate) fn signed(v: Amount) -> i128 {
    i128::try_from(v).unwrap_or(i128::MAX)
}

/// Txids of `ad` in the mempool, each with all its indexes, newest first.
pub(crate) fn group_mempool_indexes(entries: Vec<(String, i32)>) -> Vec<(String, Vec<i32>)> {
    let mut grouped: Vec<(String, Vec<i32>)> = Vec::new();
    for (txid, index) in entries {
        match grouped.iter_mut().find(|(t, _)| *t == txid) {
            Some((_, indexes)) => indexes.push(index),
            None => grouped.push((txid, vec![index])),
        }
    }
    grouped
}

/// Signed balance change of `ad` caused by a pending transaction.
pub(crate) fn mempool_delta(entry: &MempoolEntry, ad: &AddrDesc, chain: ChainType) -> i128 {
    let mut delta: i128 = 0;
    for ai in entry.addr_indexes.iter().filter(|ai| ai.addr_desc == *ad) {
        match (chain, ai.index) {
            (ChainType::Bitcoin, i) if i >= 0 => delta += signed(ai.value),
            (ChainType::Bitcoin, _) => delta -= signed(ai.value),
            // Token movements do not touch the native balance.
            (ChainType::Ethereum, 0) => delta += signed(ai.value),
            (ChainType::Ethereum, -1) => delta -= signed(ai.value),
            (ChainType::Ethereum, _) => {}
        }
    }
    if chain == ChainType::Ethereum && entry.sender.as_ref() == Some(ad) {
        let max_fee = entry.tx.as_ref().and_then(|t| t.eth.as_ref()).map_or(0, |e| e.max_fee());
        delta -= signed(max_fee);
    }
    delta
}

fn pending_matches(entry: &MempoolEntry, indexes: &[i32], filter: &AddressFilter) -> bool {
    if filter.to_height != 0 {
        return false;
    }
    match &filter.contract {
        Some(contract) => entry
            .tx
            .as_ref()
            .and_then(|t| t.eth.as_ref())
            .is_some_and(|e| e.token_transfers.iter().any(|t| t.contract.eq_ignore_ascii_case(contract))),
        None => filter.vout.matches(indexes),
    }
}

/// Metadata of the held NFT serials, matched on the serial's commitment.
fn held_nft_metadata(ci: &ContractInfo, ids: &[(String, String)]) -> Vec<NftMetadata> {
    ci.nft
        .iter()
        .filter(|m| ids.iter().any(|(id, _)| *id == m.commitment))
        .cloned()
        .collect()
}

impl Worker {
    /// Balance, counters and one page of history of an address.
    ///
    /// `page` is 1-based. Pending transactions are listed ahead of the first
    /// page only.
    pub async fn get_address(
        &self,
        address: &str,
        page: i64,
        items: i64,
        details: AccountDetails,
        filter: &AddressFilter,
    ) -> Result<AddressView, ApiError> {
        let ad = self.ix.parser().get_addr_desc_from_address(address)?;
        let page = zero_based(page);
        let items = sanitize_items_on_page(items);
        let mut view = AddressView { address: address.to_string(), ..Default::default() };

        let mut pending: Vec<String> = Vec::new();
        if !filter.only_confirmed {
            let listed: Vec<(String, i128, bool)> = {
                let pool = self.mempool.lock();
                group_mempool_indexes(pool.get_addr_desc_transactions(&ad))
                    .into_iter()
                    .filter_map(|(txid, indexes)| {
                        let entry = pool.get(&txid)?;
                        let delta = mempool_delta(entry, &ad, self.chain);
                        let matches = pending_matches(entry, &indexes, filter);
                        Some((txid, delta, matches))
                    })
                    .collect()
            };
            for (txid, delta, matches) in listed {
                // Confirmed but not yet dropped from the pool.
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

        let contracts = match self.chain {
            ChainType::Ethereum => self.ix.get_address_contracts(&ad)?.unwrap_or_default(),
            ChainType::Bitcoin => AddrContracts::default(),
        };

        if details >= AccountDetails::Txids {
            let confirmed = self.filtered_txids(&ad, &contracts, filter)?;
            let slice = compute_paging(confirmed.len(), page, items);
            let on_page = &confirmed[slice.from..slice.to];
            let mut paging = slice.paging;
            // Filtered totals are not reported.
            if filter.is_active() && confirmed.len() >= items as usize {
                paging.total_pages = -1;
            }
            view.paging = Some(paging);
            if details == AccountDetails::Txids {
                view.txids = pending.into_iter().chain(on_page.iter().cloned()).collect();
            } else {
                let mut txs = Vec::with_capacity(pending.len() + on_page.len());
                for txid in pending.iter().chain(on_page) {
                    match self.history_tx(txid, details).await {
                        Ok(Some(tx)) => txs.push(tx),
                        Ok(None) => {}
                        // A pending tx can vanish between listing and loading.
                        Err(ApiError::NotFound(_)) if pending.contains(txid) => debug!(%txid, "pending tx gone"),
                        Err(e) => return Err(e),
                    }
                }
                view.transactions = txs;
            }
        }

        match self.chain {
            ChainType::Bitcoin => {
                if let Some(b) = self.ix.get_addr_desc_balance(&ad, BalanceDetail::NoUtxo)? {
                    view.balance = b.balance;
                    view.total_sent = b.sent;
                    view.total_received = b.received();
                    view.txs = u64::from(b.txs);
                }
            }
            ChainType::Ethereum => {
                view.txs = contracts.total_txs;
                view.non_token_txs = Some(contracts.non_contract_txs);
                view.internal_txs = Some(contracts.internal_txs);
                view.balance = match self.call(self.backend.get_balance(&ad)).await {
                    Ok(b) => b,
                    Err(BackendError::Unsupported(_)) => 0,
                    Err(e) => return Err(e.into()),
                };
                view.nonce = match self.call(self.backend.get_nonce(&ad)).await {
                    Ok(n) => Some(n.to_string()),
                    Err(BackendError::Unsupported(_)) => None,
                    Err(e) => return Err(e.into()),
                };
                if details >= AccountDetails::TokenBalances {
                    view.used_tokens = Some(contracts.contracts.len());
                    view.tokens = self.contract_tokens(&ad, &contracts).await?;
                }
            }
        }
        Ok(view)
    }

    /// Confirmed txids of `ad` passing `filter`, newest first.
    fn filtered_txids(&self, ad: &AddrDesc, contracts: &AddrContracts, filter: &AddressFilter) -> Result<Vec<String>, ApiError> {
        let vout = match &filter.contract {
            Some(contract) if self.chain == ChainType::Ethereum => {
                let pos = self.desc(contract).and_then(|cad| contracts.find(&cad).map(|(pos, _)| pos));
                match pos {
                    Some(pos) => VoutFilter::Index(pos as u32 + 1),
                    // The address never touched this contract.
                    None => return Ok(Vec::new()),
                }
            }
            _ => filter.vout,
        };
        let (lower, higher) = filter.height_range();
        let mut txids: Vec<String> = Vec::new();
        self.ix.get_addr_desc_transactions(ad, lower, higher, |txid, _, indexes| {
            if vout.matches(indexes) && txids.last().is_none_or(|t| t.as_str() != txid) {
                txids.push(txid.to_string());
            }
            Ok(IterControl::Continue)
        })?;
        txids.reverse();
        Ok(txids)
    }

    pub(crate) async fn history_tx(&self, txid: &str, details: AccountDetails) -> Result<Option<TxView>, ApiError> {
        if details == AccountDetails::TxHistoryLight && self.chain == ChainType::Bitcoin {
            if let Some(ta) = self.ix.get_tx_addresses(txid)? {
                let block = self.ix.get_block_info(ta.height)?;
                return Ok(Some(self.light_tx(txid, &ta, block.as_ref(), self.best_height())));
            }
        }
        self.get_transaction(txid, false, false).await.map(Some)
    }

    async fn contract_tokens(&self, ad: &AddrDesc, contracts: &AddrContracts) -> Result<Vec<Token>, ApiError> {
        let mut tokens = Vec::with_capacity(contracts.contracts.len());
        for c in &contracts.contracts {
            let address = self.addresses_of(&c.contract).0.into_iter().next().unwrap_or_default();
            let ci = self.contract_info(&address).await;
            let mut token = Token {
                kind: c.standard.as_str().to_string(),
                name: ci.as_ref().map(|ci| ci.name.clone()).unwrap_or_default(),
                symbol: ci.as_ref().map(|ci| ci.symbol.clone()).unwrap_or_default(),
                decimals: ci.as_ref().map_or(18, |ci| ci.decimals),
                contract: address,
                transfers: c.txs,
                ..Default::default()
            };
            if c.standard == TokenStandard::Erc20 {
                token.balance = Some(match self.call(self.backend.get_contract_balance(ad, &c.contract)).await {
                    Ok(b) => b,
                    Err(e) => {
                        debug!(contract = %token.contract, error = %e, "using indexed token balance");
                        c.value
                    }
                });
            } else {
                token.ids = c.ids.iter().map(|(id, n)| (id.to_string(), n.to_string())).collect();
                if let Some(ci) = &ci {
                    token.nfts = held_nft_metadata(ci, &token.ids);
                }
            }
            tokens.push(token);
        }
        Ok(tokens)
    }

    /// Unspent outputs of an address, pending ones first, then confirmed
    /// ones from the newest block down.
    pub async fn get_utxo(&self, address: &str, only_confirmed: bool) -> Result<Vec<UtxoView>, ApiError> {
        if self.chain != ChainType::Bitcoin {
            return Err(ApiError::Unsupported("utxo".into()));
        }
        let ad = self.ix.parser().get_addr_desc_from_address(address)?;
        self.utxos_of(&ad, only_confirmed)
    }

    pub(crate) fn utxos_of(&self, ad: &AddrDesc, only_confirmed: bool) -> Result<Vec<UtxoView>, ApiError> {
        let parser = self.ix.parser();
        let balance = self.ix.get_addr_desc_balance(ad, BalanceDetail::Utxo)?.unwrap_or_default();
        if balance.utxo_sum() != balance.balance {
            warn!(address = %ad, balance = %balance.balance, utxos = %balance.utxo_sum(), "balance does not match utxo sum");
        }
        let mut confirmed = Vec::with_capacity(balance.utxos.len());
        for u in balance.utxos.iter().rev() {
            confirmed.push((parser.unpack_txid(&u.btxid)?, u));
        }

        let mut out = Vec::new();
        if !only_confirmed {
            let pool = self.mempool.lock();
            for (txid, index) in pool.get_addr_desc_transactions(ad) {
                let Ok(vout) = u32::try_from(index) else {
                    continue;
                };
                if pool.spent_by(&txid, vout).is_some() {
                    continue;
                }
                let Some(entry) = pool.get(&txid) else {
                    continue;
                };
                let value = entry
                    .addr_indexes
                    .iter()
                    .find(|ai| ai.index == index && ai.addr_desc == *ad)
                    .map_or(0, |ai| ai.value);
                let tx = entry.tx.as_ref();
                out.push(UtxoView {
                    txid,
                    vout,
                    value,
                    lock_time: tx.map_or(0, |t| t.lock_time),
                    coinbase: tx.is_some_and(Tx::is_coinbase),
                    ..Default::default()
                });
            }
            confirmed.retain(|(txid, u)| pool.spent_by(txid, u.vout).is_none());
        }

        let best = self.best_height();
        for (txid, u) in confirmed {
            let confirmations = (best + 1).saturating_sub(u.height);
            let coinbase = confirmations < self.min_coinbase_confirmations
                && self.ix.get_tx_addresses(&txid)?.is_some_and(|ta| ta.looks_like_coinbase());
            out.push(UtxoView { txid, vout: u.vout, value: u.value, height: u.height, confirmations, coinbase, ..Default::default() });
        }
        Ok(out)
    }

    /// Balance changes of an address bucketed by `group_by` seconds, with
    /// fiat rates per bucket. Timestamps of 0 leave the range open.
    pub async fn get_balance_history(
        &self,
        address: &str,
        from: i64,
        to: i64,
        currencies: &[String],
        group_by: u32,
    ) -> Result<Vec<BalanceHistory>, ApiError> {
        let ad = self.ix.parser().get_addr_desc_from_address(address)?;
        let own = HashSet::from([ad.clone()]);
        let items = self.balance_history_of(&ad, &own, from, to).await?;
        let mut out = sort_and_aggregate(items, group_by);
        self.attach_fiat_rates(&mut out, currencies)?;
        Ok(out)
    }

    /// Block heights whose times fall in `[from, to)`; `None` if none do.
    pub(crate) fn height_range_of_times(&self, from: i64, to: i64) -> Option<(u32, u32)> {
        let state = self.ix.state();
        let clamp = |ts: i64| u32::try_from(ts).unwrap_or(u32::MAX);
        let lower = if from > 0 { state.get_block_height_of_time(clamp(from)) } else { 0 };
        if lower == NO_HEIGHT {
            return None;
        }
        let higher = if to > 0 {
            match state.get_block_height_of_time(clamp(to)) {
                NO_HEIGHT => u32::MAX,
                h => h.checked_sub(1)?,
            }
        } else {
            u32::MAX
        };
        (lower <= higher).then_some((lower, higher))
    }

    pub(crate) async fn balance_history_of(
        &self,
        ad: &AddrDesc,
        own: &HashSet<AddrDesc>,
        from: i64,
        to: i64,
    ) -> Result<Vec<BalanceHistory>, ApiError> {
        let Some((lower, higher)) = self.height_range_of_times(from, to) else {
            return Ok(Vec::new());
        };
        let mut txs: Vec<(String, u32)> = Vec::new();
        self.ix.get_addr_desc_transactions(ad, lower, higher, |txid, height, _| {
            txs.push((txid.to_string(), height));
            Ok(IterControl::Continue)
        })?;
        let state = self.ix.state();
        let mut items = Vec::with_capacity(txs.len());
        for (txid, height) in txs {
            let time = state.get_block_time(height);
            match self.chain {
                ChainType::Bitcoin => match self.ix.get_tx_addresses(&txid)? {
                    Some(ta) => items.push(utxo_balance_history(&txid, time, &ta, ad, own)),
                    None => warn!(%txid, height, "tx not found in txAddresses"),
                },
                ChainType::Ethereum => {
                    let (tx, _) = self.txcache.get_transaction(&txid).await?;
                    items.push(account_balance_history(&tx, time, ad, own, |a| self.desc(a)));
                }
            }
        }
        Ok(items)
    }

    /// Rates at each bucket's time; `-1` where no ticker has the currency.
    pub(crate) fn attach_fiat_rates(&self, items: &mut [BalanceHistory], currencies: &[String]) -> Result<(), ApiError> {
        let currency = match currencies {
            [c] => c.as_str(),
            _ => "",
        };
        for bh in items {
            bh.rates = match self.ix.find_ticker(i64::from(bh.time), currency)? {
                Some(t) => Some(t.select(currencies)),
                None if currencies.is_empty() => None,
                None => Some(currencies.iter().map(|c| (c.clone(), -1.0)).collect()),
            };
        }
        Ok(())
    }
}
