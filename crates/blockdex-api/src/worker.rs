//! The query worker: rebuilds transactions, blocks and chain status from the
//! index, the mempool and the backend.
//!
//! Address, UTXO and balance-history queries live in [`crate::address`],
//! xpub queries in [`crate::xpub`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use blockdex_core::constants::RBF_SEQUENCE_THRESHOLD;
use blockdex_core::error::BackendError;
use blockdex_core::golomb::FilterScripts;
use blockdex_core::mempool::SharedMempool;
use blockdex_core::traits::BackendClient;
use blockdex_core::types::{AddrDesc, Amount, BlockId, BlockInfo, ChainType, ContractInfo, Tx};
use blockdex_db::schema::TxAddresses;
use blockdex_db::{Indexer, IndexerConfig, IterControl};

use crate::error::ApiError;
use crate::fees::{fee_stats, EstimateFeeCache};
use crate::paging::{compute_paging, zero_based};
use crate::txcache::{timed, TxCache};
use crate::types::{
    eth_status_code, BackendInfo, BlockView, BlocksView, EthereumSpecific, FeeStats, FiatRatesView,
    InternalTransferView, MempoolFilters, SystemInfo, TickersList, TokenTransferView, TxView, TxVin, TxVout,
};
use crate::xpub::XpubCache;

pub struct Worker {
    pub(crate) ix: Arc<Indexer>,
    pub(crate) backend: Arc<dyn BackendClient>,
    pub(crate) mempool: SharedMempool,
    pub(crate) txcache: TxCache,
    pub(crate) xpubs: XpubCache,
    fee_cache: EstimateFeeCache,
    pub(crate) chain: ChainType,
    rpc_timeout: Duration,
    pub(crate) min_coinbase_confirmations: u32,
}

impl Worker {
    pub fn new(
        ix: Arc<Indexer>,
        backend: Arc<dyn BackendClient>,
        mempool: SharedMempool,
        cfg: &IndexerConfig,
    ) -> Self {
        let chain = ix.chain_type();
        Self {
            txcache: TxCache::new(Arc::clone(&ix), Arc::clone(&backend), cfg.tx_cache, cfg.rpc_timeout()),
            xpubs: XpubCache::new(
                cfg.xpub_cache_gap_default,
                cfg.xpub_cache_gap_max,
                Duration::from_secs(cfg.xpub_cache_idle_secs),
            ),
            fee_cache: EstimateFeeCache::new(),
            ix,
            backend,
            mempool,
            chain,
            rpc_timeout: cfg.rpc_timeout(),
            min_coinbase_confirmations: cfg.minimum_coinbase_confirmations,
        }
    }

    pub fn indexer(&self) -> &Arc<Indexer> {
        &self.ix
    }

    pub fn xpub_cache(&self) -> &XpubCache {
        &self.xpubs
    }

    pub(crate) async fn call<T>(&self, fut: impl Future<Output = Result<T, BackendError>>) -> Result<T, BackendError> {
        timed(self.rpc_timeout, fut).await
    }

    pub(crate) fn best_height(&self) -> u32 {
        self.ix.state().best_height()
    }

    /// A pooled tx from the mempool, anything else through the tx cache.
    pub(crate) async fn load_tx(&self, txid: &str) -> Result<(Tx, Option<u32>), ApiError> {
        let pooled = self.mempool.lock().get(txid).and_then(|e| e.tx.clone());
        if let Some(tx) = pooled {
            return Ok((tx, None));
        }
        Ok(self.txcache.get_transaction(txid).await?)
    }

    /// Human readable addresses of a descriptor; empty if it has none.
    pub(crate) fn addresses_of(&self, ad: &AddrDesc) -> (Vec<String>, bool) {
        if ad.is_empty() {
            return (Vec::new(), false);
        }
        match self.ix.parser().get_addresses_from_addr_desc(ad) {
            Ok(r) => r,
            Err(e) => {
                debug!(address = %ad, error = %e, "cannot decode address descriptor");
                (Vec::new(), false)
            }
        }
    }

    pub(crate) fn desc(&self, address: &str) -> Option<AddrDesc> {
        if address.is_empty() {
            return None;
        }
        self.ix.parser().get_addr_desc_from_address(address).ok()
    }

    pub(crate) async fn contract_info(&self, contract: &str) -> Option<ContractInfo> {
        match self.ix.get_contract_info_for_address(contract) {
            Ok(Some(ci)) => return Some(ci),
            Ok(None) => {}
            Err(e) => debug!(contract, error = %e, "contract lookup failed"),
        }
        let ad = self.desc(contract)?;
        match self.call(self.backend.get_contract_info(&ad)).await {
            Ok(ci) => ci,
            Err(e) => {
                debug!(contract, error = %e, "backend has no contract info");
                None
            }
        }
    }

    // --- Transactions ---

    pub async fn get_transaction(&self, txid: &str, spending: bool, specific: bool) -> Result<TxView, ApiError> {
        if txid.is_empty() {
            return Err(ApiError::InvalidInput("missing txid".into()));
        }
        let (tx, height) = self.load_tx(txid).await?;
        self.tx_view(&tx, height, spending, specific).await
    }

    /// Txid of the transaction spending output `n` of `txid`, confirmed or pooled.
    pub async fn get_spending_txid(&self, txid: &str, n: u32) -> Result<Option<String>, ApiError> {
        let tx = self.get_transaction(txid, true, false).await?;
        let out = tx
            .vout
            .get(n as usize)
            .ok_or_else(|| ApiError::InvalidInput(format!("output {n} out of range")))?;
        if out.spent_txid.is_some() {
            return Ok(out.spent_txid.clone());
        }
        Ok(self.mempool.lock().spent_by(txid, n).map(str::to_string))
    }

    pub(crate) async fn tx_view(
        &self,
        tx: &Tx,
        height: Option<u32>,
        spending: bool,
        specific: bool,
    ) -> Result<TxView, ApiError> {
        let height = height.filter(|_| tx.confirmations > 0);
        let (ta, block_hash) = match height {
            Some(h) => {
                let ta = match self.chain {
                    ChainType::Bitcoin => self.ix.get_tx_addresses(&tx.txid)?,
                    ChainType::Ethereum => None,
                };
                (ta, self.ix.get_block_hash(h)?)
            }
            None => (None, None),
        };

        let mut rbf = false;
        let mut value_in: Amount = 0;
        let mut vin = Vec::with_capacity(tx.vin.len());
        for (i, v) in tx.vin.iter().enumerate() {
            if height.is_none() && v.sequence < RBF_SEQUENCE_THRESHOLD {
                rbf = true;
            }
            let mut out = TxVin {
                n: i as u32,
                txid: v.txid.clone(),
                vout: v.vout,
                sequence: v.sequence,
                hex: v.script_sig_hex.clone(),
                coinbase: v.coinbase.clone(),
                ..Default::default()
            };
            match self.chain {
                ChainType::Bitcoin if !v.is_coinbase() && !v.txid.is_empty() => {
                    let (ad, value) = self.resolve_input(tx, i).await?;
                    (out.addresses, out.is_address) = self.addresses_of(&ad);
                    out.value = value;
                    value_in = value_in.saturating_add(value.unwrap_or(0));
                }
                ChainType::Bitcoin => {}
                ChainType::Ethereum => {
                    out.addresses = v.addresses.clone();
                    out.is_address = !out.addresses.is_empty();
                }
            }
            vin.push(out);
        }

        let parser = self.ix.parser();
        let mut value_out: Amount = 0;
        let mut vout = Vec::with_capacity(tx.vout.len());
        for (i, o) in tx.vout.iter().enumerate() {
            let mut out = TxVout { value: o.value_sat, n: i as u32, hex: o.script_pubkey_hex.clone(), ..Default::default() };
            value_out = value_out.saturating_add(o.value_sat);
            let ad = match self.chain {
                ChainType::Bitcoin => parser.get_addr_desc_from_vout(o).unwrap_or_else(|e| {
                    debug!(txid = %tx.txid, vout = i, error = %e, "output without address");
                    AddrDesc::default()
                }),
                ChainType::Ethereum => AddrDesc::default(),
            };
            match self.chain {
                ChainType::Bitcoin => (out.addresses, out.is_address) = self.addresses_of(&ad),
                ChainType::Ethereum => {
                    out.addresses = o.addresses.clone();
                    out.is_address = !out.addresses.is_empty();
                }
            }
            if let Some(ta) = &ta {
                out.spent = ta.outputs.get(i).is_some_and(|t| t.spent);
            }
            if spending && out.spent {
                if let Some(h) = height {
                    self.set_spending_tx(&mut out, &ad, &tx.txid, h).await?;
                }
            }
            vout.push(out);
        }

        let mut view = TxView {
            txid: tx.txid.clone(),
            version: tx.version,
            lock_time: tx.lock_time,
            block_hash,
            block_height: height.map_or(-1, i64::from),
            confirmations: if height.is_some() { tx.confirmations } else { 0 },
            block_time: tx.block_time,
            size: tx.size,
            vsize: tx.vsize,
            hex: tx.hex.clone(),
            rbf,
            ..Default::default()
        };
        match self.chain {
            ChainType::Bitcoin => {
                view.value = value_out;
                if !tx.is_coinbase() {
                    view.value_in = Some(value_in);
                    view.fees = value_in.saturating_sub(value_out);
                }
            }
            ChainType::Ethereum => {
                view.value = tx.vout.first().map(|o| o.value_sat).unwrap_or(0);
                if let Some(eth) = &tx.eth {
                    view.fees = eth.fee().unwrap_or(0);
                    view.token_transfers = self.token_transfers(tx).await;
                    view.ethereum_specific = Some(self.ethereum_specific(tx, height.is_some())?);
                }
            }
        }
        if specific {
            view.coin_specific_data = Some(self.call(self.backend.get_transaction_specific(tx)).await?);
        }
        if height.is_none() {
            if let Some(t) = self.mempool.lock().get_transaction_time(&tx.txid) {
                view.block_time = t;
            }
        }
        Ok(view)
    }

    /// Address descriptor and value of input `i`: from the index, else from
    /// the previous tx, else whatever the parser can tell from the input.
    async fn resolve_input(&self, tx: &Tx, i: usize) -> Result<(AddrDesc, Option<Amount>), ApiError> {
        let v = &tx.vin[i];
        if let Some(prev) = self.ix.get_tx_addresses(&v.txid)? {
            return Ok(prev
                .outputs
                .get(v.vout as usize)
                .map(|o| (o.addr_desc.clone(), Some(o.value)))
                .unwrap_or_default());
        }
        match self.load_tx(&v.txid).await {
            Ok((prev, prev_height)) => {
                // A parent confirmed one block ago may not be indexed yet.
                if tx.confirmations > 1 && prev_height.is_some() {
                    warn!(txid = %tx.txid, prev = %v.txid, confirmations = tx.confirmations, "input tx not found in txAddresses");
                }
                Ok(prev
                    .vout
                    .get(v.vout as usize)
                    .map(|o| (self.ix.parser().get_addr_desc_from_vout(o).unwrap_or_default(), Some(o.value_sat)))
                    .unwrap_or_default())
            }
            Err(ApiError::NotFound(_)) => Ok((self.ix.parser().addr_desc_for_unknown_input(tx, i), None)),
            Err(e) => Err(e),
        }
    }

    /// Find the confirmed tx spending `out` of `txid` by scanning the inputs
    /// of the output address's history from the output's height on. Value
    /// matches are verified one height at a time; the scan ends at the first
    /// verified spender.
    async fn set_spending_tx(&self, out: &mut TxVout, ad: &AddrDesc, txid: &str, height: u32) -> Result<(), ApiError> {
        if ad.is_empty() {
            return Ok(());
        }
        let mut lower = height;
        loop {
            let (candidates, at) = self.spending_candidates(ad, lower, out.value)?;
            let Some(at) = at else {
                return Ok(());
            };
            for (candidate, input) in candidates {
                match self.txcache.get_transaction(&candidate).await {
                    Ok((stx, sh)) => {
                        if stx.vin.get(input).is_some_and(|v| v.txid == txid && v.vout == out.n) {
                            out.spent_txid = Some(candidate);
                            out.spent_index = Some(input as u32);
                            out.spent_height = sh;
                            return Ok(());
                        }
                    }
                    Err(e) => warn!(txid = %candidate, error = %e, "spending tx candidate not loadable"),
                }
            }
            match at.checked_add(1) {
                Some(next) => lower = next,
                None => return Ok(()),
            }
        }
    }

    /// Inputs of `ad`'s history spending exactly `value`, taken from the
    /// first height at or above `lower` that has any. Returns that height.
    fn spending_candidates(
        &self,
        ad: &AddrDesc,
        lower: u32,
        value: Amount,
    ) -> Result<(Vec<(String, usize)>, Option<u32>), ApiError> {
        let mut candidates: Vec<(String, usize)> = Vec::new();
        let mut found_at: Option<u32> = None;
        self.ix.get_addr_desc_transactions(ad, lower, u32::MAX, |t, h, indexes| {
            if found_at.is_some_and(|at| h > at) {
                return Ok(IterControl::Stop);
            }
            if !indexes.iter().any(|i| *i < 0) {
                return Ok(IterControl::Continue);
            }
            let Some(ta) = self.ix.get_tx_addresses(t)? else {
                warn!(txid = t, "tx not found in txAddresses");
                return Ok(IterControl::Continue);
            };
            for input in indexes.iter().filter(|i| **i < 0).map(|i| !*i as usize) {
                if ta.inputs.get(input).is_some_and(|i| i.value == value) {
                    candidates.push((t.to_string(), input));
                    found_at = Some(h);
                }
            }
            Ok(IterControl::Continue)
        })?;
        Ok((candidates, found_at))
    }

    async fn token_transfers(&self, tx: &Tx) -> Vec<TokenTransferView> {
        let Some(eth) = &tx.eth else {
            return Vec::new();
        };
        let mut out = Vec::with_capacity(eth.token_transfers.len());
        for t in &eth.token_transfers {
            let ci = self.contract_info(&t.contract).await;
            out.push(TokenTransferView {
                standard: t.standard,
                contract: t.contract.clone(),
                from: t.from.clone(),
                to: t.to.clone(),
                name: ci.as_ref().map(|c| c.name.clone()).unwrap_or_default(),
                symbol: ci.as_ref().map(|c| c.symbol.clone()).unwrap_or_default(),
                decimals: ci.as_ref().map_or(18, |c| c.decimals),
                value: t.value,
                token_id: t.token_id,
            });
        }
        out
    }

    fn ethereum_specific(&self, tx: &Tx, confirmed: bool) -> Result<EthereumSpecific, ApiError> {
        let eth = tx.eth.clone().unwrap_or_default();
        let (transfers, error) = if !eth.internal_transfers.is_empty() || eth.internal_error.is_some() || !confirmed {
            (eth.internal_transfers, eth.internal_error)
        } else {
            match self.ix.get_internal_data(&tx.txid)? {
                Some(d) => (d.transfers, d.error),
                None => (Vec::new(), None),
            }
        };
        Ok(EthereumSpecific {
            status: eth_status_code(eth.status),
            nonce: eth.nonce,
            gas_limit: eth.gas_limit,
            gas_used: eth.gas_used,
            gas_price: eth.gas_price,
            data: eth.data,
            internal_transfers: transfers
                .into_iter()
                .map(|t| InternalTransferView { from: t.from, to: t.to, value: t.value })
                .collect(),
            error,
        })
    }

    /// Confirmed script-chain tx rebuilt from its `txAddresses` row alone.
    pub(crate) fn light_tx(&self, txid: &str, ta: &TxAddresses, block: Option<&BlockInfo>, best: u32) -> TxView {
        let vin: Vec<TxVin> = ta
            .inputs
            .iter()
            .enumerate()
            .map(|(n, i)| {
                let (addresses, is_address) = self.addresses_of(&i.addr_desc);
                TxVin { n: n as u32, addresses, is_address, value: Some(i.value), ..Default::default() }
            })
            .collect();
        let vout: Vec<TxVout> = ta
            .outputs
            .iter()
            .enumerate()
            .map(|(n, o)| {
                let (addresses, is_address) = self.addresses_of(&o.addr_desc);
                TxVout { value: o.value, n: n as u32, spent: o.spent, addresses, is_address, ..Default::default() }
            })
            .collect();
        let value_out = ta.outputs.iter().fold(0, |a: Amount, o| a.saturating_add(o.value));
        let value_in = ta.inputs.iter().fold(0, |a: Amount, i| a.saturating_add(i.value));
        let coinbase = ta.looks_like_coinbase();
        TxView {
            txid: txid.to_string(),
            vin,
            vout,
            block_hash: block.map(|b| b.hash.clone()),
            block_height: ta.height as i64,
            confirmations: (best + 1).saturating_sub(ta.height),
            block_time: block.map_or(0, |b| b.time),
            value: value_out,
            value_in: (!coinbase).then_some(value_in),
            fees: if coinbase { 0 } else { value_in.saturating_sub(value_out) },
            ..Default::default()
        }
    }

    // --- Blocks ---

    async fn resolve_block(&self, id: &str) -> Result<BlockInfo, ApiError> {
        let not_found = || ApiError::NotFound(format!("block {id}"));
        match BlockId::parse(id) {
            BlockId::Height(h) => self.ix.get_block_info(h)?.ok_or_else(not_found),
            BlockId::Hash(hash) => {
                let header = match self.call(self.backend.get_block_header(&hash)).await {
                    Ok(h) => h,
                    Err(BackendError::NotFound(_)) => return Err(not_found()),
                    Err(e) => return Err(e.into()),
                };
                match self.ix.get_block_info(header.height)? {
                    Some(info) if info.hash == hash => Ok(info),
                    _ => Err(not_found()),
                }
            }
        }
    }

    /// Block by height or hash with one page of its transactions.
    pub async fn get_block(&self, id: &str, page: i64, items: i64) -> Result<BlockView, ApiError> {
        let info = self.resolve_block(id).await?;
        let height = info.height;
        let txids = self.ix.get_block_txids(height)?;
        let best = self.best_height();
        let slice = compute_paging(txids.len(), zero_based(page), items);
        let mut txs = Vec::with_capacity(slice.to - slice.from);
        for txid in &txids[slice.from..slice.to] {
            match self.chain {
                ChainType::Bitcoin => match self.ix.get_tx_addresses(txid)? {
                    Some(ta) => txs.push(self.light_tx(txid, &ta, Some(&info), best)),
                    None => warn!(%txid, height, "tx not found in txAddresses"),
                },
                ChainType::Ethereum => txs.push(self.get_transaction(txid, false, false).await?),
            }
        }
        Ok(BlockView {
            paging: slice.paging,
            previous_block_hash: match height.checked_sub(1) {
                Some(h) => self.ix.get_block_hash(h)?,
                None => None,
            },
            next_block_hash: self.ix.get_block_hash(height + 1)?,
            hash: info.hash,
            height,
            confirmations: (best + 1).saturating_sub(height),
            size: info.size,
            time: info.time,
            tx_count: info.txs,
            txs,
        })
    }

    /// Indexed blocks, newest first.
    pub fn get_blocks(&self, page: i64, items: i64) -> Result<BlocksView, ApiError> {
        let Some((best, _)) = self.ix.get_best_block()? else {
            return Ok(BlocksView { paging: compute_paging(0, 0, items).paging, blocks: Vec::new() });
        };
        let slice = compute_paging(best as usize + 1, zero_based(page), items);
        let mut blocks = Vec::with_capacity(slice.to - slice.from);
        for i in slice.from..slice.to {
            if let Some(bi) = self.ix.get_block_info(best - i as u32)? {
                blocks.push(bi);
            }
        }
        Ok(BlocksView { paging: slice.paging, blocks })
    }

    /// Hex Golomb filter of a block; `None` if the block touched no filtered descriptor.
    pub async fn get_block_filter(&self, id: &str) -> Result<Option<String>, ApiError> {
        if self.ix.block_filter_params().is_none() {
            return Err(ApiError::Unsupported("block filters are disabled".into()));
        }
        let info = self.resolve_block(id).await?;
        Ok(self.ix.get_block_filter(info.height)?.map(hex::encode))
    }

    /// Filters of mempool transactions first seen at or after `from_time`.
    /// `scripts` must name the configured filter script type.
    pub fn get_mempool_filters(&self, scripts: &str, from_time: i64) -> Result<MempoolFilters, ApiError> {
        let Some(params) = self.ix.block_filter_params() else {
            return Err(ApiError::Unsupported("block filters are disabled".into()));
        };
        if scripts.parse::<FilterScripts>().ok() != Some(params.scripts) {
            return Err(ApiError::InvalidInput(format!(
                "filter scripts {scripts:?} not indexed, configured {:?}",
                params.scripts.as_str()
            )));
        }
        let entries = self.mempool.lock().get_txid_filter_entries(from_time);
        Ok(MempoolFilters {
            p: params.p,
            scripts: params.scripts.to_string(),
            zeroed_key: params.use_zeroed_key,
            entries,
        })
    }

    pub fn get_system_info(&self) -> SystemInfo {
        let state = self.ix.state();
        let (chain, error) = state.backend_info();
        SystemInfo { blockdex: state.snapshot(), backend: BackendInfo { chain, error } }
    }

    // --- Fees ---

    pub async fn get_fee_stats(&self, id: &str) -> Result<FeeStats, ApiError> {
        if self.chain != ChainType::Bitcoin {
            return Err(ApiError::Unsupported("fee stats".into()));
        }
        let info = self.resolve_block(id).await?;
        let mut fees = Vec::new();
        for txid in self.ix.get_block_txids(info.height)? {
            let Some(ta) = self.ix.get_tx_addresses(&txid)? else {
                warn!(%txid, height = info.height, "tx not found in txAddresses");
                continue;
            };
            if ta.looks_like_coinbase() {
                continue;
            }
            let value_in = ta.inputs.iter().fold(0, |a: Amount, i| a.saturating_add(i.value));
            let value_out = ta.outputs.iter().fold(0, |a: Amount, o| a.saturating_add(o.value));
            let (tx, _) = self.txcache.get_transaction(&txid).await?;
            fees.push((value_in.saturating_sub(value_out), tx.fee_size()));
        }
        Ok(fee_stats(&fees))
    }

    /// `estimate_smart_fee` through the short-lived cache.
    pub async fn estimate_smart_fee(&self, blocks: u32, conservative: bool) -> Result<Amount, ApiError> {
        Ok(self.call(self.fee_cache.estimate_smart_fee(self.backend.as_ref(), blocks, conservative)).await?)
    }

    pub async fn estimate_fee(&self, blocks: u32) -> Result<Amount, ApiError> {
        Ok(self.call(self.backend.estimate_fee(blocks)).await?)
    }

    pub async fn send_transaction(&self, hex: &str) -> Result<String, ApiError> {
        let hex = hex.trim();
        if hex.is_empty() {
            return Err(ApiError::InvalidInput("missing tx blob".into()));
        }
        Ok(self.call(self.backend.send_raw_transaction(hex)).await?)
    }

    // --- Fiat rates ---

    fn single_currency(currencies: &[String]) -> &str {
        match currencies {
            [c] => c.as_str(),
            _ => "",
        }
    }

    pub fn get_current_fiat_rates(&self, currencies: &[String]) -> Result<FiatRatesView, ApiError> {
        let t = self
            .ix
            .find_last_ticker(Self::single_currency(currencies))?
            .ok_or_else(|| ApiError::NotFound("no fiat rates available".into()))?;
        Ok(FiatRatesView { ts: t.timestamp, rates: t.select(currencies) })
    }

    /// Rates at or after each timestamp; unknown rates are `-1`.
    pub fn get_fiat_rates_for_timestamps(
        &self,
        timestamps: &[i64],
        currencies: &[String],
    ) -> Result<Vec<FiatRatesView>, ApiError> {
        if timestamps.is_empty() {
            return Err(ApiError::InvalidInput("no timestamps".into()));
        }
        let currency = Self::single_currency(currencies);
        let mut out = Vec::with_capacity(timestamps.len());
        for &ts in timestamps {
            out.push(match self.ix.find_ticker(ts, currency)? {
                Some(t) => FiatRatesView { ts: t.timestamp, rates: t.select(currencies) },
                None => FiatRatesView { ts, rates: currencies.iter().map(|c| (c.clone(), -1.0)).collect() },
            });
        }
        Ok(out)
    }

    pub fn get_fiat_rates_tickers_list(&self, ts: i64) -> Result<TickersList, ApiError> {
        let t = self
            .ix
            .find_ticker(ts, "")?
            .ok_or_else(|| ApiError::NotFound(format!("no tickers at or after {ts}")))?;
        Ok(TickersList { ts: t.timestamp, available_currencies: t.rates.into_keys().collect() })
    }
}
