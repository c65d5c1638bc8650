//! Account-model connect and disconnect.
//!
//! Every address mutation of a transaction is recorded in `block_txs` as an
//! [`EthAddrRef`], so disconnect replays the list backwards instead of
//! re-deriving it from the chain.

use std::collections::{HashMap, HashSet};

use tracing::{debug, warn};

use blockdex_core::error::{BlockdexError, DbError};
use blockdex_core::types::{AddrDesc, Amount, Block, ContractInfo, InternalTransfer, TokenStandard, Tx};

use crate::index::{AddressRows, ColumnDeltas, Indexer};
use crate::schema::{
    add_tx_index, pack_address_key, pack_eth_block_txs, pack_height_key, unpack_eth_block_txs,
    AddrContracts, EthAddrRef, EthBlockTx, EthRefKind,
};
use crate::store::{Column, IterFrom, StoreBatch};

/// Internal transfers of a transaction and the trace error, if any.
#[derive(Clone, Debug, Default, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct InternalData {
    pub transfers: Vec<InternalTransfer>,
    pub error: Option<String>,
}

/// A block whose internal data could not be fetched.
#[derive(Clone, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct BlockInternalDataError {
    pub hash: String,
    pub retries: u32,
    pub error: String,
}

fn encode<T: bincode::Encode>(v: &T) -> Result<Vec<u8>, BlockdexError> {
    bincode::encode_to_vec(v, bincode::config::standard()).map_err(|e| BlockdexError::Codec(e.to_string()))
}

fn decode<T: bincode::Decode<()>>(buf: &[u8]) -> Result<T, BlockdexError> {
    bincode::decode_from_slice(buf, bincode::config::standard())
        .map(|(v, _)| v)
        .map_err(|e| BlockdexError::Codec(e.to_string()))
}

/// Per-tx dedup of counters that increase once per (address, tx).
#[derive(Default)]
struct TxSeen {
    total: HashSet<AddrDesc>,
    native: HashSet<AddrDesc>,
    internal: HashSet<AddrDesc>,
    contract: HashSet<(AddrDesc, usize)>,
}

fn token_amount(standard: TokenStandard, value: Amount) -> Amount {
    match standard {
        TokenStandard::Erc721 => 1,
        _ => value,
    }
}

impl Indexer {
    fn eth_addr_desc(&self, tx: &Tx, address: &str) -> Option<AddrDesc> {
        if address.is_empty() {
            return None;
        }
        match self.parser.get_addr_desc_from_address(address) {
            Ok(ad) => Some(ad),
            Err(e) => {
                debug!(txid = %tx.txid, address, error = %e, "cannot get address descriptor");
                None
            }
        }
    }

    /// Address mutations of one transaction. Indexes carry only the direction
    /// (`0` receiving, `!0` sending) until the refs are applied.
    fn eth_tx_refs(&self, tx: &Tx) -> Vec<EthAddrRef> {
        let mut refs = Vec::new();
        let value = tx.vout.first().map(|v| v.value_sat).unwrap_or(0);
        let to = tx.vout.first().and_then(|v| v.addresses.first());
        let from = tx.vin.first().and_then(|v| v.addresses.first());
        if let Some(ad) = to.and_then(|a| self.eth_addr_desc(tx, a)) {
            refs.push(EthAddrRef::new(ad, EthRefKind::Native, 0, value));
        }
        if let Some(ad) = from.and_then(|a| self.eth_addr_desc(tx, a)) {
            refs.push(EthAddrRef::new(ad, EthRefKind::Native, !0, value));
        }
        let Some(eth) = &tx.eth else {
            return refs;
        };
        for it in &eth.internal_transfers {
            if let Some(ad) = self.eth_addr_desc(tx, &it.to) {
                refs.push(EthAddrRef::new(ad, EthRefKind::Internal, 0, it.value));
            }
            if let Some(ad) = self.eth_addr_desc(tx, &it.from) {
                refs.push(EthAddrRef::new(ad, EthRefKind::Internal, !0, it.value));
            }
        }
        for tt in &eth.token_transfers {
            let Some(contract) = self.eth_addr_desc(tx, &tt.contract) else {
                continue;
            };
            let kind = EthRefKind::Token { contract, standard: tt.standard, token_id: tt.token_id };
            if let Some(ad) = self.eth_addr_desc(tx, &tt.to) {
                refs.push(EthAddrRef::new(ad, kind.clone(), 0, tt.value));
            }
            if let Some(ad) = self.eth_addr_desc(tx, &tt.from) {
                refs.push(EthAddrRef::new(ad, kind, !0, tt.value));
            }
        }
        refs
    }

    fn cached_contracts<'c>(
        &self,
        cache: &'c mut HashMap<AddrDesc, AddrContracts>,
        ad: &AddrDesc,
    ) -> Result<&'c mut AddrContracts, BlockdexError> {
        if !cache.contains_key(ad) {
            let ac = self.get_address_contracts(ad)?.unwrap_or_default();
            cache.insert(ad.clone(), ac);
        }
        cache
            .get_mut(ad)
            .ok_or_else(|| BlockdexError::Storage("contracts cache entry vanished".into()))
    }

    /// Apply the refs of one tx, fixing up token indexes to
    /// `contract position + 1`.
    fn apply_eth_refs(
        &self,
        cache: &mut HashMap<AddrDesc, AddrContracts>,
        addresses: &mut AddressRows,
        btxid: &[u8],
        refs: &mut [EthAddrRef],
    ) -> Result<(), BlockdexError> {
        let mut seen = TxSeen::default();
        for r in refs.iter_mut() {
            let incoming = r.is_incoming();
            let ac = self.cached_contracts(cache, &r.addr_desc)?;
            if seen.total.insert(r.addr_desc.clone()) {
                ac.total_txs += 1;
            }
            match &r.kind {
                EthRefKind::Native => {
                    if seen.native.insert(r.addr_desc.clone()) {
                        ac.non_contract_txs += 1;
                    }
                }
                EthRefKind::Internal => {
                    if seen.internal.insert(r.addr_desc.clone()) {
                        ac.internal_txs += 1;
                    }
                }
                EthRefKind::Token { contract, standard, token_id } => {
                    let pos = ac.contract_position(contract, *standard);
                    let c = &mut ac.contracts[pos];
                    if seen.contract.insert((r.addr_desc.clone(), pos)) {
                        c.txs += 1;
                    }
                    let amount = token_amount(*standard, r.value);
                    let applied = match (standard.is_fungible(), *token_id, incoming) {
                        (true, _, true) => {
                            c.value = c.value.saturating_add(amount);
                            amount
                        }
                        (true, _, false) => {
                            let taken = amount.min(c.value);
                            c.value -= taken;
                            taken
                        }
                        (false, Some(id), true) => {
                            c.add_id(id, amount);
                            amount
                        }
                        (false, Some(id), false) => c.sub_id(id, amount),
                        (false, None, _) => 0,
                    };
                    if applied < amount && !incoming {
                        debug!(address = %r.addr_desc, sent = %amount, held = %applied, "token send exceeds holdings");
                    }
                    r.applied = applied;
                    let i = (pos + 1) as i32;
                    r.index = if incoming { i } else { !i };
                }
            }
            add_tx_index(addresses.entry(r.addr_desc.clone()).or_default(), btxid, r.index);
        }
        Ok(())
    }

    fn revert_eth_refs(
        &self,
        cache: &mut HashMap<AddrDesc, AddrContracts>,
        refs: &[EthAddrRef],
    ) -> Result<(), BlockdexError> {
        let mut seen = TxSeen::default();
        for r in refs.iter().rev() {
            let incoming = r.is_incoming();
            let ac = self.cached_contracts(cache, &r.addr_desc)?;
            if seen.total.insert(r.addr_desc.clone()) {
                ac.total_txs = ac.total_txs.saturating_sub(1);
            }
            match &r.kind {
                EthRefKind::Native => {
                    if seen.native.insert(r.addr_desc.clone()) {
                        ac.non_contract_txs = ac.non_contract_txs.saturating_sub(1);
                    }
                }
                EthRefKind::Internal => {
                    if seen.internal.insert(r.addr_desc.clone()) {
                        ac.internal_txs = ac.internal_txs.saturating_sub(1);
                    }
                }
                EthRefKind::Token { standard, token_id, .. } => {
                    let raw = if incoming { r.index } else { !r.index };
                    let Some(c) = (raw as usize).checked_sub(1).and_then(|pos| ac.contracts.get_mut(pos)) else {
                        warn!(address = %r.addr_desc, index = r.index, "contract position out of bounds on disconnect");
                        continue;
                    };
                    let pos = raw as usize - 1;
                    if seen.contract.insert((r.addr_desc.clone(), pos)) {
                        c.txs = c.txs.saturating_sub(1);
                    }
                    match (standard.is_fungible(), *token_id, incoming) {
                        (true, _, true) => c.value = c.value.saturating_sub(r.value),
                        (true, _, false) => c.value = c.value.saturating_add(r.applied),
                        (false, Some(id), true) => {
                            c.sub_id(id, token_amount(*standard, r.value));
                        }
                        (false, Some(id), false) if r.applied > 0 => c.add_id(id, r.applied),
                        (false, _, _) => {}
                    }
                }
            }
        }
        Ok(())
    }

    pub(crate) fn connect_eth_block(
        &self,
        batch: &mut StoreBatch<'_>,
        deltas: &mut ColumnDeltas,
        block: &Block,
        contracts: &[ContractInfo],
    ) -> Result<(), BlockdexError> {
        let height = block.header.height;
        let mut cache: HashMap<AddrDesc, AddrContracts> = HashMap::new();
        let mut addresses = AddressRows::new();
        let mut block_txs = Vec::with_capacity(block.txs.len());
        let mut internal_errors = Vec::new();

        for tx in &block.txs {
            let btxid = self.parser.pack_txid(&tx.txid)?;
            let mut refs = self.eth_tx_refs(tx);
            self.apply_eth_refs(&mut cache, &mut addresses, &btxid, &mut refs)?;
            if let Some(eth) = &tx.eth {
                if !eth.internal_transfers.is_empty() || eth.internal_error.is_some() {
                    let v = encode(&InternalData {
                        transfers: eth.internal_transfers.clone(),
                        error: eth.internal_error.clone(),
                    })?;
                    batch.put(Column::InternalData, &btxid, &v)?;
                    deltas.add(Column::InternalData, btxid.len(), v.len());
                }
                if let Some(e) = &eth.internal_error {
                    internal_errors.push(format!("{}: {e}", tx.txid));
                }
            }
            block_txs.push(EthBlockTx { btxid, refs });
        }

        self.write_block_rows(batch, deltas, block, &addresses, pack_eth_block_txs(&block_txs))?;
        for (ad, ac) in cache {
            if ac.is_empty() {
                batch.delete(Column::AddressContracts, ad.as_bytes())?;
            } else {
                batch.put(Column::AddressContracts, ad.as_bytes(), &ac.pack())?;
            }
        }
        for info in contracts {
            let ad = self.parser.get_addr_desc_from_address(&info.contract)?;
            if self.get_contract_info(&ad)?.is_some() {
                continue;
            }
            let mut info = info.clone();
            if info.created_in_block == 0 {
                info.created_in_block = height;
            }
            self.put_contract_info(batch, &ad, &info)?;
            deltas.add(Column::Contracts, ad.len(), 0);
        }
        if !internal_errors.is_empty() {
            warn!(height, count = internal_errors.len(), "block has internal data errors");
            let v = encode(&BlockInternalDataError {
                hash: block.header.hash.clone(),
                retries: 0,
                error: internal_errors.join("; "),
            })?;
            batch.put(Column::BlockInternalDataErrors, &pack_height_key(height), &v)?;
        }
        Ok(())
    }

    pub(crate) fn disconnect_eth_block(&self, height: u32) -> Result<(), BlockdexError> {
        let key = pack_height_key(height);
        let info_raw = self.store.get(Column::Height, &key)?.ok_or(DbError::MissingBlock(height))?;
        let raw = self.store.get(Column::BlockTxs, &key)?.ok_or(DbError::MissingRollbackData(height))?;
        let txs = unpack_eth_block_txs(&raw, self.txid_len)?;

        let mut cache: HashMap<AddrDesc, AddrContracts> = HashMap::new();
        let mut touched: HashSet<AddrDesc> = HashSet::new();
        let mut token_contracts: HashSet<AddrDesc> = HashSet::new();
        let mut batch = self.store.batch();
        let mut deltas = ColumnDeltas::default();

        for btx in txs.iter().rev() {
            self.revert_eth_refs(&mut cache, &btx.refs)?;
            for r in &btx.refs {
                touched.insert(r.addr_desc.clone());
                if let EthRefKind::Token { contract, .. } = &r.kind {
                    token_contracts.insert(contract.clone());
                }
            }
            batch.delete(Column::InternalData, &btx.btxid)?;
            batch.delete(Column::Transactions, &btx.btxid)?;
        }

        for ad in &touched {
            let k = pack_address_key(ad.as_bytes(), height);
            batch.delete(Column::Addresses, &k)?;
            deltas.remove(Column::Addresses, k.len(), 0);
        }
        for (ad, mut ac) in cache {
            ac.pop_unused_contracts();
            if ac.is_empty() {
                batch.delete(Column::AddressContracts, ad.as_bytes())?;
            } else {
                batch.put(Column::AddressContracts, ad.as_bytes(), &ac.pack())?;
            }
        }
        for contract in &token_contracts {
            if self.get_contract_info(contract)?.is_some_and(|c| c.created_in_block == height) {
                batch.delete(Column::Contracts, contract.as_bytes())?;
                deltas.remove(Column::Contracts, contract.len(), 0);
            }
        }
        batch.delete(Column::BlockInternalDataErrors, &key)?;
        batch.delete(Column::Height, &key)?;
        deltas.remove(Column::Height, key.len(), info_raw.len());
        batch.delete(Column::BlockTxs, &key)?;
        deltas.remove(Column::BlockTxs, key.len(), raw.len());

        self.store.write(batch)?;
        deltas.apply(&self.state);
        debug!(height, txs = txs.len(), "disconnected block");
        Ok(())
    }

    // --- Internal data ---

    pub fn get_internal_data(&self, txid: &str) -> Result<Option<InternalData>, BlockdexError> {
        let btxid = self.parser.pack_txid(txid)?;
        match self.store.get(Column::InternalData, &btxid)? {
            Some(v) => Ok(Some(decode(&v)?)),
            None => Ok(None),
        }
    }

    /// Blocks whose internal data failed, ascending by height.
    pub fn get_block_internal_data_errors(&self) -> Result<Vec<(u32, BlockInternalDataError)>, BlockdexError> {
        let mut out = Vec::new();
        for item in self.store.iter(Column::BlockInternalDataErrors, IterFrom::Start)? {
            let (k, v) = item?;
            out.push((blockdex_core::pack::unpack_u32_be(&k)?, decode(&v)?));
        }
        Ok(out)
    }

    /// Rewrite the internal data of a refetched block. The error row is
    /// removed if every tx now has clean data, otherwise its retry count is
    /// bumped. Returns whether errors remain.
    pub fn update_block_internal_data(&self, block: &Block, retries: u32) -> Result<bool, BlockdexError> {
        let _guard = self.write_lock.lock();
        let height = block.header.height;
        let mut batch = self.store.batch();
        let mut errors = Vec::new();
        for tx in &block.txs {
            let Some(eth) = &tx.eth else { continue };
            let btxid = self.parser.pack_txid(&tx.txid)?;
            if eth.internal_transfers.is_empty() && eth.internal_error.is_none() {
                batch.delete(Column::InternalData, &btxid)?;
                continue;
            }
            let v = encode(&InternalData {
                transfers: eth.internal_transfers.clone(),
                error: eth.internal_error.clone(),
            })?;
            batch.put(Column::InternalData, &btxid, &v)?;
            if let Some(e) = &eth.internal_error {
                errors.push(format!("{}: {e}", tx.txid));
            }
        }
        let key = pack_height_key(height);
        if errors.is_empty() {
            batch.delete(Column::BlockInternalDataErrors, &key)?;
        } else {
            let v = encode(&BlockInternalDataError {
                hash: block.header.hash.clone(),
                retries,
                error: errors.join("; "),
            })?;
            batch.put(Column::BlockInternalDataErrors, &key, &v)?;
        }
        self.store.write(batch)?;
        Ok(!errors.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::IterControl;
    use crate::testutil::{block, eth_tx, temp_indexer_for, txid};
    use blockdex_core::types::{ChainType, EthereumTxData, InternalTransferKind, TokenTransfer};

    fn ad(s: &str) -> AddrDesc {
        AddrDesc::new(s.as_bytes())
    }

    fn erc20(contract: &str, from: &str, to: &str, value: Amount) -> TokenTransfer {
        TokenTransfer {
            standard: TokenStandard::Erc20,
            contract: contract.into(),
            from: from.into(),
            to: to.into(),
            value,
            token_id: None,
        }
    }

    fn token_info(contract: &str) -> ContractInfo {
        ContractInfo {
            contract: contract.into(),
            standard: TokenStandard::Erc20,
            name: "T".into(),
            symbol: "T".into(),
            decimals: 6,
            created_in_block: 0,
            destructed_in_block: 0,
            nft: vec![],
        }
    }

    #[test]
    fn native_transfer_counts_both_parties() {
        let (ix, _dir) = temp_indexer_for(ChainType::Ethereum);
        ix.connect_block(&block(0, vec![eth_tx(1, "alice", "bob", 5, EthereumTxData::default())])).unwrap();
        let alice = ix.get_address_contracts(&ad("alice")).unwrap().unwrap();
        assert_eq!((alice.total_txs, alice.non_contract_txs), (1, 1));
        let mut idx = Vec::new();
        ix.get_addr_desc_transactions(&ad("alice"), 0, u32::MAX, |_, _, i| {
            idx.extend_from_slice(i);
            Ok(IterControl::Continue)
        })
        .unwrap();
        assert_eq!(idx, vec![!0]);
    }

    #[test]
    fn token_transfer_uses_contract_position() {
        let (ix, _dir) = temp_indexer_for(ChainType::Ethereum);
        let eth = EthereumTxData {
            token_transfers: vec![erc20("usdt", "alice", "bob", 100), erc20("dai", "alice", "bob", 7)],
            ..Default::default()
        };
        ix.connect_block_with_contracts(&block(0, vec![eth_tx(1, "alice", "usdt", 0, eth)]), &[token_info("usdt")])
            .unwrap();

        let bob = ix.get_address_contracts(&ad("bob")).unwrap().unwrap();
        assert_eq!(bob.total_txs, 1);
        assert_eq!(bob.non_contract_txs, 0);
        assert_eq!(bob.contracts.len(), 2);
        assert_eq!(bob.contracts[0].value, 100);
        assert_eq!(bob.contracts[1].value, 7);

        let mut bob_idx = Vec::new();
        ix.get_addr_desc_transactions(&ad("bob"), 0, 0, |t, _, i| {
            assert_eq!(t, format!("0x{}", txid(1)));
            bob_idx.extend_from_slice(i);
            Ok(IterControl::Continue)
        })
        .unwrap();
        assert_eq!(bob_idx, vec![1, 2]);

        let alice = ix.get_address_contracts(&ad("alice")).unwrap().unwrap();
        assert_eq!(alice.total_txs, 1);
        assert_eq!(alice.non_contract_txs, 1);
        assert_eq!(ix.get_contract_info(&ad("usdt")).unwrap().unwrap().created_in_block, 0);
    }

    #[test]
    fn nft_ids_follow_owner() {
        let (ix, _dir) = temp_indexer_for(ChainType::Ethereum);
        let nft = |from: &str, to: &str| TokenTransfer {
            standard: TokenStandard::Erc721,
            contract: "punks".into(),
            from: from.into(),
            to: to.into(),
            value: 0,
            token_id: Some(42),
        };
        ix.connect_block(&block(0, vec![eth_tx(1, "minter", "punks", 0, EthereumTxData {
            token_transfers: vec![nft("minter", "alice")],
            ..Default::default()
        })]))
        .unwrap();
        ix.connect_block(&block(1, vec![eth_tx(2, "alice", "punks", 0, EthereumTxData {
            token_transfers: vec![nft("alice", "bob")],
            ..Default::default()
        })]))
        .unwrap();
        let alice = ix.get_address_contracts(&ad("alice")).unwrap().unwrap();
        assert!(alice.contracts[0].ids.is_empty());
        assert_eq!(alice.contracts[0].txs, 2);
        let bob = ix.get_address_contracts(&ad("bob")).unwrap().unwrap();
        assert_eq!(bob.contracts[0].ids, vec![(42, 1)]);
    }

    #[test]
    fn disconnect_is_exact_inverse() {
        let (ix, _dir) = temp_indexer_for(ChainType::Ethereum);
        ix.connect_block(&block(0, vec![eth_tx(1, "alice", "bob", 5, EthereumTxData::default())])).unwrap();
        let before = ix.store().dump_index().unwrap();

        let eth = EthereumTxData {
            token_transfers: vec![erc20("usdt", "alice", "bob", 100)],
            internal_transfers: vec![InternalTransfer {
                kind: InternalTransferKind::Call,
                from: "usdt".into(),
                to: "carol".into(),
                value: 3,
            }],
            ..Default::default()
        };
        ix.connect_block_with_contracts(&block(1, vec![
            eth_tx(2, "alice", "usdt", 0, eth),
            eth_tx(3, "bob", "alice", 1, EthereumTxData::default()),
        ]), &[token_info("usdt")])
        .unwrap();
        assert_eq!(ix.get_address_contracts(&ad("carol")).unwrap().unwrap().internal_txs, 1);
        assert!(ix.get_internal_data(&txid(2)).unwrap().is_some());

        ix.disconnect_block_range(1, 1).unwrap();
        assert_eq!(ix.store().dump_index().unwrap(), before);
    }

    #[test]
    fn disconnect_restores_only_what_a_send_took() {
        let (ix, _dir) = temp_indexer_for(ChainType::Ethereum);
        let funding = EthereumTxData { token_transfers: vec![erc20("usdt", "bob", "alice", 30)], ..Default::default() };
        ix.connect_block_with_contracts(&block(0, vec![eth_tx(1, "bob", "usdt", 0, funding)]), &[token_info("usdt")])
            .unwrap();
        let before = ix.store().dump_index().unwrap();

        let overspend = EthereumTxData {
            token_transfers: vec![
                erc20("usdt", "alice", "carol", 100),
                TokenTransfer {
                    standard: TokenStandard::Erc721,
                    contract: "punks".into(),
                    from: "alice".into(),
                    to: "carol".into(),
                    value: 0,
                    token_id: Some(7),
                },
            ],
            ..Default::default()
        };
        ix.connect_block(&block(1, vec![eth_tx(2, "alice", "usdt", 0, overspend)])).unwrap();
        let alice = ix.get_address_contracts(&ad("alice")).unwrap().unwrap();
        assert_eq!(alice.contracts[0].value, 0);
        assert!(alice.contracts.iter().all(|c| c.ids.is_empty()));

        ix.disconnect_block_range(1, 1).unwrap();
        assert_eq!(ix.store().dump_index().unwrap(), before);
        let alice = ix.get_address_contracts(&ad("alice")).unwrap().unwrap();
        assert_eq!(alice.contracts[0].value, 30);
    }

    #[test]
    fn internal_data_errors_are_recorded_and_cleared() {
        let (ix, _dir) = temp_indexer_for(ChainType::Ethereum);
        let failing = EthereumTxData { internal_error: Some("trace timeout".into()), ..Default::default() };
        let b = block(0, vec![eth_tx(1, "alice", "bob", 1, failing)]);
        ix.connect_block(&b).unwrap();
        let errors = ix.get_block_internal_data_errors().unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].0, 0);
        assert!(errors[0].1.error.contains("trace timeout"));

        let fixed = block(0, vec![eth_tx(1, "alice", "bob", 1, EthereumTxData::default())]);
        assert!(!ix.update_block_internal_data(&fixed, 1).unwrap());
        assert!(ix.get_block_internal_data_errors().unwrap().is_empty());
        assert!(ix.get_internal_data(&txid(1)).unwrap().is_none());
    }
}
