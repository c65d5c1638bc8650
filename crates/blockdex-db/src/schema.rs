//! Key schema and packed record formats.
//!
//! | Column             | Key                    | Value                          |
//! |--------------------|------------------------|--------------------------------|
//! | `height`           | height `u32` BE        | [`BlockInfo`]                  |
//! | `block_txs`        | height `u32` BE        | [`BlockTx`] / [`EthBlockTx`]   |
//! | `addresses`        | AD ‖ height `u32` BE   | [`TxIndexes`] list             |
//! | `txAddresses`      | packed txid            | [`TxAddresses`]                |
//! | `addressBalance`   | AD                     | [`AddrBalance`]                |
//! | `addressContracts` | AD                     | [`AddrContracts`]              |
//!
//! Integers are varints, amounts are length-prefixed big-endian (see
//! [`blockdex_core::pack`]). Index values use the sign convention of the
//! address index: `i >= 0` is output `i`, `!i` is input `i`.

use blockdex_core::error::BlockdexError;
use blockdex_core::pack::{
    pack_bigint, pack_u32_be, pack_varint, pack_varint32, pack_varuint, Reader,
};
use blockdex_core::types::{AddrDesc, Amount, BlockInfo, TokenStandard};

/// Descriptors longer than this are not indexed.
pub const MAX_ADDR_DESC_LEN: usize = 1024;

fn corrupted(column: &'static str, reason: impl Into<String>) -> BlockdexError {
    blockdex_core::error::DbError::Corrupted { column, reason: reason.into() }.into()
}

// ------------------------------------------------------------------
// Keys
// ------------------------------------------------------------------

pub fn pack_height_key(height: u32) -> [u8; 4] {
    pack_u32_be(height)
}

pub fn pack_address_key(ad: &[u8], height: u32) -> Vec<u8> {
    let mut key = Vec::with_capacity(ad.len() + 4);
    key.extend_from_slice(ad);
    key.extend_from_slice(&pack_u32_be(height));
    key
}

/// Split an address key into descriptor and height.
pub fn unpack_address_key(key: &[u8]) -> Result<(&[u8], u32), BlockdexError> {
    if key.len() < 4 {
        return Err(corrupted("addresses", "key shorter than height"));
    }
    let (ad, h) = key.split_at(key.len() - 4);
    Ok((ad, blockdex_core::pack::unpack_u32_be(h)?))
}

// ------------------------------------------------------------------
// Block hash and block info
// ------------------------------------------------------------------

/// Block hashes are stored as raw bytes with a flag for a `0x` prefix.
pub fn pack_block_hash(hash: &str, buf: &mut Vec<u8>) -> Result<(), BlockdexError> {
    let (prefixed, body) = match hash.strip_prefix("0x") {
        Some(b) => (1u8, b),
        None => (0u8, hash),
    };
    let bytes = hex::decode(body).map_err(|_| BlockdexError::Codec(format!("invalid block hash {hash}")))?;
    buf.push(prefixed);
    pack_varuint(bytes.len() as u64, buf);
    buf.extend_from_slice(&bytes);
    Ok(())
}

pub fn unpack_block_hash(r: &mut Reader<'_>) -> Result<String, BlockdexError> {
    let prefixed = r.bytes(1)?[0] == 1;
    let len = r.varuint()? as usize;
    let body = hex::encode(r.bytes(len)?);
    Ok(if prefixed { format!("0x{body}") } else { body })
}

pub fn pack_block_info(info: &BlockInfo) -> Result<Vec<u8>, BlockdexError> {
    let mut buf = Vec::with_capacity(48);
    pack_block_hash(&info.hash, &mut buf)?;
    pack_varint(info.time, &mut buf);
    pack_varuint(info.txs as u64, &mut buf);
    pack_varuint(info.size as u64, &mut buf);
    Ok(buf)
}

pub fn unpack_block_info(buf: &[u8], height: u32) -> Result<BlockInfo, BlockdexError> {
    let mut r = Reader::new(buf);
    Ok(BlockInfo {
        hash: unpack_block_hash(&mut r)?,
        time: r.varint()?,
        txs: r.varuint32()?,
        size: r.varuint32()?,
        height,
    })
}

// ------------------------------------------------------------------
// Address index values
// ------------------------------------------------------------------

/// All occurrences of one address in one transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxIndexes {
    pub btxid: Vec<u8>,
    pub indexes: Vec<i32>,
}

/// Each index is packed as `index << 1 | last` so groups need no count.
pub fn pack_tx_indexes(groups: &[TxIndexes]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(groups.len() * 36);
    for g in groups {
        buf.extend_from_slice(&g.btxid);
        for (i, index) in g.indexes.iter().enumerate() {
            let mut v = index.wrapping_shl(1);
            if i + 1 == g.indexes.len() {
                v |= 1;
            }
            pack_varint32(v, &mut buf);
        }
    }
    buf
}

pub fn unpack_tx_indexes(buf: &[u8], txid_len: usize) -> Result<Vec<TxIndexes>, BlockdexError> {
    let mut r = Reader::new(buf);
    let mut out = Vec::new();
    while !r.is_empty() {
        let btxid = r.bytes(txid_len)?.to_vec();
        let mut indexes = Vec::with_capacity(1);
        loop {
            let v = r.varint32()?;
            indexes.push(v >> 1);
            if v & 1 == 1 {
                break;
            }
            if r.is_empty() {
                return Err(corrupted("addresses", "unterminated index group"));
            }
        }
        out.push(TxIndexes { btxid, indexes });
    }
    Ok(out)
}

/// Add an occurrence to a per-block address map entry. Returns `true` if the
/// transaction was already recorded for this address.
pub fn add_tx_index(groups: &mut Vec<TxIndexes>, btxid: &[u8], index: i32) -> bool {
    if let Some(g) = groups.iter_mut().rev().find(|g| g.btxid == btxid) {
        g.indexes.push(index);
        return true;
    }
    groups.push(TxIndexes { btxid: btxid.to_vec(), indexes: vec![index] });
    false
}

// ------------------------------------------------------------------
// TxAddresses
// ------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxInput {
    pub addr_desc: AddrDesc,
    pub value: Amount,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxOutput {
    pub addr_desc: AddrDesc,
    pub spent: bool,
    pub value: Amount,
}

/// Per confirmed transaction: height and the address/value of every input and output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxAddresses {
    pub height: u32,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
}

impl TxAddresses {
    pub fn pack(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8 + (self.inputs.len() + self.outputs.len()) * 32);
        pack_varuint(self.height as u64, &mut buf);
        pack_varuint(self.inputs.len() as u64, &mut buf);
        for i in &self.inputs {
            pack_varint(i.addr_desc.len() as i64, &mut buf);
            buf.extend_from_slice(i.addr_desc.as_bytes());
            pack_bigint(i.value, &mut buf);
        }
        pack_varuint(self.outputs.len() as u64, &mut buf);
        for o in &self.outputs {
            let len = o.addr_desc.len() as i64;
            pack_varint(if o.spent { !len } else { len }, &mut buf);
            buf.extend_from_slice(o.addr_desc.as_bytes());
            pack_bigint(o.value, &mut buf);
        }
        buf
    }

    pub fn unpack(buf: &[u8]) -> Result<Self, BlockdexError> {
        let mut r = Reader::new(buf);
        let height = r.varuint32()?;
        let n_in = r.varuint()? as usize;
        let mut inputs = Vec::with_capacity(n_in.min(4096));
        for _ in 0..n_in {
            let len = r.varint()?;
            if len < 0 {
                return Err(corrupted("txAddresses", "spent flag on input"));
            }
            let addr_desc = AddrDesc::from(r.bytes(len as usize)?);
            inputs.push(TxInput { addr_desc, value: r.bigint()? });
        }
        let n_out = r.varuint()? as usize;
        let mut outputs = Vec::with_capacity(n_out.min(4096));
        for _ in 0..n_out {
            let raw = r.varint()?;
            let (spent, len) = if raw < 0 { (true, !raw) } else { (false, raw) };
            let addr_desc = AddrDesc::from(r.bytes(len as usize)?);
            outputs.push(TxOutput { addr_desc, spent, value: r.bigint()? });
        }
        Ok(Self { height, inputs, outputs })
    }

    /// Coinbase transactions have one input with no address and zero value.
    pub fn looks_like_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].addr_desc.is_empty() && self.inputs[0].value == 0
    }

    pub fn all_outputs_spent(&self) -> bool {
        self.outputs.iter().all(|o| o.spent || o.addr_desc.is_empty())
    }
}

// ------------------------------------------------------------------
// AddrBalance
// ------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Utxo {
    pub btxid: Vec<u8>,
    pub vout: u32,
    pub height: u32,
    pub value: Amount,
}

impl Utxo {
    fn sort_key(&self) -> (u32, &[u8], u32) {
        (self.height, &self.btxid, self.vout)
    }
}

/// Whether to decode the UTXO list of a balance record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BalanceDetail {
    NoUtxo,
    Utxo,
}

/// Per-address aggregate. `received` is derived as `balance + sent`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddrBalance {
    pub txs: u32,
    pub sent: Amount,
    pub balance: Amount,
    /// Ascending by `(height, btxid, vout)`.
    pub utxos: Vec<Utxo>,
}

impl AddrBalance {
    pub fn received(&self) -> Amount {
        self.balance.saturating_add(self.sent)
    }

    /// Insert keeping the list ordered; usually appends.
    pub fn add_utxo(&mut self, utxo: Utxo) {
        let pos = match self.utxos.last() {
            Some(last) if last.sort_key() > utxo.sort_key() => self
                .utxos
                .partition_point(|u| u.sort_key() < utxo.sort_key()),
            _ => self.utxos.len(),
        };
        self.utxos.insert(pos, utxo);
    }

    /// Remove and return the UTXO `(btxid, vout)`; recent entries are searched first.
    pub fn remove_utxo(&mut self, btxid: &[u8], vout: u32) -> Option<Utxo> {
        let pos = self.utxos.iter().rposition(|u| u.vout == vout && u.btxid == btxid)?;
        Some(self.utxos.remove(pos))
    }

    pub fn utxo_sum(&self) -> Amount {
        self.utxos.iter().fold(0, |acc: Amount, u| acc.saturating_add(u.value))
    }

    pub fn pack(&self, txid_len: usize) -> Vec<u8> {
        let mut buf = Vec::with_capacity(16 + self.utxos.len() * (txid_len + 12));
        pack_varuint(self.txs as u64, &mut buf);
        pack_bigint(self.sent, &mut buf);
        pack_bigint(self.balance, &mut buf);
        for u in &self.utxos {
            debug_assert_eq!(u.btxid.len(), txid_len);
            buf.extend_from_slice(&u.btxid);
            pack_varuint(u.vout as u64, &mut buf);
            pack_varuint(u.height as u64, &mut buf);
            pack_bigint(u.value, &mut buf);
        }
        buf
    }

    pub fn unpack(buf: &[u8], txid_len: usize, detail: BalanceDetail) -> Result<Self, BlockdexError> {
        let mut r = Reader::new(buf);
        let mut ab = AddrBalance {
            txs: r.varuint32()?,
            sent: r.bigint()?,
            balance: r.bigint()?,
            utxos: Vec::new(),
        };
        if detail == BalanceDetail::Utxo {
            while !r.is_empty() {
                ab.utxos.push(Utxo {
                    btxid: r.bytes(txid_len)?.to_vec(),
                    vout: r.varuint32()?,
                    height: r.varuint32()?,
                    value: r.bigint()?,
                });
            }
        }
        Ok(ab)
    }
}

// ------------------------------------------------------------------
// Block txs (rollback data)
// ------------------------------------------------------------------

/// Previous output spent by an input; `None` for coinbase or unparsable inputs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpentOutpoint {
    pub btxid: Vec<u8>,
    pub vout: u32,
}

/// Rollback record of one transaction of a script-chain block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockTx {
    pub btxid: Vec<u8>,
    pub inputs: Vec<Option<SpentOutpoint>>,
}

pub fn pack_block_txs(txs: &[BlockTx]) -> Vec<u8> {
    let mut buf = Vec::new();
    for tx in txs {
        buf.extend_from_slice(&tx.btxid);
        pack_varuint(tx.inputs.len() as u64, &mut buf);
        for input in &tx.inputs {
            match input {
                Some(op) => {
                    pack_varint(op.vout as i64, &mut buf);
                    buf.extend_from_slice(&op.btxid);
                }
                None => pack_varint(-1, &mut buf),
            }
        }
    }
    buf
}

pub fn unpack_block_txs(buf: &[u8], txid_len: usize) -> Result<Vec<BlockTx>, BlockdexError> {
    let mut r = Reader::new(buf);
    let mut out = Vec::new();
    while !r.is_empty() {
        let btxid = r.bytes(txid_len)?.to_vec();
        let n = r.varuint()? as usize;
        let mut inputs = Vec::with_capacity(n.min(4096));
        for _ in 0..n {
            let vout = r.varint()?;
            if vout < 0 {
                inputs.push(None);
            } else {
                let vout = u32::try_from(vout).map_err(|_| corrupted("block_txs", "vout exceeds u32"))?;
                inputs.push(Some(SpentOutpoint { btxid: r.bytes(txid_len)?.to_vec(), vout }));
            }
        }
        out.push(BlockTx { btxid, inputs });
    }
    Ok(out)
}

// ------------------------------------------------------------------
// Account-model records
// ------------------------------------------------------------------

/// How an address took part in an account-model transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EthRefKind {
    /// Sender or recipient of the native transfer.
    Native,
    /// Party of an internal (trace) transfer.
    Internal,
    /// Party of a token transfer.
    Token {
        contract: AddrDesc,
        standard: TokenStandard,
        token_id: Option<Amount>,
    },
}

/// One address mutation of an account-model transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EthAddrRef {
    pub addr_desc: AddrDesc,
    pub kind: EthRefKind,
    /// Sign-encoded index as stored in the address history.
    pub index: i32,
    pub value: Amount,
    /// Amount actually taken from a token sender's holdings; less than
    /// `value` when the sender held less. Disconnect gives back exactly this.
    pub applied: Amount,
}

impl EthAddrRef {
    pub fn new(addr_desc: AddrDesc, kind: EthRefKind, index: i32, value: Amount) -> Self {
        Self { addr_desc, kind, index, value, applied: value }
    }

    /// Outgoing token transfer, the only kind whose `applied` is stored.
    fn stores_applied(&self) -> bool {
        !self.is_incoming() && matches!(self.kind, EthRefKind::Token { .. })
    }

    /// Receiving side of the transfer.
    pub fn is_incoming(&self) -> bool {
        self.index >= 0
    }
}

/// Rollback record of one account-model transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EthBlockTx {
    pub btxid: Vec<u8>,
    pub refs: Vec<EthAddrRef>,
}

fn pack_ad(ad: &AddrDesc, buf: &mut Vec<u8>) {
    pack_varuint(ad.len() as u64, buf);
    buf.extend_from_slice(ad.as_bytes());
}

fn unpack_ad(r: &mut Reader<'_>) -> Result<AddrDesc, BlockdexError> {
    let len = r.varuint()? as usize;
    Ok(AddrDesc::from(r.bytes(len)?))
}

fn unpack_standard(r: &mut Reader<'_>, column: &'static str) -> Result<TokenStandard, BlockdexError> {
    let b = r.bytes(1)?[0];
    TokenStandard::from_u8(b).ok_or_else(|| corrupted(column, format!("unknown token standard {b}")))
}

pub fn pack_eth_block_txs(txs: &[EthBlockTx]) -> Vec<u8> {
    let mut buf = Vec::new();
    for tx in txs {
        buf.extend_from_slice(&tx.btxid);
        pack_varuint(tx.refs.len() as u64, &mut buf);
        for r in &tx.refs {
            pack_ad(&r.addr_desc, &mut buf);
            pack_varint32(r.index, &mut buf);
            pack_bigint(r.value, &mut buf);
            match &r.kind {
                EthRefKind::Native => buf.push(0),
                EthRefKind::Internal => buf.push(1),
                EthRefKind::Token { contract, standard, token_id } => {
                    buf.push(2);
                    pack_ad(contract, &mut buf);
                    buf.push(standard.to_u8());
                    match token_id {
                        Some(id) => {
                            buf.push(1);
                            pack_bigint(*id, &mut buf);
                        }
                        None => buf.push(0),
                    }
                }
            }
            if r.stores_applied() {
                pack_bigint(r.applied, &mut buf);
            }
        }
    }
    buf
}

pub fn unpack_eth_block_txs(buf: &[u8], txid_len: usize) -> Result<Vec<EthBlockTx>, BlockdexError> {
    let mut r = Reader::new(buf);
    let mut out = Vec::new();
    while !r.is_empty() {
        let btxid = r.bytes(txid_len)?.to_vec();
        let n = r.varuint()? as usize;
        let mut refs = Vec::with_capacity(n.min(4096));
        for _ in 0..n {
            let addr_desc = unpack_ad(&mut r)?;
            let index = r.varint32()?;
            let value = r.bigint()?;
            let kind = match r.bytes(1)?[0] {
                0 => EthRefKind::Native,
                1 => EthRefKind::Internal,
                2 => {
                    let contract = unpack_ad(&mut r)?;
                    let standard = unpack_standard(&mut r, "block_txs")?;
                    let token_id = match r.bytes(1)?[0] {
                        0 => None,
                        _ => Some(r.bigint()?),
                    };
                    EthRefKind::Token { contract, standard, token_id }
                }
                k => return Err(corrupted("block_txs", format!("unknown ref kind {k}"))),
            };
            let mut eref = EthAddrRef::new(addr_desc, kind, index, value);
            if eref.stores_applied() {
                eref.applied = r.bigint()?;
            }
            refs.push(eref);
        }
        out.push(EthBlockTx { btxid, refs });
    }
    Ok(out)
}

/// Token holdings of an address in one contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddrContract {
    pub contract: AddrDesc,
    pub standard: TokenStandard,
    pub txs: u64,
    /// Fungible balance (ERC20).
    pub value: Amount,
    /// Held token ids with amounts (ERC721 amounts are 1), ascending by id.
    pub ids: Vec<(Amount, Amount)>,
}

impl AddrContract {
    pub fn new(contract: AddrDesc, standard: TokenStandard) -> Self {
        Self { contract, standard, txs: 0, value: 0, ids: Vec::new() }
    }

    pub fn add_id(&mut self, id: Amount, amount: Amount) {
        match self.ids.binary_search_by(|(i, _)| i.cmp(&id)) {
            Ok(pos) => self.ids[pos].1 = self.ids[pos].1.saturating_add(amount),
            Err(pos) => self.ids.insert(pos, (id, amount)),
        }
    }

    /// Remove up to `amount` of `id`; returns how much was removed.
    pub fn sub_id(&mut self, id: Amount, amount: Amount) -> Amount {
        let Ok(pos) = self.ids.binary_search_by(|(i, _)| i.cmp(&id)) else {
            return 0;
        };
        let held = self.ids[pos].1;
        let removed = held.min(amount);
        if removed == held {
            self.ids.remove(pos);
        } else {
            self.ids[pos].1 = held - removed;
        }
        removed
    }

    /// True if the address holds anything in this contract.
    pub fn has_holdings(&self) -> bool {
        self.value > 0 || !self.ids.is_empty()
    }
}

/// Per-address aggregate of an account-model chain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddrContracts {
    pub total_txs: u64,
    pub non_contract_txs: u64,
    pub internal_txs: u64,
    pub contracts: Vec<AddrContract>,
}

impl AddrContracts {
    /// Position of `contract`, appending it if unseen.
    pub fn contract_position(&mut self, contract: &AddrDesc, standard: TokenStandard) -> usize {
        match self.contracts.iter().position(|c| c.contract == *contract) {
            Some(i) => i,
            None => {
                self.contracts.push(AddrContract::new(contract.clone(), standard));
                self.contracts.len() - 1
            }
        }
    }

    pub fn find(&self, contract: &AddrDesc) -> Option<(usize, &AddrContract)> {
        self.contracts.iter().enumerate().find(|(_, c)| c.contract == *contract)
    }

    /// Drop trailing contracts no transaction refers to any more.
    pub fn pop_unused_contracts(&mut self) {
        while self.contracts.last().is_some_and(|c| c.txs == 0) {
            self.contracts.pop();
        }
    }

    pub fn is_empty(&self) -> bool {
        self.total_txs == 0 && self.contracts.is_empty()
    }

    pub fn pack(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8 + self.contracts.len() * 32);
        pack_varuint(self.total_txs, &mut buf);
        pack_varuint(self.non_contract_txs, &mut buf);
        pack_varuint(self.internal_txs, &mut buf);
        pack_varuint(self.contracts.len() as u64, &mut buf);
        for c in &self.contracts {
            pack_ad(&c.contract, &mut buf);
            buf.push(c.standard.to_u8());
            pack_varuint(c.txs, &mut buf);
            pack_bigint(c.value, &mut buf);
            pack_varuint(c.ids.len() as u64, &mut buf);
            for (id, amount) in &c.ids {
                pack_bigint(*id, &mut buf);
                pack_bigint(*amount, &mut buf);
            }
        }
        buf
    }

    pub fn unpack(buf: &[u8]) -> Result<Self, BlockdexError> {
        let mut r = Reader::new(buf);
        let total_txs = r.varuint()?;
        let non_contract_txs = r.varuint()?;
        let internal_txs = r.varuint()?;
        let n = r.varuint()? as usize;
        let mut contracts = Vec::with_capacity(n.min(1024));
        for _ in 0..n {
            let contract = unpack_ad(&mut r)?;
            let standard = unpack_standard(&mut r, "addressContracts")?;
            let txs = r.varuint()?;
            let value = r.bigint()?;
            let n_ids = r.varuint()? as usize;
            let mut ids = Vec::with_capacity(n_ids.min(1024));
            for _ in 0..n_ids {
                ids.push((r.bigint()?, r.bigint()?));
            }
            contracts.push(AddrContract { contract, standard, txs, value, ids });
        }
        Ok(Self { total_txs, non_contract_txs, internal_txs, contracts })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn btxid(b: u8) -> Vec<u8> {
        vec![b; 32]
    }

    #[test]
    fn address_key_is_descriptor_then_height() {
        let key = pack_address_key(&[0xaa, 0xbb], 0x0102_0304);
        assert_eq!(key, vec![0xaa, 0xbb, 1, 2, 3, 4]);
        let (ad, h) = unpack_address_key(&key).unwrap();
        assert_eq!(ad, &[0xaa, 0xbb]);
        assert_eq!(h, 0x0102_0304);
        assert!(unpack_address_key(&[1, 2]).is_err());
    }

    #[test]
    fn address_keys_order_by_height() {
        assert!(pack_address_key(b"a", 9) < pack_address_key(b"a", 10));
        assert!(pack_address_key(b"a", 255) < pack_address_key(b"a", 256));
    }

    #[test]
    fn block_info_keeps_0x_prefix() {
        let info = BlockInfo { hash: format!("0x{}", "ab".repeat(32)), time: 1_700_000_000, txs: 3, size: 900, height: 5 };
        let back = unpack_block_info(&pack_block_info(&info).unwrap(), 5).unwrap();
        assert_eq!(back, info);
        let plain = BlockInfo { hash: "00ff".into(), ..info };
        assert_eq!(unpack_block_info(&pack_block_info(&plain).unwrap(), 5).unwrap().hash, "00ff");
    }

    #[test]
    fn block_hash_must_be_hex() {
        let mut buf = Vec::new();
        assert!(pack_block_hash("xyz", &mut buf).is_err());
    }

    #[test]
    fn tx_indexes_groups_survive_packing() {
        let groups = vec![
            TxIndexes { btxid: btxid(1), indexes: vec![0, 3, !0] },
            TxIndexes { btxid: btxid(2), indexes: vec![!7] },
        ];
        assert_eq!(unpack_tx_indexes(&pack_tx_indexes(&groups), 32).unwrap(), groups);
    }

    #[test]
    fn tx_indexes_truncated_group_errors() {
        let mut buf = btxid(1);
        pack_varint32(0 << 1, &mut buf);
        assert!(unpack_tx_indexes(&buf, 32).is_err());
    }

    #[test]
    fn add_tx_index_reports_already_counted() {
        let mut groups = Vec::new();
        assert!(!add_tx_index(&mut groups, &btxid(1), 0));
        assert!(add_tx_index(&mut groups, &btxid(1), !0));
        assert!(!add_tx_index(&mut groups, &btxid(2), 1));
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].indexes, vec![0, !0]);
    }

    #[test]
    fn tx_addresses_spent_flag_round_trips() {
        let ta = TxAddresses {
            height: 123,
            inputs: vec![TxInput { addr_desc: AddrDesc::default(), value: 0 }],
            outputs: vec![
                TxOutput { addr_desc: AddrDesc::new(vec![1, 2, 3]), spent: true, value: 5_000_000_000 },
                TxOutput { addr_desc: AddrDesc::new(vec![4]), spent: false, value: 1 },
                TxOutput { addr_desc: AddrDesc::default(), spent: true, value: 0 },
            ],
        };
        let back = TxAddresses::unpack(&ta.pack()).unwrap();
        assert_eq!(back, ta);
        assert!(back.looks_like_coinbase());
        assert!(!back.all_outputs_spent());
    }

    #[test]
    fn utxos_stay_sorted_on_out_of_order_insert() {
        let mut ab = AddrBalance::default();
        ab.add_utxo(Utxo { btxid: btxid(2), vout: 0, height: 10, value: 1 });
        ab.add_utxo(Utxo { btxid: btxid(1), vout: 1, height: 12, value: 2 });
        ab.add_utxo(Utxo { btxid: btxid(9), vout: 0, height: 11, value: 3 });
        ab.add_utxo(Utxo { btxid: btxid(1), vout: 0, height: 12, value: 4 });
        let order: Vec<_> = ab.utxos.iter().map(|u| (u.height, u.vout)).collect();
        assert_eq!(order, vec![(10, 0), (11, 0), (12, 0), (12, 1)]);
        assert_eq!(ab.utxo_sum(), 10);
        assert_eq!(ab.remove_utxo(&btxid(9), 0).map(|u| u.value), Some(3));
        assert!(ab.remove_utxo(&btxid(9), 0).is_none());
    }

    #[test]
    fn balance_without_utxo_detail_skips_list() {
        let mut ab = AddrBalance { txs: 2, sent: 5, balance: 7, utxos: vec![] };
        ab.add_utxo(Utxo { btxid: btxid(3), vout: 2, height: 1, value: 7 });
        let buf = ab.pack(32);
        assert_eq!(AddrBalance::unpack(&buf, 32, BalanceDetail::Utxo).unwrap(), ab);
        let light = AddrBalance::unpack(&buf, 32, BalanceDetail::NoUtxo).unwrap();
        assert!(light.utxos.is_empty());
        assert_eq!(light.received(), 12);
    }

    #[test]
    fn block_txs_keep_coinbase_placeholders() {
        let txs = vec![
            BlockTx { btxid: btxid(1), inputs: vec![None] },
            BlockTx {
                btxid: btxid(2),
                inputs: vec![Some(SpentOutpoint { btxid: btxid(1), vout: 0 }), None, Some(SpentOutpoint { btxid: btxid(7), vout: 4 })],
            },
        ];
        assert_eq!(unpack_block_txs(&pack_block_txs(&txs), 32).unwrap(), txs);
    }

    #[test]
    fn eth_block_txs_round_trip() {
        let txs = vec![EthBlockTx {
            btxid: btxid(5),
            refs: vec![
                EthAddrRef::new(AddrDesc::new(vec![1; 20]), EthRefKind::Native, 0, 10),
                EthAddrRef::new(AddrDesc::new(vec![2; 20]), EthRefKind::Internal, !0, 3),
                EthAddrRef::new(
                    AddrDesc::new(vec![3; 20]),
                    EthRefKind::Token { contract: AddrDesc::new(vec![9; 20]), standard: TokenStandard::Erc721, token_id: Some(77) },
                    1,
                    1,
                ),
                EthAddrRef {
                    applied: 4,
                    ..EthAddrRef::new(
                        AddrDesc::new(vec![4; 20]),
                        EthRefKind::Token { contract: AddrDesc::new(vec![8; 20]), standard: TokenStandard::Erc20, token_id: None },
                        !1,
                        10,
                    )
                },
            ],
        }];
        assert_eq!(unpack_eth_block_txs(&pack_eth_block_txs(&txs), 32).unwrap(), txs);
    }

    #[test]
    fn addr_contracts_positions_and_trailing_pop() {
        let mut ac = AddrContracts::default();
        let c1 = AddrDesc::new(vec![1; 20]);
        let c2 = AddrDesc::new(vec![2; 20]);
        assert_eq!(ac.contract_position(&c1, TokenStandard::Erc20), 0);
        assert_eq!(ac.contract_position(&c2, TokenStandard::Erc1155), 1);
        assert_eq!(ac.contract_position(&c1, TokenStandard::Erc20), 0);
        ac.contracts[0].txs = 1;
        ac.pop_unused_contracts();
        assert_eq!(ac.contracts.len(), 1);
        assert_eq!(ac.find(&c1).map(|(i, _)| i), Some(0));
    }

    #[test]
    fn nft_ids_add_and_remove() {
        let mut c = AddrContract::new(AddrDesc::new(vec![1]), TokenStandard::Erc1155);
        c.add_id(5, 10);
        c.add_id(2, 1);
        c.add_id(5, 1);
        assert_eq!(c.ids, vec![(2, 1), (5, 11)]);
        assert_eq!(c.sub_id(2, 1), 1);
        assert_eq!(c.sub_id(5, 4), 4);
        assert_eq!(c.ids, vec![(5, 7)]);
        assert!(c.has_holdings());
        assert_eq!(c.sub_id(5, 9), 7, "only what is held");
        assert_eq!(c.sub_id(3, 1), 0);
        assert!(!c.has_holdings());
    }

    #[test]
    fn addr_contracts_round_trip() {
        let mut ac = AddrContracts { total_txs: 9, non_contract_txs: 4, internal_txs: 1, contracts: vec![] };
        let pos = ac.contract_position(&AddrDesc::new(vec![7; 20]), TokenStandard::Erc721);
        ac.contracts[pos].txs = 3;
        ac.contracts[pos].add_id(42, 1);
        assert_eq!(AddrContracts::unpack(&ac.pack()).unwrap(), ac);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(128))]

        #[test]
        fn balance_pack_preserves_utxo_list(values in proptest::collection::vec((0u32..1000, 0u32..50, any::<u64>()), 0..40)) {
            let mut ab = AddrBalance { txs: values.len() as u32, ..Default::default() };
            for (i, (h, vout, v)) in values.iter().enumerate() {
                ab.add_utxo(Utxo { btxid: vec![(i % 251) as u8; 32], vout: *vout, height: *h, value: *v as Amount });
                ab.balance += *v as Amount;
            }
            let back = AddrBalance::unpack(&ab.pack(32), 32, BalanceDetail::Utxo).unwrap();
            prop_assert_eq!(back.utxo_sum(), back.balance);
            prop_assert!(back.utxos.windows(2).all(|w| w[0].sort_key() <= w[1].sort_key()));
            prop_assert_eq!(back, ab);
        }
    }
}
