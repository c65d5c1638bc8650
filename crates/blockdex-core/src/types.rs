//! Normalised chain types shared by parsers, backends, the indexer and the
//! query worker.
//!
//! All amounts are in the chain's smallest unit (satoshi, wei) and held as
//! `u128`, which covers both Bitcoin-family and Ethereum-family value ranges.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Monetary amount in the smallest unit of the chain.
pub type Amount = u128;

/// Canonical byte identity of a payable destination.
///
/// For script chains this is the output script; for account chains it is the
/// 20-byte account address. Compared bytewise.
#[derive(
    Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord,
    bincode::Encode, bincode::Decode,
)]
pub struct AddrDesc(pub Vec<u8>);

impl AddrDesc {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for AddrDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0))
    }
}

impl AsRef<[u8]> for AddrDesc {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for AddrDesc {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<&[u8]> for AddrDesc {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

/// Chain family; the indexer branches on this, never on coin identity.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChainType {
    /// Script-based UTXO chains.
    Bitcoin,
    /// Account-model chains.
    Ethereum,
}

/// Identifies a block either by hash or by height.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum BlockId {
    Hash(String),
    Height(u32),
}

impl BlockId {
    /// Interpret a user supplied string: all digits is a height, anything else a hash.
    pub fn parse(s: &str) -> Self {
        match s.parse::<u32>() {
            Ok(h) if !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) => Self::Height(h),
            _ => Self::Hash(s.to_string()),
        }
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hash(h) => f.write_str(h),
            Self::Height(h) => write!(f, "{h}"),
        }
    }
}

#[derive(
    Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, bincode::Encode, bincode::Decode,
)]
pub struct Vin {
    /// Hex coinbase data; present only on coinbase inputs.
    pub coinbase: Option<String>,
    pub txid: String,
    pub vout: u32,
    pub script_sig_hex: String,
    pub sequence: u32,
    /// Addresses resolved by the backend, if it provides them.
    pub addresses: Vec<String>,
}

impl Vin {
    pub fn is_coinbase(&self) -> bool {
        self.coinbase.is_some()
    }
}

#[derive(
    Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, bincode::Encode, bincode::Decode,
)]
pub struct Vout {
    pub value_sat: Amount,
    pub n: u32,
    pub script_pubkey_hex: String,
    pub addresses: Vec<String>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, bincode::Encode, bincode::Decode)]
pub enum TokenStandard {
    #[serde(rename = "ERC20")]
    Erc20,
    #[serde(rename = "ERC721")]
    Erc721,
    #[serde(rename = "ERC1155")]
    Erc1155,
}

impl TokenStandard {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Erc20 => "ERC20",
            Self::Erc721 => "ERC721",
            Self::Erc1155 => "ERC1155",
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            Self::Erc20 => 0,
            Self::Erc721 => 1,
            Self::Erc1155 => 2,
        }
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Erc20),
            1 => Some(Self::Erc721),
            2 => Some(Self::Erc1155),
            _ => None,
        }
    }

    /// Fungible tokens carry a summed balance; NFT standards carry ids.
    pub fn is_fungible(&self) -> bool {
        matches!(self, Self::Erc20)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct TokenTransfer {
    pub standard: TokenStandard,
    pub contract: String,
    pub from: String,
    pub to: String,
    pub value: Amount,
    /// Token id for ERC721 and ERC1155 transfers.
    pub token_id: Option<Amount>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub enum InternalTransferKind {
    Call,
    Create,
    SelfDestruct,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct InternalTransfer {
    pub kind: InternalTransferKind,
    pub from: String,
    pub to: String,
    pub value: Amount,
}

/// Execution status of an account-model transaction.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub enum EthTxStatus {
    #[default]
    Pending,
    Ok,
    Failure,
    Unknown,
}

/// Account-model specifics attached to a [`Tx`].
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct EthereumTxData {
    pub nonce: u64,
    pub gas_limit: u64,
    pub gas_price: Amount,
    /// Known only once the receipt exists.
    pub gas_used: Option<u64>,
    pub status: EthTxStatus,
    /// Hex call data.
    pub data: String,
    pub token_transfers: Vec<TokenTransfer>,
    pub internal_transfers: Vec<InternalTransfer>,
    /// Trace error, if internal data could not be fetched.
    pub internal_error: Option<String>,
}

impl EthereumTxData {
    /// `gasUsed × gasPrice` when the receipt is known.
    pub fn fee(&self) -> Option<Amount> {
        self.gas_used.map(|g| (g as Amount).saturating_mul(self.gas_price))
    }

    /// Upper bound of the fee before execution: `gasLimit × gasPrice`.
    pub fn max_fee(&self) -> Amount {
        (self.gas_limit as Amount).saturating_mul(self.gas_price)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct Tx {
    pub txid: String,
    pub version: i32,
    pub lock_time: u32,
    pub vin: Vec<Vin>,
    pub vout: Vec<Vout>,
    /// Block height, 0 for mempool transactions.
    pub block_height: u32,
    pub block_hash: Option<String>,
    /// Block time, or first-seen time for mempool transactions.
    pub block_time: i64,
    pub time: i64,
    /// Derived at query time, never persisted.
    pub confirmations: u32,
    pub size: u32,
    pub vsize: u32,
    /// Raw transaction hex, if the backend supplied it.
    pub hex: String,
    pub eth: Option<EthereumTxData>,
}

impl Tx {
    pub fn is_coinbase(&self) -> bool {
        self.vin.len() == 1 && self.vin[0].is_coinbase()
    }

    /// Virtual size if known, falling back to raw size.
    pub fn fee_size(&self) -> u32 {
        if self.vsize > 0 { self.vsize } else { self.size }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct BlockHeader {
    pub hash: String,
    pub prev: String,
    pub next: Option<String>,
    pub height: u32,
    pub confirmations: u32,
    pub size: u32,
    pub time: i64,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    pub txs: Vec<Tx>,
}

/// Per-height block record stored in the `height` column.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct BlockInfo {
    pub hash: String,
    pub time: i64,
    pub txs: u32,
    pub size: u32,
    pub height: u32,
}

/// Backend node status reported by `get_chain_info`.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct ChainInfo {
    pub chain: String,
    pub blocks: u32,
    pub headers: u32,
    pub best_block_hash: String,
    pub difficulty: String,
    pub size_on_disk: u64,
    pub version: String,
    pub subversion: String,
    pub protocol_version: String,
    pub time_offset: i64,
    pub warnings: String,
    pub consensus: Option<serde_json::Value>,
}

/// Per-serial NFT metadata on token-aware chains.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct NftMetadata {
    pub category: String,
    pub commitment: String,
    pub name: String,
    pub uri: String,
}

/// Token contract metadata stored in the `contracts` column.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct ContractInfo {
    pub contract: String,
    pub standard: TokenStandard,
    pub name: String,
    pub symbol: String,
    pub decimals: u8,
    pub created_in_block: u32,
    pub destructed_in_block: u32,
    pub nft: Vec<NftMetadata>,
}

/// Fiat exchange rates at a point in time.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct FiatTicker {
    /// Unix seconds.
    pub timestamp: i64,
    pub rates: BTreeMap<String, f64>,
    /// Rates of tokens against the base coin, keyed by contract address.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub token_rates: BTreeMap<String, f64>,
}

impl FiatTicker {
    pub fn has_currency(&self, currency: &str) -> bool {
        self.rates.contains_key(currency)
    }

    /// Keep only the requested currencies; an empty request keeps all.
    /// Requested currencies that the ticker lacks are reported as `-1`.
    pub fn select(&self, currencies: &[String]) -> BTreeMap<String, f64> {
        if currencies.is_empty() {
            return self.rates.clone();
        }
        currencies
            .iter()
            .map(|c| (c.clone(), self.rates.get(c).copied().unwrap_or(-1.0)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_id_parses_digits_as_height() {
        assert_eq!(BlockId::parse("123"), BlockId::Height(123));
        assert_eq!(BlockId::parse("00ab"), BlockId::Hash("00ab".into()));
        assert_eq!(BlockId::parse(""), BlockId::Hash(String::new()));
        assert_eq!(BlockId::parse("99999999999"), BlockId::Hash("99999999999".into()));
    }

    #[test]
    fn addr_desc_displays_as_hex() {
        let ad = AddrDesc::new(vec![0x76, 0xa9, 0x14]);
        assert_eq!(ad.to_string(), "76a914");
        assert_eq!(ad.len(), 3);
    }

    #[test]
    fn coinbase_tx_detected_by_single_coinbase_input() {
        let tx = Tx {
            vin: vec![Vin { coinbase: Some("03".into()), ..Default::default() }],
            ..Default::default()
        };
        assert!(tx.is_coinbase());
        let tx = Tx { vin: vec![Vin::default()], ..Default::default() };
        assert!(!tx.is_coinbase());
    }

    #[test]
    fn eth_fee_uses_gas_used_when_known() {
        let eth = EthereumTxData { gas_limit: 21_000, gas_price: 10, gas_used: Some(20_000), ..Default::default() };
        assert_eq!(eth.fee(), Some(200_000));
        assert_eq!(eth.max_fee(), 210_000);
        let pending = EthereumTxData { gas_used: None, ..eth };
        assert_eq!(pending.fee(), None);
    }

    #[test]
    fn ticker_select_reports_missing_currency() {
        let mut rates = BTreeMap::new();
        rates.insert("usd".to_string(), 2000.0);
        let t = FiatTicker { timestamp: 1, rates, token_rates: BTreeMap::new() };
        let sel = t.select(&["usd".into(), "eur".into()]);
        assert_eq!(sel["usd"], 2000.0);
        assert_eq!(sel["eur"], -1.0);
        assert_eq!(t.select(&[]).len(), 1);
    }

    #[test]
    fn token_standard_round_trips_through_u8() {
        for s in [TokenStandard::Erc20, TokenStandard::Erc721, TokenStandard::Erc1155] {
            assert_eq!(TokenStandard::from_u8(s.to_u8()), Some(s));
        }
        assert_eq!(TokenStandard::from_u8(9), None);
    }
}
