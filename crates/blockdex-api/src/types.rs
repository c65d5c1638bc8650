//! Response objects returned by the [`Worker`](crate::worker::Worker).
//!
//! Amounts are serialised as decimal strings of the base unit so that
//! 256-bit-range values survive JSON consumers that parse numbers as floats.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use blockdex_core::internal_state::StateSnapshot;
use blockdex_core::types::{Amount, BlockInfo, ChainInfo, EthTxStatus, NftMetadata, TokenStandard};

use crate::paging::Paging;

/// Serde adapter writing numbers as strings.
pub mod amount_str {
    use std::fmt::Display;
    use std::str::FromStr;

    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<T: Display, S: Serializer>(v: &T, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(v)
    }

    pub fn deserialize<'de, T, D>(d: D) -> Result<T, D::Error>
    where
        T: FromStr,
        T::Err: Display,
        D: Deserializer<'de>,
    {
        String::deserialize(d)?.parse().map_err(de::Error::custom)
    }
}

/// Like [`amount_str`] for optional values.
pub mod opt_amount_str {
    use std::fmt::Display;
    use std::str::FromStr;

    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<T: Display, S: Serializer>(v: &Option<T>, s: S) -> Result<S::Ok, S::Error> {
        match v {
            Some(v) => s.collect_str(v),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, T, D>(d: D) -> Result<Option<T>, D::Error>
    where
        T: FromStr,
        T::Err: Display,
        D: Deserializer<'de>,
    {
        match Option::<String>::deserialize(d)? {
            Some(s) => s.parse().map(Some).map_err(de::Error::custom),
            None => Ok(None),
        }
    }
}

/// Detail level of an address or xpub query; each level includes the
/// previous ones.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "camelCase")]
pub enum AccountDetails {
    Basic,
    TokenBalances,
    #[default]
    Txids,
    TxHistoryLight,
    TxHistory,
}

/// Which side of a transaction an address must be on to match.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum VoutFilter {
    #[default]
    Off,
    Inputs,
    Outputs,
    /// Input or output at this index (token contract position + 1 on
    /// account chains).
    Index(u32),
}

impl VoutFilter {
    /// Whether any of the signed history indexes passes.
    pub fn matches(&self, indexes: &[i32]) -> bool {
        match self {
            Self::Off => true,
            Self::Inputs => indexes.iter().any(|i| *i < 0),
            Self::Outputs => indexes.iter().any(|i| *i >= 0),
            Self::Index(k) => indexes.iter().any(|i| {
                let i = if *i < 0 { !*i } else { *i };
                i as u32 == *k
            }),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AddressFilter {
    pub vout: VoutFilter,
    pub from_height: u32,
    /// 0 means no upper bound.
    pub to_height: u32,
    /// Token contract on account chains.
    pub contract: Option<String>,
    pub only_confirmed: bool,
}

impl AddressFilter {
    /// True if the filter can drop transactions, so totals are unknown.
    pub fn is_active(&self) -> bool {
        self.vout != VoutFilter::Off || self.from_height != 0 || self.to_height != 0 || self.contract.is_some()
    }

    pub fn height_range(&self) -> (u32, u32) {
        (self.from_height, if self.to_height == 0 { u32::MAX } else { self.to_height })
    }
}

/// Which derived addresses an xpub query lists.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum TokensToReturn {
    #[default]
    NonzeroBalance,
    Used,
    Derived,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TxVin {
    pub n: u32,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub txid: String,
    pub vout: u32,
    pub sequence: u32,
    pub addresses: Vec<String>,
    pub is_address: bool,
    #[serde(with = "opt_amount_str", skip_serializing_if = "Option::is_none", default)]
    pub value: Option<Amount>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub hex: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coinbase: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TxVout {
    #[serde(with = "amount_str")]
    pub value: Amount,
    pub n: u32,
    pub spent: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spent_txid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spent_index: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spent_height: Option<u32>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub hex: String,
    pub addresses: Vec<String>,
    pub is_address: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TokenTransferView {
    pub standard: TokenStandard,
    pub contract: String,
    pub from: String,
    pub to: String,
    pub name: String,
    pub symbol: String,
    pub decimals: u8,
    #[serde(with = "amount_str")]
    pub value: Amount,
    #[serde(with = "opt_amount_str", skip_serializing_if = "Option::is_none", default)]
    pub token_id: Option<Amount>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InternalTransferView {
    pub from: String,
    pub to: String,
    #[serde(with = "amount_str")]
    pub value: Amount,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EthereumSpecific {
    /// 1 ok, 0 failure, -1 pending, -2 unknown.
    pub status: i32,
    pub nonce: u64,
    pub gas_limit: u64,
    pub gas_used: Option<u64>,
    #[serde(with = "amount_str")]
    pub gas_price: Amount,
    pub data: String,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub internal_transfers: Vec<InternalTransferView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub fn eth_status_code(s: EthTxStatus) -> i32 {
    match s {
        EthTxStatus::Ok => 1,
        EthTxStatus::Failure => 0,
        EthTxStatus::Pending => -1,
        EthTxStatus::Unknown => -2,
    }
}

/// A reconstructed transaction.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TxView {
    pub txid: String,
    pub version: i32,
    pub lock_time: u32,
    pub vin: Vec<TxVin>,
    pub vout: Vec<TxVout>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_hash: Option<String>,
    /// -1 for mempool transactions.
    pub block_height: i64,
    pub confirmations: u32,
    /// Block time, or first-seen time for mempool transactions.
    pub block_time: i64,
    #[serde(skip_serializing_if = "is_zero")]
    pub size: u32,
    #[serde(skip_serializing_if = "is_zero")]
    pub vsize: u32,
    #[serde(with = "amount_str")]
    pub value: Amount,
    /// Absent on coinbase transactions.
    #[serde(with = "opt_amount_str", skip_serializing_if = "Option::is_none", default)]
    pub value_in: Option<Amount>,
    #[serde(with = "amount_str")]
    pub fees: Amount,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub hex: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub rbf: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coin_specific_data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub token_transfers: Vec<TokenTransferView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ethereum_specific: Option<EthereumSpecific>,
}

fn is_zero(v: &u32) -> bool {
    *v == 0
}

/// Token holding of an address, or a derived address of an xpub.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Token {
    /// `ERC20`, `ERC721`, `ERC1155` or `XPUBAddress`.
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub path: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub contract: String,
    pub transfers: u64,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub symbol: String,
    pub decimals: u8,
    #[serde(with = "opt_amount_str", skip_serializing_if = "Option::is_none", default)]
    pub balance: Option<Amount>,
    #[serde(with = "opt_amount_str", skip_serializing_if = "Option::is_none", default)]
    pub total_received: Option<Amount>,
    #[serde(with = "opt_amount_str", skip_serializing_if = "Option::is_none", default)]
    pub total_sent: Option<Amount>,
    /// Held token ids with amounts, for NFT standards.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub ids: Vec<(String, String)>,
    /// Contract-provided metadata of the held ids.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub nfts: Vec<NftMetadata>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AddressView {
    #[serde(flatten)]
    pub paging: Option<Paging>,
    pub address: String,
    #[serde(with = "amount_str")]
    pub balance: Amount,
    #[serde(with = "amount_str")]
    pub total_received: Amount,
    #[serde(with = "amount_str")]
    pub total_sent: Amount,
    #[serde(with = "amount_str")]
    pub unconfirmed_balance: i128,
    pub unconfirmed_txs: u32,
    pub txs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub non_token_txs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub internal_txs: Option<u64>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub transactions: Vec<TxView>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub txids: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub used_tokens: Option<usize>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub tokens: Vec<Token>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UtxoView {
    pub txid: String,
    pub vout: u32,
    #[serde(with = "amount_str")]
    pub value: Amount,
    /// 0 for mempool outputs.
    #[serde(skip_serializing_if = "is_zero")]
    pub height: u32,
    pub confirmations: u32,
    #[serde(skip_serializing_if = "is_zero")]
    pub lock_time: u32,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub coinbase: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BlockView {
    #[serde(flatten)]
    pub paging: Paging,
    pub hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_block_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_block_hash: Option<String>,
    pub height: u32,
    pub confirmations: u32,
    pub size: u32,
    pub time: i64,
    pub tx_count: u32,
    pub txs: Vec<TxView>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BlocksView {
    #[serde(flatten)]
    pub paging: Paging,
    pub blocks: Vec<BlockInfo>,
}

/// Golomb filters of pooled transactions and the parameters they were built with.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MempoolFilters {
    pub p: u8,
    pub scripts: String,
    pub zeroed_key: bool,
    /// Txid → hex filter.
    pub entries: BTreeMap<String, String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackendInfo {
    #[serde(flatten)]
    pub chain: Option<ChainInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SystemInfo {
    pub blockdex: StateSnapshot,
    pub backend: BackendInfo,
}

/// Fee statistics of one block.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FeeStats {
    pub tx_count: u32,
    #[serde(with = "amount_str")]
    pub total_fees: Amount,
    pub average_fee_per_kb: u64,
    pub decile_fee_per_kb: [u64; 11],
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FiatRatesView {
    pub ts: i64,
    pub rates: BTreeMap<String, f64>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TickersList {
    pub ts: i64,
    pub available_currencies: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vout_filter_matches_by_side_and_index() {
        assert!(VoutFilter::Off.matches(&[]));
        assert!(VoutFilter::Inputs.matches(&[0, !1]));
        assert!(!VoutFilter::Inputs.matches(&[0, 1]));
        assert!(VoutFilter::Outputs.matches(&[!0, 2]));
        assert!(!VoutFilter::Outputs.matches(&[!0, !2]));
        assert!(VoutFilter::Index(2).matches(&[2]));
        assert!(VoutFilter::Index(2).matches(&[!2]));
        assert!(!VoutFilter::Index(2).matches(&[1, !3]));
    }

    #[test]
    fn active_filter_hides_totals() {
        assert!(!AddressFilter::default().is_active());
        assert!(AddressFilter { vout: VoutFilter::Inputs, ..Default::default() }.is_active());
        assert!(AddressFilter { from_height: 5, ..Default::default() }.is_active());
        assert_eq!(AddressFilter::default().height_range(), (0, u32::MAX));
        assert_eq!(AddressFilter { to_height: 9, ..Default::default() }.height_range(), (0, 9));
    }

    #[test]
    fn amounts_serialize_as_strings() {
        let v = TxVout { value: u128::MAX, n: 1, ..Default::default() };
        let json = serde_json::to_value(&v).unwrap();
        assert_eq!(json["value"], serde_json::Value::String(u128::MAX.to_string()));
        let back: TxVout = serde_json::from_value(json).unwrap();
        assert_eq!(back.value, u128::MAX);
    }

    #[test]
    fn details_are_ordered() {
        assert!(AccountDetails::Basic < AccountDetails::TokenBalances);
        assert!(AccountDetails::Txids < AccountDetails::TxHistoryLight);
        assert!(AccountDetails::TxHistoryLight < AccountDetails::TxHistory);
    }
}
