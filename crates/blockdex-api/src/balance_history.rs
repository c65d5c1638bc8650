//! Per-transaction balance changes and their aggregation into time buckets.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use blockdex_core::types::{AddrDesc, Amount, EthTxStatus, Tx};
use blockdex_db::schema::TxAddresses;

use crate::types::amount_str;

/// Bucket size used when the caller passes 0.
pub const DEFAULT_GROUP_BY_SECS: u32 = 3600;

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BalanceHistory {
    pub time: u32,
    pub txs: u32,
    #[serde(with = "amount_str")]
    pub received: Amount,
    #[serde(with = "amount_str")]
    pub sent: Amount,
    #[serde(with = "amount_str")]
    pub sent_to_self: Amount,
    /// Set on single-tx entries; cleared in aggregated buckets.
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub txid: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub rates: Option<BTreeMap<String, f64>>,
}

/// Sort by `(time, txid)` and sum into `group_by`-second buckets.
///
/// Consecutive entries of the same txid count as one transaction, so an
/// xpub whose addresses share a tx reports it once per bucket.
pub fn sort_and_aggregate(mut items: Vec<BalanceHistory>, group_by: u32) -> Vec<BalanceHistory> {
    let group_by = if group_by == 0 { DEFAULT_GROUP_BY_SECS } else { group_by };
    items.sort_by(|a, b| a.time.cmp(&b.time).then_with(|| a.txid.cmp(&b.txid)));
    let mut out: Vec<BalanceHistory> = Vec::new();
    let mut acc: Option<BalanceHistory> = None;
    for h in items {
        let time = h.time - h.time % group_by;
        if acc.as_ref().is_none_or(|b| b.time != time) {
            if let Some(mut done) = acc.take() {
                done.txid.clear();
                out.push(done);
            }
        }
        let bucket = acc.get_or_insert_with(|| BalanceHistory { time, ..Default::default() });
        if bucket.txid != h.txid || bucket.txs == 0 {
            bucket.txs += h.txs;
            bucket.txid = h.txid;
        }
        bucket.received = bucket.received.saturating_add(h.received);
        bucket.sent = bucket.sent.saturating_add(h.sent);
        bucket.sent_to_self = bucket.sent_to_self.saturating_add(h.sent_to_self);
    }
    if let Some(mut done) = acc {
        done.txid.clear();
        out.push(done);
    }
    out
}

/// Balance change of `ad` in a confirmed script-chain tx.
///
/// `own` holds every descriptor of the queried account. A transfer between
/// own addresses is counted as sent-to-self only by the address owning the
/// first own input, so the amount is not repeated once per own address.
pub fn utxo_balance_history(txid: &str, time: u32, ta: &TxAddresses, ad: &AddrDesc, own: &HashSet<AddrDesc>) -> BalanceHistory {
    let mut bh = BalanceHistory { time, txs: 1, txid: txid.to_string(), ..Default::default() };
    let first_own = ta.inputs.iter().position(|i| own.contains(&i.addr_desc));
    let mut count_self = false;
    for (i, tin) in ta.inputs.iter().enumerate() {
        if tin.addr_desc == *ad {
            bh.sent = bh.sent.saturating_add(tin.value);
            if first_own == Some(i) {
                count_self = true;
            }
        }
    }
    for out in &ta.outputs {
        if out.addr_desc == *ad {
            bh.received = bh.received.saturating_add(out.value);
        }
        if count_self && own.contains(&out.addr_desc) {
            bh.sent_to_self = bh.sent_to_self.saturating_add(out.value);
        }
    }
    bh
}

/// Balance change of `ad` in an account-chain tx. Values move only for
/// successful (or pre-receipt-era) transactions; the sender pays the fee
/// either way.
pub fn account_balance_history(
    tx: &Tx,
    time: u32,
    ad: &AddrDesc,
    own: &HashSet<AddrDesc>,
    desc: impl Fn(&str) -> Option<AddrDesc>,
) -> BalanceHistory {
    let mut bh = BalanceHistory { time, txs: 1, txid: tx.txid.clone(), ..Default::default() };
    let status = tx.eth.as_ref().map(|e| e.status).unwrap_or(EthTxStatus::Unknown);
    let moved = matches!(status, EthTxStatus::Ok | EthTxStatus::Unknown);
    let value = tx.vout.first().map(|v| v.value_sat).unwrap_or(0);
    let mut count_self = false;
    if moved {
        if let Some(to) = tx.vout.first().and_then(|v| v.addresses.first()).and_then(|a| desc(a.as_str())) {
            if to == *ad {
                bh.received = bh.received.saturating_add(value);
            }
            count_self = own.contains(&to);
        }
        if let Some(eth) = &tx.eth {
            for it in &eth.internal_transfers {
                if desc(it.to.as_str()).as_ref() == Some(ad) {
                    bh.received = bh.received.saturating_add(it.value);
                }
                if desc(it.from.as_str()).as_ref() == Some(ad) {
                    bh.sent = bh.sent.saturating_add(it.value);
                }
            }
        }
    }
    let from = tx.vin.first().and_then(|v| v.addresses.first()).and_then(|a| desc(a.as_str()));
    if from.as_ref() == Some(ad) {
        if moved {
            bh.sent = bh.sent.saturating_add(value);
            if count_self {
                bh.sent_to_self = bh.sent_to_self.saturating_add(value);
            }
        }
        if let Some(fee) = tx.eth.as_ref().and_then(|e| e.fee()) {
            bh.sent = bh.sent.saturating_add(fee);
        }
    }
    bh
}
