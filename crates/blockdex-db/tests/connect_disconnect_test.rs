//! Connect/disconnect round trips over randomly generated chains.

use std::sync::Arc;

use proptest::prelude::*;
use sha2::{Digest, Sha256};

use blockdex_core::error::ParseError;
use blockdex_core::traits::Parser;
use blockdex_core::types::{AddrDesc, Amount, Block, BlockHeader, ChainType, Tx, Vin, Vout};
use blockdex_db::schema::BalanceDetail;
use blockdex_db::{Indexer, IterControl};

struct Utf8Parser;

impl Parser for Utf8Parser {
    fn chain_type(&self) -> ChainType {
        ChainType::Bitcoin
    }

    fn amount_decimals(&self) -> u8 {
        8
    }

    fn packed_txid_len(&self) -> usize {
        32
    }

    fn get_addr_desc_from_vout(&self, vout: &Vout) -> Result<AddrDesc, ParseError> {
        vout.addresses.first().map(|a| AddrDesc::new(a.as_bytes())).ok_or(ParseError::AddressMissing)
    }

    fn get_addr_desc_from_address(&self, address: &str) -> Result<AddrDesc, ParseError> {
        Ok(AddrDesc::new(address.as_bytes()))
    }

    fn get_addresses_from_addr_desc(&self, ad: &AddrDesc) -> Result<(Vec<String>, bool), ParseError> {
        Ok((vec![String::from_utf8_lossy(ad.as_bytes()).into_owned()], true))
    }
}

const ADDRESSES: [&str; 5] = ["alice", "bob", "carol", "dave", "erin"];

fn txid(height: u32, n: usize) -> String {
    hex::encode(Sha256::digest(format!("{height}:{n}").as_bytes()))
}

/// Per block: coinbase recipient, then spends as (utxo selector, recipient).
type BlockPlan = (usize, Vec<(usize, usize)>);

/// Turn a plan into blocks, spending only outputs that exist and are unspent.
fn build_chain(plan: &[BlockPlan]) -> Vec<Block> {
    let mut unspent: Vec<(String, u32, Amount)> = Vec::new();
    let mut blocks = Vec::new();
    for (height, (miner, spends)) in plan.iter().enumerate() {
        let height = height as u32;
        let mut txs = vec![Tx {
            txid: txid(height, 0),
            vin: vec![Vin { coinbase: Some("00".into()), ..Default::default() }],
            vout: vec![Vout { value_sat: 50, n: 0, addresses: vec![ADDRESSES[*miner].into()], ..Default::default() }],
            ..Default::default()
        }];
        let mut created = vec![(txid(height, 0), 0u32, 50 as Amount)];
        for (i, (sel, to)) in spends.iter().enumerate() {
            if unspent.is_empty() {
                break;
            }
            let (prev, vout, value) = unspent.remove(sel % unspent.len());
            let id = txid(height, i + 1);
            let half = value / 2;
            txs.push(Tx {
                txid: id.clone(),
                vin: vec![Vin { txid: prev, vout, sequence: u32::MAX, ..Default::default() }],
                vout: vec![
                    Vout { value_sat: half, n: 0, addresses: vec![ADDRESSES[*to].into()], ..Default::default() },
                    Vout { value_sat: value - half, n: 1, addresses: vec![ADDRESSES[(to + 1) % 5].into()], ..Default::default() },
                ],
                ..Default::default()
            });
            created.push((id.clone(), 0, half));
            created.push((id, 1, value - half));
        }
        unspent.extend(created);
        blocks.push(Block {
            header: BlockHeader {
                hash: format!("{:064x}", height + 1),
                height,
                time: 1_600_000_000 + height as i64 * 600,
                size: 500,
                ..Default::default()
            },
            txs,
        });
    }
    blocks
}

fn open() -> (Indexer, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let ix = Indexer::open(dir.path().join("db"), Arc::new(Utf8Parser), "Testcoin", "TEST").unwrap();
    (ix, dir)
}

fn plan_strategy() -> impl Strategy<Value = Vec<BlockPlan>> {
    proptest::collection::vec(
        (0usize..5, proptest::collection::vec((any::<usize>(), 0usize..5), 0..4)),
        2..7,
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn disconnect_restores_store_bytewise(plan in plan_strategy(), split in 1usize..6) {
        let blocks = build_chain(&plan);
        let split = split.min(blocks.len() - 1);
        let (ix, _dir) = open();
        for b in &blocks[..split] {
            ix.connect_block(b).unwrap();
        }
        let before = ix.store().dump_index().unwrap();
        for b in &blocks[split..] {
            ix.connect_block(b).unwrap();
        }
        ix.disconnect_block_range(split as u32, blocks.len() as u32 - 1).unwrap();
        prop_assert_eq!(ix.store().dump_index().unwrap(), before);
    }

    #[test]
    fn balances_match_utxo_sums(plan in plan_strategy()) {
        let blocks = build_chain(&plan);
        let (ix, _dir) = open();
        for b in &blocks {
            ix.connect_block(b).unwrap();
        }
        for a in ADDRESSES {
            let ad = AddrDesc::new(a.as_bytes());
            if let Some(ab) = ix.get_addr_desc_balance(&ad, BalanceDetail::Utxo).unwrap() {
                prop_assert_eq!(ab.utxo_sum(), ab.balance);
                let mut txids = std::collections::HashSet::new();
                ix.get_addr_desc_transactions(&ad, 0, u32::MAX, |t, _, _| {
                    txids.insert(t.to_string());
                    Ok(IterControl::Continue)
                }).unwrap();
                prop_assert_eq!(txids.len() as u32, ab.txs);
            }
        }
    }
}

#[test]
fn every_connected_height_has_rows() {
    let plan: Vec<BlockPlan> = (0..4).map(|i| (i % 5, vec![(i, (i + 2) % 5)])).collect();
    let blocks = build_chain(&plan);
    let (ix, _dir) = open();
    for b in &blocks {
        ix.connect_block(b).unwrap();
    }
    for b in &blocks {
        let info = ix.get_block_info(b.header.height).unwrap().unwrap();
        assert_eq!(info.hash, b.header.hash);
        assert_eq!(info.txs as usize, b.txs.len());
        let txids: Vec<String> = b.txs.iter().map(|t| t.txid.clone()).collect();
        assert_eq!(ix.get_block_txids(b.header.height).unwrap(), txids);
    }
}
