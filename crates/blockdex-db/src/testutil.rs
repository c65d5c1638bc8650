//! Minimal chain fixtures for the unit tests of this crate.

use std::sync::Arc;

use blockdex_core::error::ParseError;
use blockdex_core::traits::Parser;
use blockdex_core::types::{
    AddrDesc, Amount, Block, BlockHeader, ChainType, EthereumTxData, Tx, Vin, Vout,
};

use crate::index::Indexer;

/// Descriptors are the UTF-8 bytes of the address.
pub struct TestParser(pub ChainType);

impl Parser for TestParser {
    fn chain_type(&self) -> ChainType {
        self.0
    }

    fn amount_decimals(&self) -> u8 {
        8
    }

    fn packed_txid_len(&self) -> usize {
        32
    }

    fn get_addr_desc_from_vout(&self, vout: &Vout) -> Result<AddrDesc, ParseError> {
        vout.addresses
            .first()
            .map(|a| AddrDesc::new(a.as_bytes()))
            .ok_or(ParseError::AddressMissing)
    }

    fn get_addr_desc_from_address(&self, address: &str) -> Result<AddrDesc, ParseError> {
        if address.is_empty() {
            return Err(ParseError::InvalidAddress(address.into()));
        }
        Ok(AddrDesc::new(address.as_bytes()))
    }

    fn get_addresses_from_addr_desc(&self, ad: &AddrDesc) -> Result<(Vec<String>, bool), ParseError> {
        Ok((vec![String::from_utf8_lossy(ad.as_bytes()).into_owned()], true))
    }
}

pub fn txid(n: u32) -> String {
    format!("{n:064x}")
}

pub fn block_hash(height: u32) -> String {
    format!("{:064x}", 0xb000_0000u64 + height as u64)
}

pub fn block_time(height: u32) -> i64 {
    1_500_000_000 + height as i64 * 600
}

fn outputs(outs: &[(&str, Amount)]) -> Vec<Vout> {
    outs.iter()
        .enumerate()
        .map(|(n, (addr, value))| Vout {
            value_sat: *value,
            n: n as u32,
            addresses: vec![addr.to_string()],
            ..Default::default()
        })
        .collect()
}

pub fn coinbase_tx(id: u32, outs: &[(&str, Amount)]) -> Tx {
    Tx {
        txid: txid(id),
        vin: vec![Vin { coinbase: Some("03".into()), ..Default::default() }],
        vout: outputs(outs),
        ..Default::default()
    }
}

/// Tx spending `(prev id, vout)` outpoints.
pub fn spend_tx(id: u32, inputs: &[(u32, u32)], outs: &[(&str, Amount)]) -> Tx {
    Tx {
        txid: txid(id),
        vin: inputs
            .iter()
            .map(|(p, v)| Vin { txid: txid(*p), vout: *v, sequence: u32::MAX, ..Default::default() })
            .collect(),
        vout: outputs(outs),
        ..Default::default()
    }
}

/// Account-model tx from `from` to `to` carrying `value`.
pub fn eth_tx(id: u32, from: &str, to: &str, value: Amount, eth: EthereumTxData) -> Tx {
    Tx {
        txid: txid(id),
        vin: vec![Vin { addresses: vec![from.to_string()], ..Default::default() }],
        vout: vec![Vout { value_sat: value, addresses: vec![to.to_string()], ..Default::default() }],
        eth: Some(eth),
        ..Default::default()
    }
}

pub fn block(height: u32, txs: Vec<Tx>) -> Block {
    Block {
        header: BlockHeader {
            hash: block_hash(height),
            prev: if height == 0 { String::new() } else { block_hash(height - 1) },
            height,
            time: block_time(height),
            size: 1000,
            ..Default::default()
        },
        txs,
    }
}

pub fn temp_indexer_for(chain: ChainType) -> (Indexer, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let ix = Indexer::open(dir.path().join("db"), Arc::new(TestParser(chain)), "Testcoin", "TEST").unwrap();
    (ix, dir)
}

pub fn temp_indexer() -> (Indexer, tempfile::TempDir) {
    temp_indexer_for(ChainType::Bitcoin)
}
