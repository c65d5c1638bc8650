//! Capability traits implemented per chain family.
//!
//! - [`Parser`] — address descriptors, txid packing, tx serialisation, xpub derivation
//! - [`BackendClient`] — block/tx/mempool/fee access to a backend node
//!
//! The indexer never switches on coin identity; it only branches on
//! [`Parser::chain_type`].

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::{BackendError, ParseError};
use crate::types::{
    AddrDesc, Amount, Block, BlockHeader, BlockId, ChainInfo, ChainType, ContractInfo, Tx, Vout,
};

/// Stored form of a packed transaction.
#[derive(bincode::Encode, bincode::Decode)]
struct PackedTx {
    height: u32,
    block_time: i64,
    tx: Tx,
}

/// Chain-specific decoding and address handling.
///
/// Implementations are stateless apart from network parameters and must be
/// usable from many threads at once.
pub trait Parser: Send + Sync {
    fn chain_type(&self) -> ChainType;

    /// Number of decimal places of the base unit (8 for BTC, 18 for ETH).
    fn amount_decimals(&self) -> u8;

    /// Byte length of a packed txid; fixed per parser.
    fn packed_txid_len(&self) -> usize;

    /// Address descriptor of an output. Fails if the output has no
    /// recognisable destination.
    fn get_addr_desc_from_vout(&self, vout: &Vout) -> Result<AddrDesc, ParseError>;

    /// Address descriptor of a user supplied address string.
    fn get_addr_desc_from_address(&self, address: &str) -> Result<AddrDesc, ParseError>;

    /// Human readable addresses for a descriptor and whether the descriptor
    /// is searchable (i.e. a standard destination).
    fn get_addresses_from_addr_desc(&self, ad: &AddrDesc) -> Result<(Vec<String>, bool), ParseError>;

    /// Decode a raw serialised block.
    fn parse_block(&self, _raw: &[u8]) -> Result<Block, ParseError> {
        Err(ParseError::Unsupported("parse_block"))
    }

    /// Serialise a confirmed transaction with its height and block time for
    /// the transaction cache.
    fn pack_tx(&self, tx: &Tx, height: u32, block_time: i64) -> Result<Vec<u8>, ParseError> {
        let mut tx = tx.clone();
        tx.confirmations = 0;
        let packed = PackedTx { height, block_time, tx };
        bincode::encode_to_vec(&packed, bincode::config::standard())
            .map_err(|e| ParseError::Serialization(e.to_string()))
    }

    /// Inverse of [`pack_tx`](Self::pack_tx). Returns the transaction and its height.
    fn unpack_tx(&self, buf: &[u8]) -> Result<(Tx, u32), ParseError> {
        let (packed, _): (PackedTx, usize) =
            bincode::decode_from_slice(buf, bincode::config::standard())
                .map_err(|e| ParseError::Serialization(e.to_string()))?;
        let mut tx = packed.tx;
        tx.block_height = packed.height;
        tx.block_time = packed.block_time;
        Ok((tx, packed.height))
    }

    fn pack_txid(&self, txid: &str) -> Result<Vec<u8>, ParseError> {
        if txid.is_empty() {
            return Err(ParseError::TxidMissing);
        }
        let s = txid.strip_prefix("0x").unwrap_or(txid);
        let bytes = hex::decode(s).map_err(|_| ParseError::InvalidTxid(txid.to_string()))?;
        if bytes.len() != self.packed_txid_len() {
            return Err(ParseError::InvalidTxid(txid.to_string()));
        }
        Ok(bytes)
    }

    fn unpack_txid(&self, buf: &[u8]) -> Result<String, ParseError> {
        if buf.len() != self.packed_txid_len() {
            return Err(ParseError::InvalidTxid(hex::encode(buf)));
        }
        Ok(match self.chain_type() {
            ChainType::Ethereum => format!("0x{}", hex::encode(buf)),
            ChainType::Bitcoin => hex::encode(buf),
        })
    }

    /// Derive address descriptors `from..to` on the given change branch of an xpub.
    fn derive_address_descriptors_from_to(
        &self,
        _xpub: &str,
        _change: u32,
        _from: u32,
        _to: u32,
    ) -> Result<Vec<AddrDesc>, ParseError> {
        Err(ParseError::Unsupported("xpub derivation"))
    }

    /// Descriptor for an input whose previous output is unknown locally
    /// (pruned or never indexed).
    fn addr_desc_for_unknown_input(&self, _tx: &Tx, _input: usize) -> AddrDesc {
        AddrDesc::default()
    }

    fn minimum_coinbase_confirmations(&self) -> u32 {
        crate::constants::DEFAULT_MINIMUM_COINBASE_CONFIRMATIONS
    }
}

/// Access to a backend node of one chain family.
///
/// Every call may block on the network; callers wrap calls in timeouts.
/// "Not found" is reported as [`BackendError::NotFound`], distinct from
/// transport failures.
#[async_trait]
pub trait BackendClient: Send + Sync {
    async fn get_chain_info(&self) -> Result<ChainInfo, BackendError>;

    async fn get_best_block_height(&self) -> Result<u32, BackendError>;

    async fn get_best_block_hash(&self) -> Result<String, BackendError>;

    async fn get_block_hash(&self, height: u32) -> Result<String, BackendError>;

    async fn get_block_header(&self, hash: &str) -> Result<BlockHeader, BackendError>;

    async fn get_block(&self, id: &BlockId) -> Result<Block, BackendError>;

    /// Raw serialised block as hex.
    async fn get_block_raw(&self, _hash: &str) -> Result<String, BackendError> {
        Err(BackendError::Unsupported("get_block_raw"))
    }

    async fn get_transaction(&self, txid: &str) -> Result<Tx, BackendError>;

    /// Variant used by the mempool; backends may skip expensive enrichment.
    async fn get_transaction_for_mempool(&self, txid: &str) -> Result<Tx, BackendError> {
        self.get_transaction(txid).await
    }

    /// Backend-native JSON of a transaction, passed through to API clients.
    async fn get_transaction_specific(&self, tx: &Tx) -> Result<serde_json::Value, BackendError>;

    async fn get_mempool_transactions(&self) -> Result<Vec<String>, BackendError>;

    /// Fee per kilobyte for confirmation within `blocks`.
    async fn estimate_fee(&self, blocks: u32) -> Result<Amount, BackendError>;

    async fn estimate_smart_fee(&self, blocks: u32, conservative: bool) -> Result<Amount, BackendError>;

    /// Broadcast a signed transaction; returns its txid.
    async fn send_raw_transaction(&self, hex: &str) -> Result<String, BackendError>;

    async fn get_balance(&self, _ad: &AddrDesc) -> Result<Amount, BackendError> {
        Err(BackendError::Unsupported("get_balance"))
    }

    async fn get_nonce(&self, _ad: &AddrDesc) -> Result<u64, BackendError> {
        Err(BackendError::Unsupported("get_nonce"))
    }

    /// Token metadata of a contract, `None` if the address is not a token contract.
    async fn get_contract_info(&self, _contract: &AddrDesc) -> Result<Option<ContractInfo>, BackendError> {
        Err(BackendError::Unsupported("get_contract_info"))
    }

    async fn get_contract_balance(&self, _ad: &AddrDesc, _contract: &AddrDesc) -> Result<Amount, BackendError> {
        Err(BackendError::Unsupported("get_contract_balance"))
    }

    /// Stream of headers of newly accepted blocks.
    fn subscribe_new_block(&self) -> broadcast::Receiver<BlockHeader>;

    /// Stream of txids newly accepted to the backend mempool.
    fn subscribe_new_tx(&self) -> broadcast::Receiver<String>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EthereumTxData, Vin};

    // ------------------------------------------------------------------
    // Mock: parser relying on default methods
    // ------------------------------------------------------------------

    struct HexParser(ChainType);

    impl Parser for HexParser {
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
            hex::decode(&vout.script_pubkey_hex)
                .map(AddrDesc)
                .map_err(|e| ParseError::InvalidAddress(e.to_string()))
        }
        fn get_addr_desc_from_address(&self, address: &str) -> Result<AddrDesc, ParseError> {
            Ok(AddrDesc::new(address.as_bytes()))
        }
        fn get_addresses_from_addr_desc(&self, ad: &AddrDesc) -> Result<(Vec<String>, bool), ParseError> {
            Ok((vec![String::from_utf8_lossy(ad.as_bytes()).into_owned()], true))
        }
    }

    fn sample_tx() -> Tx {
        Tx {
            txid: "ab".repeat(32),
            version: 2,
            lock_time: 0,
            vin: vec![Vin { txid: "cd".repeat(32), vout: 1, sequence: 0xffff_fffd, ..Default::default() }],
            vout: vec![Vout { value_sat: 12_345, n: 0, script_pubkey_hex: "0014aa".into(), addresses: vec!["addr".into()] }],
            block_height: 0,
            block_hash: None,
            block_time: 0,
            time: 0,
            confirmations: 7,
            size: 200,
            vsize: 141,
            hex: String::new(),
            eth: None,
        }
    }

    #[test]
    fn pack_tx_round_trips_with_height() {
        let p = HexParser(ChainType::Bitcoin);
        let tx = sample_tx();
        let buf = p.pack_tx(&tx, 500, 1_600_000_000).unwrap();
        let (back, height) = p.unpack_tx(&buf).unwrap();
        assert_eq!(height, 500);
        assert_eq!(back.block_time, 1_600_000_000);
        assert_eq!(back.block_height, 500);
        assert_eq!(back.confirmations, 0, "confirmations are never persisted");
        assert_eq!(back.vin, tx.vin);
        assert_eq!(back.vout, tx.vout);
    }

    #[test]
    fn pack_tx_keeps_ethereum_specifics() {
        let p = HexParser(ChainType::Ethereum);
        let mut tx = sample_tx();
        tx.eth = Some(EthereumTxData { nonce: 9, gas_limit: 21_000, gas_price: 7, gas_used: Some(21_000), ..Default::default() });
        let (back, _) = p.unpack_tx(&p.pack_tx(&tx, 1, 2).unwrap()).unwrap();
        assert_eq!(back.eth, tx.eth);
    }

    #[test]
    fn unpack_tx_rejects_garbage() {
        let p = HexParser(ChainType::Bitcoin);
        assert!(p.unpack_tx(&[0xff, 0xff, 0xff]).is_err());
    }

    #[test]
    fn pack_txid_checks_length() {
        let p = HexParser(ChainType::Bitcoin);
        assert_eq!(p.pack_txid(&"00".repeat(32)).unwrap().len(), 32);
        assert!(matches!(p.pack_txid(""), Err(ParseError::TxidMissing)));
        assert!(matches!(p.pack_txid("abcd"), Err(ParseError::InvalidTxid(_))));
        assert!(matches!(p.pack_txid("zz"), Err(ParseError::InvalidTxid(_))));
    }

    #[test]
    fn ethereum_txids_are_0x_prefixed() {
        let p = HexParser(ChainType::Ethereum);
        let packed = p.pack_txid(&format!("0x{}", "11".repeat(32))).unwrap();
        assert_eq!(p.unpack_txid(&packed).unwrap(), format!("0x{}", "11".repeat(32)));
        let p = HexParser(ChainType::Bitcoin);
        assert_eq!(p.unpack_txid(&packed).unwrap(), "11".repeat(32));
    }

    #[test]
    fn default_xpub_derivation_is_unsupported() {
        let p = HexParser(ChainType::Bitcoin);
        assert!(matches!(
            p.derive_address_descriptors_from_to("xpub", 0, 0, 10),
            Err(ParseError::Unsupported(_))
        ));
        assert!(p.addr_desc_for_unknown_input(&sample_tx(), 0).is_empty());
    }
}
