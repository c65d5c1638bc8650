//! [`Parser`] for Bitcoin-like UTXO chains. The address descriptor of an
//! output is its raw `scriptPubKey`.

use blockdex_core::error::ParseError;
use blockdex_core::traits::Parser;
use blockdex_core::types::{AddrDesc, Block, ChainType, Tx, Vout};

use crate::address::{decode_base58check, decode_segwit, encode_base58check, encode_segwit, Network};
use crate::script::{classify, hash160, last_push, p2pkh_script, p2sh_script, witness_script, Destination};

#[derive(Debug, Clone)]
pub struct BitcoinParser {
    network: Network,
}

impl BitcoinParser {
    pub fn new(network: Network) -> Self {
        Self { network }
    }

    /// Parser for a configured network name, e.g. `main` or `testnet`.
    pub fn for_network(name: &str) -> Result<Self, ParseError> {
        Network::from_name(name)
            .map(Self::new)
            .ok_or(ParseError::Unsupported("unknown bitcoin network"))
    }

    pub fn network(&self) -> Network {
        self.network
    }

    fn script_from_address(&self, address: &str) -> Result<Vec<u8>, ParseError> {
        let invalid = || ParseError::InvalidAddress(address.to_string());
        let hrp = self.network.hrp();
        let looks_segwit = address
            .get(..=hrp.len())
            .is_some_and(|prefix| prefix.eq_ignore_ascii_case(&format!("{hrp}1")));
        if looks_segwit {
            let (version, program) = decode_segwit(hrp, address).map_err(|_| invalid())?;
            return Ok(witness_script(version, &program));
        }
        let (version, payload) = decode_base58check(address).map_err(|_| invalid())?;
        let hash: [u8; 20] = payload.as_slice().try_into().map_err(|_| invalid())?;
        if version == self.network.p2pkh_version() {
            Ok(p2pkh_script(&hash))
        } else if version == self.network.p2sh_version() {
            Ok(p2sh_script(&hash))
        } else {
            Err(invalid())
        }
    }
}

impl Parser for BitcoinParser {
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
        if !vout.script_pubkey_hex.is_empty() {
            return hex::decode(&vout.script_pubkey_hex)
                .map(AddrDesc::new)
                .map_err(|_| ParseError::InvalidAddress(vout.script_pubkey_hex.clone()));
        }
        match vout.addresses.first() {
            Some(a) => self.get_addr_desc_from_address(a),
            None => Err(ParseError::AddressMissing),
        }
    }

    fn parse_block(&self, raw: &[u8]) -> Result<Block, ParseError> {
        crate::raw::decode_block(raw)
    }

    fn get_addr_desc_from_address(&self, address: &str) -> Result<AddrDesc, ParseError> {
        if address.is_empty() {
            return Err(ParseError::AddressMissing);
        }
        self.script_from_address(address).map(AddrDesc::new)
    }

    fn get_addresses_from_addr_desc(&self, ad: &AddrDesc) -> Result<(Vec<String>, bool), ParseError> {
        let n = self.network;
        Ok(match classify(ad.as_bytes()) {
            Destination::P2pkh(h) => (vec![encode_base58check(n.p2pkh_version(), &h)], true),
            Destination::P2sh(h) => (vec![encode_base58check(n.p2sh_version(), &h)], true),
            Destination::Witness { version, program } => match encode_segwit(n.hrp(), version, &program) {
                Some(a) => (vec![a], true),
                None => (vec![hex::encode(ad.as_bytes())], false),
            },
            Destination::P2pk(key) => (vec![encode_base58check(n.p2pkh_version(), &hash160(&key))], false),
            Destination::OpReturn(data) => (vec![format!("OP_RETURN {}", hex::encode(data))], false),
            Destination::NonStandard => (vec![hex::encode(ad.as_bytes())], false),
        })
    }

    /// A pruned P2PKH spend still carries the public key in its scriptSig.
    fn addr_desc_for_unknown_input(&self, tx: &Tx, input: usize) -> AddrDesc {
        let Some(vin) = tx.vin.get(input) else {
            return AddrDesc::default();
        };
        let Ok(script_sig) = hex::decode(&vin.script_sig_hex) else {
            return AddrDesc::default();
        };
        match last_push(&script_sig) {
            Some(key) if matches!((key.len(), key.first()), (33, Some(2 | 3)) | (65, Some(4))) => {
                AddrDesc::new(p2pkh_script(&hash160(key)))
            }
            _ => AddrDesc::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blockdex_core::types::Vin;

    fn mainnet() -> BitcoinParser {
        BitcoinParser::new(Network::Mainnet)
    }

    fn round_trip(p: &BitcoinParser, address: &str) -> (Vec<String>, bool) {
        let ad = p.get_addr_desc_from_address(address).unwrap();
        p.get_addresses_from_addr_desc(&ad).unwrap()
    }

    // --- Addresses ---

    #[test]
    fn standard_addresses_round_trip() {
        let p = mainnet();
        for a in [
            "1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa",
            "bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4",
            "bc1p0xlxvlhemja6c4dqv22uapctqupfhlxm9h8z3k2e72q4k9hcz7vqzk5jj0",
        ] {
            assert_eq!(round_trip(&p, a), (vec![a.to_string()], true), "{a}");
        }
        let ad = p.get_addr_desc_from_address("1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa").unwrap();
        assert_eq!(hex::encode(ad.as_bytes()), "76a91462e907b15cbf27d5425399ebf6f0fb50ebb88f1888ac");
    }

    #[test]
    fn uppercase_segwit_is_normalised() {
        let (addrs, searchable) = round_trip(&mainnet(), "BC1QW508D6QEJXTDG4Y5R3ZARVARY0C5XW7KV8F3T4");
        assert!(searchable);
        assert_eq!(addrs[0], "bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4");
    }

    #[test]
    fn foreign_network_addresses_are_invalid() {
        let p = mainnet();
        let testnet = BitcoinParser::new(Network::Testnet);
        let ad = p.get_addr_desc_from_address("1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa").unwrap();
        let (tb, _) = testnet.get_addresses_from_addr_desc(&ad).unwrap();
        assert!(matches!(p.get_addr_desc_from_address(&tb[0]), Err(ParseError::InvalidAddress(_))));
        assert!(matches!(p.get_addr_desc_from_address(""), Err(ParseError::AddressMissing)));
        assert!(matches!(p.get_addr_desc_from_address("bc1qnotvalid"), Err(ParseError::InvalidAddress(_))));
    }

    #[test]
    fn non_standard_scripts_are_not_searchable() {
        let p = mainnet();
        let op_return = AddrDesc::new(hex::decode("6a0568656c6c6f").unwrap());
        assert_eq!(
            p.get_addresses_from_addr_desc(&op_return).unwrap(),
            (vec!["OP_RETURN 68656c6c6f".to_string()], false)
        );
        let odd = AddrDesc::new(vec![0x51, 0x52, 0x93]);
        assert_eq!(p.get_addresses_from_addr_desc(&odd).unwrap(), (vec!["515293".to_string()], false));
    }

    // --- Outputs and inputs ---

    #[test]
    fn vout_descriptor_prefers_script() {
        let p = mainnet();
        let vout = Vout {
            script_pubkey_hex: "0014751e76e8199196d454941c45d1b3a323f1433bd6".into(),
            addresses: vec!["1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa".into()],
            ..Default::default()
        };
        assert_eq!(p.get_addr_desc_from_vout(&vout).unwrap().len(), 22);
        let by_address = Vout { script_pubkey_hex: String::new(), ..vout };
        assert_eq!(p.get_addr_desc_from_vout(&by_address).unwrap().len(), 25);
        assert!(matches!(p.get_addr_desc_from_vout(&Vout::default()), Err(ParseError::AddressMissing)));
    }

    #[test]
    fn unknown_input_falls_back_to_script_sig_key() {
        let key = [0x02u8; 33];
        let mut script_sig = vec![71u8];
        script_sig.extend([0x30u8; 71]);
        script_sig.push(33);
        script_sig.extend(key);
        let tx = Tx {
            vin: vec![Vin { txid: "ab".repeat(32), script_sig_hex: hex::encode(&script_sig), ..Default::default() }],
            ..Default::default()
        };
        let ad = mainnet().addr_desc_for_unknown_input(&tx, 0);
        assert_eq!(ad.as_bytes(), p2pkh_script(&hash160(&key)).as_slice());
        assert!(mainnet().addr_desc_for_unknown_input(&tx, 1).is_empty());
    }

    #[test]
    fn txids_pack_to_32_bytes() {
        let p = mainnet();
        let txid = "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b";
        let packed = p.pack_txid(txid).unwrap();
        assert_eq!(packed.len(), 32);
        assert_eq!(p.unpack_txid(&packed).unwrap(), txid);
    }
}
