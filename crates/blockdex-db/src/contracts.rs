//! Token contract metadata and four-byte function signatures.

use blockdex_core::error::BlockdexError;
use blockdex_core::pack::{pack_u32_be, unpack_u32_be};
use blockdex_core::types::{AddrDesc, ContractInfo};
use serde::{Deserialize, Serialize};

use crate::index::Indexer;
use crate::store::{Column, IterFrom, StoreBatch};

/// Decoded name and parameter types of a function selector.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct FourByteSignature {
    pub name: String,
    pub parameters: Vec<String>,
}

fn encode<T: bincode::Encode>(v: &T) -> Result<Vec<u8>, BlockdexError> {
    bincode::encode_to_vec(v, bincode::config::standard()).map_err(|e| BlockdexError::Codec(e.to_string()))
}

fn decode<T: bincode::Decode<()>>(buf: &[u8]) -> Result<T, BlockdexError> {
    bincode::decode_from_slice(buf, bincode::config::standard())
        .map(|(v, _)| v)
        .map_err(|e| BlockdexError::Codec(e.to_string()))
}

fn four_byte_key(selector: u32, id: u32) -> [u8; 8] {
    let mut key = [0u8; 8];
    key[..4].copy_from_slice(&pack_u32_be(selector));
    key[4..].copy_from_slice(&pack_u32_be(id));
    key
}

impl Indexer {
    // --- Contracts ---

    pub fn get_contract_info(&self, contract: &AddrDesc) -> Result<Option<ContractInfo>, BlockdexError> {
        match self.store.get(Column::Contracts, contract.as_bytes())? {
            Some(v) => Ok(Some(decode(&v)?)),
            None => Ok(None),
        }
    }

    pub fn get_contract_info_for_address(&self, address: &str) -> Result<Option<ContractInfo>, BlockdexError> {
        let ad = self.parser.get_addr_desc_from_address(address)?;
        self.get_contract_info(&ad)
    }

    /// Store contract metadata outside of block processing, e.g. after a
    /// metadata refresh.
    pub fn store_contract_info(&self, info: &ContractInfo) -> Result<(), BlockdexError> {
        let ad = self.parser.get_addr_desc_from_address(&info.contract)?;
        self.store.put(Column::Contracts, ad.as_bytes(), &encode(info)?)
    }

    pub(crate) fn put_contract_info(
        &self,
        batch: &mut StoreBatch<'_>,
        ad: &AddrDesc,
        info: &ContractInfo,
    ) -> Result<(), BlockdexError> {
        batch.put(Column::Contracts, ad.as_bytes(), &encode(info)?)
    }

    // --- Four-byte signatures ---

    pub fn store_four_byte_signature(
        &self,
        selector: u32,
        id: u32,
        sig: &FourByteSignature,
    ) -> Result<(), BlockdexError> {
        self.store.put(Column::FourByte, &four_byte_key(selector, id), &encode(sig)?)
    }

    pub fn get_four_byte_signature(&self, selector: u32, id: u32) -> Result<Option<FourByteSignature>, BlockdexError> {
        match self.store.get(Column::FourByte, &four_byte_key(selector, id))? {
            Some(v) => Ok(Some(decode(&v)?)),
            None => Ok(None),
        }
    }

    /// All signatures registered for `selector`, ascending by id.
    pub fn get_four_byte_signatures(&self, selector: u32) -> Result<Vec<(u32, FourByteSignature)>, BlockdexError> {
        let prefix = pack_u32_be(selector);
        let mut out = Vec::new();
        for item in self.store.iter(Column::FourByte, IterFrom::Forward(&prefix))? {
            let (k, v) = item?;
            if k.len() != 8 || k[..4] != prefix {
                break;
            }
            out.push((unpack_u32_be(&k[4..])?, decode(&v)?));
        }
        Ok(out)
    }
}
