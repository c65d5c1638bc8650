//! Address string codecs: Base58Check for legacy addresses and
//! Bech32/Bech32m ([BIP-173], [BIP-350]) for segwit addresses.
//!
//! [BIP-173]: https://github.com/bitcoin/bips/blob/master/bip-0173.mediawiki
//! [BIP-350]: https://github.com/bitcoin/bips/blob/master/bip-0350.mediawiki

use bech32::{segwit, Fe32, Hrp};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("invalid HRP")] InvalidHrp,
    #[error("invalid length")] InvalidLength,
    #[error("invalid checksum")] InvalidChecksum,
    #[error("invalid base58: {0}")] Base58(String),
    #[error("invalid segwit address: {0}")] Segwit(String),
}

/// Bitcoin network, selecting address prefixes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Network {
    Mainnet,
    Testnet,
    Regtest,
}

impl Network {
    /// Network for a configured network or coin shortcut name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "" | "main" | "mainnet" | "btc" | "bitcoin" => Some(Self::Mainnet),
            "test" | "testnet" | "testnet3" | "testnet4" | "signet" | "tbtc" => Some(Self::Testnet),
            "regtest" => Some(Self::Regtest),
            _ => None,
        }
    }

    /// Human-readable part of segwit addresses.
    pub fn hrp(&self) -> &'static str {
        match self {
            Network::Mainnet => "bc",
            Network::Testnet => "tb",
            Network::Regtest => "bcrt",
        }
    }

    pub fn p2pkh_version(&self) -> u8 {
        match self {
            Network::Mainnet => 0x00,
            Network::Testnet | Network::Regtest => 0x6f,
        }
    }

    pub fn p2sh_version(&self) -> u8 {
        match self {
            Network::Mainnet => 0x05,
            Network::Testnet | Network::Regtest => 0xc4,
        }
    }
}

// --- Base58Check ---

fn checksum(payload: &[u8]) -> [u8; 4] {
    let hash = Sha256::digest(Sha256::digest(payload));
    [hash[0], hash[1], hash[2], hash[3]]
}

/// Encode `version || payload || checksum` in Base58.
pub fn encode_base58check(version: u8, payload: &[u8]) -> String {
    let mut data = Vec::with_capacity(1 + payload.len() + 4);
    data.push(version);
    data.extend_from_slice(payload);
    let check = checksum(&data);
    data.extend_from_slice(&check);
    bs58::encode(data).into_string()
}

/// Decode a Base58Check string into its version byte and payload.
pub fn decode_base58check(s: &str) -> Result<(u8, Vec<u8>), AddressError> {
    let data = bs58::decode(s).into_vec().map_err(|e| AddressError::Base58(e.to_string()))?;
    if data.len() < 5 {
        return Err(AddressError::InvalidLength);
    }
    let (body, check) = data.split_at(data.len() - 4);
    if checksum(body) != check {
        return Err(AddressError::InvalidChecksum);
    }
    Ok((body[0], body[1..].to_vec()))
}

// --- Segwit ---

/// Encode a witness program as a segwit address; bech32 for version 0,
/// bech32m above. Returns `None` for an invalid version or program length.
pub fn encode_segwit(hrp: &str, version: u8, program: &[u8]) -> Option<String> {
    let hrp = Hrp::parse(hrp).ok()?;
    let version = Fe32::try_from(version).ok()?;
    segwit::encode(hrp, version, program).ok()
}

/// Decode a segwit address of the given HRP into `(version, program)`.
pub fn decode_segwit(hrp: &str, s: &str) -> Result<(u8, Vec<u8>), AddressError> {
    let (got, version, program) = segwit::decode(s).map_err(|e| AddressError::Segwit(e.to_string()))?;
    if !got.as_str().eq_ignore_ascii_case(hrp) {
        return Err(AddressError::InvalidHrp);
    }
    Ok((version.to_u8(), program))
}
