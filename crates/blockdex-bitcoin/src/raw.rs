//! Consensus decoding of raw blocks and transactions, used when the indexer
//! parses blocks itself instead of relying on the node's verbose JSON.
//!
//! Heights are not part of the wire format; the caller fills them in.

use sha2::{Digest, Sha256};

use blockdex_core::error::ParseError;
use blockdex_core::types::{Block, BlockHeader, Tx, Vin, Vout};

const HEADER_LEN: usize = 80;
/// Upper bound of any length prefix; larger values are malformed input.
const MAX_COMPACT_SIZE: u64 = 0x0200_0000;
const COINBASE_VOUT: u32 = u32::MAX;
const WITNESS_SCALE: usize = 4;

fn invalid(what: impl Into<String>) -> ParseError {
    ParseError::InvalidBlock(what.into())
}

fn double_sha256(data: &[u8]) -> [u8; 32] {
    let first = Sha256::digest(data);
    Sha256::digest(first).into()
}

/// Hashes display byte-reversed.
fn hash_hex(bytes: &[u8]) -> String {
    let mut b = bytes.to_vec();
    b.reverse();
    hex::encode(b)
}

struct Decoder<'a> {
    input: &'a [u8],
    cursor: usize,
}

impl<'a> Decoder<'a> {
    fn new(input: &'a [u8]) -> Self {
        Self { input, cursor: 0 }
    }

    fn remaining(&self) -> usize {
        self.input.len().saturating_sub(self.cursor)
    }

    fn read_slice(&mut self, len: usize) -> Result<&'a [u8], ParseError> {
        if self.remaining() < len {
            return Err(invalid("unexpected end of input"));
        }
        let start = self.cursor;
        self.cursor += len;
        Ok(&self.input[start..start + len])
    }

    fn peek(&self, offset: usize) -> Option<u8> {
        self.input.get(self.cursor + offset).copied()
    }

    fn read_u8(&mut self) -> Result<u8, ParseError> {
        Ok(self.read_slice(1)?[0])
    }

    fn read_fixed<const N: usize>(&mut self) -> Result<[u8; N], ParseError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_slice(N)?);
        Ok(out)
    }

    fn read_u32_le(&mut self) -> Result<u32, ParseError> {
        Ok(u32::from_le_bytes(self.read_fixed()?))
    }

    fn read_u64_le(&mut self) -> Result<u64, ParseError> {
        Ok(u64::from_le_bytes(self.read_fixed()?))
    }

    /// CompactSize; non-canonical encodings are rejected.
    fn read_varint(&mut self) -> Result<u64, ParseError> {
        let value = match self.read_u8()? {
            p @ 0..=0xfc => u64::from(p),
            0xfd => {
                let v = u64::from(u16::from_le_bytes(self.read_fixed()?));
                if v < 0xfd {
                    return Err(invalid("non-canonical CompactSize"));
                }
                v
            }
            0xfe => {
                let v = u64::from(self.read_u32_le()?);
                if v < 0x1_0000 {
                    return Err(invalid("non-canonical CompactSize"));
                }
                v
            }
            0xff => {
                let v = self.read_u64_le()?;
                if v < 0x1_0000_0000 {
                    return Err(invalid("non-canonical CompactSize"));
                }
                v
            }
        };
        if value > MAX_COMPACT_SIZE {
            return Err(invalid("CompactSize exceeds maximum"));
        }
        Ok(value)
    }

    fn read_len(&mut self) -> Result<usize, ParseError> {
        // Bounded by MAX_COMPACT_SIZE, so it fits.
        Ok(self.read_varint()? as usize)
    }

    fn read_var_bytes(&mut self) -> Result<&'a [u8], ParseError> {
        let len = self.read_len()?;
        self.read_slice(len)
    }
}

/// Decode one transaction at the decoder position.
fn decode_tx(d: &mut Decoder<'_>) -> Result<Tx, ParseError> {
    let start = d.cursor;
    let version = i32::from_le_bytes(d.read_fixed()?);
    // Segwit: a zero input count followed by flag 1.
    let segwit = d.peek(0) == Some(0) && d.peek(1) == Some(1);
    if segwit {
        d.read_slice(2)?;
    }
    let body_start = d.cursor;

    let n_in = d.read_len()?;
    let mut vin = Vec::with_capacity(n_in.min(d.remaining() / 41));
    for _ in 0..n_in {
        let prev: [u8; 32] = d.read_fixed()?;
        let vout = d.read_u32_le()?;
        let script = d.read_var_bytes()?;
        let sequence = d.read_u32_le()?;
        let coinbase = vout == COINBASE_VOUT && prev.iter().all(|b| *b == 0);
        vin.push(if coinbase {
            Vin { coinbase: Some(hex::encode(script)), sequence, ..Default::default() }
        } else {
            Vin { txid: hash_hex(&prev), vout, script_sig_hex: hex::encode(script), sequence, ..Default::default() }
        });
    }

    let n_out = d.read_len()?;
    let mut vout = Vec::with_capacity(n_out.min(d.remaining() / 9));
    for n in 0..n_out {
        let value = d.read_u64_le()?;
        let script = d.read_var_bytes()?;
        vout.push(Vout {
            value_sat: u128::from(value),
            n: n as u32,
            script_pubkey_hex: hex::encode(script),
            addresses: Vec::new(),
        });
    }
    let body_end = d.cursor;

    if segwit {
        for _ in 0..n_in {
            let items = d.read_len()?;
            for _ in 0..items {
                d.read_var_bytes()?;
            }
        }
    }
    let lock_time_at = d.cursor;
    let lock_time = d.read_u32_le()?;
    let end = d.cursor;

    let raw = &d.input[start..end];
    let txid = if segwit {
        let mut stripped = Vec::with_capacity(4 + (body_end - body_start) + 4);
        stripped.extend_from_slice(&raw[..4]);
        stripped.extend_from_slice(&d.input[body_start..body_end]);
        stripped.extend_from_slice(&d.input[lock_time_at..end]);
        hash_hex(&double_sha256(&stripped))
    } else {
        hash_hex(&double_sha256(raw))
    };
    let total = raw.len();
    let base = if segwit { 4 + (body_end - body_start) + 4 } else { total };
    let weight = base * (WITNESS_SCALE - 1) + total;

    Ok(Tx {
        txid,
        version,
        lock_time,
        vin,
        vout,
        size: total as u32,
        vsize: weight.div_ceil(WITNESS_SCALE) as u32,
        hex: hex::encode(raw),
        ..Default::default()
    })
}

/// Decode a serialized block. The header's height is left at 0.
pub fn decode_block(raw: &[u8]) -> Result<Block, ParseError> {
    let mut d = Decoder::new(raw);
    let header = d.read_slice(HEADER_LEN)?;
    let prev = &header[4..36];
    let time = u32::from_le_bytes([header[68], header[69], header[70], header[71]]);
    let hash = hash_hex(&double_sha256(header));

    let count = d.read_len()?;
    let mut txs = Vec::with_capacity(count.min(d.remaining() / 60));
    for _ in 0..count {
        let mut tx = decode_tx(&mut d)?;
        tx.block_hash = Some(hash.clone());
        tx.block_time = i64::from(time);
        tx.time = i64::from(time);
        txs.push(tx);
    }
    if d.remaining() != 0 {
        return Err(invalid(format!("{} trailing bytes after block", d.remaining())));
    }
    Ok(Block {
        header: BlockHeader {
            hash,
            prev: hash_hex(prev),
            size: raw.len() as u32,
            time: i64::from(time),
            ..Default::default()
        },
        txs,
    })
}

/// Decode a single serialized transaction.
pub fn decode_transaction(raw: &[u8]) -> Result<Tx, ParseError> {
    let mut d = Decoder::new(raw);
    let tx = decode_tx(&mut d)?;
    if d.remaining() != 0 {
        return Err(invalid("trailing bytes after transaction"));
    }
    Ok(tx)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// The mainnet genesis block.
    const GENESIS: &str = concat!(
        "0100000000000000000000000000000000000000000000000000000000000000000000003ba3edfd7a7b12b27ac72c3e",
        "67768f617fc81bc3888a51323a9fb8aa4b1e5e4a29ab5f49ffff001d1dac2b7c01010000000100000000000000000000",
        "00000000000000000000000000000000000000000000ffffffff4d04ffff001d0104455468652054696d65732030332f",
        "4a616e2f32303039204368616e63656c6c6f72206f6e206272696e6b206f66207365636f6e64206261696c6f75742066",
        "6f722062616e6b73ffffffff0100f2052a01000000434104678afdb0fe5548271967f1a67130b7105cd6a828e03909a6",
        "7962e0ea1f61deb649f6bc3f4cef38c4f35504e51ec112de5c384df7ba0b8d578a4c702b6bf11d5fac00000000",
    );

    // ------------------------------------------------------------------
    // Blocks
    // ------------------------------------------------------------------

    #[test]
    fn genesis_block_decodes() {
        let block = decode_block(&hex::decode(GENESIS).unwrap()).unwrap();
        assert_eq!(block.header.hash, "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f");
        assert_eq!(block.header.prev, "0".repeat(64));
        assert_eq!(block.header.time, 1_231_006_505);
        assert_eq!(block.header.size, 285);
        assert_eq!(block.txs.len(), 1);

        let cb = &block.txs[0];
        assert_eq!(cb.txid, "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b");
        assert!(cb.is_coinbase());
        assert_eq!(cb.vout[0].value_sat, 50 * 100_000_000);
        assert!(cb.vout[0].script_pubkey_hex.starts_with("4104678afdb0"));
        assert_eq!((cb.size, cb.vsize), (204, 204));
    }

    #[test]
    fn truncated_and_padded_blocks_fail() {
        let raw = hex::decode(GENESIS).unwrap();
        assert!(matches!(decode_block(&raw[..raw.len() - 1]), Err(ParseError::InvalidBlock(_))));
        let mut padded = raw.clone();
        padded.push(0);
        assert!(matches!(decode_block(&padded), Err(ParseError::InvalidBlock(_))));
    }

    // ------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------

    #[test]
    fn segwit_txid_excludes_witness() {
        // One P2WPKH input spending a fake outpoint, one output, one witness item.
        let mut raw = Vec::new();
        raw.extend_from_slice(&2i32.to_le_bytes());
        raw.extend_from_slice(&[0x00, 0x01]);
        raw.push(1);
        raw.extend_from_slice(&[0x11; 32]);
        raw.extend_from_slice(&3u32.to_le_bytes());
        raw.push(0);
        raw.extend_from_slice(&0xffff_fffdu32.to_le_bytes());
        raw.push(1);
        raw.extend_from_slice(&1000u64.to_le_bytes());
        raw.push(22);
        raw.extend_from_slice(&[0x00, 0x14]);
        raw.extend_from_slice(&[0x22; 20]);
        let witness = [0x01, 0x03, 0xaa, 0xbb, 0xcc];
        raw.extend_from_slice(&witness);
        raw.extend_from_slice(&0u32.to_le_bytes());

        let tx = decode_transaction(&raw).unwrap();
        let mut legacy = raw[..4].to_vec();
        legacy.extend_from_slice(&raw[6..raw.len() - 4 - witness.len()]);
        legacy.extend_from_slice(&raw[raw.len() - 4..]);
        assert_eq!(tx.txid, hash_hex(&double_sha256(&legacy)));
        assert_eq!(tx.vin[0].txid, "11".repeat(32));
        assert_eq!((tx.vin[0].vout, tx.vin[0].sequence), (3, 0xffff_fffd));
        assert_eq!(tx.vout[0].script_pubkey_hex, format!("0014{}", "22".repeat(20)));
        assert_eq!(tx.size as usize, raw.len());
        let base = legacy.len();
        assert_eq!(tx.vsize as usize, (base * 3 + raw.len()).div_ceil(4));
        assert!(tx.vsize < tx.size);
    }

    #[test]
    fn non_canonical_varint_is_rejected() {
        let mut d = Decoder::new(&[0xfd, 0x10, 0x00]);
        assert!(d.read_varint().is_err());
        let mut d = Decoder::new(&[0xfd, 0xfd, 0x00]);
        assert_eq!(d.read_varint().unwrap(), 0xfd);
    }
}
