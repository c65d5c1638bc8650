//! Golomb-coded set filters over address descriptors.
//!
//! A filter is `CompactSize(N)` followed by the Golomb-Rice coded, sorted
//! SipHash-2-4 values of the N unique descriptors, reduced into `[0, N << P)`.
//! The SipHash key is the first 16 bytes of the block hash (or txid for
//! mempool filters), or all zeros when the zeroed key is configured.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::error::ParseError;
use crate::types::AddrDesc;

/// Rice parameter used for block filters unless configured otherwise.
pub const DEFAULT_P: u8 = 20;

/// Length of the SipHash key taken from the hash.
pub const KEY_LEN: usize = 16;

/// Which descriptors a filter includes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FilterScripts {
    #[default]
    All,
    /// Only P2TR outputs (`OP_1 <32 bytes>`).
    Taproot,
}

impl FilterScripts {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::All => "",
            Self::Taproot => "taproot",
        }
    }

    pub fn accepts(&self, ad: &[u8]) -> bool {
        match self {
            Self::All => true,
            Self::Taproot => is_taproot(ad),
        }
    }
}

impl FromStr for FilterScripts {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "all" => Ok(Self::All),
            "taproot" => Ok(Self::Taproot),
            other => Err(ParseError::Unsupported(match other {
                "taproot-noordinals" => "taproot-noordinals filter scripts",
                _ => "filter scripts",
            })),
        }
    }
}

impl fmt::Display for FilterScripts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn is_taproot(ad: &[u8]) -> bool {
    ad.len() == 34 && ad[0] == 0x51 && ad[1] == 0x20
}

/// Filter parameters shared by every filter built for one index.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FilterParams {
    pub p: u8,
    pub scripts: FilterScripts,
    pub use_zeroed_key: bool,
}

impl FilterParams {
    pub fn new(p: u8, scripts: FilterScripts, use_zeroed_key: bool) -> Result<Self, ParseError> {
        if p == 0 || p > 32 {
            return Err(ParseError::Serialization(format!("golomb parameter {p} out of range")));
        }
        Ok(Self { p, scripts, use_zeroed_key })
    }

    /// SipHash key derived from a block hash or txid in hex.
    pub fn key(&self, hash_hex: &str) -> Result<[u8; KEY_LEN], ParseError> {
        let mut key = [0u8; KEY_LEN];
        if self.use_zeroed_key {
            return Ok(key);
        }
        let bytes = hex::decode(hash_hex).map_err(|e| ParseError::InvalidTxid(e.to_string()))?;
        if bytes.len() < KEY_LEN {
            return Err(ParseError::InvalidTxid(hash_hex.to_string()));
        }
        key.copy_from_slice(&bytes[..KEY_LEN]);
        Ok(key)
    }

    pub fn builder(&self) -> GolombFilter {
        GolombFilter { params: *self, items: BTreeSet::new() }
    }
}

/// Accumulates unique descriptors for one block or transaction.
#[derive(Clone, Debug)]
pub struct GolombFilter {
    params: FilterParams,
    items: BTreeSet<Vec<u8>>,
}

impl GolombFilter {
    pub fn add_addr_desc(&mut self, ad: &AddrDesc) {
        if ad.is_empty() || !self.params.scripts.accepts(ad.as_bytes()) {
            return;
        }
        self.items.insert(ad.0.clone());
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Encoded filter, or `None` when nothing was added.
    pub fn compute(&self, hash_hex: &str) -> Result<Option<Vec<u8>>, ParseError> {
        if self.items.is_empty() {
            return Ok(None);
        }
        let key = self.params.key(hash_hex)?;
        Ok(Some(build(self.params.p, &key, self.items.iter().map(Vec::as_slice))))
    }

    /// Hex form used by the mempool and the query surface.
    pub fn compute_hex(&self, hash_hex: &str) -> Result<Option<String>, ParseError> {
        Ok(self.compute(hash_hex)?.map(hex::encode))
    }
}

/// Encodes `items` as a Golomb-coded set.
pub fn build<'a>(p: u8, key: &[u8; KEY_LEN], items: impl Iterator<Item = &'a [u8]>) -> Vec<u8> {
    let items: Vec<&[u8]> = items.collect();
    let n = items.len() as u64;
    let nm = n << p;
    let (k0, k1) = split_key(key);
    let mut values: Vec<u64> = items.iter().map(|d| reduce(siphash24(k0, k1, d), nm)).collect();
    values.sort_unstable();

    let mut out = Vec::new();
    crate::pack::write_compact_size(&mut out, n);
    let mut bits = BitWriter::default();
    let mut last = 0u64;
    for v in values {
        let delta = v - last;
        last = v;
        for _ in 0..(delta >> p) {
            bits.push(true);
        }
        bits.push(false);
        bits.push_bits(delta, p);
    }
    out.extend(bits.finish());
    out
}

/// Whether `item` may be a member of the encoded `filter`.
pub fn matches(p: u8, key: &[u8; KEY_LEN], filter: &[u8], item: &[u8]) -> Result<bool, ParseError> {
    let (n, used) = crate::pack::read_compact_size(filter)
        .ok_or_else(|| ParseError::Serialization("golomb filter header".into()))?;
    if n == 0 {
        return Ok(false);
    }
    let (k0, k1) = split_key(key);
    let target = reduce(siphash24(k0, k1, item), n << p);
    let mut bits = BitReader::new(&filter[used..]);
    let mut value = 0u64;
    for _ in 0..n {
        let mut q = 0u64;
        loop {
            match bits.read_bit() {
                Some(true) => q += 1,
                Some(false) => break,
                None => return Err(ParseError::Serialization("golomb filter truncated".into())),
            }
        }
        let r = bits
            .read_bits(p)
            .ok_or_else(|| ParseError::Serialization("golomb filter truncated".into()))?;
        value += (q << p) | r;
        if value == target {
            return Ok(true);
        }
        if value > target {
            return Ok(false);
        }
    }
    Ok(false)
}

fn split_key(key: &[u8; KEY_LEN]) -> (u64, u64) {
    let mut a = [0u8; 8];
    let mut b = [0u8; 8];
    a.copy_from_slice(&key[..8]);
    b.copy_from_slice(&key[8..]);
    (u64::from_le_bytes(a), u64::from_le_bytes(b))
}

fn reduce(v: u64, nm: u64) -> u64 {
    ((v as u128 * nm as u128) >> 64) as u64
}

#[derive(Default)]
struct BitWriter {
    bytes: Vec<u8>,
    used: u8,
}

impl BitWriter {
    fn push(&mut self, bit: bool) {
        if self.used == 0 {
            self.bytes.push(0);
        }
        if bit {
            if let Some(last) = self.bytes.last_mut() {
                *last |= 0x80 >> self.used;
            }
        }
        self.used = (self.used + 1) % 8;
    }

    fn push_bits(&mut self, v: u64, n: u8) {
        for i in (0..n).rev() {
            self.push((v >> i) & 1 == 1);
        }
    }

    fn finish(self) -> Vec<u8> {
        self.bytes
    }
}

struct BitReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> BitReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn read_bit(&mut self) -> Option<bool> {
        let byte = *self.bytes.get(self.pos / 8)?;
        let bit = byte & (0x80 >> (self.pos % 8)) != 0;
        self.pos += 1;
        Some(bit)
    }

    fn read_bits(&mut self, n: u8) -> Option<u64> {
        let mut v = 0u64;
        for _ in 0..n {
            v = (v << 1) | u64::from(self.read_bit()?);
        }
        Some(v)
    }
}

// SipHash-2-4 with a 64-bit output.
fn siphash24(k0: u64, k1: u64, msg: &[u8]) -> u64 {
    let mut v0 = k0 ^ 0x736f_6d65_7073_6575;
    let mut v1 = k1 ^ 0x646f_7261_6e64_6f6d;
    let mut v2 = k0 ^ 0x6c79_6765_6e65_7261;
    let mut v3 = k1 ^ 0x7465_6462_7974_6573;

    fn round(v0: &mut u64, v1: &mut u64, v2: &mut u64, v3: &mut u64) {
        *v0 = v0.wrapping_add(*v1);
        *v1 = v1.rotate_left(13) ^ *v0;
        *v0 = v0.rotate_left(32);
        *v2 = v2.wrapping_add(*v3);
        *v3 = v3.rotate_left(16) ^ *v2;
        *v0 = v0.wrapping_add(*v3);
        *v3 = v3.rotate_left(21) ^ *v0;
        *v2 = v2.wrapping_add(*v1);
        *v1 = v1.rotate_left(17) ^ *v2;
        *v2 = v2.rotate_left(32);
    }

    let mut chunks = msg.chunks_exact(8);
    for chunk in &mut chunks {
        let mut w = [0u8; 8];
        w.copy_from_slice(chunk);
        let m = u64::from_le_bytes(w);
        v3 ^= m;
        round(&mut v0, &mut v1, &mut v2, &mut v3);
        round(&mut v0, &mut v1, &mut v2, &mut v3);
        v0 ^= m;
    }
    let mut last = [0u8; 8];
    let rem = chunks.remainder();
    last[..rem.len()].copy_from_slice(rem);
    let m = u64::from_le_bytes(last) | ((msg.len() as u64 & 0xff) << 56);
    v3 ^= m;
    round(&mut v0, &mut v1, &mut v2, &mut v3);
    round(&mut v0, &mut v1, &mut v2, &mut v3);
    v0 ^= m;

    v2 ^= 0xff;
    for _ in 0..4 {
        round(&mut v0, &mut v1, &mut v2, &mut v3);
    }
    v0 ^ v1 ^ v2 ^ v3
}
