//! Compact binary packing primitives for the on-disk records.
//!
//! - variable-length unsigned integers (7 bits per byte, low groups first)
//! - zig-zag signed integers on top of the unsigned encoding
//! - big amounts as a length byte followed by minimal big-endian bytes
//! - fixed-width big-endian `u32` heights so key order matches numeric order
//!
//! The layout is part of the database format; changing it requires bumping
//! [`DB_VERSION`](crate::constants::DB_VERSION).

use crate::error::BlockdexError;
use crate::types::Amount;

/// Longest encoding of a `u64` varuint.
pub const MAX_VARUINT_LEN: usize = 10;

pub fn pack_varuint(mut v: u64, buf: &mut Vec<u8>) {
    while v >= 0x80 {
        buf.push((v as u8) | 0x80);
        v >>= 7;
    }
    buf.push(v as u8);
}

pub fn pack_varint(v: i64, buf: &mut Vec<u8>) {
    let zz = ((v << 1) ^ (v >> 63)) as u64;
    pack_varuint(zz, buf);
}

pub fn pack_varint32(v: i32, buf: &mut Vec<u8>) {
    pack_varint(v as i64, buf);
}

/// Length byte followed by the minimal big-endian representation; zero packs as `[0]`.
pub fn pack_bigint(v: Amount, buf: &mut Vec<u8>) {
    let bytes = v.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count();
    buf.push((bytes.len() - skip) as u8);
    buf.extend_from_slice(&bytes[skip..]);
}

pub fn pack_u32_be(v: u32) -> [u8; 4] {
    v.to_be_bytes()
}

pub fn unpack_u32_be(buf: &[u8]) -> Result<u32, BlockdexError> {
    let arr: [u8; 4] = buf
        .get(..4)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| BlockdexError::Codec(format!("u32 needs 4 bytes, got {}", buf.len())))?;
    Ok(u32::from_be_bytes(arr))
}

/// Sequential decoder over a packed record.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> &'a [u8] {
        &self.buf[self.pos.min(self.buf.len())..]
    }

    pub fn varuint(&mut self) -> Result<u64, BlockdexError> {
        let mut v: u64 = 0;
        let mut shift = 0u32;
        loop {
            let b = *self
                .buf
                .get(self.pos)
                .ok_or_else(|| BlockdexError::Codec("truncated varuint".into()))?;
            self.pos += 1;
            if shift >= 64 || (shift == 63 && b > 1) {
                return Err(BlockdexError::Codec("varuint overflow".into()));
            }
            v |= ((b & 0x7f) as u64) << shift;
            if b & 0x80 == 0 {
                return Ok(v);
            }
            shift += 7;
        }
    }

    pub fn varuint32(&mut self) -> Result<u32, BlockdexError> {
        let v = self.varuint()?;
        u32::try_from(v).map_err(|_| BlockdexError::Codec(format!("value {v} exceeds u32")))
    }

    pub fn varint(&mut self) -> Result<i64, BlockdexError> {
        let zz = self.varuint()?;
        Ok(((zz >> 1) as i64) ^ -((zz & 1) as i64))
    }

    pub fn varint32(&mut self) -> Result<i32, BlockdexError> {
        let v = self.varint()?;
        i32::try_from(v).map_err(|_| BlockdexError::Codec(format!("value {v} exceeds i32")))
    }

    pub fn bigint(&mut self) -> Result<Amount, BlockdexError> {
        let len = *self
            .buf
            .get(self.pos)
            .ok_or_else(|| BlockdexError::Codec("truncated bigint".into()))? as usize;
        self.pos += 1;
        if len > 16 {
            return Err(BlockdexError::Codec(format!("bigint length {len} exceeds 16")));
        }
        let bytes = self.bytes(len)?;
        let mut full = [0u8; 16];
        full[16 - len..].copy_from_slice(bytes);
        Ok(Amount::from_be_bytes(full))
    }

    pub fn bytes(&mut self, n: usize) -> Result<&'a [u8], BlockdexError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|e| *e <= self.buf.len())
            .ok_or_else(|| {
                BlockdexError::Codec(format!("need {n} bytes at {}, have {}", self.pos, self.buf.len()))
            })?;
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    pub fn u32_be(&mut self) -> Result<u32, BlockdexError> {
        unpack_u32_be(self.bytes(4)?)
    }
}

/// Bitcoin `CompactSize` prefix.
pub fn write_compact_size(buf: &mut Vec<u8>, n: u64) {
    match n {
        0..=0xfc => buf.push(n as u8),
        0xfd..=0xffff => {
            buf.push(0xfd);
            buf.extend_from_slice(&(n as u16).to_le_bytes());
        }
        0x1_0000..=0xffff_ffff => {
            buf.push(0xfe);
            buf.extend_from_slice(&(n as u32).to_le_bytes());
        }
        _ => {
            buf.push(0xff);
            buf.extend_from_slice(&n.to_le_bytes());
        }
    }
}

/// Reads a `CompactSize`, returning the value and the bytes consumed.
pub fn read_compact_size(buf: &[u8]) -> Option<(u64, usize)> {
    let width = match *buf.first()? {
        0xfd => 2,
        0xfe => 4,
        0xff => 8,
        b => return Some((u64::from(b), 1)),
    };
    let bytes = buf.get(1..1 + width)?;
    let mut le = [0u8; 8];
    le[..width].copy_from_slice(bytes);
    Some((u64::from_le_bytes(le), 1 + width))
}
