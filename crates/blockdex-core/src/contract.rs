//! Decoding of token contract call results (`name()`, `symbol()`, `decimals()`).
//!
//! Contracts in the wild return string properties in two shapes: ABI-encoded
//! dynamic strings (offset word, length word, padded bytes) and raw `bytes32`
//! holding NUL-padded UTF-8. Both are accepted.

use crate::types::Amount;

/// Decode a hex string property returned by a contract call.
///
/// Returns an empty string if neither shape decodes to valid UTF-8.
pub fn parse_simple_string_property(data: &str) -> String {
    let data = data.strip_prefix("0x").unwrap_or(data);
    if data.len() > 128 {
        if let Some(n) = parse_simple_numeric_property(&data[64..128]) {
            let avail = (data.len() - 128) / 2;
            if n > 0 && n <= avail as Amount {
                let end = 128 + 2 * n as usize;
                if let Ok(b) = hex::decode(&data[128..end]) {
                    return String::from_utf8_lossy(&b).into_owned();
                }
            }
        }
    }
    let Ok(mut b) = hex::decode(data) else {
        return String::new();
    };
    if let Some(i) = b.iter().position(|c| *c == 0) {
        let i = i.min(32);
        if i > 0 {
            b.truncate(i);
        }
    }
    String::from_utf8(b).unwrap_or_default()
}

/// Decode a single 32-byte word as an unsigned integer. Values that do not
/// fit 128 bits, or malformed hex, yield `None`.
pub fn parse_simple_numeric_property(data: &str) -> Option<Amount> {
    let data = data.strip_prefix("0x").unwrap_or(data);
    let word = if data.len() > 64 { &data[..64] } else { data };
    if word.is_empty() {
        return None;
    }
    let trimmed = word.trim_start_matches('0');
    if trimmed.is_empty() {
        return Some(0);
    }
    if trimmed.len() > 32 {
        return None;
    }
    Amount::from_str_radix(trimmed, 16).ok()
}
