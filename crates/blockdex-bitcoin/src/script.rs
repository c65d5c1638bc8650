//! Output script classification.

use ripemd::Ripemd160;
use sha2::{Digest, Sha256};

const OP_0: u8 = 0x00;
const OP_PUSHDATA1: u8 = 0x4c;
const OP_PUSHDATA2: u8 = 0x4d;
const OP_1: u8 = 0x51;
const OP_16: u8 = 0x60;
const OP_RETURN: u8 = 0x6a;
const OP_DUP: u8 = 0x76;
const OP_EQUAL: u8 = 0x87;
const OP_EQUALVERIFY: u8 = 0x88;
const OP_HASH160: u8 = 0xa9;
const OP_CHECKSIG: u8 = 0xac;

/// Destination of an output script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    P2pkh([u8; 20]),
    P2sh([u8; 20]),
    Witness { version: u8, program: Vec<u8> },
    /// Pay-to-pubkey; shown as the P2PKH address of the key.
    P2pk(Vec<u8>),
    OpReturn(Vec<u8>),
    NonStandard,
}

pub fn hash160(data: &[u8]) -> [u8; 20] {
    Ripemd160::digest(Sha256::digest(data)).into()
}

pub fn classify(script: &[u8]) -> Destination {
    match script {
        [OP_DUP, OP_HASH160, 0x14, hash @ .., OP_EQUALVERIFY, OP_CHECKSIG] if hash.len() == 20 => {
            Destination::P2pkh(to_hash(hash))
        }
        [OP_HASH160, 0x14, hash @ .., OP_EQUAL] if hash.len() == 20 => Destination::P2sh(to_hash(hash)),
        [v @ (OP_0 | OP_1..=OP_16), len, program @ ..]
            if (2..=40).contains(len) && program.len() == *len as usize =>
        {
            let version = if *v == OP_0 { 0 } else { v - OP_1 + 1 };
            Destination::Witness { version, program: program.to_vec() }
        }
        [len @ (33 | 65), key @ .., OP_CHECKSIG] if key.len() == *len as usize => Destination::P2pk(key.to_vec()),
        [OP_RETURN, rest @ ..] => Destination::OpReturn(pushed_data(rest)),
        _ => Destination::NonStandard,
    }
}

fn to_hash(bytes: &[u8]) -> [u8; 20] {
    let mut h = [0u8; 20];
    h.copy_from_slice(bytes);
    h
}

pub fn p2pkh_script(hash: &[u8; 20]) -> Vec<u8> {
    let mut s = Vec::with_capacity(25);
    s.extend_from_slice(&[OP_DUP, OP_HASH160, 0x14]);
    s.extend_from_slice(hash);
    s.extend_from_slice(&[OP_EQUALVERIFY, OP_CHECKSIG]);
    s
}

pub fn p2sh_script(hash: &[u8; 20]) -> Vec<u8> {
    let mut s = Vec::with_capacity(23);
    s.extend_from_slice(&[OP_HASH160, 0x14]);
    s.extend_from_slice(hash);
    s.push(OP_EQUAL);
    s
}

pub fn witness_script(version: u8, program: &[u8]) -> Vec<u8> {
    let mut s = Vec::with_capacity(2 + program.len());
    s.push(if version == 0 { OP_0 } else { OP_1 + version - 1 });
    s.push(program.len() as u8);
    s.extend_from_slice(program);
    s
}

/// Data pushes of a script, concatenated. Stops at the first non-push opcode.
pub fn pushed_data(mut script: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    while let Some(chunk) = next_push(&mut script) {
        out.extend_from_slice(chunk);
    }
    out
}

/// Last data push of a script, e.g. the public key of a P2PKH scriptSig.
pub fn last_push(mut script: &[u8]) -> Option<&[u8]> {
    let mut last = None;
    while let Some(chunk) = next_push(&mut script) {
        last = Some(chunk);
    }
    last
}

fn next_push<'a>(script: &mut &'a [u8]) -> Option<&'a [u8]> {
    let (&op, rest) = script.split_first()?;
    let (len, rest) = match op {
        1..OP_PUSHDATA1 => (op as usize, rest),
        OP_PUSHDATA1 => {
            let (&n, rest) = rest.split_first()?;
            (n as usize, rest)
        }
        OP_PUSHDATA2 => {
            let (n, rest) = rest.split_at_checked(2)?;
            (u16::from_le_bytes([n[0], n[1]]) as usize, rest)
        }
        _ => return None,
    };
    let (chunk, rest) = rest.split_at_checked(len)?;
    *script = rest;
    Some(chunk)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h(s: &str) -> Vec<u8> {
        hex::decode(s).unwrap()
    }

    #[test]
    fn standard_scripts() {
        let p2pkh = h("76a91462e907b15cbf27d5425399ebf6f0fb50ebb88f1888ac");
        assert!(matches!(classify(&p2pkh), Destination::P2pkh(_)));
        let p2sh = h("a914b472a266d0bd89c13706a4132ccfb16f7c3b9fcb87");
        assert!(matches!(classify(&p2sh), Destination::P2sh(_)));
        let p2wpkh = h("0014751e76e8199196d454941c45d1b3a323f1433bd6");
        assert_eq!(classify(&p2wpkh), Destination::Witness { version: 0, program: p2wpkh[2..].to_vec() });
        let p2tr = h("512079be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798");
        assert!(matches!(classify(&p2tr), Destination::Witness { version: 1, .. }));
    }

    #[test]
    fn builders_invert_classify() {
        let hash = [7u8; 20];
        assert_eq!(classify(&p2pkh_script(&hash)), Destination::P2pkh(hash));
        assert_eq!(classify(&p2sh_script(&hash)), Destination::P2sh(hash));
        let prog = vec![9u8; 32];
        assert_eq!(classify(&witness_script(1, &prog)), Destination::Witness { version: 1, program: prog });
    }

    #[test]
    fn op_return_data() {
        assert_eq!(classify(&h("6a0568656c6c6f")), Destination::OpReturn(b"hello".to_vec()));
        assert_eq!(classify(&h("6a")), Destination::OpReturn(Vec::new()));
    }

    #[test]
    fn pay_to_pubkey_and_garbage() {
        let mut p2pk = vec![33u8];
        p2pk.extend([2u8; 33]);
        p2pk.push(OP_CHECKSIG);
        assert_eq!(classify(&p2pk), Destination::P2pk(vec![2u8; 33]));
        assert_eq!(classify(&h("00")), Destination::NonStandard);
        assert_eq!(classify(&h("0014aabb")), Destination::NonStandard);
    }

    #[test]
    fn last_push_of_script_sig() {
        let sig = [0x30u8; 71];
        let key = [0x03u8; 33];
        let mut script = vec![71u8];
        script.extend(sig);
        script.push(33);
        script.extend(key);
        assert_eq!(last_push(&script), Some(&key[..]));
        assert_eq!(last_push(&[0x4c, 5, 1]), None);
    }

    #[test]
    fn hash160_of_empty_input() {
        assert_eq!(hex::encode(hash160(b"")), "b472a266d0bd89c13706a4132ccfb16f7c3b9fcb");
    }
}
