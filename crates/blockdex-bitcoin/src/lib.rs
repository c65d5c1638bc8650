//! # blockdex-bitcoin — Bitcoin-family chain support.
//!
//! - [`parser::BitcoinParser`] — address descriptors from output scripts
//! - [`rpc::BitcoinRpc`] — [`BackendClient`](blockdex_core::traits::BackendClient) over bitcoind JSON-RPC
//! - [`address`] — base58check and bech32/bech32m encodings
//! - [`script`] — standard output script templates
//! - [`raw`] — consensus decoding of serialized blocks

pub mod address;
pub mod parser;
pub mod raw;
pub mod rpc;
pub mod script;

pub use address::Network;
pub use parser::BitcoinParser;
pub use rpc::BitcoinRpc;
