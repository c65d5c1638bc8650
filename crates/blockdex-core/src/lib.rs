//! # blockdex-core
//! Foundation types, packing primitives, and capability traits for the
//! Blockdex indexer.

pub mod constants;
pub mod contract;
pub mod error;
pub mod golomb;
pub mod internal_state;
pub mod mempool;
pub mod notify;
pub mod pack;
pub mod traits;
pub mod types;
