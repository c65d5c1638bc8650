//! # blockdex-db — Index storage for Blockdex.
//!
//! - [`store::RocksStore`] — column-family store with atomic batches and snapshots
//! - [`schema`] — key layout and packed record formats
//! - [`index::Indexer`] — block connect/disconnect and read paths
//! - [`bulk::BulkConnect`] — cached connect for the initial import
//! - [`config::IndexerConfig`] — indexer configuration

pub mod bulk;
pub mod config;
pub mod contracts;
pub mod fiat;
pub mod index;
pub mod index_eth;
pub mod schema;
pub mod state;
pub mod store;

#[cfg(test)]
pub(crate) mod testutil;

pub use bulk::BulkConnect;
pub use config::IndexerConfig;
pub use index::{Indexer, IterControl};
pub use store::{Column, RocksStore};
