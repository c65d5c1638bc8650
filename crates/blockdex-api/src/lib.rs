//! # blockdex-api — Queries over the Blockdex index.
//!
//! - [`worker::Worker`] — transactions, blocks, status, fees and fiat rates
//! - [`address`] — address history, UTXOs and balance history
//! - [`xpub::XpubCache`] — derived-address cache behind the xpub queries
//! - [`paging`] — page arithmetic shared by every listing
//! - [`error::ApiError`] — the error kinds a caller can act on

pub mod address;
pub mod balance_history;
pub mod error;
pub mod fees;
pub mod paging;
pub mod txcache;
pub mod types;
pub mod worker;
pub mod xpub;

pub use balance_history::BalanceHistory;
pub use error::ApiError;
pub use paging::{compute_paging, Paging};
pub use worker::Worker;
pub use xpub::XpubCache;
