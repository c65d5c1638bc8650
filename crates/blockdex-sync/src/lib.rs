//! # blockdex-sync — Keeping the index in step with a backend node.
//!
//! - [`sync::SyncWorker`] — parallel catch-up, tip following, fork resolution
//! - [`mempool_sync::MempoolSync`] — mempool resync and tx ingestion
//! - [`daemon::Daemon`] — the long-running loop tying both to backend events
//! - [`retry::Retry`] — call timeouts and bounded exponential backoff

pub mod daemon;
pub mod mempool_sync;
pub mod retry;
pub mod sync;

pub use daemon::Daemon;
pub use mempool_sync::MempoolSync;
pub use retry::Retry;
pub use sync::{SyncPhase, SyncWorker, Synced};
