//! Error types for the Blockdex indexer.
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("invalid address: {0}")] InvalidAddress(String),
    #[error("address missing")] AddressMissing,
    #[error("txid missing")] TxidMissing,
    #[error("invalid txid: {0}")] InvalidTxid(String),
    #[error("invalid xpub: {0}")] InvalidXpub(String),
    #[error("invalid block: {0}")] InvalidBlock(String),
    #[error("unsupported by this chain: {0}")] Unsupported(&'static str),
    #[error("serialization: {0}")] Serialization(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("not found: {0}")] NotFound(String),
    #[error("backend unavailable: {0}")] Unavailable(String),
    #[error("backend call timed out after {0}s")] Timeout(u64),
    #[error("rpc error {code}: {message}")] Rpc { code: i64, message: String },
    #[error("unsupported by this backend: {0}")] Unsupported(&'static str),
    #[error("invalid backend response: {0}")] InvalidResponse(String),
}

impl BackendError {
    /// Transient failures that a caller may retry in place.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DbError {
    #[error("db version mismatch in column {column}: stored {stored}, expected {expected}")] VersionMismatch { column: String, stored: u32, expected: u32 },
    #[error("db coin mismatch: stored {stored}, configured {configured}")] CoinMismatch { stored: String, configured: String },
    #[error("db is in inconsistent state, reindex required")] InconsistentState,
    #[error("block height mismatch: expected {expected}, got {got}")] HeightMismatch { expected: u32, got: u32 },
    #[error("block {0} not found in db")] MissingBlock(u32),
    #[error("rollback data for block {0} missing")] MissingRollbackData(u32),
    #[error("corrupted record in {column}: {reason}")] Corrupted { column: &'static str, reason: String },
    #[error("bulk connect requires an empty or checkpointed db")] BulkNotAllowed,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("operation interrupted")] OperationInterrupted,
    #[error("out of order block delivery: expected {expected}, got {got}")] OutOfOrder { expected: u32, got: u32 },
    #[error("unrecoverable block {height}: {reason}")] UnrecoverableBlock { height: u32, reason: String },
    #[error("fork point not found above height {0}")] ForkNotResolvable(u32),
    #[error("retries exhausted after {attempts} attempts: {last}")] RetriesExhausted { attempts: u32, last: String },
    #[error("sync worker channel closed")] ChannelClosed,
}

#[derive(Error, Debug)]
pub enum BlockdexError {
    #[error(transparent)] Parse(#[from] ParseError),
    #[error(transparent)] Backend(#[from] BackendError),
    #[error(transparent)] Db(#[from] DbError),
    #[error(transparent)] Sync(#[from] SyncError),
    #[error("storage: {0}")] Storage(String),
    #[error("codec: {0}")] Codec(String),
}

impl BlockdexError {
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Self::Sync(SyncError::OperationInterrupted))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Backend(e) if e.is_not_found())
    }
}

pub type Result<T, E = BlockdexError> = std::result::Result<T, E>;
