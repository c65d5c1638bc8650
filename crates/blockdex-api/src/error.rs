//! Error taxonomy at the query boundary.
//!
//! Library errors are folded into five kinds a caller can act on. Anything
//! that is not the caller's fault and not a backend hiccup is `Internal` and
//! gets logged on conversion.

use thiserror::Error;
use tracing::error;

use blockdex_core::error::{BackendError, BlockdexError, ParseError, SyncError};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    #[error("not found: {0}")] NotFound(String),
    #[error("invalid input: {0}")] InvalidInput(String),
    #[error("unsupported: {0}")] Unsupported(String),
    #[error("backend unavailable: {0}")] BackendUnavailable(String),
    #[error("internal error: {0}")] Internal(String),
}

impl ApiError {
    /// Whether the caller may retry the same request.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::BackendUnavailable(_))
    }
}

impl From<BackendError> for ApiError {
    fn from(e: BackendError) -> Self {
        match e {
            BackendError::NotFound(what) => Self::NotFound(what),
            BackendError::Unsupported(what) => Self::Unsupported(what.to_string()),
            // The node rejected the request itself, e.g. an invalid raw tx.
            BackendError::Rpc { code, message } => Self::InvalidInput(format!("{message} ({code})")),
            BackendError::InvalidResponse(_) => {
                error!(error = %e, "invalid backend response");
                Self::Internal(e.to_string())
            }
            e => Self::BackendUnavailable(e.to_string()),
        }
    }
}

impl From<ParseError> for ApiError {
    fn from(e: ParseError) -> Self {
        match e {
            ParseError::InvalidAddress(_)
            | ParseError::AddressMissing
            | ParseError::TxidMissing
            | ParseError::InvalidTxid(_)
            | ParseError::InvalidXpub(_)
            | ParseError::InvalidBlock(_) => Self::InvalidInput(e.to_string()),
            ParseError::Unsupported(what) => Self::Unsupported(what.to_string()),
            ParseError::Serialization(_) => {
                error!(error = %e, "serialization failure");
                Self::Internal(e.to_string())
            }
        }
    }
}

impl From<BlockdexError> for ApiError {
    fn from(e: BlockdexError) -> Self {
        match e {
            BlockdexError::Backend(e) => e.into(),
            BlockdexError::Parse(e) => e.into(),
            BlockdexError::Sync(SyncError::RetriesExhausted { attempts, last }) => {
                Self::BackendUnavailable(format!("after {attempts} attempts: {last}"))
            }
            e => {
                error!(error = %e, "internal error");
                Self::Internal(e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blockdex_core::error::DbError;

    #[test]
    fn backend_not_found_is_public_not_found() {
        let e: ApiError = BlockdexError::from(BackendError::NotFound("tx abc".into())).into();
        assert_eq!(e, ApiError::NotFound("tx abc".into()));
    }

    #[test]
    fn transient_backend_failures_are_retryable() {
        let e: ApiError = BackendError::Timeout(25).into();
        assert!(e.is_retryable());
        let e: ApiError = BlockdexError::from(SyncError::RetriesExhausted { attempts: 3, last: "refused".into() }).into();
        assert!(e.is_retryable());
    }

    #[test]
    fn malformed_input_is_invalid_input() {
        let e: ApiError = BlockdexError::from(ParseError::InvalidAddress("zz".into())).into();
        assert!(matches!(e, ApiError::InvalidInput(_)));
        let e: ApiError = ParseError::Unsupported("xpub derivation").into();
        assert_eq!(e, ApiError::Unsupported("xpub derivation".into()));
    }

    #[test]
    fn db_inconsistency_is_internal() {
        let e: ApiError = BlockdexError::from(DbError::MissingBlock(7)).into();
        assert!(matches!(e, ApiError::Internal(_)));
        assert!(!e.is_retryable());
    }
}
