use thiserror::Error;

use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum TxError {
    /// `enlist` was called on a flow that has no ambient scope open.
    #[error("no ambient scope is active on this flow")]
    NoAmbientScope,

    /// Commit or abort was requested on a handle that already completed.
    #[error("transaction has already completed")]
    AlreadyCompleted,

    /// A filter matched no document.
    #[error("no matching document")]
    NotFound,

    /// A document could not be serialized or deserialized.
    #[error("invalid document: {0}")]
    InvalidDocument(String),

    /// A cancellation signal fired while waiting on the store.
    #[error("operation cancelled")]
    Cancelled,

    /// Store-level failure, surfaced unchanged so callers can keep matching
    /// on the store's own error labels.
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, TxError>;

impl TxError {
    /// True when the store flagged this failure as retryable via an error
    /// label. Label inspection is the only classification mechanism; error
    /// variants are never matched for retry decisions.
    pub fn is_transient_conflict(&self) -> bool {
        matches!(self, Self::Store(err) if err.is_transient_conflict())
    }
}
