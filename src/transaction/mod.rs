// ============================================================================
// Transaction Coordination Module
// ============================================================================
//
// Three cooperating pieces:
// - an explicit Transaction handle over one store session,
// - an enlistment bridge joining flows to an open ambient scope,
// - a retry policy re-running work on transient store conflicts.
//
// ============================================================================

pub mod ambient;
pub mod handle;
pub mod retry;

pub use handle::{Transaction, TransactionState};
pub use retry::{RetryPolicy, DEFAULT_RETRY_TIMEOUT};

/// Selects how a `with_transaction` body is coordinated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionKind {
    /// Open a session directly and drive it with the store's transaction
    /// helper.
    Native,

    /// Open an ambient scope and let the body's repository calls enlist
    /// with it.
    Ambient,
}
