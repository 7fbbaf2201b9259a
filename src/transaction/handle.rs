// ============================================================================
// Transaction Handle
// ============================================================================
//
// Explicit, user-visible transaction object wrapping one store session.
//
// State transitions:
// ```text
// Open ──commit──> Committed
//   │
//   ├──abort───> Aborted
//   │
//   └──dispose without commit──> Aborted (implicit rollback signal)
// ```
//
// The completion callback fires exactly once, on whichever transition ends
// the handle, and its only job is to clear the flow's session binding so a
// finished handle never leaks a stale session into later calls.
//
// ============================================================================

use std::sync::Arc;

use log::warn;
use tokio_util::sync::CancellationToken;

use super::RetryPolicy;
use crate::core::{Result, TxError};
use crate::registry::SessionRegistry;
use crate::store::{DocumentClient, Session, SessionOptions, TransactionOptions};

/// Transaction lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Transaction is open and accepting operations.
    Open,

    /// Transaction committed successfully.
    Committed,

    /// Transaction was aborted, explicitly or by disposal.
    Aborted,
}

impl TransactionState {
    pub fn is_open(&self) -> bool {
        matches!(self, TransactionState::Open)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TransactionState::Committed | TransactionState::Aborted)
    }
}

impl std::fmt::Display for TransactionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionState::Open => write!(f, "OPEN"),
            TransactionState::Committed => write!(f, "COMMITTED"),
            TransactionState::Aborted => write!(f, "ABORTED"),
        }
    }
}

type CompletionCallback = Box<dyn FnOnce(bool) + Send>;

/// An explicit transaction on one store session.
pub struct Transaction {
    session: Session,
    state: TransactionState,
    on_complete: Option<CompletionCallback>,
    retry: RetryPolicy,
}

impl Transaction {
    /// Provisions collections, opens a session, starts a store-side
    /// transaction on it, and binds the session into the calling flow's
    /// slot.
    pub async fn start(
        client: &Arc<dyn DocumentClient>,
        retry: RetryPolicy,
        session_options: SessionOptions,
        transaction_options: TransactionOptions,
    ) -> Result<Self> {
        // Some stores refuse implicit collection creation inside a
        // transaction, so provisioning must happen up front.
        client.ensure_provisioned().await?;

        let session = client.start_session(session_options).await?;
        if let Err(err) = session.start_transaction(transaction_options).await {
            session.end().await;
            return Err(err.into());
        }

        SessionRegistry::set(Some(session.clone()));

        Ok(Self {
            session,
            state: TransactionState::Open,
            on_complete: Some(Box::new(|_success| SessionRegistry::set(None))),
            retry,
        })
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Commits the transaction, retrying transient commit conflicts under
    /// the handle's retry policy.
    pub async fn commit(&mut self) -> Result<()> {
        self.commit_with_cancellation(&CancellationToken::new())
            .await
    }

    /// Like [`Transaction::commit`], aborting the wait when `cancel` fires.
    /// A cancelled commit still clears the flow's session binding before
    /// returning.
    pub async fn commit_with_cancellation(&mut self, cancel: &CancellationToken) -> Result<()> {
        if !self.state.is_open() {
            return Err(TxError::AlreadyCompleted);
        }

        let session = self.session.clone();
        let retry = self.retry.clone();
        let commit = async move {
            retry
                .run(|| {
                    let session = session.clone();
                    async move { session.commit_transaction().await.map_err(TxError::from) }
                })
                .await
        };
        tokio::pin!(commit);

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TxError::Cancelled),
            result = &mut commit => result,
        };

        match result {
            Ok(()) => {
                self.complete(true);
                Ok(())
            }
            Err(TxError::Cancelled) => {
                self.complete(false);
                Err(TxError::Cancelled)
            }
            Err(err) => Err(err),
        }
    }

    /// Aborts the transaction.
    pub async fn abort(&mut self) -> Result<()> {
        self.abort_with_cancellation(&CancellationToken::new())
            .await
    }

    pub async fn abort_with_cancellation(&mut self, cancel: &CancellationToken) -> Result<()> {
        if !self.state.is_open() {
            return Err(TxError::AlreadyCompleted);
        }

        let session = self.session.clone();
        let abort = async move { session.abort_transaction().await.map_err(TxError::from) };
        tokio::pin!(abort);

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TxError::Cancelled),
            result = &mut abort => result,
        };

        match result {
            Ok(()) => {
                self.complete(false);
                Ok(())
            }
            Err(TxError::Cancelled) => {
                self.complete(false);
                Err(TxError::Cancelled)
            }
            Err(err) => Err(err),
        }
    }

    /// Releases the session. A handle disposed without commit or abort is
    /// treated as an implicit rollback: the completion callback fires with
    /// failure, and ending the session is sufficient at the store level to
    /// discard its open transaction, so no second abort is issued.
    pub async fn dispose(mut self) {
        if self.state.is_open() {
            self.complete(false);
        }
        self.session.end().await;
    }

    fn complete(&mut self, success: bool) {
        self.state = if success {
            TransactionState::Committed
        } else {
            TransactionState::Aborted
        };
        if let Some(callback) = self.on_complete.take() {
            callback(success);
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if let Some(callback) = self.on_complete.take() {
            warn!(
                "transaction handle dropped without dispose(); the session cannot be \
                 released here, but the flow's session binding is being cleared"
            );
            callback(false);
        }
    }
}
