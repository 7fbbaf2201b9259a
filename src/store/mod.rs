// ============================================================================
// Document Store Interface
// ============================================================================
//
// The coordination layer never talks to a concrete driver. Everything it
// needs from the database is expressed here: a client that opens sessions,
// sessions that carry one server-side transaction, and collections whose
// operations optionally participate in a session.
//
// ============================================================================

pub mod memory;

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use log::warn;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

pub use memory::MemoryStore;

/// Error label attached by the store when an operation may succeed if the
/// whole transaction is simply retried.
pub const TRANSIENT_TRANSACTION_ERROR: &str = "TransientTransactionError";

/// Error label attached by the store when the outcome of a commit is unknown
/// and the commit itself may be retried.
pub const UNKNOWN_TRANSACTION_COMMIT_RESULT: &str = "UnknownTransactionCommitResult";

/// How long the driver-style [`Session::with_transaction`] helper keeps
/// retrying transient failures before giving up.
const WITH_TRANSACTION_WINDOW: Duration = Duration::from_secs(120);

/// Store-level failure.
///
/// Retryability is communicated through error labels, never through the
/// variant itself; callers inspect labels with [`StoreError::has_label`] or
/// [`StoreError::is_transient_conflict`].
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("{message}")]
    Command { message: String, labels: Vec<String> },

    #[error("session has already ended")]
    SessionEnded,

    #[error("no transaction is active on this session")]
    NoActiveTransaction,

    #[error("a transaction is already active on this session")]
    TransactionInProgress,
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

impl StoreError {
    /// A plain command failure with no labels.
    pub fn command(message: impl Into<String>) -> Self {
        Self::Command {
            message: message.into(),
            labels: Vec::new(),
        }
    }

    /// A command failure carrying the transient-transaction label.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::command(message).with_label(TRANSIENT_TRANSACTION_ERROR)
    }

    /// Attaches an error label.
    pub fn with_label(mut self, label: &str) -> Self {
        if let Self::Command { labels, .. } = &mut self {
            labels.push(label.to_string());
        }
        self
    }

    pub fn has_label(&self, label: &str) -> bool {
        match self {
            Self::Command { labels, .. } => labels.iter().any(|l| l == label),
            _ => false,
        }
    }

    pub fn is_transient_conflict(&self) -> bool {
        self.has_label(TRANSIENT_TRANSACTION_ERROR)
            || self.has_label(UNKNOWN_TRANSACTION_COMMIT_RESULT)
    }
}

/// Unique identifier for a store session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        SessionId(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "session_{}", self.0)
    }
}

/// Options applied when a session is opened.
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    pub causal_consistency: bool,
}

impl SessionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn causal_consistency(mut self, enabled: bool) -> Self {
        self.causal_consistency = enabled;
        self
    }
}

/// Options applied when a transaction is started on a session.
#[derive(Debug, Clone, Default)]
pub struct TransactionOptions {
    pub read_concern: Option<String>,
    pub write_concern: Option<String>,
    pub max_commit_time: Option<Duration>,
}

impl TransactionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read_concern(mut self, level: impl Into<String>) -> Self {
        self.read_concern = Some(level.into());
        self
    }

    pub fn write_concern(mut self, level: impl Into<String>) -> Self {
        self.write_concern = Some(level.into());
        self
    }

    pub fn max_commit_time(mut self, limit: Duration) -> Self {
        self.max_commit_time = Some(limit);
        self
    }
}

/// Driver-side session operations.
///
/// Implementations hold the server-side transaction context; the coordination
/// layer only ever reaches them through a shared [`Session`].
#[async_trait]
pub trait SessionHandle: Send {
    async fn start_transaction(&mut self, options: TransactionOptions) -> StoreResult<()>;
    async fn commit_transaction(&mut self) -> StoreResult<()>;
    async fn abort_transaction(&mut self) -> StoreResult<()>;

    /// Releases the session. Ending a session with an open transaction
    /// discards its staged work at the driver level; no separate abort is
    /// required.
    async fn end(&mut self);
}

/// Shared handle to one store session.
///
/// Cloning is cheap and every clone refers to the same server-side context.
/// A session is designed for one logical flow (or one ambient scope's set of
/// enlisted flows) at a time; the internal lock serializes the rare overlap.
#[derive(Clone)]
pub struct Session {
    id: SessionId,
    inner: Arc<Mutex<Box<dyn SessionHandle>>>,
}

impl Session {
    pub fn new(id: SessionId, handle: Box<dyn SessionHandle>) -> Self {
        Self {
            id,
            inner: Arc::new(Mutex::new(handle)),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub async fn start_transaction(&self, options: TransactionOptions) -> StoreResult<()> {
        self.inner.lock().await.start_transaction(options).await
    }

    pub async fn commit_transaction(&self) -> StoreResult<()> {
        self.inner.lock().await.commit_transaction().await
    }

    pub async fn abort_transaction(&self) -> StoreResult<()> {
        self.inner.lock().await.abort_transaction().await
    }

    pub async fn end(&self) {
        self.inner.lock().await.end().await;
    }

    /// Driver-style transaction helper: starts a transaction, runs `body`,
    /// and commits, retrying the commit on an unknown-commit-result label and
    /// rerunning the whole body on a transient label, all within a fixed
    /// wall-clock window.
    pub async fn with_transaction<T, F, Fut>(
        &self,
        options: TransactionOptions,
        mut body: F,
    ) -> crate::core::Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = crate::core::Result<T>>,
    {
        let started = Instant::now();
        loop {
            self.start_transaction(options.clone()).await?;

            match body().await {
                Ok(value) => match self.commit_within_window(started).await {
                    Ok(()) => return Ok(value),
                    Err(err) => {
                        let _ = self.abort_transaction().await;
                        if err.is_transient_conflict()
                            && started.elapsed() < WITH_TRANSACTION_WINDOW
                        {
                            warn!(
                                "transaction commit hit a transient conflict, rerunning body: {err}"
                            );
                            continue;
                        }
                        return Err(err.into());
                    }
                },
                Err(err) => {
                    let _ = self.abort_transaction().await;
                    if err.is_transient_conflict() && started.elapsed() < WITH_TRANSACTION_WINDOW {
                        warn!("transaction body hit a transient conflict, rerunning: {err}");
                        continue;
                    }
                    return Err(err);
                }
            }
        }
    }

    async fn commit_within_window(&self, started: Instant) -> StoreResult<()> {
        loop {
            match self.commit_transaction().await {
                Ok(()) => return Ok(()),
                Err(err)
                    if err.has_label(UNKNOWN_TRANSACTION_COMMIT_RESULT)
                        && started.elapsed() < WITH_TRANSACTION_WINDOW =>
                {
                    warn!("retrying commit with unknown result: {err}");
                }
                Err(err) => return Err(err),
            }
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").field("id", &self.id).finish()
    }
}

/// Client surface of the document store.
#[async_trait]
pub trait DocumentClient: Send + Sync {
    /// Opens a new session.
    async fn start_session(&self, options: SessionOptions) -> StoreResult<Session>;

    /// Creates collections and indexes for every mapped type that does not
    /// have them yet. Stores that forbid implicit collection creation inside
    /// a transaction require this to run before the transaction starts.
    async fn ensure_provisioned(&self) -> StoreResult<()>;

    /// Returns a handle to the named collection.
    fn collection(&self, name: &str) -> Collection;
}

/// Operations on one collection. Each call optionally participates in a
/// session's transaction.
#[async_trait]
pub trait CollectionHandle: Send + Sync {
    async fn insert(&self, document: Value, session: Option<&Session>) -> StoreResult<()>;

    /// Sets the fields of `update` on every document matching `filter`.
    /// Returns the matched count.
    async fn update(
        &self,
        filter: Value,
        update: Value,
        session: Option<&Session>,
    ) -> StoreResult<u64>;

    /// Removes every document matching `filter`. Returns the removed count.
    async fn delete(&self, filter: Value, session: Option<&Session>) -> StoreResult<u64>;

    async fn find(&self, filter: Value, session: Option<&Session>) -> StoreResult<Vec<Value>>;
}

pub type Collection = Arc<dyn CollectionHandle>;
