// ============================================================================
// txflow Library
// ============================================================================
//
// Ambient transaction coordination for document stores: flow-scoped
// sessions, explicit transaction handles, ambient unit-of-work enlistment,
// and transient-conflict retry. The store itself stays behind the traits in
// `store`; `MemoryStore` is an embedded implementation used for tests and
// examples.
//
// ============================================================================

pub mod core;
pub mod registry;
pub mod repository;
pub mod scope;
pub mod store;
pub mod transaction;

// Re-export main types for convenience
pub use crate::core::{Result, TxError};
pub use registry::{RegistryStats, SessionRegistry};
pub use repository::Repository;
pub use scope::{AmbientScope, CompletionHook, Participant, ScopeId, ScopeOutcome};
pub use store::{
    Collection, CollectionHandle, DocumentClient, MemoryStore, Session, SessionHandle, SessionId,
    SessionOptions, StoreError, StoreResult, TransactionOptions, TRANSIENT_TRANSACTION_ERROR,
    UNKNOWN_TRANSACTION_COMMIT_RESULT,
};
pub use transaction::{RetryPolicy, Transaction, TransactionKind, TransactionState};

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use log::warn;

use transaction::ambient;

// ============================================================================
// High-level coordination API
// ============================================================================

/// Entry point for transaction coordination over one store client.
///
/// Construct a `TxContext` once at startup and share it; clones are cheap
/// and refer to the same registry.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use serde_json::json;
/// use txflow::{MemoryStore, SessionRegistry, TxContext};
///
/// # tokio_test::block_on(async {
/// let store = MemoryStore::new();
/// let ctx = TxContext::new(Arc::new(store.clone()));
/// let users = ctx.repository("users");
///
/// SessionRegistry::scope(async {
///     let mut txn = ctx
///         .begin_transaction(Default::default(), Default::default())
///         .await
///         .unwrap();
///     users.insert_one(&json!({"_id": 1, "name": "Ada"})).await.unwrap();
///     txn.commit().await.unwrap();
///     txn.dispose().await;
/// })
/// .await;
///
/// assert_eq!(store.documents("users").await.len(), 1);
/// # });
/// ```
#[derive(Clone)]
pub struct TxContext {
    client: Arc<dyn DocumentClient>,
    registry: Arc<SessionRegistry>,
    retry_policy: RetryPolicy,
    auto_enlist: bool,
}

impl TxContext {
    pub fn new(client: Arc<dyn DocumentClient>) -> Self {
        Self {
            client,
            registry: Arc::new(SessionRegistry::new()),
            retry_policy: RetryPolicy::default(),
            auto_enlist: false,
        }
    }

    /// Have repositories join an open ambient scope on their first mutating
    /// call.
    pub fn auto_enlist(mut self, enabled: bool) -> Self {
        self.auto_enlist = enabled;
        self
    }

    /// Default retry policy for commits and `with_transaction` bodies.
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn client(&self) -> &Arc<dyn DocumentClient> {
        &self.client
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Opens an explicit transaction and binds its session into the calling
    /// flow's slot.
    pub async fn begin_transaction(
        &self,
        session_options: SessionOptions,
        transaction_options: TransactionOptions,
    ) -> Result<Transaction> {
        Transaction::start(
            &self.client,
            self.retry_policy.clone(),
            session_options,
            transaction_options,
        )
        .await
    }

    /// Joins the calling flow to the current ambient scope, starting the
    /// scope's store transaction if this is the first call to do so.
    ///
    /// Fails with [`TxError::NoAmbientScope`] when no scope is open.
    pub async fn enlist_ambient(&self, max_retries: Option<u32>) -> Result<()> {
        ambient::enlist(&self.client, &self.registry, self.policy_for(max_retries)).await
    }

    /// Runs `body` inside a transaction of the requested kind, retrying the
    /// whole body on transient conflicts under the context's retry policy
    /// (`max_retries`, when given, overrides the attempt budget).
    pub async fn with_transaction<T, F, Fut>(
        &self,
        kind: TransactionKind,
        max_retries: Option<u32>,
        mut body: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let policy = self.policy_for(max_retries);
        let started = Instant::now();
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;
            let attempt = match kind {
                TransactionKind::Native => self.run_native(&mut body).await,
                TransactionKind::Ambient => self.run_ambient(max_retries, &mut body).await,
            };

            match attempt {
                Ok(value) => return Ok(value),
                Err(err)
                    if err.is_transient_conflict()
                        && policy.should_retry(attempts, started.elapsed()) =>
                {
                    warn!("rerunning transaction body after transient conflict (attempt {attempts}): {err}");
                    tokio::task::yield_now().await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// One attempt on a dedicated session, driven by the store's own
    /// transaction helper. The session is bound into a fresh flow slot for
    /// the duration so repository calls inside the body participate.
    async fn run_native<T, F, Fut>(&self, body: &mut F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.client.ensure_provisioned().await?;
        let session = self.client.start_session(SessionOptions::default()).await?;

        let result = SessionRegistry::scope({
            let session = session.clone();
            async move {
                SessionRegistry::set(Some(session.clone()));
                let result = session
                    .with_transaction(TransactionOptions::default(), body)
                    .await;
                SessionRegistry::set(None);
                result
            }
        })
        .await;

        session.end().await;
        result
    }

    /// One attempt inside a fresh ambient scope; the body's repository calls
    /// (and the eager enlistment here) all share the scope's session.
    async fn run_ambient<T, F, Fut>(&self, max_retries: Option<u32>, body: &mut F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let this = self;
        AmbientScope::run(move || async move {
            ambient::enlist(&this.client, &this.registry, this.policy_for(max_retries)).await?;
            body().await
        })
        .await
    }

    pub fn repository(&self, name: &str) -> Repository {
        Repository::new(
            self.client.collection(name),
            Arc::clone(&self.client),
            Arc::clone(&self.registry),
            self.auto_enlist,
            self.retry_policy.clone(),
        )
    }

    fn policy_for(&self, max_retries: Option<u32>) -> RetryPolicy {
        match max_retries {
            Some(limit) => self.retry_policy.clone().max_retries(limit),
            None => self.retry_policy.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context() -> (MemoryStore, TxContext) {
        let store = MemoryStore::new();
        let ctx = TxContext::new(Arc::new(store.clone()));
        (store, ctx)
    }

    #[tokio::test]
    async fn test_native_with_transaction_commits() {
        let (store, ctx) = context();
        let users = ctx.repository("users");
        let users_ref = &users;

        ctx.with_transaction(TransactionKind::Native, None, move || async move {
            users_ref.insert_one(&json!({"_id": 1})).await?;
            users_ref.insert_one(&json!({"_id": 2})).await?;
            Ok(())
        })
        .await
        .unwrap();

        assert_eq!(store.documents("users").await.len(), 2);

        let ops = store.operations();
        assert!(ops.iter().all(|op| op.session.is_some()));
        assert_eq!(ops[0].session, ops[1].session);
    }

    #[tokio::test]
    async fn test_native_with_transaction_rolls_back_on_error() {
        let (store, ctx) = context();
        let users = ctx.repository("users");
        let users_ref = &users;

        let result: Result<()> = ctx
            .with_transaction(TransactionKind::Native, None, move || async move {
                users_ref.insert_one(&json!({"_id": 1})).await?;
                Err(TxError::from(StoreError::command("boom")))
            })
            .await;

        assert!(result.is_err());
        assert!(store.documents("users").await.is_empty());
        assert_eq!(store.open_sessions().await, 0);
    }

    #[tokio::test]
    async fn test_ambient_with_transaction_commits() {
        let (store, ctx) = context();
        let ctx = ctx.auto_enlist(true);
        let users = ctx.repository("users");
        let users_ref = &users;

        ctx.with_transaction(TransactionKind::Ambient, None, move || async move {
            users_ref.insert_one(&json!({"_id": 1})).await?;
            Ok(())
        })
        .await
        .unwrap();

        assert_eq!(store.documents("users").await.len(), 1);
        assert_eq!(store.sessions_started(), 1);
        assert_eq!(ctx.registry().stats().await.external_entries, 0);
    }

    #[tokio::test]
    async fn test_enlist_ambient_requires_scope() {
        let (_store, ctx) = context();

        let err = ctx.enlist_ambient(None).await.unwrap_err();
        assert!(matches!(err, TxError::NoAmbientScope));
    }
}
