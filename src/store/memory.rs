// ============================================================================
// In-Memory Document Store
// ============================================================================
//
// A small embedded backend implementing the store interface with real
// transactional staging: writes issued under a session's transaction are
// buffered and applied atomically on commit, or discarded on abort.
//
// The store also records which session served every collection operation and
// can be scripted to fail commits with a transient label, which is what the
// integration tests drive their assertions through.
//
// ============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};

use super::{
    Collection, CollectionHandle, DocumentClient, Session, SessionHandle, SessionId,
    SessionOptions, StoreError, StoreResult, TransactionOptions,
};

/// Kind of a recorded collection operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Insert,
    Update,
    Delete,
    Find,
}

/// One recorded collection operation and the session that served it.
#[derive(Debug, Clone)]
pub struct OpRecord {
    pub collection: String,
    pub kind: OpKind,
    pub session: Option<SessionId>,
}

enum StagedOp {
    Insert { collection: String, document: Value },
    Update { collection: String, filter: Value, update: Value },
    Delete { collection: String, filter: Value },
}

#[derive(Default)]
struct SessionState {
    in_transaction: bool,
    staged: Vec<StagedOp>,
}

struct StoreInner {
    collections: RwLock<HashMap<String, Vec<Value>>>,
    known: StdMutex<HashSet<String>>,
    provisioned: StdMutex<HashSet<String>>,
    sessions: Mutex<HashMap<SessionId, SessionState>>,
    ops: StdMutex<Vec<OpRecord>>,
    commit_attempts: AtomicU32,
    failing_commits: AtomicU32,
    sessions_started: AtomicU32,
    provision_calls: AtomicU32,
}

impl StoreInner {
    fn record(&self, kind: OpKind, collection: &str, session: Option<&Session>) {
        self.ops
            .lock()
            .expect("op log lock poisoned")
            .push(OpRecord {
                collection: collection.to_string(),
                kind,
                session: session.map(Session::id),
            });
    }

    async fn apply_insert(&self, collection: &str, document: Value) -> StoreResult<()> {
        let mut collections = self.collections.write().await;
        collections
            .entry(collection.to_string())
            .or_default()
            .push(document);
        Ok(())
    }

    async fn apply_update(&self, collection: &str, filter: &Value, update: &Value) -> u64 {
        let mut collections = self.collections.write().await;
        let Some(docs) = collections.get_mut(collection) else {
            return 0;
        };
        let mut matched = 0;
        for doc in docs.iter_mut() {
            if matches_filter(doc, filter) {
                merge_fields(doc, update);
                matched += 1;
            }
        }
        matched
    }

    async fn apply_delete(&self, collection: &str, filter: &Value) -> u64 {
        let mut collections = self.collections.write().await;
        let Some(docs) = collections.get_mut(collection) else {
            return 0;
        };
        let before = docs.len();
        docs.retain(|doc| !matches_filter(doc, filter));
        (before - docs.len()) as u64
    }

    async fn count_matching(&self, collection: &str, filter: &Value) -> u64 {
        let collections = self.collections.read().await;
        collections
            .get(collection)
            .map(|docs| docs.iter().filter(|doc| matches_filter(doc, filter)).count() as u64)
            .unwrap_or(0)
    }

    async fn apply_staged(&self, staged: Vec<StagedOp>) {
        let mut collections = self.collections.write().await;
        for op in staged {
            match op {
                StagedOp::Insert {
                    collection,
                    document,
                } => {
                    collections.entry(collection).or_default().push(document);
                }
                StagedOp::Update {
                    collection,
                    filter,
                    update,
                } => {
                    if let Some(docs) = collections.get_mut(&collection) {
                        for doc in docs.iter_mut() {
                            if matches_filter(doc, &filter) {
                                merge_fields(doc, &update);
                            }
                        }
                    }
                }
                StagedOp::Delete { collection, filter } => {
                    if let Some(docs) = collections.get_mut(&collection) {
                        docs.retain(|doc| !matches_filter(doc, &filter));
                    }
                }
            }
        }
    }
}

/// Returns true when every field of `filter` is present in `doc` with an
/// equal value. An empty filter matches everything.
fn matches_filter(doc: &Value, filter: &Value) -> bool {
    match filter.as_object() {
        Some(fields) => fields
            .iter()
            .all(|(key, expected)| doc.get(key) == Some(expected)),
        None => false,
    }
}

fn merge_fields(doc: &mut Value, update: &Value) {
    if let (Some(target), Some(fields)) = (doc.as_object_mut(), update.as_object()) {
        for (key, value) in fields {
            target.insert(key.clone(), value.clone());
        }
    }
}

/// In-memory store. Clones share the same state.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<StoreInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(StoreInner {
                collections: RwLock::new(HashMap::new()),
                known: StdMutex::new(HashSet::new()),
                provisioned: StdMutex::new(HashSet::new()),
                sessions: Mutex::new(HashMap::new()),
                ops: StdMutex::new(Vec::new()),
                commit_attempts: AtomicU32::new(0),
                failing_commits: AtomicU32::new(0),
                sessions_started: AtomicU32::new(0),
                provision_calls: AtomicU32::new(0),
            }),
        }
    }

    /// Scripts the next `count` commit attempts to fail with the
    /// transient-transaction label.
    pub fn fail_commits(&self, count: u32) {
        self.inner.failing_commits.store(count, Ordering::SeqCst);
    }

    /// Every collection operation recorded so far, oldest first.
    pub fn operations(&self) -> Vec<OpRecord> {
        self.inner.ops.lock().expect("op log lock poisoned").clone()
    }

    /// Total commit attempts, including scripted failures.
    pub fn commit_attempts(&self) -> u32 {
        self.inner.commit_attempts.load(Ordering::SeqCst)
    }

    pub fn sessions_started(&self) -> u32 {
        self.inner.sessions_started.load(Ordering::SeqCst)
    }

    pub fn provision_calls(&self) -> u32 {
        self.inner.provision_calls.load(Ordering::SeqCst)
    }

    /// Number of sessions that have been started but not yet ended.
    pub async fn open_sessions(&self) -> usize {
        self.inner.sessions.lock().await.len()
    }

    /// Committed documents of a collection.
    pub async fn documents(&self, collection: &str) -> Vec<Value> {
        self.inner
            .collections
            .read()
            .await
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DocumentClient for MemoryStore {
    async fn start_session(&self, _options: SessionOptions) -> StoreResult<Session> {
        let id = SessionId::new();
        self.inner
            .sessions
            .lock()
            .await
            .insert(id, SessionState::default());
        self.inner.sessions_started.fetch_add(1, Ordering::SeqCst);

        Ok(Session::new(
            id,
            Box::new(MemorySession {
                id,
                store: Arc::clone(&self.inner),
            }),
        ))
    }

    async fn ensure_provisioned(&self) -> StoreResult<()> {
        self.inner.provision_calls.fetch_add(1, Ordering::SeqCst);

        let names: Vec<String> = {
            let known = self.inner.known.lock().expect("known lock poisoned");
            known.iter().cloned().collect()
        };

        let mut collections = self.inner.collections.write().await;
        let mut provisioned = self
            .inner
            .provisioned
            .lock()
            .expect("provisioned lock poisoned");
        for name in names {
            collections.entry(name.clone()).or_default();
            provisioned.insert(name);
        }
        Ok(())
    }

    fn collection(&self, name: &str) -> Collection {
        self.inner
            .known
            .lock()
            .expect("known lock poisoned")
            .insert(name.to_string());

        Arc::new(MemoryCollection {
            name: name.to_string(),
            store: Arc::clone(&self.inner),
        })
    }
}

struct MemorySession {
    id: SessionId,
    store: Arc<StoreInner>,
}

#[async_trait]
impl SessionHandle for MemorySession {
    async fn start_transaction(&mut self, _options: TransactionOptions) -> StoreResult<()> {
        let mut sessions = self.store.sessions.lock().await;
        let state = sessions.get_mut(&self.id).ok_or(StoreError::SessionEnded)?;
        if state.in_transaction {
            return Err(StoreError::TransactionInProgress);
        }
        state.in_transaction = true;
        Ok(())
    }

    async fn commit_transaction(&mut self) -> StoreResult<()> {
        self.store.commit_attempts.fetch_add(1, Ordering::SeqCst);

        let staged = {
            let mut sessions = self.store.sessions.lock().await;
            let state = sessions.get_mut(&self.id).ok_or(StoreError::SessionEnded)?;
            if !state.in_transaction {
                return Err(StoreError::NoActiveTransaction);
            }

            // A scripted failure leaves the transaction active so the commit
            // can be attempted again, mirroring retryable-commit stores.
            if self
                .store
                .failing_commits
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(StoreError::transient("simulated transient commit conflict"));
            }

            state.in_transaction = false;
            std::mem::take(&mut state.staged)
        };

        self.store.apply_staged(staged).await;
        Ok(())
    }

    async fn abort_transaction(&mut self) -> StoreResult<()> {
        let mut sessions = self.store.sessions.lock().await;
        let state = sessions.get_mut(&self.id).ok_or(StoreError::SessionEnded)?;
        if !state.in_transaction {
            return Err(StoreError::NoActiveTransaction);
        }
        state.in_transaction = false;
        state.staged.clear();
        Ok(())
    }

    async fn end(&mut self) {
        // Ending with an open transaction discards its staged work.
        self.store.sessions.lock().await.remove(&self.id);
    }
}

struct MemoryCollection {
    name: String,
    store: Arc<StoreInner>,
}

impl MemoryCollection {
    /// Stages `op` under the session's transaction, or returns `None` when
    /// the session has no open transaction and the operation should be
    /// applied directly.
    async fn try_stage(&self, session: &Session, op: StagedOp) -> StoreResult<Option<()>> {
        let mut sessions = self.store.sessions.lock().await;
        let state = sessions
            .get_mut(&session.id())
            .ok_or(StoreError::SessionEnded)?;
        if !state.in_transaction {
            return Ok(None);
        }

        if matches!(op, StagedOp::Insert { .. }) {
            let provisioned = self
                .store
                .provisioned
                .lock()
                .expect("provisioned lock poisoned");
            if !provisioned.contains(&self.name) {
                return Err(StoreError::command(format!(
                    "collection '{}' must be provisioned before it is used in a transaction",
                    self.name
                )));
            }
        }

        state.staged.push(op);
        Ok(Some(()))
    }
}

#[async_trait]
impl CollectionHandle for MemoryCollection {
    async fn insert(&self, document: Value, session: Option<&Session>) -> StoreResult<()> {
        self.store.record(OpKind::Insert, &self.name, session);

        if let Some(session) = session {
            let staged = self
                .try_stage(
                    session,
                    StagedOp::Insert {
                        collection: self.name.clone(),
                        document: document.clone(),
                    },
                )
                .await?;
            if staged.is_some() {
                return Ok(());
            }
        }
        self.store.apply_insert(&self.name, document).await
    }

    async fn update(
        &self,
        filter: Value,
        update: Value,
        session: Option<&Session>,
    ) -> StoreResult<u64> {
        self.store.record(OpKind::Update, &self.name, session);

        if let Some(session) = session {
            let matched = self.store.count_matching(&self.name, &filter).await;
            let staged = self
                .try_stage(
                    session,
                    StagedOp::Update {
                        collection: self.name.clone(),
                        filter: filter.clone(),
                        update: update.clone(),
                    },
                )
                .await?;
            if staged.is_some() {
                return Ok(matched);
            }
        }
        Ok(self.store.apply_update(&self.name, &filter, &update).await)
    }

    async fn delete(&self, filter: Value, session: Option<&Session>) -> StoreResult<u64> {
        self.store.record(OpKind::Delete, &self.name, session);

        if let Some(session) = session {
            let matched = self.store.count_matching(&self.name, &filter).await;
            let staged = self
                .try_stage(
                    session,
                    StagedOp::Delete {
                        collection: self.name.clone(),
                        filter: filter.clone(),
                    },
                )
                .await?;
            if staged.is_some() {
                return Ok(matched);
            }
        }
        Ok(self.store.apply_delete(&self.name, &filter).await)
    }

    async fn find(&self, filter: Value, session: Option<&Session>) -> StoreResult<Vec<Value>> {
        self.store.record(OpKind::Find, &self.name, session);

        let collections = self.store.collections.read().await;
        Ok(collections
            .get(&self.name)
            .map(|docs| {
                docs.iter()
                    .filter(|doc| matches_filter(doc, &filter))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn store_with_collection(name: &str) -> (MemoryStore, Collection) {
        let store = MemoryStore::new();
        let collection = store.collection(name);
        store.ensure_provisioned().await.unwrap();
        (store, collection)
    }

    #[tokio::test]
    async fn test_staged_insert_is_invisible_until_commit() {
        let (store, users) = store_with_collection("users").await;
        let session = store.start_session(SessionOptions::default()).await.unwrap();

        session
            .start_transaction(TransactionOptions::default())
            .await
            .unwrap();
        users
            .insert(json!({"_id": 1}), Some(&session))
            .await
            .unwrap();

        assert!(store.documents("users").await.is_empty());

        session.commit_transaction().await.unwrap();
        assert_eq!(store.documents("users").await.len(), 1);
    }

    #[tokio::test]
    async fn test_abort_discards_staged_writes() {
        let (store, users) = store_with_collection("users").await;
        let session = store.start_session(SessionOptions::default()).await.unwrap();

        session
            .start_transaction(TransactionOptions::default())
            .await
            .unwrap();
        users
            .insert(json!({"_id": 1}), Some(&session))
            .await
            .unwrap();
        session.abort_transaction().await.unwrap();

        assert!(store.documents("users").await.is_empty());
    }

    #[tokio::test]
    async fn test_ending_session_discards_open_transaction() {
        let (store, users) = store_with_collection("users").await;
        let session = store.start_session(SessionOptions::default()).await.unwrap();

        session
            .start_transaction(TransactionOptions::default())
            .await
            .unwrap();
        users
            .insert(json!({"_id": 1}), Some(&session))
            .await
            .unwrap();
        session.end().await;

        assert!(store.documents("users").await.is_empty());
        assert_eq!(store.open_sessions().await, 0);
    }

    #[tokio::test]
    async fn test_unprovisioned_collection_rejected_inside_transaction() {
        let store = MemoryStore::new();
        let orders = store.collection("orders");
        let session = store.start_session(SessionOptions::default()).await.unwrap();

        session
            .start_transaction(TransactionOptions::default())
            .await
            .unwrap();
        let err = orders
            .insert(json!({"_id": 1}), Some(&session))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("provisioned"));
    }

    #[tokio::test]
    async fn test_scripted_commit_failures_are_transient_and_finite() {
        let (store, users) = store_with_collection("users").await;
        let session = store.start_session(SessionOptions::default()).await.unwrap();
        store.fail_commits(2);

        session
            .start_transaction(TransactionOptions::default())
            .await
            .unwrap();
        users
            .insert(json!({"_id": 1}), Some(&session))
            .await
            .unwrap();

        let first = session.commit_transaction().await.unwrap_err();
        assert!(first.is_transient_conflict());
        let second = session.commit_transaction().await.unwrap_err();
        assert!(second.is_transient_conflict());

        session.commit_transaction().await.unwrap();
        assert_eq!(store.commit_attempts(), 3);
        assert_eq!(store.documents("users").await.len(), 1);
    }

    #[tokio::test]
    async fn test_update_and_delete_outside_transaction() {
        let (store, users) = store_with_collection("users").await;

        users.insert(json!({"_id": 1, "name": "ada"}), None).await.unwrap();
        users.insert(json!({"_id": 2, "name": "bob"}), None).await.unwrap();

        let matched = users
            .update(json!({"_id": 1}), json!({"name": "ada l."}), None)
            .await
            .unwrap();
        assert_eq!(matched, 1);

        let found = users.find(json!({"name": "ada l."}), None).await.unwrap();
        assert_eq!(found.len(), 1);

        let removed = users.delete(json!({"_id": 2}), None).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.documents("users").await.len(), 1);
    }

    #[tokio::test]
    async fn test_operations_record_serving_session() {
        let (store, users) = store_with_collection("users").await;
        let session = store.start_session(SessionOptions::default()).await.unwrap();

        users.insert(json!({"_id": 1}), None).await.unwrap();
        users.insert(json!({"_id": 2}), Some(&session)).await.unwrap();

        let ops = store.operations();
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0].session, None);
        assert_eq!(ops[1].session, Some(session.id()));
    }
}
