// ============================================================================
// Repository Call Sites
// ============================================================================
//
// Per-collection access object. Every mutating operation resolves the
// session for the calling flow first: a bound session is reused as-is, and
// when auto-enlist is on, an open ambient scope is joined before the write
// goes out. Flows with neither run sessionless.
//
// ============================================================================

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::core::{Result, TxError};
use crate::registry::SessionRegistry;
use crate::scope::AmbientScope;
use crate::store::{Collection, DocumentClient, Session};
use crate::transaction::{ambient, RetryPolicy};

pub struct Repository {
    collection: Collection,
    client: Arc<dyn DocumentClient>,
    registry: Arc<SessionRegistry>,
    auto_enlist: bool,
    enlist_retry: RetryPolicy,
}

impl Repository {
    pub(crate) fn new(
        collection: Collection,
        client: Arc<dyn DocumentClient>,
        registry: Arc<SessionRegistry>,
        auto_enlist: bool,
        enlist_retry: RetryPolicy,
    ) -> Self {
        Self {
            collection,
            client,
            registry,
            auto_enlist,
            enlist_retry,
        }
    }

    /// Session for a mutating operation: the flow's bound session, or a
    /// freshly enlisted one when an ambient scope is open and auto-enlist is
    /// configured.
    async fn write_session(&self) -> Result<Option<Session>> {
        if let Some(session) = SessionRegistry::current() {
            return Ok(Some(session));
        }
        if self.auto_enlist && AmbientScope::current().is_some() {
            ambient::enlist(&self.client, &self.registry, self.enlist_retry.clone()).await?;
            return Ok(SessionRegistry::current());
        }
        Ok(None)
    }

    pub async fn insert_one<T: Serialize>(&self, document: &T) -> Result<()> {
        let document = serde_json::to_value(document)
            .map_err(|err| TxError::InvalidDocument(err.to_string()))?;
        let session = self.write_session().await?;
        self.collection
            .insert(document, session.as_ref())
            .await
            .map_err(TxError::from)
    }

    /// Sets the fields of `update` on every matching document. Returns the
    /// matched count.
    pub async fn update_many(&self, filter: Value, update: Value) -> Result<u64> {
        let session = self.write_session().await?;
        self.collection
            .update(filter, update, session.as_ref())
            .await
            .map_err(TxError::from)
    }

    /// Like [`Repository::update_many`], but a filter that matches nothing
    /// is reported as [`TxError::NotFound`].
    pub async fn update_one(&self, filter: Value, update: Value) -> Result<()> {
        match self.update_many(filter, update).await? {
            0 => Err(TxError::NotFound),
            _ => Ok(()),
        }
    }

    /// Removes every matching document. Returns the removed count.
    pub async fn delete_many(&self, filter: Value) -> Result<u64> {
        let session = self.write_session().await?;
        self.collection
            .delete(filter, session.as_ref())
            .await
            .map_err(TxError::from)
    }

    /// Like [`Repository::delete_many`], but a filter that matches nothing
    /// is reported as [`TxError::NotFound`].
    pub async fn delete_one(&self, filter: Value) -> Result<()> {
        match self.delete_many(filter).await? {
            0 => Err(TxError::NotFound),
            _ => Ok(()),
        }
    }

    /// Finds matching documents. Reads reuse the flow's session when one is
    /// bound but never enlist on their own.
    pub async fn find(&self, filter: Value) -> Result<Vec<Value>> {
        let session = SessionRegistry::current();
        self.collection
            .find(filter, session.as_ref())
            .await
            .map_err(TxError::from)
    }

    pub async fn find_as<T: DeserializeOwned>(&self, filter: Value) -> Result<Vec<T>> {
        self.find(filter)
            .await?
            .into_iter()
            .map(|doc| {
                serde_json::from_value(doc).map_err(|err| TxError::InvalidDocument(err.to_string()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde::Deserialize;
    use serde_json::json;

    fn repository(auto_enlist: bool) -> (MemoryStore, Arc<SessionRegistry>, Repository) {
        let store = MemoryStore::new();
        let client: Arc<dyn DocumentClient> = Arc::new(store.clone());
        let registry = Arc::new(SessionRegistry::new());
        let repo = Repository::new(
            client.collection("users"),
            Arc::clone(&client),
            Arc::clone(&registry),
            auto_enlist,
            RetryPolicy::default(),
        );
        (store, registry, repo)
    }

    #[tokio::test]
    async fn test_sessionless_write_applies_directly() {
        let (store, _registry, repo) = repository(false);

        repo.insert_one(&json!({"_id": 1})).await.unwrap();

        assert_eq!(store.documents("users").await.len(), 1);
        assert_eq!(store.operations()[0].session, None);
    }

    #[tokio::test]
    async fn test_auto_enlist_joins_open_ambient_scope() {
        let (store, _registry, repo) = repository(true);
        let repo_ref = &repo;

        AmbientScope::run(move || async move {
            repo_ref.insert_one(&json!({"_id": 1})).await?;
            repo_ref.insert_one(&json!({"_id": 2})).await?;
            Ok(())
        })
        .await
        .unwrap();

        let ops = store.operations();
        assert_eq!(ops.len(), 2);
        assert!(ops[0].session.is_some());
        assert_eq!(ops[0].session, ops[1].session);
        assert_eq!(store.documents("users").await.len(), 2);
    }

    #[tokio::test]
    async fn test_no_enlist_without_configuration() {
        let (store, _registry, repo) = repository(false);
        let repo_ref = &repo;

        AmbientScope::run(move || async move {
            repo_ref.insert_one(&json!({"_id": 1})).await
        })
        .await
        .unwrap();

        assert_eq!(store.sessions_started(), 0);
        assert_eq!(store.operations()[0].session, None);
    }

    #[tokio::test]
    async fn test_update_one_miss_is_not_found() {
        let (_store, _registry, repo) = repository(false);

        let err = repo
            .update_one(json!({"_id": 42}), json!({"name": "x"}))
            .await
            .unwrap_err();
        assert!(matches!(err, TxError::NotFound));

        let err = repo.delete_one(json!({"_id": 42})).await.unwrap_err();
        assert!(matches!(err, TxError::NotFound));
    }

    #[tokio::test]
    async fn test_find_as_deserializes_documents() {
        #[derive(Debug, Deserialize, PartialEq)]
        struct User {
            _id: u32,
            name: String,
        }

        let (_store, _registry, repo) = repository(false);
        repo.insert_one(&json!({"_id": 7, "name": "ada"}))
            .await
            .unwrap();

        let users: Vec<User> = repo.find_as(json!({"_id": 7})).await.unwrap();
        assert_eq!(
            users,
            vec![User {
                _id: 7,
                name: "ada".to_string()
            }]
        );
    }
}
