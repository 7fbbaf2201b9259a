/// Explicit transaction handle tests
///
/// Covers session reuse across repository calls inside one handle and
/// cleanup of the flow's session binding on every exit path.
/// Run with: cargo test --test transaction_tests

use std::sync::Arc;

use serde_json::json;
use txflow::{MemoryStore, SessionRegistry, TransactionState, TxContext, TxError};

fn context() -> (MemoryStore, TxContext) {
    let store = MemoryStore::new();
    let ctx = TxContext::new(Arc::new(store.clone()));
    (store, ctx)
}

#[tokio::test]
async fn test_every_call_under_one_handle_uses_the_same_session() {
    let (store, ctx) = context();
    let users = ctx.repository("users");
    let orders = ctx.repository("orders");

    SessionRegistry::scope(async {
        let mut txn = ctx
            .begin_transaction(Default::default(), Default::default())
            .await
            .unwrap();

        users.insert_one(&json!({"_id": 1})).await.unwrap();
        orders.insert_one(&json!({"_id": 10, "user": 1})).await.unwrap();
        users
            .update_many(json!({"_id": 1}), json!({"active": true}))
            .await
            .unwrap();
        users.find(json!({})).await.unwrap();

        txn.commit().await.unwrap();
        txn.dispose().await;
    })
    .await;

    let ops = store.operations();
    assert_eq!(ops.len(), 4);
    let session = ops[0].session.expect("first call carried a session");
    assert!(ops.iter().all(|op| op.session == Some(session)));
}

#[tokio::test]
async fn test_commit_path_clears_flow_binding_and_releases_session() {
    let (store, ctx) = context();
    let users = ctx.repository("users");

    SessionRegistry::scope(async {
        let mut txn = ctx
            .begin_transaction(Default::default(), Default::default())
            .await
            .unwrap();
        users.insert_one(&json!({"_id": 1})).await.unwrap();

        txn.commit().await.unwrap();
        assert!(SessionRegistry::current().is_none());
        txn.dispose().await;
    })
    .await;

    assert_eq!(store.documents("users").await.len(), 1);
    assert_eq!(store.open_sessions().await, 0);
}

#[tokio::test]
async fn test_abort_path_clears_flow_binding_and_discards_writes() {
    let (store, ctx) = context();
    let users = ctx.repository("users");

    SessionRegistry::scope(async {
        let mut txn = ctx
            .begin_transaction(Default::default(), Default::default())
            .await
            .unwrap();
        users.insert_one(&json!({"_id": 1})).await.unwrap();

        txn.abort().await.unwrap();
        assert_eq!(txn.state(), TransactionState::Aborted);
        assert!(SessionRegistry::current().is_none());
        txn.dispose().await;
    })
    .await;

    assert!(store.documents("users").await.is_empty());
    assert_eq!(store.open_sessions().await, 0);
}

#[tokio::test]
async fn test_dispose_without_commit_clears_flow_binding_and_discards_writes() {
    let (store, ctx) = context();
    let users = ctx.repository("users");

    SessionRegistry::scope(async {
        let txn = ctx
            .begin_transaction(Default::default(), Default::default())
            .await
            .unwrap();
        users.insert_one(&json!({"_id": 1})).await.unwrap();

        txn.dispose().await;
        assert!(SessionRegistry::current().is_none());
    })
    .await;

    assert!(store.documents("users").await.is_empty());
    assert_eq!(store.open_sessions().await, 0);
}

#[tokio::test]
async fn test_sequential_handles_on_one_flow_do_not_interfere() {
    let (store, ctx) = context();
    let users = ctx.repository("users");

    SessionRegistry::scope(async {
        let mut first = ctx
            .begin_transaction(Default::default(), Default::default())
            .await
            .unwrap();
        users.insert_one(&json!({"_id": 1})).await.unwrap();
        first.commit().await.unwrap();
        first.dispose().await;

        let mut second = ctx
            .begin_transaction(Default::default(), Default::default())
            .await
            .unwrap();
        users.insert_one(&json!({"_id": 2})).await.unwrap();
        second.abort().await.unwrap();
        second.dispose().await;
    })
    .await;

    let docs = store.documents("users").await;
    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0], json!({"_id": 1}));

    let ops = store.operations();
    assert_ne!(ops[0].session, ops[1].session);
}

#[tokio::test]
async fn test_repository_outside_any_transaction_runs_sessionless() {
    let (store, ctx) = context();
    let users = ctx.repository("users");

    users.insert_one(&json!({"_id": 1})).await.unwrap();

    assert_eq!(store.operations()[0].session, None);
    assert_eq!(store.documents("users").await.len(), 1);
}

#[tokio::test]
async fn test_completed_handle_rejects_further_lifecycle_calls() {
    let (_store, ctx) = context();

    SessionRegistry::scope(async {
        let mut txn = ctx
            .begin_transaction(Default::default(), Default::default())
            .await
            .unwrap();
        txn.commit().await.unwrap();

        assert!(matches!(txn.commit().await, Err(TxError::AlreadyCompleted)));
        assert!(matches!(txn.abort().await, Err(TxError::AlreadyCompleted)));
        txn.dispose().await;
    })
    .await;
}
