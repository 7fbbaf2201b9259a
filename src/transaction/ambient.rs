// ============================================================================
// Ambient Enlistment Bridge
// ============================================================================
//
// Lets repository code join an open ambient scope transparently: the first
// call inside a scope starts a session and store transaction for it, and
// every later call — on this flow or a sibling continuation — finds and
// reuses that session. The store transaction then commits or aborts in
// lockstep with the scope itself.
//
// ============================================================================

use std::sync::Arc;

use async_trait::async_trait;
use log::debug;

use super::RetryPolicy;
use crate::core::{Result, TxError};
use crate::registry::SessionRegistry;
use crate::scope::{AmbientScope, Participant};
use crate::store::{DocumentClient, Session, SessionOptions, TransactionOptions};

/// Joins the calling flow to the current ambient scope.
///
/// Resolution order:
/// 1. the flow already has a session bound — nothing to do;
/// 2. a sibling flow inside the same scope already created the session —
///    adopt it from the registry's external-id map;
/// 3. no ambient scope is open — this is a caller error;
/// 4. otherwise create the session, start its transaction, publish it under
///    the scope's identifier, and enlist a participant that commits (under
///    `commit_retry`) or aborts with the scope. A completion hook clears the
///    slot and the map entry on every outcome, so the identifier can be
///    safely reused by an unrelated later scope.
pub(crate) async fn enlist(
    client: &Arc<dyn DocumentClient>,
    registry: &Arc<SessionRegistry>,
    commit_retry: RetryPolicy,
) -> Result<()> {
    if SessionRegistry::current().is_some() {
        return Ok(());
    }

    let scope = AmbientScope::current().ok_or(TxError::NoAmbientScope)?;

    if let Some(session) = registry.lookup_external(scope.id()).await {
        debug!("adopting {} for ambient scope {}", session.id(), scope.id());
        SessionRegistry::set(Some(session));
        return Ok(());
    }

    client.ensure_provisioned().await?;
    let session = client.start_session(SessionOptions::default()).await?;
    if let Err(err) = session
        .start_transaction(TransactionOptions::default())
        .await
    {
        session.end().await;
        return Err(err.into());
    }
    debug!("started {} for ambient scope {}", session.id(), scope.id());

    SessionRegistry::set(Some(session.clone()));
    registry.register_external(scope.id(), session.clone()).await;

    scope
        .enlist_volatile(Box::new(SessionParticipant {
            session: session.clone(),
            retry: commit_retry,
        }))
        .await;

    let registry = Arc::clone(registry);
    let scope_id = scope.id();
    scope
        .on_completed(Box::new(move |_outcome| {
            Box::pin(async move {
                SessionRegistry::set(None);
                registry.remove_external(scope_id).await;
                session.end().await;
            })
        }))
        .await;

    Ok(())
}

/// Store session enlisted as a volatile resource of an ambient scope.
struct SessionParticipant {
    session: Session,
    retry: RetryPolicy,
}

#[async_trait]
impl Participant for SessionParticipant {
    async fn prepare(&self) -> Result<()> {
        // Nothing to stage: the store transaction is the unit of work.
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        self.retry
            .run(|| {
                let session = self.session.clone();
                async move { session.commit_transaction().await.map_err(TxError::from) }
            })
            .await
    }

    async fn rollback(&self) -> Result<()> {
        self.session
            .abort_transaction()
            .await
            .map_err(TxError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn fixture() -> (MemoryStore, Arc<dyn DocumentClient>, Arc<SessionRegistry>) {
        let store = MemoryStore::new();
        let client: Arc<dyn DocumentClient> = Arc::new(store.clone());
        (store, client, Arc::new(SessionRegistry::new()))
    }

    #[tokio::test]
    async fn test_enlist_outside_scope_is_an_error() {
        let (_store, client, registry) = fixture();

        let err = SessionRegistry::scope(enlist(&client, &registry, RetryPolicy::default()))
            .await
            .unwrap_err();
        assert!(matches!(err, TxError::NoAmbientScope));
    }

    #[tokio::test]
    async fn test_enlist_creates_and_binds_one_session() {
        let (store, client, registry) = fixture();
        let (client_ref, registry_ref) = (&client, &registry);

        AmbientScope::run(move || async move {
            enlist(client_ref, registry_ref, RetryPolicy::default()).await?;
            let bound = SessionRegistry::current().expect("session bound");

            // A second call on the same flow is a no-op.
            enlist(client_ref, registry_ref, RetryPolicy::default()).await?;
            assert_eq!(SessionRegistry::current().unwrap().id(), bound.id());
            Ok(())
        })
        .await
        .unwrap();

        assert_eq!(store.sessions_started(), 1);
        assert_eq!(registry.stats().await.external_entries, 0);
    }

    #[tokio::test]
    async fn test_sibling_flow_adopts_existing_session() {
        let (store, client, registry) = fixture();
        let (client_ref, registry_ref) = (&client, &registry);

        AmbientScope::run(move || async move {
            enlist(client_ref, registry_ref, RetryPolicy::default()).await?;
            let created = SessionRegistry::current().unwrap().id();

            // A helper with its own flow context does not inherit the slot,
            // but the scope identifier leads it back to the same session.
            SessionRegistry::scope(async move {
                assert!(SessionRegistry::current().is_none());
                enlist(client_ref, registry_ref, RetryPolicy::default()).await?;
                assert_eq!(SessionRegistry::current().unwrap().id(), created);
                Ok::<_, TxError>(())
            })
            .await?;
            Ok(())
        })
        .await
        .unwrap();

        assert_eq!(store.sessions_started(), 1);
    }

    #[tokio::test]
    async fn test_scope_completion_releases_registration_and_session() {
        let (store, client, registry) = fixture();
        let (client_ref, registry_ref) = (&client, &registry);

        AmbientScope::run(move || async move {
            enlist(client_ref, registry_ref, RetryPolicy::default()).await?;
            assert_eq!(registry_ref.stats().await.external_entries, 1);
            Ok(())
        })
        .await
        .unwrap();

        assert_eq!(registry.stats().await.external_entries, 0);
        assert_eq!(store.open_sessions().await, 0);
    }
}
