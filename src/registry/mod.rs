// ============================================================================
// Session Registry
// ============================================================================
//
// Two discovery mechanisms for "which session does this call belong to":
//
// - a task-local slot carried by the logical flow itself, surviving await
//   points and worker migration, and deliberately NOT crossing `tokio::spawn`
//   (independent concurrent sub-flows start with an empty slot);
// - a shared map keyed by ambient-scope identifier, for flows that re-enter
//   the library from a continuation that did not inherit the slot.
//
// ============================================================================

use std::cell::RefCell;
use std::collections::HashMap;
use std::future::Future;

use log::{debug, warn};
use tokio::sync::Mutex;

use crate::scope::ScopeId;
use crate::store::Session;

tokio::task_local! {
    static CURRENT_SESSION: RefCell<Option<Session>>;
}

/// Registry snapshot for diagnostics.
#[derive(Debug, Clone)]
pub struct RegistryStats {
    pub external_entries: usize,
}

/// Session discovery service.
///
/// The slot operations (`scope`, `current`, `set`) act on the calling flow's
/// task-local state and are associated functions. The external-id map is
/// per-instance state: construct one registry at startup and inject it
/// wherever sessions must be recovered by scope identifier.
pub struct SessionRegistry {
    by_scope: Mutex<HashMap<ScopeId, Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            by_scope: Mutex::new(HashMap::new()),
        }
    }

    /// Establishes a fresh, empty session slot for the flow running `fut`.
    ///
    /// Nested scopes shadow the outer slot and restore it on exit. Tasks
    /// spawned from within the scope do not inherit the slot.
    pub async fn scope<F>(fut: F) -> F::Output
    where
        F: Future,
    {
        CURRENT_SESSION.scope(RefCell::new(None), fut).await
    }

    /// The session bound to the calling flow, if any.
    pub fn current() -> Option<Session> {
        CURRENT_SESSION
            .try_with(|slot| slot.borrow().clone())
            .ok()
            .flatten()
    }

    /// Rebinds the calling flow's slot. `None` clears it. Outside any flow
    /// scope there is no slot, and the call has no effect.
    pub fn set(session: Option<Session>) {
        let _ = CURRENT_SESSION.try_with(|slot| {
            *slot.borrow_mut() = session;
        });
    }

    /// Associates `session` with an ambient-scope identifier so sibling
    /// flows inside the same scope can adopt it.
    pub async fn register_external(&self, id: ScopeId, session: Session) {
        let mut map = self.by_scope.lock().await;
        if let Some(previous) = map.insert(id, session) {
            warn!(
                "scope {id} was already registered with {}; replacing it",
                previous.id()
            );
        }
    }

    pub async fn lookup_external(&self, id: ScopeId) -> Option<Session> {
        self.by_scope.lock().await.get(&id).cloned()
    }

    /// Removes the entry for a completed scope. Entries must never outlive
    /// their scope: a later scope reusing the identifier would otherwise
    /// observe a stale session.
    pub async fn remove_external(&self, id: ScopeId) {
        if self.by_scope.lock().await.remove(&id).is_some() {
            debug!("released session registration for scope {id}");
        }
    }

    pub async fn stats(&self) -> RegistryStats {
        RegistryStats {
            external_entries: self.by_scope.lock().await.len(),
        }
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
