// ============================================================================
// Ambient Scope
// ============================================================================
//
// A unit-of-work abstraction that code can join without parameter passing.
// The scope is carried task-locally for the duration of `AmbientScope::run`;
// resources join it by enlisting a volatile participant, and are driven
// through prepare/commit or rollback when the scope completes. Completion
// hooks fire exactly once afterwards, on every outcome.
//
// ============================================================================

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use log::warn;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::core::Result;
use crate::registry::SessionRegistry;

/// Unique identifier for an ambient scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScopeId(Uuid);

impl ScopeId {
    pub fn new() -> Self {
        ScopeId(Uuid::new_v4())
    }
}

impl Default for ScopeId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ScopeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "scope_{}", self.0)
    }
}

/// Final outcome of a scope, delivered to completion hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeOutcome {
    Committed,
    RolledBack,
}

/// A resource enlisted with an ambient scope.
///
/// `prepare` runs first for every participant; if all acknowledge, `commit`
/// runs for each. Any failure, or a scope whose body returned an error,
/// drives `rollback` instead.
#[async_trait]
pub trait Participant: Send + Sync {
    async fn prepare(&self) -> Result<()>;
    async fn commit(&self) -> Result<()>;
    async fn rollback(&self) -> Result<()>;
}

/// Cleanup callback fired exactly once when the scope completes.
pub type CompletionHook = Box<dyn FnOnce(ScopeOutcome) -> BoxFuture<'static, ()> + Send>;

tokio::task_local! {
    static CURRENT_SCOPE: Arc<AmbientScope>;
}

pub struct AmbientScope {
    id: ScopeId,
    participants: Mutex<Vec<Box<dyn Participant>>>,
    hooks: Mutex<Vec<CompletionHook>>,
    completed: AtomicBool,
}

impl AmbientScope {
    fn new() -> Self {
        Self {
            id: ScopeId::new(),
            participants: Mutex::new(Vec::new()),
            hooks: Mutex::new(Vec::new()),
            completed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> ScopeId {
        self.id
    }

    /// The scope the calling flow is inside, if any.
    pub fn current() -> Option<Arc<AmbientScope>> {
        CURRENT_SCOPE.try_with(Arc::clone).ok()
    }

    /// Runs `body` inside a new ambient scope and completes the scope when
    /// it returns: participants are committed on `Ok` and rolled back on
    /// `Err`. The flow also gets a fresh session slot for the duration, so
    /// sessions bound inside the scope never leak past it.
    pub async fn run<T, F, Fut>(body: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let scope = Arc::new(Self::new());
        let inner = Arc::clone(&scope);

        CURRENT_SCOPE
            .scope(
                scope,
                SessionRegistry::scope(async move {
                    match body().await {
                        Ok(value) => {
                            inner.complete(true).await?;
                            Ok(value)
                        }
                        Err(err) => {
                            inner.complete(false).await.ok();
                            Err(err)
                        }
                    }
                }),
            )
            .await
    }

    /// Enlists a participant. Ignored with a warning if the scope already
    /// completed.
    pub async fn enlist_volatile(&self, participant: Box<dyn Participant>) {
        if self.completed.load(Ordering::SeqCst) {
            warn!("participant enlisted after scope {} completed; ignoring", self.id);
            return;
        }
        self.participants.lock().await.push(participant);
    }

    /// Registers a cleanup hook fired once on completion, whatever the
    /// outcome. Ignored with a warning if the scope already completed.
    pub async fn on_completed(&self, hook: CompletionHook) {
        if self.completed.load(Ordering::SeqCst) {
            warn!("hook registered after scope {} completed; ignoring", self.id);
            return;
        }
        self.hooks.lock().await.push(hook);
    }

    /// Drives the scope to completion exactly once.
    ///
    /// On success: prepare every participant, then commit each. A prepare
    /// failure rolls everyone back; a commit failure rolls back the
    /// participants not yet committed (including the failing one). On
    /// failure: roll everyone back. Hooks always fire afterwards.
    async fn complete(&self, success: bool) -> Result<()> {
        if self.completed.swap(true, Ordering::SeqCst) {
            warn!("scope {} completed more than once; ignoring", self.id);
            return Ok(());
        }

        let participants = std::mem::take(&mut *self.participants.lock().await);
        let mut failure = None;

        if success {
            for participant in &participants {
                if let Err(err) = participant.prepare().await {
                    failure = Some(err);
                    break;
                }
            }

            if failure.is_none() {
                for (index, participant) in participants.iter().enumerate() {
                    if let Err(err) = participant.commit().await {
                        failure = Some(err);
                        for remaining in &participants[index..] {
                            if let Err(rollback_err) = remaining.rollback().await {
                                warn!(
                                    "participant rollback failed in scope {}: {rollback_err}",
                                    self.id
                                );
                            }
                        }
                        break;
                    }
                }
            } else {
                for participant in &participants {
                    if let Err(err) = participant.rollback().await {
                        warn!("participant rollback failed in scope {}: {err}", self.id);
                    }
                }
            }
        } else {
            for participant in &participants {
                if let Err(err) = participant.rollback().await {
                    warn!("participant rollback failed in scope {}: {err}", self.id);
                }
            }
        }

        let outcome = if success && failure.is_none() {
            ScopeOutcome::Committed
        } else {
            ScopeOutcome::RolledBack
        };
        let hooks = std::mem::take(&mut *self.hooks.lock().await);
        for hook in hooks {
            hook(outcome).await;
        }

        match failure {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }
}
