// ============================================================================
// Retry Policy
// ============================================================================

use std::future::Future;
use std::time::{Duration, Instant};

use log::warn;

use crate::core::Result;

/// Default wall-clock budget for retrying transient conflicts.
pub const DEFAULT_RETRY_TIMEOUT: Duration = Duration::from_secs(120);

/// Bounded re-execution of a transaction body on transient conflicts.
///
/// A `max_retries` of zero means the attempt budget is unbounded and the
/// timeout alone governs. With a positive `max_retries`, retrying stops only
/// once BOTH budgets are spent: a body that burns through its attempts before
/// the timeout keeps retrying until the timeout also elapses. This stopping
/// rule is deliberately biased toward retrying rather than giving up early;
/// see DESIGN.md for the rationale and the tests pinning it down.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_retries: u32,
    timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            timeout: DEFAULT_RETRY_TIMEOUT,
        }
    }
}

impl RetryPolicy {
    /// Retry indefinitely within the default timeout window.
    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn new(max_retries: u32) -> Self {
        Self::default().max_retries(max_retries)
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Invokes `body` until it succeeds, fails with a non-transient error,
    /// or the retry budget is spent. The original store error is returned
    /// unchanged once retrying stops.
    pub async fn run<T, F, Fut>(&self, mut body: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let started = Instant::now();
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;
            match body().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient_conflict() => {
                    if !self.should_retry(attempts, started.elapsed()) {
                        return Err(err);
                    }
                    warn!("retrying transient transaction conflict (attempt {attempts}): {err}");
                    // Yield so a tight retry loop cannot starve the executor
                    // or a racing cancellation signal.
                    tokio::task::yield_now().await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// The stopping rule: retrying continues while either budget remains.
    /// With `max_retries == 0` the attempt budget is treated as spent after
    /// the first failure, leaving the timeout in charge.
    pub(crate) fn should_retry(&self, attempts: u32, elapsed: Duration) -> bool {
        let attempts_spent = self.max_retries == 0 || attempts > self.max_retries;
        !(attempts_spent && elapsed >= self.timeout)
    }
}
