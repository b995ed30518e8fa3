//! Bounded retries with exponential backoff, and the engine-wide gate every
//! remote call passes through.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::error::RemoteError;

/// Upper bound on a single backoff sleep.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one (>= 1)
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// Delay slept after the failed attempt with index `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(MAX_BACKOFF)
    }
}

/// Run `op` until it succeeds, fails with a non-transient error, or the
/// attempt budget is spent. The last transport error is returned on
/// exhaustion.
///
/// TODO: add jitter to `delay_for` once followers share one egress IP.
pub async fn call_with_retry<T, F, Fut>(policy: RetryPolicy, mut op: F) -> Result<T, RemoteError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RemoteError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() && attempt + 1 < max_attempts => {
                let delay = policy.delay_for(attempt);
                debug!(attempt = attempt + 1, delay_ms = delay.as_millis() as u64, error = %e, "Transient failure, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Shared entry point for remote calls: a counting semaphore bounding
/// in-flight requests across the whole engine, a per-attempt timeout, and
/// the retry policy.
#[derive(Clone)]
pub struct RemoteCaller {
    permits: Arc<Semaphore>,
    policy: RetryPolicy,
    timeout: Duration,
}

impl RemoteCaller {
    pub fn new(max_in_flight: usize, policy: RetryPolicy, timeout: Duration) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_in_flight.max(1))),
            policy,
            timeout,
        }
    }

    /// Permits currently free; used by tests and diagnostics.
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    /// A permit is held only while an attempt is in flight, never across
    /// backoff sleeps.
    pub async fn call<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, RemoteError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        let result = call_with_retry(self.policy, || {
            let fut = op();
            async move {
                let _permit = self
                    .permits
                    .acquire()
                    .await
                    .map_err(|_| RemoteError::transport("remote gate closed"))?;
                match tokio::time::timeout(self.timeout, fut).await {
                    Ok(res) => res,
                    Err(_) => Err(RemoteError::transport(format!(
                        "timed out after {} ms",
                        self.timeout.as_millis()
                    ))),
                }
            }
        })
        .await;
        if let Err(e) = &result {
            warn!(call = what, error = %e, "Remote call failed");
        }
        result
    }
}
