use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, timeout};

use crate::venues::VenueError;

/// Bounded exponential backoff for venue calls.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound on a single venue call.
    pub call_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
            call_timeout: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based), capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay = self.base_delay * 2u32.saturating_pow(attempt.saturating_sub(1));
        delay.min(self.max_delay)
    }
}

/// Run one venue call under the policy's timeout.
pub async fn with_timeout<T, F>(limit: Duration, label: &str, fut: F) -> Result<T, VenueError>
where
    F: Future<Output = Result<T, VenueError>>,
{
    match timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(VenueError::Timeout(format!("{label} exceeded {}ms", limit.as_millis()))),
    }
}

/// Retry `op` while it fails transiently, up to `max_attempts` calls in total.
///
/// Returns the final result together with the number of calls made.
/// Non-transient errors are returned immediately.
pub async fn retry_transient<T, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    mut op: F,
) -> (Result<T, VenueError>, u32)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, VenueError>>,
{
    let max = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match with_timeout(policy.call_timeout, label, op()).await {
            Ok(v) => return (Ok(v), attempt),
            Err(e) if e.is_transient() && attempt < max => {
                let delay = policy.delay_for(attempt);
                tracing::warn!(
                    error = %e,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "{label}: transient failure, retrying"
                );
                sleep(delay).await;
            }
            Err(e) => return (Err(e), attempt),
        }
    }
}
