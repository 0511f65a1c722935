//! Retrying an asynchronous action with exponentially scaled delays.
use std::future::Future;
use std::time::Duration;

use crate::Result;

/// Policy for [`retry_with_backoff`].
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Total number of attempts, including the first one.
    pub attempts: u32,
    /// Delay before the first retry.
    pub min: Duration,
    /// Upper bound on the delay between retries.
    pub max: Duration,
    /// Factor applied to the delay after each retry.
    pub scalar: f64,
}

impl BackoffPolicy {
    /// Default value for [`BackoffPolicy::attempts`].
    pub const DEFAULT_ATTEMPTS: u32 = 5;
    /// Default value for [`BackoffPolicy::min`].
    pub const DEFAULT_MIN: Duration = Duration::from_millis(200);
    /// Default value for [`BackoffPolicy::max`].
    pub const DEFAULT_MAX: Duration = Duration::from_secs(10);
    /// Default value for [`BackoffPolicy::scalar`].
    pub const DEFAULT_SCALAR: f64 = 1.5;
}

impl Default for BackoffPolicy {
    fn default() -> BackoffPolicy {
        BackoffPolicy {
            attempts: BackoffPolicy::DEFAULT_ATTEMPTS,
            min: BackoffPolicy::DEFAULT_MIN,
            max: BackoffPolicy::DEFAULT_MAX,
            scalar: BackoffPolicy::DEFAULT_SCALAR,
        }
    }
}

/// Invoke `action`, retrying failures with exponentially scaled delays.
///
/// The delay starts at `policy.min`, is multiplied by `policy.scalar` after each retry, and is
/// capped at `policy.max`. The final failure is returned to the caller rather than swallowed, and
/// a non-retriable error (see [`Error::is_retriable`]) aborts the retry loop immediately.
pub async fn retry_with_backoff<T, F, Fut>(policy: &BackoffPolicy, mut action: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = policy.attempts.max(1);
    let mut delay = policy.min;
    let mut attempt = 0;
    loop {
        match action().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempt += 1;
                if attempt >= attempts || !err.is_retriable() {
                    return Err(err);
                }
                log::debug!(
                    target: "flagwire",
                    "attempt {attempt}/{attempts} failed, retrying in {delay:?}: {err}",
                );
                tokio::time::sleep(delay).await;
                delay = scale_delay(delay, policy);
            }
        }
    }
}

fn scale_delay(delay: Duration, policy: &BackoffPolicy) -> Duration {
    let scaled = delay.as_secs_f64() * policy.scalar;
    Duration::from_secs_f64(scaled.min(policy.max.as_secs_f64()))
}
