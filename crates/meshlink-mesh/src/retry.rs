//! Bounded retries for relay calls.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::debug;

use meshlink_store::StoreError;

/// How often and how patiently a relay call is retried.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub attempts: u32,
    /// Delay before the second attempt; grows linearly, plus up to 50% jitter.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(200),
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            attempts: 1,
            base_delay: Duration::ZERO,
        }
    }

    fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay * attempt;
        let max_jitter = (self.base_delay.as_millis() as u64) / 2;
        let jitter = if max_jitter == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=max_jitter)
        };
        base + Duration::from_millis(jitter)
    }
}

/// Run `call` until it succeeds, fails with something other than
/// [`StoreError::Unavailable`], or the attempts run out.
///
/// Missing sessions and participants are returned immediately; the
/// orchestrator's periodic tasks already retry those on their next tick.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, op: &'static str, mut call: F) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut attempt = 1;
    loop {
        match call().await {
            Err(StoreError::Unavailable(reason)) if attempt < policy.attempts.max(1) => {
                let delay = policy.delay(attempt);
                debug!(
                    op,
                    attempt,
                    error = %reason,
                    delay_ms = delay.as_millis() as u64,
                    "Relay call failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            result => return result,
        }
    }
}
