//! Retry policy for provider calls

use crate::error::PipelineError;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Exponential backoff with optional jitter. `max_attempts` counts the first
/// call, so 1 means no retry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
    /// Fraction of the delay added at random, 0.0 to 1.0
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::no_retry()
    }
}

impl RetryPolicy {
    /// SQL generation gets exactly one retry
    pub fn sql_generation(backoff: Duration) -> Self {
        Self {
            max_attempts: 2,
            initial_backoff: backoff,
            max_backoff: backoff.saturating_mul(4),
            multiplier: 2.0,
            jitter: 0.2,
        }
    }

    /// Single attempt; the answer stage has its own fallback
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            multiplier: 1.0,
            jitter: 0.0,
        }
    }

    /// Delay before retry number `attempt` (0-based), without jitter
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay_ms =
            self.initial_backoff.as_millis() as f64 * self.multiplier.powi(attempt as i32);
        let delay_ms = delay_ms.min(self.max_backoff.as_millis() as f64);
        Duration::from_millis(delay_ms as u64)
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter <= 0.0 || delay.is_zero() {
            return delay;
        }
        let extra = rand::thread_rng().gen_range(0.0..=self.jitter.min(1.0));
        delay.mul_f64(1.0 + extra)
    }

    /// Run `operation` until it succeeds, fails with a non-retryable error, or
    /// attempts run out. The last error is returned unchanged.
    pub async fn retry<F, Fut, T>(
        &self,
        mut operation: F,
        is_retryable: impl Fn(&PipelineError) -> bool,
    ) -> Result<T, PipelineError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, PipelineError>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < attempts && is_retryable(&e) => {
                    let delay = self.jittered(self.delay_for_attempt(attempt - 1));
                    warn!(
                        attempt,
                        max_attempts = attempts,
                        delay_ms = delay.as_millis() as u64,
                        "Retrying LLM call: {}",
                        e
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Timeouts and server-side or transport failures; 4xx and empty output are final
pub fn is_retryable(error: &PipelineError) -> bool {
    match error {
        PipelineError::LlmTimeout(_) => true,
        PipelineError::LlmRequestError { status, .. } => match status {
            None => true,
            Some(code) => (500..600).contains(code),
        },
        _ => false,
    }
}
