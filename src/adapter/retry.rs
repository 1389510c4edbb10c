//! Retry wrapper — policy-only decorator around an adapter.
//!
//! Executes a call up to `1 + max_attempts` times, retrying only errors
//! whose `retryable` flag is set. Backoff is exponential with a cap,
//! multiplied by a uniform jitter factor in `[0.5, 1.0]` unless
//! deterministic mode is active; rate-limit hints raise the delay floor.
//! The `on_retry` hook lets the session count attempts after the first.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tracing::warn;

use crate::config::{Provider, RetryConfig};

use super::{AdapterError, CompletionRequest, CompletionResponse, ModelAdapter};

/// Observer invoked before each backoff sleep: `(attempt, error, delay_ms)`.
pub type OnRetry = Arc<dyn Fn(u32, &AdapterError, u64) + Send + Sync>;

/// Decorates an adapter with classified retries and exponential backoff.
pub struct RetryingAdapter {
    inner: Arc<dyn ModelAdapter>,
    policy: RetryConfig,
    deterministic: bool,
    on_retry: Option<OnRetry>,
}

impl RetryingAdapter {
    pub fn new(inner: Arc<dyn ModelAdapter>, policy: RetryConfig, deterministic: bool) -> Self {
        Self {
            inner,
            policy,
            deterministic,
            on_retry: None,
        }
    }

    /// Attach the retry observer.
    pub fn with_on_retry(mut self, hook: OnRetry) -> Self {
        self.on_retry = Some(hook);
        self
    }

    /// Backoff for the given zero-based attempt, before jitter.
    fn base_delay_ms(&self, attempt: u32) -> u64 {
        let exp = self
            .policy
            .base_delay_ms
            .saturating_mul(1u64.checked_shl(attempt).unwrap_or(u64::MAX));
        exp.min(self.policy.max_delay_ms)
    }

    fn delay_for(&self, attempt: u32, error: &AdapterError) -> u64 {
        let mut delay = self.base_delay_ms(attempt);
        if !self.deterministic {
            let factor: f64 = rand::thread_rng().gen_range(0.5..=1.0);
            delay = (delay as f64 * factor) as u64;
        }
        if let Some(hint) = error.retry_after_ms() {
            delay = delay.max(hint);
        }
        delay
    }
}

#[async_trait]
impl ModelAdapter for RetryingAdapter {
    fn provider(&self) -> Provider {
        self.inner.provider()
    }

    fn model(&self) -> &str {
        self.inner.model()
    }

    async fn call(&self, request: &CompletionRequest) -> Result<CompletionResponse, AdapterError> {
        let max_attempts = if self.deterministic {
            0
        } else {
            self.policy.max_attempts
        };

        let mut attempt: u32 = 0;
        loop {
            match self.inner.call(request).await {
                Ok(response) => return Ok(response),
                Err(error) => {
                    if !error.is_retryable() || attempt >= max_attempts {
                        return Err(error);
                    }
                    let delay_ms = self.delay_for(attempt, &error);
                    warn!(
                        provider = %self.inner.provider(),
                        model = %self.inner.model(),
                        attempt = attempt + 1,
                        delay_ms,
                        error = %error,
                        "retrying model call"
                    );
                    if let Some(hook) = &self.on_retry {
                        hook(attempt + 1, &error, delay_ms);
                    }
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    attempt += 1;
                }
            }
        }
    }
}
