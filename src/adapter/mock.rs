//! Scripted adapter for tests and offline runs.
//!
//! Replies are consumed in FIFO order, one per call. When the queue runs
//! dry the adapter serves its fallback reply if one is set, otherwise a
//! non-retryable error — a dry mock mid-scenario is a test bug worth
//! surfacing loudly.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::Provider;
use crate::types::TokenUsage;

use super::{AdapterError, CompletionRequest, CompletionResponse, ModelAdapter};

/// One scripted reply.
#[derive(Debug, Clone)]
enum MockReply {
    Ok {
        content: String,
        usage: TokenUsage,
        latency_ms: u64,
    },
    Timeout,
    RateLimit {
        retry_after_ms: Option<u64>,
    },
    Transient(String),
    Fatal(String),
}

/// In-process adapter that serves a scripted reply queue.
pub struct MockAdapter {
    model: String,
    replies: Mutex<VecDeque<MockReply>>,
    fallback: Mutex<Option<MockReply>>,
    /// Artificial latency before answering, so timeout budgets can trip.
    delay: Mutex<Option<Duration>>,
    calls: AtomicU64,
}

impl MockAdapter {
    pub fn new(model: &str) -> Self {
        Self {
            model: model.to_string(),
            replies: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(None),
            delay: Mutex::new(None),
            calls: AtomicU64::new(0),
        }
    }

    /// Queue a successful reply.
    pub fn push_ok(&self, content: &str, usage: TokenUsage) {
        self.push(MockReply::Ok {
            content: content.to_string(),
            usage,
            latency_ms: 1,
        });
    }

    /// Queue a timeout error (retryable).
    pub fn push_timeout(&self) {
        self.push(MockReply::Timeout);
    }

    /// Queue a rate-limit error with an optional retry hint.
    pub fn push_rate_limit(&self, retry_after_ms: Option<u64>) {
        self.push(MockReply::RateLimit { retry_after_ms });
    }

    /// Queue a retryable transport error.
    pub fn push_transient(&self, message: &str) {
        self.push(MockReply::Transient(message.to_string()));
    }

    /// Queue a non-retryable error.
    pub fn push_fatal(&self, message: &str) {
        self.push(MockReply::Fatal(message.to_string()));
    }

    /// Serve a timeout for every call once the queue is empty.
    pub fn set_fallback_timeout(&self) {
        *self.fallback.lock().expect("mock fallback poisoned") = Some(MockReply::Timeout);
    }

    /// Serve a fixed success for every call once the queue is empty.
    pub fn set_fallback_ok(&self, content: &str, usage: TokenUsage) {
        *self.fallback.lock().expect("mock fallback poisoned") = Some(MockReply::Ok {
            content: content.to_string(),
            usage,
            latency_ms: 1,
        });
    }

    /// Sleep this long before answering each call.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().expect("mock delay poisoned") = Some(delay);
    }

    /// Number of calls served so far.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    fn push(&self, reply: MockReply) {
        self.replies
            .lock()
            .expect("mock replies poisoned")
            .push_back(reply);
    }

    fn next_reply(&self) -> Option<MockReply> {
        let queued = self
            .replies
            .lock()
            .expect("mock replies poisoned")
            .pop_front();
        queued.or_else(|| self.fallback.lock().expect("mock fallback poisoned").clone())
    }
}

#[async_trait]
impl ModelAdapter for MockAdapter {
    fn provider(&self) -> Provider {
        Provider::Mock
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn call(&self, request: &CompletionRequest) -> Result<CompletionResponse, AdapterError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let delay = *self.delay.lock().expect("mock delay poisoned");
        if let Some(delay) = delay {
            if delay >= request.timeout {
                // Honor the budget the way a real adapter would: wait it
                // out, then report the timeout.
                tokio::time::sleep(request.timeout).await;
                return Err(AdapterError::Timeout {
                    provider: Provider::Mock,
                    model: self.model.clone(),
                    budget_ms: request.timeout.as_millis() as u64,
                });
            }
            tokio::time::sleep(delay).await;
        }

        match self.next_reply() {
            Some(MockReply::Ok {
                content,
                usage,
                latency_ms,
            }) => Ok(CompletionResponse {
                content,
                token_usage: usage,
                latency_ms,
                raw: None,
            }),
            Some(MockReply::Timeout) => Err(AdapterError::Timeout {
                provider: Provider::Mock,
                model: self.model.clone(),
                budget_ms: request.timeout.as_millis() as u64,
            }),
            Some(MockReply::RateLimit { retry_after_ms }) => Err(AdapterError::RateLimit {
                provider: Provider::Mock,
                model: self.model.clone(),
                retry_after_ms,
            }),
            Some(MockReply::Transient(message)) => Err(AdapterError::Model {
                provider: Provider::Mock,
                model: self.model.clone(),
                retryable: true,
                message,
            }),
            Some(MockReply::Fatal(message)) => Err(AdapterError::Model {
                provider: Provider::Mock,
                model: self.model.clone(),
                retryable: false,
                message,
            }),
            None => Err(AdapterError::Model {
                provider: Provider::Mock,
                model: self.model.clone(),
                retryable: false,
                message: "mock reply queue exhausted".to_string(),
            }),
        }
    }
}
