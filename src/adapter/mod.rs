//! Model adapters — the only boundary between the engine and LLM providers.
//!
//! An adapter exposes a single `call` operation and maps every transport
//! failure into the classified [`AdapterError`] set; the retry wrapper
//! inspects only the `retryable` flag and the rate-limit hint, never the
//! underlying cause. Adapters are constructed once per
//! `(provider, model, endpoint-or-cli-path)` and cached process-wide.

pub mod cli;
pub mod mock;
pub mod openai;
pub mod retry;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::{ModelConfig, Provider};
use crate::types::TokenUsage;

/// One completion request, provider-agnostic.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub system_prompt: String,
    pub user_prompt: String,
    pub max_tokens: u64,
    pub temperature: f64,
    /// Hard per-call budget; exceeding it cancels the call.
    pub timeout: Duration,
    /// JSON schema the model is asked to follow, passed through verbatim.
    pub schema_hint: Option<String>,
}

/// One completion result.
#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub content: String,
    pub token_usage: TokenUsage,
    pub latency_ms: u64,
    /// Raw provider payload when one exists (HTTP providers).
    pub raw: Option<serde_json::Value>,
}

/// Classified adapter failures.
///
/// `retryable` is the only field retry policy reads; everything else is
/// diagnostic. Messages never carry credentials.
#[derive(Debug, Clone, Error)]
pub enum AdapterError {
    #[error("model error [{provider}/{model}]: {message}")]
    Model {
        provider: Provider,
        model: String,
        retryable: bool,
        message: String,
    },

    #[error("model call timed out [{provider}/{model}] after {budget_ms}ms")]
    Timeout {
        provider: Provider,
        model: String,
        budget_ms: u64,
    },

    #[error("rate limited [{provider}/{model}]")]
    RateLimit {
        provider: Provider,
        model: String,
        retry_after_ms: Option<u64>,
    },

    #[error("unparseable model output [{provider}/{model}]: {message}")]
    Parse {
        provider: Provider,
        model: String,
        message: String,
    },

    #[error("model output failed schema validation [{provider}/{model}]: {message}")]
    Schema {
        provider: Provider,
        model: String,
        message: String,
    },
}

impl AdapterError {
    /// Whether the retry wrapper may re-attempt after this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Model { retryable, .. } => *retryable,
            Self::Timeout { .. } | Self::RateLimit { .. } => true,
            Self::Parse { .. } | Self::Schema { .. } => true,
        }
    }

    /// Minimum delay hint from a rate-limit response.
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            Self::RateLimit { retry_after_ms, .. } => *retry_after_ms,
            _ => None,
        }
    }
}

/// A model endpoint the engine can call.
#[async_trait]
pub trait ModelAdapter: Send + Sync {
    fn provider(&self) -> Provider;

    fn model(&self) -> &str;

    /// Execute one completion within the request's timeout budget.
    ///
    /// Implementations must enforce the timeout themselves, report token
    /// usage (marking estimates), and map every transport failure into
    /// [`AdapterError`]. Prompts are passed through uninterpreted.
    async fn call(&self, request: &CompletionRequest) -> Result<CompletionResponse, AdapterError>;
}

impl std::fmt::Debug for dyn ModelAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("dyn ModelAdapter")
            .field("provider", &self.provider())
            .field("model", &self.model())
            .finish()
    }
}

/// Cache key: one adapter per provider + model + endpoint/binary.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct AdapterKey {
    provider: Provider,
    model: String,
    target: String,
}

impl AdapterKey {
    fn for_config(config: &ModelConfig) -> Self {
        let target = match config.provider {
            Provider::Openai => config.endpoint.clone().unwrap_or_default(),
            Provider::Cli => config.cli_path.clone().unwrap_or_default(),
            Provider::Mock => String::new(),
        };
        Self {
            provider: config.provider,
            model: config.model.clone(),
            target,
        }
    }
}

/// Process-wide adapter cache.
///
/// Construction runs under the lock so concurrent first calls for the same
/// key build exactly one adapter; later lookups are cheap clone-of-Arc.
pub struct AdapterRegistry {
    adapters: Mutex<HashMap<AdapterKey, Arc<dyn ModelAdapter>>>,
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRegistry").finish_non_exhaustive()
    }
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self {
            adapters: Mutex::new(HashMap::new()),
        }
    }

    /// The shared process-wide registry.
    pub fn global() -> Arc<AdapterRegistry> {
        static GLOBAL: OnceLock<Arc<AdapterRegistry>> = OnceLock::new();
        GLOBAL.get_or_init(|| Arc::new(AdapterRegistry::new())).clone()
    }

    /// Fetch or construct the adapter for a model configuration.
    ///
    /// Construction failures (missing credential, missing binary) are
    /// non-retryable and are not cached.
    pub fn adapter_for(&self, config: &ModelConfig) -> Result<Arc<dyn ModelAdapter>, AdapterError> {
        let key = AdapterKey::for_config(config);
        let mut adapters = self.adapters.lock().expect("adapter registry poisoned");
        if let Some(adapter) = adapters.get(&key) {
            return Ok(adapter.clone());
        }
        let adapter: Arc<dyn ModelAdapter> = match config.provider {
            Provider::Openai => Arc::new(openai::OpenAiAdapter::from_config(config)?),
            Provider::Cli => Arc::new(cli::CliAdapter::from_config(config)?),
            Provider::Mock => Arc::new(mock::MockAdapter::new(&config.model)),
        };
        adapters.insert(key, adapter.clone());
        Ok(adapter)
    }

    /// Pre-register an adapter (tests script mocks this way).
    pub fn register(&self, config: &ModelConfig, adapter: Arc<dyn ModelAdapter>) {
        let key = AdapterKey::for_config(config);
        self.adapters
            .lock()
            .expect("adapter registry poisoned")
            .insert(key, adapter);
    }

    /// Number of cached adapters.
    pub fn len(&self) -> usize {
        self.adapters.lock().expect("adapter registry poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::new()
    }
}
