//! OpenAI-compatible chat-completions adapter.
//!
//! Speaks the `/chat/completions` wire protocol, which covers the hosted
//! OpenAI API and local inference servers (vLLM, llama.cpp) alike. Token
//! usage comes from the response body when present (`estimated = false`);
//! otherwise it is estimated at 4 chars per token.

use std::time::Instant;

use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::config::{ModelConfig, Provider};
use crate::types::TokenUsage;

use super::{AdapterError, CompletionRequest, CompletionResponse, ModelAdapter};

pub struct OpenAiAdapter {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
}

impl std::fmt::Debug for OpenAiAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiAdapter")
            .field("endpoint", &self.endpoint)
            .field("model", &self.model)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletionBody {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    total_tokens: u64,
}

impl OpenAiAdapter {
    /// Build an adapter from config, resolving the API key eagerly so a
    /// missing credential fails construction, not the first round.
    pub fn from_config(config: &ModelConfig) -> Result<Self, AdapterError> {
        let endpoint = config
            .endpoint
            .clone()
            .ok_or_else(|| Self::construction_error(&config.model, "endpoint missing"))?;
        let api_key = match &config.api_key_env {
            Some(var) => Some(std::env::var(var).map_err(|_| {
                Self::construction_error(
                    &config.model,
                    &format!("credential env var '{var}' is not set"),
                )
            })?),
            None => None,
        };
        Ok(Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key,
        })
    }

    fn construction_error(model: &str, message: &str) -> AdapterError {
        AdapterError::Model {
            provider: Provider::Openai,
            model: model.to_string(),
            retryable: false,
            message: message.to_string(),
        }
    }

    fn transport_error(&self, retryable: bool, message: String) -> AdapterError {
        AdapterError::Model {
            provider: Provider::Openai,
            model: self.model.clone(),
            retryable,
            message,
        }
    }

    async fn execute(
        &self,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, AdapterError> {
        let url = format!("{}/chat/completions", self.endpoint);
        let mut user_content = request.user_prompt.clone();
        if let Some(schema) = &request.schema_hint {
            user_content.push_str("\n\nRespond with JSON matching this schema:\n");
            user_content.push_str(schema);
        }
        let body = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": request.system_prompt},
                {"role": "user", "content": user_content},
            ],
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
        });

        let started = Instant::now();
        let mut http = self.client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            http = http.bearer_auth(key);
        }
        let response = http.send().await.map_err(|e| {
            // Connection-level failures are transient; never echo the URL's
            // userinfo or our key into the message.
            self.transport_error(true, format!("request failed: {e}"))
        })?;

        let status = response.status();
        if status.as_u16() == 429 {
            let retry_after_ms = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(|secs| secs * 1_000);
            return Err(AdapterError::RateLimit {
                provider: Provider::Openai,
                model: self.model.clone(),
                retry_after_ms,
            });
        }
        if !status.is_success() {
            let retryable = status.is_server_error();
            let text = response.text().await.unwrap_or_default();
            return Err(self.transport_error(
                retryable,
                format!("http {status}: {}", truncate(&text, 300)),
            ));
        }

        let raw: serde_json::Value = response
            .json()
            .await
            .map_err(|e| self.transport_error(true, format!("body read failed: {e}")))?;
        let latency_ms = started.elapsed().as_millis() as u64;

        let parsed: ChatCompletionBody =
            serde_json::from_value(raw.clone()).map_err(|e| AdapterError::Parse {
                provider: Provider::Openai,
                model: self.model.clone(),
                message: format!("unexpected completion shape: {e}"),
            })?;
        let content = parsed
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .ok_or_else(|| AdapterError::Parse {
                provider: Provider::Openai,
                model: self.model.clone(),
                message: "completion has no choices/content".to_string(),
            })?;

        let token_usage = match parsed.usage {
            Some(u) => TokenUsage::new(u.prompt_tokens, u.completion_tokens, u.total_tokens, false),
            None => TokenUsage::estimated_from_chars(
                request.system_prompt.len() + user_content.len(),
                content.len(),
            ),
        };

        debug!(
            model = %self.model,
            latency_ms,
            tokens = token_usage.total,
            "chat completion finished"
        );

        Ok(CompletionResponse {
            content,
            token_usage,
            latency_ms,
            raw: Some(raw),
        })
    }
}

#[async_trait::async_trait]
impl ModelAdapter for OpenAiAdapter {
    fn provider(&self) -> Provider {
        Provider::Openai
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn call(&self, request: &CompletionRequest) -> Result<CompletionResponse, AdapterError> {
        // Dropping the inner future on timeout closes the connection.
        match tokio::time::timeout(request.timeout, self.execute(request)).await {
            Ok(result) => result,
            Err(_) => Err(AdapterError::Timeout {
                provider: Provider::Openai,
                model: self.model.clone(),
                budget_ms: request.timeout.as_millis() as u64,
            }),
        }
    }
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        s.to_string()
    } else {
        let mut end = max_len;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &s[..end])
    }
}
