//! CLI adapter — drives a local model binary over stdin/stdout.
//!
//! The child is spawned directly (never through a shell) with the binary
//! path validated at construction. The request is written to stdin as one
//! JSON document (capped at 2 MiB) and the reply is read from stdout with
//! a streaming 10 MiB cap; a child that overflows the cap is killed
//! immediately rather than buffered.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Instant;

use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::debug;

use crate::config::{ModelConfig, Provider};
use crate::types::TokenUsage;

use super::{AdapterError, CompletionRequest, CompletionResponse, ModelAdapter};

/// Streaming stdout cap.
const MAX_STDOUT_BYTES: usize = 10 * 1024 * 1024;
/// Stdin cap for the serialized request.
const MAX_STDIN_BYTES: usize = 2 * 1024 * 1024;

#[derive(Debug)]
pub struct CliAdapter {
    path: PathBuf,
    model: String,
}

impl CliAdapter {
    /// Build an adapter, verifying the binary exists up front.
    pub fn from_config(config: &ModelConfig) -> Result<Self, AdapterError> {
        let path = PathBuf::from(config.cli_path.as_deref().ok_or_else(|| {
            Self::construction_error(&config.model, "cliPath missing")
        })?);
        if !path.is_file() {
            return Err(Self::construction_error(
                &config.model,
                &format!("binary '{}' not found", path.display()),
            ));
        }
        Ok(Self {
            path,
            model: config.model.clone(),
        })
    }

    fn construction_error(model: &str, message: &str) -> AdapterError {
        AdapterError::Model {
            provider: Provider::Cli,
            model: model.to_string(),
            retryable: false,
            message: message.to_string(),
        }
    }

    fn transient(&self, message: String) -> AdapterError {
        AdapterError::Model {
            provider: Provider::Cli,
            model: self.model.clone(),
            retryable: true,
            message,
        }
    }

    async fn execute(
        &self,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, AdapterError> {
        let stdin_payload = serde_json::to_vec(&json!({
            "model": self.model,
            "system": request.system_prompt,
            "user": request.user_prompt,
            "maxTokens": request.max_tokens,
            "temperature": request.temperature,
            "schema": request.schema_hint,
        }))
        .map_err(|e| self.transient(format!("request serialization failed: {e}")))?;
        if stdin_payload.len() > MAX_STDIN_BYTES {
            return Err(AdapterError::Model {
                provider: Provider::Cli,
                model: self.model.clone(),
                retryable: false,
                message: format!(
                    "request of {} bytes exceeds the {} byte stdin cap",
                    stdin_payload.len(),
                    MAX_STDIN_BYTES
                ),
            });
        }

        let started = Instant::now();
        let mut child = Command::new(&self.path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| self.transient(format!("spawn failed: {e}")))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| self.transient("child stdin unavailable".to_string()))?;
        stdin
            .write_all(&stdin_payload)
            .await
            .map_err(|e| self.transient(format!("stdin write failed: {e}")))?;
        drop(stdin);

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| self.transient("child stdout unavailable".to_string()))?;
        let mut output = Vec::new();
        let mut chunk = [0u8; 8192];
        loop {
            let read = stdout
                .read(&mut chunk)
                .await
                .map_err(|e| self.transient(format!("stdout read failed: {e}")))?;
            if read == 0 {
                break;
            }
            if output.len() + read > MAX_STDOUT_BYTES {
                let _ = child.start_kill();
                return Err(self.transient(format!(
                    "child exceeded the {} byte stdout cap",
                    MAX_STDOUT_BYTES
                )));
            }
            output.extend_from_slice(&chunk[..read]);
        }

        let status = child
            .wait()
            .await
            .map_err(|e| self.transient(format!("wait failed: {e}")))?;
        if !status.success() {
            return Err(self.transient(format!("child exited with {status}")));
        }

        let content = String::from_utf8(output)
            .map_err(|_| self.transient("child produced non-UTF-8 output".to_string()))?;
        let latency_ms = started.elapsed().as_millis() as u64;
        debug!(model = %self.model, latency_ms, bytes = content.len(), "cli completion finished");

        Ok(CompletionResponse {
            token_usage: TokenUsage::estimated_from_chars(
                request.system_prompt.len() + request.user_prompt.len(),
                content.len(),
            ),
            content,
            latency_ms,
            raw: None,
        })
    }
}

#[async_trait::async_trait]
impl ModelAdapter for CliAdapter {
    fn provider(&self) -> Provider {
        Provider::Cli
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn call(&self, request: &CompletionRequest) -> Result<CompletionResponse, AdapterError> {
        // kill_on_drop reaps the child when the timeout drops the future.
        match tokio::time::timeout(request.timeout, self.execute(request)).await {
            Ok(result) => result,
            Err(_) => Err(AdapterError::Timeout {
                provider: Provider::Cli,
                model: self.model.clone(),
                budget_ms: request.timeout.as_millis() as u64,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config(path: &str) -> ModelConfig {
        ModelConfig {
            provider: Provider::Cli,
            model: "local-model".to_string(),
            endpoint: None,
            api_key_env: None,
            cli_path: Some(path.to_string()),
        }
    }

    #[test]
    fn test_missing_binary_rejected_at_construction() {
        let err = CliAdapter::from_config(&config("/no/such/binary")).unwrap_err();
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn test_missing_path_rejected() {
        let mut cfg = config("/bin/cat");
        cfg.cli_path = None;
        assert!(CliAdapter::from_config(&cfg).is_err());
    }

    #[tokio::test]
    async fn test_cat_echoes_request_json() {
        // `cat` echoes stdin, so the reply is our own request document.
        if !std::path::Path::new("/bin/cat").is_file() {
            return;
        }
        let adapter = CliAdapter::from_config(&config("/bin/cat")).unwrap();
        let request = CompletionRequest {
            system_prompt: "sys".to_string(),
            user_prompt: "user".to_string(),
            max_tokens: 16,
            temperature: 0.0,
            timeout: Duration::from_secs(5),
            schema_hint: None,
        };
        let response = adapter.call(&request).await.unwrap();
        let echoed: serde_json::Value = serde_json::from_str(&response.content).unwrap();
        assert_eq!(echoed["system"], "sys");
        assert_eq!(echoed["user"], "user");
        assert!(response.token_usage.estimated);
        assert!(response.token_usage.total >= response.token_usage.prompt);
    }

    #[tokio::test]
    async fn test_oversized_stdin_rejected() {
        if !std::path::Path::new("/bin/cat").is_file() {
            return;
        }
        let adapter = CliAdapter::from_config(&config("/bin/cat")).unwrap();
        let request = CompletionRequest {
            system_prompt: "x".repeat(MAX_STDIN_BYTES + 1),
            user_prompt: String::new(),
            max_tokens: 16,
            temperature: 0.0,
            timeout: Duration::from_secs(5),
            schema_hint: None,
        };
        let err = adapter.call(&request).await.unwrap_err();
        assert!(err.to_string().contains("stdin cap"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_hung_child_times_out() {
        use std::os::unix::fs::PermissionsExt;

        // A script that never writes: the call must end at the budget.
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("hang.sh");
        std::fs::write(&script, "#!/bin/sh\nsleep 30\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let adapter = CliAdapter::from_config(&config(script.to_str().unwrap())).unwrap();
        let request = CompletionRequest {
            system_prompt: String::new(),
            user_prompt: String::new(),
            max_tokens: 16,
            temperature: 0.0,
            timeout: Duration::from_millis(50),
            schema_hint: None,
        };
        let err = adapter.call(&request).await.unwrap_err();
        assert!(matches!(err, AdapterError::Timeout { .. }));
    }
}
