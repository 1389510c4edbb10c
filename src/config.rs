//! Debate configuration — typed options, defaults, and validation.
//!
//! Loaded from JSON (camelCase keys), every field has a default so partial
//! configs work. `validate()` enforces the documented ranges before any
//! adapter is constructed; validation failures are fatal.
//!
//! ## Precedence of determinism
//!
//! `deterministicMode` coordinates four otherwise-independent switches:
//! temperature → 0, retries → off, backoff jitter → off, JSON repair → off.
//! They are never toggled individually.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Agent temperature default.
const DEFAULT_AGENT_TEMPERATURE: f64 = 0.7;
/// Judge temperature default (lower = more deterministic scoring).
const DEFAULT_JUDGE_TEMPERATURE: f64 = 0.3;
/// Agent yes-fraction needed for supermajority.
const DEFAULT_CONSENSUS_THRESHOLD: f64 = 0.67;
/// Judge plurality fraction needed.
const DEFAULT_JUDGE_CONSENSUS_THRESHOLD: f64 = 0.6;
/// Mean-confidence floor for judge consensus.
const DEFAULT_JUDGE_MIN_CONFIDENCE: f64 = 0.7;

/// Model provider variants the adapter registry can construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    /// OpenAI-compatible chat-completions HTTP endpoint (cloud or local).
    Openai,
    /// Local CLI binary spoken to over stdin/stdout.
    Cli,
    /// Scripted in-process adapter for tests and offline runs.
    Mock,
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Openai => write!(f, "openai"),
            Self::Cli => write!(f, "cli"),
            Self::Mock => write!(f, "mock"),
        }
    }
}

/// One model endpoint a participant runs on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelConfig {
    pub provider: Provider,
    /// Model identifier passed through to the provider.
    pub model: String,
    /// Base URL for HTTP providers (e.g. `http://localhost:8081/v1`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// Environment variable holding the API key for HTTP providers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    /// Binary path for the CLI provider.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cli_path: Option<String>,
}

/// One debate participant (agent or judge).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantConfig {
    pub id: String,
    pub model: ModelConfig,
    /// Optional system-prompt override prepended to the role preamble.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    /// Sampling temperature in 0..=2; forced to 0 in deterministic mode.
    #[serde(default)]
    pub temperature: Option<f64>,
}

/// Which rounds feed the judge panel's positions set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JudgePositionsScope {
    /// Positions from every agent round (first-seen text per ID).
    #[default]
    AllRounds,
    /// Positions from the final agent round only.
    LastRound,
}

/// What history each participant sees in rounds ≥ 2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ContextTopology {
    /// Every prior round in full.
    FullHistory,
    /// Only the previous round.
    LastRound,
    /// Previous round plus every prior response by the same participant.
    #[default]
    LastRoundWithSelf,
    /// Summarized history. Not implemented; rejected at validation.
    Summary,
}

/// Timeout budgets in milliseconds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeoutConfig {
    /// Per adapter call.
    pub model_ms: u64,
    /// Per round (all participants).
    pub round_ms: u64,
    /// Whole session.
    pub session_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            model_ms: 60_000,
            round_ms: 300_000,
            session_ms: 1_800_000,
        }
    }
}

/// Retry policy applied around every adapter call.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    /// Retries after the first attempt (0 = single attempt).
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            base_delay_ms: 250,
            max_delay_ms: 8_000,
        }
    }
}

/// Fan-out bound for a single round.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConcurrencyConfig {
    pub max_concurrent_requests: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_concurrent_requests: 4,
        }
    }
}

/// Hard resource ceilings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LimitConfig {
    /// Max output tokens requested per adapter call.
    pub max_tokens_per_response: u64,
    /// Max cumulative tokens across the session.
    pub max_total_tokens: u64,
    /// Max cumulative USD cost across the session.
    pub max_total_cost_usd: f64,
    /// Token budget for rendered history (4 chars per token).
    pub max_context_tokens: u64,
}

impl Default for LimitConfig {
    fn default() -> Self {
        Self {
            max_tokens_per_response: 1_024,
            max_total_tokens: 500_000,
            max_total_cost_usd: 10.0,
            max_context_tokens: 8_000,
        }
    }
}

/// Complete debate configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DebateConfig {
    pub topic: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_query: Option<String>,
    pub agents: Vec<ParticipantConfig>,
    #[serde(default)]
    pub judges: Vec<ParticipantConfig>,
    #[serde(default = "default_true")]
    pub judge_panel_enabled: bool,
    #[serde(default = "default_max_agent_rounds")]
    pub max_agent_rounds: u32,
    #[serde(default = "default_max_judge_rounds")]
    pub max_judge_rounds: u32,
    #[serde(default = "default_consensus_threshold")]
    pub consensus_threshold: f64,
    #[serde(default = "default_judge_consensus_threshold")]
    pub judge_consensus_threshold: f64,
    #[serde(default = "default_judge_min_confidence")]
    pub judge_min_confidence: f64,
    #[serde(default)]
    pub judge_positions_scope: JudgePositionsScope,
    #[serde(default)]
    pub context_topology: ContextTopology,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_dir: Option<PathBuf>,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub retries: RetryConfig,
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,
    #[serde(default)]
    pub limits: LimitConfig,
    #[serde(default)]
    pub deterministic_mode: bool,
    #[serde(default)]
    pub allow_external_paths: bool,
}

fn default_true() -> bool {
    true
}
fn default_max_agent_rounds() -> u32 {
    5
}
fn default_max_judge_rounds() -> u32 {
    3
}
fn default_consensus_threshold() -> f64 {
    DEFAULT_CONSENSUS_THRESHOLD
}
fn default_judge_consensus_threshold() -> f64 {
    DEFAULT_JUDGE_CONSENSUS_THRESHOLD
}
fn default_judge_min_confidence() -> f64 {
    DEFAULT_JUDGE_MIN_CONFIDENCE
}

impl DebateConfig {
    /// Parse a config from JSON and validate it.
    pub fn from_json(json: &str) -> Result<Self, String> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| format!("config parse failed: {e}"))?;
        config.validate()?;
        Ok(config)
    }

    /// Effective temperature for a participant, honoring deterministic mode.
    pub fn effective_temperature(&self, participant: &ParticipantConfig, is_judge: bool) -> f64 {
        if self.deterministic_mode {
            return 0.0;
        }
        participant.temperature.unwrap_or(if is_judge {
            DEFAULT_JUDGE_TEMPERATURE
        } else {
            DEFAULT_AGENT_TEMPERATURE
        })
    }

    /// Effective retry policy, honoring deterministic mode (retries off).
    pub fn effective_retries(&self) -> RetryConfig {
        if self.deterministic_mode {
            RetryConfig {
                max_attempts: 0,
                ..self.retries
            }
        } else {
            self.retries
        }
    }

    /// Validate every documented range; returns the first violation.
    pub fn validate(&self) -> Result<(), String> {
        if self.topic.trim().is_empty() {
            return Err("topic must not be empty".to_string());
        }
        if !(2..=10).contains(&self.agents.len()) {
            return Err(format!(
                "agents must number 2..=10, got {}",
                self.agents.len()
            ));
        }
        if self.judges.len() > 15 {
            return Err(format!("judges must number 0..=15, got {}", self.judges.len()));
        }
        if self.judge_panel_enabled && self.judges.len() < 3 {
            return Err(format!(
                "judge panel requires at least 3 judges, got {}",
                self.judges.len()
            ));
        }
        if !(1..=10).contains(&self.max_agent_rounds) {
            return Err(format!(
                "maxAgentRounds must be 1..=10, got {}",
                self.max_agent_rounds
            ));
        }
        if !(1..=5).contains(&self.max_judge_rounds) {
            return Err(format!(
                "maxJudgeRounds must be 1..=5, got {}",
                self.max_judge_rounds
            ));
        }
        if !(0.5..=1.0).contains(&self.consensus_threshold) {
            return Err(format!(
                "consensusThreshold must be in [0.5, 1.0], got {}",
                self.consensus_threshold
            ));
        }
        if !(0.5..=1.0).contains(&self.judge_consensus_threshold) {
            return Err(format!(
                "judgeConsensusThreshold must be in [0.5, 1.0], got {}",
                self.judge_consensus_threshold
            ));
        }
        if !(0.0..=1.0).contains(&self.judge_min_confidence) {
            return Err(format!(
                "judgeMinConfidence must be in [0.0, 1.0], got {}",
                self.judge_min_confidence
            ));
        }
        if self.context_topology == ContextTopology::Summary {
            return Err(
                "contextTopology 'summary' is not supported; use full_history, \
                 last_round, or last_round_with_self"
                    .to_string(),
            );
        }
        if self.concurrency.max_concurrent_requests == 0 {
            return Err("maxConcurrentRequests must be > 0".to_string());
        }
        if self.timeouts.model_ms == 0 || self.timeouts.round_ms == 0 || self.timeouts.session_ms == 0
        {
            return Err("timeouts must be > 0".to_string());
        }
        if self.limits.max_tokens_per_response == 0 || self.limits.max_context_tokens == 0 {
            return Err("token limits must be > 0".to_string());
        }
        if self.limits.max_total_cost_usd < 0.0 || !self.limits.max_total_cost_usd.is_finite() {
            return Err("maxTotalCostUsd must be a finite non-negative number".to_string());
        }

        let mut seen = std::collections::HashSet::new();
        for participant in self.agents.iter().chain(self.judges.iter()) {
            if participant.id.trim().is_empty() {
                return Err("participant id must not be empty".to_string());
            }
            if !seen.insert(participant.id.as_str()) {
                return Err(format!("duplicate participant id '{}'", participant.id));
            }
            if let Some(temp) = participant.temperature {
                if !(0.0..=2.0).contains(&temp) {
                    return Err(format!(
                        "temperature for '{}' must be in [0, 2], got {}",
                        participant.id, temp
                    ));
                }
            }
            self.validate_model(participant)?;
        }

        if let Some(dir) = &self.checkpoint_dir {
            self.validate_path(dir, "checkpointDir")?;
        }
        Ok(())
    }

    fn validate_model(&self, participant: &ParticipantConfig) -> Result<(), String> {
        let model = &participant.model;
        if model.model.trim().is_empty() {
            return Err(format!("model name for '{}' must not be empty", participant.id));
        }
        match model.provider {
            Provider::Openai => {
                if model.endpoint.as_deref().map_or(true, |e| e.trim().is_empty()) {
                    return Err(format!(
                        "openai provider for '{}' requires an endpoint",
                        participant.id
                    ));
                }
            }
            Provider::Cli => {
                let path = model.cli_path.as_deref().ok_or_else(|| {
                    format!("cli provider for '{}' requires cliPath", participant.id)
                })?;
                self.validate_path(Path::new(path), "cliPath")?;
            }
            Provider::Mock => {}
        }
        Ok(())
    }

    /// Reject paths that escape the working directory unless explicitly allowed.
    fn validate_path(&self, path: &Path, label: &str) -> Result<(), String> {
        if self.allow_external_paths {
            return Ok(());
        }
        let escapes = path.is_absolute()
            || path
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir));
        if escapes {
            return Err(format!(
                "{label} '{}' is outside the working directory; set allowExternalPaths to permit it",
                path.display()
            ));
        }
        Ok(())
    }
}
