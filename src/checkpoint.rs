//! Checkpointing — one JSON document per session, written after every round.
//!
//! Integrity rests on the canonical JSON encoding: `integrity.sha256` covers
//! the canonical checkpoint minus the `integrity` field, and an optional
//! HMAC-SHA-256 over that hash (keyed from `CONCLAVE_CHECKPOINT_SECRET`)
//! makes tampering detectable even by parties who can re-serialize. Loads
//! verify schema, exact format version, hash, and HMAC before any state is
//! restored; any failure refuses the resume.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::canonical::{canonical_sha256, hmac_sha256_hex};
use crate::config::DebateConfig;
use crate::session::{DebatePhase, DebateSession, SessionMetadata};
use crate::types::{JudgeRoundResult, ResponseStatus, RoundResult};

/// Environment variable holding the HMAC secret.
pub const SECRET_ENV: &str = "CONCLAVE_CHECKPOINT_SECRET";

/// Integrity envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Integrity {
    /// SHA-256 (hex) of the canonical checkpoint minus this field.
    pub sha256: String,
    /// HMAC-SHA-256 (hex) of `sha256` under the configured secret.
    pub hmac: Option<String>,
}

/// On-disk checkpoint document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub version: String,
    pub engine_version: String,
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    pub phase: DebatePhase,
    pub config: DebateConfig,
    /// SHA-256 (hex) of the canonical config.
    pub config_hash: String,
    pub agent_rounds: Vec<RoundResult>,
    pub judge_rounds: Vec<JudgeRoundResult>,
    pub integrity: Integrity,
}

/// Checkpoint failures — all fatal for the operation that hit them.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint io failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("checkpoint serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("checkpoint version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: String, found: String },

    #[error("checkpoint integrity failure: stored sha256 does not match content")]
    HashMismatch,

    #[error("checkpoint integrity failure: hmac does not match")]
    HmacMismatch,
}

fn env_secret() -> Option<Vec<u8>> {
    std::env::var(SECRET_ENV)
        .ok()
        .filter(|s| !s.is_empty())
        .map(String::into_bytes)
}

impl Checkpoint {
    /// Capture the session's durable state, sealing it with the
    /// environment-configured secret (if any).
    pub fn capture(session: &DebateSession) -> Result<Self, CheckpointError> {
        Self::capture_with_secret(session, env_secret().as_deref())
    }

    /// Capture with an explicit secret; `None` leaves `integrity.hmac` null.
    pub fn capture_with_secret(
        session: &DebateSession,
        secret: Option<&[u8]>,
    ) -> Result<Self, CheckpointError> {
        let config_value = serde_json::to_value(&session.config)?;
        let mut checkpoint = Self {
            version: crate::FORMAT_VERSION.to_string(),
            engine_version: crate::ENGINE_VERSION.to_string(),
            session_id: session.id.clone(),
            timestamp: Utc::now(),
            phase: session.phase,
            config: session.config.clone(),
            config_hash: canonical_sha256(&config_value),
            agent_rounds: session.agent_rounds.clone(),
            judge_rounds: session.judge_rounds.clone(),
            integrity: Integrity {
                sha256: String::new(),
                hmac: None,
            },
        };
        let sha256 = checkpoint.content_hash()?;
        checkpoint.integrity.hmac = secret.map(|key| hmac_sha256_hex(key, sha256.as_bytes()));
        checkpoint.integrity.sha256 = sha256;
        Ok(checkpoint)
    }

    /// SHA-256 over the canonical form with the `integrity` field removed.
    fn content_hash(&self) -> Result<String, CheckpointError> {
        let mut value = serde_json::to_value(self)?;
        if let Some(map) = value.as_object_mut() {
            map.remove("integrity");
        }
        Ok(canonical_sha256(&value))
    }

    /// Checkpoint path for a session inside a directory.
    pub fn path_for(dir: &Path, session_id: &str) -> PathBuf {
        dir.join(format!("{session_id}.checkpoint.json"))
    }

    /// Write the checkpoint into `dir`, creating it if needed.
    pub fn save(&self, dir: &Path) -> Result<PathBuf, CheckpointError> {
        std::fs::create_dir_all(dir)?;
        let path = Self::path_for(dir, &self.session_id);
        std::fs::write(&path, serde_json::to_string_pretty(self)?)?;
        info!(path = %path.display(), phase = %self.phase, "checkpoint written");
        Ok(path)
    }

    /// Load and fully verify a checkpoint using the environment secret.
    pub fn load(path: &Path) -> Result<Self, CheckpointError> {
        Self::load_with_secret(path, env_secret().as_deref())
    }

    /// Load and verify with an explicit secret.
    ///
    /// Verification order: schema parse, exact version match, recomputed
    /// sha256, then HMAC when both a secret and a stored tag exist.
    pub fn load_with_secret(
        path: &Path,
        secret: Option<&[u8]>,
    ) -> Result<Self, CheckpointError> {
        let raw = std::fs::read_to_string(path)?;
        let checkpoint: Self = serde_json::from_str(&raw)?;

        if checkpoint.version != crate::FORMAT_VERSION {
            return Err(CheckpointError::VersionMismatch {
                expected: crate::FORMAT_VERSION.to_string(),
                found: checkpoint.version,
            });
        }
        if checkpoint.content_hash()? != checkpoint.integrity.sha256 {
            return Err(CheckpointError::HashMismatch);
        }
        if let (Some(key), Some(stored)) = (secret, &checkpoint.integrity.hmac) {
            let expected = hmac_sha256_hex(key, checkpoint.integrity.sha256.as_bytes());
            if &expected != stored {
                return Err(CheckpointError::HmacMismatch);
            }
        }
        Ok(checkpoint)
    }

    /// Rebuild a session from this checkpoint.
    ///
    /// Token and error counters are recomputed from the restored rounds;
    /// retry counts from the interrupted run are not recoverable.
    pub fn into_session(self) -> DebateSession {
        let mut metadata = SessionMetadata {
            engine_version: self.engine_version,
            started_at: self.timestamp,
            completed_at: None,
            total_tokens: 0,
            total_cost_usd: 0.0,
            pricing_known: true,
            checkpoint_path: None,
            total_retries: 0,
            total_errors: 0,
        };
        for round in &self.agent_rounds {
            for response in &round.responses {
                metadata.total_tokens += response.token_usage.total;
                if response.status == ResponseStatus::Error {
                    metadata.total_errors += 1;
                }
            }
        }
        for round in &self.judge_rounds {
            for evaluation in &round.evaluations {
                metadata.total_tokens += evaluation.token_usage.total;
                if evaluation.status == ResponseStatus::Error {
                    metadata.total_errors += 1;
                }
            }
        }

        DebateSession {
            id: self.session_id,
            topic: self.config.topic.clone(),
            initial_query: self.config.initial_query.clone(),
            phase: self.phase,
            config: self.config,
            agent_rounds: self.agent_rounds,
            judge_rounds: self.judge_rounds,
            final_verdict: None,
            metadata,
        }
    }
}
