//! Core data model — responses, tallies, rounds, verdicts.
//!
//! Everything here serializes with camelCase field names to match the
//! output document and checkpoint wire format. Rounds are immutable once
//! constructed; the session appends them and never mutates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A participant's vote on the round's candidate position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Vote {
    /// Endorse the candidate position.
    Yes,
    /// Reject the candidate and propose a fresh position.
    No,
    /// No contribution to consensus this round.
    Abstain,
}

impl std::fmt::Display for Vote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Yes => write!(f, "yes"),
            Self::No => write!(f, "no"),
            Self::Abstain => write!(f, "abstain"),
        }
    }
}

/// Whether a participant produced a usable response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Ok,
    Error,
}

impl std::fmt::Display for ResponseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Token accounting for one adapter call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub prompt: u64,
    pub completion: u64,
    /// Invariant: `total >= prompt + completion`.
    pub total: u64,
    /// True when the counts were estimated rather than reported by the model.
    pub estimated: bool,
}

impl TokenUsage {
    /// Build a usage record, clamping `total` up to `prompt + completion`.
    pub fn new(prompt: u64, completion: u64, total: u64, estimated: bool) -> Self {
        Self {
            prompt,
            completion,
            total: total.max(prompt + completion),
            estimated,
        }
    }

    /// Zero usage (error responses).
    pub fn zero() -> Self {
        Self::new(0, 0, 0, true)
    }

    /// Estimate usage from character counts at ~4 chars per token.
    pub fn estimated_from_chars(prompt_chars: usize, completion_chars: usize) -> Self {
        let prompt = (prompt_chars as u64).div_ceil(4);
        let completion = (completion_chars as u64).div_ceil(4);
        Self::new(prompt, completion, prompt + completion, true)
    }
}

/// One agent's contribution to a round.
///
/// Error responses (adapter failure, unparseable output, schema violation)
/// always carry `vote = abstain`, a null position, empty text, and zero
/// confidence so every round holds exactly one response per participant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentResponse {
    pub agent_id: String,
    pub round: u32,
    pub position_id: Option<String>,
    pub position_text: String,
    pub reasoning: String,
    pub vote: Vote,
    pub confidence: f64,
    pub token_usage: TokenUsage,
    pub latency_ms: u64,
    pub status: ResponseStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AgentResponse {
    /// Build the canonical error response for a failed participant.
    pub fn error(agent_id: &str, round: u32, message: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            round,
            position_id: None,
            position_text: String::new(),
            reasoning: String::new(),
            vote: Vote::Abstain,
            confidence: 0.0,
            token_usage: TokenUsage::zero(),
            latency_ms: 0,
            status: ResponseStatus::Error,
            error: Some(message.into()),
        }
    }

    /// Whether this response counts toward tallies and candidate selection.
    pub fn is_eligible(&self) -> bool {
        self.status == ResponseStatus::Ok
    }
}

/// Vote arithmetic for one round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteTally {
    pub yes: u32,
    pub no: u32,
    pub abstain: u32,
    /// `yes + no + abstain` — one per participant.
    pub total: u32,
    /// Count of ok-status responses.
    pub eligible: u32,
    /// `yes + no`; abstains are excluded from the denominator.
    pub voting_total: u32,
    pub supermajority_threshold: u32,
    pub supermajority_reached: bool,
}

/// How agent consensus was reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsensusMethod {
    /// Every voting participant voted yes.
    Unanimous,
    /// Yes votes met the supermajority threshold.
    Supermajority,
}

/// Immutable record of one agent round.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoundResult {
    pub round_number: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub candidate_position_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub candidate_position_text: Option<String>,
    pub responses: Vec<AgentResponse>,
    pub consensus_reached: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consensus_position_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consensus_position_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consensus_method: Option<ConsensusMethod>,
    pub vote_tally: VoteTally,
    pub timestamp: DateTime<Utc>,
}

/// One judge's scoring of the surviving positions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JudgeEvaluation {
    pub judge_id: String,
    pub round: u32,
    pub selected_position_id: Option<String>,
    /// Score in 0..=100 for every position presented to the panel.
    pub scores_by_position_id: std::collections::BTreeMap<String, u8>,
    pub reasoning: String,
    pub confidence: f64,
    pub token_usage: TokenUsage,
    pub latency_ms: u64,
    pub status: ResponseStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JudgeEvaluation {
    /// Build the canonical error evaluation for a failed judge.
    pub fn error(judge_id: &str, round: u32, message: impl Into<String>) -> Self {
        Self {
            judge_id: judge_id.to_string(),
            round,
            selected_position_id: None,
            scores_by_position_id: std::collections::BTreeMap::new(),
            reasoning: String::new(),
            confidence: 0.0,
            token_usage: TokenUsage::zero(),
            latency_ms: 0,
            status: ResponseStatus::Error,
            error: Some(message.into()),
        }
    }

    /// Whether this evaluation counts toward judge consensus.
    pub fn is_eligible(&self) -> bool {
        self.status == ResponseStatus::Ok && self.selected_position_id.is_some()
    }
}

/// A judge who voted against the winning position.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JudgeDissent {
    pub judge_id: String,
    pub selected_position_id: String,
    pub confidence: f64,
}

/// Immutable record of one judge round.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JudgeRoundResult {
    pub round_number: u32,
    pub evaluations: Vec<JudgeEvaluation>,
    pub consensus_reached: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consensus_position_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consensus_position_text: Option<String>,
    pub consensus_confidence: f64,
    pub dissents: Vec<JudgeDissent>,
    pub timestamp: DateTime<Utc>,
}

/// Where the final verdict came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictSource {
    AgentConsensus,
    JudgeConsensus,
    Deadlock,
}

impl std::fmt::Display for VerdictSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AgentConsensus => write!(f, "agent_consensus"),
            Self::JudgeConsensus => write!(f, "judge_consensus"),
            Self::Deadlock => write!(f, "deadlock"),
        }
    }
}

/// The single auditable outcome of a debate.
///
/// For `deadlock` the position may be empty when no position survived; for
/// the consensus sources it always references a position seen in the session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalVerdict {
    pub position_id: Option<String>,
    pub position_text: String,
    pub confidence: f64,
    pub source: VerdictSource,
}
