//! Session state machine — phases, transitions, counters, final verdict.
//!
//! The session record is owned exclusively by the orchestrator; rounds are
//! appended and never mutated after append.
//!
//! # Phase graph
//!
//! ```text
//! init              → agent_debate
//! agent_debate      → consensus_reached | judge_evaluation | deadlock
//! judge_evaluation  → consensus_reached | deadlock
//! consensus_reached → (terminal)
//! deadlock          → (terminal)
//! ```
//!
//! Any other edge is a programmer error and aborts the run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::DebateConfig;
use crate::types::{FinalVerdict, JudgeRoundResult, RoundResult};

/// Phase of a debate session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DebatePhase {
    /// Session created but not started.
    Init,
    /// Agents are arguing across bounded rounds.
    AgentDebate,
    /// Judge panel is voting on surviving positions.
    JudgeEvaluation,
    /// Consensus reached — debate succeeded.
    ConsensusReached,
    /// Round budgets exhausted without consensus.
    Deadlock,
}

impl DebatePhase {
    /// Whether this is a terminal phase.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::ConsensusReached | Self::Deadlock)
    }

    /// Valid transitions from this phase.
    pub fn valid_transitions(self) -> &'static [DebatePhase] {
        match self {
            Self::Init => &[Self::AgentDebate],
            Self::AgentDebate => &[
                Self::ConsensusReached,
                Self::JudgeEvaluation,
                Self::Deadlock,
            ],
            Self::JudgeEvaluation => &[Self::ConsensusReached, Self::Deadlock],
            Self::ConsensusReached | Self::Deadlock => &[],
        }
    }
}

impl std::fmt::Display for DebatePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Init => write!(f, "init"),
            Self::AgentDebate => write!(f, "agent_debate"),
            Self::JudgeEvaluation => write!(f, "judge_evaluation"),
            Self::ConsensusReached => write!(f, "consensus_reached"),
            Self::Deadlock => write!(f, "deadlock"),
        }
    }
}

/// Error for illegal phase transitions or append-order violations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateError {
    pub message: String,
}

impl std::fmt::Display for StateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for StateError {}

/// Accumulated session metadata and counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetadata {
    pub engine_version: String,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub total_tokens: u64,
    pub total_cost_usd: f64,
    /// False when any participating model has no pricing entry.
    pub pricing_known: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint_path: Option<String>,
    pub total_retries: u64,
    pub total_errors: u64,
}

impl SessionMetadata {
    fn new() -> Self {
        Self {
            engine_version: crate::ENGINE_VERSION.to_string(),
            started_at: Utc::now(),
            completed_at: None,
            total_tokens: 0,
            total_cost_usd: 0.0,
            pricing_known: true,
            checkpoint_path: None,
            total_retries: 0,
            total_errors: 0,
        }
    }
}

/// A full debate session: the single mutable record of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DebateSession {
    /// Time-ordered UUIDv7 session identifier.
    pub id: String,
    pub topic: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initial_query: Option<String>,
    pub phase: DebatePhase,
    pub config: DebateConfig,
    pub agent_rounds: Vec<RoundResult>,
    pub judge_rounds: Vec<JudgeRoundResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_verdict: Option<FinalVerdict>,
    pub metadata: SessionMetadata,
}

impl DebateSession {
    /// Create a fresh session in `init`.
    pub fn new(config: DebateConfig) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            topic: config.topic.clone(),
            initial_query: config.initial_query.clone(),
            phase: DebatePhase::Init,
            config,
            agent_rounds: Vec::new(),
            judge_rounds: Vec::new(),
            final_verdict: None,
            metadata: SessionMetadata::new(),
        }
    }

    /// Transition to a new phase, rejecting edges outside the graph.
    ///
    /// Entering a terminal phase stamps `completed_at`.
    pub fn transition(&mut self, to: DebatePhase) -> Result<(), StateError> {
        if !self.phase.valid_transitions().contains(&to) {
            return Err(StateError {
                message: format!(
                    "illegal phase transition {} → {} (allowed: {:?})",
                    self.phase,
                    to,
                    self.phase.valid_transitions()
                ),
            });
        }
        tracing::debug!(session = %self.id, from = %self.phase, to = %to, "phase transition");
        self.phase = to;
        if to.is_terminal() {
            self.metadata.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    /// Append an agent round, enforcing strictly increasing round numbers
    /// and at most one response per agent within the round.
    pub fn append_agent_round(&mut self, round: RoundResult) -> Result<(), StateError> {
        let expected = self.agent_rounds.last().map_or(1, |r| r.round_number + 1);
        if round.round_number != expected {
            return Err(StateError {
                message: format!(
                    "agent round {} appended out of order (expected {})",
                    round.round_number, expected
                ),
            });
        }
        let mut seen = std::collections::HashSet::new();
        for response in &round.responses {
            if !seen.insert(response.agent_id.as_str()) {
                return Err(StateError {
                    message: format!(
                        "duplicate agent '{}' in round {}",
                        response.agent_id, round.round_number
                    ),
                });
            }
        }
        self.accumulate_agent_round(&round);
        self.agent_rounds.push(round);
        Ok(())
    }

    /// Append a judge round, enforcing strictly increasing round numbers.
    pub fn append_judge_round(&mut self, round: JudgeRoundResult) -> Result<(), StateError> {
        let expected = self.judge_rounds.last().map_or(1, |r| r.round_number + 1);
        if round.round_number != expected {
            return Err(StateError {
                message: format!(
                    "judge round {} appended out of order (expected {})",
                    round.round_number, expected
                ),
            });
        }
        for evaluation in &round.evaluations {
            self.metadata.total_tokens += evaluation.token_usage.total;
            if evaluation.status == crate::types::ResponseStatus::Error {
                self.metadata.total_errors += 1;
            }
        }
        self.judge_rounds.push(round);
        Ok(())
    }

    fn accumulate_agent_round(&mut self, round: &RoundResult) {
        for response in &round.responses {
            self.metadata.total_tokens += response.token_usage.total;
            if response.status == crate::types::ResponseStatus::Error {
                self.metadata.total_errors += 1;
            }
        }
    }

    /// Record retries observed by the retry wrapper.
    pub fn add_retries(&mut self, count: u64) {
        self.metadata.total_retries += count;
    }

    /// Add USD cost for a batch of calls; unknown pricing poisons
    /// `pricing_known` for the whole session.
    pub fn add_cost(&mut self, cost_usd: f64, known: bool) {
        self.metadata.total_cost_usd += cost_usd;
        if !known {
            self.metadata.pricing_known = false;
        }
    }

    /// Set the final verdict; a second call is a programmer error.
    pub fn set_verdict(&mut self, verdict: FinalVerdict) -> Result<(), StateError> {
        if self.final_verdict.is_some() {
            return Err(StateError {
                message: "final verdict already set".to_string(),
            });
        }
        self.final_verdict = Some(verdict);
        Ok(())
    }

    /// Current agent round number (1-based next round to run).
    pub fn next_agent_round(&self) -> u32 {
        self.agent_rounds.last().map_or(1, |r| r.round_number + 1)
    }

    /// Current judge round number (1-based next round to run).
    pub fn next_judge_round(&self) -> u32 {
        self.judge_rounds.last().map_or(1, |r| r.round_number + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests_support::minimal_config;
    use crate::types::{AgentResponse, VoteTally};
    use chrono::Utc;

    fn empty_tally() -> VoteTally {
        VoteTally {
            yes: 0,
            no: 0,
            abstain: 0,
            total: 0,
            eligible: 0,
            voting_total: 0,
            supermajority_threshold: 0,
            supermajority_reached: false,
        }
    }

    fn round(n: u32, responses: Vec<AgentResponse>) -> RoundResult {
        RoundResult {
            round_number: n,
            candidate_position_id: None,
            candidate_position_text: None,
            responses,
            consensus_reached: false,
            consensus_position_id: None,
            consensus_position_text: None,
            consensus_method: None,
            vote_tally: empty_tally(),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_new_session_in_init() {
        let session = DebateSession::new(minimal_config());
        assert_eq!(session.phase, DebatePhase::Init);
        assert!(session.final_verdict.is_none());
        assert!(session.metadata.completed_at.is_none());
        // UUIDv7 is 36 chars with dashes.
        assert_eq!(session.id.len(), 36);
    }

    #[test]
    fn test_legal_transition_path() {
        let mut session = DebateSession::new(minimal_config());
        session.transition(DebatePhase::AgentDebate).unwrap();
        session.transition(DebatePhase::JudgeEvaluation).unwrap();
        session.transition(DebatePhase::ConsensusReached).unwrap();
        assert!(session.phase.is_terminal());
        assert!(session.metadata.completed_at.is_some());
        assert!(session.metadata.completed_at.unwrap() >= session.metadata.started_at);
    }

    #[test]
    fn test_illegal_transitions_rejected() {
        let mut session = DebateSession::new(minimal_config());
        assert!(session.transition(DebatePhase::ConsensusReached).is_err());
        assert!(session.transition(DebatePhase::JudgeEvaluation).is_err());

        session.transition(DebatePhase::AgentDebate).unwrap();
        session.transition(DebatePhase::Deadlock).unwrap();
        // Terminal phases allow nothing.
        assert!(session.transition(DebatePhase::AgentDebate).is_err());
        assert!(session.transition(DebatePhase::ConsensusReached).is_err());
    }

    #[test]
    fn test_round_numbers_strictly_increase() {
        let mut session = DebateSession::new(minimal_config());
        session.append_agent_round(round(1, vec![])).unwrap();
        session.append_agent_round(round(2, vec![])).unwrap();
        let err = session.append_agent_round(round(2, vec![])).unwrap_err();
        assert!(err.message.contains("out of order"));
        let err = session.append_agent_round(round(5, vec![])).unwrap_err();
        assert!(err.message.contains("out of order"));
    }

    #[test]
    fn test_duplicate_agent_in_round_rejected() {
        let mut session = DebateSession::new(minimal_config());
        let responses = vec![
            AgentResponse::error("a1", 1, "x"),
            AgentResponse::error("a1", 1, "y"),
        ];
        let err = session.append_agent_round(round(1, responses)).unwrap_err();
        assert!(err.message.contains("duplicate agent"));
    }

    #[test]
    fn test_counters_accumulate() {
        let mut session = DebateSession::new(minimal_config());
        let mut ok = AgentResponse::error("a1", 1, "will flip");
        ok.status = crate::types::ResponseStatus::Ok;
        ok.error = None;
        ok.token_usage = crate::types::TokenUsage::new(100, 50, 150, false);
        let responses = vec![ok, AgentResponse::error("a2", 1, "down")];
        session.append_agent_round(round(1, responses)).unwrap();
        assert_eq!(session.metadata.total_tokens, 150);
        assert_eq!(session.metadata.total_errors, 1);

        session.add_retries(3);
        assert_eq!(session.metadata.total_retries, 3);

        session.add_cost(0.25, true);
        assert!(session.metadata.pricing_known);
        session.add_cost(0.0, false);
        assert!(!session.metadata.pricing_known);
    }

    #[test]
    fn test_verdict_set_once() {
        let mut session = DebateSession::new(minimal_config());
        let verdict = FinalVerdict {
            position_id: Some("abc123abc123".to_string()),
            position_text: "p".to_string(),
            confidence: 0.9,
            source: crate::types::VerdictSource::AgentConsensus,
        };
        session.set_verdict(verdict.clone()).unwrap();
        assert!(session.set_verdict(verdict).is_err());
    }

    #[test]
    fn test_next_round_numbers() {
        let mut session = DebateSession::new(minimal_config());
        assert_eq!(session.next_agent_round(), 1);
        session.append_agent_round(round(1, vec![])).unwrap();
        assert_eq!(session.next_agent_round(), 2);
        assert_eq!(session.next_judge_round(), 1);
    }

    #[test]
    fn test_phase_serde_snake_case() {
        assert_eq!(
            serde_json::to_string(&DebatePhase::AgentDebate).unwrap(),
            "\"agent_debate\""
        );
        assert_eq!(
            serde_json::to_string(&DebatePhase::ConsensusReached).unwrap(),
            "\"consensus_reached\""
        );
    }
}
