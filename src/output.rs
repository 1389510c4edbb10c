//! The DebateOutput document — the engine's primary deliverable.
//!
//! A single JSON document with the session header, every agent and judge
//! round, and the final verdict. Downstream consumers (replay, viewers)
//! read this; nothing in the engine reads it back.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::session::{DebatePhase, DebateSession};
use crate::types::{FinalVerdict, JudgeDissent, JudgeRoundResult, RoundResult};

/// Session header block.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: String,
    pub topic: String,
    pub initial_query: Option<String>,
    pub phase: DebatePhase,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub total_tokens: u64,
    pub total_cost_usd: f64,
    pub pricing_known: bool,
    pub engine_version: String,
    pub total_retries: u64,
    pub total_errors: u64,
}

/// Agent-phase block.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentDebateOutput {
    pub rounds: Vec<RoundResult>,
    pub final_position_id: Option<String>,
    pub final_position_text: Option<String>,
}

/// Judge-panel outcome block.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JudgePanelFinal {
    pub consensus_position_id: Option<String>,
    pub consensus_position_text: Option<String>,
    pub consensus_confidence: f64,
    pub dissents: Vec<JudgeDissent>,
}

/// Judge-phase block.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JudgePanelOutput {
    pub enabled: bool,
    pub rounds: Vec<JudgeRoundResult>,
    /// `final` is a Rust keyword, hence the rename.
    #[serde(rename = "final")]
    pub final_: Option<JudgePanelFinal>,
}

impl JudgePanelOutput {
    fn from_session(session: &DebateSession) -> Self {
        let final_ = session.judge_rounds.iter().rev().find(|r| r.consensus_reached).map(|round| {
            JudgePanelFinal {
                consensus_position_id: round.consensus_position_id.clone(),
                consensus_position_text: round.consensus_position_text.clone(),
                consensus_confidence: round.consensus_confidence,
                dissents: round.dissents.clone(),
            }
        });
        Self {
            enabled: session.config.judge_panel_enabled,
            rounds: session.judge_rounds.clone(),
            final_,
        }
    }
}

/// The complete output document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DebateOutput {
    pub version: String,
    pub session: SessionSummary,
    pub agent_debate: AgentDebateOutput,
    pub judge_panel: JudgePanelOutput,
    pub final_verdict: FinalVerdict,
}

impl DebateOutput {
    /// Assemble the document from a terminal session.
    pub fn from_session(session: &DebateSession, verdict: FinalVerdict) -> Self {
        let final_round_consensus = session
            .agent_rounds
            .iter()
            .rev()
            .find(|r| r.consensus_reached);
        Self {
            version: crate::FORMAT_VERSION.to_string(),
            session: SessionSummary {
                id: session.id.clone(),
                topic: session.topic.clone(),
                initial_query: session.initial_query.clone(),
                phase: session.phase,
                started_at: session.metadata.started_at,
                completed_at: session.metadata.completed_at,
                total_tokens: session.metadata.total_tokens,
                total_cost_usd: session.metadata.total_cost_usd,
                pricing_known: session.metadata.pricing_known,
                engine_version: session.metadata.engine_version.clone(),
                total_retries: session.metadata.total_retries,
                total_errors: session.metadata.total_errors,
            },
            agent_debate: AgentDebateOutput {
                rounds: session.agent_rounds.clone(),
                final_position_id: final_round_consensus
                    .and_then(|r| r.consensus_position_id.clone()),
                final_position_text: final_round_consensus
                    .and_then(|r| r.consensus_position_text.clone()),
            },
            judge_panel: JudgePanelOutput::from_session(session),
            final_verdict: verdict,
        }
    }
}
