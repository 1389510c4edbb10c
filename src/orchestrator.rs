//! Orchestrator — drives the two-phase debate loop end to end.
//!
//! Owns the session record exclusively: rounds execute strictly one after
//! another, and every mutation of session state happens here between
//! rounds. The agent loop runs until consensus, round exhaustion, or a
//! fatal limit; non-convergence hands the surviving positions to the judge
//! panel when it is enabled and quorate, and deadlock otherwise.
//!
//! A session-wide deadline cancels in-flight rounds cooperatively; limits
//! on tokens and cost are checked between rounds, after the checkpoint for
//! the finished round has been written, so partial output survives.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::adapter::retry::RetryingAdapter;
use crate::adapter::AdapterRegistry;
use crate::checkpoint::{Checkpoint, CheckpointError};
use crate::config::{DebateConfig, JudgePositionsScope, ParticipantConfig};
use crate::consensus::{mean_yes_confidence, score_positions, select_candidate};
use crate::output::DebateOutput;
use crate::round::{run_agent_round, run_judge_round, RoundError, RoundParticipant};
use crate::session::{DebatePhase, DebateSession, StateError};
use crate::types::{FinalVerdict, VerdictSource};

/// Fatal engine failures. Participant-level trouble never reaches here.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("adapter construction failed: {0}")]
    Adapter(String),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Round(#[from] RoundError),

    #[error("resource limit exceeded: {0}")]
    LimitExceeded(String),

    #[error("invariant violation: {0}")]
    Invariant(String),
}

/// The top-level control loop.
#[derive(Debug)]
pub struct Orchestrator {
    session: DebateSession,
    registry: Arc<AdapterRegistry>,
    retry_counter: Arc<AtomicU64>,
    cancel: CancellationToken,
}

impl Orchestrator {
    /// Start a fresh session resolving adapters through the process-wide
    /// registry.
    pub fn new(config: DebateConfig) -> Result<Self, EngineError> {
        Self::with_registry(config, AdapterRegistry::global())
    }

    /// Start a fresh session resolving adapters through the given registry.
    pub fn with_registry(
        config: DebateConfig,
        registry: Arc<AdapterRegistry>,
    ) -> Result<Self, EngineError> {
        config.validate().map_err(EngineError::Config)?;
        Ok(Self {
            session: DebateSession::new(config),
            registry,
            retry_counter: Arc::new(AtomicU64::new(0)),
            cancel: CancellationToken::new(),
        })
    }

    /// Resume a session from a verified checkpoint.
    pub fn resume(
        checkpoint_path: &std::path::Path,
        registry: Arc<AdapterRegistry>,
    ) -> Result<Self, EngineError> {
        let checkpoint = Checkpoint::load(checkpoint_path)?;
        checkpoint.config.validate().map_err(EngineError::Config)?;
        let session = checkpoint.into_session();
        info!(
            session = %session.id,
            phase = %session.phase,
            agent_rounds = session.agent_rounds.len(),
            judge_rounds = session.judge_rounds.len(),
            "session resumed from checkpoint"
        );
        Ok(Self {
            session,
            registry,
            retry_counter: Arc::new(AtomicU64::new(0)),
            cancel: CancellationToken::new(),
        })
    }

    /// Cooperative cancellation handle for external shutdown.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// The session record (read-only).
    pub fn session(&self) -> &DebateSession {
        &self.session
    }

    /// Run the debate to a terminal phase and assemble the output document.
    pub async fn run(&mut self) -> Result<DebateOutput, EngineError> {
        let agents = self.build_participants(&self.session.config.agents.clone(), false)?;
        let judges = self.build_participants(&self.session.config.judges.clone(), true)?;

        // Session deadline cancels in-flight rounds cooperatively.
        let session_cancel = self.cancel.child_token();
        let deadline_guard = session_cancel.clone();
        let session_budget = Duration::from_millis(self.session.config.timeouts.session_ms);
        let watchdog = tokio::spawn(async move {
            tokio::time::sleep(session_budget).await;
            deadline_guard.cancel();
        });

        let outcome = self.drive(&agents, &judges, &session_cancel).await;
        watchdog.abort();

        let verdict = outcome?;
        info!(
            session = %self.session.id,
            phase = %self.session.phase,
            source = %verdict.source,
            "debate finished"
        );
        Ok(DebateOutput::from_session(&self.session, verdict))
    }

    async fn drive(
        &mut self,
        agents: &[RoundParticipant],
        judges: &[RoundParticipant],
        cancel: &CancellationToken,
    ) -> Result<FinalVerdict, EngineError> {
        if self.session.phase == DebatePhase::Init {
            self.session.transition(DebatePhase::AgentDebate)?;
        }

        if self.session.phase == DebatePhase::AgentDebate {
            if let Some(verdict) = self.agent_phase(agents, cancel).await? {
                return Ok(verdict);
            }
        }

        if self.session.phase == DebatePhase::JudgeEvaluation {
            if let Some(verdict) = self.judge_phase(judges, cancel).await? {
                return Ok(verdict);
            }
            return self.judge_deadlock();
        }

        // Resumed sessions can load in a terminal phase with the verdict
        // stripped (checkpoints do not carry verdicts); re-deriving one here
        // is not supported.
        Err(EngineError::Invariant(format!(
            "drive() reached phase {} without a verdict",
            self.session.phase
        )))
    }

    /// Agent loop. Returns the verdict on consensus, or `None` when the
    /// phase moved on (judge panel or deadlock handled inside).
    async fn agent_phase(
        &mut self,
        agents: &[RoundParticipant],
        cancel: &CancellationToken,
    ) -> Result<Option<FinalVerdict>, EngineError> {
        while self.session.phase == DebatePhase::AgentDebate
            && self.session.next_agent_round() <= self.session.config.max_agent_rounds
        {
            let round_number = self.session.next_agent_round();
            let candidate = if round_number == 1 {
                None
            } else {
                self.session
                    .agent_rounds
                    .last()
                    .and_then(|prev| select_candidate(&prev.responses))
            };

            let output = self
                .run_with_session_guard(run_agent_round(
                    &self.session.config,
                    agents,
                    round_number,
                    candidate,
                    &self.session.agent_rounds,
                    cancel,
                ))
                .await?;

            self.session.add_retries(self.retry_counter.swap(0, Ordering::SeqCst));
            self.session.add_cost(output.cost_usd, output.pricing_known);
            let consensus_reached = output.result.consensus_reached;
            let consensus_id = output.result.consensus_position_id.clone();
            let consensus_text = output.result.consensus_position_text.clone();
            let responses = output.result.responses.clone();
            self.session.append_agent_round(output.result)?;
            self.write_checkpoint()?;
            self.enforce_limits()?;

            if consensus_reached {
                let position_id = consensus_id.ok_or_else(|| {
                    EngineError::Invariant("consensus round lacks a position id".to_string())
                })?;
                let confidence =
                    mean_yes_confidence(&responses, &position_id).ok_or_else(|| {
                        EngineError::Invariant(
                            "consensus recorded with zero yes-voters".to_string(),
                        )
                    })?;
                let verdict = FinalVerdict {
                    position_text: consensus_text.unwrap_or_default(),
                    position_id: Some(position_id),
                    confidence,
                    source: VerdictSource::AgentConsensus,
                };
                self.session.transition(DebatePhase::ConsensusReached)?;
                self.session.set_verdict(verdict.clone())?;
                self.write_checkpoint()?;
                return Ok(Some(verdict));
            }
        }

        // Rounds exhausted without consensus: judge panel or deadlock.
        let positions = self.collect_positions();
        let judge_count = self.session.config.judges.len();
        if self.session.config.judge_panel_enabled && positions.len() >= 2 && judge_count >= 3 {
            info!(
                positions = positions.len(),
                judges = judge_count,
                "agent debate unresolved; convening judge panel"
            );
            self.session.transition(DebatePhase::JudgeEvaluation)?;
            self.write_checkpoint()?;
            return Ok(None);
        }

        let verdict = self.agent_deadlock_verdict();
        self.session.transition(DebatePhase::Deadlock)?;
        self.session.set_verdict(verdict.clone())?;
        self.write_checkpoint()?;
        Ok(Some(verdict))
    }

    /// Judge loop. Returns the verdict on consensus, `None` on exhaustion.
    async fn judge_phase(
        &mut self,
        judges: &[RoundParticipant],
        cancel: &CancellationToken,
    ) -> Result<Option<FinalVerdict>, EngineError> {
        let positions = self.collect_positions();

        while self.session.phase == DebatePhase::JudgeEvaluation
            && self.session.next_judge_round() <= self.session.config.max_judge_rounds
        {
            let round_number = self.session.next_judge_round();
            let output = self
                .run_with_session_guard(run_judge_round(
                    &self.session.config,
                    judges,
                    round_number,
                    &positions,
                    cancel,
                ))
                .await?;

            self.session.add_retries(self.retry_counter.swap(0, Ordering::SeqCst));
            self.session.add_cost(output.cost_usd, output.pricing_known);
            let reached = output.result.consensus_reached;
            let position_id = output.result.consensus_position_id.clone();
            let position_text = output.result.consensus_position_text.clone();
            let confidence = output.result.consensus_confidence;
            self.session.append_judge_round(output.result)?;
            self.write_checkpoint()?;
            self.enforce_limits()?;

            if reached {
                let verdict = FinalVerdict {
                    position_id,
                    position_text: position_text.unwrap_or_default(),
                    confidence,
                    source: VerdictSource::JudgeConsensus,
                };
                self.session.transition(DebatePhase::ConsensusReached)?;
                self.session.set_verdict(verdict.clone())?;
                self.write_checkpoint()?;
                return Ok(Some(verdict));
            }
        }
        Ok(None)
    }

    /// Deadlock after judge-round exhaustion: the last round's plurality
    /// position wins informationally, at its voters' mean confidence.
    fn judge_deadlock(&mut self) -> Result<FinalVerdict, EngineError> {
        let last = self.session.judge_rounds.last();
        let (position_id, position_text, confidence) = match last {
            Some(round) => {
                let id = round.consensus_position_id.clone();
                let text = round.consensus_position_text.clone().unwrap_or_default();
                let confidence = id
                    .as_deref()
                    .map(|winner| {
                        let votes: Vec<f64> = round
                            .evaluations
                            .iter()
                            .filter(|e| {
                                e.is_eligible()
                                    && e.selected_position_id.as_deref() == Some(winner)
                            })
                            .map(|e| e.confidence)
                            .collect();
                        if votes.is_empty() {
                            0.0
                        } else {
                            votes.iter().sum::<f64>() / votes.len() as f64
                        }
                    })
                    .unwrap_or(0.0);
                (id, text, confidence)
            }
            None => (None, String::new(), 0.0),
        };

        let verdict = FinalVerdict {
            position_id,
            position_text,
            confidence,
            source: VerdictSource::Deadlock,
        };
        self.session.transition(DebatePhase::Deadlock)?;
        self.session.set_verdict(verdict.clone())?;
        self.write_checkpoint()?;
        Ok(verdict)
    }

    /// Deadlock without a judge panel: best surviving position from the
    /// last agent round, at its supporters' mean confidence.
    fn agent_deadlock_verdict(&self) -> FinalVerdict {
        let best = self
            .session
            .agent_rounds
            .last()
            .and_then(|round| score_positions(&round.responses).into_iter().next());
        match best {
            Some(score) => FinalVerdict {
                position_id: Some(score.position_id),
                position_text: score.position_text,
                confidence: if score.supporter_count == 0 {
                    0.0
                } else {
                    score.support_score / score.supporter_count as f64
                },
                source: VerdictSource::Deadlock,
            },
            None => FinalVerdict {
                position_id: None,
                position_text: String::new(),
                confidence: 0.0,
                source: VerdictSource::Deadlock,
            },
        }
    }

    /// Positions the judge panel votes on: first-seen text per ID, from all
    /// rounds or only the last, per configuration.
    fn collect_positions(&self) -> Vec<(String, String)> {
        let mut seen = std::collections::BTreeMap::new();
        let rounds: Vec<&crate::types::RoundResult> =
            match self.session.config.judge_positions_scope {
                JudgePositionsScope::AllRounds => self.session.agent_rounds.iter().collect(),
                JudgePositionsScope::LastRound => {
                    self.session.agent_rounds.last().into_iter().collect()
                }
            };
        for round in rounds {
            for response in &round.responses {
                if !response.is_eligible() || response.position_text.is_empty() {
                    continue;
                }
                if let Some(id) = &response.position_id {
                    seen.entry(id.clone())
                        .or_insert_with(|| response.position_text.clone());
                }
            }
        }
        seen.into_iter().collect()
    }

    /// Map a round-level cancellation caused by the session deadline into
    /// the fatal limit class.
    async fn run_with_session_guard<T>(
        &self,
        round: impl std::future::Future<Output = Result<T, RoundError>>,
    ) -> Result<T, EngineError> {
        match round.await {
            Ok(value) => Ok(value),
            Err(RoundError::Cancelled { .. }) if !self.cancel.is_cancelled() => {
                Err(EngineError::LimitExceeded(format!(
                    "session exceeded its {}ms budget",
                    self.session.config.timeouts.session_ms
                )))
            }
            Err(other) => Err(EngineError::Round(other)),
        }
    }

    fn build_participants(
        &self,
        configs: &[ParticipantConfig],
        is_judge: bool,
    ) -> Result<Vec<RoundParticipant>, EngineError> {
        let policy = self.session.config.effective_retries();
        let deterministic = self.session.config.deterministic_mode;
        configs
            .iter()
            .map(|participant| {
                let adapter = self
                    .registry
                    .adapter_for(&participant.model)
                    .map_err(|e| EngineError::Adapter(e.to_string()))?;
                let counter = self.retry_counter.clone();
                let wrapped = RetryingAdapter::new(adapter, policy, deterministic).with_on_retry(
                    Arc::new(move |_attempt, _error, _delay| {
                        counter.fetch_add(1, Ordering::SeqCst);
                    }),
                );
                Ok(RoundParticipant {
                    id: participant.id.clone(),
                    adapter: Arc::new(wrapped),
                    temperature: self
                        .session
                        .config
                        .effective_temperature(participant, is_judge),
                    preamble: participant.system_prompt.clone(),
                    model: participant.model.clone(),
                })
            })
            .collect()
    }

    fn write_checkpoint(&mut self) -> Result<(), EngineError> {
        let Some(dir) = self.session.config.checkpoint_dir.clone() else {
            return Ok(());
        };
        let checkpoint = Checkpoint::capture(&self.session)?;
        let path = checkpoint.save(&dir)?;
        self.session.metadata.checkpoint_path = Some(path.display().to_string());
        Ok(())
    }

    fn enforce_limits(&self) -> Result<(), EngineError> {
        let limits = &self.session.config.limits;
        let metadata = &self.session.metadata;
        if metadata.total_tokens > limits.max_total_tokens {
            error!(
                total = metadata.total_tokens,
                limit = limits.max_total_tokens,
                "token budget exceeded"
            );
            return Err(EngineError::LimitExceeded(format!(
                "total tokens {} exceed the {} budget",
                metadata.total_tokens, limits.max_total_tokens
            )));
        }
        if metadata.total_cost_usd > limits.max_total_cost_usd {
            error!(
                cost = metadata.total_cost_usd,
                limit = limits.max_total_cost_usd,
                "cost budget exceeded"
            );
            return Err(EngineError::LimitExceeded(format!(
                "total cost ${:.4} exceeds the ${:.2} budget",
                metadata.total_cost_usd, limits.max_total_cost_usd
            )));
        }
        Ok(())
    }
}

/// Process exit code for a finished or failed debate.
pub fn exit_code_for(phase: DebatePhase) -> i32 {
    match phase {
        DebatePhase::ConsensusReached => 0,
        DebatePhase::Deadlock => 2,
        _ => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests_support::minimal_config;

    #[test]
    fn test_invalid_config_rejected_at_construction() {
        let mut config = minimal_config();
        config.agents.truncate(1);
        assert!(matches!(
            Orchestrator::new(config),
            Err(EngineError::Config(_))
        ));
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(exit_code_for(DebatePhase::ConsensusReached), 0);
        assert_eq!(exit_code_for(DebatePhase::Deadlock), 2);
        assert_eq!(exit_code_for(DebatePhase::AgentDebate), 1);
        assert_eq!(exit_code_for(DebatePhase::Init), 1);
    }

    #[tokio::test]
    async fn test_missing_binary_is_fatal_adapter_error() {
        let mut config = minimal_config();
        config.allow_external_paths = true;
        config.agents[0].model = crate::config::ModelConfig {
            provider: crate::config::Provider::Cli,
            model: "local".to_string(),
            endpoint: None,
            api_key_env: None,
            cli_path: Some("/no/such/model-binary".to_string()),
        };
        let mut orchestrator = Orchestrator::new(config).unwrap();
        let err = orchestrator.run().await.unwrap_err();
        assert!(matches!(err, EngineError::Adapter(_)));
    }
}
