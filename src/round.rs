//! Round runner — one parallel pass over all agents or all judges.
//!
//! Participants fan out concurrently under a semaphore bound; the round
//! completes only when every participant has produced a response or been
//! written off by its per-call timeout. Individual failures never cancel
//! peers: they are recovered into error responses so the round always holds
//! exactly one response per participant. Responses are assembled in
//! participant order, which makes round records independent of completion
//! order.
//!
//! Only a round-level timeout or cooperative cancellation fails a round;
//! both abort the in-flight fan-out (dropping it cancels every task).

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::adapter::{CompletionRequest, ModelAdapter};
use crate::config::{ContextTopology, DebateConfig, ModelConfig};
use crate::consensus::{evaluate_agent_consensus, evaluate_judge_consensus};
use crate::position;
use crate::pricing::call_cost;
use crate::prompts::{self, AgentReply, JudgeReply};
use crate::repair::parse_with_repair;
use crate::types::{
    AgentResponse, JudgeEvaluation, JudgeRoundResult, ResponseStatus, RoundResult, TokenUsage,
    Vote,
};

/// Marker inserted where rendered history was elided.
const TRUNCATION_MARKER: &str = "[...truncated...]";

/// One participant ready to be called: id, retry-wrapped adapter, sampling
/// parameters, and the model config (for pricing).
#[derive(Clone)]
pub struct RoundParticipant {
    pub id: String,
    pub adapter: Arc<dyn ModelAdapter>,
    pub temperature: f64,
    pub preamble: Option<String>,
    pub model: ModelConfig,
}

/// Round-fatal failures. Participant-level errors never surface here.
#[derive(Debug, Error)]
pub enum RoundError {
    #[error("round {round} exceeded its {budget_ms}ms budget")]
    Timeout { round: u32, budget_ms: u64 },

    #[error("round {round} cancelled")]
    Cancelled { round: u32 },
}

/// A finished agent round plus its cost accounting.
#[derive(Debug)]
pub struct AgentRoundOutput {
    pub result: RoundResult,
    pub cost_usd: f64,
    pub pricing_known: bool,
}

/// A finished judge round plus its cost accounting.
#[derive(Debug)]
pub struct JudgeRoundOutput {
    pub result: JudgeRoundResult,
    pub cost_usd: f64,
    pub pricing_known: bool,
}

/// Execute one agent round.
pub async fn run_agent_round(
    config: &DebateConfig,
    participants: &[RoundParticipant],
    round_number: u32,
    candidate: Option<(String, String)>,
    history: &[RoundResult],
    cancel: &CancellationToken,
) -> Result<AgentRoundOutput, RoundError> {
    info!(
        round = round_number,
        candidate = candidate.as_ref().map(|c| c.0.as_str()).unwrap_or("none"),
        participants = participants.len(),
        "agent round starting"
    );

    let schema_hint = prompts::agent_reply_schema();
    let max_history_chars = (config.limits.max_context_tokens * 4) as usize;
    let allow_repair = !config.deterministic_mode;

    let mut calls = Vec::with_capacity(participants.len());
    for participant in participants {
        let system = prompts::agent_system_prompt(
            &participant.id,
            &config.topic,
            config.initial_query.as_deref(),
            participant.preamble.as_deref(),
        );
        let user = match &candidate {
            None => prompts::agent_opening_prompt(),
            Some((id, text)) => {
                let rendered = render_history(
                    history,
                    &participant.id,
                    config.context_topology,
                    max_history_chars,
                );
                prompts::agent_voting_prompt(id, text, &rendered)
            }
        };
        calls.push((participant.clone(), system, user));
    }

    let candidate_for_tasks = candidate.clone();
    let outcomes = execute_fanout(
        config,
        calls,
        schema_hint,
        cancel,
        round_number,
        move |participant_id, round, content, usage, latency_ms| {
            normalize_agent_reply(
                participant_id,
                round,
                content,
                candidate_for_tasks.as_ref().map(|(id, text)| (id.as_str(), text.as_str())),
                usage,
                latency_ms,
                allow_repair,
            )
        },
        |id: &str, round: u32, message: String| AgentResponse::error(id, round, message),
    )
    .await?;

    let mut cost_usd = 0.0;
    let mut pricing_known = true;
    let mut responses = Vec::with_capacity(outcomes.len());
    for (participant, response) in participants.iter().zip(outcomes) {
        let (cost, known) = call_cost(
            &participant.model,
            response.token_usage.prompt,
            response.token_usage.completion,
        );
        cost_usd += cost;
        pricing_known &= known;
        responses.push(response);
    }

    let (tally, consensus) = evaluate_agent_consensus(
        &responses,
        candidate.as_ref().map(|(id, _)| id.as_str()),
        candidate.as_ref().map(|(_, text)| text.as_str()),
        config.consensus_threshold,
    );

    info!(
        round = round_number,
        yes = tally.yes,
        no = tally.no,
        abstain = tally.abstain,
        eligible = tally.eligible,
        consensus = consensus.reached,
        "agent round complete"
    );

    let result = RoundResult {
        round_number,
        candidate_position_id: candidate.as_ref().map(|(id, _)| id.clone()),
        candidate_position_text: candidate.map(|(_, text)| text),
        responses,
        consensus_reached: consensus.reached,
        consensus_position_id: consensus.position_id,
        consensus_position_text: consensus.position_text,
        consensus_method: consensus.method,
        vote_tally: tally,
        timestamp: Utc::now(),
    };

    Ok(AgentRoundOutput {
        result,
        cost_usd,
        pricing_known,
    })
}

/// Execute one judge round over a fixed positions set.
pub async fn run_judge_round(
    config: &DebateConfig,
    judges: &[RoundParticipant],
    round_number: u32,
    positions: &[(String, String)],
    cancel: &CancellationToken,
) -> Result<JudgeRoundOutput, RoundError> {
    info!(
        round = round_number,
        judges = judges.len(),
        positions = positions.len(),
        "judge round starting"
    );

    let schema_hint = prompts::judge_reply_schema();
    let allow_repair = !config.deterministic_mode;
    let position_ids: Vec<String> = positions.iter().map(|(id, _)| id.clone()).collect();

    let mut calls = Vec::with_capacity(judges.len());
    for judge in judges {
        let system = prompts::judge_system_prompt(
            &judge.id,
            &config.topic,
            config.initial_query.as_deref(),
            judge.preamble.as_deref(),
        );
        let user = prompts::judge_evaluation_prompt(positions);
        calls.push((judge.clone(), system, user));
    }

    let expected_ids = position_ids.clone();
    let evaluations_raw = execute_fanout(
        config,
        calls,
        schema_hint,
        cancel,
        round_number,
        move |judge_id, round, content, usage, latency_ms| {
            normalize_judge_reply(
                judge_id,
                round,
                content,
                &expected_ids,
                usage,
                latency_ms,
                allow_repair,
            )
        },
        |id: &str, round: u32, message: String| JudgeEvaluation::error(id, round, message),
    )
    .await?;

    let mut cost_usd = 0.0;
    let mut pricing_known = true;
    let mut evaluations = Vec::with_capacity(evaluations_raw.len());
    for (judge, evaluation) in judges.iter().zip(evaluations_raw) {
        let (cost, known) = call_cost(
            &judge.model,
            evaluation.token_usage.prompt,
            evaluation.token_usage.completion,
        );
        cost_usd += cost;
        pricing_known &= known;
        evaluations.push(evaluation);
    }

    let consensus = evaluate_judge_consensus(
        &evaluations,
        config.judge_consensus_threshold,
        config.judge_min_confidence,
    );
    let consensus_position_text = consensus.position_id.as_ref().and_then(|id| {
        positions
            .iter()
            .find(|(pid, _)| pid == id)
            .map(|(_, text)| text.clone())
    });

    info!(
        round = round_number,
        winner = consensus.position_id.as_deref().unwrap_or("none"),
        votes = consensus.votes_for_winner,
        required = consensus.required_votes,
        reached = consensus.reached,
        "judge round complete"
    );

    let result = JudgeRoundResult {
        round_number,
        evaluations,
        consensus_reached: consensus.reached,
        consensus_position_id: consensus.position_id,
        consensus_position_text,
        consensus_confidence: consensus.confidence,
        dissents: consensus.dissents,
        timestamp: Utc::now(),
    };

    Ok(JudgeRoundOutput {
        result,
        cost_usd,
        pricing_known,
    })
}

/// Shared fan-out: bounded parallel calls, per-participant recovery, round
/// timeout, cooperative cancellation, results in participant order.
async fn execute_fanout<T, N, E>(
    config: &DebateConfig,
    calls: Vec<(RoundParticipant, String, String)>,
    schema_hint: String,
    cancel: &CancellationToken,
    round_number: u32,
    normalize: N,
    make_error: E,
) -> Result<Vec<T>, RoundError>
where
    T: Send + 'static,
    N: Fn(&str, u32, &str, TokenUsage, u64) -> Result<T, String> + Send + Sync + 'static,
    E: Fn(&str, u32, String) -> T + Send + Sync + 'static,
{
    let semaphore = Arc::new(Semaphore::new(config.concurrency.max_concurrent_requests));
    let participant_ids: Vec<String> = calls.iter().map(|(p, _, _)| p.id.clone()).collect();
    let normalize = Arc::new(normalize);
    let make_error = Arc::new(make_error);
    let model_timeout = Duration::from_millis(config.timeouts.model_ms);
    let max_tokens = config.limits.max_tokens_per_response;
    let mut join_set: JoinSet<(usize, T)> = JoinSet::new();

    for (index, (participant, system, user)) in calls.into_iter().enumerate() {
        let semaphore = semaphore.clone();
        let normalize = normalize.clone();
        let make_error = make_error.clone();
        let schema_hint = schema_hint.clone();

        join_set.spawn(async move {
            let _permit = semaphore.acquire().await.expect("semaphore closed");
            let request = CompletionRequest {
                system_prompt: system,
                user_prompt: user,
                max_tokens,
                temperature: participant.temperature,
                timeout: model_timeout,
                schema_hint: Some(schema_hint),
            };

            let outcome = match participant.adapter.call(&request).await {
                Ok(response) => {
                    match normalize(
                        &participant.id,
                        round_number,
                        &response.content,
                        response.token_usage,
                        response.latency_ms,
                    ) {
                        Ok(value) => value,
                        Err(reason) => {
                            warn!(
                                participant = %participant.id,
                                round = round_number,
                                reason = %reason,
                                "response rejected"
                            );
                            make_error(&participant.id, round_number, reason)
                        }
                    }
                }
                Err(error) => {
                    warn!(
                        participant = %participant.id,
                        round = round_number,
                        error = %error,
                        "adapter call failed"
                    );
                    make_error(&participant.id, round_number, error.to_string())
                }
            };
            (index, outcome)
        });
    }

    let barrier = async {
        let mut collected: Vec<Option<T>> = Vec::new();
        collected.resize_with(join_set.len(), || None);
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((index, outcome)) => collected[index] = Some(outcome),
                Err(join_error) => {
                    // A panicked worker is unrecoverable for that slot; the
                    // orchestrator still needs full cardinality, so this is
                    // reported through the per-slot error path below.
                    warn!(error = %join_error, "round worker panicked");
                }
            }
        }
        collected
    };

    let round_budget = Duration::from_millis(config.timeouts.round_ms);
    let collected = tokio::select! {
        _ = cancel.cancelled() => {
            return Err(RoundError::Cancelled { round: round_number });
        }
        result = tokio::time::timeout(round_budget, barrier) => match result {
            Ok(collected) => collected,
            Err(_) => {
                return Err(RoundError::Timeout {
                    round: round_number,
                    budget_ms: config.timeouts.round_ms,
                });
            }
        },
    };

    debug!(round = round_number, "fan-out barrier released");
    Ok(collected
        .into_iter()
        .enumerate()
        .map(|(index, slot)| {
            slot.unwrap_or_else(|| {
                make_error(
                    &participant_ids[index],
                    round_number,
                    "worker panicked".to_string(),
                )
            })
        })
        .collect())
}

/// Parse, validate, and normalize an agent reply into a full response.
#[allow(clippy::too_many_arguments)]
fn normalize_agent_reply(
    agent_id: &str,
    round: u32,
    content: &str,
    candidate: Option<(&str, &str)>,
    token_usage: TokenUsage,
    latency_ms: u64,
    allow_repair: bool,
) -> Result<AgentResponse, String> {
    let parsed = parse_with_repair(content, allow_repair).map_err(|e| e.to_string())?;
    let reply: AgentReply = serde_json::from_value(parsed.value)
        .map_err(|e| format!("reply does not match the agent schema: {e}"))?;

    let vote = match reply.vote.as_str() {
        "yes" => Vote::Yes,
        "no" => Vote::No,
        "abstain" => Vote::Abstain,
        other => return Err(format!("unknown vote '{other}'")),
    };
    if !reply.confidence.is_finite() || !(0.0..=1.0).contains(&reply.confidence) {
        return Err(format!("confidence {} outside [0, 1]", reply.confidence));
    }
    let reasoning = position::validate_reasoning_text(&reply.reasoning)?.to_string();

    // Candidate-less rounds (round 1, or a round whose selection came up
    // empty) are initialization rounds: only abstain is meaningful.
    if candidate.is_none() && vote != Vote::Abstain {
        return Err(format!("vote '{vote}' requires a candidate position"));
    }

    let (position_id, position_text) = match vote {
        Vote::Yes => {
            let (candidate_id, candidate_text) =
                candidate.expect("yes vote checked against candidate presence");
            let target = reply
                .target_position_id
                .as_deref()
                .ok_or("yes vote missing targetPositionId")?;
            if target != candidate_id {
                return Err(format!(
                    "yes vote targets '{target}' but the candidate is '{candidate_id}'"
                ));
            }
            (Some(candidate_id.to_string()), candidate_text.to_string())
        }
        Vote::No => {
            let text = reply
                .new_position_text
                .as_deref()
                .ok_or("no vote missing newPositionText")?;
            let text = position::validate_position_text(text)?.to_string();
            (Some(position::position_id(&text)), text)
        }
        Vote::Abstain => match reply.new_position_text.as_deref() {
            Some(text) if !text.trim().is_empty() => {
                let text = position::validate_position_text(text)?.to_string();
                (Some(position::position_id(&text)), text)
            }
            _ => (None, String::new()),
        },
    };

    Ok(AgentResponse {
        agent_id: agent_id.to_string(),
        round,
        position_id,
        position_text,
        reasoning,
        vote,
        confidence: reply.confidence,
        token_usage,
        latency_ms,
        status: ResponseStatus::Ok,
        error: None,
    })
}

/// Parse, validate, and normalize a judge reply into a full evaluation.
fn normalize_judge_reply(
    judge_id: &str,
    round: u32,
    content: &str,
    expected_position_ids: &[String],
    token_usage: TokenUsage,
    latency_ms: u64,
    allow_repair: bool,
) -> Result<JudgeEvaluation, String> {
    let parsed = parse_with_repair(content, allow_repair).map_err(|e| e.to_string())?;
    let reply: JudgeReply = serde_json::from_value(parsed.value)
        .map_err(|e| format!("reply does not match the judge schema: {e}"))?;

    if !reply.confidence.is_finite() || !(0.0..=1.0).contains(&reply.confidence) {
        return Err(format!("confidence {} outside [0, 1]", reply.confidence));
    }
    if !expected_position_ids.contains(&reply.selected_position_id) {
        return Err(format!(
            "selected position '{}' was not presented",
            reply.selected_position_id
        ));
    }
    for id in expected_position_ids {
        match reply.scores.get(id) {
            None => return Err(format!("position '{id}' was not scored")),
            Some(score) if *score > 100 => {
                return Err(format!("score {score} for '{id}' exceeds 100"))
            }
            Some(_) => {}
        }
    }
    for id in reply.scores.keys() {
        if !expected_position_ids.contains(id) {
            return Err(format!("scored unknown position '{id}'"));
        }
    }
    let reasoning = position::validate_reasoning_text(&reply.reasoning)?.to_string();

    Ok(JudgeEvaluation {
        judge_id: judge_id.to_string(),
        round,
        selected_position_id: Some(reply.selected_position_id),
        scores_by_position_id: reply.scores,
        reasoning,
        confidence: reply.confidence,
        token_usage,
        latency_ms,
        status: ResponseStatus::Ok,
        error: None,
    })
}

/// Render debate history for one participant under a context topology.
pub fn render_history(
    history: &[RoundResult],
    participant_id: &str,
    topology: ContextTopology,
    max_chars: usize,
) -> String {
    let mut lines: Vec<String> = Vec::new();
    let last_round_number = history.last().map(|r| r.round_number);

    for round in history {
        let is_last = Some(round.round_number) == last_round_number;
        for response in &round.responses {
            let is_self = response.agent_id == participant_id;
            let include = match topology {
                ContextTopology::FullHistory => true,
                ContextTopology::LastRound => is_last,
                ContextTopology::LastRoundWithSelf => (is_last && !is_self) || is_self,
                // Rejected at validation; unreachable in a validated config.
                ContextTopology::Summary => is_last,
            };
            if !include {
                continue;
            }
            lines.push(render_response(round.round_number, response));
        }
    }

    if lines.is_empty() {
        return "(no prior responses)".to_string();
    }
    truncate_middle(&lines.join("\n"), max_chars)
}

fn render_response(round_number: u32, response: &AgentResponse) -> String {
    match response.status {
        ResponseStatus::Error => format!(
            "round {} [{}]: no response (error)",
            round_number, response.agent_id
        ),
        ResponseStatus::Ok => {
            let position = match (&response.position_id, response.position_text.is_empty()) {
                (Some(id), false) => format!(" position [{id}]: {}", response.position_text),
                _ => String::new(),
            };
            format!(
                "round {} [{}] vote={} confidence={:.2}{} — {}",
                round_number,
                response.agent_id,
                response.vote,
                response.confidence,
                position,
                response.reasoning
            )
        }
    }
}

/// Elide the middle of an over-budget rendering, preserving head and tail.
fn truncate_middle(text: &str, max_chars: usize) -> String {
    let total: usize = text.chars().count();
    if total <= max_chars {
        return text.to_string();
    }
    let marker_len = TRUNCATION_MARKER.chars().count();
    let keep = max_chars.saturating_sub(marker_len);
    let head_len = keep / 2;
    let tail_len = keep - head_len;

    let head: String = text.chars().take(head_len).collect();
    let tail: String = text
        .chars()
        .skip(total.saturating_sub(tail_len))
        .collect();
    format!("{head}{TRUNCATION_MARKER}{tail}")
}
