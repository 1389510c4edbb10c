//! Consensus rules — agent supermajority, candidate selection, judge majority.
//!
//! Every rule here is deterministic given the *set* of responses: tallies
//! are arithmetic, and all sort-based selections break ties lexicographically
//! on position ID, so arrival order never changes an outcome. Confidence
//! sums are computed over sorted values to keep floating-point results
//! order-independent.

use std::collections::BTreeMap;

use crate::types::{
    AgentResponse, ConsensusMethod, JudgeDissent, JudgeEvaluation, Vote, VoteTally,
};

/// Agent-phase consensus decision for one round.
#[derive(Debug, Clone)]
pub struct AgentConsensus {
    pub reached: bool,
    pub position_id: Option<String>,
    pub position_text: Option<String>,
    pub method: Option<ConsensusMethod>,
}

impl AgentConsensus {
    fn not_reached() -> Self {
        Self {
            reached: false,
            position_id: None,
            position_text: None,
            method: None,
        }
    }
}

/// Evaluate the agent tally rule for a round.
///
/// `yes` is counted only from eligible responses whose position matches the
/// candidate; `no` from eligible responses; `abstain` from every response
/// (error responses always carry `abstain`, so `total` equals the number of
/// participants). With no candidate or an empty voting total, consensus is
/// never reached.
pub fn evaluate_agent_consensus(
    responses: &[AgentResponse],
    candidate_id: Option<&str>,
    candidate_text: Option<&str>,
    threshold: f64,
) -> (VoteTally, AgentConsensus) {
    let eligible = responses.iter().filter(|r| r.is_eligible()).count() as u32;

    let yes = responses
        .iter()
        .filter(|r| {
            r.is_eligible()
                && r.vote == Vote::Yes
                && candidate_id.is_some()
                && r.position_id.as_deref() == candidate_id
        })
        .count() as u32;
    let no = responses
        .iter()
        .filter(|r| r.is_eligible() && r.vote == Vote::No)
        .count() as u32;
    let abstain = responses.iter().filter(|r| r.vote == Vote::Abstain).count() as u32;

    let voting_total = yes + no;
    let supermajority_threshold = ceil_fraction(voting_total, threshold);
    let supermajority_reached =
        candidate_id.is_some() && voting_total > 0 && yes >= supermajority_threshold;

    let tally = VoteTally {
        yes,
        no,
        abstain,
        total: yes + no + abstain,
        eligible,
        voting_total,
        supermajority_threshold,
        supermajority_reached,
    };

    if !supermajority_reached {
        return (tally, AgentConsensus::not_reached());
    }

    let method = if yes == voting_total {
        ConsensusMethod::Unanimous
    } else {
        ConsensusMethod::Supermajority
    };
    // Prefer the text carried by a yes-voter; fall back to the candidate's.
    let position_text = responses
        .iter()
        .find(|r| r.is_eligible() && r.vote == Vote::Yes && r.position_id.as_deref() == candidate_id)
        .map(|r| r.position_text.clone())
        .or_else(|| candidate_text.map(str::to_string));

    let consensus = AgentConsensus {
        reached: true,
        position_id: candidate_id.map(str::to_string),
        position_text,
        method: Some(method),
    };
    (tally, consensus)
}

/// Mean confidence across yes-voters on the candidate.
///
/// Returns `None` when there are no yes-voters; callers that have already
/// observed consensus treat that as an invariant violation.
pub fn mean_yes_confidence(responses: &[AgentResponse], candidate_id: &str) -> Option<f64> {
    let confidences: Vec<f64> = responses
        .iter()
        .filter(|r| {
            r.is_eligible() && r.vote == Vote::Yes && r.position_id.as_deref() == Some(candidate_id)
        })
        .map(|r| r.confidence)
        .collect();
    if confidences.is_empty() {
        None
    } else {
        Some(ordered_sum(&confidences) / confidences.len() as f64)
    }
}

/// One position's standing in candidate selection.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateScore {
    pub position_id: String,
    pub position_text: String,
    /// Σ confidence over the position's supporters.
    pub support_score: f64,
    pub supporter_count: u32,
}

/// Score every position carried by eligible responses, best first.
///
/// Ordering: support score descending, supporter count descending, position
/// ID ascending. Round-1 responses all vote `abstain` by protocol yet carry
/// the initial positions, so a response is score-bearing whenever it holds a
/// position — not merely when its vote is non-abstain.
pub fn score_positions(responses: &[AgentResponse]) -> Vec<CandidateScore> {
    let mut groups: BTreeMap<String, (Vec<f64>, String)> = BTreeMap::new();
    for response in responses {
        if !response.is_eligible() || response.position_text.is_empty() {
            continue;
        }
        let Some(id) = &response.position_id else {
            continue;
        };
        let entry = groups
            .entry(id.clone())
            .or_insert_with(|| (Vec::new(), response.position_text.clone()));
        entry.0.push(response.confidence);
        // Deterministic text choice regardless of response order.
        if response.position_text < entry.1 {
            entry.1 = response.position_text.clone();
        }
    }

    let mut scores: Vec<CandidateScore> = groups
        .into_iter()
        .map(|(position_id, (confidences, position_text))| CandidateScore {
            position_id,
            position_text,
            support_score: ordered_sum(&confidences),
            supporter_count: confidences.len() as u32,
        })
        .collect();

    scores.sort_by(|a, b| {
        b.support_score
            .total_cmp(&a.support_score)
            .then_with(|| b.supporter_count.cmp(&a.supporter_count))
            .then_with(|| a.position_id.cmp(&b.position_id))
    });
    scores
}

/// Select the next round's candidate from the previous round's responses.
///
/// Returns `None` when no eligible response carries a position; the next
/// round then runs candidate-less, exactly like round 1.
pub fn select_candidate(responses: &[AgentResponse]) -> Option<(String, String)> {
    score_positions(responses)
        .into_iter()
        .next()
        .map(|s| (s.position_id, s.position_text))
}

/// Judge-phase consensus decision.
#[derive(Debug, Clone)]
pub struct JudgeConsensus {
    pub reached: bool,
    /// Plurality winner, reported even when consensus was not reached.
    pub position_id: Option<String>,
    /// Mean confidence of the winner's voters (0 when the vote count fell
    /// short of the majority requirement).
    pub confidence: f64,
    pub dissents: Vec<JudgeDissent>,
    pub votes_for_winner: u32,
    pub required_votes: u32,
}

impl JudgeConsensus {
    fn empty() -> Self {
        Self {
            reached: false,
            position_id: None,
            confidence: 0.0,
            dissents: Vec::new(),
            votes_for_winner: 0,
            required_votes: 0,
        }
    }
}

/// Evaluate judge majority + confidence-floor rule for one judge round.
pub fn evaluate_judge_consensus(
    evaluations: &[JudgeEvaluation],
    majority_threshold: f64,
    min_confidence: f64,
) -> JudgeConsensus {
    let eligible: Vec<&JudgeEvaluation> =
        evaluations.iter().filter(|e| e.is_eligible()).collect();
    if eligible.is_empty() {
        return JudgeConsensus::empty();
    }

    let required_votes = ceil_fraction(eligible.len() as u32, majority_threshold);

    // Votes and voter confidences per position, keyed lexicographically so
    // the plurality scan is deterministic.
    let mut ballots: BTreeMap<&str, Vec<f64>> = BTreeMap::new();
    for eval in &eligible {
        let id = eval.selected_position_id.as_deref().expect("eligible implies selected");
        ballots.entry(id).or_default().push(eval.confidence);
    }

    let mut winner: Option<(&str, u32, f64)> = None;
    for (&id, confidences) in &ballots {
        let votes = confidences.len() as u32;
        let mean = ordered_sum(confidences) / confidences.len() as f64;
        let better = match winner {
            None => true,
            Some((_, best_votes, best_mean)) => {
                votes > best_votes || (votes == best_votes && mean > best_mean)
            }
        };
        if better {
            winner = Some((id, votes, mean));
        }
    }
    let (winner_id, votes_for_winner, winner_mean) =
        winner.expect("non-empty ballots always yield a winner");

    let dissents: Vec<JudgeDissent> = eligible
        .iter()
        .filter(|e| e.selected_position_id.as_deref() != Some(winner_id))
        .map(|e| JudgeDissent {
            judge_id: e.judge_id.clone(),
            selected_position_id: e
                .selected_position_id
                .clone()
                .expect("eligible implies selected"),
            confidence: e.confidence,
        })
        .collect();

    if votes_for_winner < required_votes {
        return JudgeConsensus {
            reached: false,
            position_id: Some(winner_id.to_string()),
            confidence: 0.0,
            dissents,
            votes_for_winner,
            required_votes,
        };
    }

    if winner_mean < min_confidence {
        return JudgeConsensus {
            reached: false,
            position_id: Some(winner_id.to_string()),
            confidence: winner_mean,
            dissents,
            votes_for_winner,
            required_votes,
        };
    }

    JudgeConsensus {
        reached: true,
        position_id: Some(winner_id.to_string()),
        confidence: winner_mean,
        dissents,
        votes_for_winner,
        required_votes,
    }
}

/// `ceil(count * fraction)` without float drift at representable fractions.
fn ceil_fraction(count: u32, fraction: f64) -> u32 {
    (count as f64 * fraction).ceil() as u32
}

/// Order-independent sum: sort by total order first so shuffled inputs
/// produce bit-identical floating-point results.
fn ordered_sum(values: &[f64]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    sorted.iter().sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::position::position_id;
    use crate::types::{ResponseStatus, TokenUsage};

    fn response(
        agent_id: &str,
        vote: Vote,
        text: &str,
        confidence: f64,
    ) -> AgentResponse {
        let trimmed = text.trim();
        AgentResponse {
            agent_id: agent_id.to_string(),
            round: 2,
            position_id: if trimmed.is_empty() {
                None
            } else {
                Some(position_id(trimmed))
            },
            position_text: trimmed.to_string(),
            reasoning: "because".to_string(),
            vote,
            confidence,
            token_usage: TokenUsage::new(10, 10, 20, true),
            latency_ms: 5,
            status: ResponseStatus::Ok,
            error: None,
        }
    }

    fn evaluation(judge_id: &str, selected: Option<&str>, confidence: f64) -> JudgeEvaluation {
        JudgeEvaluation {
            judge_id: judge_id.to_string(),
            round: 1,
            selected_position_id: selected.map(str::to_string),
            scores_by_position_id: Default::default(),
            reasoning: String::new(),
            confidence,
            token_usage: TokenUsage::zero(),
            latency_ms: 1,
            status: ResponseStatus::Ok,
            error: None,
        }
    }

    // ── Agent tally ────────────────────────────────────────────────────

    #[test]
    fn test_supermajority_reached() {
        let candidate = "use tabs for indentation";
        let id = position_id(candidate);
        let responses = vec![
            response("a1", Vote::Yes, candidate, 0.9),
            response("a2", Vote::Yes, candidate, 0.8),
            response("a3", Vote::No, "use spaces", 0.7),
        ];
        let (tally, consensus) =
            evaluate_agent_consensus(&responses, Some(&id), Some(candidate), 0.6);
        assert_eq!(tally.yes, 2);
        assert_eq!(tally.no, 1);
        assert_eq!(tally.voting_total, 3);
        assert_eq!(tally.supermajority_threshold, 2);
        assert!(consensus.reached);
        assert_eq!(consensus.method, Some(ConsensusMethod::Supermajority));
        assert_eq!(consensus.position_id.as_deref(), Some(id.as_str()));
    }

    #[test]
    fn test_unanimous_method() {
        let candidate = "the answer";
        let id = position_id(candidate);
        let responses = vec![
            response("a1", Vote::Yes, candidate, 0.9),
            response("a2", Vote::Yes, candidate, 0.7),
        ];
        let (_, consensus) =
            evaluate_agent_consensus(&responses, Some(&id), Some(candidate), 0.67);
        assert_eq!(consensus.method, Some(ConsensusMethod::Unanimous));
    }

    #[test]
    fn test_unanimity_threshold_requires_all() {
        let candidate = "the answer";
        let id = position_id(candidate);
        let responses = vec![
            response("a1", Vote::Yes, candidate, 0.9),
            response("a2", Vote::Yes, candidate, 0.9),
            response("a3", Vote::No, "other", 0.9),
        ];
        let (tally, consensus) =
            evaluate_agent_consensus(&responses, Some(&id), Some(candidate), 1.0);
        assert_eq!(tally.supermajority_threshold, 3);
        assert!(!consensus.reached);
    }

    #[test]
    fn test_no_candidate_never_reached() {
        let responses = vec![
            response("a1", Vote::Abstain, "p1", 0.9),
            response("a2", Vote::Abstain, "p2", 0.9),
        ];
        let (tally, consensus) = evaluate_agent_consensus(&responses, None, None, 0.5);
        assert_eq!(tally.voting_total, 0);
        assert!(!tally.supermajority_reached);
        assert!(!consensus.reached);
    }

    #[test]
    fn test_all_abstain_never_reached() {
        let candidate = "c";
        let id = position_id(candidate);
        let responses = vec![
            response("a1", Vote::Abstain, "", 0.0),
            response("a2", Vote::Abstain, "", 0.0),
        ];
        let (tally, consensus) =
            evaluate_agent_consensus(&responses, Some(&id), Some(candidate), 0.5);
        assert_eq!(tally.voting_total, 0);
        assert!(!consensus.reached);
    }

    #[test]
    fn test_error_responses_count_as_abstain() {
        let candidate = "keep it";
        let id = position_id(candidate);
        let responses = vec![
            response("a1", Vote::Yes, candidate, 0.9),
            response("a2", Vote::Yes, candidate, 0.8),
            AgentResponse::error("a3", 2, "timeout"),
        ];
        let (tally, consensus) =
            evaluate_agent_consensus(&responses, Some(&id), Some(candidate), 0.67);
        assert_eq!(tally.total, 3);
        assert_eq!(tally.abstain, 1);
        assert_eq!(tally.eligible, 2);
        assert_eq!(tally.voting_total, 2);
        assert!(tally.voting_total <= tally.eligible);
        assert!(consensus.reached);
    }

    #[test]
    fn test_tally_arithmetic_invariants() {
        let candidate = "x";
        let id = position_id(candidate);
        let responses = vec![
            response("a1", Vote::Yes, candidate, 0.5),
            response("a2", Vote::No, "y", 0.5),
            response("a3", Vote::Abstain, "", 0.0),
            AgentResponse::error("a4", 2, "boom"),
        ];
        let (tally, _) = evaluate_agent_consensus(&responses, Some(&id), Some(candidate), 0.67);
        assert_eq!(tally.total, tally.yes + tally.no + tally.abstain);
        assert_eq!(tally.total, responses.len() as u32);
        assert_eq!(tally.voting_total, tally.yes + tally.no);
        assert!(tally.voting_total <= tally.eligible);
    }

    #[test]
    fn test_mean_yes_confidence() {
        let candidate = "z";
        let id = position_id(candidate);
        let responses = vec![
            response("a1", Vote::Yes, candidate, 0.9),
            response("a2", Vote::Yes, candidate, 0.6),
            response("a3", Vote::No, "other", 1.0),
        ];
        let mean = mean_yes_confidence(&responses, &id).unwrap();
        assert!((mean - 0.75).abs() < 1e-12);
        assert!(mean_yes_confidence(&responses, "ffffffffffff").is_none());
    }

    // ── Candidate selection ────────────────────────────────────────────

    #[test]
    fn test_selection_by_support_score() {
        let responses = vec![
            response("a1", Vote::Abstain, "position alpha", 0.8),
            response("a2", Vote::Abstain, "position beta", 0.7),
            response("a3", Vote::Abstain, "position gamma", 0.6),
        ];
        let (id, text) = select_candidate(&responses).unwrap();
        assert_eq!(id, position_id("position alpha"));
        assert_eq!(text, "position alpha");
    }

    #[test]
    fn test_selection_supporter_count_breaks_score_tie() {
        // alpha: one supporter at 0.8; beta: two supporters at 0.4 each.
        let responses = vec![
            response("a1", Vote::Abstain, "alpha", 0.8),
            response("a2", Vote::Abstain, "beta", 0.4),
            response("a3", Vote::Abstain, "beta", 0.4),
        ];
        let (id, _) = select_candidate(&responses).unwrap();
        assert_eq!(id, position_id("beta"));
    }

    #[test]
    fn test_selection_lexicographic_final_tiebreak() {
        let responses = vec![
            response("a1", Vote::Abstain, "first option", 0.5),
            response("a2", Vote::Abstain, "second option", 0.5),
        ];
        let (id, _) = select_candidate(&responses).unwrap();
        let expected = position_id("first option").min(position_id("second option"));
        assert_eq!(id, expected);
    }

    #[test]
    fn test_selection_order_independent() {
        let mut responses = vec![
            response("a1", Vote::Yes, "alpha", 0.31),
            response("a2", Vote::No, "beta", 0.42),
            response("a3", Vote::No, "gamma", 0.17),
            response("a4", Vote::Yes, "alpha", 0.11),
            AgentResponse::error("a5", 2, "down"),
        ];
        let baseline = select_candidate(&responses);
        // Rotate through every cyclic permutation.
        for _ in 0..responses.len() {
            responses.rotate_left(1);
            assert_eq!(select_candidate(&responses), baseline);
        }
    }

    #[test]
    fn test_selection_ignores_errors_and_positionless() {
        let responses = vec![
            AgentResponse::error("a1", 2, "x"),
            response("a2", Vote::Abstain, "", 0.9),
        ];
        assert!(select_candidate(&responses).is_none());
    }

    // ── Judge consensus ────────────────────────────────────────────────

    #[test]
    fn test_judge_majority_reached() {
        // Scenario B shape: A, A, B at 0.9 / 0.8 / 0.7.
        let evals = vec![
            evaluation("j1", Some("aaa111aaa111"), 0.9),
            evaluation("j2", Some("aaa111aaa111"), 0.8),
            evaluation("j3", Some("bbb222bbb222"), 0.7),
        ];
        let result = evaluate_judge_consensus(&evals, 0.6, 0.7);
        assert!(result.reached);
        assert_eq!(result.position_id.as_deref(), Some("aaa111aaa111"));
        assert_eq!(result.required_votes, 2);
        assert_eq!(result.votes_for_winner, 2);
        assert!((result.confidence - 0.85).abs() < 1e-12);
        assert_eq!(result.dissents.len(), 1);
        assert_eq!(result.dissents[0].judge_id, "j3");
    }

    #[test]
    fn test_judge_confidence_floor_blocks() {
        // Scenario C shape: A, B, A at 0.6 / 0.6 / 0.5 → mean(A) = 0.55 < 0.7.
        let evals = vec![
            evaluation("j1", Some("aaa111aaa111"), 0.6),
            evaluation("j2", Some("bbb222bbb222"), 0.6),
            evaluation("j3", Some("aaa111aaa111"), 0.5),
        ];
        let result = evaluate_judge_consensus(&evals, 0.6, 0.7);
        assert!(!result.reached);
        assert_eq!(result.position_id.as_deref(), Some("aaa111aaa111"));
        assert!((result.confidence - 0.55).abs() < 1e-12);
    }

    #[test]
    fn test_judge_plurality_below_majority() {
        let evals = vec![
            evaluation("j1", Some("aaa"), 0.9),
            evaluation("j2", Some("bbb"), 0.9),
            evaluation("j3", Some("ccc"), 0.9),
        ];
        let result = evaluate_judge_consensus(&evals, 0.6, 0.5);
        assert!(!result.reached);
        assert_eq!(result.confidence, 0.0);
        assert_eq!(result.required_votes, 2);
        assert_eq!(result.votes_for_winner, 1);
        // Plurality tie resolved by mean confidence, then lexicographic ID.
        assert_eq!(result.position_id.as_deref(), Some("aaa"));
        assert_eq!(result.dissents.len(), 2);
    }

    #[test]
    fn test_judge_tie_broken_by_mean_confidence() {
        let evals = vec![
            evaluation("j1", Some("aaa"), 0.5),
            evaluation("j2", Some("aaa"), 0.5),
            evaluation("j3", Some("zzz"), 0.9),
            evaluation("j4", Some("zzz"), 0.9),
        ];
        let result = evaluate_judge_consensus(&evals, 0.5, 0.0);
        assert_eq!(result.position_id.as_deref(), Some("zzz"));
        assert!(result.reached);
    }

    #[test]
    fn test_judge_errors_excluded_from_eligible() {
        let mut failed = evaluation("j3", None, 0.0);
        failed.status = ResponseStatus::Error;
        let evals = vec![
            evaluation("j1", Some("aaa"), 0.9),
            evaluation("j2", Some("aaa"), 0.9),
            failed,
        ];
        // eligible = 2 → required = ceil(2 * 0.6) = 2.
        let result = evaluate_judge_consensus(&evals, 0.6, 0.7);
        assert_eq!(result.required_votes, 2);
        assert!(result.reached);
    }

    #[test]
    fn test_judge_no_eligible_evaluations() {
        let result = evaluate_judge_consensus(&[], 0.6, 0.7);
        assert!(!result.reached);
        assert!(result.position_id.is_none());
    }

    #[test]
    fn test_ceil_fraction_boundaries() {
        assert_eq!(ceil_fraction(3, 0.67), 3);
        assert_eq!(ceil_fraction(3, 0.6), 2);
        assert_eq!(ceil_fraction(4, 0.5), 2);
        assert_eq!(ceil_fraction(0, 0.9), 0);
        assert_eq!(ceil_fraction(3, 1.0), 3);
    }
}
