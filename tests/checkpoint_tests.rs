//! Checkpoint integrity and resume scenarios.
//!
//! A session interrupted after round 2 is persisted, tampered with (load
//! must refuse), restored, and resumed — the orchestrator then runs round 3
//! with the candidate derived from round 2's responses.

use std::sync::Arc;

use chrono::Utc;
use conclave::adapter::mock::MockAdapter;
use conclave::config::{
    ConcurrencyConfig, ContextTopology, DebateConfig, JudgePositionsScope, LimitConfig,
    ModelConfig, ParticipantConfig, Provider, RetryConfig, TimeoutConfig,
};
use conclave::consensus::evaluate_agent_consensus;
use conclave::position::position_id;
use conclave::session::DebateSession;
use conclave::types::{AgentResponse, ResponseStatus, RoundResult, TokenUsage, Vote};
use conclave::{
    exit_code_for, AdapterRegistry, Checkpoint, DebatePhase, EngineError, Orchestrator,
    VerdictSource,
};

const P1: &str = "cache the parse results";
const P2: &str = "reparse on every request";
const P3: &str = "precompute at build time";

fn model_for(id: &str) -> ModelConfig {
    ModelConfig {
        provider: Provider::Mock,
        model: format!("{id}-model"),
        endpoint: None,
        api_key_env: None,
        cli_path: None,
    }
}

fn config(checkpoint_dir: &std::path::Path) -> DebateConfig {
    DebateConfig {
        topic: "how should the service handle template parsing".to_string(),
        initial_query: None,
        agents: ["a1", "a2", "a3"]
            .iter()
            .map(|id| ParticipantConfig {
                id: id.to_string(),
                model: model_for(id),
                system_prompt: None,
                temperature: None,
            })
            .collect(),
        judges: vec![],
        judge_panel_enabled: false,
        max_agent_rounds: 3,
        max_judge_rounds: 1,
        consensus_threshold: 0.67,
        judge_consensus_threshold: 0.6,
        judge_min_confidence: 0.7,
        judge_positions_scope: JudgePositionsScope::AllRounds,
        context_topology: ContextTopology::LastRoundWithSelf,
        checkpoint_dir: Some(checkpoint_dir.to_path_buf()),
        timeouts: TimeoutConfig::default(),
        retries: RetryConfig::default(),
        concurrency: ConcurrencyConfig::default(),
        limits: LimitConfig::default(),
        deterministic_mode: true,
        allow_external_paths: true,
    }
}

fn response(agent_id: &str, round: u32, vote: Vote, text: Option<&str>, confidence: f64) -> AgentResponse {
    let (position_id, position_text) = match text {
        Some(t) => (Some(position_id(t)), t.to_string()),
        None => (None, String::new()),
    };
    AgentResponse {
        agent_id: agent_id.to_string(),
        round,
        position_id,
        position_text,
        reasoning: "recorded during the interrupted run".to_string(),
        vote,
        confidence,
        token_usage: TokenUsage::new(40, 20, 60, true),
        latency_ms: 2,
        status: ResponseStatus::Ok,
        error: None,
    }
}

/// Rebuild the state of a session that got through two rounds without
/// consensus: P1 led round 1 and took 2 of 3 votes in round 2.
fn interrupted_session(config: DebateConfig) -> DebateSession {
    let mut session = DebateSession::new(config);
    session.transition(DebatePhase::AgentDebate).unwrap();

    let round1_responses = vec![
        response("a1", 1, Vote::Abstain, Some(P1), 0.8),
        response("a2", 1, Vote::Abstain, Some(P2), 0.7),
        response("a3", 1, Vote::Abstain, Some(P3), 0.6),
    ];
    let (tally1, _) = evaluate_agent_consensus(&round1_responses, None, None, 0.67);
    session
        .append_agent_round(RoundResult {
            round_number: 1,
            candidate_position_id: None,
            candidate_position_text: None,
            responses: round1_responses,
            consensus_reached: false,
            consensus_position_id: None,
            consensus_position_text: None,
            consensus_method: None,
            vote_tally: tally1,
            timestamp: Utc::now(),
        })
        .unwrap();

    let id1 = position_id(P1);
    let round2_responses = vec![
        response("a1", 2, Vote::Yes, Some(P1), 0.9),
        response("a2", 2, Vote::Yes, Some(P1), 0.8),
        response("a3", 2, Vote::No, Some(P3), 0.6),
    ];
    let (tally2, consensus2) =
        evaluate_agent_consensus(&round2_responses, Some(&id1), Some(P1), 0.67);
    assert!(!consensus2.reached);
    session
        .append_agent_round(RoundResult {
            round_number: 2,
            candidate_position_id: Some(id1),
            candidate_position_text: Some(P1.to_string()),
            responses: round2_responses,
            consensus_reached: false,
            consensus_position_id: None,
            consensus_position_text: None,
            consensus_method: None,
            vote_tally: tally2,
            timestamp: Utc::now(),
        })
        .unwrap();
    session
}

fn yes_reply(target: &str, confidence: f64) -> String {
    serde_json::json!({
        "vote": "yes",
        "targetPositionId": target,
        "reasoning": "round three settles it",
        "confidence": confidence,
    })
    .to_string()
}

#[tokio::test]
async fn scenario_e_tamper_then_resume() {
    let dir = tempfile::tempdir().unwrap();
    let session = interrupted_session(config(dir.path()));
    let session_id = session.id.clone();
    let path = Checkpoint::capture(&session)
        .unwrap()
        .save(dir.path())
        .unwrap();

    // Round-trip law: the restored session matches what was saved.
    let restored = Checkpoint::load(&path).unwrap().into_session();
    assert_eq!(restored.id, session.id);
    assert_eq!(restored.phase, session.phase);
    assert_eq!(
        serde_json::to_value(&restored.agent_rounds).unwrap(),
        serde_json::to_value(&session.agent_rounds).unwrap()
    );

    // Mutate one byte: resume must refuse with an integrity error.
    let pristine = std::fs::read(&path).unwrap();
    let mut tampered = pristine.clone();
    let idx = tampered
        .windows(P1.len())
        .position(|w| w == P1.as_bytes())
        .unwrap();
    tampered[idx] = tampered[idx].wrapping_add(1);
    std::fs::write(&path, &tampered).unwrap();

    let registry = Arc::new(AdapterRegistry::new());
    let err = Orchestrator::resume(&path, registry).unwrap_err();
    assert!(matches!(err, EngineError::Checkpoint(_)));

    // Restore the file; resume runs round 3 with the candidate from round 2.
    std::fs::write(&path, &pristine).unwrap();
    let registry = Arc::new(AdapterRegistry::new());
    let id1 = position_id(P1);
    for (agent, confidence) in [("a1", 0.9), ("a2", 0.8), ("a3", 0.7)] {
        let adapter = Arc::new(MockAdapter::new(&format!("{agent}-model")));
        adapter.push_ok(&yes_reply(&id1, confidence), TokenUsage::new(40, 20, 60, true));
        registry.register(&model_for(agent), adapter);
    }

    let mut orchestrator = Orchestrator::resume(&path, registry).unwrap();
    assert_eq!(orchestrator.session().id, session_id);
    let output = orchestrator.run().await.unwrap();

    assert_eq!(output.agent_debate.rounds.len(), 3);
    let round3 = &output.agent_debate.rounds[2];
    assert_eq!(round3.round_number, 3);
    assert_eq!(round3.candidate_position_id.as_deref(), Some(id1.as_str()));
    assert!(round3.consensus_reached);

    assert_eq!(output.session.id, session_id);
    assert_eq!(output.session.phase, DebatePhase::ConsensusReached);
    assert_eq!(exit_code_for(output.session.phase), 0);
    assert_eq!(output.final_verdict.source, VerdictSource::AgentConsensus);
    assert_eq!(output.final_verdict.position_id.as_deref(), Some(id1.as_str()));
}

#[test]
fn checkpoint_config_hash_tracks_config() {
    let dir = tempfile::tempdir().unwrap();
    let first = Checkpoint::capture(&interrupted_session(config(dir.path()))).unwrap();

    let mut altered = config(dir.path());
    altered.consensus_threshold = 0.8;
    let second = Checkpoint::capture(&interrupted_session(altered)).unwrap();

    assert_ne!(first.config_hash, second.config_hash);
    assert_eq!(first.version, second.version);
}

#[test]
fn checkpoint_path_uses_session_id() {
    let dir = tempfile::tempdir().unwrap();
    let session = interrupted_session(config(dir.path()));
    let path = Checkpoint::capture(&session)
        .unwrap()
        .save(dir.path())
        .unwrap();
    assert_eq!(
        path.file_name().unwrap().to_str().unwrap(),
        format!("{}.checkpoint.json", session.id)
    );
}
