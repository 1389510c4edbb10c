//! Prompt construction and model reply schemas.
//!
//! The system prompt fixes the participant's identity, the topic, and the
//! JSON contract; the user prompt varies by round. Reply shapes derive
//! `JsonSchema` so the schema hint handed to adapters always matches what
//! the validator expects.

use schemars::{schema_for, JsonSchema};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Wire shape every agent must reply with.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AgentReply {
    /// `yes`, `no`, or `abstain`.
    pub vote: String,
    /// Required for `yes`: must equal the round's candidate position ID.
    #[serde(default)]
    pub target_position_id: Option<String>,
    /// Required for `no` (and for round-1 abstains): the proposed position.
    #[serde(default)]
    pub new_position_text: Option<String>,
    pub reasoning: String,
    /// 0.0 ..= 1.0.
    pub confidence: f64,
}

/// Wire shape every judge must reply with.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct JudgeReply {
    /// The position ID this judge selects as the winner.
    pub selected_position_id: String,
    /// Integer score 0..=100 for every presented position ID.
    pub scores: BTreeMap<String, u8>,
    pub reasoning: String,
    /// 0.0 ..= 1.0.
    pub confidence: f64,
}

/// JSON schema for agent replies, rendered once per process.
pub fn agent_reply_schema() -> String {
    serde_json::to_string_pretty(&schema_for!(AgentReply))
        .expect("schema serialization is infallible")
}

/// JSON schema for judge replies.
pub fn judge_reply_schema() -> String {
    serde_json::to_string_pretty(&schema_for!(JudgeReply))
        .expect("schema serialization is infallible")
}

/// System prompt for an agent.
pub fn agent_system_prompt(
    agent_id: &str,
    topic: &str,
    initial_query: Option<&str>,
    custom_preamble: Option<&str>,
) -> String {
    let mut prompt = String::new();
    if let Some(custom) = custom_preamble {
        prompt.push_str(custom);
        prompt.push_str("\n\n");
    }
    prompt.push_str(&format!(
        "You are debate agent '{agent_id}'. You argue positions on a topic \
         against other agents across bounded rounds.\n\
         Topic: {topic}\n"
    ));
    if let Some(query) = initial_query {
        prompt.push_str(&format!("Context: {query}\n"));
    }
    prompt.push_str(
        "\nRespond with a single JSON object and nothing else. Fields: \
         \"vote\" (yes|no|abstain), \"targetPositionId\" (for yes votes), \
         \"newPositionText\" (for no votes and initial positions), \
         \"reasoning\", and \"confidence\" in [0, 1].",
    );
    prompt
}

/// User prompt for round 1 (and any candidate-less round).
pub fn agent_opening_prompt() -> String {
    "This is an opening round: there is no candidate position yet.\n\
     Set \"vote\" to \"abstain\" and state your initial position in \
     \"newPositionText\", with your reasoning and confidence."
        .to_string()
}

/// User prompt for a voting round (candidate present).
pub fn agent_voting_prompt(
    candidate_id: &str,
    candidate_text: &str,
    history_view: &str,
) -> String {
    let mut prompt = format!(
        "Candidate position [{candidate_id}]:\n{candidate_text}\n\n\
         Debate history:\n{history_view}\n\n\
         Vote on the candidate. To endorse it, set \"vote\" to \"yes\" and \
         \"targetPositionId\" to \"{candidate_id}\" exactly. To reject it, \
         set \"vote\" to \"no\" and propose a better position in \
         \"newPositionText\". To sit out, set \"vote\" to \"abstain\"."
    );
    prompt.push_str("\nAlways include reasoning and confidence.");
    prompt
}

/// System prompt for a judge.
pub fn judge_system_prompt(
    judge_id: &str,
    topic: &str,
    initial_query: Option<&str>,
    custom_preamble: Option<&str>,
) -> String {
    let mut prompt = String::new();
    if let Some(custom) = custom_preamble {
        prompt.push_str(custom);
        prompt.push_str("\n\n");
    }
    prompt.push_str(&format!(
        "You are judge '{judge_id}' on a panel evaluating the surviving \
         positions of a debate that did not converge.\n\
         Topic: {topic}\n"
    ));
    if let Some(query) = initial_query {
        prompt.push_str(&format!("Context: {query}\n"));
    }
    prompt.push_str(
        "\nRespond with a single JSON object and nothing else. Fields: \
         \"selectedPositionId\" (your winner), \"scores\" (an integer 0-100 \
         for EVERY listed position ID), \"reasoning\", and \"confidence\" \
         in [0, 1].",
    );
    prompt
}

/// User prompt presenting the positions set to a judge.
pub fn judge_evaluation_prompt(positions: &[(String, String)]) -> String {
    let mut prompt = String::from("Evaluate these positions:\n\n");
    for (id, text) in positions {
        prompt.push_str(&format!("[{id}]\n{text}\n\n"));
    }
    prompt.push_str(
        "Score every position from 0 to 100, select the strongest as \
         \"selectedPositionId\", and report your confidence.",
    );
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_reply_parses_wire_format() {
        let json = r#"{
            "vote": "yes",
            "targetPositionId": "abc123abc123",
            "reasoning": "strongest case",
            "confidence": 0.8
        }"#;
        let reply: AgentReply = serde_json::from_str(json).unwrap();
        assert_eq!(reply.vote, "yes");
        assert_eq!(reply.target_position_id.as_deref(), Some("abc123abc123"));
        assert!(reply.new_position_text.is_none());
    }

    #[test]
    fn test_judge_reply_parses_wire_format() {
        let json = r#"{
            "selectedPositionId": "abc123abc123",
            "scores": {"abc123abc123": 88, "def456def456": 61},
            "reasoning": "better evidence",
            "confidence": 0.9
        }"#;
        let reply: JudgeReply = serde_json::from_str(json).unwrap();
        assert_eq!(reply.scores.len(), 2);
        assert_eq!(reply.scores["abc123abc123"], 88);
    }

    #[test]
    fn test_schemas_mention_required_fields() {
        let agent_schema = agent_reply_schema();
        assert!(agent_schema.contains("targetPositionId"));
        assert!(agent_schema.contains("newPositionText"));
        let judge_schema = judge_reply_schema();
        assert!(judge_schema.contains("selectedPositionId"));
        assert!(judge_schema.contains("scores"));
    }

    #[test]
    fn test_voting_prompt_carries_candidate_verbatim() {
        let prompt = agent_voting_prompt("deadbeef0123", "Use tabs.", "(empty)");
        assert!(prompt.contains("[deadbeef0123]"));
        assert!(prompt.contains("Use tabs."));
        assert!(prompt.contains("\"targetPositionId\" to \"deadbeef0123\""));
    }

    #[test]
    fn test_system_prompts_carry_identity_and_topic() {
        let prompt = agent_system_prompt("a1", "tabs vs spaces", Some("style wars"), None);
        assert!(prompt.contains("'a1'"));
        assert!(prompt.contains("tabs vs spaces"));
        assert!(prompt.contains("style wars"));

        let custom = agent_system_prompt("a1", "t", None, Some("Be contrarian."));
        assert!(custom.starts_with("Be contrarian."));
    }

    #[test]
    fn test_judge_prompt_lists_all_positions() {
        let positions = vec![
            ("aaa111aaa111".to_string(), "first".to_string()),
            ("bbb222bbb222".to_string(), "second".to_string()),
        ];
        let prompt = judge_evaluation_prompt(&positions);
        assert!(prompt.contains("[aaa111aaa111]"));
        assert!(prompt.contains("[bbb222bbb222]"));
        assert!(prompt.contains("first"));
        assert!(prompt.contains("second"));
    }
}
