//! Conclave — adversarial multi-model debate orchestration.
//!
//! Agents argue positions on a topic across bounded rounds; when they fail
//! to converge, a judge panel scores the surviving positions and votes. The
//! engine produces a single auditable output document with every round,
//! vote, token-cost accounting, and a final verdict carrying its source and
//! confidence.
//!
//! # Architecture
//!
//! ```text
//! Orchestrator ──► Round Runner ──► Retry Wrapper ──► Model Adapter (LLM)
//!      │                 │
//!      │                 └──► Consensus rules ──► Session state
//!      └──► Checkpoint (canonical JSON + SHA-256/HMAC integrity)
//! ```
//!
//! Rounds are strictly sequential; within a round, participants fan out in
//! parallel under a concurrency bound, and every participant yields exactly
//! one response (recovered into an error response on failure).

pub mod adapter;
pub mod canonical;
pub mod checkpoint;
pub mod config;
pub mod consensus;
pub mod orchestrator;
pub mod output;
pub mod position;
pub mod pricing;
pub mod prompts;
pub mod repair;
pub mod round;
pub mod session;
pub mod types;

/// Engine version stamped into sessions and checkpoints.
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Output and checkpoint format version; checkpoint loads require an exact
/// match.
pub const FORMAT_VERSION: &str = "1.0.0";

// Re-export the types most callers need.
pub use adapter::{AdapterError, AdapterRegistry, CompletionRequest, CompletionResponse, ModelAdapter};
pub use checkpoint::{Checkpoint, CheckpointError};
pub use config::{ContextTopology, DebateConfig, JudgePositionsScope, ModelConfig, Provider};
pub use orchestrator::{exit_code_for, EngineError, Orchestrator};
pub use output::DebateOutput;
pub use session::{DebatePhase, DebateSession};
pub use types::{
    AgentResponse, FinalVerdict, JudgeEvaluation, JudgeRoundResult, ResponseStatus, RoundResult,
    TokenUsage, VerdictSource, Vote, VoteTally,
};
