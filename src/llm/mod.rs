// Language-model strategy
//
// Agents depend on one trait; the implementation is picked once at startup
// from config. LiveModel talks to an OpenAI-compatible chat-completions
// endpoint; FixtureModel returns deterministic canned output so the whole
// pipeline runs without a credential. Agent bodies never branch on which
// one they were given.

mod fixture;
mod live;

pub use fixture::FixtureModel;
pub use live::LiveModel;

use async_trait::async_trait;
use serde_json::Value;

use crate::agents::AgentKey;
use crate::error::Result;

/// What the caller is asking the model to do. The fixture implementation
/// dispatches on this; the live implementation only reads the prompts.
#[derive(Debug, Clone)]
pub enum CompletionKind {
    /// First-pass generation for an agent.
    Generate,
    /// Regeneration with critic feedback folded into the user prompt.
    Revise,
    /// Rework an existing deliverable against user feedback.
    Refine { current: Value },
}

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub agent_key: AgentKey,
    pub system: String,
    pub user: String,
    pub model: String,
    pub max_tokens: u32,
    pub kind: CompletionKind,
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Model identifier recorded in run logs ("mock" for the fixture).
    fn model_used(&self) -> String;

    async fn complete(&self, req: CompletionRequest) -> Result<String>;
}
