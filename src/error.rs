// Error taxonomy for the pipeline
//
// Four user-visible classes map straight onto HTTP statuses: NotFound
// (404), IllegalTransition (400), AgentFailed (500), everything else
// (500). No state is mutated before an IllegalTransition or NotFound is
// raised.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CaseworkError {
    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("{0}")]
    IllegalTransition(String),

    #[error("Agent failed: {0}")]
    AgentFailed(String),

    #[error("failed to parse model output: {0}")]
    Parse(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("llm transport error: {0}")]
    Transport(String),

    #[error("{0}")]
    Invalid(String),
}

impl CaseworkError {
    /// Wrap any in-flight agent error for the caller, preserving retriability
    /// semantics: the step is marked failed and can be re-run.
    pub fn agent_failed(err: impl std::fmt::Display) -> Self {
        CaseworkError::AgentFailed(err.to_string())
    }
}

pub type Result<T, E = CaseworkError> = std::result::Result<T, E>;
