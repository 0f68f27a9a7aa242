//! Error taxonomy for routing, dispatch and streaming

use thiserror::Error;

use crate::tool::ToolError;

/// Errors surfaced to callers of the orchestrator.
///
/// `Clone` because a stream's terminal error is handed out again on every
/// `recv` after the stream has failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AgentError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("could not classify request: {0}")]
    ClassificationFailed(String),

    #[error("could not extract task parameters: {0}")]
    ExtractionFailed(String),

    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error("model call failed: {0}")]
    Model(String),

    #[error("stream failed: {0}")]
    Stream(String),

    #[error("{0} timed out")]
    Timeout(String),

    #[error("request cancelled")]
    Cancelled,
}

pub type AgentResult<T> = std::result::Result<T, AgentError>;
