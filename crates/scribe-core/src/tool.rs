//! Capability for calling tools hosted by an external tool server

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Name of the tool that flips one task's completion bit
pub const UPDATE_TASK_STATUS: &str = "update_task_status";

/// Business-rule failure categories reported by a tool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolFailureKind {
    RecordNotFound,
    IndexOutOfRange,
    InvalidArgument,
    MalformedState,
    UnknownTool,
    Internal,
}

impl std::fmt::Display for ToolFailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RecordNotFound => write!(f, "record_not_found"),
            Self::IndexOutOfRange => write!(f, "index_out_of_range"),
            Self::InvalidArgument => write!(f, "invalid_argument"),
            Self::MalformedState => write!(f, "malformed_state"),
            Self::UnknownTool => write!(f, "unknown_tool"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

/// Structured failure returned by a tool (as opposed to a transport failure)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolFailure {
    pub kind: ToolFailureKind,
    pub reason: String,
}

impl ToolFailure {
    pub fn new(kind: ToolFailureKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
        }
    }
}

/// Errors from a tool round trip
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ToolError {
    #[error("connection to tool server failed: {0}")]
    ConnectionFailed(String),

    #[error("tool protocol error: {0}")]
    Protocol(String),

    #[error("tool request timed out after {0:?}")]
    Timeout(Duration),

    #[error("tool error ({}): {}", .0.kind, .0.reason)]
    Rejected(ToolFailure),
}

impl ToolError {
    pub fn rejected(kind: ToolFailureKind, reason: impl Into<String>) -> Self {
        Self::Rejected(ToolFailure::new(kind, reason))
    }

    /// Failure kind if the tool itself rejected the call
    pub fn failure_kind(&self) -> Option<ToolFailureKind> {
        match self {
            Self::Rejected(failure) => Some(failure.kind),
            _ => None,
        }
    }

    /// Whether the session that produced this error can still be used
    pub fn is_transport(&self) -> bool {
        !matches!(self, Self::Rejected(_))
    }
}

/// Successful tool result
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolOutput {
    /// Human-readable text content
    pub text: String,
    /// Machine-readable payload, when the tool provides one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub structured: Option<Value>,
}

/// Trait for anything that can run a named tool with JSON arguments
#[async_trait]
pub trait ToolClient: Send + Sync {
    async fn call(&self, tool_name: &str, arguments: Value) -> Result<ToolOutput, ToolError>;
}
