//! Specialist capability model
//!
//! A specialist is a named unit of work with exactly one invocation mode:
//! one-shot (returns a single message) or streaming (returns a stream
//! already in flight). Both are surfaced to callers as a [`StreamReader`].

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::context::RequestContext;
use crate::error::AgentResult;
use crate::pipe::StreamReader;
use crate::types::Message;

/// Name and routing description of a specialist
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentMeta {
    pub name: String,
    pub intended_use: String,
}

impl AgentMeta {
    pub fn new(name: impl Into<String>, intended_use: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            intended_use: intended_use.into(),
        }
    }
}

/// Handler that produces one complete reply
#[async_trait]
pub trait InvokableHandler: Send + Sync {
    async fn invoke(&self, ctx: &RequestContext, messages: &[Message]) -> AgentResult<Message>;
}

/// Handler that produces a stream of reply fragments
#[async_trait]
pub trait StreamableHandler: Send + Sync {
    async fn stream(
        &self,
        ctx: &RequestContext,
        messages: &[Message],
    ) -> AgentResult<StreamReader<Message>>;
}

/// The two invocation modes
#[derive(Clone)]
pub enum SpecialistHandler {
    OneShot(Arc<dyn InvokableHandler>),
    Streaming(Arc<dyn StreamableHandler>),
}

impl std::fmt::Debug for SpecialistHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OneShot(_) => write!(f, "OneShot"),
            Self::Streaming(_) => write!(f, "Streaming"),
        }
    }
}

/// A registered specialist
#[derive(Debug, Clone)]
pub struct Specialist {
    meta: AgentMeta,
    handler: SpecialistHandler,
}

impl Specialist {
    pub fn new(meta: AgentMeta, handler: SpecialistHandler) -> Self {
        Self { meta, handler }
    }

    pub fn one_shot(meta: AgentMeta, handler: impl InvokableHandler + 'static) -> Self {
        Self::new(meta, SpecialistHandler::OneShot(Arc::new(handler)))
    }

    pub fn streaming(meta: AgentMeta, handler: impl StreamableHandler + 'static) -> Self {
        Self::new(meta, SpecialistHandler::Streaming(Arc::new(handler)))
    }

    pub fn meta(&self) -> &AgentMeta {
        &self.meta
    }

    pub fn name(&self) -> &str {
        &self.meta.name
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self.handler, SpecialistHandler::Streaming(_))
    }

    /// Run the specialist. Errors are delivered as the stream's terminal
    /// signal, never as a separate return path.
    pub async fn invoke(
        &self,
        ctx: &RequestContext,
        messages: &[Message],
    ) -> StreamReader<Message> {
        match &self.handler {
            SpecialistHandler::OneShot(handler) => match handler.invoke(ctx, messages).await {
                Ok(reply) => StreamReader::once(reply),
                Err(e) => StreamReader::failed(e),
            },
            SpecialistHandler::Streaming(handler) => match handler.stream(ctx, messages).await {
                Ok(reader) => reader,
                Err(e) => StreamReader::failed(e),
            },
        }
    }
}
