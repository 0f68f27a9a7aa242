//! Model transport abstraction
//!
//! The router and the specialists talk to a language model through the
//! [`ChatModel`] trait. [`OpenAiCompatModel`] speaks the OpenAI chat
//! completions format, which covers Ark, OpenAI, Ollama and similar
//! endpoints.

pub mod openai_compat;

use async_trait::async_trait;

use crate::error::AgentResult;
use crate::pipe::StreamReader;
use crate::types::Message;

pub use openai_compat::OpenAiCompatModel;

/// Trait that all model transports implement
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Model identifier (e.g. "doubao-pro-32k", "gpt-4o")
    fn model(&self) -> &str;

    /// One complete reply
    async fn generate(&self, messages: &[Message]) -> AgentResult<Message>;

    /// Reply as a stream of fragments. Transports without native streaming
    /// deliver the whole reply as a single fragment.
    async fn stream(&self, messages: &[Message]) -> AgentResult<StreamReader<Message>> {
        Ok(StreamReader::once(self.generate(messages).await?))
    }
}
