//! In-memory model and tool fakes for tests

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Notify;

use crate::error::{AgentError, AgentResult};
use crate::pipe::{pipe, StreamReader};
use crate::providers::ChatModel;
use crate::tool::{ToolClient, ToolError, ToolOutput};
use crate::types::Message;

/// One scripted model turn
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    /// A complete reply (streamed as a single fragment)
    Text(String),
    /// A reply streamed in the given fragments
    Fragments(Vec<String>),
    /// Some fragments, then a terminal error
    FailAfter(Vec<String>, AgentError),
    /// The call itself fails
    Error(AgentError),
    /// The call never completes
    Hang,
    /// Some fragments, then the stream stays open until its reader closes
    HangAfter(Vec<String>),
}

impl ScriptedReply {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }

    pub fn fragments<I, S>(fragments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Fragments(fragments.into_iter().map(Into::into).collect())
    }
}

/// Chat model that plays back a fixed script and records every prompt
#[derive(Debug, Default)]
pub struct ScriptedModel {
    replies: Mutex<VecDeque<ScriptedReply>>,
    prompts: Mutex<Vec<Vec<Message>>>,
}

impl ScriptedModel {
    pub fn new(replies: impl IntoIterator<Item = ScriptedReply>) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().collect()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Every prompt received so far, oldest first
    pub fn prompts(&self) -> Vec<Vec<Message>> {
        self.prompts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn remaining(&self) -> usize {
        self.replies
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    fn next(&self, messages: &[Message]) -> AgentResult<ScriptedReply> {
        self.prompts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(messages.to_vec());
        self.replies
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop_front()
            .ok_or_else(|| AgentError::Model("script exhausted".to_string()))
    }
}

#[async_trait]
impl ChatModel for ScriptedModel {
    fn model(&self) -> &str {
        "scripted"
    }

    async fn generate(&self, messages: &[Message]) -> AgentResult<Message> {
        match self.next(messages)? {
            ScriptedReply::Text(text) => Ok(Message::assistant(text)),
            ScriptedReply::Fragments(parts) => Ok(Message::assistant(parts.concat())),
            ScriptedReply::FailAfter(_, err) | ScriptedReply::Error(err) => Err(err),
            ScriptedReply::Hang | ScriptedReply::HangAfter(_) => std::future::pending().await,
        }
    }

    async fn stream(&self, messages: &[Message]) -> AgentResult<StreamReader<Message>> {
        let (parts, terminal) = match self.next(messages)? {
            ScriptedReply::Text(text) => (vec![text], None),
            ScriptedReply::Fragments(parts) => (parts, None),
            ScriptedReply::FailAfter(parts, err) => (parts, Some(err)),
            ScriptedReply::Error(err) => return Err(err),
            ScriptedReply::Hang => std::future::pending().await,
            ScriptedReply::HangAfter(parts) => {
                let (reader, writer) = pipe();
                for part in parts {
                    let _ = writer.send(Message::assistant(part));
                }
                tokio::spawn(async move { writer.closed().await });
                return Ok(reader);
            }
        };

        let (reader, writer) = pipe();
        for part in parts {
            let _ = writer.send(Message::assistant(part));
        }
        match terminal {
            Some(err) => writer.fail(err),
            None => writer.close(),
        }
        Ok(reader)
    }
}

/// Tool client that returns a fixed result and records every call
#[derive(Debug)]
pub struct StaticToolClient {
    result: Result<ToolOutput, ToolError>,
    calls: Mutex<Vec<(String, Value)>>,
}

impl StaticToolClient {
    pub fn new(result: Result<ToolOutput, ToolError>) -> Self {
        Self {
            result,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<(String, Value)> {
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl ToolClient for StaticToolClient {
    async fn call(&self, tool_name: &str, arguments: Value) -> Result<ToolOutput, ToolError> {
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((tool_name.to_string(), arguments));
        self.result.clone()
    }
}

/// Tool client whose calls block until [`GatedToolClient::open`] is called
#[derive(Debug)]
pub struct GatedToolClient {
    inner: StaticToolClient,
    started: Notify,
    gate: Notify,
    done: Notify,
    finished: AtomicUsize,
}

impl GatedToolClient {
    pub fn new(result: Result<ToolOutput, ToolError>) -> Self {
        Self {
            inner: StaticToolClient::new(result),
            started: Notify::new(),
            gate: Notify::new(),
            done: Notify::new(),
            finished: AtomicUsize::new(0),
        }
    }

    /// Resolves once a call has reached the gate
    pub async fn wait_started(&self) {
        self.started.notified().await;
    }

    /// Let one waiting (or the next) call through
    pub fn open(&self) {
        self.gate.notify_one();
    }

    /// Resolves once a call has passed the gate and returned
    pub async fn wait_finished(&self) {
        self.done.notified().await;
    }

    pub fn finished(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<(String, Value)> {
        self.inner.calls()
    }
}

#[async_trait]
impl ToolClient for GatedToolClient {
    async fn call(&self, tool_name: &str, arguments: Value) -> Result<ToolOutput, ToolError> {
        self.started.notify_one();
        self.gate.notified().await;
        let result = self.inner.call(tool_name, arguments).await;
        self.finished.fetch_add(1, Ordering::SeqCst);
        self.done.notify_one();
        result
    }
}
