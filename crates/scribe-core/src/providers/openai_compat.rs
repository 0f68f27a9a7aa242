//! OpenAI-compatible chat completions transport (Ark, OpenAI, Ollama, ...)

use async_trait::async_trait;
use eventsource_stream::{EventStreamError, Eventsource};
use futures_util::{Stream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{AgentError, AgentResult};
use crate::pipe::{pipe, StreamReader, StreamWriter};
use crate::types::Message;

use super::ChatModel;

/// Longest gap allowed between two chunks of a streamed reply
const STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Chat model reachable over an OpenAI-compatible HTTP API
#[derive(Clone)]
pub struct OpenAiCompatModel {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
    timeout: Duration,
    temperature: Option<f32>,
}

impl std::fmt::Debug for OpenAiCompatModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiCompatModel")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl OpenAiCompatModel {
    /// - `base_url`: the endpoint root, e.g. `https://ark.cn-beijing.volces.com/api/v3`
    pub fn new(api_key: String, base_url: String, model: String) -> AgentResult<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| AgentError::Model(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            timeout: Duration::from_secs(120),
            temperature: None,
        })
    }

    /// Deadline for a non-streaming request
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    fn request_body(&self, messages: &[Message], stream: bool) -> CompletionRequest<'_> {
        CompletionRequest {
            model: &self.model,
            messages: messages
                .iter()
                .map(|m| WireMessage {
                    role: m.role.to_string(),
                    content: m.content.clone(),
                })
                .collect(),
            stream,
            temperature: self.temperature,
        }
    }

    async fn post(
        &self,
        body: &CompletionRequest<'_>,
        timeout: Option<Duration>,
    ) -> AgentResult<reqwest::Response> {
        let url = format!("{}/chat/completions", self.base_url);
        debug!("Sending {} messages to {} ({})", body.messages.len(), url, self.model);

        let mut request = self.client.post(&url).bearer_auth(&self.api_key).json(body);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }

        let response = request.send().await.map_err(map_reqwest_error)?;
        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(AgentError::Model(format!(
                "API request failed with status {}: {}",
                status, error_text
            )));
        }
        Ok(response)
    }
}

#[async_trait]
impl ChatModel for OpenAiCompatModel {
    fn model(&self) -> &str {
        &self.model
    }

    async fn generate(&self, messages: &[Message]) -> AgentResult<Message> {
        let body = self.request_body(messages, false);
        let response = self.post(&body, Some(self.timeout)).await?;

        let completion: CompletionResponse = response.json().await.map_err(map_reqwest_error)?;
        let content = completion
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| AgentError::Model("response contained no choices".to_string()))?;

        Ok(Message::assistant(content))
    }

    async fn stream(&self, messages: &[Message]) -> AgentResult<StreamReader<Message>> {
        let body = self.request_body(messages, true);
        let response = self.post(&body, None).await?;

        let (reader, writer) = pipe();
        tokio::spawn(relay_events(response.bytes_stream(), writer, map_reqwest_error));

        Ok(reader)
    }
}

fn map_reqwest_error(e: reqwest::Error) -> AgentError {
    if e.is_timeout() {
        AgentError::Timeout("model request".to_string())
    } else {
        AgentError::Model(e.to_string())
    }
}

/// Decode a server-sent-events body into message fragments. Events are only
/// decoded once complete, so characters split across chunks arrive intact.
async fn relay_events<S, B, E>(
    chunks: S,
    writer: StreamWriter<Message>,
    map_transport: fn(E) -> AgentError,
) where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let events = chunks.eventsource();
    tokio::pin!(events);

    loop {
        let next = tokio::select! {
            _ = writer.closed() => {
                debug!("Stream reader closed, dropping model response");
                return;
            }
            next = tokio::time::timeout(STREAM_IDLE_TIMEOUT, events.next()) => next,
        };

        let event = match next {
            Err(_) => {
                writer.fail(AgentError::Timeout("model stream".to_string()));
                return;
            }
            Ok(None) => return,
            Ok(Some(Err(EventStreamError::Transport(e)))) => {
                writer.fail(map_transport(e));
                return;
            }
            Ok(Some(Err(e))) => {
                writer.fail(AgentError::Stream(e.to_string()));
                return;
            }
            Ok(Some(Ok(event))) => event,
        };

        match parse_sse_data(&event.data) {
            Ok(SseEvent::Delta(text)) => {
                if writer.send(Message::assistant(text)).is_err() {
                    return;
                }
            }
            Ok(SseEvent::Done) => return,
            Ok(SseEvent::Skip) => {}
            Err(e) => {
                warn!("Malformed stream chunk: {}", e);
                writer.fail(e);
                return;
            }
        }
    }
}

/// Payload of one server-sent event
#[derive(Debug, PartialEq, Eq)]
enum SseEvent {
    Delta(String),
    Done,
    Skip,
}

fn parse_sse_data(data: &str) -> AgentResult<SseEvent> {
    let data = data.trim();
    if data.is_empty() {
        return Ok(SseEvent::Skip);
    }
    if data == "[DONE]" {
        return Ok(SseEvent::Done);
    }

    let chunk: StreamChunk = serde_json::from_str(data)
        .map_err(|e| AgentError::Stream(format!("invalid chunk {:?}: {}", data, e)))?;
    let text = chunk
        .choices
        .into_iter()
        .filter_map(|c| c.delta.content)
        .collect::<String>();

    if text.is_empty() {
        Ok(SseEvent::Skip)
    } else {
        Ok(SseEvent::Delta(text))
    }
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}
