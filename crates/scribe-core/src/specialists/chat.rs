//! Meeting chat specialist: answers questions about meeting content as a
//! stream of fragments.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::context::RequestContext;
use crate::error::{AgentError, AgentResult};
use crate::pipe::{pipe, RecvError, StreamReader};
use crate::prompts::{MEETING_CHAT, MEETING_CHAT_PROMPT, MEETING_CHAT_USE};
use crate::providers::ChatModel;
use crate::specialist::{AgentMeta, Specialist, StreamableHandler};
use crate::types::Message;

pub struct MeetingChatSpecialist {
    model: Arc<dyn ChatModel>,
    system_prompt: String,
}

impl MeetingChatSpecialist {
    pub fn new(model: Arc<dyn ChatModel>) -> Self {
        Self {
            model,
            system_prompt: MEETING_CHAT_PROMPT.to_string(),
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn meta() -> AgentMeta {
        AgentMeta::new(MEETING_CHAT, MEETING_CHAT_USE)
    }

    pub fn into_specialist(self) -> Specialist {
        Specialist::streaming(Self::meta(), self)
    }
}

enum Step {
    Fragment(Message),
    Done,
    Upstream(AgentError),
    Cancelled,
    ReaderGone,
}

#[async_trait]
impl StreamableHandler for MeetingChatSpecialist {
    async fn stream(
        &self,
        ctx: &RequestContext,
        messages: &[Message],
    ) -> AgentResult<StreamReader<Message>> {
        let mut prompt = Vec::with_capacity(messages.len() + 1);
        prompt.push(Message::system(self.system_prompt.as_str()));
        prompt.extend(messages.iter().cloned());

        let mut upstream = tokio::select! {
            biased;
            _ = ctx.cancelled() => return Err(AgentError::Cancelled),
            upstream = self.model.stream(&prompt) => upstream?,
        };

        let (reader, writer) = pipe();
        let cancel = ctx.cancellation().clone();
        let request_id = ctx.request_id().to_string();

        tokio::spawn(async move {
            let mut relayed = 0usize;
            loop {
                let step = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Step::Cancelled,
                    _ = writer.closed() => Step::ReaderGone,
                    next = upstream.recv() => match next {
                        Ok(fragment) => Step::Fragment(Message::assistant(fragment.content)),
                        Err(RecvError::EndOfStream) => Step::Done,
                        Err(RecvError::Failed(e)) => Step::Upstream(e),
                    },
                };

                match step {
                    Step::Fragment(message) => {
                        if writer.send(message).is_err() {
                            upstream.close();
                            return;
                        }
                        relayed += 1;
                    }
                    Step::Done => {
                        debug!(
                            request_id = %request_id,
                            "Chat stream finished after {} fragments", relayed
                        );
                        writer.close();
                        return;
                    }
                    Step::Upstream(e) => {
                        warn!(
                            request_id = %request_id,
                            "Chat stream failed after {} fragments: {}", relayed, e
                        );
                        writer.fail(e);
                        return;
                    }
                    Step::Cancelled => {
                        debug!(request_id = %request_id, "Chat stream cancelled");
                        upstream.close();
                        writer.fail(AgentError::Cancelled);
                        return;
                    }
                    Step::ReaderGone => {
                        debug!(request_id = %request_id, "Chat stream reader closed");
                        upstream.close();
                        return;
                    }
                }
            }
        });

        Ok(reader)
    }
}
