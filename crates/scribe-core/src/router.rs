//! Intent router
//!
//! Asks a model which registered specialist should handle a conversation.
//! The reply must name a registered specialist; there is no default route.

use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::context::RequestContext;
use crate::error::{AgentError, AgentResult};
use crate::prompts::{HOST_SYSTEM_PROMPT, ROUTE_FORMAT_INSTRUCTION};
use crate::providers::ChatModel;
use crate::specialist::AgentMeta;
use crate::types::{last_user_content, strip_code_fence, Message};

/// Where a request goes and what it carries
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandOffDecision {
    pub target: String,
    pub argument: String,
}

#[derive(Debug, Deserialize)]
struct RouteReply {
    #[serde(alias = "name", alias = "specialist")]
    agent: String,
    #[serde(default)]
    argument: Option<String>,
}

/// Model-backed classifier over a set of specialists
pub struct Router {
    model: Arc<dyn ChatModel>,
    system_prompt: String,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("model", &self.model.model())
            .finish()
    }
}

impl Router {
    pub fn new(model: Arc<dyn ChatModel>) -> Self {
        Self {
            model,
            system_prompt: HOST_SYSTEM_PROMPT.to_string(),
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    /// Pick one specialist for the conversation
    pub async fn route(
        &self,
        ctx: &RequestContext,
        messages: &[Message],
        specialists: &[AgentMeta],
    ) -> AgentResult<HandOffDecision> {
        if specialists.is_empty() {
            return Err(AgentError::ClassificationFailed(
                "no specialists registered".to_string(),
            ));
        }
        if ctx.is_cancelled() {
            return Err(AgentError::Cancelled);
        }

        let mut prompt = Vec::with_capacity(messages.len() + 1);
        prompt.push(Message::system(self.build_system_prompt(specialists)));
        prompt.extend(messages.iter().cloned());

        let reply = tokio::select! {
            biased;
            _ = ctx.cancelled() => return Err(AgentError::Cancelled),
            reply = self.model.generate(&prompt) => reply,
        };

        let reply = reply.map_err(|e| {
            warn!("Routing model call failed: {}", e);
            AgentError::ClassificationFailed(e.to_string())
        })?;
        debug!("Router reply: {}", reply.content);

        parse_decision(&reply.content, specialists, messages)
    }

    fn build_system_prompt(&self, specialists: &[AgentMeta]) -> String {
        let mut prompt = self.system_prompt.trim_end().to_string();
        prompt.push_str("\n\n可用的专家：\n");
        for meta in specialists {
            prompt.push_str(&format!("- {}: {}\n", meta.name, meta.intended_use));
        }
        prompt.push('\n');
        prompt.push_str(ROUTE_FORMAT_INSTRUCTION);
        prompt
    }
}

/// Interpret a routing reply: a JSON object (optionally fenced) or a bare name
fn parse_decision(
    reply: &str,
    specialists: &[AgentMeta],
    messages: &[Message],
) -> AgentResult<HandOffDecision> {
    let body = strip_code_fence(reply);
    let default_argument = || last_user_content(messages).unwrap_or_default().to_string();

    let (target, argument) = match serde_json::from_str::<RouteReply>(body) {
        Ok(parsed) => {
            let argument = parsed
                .argument
                .filter(|a| !a.trim().is_empty())
                .unwrap_or_else(default_argument);
            (parsed.agent.trim().to_string(), argument)
        }
        Err(_) => {
            let bare = body.trim_matches(|c: char| c == '"' || c == '`' || c.is_whitespace());
            if bare.is_empty() || bare.contains(char::is_whitespace) {
                return Err(AgentError::ClassificationFailed(format!(
                    "unrecognised routing reply: {:?}",
                    reply
                )));
            }
            (bare.to_string(), default_argument())
        }
    };

    if !specialists.iter().any(|meta| meta.name == target) {
        return Err(AgentError::ClassificationFailed(format!(
            "unknown specialist '{}'",
            target
        )));
    }

    Ok(HandOffDecision { target, argument })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ScriptedModel, ScriptedReply};

    fn registry() -> Vec<AgentMeta> {
        vec![
            AgentMeta::new("task_management", "task status changes"),
            AgentMeta::new("meeting_chat", "questions about meetings"),
        ]
    }

    #[test]
    fn test_parse_json_reply() {
        let messages = [Message::user("完成会议1的第2个任务")];
        let decision = parse_decision(
            r#"{"agent": "task_management", "argument": "完成会议1的第2个任务"}"#,
            &registry(),
            &messages,
        )
        .unwrap();
        assert_eq!(decision.target, "task_management");
        assert_eq!(decision.argument, "完成会议1的第2个任务");
    }

    #[test]
    fn test_parse_fenced_reply_without_argument() {
        let messages = [Message::user("会议讨论了什么?")];
        let decision = parse_decision(
            "```json\n{\"agent\": \"meeting_chat\"}\n```",
            &registry(),
            &messages,
        )
        .unwrap();
        assert_eq!(decision.target, "meeting_chat");
        assert_eq!(decision.argument, "会议讨论了什么?");
    }

    #[test]
    fn test_parse_bare_name() {
        let decision = parse_decision(" \"meeting_chat\"\n", &registry(), &[]).unwrap();
        assert_eq!(decision.target, "meeting_chat");
        assert_eq!(decision.argument, "");
    }

    #[test]
    fn test_unknown_name_is_classification_failure() {
        let err = parse_decision(r#"{"agent": "weather"}"#, &registry(), &[]).unwrap_err();
        assert!(matches!(err, AgentError::ClassificationFailed(_)));

        let err = parse_decision("I think the chat one", &registry(), &[]).unwrap_err();
        assert!(matches!(err, AgentError::ClassificationFailed(_)));
    }

    #[tokio::test]
    async fn test_route_lists_specialists_in_prompt() {
        let model = Arc::new(ScriptedModel::new([ScriptedReply::text(
            r#"{"agent":"meeting_chat","argument":"总结"}"#,
        )]));
        let router = Router::new(model.clone());
        let ctx = RequestContext::new();

        let decision = router
            .route(&ctx, &[Message::user("总结一下")], &registry())
            .await
            .unwrap();
        assert_eq!(decision.target, "meeting_chat");

        let prompts = model.prompts();
        let system = &prompts[0][0].content;
        assert!(system.contains("- task_management: task status changes"));
        assert!(system.contains("- meeting_chat: questions about meetings"));
        assert_eq!(prompts[0][1], Message::user("总结一下"));
    }

    #[tokio::test]
    async fn test_route_model_error_is_classification_failure() {
        let model = Arc::new(ScriptedModel::new([ScriptedReply::Error(AgentError::Model(
            "503".to_string(),
        ))]));
        let router = Router::new(model);
        let err = router
            .route(&RequestContext::new(), &[Message::user("hi")], &registry())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::ClassificationFailed(_)));
    }

    #[tokio::test]
    async fn test_route_cancelled_while_classifying() {
        let model = Arc::new(ScriptedModel::new([ScriptedReply::Hang]));
        let router = Router::new(model);
        let ctx = RequestContext::new();
        let cancel = ctx.cancellation().clone();
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            cancel.cancel();
        });

        let err = router
            .route(&ctx, &[Message::user("hi")], &registry())
            .await
            .unwrap_err();
        assert_eq!(err, AgentError::Cancelled);
    }
}
