//! Task management specialist
//!
//! Extracts `{meeting_id, task_index, status}` from the user's request with
//! a model call, then flips the task's completion bit through the
//! `update_task_status` tool.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::context::RequestContext;
use crate::error::{AgentError, AgentResult};
use crate::prompts::{TASK_EXTRACTION_PROMPT, TASK_MANAGEMENT, TASK_MANAGEMENT_USE};
use crate::providers::ChatModel;
use crate::specialist::{AgentMeta, InvokableHandler, Specialist};
use crate::tool::{ToolClient, ToolError, ToolOutput, UPDATE_TASK_STATUS};
use crate::types::{last_user_content, strip_code_fence, Message};

/// Parameters extracted from a task request. Values are passed to the tool
/// verbatim; the tool server validates them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskAction {
    #[serde(deserialize_with = "lenient_string")]
    pub meeting_id: String,
    #[serde(deserialize_with = "lenient_string")]
    pub task_index: String,
    #[serde(deserialize_with = "lenient_string")]
    pub status: String,
}

impl TaskAction {
    pub fn marks_complete(&self) -> bool {
        self.status.trim().eq_ignore_ascii_case("true")
    }

    fn arguments(&self) -> Value {
        json!({
            "meeting_id": self.meeting_id,
            "task_index": self.task_index,
            "status": self.status,
        })
    }
}

/// Accept `"1"`, `1` or `true` alike; models are not consistent about quoting
fn lenient_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string, number or boolean, got {}",
            other
        ))),
    }
}

pub struct TaskManagementSpecialist {
    model: Arc<dyn ChatModel>,
    tools: Arc<dyn ToolClient>,
    system_prompt: String,
}

impl TaskManagementSpecialist {
    pub fn new(model: Arc<dyn ChatModel>, tools: Arc<dyn ToolClient>) -> Self {
        Self {
            model,
            tools,
            system_prompt: TASK_EXTRACTION_PROMPT.to_string(),
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn meta() -> AgentMeta {
        AgentMeta::new(TASK_MANAGEMENT, TASK_MANAGEMENT_USE)
    }

    pub fn into_specialist(self) -> Specialist {
        Specialist::one_shot(Self::meta(), self)
    }

    async fn extract(&self, ctx: &RequestContext, messages: &[Message]) -> AgentResult<TaskAction> {
        let request = last_user_content(messages)
            .ok_or_else(|| AgentError::ExtractionFailed("no user message".to_string()))?;
        let prompt = [Message::system(self.system_prompt.as_str()), Message::user(request)];

        let reply = tokio::select! {
            biased;
            _ = ctx.cancelled() => return Err(AgentError::Cancelled),
            reply = self.model.generate(&prompt) => reply,
        };
        let reply = reply.map_err(|e| AgentError::ExtractionFailed(e.to_string()))?;
        debug!("Extraction reply: {}", reply.content);

        serde_json::from_str(strip_code_fence(&reply.content)).map_err(|e| {
            AgentError::ExtractionFailed(format!(
                "invalid task parameters {:?}: {}",
                reply.content, e
            ))
        })
    }
}

#[async_trait]
impl InvokableHandler for TaskManagementSpecialist {
    async fn invoke(&self, ctx: &RequestContext, messages: &[Message]) -> AgentResult<Message> {
        let action = self.extract(ctx, messages).await?;
        if ctx.is_cancelled() {
            return Err(AgentError::Cancelled);
        }
        info!(
            request_id = %ctx.request_id(),
            meeting_id = %action.meeting_id,
            task_index = %action.task_index,
            status = %action.status,
            "Calling {}", UPDATE_TASK_STATUS
        );

        // Detached so a mutation that has been issued completes even if the
        // caller goes away.
        let tools = Arc::clone(&self.tools);
        let arguments = action.arguments();
        let call = tokio::spawn(async move { tools.call(UPDATE_TASK_STATUS, arguments).await });

        let output = call
            .await
            .map_err(|e| ToolError::Protocol(format!("tool call task failed: {}", e)))?
            .inspect_err(|e| warn!("{} failed: {}", UPDATE_TASK_STATUS, e))?;

        Ok(Message::assistant(confirmation(&action, &output)))
    }
}

/// "第2个任务（序号1）" for index 1; the index itself is zero-based
fn task_label(task_index: &str) -> String {
    match task_index.trim().parse::<usize>() {
        Ok(index) => format!("第{}个任务（序号{}）", index + 1, index),
        Err(_) => format!("第{}个任务", task_index),
    }
}

/// Reply shown to the user after a successful update
fn confirmation(action: &TaskAction, output: &ToolOutput) -> String {
    let structured = output.structured.as_ref();
    let completed = structured
        .and_then(|s| s.get("completed"))
        .and_then(Value::as_bool)
        .unwrap_or_else(|| action.marks_complete());

    let task = task_label(&action.task_index);
    let mut reply = if completed {
        format!("✓ 成功完成会议{}的{}", action.meeting_id, task)
    } else {
        format!("✓ 成功将会议{}的{}标记为未完成", action.meeting_id, task)
    };
    reply.push_str("\n\n");
    reply.push_str(&output.text);

    if let Some(bits) = structured.and_then(|s| s.get("status_bits")).and_then(Value::as_u64) {
        let width = structured
            .and_then(|s| s.get("task_count"))
            .and_then(Value::as_u64)
            .unwrap_or(1) as usize;
        reply.push_str(&format!("\n任务状态: 0b{:0width$b}", bits, width = width));
    }
    reply
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{GatedToolClient, ScriptedModel, ScriptedReply, StaticToolClient};
    use crate::tool::ToolFailureKind;
    use std::time::Duration;

    fn updated_output() -> ToolOutput {
        ToolOutput {
            text: "Updated task 1 status to true for meeting 1. New status_num: 2".to_string(),
            structured: Some(json!({
                "meeting_id": 1,
                "task_index": 1,
                "completed": true,
                "status_bits": 2,
                "task_count": 3,
            })),
        }
    }

    #[test]
    fn test_task_action_accepts_numbers_and_bools() {
        let json = r#"{"meeting_id": 3, "task_index": "0", "status": false}"#;
        let action: TaskAction = serde_json::from_str(json).unwrap();
        assert_eq!(action.meeting_id, "3");
        assert_eq!(action.task_index, "0");
        assert_eq!(action.status, "false");
        assert!(!action.marks_complete());
    }

    #[tokio::test]
    async fn test_invoke_calls_tool_and_confirms() {
        let model = Arc::new(ScriptedModel::new([ScriptedReply::text(
            "```json\n{\"meeting_id\": \"1\", \"task_index\": \"1\", \"status\": \"true\"}\n```",
        )]));
        let tools = Arc::new(StaticToolClient::new(Ok(updated_output())));
        let specialist = TaskManagementSpecialist::new(model.clone(), tools.clone());

        let reply = specialist
            .invoke(&RequestContext::new(), &[Message::user("完成会议1的第2个任务")])
            .await
            .unwrap();

        assert!(reply.content.starts_with("✓ 成功完成会议1的第2个任务（序号1）"));
        assert!(reply.content.contains("New status_num: 2"));
        assert!(reply.content.ends_with("任务状态: 0b010"));

        let calls = tools.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, UPDATE_TASK_STATUS);
        assert_eq!(
            calls[0].1,
            json!({"meeting_id": "1", "task_index": "1", "status": "true"})
        );

        let prompt = &model.prompts()[0];
        assert_eq!(prompt[0].content, TASK_EXTRACTION_PROMPT);
        assert_eq!(prompt[1], Message::user("完成会议1的第2个任务"));
    }

    #[test]
    fn test_reopen_wording() {
        let action = TaskAction {
            meeting_id: "3".to_string(),
            task_index: "0".to_string(),
            status: "false".to_string(),
        };
        let output = ToolOutput {
            text: "Updated task 0 status to false for meeting 3. New status_num: 0".to_string(),
            structured: None,
        };
        let reply = confirmation(&action, &output);
        assert!(reply.starts_with("✓ 成功将会议3的第1个任务（序号0）标记为未完成"));
        assert!(!reply.contains("任务状态"));
    }

    #[tokio::test]
    async fn test_unparsable_extraction_never_calls_tool() {
        let model = Arc::new(ScriptedModel::new([ScriptedReply::text("好的，我来处理")]));
        let tools = Arc::new(StaticToolClient::new(Ok(updated_output())));
        let specialist = TaskManagementSpecialist::new(model, tools.clone());

        let err = specialist
            .invoke(&RequestContext::new(), &[Message::user("完成任务")])
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::ExtractionFailed(_)));
        assert!(tools.calls().is_empty());
    }

    #[tokio::test]
    async fn test_model_error_is_extraction_failure() {
        let model = Arc::new(ScriptedModel::new([ScriptedReply::Error(AgentError::Timeout(
            "model request".to_string(),
        ))]));
        let tools = Arc::new(StaticToolClient::new(Ok(updated_output())));
        let specialist = TaskManagementSpecialist::new(model, tools.clone());

        let err = specialist
            .invoke(&RequestContext::new(), &[Message::user("完成会议1的第2个任务")])
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::ExtractionFailed(_)));
        assert!(tools.calls().is_empty());
    }

    #[tokio::test]
    async fn test_tool_rejection_is_surfaced() {
        let model = Arc::new(ScriptedModel::new([ScriptedReply::text(
            r#"{"meeting_id": "99", "task_index": "0", "status": "true"}"#,
        )]));
        let tools = Arc::new(StaticToolClient::new(Err(ToolError::rejected(
            ToolFailureKind::RecordNotFound,
            "meeting 99 not found",
        ))));
        let specialist = TaskManagementSpecialist::new(model, tools);

        let err = specialist
            .invoke(&RequestContext::new(), &[Message::user("完成会议99的第1个任务")])
            .await
            .unwrap_err();
        match err {
            AgentError::Tool(tool_err) => {
                assert_eq!(tool_err.failure_kind(), Some(ToolFailureKind::RecordNotFound))
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_no_user_message() {
        let model = Arc::new(ScriptedModel::new([]));
        let tools = Arc::new(StaticToolClient::new(Ok(updated_output())));
        let specialist = TaskManagementSpecialist::new(model, tools);
        let err = specialist
            .invoke(&RequestContext::new(), &[Message::system("context only")])
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::ExtractionFailed(_)));
    }

    #[tokio::test]
    async fn test_cancel_during_tool_call_still_completes_update() {
        let model = Arc::new(ScriptedModel::new([ScriptedReply::text(
            r#"{"meeting_id": "1", "task_index": "1", "status": "true"}"#,
        )]));
        let tools = Arc::new(GatedToolClient::new(Ok(updated_output())));
        let specialist = Arc::new(TaskManagementSpecialist::new(model, tools.clone()));
        let ctx = RequestContext::new();

        let invocation = {
            let specialist = Arc::clone(&specialist);
            let ctx = ctx.clone();
            tokio::spawn(async move {
                specialist
                    .invoke(&ctx, &[Message::user("完成会议1的第2个任务")])
                    .await
            })
        };

        tools.wait_started().await;
        ctx.cancellation().cancel();
        invocation.abort();
        tools.open();

        tokio::time::timeout(Duration::from_secs(5), tools.wait_finished())
            .await
            .unwrap();
        assert_eq!(tools.finished(), 1);
        assert_eq!(tools.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_during_tool_call_reports_result() {
        let model = Arc::new(ScriptedModel::new([ScriptedReply::text(
            r#"{"meeting_id": "1", "task_index": "1", "status": "true"}"#,
        )]));
        let tools = Arc::new(GatedToolClient::new(Ok(updated_output())));
        let specialist = TaskManagementSpecialist::new(model, tools.clone());
        let ctx = RequestContext::new();

        let messages = [Message::user("完成会议1的第2个任务")];
        let invoke = specialist.invoke(&ctx, &messages);
        let release = async {
            tools.wait_started().await;
            ctx.cancellation().cancel();
            tools.open();
        };
        let (reply, ()) = tokio::join!(invoke, release);

        assert!(reply.unwrap().content.contains("New status_num: 2"));
        assert_eq!(tools.finished(), 1);
    }

    /// Cancels the request while producing its reply
    struct CancellingModel(RequestContext);

    #[async_trait]
    impl ChatModel for CancellingModel {
        fn model(&self) -> &str {
            "cancelling"
        }

        async fn generate(&self, _messages: &[Message]) -> AgentResult<Message> {
            self.0.cancellation().cancel();
            Ok(Message::assistant(
                r#"{"meeting_id": "1", "task_index": "0", "status": "true"}"#,
            ))
        }
    }

    #[tokio::test]
    async fn test_cancel_after_extraction_skips_tool() {
        let ctx = RequestContext::new();
        let model = Arc::new(CancellingModel(ctx.clone()));
        let tools = Arc::new(StaticToolClient::new(Ok(updated_output())));
        let specialist = TaskManagementSpecialist::new(model, tools.clone());

        let err = specialist
            .invoke(&ctx, &[Message::user("完成会议1的第1个任务")])
            .await
            .unwrap_err();
        assert_eq!(err, AgentError::Cancelled);
        assert!(tools.calls().is_empty());
    }
}
