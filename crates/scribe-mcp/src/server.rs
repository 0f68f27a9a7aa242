//! Task tool server
//!
//! Serves `update_task_status` over newline-delimited JSON-RPC. Stdout is the
//! protocol channel, so nothing else may be written to it while serving.

use scribe_core::{ToolFailure, ToolFailureKind, UPDATE_TASK_STATUS};
use scribe_store::{MeetingStore, StoreError};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};

use crate::protocol::{
    CallToolParams, CallToolResult, JsonRpcRequest, JsonRpcResponse, ToolDescriptor,
    INTERNAL_ERROR, INVALID_PARAMS, INVALID_REQUEST, METHOD_NOT_FOUND, NOT_INITIALIZED,
    PARSE_ERROR, PROTOCOL_VERSION,
};

pub const SERVER_NAME: &str = "scribe-task-tool";

/// Tool server bound to one meeting store
#[derive(Debug, Clone)]
pub struct TaskToolServer {
    store: MeetingStore,
}

impl TaskToolServer {
    pub fn new(store: MeetingStore) -> Self {
        Self { store }
    }

    /// Serve on the process's stdin/stdout until stdin closes
    pub async fn serve_stdio(&self) -> std::io::Result<()> {
        self.serve(tokio::io::stdin(), tokio::io::stdout()).await
    }

    /// Serve one session until the reader reaches EOF
    pub async fn serve<R, W>(&self, reader: R, mut writer: W) -> std::io::Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut reader = BufReader::new(reader);
        let mut line = String::new();
        let mut initialized = false;

        loop {
            line.clear();
            if reader.read_line(&mut line).await? == 0 {
                debug!("Tool client disconnected");
                break;
            }

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            let Some(response) = self.handle_line(trimmed, &mut initialized).await else {
                continue;
            };

            let mut json = serde_json::to_string(&response)?;
            json.push('\n');
            writer.write_all(json.as_bytes()).await?;
            writer.flush().await?;
        }

        Ok(())
    }

    /// Handle one request line. Notifications produce no response.
    async fn handle_line(&self, line: &str, initialized: &mut bool) -> Option<JsonRpcResponse> {
        let request: JsonRpcRequest = match serde_json::from_str(line) {
            Ok(request) => request,
            Err(e) => {
                warn!("Unparsable request: {}", e);
                return Some(JsonRpcResponse::failure(
                    Value::Null,
                    PARSE_ERROR,
                    format!("Parse error: {}", e),
                ));
            }
        };

        let Some(id) = request.id.clone() else {
            debug!("Notification: {}", request.method);
            return None;
        };

        if request.jsonrpc != "2.0" {
            return Some(JsonRpcResponse::failure(
                id,
                INVALID_REQUEST,
                "jsonrpc must be \"2.0\"",
            ));
        }

        let response = match request.method.as_str() {
            "initialize" => {
                *initialized = true;
                JsonRpcResponse::success(id, initialize_result())
            }
            "ping" => JsonRpcResponse::success(id, json!({})),
            "tools/list" | "tools/call" if !*initialized => JsonRpcResponse::failure(
                id,
                NOT_INITIALIZED,
                "Server not initialized",
            ),
            "tools/list" => JsonRpcResponse::success(id, json!({ "tools": [tool_descriptor()] })),
            "tools/call" => {
                let params = request
                    .params
                    .map(serde_json::from_value::<CallToolParams>)
                    .transpose();
                match params {
                    Ok(Some(params)) => {
                        let result = self.call_tool(&params.name, &params.arguments).await;
                        match serde_json::to_value(result) {
                            Ok(value) => JsonRpcResponse::success(id, value),
                            Err(e) => JsonRpcResponse::failure(id, INTERNAL_ERROR, e.to_string()),
                        }
                    }
                    Ok(None) => JsonRpcResponse::failure(id, INVALID_PARAMS, "Missing params"),
                    Err(e) => JsonRpcResponse::failure(
                        id,
                        INVALID_PARAMS,
                        format!("Invalid params: {}", e),
                    ),
                }
            }
            other => JsonRpcResponse::failure(
                id,
                METHOD_NOT_FOUND,
                format!("Method not found: {}", other),
            ),
        };
        Some(response)
    }

    /// Run a tool. Business-rule failures come back as `isError` results.
    pub async fn call_tool(&self, name: &str, arguments: &Value) -> CallToolResult {
        if name != UPDATE_TASK_STATUS {
            return CallToolResult::failure(&ToolFailure::new(
                ToolFailureKind::UnknownTool,
                format!("unknown tool '{}'", name),
            ));
        }

        match self.update_task_status(arguments).await {
            Ok(result) => result,
            Err(failure) => {
                info!("{} rejected: {} ({})", UPDATE_TASK_STATUS, failure.reason, failure.kind);
                CallToolResult::failure(&failure)
            }
        }
    }

    async fn update_task_status(&self, arguments: &Value) -> Result<CallToolResult, ToolFailure> {
        let meeting_id = integer_argument(arguments, "meeting_id")?;
        let task_index = integer_argument(arguments, "task_index")?;
        let completed = bool_argument(arguments, "status")?;

        let update = self
            .store
            .update_task_status(meeting_id, task_index, completed)
            .await
            .map_err(store_failure)?;

        let text = format!(
            "Updated task {} status to {} for meeting {}. New status_num: {}",
            update.task_index,
            update.completed,
            update.meeting_id,
            update.status_bits.bits()
        );
        info!("{}", text);

        let structured = serde_json::to_value(update)
            .map_err(|e| ToolFailure::new(ToolFailureKind::Internal, e.to_string()))?;
        Ok(CallToolResult::success(text, Some(structured)))
    }
}

fn initialize_result() -> Value {
    json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": { "tools": {} },
        "serverInfo": {
            "name": SERVER_NAME,
            "version": env!("CARGO_PKG_VERSION"),
        }
    })
}

fn tool_descriptor() -> ToolDescriptor {
    ToolDescriptor {
        name: UPDATE_TASK_STATUS.to_string(),
        description: "Mark one task of a meeting as completed or not completed".to_string(),
        input_schema: json!({
            "type": "object",
            "properties": {
                "meeting_id": {
                    "type": "string",
                    "description": "ID of the meeting"
                },
                "task_index": {
                    "type": "string",
                    "description": "Zero-based index of the task"
                },
                "status": {
                    "type": "string",
                    "enum": ["true", "false"],
                    "description": "\"true\" for completed, \"false\" for not completed"
                }
            },
            "required": ["meeting_id", "task_index", "status"]
        }),
    }
}

fn store_failure(err: StoreError) -> ToolFailure {
    let kind = match &err {
        StoreError::NotFound(_) => ToolFailureKind::RecordNotFound,
        StoreError::IndexOutOfRange { .. } => ToolFailureKind::IndexOutOfRange,
        StoreError::MalformedState { .. } => ToolFailureKind::MalformedState,
        StoreError::TooManyTasks(_) | StoreError::DuplicateName(_) => {
            ToolFailureKind::InvalidArgument
        }
        StoreError::Database(_) | StoreError::Encode(_) | StoreError::Worker(_) => {
            warn!("Store failure: {}", err);
            ToolFailureKind::Internal
        }
    };
    ToolFailure::new(kind, err.to_string())
}

fn argument<'a>(arguments: &'a Value, key: &str) -> Result<&'a Value, ToolFailure> {
    arguments.get(key).filter(|v| !v.is_null()).ok_or_else(|| {
        ToolFailure::new(
            ToolFailureKind::InvalidArgument,
            format!("missing argument '{}'", key),
        )
    })
}

/// Integer given as a JSON number or a decimal string
fn integer_argument(arguments: &Value, key: &str) -> Result<i64, ToolFailure> {
    let value = argument(arguments, key)?;
    let parsed = match value {
        Value::String(s) => s.trim().parse::<i64>().ok(),
        Value::Number(n) => n.as_i64(),
        _ => None,
    };
    parsed.ok_or_else(|| {
        ToolFailure::new(
            ToolFailureKind::InvalidArgument,
            format!("invalid {}: {}", key, value),
        )
    })
}

/// `"true"`/`"false"`, a JSON boolean, or 1/0
fn bool_argument(arguments: &Value, key: &str) -> Result<bool, ToolFailure> {
    let value = argument(arguments, key)?;
    let parsed = match value {
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" => Some(true),
            "false" => Some(false),
            _ => None,
        },
        Value::Bool(b) => Some(*b),
        Value::Number(n) => match n.as_i64() {
            Some(1) => Some(true),
            Some(0) => Some(false),
            _ => None,
        },
        _ => None,
    };
    parsed.ok_or_else(|| {
        ToolFailure::new(
            ToolFailureKind::InvalidArgument,
            format!("invalid {}: {}", key, value),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use scribe_store::NewMeeting;
    use tokio::io::{duplex, DuplexStream, Lines, ReadHalf, WriteHalf};

    async fn send(writer: &mut WriteHalf<DuplexStream>, line: &str) {
        writer.write_all(line.as_bytes()).await.unwrap();
        writer.write_all(b"\n").await.unwrap();
    }

    async fn next_reply(lines: &mut Lines<BufReader<ReadHalf<DuplexStream>>>) -> JsonRpcResponse {
        let line = lines.next_line().await.unwrap().unwrap();
        serde_json::from_str(&line).unwrap()
    }

    async fn server_with_meeting(tasks: &[&str]) -> (TaskToolServer, MeetingStore, i64) {
        let store = MeetingStore::open_in_memory().unwrap();
        let id = store
            .create_meeting(NewMeeting {
                name: "weekly".to_string(),
                tasks: tasks.iter().map(|t| t.to_string()).collect(),
                audio_filename: "weekly.mp3".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        (TaskToolServer::new(store.clone()), store, id)
    }

    #[tokio::test]
    async fn test_update_task_status_success() {
        let (server, store, id) = server_with_meeting(&["a", "b", "c"]).await;
        let result = server
            .call_tool(
                UPDATE_TASK_STATUS,
                &json!({"meeting_id": id.to_string(), "task_index": "1", "status": "true"}),
            )
            .await;

        assert!(!result.is_error);
        assert_eq!(
            result.text(),
            format!("Updated task 1 status to true for meeting {}. New status_num: 2", id)
        );
        let structured = result.structured_content.unwrap();
        assert_eq!(structured["status_bits"], 2);
        assert_eq!(structured["task_count"], 3);
        assert_eq!(structured["completed"], true);

        let (_, bits) = store.get_tasks_and_status(id).await.unwrap();
        assert_eq!(bits.bits(), 0b010);
    }

    #[tokio::test]
    async fn test_numeric_and_boolean_arguments() {
        let (server, store, id) = server_with_meeting(&["a", "b"]).await;
        let result = server
            .call_tool(
                UPDATE_TASK_STATUS,
                &json!({"meeting_id": id, "task_index": 0, "status": true}),
            )
            .await;
        assert!(!result.is_error);
        let (_, bits) = store.get_tasks_and_status(id).await.unwrap();
        assert_eq!(bits.bits(), 0b01);
    }

    #[tokio::test]
    async fn test_failure_kinds() {
        let (server, store, id) = server_with_meeting(&["a", "b", "c"]).await;

        let args = |meeting: Value, index: &str, status: &str| {
            json!({"meeting_id": meeting, "task_index": index, "status": status})
        };
        let cases = [
            (args(json!("99"), "0", "true"), ToolFailureKind::RecordNotFound),
            (args(json!(id), "3", "true"), ToolFailureKind::IndexOutOfRange),
            (args(json!(id), "-1", "true"), ToolFailureKind::IndexOutOfRange),
            (args(json!("abc"), "0", "true"), ToolFailureKind::InvalidArgument),
            (args(json!(id), "0", "done"), ToolFailureKind::InvalidArgument),
            (json!({"meeting_id": id, "status": "true"}), ToolFailureKind::InvalidArgument),
        ];

        for (arguments, expected) in cases {
            let result = server.call_tool(UPDATE_TASK_STATUS, &arguments).await;
            assert!(result.is_error, "expected failure for {}", arguments);
            let err = result.into_output().unwrap_err();
            assert_eq!(err.failure_kind(), Some(expected), "arguments: {}", arguments);
        }

        let (_, bits) = store.get_tasks_and_status(id).await.unwrap();
        assert_eq!(bits.bits(), 0);
    }

    #[tokio::test]
    async fn test_unknown_tool() {
        let (server, _, _) = server_with_meeting(&["a"]).await;
        let result = server.call_tool("delete_everything", &json!({})).await;
        let err = result.into_output().unwrap_err();
        assert_eq!(err.failure_kind(), Some(ToolFailureKind::UnknownTool));
    }

    #[tokio::test]
    async fn test_session_over_duplex() {
        let (server, _, id) = server_with_meeting(&["a", "b"]).await;
        let (client, server_end) = duplex(4096);
        let (server_read, server_write) = tokio::io::split(server_end);
        let handle = tokio::spawn(async move { server.serve(server_read, server_write).await });

        let (client_read, mut client_write) = tokio::io::split(client);
        let mut lines = BufReader::new(client_read).lines();

        // Calls before initialize are refused
        let early_call = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "tools/call",
            "params": {"name": UPDATE_TASK_STATUS, "arguments": {}}
        });
        send(&mut client_write, &early_call.to_string()).await;
        let reply = next_reply(&mut lines).await;
        assert_eq!(reply.error.unwrap().code, NOT_INITIALIZED);

        send(&mut client_write, "this is not json").await;
        let reply = next_reply(&mut lines).await;
        assert_eq!(reply.error.unwrap().code, PARSE_ERROR);
        assert_eq!(reply.id, Value::Null);

        let initialize = r#"{"jsonrpc":"2.0","id":2,"method":"initialize","params":{}}"#;
        send(&mut client_write, initialize).await;
        let reply = next_reply(&mut lines).await;
        assert_eq!(reply.id, json!(2));
        assert_eq!(reply.result.unwrap()["protocolVersion"], PROTOCOL_VERSION);

        // Notifications get no reply; the next line answers the ping
        send(&mut client_write, r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#).await;
        send(&mut client_write, r#"{"jsonrpc":"2.0","id":3,"method":"ping"}"#).await;
        let reply = next_reply(&mut lines).await;
        assert_eq!(reply.id, json!(3));
        assert_eq!(reply.result, Some(json!({})));

        send(&mut client_write, r#"{"jsonrpc":"2.0","id":4,"method":"tools/list"}"#).await;
        let reply = next_reply(&mut lines).await;
        let tools = &reply.result.unwrap()["tools"];
        assert_eq!(tools[0]["name"], UPDATE_TASK_STATUS);
        assert_eq!(tools[0]["inputSchema"]["required"][2], "status");

        let call = json!({
            "jsonrpc": "2.0",
            "id": 5,
            "method": "tools/call",
            "params": {
                "name": UPDATE_TASK_STATUS,
                "arguments": {"meeting_id": id.to_string(), "task_index": "1", "status": "true"}
            }
        });
        send(&mut client_write, &call.to_string()).await;
        let reply = next_reply(&mut lines).await;
        let result: CallToolResult = serde_json::from_value(reply.result.unwrap()).unwrap();
        assert!(!result.is_error);
        assert!(result.text().ends_with("New status_num: 2"));

        send(&mut client_write, r#"{"jsonrpc":"2.0","id":6,"method":"resources/list"}"#).await;
        let reply = next_reply(&mut lines).await;
        assert_eq!(reply.error.unwrap().code, METHOD_NOT_FOUND);

        client_write.shutdown().await.unwrap();
        handle.await.unwrap().unwrap();
    }
}
