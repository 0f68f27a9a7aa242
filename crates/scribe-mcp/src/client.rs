//! Tool protocol clients
//!
//! [`McpSession`] is one initialized connection to a tool server.
//! The [`ToolClient`] implementations decide how long sessions live:
//!
//! - [`StdioToolClient`] spawns the server process for every call
//! - [`EmbeddedToolClient`] runs the server in-process for every call
//! - [`PooledToolClient`] keeps one session open and reconnects after a
//!   transport failure

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use scribe_core::{ToolClient, ToolError, ToolOutput};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::protocol::{
    CallToolResult, JsonRpcRequest, JsonRpcResponse, ToolDescriptor, PROTOCOL_VERSION,
};
use crate::server::TaskToolServer;

pub const CLIENT_NAME: &str = "scribe-task-client";

/// Per-request deadline unless configured otherwise
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// How long a finished server process gets to exit before it is killed
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Command line that starts a tool server on stdio
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerCommand {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl ServerCommand {
    pub fn new(
        program: impl Into<String>,
        args: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }
}

/// Where a session's server runs
#[derive(Debug, Clone)]
pub enum ToolServerTarget {
    /// Child process speaking the protocol on stdin/stdout
    Process(ServerCommand),
    /// Server task inside this process, connected by an in-memory pipe
    InProcess(TaskToolServer),
}

impl ToolServerTarget {
    /// Start the server and complete the handshake
    pub async fn connect(&self, timeout: Duration) -> Result<McpSession, ToolError> {
        match self {
            Self::Process(command) => McpSession::spawn(command, timeout).await,
            Self::InProcess(server) => {
                let (client_end, server_end) = tokio::io::duplex(64 * 1024);
                let (server_read, server_write) = tokio::io::split(server_end);
                let server = server.clone();
                let task =
                    tokio::spawn(async move { server.serve(server_read, server_write).await });

                let (client_read, client_write) = tokio::io::split(client_end);
                let mut session = McpSession::handshake(client_read, client_write, timeout).await?;
                session.server_task = Some(task);
                Ok(session)
            }
        }
    }
}

/// One initialized protocol session
pub struct McpSession {
    reader: BufReader<Box<dyn AsyncRead + Send + Unpin>>,
    writer: Box<dyn AsyncWrite + Send + Unpin>,
    child: Option<Child>,
    server_task: Option<JoinHandle<std::io::Result<()>>>,
    next_id: u64,
    timeout: Duration,
    server_name: String,
}

impl std::fmt::Debug for McpSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpSession")
            .field("server_name", &self.server_name)
            .field("next_id", &self.next_id)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl McpSession {
    /// Run the `initialize` handshake over an existing byte stream.
    ///
    /// Any failure before the initialize result arrives is reported as
    /// `ConnectionFailed`.
    pub async fn handshake<R, W>(reader: R, writer: W, timeout: Duration) -> Result<Self, ToolError>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let reader: Box<dyn AsyncRead + Send + Unpin> = Box::new(reader);
        let mut session = Self {
            reader: BufReader::new(reader),
            writer: Box::new(writer),
            child: None,
            server_task: None,
            next_id: 1,
            timeout,
            server_name: String::new(),
        };

        let request = JsonRpcRequest::new("initialize", session.next_id()).with_params(json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": CLIENT_NAME,
                "version": env!("CARGO_PKG_VERSION"),
            }
        }));

        let result = session
            .request(request)
            .await
            .map_err(|e| ToolError::ConnectionFailed(format!("initialize failed: {}", e)))?;

        let init: InitializeResult = serde_json::from_value(result).map_err(|e| {
            ToolError::ConnectionFailed(format!("invalid initialize result: {}", e))
        })?;
        if init.protocol_version != PROTOCOL_VERSION {
            warn!(
                "Tool server speaks protocol {}, expected {}",
                init.protocol_version, PROTOCOL_VERSION
            );
        }
        session.server_name = init.server_info.map(|s| s.name).unwrap_or_default();

        session
            .send(&JsonRpcRequest::notification("notifications/initialized"))
            .await
            .map_err(|e| {
                ToolError::ConnectionFailed(format!("initialized notification failed: {}", e))
            })?;

        debug!("Tool session initialized with '{}'", session.server_name);
        Ok(session)
    }

    /// Spawn `command` and run the handshake over its stdio
    pub async fn spawn(command: &ServerCommand, timeout: Duration) -> Result<Self, ToolError> {
        debug!("Starting tool server: {} {:?}", command.program, command.args);

        let mut child = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ToolError::ConnectionFailed(format!("failed to spawn '{}': {}", command.program, e))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ToolError::ConnectionFailed("failed to get stdin handle".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ToolError::ConnectionFailed("failed to get stdout handle".to_string()))?;

        let mut session = Self::handshake(stdout, stdin, timeout).await?;
        session.child = Some(child);
        Ok(session)
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    /// Call a tool; `isError` results become `ToolError::Rejected`
    pub async fn call_tool(
        &mut self,
        name: &str,
        arguments: Value,
    ) -> Result<ToolOutput, ToolError> {
        let request = JsonRpcRequest::new("tools/call", self.next_id()).with_params(json!({
            "name": name,
            "arguments": arguments,
        }));
        let result = self.request(request).await?;
        let result: CallToolResult = serde_json::from_value(result)
            .map_err(|e| ToolError::Protocol(format!("invalid tools/call result: {}", e)))?;
        result.into_output()
    }

    pub async fn list_tools(&mut self) -> Result<Vec<ToolDescriptor>, ToolError> {
        #[derive(Deserialize)]
        struct ToolsResult {
            tools: Vec<ToolDescriptor>,
        }

        let request = JsonRpcRequest::new("tools/list", self.next_id());
        let result = self.request(request).await?;
        let result: ToolsResult = serde_json::from_value(result)
            .map_err(|e| ToolError::Protocol(format!("invalid tools/list result: {}", e)))?;
        Ok(result.tools)
    }

    /// Close the server's input, give it a moment to exit, then kill it
    pub async fn shutdown(self) {
        let Self {
            reader,
            mut writer,
            child,
            server_task,
            ..
        } = self;
        let _ = writer.shutdown().await;
        drop(writer);
        drop(reader);

        if let Some(mut child) = child {
            match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
                Ok(Ok(status)) => debug!("Tool server exited with {}", status),
                Ok(Err(e)) => warn!("Failed to wait for tool server: {}", e),
                Err(_) => {
                    warn!("Tool server did not exit, killing it");
                    let _ = child.kill().await;
                }
            }
        }

        if let Some(task) = server_task {
            match tokio::time::timeout(SHUTDOWN_GRACE, task).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => warn!("In-process tool server failed: {}", e),
                Ok(Err(e)) => warn!("In-process tool server panicked: {}", e),
                Err(_) => warn!("In-process tool server did not stop"),
            }
        }
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    async fn request(&mut self, request: JsonRpcRequest) -> Result<Value, ToolError> {
        let id = request.id.clone();
        self.send(&request).await?;

        let response = tokio::time::timeout(self.timeout, self.read_response(id.as_ref()))
            .await
            .map_err(|_| ToolError::Timeout(self.timeout))??;

        if let Some(error) = response.error {
            return Err(ToolError::Protocol(format!(
                "server error {}: {}",
                error.code, error.message
            )));
        }
        response
            .result
            .ok_or_else(|| ToolError::Protocol("response has neither result nor error".to_string()))
    }

    async fn send(&mut self, message: &JsonRpcRequest) -> Result<(), ToolError> {
        let mut json = serde_json::to_string(message)
            .map_err(|e| ToolError::Protocol(format!("failed to serialize request: {}", e)))?;
        json.push('\n');

        self.writer
            .write_all(json.as_bytes())
            .await
            .map_err(|e| ToolError::ConnectionFailed(format!("failed to write request: {}", e)))?;
        self.writer
            .flush()
            .await
            .map_err(|e| ToolError::ConnectionFailed(format!("failed to flush request: {}", e)))
    }

    /// Read lines until the response with the given id arrives
    async fn read_response(&mut self, id: Option<&Value>) -> Result<JsonRpcResponse, ToolError> {
        let mut line = String::new();
        loop {
            line.clear();
            let read = self
                .reader
                .read_line(&mut line)
                .await
                .map_err(|e| {
                    ToolError::ConnectionFailed(format!("failed to read response: {}", e))
                })?;
            if read == 0 {
                return Err(ToolError::ConnectionFailed(
                    "tool server closed the connection".to_string(),
                ));
            }

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            let value: Value = serde_json::from_str(trimmed)
                .map_err(|e| ToolError::Protocol(format!("malformed response line: {}", e)))?;
            if value.get("method").is_some() {
                debug!("Ignoring server message: {}", trimmed);
                continue;
            }

            let response: JsonRpcResponse = serde_json::from_value(value)
                .map_err(|e| ToolError::Protocol(format!("malformed response: {}", e)))?;
            if Some(&response.id) != id {
                warn!("Skipping response with unexpected id {}", response.id);
                continue;
            }
            return Ok(response);
        }
    }
}

#[derive(Debug, Deserialize)]
struct InitializeResult {
    #[serde(rename = "protocolVersion")]
    protocol_version: String,
    #[serde(rename = "serverInfo", default)]
    server_info: Option<ServerInfo>,
}

#[derive(Debug, Deserialize)]
struct ServerInfo {
    name: String,
}

async fn call_once(
    target: &ToolServerTarget,
    timeout: Duration,
    tool_name: &str,
    arguments: Value,
) -> Result<ToolOutput, ToolError> {
    let mut session = target.connect(timeout).await?;
    let result = session.call_tool(tool_name, arguments).await;
    session.shutdown().await;
    result
}

/// Spawns the tool server process for every call
#[derive(Debug, Clone)]
pub struct StdioToolClient {
    target: ToolServerTarget,
    timeout: Duration,
}

impl StdioToolClient {
    pub fn new(command: ServerCommand) -> Self {
        Self {
            target: ToolServerTarget::Process(command),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl ToolClient for StdioToolClient {
    async fn call(&self, tool_name: &str, arguments: Value) -> Result<ToolOutput, ToolError> {
        call_once(&self.target, self.timeout, tool_name, arguments).await
    }
}

/// Runs the tool server in-process for every call, over the same protocol
#[derive(Debug, Clone)]
pub struct EmbeddedToolClient {
    target: ToolServerTarget,
    timeout: Duration,
}

impl EmbeddedToolClient {
    pub fn new(server: TaskToolServer) -> Self {
        Self {
            target: ToolServerTarget::InProcess(server),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl ToolClient for EmbeddedToolClient {
    async fn call(&self, tool_name: &str, arguments: Value) -> Result<ToolOutput, ToolError> {
        call_once(&self.target, self.timeout, tool_name, arguments).await
    }
}

/// Keeps one session open across calls. Calls are serialized over it; a
/// transport or protocol failure discards the session and the next call
/// reconnects.
pub struct PooledToolClient {
    target: ToolServerTarget,
    timeout: Duration,
    session: tokio::sync::Mutex<Option<McpSession>>,
}

impl std::fmt::Debug for PooledToolClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledToolClient")
            .field("target", &self.target)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl PooledToolClient {
    pub fn new(target: ToolServerTarget) -> Self {
        Self {
            target,
            timeout: DEFAULT_TIMEOUT,
            session: tokio::sync::Mutex::new(None),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn is_connected(&self) -> bool {
        self.session.lock().await.is_some()
    }

    /// Shut the open session down, if any
    pub async fn close(&self) {
        if let Some(session) = self.session.lock().await.take() {
            session.shutdown().await;
        }
    }
}

#[async_trait]
impl ToolClient for PooledToolClient {
    async fn call(&self, tool_name: &str, arguments: Value) -> Result<ToolOutput, ToolError> {
        let mut guard = self.session.lock().await;
        if guard.is_none() {
            let session = self.target.connect(self.timeout).await?;
            info!("Connected to tool server '{}'", session.server_name());
            *guard = Some(session);
        }
        let Some(session) = guard.as_mut() else {
            return Err(ToolError::ConnectionFailed("no tool session".to_string()));
        };

        let result = session.call_tool(tool_name, arguments).await;
        if let Err(e) = &result {
            if e.is_transport() {
                warn!("Dropping tool session after error: {}", e);
                if let Some(session) = guard.take() {
                    session.shutdown().await;
                }
            }
        }
        result
    }
}
