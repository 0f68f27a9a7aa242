use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use scribe_core::{
    ChatModel, MeetingChatSpecialist, Message, OpenAiCompatModel, Orchestrator, RecvError,
    RequestContext, Router, TaskManagementSpecialist, ToolClient, UPDATE_TASK_STATUS,
};
use scribe_mcp::{
    EmbeddedToolClient, PooledToolClient, ServerCommand, StdioToolClient, TaskToolServer,
    ToolServerTarget,
};
use scribe_store::{Meeting, MeetingStore, NewMeeting};

mod config;

use config::{ScribeConfig, ToolTransport};

#[derive(Parser)]
#[command(name = "scribe")]
#[command(version)]
#[command(about = "Scribe: a meeting assistant that answers questions and tracks tasks")]
struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize config directory and default config
    Init,

    /// Show current configuration (secrets masked)
    Config,

    /// Interactive session; Ctrl-C cancels the current answer, `exit` or Ctrl-C at the prompt quits
    Chat {
        /// Meeting whose summary and tasks are given to the assistant
        #[arg(short, long)]
        meeting: Option<i64>,
    },

    /// Send a one-shot message to the assistant
    Ask {
        /// The message to send
        message: String,

        /// Meeting whose summary and tasks are given to the assistant
        #[arg(short, long)]
        meeting: Option<i64>,
    },

    /// Serve the task tool protocol on stdin/stdout
    ToolServer {
        /// Meeting database (defaults to the configured one)
        #[arg(long)]
        db: Option<PathBuf>,
    },

    /// Call update_task_status directly through the configured tool client
    CallTool {
        #[arg(long)]
        meeting: String,
        #[arg(long)]
        task: String,
        /// "true" to complete, "false" to reopen
        #[arg(long)]
        status: String,
    },

    /// Manage stored meetings
    Meetings {
        #[command(subcommand)]
        command: MeetingsCommand,
    },
}

#[derive(Subcommand)]
enum MeetingsCommand {
    /// List meetings with their task progress
    List,

    /// Add a meeting
    Add {
        #[arg(long)]
        name: String,
        /// Task description; repeat for several tasks
        #[arg(long = "task")]
        tasks: Vec<String>,
        #[arg(long)]
        summary: Option<String>,
        #[arg(long, default_value = "")]
        audio: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr: stdout carries answers, and the tool protocol
    // when running as a tool server
    let filter = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Init => cmd_init().await,
        Commands::Config => cmd_config(&cli.config),
        Commands::Chat { meeting } => cmd_chat(&cli.config, meeting).await,
        Commands::Ask { message, meeting } => cmd_ask(&cli.config, &message, meeting).await,
        Commands::ToolServer { db } => cmd_tool_server(&cli.config, db).await,
        Commands::CallTool {
            meeting,
            task,
            status,
        } => cmd_call_tool(&cli.config, &meeting, &task, &status).await,
        Commands::Meetings { command } => cmd_meetings(&cli.config, command).await,
    }
}

async fn cmd_init() -> Result<()> {
    let config_dir = config::config_dir();
    tokio::fs::create_dir_all(&config_dir)
        .await
        .with_context(|| format!("Failed to create config dir: {}", config_dir.display()))?;

    let config_path = config_dir.join("config.toml");
    if config_path.exists() {
        warn!("Config already exists at {}", config_path.display());
    } else {
        let default_config = include_str!("../../../config/default.toml");
        tokio::fs::write(&config_path, default_config).await?;
        info!("Created default config at {}", config_path.display());
    }

    println!("Scribe initialized at {}", config_dir.display());
    println!("Edit {} to configure your model endpoint.", config_path.display());
    Ok(())
}

fn cmd_config(config_path: &Option<PathBuf>) -> Result<()> {
    let cfg = ScribeConfig::load(config_path)?;
    println!("{:#?}", cfg);
    Ok(())
}

async fn cmd_chat(config_path: &Option<PathBuf>, meeting: Option<i64>) -> Result<()> {
    let cfg = ScribeConfig::load(config_path)?;
    let store = open_store(&cfg.db_path())?;
    let orchestrator = build_orchestrator(&cfg, &store)?;
    let mut history = meeting_context(&store, meeting).await?;

    println!("会议助手已启动! 输入'exit'退出.");
    println!("示例指令:");
    println!("- 完成会议1的第2个任务");
    println!("- 把会议3的第1个任务标记为未完成");
    println!("- 告诉我会议中讨论了什么?");
    println!("- 会议有哪些任务分配?");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("\n请输入指令: ");
        std::io::stdout().flush()?;

        // Ctrl-C at the prompt quits; during an answer it only cancels that answer
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => {
                println!();
                break;
            }
        };
        let Some(line) = line else {
            break;
        };
        let input = line.trim();
        if input == "exit" {
            break;
        }
        if input.is_empty() {
            continue;
        }

        history.push(Message::user(input));
        let cancel = CancellationToken::new();
        let ctx = RequestContext::with_cancellation(cancel.clone());

        let reply = tokio::select! {
            reply = print_reply(&orchestrator, ctx, &history) => reply,
            _ = tokio::signal::ctrl_c() => {
                cancel.cancel();
                println!("\n(已取消)");
                Err(anyhow!("cancelled"))
            }
        };

        match reply {
            Ok(text) => history.push(Message::assistant(text)),
            Err(e) => {
                debug!("Turn dropped from history: {}", e);
                history.pop();
            }
        }
    }

    Ok(())
}

async fn cmd_ask(config_path: &Option<PathBuf>, message: &str, meeting: Option<i64>) -> Result<()> {
    let cfg = ScribeConfig::load(config_path)?;
    let store = open_store(&cfg.db_path())?;
    let orchestrator = build_orchestrator(&cfg, &store)?;

    let mut messages = meeting_context(&store, meeting).await?;
    messages.push(Message::user(message));

    let cancel = CancellationToken::new();
    let ctx = RequestContext::with_cancellation(cancel.clone());
    tokio::select! {
        reply = print_reply(&orchestrator, ctx, &messages) => reply.map(|_| ()),
        _ = tokio::signal::ctrl_c() => {
            cancel.cancel();
            Err(anyhow!("cancelled"))
        }
    }
}

/// Stream one answer to stdout; returns the full text once the stream ends
async fn print_reply(
    orchestrator: &Orchestrator,
    ctx: RequestContext,
    messages: &[Message],
) -> Result<String> {
    let mut reader = orchestrator.dispatch(ctx, messages).await;
    let mut text = String::new();

    println!("\n回答:");
    loop {
        match reader.recv().await {
            Ok(fragment) => {
                print!("{}", fragment.content);
                std::io::stdout().flush()?;
                text.push_str(&fragment.content);
            }
            Err(RecvError::EndOfStream) => {
                println!();
                return Ok(text);
            }
            Err(RecvError::Failed(e)) => {
                println!();
                eprintln!("Error: {}", e);
                return Err(e.into());
            }
        }
    }
}

async fn cmd_tool_server(config_path: &Option<PathBuf>, db: Option<PathBuf>) -> Result<()> {
    let db_path = match db {
        Some(path) => path,
        None => ScribeConfig::load(config_path)?.db_path(),
    };
    let store = open_store(&db_path)?;

    info!("Task tool server ready on stdio ({})", db_path.display());
    TaskToolServer::new(store)
        .serve_stdio()
        .await
        .context("Tool server I/O failed")?;
    info!("Task tool server stopped");
    Ok(())
}

async fn cmd_call_tool(
    config_path: &Option<PathBuf>,
    meeting: &str,
    task: &str,
    status: &str,
) -> Result<()> {
    let cfg = ScribeConfig::load(config_path)?;
    let client = build_tool_client(&cfg)?;

    let output = client
        .call(
            UPDATE_TASK_STATUS,
            json!({"meeting_id": meeting, "task_index": task, "status": status}),
        )
        .await?;

    println!("{}", output.text);
    if let Some(structured) = output.structured {
        println!("{}", serde_json::to_string_pretty(&structured)?);
    }
    Ok(())
}

async fn cmd_meetings(config_path: &Option<PathBuf>, command: MeetingsCommand) -> Result<()> {
    let cfg = ScribeConfig::load(config_path)?;
    let store = open_store(&cfg.db_path())?;

    match command {
        MeetingsCommand::List => {
            let meetings = store.list_meetings().await?;
            if meetings.is_empty() {
                println!("No meetings yet. Add one with `scribe meetings add`.");
            }
            for meeting in meetings {
                println!(
                    "#{} {} ({}/{} tasks done)",
                    meeting.id,
                    meeting.name,
                    meeting.status_bits.completed_count(meeting.tasks.len()),
                    meeting.tasks.len()
                );
                for line in meeting.task_checklist().lines() {
                    println!("    {}", line);
                }
            }
        }
        MeetingsCommand::Add {
            name,
            tasks,
            summary,
            audio,
        } => {
            let id = store
                .create_meeting(NewMeeting {
                    name,
                    summary,
                    tasks,
                    audio_filename: audio,
                    ..Default::default()
                })
                .await?;
            println!("Created meeting #{}", id);
        }
    }
    Ok(())
}

fn open_store(path: &std::path::Path) -> Result<MeetingStore> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
    }
    MeetingStore::new(path)
        .with_context(|| format!("Failed to open meeting database at {}", path.display()))
}

fn build_model(cfg: &ScribeConfig, model_override: Option<&str>) -> Result<Arc<dyn ChatModel>> {
    let model = OpenAiCompatModel::new(
        cfg.model.api_key.clone(),
        cfg.model.base_url.clone(),
        model_override.unwrap_or(&cfg.model.model).to_string(),
    )?
    .with_timeout(Duration::from_secs(cfg.model.timeout_secs));
    Ok(Arc::new(model))
}

fn build_tool_client(cfg: &ScribeConfig) -> Result<Arc<dyn ToolClient>> {
    let timeout = Duration::from_secs(cfg.tool.timeout_secs);
    let target = match cfg.tool.transport {
        ToolTransport::Stdio => ToolServerTarget::Process(tool_server_command(cfg)?),
        ToolTransport::Embedded => {
            ToolServerTarget::InProcess(TaskToolServer::new(open_store(&cfg.db_path())?))
        }
    };
    debug!("Tool client target: {:?} (pooled: {})", target, cfg.tool.pooled);

    let client: Arc<dyn ToolClient> = match (target, cfg.tool.pooled) {
        (target, true) => Arc::new(PooledToolClient::new(target).with_timeout(timeout)),
        (ToolServerTarget::Process(command), false) => {
            Arc::new(StdioToolClient::new(command).with_timeout(timeout))
        }
        (ToolServerTarget::InProcess(server), false) => {
            Arc::new(EmbeddedToolClient::new(server).with_timeout(timeout))
        }
    };
    Ok(client)
}

/// Child command for the stdio transport. A `tool-server` invocation is
/// pointed at the configured database explicitly, since the child does not
/// see this process's `--config`.
fn tool_server_command(cfg: &ScribeConfig) -> Result<ServerCommand> {
    let program = match &cfg.tool.command {
        Some(command) => command.clone(),
        None => std::env::current_exe()
            .context("Failed to locate the scribe executable for the tool server")?
            .to_string_lossy()
            .into_owned(),
    };

    let mut args = cfg.tool.args.clone();
    if args.iter().any(|a| a == "tool-server") && !args.iter().any(|a| a == "--db") {
        args.push("--db".to_string());
        args.push(cfg.db_path().to_string_lossy().into_owned());
    }
    Ok(ServerCommand::new(program, args))
}

fn build_orchestrator(cfg: &ScribeConfig, store: &MeetingStore) -> Result<Orchestrator> {
    let tools: Arc<dyn ToolClient> = match cfg.tool.transport {
        // Share the already-open store with the in-process server
        ToolTransport::Embedded if !cfg.tool.pooled => Arc::new(
            EmbeddedToolClient::new(TaskToolServer::new(store.clone()))
                .with_timeout(Duration::from_secs(cfg.tool.timeout_secs)),
        ),
        _ => build_tool_client(cfg)?,
    };

    let mut router = Router::new(build_model(cfg, cfg.router.model.as_deref())?);
    if let Some(prompt) = &cfg.router.system_prompt {
        router = router.with_system_prompt(prompt.clone());
    }

    let task_cfg = &cfg.specialists.task_management;
    let task_model = build_model(cfg, task_cfg.model.as_deref())?;
    let mut task = TaskManagementSpecialist::new(task_model, tools);
    if let Some(prompt) = &task_cfg.system_message {
        task = task.with_system_prompt(prompt.clone());
    }

    let chat_cfg = &cfg.specialists.meeting_chat;
    let mut chat = MeetingChatSpecialist::new(build_model(cfg, chat_cfg.model.as_deref())?);
    if let Some(prompt) = &chat_cfg.system_message {
        chat = chat.with_system_prompt(prompt.clone());
    }

    let orchestrator = Orchestrator::builder(router)
        .specialist(task.into_specialist())
        .specialist(chat.into_specialist())
        .build()?;
    Ok(orchestrator)
}

/// Conversation prefix describing the selected meeting, if any
async fn meeting_context(store: &MeetingStore, meeting: Option<i64>) -> Result<Vec<Message>> {
    let Some(id) = meeting else {
        return Ok(Vec::new());
    };
    let meeting = store
        .get_meeting(id)
        .await?
        .ok_or_else(|| anyhow!("Meeting {} not found", id))?;
    Ok(vec![meeting_context_message(&meeting)])
}

fn meeting_context_message(meeting: &Meeting) -> Message {
    let record = meeting
        .summary
        .as_deref()
        .or(meeting.transcript.as_deref())
        .unwrap_or("(无会议记录)");
    let tasks = if meeting.tasks.is_empty() {
        "(无任务)".to_string()
    } else {
        meeting.task_checklist()
    };
    Message::system(format!(
        "当前会议ID: {}\n会议名称: {}\n\n会议记录:\n{}\n\n任务列表（[x] 表示已完成，序号从0开始）:\n{}",
        meeting.id, meeting.name, record, tasks
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use scribe_store::TaskStatusBits;

    #[tokio::test]
    async fn test_meeting_context_message() {
        let temp = tempfile::tempdir().unwrap();
        let store = open_store(&temp.path().join("nested").join("meetings.db")).unwrap();
        let id = store
            .create_meeting(NewMeeting {
                name: "进度跟进会议".to_string(),
                summary: Some("产品A完成了80%".to_string()),
                tasks: vec!["修复崩溃".to_string(), "优化登录界面".to_string()],
                ..Default::default()
            })
            .await
            .unwrap();
        store
            .set_status_bits(id, TaskStatusBits::new(0b01))
            .await
            .unwrap();

        let messages = meeting_context(&store, Some(id)).await.unwrap();
        assert_eq!(messages.len(), 1);
        let content = &messages[0].content;
        assert!(content.contains(&format!("当前会议ID: {}", id)));
        assert!(content.contains("产品A完成了80%"));
        assert!(content.contains("0. [x] 修复崩溃"));
        assert!(content.contains("1. [ ] 优化登录界面"));

        assert!(meeting_context(&store, None).await.unwrap().is_empty());
        assert!(meeting_context(&store, Some(id + 100)).await.is_err());
    }

    #[test]
    fn test_tool_server_command_shares_database() {
        let mut cfg = ScribeConfig::parse(
            "[model]\nmodel = \"m\"\n[store]\ndb_path = \"/data/custom.db\"\n",
        )
        .unwrap();

        let command = tool_server_command(&cfg).unwrap();
        let exe = std::env::current_exe().unwrap();
        assert_eq!(command.program, exe.to_string_lossy());
        assert_eq!(command.args, ["tool-server", "--db", "/data/custom.db"]);

        // The spawned server must accept what we pass it
        let cli = Cli::try_parse_from(
            std::iter::once("scribe".to_string()).chain(command.args.iter().cloned()),
        )
        .unwrap();
        assert!(matches!(
            cli.command,
            Commands::ToolServer { db: Some(ref db) } if db == &PathBuf::from("/data/custom.db")
        ));

        cfg.tool.command = Some("/opt/scribe".to_string());
        cfg.tool.args = vec!["tool-server".to_string(), "--db".to_string(), "/x.db".to_string()];
        let command = tool_server_command(&cfg).unwrap();
        assert_eq!(command.program, "/opt/scribe");
        assert_eq!(command.args, ["tool-server", "--db", "/x.db"]);

        cfg.tool.command = Some("other-server".to_string());
        cfg.tool.args = vec!["--stdio".to_string()];
        assert_eq!(tool_server_command(&cfg).unwrap().args, ["--stdio"]);
    }

    #[test]
    fn test_cli_parses_subcommands() {
        let cli = Cli::try_parse_from([
            "scribe", "call-tool", "--meeting", "1", "--task", "2", "--status", "true",
        ])
        .unwrap();
        assert!(matches!(
            cli.command,
            Commands::CallTool { ref meeting, ref task, ref status }
                if meeting == "1" && task == "2" && status == "true"
        ));

        let cli = Cli::try_parse_from([
            "scribe", "meetings", "add", "--name", "weekly", "--task", "a", "--task", "b",
        ])
        .unwrap();
        match cli.command {
            Commands::Meetings {
                command: MeetingsCommand::Add { name, tasks, .. },
            } => {
                assert_eq!(name, "weekly");
                assert_eq!(tasks, ["a", "b"]);
            }
            _ => panic!("expected meetings add"),
        }

        let cli = Cli::try_parse_from(["scribe", "--debug", "chat", "--meeting", "3"]).unwrap();
        assert!(cli.debug);
        assert!(matches!(cli.command, Commands::Chat { meeting: Some(3) }));
    }
}
