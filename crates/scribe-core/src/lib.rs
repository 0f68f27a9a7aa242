//! scribe-core: intent routing, specialist dispatch and streaming for the
//! scribe meeting assistant.

pub mod context;
pub mod error;
pub mod orchestrator;
pub mod pipe;
pub mod prompts;
pub mod providers;
pub mod router;
pub mod specialist;
pub mod specialists;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod tool;
pub mod types;

pub use context::{HandOffInfo, HandOffObserver, LogHandOff, RequestContext};
pub use error::{AgentError, AgentResult};
pub use orchestrator::{Orchestrator, OrchestratorBuilder};
pub use pipe::{concat_messages, pipe, ReaderClosed, RecvError, StreamReader, StreamWriter};
pub use providers::{ChatModel, OpenAiCompatModel};
pub use router::{HandOffDecision, Router};
pub use specialist::{AgentMeta, InvokableHandler, Specialist, SpecialistHandler, StreamableHandler};
pub use specialists::{MeetingChatSpecialist, TaskAction, TaskManagementSpecialist};
pub use tool::{ToolClient, ToolError, ToolFailure, ToolFailureKind, ToolOutput, UPDATE_TASK_STATUS};
pub use types::{Message, Role};
