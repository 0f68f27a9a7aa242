//! Built-in specialists

pub mod chat;
pub mod task;

pub use chat::MeetingChatSpecialist;
pub use task::{TaskAction, TaskManagementSpecialist};
