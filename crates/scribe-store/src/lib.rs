//! scribe-store - persistence for meetings and task completion state
//!
//! This crate provides:
//! - SQLite storage for meeting records (transcript, summary, task list)
//! - The per-meeting task status bitset and its atomic update

pub mod bitset;
pub mod error;
pub mod meetings;

pub use bitset::{TaskStatusBits, MAX_TASKS};
pub use error::{StoreError, StoreResult};
pub use meetings::{Meeting, MeetingStore, NewMeeting, TaskStatusUpdate};
