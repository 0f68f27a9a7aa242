use thiserror::Error;

/// Errors from the meeting store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("meeting {0} not found")]
    NotFound(i64),

    #[error("task index {index} out of range for meeting {meeting_id} ({task_count} tasks)")]
    IndexOutOfRange {
        meeting_id: i64,
        index: i64,
        task_count: usize,
    },

    #[error("meeting has {0} tasks, at most {max} are supported", max = crate::MAX_TASKS)]
    TooManyTasks(usize),

    #[error("meeting {meeting_id} has malformed task state: {reason}")]
    MalformedState { meeting_id: i64, reason: String },

    #[error("a meeting named {0:?} already exists")]
    DuplicateName(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("failed to encode tasks: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("database worker failed: {0}")]
    Worker(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;
