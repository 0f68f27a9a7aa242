//! Per-meeting task completion flags packed into one integer

use serde::{Deserialize, Serialize};

/// Highest number of tasks a meeting may carry.
///
/// Bit 63 is left unused so the stored value always fits a non-negative
/// SQLite INTEGER.
pub const MAX_TASKS: usize = 63;

/// Completion state of a meeting's tasks, bit `i` set when task `i` is done.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskStatusBits(u64);

impl TaskStatusBits {
    pub const fn new(bits: u64) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    /// Decode the raw column value. Negative values come from rows written
    /// past the 63 task cap and are rejected.
    pub fn from_stored(value: i64) -> Option<Self> {
        u64::try_from(value).ok().map(Self)
    }

    /// Value as written to the `tasks_status_num` column
    pub fn to_stored(self) -> i64 {
        (self.0 & !(1u64 << MAX_TASKS)) as i64
    }

    pub fn is_complete(self, index: usize) -> bool {
        index < MAX_TASKS && self.0 & (1u64 << index) != 0
    }

    /// Mark task `index` as done
    pub fn complete(self, index: usize) -> Self {
        debug_assert!(index < MAX_TASKS);
        Self(self.0 | (1u64 << index))
    }

    /// Mark task `index` as not done
    pub fn reopen(self, index: usize) -> Self {
        debug_assert!(index < MAX_TASKS);
        Self(self.0 & !(1u64 << index))
    }

    pub fn apply(self, index: usize, completed: bool) -> Self {
        if completed {
            self.complete(index)
        } else {
            self.reopen(index)
        }
    }

    /// Number of completed tasks among the first `task_count`
    pub fn completed_count(self, task_count: usize) -> usize {
        (0..task_count.min(MAX_TASKS))
            .filter(|i| self.is_complete(*i))
            .count()
    }
}

impl std::fmt::Display for TaskStatusBits {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::fmt::Binary for TaskStatusBits {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Binary::fmt(&self.0, f)
    }
}
