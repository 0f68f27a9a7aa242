//! SQLite storage for meetings and their task state

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::bitset::{TaskStatusBits, MAX_TASKS};
use crate::error::{StoreError, StoreResult};

/// Stored meeting record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Meeting {
    pub id: i64,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcript: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    pub tasks: Vec<String>,
    pub status_bits: TaskStatusBits,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat_history: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remark: Option<String>,
    pub audio_filename: String,
    pub uploaded_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl Meeting {
    /// Task list as a checklist, one `[x]`/`[ ]` line per task
    pub fn task_checklist(&self) -> String {
        self.tasks
            .iter()
            .enumerate()
            .map(|(i, task)| {
                let mark = if self.status_bits.is_complete(i) { "x" } else { " " };
                format!("{}. [{}] {}", i, mark, task)
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Fields needed to insert a meeting
#[derive(Debug, Clone, Default)]
pub struct NewMeeting {
    pub name: String,
    pub transcript: Option<String>,
    pub summary: Option<String>,
    pub tasks: Vec<String>,
    pub remark: Option<String>,
    pub audio_filename: String,
}

/// Outcome of a task status change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStatusUpdate {
    pub meeting_id: i64,
    pub task_index: usize,
    pub completed: bool,
    pub status_bits: TaskStatusBits,
    pub task_count: usize,
}

const MEETING_COLUMNS: &str = "id, name, transcript, summary_text, tasks_json, tasks_status_num,
     chat_history, remark, audio_filename, uploaded_at, modified_at";

/// SQLite meeting store (thread-safe via Arc<Mutex>)
#[derive(Clone)]
pub struct MeetingStore {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for MeetingStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeetingStore").finish_non_exhaustive()
    }
}

impl MeetingStore {
    /// Open (or create) the database at `path` and initialize the schema
    pub fn new<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        info!("Opening meeting database at {:?}", path.as_ref());
        let conn = Connection::open(path.as_ref())?;
        Self::with_connection(conn)
    }

    /// In-memory database, mostly for tests and the embedded tool server
    pub fn open_in_memory() -> StoreResult<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> StoreResult<Self> {
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool
    async fn run<T, F>(&self, f: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> StoreResult<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().unwrap_or_else(|poisoned| {
                warn!("Database mutex was poisoned, recovering");
                poisoned.into_inner()
            });
            f(&mut conn)
        })
        .await
        .map_err(|e| StoreError::Worker(e.to_string()))?
    }

    /// Insert a meeting and return its id
    pub async fn create_meeting(&self, meeting: NewMeeting) -> StoreResult<i64> {
        if meeting.tasks.len() > MAX_TASKS {
            return Err(StoreError::TooManyTasks(meeting.tasks.len()));
        }

        self.run(move |conn| {
            let now = Utc::now().to_rfc3339();
            let tasks_json = serde_json::to_string(&meeting.tasks)?;
            let inserted = conn.execute(
                "INSERT INTO meetings (
                    name, transcript, summary_text, tasks_json, tasks_status_num,
                    chat_history, remark, audio_filename, uploaded_at, modified_at
                 ) VALUES (?1, ?2, ?3, ?4, 0, NULL, ?5, ?6, ?7, ?7)",
                params![
                    &meeting.name,
                    &meeting.transcript,
                    &meeting.summary,
                    tasks_json,
                    &meeting.remark,
                    &meeting.audio_filename,
                    now,
                ],
            );

            match inserted {
                Ok(_) => {}
                Err(rusqlite::Error::SqliteFailure(err, _))
                    if err.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    return Err(StoreError::DuplicateName(meeting.name));
                }
                Err(e) => return Err(e.into()),
            }

            let id = conn.last_insert_rowid();
            debug!("Inserted meeting {} ({} tasks)", id, meeting.tasks.len());
            Ok(id)
        })
        .await
    }

    /// All meetings that have not been deleted, newest first
    pub async fn list_meetings(&self) -> StoreResult<Vec<Meeting>> {
        self.run(|conn| {
            let sql = format!(
                "SELECT {} FROM meetings WHERE deleted_at IS NULL ORDER BY uploaded_at DESC, id DESC",
                MEETING_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let meetings = stmt
                .query_map([], row_to_meeting)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(meetings)
        })
        .await
    }

    pub async fn get_meeting(&self, id: i64) -> StoreResult<Option<Meeting>> {
        self.run(move |conn| {
            let sql = format!(
                "SELECT {} FROM meetings WHERE id = ?1 AND deleted_at IS NULL",
                MEETING_COLUMNS
            );
            let meeting = conn.query_row(&sql, params![id], row_to_meeting).optional()?;
            Ok(meeting)
        })
        .await
    }

    /// Soft-delete a meeting. Returns false if it did not exist.
    pub async fn delete_meeting(&self, id: i64) -> StoreResult<bool> {
        self.run(move |conn| {
            let now = Utc::now().to_rfc3339();
            let changed = conn.execute(
                "UPDATE meetings SET deleted_at = ?1 WHERE id = ?2 AND deleted_at IS NULL",
                params![now, id],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    /// Task list and current completion bits of a meeting
    pub async fn get_tasks_and_status(
        &self,
        id: i64,
    ) -> StoreResult<(Vec<String>, TaskStatusBits)> {
        self.run(move |conn| load_task_state(conn, id)).await
    }

    /// Overwrite the completion bits of a meeting
    pub async fn set_status_bits(&self, id: i64, bits: TaskStatusBits) -> StoreResult<()> {
        self.run(move |conn| {
            let changed = conn.execute(
                "UPDATE meetings SET tasks_status_num = ?1, modified_at = ?2
                 WHERE id = ?3 AND deleted_at IS NULL",
                params![bits.to_stored(), Utc::now().to_rfc3339(), id],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(id));
            }
            Ok(())
        })
        .await
    }

    /// Mark one task done or not done.
    ///
    /// The read-modify-write runs inside a single IMMEDIATE transaction so
    /// concurrent edits on the same meeting cannot lose each other's bits.
    pub async fn update_task_status(
        &self,
        id: i64,
        index: i64,
        completed: bool,
    ) -> StoreResult<TaskStatusUpdate> {
        self.run(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let (tasks, bits) = load_task_state(&tx, id)?;

            let task_index = usize::try_from(index)
                .ok()
                .filter(|i| *i < tasks.len() && *i < MAX_TASKS)
                .ok_or(StoreError::IndexOutOfRange {
                    meeting_id: id,
                    index,
                    task_count: tasks.len(),
                })?;

            let updated = bits.apply(task_index, completed);
            tx.execute(
                "UPDATE meetings SET tasks_status_num = ?1, modified_at = ?2 WHERE id = ?3",
                params![updated.to_stored(), Utc::now().to_rfc3339(), id],
            )?;
            tx.commit()?;

            debug!(
                "Meeting {} task {} -> {} (status bits {:#b} -> {:#b})",
                id, task_index, completed, bits, updated
            );

            Ok(TaskStatusUpdate {
                meeting_id: id,
                task_index,
                completed,
                status_bits: updated,
                task_count: tasks.len(),
            })
        })
        .await
    }
}

fn init_schema(conn: &Connection) -> StoreResult<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS meetings (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            transcript TEXT,
            summary_text TEXT,
            tasks_json TEXT,
            tasks_status_num INTEGER DEFAULT 0,
            chat_history TEXT,
            remark TEXT,
            audio_filename TEXT NOT NULL,
            uploaded_at TEXT NOT NULL,
            modified_at TEXT NOT NULL,
            deleted_at TEXT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_meetings_name ON meetings(name)",
        [],
    )?;

    debug!("Meeting schema initialized");
    Ok(())
}

fn load_task_state(conn: &Connection, id: i64) -> StoreResult<(Vec<String>, TaskStatusBits)> {
    let row: Option<(Option<String>, Option<i64>)> = conn
        .query_row(
            "SELECT tasks_json, tasks_status_num FROM meetings WHERE id = ?1 AND deleted_at IS NULL",
            params![id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    let (tasks_json, status_num) = row.ok_or(StoreError::NotFound(id))?;
    let tasks = decode_tasks(tasks_json.as_deref()).map_err(|e| StoreError::MalformedState {
        meeting_id: id,
        reason: format!("invalid tasks JSON: {}", e),
    })?;
    let bits = TaskStatusBits::from_stored(status_num.unwrap_or(0)).ok_or_else(|| {
        StoreError::MalformedState {
            meeting_id: id,
            reason: format!("negative status value {}", status_num.unwrap_or(0)),
        }
    })?;

    Ok((tasks, bits))
}

fn decode_tasks(raw: Option<&str>) -> Result<Vec<String>, serde_json::Error> {
    match raw.map(str::trim) {
        None | Some("") | Some("null") => Ok(Vec::new()),
        Some(json) => serde_json::from_str(json),
    }
}

fn row_to_meeting(row: &rusqlite::Row<'_>) -> rusqlite::Result<Meeting> {
    let tasks_json: Option<String> = row.get(4)?;
    let tasks = decode_tasks(tasks_json.as_deref()).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let status_num: Option<i64> = row.get(5)?;

    Ok(Meeting {
        id: row.get(0)?,
        name: row.get(1)?,
        transcript: row.get(2)?,
        summary: row.get(3)?,
        tasks,
        status_bits: TaskStatusBits::from_stored(status_num.unwrap_or(0)).unwrap_or_default(),
        chat_history: row.get(6)?,
        remark: row.get(7)?,
        audio_filename: row.get(8)?,
        uploaded_at: row.get::<_, String>(9)?.parse().unwrap_or_else(|_| Utc::now()),
        modified_at: row.get::<_, String>(10)?.parse().unwrap_or_else(|_| Utc::now()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample(name: &str, tasks: &[&str]) -> NewMeeting {
        NewMeeting {
            name: name.to_string(),
            summary: Some("进度跟进会议".to_string()),
            tasks: tasks.iter().map(|t| t.to_string()).collect(),
            audio_filename: format!("{}.txt", name),
            ..Default::default()
        }
    }

    async fn store_with_meeting(tasks: &[&str]) -> (TempDir, MeetingStore, i64) {
        let temp = TempDir::new().unwrap();
        let store = MeetingStore::new(temp.path().join("meetings.db")).unwrap();
        let id = store.create_meeting(sample("weekly", tasks)).await.unwrap();
        (temp, store, id)
    }

    #[tokio::test]
    async fn test_create_and_get_meeting() {
        let (_temp, store, id) = store_with_meeting(&["修复崩溃", "优化登录界面"]).await;

        let meeting = store.get_meeting(id).await.unwrap().unwrap();
        assert_eq!(meeting.name, "weekly");
        assert_eq!(meeting.tasks.len(), 2);
        assert_eq!(meeting.status_bits.bits(), 0);

        assert!(store.get_meeting(id + 100).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_name_rejected() {
        let (_temp, store, _id) = store_with_meeting(&["a"]).await;
        let err = store.create_meeting(sample("weekly", &["b"])).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateName(name) if name == "weekly"));
    }

    #[tokio::test]
    async fn test_too_many_tasks_rejected() {
        let store = MeetingStore::open_in_memory().unwrap();
        let tasks: Vec<String> = (0..=MAX_TASKS).map(|i| format!("task {}", i)).collect();
        let err = store
            .create_meeting(NewMeeting {
                name: "big".to_string(),
                tasks,
                audio_filename: "big.txt".to_string(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::TooManyTasks(64)));
    }

    #[tokio::test]
    async fn test_update_task_status_sets_and_clears() {
        let (_temp, store, id) = store_with_meeting(&["a", "b", "c"]).await;

        let update = store.update_task_status(id, 1, true).await.unwrap();
        assert_eq!(update.status_bits.bits(), 0b010);
        assert_eq!(update.task_count, 3);

        let again = store.update_task_status(id, 1, true).await.unwrap();
        assert_eq!(again.status_bits, update.status_bits);

        let cleared = store.update_task_status(id, 1, false).await.unwrap();
        assert_eq!(cleared.status_bits.bits(), 0);

        let (tasks, bits) = store.get_tasks_and_status(id).await.unwrap();
        assert_eq!(tasks, vec!["a", "b", "c"]);
        assert_eq!(bits.bits(), 0);
    }

    #[tokio::test]
    async fn test_out_of_range_leaves_bits_unchanged() {
        let (_temp, store, id) = store_with_meeting(&["a", "b", "c"]).await;
        store.set_status_bits(id, TaskStatusBits::new(0b101)).await.unwrap();

        for index in [-1, 3, 64] {
            let err = store.update_task_status(id, index, true).await.unwrap_err();
            assert!(matches!(err, StoreError::IndexOutOfRange { index: i, .. } if i == index));
        }

        let (_, bits) = store.get_tasks_and_status(id).await.unwrap();
        assert_eq!(bits.bits(), 0b101);
    }

    #[tokio::test]
    async fn test_missing_meeting() {
        let store = MeetingStore::open_in_memory().unwrap();
        assert!(matches!(
            store.update_task_status(99, 0, true).await,
            Err(StoreError::NotFound(99))
        ));
        assert!(matches!(
            store.set_status_bits(99, TaskStatusBits::default()).await,
            Err(StoreError::NotFound(99))
        ));
    }

    #[tokio::test]
    async fn test_deleted_meeting_not_found() {
        let (_temp, store, id) = store_with_meeting(&["a"]).await;
        assert!(store.delete_meeting(id).await.unwrap());
        assert!(!store.delete_meeting(id).await.unwrap());
        assert!(store.get_meeting(id).await.unwrap().is_none());
        assert!(store.list_meetings().await.unwrap().is_empty());
        assert!(matches!(
            store.update_task_status(id, 0, true).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_malformed_tasks_json() {
        let (_temp, store, id) = store_with_meeting(&["a"]).await;
        {
            let conn = store.conn.lock().unwrap();
            conn.execute(
                "UPDATE meetings SET tasks_json = 'not json' WHERE id = ?1",
                params![id],
            )
            .unwrap();
        }
        let err = store.update_task_status(id, 0, true).await.unwrap_err();
        assert!(matches!(err, StoreError::MalformedState { meeting_id, .. } if meeting_id == id));
    }

    #[tokio::test]
    async fn test_concurrent_updates_do_not_clobber() {
        let (_temp, store, id) = store_with_meeting(&["a", "b", "c", "d", "e", "f"]).await;

        let mut handles = Vec::new();
        for i in 0..6 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.update_task_status(id, i, true).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let (_, bits) = store.get_tasks_and_status(id).await.unwrap();
        assert_eq!(bits.bits(), 0b111111);
    }

    #[tokio::test]
    async fn test_list_and_checklist() {
        let (_temp, store, id) = store_with_meeting(&["修复崩溃", "优化登录界面"]).await;
        store.create_meeting(sample("retro", &[])).await.unwrap();
        store.update_task_status(id, 0, true).await.unwrap();

        let meetings = store.list_meetings().await.unwrap();
        assert_eq!(meetings.len(), 2);

        let weekly = meetings.iter().find(|m| m.id == id).unwrap();
        assert_eq!(weekly.task_checklist(), "0. [x] 修复崩溃\n1. [ ] 优化登录界面");
    }
}
