mod memory;
mod sqlite;

pub use memory::InMemoryTaskRepository;
pub use sqlite::SqliteTaskRepository;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};

use crate::error::{Result, TaskCoreError};
use crate::model::{CommitRef, Task, TaskStatus};

/// Fields that may be updated alongside a status transition.
#[derive(Debug, Default, Clone)]
pub struct StatusUpdate {
    pub result_summary: Option<String>,
    pub error_message: Option<String>,
    pub continuation_handle: Option<String>,
    pub commits: Option<Vec<CommitRef>>,
}

/// Durable store of task records keyed by task id.
///
/// All mutating operations are serialisable with respect to each other on a
/// per-record basis. `update_progress` in particular must not lose updates
/// under concurrent callers — implementations use a conditional add at the
/// storage layer rather than read-modify-write.
#[async_trait]
pub trait TaskRepository: Send + Sync {
    async fn create(&self, task: Task) -> Result<()>;

    async fn get(&self, id: &str) -> Result<Option<Task>>;

    async fn update_status(
        &self,
        id: &str,
        new_status: TaskStatus,
        update: StatusUpdate,
    ) -> Result<()>;

    /// Atomically adds `cost_delta` (>= 0) to accumulated cost, increments the
    /// turn counter, writes `last_output` if provided, and refreshes
    /// `last_activity_at`.
    async fn update_progress(
        &self,
        id: &str,
        cost_delta: f64,
        last_output: Option<&str>,
    ) -> Result<()>;

    async fn get_running_for_project(&self, working_dir: &str) -> Result<Option<Task>>;

    async fn get_all_running(&self) -> Result<Vec<Task>>;

    async fn count_running(&self) -> Result<usize>;

    async fn get_last_finished_for_project(&self, working_dir: &str) -> Result<Option<Task>>;
}

/// Parses a timestamp column that is either an offset-aware RFC 3339 string
/// (this crate's own writer format) or a legacy naive `YYYY-MM-DD HH:MM:SS`
/// string with no offset, normalising the latter to UTC by assumption (the
/// original schema never stored any other zone).
pub(crate) fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Ok(naive.and_utc());
        }
    }
    Err(TaskCoreError::Other(anyhow::anyhow!(
        "unparseable timestamp: {raw:?}"
    )))
}

/// Same as [`parse_timestamp`] for an optional column.
pub(crate) fn parse_optional_timestamp(raw: Option<String>) -> Result<Option<DateTime<Utc>>> {
    raw.map(|s| parse_timestamp(&s)).transpose()
}
