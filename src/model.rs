use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Status of a task record. Transitions are monotonic and one-way:
/// `Running -> {Completed, Failed, Stopped}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Running,
    Completed,
    Failed,
    Stopped,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, TaskStatus::Running)
    }
}

/// A single commit observed as side-effect evidence of a task's run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRef {
    pub sha: String,
    pub message: String,
}

/// The central entity: a long-running agent execution against a working directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub user_id: i64,
    pub working_dir: String,
    pub prompt: String,
    pub status: TaskStatus,
    /// Opaque handle threaded back to the LLM provider to resume a prior conversation.
    pub continuation_handle: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub total_cost: f64,
    pub total_turns: u32,
    pub last_output: Option<String>,
    pub last_activity_at: DateTime<Utc>,
    pub result_summary: Option<String>,
    pub error_message: Option<String>,
    pub commits: Vec<CommitRef>,
    pub chat_id: i64,
    pub message_thread_id: Option<i64>,
}

impl Task {
    pub fn new(
        id: String,
        user_id: i64,
        working_dir: String,
        prompt: String,
        chat_id: i64,
        message_thread_id: Option<i64>,
        continuation_handle: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Task {
            id,
            user_id,
            working_dir,
            prompt,
            status: TaskStatus::Running,
            continuation_handle,
            created_at: now,
            finished_at: None,
            total_cost: 0.0,
            total_turns: 0,
            last_output: None,
            last_activity_at: now,
            result_summary: None,
            error_message: None,
            commits: Vec::new(),
            chat_id,
            message_thread_id,
        }
    }
}

/// Lifecycle events published to the event bus. Every variant carries the
/// task id, elapsed seconds since start, accumulated cost, and routing info.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskEvent {
    Started {
        task_id: String,
        elapsed_seconds: i64,
        cost: f64,
        chat_id: i64,
        message_thread_id: Option<i64>,
        working_dir: String,
        prompt: String,
        user_id: i64,
    },
    Progress {
        task_id: String,
        elapsed_seconds: i64,
        cost: f64,
        chat_id: i64,
        message_thread_id: Option<i64>,
        stage: String,
    },
    Completed {
        task_id: String,
        elapsed_seconds: i64,
        cost: f64,
        chat_id: i64,
        message_thread_id: Option<i64>,
        duration_seconds: i64,
        commits: Vec<CommitRef>,
        result_summary: Option<String>,
    },
    Failed {
        task_id: String,
        elapsed_seconds: i64,
        cost: f64,
        chat_id: i64,
        message_thread_id: Option<i64>,
        duration_seconds: i64,
        error_message: String,
        last_output: Option<String>,
    },
    Timeout {
        task_id: String,
        elapsed_seconds: i64,
        cost: f64,
        chat_id: i64,
        message_thread_id: Option<i64>,
        duration_seconds: i64,
        idle_seconds: i64,
    },
}

impl TaskEvent {
    pub fn task_id(&self) -> &str {
        match self {
            TaskEvent::Started { task_id, .. }
            | TaskEvent::Progress { task_id, .. }
            | TaskEvent::Completed { task_id, .. }
            | TaskEvent::Failed { task_id, .. }
            | TaskEvent::Timeout { task_id, .. } => task_id,
        }
    }

    /// The tag used to index subscribers in the event bus.
    pub fn kind(&self) -> TaskEventKind {
        match self {
            TaskEvent::Started { .. } => TaskEventKind::Started,
            TaskEvent::Progress { .. } => TaskEventKind::Progress,
            TaskEvent::Completed { .. } => TaskEventKind::Completed,
            TaskEvent::Failed { .. } => TaskEventKind::Failed,
            TaskEvent::Timeout { .. } => TaskEventKind::Timeout,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskEventKind {
    Started,
    Progress,
    Completed,
    Failed,
    Timeout,
}
