use thiserror::Error;

/// Error taxonomy for the task execution core.
///
/// Variants are grouped by the phase of a task's life they surface in:
/// admission, repository, execution, and recovery.
#[derive(Debug, Error)]
pub enum TaskCoreError {
    // --- Admission ---
    #[error("project busy: task {existing_task_id} is already running in this working directory")]
    ProjectBusy { existing_task_id: String },

    #[error("capacity exceeded: {running}/{max} tasks already running")]
    CapacityExceeded { running: usize, max: usize },

    // --- Repository ---
    #[error("duplicate task id: {0}")]
    DuplicateId(String),

    #[error("task not found: {0}")]
    NotFound(String),

    // --- Execution ---
    #[error("task {task_id} exceeded cost limit: ${accumulated:.2} > ${limit:.2}")]
    CostLimitExceeded {
        task_id: String,
        accumulated: f64,
        limit: f64,
    },

    #[error("provider error (retryable): {0}")]
    ProviderTransient(String),

    #[error("provider error (retry budget exhausted): {0}")]
    ProviderFatal(String),

    #[error("task cancelled")]
    Cancelled,

    // --- Recovery ---
    #[error("process restarted; task aborted")]
    RecoveryMarked,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl TaskCoreError {
    /// Whether the caller of `_run_task`'s retry loop should attempt another pass.
    ///
    /// Cancellation and cost-limit breaches must never be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TaskCoreError::ProviderTransient(_))
    }

    /// The message that belongs on the task record's `error_message` field.
    pub fn user_message(&self) -> String {
        self.to_string()
    }
}

pub type Result<T> = std::result::Result<T, TaskCoreError>;
