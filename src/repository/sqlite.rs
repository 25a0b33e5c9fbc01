use async_trait::async_trait;
use chrono::Utc;
use sqlx::{sqlite::SqlitePoolOptions, Row, SqlitePool};

use super::{StatusUpdate, TaskRepository};
use crate::error::{Result, TaskCoreError};
use crate::model::{CommitRef, Task, TaskStatus};

/// SQLite-backed repository, grounded on the original implementation's
/// schema (`repository.py`) and the teacher's atomic-write conventions
/// (`scheduler/store.rs`). `update_progress` uses a conditional
/// `SET total_cost = total_cost + ?` rather than read-modify-write so
/// concurrent stream callbacks never lose an update.
pub struct SqliteTaskRepository {
    pool: SqlitePool,
}

impl SqliteTaskRepository {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        let repo = SqliteTaskRepository { pool };
        repo.migrate().await?;
        Ok(repo)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS background_tasks (
                id TEXT PRIMARY KEY,
                user_id INTEGER NOT NULL,
                working_dir TEXT NOT NULL,
                prompt TEXT NOT NULL,
                status TEXT NOT NULL,
                continuation_handle TEXT,
                created_at TEXT NOT NULL,
                finished_at TEXT,
                total_cost REAL NOT NULL DEFAULT 0,
                total_turns INTEGER NOT NULL DEFAULT 0,
                last_output TEXT,
                last_activity_at TEXT NOT NULL,
                result_summary TEXT,
                error_message TEXT,
                commits_json TEXT NOT NULL DEFAULT '[]',
                chat_id INTEGER NOT NULL,
                message_thread_id INTEGER
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    fn row_to_task(row: &sqlx::sqlite::SqliteRow) -> Result<Task> {
        let status_str: String = row.try_get("status")?;
        let status = match status_str.as_str() {
            "running" => TaskStatus::Running,
            "completed" => TaskStatus::Completed,
            "failed" => TaskStatus::Failed,
            "stopped" => TaskStatus::Stopped,
            other => return Err(TaskCoreError::Other(anyhow::anyhow!("unknown status: {other}"))),
        };
        let commits_json: String = row.try_get("commits_json")?;
        let commits: Vec<CommitRef> = serde_json::from_str(&commits_json)?;
        // Decoded as text rather than via sqlx's `DateTime<Utc>` so that
        // legacy naive timestamps (no offset) can be normalised to UTC
        // instead of failing to decode.
        let created_at_raw: String = row.try_get("created_at")?;
        let last_activity_at_raw: String = row.try_get("last_activity_at")?;
        let finished_at_raw: Option<String> = row.try_get("finished_at")?;
        let created_at = super::parse_timestamp(&created_at_raw)?;
        let last_activity_at = super::parse_timestamp(&last_activity_at_raw)?;
        let finished_at = super::parse_optional_timestamp(finished_at_raw)?;

        Ok(Task {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            working_dir: row.try_get("working_dir")?,
            prompt: row.try_get("prompt")?,
            status,
            continuation_handle: row.try_get("continuation_handle")?,
            created_at,
            finished_at,
            total_cost: row.try_get("total_cost")?,
            total_turns: {
                let n: i64 = row.try_get("total_turns")?;
                n as u32
            },
            last_output: row.try_get("last_output")?,
            last_activity_at,
            result_summary: row.try_get("result_summary")?,
            error_message: row.try_get("error_message")?,
            commits,
            chat_id: row.try_get("chat_id")?,
            message_thread_id: row.try_get("message_thread_id")?,
        })
    }
}

fn status_str(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Running => "running",
        TaskStatus::Completed => "completed",
        TaskStatus::Failed => "failed",
        TaskStatus::Stopped => "stopped",
    }
}

#[async_trait]
impl TaskRepository for SqliteTaskRepository {
    async fn create(&self, task: Task) -> Result<()> {
        let commits_json = serde_json::to_string(&task.commits)?;
        let result = sqlx::query(
            r#"
            INSERT INTO background_tasks
                (id, user_id, working_dir, prompt, status, continuation_handle,
                 created_at, finished_at, total_cost, total_turns, last_output,
                 last_activity_at, result_summary, error_message, commits_json,
                 chat_id, message_thread_id)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&task.id)
        .bind(task.user_id)
        .bind(&task.working_dir)
        .bind(&task.prompt)
        .bind(status_str(task.status))
        .bind(&task.continuation_handle)
        .bind(task.created_at)
        .bind(task.finished_at)
        .bind(task.total_cost)
        .bind(task.total_turns as i64)
        .bind(&task.last_output)
        .bind(task.last_activity_at)
        .bind(&task.result_summary)
        .bind(&task.error_message)
        .bind(commits_json)
        .bind(task.chat_id)
        .bind(task.message_thread_id)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.message().contains("UNIQUE") => {
                Err(TaskCoreError::DuplicateId(task.id))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, id: &str) -> Result<Option<Task>> {
        let row = sqlx::query("SELECT * FROM background_tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_task).transpose()
    }

    async fn update_status(
        &self,
        id: &str,
        new_status: TaskStatus,
        update: StatusUpdate,
    ) -> Result<()> {
        let now = Utc::now();
        let finished_at = if new_status.is_terminal() { Some(now) } else { None };
        let commits_json = update
            .commits
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        sqlx::query(
            r#"
            UPDATE background_tasks SET
                status = ?,
                finished_at = COALESCE(?, finished_at),
                result_summary = COALESCE(?, result_summary),
                error_message = COALESCE(?, error_message),
                continuation_handle = COALESCE(?, continuation_handle),
                commits_json = COALESCE(?, commits_json),
                last_activity_at = ?
            WHERE id = ?
            "#,
        )
        .bind(status_str(new_status))
        .bind(finished_at)
        .bind(&update.result_summary)
        .bind(&update.error_message)
        .bind(&update.continuation_handle)
        .bind(commits_json)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_progress(
        &self,
        id: &str,
        cost_delta: f64,
        last_output: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE background_tasks SET
                total_cost = total_cost + ?,
                total_turns = total_turns + 1,
                last_output = COALESCE(?, last_output),
                last_activity_at = ?
            WHERE id = ?
            "#,
        )
        .bind(cost_delta)
        .bind(last_output)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_running_for_project(&self, working_dir: &str) -> Result<Option<Task>> {
        let row = sqlx::query(
            "SELECT * FROM background_tasks WHERE status = 'running' AND working_dir = ? LIMIT 1",
        )
        .bind(working_dir)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::row_to_task).transpose()
    }

    async fn get_all_running(&self) -> Result<Vec<Task>> {
        let rows = sqlx::query("SELECT * FROM background_tasks WHERE status = 'running'")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_task).collect()
    }

    async fn count_running(&self) -> Result<usize> {
        let row = sqlx::query("SELECT COUNT(*) as n FROM background_tasks WHERE status = 'running'")
            .fetch_one(&self.pool)
            .await?;
        let n: i64 = row.try_get("n")?;
        Ok(n as usize)
    }

    async fn get_last_finished_for_project(&self, working_dir: &str) -> Result<Option<Task>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM background_tasks
            WHERE working_dir = ? AND status IN ('completed', 'failed')
            ORDER BY finished_at DESC
            LIMIT 1
            "#,
        )
        .bind(working_dir)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::row_to_task).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_repo() -> SqliteTaskRepository {
        SqliteTaskRepository::connect("sqlite::memory:").await.unwrap()
    }

    fn sample_task(id: &str, dir: &str) -> Task {
        Task::new(id.into(), 1, dir.into(), "do it".into(), 100, None, None)
    }

    #[tokio::test]
    async fn create_and_get_round_trips() {
        let repo = test_repo().await;
        repo.create(sample_task("abc", "/p")).await.unwrap();
        let task = repo.get("abc").await.unwrap().unwrap();
        assert_eq!(task.working_dir, "/p");
        assert_eq!(task.status, TaskStatus::Running);
    }

    #[tokio::test]
    async fn update_progress_uses_conditional_add() {
        let repo = test_repo().await;
        repo.create(sample_task("abc", "/p")).await.unwrap();
        repo.update_progress("abc", 0.3, Some("step 1")).await.unwrap();
        repo.update_progress("abc", 0.3, Some("step 2")).await.unwrap();
        let task = repo.get("abc").await.unwrap().unwrap();
        assert!((task.total_cost - 0.6).abs() < 1e-9);
        assert_eq!(task.total_turns, 2);
        assert_eq!(task.last_output.as_deref(), Some("step 2"));
    }

    #[tokio::test]
    async fn duplicate_create_fails() {
        let repo = test_repo().await;
        repo.create(sample_task("abc", "/p")).await.unwrap();
        let err = repo.create(sample_task("abc", "/p2")).await.unwrap_err();
        assert!(matches!(err, TaskCoreError::DuplicateId(_)));
    }
}
