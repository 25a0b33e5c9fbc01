use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{Result, TaskCoreError};
use crate::events::EventBus;
use crate::git::collect_commits;
use crate::heartbeat::HeartbeatService;
use crate::model::{Task, TaskEvent, TaskStatus};
use crate::provider::{LlmProvider, StreamCallback, StreamEvent};
use crate::repository::{StatusUpdate, TaskRepository};
use crate::settings::Settings;

struct RunningTask {
    token: CancellationToken,
    handle: tokio::task::JoinHandle<()>,
}

/// The core orchestrator. Enforces admission (per-project exclusion, global
/// cap), launches supervised executions, accumulates cost with a hard
/// ceiling, retries once on transient failures, finalizes state, publishes
/// lifecycle events, and recovers orphans on startup.
pub struct TaskManager {
    provider: Arc<dyn LlmProvider>,
    repo: Arc<dyn TaskRepository>,
    bus: EventBus,
    heartbeat: Arc<HeartbeatService>,
    settings: Settings,
    running: Arc<AsyncMutex<HashMap<String, RunningTask>>>,
    /// Guards the admission critical section (steps 1-4 of start_task) end
    /// to end, preventing two admissions racing for the same project or the
    /// last concurrency slot.
    admission_lock: Arc<AsyncMutex<()>>,
}

impl TaskManager {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        repo: Arc<dyn TaskRepository>,
        bus: EventBus,
        heartbeat: Arc<HeartbeatService>,
        settings: Settings,
    ) -> Self {
        TaskManager {
            provider,
            repo,
            bus,
            heartbeat,
            settings,
            running: Arc::new(AsyncMutex::new(HashMap::new())),
            admission_lock: Arc::new(AsyncMutex::new(())),
        }
    }

    /// Admits and launches a new task. Returns the fresh task id.
    #[allow(clippy::too_many_arguments)]
    pub async fn start_task(
        &self,
        prompt: String,
        working_dir: String,
        user_id: i64,
        chat_id: i64,
        thread_id: Option<i64>,
        continuation_handle: Option<String>,
    ) -> Result<String> {
        let _guard = self.admission_lock.lock().await;

        if let Some(existing) = self.repo.get_running_for_project(&working_dir).await? {
            return Err(TaskCoreError::ProjectBusy {
                existing_task_id: existing.id,
            });
        }

        let running_count = self.repo.count_running().await?;
        if running_count >= self.settings.max_concurrent_tasks {
            return Err(TaskCoreError::CapacityExceeded {
                running: running_count,
                max: self.settings.max_concurrent_tasks,
            });
        }

        let task_id = self.generate_unique_id().await?;
        let task = Task::new(
            task_id.clone(),
            user_id,
            working_dir.clone(),
            prompt.clone(),
            chat_id,
            thread_id,
            continuation_handle.clone(),
        );
        self.repo.create(task).await?;

        self.bus.publish(TaskEvent::Started {
            task_id: task_id.clone(),
            elapsed_seconds: 0,
            cost: 0.0,
            chat_id,
            message_thread_id: thread_id,
            working_dir: working_dir.clone(),
            prompt: prompt.clone(),
            user_id,
        });

        let token = CancellationToken::new();
        let handle = self.spawn_execution(
            task_id.clone(),
            prompt,
            working_dir,
            user_id,
            chat_id,
            thread_id,
            continuation_handle,
            token.clone(),
        );
        self.running
            .lock()
            .await
            .insert(task_id.clone(), RunningTask { token, handle });

        self.heartbeat.start(task_id.clone()).await;

        info!(task_id = %task_id, "task started");
        Ok(task_id)
    }

    /// Retries id generation on collision; collisions are a statistical
    /// edge case handled at the repository boundary via `DuplicateId`.
    async fn generate_unique_id(&self) -> Result<String> {
        for _ in 0..5 {
            let candidate: String = Uuid::new_v4().simple().to_string()[..8].to_string();
            if self.repo.get(&candidate).await?.is_none() {
                return Ok(candidate);
            }
        }
        Err(TaskCoreError::Other(anyhow::anyhow!(
            "failed to generate a unique task id after 5 attempts"
        )))
    }

    /// Idempotent: calling this on a completed or already-stopped task is a
    /// no-op beyond the repository write.
    pub async fn stop_task(&self, task_id: &str) -> Result<()> {
        // Bind the removed entry before matching: an `if let` scrutinee's
        // temporary guard lives until the end of the body, which would hold
        // `running` locked across `handle.await` below and deadlock against
        // the execution unit's own finalizer (which needs the same lock to
        // remove itself).
        let running = self.running.lock().await.remove(task_id);
        if let Some(running) = running {
            running.token.cancel();
            let _ = running.handle.await;
        }
        self.heartbeat.stop(task_id).await;
        self.repo
            .update_status(task_id, TaskStatus::Stopped, StatusUpdate::default())
            .await?;
        Ok(())
    }

    /// Invoked once at process startup. Marks every orphaned `running`
    /// record as `failed` without publishing events, since subscribers may
    /// not yet be attached. Completes before the Manager accepts new tasks.
    pub async fn recover(&self) -> Result<()> {
        let orphans = self.repo.get_all_running().await?;
        for task in orphans {
            warn!(task_id = %task.id, "marking orphaned task as failed on recovery");
            self.repo
                .update_status(
                    &task.id,
                    TaskStatus::Failed,
                    StatusUpdate {
                        error_message: Some("process restarted; task aborted".to_string()),
                        ..Default::default()
                    },
                )
                .await?;
        }
        Ok(())
    }

    pub async fn has_running(&self, working_dir: &str) -> Result<bool> {
        Ok(self.repo.get_running_for_project(working_dir).await?.is_some())
    }

    pub async fn get_running(&self, working_dir: &str) -> Result<Option<Task>> {
        self.repo.get_running_for_project(working_dir).await
    }

    pub async fn get_all_running(&self) -> Result<Vec<Task>> {
        self.repo.get_all_running().await
    }

    pub async fn get(&self, id: &str) -> Result<Option<Task>> {
        self.repo.get(id).await
    }

    /// Returns the latest finished record for the path, enabling a
    /// "continue previous" flow that reuses the continuation handle.
    pub async fn get_for_continue(&self, working_dir: &str) -> Result<Option<Task>> {
        self.repo.get_last_finished_for_project(working_dir).await
    }

    #[allow(clippy::too_many_arguments)]
    fn spawn_execution(
        &self,
        task_id: String,
        prompt: String,
        working_dir: String,
        user_id: i64,
        chat_id: i64,
        thread_id: Option<i64>,
        continuation_handle: Option<String>,
        token: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let provider = self.provider.clone();
        let repo = self.repo.clone();
        let bus = self.bus.clone();
        let heartbeat = self.heartbeat.clone();
        let running = self.running.clone();
        let settings = self.settings.clone();

        tokio::spawn(async move {
            run_execution_unit(
                ExecutionContext {
                    task_id: task_id.clone(),
                    prompt,
                    working_dir,
                    user_id,
                    chat_id,
                    thread_id,
                    continuation_handle,
                    provider,
                    repo,
                    bus,
                    settings,
                    token,
                },
            )
            .await;

            heartbeat.stop(&task_id).await;
            running.lock().await.remove(&task_id);
        })
    }
}

struct ExecutionContext {
    task_id: String,
    prompt: String,
    working_dir: String,
    user_id: i64,
    chat_id: i64,
    thread_id: Option<i64>,
    continuation_handle: Option<String>,
    provider: Arc<dyn LlmProvider>,
    repo: Arc<dyn TaskRepository>,
    bus: EventBus,
    settings: Settings,
    token: CancellationToken,
}

/// Private one-shot callback implementation: one instance per execution,
/// closing over a local accumulator and the task id, never shared.
struct ProgressCallback {
    task_id: String,
    repo: Arc<dyn TaskRepository>,
    limit: f64,
    accumulated: Arc<AsyncMutex<f64>>,
    token: CancellationToken,
}

#[async_trait]
impl StreamCallback for ProgressCallback {
    async fn on_event(&self, event: StreamEvent) -> Result<()> {
        if self.token.is_cancelled() {
            return Err(TaskCoreError::Cancelled);
        }
        let mut acc = self.accumulated.lock().await;
        *acc += event.cost;
        let current = *acc;
        drop(acc);

        let output = event.output.as_deref().or(event.tool_name.as_deref());
        self.repo.update_progress(&self.task_id, event.cost, output).await?;

        if current > self.limit {
            return Err(TaskCoreError::CostLimitExceeded {
                task_id: self.task_id.clone(),
                accumulated: current,
                limit: self.limit,
            });
        }
        Ok(())
    }
}

async fn run_execution_unit(ctx: ExecutionContext) {
    let start = Utc::now();
    let accumulated = Arc::new(AsyncMutex::new(0.0_f64));
    let mut last_error: Option<String> = None;

    // Two attempts total: the initial try plus exactly one retry.
    for attempt in 0..2 {
        let callback = ProgressCallback {
            task_id: ctx.task_id.clone(),
            repo: ctx.repo.clone(),
            limit: ctx.settings.task_max_cost,
            accumulated: accumulated.clone(),
            token: ctx.token.clone(),
        };

        let execute_fut = ctx.provider.execute(
            &ctx.prompt,
            &ctx.working_dir,
            ctx.user_id,
            ctx.continuation_handle.as_deref(),
            Some(&callback),
            false,
            ctx.settings.background_model.as_deref(),
        );

        let outcome = tokio::select! {
            biased;
            _ = ctx.token.cancelled() => Outcome::Cancelled,
            result = execute_fut => Outcome::Finished(result),
        };

        match outcome {
            Outcome::Cancelled => {
                // stop_task owns the status transition; no event here.
                return;
            }
            Outcome::Finished(Ok(response)) if !response.is_error => {
                let accumulated_cost = *accumulated.lock().await;
                let commits = collect_commits(&ctx.working_dir, start).await;
                let summary = truncate(&response.content, 500);
                let elapsed = (Utc::now() - start).num_seconds();

                let update_result = ctx
                    .repo
                    .update_status(
                        &ctx.task_id,
                        TaskStatus::Completed,
                        StatusUpdate {
                            result_summary: Some(summary.clone()),
                            continuation_handle: response.continuation_handle.clone(),
                            commits: Some(commits.clone()),
                            ..Default::default()
                        },
                    )
                    .await;
                if let Err(e) = update_result {
                    warn!(task_id = %ctx.task_id, error = %e, "failed to persist completion");
                    return;
                }

                ctx.bus.publish(TaskEvent::Completed {
                    task_id: ctx.task_id.clone(),
                    elapsed_seconds: elapsed,
                    cost: accumulated_cost + response.cost,
                    chat_id: ctx.chat_id,
                    message_thread_id: ctx.thread_id,
                    duration_seconds: elapsed,
                    commits,
                    result_summary: Some(summary),
                });
                return;
            }
            Outcome::Finished(Ok(response)) => {
                // is_error = true: treated as a transient failure.
                last_error = Some(
                    response
                        .error_message
                        .unwrap_or_else(|| "provider reported an error".to_string()),
                );
            }
            Outcome::Finished(Err(TaskCoreError::Cancelled)) => {
                return;
            }
            Outcome::Finished(Err(err @ TaskCoreError::CostLimitExceeded { .. })) => {
                finalize_failed(&ctx, &accumulated, err.user_message(), start).await;
                return;
            }
            Outcome::Finished(Err(err)) => {
                last_error = Some(err.user_message());
            }
        }

        if attempt == 0 {
            tokio::select! {
                _ = ctx.token.cancelled() => return,
                _ = tokio::time::sleep(std::time::Duration::from_secs_f64(ctx.settings.retry_delay_seconds)) => {}
            }
        }
    }

    let message = last_error.unwrap_or_else(|| "unknown provider failure".to_string());
    finalize_failed(&ctx, &accumulated, message, start).await;
}

enum Outcome {
    Cancelled,
    Finished(Result<crate::provider::LlmResponse>),
}

async fn finalize_failed(
    ctx: &ExecutionContext,
    accumulated: &Arc<AsyncMutex<f64>>,
    error_message: String,
    start: chrono::DateTime<Utc>,
) {
    let accumulated_cost = *accumulated.lock().await;
    let elapsed = (Utc::now() - start).num_seconds();

    let last_output = match ctx.repo.get(&ctx.task_id).await {
        Ok(Some(task)) => task.last_output,
        _ => None,
    };

    if let Err(e) = ctx
        .repo
        .update_status(
            &ctx.task_id,
            TaskStatus::Failed,
            StatusUpdate {
                error_message: Some(error_message.clone()),
                ..Default::default()
            },
        )
        .await
    {
        warn!(task_id = %ctx.task_id, error = %e, "failed to persist failure");
        return;
    }

    ctx.bus.publish(TaskEvent::Failed {
        task_id: ctx.task_id.clone(),
        elapsed_seconds: elapsed,
        cost: accumulated_cost,
        chat_id: ctx.chat_id,
        message_thread_id: ctx.thread_id,
        duration_seconds: elapsed,
        error_message,
        last_output,
    });
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        s.to_string()
    } else {
        s.chars().take(max_len).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::stub::{ScriptedCall, StubLlmProvider};
    use crate::provider::LlmResponse;
    use crate::repository::InMemoryTaskRepository;
    use std::time::Duration;

    fn settings() -> Settings {
        Settings {
            max_concurrent_tasks: 3,
            task_max_cost: 10.0,
            retry_delay_seconds: 0.05,
            heartbeat_interval_seconds: 60.0,
            heartbeat_timeout_seconds: 300.0,
            ..Default::default()
        }
    }

    fn response(content: &str, cost: f64) -> LlmResponse {
        LlmResponse {
            content: content.to_string(),
            continuation_handle: Some("sess-1".to_string()),
            cost,
            duration_ms: 10,
            num_turns: 1,
            is_error: false,
            error_message: None,
        }
    }

    async fn build_manager(
        provider: StubLlmProvider,
        settings: Settings,
    ) -> (Arc<TaskManager>, Arc<InMemoryTaskRepository>, EventBus) {
        let repo = Arc::new(InMemoryTaskRepository::new());
        let bus = EventBus::new();
        bus.start().await;
        let heartbeat = Arc::new(HeartbeatService::new(
            repo.clone(),
            bus.clone(),
            settings.heartbeat_interval_seconds,
            settings.heartbeat_timeout_seconds,
        ));
        let manager = Arc::new(TaskManager::new(
            Arc::new(provider),
            repo.clone(),
            bus.clone(),
            heartbeat,
            settings,
        ));
        (manager, repo, bus)
    }

    #[tokio::test]
    async fn s1_happy_path() {
        let provider = StubLlmProvider::new(vec![ScriptedCall {
            stream_events: vec![],
            response: response("Done.", 0.5),
        }]);
        let (manager, repo, bus) = build_manager(provider, settings()).await;

        let task_id = manager
            .start_task("do it".into(), "/p/app".into(), 42, 100, None, None)
            .await
            .unwrap();
        assert_eq!(task_id.len(), 8);

        tokio::time::sleep(Duration::from_millis(100)).await;
        let task = repo.get(&task_id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.finished_at.is_some());
        assert_eq!(task.result_summary.as_deref(), Some("Done."));
        bus.stop().await;
    }

    #[tokio::test]
    async fn s2_cost_ceiling_fails_without_retry() {
        let mut custom = settings();
        custom.task_max_cost = 1.0;
        let provider = StubLlmProvider::new(vec![ScriptedCall {
            stream_events: vec![
                StreamEvent { cost: 0.6, output: None, tool_name: None },
                StreamEvent { cost: 0.6, output: None, tool_name: None },
            ],
            response: response("unreachable", 0.0),
        }]);
        let (manager, repo, bus) = build_manager(provider, custom).await;

        let task_id = manager
            .start_task("do it".into(), "/p/app".into(), 42, 100, None, None)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        let task = repo.get(&task_id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.error_message.as_ref().unwrap().contains("cost limit"));
        bus.stop().await;
    }

    #[tokio::test]
    async fn s3_transient_failure_then_success() {
        let provider = StubLlmProvider::new(vec![
            ScriptedCall {
                stream_events: vec![],
                response: LlmResponse {
                    content: String::new(),
                    continuation_handle: None,
                    cost: 0.0,
                    duration_ms: 5,
                    num_turns: 0,
                    is_error: true,
                    error_message: Some("network glitch".into()),
                },
            },
            ScriptedCall {
                stream_events: vec![],
                response: response("ok", 0.2),
            },
        ]);
        let (manager, repo, bus) = build_manager(provider, settings()).await;

        let task_id = manager
            .start_task("do it".into(), "/p/app".into(), 42, 100, None, None)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        let task = repo.get(&task_id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        bus.stop().await;
    }

    #[tokio::test]
    async fn s4_project_exclusion() {
        let provider = StubLlmProvider::new(vec![ScriptedCall {
            stream_events: vec![],
            response: response("Done.", 0.1),
        }]);
        let mut custom = settings();
        custom.retry_delay_seconds = 10.0;
        let (manager, _repo, bus) = build_manager(provider, custom).await;

        let _first = manager
            .start_task("do it".into(), "/p/app".into(), 42, 100, None, None)
            .await
            .unwrap();

        let err = manager
            .start_task("other".into(), "/p/app".into(), 42, 100, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, TaskCoreError::ProjectBusy { .. }));
        bus.stop().await;
    }

    #[tokio::test]
    async fn s5_recovery_marks_orphans_failed_without_events() {
        let repo = Arc::new(InMemoryTaskRepository::new());
        let orphan = Task::new("orph1234".into(), 1, "/p".into(), "x".into(), 1, None, None);
        repo.create(orphan).await.unwrap();

        let bus = EventBus::new();
        let count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let c = count.clone();
        bus.subscribe(crate::model::TaskEventKind::Failed, move |_| {
            let c = c.clone();
            async move {
                c.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }
        })
        .await;
        bus.start().await;

        let heartbeat = Arc::new(HeartbeatService::new(repo.clone(), bus.clone(), 60.0, 300.0));
        let provider = StubLlmProvider::new(vec![]);
        let manager = TaskManager::new(Arc::new(provider), repo.clone(), bus.clone(), heartbeat, settings());

        manager.recover().await.unwrap();

        let task = repo.get("orph1234").await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.finished_at.is_some());
        assert!(task.error_message.as_ref().unwrap().contains("restart"));
        assert_eq!(count.load(std::sync::atomic::Ordering::SeqCst), 0);
        bus.stop().await;
    }

    #[tokio::test]
    async fn stop_task_is_idempotent() {
        let provider = StubLlmProvider::new(vec![]);
        let (manager, repo, bus) = build_manager(provider, settings()).await;
        let task = Task::new("abc12345".into(), 1, "/p".into(), "x".into(), 1, None, None);
        repo.create(task).await.unwrap();

        manager.stop_task("abc12345").await.unwrap();
        manager.stop_task("abc12345").await.unwrap();

        let task = repo.get("abc12345").await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Stopped);
        bus.stop().await;
    }
}
