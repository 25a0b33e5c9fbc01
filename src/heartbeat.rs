use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use lazy_static::lazy_static;
use regex::Regex;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::error;

use crate::events::EventBus;
use crate::model::{TaskEvent, TaskStatus};
use crate::repository::TaskRepository;

lazy_static! {
    /// Stage classification table: the first pattern to match a task's
    /// `last_output` wins. Kept as data, not hardcoded in the loop, so the
    /// vocabulary can grow without touching the supervisor algorithm.
    static ref STAGE_PATTERNS: Vec<(Regex, &'static str)> = vec![
        (Regex::new(r"(?i)Read|Glob|Grep|searching").unwrap(), "reading code"),
        (Regex::new(r"(?i)Write|Edit|creating file").unwrap(), "writing code"),
        (Regex::new(r"(?i)pytest|npm test|jest|make test").unwrap(), "running tests"),
        (Regex::new(r"(?i)git commit|git push").unwrap(), "committing"),
        (Regex::new(r"(?i)thinking|planning|analyzing").unwrap(), "planning"),
        (Regex::new(r"(?i)pip install|npm install|poetry").unwrap(), "installing dependencies"),
    ];
}

const DEFAULT_STAGE: &str = "working";

/// Determines the current stage label from recent output keywords.
pub fn parse_stage(last_output: Option<&str>) -> String {
    let Some(output) = last_output else {
        return DEFAULT_STAGE.to_string();
    };
    for (pattern, stage) in STAGE_PATTERNS.iter() {
        if pattern.is_match(output) {
            return stage.to_string();
        }
    }
    DEFAULT_STAGE.to_string()
}

/// Per-task periodic supervisor: reads the task record, classifies its
/// stage, emits `Progress`, and detects stalled tasks via idle time.
pub struct HeartbeatService {
    repo: Arc<dyn TaskRepository>,
    bus: EventBus,
    interval: std::time::Duration,
    timeout: std::time::Duration,
    tasks: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
}

impl HeartbeatService {
    pub fn new(
        repo: Arc<dyn TaskRepository>,
        bus: EventBus,
        interval_seconds: f64,
        timeout_seconds: f64,
    ) -> Self {
        HeartbeatService {
            repo,
            bus,
            interval: std::time::Duration::from_secs_f64(interval_seconds),
            timeout: std::time::Duration::from_secs_f64(timeout_seconds),
            tasks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Attaches a supervisor loop for `task_id`. No-op if one is already
    /// tracked — there is at most one supervisor per task.
    pub async fn start(&self, task_id: String) {
        let mut tasks = self.tasks.lock().await;
        if tasks.contains_key(&task_id) {
            return;
        }
        let repo = self.repo.clone();
        let bus = self.bus.clone();
        let interval = self.interval;
        let timeout = self.timeout;
        let id_for_loop = task_id.clone();
        let tasks_map = self.tasks.clone();
        let handle = tokio::spawn(async move {
            run_loop(id_for_loop.clone(), repo, bus, interval, timeout).await;
            // Self-deregister on every natural exit path (timeout, status no
            // longer running, read failure). `stop()` races this removal
            // harmlessly: whichever of the two locks the map first wins, and
            // the other finds nothing left to remove.
            tasks_map.lock().await.remove(&id_for_loop);
        });
        tasks.insert(task_id, handle);
    }

    /// Detaches the supervisor for `task_id`, awaiting its cancellation.
    pub async fn stop(&self, task_id: &str) {
        let handle = self.tasks.lock().await.remove(task_id);
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }
    }

    pub async fn stop_all(&self) {
        let ids: Vec<String> = self.tasks.lock().await.keys().cloned().collect();
        for id in ids {
            self.stop(&id).await;
        }
    }
}

async fn run_loop(
    task_id: String,
    repo: Arc<dyn TaskRepository>,
    bus: EventBus,
    interval: std::time::Duration,
    timeout: std::time::Duration,
) {
    loop {
        tokio::time::sleep(interval).await;

        let task = match repo.get(&task_id).await {
            Ok(Some(task)) if task.status == TaskStatus::Running => task,
            Ok(_) => break,
            Err(e) => {
                error!(task_id = %task_id, error = %e, "heartbeat read failed");
                break;
            }
        };

        let now = Utc::now();
        let elapsed = (now - task.created_at).num_seconds();
        let idle_ms = (now - task.last_activity_at).num_milliseconds();
        let idle = idle_ms / 1000;
        let idle_secs_f64 = idle_ms as f64 / 1000.0;

        if idle_secs_f64 > timeout.as_secs_f64() {
            bus.publish(TaskEvent::Timeout {
                task_id: task_id.clone(),
                elapsed_seconds: elapsed,
                cost: task.total_cost,
                chat_id: task.chat_id,
                message_thread_id: task.message_thread_id,
                duration_seconds: elapsed,
                idle_seconds: idle,
            });
            break;
        }

        let stage = parse_stage(task.last_output.as_deref());
        bus.publish(TaskEvent::Progress {
            task_id: task_id.clone(),
            elapsed_seconds: elapsed,
            cost: task.total_cost,
            chat_id: task.chat_id,
            message_thread_id: task.message_thread_id,
            stage,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Task, TaskEventKind};
    use crate::repository::InMemoryTaskRepository;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration as StdDuration;

    #[test]
    fn classifies_known_stages() {
        assert_eq!(parse_stage(Some("Read src/lib.rs")), "reading code");
        assert_eq!(parse_stage(Some("Edit src/lib.rs")), "writing code");
        assert_eq!(parse_stage(Some("running pytest now")), "running tests");
        assert_eq!(parse_stage(Some("git commit -m x")), "committing");
        assert_eq!(parse_stage(Some("thinking about approach")), "planning");
        assert_eq!(parse_stage(Some("npm install foo")), "installing dependencies");
        assert_eq!(parse_stage(Some("something unrelated")), "working");
        assert_eq!(parse_stage(None), "working");
    }

    #[tokio::test]
    async fn emits_timeout_when_idle_past_threshold() {
        let repo: Arc<dyn TaskRepository> = Arc::new(InMemoryTaskRepository::new());
        let bus = EventBus::new();
        let timeout_count = Arc::new(AtomicUsize::new(0));
        let progress_count = Arc::new(AtomicUsize::new(0));

        let tc = timeout_count.clone();
        bus.subscribe(TaskEventKind::Timeout, move |_| {
            let tc = tc.clone();
            async move {
                tc.fetch_add(1, Ordering::SeqCst);
            }
        })
        .await;
        let pc = progress_count.clone();
        bus.subscribe(TaskEventKind::Progress, move |_| {
            let pc = pc.clone();
            async move {
                pc.fetch_add(1, Ordering::SeqCst);
            }
        })
        .await;
        bus.start().await;

        let mut task = Task::new("abc".into(), 1, "/p".into(), "do it".into(), 100, None, None);
        task.last_activity_at = Utc::now() - chrono::Duration::seconds(10);
        repo.create(task).await.unwrap();

        let service = HeartbeatService::new(repo.clone(), bus.clone(), 0.02, 0.01);
        service.start("abc".to_string()).await;

        tokio::time::sleep(StdDuration::from_millis(100)).await;
        bus.stop().await;

        assert_eq!(timeout_count.load(Ordering::SeqCst), 1);
        assert_eq!(progress_count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn stop_deregisters_supervisor() {
        let repo: Arc<dyn TaskRepository> = Arc::new(InMemoryTaskRepository::new());
        let bus = EventBus::new();
        bus.start().await;
        let task = Task::new("abc".into(), 1, "/p".into(), "do it".into(), 100, None, None);
        repo.create(task).await.unwrap();

        let service = HeartbeatService::new(repo, bus.clone(), 60.0, 300.0);
        service.start("abc".to_string()).await;
        assert_eq!(service.tasks.lock().await.len(), 1);
        service.stop("abc").await;
        assert_eq!(service.tasks.lock().await.len(), 0);
        bus.stop().await;
    }
}
