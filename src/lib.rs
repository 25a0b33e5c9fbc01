//! Background task execution core for a chat-driven coding-agent bot.
//!
//! Five components: a durable [`repository::TaskRepository`], an opaque
//! [`provider::LlmProvider`], a topic-indexed [`events::EventBus`], a
//! per-task [`heartbeat::HeartbeatService`], and the [`manager::TaskManager`]
//! orchestrator that ties them together.
#![deny(unsafe_code)]

pub mod error;
pub mod events;
pub mod git;
pub mod heartbeat;
pub mod manager;
pub mod model;
pub mod provider;
pub mod repository;
pub mod settings;

pub use error::{Result, TaskCoreError};
pub use manager::TaskManager;
pub use model::{CommitRef, Task, TaskEvent, TaskEventKind, TaskStatus};
pub use settings::Settings;

/// Installs a `tracing` subscriber reading filter directives from `RUST_LOG`,
/// defaulting to `info`. Call once at process startup before constructing a
/// [`TaskManager`].
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
