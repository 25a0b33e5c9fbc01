use async_trait::async_trait;

/// An incremental event the provider emits zero or more times during
/// `execute`, carrying an incremental cost and optional output snippet.
#[derive(Debug, Clone)]
pub struct StreamEvent {
    pub cost: f64,
    pub output: Option<String>,
    pub tool_name: Option<String>,
}

/// Structured response from a completed `execute` call.
#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub content: String,
    pub continuation_handle: Option<String>,
    pub cost: f64,
    pub duration_ms: u64,
    pub num_turns: u32,
    pub is_error: bool,
    pub error_message: Option<String>,
}

/// Invoked by the provider for each intermediate stream event. Any error
/// returned must propagate out of `execute` and abort the call.
#[async_trait]
pub trait StreamCallback: Send + Sync {
    async fn on_event(&self, event: StreamEvent) -> crate::error::Result<()>;
}

/// Uniform execute-prompt call to an opaque external LLM provider. The core
/// knows nothing of model names, token counting, or tool schemas.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn execute(
        &self,
        prompt: &str,
        working_dir: &str,
        user_id: i64,
        continuation_handle: Option<&str>,
        stream_callback: Option<&(dyn StreamCallback)>,
        force_new: bool,
        model: Option<&str>,
    ) -> crate::error::Result<LlmResponse>;

    async fn healthcheck(&self) -> bool;
}

#[cfg(test)]
pub mod stub {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex;

    /// A single scripted call: the stream events to emit before returning,
    /// and the terminal response (or an `is_error` response).
    #[derive(Clone)]
    pub struct ScriptedCall {
        pub stream_events: Vec<StreamEvent>,
        pub response: LlmResponse,
    }

    /// Deterministic test double that replays a scripted sequence of calls,
    /// one per invocation of `execute`, matching spec scenarios S1-S3.
    pub struct StubLlmProvider {
        calls: Mutex<Vec<ScriptedCall>>,
        call_count: AtomicUsize,
    }

    impl StubLlmProvider {
        pub fn new(calls: Vec<ScriptedCall>) -> Self {
            StubLlmProvider {
                calls: Mutex::new(calls),
                call_count: AtomicUsize::new(0),
            }
        }

        pub fn call_count(&self) -> usize {
            self.call_count.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl LlmProvider for StubLlmProvider {
        async fn execute(
            &self,
            _prompt: &str,
            _working_dir: &str,
            _user_id: i64,
            _continuation_handle: Option<&str>,
            stream_callback: Option<&(dyn StreamCallback)>,
            _force_new: bool,
            _model: Option<&str>,
        ) -> crate::error::Result<LlmResponse> {
            let index = self.call_count.fetch_add(1, Ordering::SeqCst);
            let calls = self.calls.lock().await;
            let call = calls
                .get(index)
                .unwrap_or_else(|| calls.last().expect("at least one scripted call"))
                .clone();
            drop(calls);

            if let Some(cb) = stream_callback {
                for event in call.stream_events {
                    cb.on_event(event).await?;
                }
            }
            Ok(call.response)
        }

        async fn healthcheck(&self) -> bool {
            true
        }
    }
}
