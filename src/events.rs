use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::{mpsc, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::error;

use crate::model::{TaskEvent, TaskEventKind};

type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type Handler = Arc<dyn Fn(TaskEvent) -> BoxFuture + Send + Sync>;

/// Topic-indexed in-process publish/subscribe bus.
///
/// Unlike a single `broadcast::Sender`, subscribers are registered per event
/// kind so a handler only receives the variants it asked for. Dispatch runs
/// on a dedicated task reading from an unbounded queue, so `publish` never
/// blocks on handler execution and is safe to call from inside a handler.
#[derive(Clone)]
pub struct EventBus {
    handlers: Arc<RwLock<HashMap<TaskEventKind, Vec<Handler>>>>,
    sender: mpsc::UnboundedSender<TaskEvent>,
    receiver: Arc<tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<TaskEvent>>>>,
    dispatcher: Arc<RwLock<Option<JoinHandle<()>>>>,
    stop_signal: Arc<Notify>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        EventBus {
            handlers: Arc::new(RwLock::new(HashMap::new())),
            sender,
            receiver: Arc::new(tokio::sync::Mutex::new(Some(receiver))),
            dispatcher: Arc::new(RwLock::new(None)),
            stop_signal: Arc::new(Notify::new()),
        }
    }

    /// Registers a handler for a given event kind. Multiple handlers per kind
    /// are allowed; delivery order between them is unspecified.
    pub async fn subscribe<F, Fut>(&self, kind: TaskEventKind, handler: F)
    where
        F: Fn(TaskEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let boxed: Handler = Arc::new(move |event| Box::pin(handler(event)));
        self.handlers.write().await.entry(kind).or_default().push(boxed);
    }

    /// Enqueues the event for asynchronous delivery. Permitted before
    /// `start()`; events are buffered in the channel until the dispatcher
    /// drains them.
    pub fn publish(&self, event: TaskEvent) {
        // An unbounded sender only errors if every receiver was dropped,
        // which only happens after `stop()` — nothing further to do then.
        let _ = self.sender.send(event);
    }

    /// Starts the dispatcher task. Calling this more than once is a no-op.
    pub async fn start(&self) {
        let mut dispatcher = self.dispatcher.write().await;
        if dispatcher.is_some() {
            return;
        }
        let mut receiver = match self.receiver.lock().await.take() {
            Some(r) => r,
            None => return,
        };
        let handlers = self.handlers.clone();
        let stop_signal = self.stop_signal.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    event = receiver.recv() => {
                        match event {
                            Some(event) => dispatch(&handlers, event).await,
                            None => break,
                        }
                    }
                    _ = stop_signal.notified() => {
                        // Drain whatever is already queued, then exit.
                        while let Ok(event) = receiver.try_recv() {
                            dispatch(&handlers, event).await;
                        }
                        break;
                    }
                }
            }
        });
        *dispatcher = Some(handle);
    }

    /// Drains the queue and cancels the dispatcher.
    pub async fn stop(&self) {
        self.stop_signal.notify_one();
        if let Some(handle) = self.dispatcher.write().await.take() {
            if let Err(e) = handle.await {
                error!(error = %e, "event bus dispatcher task panicked");
            }
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

async fn dispatch(handlers: &Arc<RwLock<HashMap<TaskEventKind, Vec<Handler>>>>, event: TaskEvent) {
    let kind = event.kind();
    let to_run: Vec<Handler> = {
        let map = handlers.read().await;
        map.get(&kind).cloned().unwrap_or_default()
    };
    // Each handler runs on its own task so a panicking handler can't take
    // down the dispatcher or block delivery to the other handlers of this
    // event.
    for handler in to_run {
        let event = event.clone();
        if let Err(e) = tokio::spawn(async move { handler(event).await }).await {
            error!(error = %e, "event bus handler panicked");
        }
    }
}
