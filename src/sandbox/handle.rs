//! Sandbox handles and event channels

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;

/// Module a child execution runs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxEntry {
    pub path: PathBuf,
}

impl SandboxEntry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl std::fmt::Display for SandboxEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.path.display())
    }
}

/// Output stream a log line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStream {
    Stdout,
    Stderr,
}

/// How a child finished
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "detail", rename_all = "snake_case")]
pub enum ExitStatus {
    Success,
    Failed(i32),
    Trapped(String),
    Terminated,
}

impl ExitStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, ExitStatus::Success)
    }
}

impl std::fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitStatus::Success => write!(f, "success"),
            ExitStatus::Failed(code) => write!(f, "exit code {}", code),
            ExitStatus::Trapped(msg) => write!(f, "trapped: {}", msg),
            ExitStatus::Terminated => write!(f, "terminated"),
        }
    }
}

/// Structured events reported by a child
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SandboxEvent {
    Log { stream: LogStream, line: String },
    Result { value: Value },
    Error { message: String },
    Finished { status: ExitStatus },
}

struct HandleState {
    terminated: AtomicBool,
    cancel: CancellationToken,
    task: Mutex<Option<AbortHandle>>,
}

impl HandleState {
    fn terminate(&self) -> bool {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.cancel.cancel();
        let task = self
            .task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(task) = task {
            task.abort();
        }
        true
    }
}

/// Producer side, held by whatever runs the child
pub struct SandboxEventSink {
    tx: mpsc::UnboundedSender<SandboxEvent>,
    state: Arc<HandleState>,
}

impl SandboxEventSink {
    /// Emit an event; returns false once the handle is terminated
    pub fn emit(&self, event: SandboxEvent) -> bool {
        if self.state.terminated.load(Ordering::SeqCst) {
            return false;
        }
        self.tx.send(event).is_ok()
    }

    /// Token cancelled when the handle is terminated
    pub fn cancellation(&self) -> CancellationToken {
        self.state.cancel.clone()
    }

    pub fn is_terminated(&self) -> bool {
        self.state.terminated.load(Ordering::SeqCst)
    }
}

/// Consumer side of one child execution
pub struct SandboxHandle {
    id: String,
    events: mpsc::UnboundedReceiver<SandboxEvent>,
    state: Arc<HandleState>,
}

impl SandboxHandle {
    /// Create a connected sink/handle pair
    pub fn channel(id: impl Into<String>) -> (SandboxEventSink, SandboxHandle) {
        let (tx, events) = mpsc::unbounded_channel();
        let state = Arc::new(HandleState {
            terminated: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        });
        (
            SandboxEventSink {
                tx,
                state: Arc::clone(&state),
            },
            SandboxHandle {
                id: id.into(),
                events,
                state,
            },
        )
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Tie the task running the child to this handle so termination aborts it
    pub fn attach_task(&self, task: AbortHandle) {
        if self.is_terminated() {
            task.abort();
            return;
        }
        *self
            .state
            .task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(task);
    }

    /// Next event, or `None` once the child is done or the handle terminated
    pub async fn next_event(&mut self) -> Option<SandboxEvent> {
        if self.is_terminated() {
            return None;
        }
        let state = Arc::clone(&self.state);
        tokio::select! {
            biased;
            _ = state.cancel.cancelled() => None,
            event = self.events.recv() => {
                if state.terminated.load(Ordering::SeqCst) {
                    None
                } else {
                    event
                }
            }
        }
    }

    /// Force the child to stop. Returns true only for the first call.
    pub fn terminate(&self) -> bool {
        let first = self.state.terminate();
        if first {
            tracing::debug!(target: "deckrun::sandbox", handle = %self.id, "sandbox terminated");
        }
        first
    }

    pub fn is_terminated(&self) -> bool {
        self.state.terminated.load(Ordering::SeqCst)
    }
}

impl Drop for SandboxHandle {
    fn drop(&mut self) {
        self.state.terminate();
    }
}

impl std::fmt::Debug for SandboxHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxHandle")
            .field("id", &self.id)
            .field("terminated", &self.is_terminated())
            .finish()
    }
}
