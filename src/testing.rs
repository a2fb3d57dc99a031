//! Scripted providers and sandboxes for driving the runtime in tests.
//!
//! Both doubles run entirely on tokio time, so tests can pause the clock and
//! advance it to exercise busy and idle timers deterministically.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::provider::{
    FinishStatus, ModelProvider, ModelRequest, ModelResponse, StreamChunk, StreamingResponse,
    ToolCallRequest,
};
use crate::sandbox::{
    ExitStatus, LogStream, PermissionSet, SandboxBridge, SandboxEntry, SandboxError,
    SandboxEvent, SandboxHandle, SandboxResult,
};

/// One scripted provider answer
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    Response(ModelResponse),
    Error(String),
}

/// Provider that replays a fixed list of answers
pub struct ScriptedProvider {
    replies: Mutex<VecDeque<ScriptedReply>>,
    fallback: Option<ScriptedReply>,
    requests: Mutex<Vec<ModelRequest>>,
    streaming: bool,
}

impl Default for ScriptedProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self {
            replies: Mutex::new(VecDeque::new()),
            fallback: None,
            requests: Mutex::new(Vec::new()),
            streaming: false,
        }
    }

    /// Queue a response
    pub fn then(self, response: ModelResponse) -> Self {
        self.push(ScriptedReply::Response(response))
    }

    /// Queue a plain text reply
    pub fn then_text(self, text: impl Into<String>) -> Self {
        self.then(ModelResponse::text(text))
    }

    /// Queue a single tool call
    pub fn then_call(self, id: &str, name: &str, arguments: Value) -> Self {
        self.then(ModelResponse::tool_calls(vec![ToolCallRequest::new(
            id,
            name,
            arguments.to_string(),
        )]))
    }

    /// Queue a provider failure
    pub fn then_error(self, message: impl Into<String>) -> Self {
        self.push(ScriptedReply::Error(message.into()))
    }

    /// Answer used once the queue is empty
    pub fn repeating(mut self, response: ModelResponse) -> Self {
        self.fallback = Some(ScriptedReply::Response(response));
        self
    }

    /// Emit word-by-word chunks from `generate_stream`
    pub fn streaming(mut self, enabled: bool) -> Self {
        self.streaming = enabled;
        self
    }

    /// Every request received so far
    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn call_count(&self) -> usize {
        self.requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    fn push(self, reply: ScriptedReply) -> Self {
        self.replies
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push_back(reply);
        self
    }

    fn next_reply(&self, request: ModelRequest) -> Result<ModelResponse> {
        self.requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(request);
        let reply = self
            .replies
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop_front()
            .or_else(|| self.fallback.clone());
        match reply {
            Some(ScriptedReply::Response(response)) => Ok(response),
            Some(ScriptedReply::Error(message)) => Err(anyhow!(message)),
            None => Err(anyhow!("scripted provider has no more replies")),
        }
    }
}

#[async_trait]
impl ModelProvider for ScriptedProvider {
    async fn generate(&self, request: ModelRequest) -> Result<ModelResponse> {
        self.next_reply(request)
    }

    async fn generate_stream(&self, request: ModelRequest) -> Result<StreamingResponse> {
        let response = self.next_reply(request)?;
        let mut chunks = Vec::new();
        if let Some(text) = &response.text {
            for word in text.split_inclusive(' ') {
                chunks.push(Ok(StreamChunk::Text {
                    delta: word.to_string(),
                }));
            }
        }
        for (index, call) in response.tool_calls.iter().enumerate() {
            chunks.push(Ok(StreamChunk::ToolCallDelta {
                index,
                id: Some(call.id.clone()),
                name: Some(call.name.clone()),
                arguments_delta: Some(call.arguments.clone()),
            }));
        }
        let status = if response.has_tool_calls() {
            FinishStatus::ToolCalls
        } else {
            response.status
        };
        chunks.push(Ok(StreamChunk::Done { status }));
        Ok(Box::pin(futures_util::stream::iter(chunks)))
    }

    fn supports_streaming(&self) -> bool {
        self.streaming
    }

    fn provider_name(&self) -> &str {
        "scripted"
    }

    fn default_model(&self) -> String {
        "scripted-1".to_string()
    }
}

/// How a scripted child ends
#[derive(Debug, Clone)]
pub enum ScriptedOutcome {
    /// Emit a result and exit 0
    Result(Value),
    /// Report an error and exit 1
    Error(String),
    /// Exit with the given code and no result
    Exit(i32),
    /// Never finish
    Hang,
}

/// Behaviour of one scripted module
#[derive(Debug, Clone)]
pub struct ScriptedChild {
    pub duration: Duration,
    pub logs: Vec<String>,
    pub outcome: ScriptedOutcome,
}

impl ScriptedChild {
    pub fn returning(duration: Duration, value: Value) -> Self {
        Self {
            duration,
            logs: Vec::new(),
            outcome: ScriptedOutcome::Result(value),
        }
    }

    pub fn failing(duration: Duration, message: impl Into<String>) -> Self {
        Self {
            duration,
            logs: Vec::new(),
            outcome: ScriptedOutcome::Error(message.into()),
        }
    }

    pub fn hanging() -> Self {
        Self {
            duration: Duration::ZERO,
            logs: Vec::new(),
            outcome: ScriptedOutcome::Hang,
        }
    }

    pub fn with_log(mut self, line: impl Into<String>) -> Self {
        self.logs.push(line.into());
        self
    }
}

/// A spawn observed by [`ScriptedSandbox`]
#[derive(Debug, Clone)]
pub struct SpawnRecord {
    pub entry: PathBuf,
    pub permissions: PermissionSet,
    pub input: Value,
}

/// Sandbox bridge whose children are timed scripts instead of modules.
///
/// Children are matched by the trailing components of the entry path.
#[derive(Default)]
pub struct ScriptedSandbox {
    scripts: Mutex<HashMap<PathBuf, ScriptedChild>>,
    spawned: Mutex<Vec<SpawnRecord>>,
    terminations: AtomicUsize,
}

impl ScriptedSandbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(self, entry: impl Into<PathBuf>, child: ScriptedChild) -> Self {
        self.scripts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(entry.into(), child);
        self
    }

    pub fn spawns(&self) -> Vec<SpawnRecord> {
        self.spawned
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Number of `terminate` calls made through the bridge
    pub fn terminations(&self) -> usize {
        self.terminations.load(Ordering::SeqCst)
    }

    fn lookup(&self, entry: &SandboxEntry) -> Option<ScriptedChild> {
        let scripts = self
            .scripts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        scripts
            .iter()
            .find(|(key, _)| entry.path.ends_with(key))
            .map(|(_, child)| child.clone())
    }
}

#[async_trait]
impl SandboxBridge for ScriptedSandbox {
    async fn spawn(
        &self,
        entry: &SandboxEntry,
        permissions: &PermissionSet,
        input: Value,
    ) -> SandboxResult<SandboxHandle> {
        let child = self
            .lookup(entry)
            .ok_or_else(|| SandboxError::ModuleNotFound(entry.path.clone()))?;
        self.spawned
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(SpawnRecord {
                entry: entry.path.clone(),
                permissions: permissions.clone(),
                input,
            });

        let id = format!("scripted-{}", uuid::Uuid::new_v4());
        let (sink, handle) = SandboxHandle::channel(id);
        let cancel = sink.cancellation();
        let task = tokio::spawn(async move {
            for line in &child.logs {
                sink.emit(SandboxEvent::Log {
                    stream: LogStream::Stderr,
                    line: line.clone(),
                });
            }
            let finished = async {
                match child.outcome {
                    ScriptedOutcome::Hang => std::future::pending::<()>().await,
                    _ => tokio::time::sleep(child.duration).await,
                }
            };
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                _ = finished => {}
            }
            let status = match child.outcome {
                ScriptedOutcome::Result(value) => {
                    sink.emit(SandboxEvent::Result { value });
                    ExitStatus::Success
                }
                ScriptedOutcome::Error(message) => {
                    sink.emit(SandboxEvent::Error { message });
                    ExitStatus::Failed(1)
                }
                ScriptedOutcome::Exit(0) => ExitStatus::Success,
                ScriptedOutcome::Exit(code) => ExitStatus::Failed(code),
                ScriptedOutcome::Hang => ExitStatus::Terminated,
            };
            sink.emit(SandboxEvent::Finished { status });
        });
        handle.attach_task(task.abort_handle());
        Ok(handle)
    }

    async fn terminate(&self, handle: &SandboxHandle) -> SandboxResult<()> {
        self.terminations.fetch_add(1, Ordering::SeqCst);
        handle.terminate();
        Ok(())
    }

    fn name(&self) -> &str {
        "scripted"
    }
}
