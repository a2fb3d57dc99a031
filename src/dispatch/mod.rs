//! Action dispatcher
//!
//! Routes one tool call to its resolved target and produces exactly one
//! terminal [`DispatchOutcome`]. Sandboxed calls run as a
//! [`PendingExecution`]: the busy timer and the child race inside a single
//! `select!` loop, which is the only place their results reach the session.
//! Busy handlers run alongside the child inside that loop and never hold
//! back its result.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use futures_util::future::{BoxFuture, FutureExt};
use futures_util::stream::{FuturesUnordered, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::deck::{ActionTarget, ResolvedDeck};
use crate::provider::ToolCallRequest;
use crate::sandbox::{
    ExitStatus, PermissionSet, SandboxBridge, SandboxEntry, SandboxError, SandboxEvent,
    SandboxHandle,
};
use crate::scheduler::handlers::{render_status, ErrorHandlerResult, HandlerInput, HandlerKind};
use crate::scheduler::{HandlerScheduler, TimerFire, TimerKind, TimerToken};
use crate::session::{MessageRole, SessionRecorder, StoreResult, TraceKind};

/// Action-level failures. Sandbox failures always surface as one of these.
#[derive(Debug, Error)]
pub enum ActionError {
    #[error("unknown action: {name}")]
    UnknownAction { name: String },

    #[error("malformed arguments for {name}: {message}")]
    MalformedArguments { name: String, message: String },

    #[error("{name} failed: {message}")]
    Compute { name: String, message: String },

    #[error("sandbox error in {name}: {source}")]
    Sandbox {
        name: String,
        #[source]
        source: SandboxError,
    },

    #[error("child {name} failed: {message}")]
    ChildFailed { name: String, message: String },
}

impl ActionError {
    /// Stable kind string used in trace payloads and handler input
    pub fn kind(&self) -> &'static str {
        match self {
            ActionError::UnknownAction { .. } => "unknown_action",
            ActionError::MalformedArguments { .. } => "malformed_arguments",
            ActionError::Compute { .. } => "compute",
            ActionError::Sandbox { .. } => "sandbox",
            ActionError::ChildFailed { .. } => "child_failed",
        }
    }

    pub fn action(&self) -> &str {
        match self {
            ActionError::UnknownAction { name }
            | ActionError::MalformedArguments { name, .. }
            | ActionError::Compute { name, .. }
            | ActionError::Sandbox { name, .. }
            | ActionError::ChildFailed { name, .. } => name,
        }
    }
}

/// Result of one tool call, as fed back to the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResult {
    pub call_id: String,
    pub name: String,
    pub output: Value,
    pub is_error: bool,
    /// Produced by `onError` instead of the action itself
    pub handled: bool,
}

/// Terminal outcome of a dispatch
#[derive(Debug)]
pub enum DispatchOutcome {
    Completed(ToolResult),
    Fatal(ActionError),
    Cancelled,
}

/// A sandboxed child call in flight
#[derive(Debug)]
pub struct PendingExecution {
    pub id: String,
    pub started: Instant,
    pub started_at: DateTime<Utc>,
    /// Deck path the call originates from
    pub source: String,
    pub action: String,
    pub permissions: PermissionSet,
    pub cancel: CancellationToken,
    busy_timer: Option<TimerToken>,
    torn_down: bool,
}

impl PendingExecution {
    pub fn new(source: impl Into<String>, action: impl Into<String>, permissions: PermissionSet) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            started: Instant::now(),
            started_at: Utc::now(),
            source: source.into(),
            action: action.into(),
            permissions,
            cancel: CancellationToken::new(),
            busy_timer: None,
            torn_down: false,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn is_active(&self) -> bool {
        !self.torn_down
    }

    /// Whether a timer fire belongs to this execution's live busy timer
    pub fn owns(&self, fire: &TimerFire) -> bool {
        self.is_active() && self.busy_timer.as_ref() == Some(&fire.token)
    }

    /// Cancel the execution and disarm its busy timer. Idempotent.
    pub fn teardown(&mut self, scheduler: &HandlerScheduler) -> bool {
        if self.torn_down {
            return false;
        }
        self.torn_down = true;
        self.cancel.cancel();
        if let Some(token) = self.busy_timer.take() {
            scheduler.disarm(&token);
        }
        true
    }
}

/// A handler invocation running alongside a wait
pub(crate) type HandlerCall<'a> = BoxFuture<'a, (TimerFire, anyhow::Result<Value>)>;

enum ChildOutcome {
    Value(Value),
    Failed(ActionError),
    Cancelled,
}

/// Routes tool calls to in-process compute or the sandbox bridge
#[derive(Clone)]
pub struct ActionDispatcher {
    deck: Arc<ResolvedDeck>,
    sandbox: Arc<dyn SandboxBridge>,
    scheduler: HandlerScheduler,
}

impl ActionDispatcher {
    pub fn new(
        deck: Arc<ResolvedDeck>,
        sandbox: Arc<dyn SandboxBridge>,
        scheduler: HandlerScheduler,
    ) -> Self {
        Self {
            deck,
            sandbox,
            scheduler,
        }
    }

    pub fn deck(&self) -> &Arc<ResolvedDeck> {
        &self.deck
    }

    pub fn scheduler(&self) -> &HandlerScheduler {
        &self.scheduler
    }

    /// Dispatch one tool call.
    ///
    /// Store failures are returned as errors; every action-level failure is
    /// folded into the outcome after being recorded.
    pub async fn dispatch(
        &self,
        call: &ToolCallRequest,
        recorder: &mut SessionRecorder,
        run_id: &str,
        cancel: &CancellationToken,
    ) -> StoreResult<DispatchOutcome> {
        recorder.record(
            TraceKind::ToolDispatch,
            Some(run_id),
            json!({ "callId": call.id, "name": call.name, "arguments": call.arguments }),
        )?;

        if cancel.is_cancelled() {
            self.record_cancelled(recorder, run_id, call)?;
            return Ok(DispatchOutcome::Cancelled);
        }

        let args = match call.parse_arguments() {
            Ok(args) => args,
            Err(e) => {
                let err = ActionError::MalformedArguments {
                    name: call.name.clone(),
                    message: e.to_string(),
                };
                return self
                    .handle_error(err, call, None, recorder, run_id, cancel)
                    .await;
            }
        };

        let Some(action) = self.deck.action(&call.name) else {
            let err = ActionError::UnknownAction {
                name: call.name.clone(),
            };
            return self
                .handle_error(err, call, Some(args), recorder, run_id, cancel)
                .await;
        };

        let outcome = match &action.target {
            ActionTarget::InProcess { function, .. } => match (**function)(&args) {
                Ok(value) => ChildOutcome::Value(value),
                Err(e) => ChildOutcome::Failed(ActionError::Compute {
                    name: call.name.clone(),
                    message: format!("{:#}", e),
                }),
            },
            ActionTarget::Sandboxed { entry, permissions } => {
                self.run_sandboxed(call, entry, permissions, &args, recorder, run_id, cancel)
                    .await?
            }
        };

        match outcome {
            ChildOutcome::Value(output) => {
                let result = ToolResult {
                    call_id: call.id.clone(),
                    name: call.name.clone(),
                    output,
                    is_error: false,
                    handled: false,
                };
                self.record_result(recorder, run_id, &result)?;
                Ok(DispatchOutcome::Completed(result))
            }
            ChildOutcome::Failed(err) => {
                self.handle_error(err, call, Some(args), recorder, run_id, cancel)
                    .await
            }
            ChildOutcome::Cancelled => {
                self.record_cancelled(recorder, run_id, call)?;
                Ok(DispatchOutcome::Cancelled)
            }
        }
    }

    /// Run a handler target to completion and return its value
    pub async fn invoke_handler(
        &self,
        target: &ActionTarget,
        input: Value,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Value> {
        match target {
            ActionTarget::InProcess { function, .. } => (**function)(&input),
            ActionTarget::Sandboxed { entry, permissions } => {
                let mut handle = self.sandbox.spawn(entry, permissions, input).await?;
                let outcome = collect_child(&mut handle, cancel).await;
                if let Err(e) = self.sandbox.terminate(&handle).await {
                    warn!(target: "deckrun::dispatch", error = %e, "failed to terminate handler child");
                }
                match outcome {
                    ChildOutcome::Value(value) => Ok(value),
                    ChildOutcome::Failed(err) => Err(err.into()),
                    ChildOutcome::Cancelled => anyhow::bail!("handler cancelled"),
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_sandboxed(
        &self,
        call: &ToolCallRequest,
        entry: &SandboxEntry,
        permissions: &PermissionSet,
        args: &Value,
        recorder: &mut SessionRecorder,
        run_id: &str,
        cancel: &CancellationToken,
    ) -> StoreResult<ChildOutcome> {
        let mut pending = PendingExecution::new(self.deck.source(), &call.name, permissions.clone());
        let execution_cancel = cancel.child_token();
        pending.cancel = execution_cancel.clone();

        let (fire_tx, mut fire_rx) = mpsc::unbounded_channel::<TimerFire>();
        if let Some(binding) = self.deck.handler(HandlerKind::Busy) {
            let token = self.scheduler.arm(
                TimerKind::Busy,
                binding.delay,
                binding.repeat,
                move |fire| {
                    let _ = fire_tx.send(fire);
                },
            );
            pending.busy_timer = Some(token);
        }

        debug!(
            target: "deckrun::dispatch",
            execution = %pending.id,
            action = %call.name,
            entry = %entry,
            "starting sandboxed child"
        );

        let mut handle = match self.sandbox.spawn(entry, permissions, args.clone()).await {
            Ok(handle) => handle,
            Err(source) => {
                pending.teardown(&self.scheduler);
                return Ok(ChildOutcome::Failed(ActionError::Sandbox {
                    name: call.name.clone(),
                    source,
                }));
            }
        };

        let driven = self
            .drive_child(call, &mut pending, &mut handle, &mut fire_rx, args, recorder, run_id)
            .await;

        pending.teardown(&self.scheduler);
        if let Err(e) = self.sandbox.terminate(&handle).await {
            warn!(target: "deckrun::dispatch", error = %e, "failed to terminate child");
        }
        debug!(
            target: "deckrun::dispatch",
            execution = %pending.id,
            elapsed_ms = pending.elapsed().as_millis() as u64,
            "child torn down"
        );
        driven
    }

    #[allow(clippy::too_many_arguments)]
    async fn drive_child(
        &self,
        call: &ToolCallRequest,
        pending: &mut PendingExecution,
        handle: &mut SandboxHandle,
        fire_rx: &mut mpsc::UnboundedReceiver<TimerFire>,
        args: &Value,
        recorder: &mut SessionRecorder,
        run_id: &str,
    ) -> StoreResult<ChildOutcome> {
        let cancel = pending.cancel.clone();
        let handler_cancel = cancel.child_token();
        let busy = self.deck.handler(HandlerKind::Busy);
        let mut in_flight: FuturesUnordered<HandlerCall<'_>> = FuturesUnordered::new();
        let mut result = None;
        let mut child_error = None;

        let driven = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break Ok(ChildOutcome::Cancelled),
                event = handle.next_event() => match event {
                    Some(SandboxEvent::Log { stream, line }) => {
                        if let Err(e) = recorder.record(
                            TraceKind::SandboxLog,
                            Some(run_id),
                            json!({ "callId": call.id, "action": call.name, "stream": stream, "line": line }),
                        ) {
                            break Err(e);
                        }
                    }
                    Some(SandboxEvent::Result { value }) => result = Some(value),
                    Some(SandboxEvent::Error { message }) => child_error = Some(message),
                    Some(SandboxEvent::Finished { status }) => {
                        break Ok(finish_child(&call.name, status, result, child_error));
                    }
                    None => {
                        break Ok(ChildOutcome::Failed(ActionError::ChildFailed {
                            name: call.name.clone(),
                            message: "child stopped without reporting completion".to_string(),
                        }));
                    }
                },
                Some(fire) = fire_rx.recv() => {
                    let Some(binding) = busy else { continue };
                    if !pending.owns(&fire) {
                        continue;
                    }
                    if !in_flight.is_empty() {
                        debug!(
                            target: "deckrun::dispatch",
                            action = %call.name,
                            fire_count = fire.fire_count,
                            "onBusy handler still running, skipping fire"
                        );
                        continue;
                    }
                    let input = HandlerInput::busy(&pending.source, fire.elapsed, fire.fire_count, args.clone());
                    in_flight.push(self.handler_call(
                        &binding.target,
                        fire,
                        input.to_value(),
                        handler_cancel.clone(),
                    ));
                }
                Some((fire, answered)) = in_flight.next(), if !in_flight.is_empty() => {
                    if let Err(e) = self.record_busy(call, &fire, answered, recorder, run_id) {
                        break Err(e);
                    }
                }
            }
        };

        // a handler still running when the child settles is stopped and its answer dropped
        handler_cancel.cancel();
        while in_flight.next().await.is_some() {}
        driven
    }

    /// Invoke a handler for one timer fire, pairing the answer with the fire
    pub(crate) fn handler_call<'a>(
        &'a self,
        target: &'a ActionTarget,
        fire: TimerFire,
        input: Value,
        cancel: CancellationToken,
    ) -> HandlerCall<'a> {
        async move {
            let answered = self.invoke_handler(target, input, &cancel).await;
            (fire, answered)
        }
        .boxed()
    }

    fn record_busy(
        &self,
        call: &ToolCallRequest,
        fire: &TimerFire,
        answered: anyhow::Result<Value>,
        recorder: &mut SessionRecorder,
        run_id: &str,
    ) -> StoreResult<()> {
        match answered {
            Ok(value) => {
                let text = render_status(&value, fire.elapsed);
                recorder.record(
                    TraceKind::HandlerFired,
                    Some(run_id),
                    json!({
                        "handler": HandlerKind::Busy.as_str(),
                        "callId": call.id,
                        "fireCount": fire.fire_count,
                        "elapsedMs": fire.elapsed.as_millis() as u64,
                        "result": value,
                    }),
                )?;
                let format = recorder.session().format;
                for entry in format.text_entries(MessageRole::Status, text) {
                    recorder.append_entry(Some(run_id), &entry)?;
                }
            }
            Err(e) => {
                warn!(target: "deckrun::dispatch", action = %call.name, error = %e, "onBusy handler failed");
                recorder.record(
                    TraceKind::Error,
                    Some(run_id),
                    json!({ "kind": "handler_failed", "handler": HandlerKind::Busy.as_str(), "callId": call.id, "message": format!("{:#}", e) }),
                )?;
            }
        }
        Ok(())
    }

    /// Route an action error raised outside [`dispatch`](Self::dispatch)
    /// through `onError`, exactly as a failed action would be.
    pub async fn recover(
        &self,
        err: ActionError,
        call: &ToolCallRequest,
        recorder: &mut SessionRecorder,
        run_id: &str,
        cancel: &CancellationToken,
    ) -> StoreResult<DispatchOutcome> {
        self.handle_error(err, call, None, recorder, run_id, cancel).await
    }

    async fn handle_error(
        &self,
        err: ActionError,
        call: &ToolCallRequest,
        args: Option<Value>,
        recorder: &mut SessionRecorder,
        run_id: &str,
        cancel: &CancellationToken,
    ) -> StoreResult<DispatchOutcome> {
        recorder.record(
            TraceKind::Error,
            Some(run_id),
            json!({ "kind": err.kind(), "action": err.action(), "callId": call.id, "message": err.to_string() }),
        )?;

        let Some(binding) = self.deck.handler(HandlerKind::Error) else {
            return Ok(DispatchOutcome::Fatal(err));
        };

        let input = HandlerInput::error(
            self.deck.source(),
            err.kind(),
            err.to_string(),
            Some(call.name.clone()),
            args,
        );
        match self.invoke_handler(&binding.target, input.to_value(), cancel).await {
            Ok(value) => {
                let handled = ErrorHandlerResult::from_value(value);
                recorder.record(
                    TraceKind::HandlerFired,
                    Some(run_id),
                    json!({ "handler": HandlerKind::Error.as_str(), "callId": call.id, "result": handled }),
                )?;
                let result = ToolResult {
                    call_id: call.id.clone(),
                    name: call.name.clone(),
                    output: handled.to_tool_output(),
                    is_error: false,
                    handled: true,
                };
                self.record_result(recorder, run_id, &result)?;
                Ok(DispatchOutcome::Completed(result))
            }
            Err(handler_err) => {
                warn!(target: "deckrun::dispatch", action = %call.name, error = %handler_err, "onError handler failed");
                recorder.record(
                    TraceKind::Error,
                    Some(run_id),
                    json!({ "kind": "handler_failed", "handler": HandlerKind::Error.as_str(), "callId": call.id, "message": format!("{:#}", handler_err) }),
                )?;
                Ok(DispatchOutcome::Fatal(err))
            }
        }
    }

    fn record_result(
        &self,
        recorder: &mut SessionRecorder,
        run_id: &str,
        result: &ToolResult,
    ) -> StoreResult<()> {
        recorder.record(
            TraceKind::ToolResult,
            Some(run_id),
            serde_json::to_value(result)?,
        )?;
        Ok(())
    }

    fn record_cancelled(
        &self,
        recorder: &mut SessionRecorder,
        run_id: &str,
        call: &ToolCallRequest,
    ) -> StoreResult<()> {
        recorder.record(
            TraceKind::ExecutionCancelled,
            Some(run_id),
            json!({ "callId": call.id, "name": call.name }),
        )?;
        Ok(())
    }
}

async fn collect_child(handle: &mut SandboxHandle, cancel: &CancellationToken) -> ChildOutcome {
    let name = handle.id().to_string();
    let mut result = None;
    let mut child_error = None;
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return ChildOutcome::Cancelled,
            event = handle.next_event() => match event {
                Some(SandboxEvent::Result { value }) => result = Some(value),
                Some(SandboxEvent::Error { message }) => child_error = Some(message),
                Some(SandboxEvent::Log { .. }) => {}
                Some(SandboxEvent::Finished { status }) => {
                    return finish_child(&name, status, result, child_error)
                }
                None => {
                    return ChildOutcome::Failed(ActionError::ChildFailed {
                        name,
                        message: "child stopped without reporting completion".to_string(),
                    })
                }
            }
        }
    }
}

fn finish_child(
    name: &str,
    status: ExitStatus,
    result: Option<Value>,
    child_error: Option<String>,
) -> ChildOutcome {
    if let Some(message) = child_error {
        return ChildOutcome::Failed(ActionError::ChildFailed {
            name: name.to_string(),
            message,
        });
    }
    match status {
        ExitStatus::Success => ChildOutcome::Value(result.unwrap_or(Value::Null)),
        other => ChildOutcome::Failed(ActionError::ChildFailed {
            name: name.to_string(),
            message: other.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests;
