//! Turn orchestrator - the pass loop driving one run

use anyhow::{Context, Result};
use futures_util::stream::{FuturesUnordered, StreamExt};
use serde_json::{json, Value};
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::guardrail::{GuardrailCheck, GuardrailCounter};
use super::live::LiveHub;
use super::outcome::TurnOutcome;
use crate::deck::{ResolvedDeck, END_TOOL, RESPOND_TOOL};
use crate::dispatch::{ActionDispatcher, ActionError, DispatchOutcome, HandlerCall};
use crate::observability::Logger;
use crate::provider::{
    ModelProvider, ModelRequest, ModelResponse, ResponseAccumulator, StreamChunk, ToolCallRequest,
};
use crate::sandbox::SandboxBridge;
use crate::scheduler::handlers::{render_status, ErrorHandlerResult, HandlerInput, HandlerKind};
use crate::scheduler::{HandlerScheduler, TimerFire, TimerKind};
use crate::session::{
    MessageRole, Session, SessionRecorder, StoreResult, ToolCallRecord, TraceKind,
};

/// Orchestrator settings
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Stream model output when the provider supports it
    pub streaming: bool,
    /// Model override passed to the provider
    pub model: Option<String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            streaming: true,
            model: None,
        }
    }
}

impl OrchestratorConfig {
    pub fn from_configuration(config: &crate::config::Configuration) -> Self {
        Self {
            streaming: config.runtime.streaming,
            model: None,
        }
    }
}

/// Aborts whichever run is in progress. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle {
    current: Arc<Mutex<CancellationToken>>,
}

impl AbortHandle {
    /// Cancel the run in progress
    pub fn abort(&self) {
        self.current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .cancel();
    }

    pub fn is_aborted(&self) -> bool {
        self.current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_cancelled()
    }

    /// Install a fresh token for a new run
    pub(crate) fn begin(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *self
            .current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = token.clone();
        token
    }
}

enum ModelCallResult {
    Response(ModelResponse),
    Failed {
        error: String,
        partial: Option<String>,
    },
    Cancelled,
}

/// Drives a session through runs of one deck.
///
/// The orchestrator owns the [`SessionRecorder`], so it is the only writer
/// of the session. Tool calls, busy and idle timers, and sandbox events all
/// reach the session through it.
pub struct Orchestrator {
    deck: Arc<ResolvedDeck>,
    recorder: SessionRecorder,
    dispatcher: ActionDispatcher,
    timers: TimerScope,
    config: OrchestratorConfig,
    logger: Option<Arc<Logger>>,
    live: Option<LiveHub>,
    abort: AbortHandle,
}

impl Orchestrator {
    pub fn new(
        deck: Arc<ResolvedDeck>,
        recorder: SessionRecorder,
        sandbox: Arc<dyn SandboxBridge>,
        config: OrchestratorConfig,
    ) -> Self {
        let scheduler = HandlerScheduler::new();
        let dispatcher = ActionDispatcher::new(Arc::clone(&deck), sandbox, scheduler.clone());
        Self {
            deck,
            recorder,
            dispatcher,
            timers: TimerScope(scheduler),
            config,
            logger: None,
            live: None,
            abort: AbortHandle::default(),
        }
    }

    /// Journal every run to a markdown log
    pub fn with_logger(mut self, logger: Arc<Logger>) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Stream trace events to a live hub. Must be called inside a tokio runtime.
    pub fn with_live(mut self, hub: LiveHub) -> Self {
        hub.forward(self.recorder.subscribe());
        self.live = Some(hub);
        self
    }

    pub fn deck(&self) -> &Arc<ResolvedDeck> {
        &self.deck
    }

    pub fn session(&self) -> &Session {
        self.recorder.session()
    }

    pub fn recorder_mut(&mut self) -> &mut SessionRecorder {
        &mut self.recorder
    }

    pub fn scheduler(&self) -> &HandlerScheduler {
        &self.timers.0
    }

    pub fn live(&self) -> Option<&LiveHub> {
        self.live.as_ref()
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    /// Give the recorder back, disarming any timer still armed
    pub fn into_recorder(self) -> SessionRecorder {
        self.recorder
    }

    /// Run one turn with a generated run id
    pub async fn advance(&mut self, provider: &dyn ModelProvider, input: &str) -> Result<TurnOutcome> {
        let run_id = uuid::Uuid::new_v4().to_string();
        self.advance_as(run_id, provider, input).await
    }

    /// Run one turn under a caller-chosen run id.
    ///
    /// Errors are infrastructure failures (the session could not be written);
    /// every model or action failure is folded into the outcome.
    pub async fn advance_as(
        &mut self,
        run_id: String,
        provider: &dyn ModelProvider,
        input: &str,
    ) -> Result<TurnOutcome> {
        let cancel = self.abort.begin();
        let source = self.deck.source();
        let result = self.run(&run_id, &source, provider, input, &cancel).await;
        if let Err(e) = &result {
            if let Some(live) = &self.live {
                live.error(run_id.as_str(), format!("{:#}", e));
            }
        }
        result
    }

    async fn run(
        &mut self,
        run_id: &str,
        source: &str,
        provider: &dyn ModelProvider,
        input: &str,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome> {
        self.recorder
            .record(
                TraceKind::RunStarted,
                Some(run_id),
                json!({ "source": source, "input": input, "maxPasses": self.deck.max_passes() }),
            )
            .context("Failed to record run start")?;
        self.journal(|log| log.log_run_start(run_id, source, input));
        info!(target: "deckrun::orchestration", run_id, source, "run started");

        let format = self.recorder.session().format;
        if self.recorder.session().entries.is_empty() && !self.deck.prompt().is_empty() {
            for entry in format.text_entries(MessageRole::System, self.deck.prompt()) {
                self.recorder.append_entry(Some(run_id), &entry)?;
            }
        }
        for entry in format.text_entries(MessageRole::User, input) {
            self.recorder.append_entry(Some(run_id), &entry)?;
        }

        let mut guardrail = GuardrailCounter::new(self.deck.max_passes());
        let outcome = self
            .pass_loop(run_id, provider, &mut guardrail, cancel)
            .await
            .context("Failed to record run")?;

        if let TurnOutcome::Cancelled = outcome {
            self.recorder.record(
                TraceKind::ExecutionCancelled,
                Some(run_id),
                json!({ "scope": "run", "passes": guardrail.passes() }),
            )?;
        }

        let status = outcome.status();
        self.recorder
            .record(
                TraceKind::RunFinished,
                Some(run_id),
                json!({
                    "status": status,
                    "passes": guardrail.passes(),
                    "outcome": serde_json::to_value(&outcome)?,
                }),
            )
            .context("Failed to record run finish")?;
        self.recorder
            .flush_snapshot()
            .context("Failed to write session snapshot")?;

        let status_text = serde_json::to_value(status)?
            .as_str()
            .unwrap_or_default()
            .to_string();
        self.journal(|log| log.log_completion(run_id, &status_text, guardrail.passes()));
        info!(target: "deckrun::orchestration", run_id, status = %status_text, passes = guardrail.passes(), "run finished");
        Ok(outcome)
    }

    async fn pass_loop(
        &mut self,
        run_id: &str,
        provider: &dyn ModelProvider,
        guardrail: &mut GuardrailCounter,
        cancel: &CancellationToken,
    ) -> StoreResult<TurnOutcome> {
        let model = self
            .config
            .model
            .clone()
            .unwrap_or_else(|| provider.default_model());

        loop {
            if cancel.is_cancelled() {
                return Ok(TurnOutcome::Cancelled);
            }

            let pass = match guardrail.check_and_increment() {
                GuardrailCheck::Ok { pass } => pass,
                GuardrailCheck::Tripped { passes, limit } => {
                    self.recorder.record(
                        TraceKind::GuardrailTripped,
                        Some(run_id),
                        json!({ "passes": passes, "limit": limit, "message": "guardrail exceeded" }),
                    )?;
                    warn!(target: "deckrun::orchestration", run_id, passes, limit, "guardrail exceeded");
                    return Ok(TurnOutcome::GuardrailTripped { passes, limit });
                }
            };

            self.recorder.record(
                TraceKind::ModelCall,
                Some(run_id),
                json!({ "pass": pass, "model": model }),
            )?;
            let request = self.build_request(run_id, provider);
            if self.logger.is_some() {
                let history: Vec<Value> = request
                    .history
                    .iter()
                    .filter_map(|entry| serde_json::to_value(entry).ok())
                    .collect();
                self.journal(|log| log.log_model_call(run_id, pass, &history, &model));
            }

            let response = match self.call_model(provider, request, run_id, pass, cancel).await? {
                ModelCallResult::Response(response) => response,
                ModelCallResult::Cancelled => return Ok(TurnOutcome::Cancelled),
                ModelCallResult::Failed { error, partial } => {
                    self.recorder.record(
                        TraceKind::Error,
                        Some(run_id),
                        json!({ "kind": "provider", "pass": pass, "message": error, "partial": partial }),
                    )?;
                    self.journal(|log| log.log_error(&error, None));
                    if let Some(text) = partial.as_deref().filter(|t| !t.is_empty()) {
                        let format = self.recorder.session().format;
                        for entry in format.assistant_entries(Some(text), &[]) {
                            self.recorder.append_entry(Some(run_id), &entry)?;
                        }
                    }
                    if self.recover_provider_error(&error, run_id, pass, cancel).await? {
                        continue;
                    }
                    return Ok(TurnOutcome::Fatal { error, partial });
                }
            };

            let call_names: Vec<String> = response.tool_calls.iter().map(|c| c.name.clone()).collect();
            self.recorder.record(
                TraceKind::ModelResult,
                Some(run_id),
                json!({ "pass": pass, "text": response.text, "toolCalls": call_names, "status": response.status }),
            )?;
            self.journal(|log| log.log_model_response(response.text.as_deref(), &call_names, &model));

            let records: Vec<ToolCallRecord> =
                response.tool_calls.iter().map(|call| call.to_record()).collect();
            if response.text.is_some() || !records.is_empty() {
                let format = self.recorder.session().format;
                for entry in format.assistant_entries(response.text.as_deref(), &records) {
                    self.recorder.append_entry(Some(run_id), &entry)?;
                }
            }

            if !response.has_tool_calls() {
                return Ok(TurnOutcome::Replied {
                    text: response.text.unwrap_or_default(),
                });
            }

            debug!(target: "deckrun::orchestration", run_id, pass, calls = ?call_names, "dispatching tool calls");
            for call in &response.tool_calls {
                if cancel.is_cancelled() {
                    return Ok(TurnOutcome::Cancelled);
                }

                let dispatched = if self.is_terminal_tool(&call.name) {
                    match call.parse_arguments() {
                        Ok(args) => return self.finish_with(run_id, call, args),
                        Err(e) => {
                            let err = ActionError::MalformedArguments {
                                name: call.name.clone(),
                                message: e.to_string(),
                            };
                            self.dispatcher
                                .recover(err, call, &mut self.recorder, run_id, cancel)
                                .await?
                        }
                    }
                } else {
                    self.dispatcher
                        .dispatch(call, &mut self.recorder, run_id, cancel)
                        .await?
                };

                if let Some(outcome) = self.settle(run_id, call, dispatched)? {
                    return Ok(outcome);
                }
            }
        }
    }

    fn is_terminal_tool(&self, name: &str) -> bool {
        (name == RESPOND_TOOL && self.deck.respond_enabled())
            || (name == END_TOOL && self.deck.end_enabled())
    }

    /// Close the run on a `respond` or `end` call
    fn finish_with(
        &mut self,
        run_id: &str,
        call: &ToolCallRequest,
        args: Value,
    ) -> StoreResult<TurnOutcome> {
        if call.name == RESPOND_TOOL {
            let payload = args.get("payload").cloned().unwrap_or(args);
            self.append_tool_result(run_id, &call.id, &call.name, &payload, false)?;
            return Ok(TurnOutcome::Responded { payload });
        }
        let message = args.get("message").and_then(Value::as_str).map(str::to_string);
        self.append_tool_result(run_id, &call.id, &call.name, &json!({ "ended": true }), false)?;
        Ok(TurnOutcome::Ended { message })
    }

    /// Feed a dispatch result back into the history. Returns the outcome
    /// when the call ends the run.
    fn settle(
        &mut self,
        run_id: &str,
        call: &ToolCallRequest,
        dispatched: DispatchOutcome,
    ) -> StoreResult<Option<TurnOutcome>> {
        match dispatched {
            DispatchOutcome::Completed(result) => {
                self.append_tool_result(
                    run_id,
                    &result.call_id,
                    &result.name,
                    &result.output,
                    result.is_error,
                )?;
                let output = result.output.to_string();
                self.journal(|log| {
                    log.log_tool_execution(&call.name, &call.arguments, &output, !result.handled)
                });
                Ok(None)
            }
            DispatchOutcome::Fatal(err) => {
                let error = err.to_string();
                self.journal(|log| log.log_error(&error, None));
                Ok(Some(TurnOutcome::Fatal {
                    error,
                    partial: None,
                }))
            }
            DispatchOutcome::Cancelled => Ok(Some(TurnOutcome::Cancelled)),
        }
    }

    fn build_request(&self, run_id: &str, provider: &dyn ModelProvider) -> ModelRequest {
        let history = self
            .recorder
            .session()
            .history()
            .into_iter()
            .filter(|entry| entry.role() != MessageRole::System)
            .collect();
        let prompt = self.deck.prompt();
        ModelRequest {
            run_id: run_id.to_string(),
            model: self.config.model.clone(),
            system: (!prompt.is_empty()).then(|| prompt.to_string()),
            history,
            tools: self.deck.tool_definitions(),
            stream: self.config.streaming && provider.supports_streaming(),
        }
    }

    async fn call_model(
        &mut self,
        provider: &dyn ModelProvider,
        request: ModelRequest,
        run_id: &str,
        pass: u32,
        cancel: &CancellationToken,
    ) -> StoreResult<ModelCallResult> {
        if !request.stream {
            return Ok(tokio::select! {
                biased;
                _ = cancel.cancelled() => ModelCallResult::Cancelled,
                result = provider.generate(request) => match result {
                    Ok(response) => ModelCallResult::Response(response),
                    Err(e) => ModelCallResult::Failed { error: format!("{:#}", e), partial: None },
                },
            });
        }

        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(ModelCallResult::Cancelled),
            opened = provider.generate_stream(request) => opened,
        };
        let mut stream = match opened {
            Ok(stream) => stream,
            Err(e) => {
                return Ok(ModelCallResult::Failed {
                    error: format!("{:#}", e),
                    partial: None,
                })
            }
        };

        let mut accumulator = ResponseAccumulator::new();
        loop {
            let chunk = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(ModelCallResult::Cancelled),
                chunk = stream.next() => chunk,
            };
            match chunk {
                Some(Ok(chunk)) => {
                    if !matches!(chunk, StreamChunk::Done { .. }) {
                        self.recorder.record(
                            TraceKind::StreamDelta,
                            Some(run_id),
                            json!({ "pass": pass, "chunk": chunk }),
                        )?;
                    }
                    accumulator.push(&chunk);
                    if accumulator.is_done() {
                        break;
                    }
                }
                Some(Err(e)) => {
                    let partial = accumulator.partial_text().to_string();
                    return Ok(ModelCallResult::Failed {
                        error: format!("{:#}", e),
                        partial: (!partial.is_empty()).then_some(partial),
                    });
                }
                None => break,
            }
        }
        Ok(ModelCallResult::Response(accumulator.finish()))
    }

    /// Route a provider failure through `onError`. Returns true when the
    /// handler produced a result that was fed back as a synthetic tool result.
    async fn recover_provider_error(
        &mut self,
        error: &str,
        run_id: &str,
        pass: u32,
        cancel: &CancellationToken,
    ) -> StoreResult<bool> {
        let Some(binding) = self.deck.handler(HandlerKind::Error).cloned() else {
            return Ok(false);
        };
        let input = HandlerInput::error(self.deck.source(), "provider", error, None, None);
        match self
            .dispatcher
            .invoke_handler(&binding.target, input.to_value(), cancel)
            .await
        {
            Ok(value) => {
                let handled = ErrorHandlerResult::from_value(value);
                self.recorder.record(
                    TraceKind::HandlerFired,
                    Some(run_id),
                    json!({ "handler": HandlerKind::Error.as_str(), "pass": pass, "result": handled }),
                )?;
                let call_id = format!("{}-{}", HandlerKind::Error.as_str(), pass);
                let record = ToolCallRecord {
                    id: call_id.clone(),
                    name: HandlerKind::Error.as_str().to_string(),
                    arguments: "{}".to_string(),
                };
                let format = self.recorder.session().format;
                for entry in format.assistant_entries(None, &[record]) {
                    self.recorder.append_entry(Some(run_id), &entry)?;
                }
                self.append_tool_result(
                    run_id,
                    &call_id,
                    HandlerKind::Error.as_str(),
                    &handled.to_tool_output(),
                    false,
                )?;
                let summary = handled.to_tool_output().to_string();
                self.journal(|log| log.log_handler(HandlerKind::Error.as_str(), &summary));
                Ok(true)
            }
            Err(e) => {
                warn!(target: "deckrun::orchestration", run_id, error = %e, "onError handler failed");
                self.recorder.record(
                    TraceKind::Error,
                    Some(run_id),
                    json!({ "kind": "handler_failed", "handler": HandlerKind::Error.as_str(), "message": format!("{:#}", e) }),
                )?;
                Ok(false)
            }
        }
    }

    /// Wait for external input while the `onIdle` timer runs.
    ///
    /// Each idle fire invokes the handler alongside the wait and appends its
    /// answer to the status lane. The timer is disarmed as soon as `input`
    /// resolves, and an answer still pending at that point is dropped.
    pub async fn wait_for_input<F, T>(&mut self, input: F) -> Result<T>
    where
        F: Future<Output = T>,
    {
        let Some(binding) = self.deck.handler(HandlerKind::Idle).cloned() else {
            return Ok(input.await);
        };

        let (fire_tx, mut fire_rx) = mpsc::unbounded_channel::<TimerFire>();
        let token = self.timers.0.arm(TimerKind::Idle, binding.delay, binding.repeat, move |fire| {
            let _ = fire_tx.send(fire);
        });
        let handler_cancel = self.abort.begin().child_token();
        let dispatcher = self.dispatcher.clone();
        let mut in_flight: FuturesUnordered<HandlerCall<'_>> = FuturesUnordered::new();
        tokio::pin!(input);

        let result = loop {
            tokio::select! {
                biased;
                value = &mut input => break Ok(value),
                Some(fire) = fire_rx.recv() => {
                    if fire.token != token {
                        continue;
                    }
                    if !in_flight.is_empty() {
                        debug!(
                            target: "deckrun::orchestration",
                            fire_count = fire.fire_count,
                            "onIdle handler still running, skipping fire"
                        );
                        continue;
                    }
                    let handler_input = HandlerInput::idle(self.deck.source(), fire.elapsed, fire.fire_count);
                    in_flight.push(dispatcher.handler_call(
                        &binding.target,
                        fire,
                        handler_input.to_value(),
                        handler_cancel.clone(),
                    ));
                }
                Some((fire, answered)) = in_flight.next(), if !in_flight.is_empty() => {
                    if let Err(e) = self.record_idle(&fire, answered) {
                        break Err(e);
                    }
                }
            }
        };

        self.timers.0.disarm(&token);
        handler_cancel.cancel();
        while in_flight.next().await.is_some() {}
        result
    }

    fn record_idle(&mut self, fire: &TimerFire, answered: anyhow::Result<Value>) -> Result<()> {
        match answered {
            Ok(value) => {
                let text = render_status(&value, fire.elapsed);
                self.recorder.record(
                    TraceKind::HandlerFired,
                    None,
                    json!({
                        "handler": HandlerKind::Idle.as_str(),
                        "fireCount": fire.fire_count,
                        "elapsedMs": fire.elapsed.as_millis() as u64,
                        "result": value,
                    }),
                )?;
                let format = self.recorder.session().format;
                for entry in format.text_entries(MessageRole::Status, text.clone()) {
                    self.recorder.append_entry(None, &entry)?;
                }
                self.journal(|log| log.log_handler(HandlerKind::Idle.as_str(), &text));
            }
            Err(e) => {
                warn!(target: "deckrun::orchestration", error = %e, "onIdle handler failed");
                self.recorder.record(
                    TraceKind::Error,
                    None,
                    json!({ "kind": "handler_failed", "handler": HandlerKind::Idle.as_str(), "message": format!("{:#}", e) }),
                )?;
            }
        }
        Ok(())
    }

    fn append_tool_result(
        &mut self,
        run_id: &str,
        call_id: &str,
        name: &str,
        output: &Value,
        is_error: bool,
    ) -> StoreResult<()> {
        let entry = self
            .recorder
            .session()
            .format
            .tool_result_entry(call_id, name, output, is_error);
        self.recorder.append_entry(Some(run_id), &entry)?;
        Ok(())
    }

    fn journal<F>(&self, write: F)
    where
        F: FnOnce(&Logger) -> Result<()>,
    {
        if let Some(logger) = &self.logger {
            if let Err(e) = write(logger) {
                warn!(target: "deckrun::orchestration", error = %e, "failed to write run journal");
            }
        }
    }
}

/// Disarms every timer left armed when the orchestrator goes away
struct TimerScope(HandlerScheduler);

impl Drop for TimerScope {
    fn drop(&mut self) {
        let disarmed = self.0.disarm_all();
        if disarmed > 0 {
            debug!(target: "deckrun::orchestration", disarmed, "disarmed leftover timers");
        }
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("deck", &self.deck.source())
            .field("session", &self.recorder.session_id())
            .field("config", &self.config)
            .finish()
    }
}
