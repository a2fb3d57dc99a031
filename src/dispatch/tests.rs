use super::*;
use crate::deck::{ComputeRegistry, DeckDescriptor, ResolveOptions};
use crate::session::{SessionFormat, SessionStore};
use crate::testing::{ScriptedChild, ScriptedSandbox};
use anyhow::anyhow;
use serde_json::json;
use tempfile::TempDir;

fn registry() -> ComputeRegistry {
    let mut registry = ComputeRegistry::new();
    registry
        .register("inc", |args| Ok(json!(args["x"].as_i64().unwrap_or(0) + 1)))
        .unwrap();
    registry
        .register("boom", |_| Err(anyhow!("compute exploded")))
        .unwrap();
    registry
        .register("recover", |_| Ok(json!({"message": "recovered", "status": 200})))
        .unwrap();
    registry
        .register("still", |input| {
            Ok(json!(format!("still working #{}", input["trigger"]["fireCount"])))
        })
        .unwrap();
    registry
}

fn setup(deck_json: &str, sandbox: ScriptedSandbox) -> (TempDir, ActionDispatcher, SessionRecorder, Arc<ScriptedSandbox>) {
    let tmp = TempDir::new().unwrap();
    let descriptor = DeckDescriptor::from_json_str(deck_json).unwrap();
    let deck = ResolvedDeck::resolve(descriptor, &registry(), &ResolveOptions::default()).unwrap();
    let sandbox = Arc::new(sandbox);
    let dispatcher = ActionDispatcher::new(Arc::new(deck), sandbox.clone(), HandlerScheduler::new());
    let store = SessionStore::new(tmp.path().join("home"), tmp.path()).unwrap();
    let recorder = store.create(SessionFormat::Chat).unwrap();
    (tmp, dispatcher, recorder, sandbox)
}

fn kinds(recorder: &SessionRecorder) -> Vec<TraceKind> {
    recorder
        .store()
        .read_events(recorder.session_id())
        .unwrap()
        .into_iter()
        .map(|e| e.kind)
        .collect()
}

#[tokio::test]
async fn test_in_process_action_completes() {
    let (_tmp, dispatcher, mut recorder, _) = setup(
        r#"{ "prompt": "p", "actions": [{ "name": "inc", "ref": "builtin:inc" }] }"#,
        ScriptedSandbox::new(),
    );
    let call = ToolCallRequest::new("c1", "inc", r#"{"x": 41}"#);

    let outcome = dispatcher
        .dispatch(&call, &mut recorder, "run-1", &CancellationToken::new())
        .await
        .unwrap();

    match outcome {
        DispatchOutcome::Completed(result) => {
            assert_eq!(result.output, json!(42));
            assert!(!result.handled);
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert_eq!(
        kinds(&recorder),
        vec![TraceKind::SessionCreated, TraceKind::ToolDispatch, TraceKind::ToolResult]
    );
}

#[tokio::test]
async fn test_unknown_action_without_on_error_is_fatal() {
    let (_tmp, dispatcher, mut recorder, _) =
        setup(r#"{ "prompt": "p" }"#, ScriptedSandbox::new());
    let call = ToolCallRequest::new("c1", "nope", "{}");

    let outcome = dispatcher
        .dispatch(&call, &mut recorder, "run-1", &CancellationToken::new())
        .await
        .unwrap();

    assert!(matches!(
        outcome,
        DispatchOutcome::Fatal(ActionError::UnknownAction { .. })
    ));
    assert!(kinds(&recorder).contains(&TraceKind::Error));
}

#[tokio::test]
async fn test_on_error_result_becomes_tool_result() {
    let (_tmp, dispatcher, mut recorder, _) = setup(
        r#"{
            "prompt": "p",
            "actions": [{ "name": "boom", "ref": "builtin:boom" }],
            "handlers": { "onError": { "ref": "builtin:recover" } }
        }"#,
        ScriptedSandbox::new(),
    );
    let call = ToolCallRequest::new("c1", "boom", "{}");

    let outcome = dispatcher
        .dispatch(&call, &mut recorder, "run-1", &CancellationToken::new())
        .await
        .unwrap();

    let DispatchOutcome::Completed(result) = outcome else {
        panic!("expected a handled result");
    };
    assert!(result.handled);
    assert_eq!(result.output["message"], "recovered");
    assert_eq!(result.output["status"], 200);
    assert!(kinds(&recorder).contains(&TraceKind::HandlerFired));
}

#[tokio::test]
async fn test_failing_on_error_surfaces_original_error() {
    let (_tmp, dispatcher, mut recorder, _) = setup(
        r#"{
            "prompt": "p",
            "actions": [{ "name": "boom", "ref": "builtin:boom" }],
            "handlers": { "onError": { "ref": "builtin:boom" } }
        }"#,
        ScriptedSandbox::new(),
    );
    let call = ToolCallRequest::new("c1", "boom", "{}");

    let outcome = dispatcher
        .dispatch(&call, &mut recorder, "run-1", &CancellationToken::new())
        .await
        .unwrap();

    match outcome {
        DispatchOutcome::Fatal(ActionError::Compute { name, .. }) => assert_eq!(name, "boom"),
        other => panic!("unexpected outcome: {:?}", other),
    }
}

#[tokio::test]
async fn test_malformed_arguments_are_action_errors() {
    let (_tmp, dispatcher, mut recorder, _) = setup(
        r#"{ "prompt": "p", "actions": [{ "name": "inc", "ref": "builtin:inc" }] }"#,
        ScriptedSandbox::new(),
    );
    let call = ToolCallRequest::new("c1", "inc", "{not json");

    let outcome = dispatcher
        .dispatch(&call, &mut recorder, "run-1", &CancellationToken::new())
        .await
        .unwrap();

    assert!(matches!(
        outcome,
        DispatchOutcome::Fatal(ActionError::MalformedArguments { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn test_sandboxed_child_with_busy_handler() {
    let (_tmp, dispatcher, mut recorder, sandbox) = setup(
        r#"{
            "prompt": "p",
            "actions": [{ "name": "slow", "ref": "child.wasm" }],
            "handlers": { "onBusy": { "ref": "builtin:still", "delayMs": 500 } }
        }"#,
        ScriptedSandbox::new().script(
            "child.wasm",
            ScriptedChild::returning(Duration::from_millis(2000), json!({"done": true}))
                .with_log("working"),
        ),
    );
    let call = ToolCallRequest::new("c1", "slow", r#"{"n": 1}"#);

    let outcome = dispatcher
        .dispatch(&call, &mut recorder, "run-1", &CancellationToken::new())
        .await
        .unwrap();

    let DispatchOutcome::Completed(result) = outcome else {
        panic!("expected completion");
    };
    assert_eq!(result.output, json!({"done": true}));

    let status: Vec<_> = recorder.session().status_entries().collect();
    assert_eq!(status.len(), 1);
    assert!(status[0].text().unwrap_or_default().starts_with("still working #1"));

    let kinds = kinds(&recorder);
    assert!(kinds.contains(&TraceKind::SandboxLog));
    assert_eq!(sandbox.spawns()[0].input, json!({"n": 1}));
    assert_eq!(sandbox.terminations(), 1);
    assert_eq!(dispatcher.scheduler().active_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_slow_busy_handler_does_not_hold_back_child_result() {
    let (_tmp, dispatcher, mut recorder, sandbox) = setup(
        r#"{
            "prompt": "p",
            "actions": [{ "name": "slow", "ref": "child.wasm" }],
            "handlers": { "onBusy": { "ref": "busy.wasm", "delayMs": 500 } }
        }"#,
        ScriptedSandbox::new()
            .script(
                "child.wasm",
                ScriptedChild::returning(Duration::from_millis(2000), json!({"done": true})),
            )
            .script(
                "busy.wasm",
                ScriptedChild::returning(Duration::from_millis(10_000), json!("still scanning")),
            ),
    );
    let call = ToolCallRequest::new("c1", "slow", "{}");
    let started = Instant::now();

    let outcome = dispatcher
        .dispatch(&call, &mut recorder, "run-1", &CancellationToken::new())
        .await
        .unwrap();

    assert!(started.elapsed() < Duration::from_millis(2500));
    let DispatchOutcome::Completed(result) = outcome else {
        panic!("expected completion");
    };
    assert_eq!(result.output, json!({"done": true}));

    // the handler was still running when the child finished
    assert_eq!(recorder.session().status_entries().count(), 0);
    assert!(!kinds(&recorder).contains(&TraceKind::HandlerFired));
    assert_eq!(sandbox.spawns().len(), 2);
    assert_eq!(sandbox.terminations(), 2);
    assert_eq!(dispatcher.scheduler().active_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_hanging_busy_handler_is_not_stacked() {
    let (_tmp, dispatcher, mut recorder, sandbox) = setup(
        r#"{
            "prompt": "p",
            "actions": [{ "name": "slow", "ref": "child.wasm" }],
            "handlers": { "onBusy": { "ref": "busy.wasm", "delayMs": 200, "repeatMs": 200 } }
        }"#,
        ScriptedSandbox::new()
            .script(
                "child.wasm",
                ScriptedChild::returning(Duration::from_millis(1500), json!(7)),
            )
            .script("busy.wasm", ScriptedChild::hanging()),
    );
    let call = ToolCallRequest::new("c1", "slow", "{}");

    let outcome = dispatcher
        .dispatch(&call, &mut recorder, "run-1", &CancellationToken::new())
        .await
        .unwrap();

    assert!(matches!(outcome, DispatchOutcome::Completed(ref r) if r.output == json!(7)));
    let handler_spawns = sandbox
        .spawns()
        .iter()
        .filter(|spawn| spawn.entry.ends_with("busy.wasm"))
        .count();
    assert_eq!(handler_spawns, 1);
    assert_eq!(recorder.session().status_entries().count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_fast_child_never_fires_busy() {
    let (_tmp, dispatcher, mut recorder, _) = setup(
        r#"{
            "prompt": "p",
            "actions": [{ "name": "quick", "ref": "child.wasm" }],
            "handlers": { "onBusy": { "ref": "builtin:still", "delayMs": 500 } }
        }"#,
        ScriptedSandbox::new().script(
            "child.wasm",
            ScriptedChild::returning(Duration::from_millis(100), json!(1)),
        ),
    );
    let call = ToolCallRequest::new("c1", "quick", "{}");

    dispatcher
        .dispatch(&call, &mut recorder, "run-1", &CancellationToken::new())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(1000)).await;

    assert_eq!(recorder.session().status_entries().count(), 0);
    assert!(!kinds(&recorder).contains(&TraceKind::HandlerFired));
}

#[tokio::test(start_paused = true)]
async fn test_cancel_terminates_child_and_disarms_timer() {
    let (_tmp, dispatcher, mut recorder, sandbox) = setup(
        r#"{
            "prompt": "p",
            "actions": [{ "name": "stuck", "ref": "child.wasm" }],
            "handlers": { "onBusy": { "ref": "builtin:still", "delayMs": 500, "repeatMs": 500 } }
        }"#,
        ScriptedSandbox::new().script("child.wasm", ScriptedChild::hanging()),
    );
    let call = ToolCallRequest::new("c1", "stuck", "{}");
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(1200)).await;
        trigger.cancel();
    });

    let outcome = dispatcher
        .dispatch(&call, &mut recorder, "run-1", &cancel)
        .await
        .unwrap();

    assert!(matches!(outcome, DispatchOutcome::Cancelled));
    assert_eq!(recorder.session().status_entries().count(), 2);
    assert_eq!(sandbox.terminations(), 1);
    assert_eq!(dispatcher.scheduler().active_count(), 0);
    assert_eq!(kinds(&recorder).last(), Some(&TraceKind::ExecutionCancelled));
}

#[tokio::test]
async fn test_failing_child_routes_to_on_error() {
    let (_tmp, dispatcher, mut recorder, _) = setup(
        r#"{
            "prompt": "p",
            "actions": [{ "name": "bad", "ref": "child.wasm" }],
            "handlers": { "onError": { "ref": "builtin:recover" } }
        }"#,
        ScriptedSandbox::new().script(
            "child.wasm",
            ScriptedChild::failing(Duration::from_millis(10), "disk on fire"),
        ),
    );
    let call = ToolCallRequest::new("c1", "bad", "{}");

    let outcome = dispatcher
        .dispatch(&call, &mut recorder, "run-1", &CancellationToken::new())
        .await
        .unwrap();

    let DispatchOutcome::Completed(result) = outcome else {
        panic!("expected a handled result");
    };
    assert!(result.handled);
    let events = recorder.store().read_events(recorder.session_id()).unwrap();
    let error = events.iter().find(|e| e.kind == TraceKind::Error).unwrap();
    assert_eq!(error.payload["kind"], "child_failed");
}

#[tokio::test]
async fn test_pending_execution_teardown_is_idempotent() {
    let scheduler = HandlerScheduler::new();
    let mut pending = PendingExecution::new("deck.json", "slow", PermissionSet::none());
    assert!(pending.is_active());
    assert!(pending.teardown(&scheduler));
    assert!(!pending.teardown(&scheduler));
    assert!(pending.cancel.is_cancelled());
    assert!(!pending.is_active());
}
