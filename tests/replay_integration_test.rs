//! Replay equivalence: the event log alone rebuilds the live session

use deckrun::deck::{ComputeRegistry, DeckDescriptor, ResolveOptions, ResolvedDeck};
use deckrun::orchestration::{Orchestrator, OrchestratorConfig, TurnOutcome};
use deckrun::session::{Session, SessionFormat, SessionStore, TraceKind};
use deckrun::testing::{ScriptedChild, ScriptedProvider, ScriptedSandbox};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const DECK: &str = r#"{
    "prompt": "answer with the tally",
    "actions": [
        { "name": "tally", "ref": "builtin:tally" },
        { "name": "scan", "ref": "scan.wasm" }
    ],
    "handlers": { "onBusy": { "ref": "builtin:busy", "delayMs": 300, "repeatMs": 300 } },
    "syntheticTools": { "respond": true }
}"#;

fn deck() -> Arc<ResolvedDeck> {
    let mut registry = ComputeRegistry::new();
    registry
        .register("tally", |args| Ok(json!({ "count": args["items"].as_array().map_or(0, Vec::len) })))
        .unwrap();
    registry.register("busy", |_| Ok(json!("scanning"))).unwrap();
    let descriptor = DeckDescriptor::from_json_str(DECK).unwrap();
    Arc::new(ResolvedDeck::resolve(descriptor, &registry, &ResolveOptions::default()).unwrap())
}

fn sandbox() -> Arc<ScriptedSandbox> {
    Arc::new(ScriptedSandbox::new().script(
        "scan.wasm",
        ScriptedChild::returning(Duration::from_millis(1000), json!({"found": 2}))
            .with_log("scanned 2 files"),
    ))
}

fn first_turn() -> ScriptedProvider {
    ScriptedProvider::new()
        .then_call("c1", "tally", json!({"items": [1, 2, 3]}))
        .then_call("c2", "scan", json!({}))
        .then_call("c3", "respond", json!({"payload": {"count": 3, "found": 2}}))
}

fn bytes(session: &Session) -> Vec<u8> {
    SessionStore::persisted_form(session).unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_replay_matches_live_session() {
    let tmp = TempDir::new().unwrap();
    let store = SessionStore::new(tmp.path().join("home"), tmp.path()).unwrap();
    let recorder = store.create(SessionFormat::ItemBased).unwrap();
    let session_id = recorder.session_id().to_string();

    let mut orchestrator =
        Orchestrator::new(deck(), recorder, sandbox(), OrchestratorConfig::default());
    let outcome = orchestrator.advance(&first_turn(), "count things").await.unwrap();
    assert_eq!(
        outcome,
        TurnOutcome::Responded {
            payload: json!({"count": 3, "found": 2})
        }
    );

    let live = orchestrator.session().clone();
    assert!(live.status_entries().count() >= 3);

    let replayed = store.replay(&session_id).unwrap();
    assert_eq!(bytes(&replayed), bytes(&live));

    let snapshot = store.read_snapshot(&session_id).unwrap().unwrap();
    assert_eq!(bytes(&snapshot), bytes(&live));

    let events = store.read_events(&session_id).unwrap();
    let sequences: Vec<u64> = events.iter().map(|e| e.sequence).collect();
    assert!(sequences.windows(2).all(|w| w[1] == w[0] + 1));
    assert_eq!(events.first().map(|e| e.kind), Some(TraceKind::SessionCreated));
    assert_eq!(events.last().map(|e| e.kind), Some(TraceKind::RunFinished));
}

#[tokio::test(start_paused = true)]
async fn test_reopened_session_continues_and_still_replays() {
    let tmp = TempDir::new().unwrap();
    let store = SessionStore::new(tmp.path().join("home"), tmp.path()).unwrap();
    let recorder = store.create(SessionFormat::Chat).unwrap();
    let session_id = recorder.session_id().to_string();

    let mut orchestrator =
        Orchestrator::new(deck(), recorder, sandbox(), OrchestratorConfig::default());
    orchestrator.advance(&first_turn(), "count things").await.unwrap();
    let entries_after_first = orchestrator.session().entries.len();
    let sequence_after_first = orchestrator.session().last_sequence;
    drop(orchestrator);

    let reopened = store.open(&session_id).unwrap();
    assert_eq!(reopened.session().entries.len(), entries_after_first);

    let mut orchestrator =
        Orchestrator::new(deck(), reopened, sandbox(), OrchestratorConfig::default());
    let provider = ScriptedProvider::new().then_text("still 3");
    let outcome = orchestrator.advance(&provider, "again?").await.unwrap();
    assert_eq!(outcome, TurnOutcome::Replied { text: "still 3".into() });

    // the system prompt is recorded once per session
    let request = &provider.requests()[0];
    assert_eq!(request.system.as_deref(), Some("answer with the tally"));
    assert!(request.history.len() > 2);

    let live = orchestrator.session().clone();
    assert!(live.last_sequence > sequence_after_first);
    assert_eq!(live.run_count, 2);
    assert_eq!(bytes(&store.replay(&session_id).unwrap()), bytes(&live));
    assert_eq!(bytes(&store.load(&session_id).unwrap()), bytes(&live));
}
