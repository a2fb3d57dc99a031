//! Single writer for a live session

use serde_json::{json, Value};
use tokio::sync::broadcast;

use super::model::{Entry, Session, TraceEvent, TraceKind};
use super::store::SessionStore;
use super::StoreResult;

const OBSERVER_CAPACITY: usize = 1024;

/// Owns the in-memory session and is the only path that mutates it.
///
/// Every change is written to the event log first, then applied to the
/// snapshot, then broadcast to observers.
pub struct SessionRecorder {
    store: SessionStore,
    session: Session,
    since_snapshot: u64,
    observers: broadcast::Sender<TraceEvent>,
}

impl SessionRecorder {
    pub(crate) fn new(store: SessionStore, session: Session) -> Self {
        let (observers, _) = broadcast::channel(OBSERVER_CAPACITY);
        Self {
            store,
            session,
            since_snapshot: 0,
            observers,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn session_id(&self) -> &str {
        &self.session.id
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    /// Receive every event recorded from now on
    pub fn subscribe(&self) -> broadcast::Receiver<TraceEvent> {
        self.observers.subscribe()
    }

    /// Record one event
    pub fn record(
        &mut self,
        kind: TraceKind,
        run_id: Option<&str>,
        payload: Value,
    ) -> StoreResult<TraceEvent> {
        let event = TraceEvent::new(
            self.session.id.clone(),
            self.session.last_sequence + 1,
            run_id.map(str::to_string),
            kind,
            payload,
        );

        self.store.append(&event)?;
        self.session.apply(&event)?;
        let _ = self.observers.send(event.clone());

        self.since_snapshot += 1;
        let interval = self.store.snapshot_interval();
        if interval > 0 && self.since_snapshot >= interval {
            self.flush_snapshot()?;
        }

        Ok(event)
    }

    /// Append a conversation entry
    pub fn append_entry(&mut self, run_id: Option<&str>, entry: &Entry) -> StoreResult<TraceEvent> {
        let payload = serde_json::to_value(entry)?;
        self.record(TraceKind::EntryAppended, run_id, payload)
    }

    /// Set a metadata key; `Value::Null` removes it
    pub fn set_meta(&mut self, key: impl Into<String>, value: Value) -> StoreResult<TraceEvent> {
        let key = key.into();
        self.record(TraceKind::MetaSet, None, json!({ "key": key, "value": value }))
    }

    pub fn set_notes(&mut self, notes: Option<String>) -> StoreResult<TraceEvent> {
        self.record(TraceKind::NotesSet, None, json!({ "notes": notes }))
    }

    pub fn set_rating(&mut self, rating: Option<i32>) -> StoreResult<TraceEvent> {
        self.record(TraceKind::RatingSet, None, json!({ "rating": rating }))
    }

    /// Rewrite the snapshot now
    pub fn flush_snapshot(&mut self) -> StoreResult<()> {
        self.store.snapshot(&self.session)?;
        self.since_snapshot = 0;
        Ok(())
    }
}

impl std::fmt::Debug for SessionRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRecorder")
            .field("session_id", &self.session.id)
            .field("last_sequence", &self.session.last_sequence)
            .finish()
    }
}
