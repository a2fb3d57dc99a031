//! File-backed session store
//!
//! Layout under the store home:
//!
//! ```text
//! <home>/projects/<project-hash>/sessions/<session-id>/events.jsonl
//! <home>/projects/<project-hash>/sessions/<session-id>/snapshot.json
//! ```

use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

use super::atomic::AtomicOps;
use super::events_log::EventsLog;
use super::model::{Session, SessionFormat, TraceEvent, TraceKind};
use super::recorder::SessionRecorder;
use super::{StoreError, StoreResult};

/// Default number of events between snapshot rewrites
pub const DEFAULT_SNAPSHOT_INTERVAL: u64 = 25;

const SNAPSHOT_FILE: &str = "snapshot.json";

/// Session store scoped to one project directory
#[derive(Debug, Clone)]
pub struct SessionStore {
    home: PathBuf,
    project_hash: String,
    snapshot_interval: u64,
}

impl SessionStore {
    /// Create a store rooted at `home` for the project at `project_path`
    pub fn new(home: impl Into<PathBuf>, project_path: &Path) -> StoreResult<Self> {
        let project_hash = project_hash(project_path)?;
        let store = Self {
            home: home.into(),
            project_hash,
            snapshot_interval: DEFAULT_SNAPSHOT_INTERVAL,
        };
        std::fs::create_dir_all(store.sessions_dir())?;
        Ok(store)
    }

    /// Set how many events pass between snapshot rewrites (0 = explicit only)
    pub fn with_snapshot_interval(mut self, interval: u64) -> Self {
        self.snapshot_interval = interval;
        self
    }

    /// Default home directory (`~/.deckrun`)
    pub fn default_home() -> StoreResult<PathBuf> {
        dirs::home_dir()
            .map(|home| home.join(".deckrun"))
            .ok_or_else(|| StoreError::config("Unable to determine home directory"))
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    pub fn project_hash(&self) -> &str {
        &self.project_hash
    }

    pub fn snapshot_interval(&self) -> u64 {
        self.snapshot_interval
    }

    /// Directory holding every session of this project
    pub fn sessions_dir(&self) -> PathBuf {
        self.home
            .join("projects")
            .join(&self.project_hash)
            .join("sessions")
    }

    /// Directory of one session
    pub fn session_dir(&self, session_id: &str) -> StoreResult<PathBuf> {
        validate_session_id(session_id)?;
        Ok(self.sessions_dir().join(session_id))
    }

    /// Check whether a session has at least one logged event
    pub fn exists(&self, session_id: &str) -> bool {
        match self.session_dir(session_id) {
            Ok(dir) => matches!(EventsLog::new(&dir).count(), Ok(n) if n > 0),
            Err(_) => false,
        }
    }

    /// Append one event to the session's log
    pub fn append(&self, event: &TraceEvent) -> StoreResult<()> {
        let dir = self.session_dir(&event.session_id)?;
        std::fs::create_dir_all(&dir)?;
        EventsLog::new(&dir).append(event)
    }

    /// Rewrite the snapshot of a session
    pub fn snapshot(&self, session: &Session) -> StoreResult<()> {
        let dir = self.session_dir(&session.id)?;
        let bytes = Self::persisted_form(session)?;
        AtomicOps::write_bytes(&dir.join(SNAPSHOT_FILE), &bytes)?;
        tracing::debug!(
            target: "deckrun::session",
            session_id = %session.id,
            sequence = session.last_sequence,
            "snapshot written"
        );
        Ok(())
    }

    /// Exact bytes written for a snapshot
    pub fn persisted_form(session: &Session) -> StoreResult<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(session)?)
    }

    /// Read the stored snapshot file, if one has been written
    pub fn read_snapshot(&self, session_id: &str) -> StoreResult<Option<Session>> {
        let path = self.session_dir(session_id)?.join(SNAPSHOT_FILE);
        if !path.exists() {
            return Ok(None);
        }
        AtomicOps::read_json(&path).map(Some)
    }

    /// All events of a session in log order
    pub fn read_events(&self, session_id: &str) -> StoreResult<Vec<TraceEvent>> {
        let dir = self.session_dir(session_id)?;
        EventsLog::new(&dir).read_all()
    }

    /// Load a session: snapshot plus replay of the events written after it
    pub fn load(&self, session_id: &str) -> StoreResult<Session> {
        let dir = self.session_dir(session_id)?;
        let log = EventsLog::new(&dir);
        if !log.exists() {
            return Err(StoreError::not_found(session_id));
        }

        let mut session = match self.read_snapshot(session_id)? {
            Some(snapshot) if snapshot.id == session_id => snapshot,
            Some(_) => {
                return Err(StoreError::corrupted(format!(
                    "snapshot in {} belongs to another session",
                    dir.display()
                )))
            }
            None => Session::empty(session_id),
        };

        let tail = log.read_after(session.last_sequence)?;
        let replayed = tail.len();
        for event in &tail {
            session.apply(event)?;
        }

        let logged = log.last_sequence()?;
        if logged != session.last_sequence {
            return Err(StoreError::corrupted(format!(
                "snapshot of {} is at sequence {} but the event log ends at {}",
                session_id, session.last_sequence, logged
            )));
        }

        tracing::debug!(
            target: "deckrun::session",
            session_id,
            replayed,
            sequence = session.last_sequence,
            "session loaded"
        );
        Ok(session)
    }

    /// Rebuild a session from an empty state using only the event log
    pub fn replay(&self, session_id: &str) -> StoreResult<Session> {
        let events = self.read_events(session_id)?;
        if events.is_empty() {
            return Err(StoreError::not_found(session_id));
        }
        let mut session = Session::empty(session_id);
        for event in &events {
            session.apply(event)?;
        }
        Ok(session)
    }

    /// Session ids of this project, sorted
    pub fn list_sessions(&self) -> StoreResult<Vec<String>> {
        let dir = self.sessions_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut ids = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if self.exists(&name) {
                ids.push(name);
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Start a new session with a generated id
    pub fn create(&self, format: SessionFormat) -> StoreResult<SessionRecorder> {
        self.create_with_id(&uuid::Uuid::new_v4().to_string(), format)
    }

    /// Start a new session with a caller-chosen id
    pub fn create_with_id(
        &self,
        session_id: &str,
        format: SessionFormat,
    ) -> StoreResult<SessionRecorder> {
        if self.exists(session_id) {
            return Err(StoreError::SessionExists {
                session_id: session_id.to_string(),
            });
        }
        std::fs::create_dir_all(self.session_dir(session_id)?)?;

        let mut recorder = SessionRecorder::new(self.clone(), Session::empty(session_id));
        recorder.record(
            TraceKind::SessionCreated,
            None,
            serde_json::json!({ "format": format }),
        )?;
        recorder.flush_snapshot()?;

        tracing::info!(target: "deckrun::session", session_id, %format, "session created");
        Ok(recorder)
    }

    /// Reopen an existing session; new events continue its sequence
    pub fn open(&self, session_id: &str) -> StoreResult<SessionRecorder> {
        let session = self.load(session_id)?;
        Ok(SessionRecorder::new(self.clone(), session))
    }
}

/// Stable short hash of the canonical project path
pub fn project_hash(project_path: &Path) -> StoreResult<String> {
    let canonical = project_path.canonicalize().map_err(|e| {
        StoreError::storage(format!(
            "Failed to canonicalize project path {}: {}",
            project_path.display(),
            e
        ))
    })?;

    let digest = Sha256::digest(canonical.to_string_lossy().as_bytes());
    Ok(digest
        .iter()
        .take(8)
        .map(|b| format!("{:02x}", b))
        .collect())
}

fn validate_session_id(session_id: &str) -> StoreResult<()> {
    let valid = !session_id.is_empty()
        && session_id.len() <= 128
        && session_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidSessionId {
            session_id: session_id.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::model::{MessageRole, RunStatus};
    use serde_json::json;
    use tempfile::TempDir;

    fn store(tmp: &TempDir) -> SessionStore {
        SessionStore::new(tmp.path().join("home"), tmp.path()).unwrap()
    }

    #[test]
    fn test_layout_and_project_hash() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        assert_eq!(store.project_hash().len(), 16);
        assert_eq!(store.project_hash(), project_hash(tmp.path()).unwrap());

        let recorder = store.create_with_id("abc", SessionFormat::Chat).unwrap();
        let dir = store.session_dir("abc").unwrap();
        assert!(dir.join("events.jsonl").exists());
        assert!(dir.join("snapshot.json").exists());
        assert!(dir.starts_with(tmp.path().join("home").join("projects")));
        assert_eq!(recorder.session().last_sequence, 1);
    }

    #[test]
    fn test_invalid_and_duplicate_ids() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        assert!(matches!(
            store.session_dir("../escape"),
            Err(StoreError::InvalidSessionId { .. })
        ));

        store.create_with_id("dup", SessionFormat::Chat).unwrap();
        assert!(matches!(
            store.create_with_id("dup", SessionFormat::Chat),
            Err(StoreError::SessionExists { .. })
        ));
    }

    #[test]
    fn test_load_replays_tail_after_snapshot() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp).with_snapshot_interval(0);

        let mut recorder = store.create_with_id("tail", SessionFormat::Chat).unwrap();
        for entry in SessionFormat::Chat.text_entries(MessageRole::User, "hello") {
            recorder.append_entry(None, &entry).unwrap();
        }
        recorder.set_notes(Some("note".into())).unwrap();

        // Snapshot still reflects only the creation event
        let stale = store.read_snapshot("tail").unwrap().unwrap();
        assert_eq!(stale.last_sequence, 1);

        let loaded = store.load("tail").unwrap();
        assert_eq!(&loaded, recorder.session());
        assert_eq!(loaded.notes.as_deref(), Some("note"));
    }

    #[test]
    fn test_replay_matches_snapshot_bytes() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);

        let mut recorder = store.create_with_id("eq", SessionFormat::ItemBased).unwrap();
        recorder
            .record(TraceKind::RunStarted, Some("r1"), json!({}))
            .unwrap();
        for entry in SessionFormat::ItemBased.text_entries(MessageRole::User, "q") {
            recorder.append_entry(Some("r1"), &entry).unwrap();
        }
        recorder.set_meta("k", json!([1, 2])).unwrap();
        recorder.set_rating(Some(3)).unwrap();
        recorder
            .record(
                TraceKind::RunFinished,
                Some("r1"),
                json!({"status": RunStatus::Replied, "passes": 1}),
            )
            .unwrap();
        recorder.flush_snapshot().unwrap();

        let snapshot_bytes =
            std::fs::read(store.session_dir("eq").unwrap().join("snapshot.json")).unwrap();
        let replayed = store.replay("eq").unwrap();
        assert_eq!(SessionStore::persisted_form(&replayed).unwrap(), snapshot_bytes);
    }

    #[test]
    fn test_open_continues_sequence() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        {
            let mut recorder = store.create_with_id("resume", SessionFormat::Chat).unwrap();
            recorder.set_rating(Some(1)).unwrap();
        }

        let mut reopened = store.open("resume").unwrap();
        assert_eq!(reopened.session().last_sequence, 2);
        let event = reopened.set_rating(Some(2)).unwrap();
        assert_eq!(event.sequence, 3);
        assert_eq!(store.replay("resume").unwrap().rating, Some(2));
    }

    #[test]
    fn test_load_rejects_snapshot_ahead_of_log() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        {
            let mut recorder = store.create_with_id("torn", SessionFormat::Chat).unwrap();
            recorder.set_notes(Some("kept".into())).unwrap();
            recorder.set_rating(Some(5)).unwrap();
            recorder.flush_snapshot().unwrap();
        }

        // drop the last logged event so the snapshot outruns the log
        let log_path = store.session_dir("torn").unwrap().join("events.jsonl");
        let content = std::fs::read_to_string(&log_path).unwrap();
        let kept: Vec<&str> = content.lines().filter(|l| !l.trim().is_empty()).take(2).collect();
        std::fs::write(&log_path, format!("{}\n", kept.join("\n"))).unwrap();

        assert!(matches!(store.load("torn"), Err(StoreError::CorruptedData { .. })));
        assert!(store.replay("torn").is_ok());
    }

    #[test]
    fn test_empty_log_is_not_a_session() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        let dir = store.session_dir("blank").unwrap();
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("events.jsonl"), "\n").unwrap();

        assert!(!store.exists("blank"));
        assert!(store.list_sessions().unwrap().is_empty());
        assert!(store.create_with_id("blank", SessionFormat::Chat).is_ok());
    }

    #[test]
    fn test_list_and_missing() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        assert!(store.list_sessions().unwrap().is_empty());

        store.create_with_id("b", SessionFormat::Chat).unwrap();
        store.create_with_id("a", SessionFormat::Chat).unwrap();
        assert_eq!(store.list_sessions().unwrap(), vec!["a", "b"]);

        assert!(matches!(
            store.load("missing"),
            Err(StoreError::SessionNotFound { .. })
        ));
        assert!(!store.exists("missing"));
    }
}
