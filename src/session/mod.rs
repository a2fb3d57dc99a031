//! Session persistence
//!
//! Sessions are stored as an append-only trace log plus a periodically
//! rewritten snapshot:
//!
//! - [`EventsLog`] writes `events.jsonl`, the source of truth
//! - [`Session::apply`] folds events into the snapshot model
//! - [`SessionStore`] owns the on-disk layout and rebuilds sessions
//! - [`SessionRecorder`] is the single writer for a live session
//!
//! ## Usage
//!
//! ```rust,no_run
//! use deckrun::session::{SessionFormat, SessionStore, StoreResult};
//! use std::path::Path;
//!
//! fn example() -> StoreResult<()> {
//!     let store = SessionStore::new(SessionStore::default_home()?, Path::new("."))?;
//!     let mut recorder = store.create(SessionFormat::Chat)?;
//!     recorder.set_notes(Some("first try".to_string()))?;
//!     let rebuilt = store.replay(recorder.session_id())?;
//!     assert_eq!(&rebuilt, recorder.session());
//!     Ok(())
//! }
//! ```

pub mod atomic;
pub mod errors;
pub mod events_log;
pub mod model;
pub mod recorder;
pub mod store;

pub use atomic::{AtomicFileWriter, AtomicOps};
pub use errors::{StoreError, StoreResult};
pub use events_log::EventsLog;
pub use model::{
    Entry, Item, Message, MessageRole, RunStatus, RunSummary, Session, SessionFormat,
    ToolCallRecord, TraceEvent, TraceKind,
};
pub use recorder::SessionRecorder;
pub use store::{project_hash, SessionStore, DEFAULT_SNAPSHOT_INTERVAL};
