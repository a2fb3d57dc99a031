//! Session data model
//!
//! A [`Session`] is never edited in place. Every change is expressed as a
//! [`TraceEvent`] and folded in through [`Session::apply`], so the event log
//! alone is enough to rebuild the exact snapshot.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use super::{StoreError, StoreResult};

/// Shape of the conversation entries stored in a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum SessionFormat {
    /// Role-tagged messages, tool calls attached to the assistant message
    #[default]
    Chat,
    /// Flat items: text, tool call request, tool call result
    ItemBased,
}

impl SessionFormat {
    /// Parse the configuration spelling (`chat`, `item-based`)
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "chat" => Some(Self::Chat),
            "item-based" | "item_based" | "items" => Some(Self::ItemBased),
            _ => None,
        }
    }

    /// Entries for a system or user text
    pub fn text_entries(&self, role: MessageRole, text: impl Into<String>) -> Vec<Entry> {
        let text = text.into();
        match self {
            Self::Chat => vec![Entry::Message(Message::new(role, text))],
            Self::ItemBased => vec![Entry::Item(Item::Text { role, text })],
        }
    }

    /// Entries for an assistant response with optional tool calls
    pub fn assistant_entries(&self, text: Option<&str>, calls: &[ToolCallRecord]) -> Vec<Entry> {
        match self {
            Self::Chat => {
                let mut message = Message::new(MessageRole::Assistant, text.unwrap_or_default());
                message.tool_calls = calls.to_vec();
                vec![Entry::Message(message)]
            }
            Self::ItemBased => {
                let mut entries = Vec::with_capacity(calls.len() + 1);
                if let Some(text) = text.filter(|t| !t.is_empty()) {
                    entries.push(Entry::Item(Item::Text {
                        role: MessageRole::Assistant,
                        text: text.to_string(),
                    }));
                }
                entries.extend(calls.iter().map(|call| {
                    Entry::Item(Item::ToolCall {
                        call_id: call.id.clone(),
                        name: call.name.clone(),
                        arguments: call.arguments.clone(),
                    })
                }));
                entries
            }
        }
    }

    /// Entry carrying the result of one tool call
    pub fn tool_result_entry(
        &self,
        call_id: &str,
        name: &str,
        output: &Value,
        is_error: bool,
    ) -> Entry {
        match self {
            Self::Chat => {
                let content = match output {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                Entry::Message(Message {
                    role: MessageRole::Tool,
                    content,
                    name: Some(name.to_string()),
                    tool_call_id: Some(call_id.to_string()),
                    tool_calls: Vec::new(),
                })
            }
            Self::ItemBased => Entry::Item(Item::ToolResult {
                call_id: call_id.to_string(),
                name: name.to_string(),
                output: output.clone(),
                is_error,
            }),
        }
    }
}

impl std::fmt::Display for SessionFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Chat => write!(f, "chat"),
            Self::ItemBased => write!(f, "item-based"),
        }
    }
}

/// Message roles. `Status` marks the side lane used by busy/idle handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
    Status,
}

/// Tool call as stored in the session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub id: String,
    pub name: String,
    /// Raw JSON argument text as produced by the model
    pub arguments: String,
}

/// Chat-format message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRecord>,
}

impl Message {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            name: None,
            tool_call_id: None,
            tool_calls: Vec::new(),
        }
    }
}

/// Item-based entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Item {
    Text {
        role: MessageRole,
        text: String,
    },
    ToolCall {
        call_id: String,
        name: String,
        arguments: String,
    },
    ToolResult {
        call_id: String,
        name: String,
        output: Value,
        #[serde(default)]
        is_error: bool,
    },
}

/// One ordered entry of a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Entry {
    Message(Message),
    Item(Item),
}

impl Entry {
    /// True for status-lane entries, which the model never sees
    pub fn is_status(&self) -> bool {
        matches!(
            self,
            Entry::Message(Message {
                role: MessageRole::Status,
                ..
            }) | Entry::Item(Item::Text {
                role: MessageRole::Status,
                ..
            })
        )
    }

    /// True for entries produced by the model
    pub fn is_assistant(&self) -> bool {
        matches!(
            self,
            Entry::Message(Message {
                role: MessageRole::Assistant,
                ..
            }) | Entry::Item(Item::Text {
                role: MessageRole::Assistant,
                ..
            }) | Entry::Item(Item::ToolCall { .. })
        )
    }

    pub fn role(&self) -> MessageRole {
        match self {
            Entry::Message(m) => m.role,
            Entry::Item(Item::Text { role, .. }) => *role,
            Entry::Item(Item::ToolCall { .. }) => MessageRole::Assistant,
            Entry::Item(Item::ToolResult { .. }) => MessageRole::Tool,
        }
    }

    /// Plain text carried by the entry, if any
    pub fn text(&self) -> Option<&str> {
        match self {
            Entry::Message(m) => Some(m.content.as_str()),
            Entry::Item(Item::Text { text, .. }) => Some(text.as_str()),
            Entry::Item(_) => None,
        }
    }
}

/// Final state of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Responded,
    Ended,
    Replied,
    GuardrailTripped,
    Fatal,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

/// Summary of the most recent run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub status: RunStatus,
    pub passes: u32,
}

/// Kinds of trace events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceKind {
    SessionCreated,
    RunStarted,
    EntryAppended,
    ModelCall,
    ModelResult,
    StreamDelta,
    ToolDispatch,
    ToolResult,
    SandboxLog,
    HandlerFired,
    GuardrailTripped,
    Error,
    ExecutionCancelled,
    MetaSet,
    NotesSet,
    RatingSet,
    RunFinished,
}

impl TraceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SessionCreated => "session_created",
            Self::RunStarted => "run_started",
            Self::EntryAppended => "entry_appended",
            Self::ModelCall => "model_call",
            Self::ModelResult => "model_result",
            Self::StreamDelta => "stream_delta",
            Self::ToolDispatch => "tool_dispatch",
            Self::ToolResult => "tool_result",
            Self::SandboxLog => "sandbox_log",
            Self::HandlerFired => "handler_fired",
            Self::GuardrailTripped => "guardrail_tripped",
            Self::Error => "error",
            Self::ExecutionCancelled => "execution_cancelled",
            Self::MetaSet => "meta_set",
            Self::NotesSet => "notes_set",
            Self::RatingSet => "rating_set",
            Self::RunFinished => "run_finished",
        }
    }
}

impl std::fmt::Display for TraceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable trace record, one line of `events.jsonl`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEvent {
    pub event_id: String,
    pub session_id: String,
    /// 1-based, gap free per session
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    pub kind: TraceKind,
    pub payload: Value,
}

impl TraceEvent {
    pub fn new(
        session_id: impl Into<String>,
        sequence: u64,
        run_id: Option<String>,
        kind: TraceKind,
        payload: Value,
    ) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            sequence,
            timestamp: Utc::now(),
            run_id,
            kind,
            payload,
        }
    }

    /// Serialize to a JSON line (no newline)
    pub fn to_json_line(&self) -> StoreResult<String> {
        serde_json::to_string(self)
            .map_err(|e| StoreError::storage(format!("Failed to serialize event: {}", e)))
    }
}

/// Session snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub format: SessionFormat,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub entries: Vec<Entry>,
    pub metadata: BTreeMap<String, Value>,
    pub notes: Option<String>,
    pub rating: Option<i32>,
    pub run_count: u32,
    pub last_run: Option<RunSummary>,
    pub last_sequence: u64,
}

impl Session {
    /// The state before any event has been applied
    pub fn empty(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            format: SessionFormat::default(),
            created_at: None,
            updated_at: None,
            entries: Vec::new(),
            metadata: BTreeMap::new(),
            notes: None,
            rating: None,
            run_count: 0,
            last_run: None,
            last_sequence: 0,
        }
    }

    /// Fold one event into the snapshot.
    ///
    /// Events must arrive in sequence order with no gaps; anything else is
    /// rejected without touching the session.
    pub fn apply(&mut self, event: &TraceEvent) -> StoreResult<()> {
        if event.session_id != self.id {
            return Err(StoreError::SessionMismatch {
                expected: self.id.clone(),
                found: event.session_id.clone(),
            });
        }
        let expected = self.last_sequence + 1;
        if event.sequence != expected {
            return Err(StoreError::OutOfOrder {
                session_id: self.id.clone(),
                expected,
                found: event.sequence,
            });
        }

        match event.kind {
            TraceKind::SessionCreated => {
                if let Some(format) = event.payload.get("format") {
                    self.format = serde_json::from_value(format.clone())?;
                }
                self.created_at = Some(event.timestamp);
            }
            TraceKind::RunStarted => {
                self.run_count += 1;
                self.last_run = Some(RunSummary {
                    run_id: event.run_id.clone().unwrap_or_default(),
                    status: RunStatus::Running,
                    passes: 0,
                });
            }
            TraceKind::EntryAppended => {
                let entry: Entry = serde_json::from_value(event.payload.clone())?;
                self.entries.push(entry);
            }
            TraceKind::ModelCall => {
                let pass = payload_u32(&event.payload, "pass");
                if let Some(run) = self.current_run_mut(event) {
                    run.passes = run.passes.max(pass);
                }
            }
            TraceKind::RunFinished => {
                let status: RunStatus = match event.payload.get("status") {
                    Some(status) => serde_json::from_value(status.clone())?,
                    None => return Err(StoreError::corrupted("run_finished without status")),
                };
                let passes = payload_u32(&event.payload, "passes");
                if let Some(run) = self.current_run_mut(event) {
                    run.status = status;
                    run.passes = run.passes.max(passes);
                }
            }
            TraceKind::MetaSet => {
                let key = event
                    .payload
                    .get("key")
                    .and_then(Value::as_str)
                    .ok_or_else(|| StoreError::corrupted("meta_set without key"))?;
                match event.payload.get("value") {
                    None | Some(Value::Null) => {
                        self.metadata.remove(key);
                    }
                    Some(value) => {
                        self.metadata.insert(key.to_string(), value.clone());
                    }
                }
            }
            TraceKind::NotesSet => {
                self.notes = event
                    .payload
                    .get("notes")
                    .and_then(Value::as_str)
                    .map(str::to_string);
            }
            TraceKind::RatingSet => {
                self.rating = event
                    .payload
                    .get("rating")
                    .and_then(Value::as_i64)
                    .map(|r| r as i32);
            }
            // Audit-only kinds
            TraceKind::ModelResult
            | TraceKind::StreamDelta
            | TraceKind::ToolDispatch
            | TraceKind::ToolResult
            | TraceKind::SandboxLog
            | TraceKind::HandlerFired
            | TraceKind::GuardrailTripped
            | TraceKind::Error
            | TraceKind::ExecutionCancelled => {}
        }

        self.updated_at = Some(event.timestamp);
        self.last_sequence = event.sequence;
        Ok(())
    }

    /// Entries visible to the model (status lane excluded)
    pub fn history(&self) -> Vec<Entry> {
        self.entries
            .iter()
            .filter(|e| !e.is_status())
            .cloned()
            .collect()
    }

    /// Starting entry index of each pass
    pub fn turns(&self) -> Vec<usize> {
        let mut starts = Vec::new();
        let mut previous_assistant = false;
        for (index, entry) in self.entries.iter().enumerate() {
            if entry.is_status() {
                continue;
            }
            let assistant = entry.is_assistant();
            if assistant && !previous_assistant {
                starts.push(index);
            }
            previous_assistant = assistant;
        }
        starts
    }

    /// Status-lane entries in order
    pub fn status_entries(&self) -> impl Iterator<Item = &Entry> {
        self.entries.iter().filter(|e| e.is_status())
    }

    fn current_run_mut(&mut self, event: &TraceEvent) -> Option<&mut RunSummary> {
        let run_id = event.run_id.as_deref()?;
        self.last_run.as_mut().filter(|run| run.run_id == run_id)
    }
}

fn payload_u32(payload: &Value, key: &str) -> u32 {
    payload.get(key).and_then(Value::as_u64).unwrap_or(0) as u32
}
