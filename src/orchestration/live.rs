//! Live protocol between a running deck and a front-end.
//!
//! Every message carries the `runId` of the run it concerns. A client opens
//! with `hello`, receives `ready` with the deck's declared schema, then sends
//! `input` and `abort` commands while trace events stream back.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::warn;

use super::runtime::AbortHandle;
use crate::deck::DeckSchema;
use crate::session::{TraceEvent, TraceKind};

const LIVE_CAPACITY: usize = 1024;

/// Server to client message
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveMessage {
    pub run_id: String,
    #[serde(flatten)]
    pub body: LiveBody,
}

/// Payload of a [`LiveMessage`]
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LiveBody {
    /// Handshake answer
    Ready {
        #[serde(rename = "sessionId")]
        session_id: String,
        schema: DeckSchema,
    },
    /// One recorded trace event
    Trace { event: TraceEvent },
    /// Final outcome of a run
    Outcome { outcome: Value },
    /// Infrastructure failure outside the trace
    Error { message: String },
}

/// Client to server command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientCommand {
    Hello {
        #[serde(rename = "runId")]
        run_id: String,
    },
    Input {
        #[serde(rename = "runId")]
        run_id: String,
        text: String,
    },
    Abort {
        #[serde(rename = "runId")]
        run_id: String,
    },
}

impl ClientCommand {
    pub fn parse(line: &str) -> serde_json::Result<Self> {
        serde_json::from_str(line)
    }

    pub fn run_id(&self) -> &str {
        match self {
            ClientCommand::Hello { run_id }
            | ClientCommand::Input { run_id, .. }
            | ClientCommand::Abort { run_id } => run_id,
        }
    }
}

/// What the caller should do after [`LiveHub::route`]
#[derive(Debug, Clone, PartialEq)]
pub enum Routed {
    /// `ready` was published
    Handshake,
    /// Start a run with this input
    Input { run_id: String, text: String },
    /// The run in progress was aborted
    Aborted,
}

/// Fan-out point for live messages
#[derive(Clone)]
pub struct LiveHub {
    tx: broadcast::Sender<LiveMessage>,
    schema: Arc<DeckSchema>,
    session_id: String,
}

impl LiveHub {
    pub fn new(schema: DeckSchema, session_id: impl Into<String>) -> Self {
        let (tx, _) = broadcast::channel(LIVE_CAPACITY);
        Self {
            tx,
            schema: Arc::new(schema),
            session_id: session_id.into(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LiveMessage> {
        self.tx.subscribe()
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Publish to every subscriber; returns how many received it
    pub fn publish(&self, run_id: impl Into<String>, body: LiveBody) -> usize {
        self.tx
            .send(LiveMessage {
                run_id: run_id.into(),
                body,
            })
            .unwrap_or(0)
    }

    pub fn ready(&self, run_id: impl Into<String>) -> usize {
        self.publish(
            run_id,
            LiveBody::Ready {
                session_id: self.session_id.clone(),
                schema: (*self.schema).clone(),
            },
        )
    }

    pub fn error(&self, run_id: impl Into<String>, message: impl Into<String>) -> usize {
        self.publish(
            run_id,
            LiveBody::Error {
                message: message.into(),
            },
        )
    }

    /// Publish a trace event. A `run_finished` event is followed by the
    /// run's outcome.
    pub fn publish_trace(&self, event: TraceEvent) {
        let run_id = event.run_id.clone().unwrap_or_default();
        let outcome = if event.kind == TraceKind::RunFinished {
            event.payload.get("outcome").cloned()
        } else {
            None
        };
        self.publish(run_id.clone(), LiveBody::Trace { event });
        if let Some(outcome) = outcome {
            self.publish(run_id, LiveBody::Outcome { outcome });
        }
    }

    /// Forward recorder events until the recorder goes away
    pub fn forward(&self, mut events: broadcast::Receiver<TraceEvent>) -> JoinHandle<()> {
        let hub = self.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => hub.publish_trace(event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(target: "deckrun::orchestration", skipped, "live forwarder lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Handle one client command
    pub fn route(&self, command: ClientCommand, abort: &AbortHandle) -> Routed {
        match command {
            ClientCommand::Hello { run_id } => {
                self.ready(run_id);
                Routed::Handshake
            }
            ClientCommand::Input { run_id, text } => Routed::Input { run_id, text },
            ClientCommand::Abort { .. } => {
                abort.abort();
                Routed::Aborted
            }
        }
    }
}

impl std::fmt::Debug for LiveHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveHub")
            .field("session_id", &self.session_id)
            .field("subscribers", &self.tx.receiver_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> DeckSchema {
        DeckSchema {
            source: "deck.json".into(),
            prompt: "p".into(),
            context_schema_ref: None,
            response_schema_ref: None,
            actions: Vec::new(),
            max_passes: 5,
            respond: true,
            end: false,
        }
    }

    #[test]
    fn test_commands_parse() {
        let cmd = ClientCommand::parse(r#"{"type":"input","runId":"r1","text":"hi"}"#).unwrap();
        assert_eq!(
            cmd,
            ClientCommand::Input {
                run_id: "r1".into(),
                text: "hi".into()
            }
        );
        assert_eq!(cmd.run_id(), "r1");
        assert!(ClientCommand::parse(r#"{"type":"dance","runId":"r1"}"#).is_err());
    }

    #[test]
    fn test_hello_publishes_ready_with_run_id() {
        let hub = LiveHub::new(schema(), "s1");
        let mut rx = hub.subscribe();
        let routed = hub.route(
            ClientCommand::Hello { run_id: "r9".into() },
            &AbortHandle::default(),
        );
        assert_eq!(routed, Routed::Handshake);

        let message = rx.try_recv().unwrap();
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["runId"], "r9");
        assert_eq!(value["type"], "ready");
        assert_eq!(value["sessionId"], "s1");
        assert_eq!(value["schema"]["maxPasses"], 5);
    }

    #[test]
    fn test_abort_cancels_current_run() {
        let hub = LiveHub::new(schema(), "s1");
        let abort = AbortHandle::default();
        let token = abort.begin();
        assert_eq!(
            hub.route(ClientCommand::Abort { run_id: "r1".into() }, &abort),
            Routed::Aborted
        );
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_run_finished_is_followed_by_outcome() {
        let hub = LiveHub::new(schema(), "s1");
        let mut rx = hub.subscribe();
        let event = TraceEvent::new(
            "s1",
            4,
            Some("r1".to_string()),
            TraceKind::RunFinished,
            json!({"status": "replied", "passes": 1, "outcome": {"status": "replied", "text": "ok"}}),
        );
        hub.publish_trace(event);

        let first = serde_json::to_value(rx.try_recv().unwrap()).unwrap();
        assert_eq!(first["type"], "trace");
        assert_eq!(first["runId"], "r1");
        let second = serde_json::to_value(rx.try_recv().unwrap()).unwrap();
        assert_eq!(second["type"], "outcome");
        assert_eq!(second["outcome"]["text"], "ok");
    }
}
