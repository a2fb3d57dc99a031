//! Turn orchestration - the run loop tying decks, models and sandboxes together
//!
//! A run starts from user input and alternates model calls with tool dispatch
//! until one of these happens:
//! - the model answers without tool calls (`replied`)
//! - a synthetic `respond` or `end` tool is called
//! - the pass guardrail trips
//! - an unrecovered error ends the run (`fatal`)
//! - the run is aborted (`cancelled`)
//!
//! Every step is recorded through the session recorder, so the event log alone
//! reproduces the session. A [`LiveHub`] can mirror those events to a
//! front-end over the live protocol.

pub mod guardrail;
pub mod live;
pub mod outcome;
pub mod runtime;

pub use guardrail::{GuardrailCheck, GuardrailCounter};
pub use live::{ClientCommand, LiveBody, LiveHub, LiveMessage, Routed};
pub use outcome::TurnOutcome;
pub use runtime::{AbortHandle, Orchestrator, OrchestratorConfig};
