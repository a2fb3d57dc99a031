//! Deckrun - a runtime for declarative LLM workflows
//!
//! A deck declares a prompt, the actions a model may call, side-channel
//! handlers (`onError`, `onBusy`, `onIdle`) and a pass guardrail. Deckrun
//! drives the model through that deck, runs actions either in-process or in a
//! WASI sandbox with default-deny permissions, and records every step to an
//! append-only event log that replays into the session snapshot.
//!
//! The crate is split into feature-gated modules:
//!
//! - **`config`** - TOML configuration and environment overrides
//! - **`observability`** - the markdown run journal
//! - **`session`** - event log, snapshots and replay
//! - **`provider`** - the model provider trait and wire types
//! - **`sandbox`** - the wasmtime sandbox bridge
//! - **`orchestration`** - decks, dispatch, handler timers and the turn loop
//!
//! ```toml
//! [dependencies]
//! deckrun = { version = "0.1", default-features = false, features = ["session"] }
//! ```
//!
//! # Example
//!
//! ```ignore
//! use deckrun::prelude::*;
//! use std::sync::Arc;
//!
//! async fn run(provider: &dyn ModelProvider) -> anyhow::Result<()> {
//!     let loader = ConfigurationLoader::new(None)?;
//!     let config = &loader.config;
//!     let project = std::env::current_dir()?;
//!
//!     let descriptor = DeckDescriptor::from_file(&project.join("main.deck.json"))?;
//!     let deck = ResolvedDeck::resolve(descriptor, &ComputeRegistry::new(), &config.resolve_options(&project))?;
//!     let recorder = config.open_store(&project)?.create(config.session_format()?)?;
//!     let sandbox = Arc::new(WasmSandbox::new(config.sandbox_config(&project))?);
//!
//!     let mut orchestrator = Orchestrator::new(
//!         Arc::new(deck),
//!         recorder,
//!         sandbox,
//!         OrchestratorConfig::from_configuration(config),
//!     );
//!     let outcome = orchestrator.advance(provider, "summarise the repo").await?;
//!     println!("{:?}", outcome);
//!     Ok(())
//! }
//! ```

/// Configuration management (enabled with the `config` feature)
#[cfg(feature = "config")]
pub mod config;

/// Run journal (enabled with the `observability` feature)
#[cfg(feature = "observability")]
pub mod observability;

/// Event log, snapshots and replay (enabled with the `session` feature)
#[cfg(feature = "session")]
pub mod session;

/// Model provider abstraction (enabled with the `provider` feature)
#[cfg(feature = "provider")]
pub mod provider;

/// Sandbox bridge (enabled with the `sandbox` feature)
#[cfg(feature = "sandbox")]
pub mod sandbox;

/// Deck descriptors and action resolution
#[cfg(feature = "orchestration")]
pub mod deck;

/// Busy and idle handler timers
#[cfg(feature = "orchestration")]
pub mod scheduler;

/// Action dispatch
#[cfg(feature = "orchestration")]
pub mod dispatch;

/// Turn orchestration (enabled with the `orchestration` feature)
#[cfg(feature = "orchestration")]
pub mod orchestration;

/// Scripted providers and sandboxes for tests
#[cfg(feature = "orchestration")]
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    #[cfg(feature = "config")]
    pub use crate::config::{Configuration, ConfigurationLoader, EnvironmentLoader};

    #[cfg(feature = "observability")]
    pub use crate::observability::Logger;

    #[cfg(feature = "session")]
    pub use crate::session::{
        Entry, MessageRole, RunStatus, Session, SessionFormat, SessionRecorder, SessionStore,
        StoreError, StoreResult, TraceEvent, TraceKind,
    };

    #[cfg(feature = "provider")]
    pub use crate::provider::{
        ModelProvider, ModelRequest, ModelResponse, StreamChunk, ToolCallRequest, ToolDefinition,
    };

    #[cfg(feature = "sandbox")]
    pub use crate::sandbox::{PermissionSet, SandboxBridge, SandboxError, WasmSandbox, WasmSandboxConfig};

    #[cfg(feature = "orchestration")]
    pub use crate::deck::{ComputeRegistry, DeckDescriptor, ResolveOptions, ResolvedDeck};

    #[cfg(feature = "orchestration")]
    pub use crate::dispatch::{ActionDispatcher, ActionError, DispatchOutcome};

    #[cfg(feature = "orchestration")]
    pub use crate::orchestration::{
        AbortHandle, LiveHub, Orchestrator, OrchestratorConfig, TurnOutcome,
    };
}
