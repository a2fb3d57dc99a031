//! Deck descriptors and action resolution
//!
//! A deck is the declarative input of a run: prompt, schema refs, actions,
//! handler bindings, guardrails and synthetic tool flags. At load time every
//! action and handler ref is resolved into an [`ActionTarget`]: either an
//! in-process [`ComputeFn`] from a [`ComputeRegistry`] or a sandboxed child
//! module with a validated permission set.

pub mod action;
pub mod descriptor;
pub mod error;
pub mod resolve;

pub use action::{ActionTarget, ComputeFn, ComputeRegistry, BUILTIN_PREFIX};
pub use descriptor::{
	ActionDescriptor, DeckDescriptor, GuardrailDescriptor, HandlerDescriptor, HandlerDescriptors,
	SyntheticTools,
};
pub use error::{DeckError, DeckResult};
pub use resolve::{
	ActionSchema, DeckSchema, HandlerBinding, ResolveOptions, ResolvedAction, ResolvedDeck,
	END_TOOL, RESPOND_TOOL,
};
