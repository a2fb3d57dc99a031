//! In-process compute functions and resolved action targets.

use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::error::{DeckError, DeckResult};
use crate::sandbox::{PermissionSet, SandboxEntry};

/// Prefix of refs that name an in-process compute function.
pub const BUILTIN_PREFIX: &str = "builtin:";

/// Synchronous in-process compute function.
pub type ComputeFn = Arc<dyn Fn(&Value) -> anyhow::Result<Value> + Send + Sync>;

/// Where a resolved action runs.
///
/// Resolution happens once, at deck load; dispatch only matches on this.
#[derive(Clone)]
pub enum ActionTarget {
	/// Called directly on the orchestrator task.
	InProcess {
		/// Builtin name the ref pointed at.
		builtin: String,
		/// The function.
		function: ComputeFn,
	},
	/// Run as a sandboxed child.
	Sandboxed {
		/// Module to run.
		entry: SandboxEntry,
		/// Validated grants.
		permissions: PermissionSet,
	},
}

impl ActionTarget {
	/// True for sandboxed children.
	pub fn is_sandboxed(&self) -> bool {
		matches!(self, ActionTarget::Sandboxed { .. })
	}
}

impl fmt::Debug for ActionTarget {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			ActionTarget::InProcess { builtin, .. } => {
				f.debug_struct("InProcess").field("builtin", builtin).finish()
			}
			ActionTarget::Sandboxed { entry, permissions } => f
				.debug_struct("Sandboxed")
				.field("entry", entry)
				.field("permissions", permissions)
				.finish(),
		}
	}
}

impl fmt::Display for ActionTarget {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			ActionTarget::InProcess { builtin, .. } => write!(f, "{}{}", BUILTIN_PREFIX, builtin),
			ActionTarget::Sandboxed { entry, .. } => write!(f, "{}", entry),
		}
	}
}

/// Named in-process compute functions available to decks.
///
/// # Example
///
/// ```
/// use deckrun::deck::ComputeRegistry;
/// use serde_json::json;
///
/// let mut registry = ComputeRegistry::new();
/// registry.register("add", |args| {
///     let a = args["a"].as_i64().unwrap_or(0);
///     let b = args["b"].as_i64().unwrap_or(0);
///     Ok(json!({ "sum": a + b }))
/// }).unwrap();
///
/// let add = registry.get("add").unwrap();
/// assert_eq!(add(&json!({"a": 2, "b": 3})).unwrap(), json!({"sum": 5}));
/// assert!(registry.register("add", |_| Ok(json!(null))).is_err());
/// ```
#[derive(Default, Clone)]
pub struct ComputeRegistry {
	functions: HashMap<String, ComputeFn>,
}

impl ComputeRegistry {
	/// Create a new empty registry.
	pub fn new() -> Self {
		Self::default()
	}

	/// Register a function; fails if the name is taken.
	pub fn register<F>(&mut self, name: impl Into<String>, function: F) -> DeckResult<()>
	where
		F: Fn(&Value) -> anyhow::Result<Value> + Send + Sync + 'static,
	{
		let name = name.into();
		if self.functions.contains_key(&name) {
			return Err(DeckError::duplicate_compute(name));
		}
		self.functions.insert(name, Arc::new(function));
		Ok(())
	}

	/// Register a function, replacing any existing one with the same name.
	pub fn register_or_replace<F>(&mut self, name: impl Into<String>, function: F) -> Option<ComputeFn>
	where
		F: Fn(&Value) -> anyhow::Result<Value> + Send + Sync + 'static,
	{
		self.functions.insert(name.into(), Arc::new(function))
	}

	/// Get a function by name.
	pub fn get(&self, name: &str) -> Option<ComputeFn> {
		self.functions.get(name).cloned()
	}

	/// Check if a function exists.
	pub fn contains(&self, name: &str) -> bool {
		self.functions.contains_key(name)
	}

	/// Registered names, sorted.
	pub fn names(&self) -> Vec<&str> {
		let mut names: Vec<&str> = self.functions.keys().map(String::as_str).collect();
		names.sort_unstable();
		names
	}

	/// Number of registered functions.
	pub fn len(&self) -> usize {
		self.functions.len()
	}

	/// Check if the registry is empty.
	pub fn is_empty(&self) -> bool {
		self.functions.is_empty()
	}
}

impl fmt::Debug for ComputeRegistry {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("ComputeRegistry")
			.field("functions", &self.names())
			.finish()
	}
}
