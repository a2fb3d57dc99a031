//! Error types for deck loading and resolution.

use std::path::PathBuf;
use thiserror::Error;

use crate::sandbox::SandboxError;

/// Result type for deck operations.
pub type DeckResult<T> = Result<T, DeckError>;

/// Errors that can occur while loading or resolving a deck.
///
/// # Example
///
/// ```
/// use deckrun::deck::DeckError;
///
/// let error = DeckError::unknown_builtin("fetch", "web_fetch");
/// assert!(error.to_string().contains("web_fetch"));
/// ```
#[derive(Debug, Error)]
pub enum DeckError {
	/// The descriptor file could not be read.
	#[error("failed to read deck {path}: {source}")]
	Read {
		/// Path of the descriptor.
		path: PathBuf,
		/// Underlying IO error.
		#[source]
		source: std::io::Error,
	},

	/// The descriptor could not be parsed.
	#[error("invalid deck descriptor: {message}")]
	Parse {
		/// Description of the parse failure.
		message: String,
	},

	/// Two actions share a name.
	#[error("duplicate action name: {name}")]
	DuplicateAction {
		/// The repeated name.
		name: String,
	},

	/// An action or handler has an empty name or ref.
	#[error("empty {field} in deck descriptor")]
	Empty {
		/// Which field was empty.
		field: &'static str,
	},

	/// An action name shadows an enabled synthetic tool.
	#[error("action '{name}' collides with the synthetic '{name}' tool")]
	SyntheticCollision {
		/// The colliding name.
		name: String,
	},

	/// A `builtin:` ref names no registered compute function.
	#[error("action '{action}' refers to unknown builtin '{builtin}'")]
	UnknownBuiltin {
		/// Action or handler that referenced it.
		action: String,
		/// Builtin name that was not found.
		builtin: String,
	},

	/// A compute function with the same name is already registered.
	#[error("compute function already registered: {name}")]
	DuplicateCompute {
		/// Name of the duplicate function.
		name: String,
	},

	/// Guardrail settings are invalid.
	#[error("invalid guardrail: {message}")]
	Guardrail {
		/// Description of the problem.
		message: String,
	},

	/// A permission grant failed validation.
	#[error("invalid permissions for '{action}': {source}")]
	Permission {
		/// Action or handler whose grant failed.
		action: String,
		/// Underlying sandbox error.
		#[source]
		source: SandboxError,
	},
}

impl DeckError {
	/// Create a Parse error.
	pub fn parse(message: impl Into<String>) -> Self {
		Self::Parse {
			message: message.into(),
		}
	}

	/// Create an UnknownBuiltin error.
	pub fn unknown_builtin(action: impl Into<String>, builtin: impl Into<String>) -> Self {
		Self::UnknownBuiltin {
			action: action.into(),
			builtin: builtin.into(),
		}
	}

	/// Create a DuplicateCompute error.
	pub fn duplicate_compute(name: impl Into<String>) -> Self {
		Self::DuplicateCompute { name: name.into() }
	}
}
