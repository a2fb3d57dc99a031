//! Deck descriptor: the declarative input of a run.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};

use super::error::{DeckError, DeckResult};
use crate::sandbox::PermissionSet;

/// A resolved deck as handed over by the deck resolver.
///
/// Field names follow the camelCase JSON form.
///
/// # Example
///
/// ```
/// use deckrun::deck::DeckDescriptor;
///
/// let deck = DeckDescriptor::from_json_str(r#"{
///     "prompt": "You are a careful assistant.",
///     "actions": [
///         { "name": "add", "ref": "builtin:add", "description": "Add two numbers" }
///     ],
///     "guardrails": { "maxPasses": 5 },
///     "syntheticTools": { "respond": true }
/// }"#).unwrap();
///
/// assert_eq!(deck.actions[0].target, "builtin:add");
/// assert_eq!(deck.guardrails.max_passes, Some(5));
/// assert!(deck.synthetic_tools.respond);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeckDescriptor {
	/// Source path of the deck. Relative action refs resolve against its directory.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub path: Option<PathBuf>,

	/// System prompt.
	pub prompt: String,

	/// Schema reference for the input context.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub context_schema_ref: Option<String>,

	/// Schema reference for the final response.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub response_schema_ref: Option<String>,

	/// Callable child decks and builtins.
	#[serde(default)]
	pub actions: Vec<ActionDescriptor>,

	/// Side-channel handlers.
	#[serde(default)]
	pub handlers: HandlerDescriptors,

	/// Limits.
	#[serde(default)]
	pub guardrails: GuardrailDescriptor,

	/// Which synthetic tools the model may call.
	#[serde(default)]
	pub synthetic_tools: SyntheticTools,
}

/// One named action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionDescriptor {
	/// Tool name shown to the model.
	pub name: String,

	/// `builtin:<name>` or a module path relative to the deck.
	#[serde(rename = "ref")]
	pub target: String,

	/// Description shown to the model.
	#[serde(default)]
	pub description: String,

	/// JSON Schema of the arguments.
	#[serde(default = "empty_object_schema")]
	pub parameters: Value,

	/// Grants for sandboxed children; ignored for builtins.
	#[serde(default)]
	pub permissions: PermissionSet,
}

/// Optional handler bindings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandlerDescriptors {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub on_error: Option<HandlerDescriptor>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub on_busy: Option<HandlerDescriptor>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub on_idle: Option<HandlerDescriptor>,
}

/// A handler target with its timing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandlerDescriptor {
	#[serde(rename = "ref")]
	pub target: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub delay_ms: Option<u64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub repeat_ms: Option<u64>,
	#[serde(default)]
	pub permissions: PermissionSet,
}

/// Guardrail settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuardrailDescriptor {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub max_passes: Option<u32>,
}

/// Synthetic tool flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyntheticTools {
	#[serde(default)]
	pub respond: bool,
	#[serde(default)]
	pub end: bool,
}

fn empty_object_schema() -> Value {
	json!({ "type": "object", "properties": {} })
}

impl DeckDescriptor {
	/// Parse the JSON form.
	pub fn from_json_str(text: &str) -> DeckResult<Self> {
		serde_json::from_str(text).map_err(|e| DeckError::parse(e.to_string()))
	}

	/// Parse the TOML form.
	pub fn from_toml_str(text: &str) -> DeckResult<Self> {
		toml::from_str(text).map_err(|e| DeckError::parse(e.to_string()))
	}

	/// Load from disk; `.toml` files are TOML, everything else JSON.
	///
	/// `path` is filled in from the file location when the descriptor does
	/// not carry one.
	pub fn from_file(path: &Path) -> DeckResult<Self> {
		let text = std::fs::read_to_string(path).map_err(|source| DeckError::Read {
			path: path.to_path_buf(),
			source,
		})?;

		let mut deck = match path.extension().and_then(|e| e.to_str()) {
			Some("toml") => Self::from_toml_str(&text)?,
			_ => Self::from_json_str(&text)?,
		};
		if deck.path.is_none() {
			deck.path = Some(path.to_path_buf());
		}
		Ok(deck)
	}

	/// Display form of the source path.
	pub fn source(&self) -> String {
		self.path
			.as_ref()
			.map(|p| p.display().to_string())
			.unwrap_or_else(|| "<inline>".to_string())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use tempfile::TempDir;

	#[test]
	fn test_minimal_json_defaults() {
		let deck = DeckDescriptor::from_json_str(r#"{"prompt": "hi"}"#).unwrap();
		assert!(deck.actions.is_empty());
		assert_eq!(deck.guardrails.max_passes, None);
		assert_eq!(deck.synthetic_tools, SyntheticTools::default());
		assert_eq!(deck.source(), "<inline>");
	}

	#[test]
	fn test_handlers_and_permissions() {
		let deck = DeckDescriptor::from_json_str(
			r#"{
				"prompt": "p",
				"contextSchemaRef": "schemas/in.json",
				"actions": [{
					"name": "crunch",
					"ref": "children/crunch.wasm",
					"permissions": { "read": ["data"], "run": false }
				}],
				"handlers": {
					"onBusy": { "ref": "builtin:busy", "delayMs": 500, "repeatMs": 1000 },
					"onError": { "ref": "builtin:recover" }
				}
			}"#,
		)
		.unwrap();

		assert_eq!(deck.context_schema_ref.as_deref(), Some("schemas/in.json"));
		let action = &deck.actions[0];
		assert_eq!(action.permissions.read, vec![PathBuf::from("data")]);
		assert_eq!(action.parameters["type"], "object");

		let busy = deck.handlers.on_busy.as_ref().unwrap();
		assert_eq!(busy.delay_ms, Some(500));
		assert_eq!(busy.repeat_ms, Some(1000));
		assert!(deck.handlers.on_idle.is_none());
	}

	#[test]
	fn test_toml_file_sets_path() {
		let tmp = TempDir::new().unwrap();
		let path = tmp.path().join("main.deck.toml");
		std::fs::write(
			&path,
			r#"
prompt = "From TOML"

[[actions]]
name = "add"
ref = "builtin:add"

[guardrails]
maxPasses = 3

[syntheticTools]
end = true
"#,
		)
		.unwrap();

		let deck = DeckDescriptor::from_file(&path).unwrap();
		assert_eq!(deck.prompt, "From TOML");
		assert_eq!(deck.path.as_deref(), Some(path.as_path()));
		assert_eq!(deck.guardrails.max_passes, Some(3));
		assert!(deck.synthetic_tools.end);
	}

	#[test]
	fn test_parse_errors() {
		assert!(matches!(
			DeckDescriptor::from_json_str("{"),
			Err(DeckError::Parse { .. })
		));
		assert!(matches!(
			DeckDescriptor::from_file(Path::new("/no/such/deck.json")),
			Err(DeckError::Read { .. })
		));
	}
}
