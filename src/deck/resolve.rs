//! One-time resolution of a descriptor into dispatchable targets.

use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::action::{ActionTarget, ComputeRegistry, BUILTIN_PREFIX};
use super::descriptor::{DeckDescriptor, HandlerDescriptor};
use super::error::{DeckError, DeckResult};
use crate::provider::ToolDefinition;
use crate::sandbox::{PermissionSet, SandboxEntry};
use crate::scheduler::handlers::HandlerKind;

/// Name of the synthetic tool that finishes a run with a payload.
pub const RESPOND_TOOL: &str = "respond";

/// Name of the synthetic tool that ends a run.
pub const END_TOOL: &str = "end";

/// Defaults applied while resolving.
#[derive(Debug, Clone)]
pub struct ResolveOptions {
	/// Pass ceiling when the deck sets none.
	pub default_max_passes: u32,
	/// `onBusy` delay when the binding sets none.
	pub busy_delay: Duration,
	/// `onIdle` delay when the binding sets none.
	pub idle_delay: Duration,
	/// Host roots grants must lie within. Empty means the deck directory.
	pub host_roots: Vec<PathBuf>,
}

impl Default for ResolveOptions {
	fn default() -> Self {
		Self {
			default_max_passes: 50,
			busy_delay: Duration::from_millis(800),
			idle_delay: Duration::from_millis(30_000),
			host_roots: Vec::new(),
		}
	}
}

/// An action ready for dispatch.
#[derive(Debug, Clone)]
pub struct ResolvedAction {
	pub name: String,
	pub description: String,
	pub parameters: Value,
	pub target: ActionTarget,
}

/// A resolved handler binding.
#[derive(Debug, Clone)]
pub struct HandlerBinding {
	pub kind: HandlerKind,
	pub target: ActionTarget,
	/// First fire delay (unused for `onError`).
	pub delay: Duration,
	/// Repeat interval, if any.
	pub repeat: Option<Duration>,
}

/// Handshake view of a deck's declared interface.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeckSchema {
	pub source: String,
	pub prompt: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub context_schema_ref: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub response_schema_ref: Option<String>,
	pub actions: Vec<ActionSchema>,
	pub max_passes: u32,
	pub respond: bool,
	pub end: bool,
}

/// One action in a [`DeckSchema`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionSchema {
	pub name: String,
	pub description: String,
	pub parameters: Value,
}

/// A deck whose every ref has been resolved.
///
/// # Example
///
/// ```
/// use deckrun::deck::{ComputeRegistry, DeckDescriptor, ResolveOptions, ResolvedDeck};
/// use serde_json::json;
///
/// let mut registry = ComputeRegistry::new();
/// registry.register("add", |a| Ok(json!(a["x"].as_i64().unwrap_or(0) + 1))).unwrap();
///
/// let descriptor = DeckDescriptor::from_json_str(r#"{
///     "prompt": "p",
///     "actions": [{ "name": "inc", "ref": "builtin:add" }],
///     "syntheticTools": { "end": true }
/// }"#).unwrap();
///
/// let deck = ResolvedDeck::resolve(descriptor, &registry, &ResolveOptions::default()).unwrap();
/// assert_eq!(deck.max_passes(), 50);
/// let names: Vec<_> = deck.tool_definitions().into_iter().map(|t| t.name).collect();
/// assert_eq!(names, vec!["inc", "end"]);
/// ```
#[derive(Debug, Clone)]
pub struct ResolvedDeck {
	descriptor: DeckDescriptor,
	base_dir: PathBuf,
	actions: Vec<ResolvedAction>,
	index: HashMap<String, usize>,
	on_error: Option<HandlerBinding>,
	on_busy: Option<HandlerBinding>,
	on_idle: Option<HandlerBinding>,
	max_passes: u32,
}

impl ResolvedDeck {
	/// Resolve every action and handler ref.
	pub fn resolve(
		descriptor: DeckDescriptor,
		registry: &ComputeRegistry,
		options: &ResolveOptions,
	) -> DeckResult<Self> {
		let base_dir = descriptor
			.path
			.as_deref()
			.and_then(Path::parent)
			.filter(|dir| !dir.as_os_str().is_empty())
			.map(Path::to_path_buf)
			.unwrap_or_else(|| PathBuf::from("."));
		let host_roots = if options.host_roots.is_empty() {
			vec![base_dir.clone()]
		} else {
			options.host_roots.clone()
		};
		let resolver = Resolver {
			registry,
			base_dir: &base_dir,
			host_roots: &host_roots,
		};

		let max_passes = descriptor
			.guardrails
			.max_passes
			.unwrap_or(options.default_max_passes);
		if max_passes == 0 {
			return Err(DeckError::Guardrail {
				message: "maxPasses must be at least 1".to_string(),
			});
		}

		let mut actions = Vec::with_capacity(descriptor.actions.len());
		let mut index = HashMap::new();
		for action in &descriptor.actions {
			if action.name.trim().is_empty() {
				return Err(DeckError::Empty { field: "action name" });
			}
			if (descriptor.synthetic_tools.respond && action.name == RESPOND_TOOL)
				|| (descriptor.synthetic_tools.end && action.name == END_TOOL)
			{
				return Err(DeckError::SyntheticCollision {
					name: action.name.clone(),
				});
			}
			if index.contains_key(&action.name) {
				return Err(DeckError::DuplicateAction {
					name: action.name.clone(),
				});
			}

			let target = resolver.target(&action.name, &action.target, &action.permissions)?;
			index.insert(action.name.clone(), actions.len());
			actions.push(ResolvedAction {
				name: action.name.clone(),
				description: action.description.clone(),
				parameters: action.parameters.clone(),
				target,
			});
		}

		let handlers = &descriptor.handlers;
		let on_error = resolver.handler(HandlerKind::Error, handlers.on_error.as_ref(), Duration::ZERO)?;
		let on_busy = resolver.handler(HandlerKind::Busy, handlers.on_busy.as_ref(), options.busy_delay)?;
		let on_idle = resolver.handler(HandlerKind::Idle, handlers.on_idle.as_ref(), options.idle_delay)?;

		tracing::debug!(
			target: "deckrun::deck",
			source = %descriptor.source(),
			actions = actions.len(),
			max_passes,
			"deck resolved"
		);

		Ok(Self {
			descriptor,
			base_dir,
			actions,
			index,
			on_error,
			on_busy,
			on_idle,
			max_passes,
		})
	}

	/// The original descriptor.
	pub fn descriptor(&self) -> &DeckDescriptor {
		&self.descriptor
	}

	/// Source path used as execution `source`.
	pub fn source(&self) -> String {
		self.descriptor.source()
	}

	/// Directory relative refs were resolved against.
	pub fn base_dir(&self) -> &Path {
		&self.base_dir
	}

	/// System prompt.
	pub fn prompt(&self) -> &str {
		&self.descriptor.prompt
	}

	/// Look up an action by name.
	pub fn action(&self, name: &str) -> Option<&ResolvedAction> {
		self.index.get(name).map(|&i| &self.actions[i])
	}

	/// Actions in declaration order.
	pub fn actions(&self) -> &[ResolvedAction] {
		&self.actions
	}

	/// Binding for a handler kind.
	pub fn handler(&self, kind: HandlerKind) -> Option<&HandlerBinding> {
		match kind {
			HandlerKind::Error => self.on_error.as_ref(),
			HandlerKind::Busy => self.on_busy.as_ref(),
			HandlerKind::Idle => self.on_idle.as_ref(),
		}
	}

	/// Pass ceiling for every run of this deck.
	pub fn max_passes(&self) -> u32 {
		self.max_passes
	}

	pub fn respond_enabled(&self) -> bool {
		self.descriptor.synthetic_tools.respond
	}

	pub fn end_enabled(&self) -> bool {
		self.descriptor.synthetic_tools.end
	}

	/// True if `name` is an enabled synthetic tool.
	pub fn is_synthetic(&self, name: &str) -> bool {
		(name == RESPOND_TOOL && self.respond_enabled()) || (name == END_TOOL && self.end_enabled())
	}

	/// Tools offered to the model: actions, then enabled synthetic tools.
	pub fn tool_definitions(&self) -> Vec<ToolDefinition> {
		let mut tools: Vec<ToolDefinition> = self
			.actions
			.iter()
			.map(|a| ToolDefinition::new(&a.name, &a.description, a.parameters.clone()))
			.collect();

		if self.respond_enabled() {
			let payload_schema = match &self.descriptor.response_schema_ref {
				Some(schema_ref) => json!({ "description": format!("Response matching {}", schema_ref) }),
				None => json!({}),
			};
			tools.push(ToolDefinition::new(
				RESPOND_TOOL,
				"Finish the run and return the final payload",
				json!({
					"type": "object",
					"properties": { "payload": payload_schema },
					"required": ["payload"]
				}),
			));
		}
		if self.end_enabled() {
			tools.push(ToolDefinition::new(
				END_TOOL,
				"End the conversation",
				json!({
					"type": "object",
					"properties": { "message": { "type": "string" } }
				}),
			));
		}
		tools
	}

	/// Declared interface for the "ready" handshake.
	pub fn schema(&self) -> DeckSchema {
		DeckSchema {
			source: self.source(),
			prompt: self.descriptor.prompt.clone(),
			context_schema_ref: self.descriptor.context_schema_ref.clone(),
			response_schema_ref: self.descriptor.response_schema_ref.clone(),
			actions: self
				.actions
				.iter()
				.map(|a| ActionSchema {
					name: a.name.clone(),
					description: a.description.clone(),
					parameters: a.parameters.clone(),
				})
				.collect(),
			max_passes: self.max_passes,
			respond: self.respond_enabled(),
			end: self.end_enabled(),
		}
	}
}

struct Resolver<'a> {
	registry: &'a ComputeRegistry,
	base_dir: &'a Path,
	host_roots: &'a [PathBuf],
}

impl Resolver<'_> {
	fn target(&self, owner: &str, reference: &str, permissions: &PermissionSet) -> DeckResult<ActionTarget> {
		let reference = reference.trim();
		if reference.is_empty() {
			return Err(DeckError::Empty { field: "ref" });
		}

		if let Some(builtin) = reference.strip_prefix(BUILTIN_PREFIX) {
			let function = self
				.registry
				.get(builtin)
				.ok_or_else(|| DeckError::unknown_builtin(owner, builtin))?;
			return Ok(ActionTarget::InProcess {
				builtin: builtin.to_string(),
				function,
			});
		}

		let path = Path::new(reference);
		let entry = if path.is_absolute() {
			path.to_path_buf()
		} else {
			self.base_dir.join(path)
		};
		let permissions = permissions
			.relative_to(self.base_dir)
			.validate_within(self.host_roots)
			.map_err(|source| DeckError::Permission {
				action: owner.to_string(),
				source,
			})?;

		Ok(ActionTarget::Sandboxed {
			entry: SandboxEntry::new(entry),
			permissions,
		})
	}

	fn handler(
		&self,
		kind: HandlerKind,
		descriptor: Option<&HandlerDescriptor>,
		default_delay: Duration,
	) -> DeckResult<Option<HandlerBinding>> {
		let Some(descriptor) = descriptor else {
			return Ok(None);
		};
		let target = self.target(kind.as_str(), &descriptor.target, &descriptor.permissions)?;
		Ok(Some(HandlerBinding {
			kind,
			target,
			delay: descriptor
				.delay_ms
				.map(Duration::from_millis)
				.unwrap_or(default_delay),
			repeat: descriptor
				.repeat_ms
				.filter(|&ms| ms > 0)
				.map(Duration::from_millis),
		}))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use tempfile::TempDir;

	fn registry() -> ComputeRegistry {
		let mut registry = ComputeRegistry::new();
		registry.register("echo", |v| Ok(v.clone())).unwrap();
		registry
	}

	fn deck(json: &str) -> DeckDescriptor {
		DeckDescriptor::from_json_str(json).unwrap()
	}

	#[test]
	fn test_builtin_and_sandboxed_targets() {
		let tmp = TempDir::new().unwrap();
		std::fs::create_dir(tmp.path().join("data")).unwrap();
		let mut descriptor = deck(
			r#"{
				"prompt": "p",
				"actions": [
					{ "name": "echo", "ref": "builtin:echo" },
					{ "name": "child", "ref": "children/child.wat", "permissions": { "read": ["data"] } }
				]
			}"#,
		);
		descriptor.path = Some(tmp.path().join("main.deck.json"));

		let resolved = ResolvedDeck::resolve(descriptor, &registry(), &ResolveOptions::default()).unwrap();
		assert!(!resolved.action("echo").unwrap().target.is_sandboxed());

		match &resolved.action("child").unwrap().target {
			ActionTarget::Sandboxed { entry, permissions } => {
				assert_eq!(entry.path, tmp.path().join("children/child.wat"));
				assert_eq!(
					permissions.read,
					vec![tmp.path().join("data").canonicalize().unwrap()]
				);
			}
			other => panic!("unexpected target {:?}", other),
		}
	}

	#[test]
	fn test_rejections() {
		let options = ResolveOptions::default();
		let cases = [
			(
				r#"{"prompt":"p","actions":[{"name":"a","ref":"builtin:echo"},{"name":"a","ref":"builtin:echo"}]}"#,
				"duplicate",
			),
			(r#"{"prompt":"p","actions":[{"name":"a","ref":"builtin:nope"}]}"#, "unknown builtin"),
			(r#"{"prompt":"p","actions":[{"name":" ","ref":"builtin:echo"}]}"#, "empty"),
			(
				r#"{"prompt":"p","actions":[{"name":"end","ref":"builtin:echo"}],"syntheticTools":{"end":true}}"#,
				"collides",
			),
			(r#"{"prompt":"p","guardrails":{"maxPasses":0}}"#, "maxPasses"),
		];
		for (json, expected) in cases {
			let err = ResolvedDeck::resolve(deck(json), &registry(), &options).unwrap_err();
			assert!(
				err.to_string().contains(expected),
				"{} should mention {}",
				err,
				expected
			);
		}
	}

	#[test]
	fn test_action_named_end_allowed_when_synthetic_disabled() {
		let descriptor = deck(r#"{"prompt":"p","actions":[{"name":"end","ref":"builtin:echo"}]}"#);
		let resolved = ResolvedDeck::resolve(descriptor, &registry(), &ResolveOptions::default()).unwrap();
		assert!(!resolved.is_synthetic("end"));
	}

	#[test]
	fn test_permissions_outside_roots_rejected() {
		let deck_dir = TempDir::new().unwrap();
		let outside = TempDir::new().unwrap();
		let mut descriptor = deck(&format!(
			r#"{{"prompt":"p","actions":[{{"name":"c","ref":"c.wasm","permissions":{{"write":["{}"]}}}}]}}"#,
			outside.path().display()
		));
		descriptor.path = Some(deck_dir.path().join("deck.json"));

		let err = ResolvedDeck::resolve(descriptor, &registry(), &ResolveOptions::default()).unwrap_err();
		assert!(matches!(err, DeckError::Permission { .. }));
	}

	#[test]
	fn test_handler_defaults() {
		let descriptor = deck(
			r#"{
				"prompt": "p",
				"handlers": {
					"onBusy": { "ref": "builtin:echo" },
					"onIdle": { "ref": "builtin:echo", "delayMs": 10, "repeatMs": 0 },
					"onError": { "ref": "builtin:echo" }
				}
			}"#,
		);
		let options = ResolveOptions {
			busy_delay: Duration::from_millis(250),
			..ResolveOptions::default()
		};
		let resolved = ResolvedDeck::resolve(descriptor, &registry(), &options).unwrap();

		let busy = resolved.handler(HandlerKind::Busy).unwrap();
		assert_eq!(busy.delay, Duration::from_millis(250));
		assert_eq!(busy.repeat, None);

		let idle = resolved.handler(HandlerKind::Idle).unwrap();
		assert_eq!(idle.delay, Duration::from_millis(10));
		assert_eq!(idle.repeat, None);
		assert!(resolved.handler(HandlerKind::Error).is_some());
	}

	#[test]
	fn test_schema_and_synthetic_tools() {
		let descriptor = deck(
			r#"{
				"prompt": "Answer",
				"responseSchemaRef": "schemas/out.json",
				"actions": [{ "name": "echo", "ref": "builtin:echo", "description": "Echo" }],
				"guardrails": { "maxPasses": 4 },
				"syntheticTools": { "respond": true, "end": true }
			}"#,
		);
		let resolved = ResolvedDeck::resolve(descriptor, &registry(), &ResolveOptions::default()).unwrap();

		let tools = resolved.tool_definitions();
		let names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
		assert_eq!(names, vec!["echo", "respond", "end"]);
		assert_eq!(tools[1].parameters["required"], json!(["payload"]));

		let schema = serde_json::to_value(resolved.schema()).unwrap();
		assert_eq!(schema["maxPasses"], 4);
		assert_eq!(schema["responseSchemaRef"], "schemas/out.json");
		assert_eq!(schema["actions"][0]["name"], "echo");
		assert!(schema.get("contextSchemaRef").is_none());
	}
}
