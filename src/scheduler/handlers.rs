//! Handler payloads
//!
//! Shapes exchanged with `onError`, `onBusy` and `onIdle` handler decks.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;

/// Which handler is being invoked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerKind {
    Error,
    Busy,
    Idle,
}

impl HandlerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            HandlerKind::Error => "onError",
            HandlerKind::Busy => "onBusy",
            HandlerKind::Idle => "onIdle",
        }
    }
}

impl std::fmt::Display for HandlerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What triggered a timed handler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandlerTrigger {
    pub elapsed_ms: u64,
    pub fire_count: u32,
}

/// Error details passed to `onError`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandlerErrorInfo {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    pub kind: String,
}

/// Input handed to a handler deck
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandlerInput {
    pub kind: HandlerKind,
    /// Deck path the handler belongs to
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger: Option<HandlerTrigger>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub child_input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<HandlerErrorInfo>,
}

impl HandlerInput {
    pub fn busy(source: impl Into<String>, elapsed: Duration, fire_count: u32, child_input: Value) -> Self {
        Self {
            kind: HandlerKind::Busy,
            source: source.into(),
            trigger: Some(HandlerTrigger {
                elapsed_ms: elapsed.as_millis() as u64,
                fire_count,
            }),
            child_input: Some(child_input),
            error: None,
        }
    }

    pub fn idle(source: impl Into<String>, elapsed: Duration, fire_count: u32) -> Self {
        Self {
            kind: HandlerKind::Idle,
            source: source.into(),
            trigger: Some(HandlerTrigger {
                elapsed_ms: elapsed.as_millis() as u64,
                fire_count,
            }),
            child_input: None,
            error: None,
        }
    }

    pub fn error(
        source: impl Into<String>,
        kind: impl Into<String>,
        message: impl Into<String>,
        action: Option<String>,
        child_input: Option<Value>,
    ) -> Self {
        Self {
            kind: HandlerKind::Error,
            source: source.into(),
            trigger: None,
            child_input,
            error: Some(HandlerErrorInfo {
                message: message.into(),
                action,
                kind: kind.into(),
            }),
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Result of an `onError` handler; becomes the tool result
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ErrorHandlerResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl ErrorHandlerResult {
    /// Interpret whatever the handler returned. A bare string is the message;
    /// an object is read field by field; anything else becomes the payload.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::String(message) => Self {
                message: Some(message),
                ..Self::default()
            },
            Value::Object(map) => Self {
                message: map.get("message").and_then(Value::as_str).map(str::to_string),
                code: map.get("code").filter(|v| !v.is_null()).cloned(),
                status: map.get("status").and_then(Value::as_i64),
                meta: map.get("meta").filter(|v| !v.is_null()).cloned(),
                payload: map.get("payload").filter(|v| !v.is_null()).cloned(),
            },
            Value::Null => Self::default(),
            other => Self {
                payload: Some(other),
                ..Self::default()
            },
        }
    }

    /// Tool output shown to the model
    pub fn to_tool_output(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| json!({}))
    }
}

/// Text of a status-lane entry: the handler's answer plus elapsed time
pub fn render_status(result: &Value, elapsed: Duration) -> String {
    let text = match result {
        Value::String(s) => s.clone(),
        Value::Object(map) => match map.get("message").and_then(Value::as_str) {
            Some(message) => message.to_string(),
            None => result.to_string(),
        },
        Value::Null => String::from("still working"),
        other => other.to_string(),
    };
    format!("{} ({}ms)", text, elapsed.as_millis())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_busy_input_shape() {
        let input = HandlerInput::busy(
            "decks/main.deck.json",
            Duration::from_millis(500),
            1,
            json!({"q": 1}),
        );
        assert_eq!(
            input.to_value(),
            json!({
                "kind": "busy",
                "source": "decks/main.deck.json",
                "trigger": {"elapsedMs": 500, "fireCount": 1},
                "childInput": {"q": 1}
            })
        );
    }

    #[test]
    fn test_error_input_shape() {
        let input = HandlerInput::error("main", "compute", "boom", Some("add".into()), None);
        let value = input.to_value();
        assert_eq!(value["error"]["message"], "boom");
        assert_eq!(value["error"]["action"], "add");
        assert!(value.get("trigger").is_none());
    }

    #[test]
    fn test_error_result_parsing() {
        let result = ErrorHandlerResult::from_value(json!({"message": "recovered", "status": 200}));
        assert_eq!(result.message.as_deref(), Some("recovered"));
        assert_eq!(result.status, Some(200));
        assert_eq!(
            result.to_tool_output(),
            json!({"message": "recovered", "status": 200})
        );

        let bare = ErrorHandlerResult::from_value(json!("try again later"));
        assert_eq!(bare.message.as_deref(), Some("try again later"));

        let other = ErrorHandlerResult::from_value(json!([1, 2]));
        assert_eq!(other.payload, Some(json!([1, 2])));
    }

    #[test]
    fn test_render_status() {
        assert_eq!(
            render_status(&json!("still crunching"), Duration::from_millis(800)),
            "still crunching (800ms)"
        );
        assert_eq!(
            render_status(&json!({"message": "halfway"}), Duration::from_millis(1200)),
            "halfway (1200ms)"
        );
        assert_eq!(
            render_status(&json!({"pct": 50}), Duration::from_millis(5)),
            r#"{"pct":50} (5ms)"#
        );
    }
}
