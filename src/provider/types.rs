//! Provider wire types
//!
//! Provider-agnostic request/response shapes. HTTP adapters translate these
//! into their own formats.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::session::{Entry, ToolCallRecord};

/// Tool definition handed to the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Tool name (function name)
    pub name: String,
    /// Human-readable description of what the tool does
    pub description: String,
    /// JSON Schema describing the tool's parameters
    pub parameters: Value,
}

impl ToolDefinition {
    pub fn new(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }

    /// OpenAI-compatible function schema
    pub fn to_openai_function(&self) -> Value {
        serde_json::json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": self.parameters,
            }
        })
    }
}

/// A tool call requested by the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    /// Raw JSON argument text, exactly as the model produced it
    pub arguments: String,
}

impl ToolCallRequest {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments: arguments.into(),
        }
    }

    /// Parse the argument text; empty text means `{}`
    pub fn parse_arguments(&self) -> serde_json::Result<Value> {
        if self.arguments.trim().is_empty() {
            return Ok(Value::Object(Default::default()));
        }
        serde_json::from_str(&self.arguments)
    }

    pub fn to_record(&self) -> ToolCallRecord {
        ToolCallRecord {
            id: self.id.clone(),
            name: self.name.clone(),
            arguments: self.arguments.clone(),
        }
    }
}

/// Why the model stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FinishStatus {
    #[default]
    Stop,
    ToolCalls,
    Length,
    ContentFilter,
}

/// One model call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRequest {
    pub run_id: String,
    /// Model override (None = provider default)
    pub model: Option<String>,
    pub system: Option<String>,
    /// Conversation entries, status lane already removed
    pub history: Vec<Entry>,
    pub tools: Vec<ToolDefinition>,
    pub stream: bool,
}

/// Complete model answer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ModelResponse {
    pub text: Option<String>,
    #[serde(default)]
    pub tool_calls: Vec<ToolCallRequest>,
    #[serde(default)]
    pub status: FinishStatus,
}

impl ModelResponse {
    /// Plain text answer
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            tool_calls: Vec::new(),
            status: FinishStatus::Stop,
        }
    }

    /// Answer made of tool calls
    pub fn tool_calls(calls: Vec<ToolCallRequest>) -> Self {
        Self {
            text: None,
            tool_calls: calls,
            status: FinishStatus::ToolCalls,
        }
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// Streaming fragment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamChunk {
    /// Text fragment
    Text { delta: String },
    /// Partial tool call; `id` and `name` arrive once, arguments in pieces
    ToolCallDelta {
        index: usize,
        id: Option<String>,
        name: Option<String>,
        arguments_delta: Option<String>,
    },
    /// End of stream
    Done { status: FinishStatus },
}

#[derive(Debug, Default)]
struct PartialCall {
    id: Option<String>,
    name: Option<String>,
    arguments: String,
}

/// Folds stream chunks into a [`ModelResponse`]
#[derive(Debug, Default)]
pub struct ResponseAccumulator {
    text: String,
    calls: Vec<PartialCall>,
    status: Option<FinishStatus>,
}

impl ResponseAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &StreamChunk) {
        match chunk {
            StreamChunk::Text { delta } => self.text.push_str(delta),
            StreamChunk::ToolCallDelta {
                index,
                id,
                name,
                arguments_delta,
            } => {
                if self.calls.len() <= *index {
                    self.calls.resize_with(index + 1, PartialCall::default);
                }
                let call = &mut self.calls[*index];
                if let Some(id) = id {
                    call.id = Some(id.clone());
                }
                if let Some(name) = name {
                    call.name = Some(name.clone());
                }
                if let Some(delta) = arguments_delta {
                    call.arguments.push_str(delta);
                }
            }
            StreamChunk::Done { status } => self.status = Some(*status),
        }
    }

    /// Whether the stream has signalled its end
    pub fn is_done(&self) -> bool {
        self.status.is_some()
    }

    /// Text received so far
    pub fn partial_text(&self) -> &str {
        &self.text
    }

    pub fn finish(self) -> ModelResponse {
        let tool_calls: Vec<ToolCallRequest> = self
            .calls
            .into_iter()
            .enumerate()
            .filter_map(|(index, call)| {
                let name = call.name?;
                Some(ToolCallRequest {
                    id: call.id.unwrap_or_else(|| format!("call_{}", index)),
                    name,
                    arguments: call.arguments,
                })
            })
            .collect();

        let status = match self.status {
            Some(status) => status,
            None if !tool_calls.is_empty() => FinishStatus::ToolCalls,
            None => FinishStatus::Stop,
        };

        ModelResponse {
            text: if self.text.is_empty() {
                None
            } else {
                Some(self.text)
            },
            tool_calls,
            status,
        }
    }
}
