//! Vendor-specific LLM integrations.
//!
//! Each vendor module owns three things: the schema adapter that turns the
//! MCP tool catalogue into the vendor's function declarations, the encoder
//! that renders a `Conversation` into a request body, and the decoder that
//! folds the vendor's response into a `ModelTurn`. The agent loop only ever
//! sees `ModelTurn`.

pub mod gemini;
pub mod openai;

use crate::agent::Conversation;
use crate::error::{BridgeError, Result};
use crate::mcp::ToolDescriptor;
use serde_json::{Map, Value};

/// Argument payload of a tool call as the vendor delivered it.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolArguments {
    /// JSON text, not yet parsed (OpenAI)
    Raw(String),
    /// Already-structured JSON (Gemini)
    Structured(Value),
}

impl ToolArguments {
    /// Parse into the argument mapping sent to the tool server.
    pub fn parse(&self, tool: &str) -> Result<Map<String, Value>> {
        let value = match self {
            ToolArguments::Raw(text) => {
                serde_json::from_str::<Value>(text).map_err(|e| BridgeError::ArgumentParse {
                    tool: tool.to_string(),
                    reason: e.to_string(),
                })?
            }
            ToolArguments::Structured(value) => value.clone(),
        };

        match value {
            Value::Object(map) => Ok(map),
            other => Err(BridgeError::ArgumentParse {
                tool: tool.to_string(),
                reason: format!("expected a JSON object, got {}", json_kind(&other)),
            }),
        }
    }

    /// JSON text form, as OpenAI expects it echoed back
    pub fn to_json_string(&self) -> String {
        match self {
            ToolArguments::Raw(text) => text.clone(),
            ToolArguments::Structured(value) => value.to_string(),
        }
    }

    /// Structured form, as Gemini expects it echoed back
    pub fn to_value(&self) -> Value {
        match self {
            ToolArguments::Raw(text) => {
                serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.clone()))
            }
            ToolArguments::Structured(value) => value.clone(),
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// A tool invocation requested by the model
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    /// Correlation id echoed back with the result
    pub id: String,
    pub name: String,
    pub arguments: ToolArguments,
    /// The vendor sent no id and `id` was made up locally; never put on the wire
    pub synthesized_id: bool,
}

/// Vendor-neutral outcome of one model request
#[derive(Debug, Clone, PartialEq)]
pub enum ModelTurn {
    /// Final answer; empty when the model sent no text
    Stop { text: String },
    /// The model wants these tools run before it continues
    ToolCalls {
        text: Option<String>,
        calls: Vec<ToolCall>,
    },
    /// Neither an answer nor tool calls (length cap, safety filter, ...)
    Halted { reason: String },
}

/// Token accounting reported by the vendor
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Decoded response plus optional usage
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderReply {
    pub turn: ModelTurn,
    pub usage: Option<Usage>,
}

impl ProviderReply {
    pub fn new(turn: ModelTurn) -> Self {
        Self { turn, usage: None }
    }
}

/// A chat model that supports function calling.
pub trait ChatProvider {
    /// Vendor-specific function declaration
    type Declaration: Clone + std::fmt::Debug;

    /// Short vendor name for logs and errors
    fn name(&self) -> &str;

    /// Project the tool catalogue into this vendor's declarations.
    fn adapt_tools(&self, catalogue: &[ToolDescriptor]) -> Vec<Self::Declaration>;

    /// Send the whole conversation and decode the model's next turn.
    fn complete(&mut self, conversation: &Conversation<Self::Declaration>) -> Result<ProviderReply>;
}
