//! OpenAI chat-completions integration.
//!
//! Tools are offered as `{"type": "function", "function": {...}}` entries and
//! the model answers with `choices[0]`, whose `finish_reason` decides the turn:
//! `stop` is a final answer, `tool_calls` carries a list of typed call objects
//! with JSON-text arguments, anything else is a soft stop.

use crate::agent::{Conversation, Message};
use crate::config::BackendConfig;
use crate::error::{BridgeError, Result};
use crate::mcp::ToolDescriptor;
use crate::vendors::{ChatProvider, ModelTurn, ProviderReply, ToolArguments, ToolCall, Usage};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

const PROVIDER: &str = "openai";

/// Function tool entry in the `tools` array
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OpenAiTool {
    #[serde(rename = "type")]
    pub kind: String,
    pub function: OpenAiFunction,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OpenAiFunction {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Convert MCP tool definitions to OpenAI function tools, one per descriptor, in order.
pub fn adapt_tools(catalogue: &[ToolDescriptor]) -> Vec<OpenAiTool> {
    catalogue
        .iter()
        .map(|tool| OpenAiTool {
            kind: "function".to_string(),
            function: OpenAiFunction {
                name: tool.name.clone(),
                description: tool.description.clone(),
                parameters: tool.input_schema.clone(),
            },
        })
        .collect()
}

/// Render the conversation as chat-completions messages
pub fn encode_messages(messages: &[Message]) -> Vec<Value> {
    messages
        .iter()
        .map(|message| match message {
            Message::User { text } => json!({
                "role": "user",
                "content": text,
            }),
            Message::Assistant { text, tool_calls } if tool_calls.is_empty() => json!({
                "role": "assistant",
                "content": text,
            }),
            Message::Assistant { text, tool_calls } => {
                let calls: Vec<Value> = tool_calls
                    .iter()
                    .map(|call| {
                        json!({
                            "id": call.id,
                            "type": "function",
                            "function": {
                                "name": call.name,
                                "arguments": call.arguments.to_json_string(),
                            }
                        })
                    })
                    .collect();
                json!({
                    "role": "assistant",
                    "content": text,
                    "tool_calls": calls,
                })
            }
            Message::ToolResult {
                call_id, content, ..
            } => json!({
                "role": "tool",
                "tool_call_id": call_id,
                "content": content,
            }),
        })
        .collect()
}

/// Build the request body. `tools` is omitted when the catalogue is empty since the API rejects an empty array.
pub fn build_request(model: &str, conversation: &Conversation<OpenAiTool>) -> Value {
    let mut body = json!({
        "model": model,
        "messages": encode_messages(conversation.messages()),
    });
    if !conversation.tools().is_empty() {
        body["tools"] = json!(conversation.tools());
        body["tool_choice"] = json!("auto");
    }
    body
}

/// Response body of `POST /chat/completions`
#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionResponse {
    #[serde(default)]
    pub choices: Vec<Choice>,
    #[serde(default)]
    pub usage: Option<OpenAIUsage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Choice {
    pub message: ResponseMessage,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResponseMessage {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub tool_calls: Option<Vec<ResponseToolCall>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResponseToolCall {
    pub id: String,
    pub function: ResponseFunction,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResponseFunction {
    pub name: String,
    /// JSON text; parsed only when the call is resolved
    #[serde(default)]
    pub arguments: String,
}

/// OpenAI usage data from API response
#[derive(Debug, Clone, Deserialize)]
pub struct OpenAIUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

impl OpenAIUsage {
    pub fn total(&self) -> u64 {
        if self.total_tokens > 0 {
            self.total_tokens
        } else {
            self.prompt_tokens + self.completion_tokens
        }
    }
}

impl From<&OpenAIUsage> for Usage {
    fn from(usage: &OpenAIUsage) -> Self {
        Usage {
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
        }
    }
}

/// Fold the first choice into a `ModelTurn`
pub fn decode_response(response: &ChatCompletionResponse) -> ProviderReply {
    let usage = response.usage.as_ref().map(Usage::from);

    let Some(choice) = response.choices.first() else {
        return ProviderReply {
            turn: ModelTurn::Halted {
                reason: "no choices in response".to_string(),
            },
            usage,
        };
    };

    let turn = match choice.finish_reason.as_deref() {
        Some("stop") => ModelTurn::Stop {
            text: choice.message.content.clone().unwrap_or_default(),
        },
        Some("tool_calls") => ModelTurn::ToolCalls {
            text: choice.message.content.clone(),
            calls: choice
                .message
                .tool_calls
                .iter()
                .flatten()
                .map(|tc| ToolCall {
                    id: tc.id.clone(),
                    name: tc.function.name.clone(),
                    arguments: ToolArguments::Raw(tc.function.arguments.clone()),
                    synthesized_id: false,
                })
                .collect(),
        },
        Some(other) => ModelTurn::Halted {
            reason: other.to_string(),
        },
        None => ModelTurn::Halted {
            reason: "missing finish_reason".to_string(),
        },
    };

    ProviderReply { turn, usage }
}

/// Blocking client for an OpenAI-compatible chat-completions endpoint
pub struct OpenAiProvider {
    client: reqwest::blocking::Client,
    base_url: String,
    model: String,
    api_key: SecretString,
}

impl OpenAiProvider {
    pub fn new(backend: &BackendConfig, api_key: SecretString) -> Result<Self> {
        // No client-side timeout on model calls
        let client = reqwest::blocking::Client::builder()
            .timeout(None::<std::time::Duration>)
            .build()
            .map_err(|e| BridgeError::provider(PROVIDER, e.to_string()))?;
        Ok(Self {
            client,
            base_url: backend.base_url.trim_end_matches('/').to_string(),
            model: backend.model.clone(),
            api_key,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

impl ChatProvider for OpenAiProvider {
    type Declaration = OpenAiTool;

    fn name(&self) -> &str {
        PROVIDER
    }

    fn adapt_tools(&self, catalogue: &[ToolDescriptor]) -> Vec<OpenAiTool> {
        adapt_tools(catalogue)
    }

    fn complete(&mut self, conversation: &Conversation<OpenAiTool>) -> Result<ProviderReply> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = build_request(&self.model, conversation);

        let response = self
            .client
            .post(&url)
            .bearer_auth(self.api_key.expose_secret())
            .json(&body)
            .send()
            .map_err(|e| BridgeError::provider(PROVIDER, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().unwrap_or_default();
            return Err(BridgeError::provider(
                PROVIDER,
                format!("HTTP {}: {}", status, text),
            ));
        }

        let parsed: ChatCompletionResponse = response
            .json()
            .map_err(|e| BridgeError::provider(PROVIDER, format!("invalid response: {}", e)))?;

        if let Some(usage) = &parsed.usage {
            debug!(
                model = %self.model,
                prompt_tokens = usage.prompt_tokens,
                completion_tokens = usage.completion_tokens,
                total_tokens = usage.total(),
                "openai usage"
            );
        }

        Ok(decode_response(&parsed))
    }
}
