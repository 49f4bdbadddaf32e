//! Google Gemini generateContent integration.
//!
//! Key differences from OpenAI:
//! - Uses `contents` with `parts` instead of `messages` with `content`.
//! - Roles are `user` and `model`; tool results travel as `functionResponse`
//!   parts inside a `user` content.
//! - Tools are `[{"functionDeclarations": [...]}]`.
//! - Calls arrive as `functionCall` parts with structured `args` and usually no id,
//!   so ids are synthesized from the conversation length and part position.
//!   An id Gemini did send is echoed on the call and its `functionResponse`.
//! - The API key goes in the `x-goog-api-key` header.

use crate::agent::{Conversation, Message};
use crate::config::BackendConfig;
use crate::error::{BridgeError, Result};
use crate::mcp::ToolDescriptor;
use crate::vendors::{ChatProvider, ModelTurn, ProviderReply, ToolArguments, ToolCall, Usage};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashSet;
use tracing::debug;

const PROVIDER: &str = "gemini";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GeminiFunctionDeclaration {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Convert MCP tool definitions to Gemini function declarations, one per descriptor, in order.
pub fn adapt_tools(catalogue: &[ToolDescriptor]) -> Vec<GeminiFunctionDeclaration> {
    catalogue
        .iter()
        .map(|tool| GeminiFunctionDeclaration {
            name: tool.name.clone(),
            description: tool.description.clone(),
            parameters: tool.input_schema.clone(),
        })
        .collect()
}

/// Render the conversation as Gemini `contents`.
///
/// Consecutive tool results are grouped into a single `user` content so that
/// one model turn's calls are answered together.
pub fn encode_contents(messages: &[Message]) -> Vec<Value> {
    let mut contents: Vec<Value> = Vec::new();
    let mut pending_responses: Vec<Value> = Vec::new();
    // Ids Gemini assigned itself, echoed back on the matching responses
    let mut vendor_ids: HashSet<&str> = HashSet::new();

    for message in messages {
        match message {
            Message::ToolResult {
                call_id,
                name,
                content,
            } => {
                let mut response = json!({
                    "name": name,
                    "response": { "result": content },
                });
                if vendor_ids.contains(call_id.as_str()) {
                    response["id"] = json!(call_id);
                }
                pending_responses.push(json!({ "functionResponse": response }));
            }
            Message::User { text } => {
                flush_responses(&mut contents, &mut pending_responses);
                contents.push(json!({
                    "role": "user",
                    "parts": [{ "text": text }],
                }));
            }
            Message::Assistant { text, tool_calls } => {
                flush_responses(&mut contents, &mut pending_responses);
                let mut parts: Vec<Value> = Vec::new();
                if let Some(text) = text.as_deref().filter(|t| !t.is_empty()) {
                    parts.push(json!({ "text": text }));
                }
                for call in tool_calls {
                    let mut function_call = json!({
                        "name": call.name,
                        "args": call.arguments.to_value(),
                    });
                    if !call.synthesized_id {
                        function_call["id"] = json!(call.id);
                        vendor_ids.insert(call.id.as_str());
                    }
                    parts.push(json!({ "functionCall": function_call }));
                }
                if parts.is_empty() {
                    parts.push(json!({ "text": "" }));
                }
                contents.push(json!({
                    "role": "model",
                    "parts": parts,
                }));
            }
        }
    }

    flush_responses(&mut contents, &mut pending_responses);
    contents
}

fn flush_responses(contents: &mut Vec<Value>, pending: &mut Vec<Value>) {
    if !pending.is_empty() {
        contents.push(json!({
            "role": "user",
            "parts": std::mem::take(pending),
        }));
    }
}

/// Build the generateContent request body
pub fn build_request(conversation: &Conversation<GeminiFunctionDeclaration>) -> Value {
    let mut body = json!({
        "contents": encode_contents(conversation.messages()),
    });
    if !conversation.tools().is_empty() {
        body["tools"] = json!([{ "functionDeclarations": conversation.tools() }]);
    }
    body
}

/// Response body of `generateContent`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateContentResponse {
    #[serde(default)]
    pub candidates: Vec<Candidate>,
    #[serde(default)]
    pub prompt_feedback: Option<PromptFeedback>,
    #[serde(default)]
    pub usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    #[serde(default)]
    pub content: Option<Content>,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Content {
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub function_call: Option<FunctionCall>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FunctionCall {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptFeedback {
    #[serde(default)]
    pub block_reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageMetadata {
    #[serde(default)]
    pub prompt_token_count: u64,
    #[serde(default)]
    pub candidates_token_count: u64,
}

/// Fold the first candidate into a `ModelTurn`.
///
/// Calls without an id get `call_{turn}_{position}`, unique within one conversation.
pub fn decode_response(response: &GenerateContentResponse, turn: usize) -> ProviderReply {
    let usage = response.usage_metadata.as_ref().map(|u| Usage {
        input_tokens: u.prompt_token_count,
        output_tokens: u.candidates_token_count,
    });

    let Some(candidate) = response.candidates.first() else {
        let reason = response
            .prompt_feedback
            .as_ref()
            .and_then(|f| f.block_reason.as_deref())
            .map(|r| format!("prompt blocked: {}", r))
            .unwrap_or_else(|| "no candidates in response".to_string());
        return ProviderReply {
            turn: ModelTurn::Halted { reason },
            usage,
        };
    };

    let parts: &[Part] = candidate
        .content
        .as_ref()
        .map(|c| c.parts.as_slice())
        .unwrap_or(&[]);

    let text: String = parts.iter().filter_map(|p| p.text.as_deref()).collect();

    let calls: Vec<ToolCall> = parts
        .iter()
        .filter_map(|p| p.function_call.as_ref())
        .enumerate()
        .map(|(i, fc)| ToolCall {
            id: fc.id.clone().unwrap_or_else(|| format!("call_{}_{}", turn, i)),
            name: fc.name.clone(),
            arguments: ToolArguments::Structured(match &fc.args {
                Value::Null => json!({}),
                args => args.clone(),
            }),
            synthesized_id: fc.id.is_none(),
        })
        .collect();

    let turn = if !calls.is_empty() {
        ModelTurn::ToolCalls {
            text: (!text.is_empty()).then_some(text),
            calls,
        }
    } else {
        match candidate.finish_reason.as_deref() {
            None | Some("STOP") => ModelTurn::Stop { text },
            Some(other) => ModelTurn::Halted {
                reason: other.to_string(),
            },
        }
    };

    ProviderReply { turn, usage }
}

/// Blocking client for the Gemini generateContent endpoint
pub struct GeminiProvider {
    client: reqwest::blocking::Client,
    base_url: String,
    model: String,
    api_key: SecretString,
}

impl GeminiProvider {
    pub fn new(backend: &BackendConfig, api_key: SecretString) -> Result<Self> {
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

    fn endpoint(&self) -> String {
        format!(
            "{}/v1beta/models/{}:generateContent",
            self.base_url, self.model
        )
    }
}

impl ChatProvider for GeminiProvider {
    type Declaration = GeminiFunctionDeclaration;

    fn name(&self) -> &str {
        PROVIDER
    }

    fn adapt_tools(&self, catalogue: &[ToolDescriptor]) -> Vec<GeminiFunctionDeclaration> {
        adapt_tools(catalogue)
    }

    fn complete(
        &mut self,
        conversation: &Conversation<GeminiFunctionDeclaration>,
    ) -> Result<ProviderReply> {
        let body = build_request(conversation);

        let response = self
            .client
            .post(self.endpoint())
            .header("x-goog-api-key", self.api_key.expose_secret())
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

        let parsed: GenerateContentResponse = response
            .json()
            .map_err(|e| BridgeError::provider(PROVIDER, format!("invalid response: {}", e)))?;

        if let Some(usage) = &parsed.usage_metadata {
            debug!(
                model = %self.model,
                prompt_tokens = usage.prompt_token_count,
                candidates_tokens = usage.candidates_token_count,
                "gemini usage"
            );
        }

        Ok(decode_response(&parsed, conversation.messages().len()))
    }
}
