//! MCP (Model Context Protocol) client support for talking to an external tool server.

pub mod client;
pub mod transport;

pub use client::{McpClient, ToolInvoker};
pub use transport::{McpTransport, ProcessTransport, SessionTransport};

use crate::error::{BridgeError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON-RPC method listing the server's tools
pub const METHOD_TOOLS_LIST: &str = "tools/list";
/// JSON-RPC method invoking a single tool
pub const METHOD_TOOLS_CALL: &str = "tools/call";

/// A JSON-RPC 2.0 request as written to the server's stdin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    /// Absent for notifications
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
}

impl JsonRpcRequest {
    /// Build a request with the fixed id used by process-per-call transports.
    pub fn new(method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params,
            id: Some(1),
        }
    }

    pub fn notification(method: &str) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params: None,
            id: None,
        }
    }

    pub fn with_id(mut self, id: u64) -> Self {
        self.id = Some(id);
        self
    }
}

/// Tool definition from an MCP server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    /// JSON Schema for tool input parameters
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

impl ToolDescriptor {
    /// Decode one catalogue entry, naming its position on failure.
    pub fn from_entry(index: usize, entry: &Value) -> Result<Self> {
        let object = entry.as_object().ok_or_else(|| BridgeError::MalformedTool {
            index,
            reason: "entry is not an object".to_string(),
        })?;

        let text_field = |field: &str| -> Result<String> {
            match object.get(field) {
                Some(Value::String(s)) => Ok(s.clone()),
                Some(_) => Err(BridgeError::MalformedTool {
                    index,
                    reason: format!("'{}' is not a string", field),
                }),
                None => Err(BridgeError::MalformedTool {
                    index,
                    reason: format!("missing '{}'", field),
                }),
            }
        };

        let name = text_field("name")?;
        let description = text_field("description")?;
        let input_schema = object
            .get("inputSchema")
            .cloned()
            .ok_or_else(|| BridgeError::MalformedTool {
                index,
                reason: "missing 'inputSchema'".to_string(),
            })?;

        Ok(Self {
            name,
            description,
            input_schema,
        })
    }
}

/// Decode a `tools/list` response into a catalogue. A missing `result.tools` is an empty catalogue.
pub fn decode_catalogue(response: &Value) -> Result<Vec<ToolDescriptor>> {
    match response.pointer("/result/tools") {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(entries)) => entries
            .iter()
            .enumerate()
            .map(|(i, entry)| ToolDescriptor::from_entry(i, entry))
            .collect(),
        Some(_) => Err(BridgeError::transport("'result.tools' is not an array")),
    }
}

/// Surface a JSON-RPC `error` member as a transport failure.
pub(crate) fn check_rpc_error(response: &Value) -> Result<()> {
    if let Some(error) = response.get("error") {
        let code = error.get("code").and_then(Value::as_i64).unwrap_or(0);
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error");
        return Err(BridgeError::transport(format!(
            "JSON-RPC error {}: {}",
            code, message
        )));
    }
    Ok(())
}
