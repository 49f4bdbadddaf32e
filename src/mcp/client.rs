//! MCP client: tool discovery and tool execution on top of a transport.

use crate::error::Result;
use crate::mcp::{
    decode_catalogue, JsonRpcRequest, McpTransport, ToolDescriptor, METHOD_TOOLS_CALL,
    METHOD_TOOLS_LIST,
};
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

/// Source of tools for the agent loop.
pub trait ToolInvoker {
    /// Fetch the tool catalogue.
    fn list_tools(&mut self) -> Result<Vec<ToolDescriptor>>;

    /// Execute a tool and return its output flattened to text.
    fn call_tool(&mut self, name: &str, arguments: &Map<String, Value>) -> Result<String>;
}

/// Client for a single MCP server
pub struct McpClient<T> {
    transport: T,
}

impl<T: McpTransport> McpClient<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }
}

impl<T: McpTransport> ToolInvoker for McpClient<T> {
    fn list_tools(&mut self) -> Result<Vec<ToolDescriptor>> {
        let response = self
            .transport
            .send(&JsonRpcRequest::new(METHOD_TOOLS_LIST, None))?;
        let tools = decode_catalogue(&response)?;
        debug!(count = tools.len(), "fetched tool catalogue");
        Ok(tools)
    }

    fn call_tool(&mut self, name: &str, arguments: &Map<String, Value>) -> Result<String> {
        let params = json!({ "name": name, "arguments": arguments });
        let response = self
            .transport
            .send(&JsonRpcRequest::new(METHOD_TOOLS_CALL, Some(params)))?;

        if response.pointer("/result/isError").and_then(Value::as_bool) == Some(true) {
            warn!(tool = %name, "tool reported an error result");
        }
        Ok(flatten_content(&response))
    }
}

/// Join the `text` of every `type: "text"` content block with newlines; other blocks are dropped.
pub fn flatten_content(response: &Value) -> String {
    let Some(blocks) = response.pointer("/result/content").and_then(Value::as_array) else {
        return String::new();
    };

    blocks
        .iter()
        .filter(|block| block.get("type").and_then(Value::as_str) == Some("text"))
        .map(|block| block.get("text").and_then(Value::as_str).unwrap_or(""))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BridgeError;

    /// Records requests and replies with canned responses
    struct ScriptedTransport {
        sent: Vec<JsonRpcRequest>,
        replies: Vec<Result<Value>>,
    }

    impl ScriptedTransport {
        fn new(replies: Vec<Result<Value>>) -> Self {
            Self {
                sent: Vec::new(),
                replies,
            }
        }
    }

    impl McpTransport for ScriptedTransport {
        fn send(&mut self, request: &JsonRpcRequest) -> Result<Value> {
            self.sent.push(request.clone());
            self.replies.remove(0)
        }
    }

    #[test]
    fn test_flatten_content_keeps_only_text_blocks_in_order() {
        let response = json!({
            "result": {
                "content": [
                    {"type": "text", "text": "INC0010001 | P1 | Email down"},
                    {"type": "image", "data": "aGVsbG8=", "mimeType": "image/png"},
                    {"type": "text", "text": "INC0010002 | P1 | VPN outage"},
                    {"type": "resource", "resource": {"uri": "file:///x"}},
                    {"type": "text", "text": "2 results"}
                ]
            }
        });
        assert_eq!(
            flatten_content(&response),
            "INC0010001 | P1 | Email down\nINC0010002 | P1 | VPN outage\n2 results"
        );
    }

    #[test]
    fn test_flatten_content_missing_fields() {
        assert_eq!(flatten_content(&json!({})), "");
        assert_eq!(flatten_content(&json!({"result": {}})), "");
        let response = json!({"result": {"content": [{"type": "text"}, {"type": "text", "text": "b"}]}});
        assert_eq!(flatten_content(&response), "\nb");
    }

    #[test]
    fn test_call_tool_builds_request() {
        let transport = ScriptedTransport::new(vec![Ok(json!({
            "result": {"content": [{"type": "text", "text": "42"}]}
        }))]);
        let mut client = McpClient::new(transport);

        let mut args = Map::new();
        args.insert("a".to_string(), json!(1));
        let out = client.call_tool("foo", &args).unwrap();
        assert_eq!(out, "42");

        let sent = &client.transport.sent[0];
        assert_eq!(sent.method, "tools/call");
        assert_eq!(sent.id, Some(1));
        let params = sent.params.as_ref().unwrap();
        assert_eq!(params["name"], "foo");
        assert_eq!(params["arguments"], json!({"a": 1}));
    }

    #[test]
    fn test_call_tool_propagates_transport_error() {
        let transport =
            ScriptedTransport::new(vec![Err(BridgeError::transport("exited with 1: boom"))]);
        let mut client = McpClient::new(transport);
        let err = client.call_tool("foo", &Map::new()).unwrap_err();
        assert!(matches!(err, BridgeError::Transport { ref detail } if detail.contains("boom")));
    }

    #[test]
    fn test_list_tools() {
        let transport = ScriptedTransport::new(vec![Ok(json!({
            "result": {"tools": [
                {"name": "foo", "description": "Foo tool", "inputSchema": {"type": "object"}}
            ]}
        }))]);
        let mut client = McpClient::new(transport);
        let tools = client.list_tools().unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "foo");
        assert_eq!(client.transport.sent[0].method, "tools/list");
        assert!(client.transport.sent[0].params.is_none());
    }
}
