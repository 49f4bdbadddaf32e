//! Error taxonomy shared by the bridge, the adapters and the agent loop.

use thiserror::Error;

/// Errors surfaced by mcpbridge. Every variant is fatal for the current run.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The tool server could not be spawned, exited non-zero, produced
    /// unparsable output, or answered with a JSON-RPC error.
    #[error("MCP server error: {detail}")]
    Transport { detail: String },

    /// A catalogue entry is missing `name`, `description` or `inputSchema`.
    #[error("malformed tool descriptor at index {index}: {reason}")]
    MalformedTool { index: usize, reason: String },

    /// A tool call's argument payload is not a JSON object.
    #[error("invalid arguments for tool '{tool}': {reason}")]
    ArgumentParse { tool: String, reason: String },

    /// The LLM provider request failed or returned an undecodable body.
    #[error("{provider} request failed: {detail}")]
    Provider { provider: String, detail: String },

    #[error("configuration error: {0}")]
    Config(String),
}

impl BridgeError {
    pub fn transport(detail: impl Into<String>) -> Self {
        Self::Transport {
            detail: detail.into(),
        }
    }

    pub fn provider(provider: &str, detail: impl Into<String>) -> Self {
        Self::Provider {
            provider: provider.to_string(),
            detail: detail.into(),
        }
    }
}

pub type Result<T, E = BridgeError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_display_embeds_detail() {
        let err = BridgeError::transport("exited with status 1: auth failed");
        assert_eq!(
            err.to_string(),
            "MCP server error: exited with status 1: auth failed"
        );
    }

    #[test]
    fn test_argument_parse_display_names_tool() {
        let err = BridgeError::ArgumentParse {
            tool: "get_incident".to_string(),
            reason: "expected value at line 1 column 1".to_string(),
        };
        assert!(err.to_string().contains("get_incident"));
    }
}
