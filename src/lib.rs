//! Command-line MCP clients for OpenAI and Gemini.
//!
//! A query goes to an LLM together with the tool catalogue of an MCP server;
//! tool calls the model makes are run on that server and fed back until the
//! model answers.

pub mod agent;
pub mod cli;
pub mod config;
pub mod error;
pub mod mcp;
pub mod vendors;

pub use error::{BridgeError, Result};
