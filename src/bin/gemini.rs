//! mcpbridge-gemini: answer a query with Gemini generateContent and MCP tools.

use mcpbridge::cli::{self, ProviderKind};

fn main() -> anyhow::Result<()> {
    cli::run(ProviderKind::Gemini)
}
