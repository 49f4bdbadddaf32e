//! mcpbridge-openai: answer a query with OpenAI chat completions and MCP tools.

use mcpbridge::cli::{self, ProviderKind};

fn main() -> anyhow::Result<()> {
    cli::run(ProviderKind::OpenAi)
}
