//! Command-line entry shared by the provider binaries.

use crate::agent::{run_loop, AgentLoopConfig, AgentOutcome, StopReason};
use crate::config::{AgentConfig, Config, ForwardedEnv, ServerMode};
use crate::mcp::{McpClient, McpTransport, ProcessTransport, SessionTransport};
use crate::vendors::gemini::GeminiProvider;
use crate::vendors::openai::OpenAiProvider;
use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Ask an LLM a question, letting it call tools from an MCP server.
#[derive(Parser, Debug)]
#[command(version, about)]
pub struct Args {
    /// Model override (defaults to OPENAI_MODEL / GEMINI_MODEL, then config)
    #[arg(long)]
    pub model: Option<String>,

    /// Maximum model requests before giving up
    #[arg(long, env = "MCPBRIDGE_MAX_TURNS")]
    pub max_turns: Option<usize>,

    /// Config file to use instead of the default search path
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// How to drive the MCP server: oneshot (process per call) or session
    #[arg(long, value_parser = parse_mode)]
    pub mode: Option<ServerMode>,

    /// MCP server command line, e.g. "node dist/server.js"
    #[arg(long, env = "MCP_SERVER_COMMAND")]
    pub server_command: Option<String>,

    /// Log progress to stderr
    #[arg(short, long)]
    pub verbose: bool,

    /// Log requests and tool results to stderr
    #[arg(long)]
    pub debug: bool,

    /// The question; words are joined with spaces
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub query: Vec<String>,
}

fn parse_mode(s: &str) -> Result<ServerMode, String> {
    ServerMode::from_str(s).ok_or_else(|| format!("unknown mode '{}' (oneshot, session)", s))
}

impl Args {
    /// Joined query words, or `default` when none were given
    pub fn query_or(&self, default: &str) -> String {
        let joined = self.query.join(" ");
        if joined.trim().is_empty() {
            default.to_string()
        } else {
            joined
        }
    }
}

/// Which LLM vendor a binary talks to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    OpenAi,
    Gemini,
}

impl ProviderKind {
    pub fn backend_name(&self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Gemini => "gemini",
        }
    }

    pub fn model_env(&self) -> &'static str {
        match self {
            Self::OpenAi => "OPENAI_MODEL",
            Self::Gemini => "GEMINI_MODEL",
        }
    }

    pub fn default_query(&self) -> &'static str {
        match self {
            Self::OpenAi => "List my 5 most recent open P1 incidents",
            Self::Gemini => "Show me critical incidents opened in the last 24 hours",
        }
    }
}

/// Initialize stderr logging. `RUST_LOG` wins over the flags.
pub fn init_logging(verbose: bool, debug: bool) {
    let default = if debug {
        "debug"
    } else if verbose {
        "info"
    } else {
        "warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Load config files, then apply command-line and environment overrides.
pub fn load_config(args: &Args) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => {
            let mut config = Config::with_builtin_backends();
            config.merge(Config::load_from(path)?);
            config
        }
        None => Config::load().context("failed to load configuration")?,
    };
    apply_overrides(&mut config, args)?;
    Ok(config)
}

fn apply_overrides(config: &mut Config, args: &Args) -> Result<()> {
    if let Some(line) = &args.server_command {
        config.server_mut().set_command_line(line)?;
    }
    if let Some(mode) = args.mode {
        config.server_mut().mode = mode;
    }
    if let Some(max_turns) = args.max_turns {
        config.agent = Some(AgentConfig { max_turns });
    }
    Ok(())
}

/// Build the configured MCP transport
fn connect(config: &Config) -> Result<Box<dyn McpTransport>> {
    let server = config.server();
    let command = server.server_command()?;
    let env = ForwardedEnv::capture(&server.forward_env_names());
    info!(
        program = %command.program,
        mode = server.mode.as_str(),
        forwarded = env.len(),
        "connecting to MCP server"
    );

    let transport: Box<dyn McpTransport> = match server.mode {
        ServerMode::Oneshot => Box::new(ProcessTransport::new(command, env)),
        ServerMode::Session => Box::new(
            SessionTransport::spawn(&command, &env, Duration::from_millis(server.timeout_ms))
                .context("failed to start MCP session")?,
        ),
    };
    Ok(transport)
}

fn finish<D>(outcome: AgentOutcome<D>) -> String {
    match &outcome.stop {
        StopReason::Answered => {}
        StopReason::SoftStop { reason } => warn!(reason = %reason, "no answer from model"),
        StopReason::TurnLimit => warn!(
            turns = outcome.stats.model_requests,
            "stopped at turn limit without an answer"
        ),
    }
    info!(
        model_requests = outcome.stats.model_requests,
        tool_calls = outcome.stats.tool_calls,
        input_tokens = outcome.stats.input_tokens,
        output_tokens = outcome.stats.output_tokens,
        "run stats"
    );
    outcome.answer
}

/// Answer one query with the given provider
pub fn run_query(kind: ProviderKind, config: &Config, args: &Args, query: &str) -> Result<String> {
    let mut backend = config.backend(kind.backend_name())?.clone();
    if let Some(model) = args
        .model
        .clone()
        .or_else(|| std::env::var(kind.model_env()).ok())
    {
        backend.model = model;
    }
    let api_key = backend
        .resolve_api_key()
        .with_context(|| format!("missing API key for {}", kind.backend_name()))?;
    let loop_config = AgentLoopConfig::default().with_max_turns(config.max_turns()?);

    let mut tools = McpClient::new(connect(config)?);

    let answer = match kind {
        ProviderKind::OpenAi => {
            let mut provider = OpenAiProvider::new(&backend, api_key)?;
            info!(model = provider.model(), "using openai");
            finish(run_loop(&mut provider, &mut tools, &loop_config, query)?)
        }
        ProviderKind::Gemini => {
            let mut provider = GeminiProvider::new(&backend, api_key)?;
            info!(model = provider.model(), "using gemini");
            finish(run_loop(&mut provider, &mut tools, &loop_config, query)?)
        }
    };
    Ok(answer)
}

/// Entry point for the provider binaries
pub fn run(kind: ProviderKind) -> Result<()> {
    // A missing .env is fine
    let _ = dotenvy::dotenv();

    let args = Args::parse();
    init_logging(args.verbose, args.debug);

    let config = load_config(&args)?;
    let query = args.query_or(kind.default_query());

    println!("Query: {}\n", query);
    let answer = run_query(kind, &config, &args, &query)?;
    println!("Answer:\n{}", answer);
    Ok(())
}
