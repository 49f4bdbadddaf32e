use crate::error::{BridgeError, Result};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

/// Default maximum model requests per run
pub const DEFAULT_MAX_TURNS: usize = 12;

/// Credential and feature-flag variables forwarded to the MCP server subprocess
pub const DEFAULT_FORWARD_ENV: &[&str] = &[
    "SERVICENOW_INSTANCE_URL",
    "SERVICENOW_AUTH_METHOD",
    "SERVICENOW_BASIC_USERNAME",
    "SERVICENOW_BASIC_PASSWORD",
    "SERVICENOW_CLIENT_ID",
    "SERVICENOW_CLIENT_SECRET",
    "SERVICENOW_USERNAME",
    "SERVICENOW_PASSWORD",
    "WRITE_ENABLED",
    "MCP_TOOL_PACKAGE",
    "NOW_ASSIST_ENABLED",
    "ATF_ENABLED",
    "SCRIPTING_ENABLED",
];

/// Allow-listed environment captured once at startup and handed to the transport.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ForwardedEnv {
    vars: BTreeMap<String, String>,
}

impl ForwardedEnv {
    /// Capture the allow-listed names from the process environment
    pub fn capture<S: AsRef<str>>(names: &[S]) -> Self {
        Self::capture_with(names, |name| std::env::var(name).ok())
    }

    /// Capture using an arbitrary lookup; unset names are skipped.
    pub fn capture_with<S, F>(names: &[S], lookup: F) -> Self
    where
        S: AsRef<str>,
        F: Fn(&str) -> Option<String>,
    {
        let vars = names
            .iter()
            .filter_map(|name| {
                let name = name.as_ref();
                lookup(name).map(|value| (name.to_string(), value))
            })
            .collect();
        Self { vars }
    }

    pub fn from_vars(vars: BTreeMap<String, String>) -> Self {
        Self { vars }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.vars.iter()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}

/// How the MCP server subprocess is driven
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerMode {
    /// One process per request
    #[default]
    Oneshot,
    /// One long-lived process, requests correlated by id
    Session,
}

impl ServerMode {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "oneshot" | "one-shot" | "process" => Some(Self::Oneshot),
            "session" | "persistent" => Some(Self::Session),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Oneshot => "oneshot",
            Self::Session => "session",
        }
    }
}

/// Executable, arguments and working directory of the tool server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerCommand {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
}

/// Configuration for the MCP server
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct McpServerConfig {
    #[serde(default = "default_command")]
    pub command: String,
    #[serde(default = "default_args")]
    pub args: Vec<String>,
    #[serde(default = "default_cwd")]
    pub cwd: String,
    #[serde(default)]
    pub mode: ServerMode,
    /// Per-response wait in session mode
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Extra variable names forwarded on top of `DEFAULT_FORWARD_ENV`
    #[serde(default)]
    pub forward_env: Vec<String>,
}

fn default_command() -> String {
    "node".to_string()
}

fn default_args() -> Vec<String> {
    vec!["dist/server.js".to_string()]
}

fn default_cwd() -> String {
    ".".to_string()
}

fn default_timeout_ms() -> u64 {
    30_000
}

impl Default for McpServerConfig {
    fn default() -> Self {
        Self {
            command: default_command(),
            args: default_args(),
            cwd: default_cwd(),
            mode: ServerMode::default(),
            timeout_ms: default_timeout_ms(),
            forward_env: Vec::new(),
        }
    }
}

impl McpServerConfig {
    pub fn server_command(&self) -> Result<ServerCommand> {
        if self.command.trim().is_empty() {
            return Err(BridgeError::Config("MCP server command is empty".to_string()));
        }
        Ok(ServerCommand {
            program: self.command.clone(),
            args: self.args.clone(),
            cwd: PathBuf::from(&self.cwd),
        })
    }

    /// Replace command and args from a shell-style command line (e.g. `MCP_SERVER_COMMAND`)
    pub fn set_command_line(&mut self, line: &str) -> Result<()> {
        let mut words = shell_words::split(line)
            .map_err(|e| BridgeError::Config(format!("invalid server command '{}': {}", line, e)))?;
        if words.is_empty() {
            return Err(BridgeError::Config("MCP server command is empty".to_string()));
        }
        self.command = words.remove(0);
        self.args = words;
        Ok(())
    }

    /// Default allow-list plus configured extras, deduplicated
    pub fn forward_env_names(&self) -> Vec<String> {
        let mut names: Vec<String> = DEFAULT_FORWARD_ENV.iter().map(|s| s.to_string()).collect();
        for extra in &self.forward_env {
            if !names.contains(extra) {
                names.push(extra.clone());
            }
        }
        names
    }
}

/// Configuration for the agent loop
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AgentConfig {
    #[serde(default = "default_max_turns")]
    pub max_turns: usize,
}

fn default_max_turns() -> usize {
    DEFAULT_MAX_TURNS
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_turns: default_max_turns(),
        }
    }
}

/// Configuration for a single backend (API provider)
#[derive(Debug, Clone, Deserialize, Default)]
pub struct BackendConfig {
    pub base_url: String,
    pub model: String,
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
}

impl BackendConfig {
    /// Resolve the API key from config or environment
    pub fn resolve_api_key(&self) -> Result<SecretString> {
        self.resolve_api_key_with(|name| std::env::var(name).ok())
    }

    pub fn resolve_api_key_with<F>(&self, lookup: F) -> Result<SecretString>
    where
        F: Fn(&str) -> Option<String>,
    {
        // Direct key takes priority
        if let Some(key) = &self.api_key {
            return Ok(SecretString::from(key.clone()));
        }

        if let Some(env_var) = &self.api_key_env {
            if let Some(key) = lookup(env_var).filter(|k| !k.is_empty()) {
                return Ok(SecretString::from(key));
            }
            return Err(BridgeError::Config(format!("{} is not set", env_var)));
        }

        Err(BridgeError::Config(
            "no api_key or api_key_env configured".to_string(),
        ))
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub backends: HashMap<String, BackendConfig>,
    #[serde(default)]
    pub server: Option<McpServerConfig>,
    #[serde(default)]
    pub agent: Option<AgentConfig>,
}

impl Config {
    /// Create config with built-in default backends for both providers
    pub fn with_builtin_backends() -> Self {
        let mut backends = HashMap::new();

        backends.insert(
            "openai".to_string(),
            BackendConfig {
                base_url: "https://api.openai.com/v1".to_string(),
                model: "gpt-4o".to_string(),
                api_key_env: Some("OPENAI_API_KEY".to_string()),
                api_key: None,
            },
        );

        backends.insert(
            "gemini".to_string(),
            BackendConfig {
                base_url: "https://generativelanguage.googleapis.com".to_string(),
                model: "gemini-1.5-pro".to_string(),
                api_key_env: Some("GEMINI_API_KEY".to_string()),
                api_key: None,
            },
        );

        Config {
            backends,
            server: None,
            agent: None,
        }
    }

    /// Load configuration from default paths
    /// Priority: local (.mcpbridge/config.local.toml) > project (.mcpbridge/config.toml) > user (~/.mcpbridge/config.toml)
    pub fn load() -> Result<Self> {
        let mut config = Self::with_builtin_backends();

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".mcpbridge").join("config.toml");
            if user_config.exists() {
                config.merge(Self::load_from(&user_config)?);
            }
        }

        let project_config = Path::new(".mcpbridge").join("config.toml");
        if project_config.exists() {
            config.merge(Self::load_from(&project_config)?);
        }

        // Should be gitignored
        let local_config = Path::new(".mcpbridge").join("config.local.toml");
        if local_config.exists() {
            config.merge(Self::load_from(&local_config)?);
        }

        Ok(config)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            BridgeError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        toml::from_str(&content)
            .map_err(|e| BridgeError::Config(format!("invalid {}: {}", path.display(), e)))
    }

    /// Merge another config into this one (other takes priority).
    /// Backends are replaced by name; server and agent sections are replaced wholesale.
    pub fn merge(&mut self, other: Config) {
        for (name, backend) in other.backends {
            self.backends.insert(name, backend);
        }
        if other.server.is_some() {
            self.server = other.server;
        }
        if other.agent.is_some() {
            self.agent = other.agent;
        }
    }

    pub fn backend(&self, name: &str) -> Result<&BackendConfig> {
        self.backends
            .get(name)
            .ok_or_else(|| BridgeError::Config(format!("no backend named '{}'", name)))
    }

    pub fn server_mut(&mut self) -> &mut McpServerConfig {
        self.server.get_or_insert_with(McpServerConfig::default)
    }

    pub fn server(&self) -> McpServerConfig {
        self.server.clone().unwrap_or_default()
    }

    /// Effective max turns; zero is rejected since the loop must ask the model at least once
    pub fn max_turns(&self) -> Result<usize> {
        let max_turns = self
            .agent
            .as_ref()
            .map(|a| a.max_turns)
            .unwrap_or(DEFAULT_MAX_TURNS);
        if max_turns == 0 {
            return Err(BridgeError::Config("max_turns must be at least 1".to_string()));
        }
        Ok(max_turns)
    }
}
