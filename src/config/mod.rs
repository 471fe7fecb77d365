//! Configuration system
//!
//! Loads and merges configuration from:
//! - Global config (~/.config/coil/config.toml)
//! - Project config (./coil.toml or .coil/config.toml)
//! - Environment variables (COIL_* and provider API keys)

use anyhow::Result;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::fs;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Database file override; defaults to the platform data directory.
    #[serde(default)]
    pub database_path: Option<PathBuf>,

    /// Provider credentials and endpoint overrides, keyed by vendor name.
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,

    /// Model settings for the three agent roles.
    #[serde(default)]
    pub agents: AgentRoles,

    /// Tool allow-lists: tool name to path prefixes granted without a
    /// permission prompt.
    #[serde(default)]
    pub permissions: PermissionRules,

    /// Operational limits for the inference loop and tools.
    #[serde(default)]
    pub limits: Limits,
}

#[derive(Clone, Serialize, Deserialize, Default)]
pub struct ProviderConfig {
    /// API key (can also come from the vendor's usual env var).
    pub api_key: Option<String>,
    /// Base URL override, e.g. for OpenAI-compatible gateways.
    pub base_url: Option<String>,
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("api_key", &self.api_key.as_ref().map(|_| "<REDACTED>"))
            .field("base_url", &self.base_url)
            .finish()
    }
}

/// Per-role model selection. The primary role drives user turns, the
/// delegated role drives sub-agent runs, the title role generates
/// session titles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRoles {
    #[serde(default = "default_primary")]
    pub primary: AgentModelConfig,
    #[serde(default = "default_delegated")]
    pub delegated: AgentModelConfig,
    #[serde(default = "default_title")]
    pub title: AgentModelConfig,
}

impl Default for AgentRoles {
    fn default() -> Self {
        Self {
            primary: default_primary(),
            delegated: default_delegated(),
            title: default_title(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentModelConfig {
    pub model: String,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub reasoning_effort: Option<String>,
}

fn default_primary() -> AgentModelConfig {
    AgentModelConfig {
        model: "claude-sonnet-4-20250514".to_string(),
        max_tokens: None,
        reasoning_effort: None,
    }
}

fn default_delegated() -> AgentModelConfig {
    AgentModelConfig {
        model: "claude-sonnet-4-20250514".to_string(),
        max_tokens: None,
        reasoning_effort: None,
    }
}

fn default_title() -> AgentModelConfig {
    AgentModelConfig {
        model: "claude-haiku-3-5-20241022".to_string(),
        max_tokens: Some(128),
        reasoning_effort: None,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PermissionRules {
    /// Tool name to path prefixes allowed without prompting.
    #[serde(default)]
    pub allow: HashMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Limits {
    /// Maximum inference-loop iterations per run.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Hard deadline for a tool call, seconds.
    #[serde(default = "default_tool_timeout")]
    pub tool_timeout_secs: u64,
    /// Default deadline for the shell tool, seconds.
    #[serde(default = "default_shell_timeout")]
    pub shell_timeout_secs: u64,
    /// Tool output cap, bytes.
    #[serde(default = "default_tool_output_limit")]
    pub tool_output_limit: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            tool_timeout_secs: default_tool_timeout(),
            shell_timeout_secs: default_shell_timeout(),
            tool_output_limit: default_tool_output_limit(),
        }
    }
}

fn default_max_iterations() -> u32 {
    200
}

fn default_tool_timeout() -> u64 {
    120
}

fn default_shell_timeout() -> u64 {
    30
}

fn default_tool_output_limit() -> usize {
    32 * 1024
}

/// One configuration source as read from disk. Every field is optional
/// so that a file which omits a section cannot clobber what a
/// lower-precedence source set.
#[derive(Debug, Clone, Deserialize, Default)]
struct ConfigFile {
    database_path: Option<PathBuf>,
    #[serde(default)]
    providers: HashMap<String, ProviderConfig>,
    #[serde(default)]
    agents: AgentRolesFile,
    #[serde(default)]
    permissions: PermissionRules,
    #[serde(default)]
    limits: LimitsFile,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct AgentRolesFile {
    primary: Option<AgentModelConfig>,
    delegated: Option<AgentModelConfig>,
    title: Option<AgentModelConfig>,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct LimitsFile {
    max_iterations: Option<u32>,
    tool_timeout_secs: Option<u64>,
    shell_timeout_secs: Option<u64>,
    tool_output_limit: Option<usize>,
}

impl Config {
    /// Load configuration from all sources (global, project, env).
    pub async fn load() -> Result<Self> {
        let mut config = Self::default();

        if let Some(global_path) = Self::global_config_path() {
            if global_path.exists() {
                let content = fs::read_to_string(&global_path).await?;
                let global: ConfigFile = toml::from_str(&content)?;
                config.apply_file(global);
            }
        }

        for name in ["coil.toml", ".coil/config.toml"] {
            let path = PathBuf::from(name);
            if path.exists() {
                let content = fs::read_to_string(&path).await?;
                let project: ConfigFile = toml::from_str(&content)?;
                config.apply_file(project);
            }
        }

        config.apply_env();
        Ok(config)
    }

    pub fn global_config_path() -> Option<PathBuf> {
        ProjectDirs::from("ai", "coil", "coil").map(|dirs| dirs.config_dir().join("config.toml"))
    }

    pub fn data_dir() -> Option<PathBuf> {
        ProjectDirs::from("ai", "coil", "coil").map(|dirs| dirs.data_dir().to_path_buf())
    }

    /// Resolved database path.
    pub fn database_path(&self) -> PathBuf {
        self.database_path.clone().unwrap_or_else(|| {
            Self::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("coil.db")
        })
    }

    pub fn provider(&self, name: &str) -> Option<&ProviderConfig> {
        self.providers.get(name)
    }

    /// Layer one source over this config. Only what the file actually
    /// specified overrides; omitted sections and fields are left alone.
    fn apply_file(&mut self, file: ConfigFile) {
        if file.database_path.is_some() {
            self.database_path = file.database_path;
        }
        self.providers.extend(file.providers);
        if let Some(primary) = file.agents.primary {
            self.agents.primary = primary;
        }
        if let Some(delegated) = file.agents.delegated {
            self.agents.delegated = delegated;
        }
        if let Some(title) = file.agents.title {
            self.agents.title = title;
        }
        for (tool, paths) in file.permissions.allow {
            self.permissions.allow.entry(tool).or_default().extend(paths);
        }
        if let Some(n) = file.limits.max_iterations {
            self.limits.max_iterations = n;
        }
        if let Some(n) = file.limits.tool_timeout_secs {
            self.limits.tool_timeout_secs = n;
        }
        if let Some(n) = file.limits.shell_timeout_secs {
            self.limits.shell_timeout_secs = n;
        }
        if let Some(n) = file.limits.tool_output_limit {
            self.limits.tool_output_limit = n;
        }
    }

    /// Apply environment variable overrides.
    fn apply_env(&mut self) {
        if let Ok(val) = std::env::var("ANTHROPIC_API_KEY") {
            self.providers
                .entry("anthropic".to_string())
                .or_default()
                .api_key
                .get_or_insert(val);
        }
        if let Ok(val) = std::env::var("OPENAI_API_KEY") {
            self.providers
                .entry("openai".to_string())
                .or_default()
                .api_key
                .get_or_insert(val);
        }
        if let Ok(val) = std::env::var("COIL_PRIMARY_MODEL") {
            self.agents.primary.model = val;
        }
        if let Ok(val) = std::env::var("COIL_DATABASE_PATH") {
            self.database_path = Some(PathBuf::from(val));
        }
    }
}
