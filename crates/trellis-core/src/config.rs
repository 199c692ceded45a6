use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, TrellisError};
use crate::types::ModelTier;

/// Top-level Trellis configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub threads: ThreadConfig,
    #[serde(default)]
    pub profiles: ProfilesConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    /// Runtime logging configuration.
    #[serde(default)]
    pub log: Option<LogConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum node dispatches per playbook run.
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
    /// Maximum nesting of sub-workflow invocations.
    #[serde(default = "default_max_call_depth")]
    pub max_call_depth: usize,
    /// Directory scanned for playbook documents (relative to the workspace).
    #[serde(default = "default_playbook_dir")]
    pub playbook_dir: String,
    #[serde(default = "default_workspace")]
    pub workspace: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            max_call_depth: default_max_call_depth(),
            playbook_dir: default_playbook_dir(),
            workspace: default_workspace(),
        }
    }
}

fn default_max_steps() -> usize { 256 }
fn default_max_call_depth() -> usize { 8 }
fn default_playbook_dir() -> String { "playbooks".to_string() }
fn default_workspace() -> String { "~/.trellis".to_string() }

/// Nested-session budgeting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadConfig {
    /// Deepest allowed nested session (root = 0).
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
    /// Fraction of the parent window granted when a node declares none.
    #[serde(default = "default_window_ratio")]
    pub default_window_ratio: f64,
    /// Window budget of every root thread, in tokens.
    #[serde(default = "default_root_window_tokens")]
    pub root_window_tokens: u64,
    /// Raw exchanges shown when an anchor renders in full.
    #[serde(default = "default_anchor_recent_exchanges")]
    pub anchor_recent_exchanges: usize,
}

impl Default for ThreadConfig {
    fn default() -> Self {
        Self {
            max_depth: default_max_depth(),
            default_window_ratio: default_window_ratio(),
            root_window_tokens: default_root_window_tokens(),
            anchor_recent_exchanges: default_anchor_recent_exchanges(),
        }
    }
}

fn default_max_depth() -> usize { 3 }
fn default_window_ratio() -> f64 { 0.8 }
fn default_root_window_tokens() -> u64 { 100_000 }
fn default_anchor_recent_exchanges() -> usize { 4 }

/// Per-deployment tuning of the closed profile set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfilesConfig {
    #[serde(default)]
    pub conversation: Option<ProfileOverride>,
    #[serde(default)]
    pub router: Option<ProfileOverride>,
    #[serde(default)]
    pub worker: Option<ProfileOverride>,
    #[serde(default)]
    pub worker_light: Option<ProfileOverride>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfileOverride {
    #[serde(default)]
    pub tier: Option<ModelTier>,
    /// Number of trailing history messages (router only).
    #[serde(default)]
    pub history_messages: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// SQLite database path. Default: <workspace>/memory.db
    #[serde(default)]
    pub database: Option<String>,
    /// Long-term entries surfaced by the `conversation` profile.
    #[serde(default = "default_recall_limit")]
    pub recall_limit: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            database: None,
            recall_limit: default_recall_limit(),
        }
    }
}

fn default_recall_limit() -> usize { 8 }

/// JSONL runtime logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Enable runtime logging (default: true when section is present).
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// Directory for log files. Default: <workspace>/logs
    #[serde(default)]
    pub log_dir: Option<String>,
    /// Verbosity: 1=run summary, 2=per-node, 3=everything.
    #[serde(default = "default_log_level")]
    pub level: u8,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: None,
            level: default_log_level(),
        }
    }
}

fn default_log_enabled() -> bool { true }
fn default_log_level() -> u8 { 2 }

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| TrellisError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        let config: Self =
            toml::from_str(&expanded).map_err(|e| TrellisError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot honor.
    pub fn validate(&self) -> Result<()> {
        let ratio = self.threads.default_window_ratio;
        if !(ratio > 0.0 && ratio <= 1.0) {
            return Err(TrellisError::Config(format!(
                "threads.default_window_ratio must be in (0, 1], got {}",
                ratio
            )));
        }
        if self.engine.max_steps == 0 {
            return Err(TrellisError::Config("engine.max_steps must be positive".into()));
        }
        Ok(())
    }

    /// Resolve the workspace directory (expand ~).
    pub fn workspace_dir(&self) -> PathBuf {
        expand_home(&self.engine.workspace)
    }

    /// Resolve the playbook directory against the workspace.
    pub fn playbook_dir(&self) -> PathBuf {
        let dir = expand_home(&self.engine.playbook_dir);
        if dir.is_absolute() {
            dir
        } else {
            self.workspace_dir().join(dir)
        }
    }

    /// Resolve the memory database path.
    pub fn memory_db_path(&self) -> PathBuf {
        match self.memory.database {
            Some(ref path) => expand_home(path),
            None => self.workspace_dir().join("memory.db"),
        }
    }

    /// Resolve the JSONL log directory, if logging is enabled.
    pub fn log_dir(&self) -> Option<PathBuf> {
        let log = self.log.as_ref().filter(|l| l.enabled)?;
        Some(match log.log_dir {
            Some(ref dir) => expand_home(dir),
            None => self.workspace_dir().join("logs"),
        })
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs_home() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
