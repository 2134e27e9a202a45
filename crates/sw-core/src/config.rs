use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level configuration loaded from `~/.swarmyard/config.toml`.
///
/// Every section is optional in the file; missing sections and fields fall
/// back to the defaults documented on each struct.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub worktrees: WorktreesConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub tasks: TasksConfig,
    #[serde(default)]
    pub tracker: TrackerConfig,
    #[serde(default)]
    pub watch: WatchConfig,
    #[serde(default)]
    pub setup: SetupConfig,
}

impl Config {
    /// Load config from `~/.swarmyard/config.toml`, falling back to
    /// defaults when the file does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(path)
        } else {
            let cfg = Config::default();
            cfg.validate()?;
            Ok(cfg)
        }
    }

    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        Self::from_toml(&text)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let cfg: Config = toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        self.validate()?;
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Semantic validation for settings that are not fully expressible via type checks.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.worktrees.validate()?;
        self.watch.validate()?;
        if self.tasks.timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "tasks.timeout_secs must be greater than zero".into(),
            ));
        }
        if self.tracker.max_attempts == 0 {
            return Err(ConfigError::Validation(
                "tracker.max_attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Directory holding the session and worktree stores.
    pub fn data_dir(&self) -> PathBuf {
        self.general
            .data_dir
            .as_deref()
            .map(expand_home)
            .unwrap_or_else(default_data_dir)
    }

    /// Root directory under which worktrees are created.
    pub fn worktrees_root(&self) -> PathBuf {
        self.worktrees
            .root
            .as_deref()
            .map(expand_home)
            .unwrap_or_else(|| self.data_dir().join("worktrees"))
    }

    pub fn sessions_store_path(&self) -> PathBuf {
        self.data_dir().join("sessions.json")
    }

    pub fn worktrees_store_path(&self) -> PathBuf {
        self.data_dir().join("worktrees.json")
    }

    fn default_path() -> PathBuf {
        default_data_dir().join("config.toml")
    }
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".swarmyard")
}

/// Expand a leading `~/` to the user's home directory.
fn expand_home(raw: &str) -> PathBuf {
    match raw.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(rest),
        None => Path::new(raw).to_path_buf(),
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("validation: {0}")]
    Validation(String),
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Human,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_format: LogFormat,
    /// Defaults to `~/.swarmyard`.
    #[serde(default)]
    pub data_dir: Option<String>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::default(),
            data_dir: None,
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorktreesConfig {
    /// Defaults to `<data_dir>/worktrees`.
    #[serde(default)]
    pub root: Option<String>,
    #[serde(default = "default_install_command")]
    pub install_command: String,
    #[serde(default = "default_install_timeout_secs")]
    pub install_timeout_secs: u64,
    #[serde(default = "default_branch_slug_max_len")]
    pub branch_slug_max_len: usize,
}

impl Default for WorktreesConfig {
    fn default() -> Self {
        Self {
            root: None,
            install_command: default_install_command(),
            install_timeout_secs: default_install_timeout_secs(),
            branch_slug_max_len: default_branch_slug_max_len(),
        }
    }
}

impl WorktreesConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.install_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "worktrees.install_timeout_secs must be greater than zero".into(),
            ));
        }
        if self.branch_slug_max_len == 0 {
            return Err(ConfigError::Validation(
                "worktrees.branch_slug_max_len must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

fn default_install_command() -> String {
    "npm install".into()
}
fn default_install_timeout_secs() -> u64 {
    120
}
fn default_branch_slug_max_len() -> usize {
    50
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_runtime_url")]
    pub base_url: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            base_url: default_runtime_url(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

fn default_runtime_url() -> String {
    "http://127.0.0.1:4096".into()
}
fn default_request_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TasksConfig {
    #[serde(default = "default_tasks_bin")]
    pub bin: String,
    #[serde(default = "default_cli_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for TasksConfig {
    fn default() -> Self {
        Self {
            bin: default_tasks_bin(),
            timeout_secs: default_cli_timeout_secs(),
        }
    }
}

fn default_tasks_bin() -> String {
    "bd".into()
}
fn default_cli_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerConfig {
    #[serde(default = "default_tracker_bin")]
    pub bin: String,
    #[serde(default = "default_workflow_label")]
    pub workflow_label: String,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    #[serde(default = "default_cli_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            bin: default_tracker_bin(),
            workflow_label: default_workflow_label(),
            max_attempts: default_max_attempts(),
            base_backoff_ms: default_base_backoff_ms(),
            timeout_secs: default_cli_timeout_secs(),
        }
    }
}

fn default_tracker_bin() -> String {
    "gh".into()
}
fn default_workflow_label() -> String {
    "swarmyard:planning".into()
}
fn default_max_attempts() -> u32 {
    3
}
fn default_base_backoff_ms() -> u64 {
    500
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchConfig {
    #[serde(default = "default_progress_interval_secs")]
    pub progress_interval_secs: u64,
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            progress_interval_secs: default_progress_interval_secs(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
        }
    }
}

impl WatchConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.progress_interval_secs == 0 || self.heartbeat_interval_secs == 0 {
            return Err(ConfigError::Validation(
                "watch intervals must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

fn default_progress_interval_secs() -> u64 {
    5
}
fn default_heartbeat_interval_secs() -> u64 {
    15
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetupConfig {
    /// Runtime command sent to a fresh planning session.
    #[serde(default = "default_seed_command")]
    pub seed_command: String,
    /// Runtime command that kicks off a swarm for an epic.
    #[serde(default = "default_swarm_command")]
    pub swarm_command: String,
}

impl Default for SetupConfig {
    fn default() -> Self {
        Self {
            seed_command: default_seed_command(),
            swarm_command: default_swarm_command(),
        }
    }
}

fn default_seed_command() -> String {
    "plan".into()
}
fn default_swarm_command() -> String {
    "swarm".into()
}
