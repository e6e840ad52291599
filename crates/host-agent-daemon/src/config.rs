//! Daemon configuration.
//!
//! Loaded from a TOML file; every section and field has a default, so an
//! empty file (or none at all) yields a working agent.

use std::{
    collections::BTreeMap,
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use host_agent_executor::ExecutorConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration file error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Validation(String),
}

/// Top-level agent configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub auth: AuthConfig,
    pub executor: ExecutorSection,
    pub snapshots: SnapshotsConfig,
    pub mutation: MutationConfig,
    pub apps: AppsConfig,
    pub monitor: MonitorConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    /// Returns an error if the TOML is invalid or fails validation.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path`, or the per-user config file when it exists, or defaults.
    ///
    /// # Errors
    /// Returns an error if an explicit or discovered file is unusable.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::from_file(path),
            None => match default_config_path().filter(|p| p.is_file()) {
                Some(path) => Self::from_file(&path),
                None => Ok(Self::default()),
            },
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.server.bind == self.server.ws_bind {
            return Err(ConfigError::Validation(
                "server.bind and server.ws_bind must differ".to_string(),
            ));
        }
        if self.executor.max_concurrent == 0 {
            return Err(ConfigError::Validation(
                "executor.max_concurrent must be at least 1".to_string(),
            ));
        }
        if self.executor.default_timeout_ms == 0 || self.executor.max_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "executor timeouts must be positive".to_string(),
            ));
        }
        if let Some(token) = self.auth.tokens.iter().find(|t| t.trim().is_empty()) {
            return Err(ConfigError::Validation(format!(
                "auth.tokens contains an empty token ({token:?})"
            )));
        }
        for capture in &self.snapshots.captures {
            if capture.name.trim().is_empty() || capture.command.trim().is_empty() {
                return Err(ConfigError::Validation(
                    "snapshot captures need a name and a command".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Data directory, falling back to the platform's local data dir.
    #[must_use]
    pub fn data_dir(&self) -> PathBuf {
        self.snapshots.data_dir.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .map_or_else(|| PathBuf::from(".host-agent"), |d| d.join("host-agent"))
        })
    }
}

/// `$XDG_CONFIG_HOME/host-agent/config.toml` or the platform equivalent.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("host-agent").join("config.toml"))
}

/// Listener addresses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Request/response API.
    pub bind: SocketAddr,
    /// WebSocket push channel.
    pub ws_bind: SocketAddr,
    /// Allow cross-origin requests from any origin.
    pub cors: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 8080)),
            ws_bind: SocketAddr::from(([0, 0, 0, 0], 8081)),
            cors: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    /// Filter used when `RUST_LOG` is unset.
    pub level: String,
    /// Lines retained for get-debug-logs.
    pub buffer_lines: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            buffer_lines: 2000,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AuthConfig {
    /// Operator-provided tokens accepted in addition to issued ones.
    pub tokens: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExecutorSection {
    /// Deadline for commands the agent runs itself (captures, catalog,
    /// mutation hooks).
    pub default_timeout_ms: u64,
    /// Largest deadline accepted from execute-command.
    pub max_timeout_ms: u64,
    pub max_concurrent: usize,
    pub max_output_bytes: usize,
    pub use_shell: bool,
}

impl Default for ExecutorSection {
    fn default() -> Self {
        let defaults = ExecutorConfig::default();
        Self {
            default_timeout_ms: 30_000,
            max_timeout_ms: 600_000,
            max_concurrent: defaults.max_concurrent,
            max_output_bytes: defaults.max_output_bytes,
            use_shell: defaults.use_shell,
        }
    }
}

impl ExecutorSection {
    #[must_use]
    pub const fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    #[must_use]
    pub const fn max_timeout(&self) -> Duration {
        Duration::from_millis(self.max_timeout_ms)
    }

    #[must_use]
    pub const fn to_executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            max_concurrent: self.max_concurrent,
            max_output_bytes: self.max_output_bytes,
            use_shell: self.use_shell,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SnapshotsConfig {
    pub data_dir: Option<PathBuf>,
    /// Capture the host properties table.
    pub properties: bool,
    /// Capture the app catalog listing as `packages`.
    pub packages: bool,
    /// Read-only command captures.
    pub captures: Vec<CaptureConfig>,
}

impl Default for SnapshotsConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            properties: true,
            packages: true,
            captures: Vec::new(),
        }
    }
}

/// `[[snapshots.captures]]` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CaptureConfig {
    pub name: String,
    pub command: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MutationConfig {
    /// Executors keyed by payload language tag.
    pub languages: BTreeMap<String, LanguageConfig>,
}

/// `[mutation.languages.<tag>]` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
pub enum LanguageConfig {
    CompileLoad {
        compile: String,
        #[serde(default)]
        load: Option<String>,
        #[serde(default)]
        source_file: Option<String>,
        #[serde(default)]
        artifact_file: Option<String>,
    },
    BytePatch {
        patch: String,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AppsConfig {
    /// Command listing installed apps, one per line.
    pub list: Option<String>,
    /// Template applying a modification (`{package}`, `{modification}`).
    pub modify: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MonitorConfig {
    /// Seconds between `system.info` events; 0 disables the heartbeat.
    pub heartbeat_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self { heartbeat_secs: 30 }
    }
}

impl MonitorConfig {
    #[must_use]
    pub const fn heartbeat(&self) -> Option<Duration> {
        if self.heartbeat_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.heartbeat_secs))
        }
    }
}
