//! Daemon configuration.
//!
//! Loaded from a TOML file (`$XDG_CONFIG_HOME/sbx/sbxd.toml` by default),
//! then overridden by environment variables:
//!
//! | variable             | field            |
//! |----------------------|------------------|
//! | `SBX_SOCKET`         | `socket_path`    |
//! | `SBX_RESTART_POLICY` | `restart_policy` |
//! | `SBX_WORKER`         | `worker.command` |
//!
//! A missing file is not an error; every field has a default.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use sbx_core::{ModuleInfo, RestartPolicy};

/// Default socket path
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/sbxd.sock";

/// Default worker executable, resolved through `PATH`
pub const DEFAULT_WORKER_COMMAND: &str = "sbx-worker";

const DEFAULT_COMMAND_BUFFER: usize = 64;
const DEFAULT_READY_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;

/// Top-level manager configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// What happens after a worker dies
    pub restart_policy: RestartPolicy,

    /// Release a worker once none of its modules is loaded or loading
    pub unbind_when_idle: bool,

    /// Queue depth of each per-client actor
    pub command_buffer: usize,

    /// Control socket location
    pub socket_path: PathBuf,

    pub worker: WorkerConfig,

    pub policy: PolicyConfig,

    /// Installed modules
    pub modules: Vec<ModuleInfo>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            restart_policy: RestartPolicy::Allow,
            unbind_when_idle: true,
            command_buffer: DEFAULT_COMMAND_BUFFER,
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            worker: WorkerConfig::default(),
            policy: PolicyConfig::default(),
            modules: Vec::new(),
        }
    }
}

/// How worker processes are launched and timed out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Program followed by its arguments
    pub command: Vec<String>,

    /// How long a fresh worker has to answer `initialize`
    pub ready_timeout_ms: u64,

    /// How long any other request may take
    pub request_timeout_ms: u64,
}

impl WorkerConfig {
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            command: vec![DEFAULT_WORKER_COMMAND.to_string()],
            ready_timeout_ms: DEFAULT_READY_TIMEOUT_MS,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
        }
    }
}

/// Inputs of the package policy checker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Packages that may never get a sandbox
    pub denied_packages: Vec<String>,
}

impl ManagerConfig {
    /// Parses configuration from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from `path`, falling back to defaults if the file
    /// does not exist.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(text) => Self::from_toml_str(&text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(ConfigError::Read {
                path: path.to_path_buf(),
                error: e.to_string(),
            }),
        }
    }

    /// Default config file location.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("sbx").join("sbxd.toml"))
    }

    /// Applies `SBX_*` environment overrides.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(socket) = lookup("SBX_SOCKET") {
            self.socket_path = PathBuf::from(socket);
        }

        if let Some(policy) = lookup("SBX_RESTART_POLICY") {
            self.restart_policy = policy.parse().map_err(|e: sbx_core::DomainError| {
                ConfigError::InvalidValue {
                    key: "SBX_RESTART_POLICY".to_string(),
                    reason: e.to_string(),
                }
            })?;
        }

        if let Some(worker) = lookup("SBX_WORKER") {
            self.worker.command = worker.split_whitespace().map(str::to_string).collect();
        }

        self.validate()
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.worker.command.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "worker.command".to_string(),
                reason: "must name a program".to_string(),
            });
        }

        if self.command_buffer == 0 {
            return Err(ConfigError::InvalidValue {
                key: "command_buffer".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }

        Ok(())
    }
}

/// Errors that can occur while loading configuration.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {error}")]
    Read { path: PathBuf, error: String },

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Invalid value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_empty_file_gives_defaults() {
        let config = ManagerConfig::from_toml_str("").unwrap();
        assert_eq!(config, ManagerConfig::default());
        assert_eq!(config.restart_policy, RestartPolicy::Allow);
        assert!(config.unbind_when_idle);
        assert_eq!(config.socket_path, PathBuf::from(DEFAULT_SOCKET_PATH));
    }

    #[test]
    fn test_full_file() {
        let text = r#"
            restart_policy = "forbid"
            unbind_when_idle = false
            socket_path = "/run/sbx/control.sock"

            [worker]
            command = ["/usr/libexec/sbx-worker", "--quiet"]
            ready_timeout_ms = 250

            [policy]
            denied_packages = ["com.evil"]

            [[modules]]
            name = "ads"
            provider = "libads.so"
            version = "3.1"
        "#;

        let config = ManagerConfig::from_toml_str(text).unwrap();
        assert_eq!(config.restart_policy, RestartPolicy::Forbid);
        assert!(!config.unbind_when_idle);
        assert_eq!(config.worker.command.len(), 2);
        assert_eq!(config.worker.ready_timeout(), Duration::from_millis(250));
        assert_eq!(
            config.worker.request_timeout(),
            Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS)
        );
        assert_eq!(config.policy.denied_packages, vec!["com.evil".to_string()]);
        assert_eq!(config.modules.len(), 1);
        assert_eq!(config.modules[0].version.as_deref(), Some("3.1"));
    }

    #[test]
    fn test_empty_worker_command_rejected() {
        let err = ManagerConfig::from_toml_str("[worker]\ncommand = []").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("SBX_SOCKET", "/tmp/other.sock"),
            ("SBX_RESTART_POLICY", "forbid"),
            ("SBX_WORKER", "python3 worker.py"),
        ]
        .into_iter()
        .collect();

        let mut config = ManagerConfig::default();
        config
            .apply_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.socket_path, PathBuf::from("/tmp/other.sock"));
        assert_eq!(config.restart_policy, RestartPolicy::Forbid);
        assert_eq!(config.worker.command, vec!["python3", "worker.py"]);
    }

    #[test]
    fn test_bad_policy_env_rejected() {
        let mut config = ManagerConfig::default();
        let err = config
            .apply_overrides(|key| (key == "SBX_RESTART_POLICY").then(|| "maybe".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("SBX_RESTART_POLICY"));
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ManagerConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, ManagerConfig::default());
    }
}
