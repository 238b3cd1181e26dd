//! Supervisor configuration
//!
//! Everything lives under one private data directory, `~/.repowhisper` by
//! default (`REPOWHISPER_HOME` overrides it). An optional `config.json`
//! there tweaks timeouts and where the backend comes from.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const HOME_ENV: &str = "REPOWHISPER_HOME";
const CONFIG_FILE: &str = "config.json";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("No home directory")]
    NoHome,
    #[error("Could not read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid config.json: {0}")]
    Parse(#[from] serde_json::Error),
}

/// An explicit backend command, bypassing bundled-binary lookup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutableSpec {
    pub program: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
}

/// Recurring health check policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorPolicy {
    pub interval: Duration,
    /// Consecutive probe failures before the backend is declared unhealthy
    pub failure_threshold: u32,
    /// Automatic restarts allowed before the error sticks
    pub max_auto_restarts: u32,
    pub restart_backoff: Duration,
}

impl Default for MonitorPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            failure_threshold: 3,
            max_auto_restarts: 1,
            restart_backoff: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub data_dir: PathBuf,
    pub socket_path: PathBuf,
    pub token_path: PathBuf,
    pub log_dir: PathBuf,
    /// App bundle resources; bundled binaries live in `<resources>/bin`
    pub resources_dir: Option<PathBuf>,
    /// Development checkout of the backend, holding `main.py`
    pub backend_dir: Option<PathBuf>,
    pub interpreter: String,
    pub assets_dir: Option<PathBuf>,
    pub executable: Option<ExecutableSpec>,
    pub startup_timeout: Duration,
    pub poll_interval: Duration,
    pub health_timeout: Duration,
    pub request_timeout: Duration,
    pub grace_period: Duration,
    pub monitor: MonitorPolicy,
}

impl SupervisorConfig {
    /// Defaults for a data directory
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            socket_path: data_dir.join("run").join("backend.sock"),
            token_path: data_dir.join("auth_token"),
            log_dir: data_dir.join("logs"),
            resources_dir: None,
            backend_dir: None,
            interpreter: "python3".to_string(),
            assets_dir: None,
            executable: None,
            startup_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(100),
            health_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
            grace_period: Duration::from_secs(3),
            monitor: MonitorPolicy::default(),
            data_dir,
        }
    }

    /// `$REPOWHISPER_HOME`, else `~/.repowhisper`
    pub fn default_data_dir() -> Result<PathBuf, ConfigError> {
        if let Some(home) = std::env::var_os(HOME_ENV).filter(|v| !v.is_empty()) {
            return Ok(PathBuf::from(home));
        }
        Ok(dirs::home_dir().ok_or(ConfigError::NoHome)?.join(".repowhisper"))
    }

    /// Defaults for `data_dir`, overlaid with `config.json` if present
    pub fn load(data_dir: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::new(data_dir);
        let path = data_dir.join(CONFIG_FILE);
        match std::fs::read(&path) {
            Ok(data) => config.apply(serde_json::from_slice(&data)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => return Err(ConfigError::Read { path, source }),
        }
        Ok(config)
    }

    pub fn apply(&mut self, settings: Settings) {
        let ms = Duration::from_millis;
        if let Some(v) = settings.resources_dir {
            self.resources_dir = Some(v);
        }
        if let Some(v) = settings.backend_dir {
            self.backend_dir = Some(v);
        }
        if let Some(v) = settings.interpreter {
            self.interpreter = v;
        }
        if let Some(v) = settings.assets_dir {
            self.assets_dir = Some(v);
        }
        if let Some(v) = settings.executable {
            self.executable = Some(v);
        }
        if let Some(v) = settings.startup_timeout_ms {
            self.startup_timeout = ms(v);
        }
        if let Some(v) = settings.poll_interval_ms {
            self.poll_interval = ms(v.max(1));
        }
        if let Some(v) = settings.health_timeout_ms {
            self.health_timeout = ms(v);
        }
        if let Some(v) = settings.request_timeout_ms {
            self.request_timeout = ms(v);
        }
        if let Some(v) = settings.grace_period_ms {
            self.grace_period = ms(v);
        }
        if let Some(v) = settings.health_interval_ms {
            self.monitor.interval = ms(v.max(1));
        }
        if let Some(v) = settings.failure_threshold {
            self.monitor.failure_threshold = v.max(1);
        }
        if let Some(v) = settings.max_auto_restarts {
            self.monitor.max_auto_restarts = v;
        }
        if let Some(v) = settings.restart_backoff_ms {
            self.monitor.restart_backoff = ms(v);
        }
    }
}

/// `config.json` contents. Every field is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub resources_dir: Option<PathBuf>,
    pub backend_dir: Option<PathBuf>,
    pub interpreter: Option<String>,
    pub assets_dir: Option<PathBuf>,
    pub executable: Option<ExecutableSpec>,
    pub startup_timeout_ms: Option<u64>,
    pub poll_interval_ms: Option<u64>,
    pub health_timeout_ms: Option<u64>,
    pub request_timeout_ms: Option<u64>,
    pub grace_period_ms: Option<u64>,
    pub health_interval_ms: Option<u64>,
    pub failure_threshold: Option<u32>,
    pub max_auto_restarts: Option<u32>,
    pub restart_backoff_ms: Option<u64>,
}
