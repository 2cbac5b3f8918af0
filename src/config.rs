//! Engine configuration.
//!
//! Read from `.forge/engine.toml` in the project directory. Every section and
//! field is optional; missing values fall back to defaults. Environment
//! variables override the file:
//!
//! | Variable                  | Field                        |
//! |---------------------------|------------------------------|
//! | `FORGE_PORT_RANGE_START`  | `ports.range_start`          |
//! | `FORGE_PORT_RANGE_END`    | `ports.range_end`            |
//! | `FORGE_CONTAINER_RUNTIME` | `container.runtime`          |
//! | `FORGE_GIT_TIMEOUT_SECS`  | `git.timeout_secs`           |
//! | `FORGE_DB_PATH`           | `db_path`                    |
//!
//! ```toml
//! db_path = ".forge/engine.db"
//!
//! [ports]
//! range_start = 5000
//! range_end = 5999
//! probe = true
//!
//! [git]
//! timeout_secs = 120
//! remote = "origin"
//!
//! [container]
//! runtime = "docker"
//! memory = "512m"
//! cpus = 1.0
//!
//! [steps]
//! timeout_secs = 900
//! max_attempts = 2
//! retry_on = "timeout"
//!
//! [logging]
//! level = "info"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::driver::RetryPolicy;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub db_path: PathBuf,
    pub ports: PortSettings,
    pub git: GitSettings,
    pub container: ContainerSettings,
    pub steps: StepSettings,
    pub logging: LoggingSettings,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from(".forge").join("engine.db"),
            ports: PortSettings::default(),
            git: GitSettings::default(),
            container: ContainerSettings::default(),
            steps: StepSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortSettings {
    pub range_start: u16,
    pub range_end: u16,
    /// Also treat ports the OS reports as bound as in use.
    pub probe: bool,
}

impl Default for PortSettings {
    fn default() -> Self {
        Self {
            range_start: 5000,
            range_end: 5999,
            probe: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GitSettings {
    pub git_cmd: String,
    pub gh_cmd: String,
    pub remote: String,
    pub timeout_secs: u64,
}

impl Default for GitSettings {
    fn default() -> Self {
        Self {
            git_cmd: "git".to_string(),
            gh_cmd: "gh".to_string(),
            remote: "origin".to_string(),
            timeout_secs: 120,
        }
    }
}

impl GitSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerSettings {
    /// Container CLI binary (`docker`, `podman`).
    pub runtime: String,
    pub build_timeout_secs: u64,
    pub command_timeout_secs: u64,
    /// `--memory` ceiling for single-service previews.
    pub memory: Option<String>,
    /// `--cpus` ceiling for single-service previews.
    pub cpus: Option<f64>,
    /// Prefix of the per-slot port environment variables.
    pub env_prefix: String,
}

impl Default for ContainerSettings {
    fn default() -> Self {
        Self {
            runtime: "docker".to_string(),
            build_timeout_secs: 600,
            command_timeout_secs: 60,
            memory: None,
            cpus: None,
            env_prefix: "PORT_".to_string(),
        }
    }
}

impl ContainerSettings {
    pub fn build_timeout(&self) -> Duration {
        Duration::from_secs(self.build_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StepSettings {
    /// Default per-step deadline. `None` leaves steps bounded only by the
    /// deadlines of the operations they perform.
    pub timeout_secs: Option<u64>,
    #[serde(flatten)]
    pub retry: RetryPolicy,
}

impl StepSettings {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
    /// Directory for a daily-rolling log file in addition to stderr.
    pub dir: Option<PathBuf>,
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            dir: None,
            json: false,
        }
    }
}

impl EngineConfig {
    /// Load `.forge/engine.toml` from `project_dir` and apply environment
    /// overrides. A missing file yields defaults.
    pub fn load(project_dir: &Path) -> Result<Self> {
        let mut config = Self::load_file(project_dir)?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        if config.db_path.is_relative() {
            config.db_path = project_dir.join(&config.db_path);
        }
        config.validate()?;
        Ok(config)
    }

    fn load_file(project_dir: &Path) -> Result<Self> {
        let config_path = project_dir.join(".forge").join("engine.toml");
        if !config_path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", config_path.display()))
    }

    /// Apply overrides from a variable lookup (the process environment in
    /// production).
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = lookup("FORGE_PORT_RANGE_START") {
            self.ports.range_start = v
                .parse()
                .with_context(|| format!("Invalid FORGE_PORT_RANGE_START '{}'", v))?;
        }
        if let Some(v) = lookup("FORGE_PORT_RANGE_END") {
            self.ports.range_end = v
                .parse()
                .with_context(|| format!("Invalid FORGE_PORT_RANGE_END '{}'", v))?;
        }
        if let Some(v) = lookup("FORGE_CONTAINER_RUNTIME") {
            self.container.runtime = v;
        }
        if let Some(v) = lookup("FORGE_GIT_TIMEOUT_SECS") {
            self.git.timeout_secs = v
                .parse()
                .with_context(|| format!("Invalid FORGE_GIT_TIMEOUT_SECS '{}'", v))?;
        }
        if let Some(v) = lookup("FORGE_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.ports.range_start == 0 || self.ports.range_start > self.ports.range_end {
            anyhow::bail!(
                "Invalid port range {}-{}",
                self.ports.range_start,
                self.ports.range_end
            );
        }
        if self.git.timeout_secs == 0 {
            anyhow::bail!("git.timeout_secs must be greater than zero");
        }
        if self.steps.retry.max_attempts == 0 {
            anyhow::bail!("steps.max_attempts must be at least 1");
        }
        Ok(())
    }
}
