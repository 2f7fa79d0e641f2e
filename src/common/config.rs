//! Configuration file handling

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::paths::config_path;
use super::Result;

/// Main configuration structure
#[derive(Debug, Deserialize, Default)]
pub struct Config {
    /// Remote executor settings
    #[serde(default)]
    pub executor: ExecutorConfig,

    /// Report settings
    #[serde(default)]
    pub report: ReportConfig,

    /// Defaults for `run`
    #[serde(default)]
    pub run: RunDefaults,

    /// Suite variables available to every test as `{{ name }}`
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
}

/// Remote executor settings
#[derive(Debug, Deserialize, Clone)]
pub struct ExecutorConfig {
    /// ssh client to use for `ssh` hosts (looked up in PATH)
    #[serde(default = "default_ssh_program")]
    pub ssh_program: PathBuf,

    /// Seconds to wait for an ssh connection
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Timeout applied to commands that don't set their own (0 = none)
    #[serde(default)]
    pub default_timeout_secs: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            ssh_program: default_ssh_program(),
            connect_timeout_secs: default_connect_timeout(),
            default_timeout_secs: 0,
        }
    }
}

impl ExecutorConfig {
    /// Default command timeout, if any
    pub fn default_timeout(&self) -> Option<Duration> {
        (self.default_timeout_secs > 0).then(|| Duration::from_secs(self.default_timeout_secs))
    }
}

fn default_ssh_program() -> PathBuf {
    PathBuf::from("ssh")
}

fn default_connect_timeout() -> u64 {
    10
}

/// How failed teardown actions show up
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TeardownFailurePolicy {
    /// Record failures as warnings in the report
    #[default]
    Warn,
    /// Only write failures to the log
    Log,
}

/// Report settings
#[derive(Debug, Deserialize, Default)]
pub struct ReportConfig {
    /// What to do with teardown failures
    #[serde(default)]
    pub teardown_failures: TeardownFailurePolicy,
}

/// Defaults for the `run` command, overridden by CLI flags
#[derive(Debug, Deserialize)]
pub struct RunDefaults {
    #[serde(default)]
    pub fail_fast: bool,

    #[serde(default = "default_parallel")]
    pub parallel: usize,
}

impl Default for RunDefaults {
    fn default() -> Self {
        Self {
            fail_fast: false,
            parallel: default_parallel(),
        }
    }
}

fn default_parallel() -> usize {
    1
}

impl Config {
    /// Load configuration from the default config file
    ///
    /// Returns default configuration if file doesn't exist
    pub fn load() -> Result<Self> {
        match config_path() {
            Some(path) if path.exists() => Self::load_from(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Load configuration from an explicit path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| super::Error::FileRead {
            path: path.display().to_string(),
            error: e.to_string(),
        })?;
        toml::from_str(&content).map_err(|e| super::Error::ConfigParse(e.to_string()))
    }

    /// Resolve the ssh client binary
    ///
    /// Absolute paths are used as-is, bare names are searched in PATH.
    pub fn ssh_program(&self) -> Result<PathBuf> {
        let program = &self.executor.ssh_program;
        if program.is_absolute() {
            return Ok(program.clone());
        }
        which::which(program).map_err(|e| {
            super::Error::Config(format!(
                "ssh client '{}' not found: {}",
                program.display(),
                e
            ))
        })
    }
}
