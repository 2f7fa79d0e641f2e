//! Error types for the acceptance runner
//!
//! Every error belongs to one of three families, which decide how a failure
//! is reported: assertion failures fail a test, execution errors mark it as
//! errored, and orchestration faults abort the whole run.

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the acceptance runner
#[derive(Error, Debug)]
pub enum Error {
    // === Assertion Errors ===
    #[error("Assertion failed: {0}")]
    Assertion(String),

    #[error("Variable '{0}' is not defined")]
    UndefinedVariable(String),

    // === Execution Errors ===
    #[error("Failed to reach host '{host}': {message}")]
    Execution { host: String, message: String },

    #[error("Command on '{host}' timed out after {:.1}s: {command}", .timeout.as_secs_f64())]
    Timeout {
        host: String,
        command: String,
        timeout: Duration,
        /// Output printed before the command was killed
        stdout: String,
        stderr: String,
    },

    #[error("Command on '{host}' exited with code {exit_code}: {command}")]
    UnexpectedExitCode {
        host: String,
        command: String,
        exit_code: i32,
        stdout: String,
        stderr: String,
    },

    #[error("Test run interrupted")]
    Interrupted,

    // === Orchestration Faults ===
    #[error("Failed to load topology '{path}': {message}")]
    TopologyLoad { path: String, message: String },

    #[error("Failed to load test '{path}': {message}")]
    SuiteLoad { path: String, message: String },

    #[error("Test '{test}' targets '{target}' but no host has that name or role")]
    NoHostForTarget { test: String, target: String },

    // === Configuration Errors ===
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(String),

    // === IO Errors ===
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to read file '{path}': {error}")]
    FileRead { path: String, error: String },

    #[error("Failed to write report '{path}': {error}")]
    ReportWrite { path: String, error: String },

    // === Serialization Errors ===
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    // === Internal Errors ===
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Failure family, used to map errors onto test outcomes and exit codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Expected-vs-actual mismatch inside a step
    Assertion,
    /// Remote command or infrastructure problem
    Execution,
    /// The run itself cannot proceed
    Orchestration,
}

impl Error {
    /// Create an assertion failure
    pub fn assertion(message: impl Into<String>) -> Self {
        Self::Assertion(message.into())
    }

    /// Create an execution error for a host
    pub fn execution(host: &str, message: impl Into<String>) -> Self {
        Self::Execution {
            host: host.to_string(),
            message: message.into(),
        }
    }

    /// Create a topology load error
    pub fn topology_load(path: &std::path::Path, message: impl ToString) -> Self {
        Self::TopologyLoad {
            path: path.display().to_string(),
            message: message.to_string(),
        }
    }

    /// Create a suite load error
    pub fn suite_load(path: &std::path::Path, message: impl ToString) -> Self {
        Self::SuiteLoad {
            path: path.display().to_string(),
            message: message.to_string(),
        }
    }

    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Assertion(_) | Error::UndefinedVariable(_) => ErrorKind::Assertion,
            Error::Execution { .. }
            | Error::Timeout { .. }
            | Error::UnexpectedExitCode { .. }
            | Error::Interrupted
            | Error::Io(_)
            | Error::Json(_)
            | Error::Internal(_) => ErrorKind::Execution,
            Error::TopologyLoad { .. }
            | Error::SuiteLoad { .. }
            | Error::NoHostForTarget { .. }
            | Error::Config(_)
            | Error::ConfigParse(_)
            | Error::FileRead { .. }
            | Error::ReportWrite { .. }
            | Error::Yaml(_) => ErrorKind::Orchestration,
        }
    }

    /// Captured (stdout, stderr) of the command implicated in this error, if any
    pub fn captured_output(&self) -> Option<(&str, &str)> {
        match self {
            Error::UnexpectedExitCode { stdout, stderr, .. }
            | Error::Timeout { stdout, stderr, .. } => Some((stdout.as_str(), stderr.as_str())),
            _ => None,
        }
    }
}
