//! Remote command execution
//!
//! A `RemoteExecutor` opens a command channel to a host, runs one command and
//! reports exit code and captured output. Exit codes outside the acceptable
//! set become `Error::UnexpectedExitCode` so steps can simply use `?`.

mod shell;

pub use shell::ShellExecutor;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

use crate::common::{Error, Result};
use crate::topology::Host;

/// Options for a single command
#[derive(Debug, Clone)]
pub struct ExecOptions {
    /// Exit codes that count as success
    pub acceptable_exit_codes: BTreeSet<i32>,
    /// Upper bound on how long the command may run
    pub timeout: Option<Duration>,
    /// Data piped to the command's stdin
    pub stdin: Option<String>,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            acceptable_exit_codes: BTreeSet::from([0]),
            timeout: None,
            stdin: None,
        }
    }
}

impl ExecOptions {
    /// Accept the given exit codes instead of just 0
    pub fn accept(mut self, codes: impl IntoIterator<Item = i32>) -> Self {
        self.acceptable_exit_codes = codes.into_iter().collect();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_stdin(mut self, stdin: impl Into<String>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }
}

/// Captured result of a finished command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Turn an unacceptable exit code into an error carrying the output
    pub fn check(self, host: &Host, command: &str, opts: &ExecOptions) -> Result<Self> {
        if opts.acceptable_exit_codes.contains(&self.exit_code) {
            return Ok(self);
        }
        Err(Error::UnexpectedExitCode {
            host: host.name.clone(),
            command: command.to_string(),
            exit_code: self.exit_code,
            stdout: self.stdout,
            stderr: self.stderr,
        })
    }
}

/// Runs commands on hosts
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Run a command on a host
    ///
    /// Fails with `Error::Execution` when the host can't be reached,
    /// `Error::Timeout` when `opts.timeout` expires, and
    /// `Error::UnexpectedExitCode` for exit codes outside the acceptable set.
    async fn run(&self, host: &Host, command: &str, opts: &ExecOptions) -> Result<CommandOutput>;

    /// Create (or replace) a file on a host
    async fn write_file(
        &self,
        host: &Host,
        path: &str,
        contents: &str,
        mode: Option<u32>,
    ) -> Result<CommandOutput> {
        let mut command = format!("cat > {}", shell_quote(path));
        if let Some(mode) = mode {
            command.push_str(&format!(" && chmod {:o} {}", mode, shell_quote(path)));
        }
        self.run(host, &command, &ExecOptions::default().with_stdin(contents))
            .await
    }
}

/// Quote a string for POSIX sh
pub fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || "/._-+=:,@%".contains(c))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}
