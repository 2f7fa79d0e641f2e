//! Recording executor for unit tests

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::common::{Error, Result};
use crate::exec::{CommandOutput, ExecOptions, RemoteExecutor};
use crate::topology::Host;

enum Reply {
    Output(CommandOutput),
    Unreachable,
    TimedOut { stdout: String },
    Hang,
}

/// Executor that records commands and answers from canned replies
///
/// Replies are matched by substring, first match wins. Unmatched commands
/// succeed with empty output.
#[derive(Default)]
pub struct RecordingExecutor {
    replies: Vec<(String, Reply)>,
    calls: Mutex<Vec<(String, String, Option<String>)>>,
}

impl RecordingExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(mut self, pattern: &str, exit_code: i32, stdout: &str, stderr: &str) -> Self {
        self.replies.push((
            pattern.to_string(),
            Reply::Output(CommandOutput {
                exit_code,
                stdout: stdout.to_string(),
                stderr: stderr.to_string(),
            }),
        ));
        self
    }

    pub fn unreachable(mut self, pattern: &str) -> Self {
        self.replies.push((pattern.to_string(), Reply::Unreachable));
        self
    }

    /// Time out commands matching `pattern` after they printed `stdout`
    pub fn time_out(mut self, pattern: &str, stdout: &str) -> Self {
        self.replies.push((
            pattern.to_string(),
            Reply::TimedOut {
                stdout: stdout.to_string(),
            },
        ));
        self
    }

    /// Never finish commands matching `pattern`
    pub fn hang(mut self, pattern: &str) -> Self {
        self.replies.push((pattern.to_string(), Reply::Hang));
        self
    }

    /// Commands in execution order
    pub fn commands(&self) -> Vec<String> {
        self.calls.lock().unwrap().iter().map(|(_, c, _)| c.clone()).collect()
    }

    /// stdin passed to the first command containing `pattern`
    pub fn stdin_of(&self, pattern: &str) -> Option<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .find(|(_, c, _)| c.contains(pattern))
            .and_then(|(_, _, s)| s.clone())
    }

    /// How many executed commands contain `pattern`
    pub fn count(&self, pattern: &str) -> usize {
        self.commands().iter().filter(|c| c.contains(pattern)).count()
    }
}

#[async_trait]
impl RemoteExecutor for RecordingExecutor {
    async fn run(&self, host: &Host, command: &str, opts: &ExecOptions) -> Result<CommandOutput> {
        self.calls.lock().unwrap().push((
            host.name.clone(),
            command.to_string(),
            opts.stdin.clone(),
        ));

        let reply = self
            .replies
            .iter()
            .find(|(pattern, _)| command.contains(pattern.as_str()))
            .map(|(_, reply)| reply);

        match reply {
            Some(Reply::Output(output)) => output.clone().check(host, command, opts),
            Some(Reply::Unreachable) => Err(Error::execution(&host.name, "connection refused")),
            Some(Reply::TimedOut { stdout }) => Err(Error::Timeout {
                host: host.name.clone(),
                command: command.to_string(),
                timeout: opts.timeout.unwrap_or(Duration::from_secs(1)),
                stdout: stdout.clone(),
                stderr: String::new(),
            }),
            Some(Reply::Hang) => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(Error::Internal("hang elapsed".to_string()))
            }
            None => Ok(CommandOutput {
                exit_code: 0,
                stdout: String::new(),
                stderr: String::new(),
            }),
        }
    }
}
