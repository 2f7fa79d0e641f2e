//! Process-backed executor: `sh -c` for local hosts, the ssh client for the rest

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::task::JoinHandle;

use super::{CommandOutput, ExecOptions, RemoteExecutor};
use crate::common::{Error, Result};
use crate::topology::{Host, Transport};

/// Exit status the ssh client uses for its own failures
const SSH_CONNECTION_FAILURE: i32 = 255;

/// How long to keep reading a killed command's pipes
const DRAIN_GRACE: Duration = Duration::from_millis(200);

/// Collects a child pipe in the background
///
/// The buffer stays readable while the reader runs, so a command that is
/// killed still reports what it printed so far.
struct OutputCapture {
    buffer: Arc<Mutex<Vec<u8>>>,
    reader: Option<JoinHandle<()>>,
}

impl OutputCapture {
    fn spawn<R>(pipe: Option<R>) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let reader = pipe.map(|mut pipe| {
            let buffer = Arc::clone(&buffer);
            tokio::spawn(async move {
                let mut chunk = [0u8; 8192];
                loop {
                    match pipe.read(&mut chunk).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => lock(&buffer).extend_from_slice(&chunk[..n]),
                    }
                }
            })
        });
        Self { buffer, reader }
    }

    /// Wait for the pipe to close
    async fn finish(&mut self) {
        if let Some(reader) = self.reader.take() {
            let _ = reader.await;
        }
    }

    /// Wait at most `grace` for the pipe to close
    async fn drain(&mut self, grace: Duration) {
        if let Some(reader) = self.reader.as_mut() {
            let _ = tokio::time::timeout(grace, reader).await;
        }
    }

    fn text(&self) -> String {
        String::from_utf8_lossy(&lock(&self.buffer)).into_owned()
    }
}

impl Drop for OutputCapture {
    fn drop(&mut self) {
        if let Some(reader) = &self.reader {
            reader.abort();
        }
    }
}

fn lock(buffer: &Mutex<Vec<u8>>) -> MutexGuard<'_, Vec<u8>> {
    buffer.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Executor that spawns real processes
#[derive(Debug, Clone)]
pub struct ShellExecutor {
    ssh_program: PathBuf,
    connect_timeout: Duration,
    default_timeout: Option<Duration>,
}

impl Default for ShellExecutor {
    fn default() -> Self {
        Self {
            ssh_program: PathBuf::from("ssh"),
            connect_timeout: Duration::from_secs(10),
            default_timeout: None,
        }
    }
}

impl ShellExecutor {
    pub fn new(ssh_program: PathBuf, connect_timeout: Duration) -> Self {
        Self {
            ssh_program,
            connect_timeout,
            default_timeout: None,
        }
    }

    /// Timeout used when a command doesn't set one
    pub fn with_default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout = timeout;
        self
    }

    fn build_command(&self, host: &Host, command: &str) -> Command {
        match host.transport {
            Transport::Local => {
                let mut cmd = Command::new("sh");
                cmd.arg("-c").arg(command);
                cmd
            }
            Transport::Ssh => {
                let mut cmd = Command::new(&self.ssh_program);
                cmd.args(ssh_args(host, self.connect_timeout)).arg(command);
                cmd
            }
        }
    }
}

/// Arguments for the ssh client, up to and including the `--` before the command
fn ssh_args(host: &Host, connect_timeout: Duration) -> Vec<String> {
    let mut args = vec![
        "-o".to_string(),
        "BatchMode=yes".to_string(),
        "-o".to_string(),
        format!("ConnectTimeout={}", connect_timeout.as_secs().max(1)),
    ];
    if let Some(port) = host.port {
        args.push("-p".to_string());
        args.push(port.to_string());
    }
    if let Some(identity) = &host.identity_file {
        args.push("-i".to_string());
        args.push(identity.clone());
    }
    let destination = match &host.user {
        Some(user) => format!("{}@{}", user, host.address()),
        None => host.address().to_string(),
    };
    args.push(destination);
    args.push("--".to_string());
    args
}

#[async_trait]
impl RemoteExecutor for ShellExecutor {
    async fn run(&self, host: &Host, command: &str, opts: &ExecOptions) -> Result<CommandOutput> {
        tracing::debug!(host = %host.name, transport = %host.transport, "$ {}", command);

        let mut cmd = self.build_command(host, command);
        cmd.stdin(if opts.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            Error::execution(&host.name, format!("failed to spawn command channel: {}", e))
        })?;

        if let (Some(input), Some(mut stdin)) = (opts.stdin.clone(), child.stdin.take()) {
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(input.as_bytes()).await {
                    tracing::debug!("Failed to write command stdin: {}", e);
                }
                // stdin is closed on drop so the command sees EOF
            });
        }

        let mut stdout = OutputCapture::spawn(child.stdout.take());
        let mut stderr = OutputCapture::spawn(child.stderr.take());

        let finished = async {
            let status = child.wait().await?;
            stdout.finish().await;
            stderr.finish().await;
            Ok::<_, std::io::Error>(status)
        };

        let timeout = opts.timeout.or(self.default_timeout);
        let waited = match timeout {
            Some(limit) => tokio::time::timeout(limit, finished).await.ok(),
            None => Some(finished.await),
        };

        let status = match waited {
            Some(result) => result.map_err(|e| {
                Error::execution(&host.name, format!("failed to wait for command: {}", e))
            })?,
            None => {
                let limit = timeout.unwrap_or_default();
                if let Err(e) = child.start_kill() {
                    tracing::debug!("Failed to kill timed out command: {}", e);
                }
                // Keep whatever the command printed before it was killed
                stdout.drain(DRAIN_GRACE).await;
                stderr.drain(DRAIN_GRACE).await;
                return Err(Error::Timeout {
                    host: host.name.clone(),
                    command: command.to_string(),
                    timeout: limit,
                    stdout: stdout.text(),
                    stderr: stderr.text(),
                });
            }
        };

        let stdout = stdout.text();
        let stderr = stderr.text();

        let exit_code = status.code().ok_or_else(|| {
            Error::execution(
                &host.name,
                format!("command terminated by signal: {}", command),
            )
        })?;

        if host.transport == Transport::Ssh
            && exit_code == SSH_CONNECTION_FAILURE
            && !opts.acceptable_exit_codes.contains(&exit_code)
        {
            return Err(Error::execution(
                &host.name,
                format!("ssh connection failed: {}", stderr.trim()),
            ));
        }

        tracing::debug!(host = %host.name, exit_code, "command finished");

        CommandOutput {
            exit_code,
            stdout,
            stderr,
        }
        .check(host, command, opts)
    }
}
