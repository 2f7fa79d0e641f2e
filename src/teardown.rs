//! Teardown registry
//!
//! Cleanup actions registered while a test runs. `run_all` consumes the
//! registry, so each registered action runs at most once, and the runner
//! calls it on every exit path so each action runs exactly once.

use serde::{Deserialize, Serialize};
use std::time::Instant;

use crate::common::{Error, Result};
use crate::exec::{ExecOptions, RemoteExecutor};
use crate::topology::{Host, Topology};

/// A deferred cleanup command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeardownAction {
    /// Host the command runs on
    pub host: String,
    pub command: String,
    /// Step that registered the action
    pub step: String,
}

/// What happened when a teardown action ran
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeardownRecord {
    pub host: String,
    pub command: String,
    pub step: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// Cleanup actions for one test
#[derive(Debug, Default)]
pub struct TeardownRegistry {
    actions: Vec<TeardownAction>,
}

impl TeardownRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an action; later registrations run first
    pub fn register(&mut self, action: TeardownAction) {
        tracing::debug!(host = %action.host, step = %action.step, "registered teardown: {}", action.command);
        self.actions.push(action);
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Run every action in reverse registration order
    ///
    /// `render` turns each registered command into the one that runs, at the
    /// moment it runs. A failing action is recorded and the remaining actions
    /// still run.
    pub async fn run_all<F>(
        self,
        executor: &dyn RemoteExecutor,
        topology: &Topology,
        render: F,
    ) -> Vec<TeardownRecord>
    where
        F: Fn(&Host, &str) -> Result<String>,
    {
        let mut records = Vec::with_capacity(self.actions.len());

        for action in self.actions.into_iter().rev() {
            let started = Instant::now();
            let mut command = action.command;
            let result = match topology.host(&action.host) {
                Some(host) => match render(host, &command) {
                    Ok(rendered) => {
                        command = rendered;
                        executor
                            .run(host, &command, &ExecOptions::default())
                            .await
                            .map(|_| ())
                    }
                    Err(e) => Err(e),
                },
                None => Err(Error::execution(
                    &action.host,
                    "host is not part of the topology",
                )),
            };

            let error = result.err().map(|e| {
                let mut message = e.to_string();
                if let Some((stdout, stderr)) = e.captured_output() {
                    message.push_str(&format_captured(stdout, stderr));
                }
                message
            });

            if let Some(message) = &error {
                tracing::warn!(host = %action.host, "Teardown '{}' failed: {}", command, message);
            }

            records.push(TeardownRecord {
                host: action.host,
                command,
                step: action.step,
                success: error.is_none(),
                error,
                duration_ms: started.elapsed().as_millis() as u64,
            });
        }

        records
    }
}

/// Render captured output for an error message
pub(crate) fn format_captured(stdout: &str, stderr: &str) -> String {
    let mut out = String::new();
    if !stdout.trim().is_empty() {
        out.push_str(&format!("\n--- stdout ---\n{}", stdout.trim_end()));
    }
    if !stderr.trim().is_empty() {
        out.push_str(&format!("\n--- stderr ---\n{}", stderr.trim_end()));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::mock::RecordingExecutor;
    use crate::testing::Variables;
    use std::collections::BTreeMap;

    fn topology() -> Topology {
        Topology::parse("hosts:\n  - name: master\n    platform: el-8\n").unwrap()
    }

    fn verbatim(_: &Host, command: &str) -> Result<String> {
        Ok(command.to_string())
    }

    fn action(command: &str) -> TeardownAction {
        TeardownAction {
            host: "master".into(),
            command: command.into(),
            step: "setup".into(),
        }
    }

    #[tokio::test]
    async fn test_runs_in_reverse_order() {
        let executor = RecordingExecutor::new();
        let mut registry = TeardownRegistry::new();
        registry.register(action("A"));
        registry.register(action("B"));
        registry.register(action("C"));

        let records = registry.run_all(&executor, &topology(), verbatim).await;

        assert_eq!(executor.commands(), vec!["C", "B", "A"]);
        assert!(records.iter().all(|r| r.success));
    }

    #[tokio::test]
    async fn test_continues_past_failures() {
        let executor = RecordingExecutor::new().respond("B", 1, "", "rm: permission denied");
        let mut registry = TeardownRegistry::new();
        registry.register(action("A"));
        registry.register(action("B"));
        registry.register(action("C"));

        let records = registry.run_all(&executor, &topology(), verbatim).await;

        assert_eq!(executor.commands(), vec!["C", "B", "A"]);
        assert!(records[0].success);
        assert!(!records[1].success);
        assert!(records[1].error.as_deref().unwrap().contains("permission denied"));
        assert!(records[2].success);
    }

    #[tokio::test]
    async fn test_unknown_host_is_recorded() {
        let executor = RecordingExecutor::new();
        let mut registry = TeardownRegistry::new();
        registry.register(TeardownAction {
            host: "gone".into(),
            command: "rm -f x".into(),
            step: "s".into(),
        });

        let records = registry.run_all(&executor, &topology(), verbatim).await;
        assert!(executor.commands().is_empty());
        assert!(!records[0].success);
    }

    #[tokio::test]
    async fn test_commands_are_rendered_when_teardown_runs() {
        let executor = RecordingExecutor::new();
        let mut registry = TeardownRegistry::new();
        registry.register(action("rm -f {{ tmp }}"));
        registry.register(action("rm -f {{ missing }}"));
        assert_eq!(registry.len(), 2);

        // Set after registration, as a capture later in the step would
        let mut vars = Variables::new(BTreeMap::new(), &[]);
        vars.set("tmp", "/tmp/puppet.xyz");

        let records = registry
            .run_all(&executor, &topology(), |host, command| vars.expand(command, Some(host)))
            .await;

        assert_eq!(executor.commands(), vec!["rm -f /tmp/puppet.xyz"]);
        assert!(!records[0].success);
        assert!(records[0].error.as_deref().unwrap().contains("missing"));
        assert_eq!(records[0].command, "rm -f {{ missing }}");
        assert!(records[1].success);
        assert_eq!(records[1].command, "rm -f /tmp/puppet.xyz");
    }
}
