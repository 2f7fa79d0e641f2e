//! Step runner
//!
//! Runs a test's steps in order against a per-test context, converts step
//! errors into outcomes and always drains the teardown registry before the
//! result is built.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::common::config::TeardownFailurePolicy;
use crate::common::{paths, Error, ErrorKind, Result};
use crate::confine::Confinement;
use crate::exec::{CommandOutput, ExecOptions, RemoteExecutor};
use crate::teardown::{format_captured, TeardownAction, TeardownRegistry};
use crate::topology::{Host, Topology};

use super::config::{parse_mode, Action, JsonExpectation, OutputExpectation, TestDefinition};
use super::interrupt::Interrupt;
use super::report::{CommandRecord, Outcome, StepRecord, StepStatus, TestResult};
use super::vars::Variables;

/// What a step does
#[async_trait]
pub trait StepAction: Send + Sync {
    async fn execute(&self, ctx: &mut StepContext<'_>) -> Result<()>;
}

/// A named unit of work within a test
pub struct Step {
    pub name: String,
    /// Host name or role; `None` means the first host admitted by the confinement
    pub target: Option<String>,
    action: Box<dyn StepAction>,
}

impl Step {
    pub fn new(name: impl Into<String>, target: Option<&str>, action: impl StepAction + 'static) -> Self {
        Self {
            name: name.into(),
            target: target.map(str::to_string),
            action: Box::new(action),
        }
    }
}

impl std::fmt::Debug for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Step")
            .field("name", &self.name)
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}

/// A loaded test
#[derive(Debug)]
pub struct TestCase {
    pub name: String,
    pub description: Option<String>,
    pub confinement: Confinement,
    /// Variables published to the suite scope
    pub exports: Vec<String>,
    pub steps: Vec<Step>,
}

impl TestCase {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            confinement: Confinement::default(),
            exports: Vec::new(),
            steps: Vec::new(),
        }
    }

    pub fn confine(mut self, confinement: Confinement) -> Self {
        self.confinement = confinement;
        self
    }

    pub fn export(mut self, name: &str) -> Self {
        self.exports.push(name.to_string());
        self
    }

    pub fn step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    /// Load a test definition file; the name defaults to its path under `suite_root`
    pub fn load(suite_root: &Path, path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| Error::suite_load(path, e))?;
        let definition: TestDefinition =
            serde_yaml::from_str(&content).map_err(|e| Error::suite_load(path, e))?;
        let default_name = paths::test_name_from_path(suite_root, path);
        Self::from_definition(definition, default_name).map_err(|e| Error::suite_load(path, e))
    }

    /// Build a test from its parsed definition
    pub fn from_definition(definition: TestDefinition, default_name: String) -> Result<Self> {
        if definition.steps.is_empty() {
            return Err(Error::Config("test defines no steps".to_string()));
        }

        let mut steps = Vec::with_capacity(definition.steps.len());
        for step in definition.steps {
            for action in &step.actions {
                if let Action::WriteFile { mode: Some(mode), .. } = action {
                    if parse_mode(mode).is_none() {
                        return Err(Error::Config(format!(
                            "step '{}': invalid file mode '{}'",
                            step.name, mode
                        )));
                    }
                }
            }
            steps.push(Step {
                name: step.name,
                target: step.on,
                action: Box::new(DeclaredActions {
                    actions: step.actions,
                    teardown: step.teardown,
                }),
            });
        }

        Ok(Self {
            name: definition.name.unwrap_or(default_name),
            description: definition.description,
            confinement: definition.confine,
            exports: definition.exports,
            steps,
        })
    }

    /// Resolve every step's target to hosts
    ///
    /// A target is first matched against the hosts admitted by the
    /// confinement, then against the whole topology. An empty match is a
    /// fault of the run, not of the test.
    pub fn resolve_targets<'t>(
        &self,
        topology: &'t Topology,
        admitted: &[String],
    ) -> Result<Vec<Vec<&'t Host>>> {
        let admitted_hosts: Vec<&Host> = admitted
            .iter()
            .filter_map(|name| topology.host(name))
            .collect();

        self.steps
            .iter()
            .map(|step| {
                let hosts: Vec<&Host> = match &step.target {
                    None => admitted_hosts.iter().take(1).copied().collect(),
                    Some(target) => {
                        let within: Vec<&Host> = admitted_hosts
                            .iter()
                            .copied()
                            .filter(|h| h.matches_target(target))
                            .collect();
                        if within.is_empty() {
                            topology.resolve(target)
                        } else {
                            within
                        }
                    }
                };
                if hosts.is_empty() {
                    return Err(Error::NoHostForTarget {
                        test: self.name.clone(),
                        target: step.target.clone().unwrap_or_else(|| "<default>".to_string()),
                    });
                }
                Ok(hosts)
            })
            .collect()
    }
}

/// Everything a step can touch
pub struct StepContext<'a> {
    executor: &'a dyn RemoteExecutor,
    step: &'a str,
    targets: &'a [&'a Host],
    vars: &'a mut Variables,
    teardown: &'a mut TeardownRegistry,
    commands: &'a mut Vec<CommandRecord>,
}

impl<'a> StepContext<'a> {
    /// Hosts this step runs on
    pub fn targets(&self) -> &'a [&'a Host] {
        self.targets
    }

    /// Run a command, recording its output in the test result
    pub async fn run(&mut self, host: &Host, command: &str, opts: &ExecOptions) -> Result<CommandOutput> {
        let started = Instant::now();
        let result = self.executor.run(host, command, opts).await;
        self.record(host, command, &result, started.elapsed());
        result
    }

    /// Create a file on a host
    pub async fn write_file(
        &mut self,
        host: &Host,
        path: &str,
        contents: &str,
        mode: Option<u32>,
    ) -> Result<CommandOutput> {
        let started = Instant::now();
        let result = self.executor.write_file(host, path, contents, mode).await;
        self.record(host, &format!("write_file {}", path), &result, started.elapsed());
        result
    }

    /// Schedule a cleanup command on a host
    ///
    /// `{{ name }}` references are expanded when teardown runs, so the
    /// command can use variables captured after it was registered.
    pub fn register_teardown(&mut self, host: &Host, command: impl Into<String>) {
        self.teardown.register(TeardownAction {
            host: host.name.clone(),
            command: command.into(),
            step: self.step.to_string(),
        });
    }

    pub fn var(&self, name: &str) -> Result<&str> {
        self.vars
            .get(name)
            .ok_or_else(|| Error::UndefinedVariable(name.to_string()))
    }

    pub fn set_var(&mut self, name: &str, value: impl Into<String>) {
        self.vars.set(name, value);
    }

    /// Expand `{{ name }}` references for a host
    pub fn expand(&self, template: &str, host: &Host) -> Result<String> {
        self.vars.expand(template, Some(host))
    }

    fn record(&mut self, host: &Host, command: &str, result: &Result<CommandOutput>, elapsed: Duration) {
        let (exit_code, stdout, stderr, error) = match result {
            Ok(output) => (Some(output.exit_code), output.stdout.clone(), output.stderr.clone(), None),
            Err(Error::UnexpectedExitCode {
                exit_code,
                stdout,
                stderr,
                ..
            }) => (Some(*exit_code), stdout.clone(), stderr.clone(), None),
            Err(e @ Error::Timeout { stdout, stderr, .. }) => {
                (None, stdout.clone(), stderr.clone(), Some(e.to_string()))
            }
            Err(e) => (None, String::new(), String::new(), Some(e.to_string())),
        };
        self.commands.push(CommandRecord {
            step: self.step.to_string(),
            host: host.name.clone(),
            command: command.to_string(),
            exit_code,
            stdout,
            stderr,
            error,
            duration_ms: elapsed.as_millis() as u64,
        });
    }
}

/// Actions and teardown commands declared in a test file
struct DeclaredActions {
    actions: Vec<Action>,
    teardown: Vec<String>,
}

#[async_trait]
impl StepAction for DeclaredActions {
    async fn execute(&self, ctx: &mut StepContext<'_>) -> Result<()> {
        let targets = ctx.targets();

        // Registered up front so a half-finished step still cleans up
        for host in targets {
            for command in &self.teardown {
                ctx.register_teardown(host, command.as_str());
            }
        }

        for action in &self.actions {
            for host in targets {
                execute_action(ctx, host, action).await?;
            }
        }
        Ok(())
    }
}

async fn execute_action(ctx: &mut StepContext<'_>, host: &Host, action: &Action) -> Result<()> {
    match action {
        Action::Run {
            command,
            acceptable_exit_codes,
            timeout_secs,
            capture,
            expect,
        } => {
            let command = ctx.expand(command, host)?;
            let mut opts = ExecOptions::default();
            if let Some(codes) = acceptable_exit_codes {
                opts = opts.accept(codes.iter().copied());
            }
            if let Some(secs) = timeout_secs {
                opts = opts.with_timeout(Duration::from_secs(*secs));
            }

            let output = ctx.run(host, &command, &opts).await?;

            if let Some(expect) = expect {
                check_output(ctx, host, &command, &output.stdout, expect)?;
            }
            if let Some(name) = capture {
                ctx.set_var(name, output.stdout.trim());
            }
            Ok(())
        }

        Action::WriteFile { path, content, mode } => {
            let path = ctx.expand(path, host)?;
            let content = ctx.expand(content, host)?;
            let mode = mode.as_deref().and_then(parse_mode);
            ctx.write_file(host, &path, &content, mode).await?;
            Ok(())
        }

        Action::Assert {
            variable,
            not_empty,
            equals,
            contains,
            json,
        } => {
            let value = ctx.var(variable)?.to_string();
            if *not_empty && value.trim().is_empty() {
                return Err(Error::assertion(format!("'{}' is empty", variable)));
            }
            if let Some(expected) = equals {
                let expected = ctx.expand(expected, host)?;
                if value != expected {
                    return Err(Error::assertion(format!(
                        "'{}': expected '{}', got '{}'",
                        variable, expected, value
                    )));
                }
            }
            if let Some(needle) = contains {
                let needle = ctx.expand(needle, host)?;
                if !value.contains(&needle) {
                    return Err(Error::assertion(format!(
                        "'{}': expected value containing '{}', got '{}'",
                        variable, needle, value
                    )));
                }
            }
            check_json(variable, &value, json)
        }
    }
}

fn check_output(
    ctx: &StepContext<'_>,
    host: &Host,
    command: &str,
    stdout: &str,
    expect: &OutputExpectation,
) -> Result<()> {
    if let Some(needle) = &expect.stdout_contains {
        let needle = ctx.expand(needle, host)?;
        if !stdout.contains(&needle) {
            return Err(Error::assertion(format!(
                "stdout of '{}' does not contain '{}'",
                command, needle
            )));
        }
    }
    if let Some(expected) = &expect.stdout_equals {
        let expected = ctx.expand(expected, host)?;
        if stdout.trim() != expected.trim() {
            return Err(Error::assertion(format!(
                "stdout of '{}': expected '{}', got '{}'",
                command,
                expected.trim(),
                stdout.trim()
            )));
        }
    }
    check_json(&format!("stdout of '{}'", command), stdout, &expect.json)
}

fn check_json(subject: &str, text: &str, checks: &[JsonExpectation]) -> Result<()> {
    if checks.is_empty() {
        return Ok(());
    }

    let document: serde_json::Value = serde_json::from_str(text.trim())
        .map_err(|e| Error::assertion(format!("{} is not valid JSON: {}", subject, e)))?;

    for check in checks {
        let value = document.pointer(&check.pointer);
        if check.not_null && value.map_or(true, serde_json::Value::is_null) {
            return Err(Error::assertion(format!(
                "{}: expected '{}' to be non-null",
                subject, check.pointer
            )));
        }
        if let Some(expected) = &check.equals {
            if value != Some(expected) {
                return Err(Error::assertion(format!(
                    "{}: expected '{}' to equal {}, got {}",
                    subject,
                    check.pointer,
                    expected,
                    value.map_or_else(|| "nothing".to_string(), |v| v.to_string())
                )));
            }
        }
    }
    Ok(())
}

/// Where and why a test stopped
#[derive(Debug, Clone)]
pub struct StepFailure {
    pub step: String,
    pub kind: ErrorKind,
    pub message: String,
}

/// Mutable state of one running test
pub struct TestRun<'a> {
    executor: &'a dyn RemoteExecutor,
    topology: &'a Topology,
    step_targets: Vec<Vec<&'a Host>>,
    vars: Variables,
    teardown: TeardownRegistry,
    commands: Vec<CommandRecord>,
    steps: Vec<StepRecord>,
}

impl<'a> TestRun<'a> {
    pub fn new(
        executor: &'a dyn RemoteExecutor,
        topology: &'a Topology,
        step_targets: Vec<Vec<&'a Host>>,
        vars: Variables,
    ) -> Self {
        Self {
            executor,
            topology,
            step_targets,
            vars,
            teardown: TeardownRegistry::new(),
            commands: Vec::new(),
            steps: Vec::new(),
        }
    }
}

/// Execute the steps of a test in order, stopping at the first failure
///
/// Completed steps are recorded in `run`, so the record survives if this
/// future is dropped part-way.
pub async fn run_steps(test: &TestCase, run: &mut TestRun<'_>) -> std::result::Result<(), StepFailure> {
    for (index, step) in test.steps.iter().enumerate() {
        tracing::debug!(test = %test.name, "step: {}", step.name);
        let started = Instant::now();
        let commands_before = run.commands.len();

        let result = {
            let targets = run.step_targets.get(index).map(Vec::as_slice).unwrap_or(&[]);
            let mut ctx = StepContext {
                executor: run.executor,
                step: &step.name,
                targets,
                vars: &mut run.vars,
                teardown: &mut run.teardown,
                commands: &mut run.commands,
            };
            step.action.execute(&mut ctx).await
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        match result {
            Ok(()) => run.steps.push(StepRecord {
                name: step.name.clone(),
                status: StepStatus::Passed,
                duration_ms,
            }),
            Err(e) => {
                let kind = match e.kind() {
                    ErrorKind::Assertion => ErrorKind::Assertion,
                    _ => ErrorKind::Execution,
                };
                run.steps.push(StepRecord {
                    name: step.name.clone(),
                    status: if kind == ErrorKind::Assertion {
                        StepStatus::Failed
                    } else {
                        StepStatus::Errored
                    },
                    duration_ms,
                });

                let mut message = format!("step '{}': {}", step.name, e);
                match e.captured_output() {
                    Some((stdout, stderr)) => message.push_str(&format_captured(stdout, stderr)),
                    None => {
                        if let Some(last) = run.commands[commands_before..].last() {
                            message.push_str(&format_captured(&last.stdout, &last.stderr));
                        }
                    }
                }

                return Err(StepFailure {
                    step: step.name.clone(),
                    kind,
                    message,
                });
            }
        }
    }
    Ok(())
}

/// Run a test to completion: steps, then teardown, then the result
///
/// Teardown runs exactly once whether the steps pass, fail, error or are
/// cut short by `interrupt`. Returns the result and the variables the test
/// exported.
pub async fn execute_test(
    test: &TestCase,
    mut run: TestRun<'_>,
    interrupt: &Interrupt,
    policy: TeardownFailurePolicy,
) -> (TestResult, BTreeMap<String, String>) {
    tracing::info!("Running test {}", test.name);
    let started = Instant::now();

    let steps_result = {
        let steps = run_steps(test, &mut run);
        tokio::select! {
            result = steps => result,
            _ = interrupt.wait() => Err(StepFailure {
                step: String::new(),
                kind: ErrorKind::Execution,
                message: Error::Interrupted.to_string(),
            }),
        }
    };

    // An interrupted step never recorded itself
    let steps_result = steps_result.map_err(|mut failure| {
        if failure.step.is_empty() {
            if let Some(step) = test.steps.get(run.steps.len()) {
                failure.step = step.name.clone();
                failure.message = format!("step '{}': {}", step.name, failure.message);
                run.steps.push(StepRecord {
                    name: step.name.clone(),
                    status: StepStatus::Errored,
                    duration_ms: 0,
                });
            }
        }
        failure
    });

    let registry = std::mem::take(&mut run.teardown);
    if !registry.is_empty() {
        tracing::debug!("Running {} teardown actions for {}", registry.len(), test.name);
    }
    let vars = &run.vars;
    let teardown = registry
        .run_all(run.executor, run.topology, |host, command| {
            vars.expand(command, Some(host))
        })
        .await;

    for step in &test.steps[run.steps.len().min(test.steps.len())..] {
        run.steps.push(StepRecord {
            name: step.name.clone(),
            status: StepStatus::NotRun,
            duration_ms: 0,
        });
    }

    let warnings = match policy {
        TeardownFailurePolicy::Warn => teardown
            .iter()
            .filter(|r| !r.success)
            .map(|r| {
                format!(
                    "teardown '{}' on {} failed: {}",
                    r.command,
                    r.host,
                    r.error.as_deref().unwrap_or("unknown error")
                )
            })
            .collect(),
        TeardownFailurePolicy::Log => Vec::new(),
    };

    let (outcome, message, failed_step) = match steps_result {
        Ok(()) => (Outcome::Pass, None, None),
        Err(failure) => {
            let outcome = if failure.kind == ErrorKind::Assertion {
                Outcome::Fail
            } else {
                Outcome::Error
            };
            (outcome, Some(failure.message), Some(failure.step))
        }
    };

    let duration_ms = started.elapsed().as_millis() as u64;
    tracing::info!("Test {} finished: {}", test.name, outcome);

    let result = TestResult {
        test_name: test.name.clone(),
        outcome,
        duration_ms,
        message,
        failed_step,
        steps: run.steps,
        commands: run.commands,
        teardown,
        warnings,
    };
    (result, run.vars.into_exports())
}
