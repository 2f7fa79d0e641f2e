//! Suite orchestration
//!
//! Discovers tests, applies the name filter and confinement, resolves step
//! targets up front, then runs tests one at a time (or in waves of
//! independent tests) and aggregates the results.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Instant;

use futures_util::future::join_all;

use crate::common::config::TeardownFailurePolicy;
use crate::common::{paths, wildcard_match, Error, Result};
use crate::confine::Decision;
use crate::exec::RemoteExecutor;
use crate::topology::{Host, Topology};

use super::interrupt::Interrupt;
use super::report::{Outcome, SuiteReport, TestResult};
use super::steps::{execute_test, TestCase, TestRun};
use super::vars::Variables;

/// An ordered collection of tests
#[derive(Debug, Default)]
pub struct Suite {
    pub tests: Vec<TestCase>,
}

impl Suite {
    pub fn new(tests: Vec<TestCase>) -> Self {
        Self { tests }
    }

    /// Load every `*.yaml`/`*.yml` file under `dir`, ordered by path
    pub fn discover(dir: &Path) -> Result<Self> {
        if !dir.is_dir() {
            return Err(Error::suite_load(dir, "not a directory"));
        }

        let mut files = Vec::new();
        collect_test_files(dir, &mut files)?;
        files.sort();

        let tests = files
            .iter()
            .map(|file| TestCase::load(dir, file))
            .collect::<Result<Vec<_>>>()?;

        let mut names = BTreeSet::new();
        for test in &tests {
            if !names.insert(test.name.as_str()) {
                return Err(Error::suite_load(
                    dir,
                    format!("test name '{}' is used more than once", test.name),
                ));
            }
        }

        tracing::debug!("Discovered {} tests in {}", tests.len(), dir.display());
        Ok(Self { tests })
    }
}

fn collect_test_files(dir: &Path, files: &mut Vec<PathBuf>) -> Result<()> {
    let entries = std::fs::read_dir(dir).map_err(|e| Error::suite_load(dir, e))?;
    for entry in entries {
        let path = entry.map_err(|e| Error::suite_load(dir, e))?.path();
        if path.is_dir() {
            collect_test_files(&path, files)?;
        } else if paths::is_test_file(&path) {
            files.push(path);
        }
    }
    Ok(())
}

/// Options for a suite run
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Stop after the first fail or error
    pub fail_fast: bool,
    /// Wildcard pattern on test names
    pub filter: Option<String>,
    /// Maximum number of tests running at once
    pub parallel: usize,
    /// Suite-scoped variables
    pub variables: BTreeMap<String, String>,
    pub teardown_failures: TeardownFailurePolicy,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            fail_fast: false,
            filter: None,
            parallel: 1,
            variables: BTreeMap::new(),
            teardown_failures: TeardownFailurePolicy::default(),
        }
    }
}

/// How a selected test will be handled
pub enum Plan<'s, 't> {
    Skip { test: &'s TestCase, reason: String },
    Run {
        test: &'s TestCase,
        targets: Vec<Vec<&'t Host>>,
        /// Every host the test touches
        hosts: BTreeSet<String>,
    },
}

impl Plan<'_, '_> {
    pub fn test(&self) -> &TestCase {
        match self {
            Plan::Skip { test, .. } | Plan::Run { test, .. } => test,
        }
    }
}

/// Select tests, evaluate confinement and resolve targets
///
/// Issues no remote commands. A target that matches no host fails the
/// whole plan.
pub fn plan<'s, 't>(
    suite: &'s Suite,
    topology: &'t Topology,
    filter: Option<&str>,
) -> Result<Vec<Plan<'s, 't>>> {
    suite
        .tests
        .iter()
        .filter(|test| filter.map_or(true, |pattern| wildcard_match(pattern, &test.name)))
        .map(|test| match test.confinement.evaluate(topology.hosts()) {
            Decision::Skip { reason } => Ok(Plan::Skip { test, reason }),
            Decision::Applies { hosts } => {
                let targets = test.resolve_targets(topology, &hosts)?;
                let hosts = targets
                    .iter()
                    .flatten()
                    .map(|h| h.name.clone())
                    .collect();
                Ok(Plan::Run {
                    test,
                    targets,
                    hosts,
                })
            }
        })
        .collect()
}

/// Runs suites against a topology
pub struct Orchestrator<'a> {
    executor: &'a dyn RemoteExecutor,
    options: RunOptions,
    interrupt: Interrupt,
}

impl<'a> Orchestrator<'a> {
    pub fn new(executor: &'a dyn RemoteExecutor, options: RunOptions) -> Self {
        Self {
            executor,
            options,
            interrupt: Interrupt::never(),
        }
    }

    pub fn with_interrupt(mut self, interrupt: Interrupt) -> Self {
        self.interrupt = interrupt;
        self
    }

    /// Run a suite
    ///
    /// Individual test failures end up in the report; only planning faults
    /// are returned as errors, before any test runs.
    pub async fn run(&self, suite: &Suite, topology: &Topology) -> Result<SuiteReport> {
        let started = Instant::now();
        let plans = plan(suite, topology, self.options.filter.as_deref())?;

        let mut results: Vec<Option<TestResult>> = plans
            .iter()
            .map(|p| match p {
                Plan::Skip { test, reason } => {
                    tracing::info!("Skipping {}: {}", test.name, reason);
                    Some(TestResult::without_steps(&test.name, Outcome::Skip, reason.clone()))
                }
                Plan::Run { .. } => None,
            })
            .collect();

        let runnable: Vec<usize> = plans
            .iter()
            .enumerate()
            .filter(|(_, p)| matches!(p, Plan::Run { .. }))
            .map(|(i, _)| i)
            .collect();

        let mut suite_vars = topology.variables().clone();
        suite_vars.extend(self.options.variables.clone());

        let mut next = 0;
        let mut stop_reason: Option<&str> = None;
        while next < runnable.len() {
            if self.interrupt.is_triggered() {
                stop_reason = Some("not run: interrupted");
                break;
            }

            let wave = self.next_wave(&plans, &runnable[next..]);
            next += wave.len();

            let interrupt = &self.interrupt;
            let policy = self.options.teardown_failures;
            let runs = wave.iter().filter_map(|&index| match &plans[index] {
                Plan::Run { test, targets, .. } => {
                    let vars = Variables::new(suite_vars.clone(), &test.exports);
                    let run = TestRun::new(self.executor, topology, targets.clone(), vars);
                    Some(async move { (index, execute_test(test, run, interrupt, policy).await) })
                }
                Plan::Skip { .. } => None,
            });
            let finished = join_all(runs).await;

            let mut failed = false;
            for (index, (result, exports)) in finished {
                failed |= matches!(result.outcome, Outcome::Fail | Outcome::Error);
                suite_vars.extend(exports);
                results[index] = Some(result);
            }

            if self.interrupt.is_triggered() {
                stop_reason = Some("not run: interrupted");
                break;
            }
            if failed && self.options.fail_fast {
                stop_reason = Some("not run: stopped after an earlier failure");
                break;
            }
        }

        let reason = stop_reason.unwrap_or("not run");
        let results = plans
            .iter()
            .zip(results)
            .map(|(p, r)| r.unwrap_or_else(|| TestResult::without_steps(&p.test().name, Outcome::NotRun, reason)))
            .collect();

        Ok(SuiteReport::new(results, started.elapsed().as_millis() as u64))
    }

    /// Indices (into `plans`) of the tests to run together next
    ///
    /// Takes tests in order while they touch disjoint hosts and export
    /// nothing; a test that exports variables always runs alone.
    fn next_wave(&self, plans: &[Plan<'_, '_>], pending: &[usize]) -> Vec<usize> {
        let limit = self.options.parallel.max(1);
        let mut wave = Vec::new();
        let mut busy: BTreeSet<&str> = BTreeSet::new();

        for &index in pending {
            let Plan::Run { test, hosts, .. } = &plans[index] else {
                continue;
            };
            let exclusive = !test.exports.is_empty();

            if !wave.is_empty()
                && (exclusive || wave.len() >= limit || hosts.iter().any(|h| busy.contains(h.as_str())))
            {
                break;
            }

            wave.push(index);
            busy.extend(hosts.iter().map(String::as_str));
            if exclusive {
                break;
            }
        }
        wave
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::confine::{Clause, Confinement};
    use crate::testing::config::TestDefinition;
    use crate::testing::mock::RecordingExecutor;
    use crate::testing::report::OutcomeCounts;

    fn topology() -> Topology {
        Topology::parse(
            r#"
hosts:
  - name: master
    roles: [master]
    platform: el-8-x86_64
  - name: agent1
    roles: [agent]
    platform: el-8-x86_64
  - name: agent2
    roles: [agent]
    platform: el-8-x86_64
"#,
        )
        .unwrap()
    }

    fn test(name: &str, yaml: &str) -> TestCase {
        let definition: TestDefinition = serde_yaml::from_str(yaml).unwrap();
        TestCase::from_definition(definition, name.to_string()).unwrap()
    }

    fn command_test(name: &str, on: &str, command: &str) -> TestCase {
        test(
            name,
            &format!(
                "steps:\n  - name: {name}\n    on: {on}\n    actions:\n      - action: run\n        command: {command}\n"
            ),
        )
    }

    #[tokio::test]
    async fn test_confined_test_is_skipped_without_commands() {
        let suite = Suite::new(vec![
            command_test("el7-only", "master", "echo el7").confine(Confinement::new(vec![
                Clause::Platform(vec!["el-7*".into()]),
            ])),
            command_test("anywhere", "master", "echo ok"),
        ]);
        let executor = RecordingExecutor::new();
        let report = Orchestrator::new(&executor, RunOptions::default())
            .run(&suite, &topology())
            .await
            .unwrap();

        let skipped = report.result("el7-only").unwrap();
        assert_eq!(skipped.outcome, Outcome::Skip);
        assert!(skipped.message.as_deref().unwrap().contains("el-7*"));
        assert_eq!(executor.commands(), vec!["echo ok"]);
        assert_eq!(report.exit_code(), 0);
    }

    #[tokio::test]
    async fn test_failures_do_not_stop_siblings() {
        let suite = Suite::new(vec![
            command_test("a", "master", "false-a"),
            command_test("b", "master", "echo b"),
        ]);
        let executor = RecordingExecutor::new().respond("false-a", 1, "", "");
        let report = Orchestrator::new(&executor, RunOptions::default())
            .run(&suite, &topology())
            .await
            .unwrap();

        assert_eq!(report.result("a").unwrap().outcome, Outcome::Error);
        assert_eq!(report.result("b").unwrap().outcome, Outcome::Pass);
        assert_eq!(report.exit_code(), 2);
    }

    #[tokio::test]
    async fn test_fail_fast_marks_rest_not_run() {
        let suite = Suite::new(vec![
            test(
                "t1",
                "steps:\n  - name: check\n    actions:\n      - action: assert\n        variable: missing\n",
            ),
            command_test("t2", "master", "echo t2"),
        ]);
        let executor = RecordingExecutor::new();
        let options = RunOptions {
            fail_fast: true,
            ..RunOptions::default()
        };
        let report = Orchestrator::new(&executor, options)
            .run(&suite, &topology())
            .await
            .unwrap();

        assert_eq!(report.result("t1").unwrap().outcome, Outcome::Fail);
        assert_eq!(report.result("t2").unwrap().outcome, Outcome::NotRun);
        assert_eq!(executor.count("echo t2"), 0);
        assert_eq!(
            report.counts,
            OutcomeCounts {
                fail: 1,
                not_run: 1,
                ..OutcomeCounts::default()
            }
        );
        assert_eq!(report.exit_code(), 1);
    }

    #[tokio::test]
    async fn test_interrupt_stops_the_suite() {
        let suite = Suite::new(vec![
            test(
                "long",
                "steps:\n  - name: agent\n    on: master\n    actions:\n      - action: run\n        command: sleep forever\n    teardown:\n      - rm -f /tmp/lock\n",
            ),
            command_test("later", "agent1", "echo later"),
            command_test("el7-only", "master", "echo el7").confine(Confinement::new(vec![
                Clause::Platform(vec!["el-7*".into()]),
            ])),
        ]);
        let executor = RecordingExecutor::new().hang("sleep forever");
        let (handle, interrupt) = Interrupt::channel();

        let orchestrator = Orchestrator::new(&executor, RunOptions::default()).with_interrupt(interrupt);
        let trigger = async {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            handle.trigger();
        };
        let topology = topology();
        let (report, ()) = tokio::join!(orchestrator.run(&suite, &topology), trigger);
        let report = report.unwrap();

        let long = report.result("long").unwrap();
        assert_eq!(long.outcome, Outcome::Error);
        assert!(long.message.as_deref().unwrap().contains("interrupted"));
        assert_eq!(executor.count("rm -f /tmp/lock"), 1);

        let later = report.result("later").unwrap();
        assert_eq!(later.outcome, Outcome::NotRun);
        assert_eq!(later.message.as_deref(), Some("not run: interrupted"));
        assert_eq!(executor.count("echo later"), 0);

        assert_eq!(report.result("el7-only").unwrap().outcome, Outcome::Skip);
        assert_eq!(report.exit_code(), 2);
    }

    #[tokio::test]
    async fn test_filter_excludes_tests_from_report() {
        let suite = Suite::new(vec![
            command_test("puppetdb/integration", "master", "echo db"),
            command_test("server/restart", "master", "echo restart"),
        ]);
        let executor = RecordingExecutor::new();
        let options = RunOptions {
            filter: Some("puppetdb/*".into()),
            ..RunOptions::default()
        };
        let report = Orchestrator::new(&executor, options)
            .run(&suite, &topology())
            .await
            .unwrap();

        assert_eq!(report.results.len(), 1);
        assert_eq!(executor.commands(), vec!["echo db"]);
    }

    #[tokio::test]
    async fn test_unresolvable_target_is_orchestration_fault() {
        let suite = Suite::new(vec![
            command_test("ok", "master", "echo ok"),
            command_test("dashboard", "dashboard", "echo dash"),
        ]);
        let executor = RecordingExecutor::new();
        let err = Orchestrator::new(&executor, RunOptions::default())
            .run(&suite, &topology())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::NoHostForTarget { .. }));
        assert!(executor.commands().is_empty());
    }

    #[tokio::test]
    async fn test_exports_reach_later_tests() {
        let suite = Suite::new(vec![
            test(
                "producer",
                "exports: [token]\nsteps:\n  - name: make\n    actions:\n      - action: run\n        command: make-token\n        capture: token\n",
            ),
            command_test("consumer", "master", "use {{ token }}"),
        ]);
        let executor = RecordingExecutor::new().respond("make-token", 0, "t-123\n", "");
        let report = Orchestrator::new(&executor, RunOptions::default())
            .run(&suite, &topology())
            .await
            .unwrap();

        assert_eq!(report.result("consumer").unwrap().outcome, Outcome::Pass);
        assert_eq!(executor.commands(), vec!["make-token", "use t-123"]);
    }

    #[test]
    fn test_waves_keep_hosts_disjoint() {
        let suite = Suite::new(vec![
            command_test("a", "agent1", "a"),
            command_test("b", "agent2", "b"),
            command_test("c", "agent1", "c"),
            command_test("d", "master", "d"),
            test(
                "e",
                "exports: [x]\nsteps:\n  - name: e\n    on: agent2\n    actions:\n      - action: run\n        command: e\n",
            ),
        ]);
        let topology = topology();
        let plans = plan(&suite, &topology, None).unwrap();
        let runnable: Vec<usize> = (0..plans.len()).collect();

        let executor = RecordingExecutor::new();
        let orchestrator = Orchestrator::new(
            &executor,
            RunOptions {
                parallel: 4,
                ..RunOptions::default()
            },
        );

        // a and b share nothing; c needs agent1 again
        assert_eq!(orchestrator.next_wave(&plans, &runnable), vec![0, 1]);
        assert_eq!(orchestrator.next_wave(&plans, &runnable[2..]), vec![2, 3]);
        // exporting tests run alone
        assert_eq!(orchestrator.next_wave(&plans, &runnable[4..]), vec![4]);

        let sequential = Orchestrator::new(&executor, RunOptions::default());
        assert_eq!(sequential.next_wave(&plans, &runnable), vec![0]);
    }

    #[tokio::test]
    async fn test_parallel_run_reports_in_discovery_order() {
        let suite = Suite::new(vec![
            command_test("a", "agent1", "echo a"),
            command_test("b", "agent2", "echo b"),
            command_test("c", "master", "echo c"),
        ]);
        let executor = RecordingExecutor::new();
        let options = RunOptions {
            parallel: 3,
            ..RunOptions::default()
        };
        let report = Orchestrator::new(&executor, options)
            .run(&suite, &topology())
            .await
            .unwrap();

        let names: Vec<_> = report.results.iter().map(|r| r.test_name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert_eq!(report.counts.pass, 3);
    }

    #[test]
    fn test_discover_infers_names() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("puppetdb")).unwrap();
        std::fs::write(
            dir.path().join("puppetdb/integration.yaml"),
            "steps:\n  - name: s\n    actions:\n      - action: run\n        command: \"true\"\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("basic.yml"),
            "name: Basic smoke\nsteps:\n  - name: s\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("README.md"), "not a test").unwrap();

        let suite = Suite::discover(dir.path()).unwrap();
        let names: Vec<_> = suite.tests.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["Basic smoke", "puppetdb/integration"]);
    }

    #[test]
    fn test_discover_reports_broken_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("broken.yaml"), "steps: [").unwrap();
        let err = Suite::discover(dir.path()).unwrap_err();
        assert!(matches!(err, Error::SuiteLoad { .. }));
    }
}
