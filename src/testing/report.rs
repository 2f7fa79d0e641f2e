//! Test results and the suite report

use std::fmt;
use std::path::Path;

use colored::Colorize;
use serde::{Deserialize, Serialize};

use crate::common::{Error, Result};
use crate::teardown::TeardownRecord;

/// Final outcome of one test
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Outcome {
    Pass,
    /// An assertion did not hold
    Fail,
    /// Confinement excluded the test
    Skip,
    /// Infrastructure failure (unreachable host, unexpected exit code, timeout)
    Error,
    /// Not started because the run stopped early
    NotRun,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Outcome::Pass => "pass",
            Outcome::Fail => "fail",
            Outcome::Skip => "skip",
            Outcome::Error => "error",
            Outcome::NotRun => "not-run",
        };
        f.pad(s)
    }
}

/// Status of one step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepStatus {
    Passed,
    Failed,
    Errored,
    NotRun,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    pub name: String,
    pub status: StepStatus,
    pub duration_ms: u64,
}

/// A command issued while a test ran
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRecord {
    pub step: String,
    pub host: String,
    pub command: String,
    /// Missing when the command never finished (unreachable host, timeout)
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// Result of one test
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    pub test_name: String,
    pub outcome: Outcome,
    pub duration_ms: u64,
    /// Failure, error or skip reason
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub message: Option<String>,
    /// Step at which the test failed or errored
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub failed_step: Option<String>,
    #[serde(default)]
    pub steps: Vec<StepRecord>,
    #[serde(default)]
    pub commands: Vec<CommandRecord>,
    #[serde(default)]
    pub teardown: Vec<TeardownRecord>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl TestResult {
    /// A result for a test that never started
    pub fn without_steps(test_name: &str, outcome: Outcome, message: impl Into<String>) -> Self {
        Self {
            test_name: test_name.to_string(),
            outcome,
            duration_ms: 0,
            message: Some(message.into()),
            failed_step: None,
            steps: Vec::new(),
            commands: Vec::new(),
            teardown: Vec::new(),
            warnings: Vec::new(),
        }
    }
}

/// Number of results per outcome
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeCounts {
    pub pass: usize,
    pub fail: usize,
    pub skip: usize,
    pub error: usize,
    pub not_run: usize,
}

impl OutcomeCounts {
    pub fn from_results(results: &[TestResult]) -> Self {
        let mut counts = Self::default();
        for result in results {
            match result.outcome {
                Outcome::Pass => counts.pass += 1,
                Outcome::Fail => counts.fail += 1,
                Outcome::Skip => counts.skip += 1,
                Outcome::Error => counts.error += 1,
                Outcome::NotRun => counts.not_run += 1,
            }
        }
        counts
    }

    pub fn total(&self) -> usize {
        self.pass + self.fail + self.skip + self.error + self.not_run
    }
}

/// Aggregate of a whole run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuiteReport {
    pub results: Vec<TestResult>,
    pub counts: OutcomeCounts,
    pub duration_ms: u64,
    /// Teardown failures surfaced as warnings
    pub warnings: usize,
}

impl SuiteReport {
    pub fn new(results: Vec<TestResult>, duration_ms: u64) -> Self {
        let counts = OutcomeCounts::from_results(&results);
        let warnings = results.iter().map(|r| r.warnings.len()).sum();
        Self {
            results,
            counts,
            duration_ms,
            warnings,
        }
    }

    /// Process exit code: 1 on any fail, else 2 on any error, else 0
    pub fn exit_code(&self) -> i32 {
        if self.counts.fail > 0 {
            1
        } else if self.counts.error > 0 {
            2
        } else {
            0
        }
    }

    pub fn result(&self, test_name: &str) -> Option<&TestResult> {
        self.results.iter().find(|r| r.test_name == test_name)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(s: &str) -> Result<Self> {
        Ok(serde_json::from_str(s)?)
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| Error::Internal(format!("Failed to render report: {}", e)))
    }

    pub fn from_yaml(s: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(s)?)
    }

    /// Write the report; YAML for `.yaml`/`.yml`, JSON otherwise
    pub fn write_to(&self, path: &Path) -> Result<()> {
        let content = match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => self.to_yaml()?,
            _ => self.to_json()?,
        };
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Human-readable table of results plus totals
    pub fn render_table(&self) -> String {
        let name_width = self
            .results
            .iter()
            .map(|r| r.test_name.len())
            .max()
            .unwrap_or(0)
            .max("TEST".len());

        let mut out = format!(
            "{:<name_width$}  {:<8}  {:>9}  {}\n",
            "TEST".bold(),
            "OUTCOME".bold(),
            "DURATION".bold(),
            "MESSAGE".bold(),
            name_width = name_width
        );

        for result in &self.results {
            let outcome = format!("{:<8}", result.outcome);
            let outcome = match result.outcome {
                Outcome::Pass => outcome.green(),
                Outcome::Fail => outcome.red().bold(),
                Outcome::Error => outcome.red(),
                Outcome::Skip => outcome.yellow(),
                Outcome::NotRun => outcome.dimmed(),
            };
            let message = result
                .message
                .as_deref()
                .and_then(|m| m.lines().next())
                .unwrap_or("");
            out.push_str(&format!(
                "{:<name_width$}  {}  {:>8.2}s  {}\n",
                result.test_name,
                outcome,
                result.duration_ms as f64 / 1000.0,
                message,
                name_width = name_width
            ));
        }

        let c = &self.counts;
        out.push_str(&format!(
            "\n{} tests: {} passed, {} failed, {} errored, {} skipped, {} not run ({:.2}s)",
            c.total(),
            c.pass.to_string().green(),
            c.fail.to_string().red(),
            c.error.to_string().red(),
            c.skip.to_string().yellow(),
            c.not_run,
            self.duration_ms as f64 / 1000.0
        ));
        if self.warnings > 0 {
            out.push_str(&format!(", {} teardown warnings", self.warnings.to_string().yellow()));
        }
        out.push('\n');
        out
    }
}
