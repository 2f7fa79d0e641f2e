//! Acceptance test engine
//!
//! Loads YAML test definitions, runs their steps against the hosts of a
//! topology through a `RemoteExecutor`, and aggregates the outcomes into a
//! `SuiteReport`.

mod config;
mod interrupt;
#[cfg(test)]
pub(crate) mod mock;
mod orchestrator;
mod report;
mod steps;
mod vars;

pub use config::*;
pub use interrupt::{Interrupt, InterruptHandle};
pub use orchestrator::{plan, Orchestrator, Plan, RunOptions, Suite};
pub use report::{
    CommandRecord, Outcome, OutcomeCounts, StepRecord, StepStatus, SuiteReport, TestResult,
};
pub use steps::{execute_test, run_steps, Step, StepAction, StepContext, StepFailure, TestCase, TestRun};
pub use vars::Variables;
