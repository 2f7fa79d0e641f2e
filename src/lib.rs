//! Acceptance-test orchestrator
//!
//! Runs suites of declarative, step-based integration tests against the
//! hosts of a topology, with guaranteed teardown, confinement by platform
//! and role, and structured result reporting.

pub mod cli;
pub mod commands;
pub mod common;
pub mod confine;
pub mod exec;
pub mod teardown;
pub mod testing;
pub mod topology;

// Re-export commonly used types for tests
pub use common::{Error, Result};
pub use testing::{Outcome, SuiteReport};
