//! CLI command handling
//!
//! Dispatches CLI commands and formats their output.

use std::path::Path;
use std::time::Duration;

use colored::Colorize;

use crate::commands::Commands;
use crate::common::config::Config;
use crate::common::{Error, Result};
use crate::exec::ShellExecutor;
use crate::testing::{self, Interrupt, Orchestrator, Plan, RunOptions, Suite, SuiteReport};
use crate::topology::Topology;

/// Exit code for faults that prevent a run from producing a report
pub const EXIT_ORCHESTRATION_FAULT: i32 = 3;

/// Dispatch a CLI command, returning the process exit code
pub async fn dispatch(command: Commands, config: Config) -> Result<i32> {
    match command {
        Commands::Run {
            suite_dir,
            topology,
            filter,
            fail_fast,
            parallel,
            report,
            vars,
        } => {
            let topology = Topology::load(&topology)?;
            let suite = Suite::discover(&suite_dir)?;

            let mut variables = config.variables.clone();
            variables.extend(vars);

            let options = RunOptions {
                fail_fast: fail_fast || config.run.fail_fast,
                filter,
                parallel: parallel.unwrap_or(config.run.parallel).max(1),
                variables,
                teardown_failures: config.report.teardown_failures,
            };

            let executor = build_executor(&config, &topology)?;
            let report_data = Orchestrator::new(&executor, options)
                .with_interrupt(Interrupt::from_signals()?)
                .run(&suite, &topology)
                .await?;

            print_report(&report_data);
            if let Some(path) = report {
                write_report(&report_data, &path)?;
            }

            Ok(report_data.exit_code())
        }

        Commands::List {
            suite_dir,
            topology,
            filter,
        } => {
            let topology = Topology::load(&topology)?;
            let suite = Suite::discover(&suite_dir)?;
            let plans = testing::plan(&suite, &topology, filter.as_deref())?;

            if plans.is_empty() {
                println!("No tests selected");
            }
            for plan in &plans {
                match plan {
                    Plan::Run { test, hosts, .. } => {
                        let hosts: Vec<&str> = hosts.iter().map(String::as_str).collect();
                        println!(
                            "  {} {} {}",
                            "run ".green(),
                            test.name,
                            format!("({})", hosts.join(", ")).dimmed()
                        );
                    }
                    Plan::Skip { test, reason } => {
                        println!("  {} {} {}", "skip".yellow(), test.name, reason.dimmed());
                    }
                }
            }
            Ok(0)
        }

        Commands::Hosts { topology } => {
            let topology = Topology::load(&topology)?;
            for host in topology.hosts() {
                let roles: Vec<&str> = host.roles.iter().map(String::as_str).collect();
                println!(
                    "{}  {}  {}  [{}]",
                    host.name.bold(),
                    host.address().dimmed(),
                    host.platform,
                    roles.join(", ")
                );
                println!("    transport: {}", host.transport);
            }
            Ok(0)
        }
    }
}

/// Build the process executor, checking the ssh client only when a host needs it
fn build_executor(config: &Config, topology: &Topology) -> Result<ShellExecutor> {
    let needs_ssh = topology
        .hosts()
        .iter()
        .any(|h| h.transport == crate::topology::Transport::Ssh);

    let ssh_program = if needs_ssh {
        config.ssh_program()?
    } else {
        config.executor.ssh_program.clone()
    };

    Ok(ShellExecutor::new(
        ssh_program,
        Duration::from_secs(config.executor.connect_timeout_secs),
    )
    .with_default_timeout(config.executor.default_timeout()))
}

fn print_report(report: &SuiteReport) {
    println!();
    for result in &report.results {
        if let Some(message) = &result.message {
            if matches!(
                result.outcome,
                testing::Outcome::Fail | testing::Outcome::Error
            ) {
                println!("{} {}", "✗".red(), result.test_name.bold());
                for line in message.lines() {
                    println!("    {}", line);
                }
                println!();
            }
        }
        for warning in &result.warnings {
            println!("{} {}: {}", "!".yellow(), result.test_name, warning);
        }
    }
    print!("{}", report.render_table());
}

fn write_report(report: &SuiteReport, path: &Path) -> Result<()> {
    report.write_to(path).map_err(|e| Error::ReportWrite {
        path: path.display().to_string(),
        error: match e {
            Error::Io(io) => io.to_string(),
            other => other.to_string(),
        },
    })
}
