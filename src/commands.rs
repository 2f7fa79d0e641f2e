//! CLI command definitions
//!
//! Defines the clap commands for the acceptor CLI.

use clap::Subcommand;
use std::path::PathBuf;

#[derive(Subcommand)]
pub enum Commands {
    /// Run a suite of acceptance tests
    Run {
        /// Directory containing YAML test definitions
        suite_dir: PathBuf,

        /// Topology file describing the hosts
        #[arg(long, short)]
        topology: PathBuf,

        /// Only run tests whose name matches this pattern (* and ? wildcards)
        #[arg(long)]
        filter: Option<String>,

        /// Stop after the first failing or erroring test
        #[arg(long)]
        fail_fast: bool,

        /// Run up to N independent tests at once
        #[arg(long, value_name = "N")]
        parallel: Option<usize>,

        /// Also write the report to this file (.json, .yaml or .yml)
        #[arg(long)]
        report: Option<PathBuf>,

        /// Suite variable available to tests as {{ KEY }}
        /// Can be specified multiple times: --var puppetservice=puppetserver
        #[arg(long = "var", value_name = "KEY=VALUE", value_parser = parse_var)]
        vars: Vec<(String, String)>,
    },

    /// Show which tests apply to a topology, without running anything
    List {
        /// Directory containing YAML test definitions
        suite_dir: PathBuf,

        /// Topology file describing the hosts
        #[arg(long, short)]
        topology: PathBuf,

        /// Only list tests whose name matches this pattern
        #[arg(long)]
        filter: Option<String>,
    },

    /// Print the hosts of a topology
    Hosts {
        /// Topology file describing the hosts
        #[arg(long, short)]
        topology: PathBuf,
    },
}

/// Parse a `KEY=VALUE` pair
fn parse_var(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected KEY=VALUE, got '{}'", s)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_var() {
        assert_eq!(
            parse_var("puppetservice=puppetserver").unwrap(),
            ("puppetservice".to_string(), "puppetserver".to_string())
        );
        assert_eq!(parse_var("url=http://a?b=c").unwrap().1, "http://a?b=c");
        assert!(parse_var("novalue").is_err());
        assert!(parse_var("=x").is_err());
    }
}
