//! Test definition file format
//!
//! Defines the data structures for deserializing YAML test definitions.

use serde::Deserialize;

use crate::confine::Confinement;

/// A complete test loaded from a YAML file
#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
pub struct TestDefinition {
    /// Name of the test; inferred from the file path when absent
    pub name: Option<String>,
    /// Optional description of what the test verifies
    pub description: Option<String>,
    /// Where the test may run
    #[serde(default)]
    pub confine: Confinement,
    /// Variables this test publishes to later tests in the suite
    #[serde(default)]
    pub exports: Vec<String>,
    /// The sequence of steps to execute
    pub steps: Vec<StepDefinition>,
}

/// A named step
#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct StepDefinition {
    /// Step name, shown in reports
    pub name: String,
    /// Host name or role to run on (default: first host admitted by the confinement)
    pub on: Option<String>,
    /// Actions, executed in order
    #[serde(default)]
    pub actions: Vec<Action>,
    /// Cleanup commands, registered before the actions run
    #[serde(default)]
    pub teardown: Vec<String>,
}

/// A single action inside a step
#[derive(Deserialize, Debug, Clone)]
#[serde(tag = "action", rename_all = "snake_case", deny_unknown_fields)]
pub enum Action {
    /// Run a command on every target host
    Run {
        /// The command to execute
        command: String,
        /// Exit codes that count as success (default: [0])
        acceptable_exit_codes: Option<Vec<i32>>,
        /// Timeout in seconds
        timeout_secs: Option<u64>,
        /// Store the trimmed stdout in this variable
        capture: Option<String>,
        /// Assertions on the command output
        expect: Option<OutputExpectation>,
    },
    /// Create a file on every target host
    WriteFile {
        path: String,
        content: String,
        /// Octal permission bits, e.g. "0644"
        mode: Option<String>,
    },
    /// Check a variable captured by an earlier action
    Assert {
        variable: String,
        #[serde(default)]
        not_empty: bool,
        equals: Option<String>,
        contains: Option<String>,
        #[serde(default)]
        json: Vec<JsonExpectation>,
    },
}

/// Expectations for a command's output
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct OutputExpectation {
    /// Substring that should be in stdout
    pub stdout_contains: Option<String>,
    /// Expected stdout, compared after trimming
    pub stdout_equals: Option<String>,
    /// Checks on stdout parsed as JSON
    #[serde(default)]
    pub json: Vec<JsonExpectation>,
}

/// Assertion on a value inside a JSON document
#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct JsonExpectation {
    /// JSON pointer, e.g. "/report_timestamp"
    pub pointer: String,
    /// The value must exist and not be null
    #[serde(default)]
    pub not_null: bool,
    /// Expected value
    pub equals: Option<serde_json::Value>,
}

/// Parse an octal mode string ("0644", "755")
pub fn parse_mode(mode: &str) -> Option<u32> {
    let digits = mode.trim().trim_start_matches("0o");
    if digits.is_empty() {
        return None;
    }
    u32::from_str_radix(digits, 8).ok().filter(|m| *m <= 0o7777)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PUPPETDB: &str = r#"
name: PuppetDB integration
description: PuppetDB receives agent reports from a co-located server
confine:
  - platform: [el-8*, el-9*]
  - role: master
steps:
  - name: Install PuppetDB module
    on: master
    actions:
      - action: run
        command: puppet module install puppetlabs-puppetdb
  - name: Configure PuppetDB via site.pp
    actions:
      - action: write_file
        path: /etc/puppetlabs/code/environments/production/manifests/site.pp
        content: "node default {}\n"
        mode: "0644"
    teardown:
      - rm -f /etc/puppetlabs/code/environments/production/manifests/site.pp
  - name: Install PuppetDB with agent run
    actions:
      - action: run
        command: puppet agent --test --server {{ host }}
        acceptable_exit_codes: [0, 2]
        timeout_secs: 900
  - name: Validate server sent agent report to PuppetDB
    actions:
      - action: run
        command: facter fqdn
        capture: fqdn
      - action: run
        command: curl http://localhost:8080/pdb/query/v4/nodes/{{ fqdn }}
        expect:
          json:
            - pointer: /report_timestamp
              not_null: true
"#;

    #[test]
    fn test_parse_definition() {
        let def: TestDefinition = serde_yaml::from_str(PUPPETDB).unwrap();
        assert_eq!(def.name.as_deref(), Some("PuppetDB integration"));
        assert_eq!(def.confine.clauses().len(), 2);
        assert_eq!(def.steps.len(), 4);
        assert_eq!(def.steps[0].on.as_deref(), Some("master"));
        assert_eq!(def.steps[1].teardown.len(), 1);

        match &def.steps[2].actions[0] {
            Action::Run {
                acceptable_exit_codes,
                timeout_secs,
                ..
            } => {
                assert_eq!(acceptable_exit_codes.as_deref(), Some(&[0, 2][..]));
                assert_eq!(*timeout_secs, Some(900));
            }
            other => panic!("Expected run action, got {:?}", other),
        }

        match &def.steps[3].actions[1] {
            Action::Run { expect, .. } => {
                let json = &expect.as_ref().unwrap().json;
                assert_eq!(json[0].pointer, "/report_timestamp");
                assert!(json[0].not_null);
            }
            other => panic!("Expected run action, got {:?}", other),
        }
    }

    #[test]
    fn test_rejects_unknown_action() {
        let result: Result<TestDefinition, _> = serde_yaml::from_str(
            "steps:\n  - name: s\n    actions:\n      - action: reboot\n",
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_rejects_misspelled_action_field() {
        let result: Result<TestDefinition, _> = serde_yaml::from_str(
            r#"
steps:
  - name: Install PuppetDB with agent run
    actions:
      - action: run
        command: puppet agent --test
        acceptable_exit_code: [0, 2]
"#,
        );
        let err = result.unwrap_err().to_string();
        assert!(err.contains("acceptable_exit_code"), "{}", err);
    }

    #[test]
    fn test_parse_mode() {
        assert_eq!(parse_mode("0644"), Some(0o644));
        assert_eq!(parse_mode("755"), Some(0o755));
        assert_eq!(parse_mode("0o600"), Some(0o600));
        assert_eq!(parse_mode("9"), None);
        assert_eq!(parse_mode(""), None);
    }
}
