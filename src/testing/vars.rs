//! Test variables and `{{ name }}` expansion

use std::collections::{BTreeMap, BTreeSet};

use crate::common::{Error, Result};
use crate::topology::Host;

/// Variables visible to one test
///
/// Values set by the test shadow suite values. Names listed as exports are
/// also collected so the orchestrator can publish them to later tests.
#[derive(Debug, Clone, Default)]
pub struct Variables {
    suite: BTreeMap<String, String>,
    test: BTreeMap<String, String>,
    exportable: BTreeSet<String>,
    exported: BTreeMap<String, String>,
}

impl Variables {
    pub fn new(suite: BTreeMap<String, String>, exports: &[String]) -> Self {
        Self {
            suite,
            test: BTreeMap::new(),
            exportable: exports.iter().cloned().collect(),
            exported: BTreeMap::new(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.test
            .get(name)
            .or_else(|| self.suite.get(name))
            .map(String::as_str)
    }

    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        if self.exportable.contains(name) {
            self.exported.insert(name.to_string(), value.clone());
        }
        self.test.insert(name.to_string(), value);
    }

    /// Exported values, to be merged into the suite scope
    pub fn into_exports(self) -> BTreeMap<String, String> {
        self.exported
    }

    /// Expand `{{ name }}` references
    ///
    /// `host`, `host.address` and `host.platform` refer to the host the
    /// template is expanded for. Unknown names are an error.
    pub fn expand(&self, template: &str, host: Option<&Host>) -> Result<String> {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(start) = rest.find("{{") {
            let Some(len) = rest[start + 2..].find("}}") else {
                break;
            };
            out.push_str(&rest[..start]);
            let name = rest[start + 2..start + 2 + len].trim();
            out.push_str(&self.lookup(name, host)?);
            rest = &rest[start + 2 + len + 2..];
        }

        out.push_str(rest);
        Ok(out)
    }

    fn lookup(&self, name: &str, host: Option<&Host>) -> Result<String> {
        let builtin = host.and_then(|h| match name {
            "host" => Some(h.name.clone()),
            "host.address" => Some(h.address().to_string()),
            "host.platform" => Some(h.platform.clone()),
            _ => None,
        });
        builtin
            .or_else(|| self.get(name).map(str::to_string))
            .ok_or_else(|| Error::UndefinedVariable(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::Topology;

    fn suite_vars() -> BTreeMap<String, String> {
        BTreeMap::from([("puppetservice".to_string(), "puppetserver".to_string())])
    }

    #[test]
    fn test_expand_builtins_and_variables() {
        let topology = Topology::parse(
            "hosts:\n  - name: master\n    address: 10.0.0.5\n    platform: el-8\n",
        )
        .unwrap();
        let mut vars = Variables::new(suite_vars(), &[]);
        vars.set("fqdn", "master.example.com");

        let host = topology.host("master");
        assert_eq!(
            vars.expand("agent --server {{host}} ({{ host.address }}, {{host.platform}})", host)
                .unwrap(),
            "agent --server master (10.0.0.5, el-8)"
        );
        assert_eq!(
            vars.expand("curl /nodes/{{ fqdn }} -s {{puppetservice}}", host).unwrap(),
            "curl /nodes/master.example.com -s puppetserver"
        );
    }

    #[test]
    fn test_expand_leaves_shell_syntax_alone() {
        let vars = Variables::new(BTreeMap::new(), &[]);
        assert_eq!(
            vars.expand("echo ${HOME} {{ unterminated", None).unwrap(),
            "echo ${HOME} {{ unterminated"
        );
    }

    #[test]
    fn test_expand_undefined_variable() {
        let vars = Variables::new(BTreeMap::new(), &[]);
        let err = vars.expand("{{ fqdn }}", None).unwrap_err();
        assert!(matches!(err, Error::UndefinedVariable(ref name) if name == "fqdn"));
    }

    #[test]
    fn test_test_values_shadow_suite_values() {
        let mut vars = Variables::new(suite_vars(), &["token".to_string()]);
        vars.set("puppetservice", "puppet");
        vars.set("token", "abc");
        assert_eq!(vars.get("puppetservice"), Some("puppet"));

        let exports = vars.into_exports();
        assert_eq!(exports.len(), 1);
        assert_eq!(exports["token"], "abc");
    }
}
