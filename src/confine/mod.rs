//! Test confinement
//!
//! A confinement is a conjunction of clauses over host metadata. Each clause
//! narrows the set of candidate hosts; a test applies when at least one host
//! survives every clause. Evaluation only looks at the topology and never
//! touches a host.

use serde::Deserialize;
use std::fmt;

use crate::common::wildcard_match;
use crate::topology::Host;

/// One condition a host must satisfy
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "ClauseDef")]
pub enum Clause {
    /// Host platform matches one of the patterns (`el-8*`)
    Platform(Vec<String>),
    /// Host plays one of the roles
    Role(Vec<String>),
    /// Host is one of the named hosts
    Hosts(Vec<String>),
    /// Host does not satisfy the inner clause
    Not(Box<Clause>),
}

impl Clause {
    /// Whether a host satisfies this clause
    pub fn matches(&self, host: &Host) -> bool {
        match self {
            Clause::Platform(patterns) => patterns
                .iter()
                .any(|pattern| wildcard_match(pattern, &host.platform)),
            Clause::Role(roles) => roles.iter().any(|role| host.has_role(role)),
            Clause::Hosts(names) => names.iter().any(|name| *name == host.name),
            Clause::Not(inner) => !inner.matches(host),
        }
    }
}

impl fmt::Display for Clause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Clause::Platform(p) => write!(f, "platform in [{}]", p.join(", ")),
            Clause::Role(r) => write!(f, "role in [{}]", r.join(", ")),
            Clause::Hosts(h) => write!(f, "host in [{}]", h.join(", ")),
            Clause::Not(inner) => write!(f, "not ({})", inner),
        }
    }
}

/// A list or a single value in YAML
#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl From<OneOrMany> for Vec<String> {
    fn from(value: OneOrMany) -> Self {
        match value {
            OneOrMany::One(s) => vec![s],
            OneOrMany::Many(v) => v,
        }
    }
}

/// YAML shape of a clause: exactly one of the keys
#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ClauseDef {
    platform: Option<OneOrMany>,
    role: Option<OneOrMany>,
    hosts: Option<OneOrMany>,
    not: Option<Box<ClauseDef>>,
}

impl TryFrom<ClauseDef> for Clause {
    type Error = String;

    fn try_from(def: ClauseDef) -> Result<Self, Self::Error> {
        let mut clauses = Vec::new();
        if let Some(p) = def.platform {
            clauses.push(Clause::Platform(p.into()));
        }
        if let Some(r) = def.role {
            clauses.push(Clause::Role(r.into()));
        }
        if let Some(h) = def.hosts {
            clauses.push(Clause::Hosts(h.into()));
        }
        if let Some(inner) = def.not {
            clauses.push(Clause::Not(Box::new(Clause::try_from(*inner)?)));
        }

        match clauses.len() {
            1 => Ok(clauses.remove(0)),
            0 => Err("confinement clause needs one of: platform, role, hosts, not".to_string()),
            _ => Err("confinement clause must have exactly one key; use separate list entries".to_string()),
        }
    }
}

/// Outcome of evaluating a confinement
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// The test applies; these hosts satisfied every clause
    Applies { hosts: Vec<String> },
    /// The test must be skipped
    Skip { reason: String },
}

/// Conjunction of clauses restricting where a test may run
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct Confinement {
    clauses: Vec<Clause>,
}

impl Confinement {
    pub fn new(clauses: Vec<Clause>) -> Self {
        Self { clauses }
    }

    pub fn clauses(&self) -> &[Clause] {
        &self.clauses
    }

    /// Evaluate against a host set
    ///
    /// The skip reason names the first clause that left no candidate host.
    pub fn evaluate(&self, hosts: &[Host]) -> Decision {
        let mut candidates: Vec<&Host> = hosts.iter().collect();
        if candidates.is_empty() {
            return Decision::Skip {
                reason: "no hosts in topology".to_string(),
            };
        }

        for clause in &self.clauses {
            candidates.retain(|host| clause.matches(host));
            if candidates.is_empty() {
                return Decision::Skip {
                    reason: format!("no host satisfies {}", clause),
                };
            }
        }

        Decision::Applies {
            hosts: candidates.iter().map(|h| h.name.clone()).collect(),
        }
    }

    /// Whether the confinement admits at least one host
    pub fn applies(&self, hosts: &[Host]) -> bool {
        matches!(self.evaluate(hosts), Decision::Applies { .. })
    }
}
