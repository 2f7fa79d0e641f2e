//! Host topology
//!
//! The set of hosts a suite runs against, loaded once from a YAML file and
//! read-only for the rest of the run.

use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::path::Path;

use crate::common::{Error, Result};

/// How commands reach a host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    /// `sh -c` on the machine running the suite
    Local,
    /// The system ssh client
    #[default]
    Ssh,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Local => write!(f, "local"),
            Transport::Ssh => write!(f, "ssh"),
        }
    }
}

/// A single host in the topology
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Host {
    /// Unique name used by tests to refer to this host
    pub name: String,
    /// Network address; defaults to the name
    #[serde(default)]
    pub address: Option<String>,
    /// Roles this host plays (e.g. master, agent, database)
    #[serde(default)]
    pub roles: BTreeSet<String>,
    /// Platform tag (e.g. el-8-x86_64)
    #[serde(default)]
    pub platform: String,
    #[serde(default)]
    pub transport: Transport,
    /// Login user for ssh
    #[serde(default)]
    pub user: Option<String>,
    /// ssh port
    #[serde(default)]
    pub port: Option<u16>,
    /// Private key used for ssh authentication
    #[serde(default)]
    pub identity_file: Option<String>,
}

impl Host {
    /// Address to connect to
    pub fn address(&self) -> &str {
        self.address.as_deref().unwrap_or(&self.name)
    }

    /// Whether this host plays the given role
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.contains(role)
    }

    /// Whether this host is named `target` or plays role `target`
    pub fn matches_target(&self, target: &str) -> bool {
        self.name == target || self.has_role(target)
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct TopologyFile {
    hosts: Vec<Host>,
    #[serde(default)]
    variables: BTreeMap<String, String>,
}

/// The hosts available to a run
#[derive(Debug, Clone)]
pub struct Topology {
    hosts: Vec<Host>,
    variables: BTreeMap<String, String>,
}

impl Topology {
    /// Validate hosts and fill in local platforms
    fn with_variables(mut hosts: Vec<Host>, variables: BTreeMap<String, String>) -> Result<Self> {
        if hosts.is_empty() {
            return Err(Error::Config("Topology defines no hosts".to_string()));
        }

        let mut seen = HashSet::new();
        for host in &hosts {
            if host.name.trim().is_empty() {
                return Err(Error::Config("Host with empty name in topology".to_string()));
            }
            if !seen.insert(host.name.as_str()) {
                return Err(Error::Config(format!(
                    "Host '{}' is defined more than once",
                    host.name
                )));
            }
        }

        for host in &mut hosts {
            if host.platform.is_empty() && host.transport == Transport::Local {
                host.platform = local_platform();
            }
        }

        Ok(Self { hosts, variables })
    }

    /// Load a topology from a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).map_err(|e| Error::topology_load(path, e))?;
        Self::parse(&content).map_err(|e| match e {
            Error::TopologyLoad { .. } => e,
            other => Error::topology_load(path, other),
        })
    }

    /// Parse a topology from YAML text
    pub fn parse(content: &str) -> Result<Self> {
        let file: TopologyFile = serde_yaml::from_str(content)?;
        Self::with_variables(file.hosts, file.variables)
    }

    /// All hosts in declaration order
    pub fn hosts(&self) -> &[Host] {
        &self.hosts
    }

    /// Look up a host by name
    pub fn host(&self, name: &str) -> Option<&Host> {
        self.hosts.iter().find(|h| h.name == name)
    }

    /// Resolve a step target: an exact host name wins, otherwise every host with that role
    pub fn resolve(&self, target: &str) -> Vec<&Host> {
        if let Some(host) = self.host(target) {
            return vec![host];
        }
        self.hosts.iter().filter(|h| h.has_role(target)).collect()
    }

    /// Variables declared alongside the hosts
    pub fn variables(&self) -> &BTreeMap<String, String> {
        &self.variables
    }
}

/// Platform tag of the machine running the suite, e.g. `ubuntu-22.04-x86_64`
pub fn local_platform() -> String {
    let info = os_info::get();
    let family = info.os_type().to_string().to_lowercase().replace(' ', "-");
    let mut tag = family;
    if let os_info::Version::Semantic(major, minor, _) = info.version() {
        tag.push_str(&format!("-{}.{}", major, minor));
    }
    if let Some(arch) = info.architecture() {
        tag.push('-');
        tag.push_str(arch);
    }
    tag
}
