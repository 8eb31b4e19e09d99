// ABOUTME: Configuration types and parsing for anabasis.yml.
// ABOUTME: Handles YAML parsing, environment lookup, and host resolution.

mod step;

pub use step::{Step, StepKind};

use crate::error::{Error, Result};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILENAME: &str = "anabasis.yml";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub environments: HashMap<String, Environment>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Environment {
    pub ssh_defaults: SshDefaults,

    #[serde(default)]
    pub hosts: HashMap<String, HostConfig>,

    #[serde(default)]
    pub sequence: Vec<Step>,
}

/// Connection parameters applied when a host omits its own overrides.
#[derive(Debug, Clone, Deserialize)]
pub struct SshDefaults {
    pub user: String,
    pub key: PathBuf,

    #[serde(default = "default_ssh_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

fn default_ssh_timeout() -> Duration {
    Duration::from_secs(30)
}

#[derive(Debug, Clone, Deserialize)]
pub struct HostConfig {
    pub hostname: String,

    #[serde(default)]
    pub user: Option<String>,

    #[serde(default)]
    pub key: Option<PathBuf>,
}

/// A host alias resolved against the environment's SSH defaults.
///
/// This is the concrete connection target the executor layer consumes;
/// nothing below the config module looks at aliases or defaults again.
#[derive(Debug, Clone)]
pub struct HostTarget {
    pub alias: String,
    pub hostname: String,
    pub user: String,
    pub key_path: PathBuf,
    pub timeout: Duration,
}

impl Config {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        for (name, env) in &config.environments {
            env.validate(name)?;
        }
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| Error::ConfigNotFound(path.to_path_buf()))?;
        Self::from_yaml(&content)
    }

    pub fn environment(&self, name: &str) -> Result<&Environment> {
        self.environments
            .get(name)
            .ok_or_else(|| Error::UnknownEnvironment(name.to_string()))
    }

    /// Like `environment` but yields an owned copy for the orchestrator.
    pub fn take_environment(mut self, name: &str) -> Result<Environment> {
        self.environments
            .remove(name)
            .ok_or_else(|| Error::UnknownEnvironment(name.to_string()))
    }
}

impl Environment {
    /// Validate the step sequence against this environment's host table.
    ///
    /// An empty sequence is allowed (bring-up of such an environment is a
    /// no-op). Everything the orchestration engine assumes about a step is
    /// established here: unique names, known host references, and the
    /// command set its kind requires.
    pub fn validate(&self, env_name: &str) -> Result<()> {
        let mut seen = HashSet::new();
        for step in &self.sequence {
            if !seen.insert(step.name.as_str()) {
                return Err(Error::InvalidConfig(format!(
                    "duplicate step name '{}' in environment '{}'",
                    step.name, env_name
                )));
            }

            for alias in step.hosts.iter() {
                if !self.hosts.contains_key(alias) {
                    return Err(Error::InvalidConfig(format!(
                        "step '{}' references unknown host '{}' in environment '{}'",
                        step.name, alias, env_name
                    )));
                }
            }

            step.validate_commands(env_name)?;
        }
        Ok(())
    }

    /// Resolve one host alias into a connection target.
    pub fn resolve(&self, alias: &str) -> Result<HostTarget> {
        let host = self
            .hosts
            .get(alias)
            .ok_or_else(|| Error::InvalidConfig(format!("unknown host alias '{alias}'")))?;

        Ok(HostTarget {
            alias: alias.to_string(),
            hostname: host.hostname.clone(),
            user: host
                .user
                .clone()
                .unwrap_or_else(|| self.ssh_defaults.user.clone()),
            key_path: host
                .key
                .clone()
                .unwrap_or_else(|| self.ssh_defaults.key.clone()),
            timeout: self.ssh_defaults.timeout,
        })
    }

    /// Resolve every host of a step, in declared order.
    pub fn resolve_step(&self, step: &Step) -> Result<Vec<HostTarget>> {
        step.hosts.iter().map(|alias| self.resolve(alias)).collect()
    }

    /// Replace the default key path, keeping per-host key overrides intact.
    /// The CLI applies its required `--ssh-key` argument through this before
    /// a run starts; the environment is immutable from then on.
    pub fn override_key(&mut self, key: PathBuf) {
        self.ssh_defaults.key = key;
    }
}
