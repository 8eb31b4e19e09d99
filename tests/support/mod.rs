// ABOUTME: Scripted in-memory executors for orchestration tests.
// ABOUTME: Records a global command trace and simulates service state per command.

use anabasis::config::{Environment, HostConfig, SshDefaults, Step, StepKind};
use anabasis::exec::{ConnectError, ExecOutput, ExecutorFactory, HostExecutor, RunError};
use async_trait::async_trait;
use nonempty::NonEmpty;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Commands in scripted environments follow the `verb_service` convention:
/// `start_a` marks service `a` running, `stop_a` marks it stopped, and
/// `check_a` exits 0 only while it is running. Anything else exits 0.
#[derive(Clone, Default)]
pub struct Cluster {
    services: Arc<Mutex<HashMap<String, bool>>>,
    /// Exit-code overrides keyed by (host, command); host "*" matches all.
    overrides: Arc<Mutex<HashMap<(String, String), u32>>>,
    unreachable: Arc<Mutex<HashSet<String>>>,
    trace: Arc<Mutex<Vec<String>>>,
}

impl Cluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_running(&self, service: &str, running: bool) {
        self.services.lock().insert(service.to_string(), running);
    }

    pub fn is_running(&self, service: &str) -> bool {
        self.services.lock().get(service).copied().unwrap_or(false)
    }

    /// Force a command to exit non-zero on every host.
    pub fn fail_command(&self, command: &str, exit_code: u32) {
        self.overrides
            .lock()
            .insert(("*".to_string(), command.to_string()), exit_code);
    }

    /// Force a command to exit non-zero on one host only.
    pub fn fail_command_on(&self, host: &str, command: &str, exit_code: u32) {
        self.overrides
            .lock()
            .insert((host.to_string(), command.to_string()), exit_code);
    }

    /// Make executor construction fail for a host.
    pub fn mark_unreachable(&self, host: &str) {
        self.unreachable.lock().insert(host.to_string());
    }

    pub fn trace(&self) -> Vec<String> {
        self.trace.lock().clone()
    }

    /// Entries of the trace matching a command, e.g. all `stop_a@...`.
    pub fn occurrences(&self, command: &str) -> Vec<String> {
        self.trace()
            .into_iter()
            .filter(|entry| entry.starts_with(&format!("{command}@")))
            .collect()
    }

    pub fn index_of(&self, entry: &str) -> Option<usize> {
        self.trace().iter().position(|e| e == entry)
    }

    pub fn factory(&self) -> Arc<dyn ExecutorFactory> {
        Arc::new(ClusterFactory {
            cluster: self.clone(),
        })
    }

    fn execute(&self, host: &str, command: &str) -> ExecOutput {
        self.trace.lock().push(format!("{command}@{host}"));

        let overrides = self.overrides.lock();
        let override_exit = overrides
            .get(&(host.to_string(), command.to_string()))
            .or_else(|| overrides.get(&("*".to_string(), command.to_string())))
            .copied();
        drop(overrides);

        if let Some(exit_code) = override_exit {
            return ExecOutput {
                exit_code,
                output: "scripted failure".to_string(),
            };
        }

        let (verb, service) = match command.split_once('_') {
            Some(parts) => parts,
            None => {
                return ExecOutput {
                    exit_code: 0,
                    output: String::new(),
                }
            }
        };

        let exit_code = match verb {
            "start" => {
                self.set_running(service, true);
                0
            }
            "stop" => {
                self.set_running(service, false);
                0
            }
            "check" => {
                if self.is_running(service) {
                    0
                } else {
                    1
                }
            }
            _ => 0,
        };

        ExecOutput {
            exit_code,
            output: String::new(),
        }
    }
}

struct ClusterExecutor {
    host: String,
    cluster: Cluster,
}

#[async_trait]
impl HostExecutor for ClusterExecutor {
    async fn run(
        &self,
        command: &str,
        cancel: &CancellationToken,
    ) -> Result<ExecOutput, RunError> {
        if cancel.is_cancelled() {
            return Err(RunError::Canceled);
        }
        Ok(self.cluster.execute(&self.host, command))
    }

    async fn close(&self) {}

    fn is_alive(&self) -> bool {
        true
    }
}

struct ClusterFactory {
    cluster: Cluster,
}

#[async_trait]
impl ExecutorFactory for ClusterFactory {
    async fn build(
        &self,
        target: &anabasis::config::HostTarget,
    ) -> Result<Arc<dyn HostExecutor>, ConnectError> {
        if self.cluster.unreachable.lock().contains(&target.hostname) {
            return Err(ConnectError {
                host: target.hostname.clone(),
                reason: "connection refused".to_string(),
            });
        }
        Ok(Arc::new(ClusterExecutor {
            host: target.hostname.clone(),
            cluster: self.cluster.clone(),
        }))
    }
}

/// Build an environment whose host table covers every alias the steps use.
/// Hostnames are `<alias>.internal`.
pub fn environment(steps: Vec<Step>) -> Environment {
    let mut hosts = HashMap::new();
    for step in &steps {
        for alias in step.hosts.iter() {
            hosts
                .entry(alias.clone())
                .or_insert_with(|| HostConfig {
                    hostname: format!("{alias}.internal"),
                    user: None,
                    key: None,
                });
        }
    }

    Environment {
        ssh_defaults: SshDefaults {
            user: "deploy".to_string(),
            key: PathBuf::from("/dev/null"),
            timeout: Duration::from_secs(5),
        },
        hosts,
        sequence: steps,
    }
}

fn hosts_of(aliases: &[&str]) -> NonEmpty<String> {
    NonEmpty::from_vec(aliases.iter().map(|s| s.to_string()).collect())
        .expect("test step needs at least one host")
}

pub fn app_step(name: &str, aliases: &[&str]) -> Step {
    Step {
        name: name.to_string(),
        kind: StepKind::Application,
        hosts: hosts_of(aliases),
        start: Some(format!("start_{name}")),
        check: Some(format!("check_{name}")),
        stop: Some(format!("stop_{name}")),
        run: None,
    }
}

pub fn dep_step(name: &str, aliases: &[&str]) -> Step {
    Step {
        name: name.to_string(),
        kind: StepKind::Dependency,
        hosts: hosts_of(aliases),
        start: Some(format!("start_{name}")),
        check: Some(format!("check_{name}")),
        stop: Some(format!("stop_{name}")),
        run: None,
    }
}

pub fn cmd_step(name: &str, aliases: &[&str]) -> Step {
    Step {
        name: name.to_string(),
        kind: StepKind::Command,
        hosts: hosts_of(aliases),
        start: None,
        check: None,
        stop: None,
        run: Some(format!("run_{name}")),
    }
}
