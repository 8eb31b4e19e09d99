// ABOUTME: Executes one step's operations against its hosts.
// ABOUTME: Hides dry-run from callers and maps fan-out failures to error kinds.

use crate::config::{Environment, Step};
use crate::exec::{fan_out, ExecError, ExecutorPool};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::error::OrchestrateError;

/// A start failure that may have left some hosts running.
///
/// When a multi-host start succeeds on some hosts and fails on others, the
/// step is recorded as started so rollback stops every host of the step;
/// `partially_started` carries that signal to the sequencer.
#[derive(Debug)]
pub struct StartFailure {
    pub partially_started: bool,
    pub error: OrchestrateError,
}

pub struct StepRunner {
    env: Arc<Environment>,
    pool: Arc<ExecutorPool>,
    dry_run: bool,
}

impl StepRunner {
    pub fn new(env: Arc<Environment>, pool: Arc<ExecutorPool>, dry_run: bool) -> Self {
        Self { env, pool, dry_run }
    }

    /// Guarantee a clean slate before `start`: if the step's check reports
    /// it running, stop it; otherwise it is already down.
    pub async fn ensure_stopped(
        &self,
        step: &Step,
        cancel: &CancellationToken,
    ) -> Result<(), OrchestrateError> {
        if self.dry_run {
            tracing::info!(
                step = %step.name,
                "[dry-run] skipping pre-start check, assuming not running"
            );
            return Ok(());
        }

        if self.is_running(step, cancel).await? {
            tracing::info!(step = %step.name, "already running, stopping before start");
            return self.stop(step, cancel).await;
        }

        tracing::info!(step = %step.name, "not running, proceeding to start");
        Ok(())
    }

    pub async fn start(&self, step: &Step, cancel: &CancellationToken) -> Result<(), StartFailure> {
        if self.dry_run {
            tracing::info!(
                step = %step.name,
                command = step.start_command(),
                "[dry-run] would start"
            );
            return Ok(());
        }

        let targets = self.targets(step).map_err(|error| StartFailure {
            partially_started: false,
            error,
        })?;
        let host_count = targets.len();

        match fan_out(&self.pool, &targets, step.start_command(), cancel).await {
            Ok(()) => Ok(()),
            Err(e) => {
                let partially_started = match &e {
                    ExecError::CommandFailed(failures) | ExecError::Unreachable(failures) => {
                        failures.len() < host_count
                    }
                    ExecError::Canceled => false,
                };
                Err(StartFailure {
                    partially_started,
                    error: map_exec(step, "start", e),
                })
            }
        }
    }

    pub async fn stop(&self, step: &Step, cancel: &CancellationToken) -> Result<(), OrchestrateError> {
        if self.dry_run {
            tracing::info!(
                step = %step.name,
                command = step.stop_command(),
                "[dry-run] would stop"
            );
            return Ok(());
        }

        let targets = self.targets(step)?;
        fan_out(&self.pool, &targets, step.stop_command(), cancel)
            .await
            .map_err(|e| map_exec(step, "stop", e))
    }

    /// Post-start health check. Failure drives rollback, so it gets its own
    /// error kind even though the mechanism matches any other command.
    pub async fn check(&self, step: &Step, cancel: &CancellationToken) -> Result<(), OrchestrateError> {
        if self.dry_run {
            tracing::info!(step = %step.name, "[dry-run] assuming health check passes");
            return Ok(());
        }

        let targets = self.targets(step)?;
        fan_out(&self.pool, &targets, step.check_command(), cancel)
            .await
            .map_err(|e| match e {
                ExecError::Canceled => canceled("canceled during health check"),
                other => OrchestrateError::HealthCheckFailed {
                    step: step.name.clone(),
                    detail: other.to_string(),
                },
            })
    }

    /// Dependency precondition when the run does not manage dependencies.
    pub async fn verify_running(
        &self,
        step: &Step,
        cancel: &CancellationToken,
    ) -> Result<(), OrchestrateError> {
        if self.dry_run {
            tracing::info!(step = %step.name, "[dry-run] assuming dependency is running");
            return Ok(());
        }

        let targets = self.targets(step)?;
        fan_out(&self.pool, &targets, step.check_command(), cancel)
            .await
            .map_err(|e| match e {
                ExecError::Canceled => canceled("canceled during dependency verification"),
                other => OrchestrateError::DependencyNotRunning {
                    step: step.name.clone(),
                    detail: other.to_string(),
                },
            })
    }

    /// One-shot command step.
    pub async fn command(&self, step: &Step, cancel: &CancellationToken) -> Result<(), OrchestrateError> {
        if self.dry_run {
            tracing::info!(
                step = %step.name,
                command = step.run_command(),
                "[dry-run] would run command"
            );
            return Ok(());
        }

        let targets = self.targets(step)?;
        fan_out(&self.pool, &targets, step.run_command(), cancel)
            .await
            .map_err(|e| map_exec(step, "run", e))
    }

    /// Whether the step's check reports it running on every host. Check
    /// failures of any sort read as "not running"; only cancellation
    /// propagates.
    pub async fn is_running(
        &self,
        step: &Step,
        cancel: &CancellationToken,
    ) -> Result<bool, OrchestrateError> {
        if self.dry_run {
            tracing::info!(step = %step.name, "[dry-run] assuming running");
            return Ok(true);
        }

        let targets = self.targets(step)?;
        match fan_out(&self.pool, &targets, step.check_command(), cancel).await {
            Ok(()) => Ok(true),
            Err(ExecError::Canceled) => Err(canceled("canceled during running-state check")),
            Err(_) => Ok(false),
        }
    }

    fn targets(&self, step: &Step) -> Result<Vec<crate::config::HostTarget>, OrchestrateError> {
        self.env
            .resolve_step(step)
            .map_err(|e| OrchestrateError::Config(e.to_string()))
    }
}

fn canceled(reason: &str) -> OrchestrateError {
    OrchestrateError::Canceled(reason.to_string())
}

fn map_exec(step: &Step, action: &str, err: ExecError) -> OrchestrateError {
    match err {
        ExecError::Canceled => canceled(&format!("canceled during {action} of '{}'", step.name)),
        ExecError::Unreachable(_) => OrchestrateError::HostUnreachable {
            step: step.name.clone(),
            detail: err.to_string(),
        },
        ExecError::CommandFailed(_) => OrchestrateError::CommandFailed {
            step: step.name.clone(),
            action: action.to_string(),
            detail: err.to_string(),
        },
    }
}
