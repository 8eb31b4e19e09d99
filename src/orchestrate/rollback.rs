// ABOUTME: Reverse-order stop of every started step after a failure.
// ABOUTME: Best-effort: detached from the run scope, bounded per step.

use crate::config::Environment;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::step_runner::StepRunner;

pub struct RollbackOutcome {
    /// Names of steps whose stop failed or timed out.
    pub failed_steps: Vec<String>,
}

impl RollbackOutcome {
    pub fn is_clean(&self) -> bool {
        self.failed_steps.is_empty()
    }
}

/// Stop every started step in reverse order.
///
/// Runs under a fresh cancellation scope: an operator's Ctrl-C aborts the
/// bring-up, not the cleanup. Each stop is bounded by `step_timeout` so a
/// hung host cannot stall the whole rollback.
pub async fn run(
    runner: &StepRunner,
    env: &Environment,
    started: &[usize],
    step_timeout: Duration,
) -> RollbackOutcome {
    tracing::info!(steps = started.len(), "starting rollback");

    let detached = CancellationToken::new();
    let mut failed_steps = Vec::new();

    for &index in started.iter().rev() {
        let Some(step) = env.sequence.get(index) else {
            continue;
        };

        tracing::info!(step = %step.name, kind = %step.kind, "rolling back");

        match tokio::time::timeout(step_timeout, runner.stop(step, &detached)).await {
            Ok(Ok(())) => {
                tracing::info!(step = %step.name, "stopped during rollback");
            }
            Ok(Err(e)) => {
                tracing::error!(step = %step.name, error = %e, "failed to stop during rollback");
                failed_steps.push(step.name.clone());
            }
            Err(_) => {
                tracing::error!(
                    step = %step.name,
                    timeout = ?step_timeout,
                    "stop timed out during rollback"
                );
                failed_steps.push(step.name.clone());
            }
        }
    }

    tracing::info!(
        failed = failed_steps.len(),
        "rollback completed"
    );
    RollbackOutcome { failed_steps }
}
