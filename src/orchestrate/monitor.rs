// ABOUTME: Background liveness probe over already-started steps.
// ABOUTME: Publishes the first failure to a single-slot channel and exits.

use crate::config::Environment;
use crate::exec::{fan_out, ExecError, ExecutorPool};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::state::RunState;

/// The first failure the monitor observed. Once published it is the
/// authoritative abort reason; later failures are discarded.
#[derive(Debug, Clone)]
pub struct MonitorFailure {
    pub step: String,
    pub detail: String,
}

pub struct Monitor {
    env: Arc<Environment>,
    pool: Arc<ExecutorPool>,
    state: Arc<RunState>,
    interval: Duration,
    tx: mpsc::Sender<MonitorFailure>,
    cancel: CancellationToken,
}

impl Monitor {
    pub fn spawn(
        env: Arc<Environment>,
        pool: Arc<ExecutorPool>,
        state: Arc<RunState>,
        interval: Duration,
        tx: mpsc::Sender<MonitorFailure>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let monitor = Self {
            env,
            pool,
            state,
            interval,
            tx,
            cancel,
        };
        tokio::spawn(monitor.run())
    }

    async fn run(self) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::debug!("monitor exiting on cancellation");
                    return;
                }
                _ = tokio::time::sleep(self.interval) => {}
            }

            // Snapshot under the run-state lock; the sequencer keeps
            // appending while we probe.
            let started = self.state.started();

            for index in started {
                let Some(step) = self.env.sequence.get(index) else {
                    continue;
                };
                if !step.kind.is_lifecycle() {
                    continue;
                }

                let targets = match self.env.resolve_step(step) {
                    Ok(targets) => targets,
                    Err(e) => {
                        tracing::error!(step = %step.name, error = %e, "monitor cannot resolve hosts");
                        continue;
                    }
                };

                match fan_out(&self.pool, &targets, step.check_command(), &self.cancel).await {
                    Ok(()) => {}
                    Err(ExecError::Canceled) => {
                        tracing::debug!("monitor exiting on cancellation");
                        return;
                    }
                    Err(e) => {
                        tracing::error!(step = %step.name, error = %e, "monitor observed failure");
                        // Non-blocking: the slot may already hold a failure.
                        let _ = self.tx.try_send(MonitorFailure {
                            step: step.name.clone(),
                            detail: e.to_string(),
                        });
                        return;
                    }
                }
            }
        }
    }
}
