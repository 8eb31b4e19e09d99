// ABOUTME: Forward state machine driving one bring-up over the step list.
// ABOUTME: Enforces health-check windows and polls abort sources between operations.

use crate::config::{Environment, Step, StepKind};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::error::OrchestrateError;
use super::monitor::MonitorFailure;
use super::state::RunState;
use super::step_runner::StepRunner;
use super::Options;

/// Drives forward progress through the sequence. On return the started set
/// in `RunState` is final; the controller owns rollback.
pub struct Sequencer<'a> {
    env: &'a Arc<Environment>,
    runner: &'a StepRunner,
    state: &'a Arc<RunState>,
    monitor_rx: &'a mut mpsc::Receiver<MonitorFailure>,
    options: &'a Options,
}

impl<'a> Sequencer<'a> {
    pub fn new(
        env: &'a Arc<Environment>,
        runner: &'a StepRunner,
        state: &'a Arc<RunState>,
        monitor_rx: &'a mut mpsc::Receiver<MonitorFailure>,
        options: &'a Options,
    ) -> Self {
        Self {
            env,
            runner,
            state,
            monitor_rx,
            options,
        }
    }

    pub async fn run(&mut self, cancel: &CancellationToken) -> Result<(), OrchestrateError> {
        for (index, step) in self.env.sequence.iter().enumerate() {
            self.observe_abort(cancel)?;

            tracing::info!(
                step = %step.name,
                kind = %step.kind,
                number = index + 1,
                "executing step"
            );

            match step.kind {
                StepKind::Application => {
                    self.runner.ensure_stopped(step, cancel).await?;
                    self.start_and_record(index, step, cancel).await?;
                    self.settle_and_check(step, cancel).await?;
                }
                StepKind::Dependency if !self.options.handle_deps => {
                    // Not ours to manage: verify only, and keep it out of
                    // the started set so rollback never stops it.
                    self.runner.verify_running(step, cancel).await?;
                }
                StepKind::Dependency => {
                    if self.runner.is_running(step, cancel).await? {
                        tracing::info!(step = %step.name, "dependency already running, restarting");
                        self.runner.stop(step, cancel).await?;
                    }
                    self.start_and_record(index, step, cancel).await?;
                    self.settle_and_check(step, cancel).await?;
                }
                StepKind::Command => {
                    // One-shot side effect; never recorded, never undone.
                    self.runner.command(step, cancel).await?;
                }
            }
        }

        self.final_monitor_grace(cancel).await
    }

    /// Abort sources in priority order: external cancellation, then the
    /// monitor's single-slot signal.
    fn observe_abort(&mut self, cancel: &CancellationToken) -> Result<(), OrchestrateError> {
        if cancel.is_cancelled() {
            tracing::warn!("bring-up canceled");
            return Err(OrchestrateError::Canceled(
                "canceled before step execution".to_string(),
            ));
        }
        self.poll_monitor()
    }

    fn poll_monitor(&mut self) -> Result<(), OrchestrateError> {
        match self.monitor_rx.try_recv() {
            Ok(failure) => {
                tracing::error!(
                    step = %failure.step,
                    "monitor reported failure, aborting bring-up"
                );
                Err(OrchestrateError::MonitorFailure {
                    step: failure.step,
                    detail: failure.detail,
                })
            }
            Err(_) => Ok(()),
        }
    }

    async fn start_and_record(
        &mut self,
        index: usize,
        step: &Step,
        cancel: &CancellationToken,
    ) -> Result<(), OrchestrateError> {
        match self.runner.start(step, cancel).await {
            Ok(()) => {
                // Recorded before the settle window so a failure during the
                // wait still rolls this step back.
                self.state.record_started(index);
                Ok(())
            }
            Err(failure) => {
                if failure.partially_started {
                    tracing::warn!(
                        step = %step.name,
                        "start succeeded on some hosts only, recording for rollback"
                    );
                    self.state.record_started(index);
                }
                Err(failure.error)
            }
        }
    }

    /// Let the service settle, then health-check it. The monitor slot is
    /// polled after the sleep and after the check: a readable signal is an
    /// abort even when this step just succeeded.
    async fn settle_and_check(
        &mut self,
        step: &Step,
        cancel: &CancellationToken,
    ) -> Result<(), OrchestrateError> {
        tracing::info!(
            step = %step.name,
            wait = ?self.options.start_wait,
            "waiting before health check"
        );

        if !self.options.dry_run {
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(OrchestrateError::Canceled(
                        "canceled during post-start wait".to_string(),
                    ));
                }
                _ = tokio::time::sleep(self.options.start_wait) => {}
            }
        }

        self.poll_monitor()?;
        self.runner.check(step, cancel).await?;
        self.poll_monitor()
    }

    /// Give the monitor one last poll interval to surface a failure that
    /// raced with the final step.
    async fn final_monitor_grace(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<(), OrchestrateError> {
        if self.options.dry_run {
            return Ok(());
        }

        tokio::select! {
            _ = cancel.cancelled() => Err(OrchestrateError::Canceled(
                "canceled while waiting for final monitor pass".to_string(),
            )),
            failure = self.monitor_rx.recv() => match failure {
                Some(failure) => {
                    tracing::error!(step = %failure.step, "monitor reported failure after final step");
                    Err(OrchestrateError::MonitorFailure {
                        step: failure.step,
                        detail: failure.detail,
                    })
                }
                None => Ok(()),
            },
            _ = tokio::time::sleep(self.options.monitor_interval) => Ok(()),
        }
    }
}
