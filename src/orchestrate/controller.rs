// ABOUTME: Public entry points binding flag, monitor, sequencer, and rollback.
// ABOUTME: Owns the cancellation scope and guarantees teardown on every path.

use crate::config::{Environment, StepKind};
use crate::exec::{
    DryRunExecutorFactory, ExecutorFactory, ExecutorPool, SshExecutorFactory,
};
use crate::flag::Flag;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::error::OrchestrateError;
use super::monitor::{Monitor, MonitorFailure};
use super::rollback;
use super::sequencer::Sequencer;
use super::state::{RunState, Stage};
use super::step_runner::StepRunner;
use super::Options;

pub struct Controller {
    env: Arc<Environment>,
    options: Options,
    factory: Arc<dyn ExecutorFactory>,
}

impl Controller {
    pub fn new(env: Environment, options: Options) -> Self {
        let factory: Arc<dyn ExecutorFactory> = if options.dry_run {
            Arc::new(DryRunExecutorFactory)
        } else {
            Arc::new(SshExecutorFactory::new())
        };
        Self::with_factory(env, options, factory)
    }

    /// Construct with a caller-supplied executor factory. Tests inject
    /// scripted executors through this.
    pub fn with_factory(
        env: Environment,
        options: Options,
        factory: Arc<dyn ExecutorFactory>,
    ) -> Self {
        Self {
            env: Arc::new(env),
            options,
            factory,
        }
    }

    /// Bring the environment up in declared order.
    pub async fn up(&self, cancel: CancellationToken) -> Result<(), OrchestrateError> {
        tracing::info!(
            environment = %self.options.environment,
            dry_run = self.options.dry_run,
            handle_deps = self.options.handle_deps,
            "starting orchestration UP"
        );

        let state = Arc::new(RunState::new());

        state.set_stage(Stage::Acquiring);
        let flag = self.acquire_flag()?;

        let pool = Arc::new(ExecutorPool::new(Arc::clone(&self.factory)));
        let runner = StepRunner::new(Arc::clone(&self.env), Arc::clone(&pool), self.options.dry_run);

        let run_token = cancel.child_token();
        let watchdog = self.spawn_timeout_watchdog(&run_token);

        let (monitor_tx, mut monitor_rx) = mpsc::channel::<MonitorFailure>(1);
        let monitor_handle = if self.options.dry_run {
            None
        } else {
            state.set_stage(Stage::Monitoring);
            Some(Monitor::spawn(
                Arc::clone(&self.env),
                Arc::clone(&pool),
                Arc::clone(&state),
                self.options.monitor_interval,
                monitor_tx,
                run_token.clone(),
            ))
        };

        state.set_stage(Stage::Running);
        let result = Sequencer::new(&self.env, &runner, &state, &mut monitor_rx, &self.options)
            .run(&run_token)
            .await;

        // Unwind: stop the monitor before anything else so no task outlives
        // the run, then resolve the last send/poll race.
        run_token.cancel();
        if let Some(handle) = monitor_handle {
            let _ = handle.await;
        }
        let _ = watchdog.await;

        let result = match result {
            Ok(()) => match monitor_rx.try_recv() {
                Ok(failure) => Err(OrchestrateError::MonitorFailure {
                    step: failure.step,
                    detail: failure.detail,
                }),
                Err(_) => Ok(()),
            },
            Err(e) => Err(e),
        };

        let outcome = match result {
            Ok(()) => {
                tracing::info!("orchestration UP completed successfully");
                Ok(())
            }
            Err(error) => {
                let started = state.started();
                if started.is_empty() {
                    Err(error)
                } else {
                    state.set_stage(Stage::RollingBack);
                    tracing::error!(error = %error, "bring-up failed, rolling back");
                    let rollback_outcome = rollback::run(
                        &runner,
                        &self.env,
                        &started,
                        self.options.rollback_step_timeout,
                    )
                    .await;

                    if rollback_outcome.is_clean() {
                        Err(OrchestrateError::RolledBack {
                            source: Box::new(error),
                        })
                    } else {
                        Err(OrchestrateError::RollbackIncomplete {
                            source: Box::new(error),
                            failed_steps: rollback_outcome.failed_steps,
                        })
                    }
                }
            }
        };

        pool.close_all().await;
        state.set_stage(Stage::Releasing);
        let outcome = Self::release_flag(flag, outcome);
        state.set_stage(Stage::Terminal);
        outcome
    }

    /// Bring the environment down in reverse order. No monitor, no rollback:
    /// failures to stop are logged and iteration continues.
    pub async fn down(&self, cancel: CancellationToken) -> Result<(), OrchestrateError> {
        tracing::info!(
            environment = %self.options.environment,
            dry_run = self.options.dry_run,
            stop_deps = self.options.stop_deps,
            "starting orchestration DOWN"
        );

        let state = RunState::new();
        state.set_stage(Stage::Acquiring);
        let flag = self.acquire_flag()?;

        let pool = Arc::new(ExecutorPool::new(Arc::clone(&self.factory)));
        let runner = StepRunner::new(Arc::clone(&self.env), Arc::clone(&pool), self.options.dry_run);

        let run_token = cancel.child_token();
        let watchdog = self.spawn_timeout_watchdog(&run_token);

        state.set_stage(Stage::Running);
        let mut result = Ok(());

        for (index, step) in self.env.sequence.iter().enumerate().rev() {
            if run_token.is_cancelled() {
                tracing::warn!("bring-down canceled, leaving remaining steps as-is");
                result = Err(OrchestrateError::Canceled(
                    "canceled during bring-down".to_string(),
                ));
                break;
            }

            tracing::info!(
                step = %step.name,
                kind = %step.kind,
                number = index + 1,
                "stopping step"
            );

            match step.kind {
                StepKind::Command => {
                    tracing::debug!(step = %step.name, "skipping command step in down");
                }
                StepKind::Dependency if !self.options.stop_deps => {
                    tracing::info!(step = %step.name, "skipping dependency stop");
                }
                StepKind::Dependency | StepKind::Application => {
                    match runner.stop(step, &run_token).await {
                        Ok(()) => {
                            if step.kind == StepKind::Application {
                                self.confirm_stopped(&runner, step, &run_token).await;
                            }
                        }
                        Err(e @ OrchestrateError::Canceled(_)) => {
                            result = Err(e);
                            break;
                        }
                        Err(e) => {
                            tracing::error!(step = %step.name, error = %e, "failed to stop");
                        }
                    }
                }
            }
        }

        run_token.cancel();
        let _ = watchdog.await;
        pool.close_all().await;

        state.set_stage(Stage::Releasing);
        let outcome = Self::release_flag(flag, result);
        state.set_stage(Stage::Terminal);

        if outcome.is_ok() {
            tracing::info!("orchestration DOWN completed");
        }
        outcome
    }

    /// Post-stop probe: a check that still succeeds means the service kept
    /// running, which Down reports as a warning rather than a failure.
    async fn confirm_stopped(
        &self,
        runner: &StepRunner,
        step: &crate::config::Step,
        cancel: &CancellationToken,
    ) {
        if self.options.dry_run {
            tracing::info!(step = %step.name, "[dry-run] assuming stopped");
            return;
        }
        match runner.is_running(step, cancel).await {
            Ok(true) => {
                tracing::warn!(step = %step.name, "did not stop correctly, check still passes")
            }
            Ok(false) => tracing::info!(step = %step.name, "stopped"),
            Err(e) => tracing::debug!(step = %step.name, error = %e, "post-stop check aborted"),
        }
    }

    fn acquire_flag(&self) -> Result<Option<Flag>, OrchestrateError> {
        if self.options.dry_run {
            tracing::info!("[dry-run] skipping flag acquisition");
            return Ok(None);
        }

        let state_dir = self
            .options
            .state_dir
            .clone()
            .unwrap_or_else(Flag::default_state_dir);

        Flag::acquire(&state_dir, &self.options.environment)
            .map(Some)
            .map_err(OrchestrateError::from)
    }

    /// Release runs on every exit path. A release failure never masks the
    /// run's own error; it only surfaces when the run itself succeeded.
    fn release_flag(
        flag: Option<Flag>,
        outcome: Result<(), OrchestrateError>,
    ) -> Result<(), OrchestrateError> {
        let Some(flag) = flag else {
            return outcome;
        };

        match flag.release() {
            Ok(()) => outcome,
            Err(release_err) => {
                if outcome.is_err() {
                    tracing::warn!(error = %release_err, "failed to release flag");
                    outcome
                } else {
                    Err(OrchestrateError::from(release_err))
                }
            }
        }
    }

    fn spawn_timeout_watchdog(&self, run_token: &CancellationToken) -> JoinHandle<()> {
        let token = run_token.clone();
        let timeout = self.options.operation_timeout;
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    tracing::warn!(?timeout, "operation timeout reached, canceling run");
                    token.cancel();
                }
            }
        })
    }
}
