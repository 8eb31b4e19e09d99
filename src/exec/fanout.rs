// ABOUTME: Parallel execution of one command across a step's hosts.
// ABOUTME: Aggregates per-host failures; cancellation short-circuits the result.

use super::{ExecError, ExecutorPool, HostFailure, RunError};
use crate::config::HostTarget;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

enum HostOutcome {
    Ok,
    Canceled,
    Unreachable(HostFailure),
    Failed(HostFailure),
}

/// Run `command` on every target concurrently and wait for all of them.
///
/// Returns `Ok(())` only if every host reported exit status 0. If the
/// cancellation scope fires mid-flight, every still-running executor
/// observes it and the overall result is `ExecError::Canceled` rather than
/// the per-host errors.
pub async fn fan_out(
    pool: &Arc<ExecutorPool>,
    targets: &[HostTarget],
    command: &str,
    cancel: &CancellationToken,
) -> Result<(), ExecError> {
    let mut workers = JoinSet::new();

    for target in targets {
        let pool = Arc::clone(pool);
        let target = target.clone();
        let command = command.to_string();
        let cancel = cancel.clone();

        workers.spawn(async move {
            let executor = match pool.get(&target).await {
                Ok(executor) => executor,
                Err(e) => {
                    tracing::warn!(host = %target.hostname, error = %e, "host unreachable");
                    return HostOutcome::Unreachable(HostFailure {
                        host: target.hostname.clone(),
                        exit_code: None,
                        detail: e.reason,
                    });
                }
            };

            match executor.run(&command, &cancel).await {
                Ok(output) if output.success() => {
                    tracing::debug!(host = %target.hostname, command, "command succeeded");
                    HostOutcome::Ok
                }
                Ok(output) => {
                    tracing::warn!(
                        host = %target.hostname,
                        command,
                        exit_code = output.exit_code,
                        "command failed"
                    );
                    HostOutcome::Failed(HostFailure {
                        host: target.hostname.clone(),
                        exit_code: Some(output.exit_code),
                        detail: output.output,
                    })
                }
                Err(RunError::Canceled) => HostOutcome::Canceled,
                Err(RunError::Transport(reason)) => {
                    tracing::warn!(host = %target.hostname, command, error = %reason, "transport failure");
                    HostOutcome::Failed(HostFailure {
                        host: target.hostname.clone(),
                        exit_code: None,
                        detail: reason,
                    })
                }
            }
        });
    }

    let mut failures = Vec::new();
    let mut unreachable = 0usize;
    let mut canceled = false;

    while let Some(joined) = workers.join_next().await {
        match joined {
            Ok(HostOutcome::Ok) => {}
            Ok(HostOutcome::Canceled) => canceled = true,
            Ok(HostOutcome::Unreachable(failure)) => {
                unreachable += 1;
                failures.push(failure);
            }
            Ok(HostOutcome::Failed(failure)) => failures.push(failure),
            Err(join_error) => {
                // A panicked worker counts as a failed host of unknown name.
                failures.push(HostFailure {
                    host: "<worker>".to_string(),
                    exit_code: None,
                    detail: join_error.to_string(),
                });
            }
        }
    }

    if canceled || cancel.is_cancelled() {
        return Err(ExecError::Canceled);
    }
    if failures.is_empty() {
        return Ok(());
    }
    if unreachable == failures.len() {
        return Err(ExecError::Unreachable(failures));
    }
    Err(ExecError::CommandFailed(failures))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::{ConnectError, ExecOutput, ExecutorFactory, HostExecutor};
    use async_trait::async_trait;
    use std::path::PathBuf;
    use std::time::Duration;

    fn target(alias: &str) -> HostTarget {
        HostTarget {
            alias: alias.to_string(),
            hostname: format!("{alias}.internal"),
            user: "deploy".to_string(),
            key_path: PathBuf::from("/dev/null"),
            timeout: Duration::from_secs(5),
        }
    }

    /// Executor whose exit code depends on its host name.
    struct FixedExecutor {
        exit_code: u32,
    }

    #[async_trait]
    impl HostExecutor for FixedExecutor {
        async fn run(
            &self,
            _command: &str,
            cancel: &CancellationToken,
        ) -> Result<ExecOutput, RunError> {
            if cancel.is_cancelled() {
                return Err(RunError::Canceled);
            }
            Ok(ExecOutput {
                exit_code: self.exit_code,
                output: "out".to_string(),
            })
        }

        async fn close(&self) {}

        fn is_alive(&self) -> bool {
            true
        }
    }

    struct FixedFactory;

    #[async_trait]
    impl ExecutorFactory for FixedFactory {
        async fn build(
            &self,
            target: &HostTarget,
        ) -> Result<Arc<dyn HostExecutor>, ConnectError> {
            if target.alias.starts_with("down") {
                return Err(ConnectError {
                    host: target.hostname.clone(),
                    reason: "connection refused".to_string(),
                });
            }
            let exit_code = if target.alias.starts_with("bad") { 1 } else { 0 };
            Ok(Arc::new(FixedExecutor { exit_code }))
        }
    }

    fn pool() -> Arc<ExecutorPool> {
        Arc::new(ExecutorPool::new(Arc::new(FixedFactory)))
    }

    #[tokio::test]
    async fn all_hosts_ok() {
        let pool = pool();
        let targets = vec![target("a"), target("b")];
        let result = fan_out(&pool, &targets, "true", &CancellationToken::new()).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn single_failure_is_aggregated_with_host_name() {
        let pool = pool();
        let targets = vec![target("a"), target("bad1")];
        let err = fan_out(&pool, &targets, "true", &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            ExecError::CommandFailed(failures) => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].host, "bad1.internal");
                assert_eq!(failures[0].exit_code, Some(1));
            }
            other => panic!("expected CommandFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unreachable_hosts_get_their_own_error() {
        let pool = pool();
        let targets = vec![target("down1")];
        let err = fan_out(&pool, &targets, "true", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Unreachable(_)));
    }

    #[tokio::test]
    async fn cancellation_wins_over_host_errors() {
        let pool = pool();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let targets = vec![target("bad1"), target("a")];
        let err = fan_out(&pool, &targets, "true", &cancel).await.unwrap_err();
        assert!(matches!(err, ExecError::Canceled));
    }

    #[tokio::test]
    async fn pool_reuses_executor_per_host() {
        let pool = pool();
        let t = target("a");
        let first = pool.get(&t).await.unwrap();
        let second = pool.get(&t).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn pool_does_not_cache_construction_failures() {
        let pool = pool();
        let t = target("down1");
        assert!(pool.get(&t).await.is_err());
        // A retry goes back to the factory instead of replaying the error.
        assert!(pool.get(&t).await.is_err());
    }
}
