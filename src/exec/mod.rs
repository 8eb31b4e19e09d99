// ABOUTME: Host executor abstraction over SSH with dry-run support.
// ABOUTME: Defines the capability contract the orchestration engine consumes.

mod fanout;
mod pool;

pub use fanout::fan_out;
pub use pool::ExecutorPool;

use crate::config::HostTarget;
use crate::ssh::{Session, SessionConfig};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// How much captured output an error message carries.
const OUTPUT_TAIL_CHARS: usize = 400;

/// Outcome of one remote command on one host. A non-zero exit is still an
/// `ExecOutput`; `RunError` is reserved for transport-level failures.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: u32,
    pub output: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Transport-level failure of a single `run` call.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("{0}")]
    Transport(String),

    #[error("canceled")]
    Canceled,
}

/// One host's contribution to an aggregated fan-out failure.
#[derive(Debug, Clone)]
pub struct HostFailure {
    pub host: String,
    /// None when the command never ran (unreachable host, transport error).
    pub exit_code: Option<u32>,
    pub detail: String,
}

impl std::fmt::Display for HostFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.exit_code {
            Some(code) => write!(f, "{} (exit {}): {}", self.host, code, self.detail),
            None => write!(f, "{}: {}", self.host, self.detail),
        }
    }
}

/// Aggregated outcome of a fan-out that did not fully succeed.
#[derive(Debug, Error)]
pub enum ExecError {
    /// Every failing host failed before the command could run.
    #[error("host(s) unreachable: {}", format_failures(.0))]
    Unreachable(Vec<HostFailure>),

    /// At least one host ran the command and it failed.
    #[error("command failed on {}", format_failures(.0))]
    CommandFailed(Vec<HostFailure>),

    /// The cancellation scope fired while the fan-out was in flight.
    #[error("execution canceled")]
    Canceled,
}

fn format_failures(failures: &[HostFailure]) -> String {
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Failure to construct an executor for a host.
#[derive(Debug, Error)]
#[error("failed to reach {host}: {reason}")]
pub struct ConnectError {
    pub host: String,
    pub reason: String,
}

/// Runs opaque shell strings on one remote host.
///
/// Implementations serialize concurrent `run` calls internally; callers may
/// hold one executor per host and fan out across executors freely.
#[async_trait]
pub trait HostExecutor: Send + Sync {
    /// Execute a command, returning its exit status and captured output.
    /// Cancellation aborts the in-flight remote process (best effort).
    async fn run(&self, command: &str, cancel: &CancellationToken)
        -> Result<ExecOutput, RunError>;

    /// Tear down the underlying transport. Idempotent; errors are logged.
    async fn close(&self);

    /// Whether the transport is still usable.
    fn is_alive(&self) -> bool;
}

/// Constructs executors on first use per host. The pool owns one.
#[async_trait]
pub trait ExecutorFactory: Send + Sync {
    async fn build(&self, target: &HostTarget) -> Result<Arc<dyn HostExecutor>, ConnectError>;
}

/// Executor backed by a live russh session.
pub struct SshExecutor {
    host: String,
    session: Session,
    // One exec channel at a time per session.
    run_lock: tokio::sync::Mutex<()>,
    closed: AtomicBool,
}

impl SshExecutor {
    pub async fn connect(target: &HostTarget, trust_on_first_use: bool) -> Result<Self, ConnectError> {
        let config = SessionConfig::new(&target.hostname, &target.user)
            .key_path(&target.key_path)
            .connect_timeout(target.timeout)
            .trust_on_first_use(trust_on_first_use);

        let session = Session::connect(config).await.map_err(|e| ConnectError {
            host: target.hostname.clone(),
            reason: e.to_string(),
        })?;

        Ok(Self {
            host: target.hostname.clone(),
            session,
            run_lock: tokio::sync::Mutex::new(()),
            closed: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl HostExecutor for SshExecutor {
    async fn run(
        &self,
        command: &str,
        cancel: &CancellationToken,
    ) -> Result<ExecOutput, RunError> {
        let _serialized = self.run_lock.lock().await;
        tracing::debug!(host = %self.host, command, "executing remote command");

        match self.session.exec(command, cancel).await {
            Ok(output) => Ok(ExecOutput {
                exit_code: output.exit_code,
                output: tail(&output.combined()),
            }),
            Err(crate::ssh::Error::Canceled) => Err(RunError::Canceled),
            Err(e) => Err(RunError::Transport(e.to_string())),
        }
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.session.disconnect().await {
            tracing::warn!(host = %self.host, error = %e, "SSH disconnect failed");
        }
    }

    fn is_alive(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.session.is_alive()
    }
}

/// Factory producing real SSH executors.
pub struct SshExecutorFactory {
    trust_on_first_use: bool,
}

impl SshExecutorFactory {
    pub fn new() -> Self {
        // Orchestration targets are provisioned hosts; first contact learns
        // the key rather than failing the run.
        Self {
            trust_on_first_use: true,
        }
    }
}

impl Default for SshExecutorFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExecutorFactory for SshExecutorFactory {
    async fn build(&self, target: &HostTarget) -> Result<Arc<dyn HostExecutor>, ConnectError> {
        let executor = SshExecutor::connect(target, self.trust_on_first_use).await?;
        Ok(Arc::new(executor))
    }
}

/// Executor that never touches the network. Always succeeds with empty
/// output. Selected at pool construction when running with --dry-run.
pub struct DryRunExecutor {
    host: String,
}

#[async_trait]
impl HostExecutor for DryRunExecutor {
    async fn run(
        &self,
        command: &str,
        _cancel: &CancellationToken,
    ) -> Result<ExecOutput, RunError> {
        tracing::info!(host = %self.host, command, "[dry-run] would execute");
        Ok(ExecOutput {
            exit_code: 0,
            output: String::new(),
        })
    }

    async fn close(&self) {}

    fn is_alive(&self) -> bool {
        true
    }
}

pub struct DryRunExecutorFactory;

#[async_trait]
impl ExecutorFactory for DryRunExecutorFactory {
    async fn build(&self, target: &HostTarget) -> Result<Arc<dyn HostExecutor>, ConnectError> {
        Ok(Arc::new(DryRunExecutor {
            host: target.hostname.clone(),
        }))
    }
}

/// Last `OUTPUT_TAIL_CHARS` characters of command output.
fn tail(s: &str) -> String {
    let trimmed = s.trim_end();
    if trimmed.chars().count() <= OUTPUT_TAIL_CHARS {
        return trimmed.to_string();
    }
    let skip = trimmed.chars().count() - OUTPUT_TAIL_CHARS;
    trimmed.chars().skip(skip).collect()
}
