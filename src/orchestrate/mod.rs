// ABOUTME: Orchestration engine: sequencing, health monitoring, rollback.
// ABOUTME: Exports the controller, run options, and error types.

mod controller;
mod error;
mod monitor;
mod rollback;
mod sequencer;
mod state;
mod step_runner;

pub use controller::Controller;
pub use error::{ErrorKind, OrchestrateError};
pub use monitor::MonitorFailure;
pub use state::{RunState, Stage};
pub use step_runner::StepRunner;

use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_START_WAIT: Duration = Duration::from_secs(5);
pub const DEFAULT_MONITOR_INTERVAL: Duration = Duration::from_secs(2);
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_ROLLBACK_STEP_TIMEOUT: Duration = Duration::from_secs(60);

/// Options for one orchestration run.
#[derive(Debug, Clone)]
pub struct Options {
    pub environment: String,
    /// Log every operation without contacting any host.
    pub dry_run: bool,
    /// Up: start/stop dependency steps instead of just verifying them.
    pub handle_deps: bool,
    /// Down: also stop dependency steps.
    pub stop_deps: bool,
    /// Settle window between a start command and its health check.
    pub start_wait: Duration,
    /// Background monitor poll interval.
    pub monitor_interval: Duration,
    /// Overall wall-clock bound on one up/down operation.
    pub operation_timeout: Duration,
    /// Per-step bound during rollback, which ignores the run scope.
    pub rollback_step_timeout: Duration,
    /// Where flag files live; defaults to a per-user state directory.
    pub state_dir: Option<PathBuf>,
}

impl Options {
    pub fn new(environment: impl Into<String>) -> Self {
        Self {
            environment: environment.into(),
            dry_run: false,
            handle_deps: false,
            stop_deps: false,
            start_wait: DEFAULT_START_WAIT,
            monitor_interval: DEFAULT_MONITOR_INTERVAL,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            rollback_step_timeout: DEFAULT_ROLLBACK_STEP_TIMEOUT,
            state_dir: None,
        }
    }
}
