// ABOUTME: Error types for orchestration runs.
// ABOUTME: Each variant maps to a distinct caller reaction; kind() backs CLI messaging.

use thiserror::Error;

use crate::flag::FlagError;

/// Failures of an orchestration run.
///
/// `RolledBack` and `RollbackIncomplete` wrap the triggering error so the
/// final message summarizes both the trigger and the cleanup result;
/// `kind()` on `RolledBack` delegates to the trigger.
#[derive(Debug, Error)]
pub enum OrchestrateError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("another operation is in progress for environment '{0}'")]
    FlagContention(String),

    #[error("flag I/O failure: {0}")]
    FlagIo(String),

    #[error("step '{step}': {detail}")]
    HostUnreachable { step: String, detail: String },

    #[error("step '{step}' {action} failed: {detail}")]
    CommandFailed {
        step: String,
        action: String,
        detail: String,
    },

    #[error("health check failed for step '{step}': {detail}")]
    HealthCheckFailed { step: String, detail: String },

    #[error("dependency '{step}' is not running: {detail}")]
    DependencyNotRunning { step: String, detail: String },

    #[error("monitor detected failure in step '{step}': {detail}")]
    MonitorFailure { step: String, detail: String },

    #[error("operation canceled: {0}")]
    Canceled(String),

    #[error("{source} (rollback completed)")]
    RolledBack { source: Box<OrchestrateError> },

    #[error("{source} (rollback had errors on: {})", .failed_steps.join(", "))]
    RollbackIncomplete {
        source: Box<OrchestrateError>,
        failed_steps: Vec<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Config,
    FlagContention,
    FlagIo,
    HostUnreachable,
    CommandFailed,
    HealthCheckFailed,
    DependencyNotRunning,
    MonitorFailure,
    Canceled,
    RollbackIncomplete,
}

impl OrchestrateError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            OrchestrateError::Config(_) => ErrorKind::Config,
            OrchestrateError::FlagContention(_) => ErrorKind::FlagContention,
            OrchestrateError::FlagIo(_) => ErrorKind::FlagIo,
            OrchestrateError::HostUnreachable { .. } => ErrorKind::HostUnreachable,
            OrchestrateError::CommandFailed { .. } => ErrorKind::CommandFailed,
            OrchestrateError::HealthCheckFailed { .. } => ErrorKind::HealthCheckFailed,
            OrchestrateError::DependencyNotRunning { .. } => ErrorKind::DependencyNotRunning,
            OrchestrateError::MonitorFailure { .. } => ErrorKind::MonitorFailure,
            OrchestrateError::Canceled(_) => ErrorKind::Canceled,
            // A clean rollback keeps the triggering failure's identity.
            OrchestrateError::RolledBack { source } => source.kind(),
            OrchestrateError::RollbackIncomplete { .. } => ErrorKind::RollbackIncomplete,
        }
    }
}

impl From<FlagError> for OrchestrateError {
    fn from(err: FlagError) -> Self {
        match err {
            FlagError::Contention { environment } => OrchestrateError::FlagContention(environment),
            FlagError::Io { .. } => OrchestrateError::FlagIo(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rolled_back_keeps_the_trigger_kind() {
        let err = OrchestrateError::RolledBack {
            source: Box::new(OrchestrateError::CommandFailed {
                step: "api".to_string(),
                action: "start".to_string(),
                detail: "exit 1".to_string(),
            }),
        };
        assert_eq!(err.kind(), ErrorKind::CommandFailed);
        assert!(err.to_string().contains("rollback completed"));
    }

    #[test]
    fn rollback_incomplete_lists_failed_steps() {
        let err = OrchestrateError::RollbackIncomplete {
            source: Box::new(OrchestrateError::HealthCheckFailed {
                step: "api".to_string(),
                detail: "exit 1".to_string(),
            }),
            failed_steps: vec!["db".to_string(), "cache".to_string()],
        };
        assert_eq!(err.kind(), ErrorKind::RollbackIncomplete);
        assert!(err.to_string().contains("db, cache"));
    }
}
