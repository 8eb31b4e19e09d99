// ABOUTME: Shared run state for one controller invocation.
// ABOUTME: Tracks the started-step set and the run stage under one lock.

use parking_lot::Mutex;
use std::fmt;

/// Where a run currently is. Logged on every transition; the terminal
/// stage guarantees the flag is released and no spawned task survives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Idle,
    Acquiring,
    Monitoring,
    Running,
    RollingBack,
    Releasing,
    Terminal,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Idle => "idle",
            Stage::Acquiring => "acquiring",
            Stage::Monitoring => "monitoring",
            Stage::Running => "running",
            Stage::RollingBack => "rolling-back",
            Stage::Releasing => "releasing",
            Stage::Terminal => "terminal",
        };
        write!(f, "{s}")
    }
}

struct Inner {
    /// Indices of steps whose start command succeeded, in start order.
    /// Grows monotonically while Running; consumed in reverse by rollback.
    started: Vec<usize>,
    stage: Stage,
}

/// Run state shared between the sequencer (writer), the monitor (reader),
/// and rollback (reader). All access is a brief lock-and-copy.
pub struct RunState {
    inner: Mutex<Inner>,
}

impl RunState {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                started: Vec::new(),
                stage: Stage::Idle,
            }),
        }
    }

    pub fn set_stage(&self, stage: Stage) {
        let mut inner = self.inner.lock();
        tracing::debug!(from = %inner.stage, to = %stage, "run stage transition");
        inner.stage = stage;
    }

    pub fn stage(&self) -> Stage {
        self.inner.lock().stage
    }

    pub fn record_started(&self, index: usize) {
        let mut inner = self.inner.lock();
        debug_assert!(
            inner.started.last().is_none_or(|&last| last < index),
            "started set must grow by step index"
        );
        inner.started.push(index);
    }

    /// Snapshot of the started set.
    pub fn started(&self) -> Vec<usize> {
        self.inner.lock().started.clone()
    }
}

impl Default for RunState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn started_set_snapshots_are_independent() {
        let state = RunState::new();
        state.record_started(0);
        let snapshot = state.started();
        state.record_started(2);
        assert_eq!(snapshot, vec![0]);
        assert_eq!(state.started(), vec![0, 2]);
    }

    #[test]
    fn stage_starts_idle() {
        let state = RunState::new();
        assert_eq!(state.stage(), Stage::Idle);
        state.set_stage(Stage::Running);
        assert_eq!(state.stage(), Stage::Running);
    }
}
