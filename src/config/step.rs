// ABOUTME: Step definitions for an environment's bring-up sequence.
// ABOUTME: Declares step kinds and the command set each kind requires.

use crate::error::{Error, Result};
use nonempty::NonEmpty;
use serde::Deserialize;
use std::fmt;

/// One entry in an environment's declared sequence.
///
/// The sequence order is authoritative: it defines forward order for
/// bring-up and, reversed, the order for bring-down and rollback.
#[derive(Debug, Clone, Deserialize)]
pub struct Step {
    pub name: String,

    #[serde(rename = "type")]
    pub kind: StepKind,

    #[serde(deserialize_with = "deserialize_hosts")]
    pub hosts: NonEmpty<String>,

    #[serde(default)]
    pub start: Option<String>,

    #[serde(default)]
    pub check: Option<String>,

    #[serde(default)]
    pub stop: Option<String>,

    #[serde(default)]
    pub run: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepKind {
    /// A service some application depends on. Verified or managed at
    /// bring-up depending on run options; stopped only when asked.
    Dependency,
    /// A service this environment owns. Always started, checked, and
    /// rolled back.
    Application,
    /// A one-shot side effect. Not a lifecycle event: never checked,
    /// never stopped, never rolled back.
    Command,
}

impl StepKind {
    /// Whether steps of this kind participate in stop/rollback.
    pub fn is_lifecycle(self) -> bool {
        !matches!(self, StepKind::Command)
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StepKind::Dependency => "dependency",
            StepKind::Application => "application",
            StepKind::Command => "command",
        };
        write!(f, "{s}")
    }
}

impl Step {
    /// Check that the commands this step's kind requires are present.
    pub(super) fn validate_commands(&self, env_name: &str) -> Result<()> {
        let missing: Vec<&str> = match self.kind {
            StepKind::Dependency | StepKind::Application => [
                ("start", &self.start),
                ("check", &self.check),
                ("stop", &self.stop),
            ]
            .iter()
            .filter(|(_, cmd)| cmd.is_none())
            .map(|(name, _)| *name)
            .collect(),
            StepKind::Command => {
                if self.run.is_none() {
                    vec!["run"]
                } else {
                    vec![]
                }
            }
        };

        if missing.is_empty() {
            Ok(())
        } else {
            Err(Error::InvalidConfig(format!(
                "step '{}' ({}) in environment '{}' is missing required command(s): {}",
                self.name,
                self.kind,
                env_name,
                missing.join(", ")
            )))
        }
    }

    /// The `start` command. Validated present for lifecycle kinds.
    pub fn start_command(&self) -> &str {
        self.start.as_deref().unwrap_or_default()
    }

    pub fn check_command(&self) -> &str {
        self.check.as_deref().unwrap_or_default()
    }

    pub fn stop_command(&self) -> &str {
        self.stop.as_deref().unwrap_or_default()
    }

    pub fn run_command(&self) -> &str {
        self.run.as_deref().unwrap_or_default()
    }
}

fn deserialize_hosts<'de, D>(deserializer: D) -> std::result::Result<NonEmpty<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let values: Vec<String> = Vec::deserialize(deserializer)?;
    NonEmpty::from_vec(values)
        .ok_or_else(|| serde::de::Error::custom("step requires at least one host"))
}
