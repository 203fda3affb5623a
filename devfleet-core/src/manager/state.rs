use std::fmt;

use serde::{Deserialize, Serialize};

/// Stage of the current run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    #[default]
    Idle,
    Querying,
    Erasing,
    Supervising,
    InstallingApps,
    Verifying,
    Finalizing,
    Stopped,
}

impl RunState {
    pub fn allowed_transitions(self) -> &'static [RunState] {
        use RunState::*;
        match self {
            Idle => &[Querying, Verifying, Finalizing, Stopped],
            Querying => &[Erasing, Idle, Stopped],
            Erasing => &[Supervising, Idle, Stopped],
            Supervising => &[InstallingApps, Idle, Stopped],
            InstallingApps => &[Finalizing, Idle, Stopped],
            Finalizing => &[Verifying, Idle, Stopped],
            // A failed verification may start a run of its own.
            Verifying => &[Querying, Finalizing, Idle, Stopped],
            Stopped => &[Idle],
        }
    }

    pub fn can_transition_to(self, next: RunState) -> bool {
        self != next && self.allowed_transitions().contains(&next)
    }

    /// Whether a run is in progress.
    pub fn is_active(self) -> bool {
        !matches!(self, RunState::Idle | RunState::Stopped)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunState::Idle => "idle",
            RunState::Querying => "querying",
            RunState::Erasing => "erasing",
            RunState::Supervising => "supervising",
            RunState::InstallingApps => "installing_apps",
            RunState::Verifying => "verifying",
            RunState::Finalizing => "finalizing",
            RunState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a run (or verification) ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    /// The fleet is stopped; carries the stop reason.
    Aborted(String),
}

impl RunOutcome {
    pub fn is_aborted(&self) -> bool {
        matches!(self, RunOutcome::Aborted(_))
    }
}

/// Stage result checked by the run loop at every stage boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop(String),
}
