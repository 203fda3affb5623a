use std::{path::PathBuf, time::Duration};

use thiserror::Error;

/// Failures of the locked document store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("document not found: {}", path.display())]
    NotFound { path: PathBuf },

    #[error("key not found: {key}")]
    KeyNotFound { key: String },

    #[error("timed out after {waited:?} waiting for lock {}", path.display())]
    LockTimeout { path: PathBuf, waited: Duration },

    #[error("invalid value for {key}: expected {expected}")]
    InvalidValue { key: String, expected: &'static str },
}

/// Failures talking to an external tool process.
#[derive(Error, Debug)]
pub enum ToolError {
    #[error("failed to launch {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid output from {program}: {source}")]
    InvalidOutput {
        program: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("{program} exited with {status}: {stderr}")]
    Exit {
        program: String,
        status: String,
        stderr: String,
    },

    #[error("adapter failure: {0}")]
    Adapter(String),

    #[error("notification delivery failed: {0}")]
    Delivery(String),
}

/// An alert no recovery rule knows how to answer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unrecoverable alert: {alert}")]
pub struct RecoveryError {
    pub alert: String,
}

impl RecoveryError {
    pub fn new(alert: impl Into<String>) -> Self {
        Self {
            alert: alert.into(),
        }
    }
}

/// Failures of one app-install session.
#[derive(Error, Debug)]
pub enum InstallError {
    #[error(transparent)]
    Unrecoverable(#[from] RecoveryError),

    #[error("install stalled: {activity}")]
    Stalled { activity: String },

    #[error(transparent)]
    Adapter(#[from] ToolError),

    #[error("no apps to install")]
    NothingToInstall,
}

/// Crate-level error.
#[derive(Error, Debug)]
pub enum FleetError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error(transparent)]
    Install(#[from] InstallError),

    #[error(transparent)]
    Recovery(#[from] RecoveryError),

    #[error(
        "device {ecid}: recorded {key} {recorded:?} does not match reported {reported:?}"
    )]
    IdentityMismatch {
        ecid: String,
        key: String,
        recorded: String,
        reported: String,
    },

    #[error("device {ecid} has no record and no identity to create one")]
    MissingSeed { ecid: String },

    #[error("device {ecid} record is missing {key}")]
    RecordIncomplete { ecid: String, key: String },

    #[error("{command} failed: {reason}")]
    TotalFailure { command: String, reason: String },

    #[error("configuration error: {0}")]
    Config(String),
}

impl FleetError {
    /// Whether a run may log this failure at a stage boundary and continue
    /// with the next stage.
    pub fn is_stage_local(&self) -> bool {
        matches!(
            self,
            FleetError::Tool(_)
                | FleetError::Install(_)
                | FleetError::Recovery(_)
                | FleetError::TotalFailure { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, FleetError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_and_identity_errors_are_not_stage_local() {
        let err = FleetError::from(StoreError::KeyNotFound {
            key: "erased".into(),
        });
        assert!(!err.is_stage_local());

        let err = FleetError::IdentityMismatch {
            ecid: "0x1".into(),
            key: "UDID".into(),
            recorded: "a".into(),
            reported: "b".into(),
        };
        assert!(!err.is_stage_local());
    }

    #[test]
    fn tool_and_install_errors_are_stage_local() {
        let err = FleetError::from(InstallError::Stalled {
            activity: "Downloading".into(),
        });
        assert!(err.is_stage_local());
        assert!(
            FleetError::TotalFailure {
                command: "erase".into(),
                reason: "no devices".into(),
            }
            .is_stage_local()
        );
    }
}
