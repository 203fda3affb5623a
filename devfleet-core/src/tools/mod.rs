//! External collaborators.
//!
//! The orchestrator drives hardware only through these traits. Process-backed
//! implementations live in the submodules; tests substitute fakes.

pub mod adapter;
pub mod cfgutil;
pub mod notify;
pub mod tethering;

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    path::Path,
};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{device::DeviceInfo, error::ToolError, tasks::Ids};

pub use adapter::ScriptAdapter;
pub use cfgutil::CfgutilTool;
pub use notify::{NullNotifier, WebhookNotifier};
pub use tethering::{TetherStatusFormat, Tetherator};

/// Machine-readable failure reported by the configuration tool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReason {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i64>,
}

impl FailureReason {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Whether `needle` appears in the message or the detail.
    pub fn mentions(&self, needle: &str) -> bool {
        self.message.contains(needle)
            || self.detail.as_deref().is_some_and(|d| d.contains(needle))
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.detail {
            Some(detail) => write!(f, "{} ({detail})", self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// Result of one configuration-tool invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum CallOutcome {
    Success {
        succeeded: Ids,
        /// Requested devices the tool did not report on.
        missing: Ids,
        output: BTreeMap<String, Value>,
    },
    /// Some devices failed; `unaffected` completed.
    PartialFailure {
        affected: Ids,
        unaffected: Ids,
        reason: FailureReason,
    },
    /// Nothing happened.
    TotalFailure { affected: Ids, reason: FailureReason },
}

impl CallOutcome {
    pub fn success(succeeded: Ids) -> Self {
        CallOutcome::Success {
            succeeded,
            missing: Ids::new(),
            output: BTreeMap::new(),
        }
    }

    /// Devices the call completed for.
    pub fn succeeded(&self) -> Ids {
        match self {
            CallOutcome::Success { succeeded, .. } => succeeded.clone(),
            CallOutcome::PartialFailure { unaffected, .. } => unaffected.clone(),
            CallOutcome::TotalFailure { .. } => Ids::new(),
        }
    }

    /// Requested devices the call did not complete for.
    pub fn failed(&self, requested: &Ids) -> Ids {
        match self {
            CallOutcome::Success { missing, .. } => missing.clone(),
            CallOutcome::PartialFailure { affected, .. } => affected.clone(),
            CallOutcome::TotalFailure { .. } => requested.clone(),
        }
    }

    pub fn reason(&self) -> Option<&FailureReason> {
        match self {
            CallOutcome::Success { .. } => None,
            CallOutcome::PartialFailure { reason, .. }
            | CallOutcome::TotalFailure { reason, .. } => Some(reason),
        }
    }

    /// Per-device output of a successful call.
    pub fn output_for(&self, ecid: &str) -> Option<&Value> {
        match self {
            CallOutcome::Success { output, .. } => output.get(ecid),
            _ => None,
        }
    }

    pub fn is_total_failure(&self) -> bool {
        matches!(self, CallOutcome::TotalFailure { .. })
    }
}

/// Device-configuration command line tool.
pub trait ConfigTool: Send + Sync {
    /// Devices currently attached to the host.
    fn list(&self) -> Result<Vec<DeviceInfo>, ToolError>;

    fn get(&self, keys: &[String], ecids: &Ids) -> Result<CallOutcome, ToolError>;

    fn erase(&self, ecids: &Ids) -> Result<CallOutcome, ToolError>;

    /// Enroll devices into supervision.
    fn prepare(&self, ecids: &Ids) -> Result<CallOutcome, ToolError>;

    fn wallpaper(&self, ecids: &Ids, image: &Path) -> Result<CallOutcome, ToolError>;

    fn install_profile(
        &self,
        ecids: &Ids,
        profile: &Path,
    ) -> Result<CallOutcome, ToolError>;

    fn restart(&self, ecids: &Ids) -> Result<CallOutcome, ToolError>;

    fn shutdown(&self, ecids: &Ids) -> Result<CallOutcome, ToolError>;
}

/// A modal alert raised by the GUI during an install.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alert {
    pub message: String,
    #[serde(default)]
    pub details: String,
    #[serde(default)]
    pub choices: Vec<String>,
    #[serde(default)]
    pub options: Vec<String>,
}

impl Alert {
    pub fn new(message: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            details: details.into(),
            ..Self::default()
        }
    }
}

impl fmt::Display for Alert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.details.is_empty() {
            f.write_str(&self.message)
        } else {
            write!(f, "{}: {}", self.message, self.details)
        }
    }
}

/// What the GUI is doing right now.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Activity {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub details: String,
    #[serde(default)]
    pub choices: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterStatus {
    pub busy: bool,
    #[serde(default)]
    pub activity: Activity,
    #[serde(default)]
    pub alerts: Vec<Alert>,
}

/// GUI-automation adapter that installs apps.
pub trait InstallAdapter: Send + Sync {
    fn status(&self) -> Result<AdapterStatus, ToolError>;

    /// Start installing `apps` on `udids`; returns once the install begins.
    fn install_apps(
        &self,
        udids: &BTreeSet<String>,
        apps: &BTreeSet<String>,
    ) -> Result<(), ToolError>;

    /// Answer the current alert or prompt.
    fn action(&self, choice: &str, options: &[String]) -> Result<(), ToolError>;

    fn relaunch(&self) -> Result<(), ToolError>;
}

/// Network-tethering helper.
pub trait Tethering: Send + Sync {
    fn enabled(&self) -> Result<bool, ToolError>;

    fn devices_are_tethered(&self, serials: &[String]) -> Result<bool, ToolError>;

    fn restart(&self) -> Result<(), ToolError>;
}

/// Outbound notification sink. Delivery failures never reach the caller.
pub trait Notifier: Send + Sync {
    fn send(&self, message: &str);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::ids;

    #[test]
    fn outcome_partitions_requested_devices() {
        let requested = ids(["a", "b", "c"]);

        let partial = CallOutcome::PartialFailure {
            affected: ids(["b"]),
            unaffected: ids(["a", "c"]),
            reason: FailureReason::new("erase failed"),
        };
        assert_eq!(partial.succeeded(), ids(["a", "c"]));
        assert_eq!(partial.failed(&requested), ids(["b"]));

        let total = CallOutcome::TotalFailure {
            affected: ids(["b"]),
            reason: FailureReason::new("no devices"),
        };
        assert!(total.succeeded().is_empty());
        assert_eq!(total.failed(&requested), requested);
    }

    #[test]
    fn reason_mentions_searches_detail() {
        let reason = FailureReason::new("The device could not be prepared.")
            .with_detail("Network communication error.");
        assert!(reason.mentions("Network communication"));
        assert!(!reason.mentions("must be erased"));
    }
}
