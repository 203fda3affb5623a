//! Process-backed [`ConfigTool`].
//!
//! Invokes the configuration binary as
//! `<bin> --format JSON [-C cert -K key] [--ecid X]... <command> <args>` and
//! interprets its JSON report.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    process::Command,
};

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, error};

use super::{CallOutcome, ConfigTool, FailureReason};
use crate::{device::DeviceInfo, error::ToolError, tasks::Ids};

/// Commands that are run with the signing identity when one is configured.
const AUTHENTICATED: &[&str] = &[
    "wallpaper",
    "restart",
    "shut-down",
    "install-app",
    "remove-app",
];

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Report {
    #[serde(rename = "Type")]
    kind: Option<String>,
    #[serde(default)]
    devices: Vec<String>,
    #[serde(default)]
    output: BTreeMap<String, Value>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    failure_reason: Option<String>,
    #[serde(default, alias = "Details")]
    detail: Option<String>,
    #[serde(default)]
    code: Option<i64>,
    #[serde(default)]
    affected_devices: Vec<String>,
    #[serde(default)]
    unaffected_devices: Vec<String>,
}

impl Report {
    fn reason(&self, fallback: &str) -> FailureReason {
        let message = self
            .message
            .clone()
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| fallback.to_owned());
        let detail = match (&self.failure_reason, &self.detail) {
            (Some(reason), Some(detail)) if !reason.is_empty() => {
                Some(format!("{reason}: {detail}"))
            }
            (Some(reason), _) if !reason.is_empty() => Some(reason.clone()),
            (_, detail) => detail.clone(),
        };
        FailureReason {
            message,
            detail,
            code: self.code,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CfgutilTool {
    program: PathBuf,
    identity: Option<(PathBuf, PathBuf)>,
}

impl CfgutilTool {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            identity: None,
        }
    }

    /// Signing certificate and private key for supervised-only commands.
    pub fn with_identity(mut self, cert: PathBuf, key: PathBuf) -> Self {
        self.identity = Some((cert, key));
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Full argument vector for one invocation.
    pub fn arguments(&self, command: &str, ecids: &Ids, args: &[String]) -> Vec<String> {
        let mut argv = vec!["--format".to_owned(), "JSON".to_owned()];
        if AUTHENTICATED.contains(&command)
            && let Some((cert, key)) = &self.identity
        {
            argv.extend([
                "-C".to_owned(),
                cert.display().to_string(),
                "-K".to_owned(),
                key.display().to_string(),
            ]);
        }
        for ecid in ecids {
            argv.push("--ecid".to_owned());
            argv.push(ecid.clone());
        }
        argv.push(command.to_owned());
        argv.extend(args.iter().cloned());
        argv
    }

    fn execute(
        &self,
        command: &str,
        ecids: &Ids,
        args: &[String],
    ) -> Result<CallOutcome, ToolError> {
        let program = self.program.display().to_string();
        let argv = self.arguments(command, ecids, args);
        debug!(command = %format!("{program} {}", argv.join(" ")), "executing");

        let output = Command::new(&self.program)
            .args(&argv)
            .output()
            .map_err(|source| ToolError::Spawn {
                program: program.clone(),
                source,
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        debug!(status = %output.status, stdout = %stdout, stderr = %stderr, "{command} finished");

        interpret(
            &program,
            command,
            ecids,
            output.status.success(),
            &stdout,
            &stderr,
        )
    }
}

/// Classify one invocation's exit status and JSON report.
pub(crate) fn interpret(
    program: &str,
    command: &str,
    requested: &Ids,
    exited_ok: bool,
    stdout: &str,
    stderr: &str,
) -> Result<CallOutcome, ToolError> {
    let report: Report = if stdout.trim().is_empty() {
        Report {
            kind: Some("Error".to_owned()),
            message: Some(stderr.trim().to_owned()),
            failure_reason: Some("missing output".to_owned()),
            ..Report::default()
        }
    } else {
        serde_json::from_str(stdout).map_err(|source| ToolError::InvalidOutput {
            program: program.to_owned(),
            source,
        })?
    };

    if !exited_ok {
        let fallback = if stderr.trim().is_empty() {
            format!("{command}: failed")
        } else {
            stderr.trim().to_owned()
        };
        let affected = if report.affected_devices.is_empty() {
            requested.clone()
        } else {
            report.affected_devices.iter().cloned().collect()
        };
        let reason = report.reason(&fallback);
        error!(command, reason = %reason, "configuration tool failed");
        return Ok(CallOutcome::TotalFailure { affected, reason });
    }

    match report.kind.as_deref() {
        Some("Error") => {
            let affected: Ids = report.affected_devices.iter().cloned().collect();
            let unaffected: Ids = report.unaffected_devices.iter().cloned().collect();
            let reason = report.reason("Unknown error");
            // Only devices the tool names as unaffected completed.
            if unaffected.is_empty() {
                let affected = if affected.is_empty() {
                    requested.clone()
                } else {
                    affected
                };
                error!(command, reason = %reason, "configuration tool reported an error");
                return Ok(CallOutcome::TotalFailure { affected, reason });
            }
            Ok(CallOutcome::PartialFailure {
                reason,
                affected,
                unaffected,
            })
        }
        _ => {
            let succeeded: Ids = report.devices.iter().cloned().collect();
            let missing = requested.difference(&succeeded).cloned().collect();
            Ok(CallOutcome::Success {
                succeeded,
                missing,
                output: report.output,
            })
        }
    }
}

impl ConfigTool for CfgutilTool {
    fn list(&self) -> Result<Vec<DeviceInfo>, ToolError> {
        let outcome = self.execute("list", &Ids::new(), &[])?;
        let CallOutcome::Success { output, .. } = outcome else {
            let reason = outcome
                .reason()
                .map(ToString::to_string)
                .unwrap_or_default();
            return Err(ToolError::Adapter(format!("list failed: {reason}")));
        };
        output
            .into_iter()
            .map(|(ecid, mut info)| {
                if let Value::Object(map) = &mut info {
                    map.entry("ECID").or_insert_with(|| Value::String(ecid));
                }
                serde_json::from_value(info).map_err(|source| ToolError::InvalidOutput {
                    program: self.program.display().to_string(),
                    source,
                })
            })
            .collect()
    }

    fn get(&self, keys: &[String], ecids: &Ids) -> Result<CallOutcome, ToolError> {
        self.execute("get", ecids, keys)
    }

    fn erase(&self, ecids: &Ids) -> Result<CallOutcome, ToolError> {
        self.execute("erase", ecids, &[])
    }

    fn prepare(&self, ecids: &Ids) -> Result<CallOutcome, ToolError> {
        let args = ["--dep", "--skip-language", "--skip-region"].map(str::to_owned);
        self.execute("prepare", ecids, &args)
    }

    fn wallpaper(&self, ecids: &Ids, image: &Path) -> Result<CallOutcome, ToolError> {
        let args = [
            "--screen".to_owned(),
            "both".to_owned(),
            image.display().to_string(),
        ];
        self.execute("wallpaper", ecids, &args)
    }

    fn install_profile(
        &self,
        ecids: &Ids,
        profile: &Path,
    ) -> Result<CallOutcome, ToolError> {
        self.execute("install-profile", ecids, &[profile.display().to_string()])
    }

    fn restart(&self, ecids: &Ids) -> Result<CallOutcome, ToolError> {
        self.execute("restart", ecids, &[])
    }

    fn shutdown(&self, ecids: &Ids) -> Result<CallOutcome, ToolError> {
        self.execute("shut-down", ecids, &[])
    }
}
