//! Process-backed [`InstallAdapter`] driving the GUI through a helper script.
//!
//! The script is invoked as `<script> --status`, `<script> --vppapps <json>`,
//! `<script> --action <json>` or `<script> --relaunch` and answers with JSON.

use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
    process::Command,
};

use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use super::{Activity, AdapterStatus, Alert, InstallAdapter};
use crate::error::ToolError;

/// Prompt as the script reports it: `info` holds the text lines.
#[derive(Debug, Default, Deserialize)]
struct RawPrompt {
    #[serde(default)]
    info: Vec<String>,
    #[serde(default)]
    choices: Vec<String>,
    #[serde(default)]
    options: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawStatus {
    #[serde(default)]
    busy: bool,
    #[serde(default)]
    activity: Option<RawPrompt>,
    #[serde(default)]
    alerts: Vec<RawPrompt>,
}

impl From<RawStatus> for AdapterStatus {
    fn from(raw: RawStatus) -> Self {
        let activity = raw
            .activity
            .map(|prompt| {
                // Activity lines are reported detail first.
                let mut lines = prompt.info.into_iter();
                let details = lines.next().unwrap_or_default();
                let message = lines.next().unwrap_or_default();
                Activity {
                    message,
                    details,
                    choices: prompt.choices,
                }
            })
            .unwrap_or_default();
        let alerts = raw
            .alerts
            .into_iter()
            .map(|prompt| {
                let mut lines = prompt.info.into_iter();
                Alert {
                    message: lines.next().unwrap_or_default(),
                    details: lines.next().unwrap_or_default(),
                    choices: prompt.choices,
                    options: prompt.options,
                }
            })
            .collect();
        AdapterStatus {
            busy: raw.busy,
            activity,
            alerts,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScriptAdapter {
    script: PathBuf,
}

impl ScriptAdapter {
    pub fn new(script: impl Into<PathBuf>) -> Self {
        Self {
            script: script.into(),
        }
    }

    pub fn script(&self) -> &Path {
        &self.script
    }

    fn call(&self, flag: &str, data: Option<Value>) -> Result<Value, ToolError> {
        let program = self.script.display().to_string();
        let mut command = Command::new(&self.script);
        command.arg(flag);
        if let Some(data) = &data {
            command.arg(data.to_string());
        }
        debug!(program = %program, flag, data = ?data, "calling adapter");

        let output = command.output().map_err(|source| ToolError::Spawn {
            program: program.clone(),
            source,
        })?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        if !output.status.success() {
            return Err(ToolError::Exit {
                program,
                status: output.status.to_string(),
                stderr: stderr.trim_end().to_owned(),
            });
        }
        if stdout.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&stdout)
            .map_err(|source| ToolError::InvalidOutput { program, source })
    }
}

/// Decode one `--status` report.
pub(crate) fn parse_status(value: Value) -> Result<AdapterStatus, serde_json::Error> {
    if value.is_null() {
        return Ok(AdapterStatus::default());
    }
    serde_json::from_value::<RawStatus>(value).map(AdapterStatus::from)
}

impl InstallAdapter for ScriptAdapter {
    fn status(&self) -> Result<AdapterStatus, ToolError> {
        let value = self.call("--status", None)?;
        parse_status(value).map_err(|source| ToolError::InvalidOutput {
            program: self.script.display().to_string(),
            source,
        })
    }

    fn install_apps(
        &self,
        udids: &BTreeSet<String>,
        apps: &BTreeSet<String>,
    ) -> Result<(), ToolError> {
        self.call("--vppapps", Some(json!({"udids": udids, "apps": apps})))?;
        Ok(())
    }

    fn action(&self, choice: &str, options: &[String]) -> Result<(), ToolError> {
        self.call(
            "--action",
            Some(json!({"choice": choice, "options": options})),
        )?;
        Ok(())
    }

    fn relaunch(&self) -> Result<(), ToolError> {
        self.call("--relaunch", None)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_report_is_decoded() {
        let raw = json!({
            "busy": true,
            "activity": {
                "info": ["Step 2 of 5: Downloading", "Adding apps on 3 devices"],
                "choices": ["Cancel"],
                "options": []
            },
            "alerts": [{
                "info": ["The app “Keynote” already exists on “Cart 3”.", ""],
                "choices": ["Replace", "Skip App", "Stop"],
                "options": ["Apply to all apps"]
            }]
        });

        let status = parse_status(raw).unwrap();
        assert!(status.busy);
        assert_eq!(status.activity.message, "Adding apps on 3 devices");
        assert_eq!(status.activity.details, "Step 2 of 5: Downloading");
        assert_eq!(status.alerts.len(), 1);
        assert!(status.alerts[0].message.contains("already exists on"));
        assert_eq!(status.alerts[0].options, vec!["Apply to all apps"]);
    }

    #[test]
    fn empty_status_is_idle() {
        let status = parse_status(Value::Null).unwrap();
        assert!(!status.busy);
        assert!(status.alerts.is_empty());
    }
}
