//! Tethering helper backed by `AssetCacheTetheratorUtil`.
//!
//! Newer hosts answer `--json status`; older ones only print a property-list
//! style roster on stderr. The format is probed once at construction.

use std::{
    path::{Path, PathBuf},
    process::{Command, Output},
};

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use super::Tethering;
use crate::error::ToolError;

static ROSTER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\((.*)\)").expect("roster regex should compile"));
static ENTRY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{.+?\}").expect("entry regex should compile"));
static KEY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"^\{?"?(.+?)"?$"#).expect("key regex should compile"));
static VALUE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"^"?(.+?)"?$"#).expect("value regex should compile"));

const TETHERED_CACHING: &str = "/usr/bin/tethered-caching";

/// Output convention of the installed helper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TetherStatusFormat {
    Json,
    Legacy,
}

/// One device in the tethering roster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TetheredDevice {
    pub serial_number: String,
    pub name: Option<String>,
    pub checked_in: bool,
}

impl TetheredDevice {
    fn from_entry(entry: &Map<String, Value>) -> Option<Self> {
        let serial_number = entry.get("Serial Number")?.as_str()?.to_owned();
        let name = entry
            .get("Name")
            .or_else(|| entry.get("Device Name"))
            .and_then(Value::as_str)
            .map(str::to_owned);
        let checked_in = entry
            .get("Checked In")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        Some(Self {
            serial_number,
            name,
            checked_in,
        })
    }
}

#[derive(Debug, Clone)]
pub struct Tetherator {
    program: PathBuf,
    format: TetherStatusFormat,
}

impl Tetherator {
    /// Probe `program` for JSON support and remember the answer.
    pub fn detect(program: impl Into<PathBuf>) -> Self {
        let program = program.into();
        let format = match Command::new(&program).args(["--json", "status"]).output() {
            Ok(output) if output.status.success() => TetherStatusFormat::Json,
            _ => TetherStatusFormat::Legacy,
        };
        debug!(program = %program.display(), format = ?format, "tethering helper detected");
        Self { program, format }
    }

    pub fn with_format(program: impl Into<PathBuf>, format: TetherStatusFormat) -> Self {
        Self {
            program: program.into(),
            format,
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn format(&self) -> TetherStatusFormat {
        self.format
    }

    fn run(&self, arg: &str) -> Result<Output, ToolError> {
        let mut command = Command::new(&self.program);
        if self.format == TetherStatusFormat::Json {
            command.arg("--json");
        }
        command.arg(arg);
        debug!(program = %self.program.display(), arg, "calling tethering helper");
        command.output().map_err(|source| ToolError::Spawn {
            program: self.program.display().to_string(),
            source,
        })
    }

    /// Every device the helper knows about.
    pub fn roster(&self) -> Result<Vec<TetheredDevice>, ToolError> {
        let output = self.run("status")?;
        match self.format {
            TetherStatusFormat::Json => {
                let value: Value = serde_json::from_slice(&output.stdout).map_err(|source| {
                    ToolError::InvalidOutput {
                        program: self.program.display().to_string(),
                        source,
                    }
                })?;
                Ok(value
                    .pointer("/result/Device Roster")
                    .and_then(Value::as_array)
                    .map(|entries| {
                        entries
                            .iter()
                            .filter_map(Value::as_object)
                            .filter_map(TetheredDevice::from_entry)
                            .collect()
                    })
                    .unwrap_or_default())
            }
            TetherStatusFormat::Legacy => {
                // The legacy helper prints its roster on stderr.
                let text = String::from_utf8_lossy(&output.stderr);
                let entries = parse_legacy_status(&text)?;
                Ok(entries.iter().filter_map(TetheredDevice::from_entry).collect())
            }
        }
    }
}

/// Parse the legacy `( {"k" = v; ...}, ... )` roster. `Yes`/`No` become
/// booleans and all-digit values integers.
pub fn parse_legacy_status(status: &str) -> Result<Vec<Map<String, Value>>, ToolError> {
    let stripped = status.replace('\n', "").replace("    ", "");
    let Some(devices) = ROSTER.captures(&stripped).and_then(|c| c.get(1)) else {
        return Ok(Vec::new());
    };

    let mut roster = Vec::new();
    for entry in ENTRY.find_iter(devices.as_str()) {
        let mut device = Map::new();
        let pairs: Vec<&str> = entry.as_str().split(';').collect();
        for pair in &pairs[..pairs.len().saturating_sub(1)] {
            let (raw_key, raw_value) = pair.split_once(" = ").ok_or_else(|| {
                ToolError::Adapter(format!("unable to parse tethering entry: {pair:?}"))
            })?;
            let key = KEY
                .captures(raw_key.trim())
                .and_then(|c| c.get(1))
                .map(|m| m.as_str().to_owned())
                .ok_or_else(|| ToolError::Adapter(format!("unexpected key: {raw_key:?}")))?;
            let value = VALUE
                .captures(raw_value.trim())
                .and_then(|c| c.get(1))
                .map(|m| m.as_str())
                .ok_or_else(|| {
                    ToolError::Adapter(format!("unexpected value: {raw_value:?}"))
                })?;
            device.insert(key, legacy_value(value));
        }
        roster.push(device);
    }
    Ok(roster)
}

fn legacy_value(raw: &str) -> Value {
    if raw.chars().all(|c| c.is_ascii_digit())
        && let Ok(n) = raw.parse::<i64>()
    {
        return Value::from(n);
    }
    match raw {
        "Yes" => Value::Bool(true),
        "No" => Value::Bool(false),
        other => Value::String(other.to_owned()),
    }
}

impl Tethering for Tetherator {
    fn enabled(&self) -> Result<bool, ToolError> {
        Ok(self.run("isEnabled")?.status.success())
    }

    fn devices_are_tethered(&self, serials: &[String]) -> Result<bool, ToolError> {
        if !self.enabled()? {
            return Err(ToolError::Adapter("tethering is not enabled".to_owned()));
        }
        let roster = self.roster()?;
        let mut tethered = true;
        for serial in serials {
            match roster.iter().find(|d| &d.serial_number == serial) {
                Some(device) => tethered &= device.checked_in,
                None => {
                    warn!(serial = %serial, "device missing from tethering roster");
                    tethered = false;
                }
            }
        }
        Ok(tethered)
    }

    fn restart(&self) -> Result<(), ToolError> {
        info!("restarting tethered caching");
        let output = Command::new("/usr/bin/sudo")
            .args(["-n", TETHERED_CACHING, "-b"])
            .output()
            .map_err(|source| ToolError::Spawn {
                program: TETHERED_CACHING.to_owned(),
                source,
            })?;
        if !output.status.success() {
            return Err(ToolError::Exit {
                program: TETHERED_CACHING.to_owned(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim_end().to_owned(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LEGACY: &str = r#"(
    {
    "Checked In" = Yes;
    "Device Location ID" = 337920512;
    "Device Name" = "Cart 3";
    "Serial Number" = DMPX1234;
    Tethered = Yes;
    },
    {
    "Checked In" = No;
    "Device Name" = iPad;
    "Serial Number" = DMPX5678;
    Tethered = No;
    }
)"#;

    #[test]
    fn legacy_roster_is_parsed() {
        let roster = parse_legacy_status(LEGACY).unwrap();
        assert_eq!(roster.len(), 2);
        assert_eq!(roster[0]["Checked In"], Value::Bool(true));
        assert_eq!(roster[0]["Device Location ID"], Value::from(337920512));
        assert_eq!(roster[0]["Device Name"], Value::String("Cart 3".into()));

        let devices: Vec<TetheredDevice> =
            roster.iter().filter_map(TetheredDevice::from_entry).collect();
        assert_eq!(devices[1].serial_number, "DMPX5678");
        assert!(!devices[1].checked_in);
    }

    #[test]
    fn empty_legacy_output_has_no_devices() {
        assert!(parse_legacy_status("").unwrap().is_empty());
    }
}
