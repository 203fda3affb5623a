//! Fleet configuration.
//!
//! Loaded from `$DEVFLEET_CONFIG_PATH`, `$DEVFLEET_CONFIG_JSON` or
//! `<root>/devfleet.toml`, falling back to defaults. Durations are written as
//! human strings (`"5m"`, `"30s"`) or plain seconds.

use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{
    error::{FleetError, Result},
    recovery::RecoveryRule,
};

pub const CONFIG_PATH_ENV: &str = "DEVFLEET_CONFIG_PATH";
pub const CONFIG_JSON_ENV: &str = "DEVFLEET_CONFIG_JSON";
pub const ROOT_ENV: &str = "DEVFLEET_ROOT";
pub const DEFAULT_FILE_NAME: &str = "devfleet.toml";

/// Source that produced the fleet configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConfigSource {
    #[default]
    Default,
    EnvPath(PathBuf),
    EnvInline,
    File(PathBuf),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FleetConfig {
    /// Orchestrator identity. Names the task, manager, error and app
    /// documents and the fleet lock.
    pub id: String,
    /// Resource root holding every document, lock file, image and profile.
    pub root: PathBuf,
    pub timing: Timing,
    pub tools: ToolPaths,
    pub recovery: RecoveryConfig,
    pub balance: BalanceConfig,
    pub reporting: ReportingConfig,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            id: "edu.example.fleet".to_owned(),
            root: default_root(),
            timing: Timing::default(),
            tools: ToolPaths::default(),
            recovery: RecoveryConfig::default(),
            balance: BalanceConfig::default(),
            reporting: ReportingConfig::default(),
        }
    }
}

fn default_root() -> PathBuf {
    if let Ok(root) = env::var(ROOT_ENV)
        && !root.trim().is_empty()
    {
        return PathBuf::from(root);
    }
    env::var_os("HOME")
        .map(|home| PathBuf::from(home).join("Library").join("devfleet"))
        .unwrap_or_else(|| PathBuf::from(".devfleet"))
}

/// Every wait, window and backoff the orchestrator uses.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Timing {
    /// Bound on short-held document locks.
    #[serde(with = "duration_str")]
    pub lock_timeout: Duration,
    #[serde(with = "duration_str")]
    pub lock_poll: Duration,
    /// A `restarting` flag older than this reads as `false`.
    #[serde(with = "duration_str")]
    pub restart_window: Duration,
    /// A checkout this close to the next checkin is treated as spurious.
    #[serde(with = "duration_str")]
    pub checkout_grace: Duration,
    /// How long a device listing is reused before the tool is asked again.
    #[serde(with = "duration_str")]
    pub list_ttl: Duration,
    /// Longest a checkin waits for a fleet-wide restart to clear.
    #[serde(with = "duration_str")]
    pub restart_wait: Duration,
    #[serde(with = "duration_str")]
    pub restart_poll: Duration,
    /// Pause at the start of a run so near-simultaneous attaches batch up.
    #[serde(with = "duration_str")]
    pub settle_delay: Duration,
    /// Minimum spacing between refresh verifications.
    #[serde(with = "duration_str")]
    pub verify_interval: Duration,
    #[serde(with = "duration_str")]
    pub tether_wait: Duration,
    #[serde(with = "duration_str")]
    pub tether_poll: Duration,
    #[serde(with = "duration_str")]
    pub install_poll: Duration,
    /// Unchanged install activity for this long counts as a stall.
    #[serde(with = "duration_str")]
    pub install_stall: Duration,
    /// Daemon verification interval.
    #[serde(with = "duration_str")]
    pub idle: Duration,
    /// Install retries are suppressed for this long once `error_threshold`
    /// recent failures are recorded.
    #[serde(with = "duration_str")]
    pub error_cooldown: Duration,
    pub error_threshold: usize,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(5),
            lock_poll: Duration::from_millis(50),
            restart_window: Duration::from_secs(5 * 60),
            checkout_grace: Duration::from_secs(5 * 60),
            list_ttl: Duration::from_secs(30),
            restart_wait: Duration::from_secs(2 * 60),
            restart_poll: Duration::from_secs(2),
            settle_delay: Duration::from_secs(5),
            verify_interval: Duration::from_secs(60),
            tether_wait: Duration::from_secs(10),
            tether_poll: Duration::from_secs(5),
            install_poll: Duration::from_secs(1),
            install_stall: Duration::from_secs(5 * 60),
            idle: Duration::from_secs(5 * 60),
            error_cooldown: Duration::from_secs(60 * 60),
            error_threshold: 3,
        }
    }
}

impl Timing {
    /// Zero waits everywhere; used by tests driving whole runs.
    pub fn immediate() -> Self {
        Self {
            lock_poll: Duration::from_millis(1),
            restart_wait: Duration::ZERO,
            restart_poll: Duration::from_millis(1),
            settle_delay: Duration::ZERO,
            verify_interval: Duration::ZERO,
            tether_wait: Duration::ZERO,
            tether_poll: Duration::from_millis(1),
            install_poll: Duration::from_millis(1),
            ..Self::default()
        }
    }
}

/// External executables.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ToolPaths {
    pub cfgutil: PathBuf,
    /// Signing certificate and key passed to the configuration tool when
    /// supervising.
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    /// GUI-automation install script.
    pub adapter: PathBuf,
    pub tetherator: PathBuf,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            cfgutil: PathBuf::from("/usr/local/bin/cfgutil"),
            cert: None,
            key: None,
            adapter: PathBuf::from("/usr/local/bin/devfleet-adapter"),
            tetherator: PathBuf::from("/usr/bin/AssetCacheTetheratorUtil"),
        }
    }
}

/// Known-alert rule table consulted during app installs.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub rules: Vec<RecoveryRule>,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            rules: RecoveryRule::builtin(),
        }
    }
}

/// Load balancing: power off verified devices beyond `ceiling`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BalanceConfig {
    /// `None` disables load balancing.
    pub ceiling: Option<usize>,
    /// How long the fleet must stay verified before devices are shut down.
    #[serde(with = "duration_str")]
    pub cooldown: Duration,
}

impl Default for BalanceConfig {
    fn default() -> Self {
        Self {
            ceiling: None,
            cooldown: Duration::from_secs(10 * 60),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ReportingConfig {
    /// Incoming-webhook URL. Unset disables notifications.
    pub webhook: Option<String>,
    pub channel: Option<String>,
    pub name: Option<String>,
}

impl FleetConfig {
    pub fn devices_dir(&self) -> PathBuf {
        self.root.join("Devices")
    }

    pub fn images_dir(&self) -> PathBuf {
        self.root.join("Images")
    }

    pub fn profiles_dir(&self) -> PathBuf {
        self.root.join("Profiles")
    }

    /// Load configuration overrides using environment variables.
    /// Evaluation order:
    /// 1) `$DEVFLEET_CONFIG_PATH` (TOML or JSON file),
    /// 2) `$DEVFLEET_CONFIG_JSON` (inline JSON),
    /// 3) `<root>/devfleet.toml` if present,
    /// 4) defaults.
    pub fn load_from_env() -> Result<(Self, ConfigSource)> {
        if let Ok(path_str) = env::var(CONFIG_PATH_ENV)
            && !path_str.trim().is_empty()
        {
            let path = PathBuf::from(path_str);
            let config = Self::load_from_file(&path)?;
            return Ok((config, ConfigSource::EnvPath(path)));
        }

        if let Ok(raw) = env::var(CONFIG_JSON_ENV)
            && !raw.trim().is_empty()
        {
            let parsed = Self::parse_json(&raw).map_err(|err| {
                FleetError::Config(format!(
                    "failed to parse {CONFIG_JSON_ENV}: {err}"
                ))
            })?;
            return Ok((parsed, ConfigSource::EnvInline));
        }

        let candidate = default_root().join(DEFAULT_FILE_NAME);
        if candidate.exists() {
            let config = Self::load_from_file(&candidate)?;
            return Ok((config, ConfigSource::File(candidate)));
        }

        Ok((Self::default(), ConfigSource::Default))
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path).map_err(|err| {
            FleetError::Config(format!(
                "failed to read config from {}: {err}",
                path.display()
            ))
        })?;

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::parse_json(&contents),
            Some("toml") => toml::from_str(&contents).map_err(|err| {
                FleetError::Config(format!(
                    "invalid config {}: {err}",
                    path.display()
                ))
            }),
            _ => Self::parse_from_str(&contents, &path.display().to_string()),
        }
    }

    pub fn parse_from_str(contents: &str, origin: &str) -> Result<Self> {
        // Try TOML first, then JSON.
        toml::from_str(contents).or_else(|toml_err| {
            serde_json::from_str(contents).map_err(|json_err| {
                FleetError::Config(format!(
                    "failed to parse config {origin}: toml error: {toml_err}; json error: {json_err}"
                ))
            })
        })
    }

    pub fn parse_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|err| {
            FleetError::Config(format!("invalid config json: {err}"))
        })
    }
}

/// Serde adapter for [`Duration`] as a humantime string, also accepting a
/// bare number of seconds.
pub(crate) mod duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer, de};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Secs(u64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(
        value: &Duration,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer
            .serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Duration, D::Error> {
        match Raw::deserialize(deserializer)? {
            Raw::Secs(secs) => Ok(Duration::from_secs(secs)),
            Raw::Text(text) => {
                humantime::parse_duration(&text).map_err(de::Error::custom)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toml_overrides_merge_with_defaults() {
        let raw = r#"
            id = "org.school.carts"
            root = "/tmp/fleet"

            [timing]
            checkout_grace = "2m"
            install_stall = 90

            [balance]
            ceiling = 12
        "#;
        let config = FleetConfig::parse_from_str(raw, "inline").unwrap();

        assert_eq!(config.id, "org.school.carts");
        assert_eq!(config.timing.checkout_grace, Duration::from_secs(120));
        assert_eq!(config.timing.install_stall, Duration::from_secs(90));
        assert_eq!(config.timing.lock_timeout, Duration::from_secs(5));
        assert_eq!(config.balance.ceiling, Some(12));
        assert_eq!(config.devices_dir(), PathBuf::from("/tmp/fleet/Devices"));
        assert!(!config.recovery.rules.is_empty());
    }

    #[test]
    fn json_config_is_accepted() {
        let config = FleetConfig::parse_json(
            r##"{"timing": {"idle": "30s"}, "reporting": {"channel": "#carts"}}"##,
        )
        .unwrap();
        assert_eq!(config.timing.idle, Duration::from_secs(30));
        assert_eq!(config.reporting.channel.as_deref(), Some("#carts"));
    }

    #[test]
    fn invalid_duration_is_a_config_error() {
        let err = FleetConfig::parse_json(r#"{"timing": {"idle": "soon"}}"#)
            .unwrap_err();
        assert!(matches!(err, FleetError::Config(_)));
    }
}
