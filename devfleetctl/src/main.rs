//! # devfleetctl
//!
//! Process triggers and operator commands for a devfleet host.
//!
//! The configuration tool's attachment watcher invokes `attached` and
//! `detached` with the device's identity in the environment; `refresh` and
//! `daemon` drive verification; `status`, `stop` and `resume` are for
//! operators.

mod daemon;

use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use devfleet_core::{
    config::{CONFIG_PATH_ENV, ConfigSource, FleetConfig},
    device::DeviceInfo,
    manager::{Collaborators, DeviceManager, RunOutcome},
};
use serde_json::Value;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "devfleetctl", about = "Provision and verify a fleet of managed devices")]
struct Cli {
    /// Configuration file (TOML or JSON)
    #[arg(long, global = true, env = CONFIG_PATH_ENV)]
    config: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// A device was attached; record it and run
    Attached(DeviceArgs),
    /// A device was detached
    Detached(DeviceArgs),
    /// Verify attached devices and run if anything is missing
    Refresh,
    /// Watch attachments and refresh every idle interval
    Daemon {
        /// Refresh interval (defaults to the configured idle time)
        #[arg(long)]
        interval: Option<humantime::Duration>,
    },
    /// Print the fleet status as JSON
    Status,
    /// Stop every orchestrator from starting new work
    Stop {
        #[arg(default_value = "operator")]
        reason: String,
    },
    /// Clear a stop
    Resume,
}

/// Device identity as exported by the attachment watcher.
#[derive(ClapArgs, Debug, Clone)]
struct DeviceArgs {
    #[arg(long, env = "ECID")]
    ecid: String,
    #[arg(long, env = "UDID")]
    udid: Option<String>,
    #[arg(long = "device-type", env = "deviceType")]
    device_type: Option<String>,
    #[arg(long = "device-name", env = "deviceName")]
    device_name: Option<String>,
    #[arg(long = "location-id", env = "locationID")]
    location_id: Option<String>,
}

impl DeviceArgs {
    fn info(&self) -> DeviceInfo {
        DeviceInfo {
            ecid: self.ecid.clone(),
            udid: self.udid.clone(),
            model: self.device_type.clone(),
            name: self.device_name.clone(),
            serial_number: None,
            location_id: self.location_id.as_deref().map(|raw| {
                serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_owned()))
            }),
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_level.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let (config, source) = load_config(cli.config.as_deref())?;
    debug!(source = ?source, root = %config.root.display(), "loaded configuration");

    let collaborators = Collaborators::from_config(&config);
    let manager = DeviceManager::new(config, collaborators)
        .context("failed to open device manager")?;

    match cli.command {
        Command::Attached(device) => {
            let info = device.info();
            info!(ecid = %info.ecid, "device attached");
            let outcome = manager
                .checkin(&info, true)
                .with_context(|| format!("checkin failed for {}", info.ecid))?;
            report(outcome);
        }
        Command::Detached(device) => {
            let info = device.info();
            info!(ecid = %info.ecid, "device detached");
            manager
                .checkout(&info)
                .with_context(|| format!("checkout failed for {}", info.ecid))?;
        }
        Command::Refresh => {
            let outcome = manager.verify(true).context("refresh failed")?;
            report(outcome);
        }
        Command::Daemon { interval } => {
            let interval: Duration = interval
                .map(Into::into)
                .unwrap_or(manager.config().timing.idle)
                .max(Duration::from_secs(1));
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("failed to start async runtime")?;
            let manager = Arc::new(manager);
            let result = runtime.block_on(daemon::run(manager.clone(), interval));
            // An interrupted refresh is abandoned rather than awaited.
            runtime.shutdown_background();
            result?;
        }
        Command::Status => {
            let status = manager.status().context("failed to read fleet status")?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Command::Stop { reason } => {
            manager.halt(&reason).context("failed to stop fleet")?;
            info!(reason = %reason, "fleet stopped");
        }
        Command::Resume => {
            manager.resume().context("failed to resume fleet")?;
        }
    }
    Ok(())
}

fn load_config(path: Option<&std::path::Path>) -> Result<(FleetConfig, ConfigSource)> {
    match path {
        Some(path) => {
            let config = FleetConfig::load_from_file(path)
                .with_context(|| format!("failed to load {}", path.display()))?;
            Ok((config, ConfigSource::EnvPath(path.to_path_buf())))
        }
        None => FleetConfig::load_from_env().context("failed to load configuration"),
    }
}

fn report(outcome: RunOutcome) {
    match outcome {
        RunOutcome::Completed => debug!("run completed"),
        RunOutcome::Aborted(reason) => warn!(reason = %reason, "run aborted"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watcher_environment_maps_to_device_info() {
        let cli = Cli::try_parse_from([
            "devfleetctl",
            "attached",
            "--ecid",
            "0x1A2B",
            "--udid",
            "00008020-000",
            "--device-type",
            "iPad7,5",
            "--location-id",
            "336592896",
        ])
        .unwrap();
        let Command::Attached(device) = cli.command else {
            panic!("expected attached");
        };
        let info = device.info();
        assert_eq!(info.ecid, "0x1A2B");
        assert_eq!(info.model.as_deref(), Some("iPad7,5"));
        assert_eq!(info.location_id, Some(serde_json::json!(336592896)));
    }

    #[test]
    fn stop_defaults_to_operator_reason() {
        let cli = Cli::try_parse_from(["devfleetctl", "stop"]).unwrap();
        assert!(matches!(cli.command, Command::Stop { ref reason } if reason == "operator"));
    }

    #[test]
    fn daemon_interval_accepts_human_durations() {
        let cli = Cli::try_parse_from(["devfleetctl", "daemon", "--interval", "90s"]).unwrap();
        let Command::Daemon { interval: Some(interval) } = cli.command else {
            panic!("expected daemon with interval");
        };
        assert_eq!(Duration::from(interval), Duration::from_secs(90));
    }
}
