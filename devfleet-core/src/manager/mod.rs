//! Fleet orchestration.
//!
//! [`DeviceManager`] owns the task queue, the app catalog, the error ledger
//! and a small manager document (`<id>.manager`), and drives the external
//! collaborators through one provisioning run at a time. Whole runs are
//! serialized by the fleet lock; everything else goes through the
//! short-held document locks.

mod run;
mod state;
mod verify;

use std::{
    collections::BTreeMap,
    fs, io,
    path::PathBuf,
    sync::Arc,
    time::Instant,
};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::{
    apps::AppCatalog,
    config::FleetConfig,
    device::{Device, DeviceInfo, Wallpaper},
    error::{FleetError, Result, StoreError},
    ledger::ErrorLedger,
    store::{DocumentStore, FileLock, LockGuard},
    tasks::{Ids, Task, TaskList, ids},
    tools::{
        CfgutilTool, ConfigTool, InstallAdapter, Notifier, ScriptAdapter, Tetherator,
        Tethering, WebhookNotifier,
    },
};

pub use state::{Flow, RunOutcome, RunState};

/// Stop reason while erased devices reboot.
pub const RESTART: &str = "restart";

const STOPPED: &str = "stopped";
const REASON: &str = "reason";
const LAST_LISTED: &str = "lastListed";
const IDLE: &str = "idle";
const VERIFIED: &str = "verified";
const VERIFIED_SINCE: &str = "verifiedSince";
const FINISHED: &str = "finished";
const STATE: &str = "state";

/// The external collaborators a manager drives.
#[derive(Clone)]
pub struct Collaborators {
    pub tool: Arc<dyn ConfigTool>,
    pub adapter: Arc<dyn InstallAdapter>,
    pub tethering: Arc<dyn Tethering>,
    pub notifier: Arc<dyn Notifier>,
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}

impl Collaborators {
    /// Process-backed collaborators for `config`. Probes the tethering
    /// helper once to pick its status format.
    pub fn from_config(config: &FleetConfig) -> Self {
        let mut tool = CfgutilTool::new(&config.tools.cfgutil);
        if let (Some(cert), Some(key)) = (&config.tools.cert, &config.tools.key) {
            tool = tool.with_identity(cert.clone(), key.clone());
        }
        Self {
            tool: Arc::new(tool),
            adapter: Arc::new(ScriptAdapter::new(&config.tools.adapter)),
            tethering: Arc::new(Tetherator::detect(&config.tools.tetherator)),
            notifier: WebhookNotifier::from_config(&config.reporting),
        }
    }
}

#[derive(Debug)]
struct Listing {
    at: Instant,
    devices: Vec<DeviceInfo>,
}

/// Point-in-time view of the fleet for operators.
#[derive(Debug, Clone, Serialize)]
pub struct FleetStatus {
    pub id: String,
    pub state: RunState,
    pub stopped: bool,
    pub reason: Option<String>,
    pub verified: bool,
    pub verified_since: Option<DateTime<Utc>>,
    pub finished: Option<DateTime<Utc>>,
    pub last_listed: Option<DateTime<Utc>>,
    pub pending: BTreeMap<String, Ids>,
    pub devices: Vec<String>,
    pub recent_failures: usize,
}

pub struct DeviceManager {
    config: FleetConfig,
    tool: Arc<dyn ConfigTool>,
    adapter: Arc<dyn InstallAdapter>,
    tethering: Arc<dyn Tethering>,
    notifier: Arc<dyn Notifier>,
    tasks: TaskList,
    apps: AppCatalog,
    errors: ErrorLedger,
    doc: DocumentStore,
    fleet_lock: FileLock,
    restart_lock: FileLock,
    listing: Mutex<Option<Listing>>,
    state: Mutex<RunState>,
}

impl std::fmt::Debug for DeviceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceManager")
            .field("id", &self.config.id)
            .field("root", &self.config.root)
            .field("state", &*self.state.lock())
            .finish_non_exhaustive()
    }
}

impl DeviceManager {
    pub fn new(config: FleetConfig, collaborators: Collaborators) -> Result<Self> {
        let root = config.root.clone();
        let timing = &config.timing;
        let tasks = TaskList::open(&root, &config.id, timing)?;
        let apps = AppCatalog::open(&root, &config.id, timing)?;
        let errors = ErrorLedger::open(&root, &config.id, timing);
        let doc = DocumentStore::new(
            &root,
            &format!("{}.manager", config.id),
            Some(timing.lock_timeout),
            timing.lock_poll,
        );
        doc.set_default(STOPPED, Value::Bool(false))?;
        doc.set(IDLE, timing.idle.as_secs())?;

        // Whole runs may wait a long time for their turn.
        let fleet_lock = FileLock::new(
            root.join(format!(".{}.run.lock", config.id)),
            None,
            timing.lock_poll,
        );
        let restart_lock = FileLock::new(
            root.join(format!(".{}.{RESTART}.lock", config.id)),
            None,
            timing.lock_poll,
        );

        debug!(id = %config.id, root = %root.display(), "device manager ready");
        Ok(Self {
            tool: collaborators.tool,
            adapter: collaborators.adapter,
            tethering: collaborators.tethering,
            notifier: collaborators.notifier,
            config,
            tasks,
            apps,
            errors,
            doc,
            fleet_lock,
            restart_lock,
            listing: Mutex::new(None),
            state: Mutex::new(RunState::Idle),
        })
    }

    pub fn config(&self) -> &FleetConfig {
        &self.config
    }

    pub fn tasks(&self) -> &TaskList {
        &self.tasks
    }

    pub fn apps(&self) -> &AppCatalog {
        &self.apps
    }

    pub fn errors(&self) -> &ErrorLedger {
        &self.errors
    }

    /// Open the record for `ecid`. A newly created record is tasked for its
    /// serial number and an erase.
    pub fn device(&self, ecid: &str, info: Option<&DeviceInfo>) -> Result<Device> {
        let device = Device::open(
            &self.config.devices_dir(),
            ecid,
            info,
            &self.config.timing,
        )?;
        if device.was_created() {
            info!(ecid = %ecid, "new device");
            let single = ids([ecid]);
            device.set_restarting(false)?;
            self.tasks.query("serialNumber", &single)?;
            self.tasks.add(Task::Erase, &single, &Ids::new())?;
        }
        Ok(device)
    }

    /// ECIDs of every device with a record.
    pub fn known_devices(&self) -> Result<Vec<String>> {
        let entries = match fs::read_dir(self.config.devices_dir()) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(StoreError::from(err).into()),
        };
        let mut known = Vec::new();
        for entry in entries {
            let path: PathBuf = entry.map_err(StoreError::from)?.path();
            let is_record = path.extension().is_some_and(|ext| ext == "json");
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str())
                && is_record
                && !stem.starts_with('.')
            {
                known.push(stem.to_owned());
            }
        }
        known.sort();
        Ok(known)
    }

    /// Attached devices, reusing a listing younger than `list_ttl` unless
    /// `refresh` is set.
    pub fn list(&self, refresh: bool) -> Result<Vec<DeviceInfo>> {
        let mut listing = self.listing.lock();
        if !refresh
            && let Some(cached) = listing.as_ref()
            && cached.at.elapsed() < self.config.timing.list_ttl
        {
            return Ok(cached.devices.clone());
        }
        debug!("refreshing device list");
        let devices = self.tool.list()?;
        self.doc.set(LAST_LISTED, Utc::now())?;
        *listing = Some(Listing {
            at: Instant::now(),
            devices: devices.clone(),
        });
        Ok(devices)
    }

    /// Drop the cached listing; the next [`list`](Self::list) asks the tool.
    pub fn invalidate_listing(&self) {
        self.listing.lock().take();
    }

    /// ECIDs of attached devices.
    pub fn available(&self) -> Result<Ids> {
        Ok(self.list(false)?.into_iter().map(|info| info.ecid).collect())
    }

    /// Records of attached devices. Devices that cannot be recorded yet are
    /// skipped.
    pub fn available_devices(&self) -> Result<Vec<Device>> {
        let mut devices = Vec::new();
        for info in self.list(false)? {
            match self.device(&info.ecid, Some(&info)) {
                Ok(device) => devices.push(device),
                Err(FleetError::MissingSeed { ecid }) => {
                    warn!(ecid = %ecid, "attached device has no record and no UDID");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(devices)
    }

    /// Stop reason, if the fleet is stopped.
    pub fn stopped(&self) -> Result<Option<String>> {
        let doc = self.doc.read_or_default()?;
        if !doc.get(STOPPED).and_then(Value::as_bool).unwrap_or(false) {
            return Ok(None);
        }
        Ok(Some(
            doc.get(REASON)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned(),
        ))
    }

    /// Keep every manager instance from starting new work until
    /// [`resume`](Self::resume).
    pub fn halt(&self, reason: &str) -> Result<()> {
        self.stop(reason)?;
        self.enter(RunState::Stopped)?;
        Ok(())
    }

    pub fn resume(&self) -> Result<()> {
        self.doc.modify(|doc| {
            doc.insert(STOPPED.to_owned(), Value::Bool(false));
            doc.remove(REASON);
            doc.insert(STATE.to_owned(), Value::String(RunState::Idle.as_str().to_owned()));
        })?;
        *self.state.lock() = RunState::Idle;
        info!("fleet resumed");
        Ok(())
    }

    pub(crate) fn stop(&self, reason: &str) -> Result<()> {
        self.doc.modify(|doc| {
            doc.insert(STOPPED.to_owned(), Value::Bool(true));
            doc.insert(REASON.to_owned(), Value::String(reason.to_owned()));
        })?;
        warn!(reason = %reason, "fleet stopped");
        Ok(())
    }

    /// Whether the last verification passed and nothing has changed since.
    pub fn verified(&self) -> Result<bool> {
        Ok(self.doc.get_as(VERIFIED)?.unwrap_or(false))
    }

    pub fn set_verified(&self, value: bool) -> Result<()> {
        let now = serde_json::to_value(Utc::now()).map_err(StoreError::from)?;
        self.doc.modify(|doc| {
            let was = doc.get(VERIFIED).and_then(Value::as_bool).unwrap_or(false);
            doc.insert(VERIFIED.to_owned(), Value::Bool(value));
            if !value {
                doc.remove(VERIFIED_SINCE);
            } else if !was || !doc.contains_key(VERIFIED_SINCE) {
                doc.insert(VERIFIED_SINCE.to_owned(), now);
            }
        })?;
        Ok(())
    }

    pub fn verified_since(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self.doc.get_as(VERIFIED_SINCE)?)
    }

    /// When the last finalization completed.
    pub fn finished(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self.doc.get_as(FINISHED)?)
    }

    pub fn state(&self) -> RunState {
        *self.state.lock()
    }

    pub fn status(&self) -> Result<FleetStatus> {
        let doc = self.doc.read_or_default()?;
        let read = |key: &str| -> Option<DateTime<Utc>> {
            doc.get(key)
                .cloned()
                .and_then(|v| serde_json::from_value(v).ok())
        };
        let stopped = self.stopped()?;
        Ok(FleetStatus {
            id: self.config.id.clone(),
            state: doc
                .get(STATE)
                .cloned()
                .and_then(|v| serde_json::from_value(v).ok())
                .unwrap_or_default(),
            stopped: stopped.is_some(),
            reason: stopped.filter(|r| !r.is_empty()),
            verified: doc.get(VERIFIED).and_then(Value::as_bool).unwrap_or(false),
            verified_since: read(VERIFIED_SINCE),
            finished: read(FINISHED),
            last_listed: read(LAST_LISTED),
            pending: self.tasks.pending()?.into_iter().collect(),
            devices: self.known_devices()?,
            recent_failures: self.errors.count()?,
        })
    }

    /// Move the run to `next`. Illegal transitions are logged and ignored.
    /// Returns the state left behind.
    pub(crate) fn enter(&self, next: RunState) -> Result<RunState> {
        let mut state = self.state.lock();
        let current = *state;
        if !current.can_transition_to(next) {
            if current != next {
                warn!(from = %current, to = %next, "ignoring illegal run-state transition");
            }
            return Ok(current);
        }
        *state = next;
        self.doc.set(STATE, next)?;
        debug!(from = %current, to = %next, "run state");
        Ok(current)
    }

    /// Move from `from` to `to` only if the run is still in `from`.
    pub(crate) fn leave(&self, from: RunState, to: RunState) -> Result<()> {
        if self.state() == from {
            self.enter(to)?;
        }
        Ok(())
    }

    /// Take the fleet lock. Taking it afresh means no run of this process
    /// is in progress, so stale in-memory run state is reset.
    pub(crate) fn acquire_fleet(&self) -> Result<LockGuard<'_>> {
        let outermost = !self.fleet_lock.is_held();
        let guard = self.fleet_lock.acquire()?;
        if outermost {
            let mut state = self.state.lock();
            if *state != RunState::Idle {
                debug!(state = %*state, "resetting run state");
                *state = RunState::Idle;
            }
        }
        Ok(guard)
    }

    pub(crate) fn notify(&self, message: &str) {
        self.notifier.send(message);
    }

    /// Image for `wallpaper` under the images directory, if any.
    pub(crate) fn wallpaper_image(&self, wallpaper: Wallpaper) -> Option<PathBuf> {
        let dir = self.config.images_dir();
        ["png", "jpg", "jpeg"]
            .iter()
            .map(|ext| dir.join(format!("{}.{ext}", wallpaper.as_str())))
            .find(|path| path.exists())
    }
}

pub(crate) fn ecids<'a>(devices: impl IntoIterator<Item = &'a Device>) -> Ids {
    devices
        .into_iter()
        .map(|device| device.ecid().to_owned())
        .collect()
}

pub(crate) fn names<'a>(devices: impl IntoIterator<Item = &'a Device>) -> Vec<String> {
    devices
        .into_iter()
        .map(|device| device.name().unwrap_or_else(|_| device.ecid().to_owned()))
        .collect()
}
