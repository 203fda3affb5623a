use std::{
    collections::BTreeMap,
    thread,
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use super::{DeviceManager, Flow, RESTART, RunOutcome, RunState, ecids, names};
use crate::{
    apps::InstallTarget,
    device::{Device, DeviceInfo, Wallpaper},
    error::{FleetError, InstallError, Result, ToolError},
    installer::Installer,
    ledger::FailureKind,
    tasks::{Ids, Task, ids},
    tools::{CallOutcome, FailureReason},
};

const ACTIVATION_LOCKED: &str = "complete the activation process";
const ALREADY_SUPERVISED: &str = "already supervised";
const MUST_ERASE: &str = "must be erased";
const NETWORK_ERROR: &str = "Network communication error.";

/// Why a prepare call failed outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SuperviseFailure {
    AlreadySupervised,
    MustErase,
    Network,
    Other,
}

impl SuperviseFailure {
    fn classify(reason: &FailureReason) -> Self {
        if reason.mentions(ALREADY_SUPERVISED) {
            SuperviseFailure::AlreadySupervised
        } else if reason.mentions(MUST_ERASE) {
            SuperviseFailure::MustErase
        } else if reason.detail.as_deref() == Some(NETWORK_ERROR)
            || reason.mentions(NETWORK_ERROR)
        {
            SuperviseFailure::Network
        } else {
            SuperviseFailure::Other
        }
    }
}

impl DeviceManager {
    /// Record a device attaching and, unless `run` is false, start a run.
    pub fn checkin(&self, info: &DeviceInfo, run: bool) -> Result<RunOutcome> {
        let device = self.device(&info.ecid, Some(info))?;
        self.invalidate_listing();
        self.wait_for_restart(&device)?;

        let name = device.name()?;
        let now = Utc::now();
        if self.need_to_erase(&device, now)? {
            info!(device = %name, "will be erased");
            let single = ids([device.ecid()]);
            device.set_erased(None)?;
            self.tasks.add(Task::Erase, &single, &Ids::new())?;
            self.tasks.query("installedApps", &single)?;
            self.set_verified(false)?;
        } else {
            debug!(device = %name, "will not be erased");
        }
        device.set_checkin(Some(now))?;

        if run {
            self.run()
        } else {
            Ok(RunOutcome::Completed)
        }
    }

    /// Record a device detaching. A detach caused by a restart the manager
    /// started is not a checkout.
    pub fn checkout(&self, info: &DeviceInfo) -> Result<()> {
        let device = self.device(&info.ecid, Some(info))?;
        self.invalidate_listing();
        let name = device.name()?;
        if device.restarting()? {
            info!(device = %name, "restarting");
            device.set_restarting(false)?;
        } else {
            info!(device = %name, "checked out");
            device.set_checkout(Some(Utc::now()))?;
            device.set_verified(false)?;
            self.set_verified(false)?;
        }
        Ok(())
    }

    /// Whether `device` must be erased before it is handed out again.
    ///
    /// A checkout younger than `checkout_grace` is treated as a spurious
    /// disconnect: it is rewritten to just before the last checkin.
    pub fn need_to_erase(&self, device: &Device, now: DateTime<Utc>) -> Result<bool> {
        let Some(checkin) = device.checkin()? else {
            debug!(ecid = %device.ecid(), "never checked in");
            return Ok(true);
        };
        let Some(checkout) = device.checkout()? else {
            debug!(ecid = %device.ecid(), "never checked out");
            return Ok(false);
        };
        if device.restarting_at(now)? {
            return Ok(false);
        }

        let grace = chrono::Duration::from_std(self.config.timing.checkout_grace)
            .unwrap_or(chrono::Duration::MAX);
        if now.signed_duration_since(checkout) <= grace {
            info!(ecid = %device.ecid(), "checkout within grace window; ignoring");
            device.set_checkout(Some(checkin - chrono::Duration::minutes(1)))?;
            return Ok(false);
        }
        Ok(checkout > checkin)
    }

    /// Block while the fleet is stopped for a restart, until every restarting
    /// device is back or `restart_wait` runs out.
    pub(crate) fn wait_for_restart(&self, device: &Device) -> Result<()> {
        let Some(reason) = self.stopped()? else {
            return Ok(());
        };
        if reason.is_empty() {
            debug!("stopped without a reason; resuming");
            return self.resume();
        }
        if reason != RESTART {
            debug!(reason = %reason, "fleet stopped; not waiting");
            return Ok(());
        }

        self.tasks.take_only(Task::Restart, &ids([device.ecid()]))?;

        let _waiting = self.restart_lock.acquire()?;
        let deadline = Instant::now() + self.config.timing.restart_wait;
        let mut waiting = self.tasks.peek(Task::Restart)?;
        while !waiting.is_empty() {
            if Instant::now() >= deadline {
                let abandoned = self.tasks.take(Task::Restart)?;
                warn!(devices = ?abandoned, "gave up waiting for restart");
                break;
            }
            debug!(devices = ?waiting, "waiting for restart");
            thread::sleep(self.config.timing.restart_poll);
            waiting = self.tasks.peek(Task::Restart)?;
        }
        if self.stopped()?.as_deref() == Some(RESTART) {
            self.resume()?;
        }
        Ok(())
    }

    /// One provisioning run over every attached device.
    pub fn run(&self) -> Result<RunOutcome> {
        info!("running automation");
        let _fleet = self.acquire_fleet()?;
        if let Some(reason) = self.stopped()? {
            debug!(reason = %reason, "run stopped");
            return Ok(RunOutcome::Aborted(reason));
        }

        if self.tasks.all_done()? && self.verified()? {
            info!("all tasks have been completed");
            return self.finalize_run();
        }
        self.set_verified(false)?;
        for (task, ids) in self.tasks.pending()? {
            info!(task = %task, devices = ?ids, "agenda");
        }

        // Give devices attached at nearly the same time a chance to catch up.
        thread::sleep(self.config.timing.settle_delay);

        self.enter(RunState::Querying)?;
        let queried = self.run_queries().map(|()| Flow::Continue);
        if let Some(reason) = self.settle("queries", queried)? {
            return self.abort(reason);
        }

        let devices = self.available_devices()?;
        debug!(devices = ?names(&devices), "available");

        self.enter(RunState::Erasing)?;
        if let Some(reason) = self.settle("erase", self.erase(&devices))? {
            return self.abort(reason);
        }

        self.enter(RunState::Supervising)?;
        if let Some(reason) = self.settle("supervise", self.supervise(&devices))? {
            return self.abort(reason);
        }

        self.enter(RunState::InstallingApps)?;
        if let Some(reason) = self.settle("installapps", self.install_apps(&devices))? {
            return self.abort(reason);
        }

        let outcome = self.finalize_run()?;
        info!("run finished");
        Ok(outcome)
    }

    fn finalize_run(&self) -> Result<RunOutcome> {
        self.enter(RunState::Finalizing)?;
        match self.settle("finalize", self.finalize())? {
            Some(reason) => self.abort(reason),
            None => {
                self.enter(RunState::Idle)?;
                Ok(RunOutcome::Completed)
            }
        }
    }

    fn abort(&self, reason: String) -> Result<RunOutcome> {
        info!(reason = %reason, "run aborted");
        self.enter(RunState::Stopped)?;
        Ok(RunOutcome::Aborted(reason))
    }

    /// Stage boundary: stage-local failures are logged and the run goes on.
    fn settle(&self, stage: &str, result: Result<Flow>) -> Result<Option<String>> {
        match result {
            Ok(Flow::Continue) => Ok(None),
            Ok(Flow::Stop(reason)) => Ok(Some(reason)),
            Err(err) if err.is_stage_local() => {
                error!(stage, error = %err, "stage failed");
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// Run every tasked query for attached devices as one combined `get` and
    /// fold the answers into the device records. Unanswered queries are
    /// tasked again.
    pub fn run_queries(&self) -> Result<()> {
        let available = self.available()?;
        let mut pending: BTreeMap<String, Ids> = BTreeMap::new();
        for key in self.tasks.queries(&Ids::new(), Some(&available))? {
            let ecids = self.tasks.take_query(&key, &Ids::new(), Some(&available))?;
            if !ecids.is_empty() {
                pending.insert(key, ecids);
            }
        }
        if pending.is_empty() {
            debug!("no queries for available devices");
            return Ok(());
        }

        let all: Ids = pending.values().flatten().cloned().collect();
        let keys: Vec<String> = pending.keys().cloned().collect();
        info!(queries = ?keys, devices = ?all, "running device queries");
        self.set_verified(false)?;

        let outcome = match self.tool.get(&keys, &all) {
            Ok(outcome) if !outcome.is_total_failure() => outcome,
            result => {
                self.requeue(&pending)?;
                return Err(match result {
                    Ok(outcome) => FleetError::TotalFailure {
                        command: "get".to_owned(),
                        reason: outcome
                            .reason()
                            .map(ToString::to_string)
                            .unwrap_or_default(),
                    },
                    Err(err) => err.into(),
                });
            }
        };

        for ecid in &all {
            let Some(info) = outcome.output_for(ecid) else {
                error!(ecid = %ecid, "no query results returned for device");
                continue;
            };
            let device = self.device(ecid, None)?;
            let mut apps_updated = false;
            for (key, ecids) in pending.iter_mut() {
                if !ecids.contains(ecid) {
                    continue;
                }
                match info.get(key) {
                    Some(value) if !value.is_null() => {
                        device.update_field(key, value.clone())?;
                        ecids.remove(ecid);
                        apps_updated |= key == "installedApps";
                    }
                    _ => error!(ecid = %ecid, query = %key, "missing query result"),
                }
            }
            if apps_updated {
                self.report_new_apps(&device)?;
            }
        }

        self.requeue(&pending)
    }

    fn requeue(&self, pending: &BTreeMap<String, Ids>) -> Result<()> {
        for (key, ecids) in pending {
            if !ecids.is_empty() {
                debug!(query = %key, devices = ?ecids, "re-tasking query");
                self.tasks.query(key, ecids)?;
            }
        }
        Ok(())
    }

    /// Report apps on `device` that no catalog group lists. They are never
    /// installed by the manager.
    fn report_new_apps(&self, device: &Device) -> Result<()> {
        let unknown = self.apps.unknown(&device.app_names()?)?;
        if unknown.is_empty() {
            debug!(ecid = %device.ecid(), "no new apps");
            return Ok(());
        }
        let listed: Vec<&str> = unknown.iter().map(String::as_str).collect();
        let message = format!("NEW: {}: new user apps: {}", device.name()?, listed.join(", "));
        info!(ecid = %device.ecid(), apps = ?unknown, "found user-installed apps");
        self.notify(&message);
        Ok(())
    }

    /// Erase the attached devices tasked for it.
    ///
    /// Devices are flagged as restarting before the call so the disconnect
    /// an erase causes is not taken for a checkout. Erased devices are tasked
    /// for supervision and apps, and the fleet stops until they are back.
    pub fn erase(&self, devices: &[Device]) -> Result<Flow> {
        let ecids = self.tasks.take_only(Task::Erase, &ecids(devices))?;
        if ecids.is_empty() {
            info!("no devices need to be erased");
            return Ok(Flow::Continue);
        }
        let missing = self.tasks.peek(Task::Erase)?;
        if !missing.is_empty() {
            warn!(devices = ?missing, "devices tasked for erase are not attached");
        }

        let targets: Vec<&Device> = devices
            .iter()
            .filter(|device| ecids.contains(device.ecid()))
            .collect();
        for device in &targets {
            device.set_restarting(true)?;
        }
        self.set_verified(false)?;

        info!(devices = ?ecids, "erasing devices");
        let mut excluded = Ids::new();
        let mut failure = None;
        let (erased, failed) = match self.tool.erase(&ecids) {
            Ok(CallOutcome::TotalFailure { affected, reason }) => {
                if reason.mentions(ACTIVATION_LOCKED) {
                    let locked: Vec<&Device> = targets
                        .iter()
                        .copied()
                        .filter(|device| affected.contains(device.ecid()))
                        .collect();
                    let message = format!("activation locked: {}", names(locked).join(", "));
                    error!(devices = ?affected, "activation locked");
                    self.notify(&message);
                    excluded = affected;
                }
                failure = Some(FleetError::TotalFailure {
                    command: "erase".to_owned(),
                    reason: reason.to_string(),
                });
                (Ids::new(), ecids.clone())
            }
            Ok(outcome) => {
                if let Some(reason) = outcome.reason() {
                    error!(reason = %reason, "erase partially failed");
                }
                (outcome.succeeded(), outcome.failed(&ecids))
            }
            Err(err) => {
                failure = Some(err.into());
                (Ids::new(), ecids.clone())
            }
        };

        if failed.is_empty() {
            info!("all devices were successfully erased");
        } else {
            error!(devices = ?failed, "erase failed");
            self.tasks.add(Task::Erase, &failed, &excluded)?;
            for device in targets.iter().filter(|d| failed.contains(d.ecid())) {
                device.set_restarting(false)?;
            }
        }
        if let Some(err) = failure {
            return Err(err);
        }
        if erased.is_empty() {
            return Ok(Flow::Continue);
        }

        let now = Utc::now();
        let mut need_apps = Ids::new();
        for device in targets.iter().filter(|d| erased.contains(d.ecid())) {
            device.set_erased(Some(now))?;
            let model = device.model()?.unwrap_or_default();
            if !self.apps.required(&model)?.is_empty() {
                need_apps.insert(device.ecid().to_owned());
            }
        }
        self.tasks.add(Task::Prepare, &erased, &Ids::new())?;
        self.tasks.add(Task::InstallApps, &need_apps, &Ids::new())?;
        self.tasks.add(Task::Restart, &erased, &Ids::new())?;

        self.stop(RESTART)?;
        Ok(Flow::Stop(RESTART.to_owned()))
    }

    /// Enroll the attached, unsupervised devices tasked for preparation.
    pub fn supervise(&self, devices: &[Device]) -> Result<Flow> {
        if let Some(reason) = self.stopped()? {
            return Ok(Flow::Stop(reason));
        }
        let mut unsupervised = Ids::new();
        for device in devices {
            if !device.supervised()? {
                unsupervised.insert(device.ecid().to_owned());
            }
        }
        let ecids = self.tasks.take_only(Task::Prepare, &unsupervised)?;
        if ecids.is_empty() {
            info!("no devices need to be supervised");
            return Ok(Flow::Continue);
        }
        let missing = self.tasks.peek(Task::Prepare)?;
        if !missing.is_empty() {
            debug!(devices = ?missing, "devices tasked for preparation are skipped");
        }

        let targets: Vec<&Device> = devices
            .iter()
            .filter(|device| ecids.contains(device.ecid()))
            .collect();
        self.check_network(&targets, &ecids)?;
        self.set_verified(false)?;

        info!(devices = ?ecids, "preparing devices");
        let mut failure = None;
        let (prepared, failed) = match self.tool.prepare(&ecids) {
            Ok(CallOutcome::TotalFailure { affected, reason }) => {
                error!(reason = %reason, "supervision failed");
                match SuperviseFailure::classify(&reason) {
                    SuperviseFailure::AlreadySupervised => {
                        warn!(devices = ?affected, "devices are already supervised");
                        self.tasks.query("isSupervised", &ecids)?;
                        (Ids::new(), Ids::new())
                    }
                    SuperviseFailure::MustErase => {
                        self.tasks.add(Task::Erase, &ecids, &Ids::new())?;
                        failure = Some(FleetError::TotalFailure {
                            command: "prepare".to_owned(),
                            reason: reason.to_string(),
                        });
                        (Ids::new(), ecids.clone())
                    }
                    SuperviseFailure::Network => {
                        debug!("retrying with the network profile");
                        self.install_network_profile(&ecids);
                        match self.tool.prepare(&ecids) {
                            Ok(retry) => {
                                if let Some(reason) = retry.reason() {
                                    error!(reason = %reason, "supervision retry failed");
                                }
                                (retry.succeeded(), retry.failed(&ecids))
                            }
                            Err(err) => {
                                error!(error = %err, "supervision retry failed");
                                (Ids::new(), ecids.clone())
                            }
                        }
                    }
                    SuperviseFailure::Other => {
                        failure = Some(FleetError::TotalFailure {
                            command: "prepare".to_owned(),
                            reason: reason.to_string(),
                        });
                        (Ids::new(), ecids.clone())
                    }
                }
            }
            Ok(outcome) => {
                if let Some(reason) = outcome.reason() {
                    error!(reason = %reason, "supervision partially failed");
                }
                (outcome.succeeded(), outcome.failed(&ecids))
            }
            Err(err) => {
                failure = Some(err.into());
                (Ids::new(), ecids.clone())
            }
        };

        self.tasks.add(Task::Prepare, &failed, &Ids::new())?;
        self.tasks.query("isSupervised", &prepared)?;
        let now = Utc::now();
        let enrolled: Vec<&Device> = targets
            .iter()
            .copied()
            .filter(|device| prepared.contains(device.ecid()))
            .collect();
        for device in &enrolled {
            device.set_enrolled(Some(now))?;
            device.set_supervised(true)?;
        }
        if !enrolled.is_empty() {
            info!(devices = ?names(enrolled.iter().copied()), "successfully prepared");
            if let Err(err) = self.set_background(&enrolled, Wallpaper::Attention) {
                error!(error = %err, "unable to mark prepared devices");
            }
        }

        match failure {
            Some(err) if prepared.is_empty() => Err(err),
            _ => Ok(Flow::Continue),
        }
    }

    /// Make sure `targets` have a network path for enrollment: tethering
    /// when available, else the Wi-Fi profile.
    fn check_network(&self, targets: &[&Device], ecids: &Ids) -> Result<()> {
        let mut serials = Vec::new();
        for device in targets {
            if let Some(serial) = device.serial_number()? {
                serials.push(serial);
            }
        }
        if let Err(err) = self.tether(&serials) {
            warn!(error = %err, "tethering unavailable; using network profile");
            self.install_network_profile(ecids);
        }
        Ok(())
    }

    fn tether(&self, serials: &[String]) -> std::result::Result<(), ToolError> {
        if !self.tethering.enabled()? {
            info!("tethering isn't enabled");
            self.tethering.restart()?;
        }
        let deadline = Instant::now() + self.config.timing.tether_wait;
        let mut tethered = self.tethering.devices_are_tethered(serials)?;
        while !tethered {
            if Instant::now() >= deadline {
                error!("timed out waiting for devices to tether");
                break;
            }
            thread::sleep(self.config.timing.tether_poll);
            tethered = self.tethering.devices_are_tethered(serials)?;
        }
        if !tethered {
            self.tethering.restart()?;
        }
        Ok(())
    }

    /// Best effort; failures are only logged.
    fn install_network_profile(&self, ecids: &Ids) {
        let profile = self.config.profiles_dir().join("wifi.mobileconfig");
        if !profile.exists() {
            warn!(path = %profile.display(), "no network profile available");
            return;
        }
        debug!(path = %profile.display(), "installing network profile");
        match self.tool.install_profile(ecids, &profile) {
            Ok(outcome) => {
                if let Some(reason) = outcome.reason() {
                    error!(reason = %reason, "network profile install failed");
                }
            }
            Err(err) => error!(error = %err, "network profile install failed"),
        }
        // Give the devices a moment to join.
        thread::sleep(Duration::from_secs(2).min(self.config.timing.tether_poll));
    }

    /// Install required apps on the attached devices tasked for them, one
    /// adapter session per batch.
    pub fn install_apps(&self, devices: &[Device]) -> Result<Flow> {
        if let Some(reason) = self.stopped()? {
            return Ok(Flow::Stop(reason));
        }
        let ecids = self.tasks.take_only(Task::InstallApps, &ecids(devices))?;
        if ecids.is_empty() {
            info!("no apps need to be installed");
            return Ok(Flow::Continue);
        }

        let mut targets = Vec::new();
        for device in devices.iter().filter(|d| ecids.contains(d.ecid())) {
            targets.push(InstallTarget {
                ecid: device.ecid().to_owned(),
                udid: device.udid().to_owned(),
                model: device.model()?.unwrap_or_default(),
                installed: device.app_names()?,
            });
        }
        let batches = self.apps.breakdown(&targets)?;
        self.set_verified(false)?;

        let installer = Installer::new(
            self.adapter.as_ref(),
            &self.config.recovery.rules,
            &self.config.timing,
        );
        for (index, batch) in batches.iter().enumerate() {
            info!(devices = ?batch.ecids, apps = ?batch.apps, "installing apps");
            if let Err(err) = installer.install(batch) {
                // The failed batch and every batch not yet attempted go back.
                let retask: Ids = batches[index..]
                    .iter()
                    .flat_map(|b| b.ecids.iter().cloned())
                    .collect();
                self.tasks.add(Task::InstallApps, &retask, &Ids::new())?;
                self.record_install_failure(&err)?;
                return Err(err.into());
            }
        }

        self.tasks.query("installedApps", &ecids)?;
        Ok(Flow::Continue)
    }

    fn record_install_failure(&self, err: &InstallError) -> Result<()> {
        let kind = match err {
            InstallError::Stalled { .. } => FailureKind::Stalled,
            InstallError::Unrecoverable(recovery) => {
                self.notify(&format!("install failed: {}", recovery.alert));
                FailureKind::Alert
            }
            InstallError::Adapter(_) | InstallError::NothingToInstall => {
                FailureKind::Execution
            }
        };
        error!(kind = %kind, error = %err, "app install failed");
        self.errors.add(kind, Some(err.to_string()), Utc::now())
    }

    /// Apply a wallpaper marker to the supervised devices among `devices`.
    pub fn set_background(&self, devices: &[&Device], wallpaper: Wallpaper) -> Result<()> {
        if self.stopped()?.is_some() {
            debug!(wallpaper = %wallpaper, "stopped; skipping wallpaper");
            return Ok(());
        }
        let mut supervised = Vec::new();
        for device in devices {
            if device.supervised()? {
                supervised.push(*device);
            }
        }
        if supervised.is_empty() {
            debug!("no wallpaper modified");
            return Ok(());
        }
        let Some(image) = self.wallpaper_image(wallpaper) else {
            error!(wallpaper = %wallpaper, "no image available");
            return Ok(());
        };

        let ecids = ecids(supervised.iter().copied());
        let outcome = self.tool.wallpaper(&ecids, &image)?;
        if let Some(reason) = outcome.reason() {
            error!(wallpaper = %wallpaper, reason = %reason, "failed to set background");
        }
        let done = outcome.succeeded();
        for device in supervised.iter().filter(|d| done.contains(d.ecid())) {
            device.set_background(Some(wallpaper))?;
        }
        Ok(())
    }
}
