use std::collections::{BTreeMap, BTreeSet};

use chrono::Utc;
use tracing::{debug, error, info, warn};

use super::{DeviceManager, FINISHED, Flow, RunOutcome, RunState, ecids};
use crate::{
    device::{Device, Wallpaper},
    error::{FleetError, Result},
    ledger::FailureKind,
    tasks::{Ids, Task, ids},
};

/// Tasks whose pending ids mean the fleet is not finished.
const WORK: [Task; 3] = [Task::Erase, Task::Prepare, Task::InstallApps];

impl DeviceManager {
    /// Check every attached device against what it should look like and
    /// re-task whatever is missing. Returns whether every device passed.
    ///
    /// Unattached devices that are not restarting have their pending work
    /// dropped; one never checked out is stamped as checked out now.
    pub fn verify_devices(&self) -> Result<bool> {
        debug!("running device verification");
        let now = Utc::now();
        let cooldown = self.errors.in_cooldown(now)?;
        let mut retask: BTreeMap<Task, Ids> = BTreeMap::new();
        let mut verified = true;
        let mut available = Ids::new();
        let mut incomplete = Vec::new();

        for info in self.list(false)? {
            let device = match self.device(&info.ecid, Some(&info)) {
                Ok(device) => device,
                Err(FleetError::MissingSeed { ecid }) => {
                    warn!(ecid = %ecid, "attached device cannot be recorded");
                    continue;
                }
                Err(err) => return Err(err),
            };
            let ecid = device.ecid().to_owned();
            let single = ids([ecid.as_str()]);
            available.insert(ecid.clone());
            let name = device.name()?;
            debug!(device = %name, "verifying");

            if device.serial_number()?.is_none() {
                warn!(device = %name, "serial number missing");
                self.tasks.query("serialNumber", &single)?;
            }

            if device.checkin()?.is_none() {
                warn!(device = %name, "never checked in");
                verified = false;
                device.set_verified(false)?;
                self.checkin(&info, false)?;
                continue;
            }

            if device.erased()?.is_none() {
                warn!(device = %name, "not erased");
                verified = false;
                device.set_verified(false)?;
                retask.entry(Task::Erase).or_default().insert(ecid);
                continue;
            }

            let installed = device.app_names()?;
            let unknown = self.apps.unknown(&installed)?;
            if !unknown.is_empty() {
                warn!(device = %name, apps = ?unknown, "unknown apps installed; erasing");
                verified = false;
                device.set_verified(false)?;
                retask.entry(Task::Erase).or_default().insert(ecid);
                continue;
            }

            let mut passed = true;
            if device.supervised()? {
                self.tasks.take_only(Task::Prepare, &single)?;
            } else {
                warn!(device = %name, "not supervised");
                passed = false;
                retask.entry(Task::Prepare).or_default().insert(ecid.clone());
            }

            let model = device.model()?.unwrap_or_default();
            let missing: BTreeSet<String> = self
                .apps
                .required(&model)?
                .difference(&installed)
                .cloned()
                .collect();
            if missing.is_empty() {
                self.tasks.take_only(Task::InstallApps, &single)?;
            } else {
                warn!(device = %name, apps = ?missing, "apps missing");
                passed = false;
                let attempted = !self.tasks.peek(Task::InstallApps)?.contains(&ecid);
                if attempted {
                    incomplete.push(format!("{name}: missing {missing:?}"));
                }
                if cooldown {
                    warn!(device = %name, "install retries suppressed during cooldown");
                } else {
                    retask.entry(Task::InstallApps).or_default().insert(ecid);
                }
            }

            device.set_verified(passed)?;
            verified &= passed;
        }

        // One failed pass is one failure, however many devices it covers.
        if !incomplete.is_empty() {
            self.errors
                .add(FailureKind::Verification, Some(incomplete.join("; ")), now)?;
        }

        let mut unattached = Ids::new();
        for ecid in self.known_devices()? {
            if available.contains(&ecid) {
                continue;
            }
            let device = match self.device(&ecid, None) {
                Ok(device) => device,
                Err(err) => {
                    warn!(ecid = %ecid, error = %err, "unreadable device record");
                    continue;
                }
            };
            if device.restarting()? {
                continue;
            }
            if device.checkout()?.is_none() {
                error!(ecid = %ecid, "device was never checked out");
                device.set_checkout(Some(now))?;
            }
            unattached.insert(ecid);
        }
        if !unattached.is_empty() {
            debug!(devices = ?unattached, "dropping work for unattached devices");
            self.tasks.remove(&unattached, None, None, true)?;
        }

        for (task, ecids) in retask {
            verified = false;
            debug!(task = %task, devices = ?ecids, "re-tasked");
            self.tasks.add(task, &ecids, &Ids::new())?;
        }
        if verified {
            self.errors.clear()?;
        }
        debug!(verified, "verification finished");
        Ok(verified)
    }

    /// Refresh verification.
    ///
    /// Skipped while stopped or when the last finalization is younger than
    /// `verify_interval`. Re-queries installed apps and supervision for
    /// attached devices, then runs [`verify_devices`](Self::verify_devices)
    /// if anything is pending or unverified. With `run`, a failed
    /// verification starts a run.
    pub fn verify(&self, run: bool) -> Result<RunOutcome> {
        let _fleet = self.acquire_fleet()?;
        if let Some(reason) = self.stopped()? {
            info!(reason = %reason, "verification stopped");
            return Ok(RunOutcome::Aborted(reason));
        }
        if let Some(finished) = self.finished()? {
            let interval = chrono::Duration::from_std(self.config.timing.verify_interval)
                .unwrap_or(chrono::Duration::MAX);
            if Utc::now().signed_duration_since(finished) < interval {
                debug!("finished too recently to verify again");
                return Ok(RunOutcome::Completed);
            }
        }

        let previous = self.enter(RunState::Verifying)?;
        let result = self.refresh_verification();
        self.leave(RunState::Verifying, previous)?;
        let verified = result?;

        if verified {
            info!("all devices and tasks were verified");
            return Ok(RunOutcome::Completed);
        }
        info!("verification failed");
        if run {
            self.enter(RunState::Verifying)?;
            return self.run();
        }
        Ok(RunOutcome::Completed)
    }

    fn refresh_verification(&self) -> Result<bool> {
        info!("verifying devices");
        let available = self.available()?;
        self.tasks.query("installedApps", &available)?;
        self.tasks.query("isSupervised", &available)?;
        if let Err(err) = self.run_queries() {
            if !err.is_stage_local() {
                return Err(err);
            }
            error!(error = %err, "verification queries failed");
        }

        let mut pending = false;
        for task in WORK {
            let waiting = self.tasks.peek(task)?;
            if !waiting.is_empty() {
                debug!(task = %task, devices = ?waiting, "pending task");
                pending = true;
            }
        }
        if pending {
            self.set_verified(false)?;
        }
        if !self.verified()? {
            let verified = self.verify_devices()?;
            self.set_verified(verified)?;
        }
        self.verified()
    }

    /// Last stage of a run: verify, mark devices that still need work, and
    /// stamp `finished`.
    pub fn finalize(&self) -> Result<Flow> {
        debug!("finalizing devices");
        if let Some(reason) = self.stopped()? {
            return Ok(Flow::Stop(reason));
        }
        if let RunOutcome::Aborted(reason) = self.verify(false)? {
            return Ok(Flow::Stop(reason));
        }

        let verified = self.verified()?;
        let mut retasked = Ids::new();
        if !verified {
            for (task, ecids) in self.tasks.pending()? {
                debug!(task = %task, devices = ?ecids, "retasked");
                retasked.extend(ecids);
            }
        }

        let devices = self.available_devices()?;
        let mut attention = Vec::new();
        let mut normal = Vec::new();
        for device in &devices {
            let background = device.background()?;
            // Devices held back by the failure cooldown still need attention.
            if retasked.contains(device.ecid()) || !device.verified()? {
                if background != Some(Wallpaper::Attention) {
                    attention.push(device);
                }
            } else if background != Some(Wallpaper::Normal) {
                normal.push(device);
            }
        }
        for (wallpaper, group) in [
            (Wallpaper::Attention, &attention),
            (Wallpaper::Normal, &normal),
        ] {
            if group.is_empty() {
                continue;
            }
            if let Err(err) = self.set_background(group, wallpaper) {
                error!(wallpaper = %wallpaper, error = %err, "unable to set background");
            }
        }

        if verified && let Err(err) = self.balance(&devices) {
            error!(error = %err, "load balancing failed");
        }

        self.doc.set(FINISHED, Utc::now())?;
        debug!("finalization complete");
        Ok(Flow::Continue)
    }

    /// Power off verified devices beyond the configured ceiling once the fleet
    /// has stayed verified for the cooldown.
    fn balance(&self, devices: &[Device]) -> Result<()> {
        let Some(ceiling) = self.config.balance.ceiling else {
            return Ok(());
        };
        if devices.len() <= ceiling {
            return Ok(());
        }
        let Some(since) = self.verified_since()? else {
            return Ok(());
        };
        let cooldown = chrono::Duration::from_std(self.config.balance.cooldown)
            .unwrap_or(chrono::Duration::MAX);
        if Utc::now().signed_duration_since(since) < cooldown {
            debug!("verified too recently to balance");
            return Ok(());
        }

        let mut eligible = Vec::new();
        for device in devices {
            if device.verified()? {
                eligible.push(device);
            }
        }
        let excess = devices.len() - ceiling;
        let chosen: Vec<&Device> = eligible.into_iter().rev().take(excess).collect();
        if chosen.is_empty() {
            return Ok(());
        }
        let ecids = ecids(chosen.iter().copied());
        info!(devices = ?ecids, ceiling, "shutting down devices over the ceiling");

        // A shutdown is not a checkout.
        for device in &chosen {
            device.set_restarting(true)?;
        }
        let outcome = self.tool.shutdown(&ecids)?;
        if let Some(reason) = outcome.reason() {
            error!(reason = %reason, "shutdown failed");
        }
        let failed = outcome.failed(&ecids);
        for device in chosen.iter().filter(|d| failed.contains(d.ecid())) {
            device.set_restarting(false)?;
        }
        self.invalidate_listing();
        Ok(())
    }
}
