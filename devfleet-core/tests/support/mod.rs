//! Shared fakes and fixtures for manager integration tests.
#![allow(dead_code)]

use std::{
    collections::{BTreeMap, BTreeSet, VecDeque},
    path::Path,
    sync::Arc,
};

use devfleet_core::{
    config::{FleetConfig, Timing},
    device::DeviceInfo,
    error::ToolError,
    manager::{Collaborators, DeviceManager},
    tasks::Ids,
    tools::{
        AdapterStatus, CallOutcome, ConfigTool, InstallAdapter, Notifier, Tethering,
    },
};
use mockall::mock;
use parking_lot::Mutex;
use serde_json::Value;
use tempfile::TempDir;

pub const FLEET_ID: &str = "edu.example.test";

mock! {
    pub Tether {}

    impl Tethering for Tether {
        fn enabled(&self) -> Result<bool, ToolError>;
        fn devices_are_tethered(&self, serials: &[String]) -> Result<bool, ToolError>;
        fn restart(&self) -> Result<(), ToolError>;
    }
}

mock! {
    pub Notify {}

    impl Notifier for Notify {
        fn send(&self, message: &str);
    }
}

/// Tethering that is always up.
pub fn tethered() -> MockTether {
    let mut tether = MockTether::new();
    tether.expect_enabled().returning(|| Ok(true));
    tether.expect_devices_are_tethered().returning(|_| Ok(true));
    tether.expect_restart().returning(|| Ok(()));
    tether
}

/// Notifier that accepts anything.
pub fn quiet() -> MockNotify {
    let mut notify = MockNotify::new();
    notify.expect_send().returning(|_| ());
    notify
}

/// Configuration tool backed by in-memory state.
///
/// Scripted outcomes are consumed in order; once a script runs out every
/// requested device succeeds.
#[derive(Default)]
pub struct FakeTool {
    attached: Mutex<Vec<DeviceInfo>>,
    answers: Mutex<BTreeMap<String, serde_json::Map<String, Value>>>,
    erase: Mutex<VecDeque<CallOutcome>>,
    prepare: Mutex<VecDeque<CallOutcome>>,
    calls: Mutex<Vec<(String, Ids)>>,
}

impl FakeTool {
    pub fn attach(&self, info: DeviceInfo) {
        let mut attached = self.attached.lock();
        attached.retain(|d| d.ecid != info.ecid);
        attached.push(info);
    }

    pub fn detach(&self, ecid: &str) {
        self.attached.lock().retain(|d| d.ecid != ecid);
    }

    /// Value `get` reports for `key` on `ecid`.
    pub fn answer(&self, ecid: &str, key: &str, value: Value) {
        self.answers
            .lock()
            .entry(ecid.to_owned())
            .or_default()
            .insert(key.to_owned(), value);
    }

    pub fn script_erase(&self, outcome: CallOutcome) {
        self.erase.lock().push_back(outcome);
    }

    pub fn script_prepare(&self, outcome: CallOutcome) {
        self.prepare.lock().push_back(outcome);
    }

    /// Every call made so far as `(command, devices)`.
    pub fn calls(&self) -> Vec<(String, Ids)> {
        self.calls.lock().clone()
    }

    pub fn called(&self, command: &str) -> usize {
        self.calls.lock().iter().filter(|(c, _)| c == command).count()
    }

    fn record(&self, command: &str, ecids: &Ids) {
        self.calls.lock().push((command.to_owned(), ecids.clone()));
    }

    fn scripted(
        script: &Mutex<VecDeque<CallOutcome>>,
        ecids: &Ids,
    ) -> CallOutcome {
        script
            .lock()
            .pop_front()
            .unwrap_or_else(|| CallOutcome::success(ecids.clone()))
    }
}

impl ConfigTool for FakeTool {
    fn list(&self) -> Result<Vec<DeviceInfo>, ToolError> {
        Ok(self.attached.lock().clone())
    }

    fn get(&self, keys: &[String], ecids: &Ids) -> Result<CallOutcome, ToolError> {
        self.record("get", ecids);
        let answers = self.answers.lock();
        let mut output = BTreeMap::new();
        let mut succeeded = Ids::new();
        let mut missing = Ids::new();
        for ecid in ecids {
            match answers.get(ecid) {
                Some(known) => {
                    let values: serde_json::Map<String, Value> = keys
                        .iter()
                        .filter_map(|k| known.get(k).map(|v| (k.clone(), v.clone())))
                        .collect();
                    output.insert(ecid.clone(), Value::Object(values));
                    succeeded.insert(ecid.clone());
                }
                None => {
                    missing.insert(ecid.clone());
                }
            }
        }
        Ok(CallOutcome::Success {
            succeeded,
            missing,
            output,
        })
    }

    fn erase(&self, ecids: &Ids) -> Result<CallOutcome, ToolError> {
        self.record("erase", ecids);
        Ok(Self::scripted(&self.erase, ecids))
    }

    fn prepare(&self, ecids: &Ids) -> Result<CallOutcome, ToolError> {
        self.record("prepare", ecids);
        Ok(Self::scripted(&self.prepare, ecids))
    }

    fn wallpaper(&self, ecids: &Ids, _image: &Path) -> Result<CallOutcome, ToolError> {
        self.record("wallpaper", ecids);
        Ok(CallOutcome::success(ecids.clone()))
    }

    fn install_profile(
        &self,
        ecids: &Ids,
        _profile: &Path,
    ) -> Result<CallOutcome, ToolError> {
        self.record("install_profile", ecids);
        Ok(CallOutcome::success(ecids.clone()))
    }

    fn restart(&self, ecids: &Ids) -> Result<CallOutcome, ToolError> {
        self.record("restart", ecids);
        Ok(CallOutcome::success(ecids.clone()))
    }

    fn shutdown(&self, ecids: &Ids) -> Result<CallOutcome, ToolError> {
        self.record("shutdown", ecids);
        Ok(CallOutcome::success(ecids.clone()))
    }
}

/// Adapter replaying a status script; the last status repeats.
#[derive(Default)]
pub struct FakeAdapter {
    statuses: Mutex<VecDeque<AdapterStatus>>,
    installs: Mutex<Vec<(BTreeSet<String>, BTreeSet<String>)>>,
    actions: Mutex<Vec<String>>,
    relaunches: Mutex<usize>,
}

impl FakeAdapter {
    pub fn script(&self, statuses: impl IntoIterator<Item = AdapterStatus>) {
        self.statuses.lock().extend(statuses);
    }

    pub fn installs(&self) -> Vec<(BTreeSet<String>, BTreeSet<String>)> {
        self.installs.lock().clone()
    }

    pub fn actions(&self) -> Vec<String> {
        self.actions.lock().clone()
    }

    pub fn relaunches(&self) -> usize {
        *self.relaunches.lock()
    }
}

impl InstallAdapter for FakeAdapter {
    fn status(&self) -> Result<AdapterStatus, ToolError> {
        let mut statuses = self.statuses.lock();
        if statuses.len() > 1 {
            return Ok(statuses.pop_front().unwrap_or_default());
        }
        Ok(statuses.front().cloned().unwrap_or_default())
    }

    fn install_apps(
        &self,
        udids: &BTreeSet<String>,
        apps: &BTreeSet<String>,
    ) -> Result<(), ToolError> {
        self.installs.lock().push((udids.clone(), apps.clone()));
        Ok(())
    }

    fn action(&self, choice: &str, _options: &[String]) -> Result<(), ToolError> {
        self.actions.lock().push(choice.to_owned());
        Ok(())
    }

    fn relaunch(&self) -> Result<(), ToolError> {
        *self.relaunches.lock() += 1;
        Ok(())
    }
}

/// A manager rooted in a fresh temp dir, wired to fakes.
pub struct Harness {
    pub dir: TempDir,
    pub tool: Arc<FakeTool>,
    pub adapter: Arc<FakeAdapter>,
    pub manager: DeviceManager,
}

pub fn config(root: &Path) -> FleetConfig {
    FleetConfig {
        id: FLEET_ID.to_owned(),
        root: root.to_path_buf(),
        timing: Timing::immediate(),
        ..FleetConfig::default()
    }
}

pub fn harness() -> Harness {
    harness_with(|_| {}, quiet())
}

/// Build a harness, letting the caller adjust the config and supply the
/// notifier.
pub fn harness_with(
    adjust: impl FnOnce(&mut FleetConfig),
    notifier: MockNotify,
) -> Harness {
    harness_wired(adjust, tethered(), notifier)
}

/// Like [`harness_with`], with the tethering helper supplied as well.
pub fn harness_wired(
    adjust: impl FnOnce(&mut FleetConfig),
    tethering: MockTether,
    notifier: MockNotify,
) -> Harness {
    let dir = TempDir::new().expect("temp dir");
    let mut config = config(dir.path());
    adjust(&mut config);

    let tool = Arc::new(FakeTool::default());
    let adapter = Arc::new(FakeAdapter::default());
    let collaborators = Collaborators {
        tool: tool.clone(),
        adapter: adapter.clone(),
        tethering: Arc::new(tethering),
        notifier: Arc::new(notifier),
    };
    let manager = DeviceManager::new(config, collaborators).expect("manager");
    Harness {
        dir,
        tool,
        adapter,
        manager,
    }
}

/// Write an empty file at `root/relative`, creating parents.
pub fn touch(root: &Path, relative: &str) {
    let path = root.join(relative);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("create parent");
    }
    std::fs::write(path, b"").expect("write file");
}

pub fn ipad(ecid: &str) -> DeviceInfo {
    DeviceInfo::new(ecid)
        .with_udid(format!("udid-{ecid}"))
        .with_model("iPad7,5")
        .with_name(format!("Cart {ecid}"))
}
