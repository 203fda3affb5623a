//! Persistent per-device records.
//!
//! One document per physical device under `<root>/Devices`, keyed by ECID.
//! Identity keys are written once; later opens that report different values
//! fail with [`FleetError::IdentityMismatch`].

use std::{collections::BTreeSet, fmt, path::Path, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::{
    config::Timing,
    error::{FleetError, Result, StoreError},
    store::{Document, DocumentStore},
};

/// Keys that may never change once recorded.
const IDENTITY_KEYS: &[&str] = &["ECID", "UDID", "serialNumber"];

/// Keys refreshed from every report of a connected device.
const REFRESHED_KEYS: &[&str] = &[
    "deviceName",
    "deviceType",
    "bootedState",
    "buildVersion",
    "firmwareVersion",
    "locationID",
];

/// Prefix of the names devices report until someone renames them.
const GENERIC_NAME: &str = "iPad";

/// State an erase invalidates.
const ERASE_CLEARS: &[&str] = &[
    "background",
    "enrolled",
    "isSupervised",
    "installedApps",
    "verified",
];

/// Device information as reported by the configuration tool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    #[serde(rename = "ECID")]
    pub ecid: String,
    #[serde(rename = "UDID", default, skip_serializing_if = "Option::is_none")]
    pub udid: Option<String>,
    #[serde(rename = "deviceType", default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(
        rename = "deviceName",
        alias = "name",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub name: Option<String>,
    #[serde(
        rename = "serialNumber",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub serial_number: Option<String>,
    #[serde(rename = "locationID", default, skip_serializing_if = "Option::is_none")]
    pub location_id: Option<Value>,
}

impl DeviceInfo {
    pub fn new(ecid: impl Into<String>) -> Self {
        Self {
            ecid: ecid.into(),
            ..Self::default()
        }
    }

    pub fn with_udid(mut self, udid: impl Into<String>) -> Self {
        self.udid = Some(udid.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    fn to_document(&self) -> Result<Document> {
        match serde_json::to_value(self).map_err(StoreError::from)? {
            Value::Object(map) => Ok(map),
            _ => Ok(Document::new()),
        }
    }
}

/// One installed application as reported by the configuration tool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppRecord {
    pub itunes_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bundle_identifier: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bundle_version: Option<String>,
}

impl AppRecord {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            itunes_name: name.into(),
            ..Self::default()
        }
    }
}

/// Background marker shown on a device's lock screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Wallpaper {
    Normal,
    Attention,
}

impl Wallpaper {
    pub fn as_str(&self) -> &'static str {
        match self {
            Wallpaper::Normal => "normal",
            Wallpaper::Attention => "attention",
        }
    }
}

impl fmt::Display for Wallpaper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A device's persisted record.
#[derive(Debug)]
pub struct Device {
    ecid: String,
    udid: String,
    store: DocumentStore,
    restart_window: Duration,
    created: bool,
}

impl Device {
    /// Open the record for `ecid`, creating it from `info` when none exists.
    ///
    /// Identity keys in `info` are checked against the recorded ones; the
    /// remaining reported keys are refreshed.
    pub fn open(
        dir: &Path,
        ecid: &str,
        info: Option<&DeviceInfo>,
        timing: &Timing,
    ) -> Result<Self> {
        let store = DocumentStore::new(
            dir,
            ecid,
            Some(timing.lock_timeout),
            timing.lock_poll,
        );

        if let Some(info) = info
            && info.ecid != ecid
        {
            return Err(FleetError::IdentityMismatch {
                ecid: ecid.to_owned(),
                key: "ECID".to_owned(),
                recorded: ecid.to_owned(),
                reported: info.ecid.clone(),
            });
        }

        let (created, record) = load_or_create(&store, ecid, info)?;

        let udid = record
            .get("UDID")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .ok_or_else(|| FleetError::RecordIncomplete {
                ecid: ecid.to_owned(),
                key: "UDID".to_owned(),
            })?;

        Ok(Self {
            ecid: ecid.to_owned(),
            udid,
            store,
            restart_window: timing.restart_window,
            created,
        })
    }

    pub fn ecid(&self) -> &str {
        &self.ecid
    }

    pub fn udid(&self) -> &str {
        &self.udid
    }

    /// Whether this handle created the record.
    pub fn was_created(&self) -> bool {
        self.created
    }

    pub fn store(&self) -> &DocumentStore {
        &self.store
    }

    pub fn record(&self) -> Result<Document> {
        Ok(self.store.read()?)
    }

    /// Display name: the recorded `name`, else the reported `deviceName`.
    /// Generic names (`iPad`, `iPad (2)`) get the ECID appended.
    pub fn name(&self) -> Result<String> {
        if let Some(name) = self.store.get_as::<String>("name")?
            && !name.is_empty()
        {
            return Ok(name);
        }
        match self.store.get_as::<String>("deviceName")? {
            Some(name) if !name.is_empty() && !name.starts_with(GENERIC_NAME) => {
                self.store.set("name", &name)?;
                Ok(name)
            }
            Some(name) if !name.is_empty() => Ok(format!("{name} ({})", self.ecid)),
            _ => Ok(self.ecid.clone()),
        }
    }

    pub fn model(&self) -> Result<Option<String>> {
        Ok(self.store.get_as("deviceType")?)
    }

    pub fn serial_number(&self) -> Result<Option<String>> {
        Ok(self.store.get_as("serialNumber")?)
    }

    pub fn checkin(&self) -> Result<Option<DateTime<Utc>>> {
        self.timestamp("checkin")
    }

    pub fn set_checkin(&self, at: Option<DateTime<Utc>>) -> Result<()> {
        self.set_timestamp("checkin", at)
    }

    pub fn checkout(&self) -> Result<Option<DateTime<Utc>>> {
        self.timestamp("checkout")
    }

    pub fn set_checkout(&self, at: Option<DateTime<Utc>>) -> Result<()> {
        self.set_timestamp("checkout", at)
    }

    pub fn erased(&self) -> Result<Option<DateTime<Utc>>> {
        self.timestamp("erased")
    }

    /// Stamp (or clear) `erased`. Stamping also drops everything that
    /// belonged to the pre-erase device.
    pub fn set_erased(&self, at: Option<DateTime<Utc>>) -> Result<()> {
        let stamp = at.map(serde_json::to_value).transpose().map_err(StoreError::from)?;
        self.store.modify(|doc| {
            match stamp {
                Some(value) => {
                    doc.insert("erased".to_owned(), value);
                    for key in ERASE_CLEARS {
                        doc.remove(*key);
                    }
                }
                None => {
                    doc.remove("erased");
                }
            }
        })?;
        Ok(())
    }

    pub fn enrolled(&self) -> Result<Option<DateTime<Utc>>> {
        self.timestamp("enrolled")
    }

    pub fn set_enrolled(&self, at: Option<DateTime<Utc>>) -> Result<()> {
        self.set_timestamp("enrolled", at)
    }

    pub fn locked(&self) -> Result<Option<DateTime<Utc>>> {
        self.timestamp("locked")
    }

    pub fn set_locked(&self, at: Option<DateTime<Utc>>) -> Result<()> {
        self.set_timestamp("locked", at)
    }

    /// `restarting` flag. A flag set longer ago than the restart window is
    /// cleared as a side effect of reading it.
    pub fn restarting(&self) -> Result<bool> {
        self.restarting_at(Utc::now())
    }

    pub(crate) fn restarting_at(&self, now: DateTime<Utc>) -> Result<bool> {
        let _guard = self.store.lock()?;
        if !self.store.get_as::<bool>("restarting")?.unwrap_or(false) {
            return Ok(false);
        }
        let restarted = self
            .store
            .get("restarted")?
            .and_then(|v| serde_json::from_value::<DateTime<Utc>>(v).ok());
        let window = chrono::Duration::from_std(self.restart_window)
            .unwrap_or(chrono::Duration::MAX);
        let stale = match restarted {
            Some(at) => now.signed_duration_since(at) > window,
            None => true,
        };
        if stale {
            debug!(ecid = %self.ecid, "restart flag expired");
            self.set_restarting(false)?;
            return Ok(false);
        }
        Ok(true)
    }

    pub fn set_restarting(&self, value: bool) -> Result<()> {
        let mut partial = Document::new();
        partial.insert("restarting".to_owned(), Value::Bool(value));
        if value {
            partial.insert(
                "restarted".to_owned(),
                serde_json::to_value(Utc::now()).map_err(StoreError::from)?,
            );
        }
        self.store.update(partial)?;
        Ok(())
    }

    pub fn supervised(&self) -> Result<bool> {
        Ok(self.store.get_as("isSupervised")?.unwrap_or(false))
    }

    pub fn set_supervised(&self, value: bool) -> Result<()> {
        Ok(self.store.set("isSupervised", value)?)
    }

    pub fn verified(&self) -> Result<bool> {
        Ok(self.store.get_as("verified")?.unwrap_or(false))
    }

    pub fn set_verified(&self, value: bool) -> Result<()> {
        Ok(self.store.set("verified", value)?)
    }

    pub fn apps(&self) -> Result<Vec<AppRecord>> {
        Ok(self.store.get_as("installedApps")?.unwrap_or_default())
    }

    /// Names of installed apps.
    pub fn app_names(&self) -> Result<BTreeSet<String>> {
        Ok(self.apps()?.into_iter().map(|app| app.itunes_name).collect())
    }

    pub fn set_apps(&self, apps: &[AppRecord]) -> Result<()> {
        Ok(self.store.set("installedApps", apps)?)
    }

    pub fn background(&self) -> Result<Option<Wallpaper>> {
        Ok(self.store.get_as("background")?)
    }

    pub fn set_background(&self, wallpaper: Option<Wallpaper>) -> Result<()> {
        match wallpaper {
            Some(w) => self.store.set("background", w)?,
            None => self.store.remove_keys(&["background"])?,
        }
        Ok(())
    }

    /// Fold a queried value into the record, type-checking known keys.
    pub fn update_field(&self, key: &str, value: Value) -> Result<()> {
        match key {
            "ECID" | "UDID" => {
                let recorded = self.store.get(key)?;
                if recorded.as_ref().is_some_and(|r| r != &value) {
                    return Err(FleetError::IdentityMismatch {
                        ecid: self.ecid.clone(),
                        key: key.to_owned(),
                        recorded: recorded.map(|v| v.to_string()).unwrap_or_default(),
                        reported: value.to_string(),
                    });
                }
                Ok(())
            }
            "serialNumber" => {
                let recorded = self.serial_number()?;
                let reported = value.as_str().ok_or_else(|| StoreError::InvalidValue {
                    key: key.to_owned(),
                    expected: "string",
                })?;
                match recorded {
                    Some(r) if r != reported => Err(FleetError::IdentityMismatch {
                        ecid: self.ecid.clone(),
                        key: key.to_owned(),
                        recorded: r,
                        reported: reported.to_owned(),
                    }),
                    _ => Ok(self.store.set(key, reported)?),
                }
            }
            "isSupervised" | "verified" | "restarting" => {
                let flag = value.as_bool().ok_or_else(|| StoreError::InvalidValue {
                    key: key.to_owned(),
                    expected: "boolean",
                })?;
                Ok(self.store.set(key, flag)?)
            }
            "installedApps" => {
                let apps: Vec<AppRecord> =
                    serde_json::from_value(value).map_err(|_| StoreError::InvalidValue {
                        key: key.to_owned(),
                        expected: "list of apps",
                    })?;
                self.set_apps(&apps)
            }
            "checkin" | "checkout" | "erased" | "enrolled" | "locked" => {
                let at: DateTime<Utc> =
                    serde_json::from_value(value).map_err(|_| StoreError::InvalidValue {
                        key: key.to_owned(),
                        expected: "timestamp",
                    })?;
                if key == "erased" {
                    self.set_erased(Some(at))
                } else {
                    self.set_timestamp(key, Some(at))
                }
            }
            _ => Ok(self.store.set(key, value)?),
        }
    }

    fn timestamp(&self, key: &str) -> Result<Option<DateTime<Utc>>> {
        self.store.get_as(key).map_err(|err| match err {
            StoreError::Serialization(_) => StoreError::InvalidValue {
                key: key.to_owned(),
                expected: "timestamp",
            }
            .into(),
            other => other.into(),
        })
    }

    fn set_timestamp(&self, key: &str, at: Option<DateTime<Utc>>) -> Result<()> {
        match at {
            Some(at) => self.store.set(key, at)?,
            None => self.store.remove_keys(&[key])?,
        }
        Ok(())
    }
}

fn load_or_create(
    store: &DocumentStore,
    ecid: &str,
    info: Option<&DeviceInfo>,
) -> Result<(bool, Document)> {
    let _guard = store.lock()?;
    if !store.exists() {
        let Some(info) = info.filter(|i| i.udid.is_some()) else {
            return Err(FleetError::MissingSeed {
                ecid: ecid.to_owned(),
            });
        };
        let doc = info.to_document()?;
        store.write(&doc)?;
        info!(ecid = %ecid, "created device record");
        return Ok((true, doc));
    }

    let mut doc = store.read()?;
    if let Some(info) = info {
        let reported = info.to_document()?;
        verify_identity(ecid, &doc, &reported)?;
        let mut changed = false;
        for (key, value) in reported {
            let refresh = REFRESHED_KEYS.contains(&key.as_str())
                || !doc.contains_key(&key);
            if refresh && !value.is_null() && doc.get(&key) != Some(&value) {
                doc.insert(key, value);
                changed = true;
            }
        }
        if changed {
            store.write(&doc)?;
        }
    }
    Ok((false, doc))
}

fn verify_identity(ecid: &str, recorded: &Document, reported: &Document) -> Result<()> {
    for key in IDENTITY_KEYS {
        if let (Some(r), Some(p)) = (recorded.get(*key), reported.get(*key))
            && !r.is_null()
            && !p.is_null()
            && r != p
        {
            return Err(FleetError::IdentityMismatch {
                ecid: ecid.to_owned(),
                key: (*key).to_owned(),
                recorded: display_value(r),
                reported: display_value(p),
            });
        }
    }
    Ok(())
}

fn display_value(value: &Value) -> String {
    value
        .as_str()
        .map(str::to_owned)
        .unwrap_or_else(|| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn info() -> DeviceInfo {
        DeviceInfo::new("0x1A2B")
            .with_udid("udid-1")
            .with_model("iPad7,5")
            .with_name("Cart 3")
    }

    fn open(dir: &TempDir, info: Option<&DeviceInfo>) -> Result<Device> {
        Device::open(dir.path(), "0x1A2B", info, &Timing::default())
    }

    #[test]
    fn first_open_requires_seed() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(open(&dir, None), Err(FleetError::MissingSeed { .. })));

        let device = open(&dir, Some(&info())).unwrap();
        assert!(device.was_created());
        assert_eq!(device.udid(), "udid-1");
        assert_eq!(device.model().unwrap().as_deref(), Some("iPad7,5"));

        let again = open(&dir, None).unwrap();
        assert!(!again.was_created());
    }

    #[test]
    fn reopening_with_different_udid_is_identity_mismatch() {
        let dir = TempDir::new().unwrap();
        open(&dir, Some(&info())).unwrap();

        let forged = info().with_udid("udid-2");
        let err = open(&dir, Some(&forged)).unwrap_err();
        assert!(matches!(
            err,
            FleetError::IdentityMismatch { ref key, .. } if key == "UDID"
        ));
    }

    #[test]
    fn reopening_with_same_identity_updates_mutable_fields() {
        let dir = TempDir::new().unwrap();
        open(&dir, Some(&info())).unwrap();

        let renamed = info().with_name("Cart 4");
        let device = open(&dir, Some(&renamed)).unwrap();
        let record = device.record().unwrap();
        assert_eq!(record["deviceName"], json!("Cart 4"));
        assert_eq!(record["UDID"], json!("udid-1"));
    }

    #[test]
    fn erase_clears_post_erase_state() {
        let dir = TempDir::new().unwrap();
        let device = open(&dir, Some(&info())).unwrap();
        device.set_apps(&[AppRecord::named("Keynote")]).unwrap();
        device.set_enrolled(Some(Utc::now())).unwrap();
        device.set_background(Some(Wallpaper::Attention)).unwrap();
        device.set_supervised(true).unwrap();
        device.set_verified(true).unwrap();

        device.set_erased(Some(Utc::now())).unwrap();

        assert!(device.apps().unwrap().is_empty());
        assert_eq!(device.enrolled().unwrap(), None);
        assert_eq!(device.background().unwrap(), None);
        assert!(!device.verified().unwrap());
        assert!(!device.supervised().unwrap());
        assert!(device.erased().unwrap().is_some());
    }

    #[test]
    fn stale_restarting_flag_expires_on_read() {
        let dir = TempDir::new().unwrap();
        let device = open(&dir, Some(&info())).unwrap();
        device.set_restarting(true).unwrap();
        assert!(device.restarting().unwrap());

        let later = Utc::now() + chrono::Duration::minutes(6);
        assert!(!device.restarting_at(later).unwrap());
        assert_eq!(device.record().unwrap()["restarting"], json!(false));
    }

    #[test]
    fn boolean_fields_reject_other_types() {
        let dir = TempDir::new().unwrap();
        let device = open(&dir, Some(&info())).unwrap();

        let err = device.update_field("isSupervised", json!("yes")).unwrap_err();
        assert!(matches!(
            err,
            FleetError::Store(StoreError::InvalidValue { expected: "boolean", .. })
        ));
        device.update_field("isSupervised", json!(true)).unwrap();
        assert!(device.supervised().unwrap());
    }

    #[test]
    fn generic_device_names_carry_the_ecid() {
        let dir = TempDir::new().unwrap();
        let device =
            open(&dir, Some(&info().with_name("iPad"))).unwrap();
        assert_eq!(device.name().unwrap(), "iPad (0x1A2B)");
    }

    #[test]
    fn custom_names_starting_with_i_are_kept() {
        let dir = TempDir::new().unwrap();
        let device =
            open(&dir, Some(&info().with_name("inventory-07"))).unwrap();
        assert_eq!(device.name().unwrap(), "inventory-07");
    }
}
