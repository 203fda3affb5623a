//! Required-app catalog.
//!
//! Stored as `<id>.apps`: top-level keys are group names mapping to app
//! names, and `groups.model` maps model identifiers to extra groups. Every
//! device belongs to `all`, to `all-<Type>s` for its device type, and to
//! the groups its model is listed under.

use std::{
    collections::{BTreeMap, BTreeSet},
    path::Path,
};

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Value, json};
use tracing::debug;

use crate::{
    config::Timing,
    error::Result,
    store::{Document, DocumentStore},
};

static MODEL_TYPE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\w+?)\d+,\d+$").expect("model type regex should compile")
});

const GROUPS: &str = "groups";
const RESERVED: &[&str] = &[GROUPS, "Identifiers", "errors"];

/// Device type from a model identifier (`iPad7,5` → `iPad`).
pub fn model_type(model: &str) -> Option<&str> {
    MODEL_TYPE
        .captures(model)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

/// A device as seen by the install planner.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct InstallTarget {
    pub ecid: String,
    pub udid: String,
    pub model: String,
    pub installed: BTreeSet<String>,
}

/// One adapter session: install `apps` on every device in `ecids`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallBatch {
    pub ecids: BTreeSet<String>,
    pub udids: BTreeSet<String>,
    pub apps: BTreeSet<String>,
}

#[derive(Debug)]
pub struct AppCatalog {
    store: DocumentStore,
}

impl AppCatalog {
    pub fn open(dir: &Path, id: &str, timing: &Timing) -> Result<Self> {
        let store = DocumentStore::new(
            dir,
            &format!("{id}.apps"),
            Some(timing.lock_timeout),
            timing.lock_poll,
        );
        {
            let _guard = store.lock()?;
            if !store.exists() {
                debug!(path = %store.path().display(), "creating default app catalog");
                if let Value::Object(doc) = default_catalog() {
                    store.write(&doc)?;
                }
            }
        }
        Ok(Self { store })
    }

    pub fn store(&self) -> &DocumentStore {
        &self.store
    }

    /// Every app group name.
    pub fn groups(&self) -> Result<Vec<String>> {
        let doc = self.store.read_or_default()?;
        Ok(doc
            .keys()
            .filter(|k| !RESERVED.contains(&k.as_str()))
            .cloned()
            .collect())
    }

    /// Groups a device of `model` belongs to.
    pub fn groups_for(&self, model: &str) -> Result<BTreeSet<String>> {
        let doc = self.store.read_or_default()?;
        Ok(groups_for(&doc, model))
    }

    pub fn apps_in(&self, group: &str) -> Result<BTreeSet<String>> {
        let doc = self.store.read_or_default()?;
        Ok(names(doc.get(group)))
    }

    /// Apps every device of `model` must have.
    pub fn required(&self, model: &str) -> Result<BTreeSet<String>> {
        let doc = self.store.read_or_default()?;
        Ok(groups_for(&doc, model)
            .iter()
            .flat_map(|group| names(doc.get(group)))
            .collect())
    }

    /// Every app named by any group.
    pub fn known(&self) -> Result<BTreeSet<String>> {
        let doc = self.store.read_or_default()?;
        Ok(doc
            .iter()
            .filter(|(k, _)| !RESERVED.contains(&k.as_str()))
            .flat_map(|(_, v)| names(Some(v)))
            .collect())
    }

    /// Installed apps no group knows about.
    pub fn unknown(&self, installed: &BTreeSet<String>) -> Result<BTreeSet<String>> {
        let known = self.known()?;
        Ok(installed.difference(&known).cloned().collect())
    }

    pub fn add(&self, group: &str, apps: &[&str]) -> Result<BTreeSet<String>> {
        Ok(self.store.modify(|doc| {
            let mut current = names(doc.get(group));
            current.extend(apps.iter().map(|a| (*a).to_owned()));
            doc.insert(group.to_owned(), json!(current));
            current
        })?)
    }

    pub fn remove(&self, group: &str, apps: &[&str]) -> Result<BTreeSet<String>> {
        Ok(self.store.modify(|doc| {
            let mut current = names(doc.get(group));
            current.retain(|a| !apps.contains(&a.as_str()));
            doc.insert(group.to_owned(), json!(current));
            current
        })?)
    }

    /// Add `model` to an explicit group.
    pub fn assign_model(&self, model: &str, group: &str) -> Result<()> {
        self.store.modify(|doc| {
            let groups = doc
                .entry(GROUPS)
                .or_insert_with(|| json!({"model": {}}));
            if let Value::Object(groups) = groups {
                let models = groups.entry("model").or_insert_with(|| json!({}));
                if let Value::Object(models) = models {
                    let mut current = names(models.get(model));
                    current.insert(group.to_owned());
                    models.insert(model.to_owned(), json!(current));
                }
            }
        })?;
        Ok(())
    }

    /// Plan install sessions for `targets`.
    ///
    /// Devices are grouped by app-group membership; groups with identical
    /// members share one session. Apps already present on every member of a
    /// session are dropped, and sessions left with nothing to install are
    /// omitted.
    pub fn breakdown(&self, targets: &[InstallTarget]) -> Result<Vec<InstallBatch>> {
        let doc = self.store.read_or_default()?;

        let mut members: BTreeMap<String, BTreeSet<&InstallTarget>> = BTreeMap::new();
        for target in targets {
            for group in groups_for(&doc, &target.model) {
                members.entry(group).or_default().insert(target);
            }
        }

        let mut sessions: BTreeMap<BTreeSet<String>, BTreeSet<String>> = BTreeMap::new();
        let mut devices: BTreeMap<BTreeSet<String>, Vec<&InstallTarget>> = BTreeMap::new();
        for (group, group_members) in members {
            let apps = names(doc.get(&group));
            if apps.is_empty() {
                continue;
            }
            let key: BTreeSet<String> =
                group_members.iter().map(|t| t.ecid.clone()).collect();
            sessions.entry(key.clone()).or_default().extend(apps);
            devices
                .entry(key)
                .or_insert_with(|| group_members.iter().copied().collect());
        }

        let mut batches = Vec::new();
        for (ecids, apps) in sessions {
            let members = devices.get(&ecids).cloned().unwrap_or_default();
            let apps: BTreeSet<String> = apps
                .into_iter()
                .filter(|app| !members.iter().all(|t| t.installed.contains(app)))
                .collect();
            if apps.is_empty() {
                continue;
            }
            batches.push(InstallBatch {
                udids: members.iter().map(|t| t.udid.clone()).collect(),
                ecids,
                apps,
            });
        }
        Ok(batches)
    }
}

fn default_catalog() -> Value {
    json!({
        "groups": {"model": {
            "iPad7,3": ["iPadPros"],
            "iPad8,1": ["iPadPros"],
            "iPad7,5": ["iPads"],
        }},
        "all": [],
        "all-iPads": [],
        "iPadPros": [],
        "iPads": [],
    })
}

fn groups_for(doc: &Document, model: &str) -> BTreeSet<String> {
    let mut groups = BTreeSet::from(["all".to_owned()]);
    if let Some(kind) = model_type(model) {
        groups.insert(format!("all-{kind}s"));
    }
    let explicit = doc
        .get(GROUPS)
        .and_then(|g| g.get("model"))
        .and_then(|m| m.get(model));
    groups.extend(names(explicit));
    groups
}

fn names(value: Option<&Value>) -> BTreeSet<String> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_owned))
            .collect(),
        _ => BTreeSet::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn catalog(dir: &TempDir) -> AppCatalog {
        let catalog =
            AppCatalog::open(dir.path(), "edu.example.test", &Timing::default()).unwrap();
        catalog.add("all", &["Keynote", "Pages"]).unwrap();
        catalog.add("all-iPads", &["Numbers"]).unwrap();
        catalog.add("iPadPros", &["Procreate"]).unwrap();
        catalog
    }

    fn target(ecid: &str, model: &str, installed: &[&str]) -> InstallTarget {
        InstallTarget {
            ecid: ecid.to_owned(),
            udid: format!("udid-{ecid}"),
            model: model.to_owned(),
            installed: installed.iter().map(|s| (*s).to_owned()).collect(),
        }
    }

    #[test]
    fn model_type_strips_generation() {
        assert_eq!(model_type("iPad7,5"), Some("iPad"));
        assert_eq!(model_type("iPhone12,8"), Some("iPhone"));
        assert_eq!(model_type("Mac"), None);
    }

    #[test]
    fn groups_and_required_apps_follow_model() {
        let dir = TempDir::new().unwrap();
        let catalog = catalog(&dir);

        let groups = catalog.groups_for("iPad7,3").unwrap();
        assert!(groups.contains("all"));
        assert!(groups.contains("all-iPads"));
        assert!(groups.contains("iPadPros"));

        let required = catalog.required("iPad7,3").unwrap();
        assert_eq!(required.len(), 4);
        assert!(!catalog.required("iPad7,5").unwrap().contains("Procreate"));
    }

    #[test]
    fn unknown_apps_are_reported() {
        let dir = TempDir::new().unwrap();
        let catalog = catalog(&dir);
        let installed: BTreeSet<String> =
            ["Keynote", "Fortnite"].iter().map(|s| (*s).to_owned()).collect();
        let unknown = catalog.unknown(&installed).unwrap();
        assert_eq!(unknown.into_iter().collect::<Vec<_>>(), vec!["Fortnite"]);
    }

    #[test]
    fn breakdown_merges_shared_groups_and_skips_installed() {
        let dir = TempDir::new().unwrap();
        let catalog = catalog(&dir);
        let targets = vec![
            target("a", "iPad7,5", &["Keynote"]),
            target("b", "iPad7,3", &["Keynote", "Procreate"]),
        ];

        let batches = catalog.breakdown(&targets).unwrap();
        // all + all-iPads share both members; iPadPros only has `b`, which
        // already has Procreate.
        assert_eq!(batches.len(), 1);
        let batch = &batches[0];
        assert_eq!(batch.ecids.len(), 2);
        assert_eq!(
            batch.apps.iter().cloned().collect::<Vec<_>>(),
            vec!["Numbers", "Pages"]
        );
    }
}
