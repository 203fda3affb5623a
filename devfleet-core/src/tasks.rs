//! Persistent task queue.
//!
//! One document per orchestrator identity (`<id>.tasks`) mapping task names
//! to sets of device ECIDs. Ad-hoc queries are stored the same way under the
//! queried key's name and listed in `queries` for as long as they have
//! outstanding devices.

use std::{collections::BTreeSet, fmt, path::Path};

use serde_json::Value;
use tracing::debug;

use crate::{
    config::Timing,
    error::Result,
    store::{Document, DocumentStore},
};

/// A set of device ECIDs.
pub type Ids = BTreeSet<String>;

const QUERIES: &str = "queries";

/// Named provisioning tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Task {
    Erase,
    Prepare,
    InstallApps,
    /// Devices rebooting after an erase.
    Restart,
}

impl Task {
    pub const ALL: [Task; 4] =
        [Task::Erase, Task::Prepare, Task::InstallApps, Task::Restart];

    pub fn as_str(&self) -> &'static str {
        match self {
            Task::Erase => "erase",
            Task::Prepare => "prepare",
            Task::InstallApps => "installapps",
            Task::Restart => "restart",
        }
    }
}

impl AsRef<str> for Task {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Build an [`Ids`] set from anything string-like.
pub fn ids<I, S>(items: I) -> Ids
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    items.into_iter().map(Into::into).collect()
}

#[derive(Debug)]
pub struct TaskList {
    store: DocumentStore,
}

impl TaskList {
    pub fn open(dir: &Path, id: &str, timing: &Timing) -> Result<Self> {
        let store = DocumentStore::new(
            dir,
            &format!("{id}.tasks"),
            Some(timing.lock_timeout),
            timing.lock_poll,
        );
        {
            let _guard = store.lock()?;
            if !store.exists() {
                debug!(path = %store.path().display(), "creating task file");
                let mut doc = Document::new();
                for task in [Task::Erase, Task::Prepare, Task::InstallApps] {
                    doc.insert(task.as_str().to_owned(), Value::Array(Vec::new()));
                }
                doc.insert(QUERIES.to_owned(), Value::Array(Vec::new()));
                store.write(&doc)?;
            }
        }
        Ok(Self { store })
    }

    pub fn store(&self) -> &DocumentStore {
        &self.store
    }

    /// Union `ids - exclude` into `name`.
    pub fn add(&self, name: impl AsRef<str>, ids: &Ids, exclude: &Ids) -> Result<()> {
        let name = name.as_ref();
        let adding: Ids = ids.difference(exclude).cloned().collect();
        if adding.is_empty() {
            return Ok(());
        }
        debug!(task = %name, ids = ?adding, "tasked");
        self.store.modify(|doc| {
            let mut current = read_ids(doc, name);
            current.extend(adding);
            write_ids(doc, name, &current);
        })?;
        Ok(())
    }

    /// Remove and return tasked ids.
    ///
    /// With `only`, exactly `only ∩ current` (minus `exclude`) is taken and
    /// everything else stays. Without it, everything but `exclude` is taken.
    pub fn get(
        &self,
        name: impl AsRef<str>,
        exclude: &Ids,
        only: Option<&Ids>,
    ) -> Result<Ids> {
        let name = name.as_ref();
        let _guard = self.store.lock()?;
        let taken = self.list(name, exclude, only)?;
        if !taken.is_empty() {
            self.store.modify(|doc| {
                let left: Ids =
                    read_ids(doc, name).difference(&taken).cloned().collect();
                write_ids(doc, name, &left);
            })?;
            debug!(task = %name, ids = ?taken, "drained");
        }
        Ok(taken)
    }

    /// Same selection as [`get`](Self::get) without removing anything.
    pub fn list(
        &self,
        name: impl AsRef<str>,
        exclude: &Ids,
        only: Option<&Ids>,
    ) -> Result<Ids> {
        let doc = self.store.read_or_default()?;
        Ok(select(&read_ids(&doc, name.as_ref()), exclude, only))
    }

    /// Drain everything tasked under `name`.
    pub fn take(&self, name: impl AsRef<str>) -> Result<Ids> {
        self.get(name, &Ids::new(), None)
    }

    /// Drain only the listed ids from `name`.
    pub fn take_only(&self, name: impl AsRef<str>, only: &Ids) -> Result<Ids> {
        self.get(name, &Ids::new(), Some(only))
    }

    /// Everything tasked under `name`, left in place.
    pub fn peek(&self, name: impl AsRef<str>) -> Result<Ids> {
        self.list(name, &Ids::new(), None)
    }

    /// Task `ids` for the query `key`.
    pub fn query(&self, key: &str, ids: &Ids) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let _guard = self.store.lock()?;
        self.add(key, ids, &Ids::new())?;
        self.store.modify(|doc| {
            let mut names = read_ids(doc, QUERIES);
            names.insert(key.to_owned());
            write_ids(doc, QUERIES, &names);
        })?;
        Ok(())
    }

    /// Drain the query `key`. Once nothing is left the query is forgotten.
    pub fn take_query(
        &self,
        key: &str,
        exclude: &Ids,
        only: Option<&Ids>,
    ) -> Result<Ids> {
        let _guard = self.store.lock()?;
        let taken = self.get(key, exclude, only)?;
        self.store.modify(collect_queries)?;
        Ok(taken)
    }

    /// Names of outstanding queries with ids matching the selection.
    pub fn queries(&self, exclude: &Ids, only: Option<&Ids>) -> Result<Vec<String>> {
        let doc = self.store.read_or_default()?;
        Ok(read_ids(&doc, QUERIES)
            .into_iter()
            .filter(|key| !select(&read_ids(&doc, key), exclude, only).is_empty())
            .collect())
    }

    /// True iff nothing is tasked anywhere in the document.
    pub fn all_done(&self) -> Result<bool> {
        let doc = self.store.read_or_default()?;
        Ok(doc.values().all(|value| match value {
            Value::Array(items) => items.is_empty(),
            Value::Null => true,
            _ => false,
        }))
    }

    /// Strip `ids` from tasks and queries.
    ///
    /// With neither `tasks` nor `queries` given (or with `all`), the ids are
    /// removed from every set in the document.
    pub fn remove(
        &self,
        ids: &Ids,
        tasks: Option<&[&str]>,
        queries: Option<&[&str]>,
        all: bool,
    ) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        self.store.modify(|doc| {
            let everything = all || (tasks.is_none() && queries.is_none());
            let keys: Vec<String> = if everything {
                doc.keys().filter(|k| k.as_str() != QUERIES).cloned().collect()
            } else {
                tasks
                    .unwrap_or_default()
                    .iter()
                    .chain(queries.unwrap_or_default())
                    .map(|k| (*k).to_owned())
                    .collect()
            };
            for key in keys {
                if !doc.contains_key(&key) {
                    continue;
                }
                let left: Ids = read_ids(doc, &key).difference(ids).cloned().collect();
                write_ids(doc, &key, &left);
            }
            collect_queries(doc);
        })?;
        Ok(())
    }

    /// Snapshot of every non-empty set, for status reporting.
    pub fn pending(&self) -> Result<Vec<(String, Ids)>> {
        let doc = self.store.read_or_default()?;
        Ok(doc
            .keys()
            .filter(|k| k.as_str() != QUERIES)
            .map(|k| (k.clone(), read_ids(&doc, k)))
            .filter(|(_, ids)| !ids.is_empty())
            .collect())
    }
}

fn select(current: &Ids, exclude: &Ids, only: Option<&Ids>) -> Ids {
    let left = current.difference(exclude);
    match only {
        Some(only) => left.filter(|id| only.contains(*id)).cloned().collect(),
        None => left.cloned().collect(),
    }
}

fn read_ids(doc: &Document, key: &str) -> Ids {
    match doc.get(key) {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_owned))
            .collect(),
        _ => Ids::new(),
    }
}

fn write_ids(doc: &mut Document, key: &str, ids: &Ids) {
    doc.insert(
        key.to_owned(),
        Value::Array(ids.iter().cloned().map(Value::String).collect()),
    );
}

/// Forget drained queries, keeping the `queries` list in step with the
/// query sets that still hold ids.
fn collect_queries(doc: &mut Document) {
    let names = read_ids(doc, QUERIES);
    let mut live = Ids::new();
    for name in names {
        if read_ids(doc, &name).is_empty() {
            doc.remove(&name);
        } else {
            live.insert(name);
        }
    }
    write_ids(doc, QUERIES, &live);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn tasks(dir: &TempDir) -> TaskList {
        TaskList::open(dir.path(), "edu.example.test", &Timing::default()).unwrap()
    }

    #[test]
    fn new_task_file_is_all_done() {
        let dir = TempDir::new().unwrap();
        assert!(tasks(&dir).all_done().unwrap());
    }

    #[test]
    fn add_is_idempotent_and_honours_exclude() {
        let dir = TempDir::new().unwrap();
        let list = tasks(&dir);
        list.add(Task::Erase, &ids(["a", "b", "c"]), &ids(["c", "d"])).unwrap();
        list.add(Task::Erase, &ids(["a", "b"]), &Ids::new()).unwrap();

        assert_eq!(list.peek(Task::Erase).unwrap(), ids(["a", "b"]));
    }

    #[test]
    fn get_drains_everything_not_excluded() {
        let dir = TempDir::new().unwrap();
        let list = tasks(&dir);
        list.add(Task::Prepare, &ids(["a", "b", "c"]), &Ids::new()).unwrap();

        let taken = list.get(Task::Prepare, &ids(["b"]), None).unwrap();
        assert_eq!(taken, ids(["a", "c"]));
        assert_eq!(list.peek(Task::Prepare).unwrap(), ids(["b"]));
    }

    #[test]
    fn get_with_only_takes_exactly_the_intersection() {
        let dir = TempDir::new().unwrap();
        let list = tasks(&dir);
        list.add(Task::InstallApps, &ids(["a", "b", "c"]), &Ids::new()).unwrap();

        let taken = list.take_only(Task::InstallApps, &ids(["b", "z"])).unwrap();
        assert_eq!(taken, ids(["b"]));
        assert_eq!(list.peek(Task::InstallApps).unwrap(), ids(["a", "c"]));

        let none = list.take_only(Task::InstallApps, &Ids::new()).unwrap();
        assert!(none.is_empty());
        assert_eq!(list.peek(Task::InstallApps).unwrap(), ids(["a", "c"]));
    }

    #[test]
    fn drained_query_is_garbage_collected() {
        let dir = TempDir::new().unwrap();
        let list = tasks(&dir);
        list.query("serialNumber", &ids(["a", "b"])).unwrap();
        assert_eq!(list.queries(&Ids::new(), None).unwrap(), vec!["serialNumber"]);
        assert!(!list.all_done().unwrap());

        let partial = list
            .take_query("serialNumber", &Ids::new(), Some(&ids(["a"])))
            .unwrap();
        assert_eq!(partial, ids(["a"]));
        assert_eq!(list.queries(&Ids::new(), None).unwrap(), vec!["serialNumber"]);

        let rest = list.take_query("serialNumber", &Ids::new(), None).unwrap();
        assert_eq!(rest, ids(["b"]));
        assert!(list.queries(&Ids::new(), None).unwrap().is_empty());
        let doc = list.store().read().unwrap();
        assert!(!doc.contains_key("serialNumber"));
        assert!(list.all_done().unwrap());
    }

    #[test]
    fn remove_strips_ids_everywhere_by_default() {
        let dir = TempDir::new().unwrap();
        let list = tasks(&dir);
        list.add(Task::Erase, &ids(["a", "b"]), &Ids::new()).unwrap();
        list.add(Task::Restart, &ids(["a"]), &Ids::new()).unwrap();
        list.query("installedApps", &ids(["a"])).unwrap();

        list.remove(&ids(["a"]), None, None, false).unwrap();

        assert_eq!(list.peek(Task::Erase).unwrap(), ids(["b"]));
        assert!(list.peek(Task::Restart).unwrap().is_empty());
        assert!(list.queries(&Ids::new(), None).unwrap().is_empty());
    }

    #[test]
    fn remove_limited_to_named_tasks() {
        let dir = TempDir::new().unwrap();
        let list = tasks(&dir);
        list.add(Task::Erase, &ids(["a"]), &Ids::new()).unwrap();
        list.add(Task::Prepare, &ids(["a"]), &Ids::new()).unwrap();

        list.remove(&ids(["a"]), Some(&["prepare"]), None, false).unwrap();

        assert_eq!(list.peek(Task::Erase).unwrap(), ids(["a"]));
        assert!(list.peek(Task::Prepare).unwrap().is_empty());
    }
}
