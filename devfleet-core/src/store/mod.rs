//! Locked, JSON-backed key/value documents.
//!
//! Every document lives at `<dir>/<name>.json` with its lock file colocated
//! at `<dir>/.<name>.lock`. All operations run inside a scoped acquisition of
//! that lock; callers needing a multi-step read-modify-write hold
//! [`DocumentStore::lock`] or use [`DocumentStore::modify`].

pub mod lock;

use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use tracing::trace;

use crate::error::StoreError;
pub use lock::{FileLock, LockGuard};

pub type Document = serde_json::Map<String, Value>;

#[derive(Debug)]
pub struct DocumentStore {
    path: PathBuf,
    lock: FileLock,
}

impl DocumentStore {
    pub fn new(
        dir: impl AsRef<Path>,
        name: &str,
        timeout: Option<Duration>,
        poll: Duration,
    ) -> Self {
        let dir = dir.as_ref();
        Self {
            path: dir.join(format!("{name}.json")),
            lock: FileLock::new(dir.join(format!(".{name}.lock")), timeout, poll),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Hold the document lock for a compound operation.
    pub fn lock(&self) -> Result<LockGuard<'_>, StoreError> {
        self.lock.acquire()
    }

    pub fn read(&self) -> Result<Document, StoreError> {
        let _guard = self.lock.acquire()?;
        self.load()?.ok_or_else(|| StoreError::NotFound {
            path: self.path.clone(),
        })
    }

    /// Like [`read`](Self::read) but a missing document reads as empty.
    pub fn read_or_default(&self) -> Result<Document, StoreError> {
        let _guard = self.lock.acquire()?;
        Ok(self.load()?.unwrap_or_default())
    }

    pub fn write(&self, doc: &Document) -> Result<(), StoreError> {
        let _guard = self.lock.acquire()?;
        self.store(doc)
    }

    /// Merge `partial` into the document and return the merged result.
    pub fn update(&self, partial: Document) -> Result<Document, StoreError> {
        self.modify(|doc| {
            doc.extend(partial);
            doc.clone()
        })
    }

    pub fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.read_or_default()?.remove(key))
    }

    /// Typed lookup; a missing key or `null` reads as `None`.
    pub fn get_as<T: DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<Option<T>, StoreError> {
        match self.get(key)? {
            None | Some(Value::Null) => Ok(None),
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
        }
    }

    pub fn set<T: Serialize>(&self, key: &str, value: T) -> Result<(), StoreError> {
        let value = serde_json::to_value(value)?;
        self.modify(|doc| {
            doc.insert(key.to_owned(), value);
        })
    }

    /// Remove `key`, returning its value.
    pub fn delete(&self, key: &str) -> Result<Value, StoreError> {
        let _guard = self.lock.acquire()?;
        let mut doc = self.load()?.unwrap_or_default();
        let value = doc.remove(key).ok_or_else(|| StoreError::KeyNotFound {
            key: key.to_owned(),
        })?;
        self.store(&doc)?;
        Ok(value)
    }

    /// Remove every key present; missing keys are ignored.
    pub fn remove_keys<S: AsRef<str>>(&self, keys: &[S]) -> Result<(), StoreError> {
        self.modify(|doc| {
            for key in keys {
                doc.remove(key.as_ref());
            }
        })
    }

    /// Return the existing value of `key`, inserting `value` first if absent.
    pub fn set_default(&self, key: &str, value: Value) -> Result<Value, StoreError> {
        self.modify(|doc| doc.entry(key.to_owned()).or_insert(value).clone())
    }

    /// Read-modify-write under one lock acquisition.
    pub fn modify<T>(
        &self,
        f: impl FnOnce(&mut Document) -> T,
    ) -> Result<T, StoreError> {
        let _guard = self.lock.acquire()?;
        let mut doc = self.load()?.unwrap_or_default();
        let out = f(&mut doc);
        self.store(&doc)?;
        Ok(out)
    }

    /// Replace the document with `doc` or, if `None`, an empty one.
    pub fn reset(&self, doc: Option<Document>) -> Result<(), StoreError> {
        self.write(&doc.unwrap_or_default())
    }

    fn load(&self) -> Result<Option<Document>, StoreError> {
        match fs::read(&self.path) {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => {
                Ok(Some(Document::new()))
            }
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn store(&self, doc: &Document) -> Result<(), StoreError> {
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir)?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(&mut tmp, doc)?;
        tmp.write_all(b"\n")?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|err| StoreError::Io(err.error))?;
        trace!(path = %self.path.display(), keys = doc.len(), "document written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> DocumentStore {
        DocumentStore::new(
            dir.path().join("docs"),
            "edu.example.test",
            Some(Duration::from_secs(1)),
            Duration::from_millis(5),
        )
    }

    fn doc(value: Value) -> Document {
        match value {
            Value::Object(map) => map,
            other => panic!("not an object: {other}"),
        }
    }

    #[test]
    fn read_of_missing_document_is_not_found() {
        let dir = TempDir::new().unwrap();
        let err = store(&dir).read().unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[test]
    fn update_merges_and_creates_directory() {
        let dir = TempDir::new().unwrap();
        let docs = store(&dir);
        docs.write(&doc(json!({"a": 1, "b": 2}))).unwrap();

        let merged = docs.update(doc(json!({"b": 3, "c": 4}))).unwrap();
        assert_eq!(Value::Object(merged), json!({"a": 1, "b": 3, "c": 4}));
        assert!(dir.path().join("docs").join("edu.example.test.json").exists());
    }

    #[test]
    fn delete_returns_value_or_key_not_found() {
        let dir = TempDir::new().unwrap();
        let docs = store(&dir);
        docs.set("stopped", true).unwrap();

        assert_eq!(docs.delete("stopped").unwrap(), json!(true));
        assert!(matches!(
            docs.delete("stopped"),
            Err(StoreError::KeyNotFound { key }) if key == "stopped"
        ));
    }

    #[test]
    fn set_default_keeps_existing_value() {
        let dir = TempDir::new().unwrap();
        let docs = store(&dir);

        assert_eq!(docs.set_default("idle", json!(300)).unwrap(), json!(300));
        assert_eq!(docs.set_default("idle", json!(60)).unwrap(), json!(300));
    }

    #[test]
    fn nested_operations_under_held_lock() {
        let dir = TempDir::new().unwrap();
        let docs = store(&dir);

        let _guard = docs.lock().unwrap();
        docs.set("x", 1).unwrap();
        docs.remove_keys(&["x", "missing"]).unwrap();
        assert_eq!(docs.get("x").unwrap(), None);
    }

    #[test]
    fn typed_get_treats_null_as_absent() {
        let dir = TempDir::new().unwrap();
        let docs = store(&dir);
        docs.write(&doc(json!({"reason": null, "idle": 120}))).unwrap();

        assert_eq!(docs.get_as::<String>("reason").unwrap(), None);
        assert_eq!(docs.get_as::<u64>("idle").unwrap(), Some(120));
    }
}
