//! Local JSON file state store backend

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::{ResourceRecord, StateStore, StoreError};
use crate::value::Value;

/// Persisted entry; the resource name is the document key
#[derive(Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct PersistedRecord {
    #[serde(rename = "type")]
    type_: String,
    serial: u64,
    inputs: Value,
    outputs: Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    dependencies: Vec<String>,
}

/// State store backed by a single local JSON document
///
/// Writes go to a sibling temp file and are renamed into place, so a crash
/// mid-write never leaves a torn document. A process-local mutex serializes
/// read-modify-write cycles; cross-process locking is the caller's concern
/// (the serial check still catches races after the fact).
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileStore {
    /// Create a store backed by the given file path
    ///
    /// The file is created on first write; a missing file reads as empty.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// Path of the backing document
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<BTreeMap<String, PersistedRecord>, StoreError> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => {
                return Err(StoreError::unavailable(format!(
                    "reading {}: {e}",
                    self.path.display()
                )))
            }
        };
        serde_json::from_str(&raw).map_err(|e| {
            StoreError::serialization(format!("decoding {}: {e}", self.path.display()))
        })
    }

    async fn save(&self, records: &BTreeMap<String, PersistedRecord>) -> Result<(), StoreError> {
        let raw = serde_json::to_string_pretty(records)
            .map_err(|e| StoreError::serialization(e.to_string()))?;
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, raw.as_bytes()).await.map_err(|e| {
            StoreError::unavailable(format!("writing {}: {e}", tmp.display()))
        })?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(|e| {
            StoreError::unavailable(format!("renaming into {}: {e}", self.path.display()))
        })
    }
}

fn to_record(name: &str, persisted: &PersistedRecord) -> ResourceRecord {
    ResourceRecord {
        name: name.to_string(),
        type_: persisted.type_.clone(),
        serial: persisted.serial,
        inputs: persisted.inputs.clone(),
        outputs: persisted.outputs.clone(),
        dependencies: persisted.dependencies.clone(),
    }
}

fn to_persisted(record: ResourceRecord) -> PersistedRecord {
    PersistedRecord {
        type_: record.type_,
        serial: record.serial,
        inputs: record.inputs,
        outputs: record.outputs,
        dependencies: record.dependencies,
    }
}

#[async_trait]
impl StateStore for FileStore {
    async fn get(&self, name: &str) -> Result<Option<ResourceRecord>, StoreError> {
        let _guard = self.lock.lock().await;
        Ok(self.load().await?.get(name).map(|p| to_record(name, p)))
    }

    async fn put(
        &self,
        record: ResourceRecord,
        expected_serial: Option<u64>,
    ) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        let mut records = self.load().await?;
        let stored = records.get(&record.name).map(|p| p.serial);
        if stored != expected_serial {
            return Err(StoreError::StaleWrite {
                name: record.name,
                expected: expected_serial,
                stored,
            });
        }
        records.insert(record.name.clone(), to_persisted(record));
        self.save(&records).await
    }

    async fn delete(&self, name: &str) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        let mut records = self.load().await?;
        if records.remove(name).is_some() {
            self.save(&records).await?;
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<ResourceRecord>, StoreError> {
        let _guard = self.lock.lock().await;
        Ok(self
            .load()
            .await?
            .iter()
            .map(|(name, p)| to_record(name, p))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str, serial: u64) -> ResourceRecord {
        ResourceRecord {
            name: name.to_string(),
            type_: "test:mod:Thing".to_string(),
            serial,
            inputs: Value::map([
                ("size", Value::from(2i64)),
                ("token", Value::secret("tok-123")),
                ("clusterId", Value::reference("cluster", "id")),
            ]),
            outputs: Value::map([("id", Value::string(format!("{name}-id")))]),
            dependencies: vec!["cluster".to_string()],
        }
    }

    #[tokio::test]
    async fn test_round_trip_exact() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().join("state.json"));

        let rec = record("pool", 1);
        store.put(rec.clone(), None).await.unwrap();
        assert_eq!(store.get("pool").await.unwrap(), Some(rec.clone()));

        // A second store over the same file sees the identical record
        let reopened = FileStore::new(store.path());
        assert_eq!(reopened.get("pool").await.unwrap(), Some(rec));
    }

    #[tokio::test]
    async fn test_missing_file_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().join("absent.json"));
        assert!(store.list().await.unwrap().is_empty());
        assert_eq!(store.get("x").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_stale_write_detected_across_handles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let first = FileStore::new(&path);
        let second = FileStore::new(&path);
        first.put(record("a", 1), None).await.unwrap();
        second.put(record("a", 2), Some(1)).await.unwrap();

        // First handle's view of serial 1 is now stale
        let err = first.put(record("a", 2), Some(1)).await.unwrap_err();
        assert!(matches!(err, StoreError::StaleWrite { stored: Some(2), .. }));
    }

    #[tokio::test]
    async fn test_delete_persists() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().join("state.json"));
        store.put(record("a", 1), None).await.unwrap();
        store.delete("a").await.unwrap();
        let reopened = FileStore::new(store.path());
        assert_eq!(reopened.get("a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_corrupt_document_is_a_serialization_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        tokio::fs::write(&path, b"not json").await.unwrap();
        let store = FileStore::new(&path);
        assert!(matches!(
            store.list().await,
            Err(StoreError::Serialization(_))
        ));
    }
}
