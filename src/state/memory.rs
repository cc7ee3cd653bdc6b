//! In-memory state store backend

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::{ResourceRecord, StateStore, StoreError};

/// Thread-safe in-memory backend
///
/// The serial check in [`put`](StateStore::put) runs under the map's
/// per-entry lock, so two concurrent writers presenting the same expected
/// serial cannot both succeed.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: DashMap<String, ResourceRecord>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get(&self, name: &str) -> Result<Option<ResourceRecord>, StoreError> {
        Ok(self.records.get(name).map(|r| r.value().clone()))
    }

    async fn put(
        &self,
        record: ResourceRecord,
        expected_serial: Option<u64>,
    ) -> Result<(), StoreError> {
        match self.records.entry(record.name.clone()) {
            Entry::Occupied(mut entry) => {
                let stored = entry.get().serial;
                if expected_serial != Some(stored) {
                    return Err(StoreError::StaleWrite {
                        name: record.name,
                        expected: expected_serial,
                        stored: Some(stored),
                    });
                }
                entry.insert(record);
                Ok(())
            }
            Entry::Vacant(entry) => {
                if let Some(expected) = expected_serial {
                    return Err(StoreError::StaleWrite {
                        name: record.name,
                        expected: Some(expected),
                        stored: None,
                    });
                }
                entry.insert(record);
                Ok(())
            }
        }
    }

    async fn delete(&self, name: &str) -> Result<(), StoreError> {
        self.records.remove(name);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<ResourceRecord>, StoreError> {
        let mut records: Vec<ResourceRecord> =
            self.records.iter().map(|r| r.value().clone()).collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(records)
    }
}
