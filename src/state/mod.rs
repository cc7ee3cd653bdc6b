//! Durable resource state
//!
//! The state store is the engine's only mutable shared resource. Every write
//! goes through the optimistic-concurrency [`StateStore::put`] contract: the
//! caller presents the serial number it last observed, and the store refuses
//! the write with [`StoreError::StaleWrite`] if the stored serial has moved.
//! The serial check is the sole mutation discipline: there is no separate
//! lock, and a record's serial only advances on a committed write.
//!
//! Backends are pluggable behind the trait: [`MemoryStore`] for tests and
//! single-pass use, [`FileStore`] for a local JSON document.

mod file;
mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::value::Value;

/// Persisted counterpart of a resource
///
/// Mutated only after a successful provider operation commits. The recorded
/// dependency names preserve ordering information for destroy passes and
/// orphan deletion, where the desired-state declarations are no longer
/// available.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRecord {
    /// Logical resource name
    pub name: String,
    /// Resource type identifier
    #[serde(rename = "type")]
    pub type_: String,
    /// Monotonic version; advances by one per committed write
    pub serial: u64,
    /// Last-applied input payload, fully resolved
    pub inputs: Value,
    /// Last-observed outputs produced by the provider (generated IDs etc.)
    pub outputs: Value,
    /// Names of the resources this one depended on when applied
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
}

impl ResourceRecord {
    /// The provider-assigned identity of this resource, if recorded
    ///
    /// Providers return the identity under the `"id"` output field.
    pub fn id(&self) -> Option<&str> {
        self.outputs.get(crate::OUTPUT_ID_FIELD).and_then(Value::as_str)
    }
}

/// Errors raised by state store backends
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// The stored serial advanced past the caller's expectation
    ///
    /// Another writer committed between the caller's read and this write.
    #[error(
        "stale write for {name:?}: expected serial {expected:?}, stored {stored:?}"
    )]
    StaleWrite {
        /// Resource whose write was refused
        name: String,
        /// Serial the caller expected (`None` = expected no record)
        expected: Option<u64>,
        /// Serial actually stored (`None` = no record)
        stored: Option<u64>,
    },

    /// The backing storage cannot be reached or read
    #[error("state storage unavailable: {0}")]
    Unavailable(String),

    /// The stored document cannot be decoded
    #[error("state serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Create an unavailability error with the given message
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }
}

/// Contract for durable resource state, storage-agnostic
///
/// `put` is the only mutation path that carries data; it must be atomic with
/// respect to concurrent `put` calls for the same name.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Read the record for a resource, if one exists
    async fn get(&self, name: &str) -> Result<Option<ResourceRecord>, StoreError>;

    /// Atomically replace the record for `record.name`
    ///
    /// `expected_serial` is the serial the caller observed before computing
    /// the new record; `None` asserts that no record exists yet. Fails with
    /// [`StoreError::StaleWrite`] when the assertion does not hold.
    async fn put(
        &self,
        record: ResourceRecord,
        expected_serial: Option<u64>,
    ) -> Result<(), StoreError>;

    /// Remove the record for a resource
    ///
    /// Removing an absent record is not an error.
    async fn delete(&self, name: &str) -> Result<(), StoreError>;

    /// All records, ordered by resource name
    async fn list(&self) -> Result<Vec<ResourceRecord>, StoreError>;
}
