//! Error types for the engine

use thiserror::Error;

use crate::provider::ProviderError;
use crate::state::StoreError;

/// Main error type for engine operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The declared dependency relation contains a cycle.
    ///
    /// Carries the offending node sequence with the first node repeated at
    /// the end. Raised before any provider operation is dispatched.
    #[error("dependency cycle detected: {}", path.join(" -> "))]
    CycleDetected {
        /// Node names along the cycle
        path: Vec<String>,
    },

    /// No provider is registered for a resource type
    #[error("no provider registered for resource type {0:?}")]
    UnknownProvider(String),

    /// Validation error for resource declarations
    #[error("validation error: {0}")]
    Validation(String),

    /// An output reference points at a resource or field that does not exist
    #[error("unresolved reference to output {field:?} of resource {resource:?}")]
    UnresolvedReference {
        /// Name of the referenced resource
        resource: String,
        /// Referenced output field
        field: String,
    },

    /// A dependency of this resource failed, so it was never attempted
    #[error("dependency {0:?} failed")]
    DependencyFailed(String),

    /// State store error
    #[error("state store error: {0}")]
    Store(#[from] StoreError),

    /// Provider error
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create a cycle error from the offending node sequence
    pub fn cycle(path: Vec<String>) -> Self {
        Self::CycleDetected { path }
    }
}
