//! Provider abstraction layer
//!
//! Providers are the backends that realize create/read/update/delete for
//! their resource types. The engine talks to them through the
//! [`ProviderClient`] trait and never interprets resource payloads itself.
//!
//! Calls are independent and may be issued concurrently across unrelated
//! resources; a client enforces no cross-call ordering; dependency ordering
//! is the scheduler's job.
//!
//! The shipping implementation is [`PluginClient`], which drives an
//! out-of-process plugin executable over newline-delimited JSON. Tests use
//! mocks or in-process fakes behind the same trait.

mod plugin;

pub use plugin::PluginClient;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use std::time::Duration;

use crate::retry::{retry_with_backoff, RetryConfig};
use crate::value::Value;
use crate::{Error, Result};

/// Run one provider operation under the caller's deadline and retry policy
///
/// Each attempt is individually bounded by `deadline`; expiry maps to
/// [`ProviderError::Unavailable`] and is retried like any other transient
/// failure. [`ProviderError::Rejected`] propagates without retry.
pub(crate) async fn guarded_call<T, F, Fut>(
    retry: &RetryConfig,
    deadline: Duration,
    operation_name: &str,
    mut operation: F,
) -> std::result::Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, ProviderError>>,
{
    retry_with_backoff(retry, operation_name, ProviderError::is_transient, || {
        let attempt = operation();
        async move {
            match tokio::time::timeout(deadline, attempt).await {
                Ok(result) => result,
                Err(_) => Err(ProviderError::unavailable(format!(
                    "deadline of {deadline:?} exceeded"
                ))),
            }
        }
    })
    .await
}

/// Errors raised by provider operations
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ProviderError {
    /// The provider cannot be reached, timed out, or crashed
    ///
    /// Transient: eligible for bounded retry with exponential backoff.
    #[error("provider unavailable: {0}")]
    Unavailable(String),

    /// The provider rejected the payload itself
    ///
    /// Fatal for the resource; retrying the same payload cannot succeed.
    #[error("provider rejected request: {0}")]
    Rejected(String),
}

impl ProviderError {
    /// Create a transient unavailability error
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    /// Create a fatal rejection error
    pub fn rejected(msg: impl Into<String>) -> Self {
        Self::Rejected(msg.into())
    }

    /// True if retrying this error can succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Result of a provider diff between prior and desired inputs
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DiffResponse {
    /// Input paths that differ, e.g. `["nodePool.size"]`
    #[serde(default)]
    pub changed_paths: Vec<String>,
    /// True if a changed field is immutable and the resource must be
    /// deleted and recreated
    #[serde(default)]
    pub requires_replace: bool,
}

impl DiffResponse {
    /// True if nothing differs
    pub fn is_unchanged(&self) -> bool {
        self.changed_paths.is_empty() && !self.requires_replace
    }
}

/// Request/response boundary to a resource-type-specific backend
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Compare prior and desired inputs for a resource type
    async fn diff(
        &self,
        resource_type: &str,
        prior_inputs: &Value,
        desired_inputs: &Value,
    ) -> std::result::Result<DiffResponse, ProviderError>;

    /// Create a resource; returns its outputs
    ///
    /// Outputs must include the provider-assigned identity under the
    /// `"id"` field.
    async fn create(
        &self,
        resource_type: &str,
        inputs: &Value,
    ) -> std::result::Result<Value, ProviderError>;

    /// Update a resource in place; returns its new outputs
    async fn update(
        &self,
        resource_type: &str,
        id: &str,
        prior_inputs: &Value,
        desired_inputs: &Value,
    ) -> std::result::Result<Value, ProviderError>;

    /// Delete a resource by identity
    async fn delete(
        &self,
        resource_type: &str,
        id: &str,
    ) -> std::result::Result<(), ProviderError>;
}

/// Per-type behavior configuration
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TypeOptions {
    /// Replace by deleting the old identity before creating the new one
    ///
    /// Some backends refuse two live instances under one logical identity
    /// (unique names, singleton attachments). Default is create-first with
    /// the old identity deleted after dependents have moved over.
    #[serde(default)]
    pub delete_before_create: bool,
}

/// Maps resource types to provider clients and per-type options
///
/// Types are namespaced `provider:module:Kind`; routing is by the leading
/// `provider` segment.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: BTreeMap<String, Arc<dyn ProviderClient>>,
    type_options: BTreeMap<String, TypeOptions>,
}

impl ProviderRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider under a type prefix
    pub fn register(&mut self, prefix: impl Into<String>, client: Arc<dyn ProviderClient>) {
        self.providers.insert(prefix.into(), client);
    }

    /// Set options for a fully qualified resource type
    pub fn set_type_options(&mut self, resource_type: impl Into<String>, options: TypeOptions) {
        self.type_options.insert(resource_type.into(), options);
    }

    /// Resolve the client responsible for a resource type
    pub fn client_for(&self, resource_type: &str) -> Result<Arc<dyn ProviderClient>> {
        let prefix = resource_type.split(':').next().unwrap_or(resource_type);
        self.providers
            .get(prefix)
            .cloned()
            .ok_or_else(|| Error::UnknownProvider(resource_type.to_string()))
    }

    /// Options for a resource type; defaults apply when none were set
    pub fn options_for(&self, resource_type: &str) -> TypeOptions {
        self.type_options
            .get(resource_type)
            .copied()
            .unwrap_or_default()
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.providers.keys().collect::<Vec<_>>())
            .field("type_options", &self.type_options)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_routes_by_prefix() {
        let mut registry = ProviderRegistry::new();
        registry.register("scaleway", Arc::new(MockProviderClient::new()));

        assert!(registry.client_for("scaleway:k8s:Cluster").is_ok());
        assert!(matches!(
            registry.client_for("aws:eks:Cluster"),
            Err(Error::UnknownProvider(_))
        ));
    }

    #[test]
    fn test_type_options_default_to_create_first() {
        let mut registry = ProviderRegistry::new();
        registry.set_type_options(
            "scaleway:k8s:Pool",
            TypeOptions {
                delete_before_create: true,
            },
        );

        assert!(registry.options_for("scaleway:k8s:Pool").delete_before_create);
        assert!(!registry.options_for("scaleway:k8s:Cluster").delete_before_create);
    }

    #[test]
    fn test_transient_classification() {
        assert!(ProviderError::unavailable("timeout").is_transient());
        assert!(!ProviderError::rejected("bad size").is_transient());
    }

    mod guarded {
        use std::sync::atomic::{AtomicU32, Ordering};
        use std::sync::Arc;

        use super::super::*;

        fn fast_retry(max_attempts: u32) -> RetryConfig {
            RetryConfig {
                max_attempts,
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
                backoff_multiplier: 2.0,
            }
        }

        #[tokio::test]
        async fn test_unavailable_retries_up_to_bound() {
            let count = Arc::new(AtomicU32::new(0));
            let c = count.clone();

            let result: std::result::Result<(), ProviderError> =
                guarded_call(&fast_retry(3), Duration::from_secs(1), "create vpc", || {
                    let c = c.clone();
                    async move {
                        c.fetch_add(1, Ordering::SeqCst);
                        Err(ProviderError::unavailable("connection refused"))
                    }
                })
                .await;

            assert!(matches!(result, Err(ProviderError::Unavailable(_))));
            assert_eq!(count.load(Ordering::SeqCst), 3);
        }

        #[tokio::test]
        async fn test_rejected_never_retries() {
            let count = Arc::new(AtomicU32::new(0));
            let c = count.clone();

            let result: std::result::Result<(), ProviderError> =
                guarded_call(&fast_retry(5), Duration::from_secs(1), "create vpc", || {
                    let c = c.clone();
                    async move {
                        c.fetch_add(1, Ordering::SeqCst);
                        Err(ProviderError::rejected("size must be positive"))
                    }
                })
                .await;

            assert!(matches!(result, Err(ProviderError::Rejected(_))));
            assert_eq!(count.load(Ordering::SeqCst), 1);
        }

        #[tokio::test]
        async fn test_deadline_expiry_is_transient() {
            let result: std::result::Result<(), ProviderError> =
                guarded_call(&RetryConfig::none(), Duration::from_millis(10), "create vpc", || {
                    async {
                        tokio::time::sleep(Duration::from_millis(200)).await;
                        Ok(())
                    }
                })
                .await;

            assert!(matches!(result, Err(ProviderError::Unavailable(_))));
        }
    }
}
