//! Trellis - minimal infrastructure-as-code resource-graph engine
//!
//! Trellis turns an ordered set of declarative resource definitions into
//! provider operations: it builds a dependency DAG, diffs desired state
//! against a durable state store, and drives concurrent create/update/
//! delete calls through pluggable provider backends.
//!
//! # Architecture
//!
//! A reconcile pass flows through the components bottom-up:
//!
//! - Declarations become a [`graph::ResourceGraph`]; output references
//!   embedded in inputs are scanned into explicit edges, and cycles are
//!   rejected before any provider traffic.
//! - The [`plan::Planner`] diffs each node against its
//!   [`state::ResourceRecord`] via the owning provider and classifies the
//!   action: create, update, replace, delete, or no-op.
//! - The [`executor::Executor`] walks the graph in dependency order through
//!   a bounded worker pool, committing each success to the state store
//!   under its optimistic-concurrency contract.
//! - The [`reconciler::Reconciler`] orchestrates the pass and aggregates a
//!   [`reconciler::PassReport`].
//!
//! # Modules
//!
//! - [`value`] - Opaque structured payloads, secrets, output references
//! - [`graph`] - Dependency DAG, cycle detection, topological batches
//! - [`state`] - Durable resource records behind a pluggable store contract
//! - [`provider`] - Provider trait, registry, out-of-process plugin client
//! - [`plan`] - Diff-driven plan computation
//! - [`executor`] - Bounded-concurrency plan execution
//! - [`reconciler`] - Apply/destroy pass orchestration
//! - [`retry`] - Exponential backoff with jitter
//! - [`telemetry`] - Tracing subscriber setup
//! - [`error`] - Error types for the engine

#![deny(missing_docs)]

pub mod error;
pub mod executor;
pub mod graph;
pub mod plan;
pub mod provider;
pub mod reconciler;
pub mod retry;
pub mod state;
pub mod telemetry;
pub mod value;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Default Configuration Constants
// =============================================================================

/// Default number of concurrently running resource operations
pub const DEFAULT_CONCURRENCY: usize = 8;

/// Default deadline applied to each provider call attempt
pub const DEFAULT_PROVIDER_DEADLINE: std::time::Duration =
    std::time::Duration::from_secs(60);

/// Default number of attempts for transient provider failures
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Output field carrying the provider-assigned resource identity
pub const OUTPUT_ID_FIELD: &str = "id";
