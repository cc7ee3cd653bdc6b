//! Pass orchestration
//!
//! One reconcile pass: load recorded state, build the resource graph from
//! declarations, compute the plan (cycle detection happens before any
//! provider traffic), drive the executor, and aggregate a report. Destroy
//! passes walk the recorded graph in reverse, deleting dependents before
//! the resources they depended on.
//!
//! Partial success is a normal outcome: the report lists every node's
//! terminal status, and everything that committed stays committed even when
//! the pass as a whole fails.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::executor::{Executor, ExecutorConfig, NodeOutcome};
use crate::graph::{ResourceDeclaration, ResourceGraph};
use crate::plan::Planner;
use crate::provider::ProviderRegistry;
use crate::state::{ResourceRecord, StateStore};
use crate::value::Value;
use crate::Result;

/// One failed node and why
#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeFailure {
    /// Resource name
    pub name: String,
    /// Terminal error message
    pub error: String,
}

/// Summary of one reconcile pass
///
/// Every node appears in exactly one list. Rendering via `Display` shows
/// counts only; secret output values stay redacted through their own
/// `Display`.
#[derive(Clone, Debug, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PassReport {
    /// Resources created this pass
    pub created: Vec<String>,
    /// Resources updated in place
    pub updated: Vec<String>,
    /// Resources deleted
    pub deleted: Vec<String>,
    /// Resources replaced with a new identity
    pub replaced: Vec<String>,
    /// Resources already matching their desired state
    pub noop: Vec<String>,
    /// Resources whose operation failed
    pub failed: Vec<NodeFailure>,
    /// Resources never attempted
    pub skipped: Vec<String>,
    /// Resolved stack exports
    pub outputs: BTreeMap<String, Value>,
}

impl PassReport {
    /// True if every attempted node committed
    pub fn succeeded(&self) -> bool {
        self.failed.is_empty()
    }

    /// Total number of nodes accounted for
    pub fn len(&self) -> usize {
        self.created.len()
            + self.updated.len()
            + self.deleted.len()
            + self.replaced.len()
            + self.noop.len()
            + self.failed.len()
            + self.skipped.len()
    }

    /// True if the pass touched no nodes
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Display for PassReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "created={} updated={} deleted={} replaced={} noop={} failed={} skipped={}",
            self.created.len(),
            self.updated.len(),
            self.deleted.len(),
            self.replaced.len(),
            self.noop.len(),
            self.failed.len(),
            self.skipped.len()
        )
    }
}

/// Drives full apply/destroy passes
pub struct Reconciler {
    store: Arc<dyn StateStore>,
    registry: Arc<ProviderRegistry>,
    config: ExecutorConfig,
}

impl Reconciler {
    /// Create a reconciler over a state store and provider registry
    pub fn new(store: Arc<dyn StateStore>, registry: Arc<ProviderRegistry>) -> Self {
        Self {
            store,
            registry,
            config: ExecutorConfig::default(),
        }
    }

    /// Override the execution configuration
    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    /// Run one apply pass
    ///
    /// `exports` are named values, possibly embedding output references,
    /// resolved against committed state after execution and returned in the
    /// report. The cancellation signal is observed between dispatch
    /// decisions; in-flight provider calls always finish.
    #[instrument(skip_all, fields(resources = declarations.len()))]
    pub async fn apply(
        &self,
        declarations: &[ResourceDeclaration],
        exports: &BTreeMap<String, Value>,
        cancel: CancellationToken,
    ) -> Result<PassReport> {
        let records = self.load_records().await?;
        let graph = ResourceGraph::from_declarations(declarations)?;
        graph.ensure_acyclic()?;

        let planner = Planner::new(
            &self.registry,
            self.config.retry.clone(),
            self.config.provider_deadline,
        );
        let plan = planner.plan_apply(&graph, &records).await?;
        info!(nodes = plan.nodes.len(), "Plan computed");

        let outcomes = Executor::new(self.config.clone())
            .execute(plan, Arc::clone(&self.registry), Arc::clone(&self.store), cancel)
            .await?;

        let mut report = build_report(outcomes);
        report.outputs = self.resolve_exports(exports, &records, &report).await?;
        info!(%report, "Apply pass finished");
        Ok(report)
    }

    /// Run one destroy pass: delete every recorded resource
    #[instrument(skip_all)]
    pub async fn destroy(&self, cancel: CancellationToken) -> Result<PassReport> {
        let records = self.load_records().await?;
        let planner = Planner::new(
            &self.registry,
            self.config.retry.clone(),
            self.config.provider_deadline,
        );
        let plan = planner.plan_destroy(&records)?;
        info!(nodes = plan.nodes.len(), "Destroy plan computed");

        let outcomes = Executor::new(self.config.clone())
            .execute(plan, Arc::clone(&self.registry), Arc::clone(&self.store), cancel)
            .await?;

        let report = build_report(outcomes);
        info!(%report, "Destroy pass finished");
        Ok(report)
    }

    async fn load_records(&self) -> Result<BTreeMap<String, ResourceRecord>> {
        Ok(self
            .store
            .list()
            .await?
            .into_iter()
            .map(|r| (r.name.clone(), r))
            .collect())
    }

    /// Resolve export values against post-pass state
    ///
    /// Exports referencing failed or skipped resources are dropped with a
    /// warning rather than failing the pass.
    async fn resolve_exports(
        &self,
        exports: &BTreeMap<String, Value>,
        prior_records: &BTreeMap<String, ResourceRecord>,
        report: &PassReport,
    ) -> Result<BTreeMap<String, Value>> {
        if exports.is_empty() {
            return Ok(BTreeMap::new());
        }
        // Prior outputs overlaid with everything this pass committed
        let mut outputs: BTreeMap<String, Value> = prior_records
            .iter()
            .map(|(name, r)| (name.clone(), r.outputs.clone()))
            .collect();
        for record in self.store.list().await? {
            outputs.insert(record.name.clone(), record.outputs);
        }
        for name in &report.deleted {
            outputs.remove(name);
        }

        let mut resolved = BTreeMap::new();
        for (name, value) in exports {
            match value.resolve(&outputs) {
                Ok(v) => {
                    resolved.insert(name.clone(), v);
                }
                Err(e) => {
                    warn!(export = %name, error = %e, "Export not resolvable this pass");
                }
            }
        }
        Ok(resolved)
    }
}

fn build_report(outcomes: BTreeMap<String, NodeOutcome>) -> PassReport {
    let mut report = PassReport::default();
    for (name, outcome) in outcomes {
        match outcome {
            NodeOutcome::Created { .. } => report.created.push(name),
            NodeOutcome::Updated { .. } => report.updated.push(name),
            NodeOutcome::Replaced { .. } => report.replaced.push(name),
            NodeOutcome::Deleted => report.deleted.push(name),
            NodeOutcome::NoOp { .. } => report.noop.push(name),
            NodeOutcome::Failed { error } => report.failed.push(NodeFailure { name, error }),
            NodeOutcome::Skipped => report.skipped.push(name),
        }
    }
    report
}
