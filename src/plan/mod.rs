//! Plan computation
//!
//! For every node the planner compares the recorded last-applied inputs (if
//! any) against the declared desired state, using the owning provider's
//! `diff` capability, and classifies the outcome: `Create` when there is no
//! prior record, `NoOp` when nothing differs, `Update` for in-place change,
//! `Replace` when an immutable field changed.
//!
//! Replace expands into two linked steps. With `delete_before_create` set
//! for the type, the old identity is deleted first and the new one created
//! in its place, both before dependents run. Otherwise the new identity is
//! created first and the old one is torn down in the executor's cleanup
//! phase, after every dependent has committed against the new identity.
//!
//! Recorded resources that no longer appear in the declarations are planned
//! for deletion, ordered by their recorded dependencies in reverse.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Serialize;
use tracing::debug;

use crate::graph::{ResourceGraph, ResourceNode};
use crate::provider::{guarded_call, ProviderRegistry};
use crate::retry::RetryConfig;
use crate::state::ResourceRecord;
use crate::value::Value;
use crate::Result;

/// A single provider operation within a node's plan
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanStep {
    /// What to do
    pub action: StepAction,
    /// For delete steps, the recorded identity to delete
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
}

impl PlanStep {
    fn create() -> Self {
        Self {
            action: StepAction::Create,
            resource_id: None,
        }
    }

    fn update() -> Self {
        Self {
            action: StepAction::Update,
            resource_id: None,
        }
    }

    fn delete(id: Option<String>) -> Self {
        Self {
            action: StepAction::Delete,
            resource_id: id,
        }
    }
}

/// Provider operation kind
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum StepAction {
    /// Create a new resource
    Create,
    /// Update the resource in place
    Update,
    /// Delete the resource by identity
    Delete,
}

/// Classification of a node's computed action, with rationale
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum PlanKind {
    /// No prior record; the resource will be created
    Create,
    /// Desired state differs; in-place update suffices
    Update {
        /// Input paths that differ
        changed_paths: Vec<String>,
    },
    /// An immutable field differs; delete-then-create required
    Replace {
        /// Input paths that differ
        changed_paths: Vec<String>,
        /// Whether the old identity goes away before the new one exists
        delete_before_create: bool,
    },
    /// The resource is no longer declared (or this is a destroy pass)
    Delete,
    /// Desired state matches the record
    NoOp,
}

/// One resource's computed action and its execution steps
#[derive(Clone, Debug)]
pub struct NodePlan {
    /// Logical resource name
    pub name: String,
    /// Resource type identifier
    pub type_: String,
    /// Classification with rationale
    pub kind: PlanKind,
    /// Steps the executor performs while the node runs, in order
    pub steps: Vec<PlanStep>,
    /// Delete of a replaced identity, deferred until dependents commit
    pub deferred_delete: Option<PlanStep>,
    /// Record snapshot loaded at plan time, if one existed
    pub prior: Option<ResourceRecord>,
}

/// A full pass plan: per-node actions plus the execution ordering graph
///
/// The graph's edge relation is "must commit before": a node dispatches only
/// after all of its graph dependencies have committed.
#[derive(Debug)]
pub struct Plan {
    /// Per-node plans, keyed by resource name
    pub nodes: BTreeMap<String, NodePlan>,
    /// Execution ordering for this pass
    pub graph: ResourceGraph,
}

impl Plan {
    /// True if no node requires a provider operation
    pub fn is_noop(&self) -> bool {
        self.nodes
            .values()
            .all(|n| matches!(n.kind, PlanKind::NoOp))
    }
}

/// Computes pass plans by diffing desired state against records
pub struct Planner<'a> {
    registry: &'a ProviderRegistry,
    retry: RetryConfig,
    deadline: Duration,
}

impl<'a> Planner<'a> {
    /// Create a planner using the given provider registry and call policy
    pub fn new(registry: &'a ProviderRegistry, retry: RetryConfig, deadline: Duration) -> Self {
        Self {
            registry,
            retry,
            deadline,
        }
    }

    /// Plan an apply pass
    ///
    /// `records` is the full recorded state, keyed by name. Provider
    /// routing is validated for every node before the first diff call, so
    /// an unknown type fails the pass with no provider traffic.
    pub async fn plan_apply(
        &self,
        graph: &ResourceGraph,
        records: &BTreeMap<String, ResourceRecord>,
    ) -> Result<Plan> {
        graph.ensure_acyclic()?;
        for node in graph.nodes() {
            self.registry.client_for(&node.type_)?;
        }

        let recorded_outputs: BTreeMap<String, Value> = records
            .iter()
            .map(|(name, r)| (name.clone(), r.outputs.clone()))
            .collect();

        let mut nodes = BTreeMap::new();
        for node in graph.nodes() {
            let plan = self.plan_node(node, records.get(&node.name), &recorded_outputs).await?;
            debug!(resource = %plan.name, kind = ?plan.kind, "Planned resource");
            nodes.insert(plan.name.clone(), plan);
        }

        // Recorded resources with no declaration are orphans; delete them,
        // dependents before dependencies
        let mut exec_graph = graph.clone();
        let orphans: Vec<&ResourceRecord> = records
            .values()
            .filter(|r| graph.get(&r.name).is_none())
            .collect();
        for record in &orphans {
            exec_graph.add_node(ResourceNode {
                name: record.name.clone(),
                type_: record.type_.clone(),
                inputs: record.inputs.clone(),
                depends_on: Default::default(),
            })?;
            nodes.insert(record.name.clone(), delete_plan(record));
        }
        for record in &orphans {
            for dep in &record.dependencies {
                if records.contains_key(dep) && graph.get(dep).is_none() {
                    // Reversed: the dependency's delete waits for this one
                    exec_graph.add_dependency(dep, &record.name)?;
                }
            }
        }
        exec_graph.ensure_acyclic()?;

        Ok(Plan {
            nodes,
            graph: exec_graph,
        })
    }

    /// Plan a destroy pass: delete every recorded resource
    ///
    /// Ordering comes from the recorded dependencies, reversed, so
    /// dependents are deleted before the resources they depended on.
    pub fn plan_destroy(&self, records: &BTreeMap<String, ResourceRecord>) -> Result<Plan> {
        let mut exec_graph = ResourceGraph::new();
        let mut nodes = BTreeMap::new();
        for record in records.values() {
            exec_graph.add_node(ResourceNode {
                name: record.name.clone(),
                type_: record.type_.clone(),
                inputs: record.inputs.clone(),
                depends_on: Default::default(),
            })?;
            nodes.insert(record.name.clone(), delete_plan(record));
        }
        for record in records.values() {
            for dep in &record.dependencies {
                if records.contains_key(dep) {
                    exec_graph.add_dependency(dep, &record.name)?;
                }
            }
        }
        exec_graph.ensure_acyclic()?;

        Ok(Plan {
            nodes,
            graph: exec_graph,
        })
    }

    async fn plan_node(
        &self,
        node: &ResourceNode,
        prior: Option<&ResourceRecord>,
        recorded_outputs: &BTreeMap<String, Value>,
    ) -> Result<NodePlan> {
        let Some(record) = prior else {
            return Ok(NodePlan {
                name: node.name.clone(),
                type_: node.type_.clone(),
                kind: PlanKind::Create,
                steps: vec![PlanStep::create()],
                deferred_delete: None,
                prior: None,
            });
        };

        let client = self.registry.client_for(&node.type_)?;
        // Best-effort resolution against recorded outputs; references to
        // not-yet-created resources stay in place and read as changes
        let desired = node.inputs.resolve_lenient(recorded_outputs);
        let response = guarded_call(
            &self.retry,
            self.deadline,
            &format!("diff {}", node.name),
            || client.diff(&node.type_, &record.inputs, &desired),
        )
        .await
        .map_err(crate::Error::from)?;

        let old_id = record.id().map(String::from);
        let (kind, steps, deferred_delete) = if response.is_unchanged() {
            (PlanKind::NoOp, Vec::new(), None)
        } else if response.requires_replace {
            let options = self.registry.options_for(&node.type_);
            if options.delete_before_create {
                (
                    PlanKind::Replace {
                        changed_paths: response.changed_paths,
                        delete_before_create: true,
                    },
                    vec![PlanStep::delete(old_id), PlanStep::create()],
                    None,
                )
            } else {
                (
                    PlanKind::Replace {
                        changed_paths: response.changed_paths,
                        delete_before_create: false,
                    },
                    vec![PlanStep::create()],
                    Some(PlanStep::delete(old_id)),
                )
            }
        } else {
            (
                PlanKind::Update {
                    changed_paths: response.changed_paths,
                },
                vec![PlanStep::update()],
                None,
            )
        };

        Ok(NodePlan {
            name: node.name.clone(),
            type_: node.type_.clone(),
            kind,
            steps,
            deferred_delete,
            prior: Some(record.clone()),
        })
    }
}

fn delete_plan(record: &ResourceRecord) -> NodePlan {
    NodePlan {
        name: record.name.clone(),
        type_: record.type_.clone(),
        kind: PlanKind::Delete,
        steps: vec![PlanStep::delete(record.id().map(String::from))],
        deferred_delete: None,
        prior: Some(record.clone()),
    }
}
