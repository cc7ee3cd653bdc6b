//! Concurrent plan execution
//!
//! Drives a pass plan through a bounded worker pool. Every node moves
//! through a small state machine:
//!
//! ```text
//! Pending -> Ready -> Running -> Committed
//!                             -> Failed
//! Pending/Ready -> Skipped          (dependency failed, or cancelled)
//! ```
//!
//! A node becomes `Ready` only when every dependency has committed, so
//! dependency ordering needs no locks; it falls out of the dispatch rule.
//! Output references in the node's inputs are resolved against committed
//! outputs immediately before dispatch.
//!
//! Failures stay local: the failed node's transitive dependents are marked
//! `Skipped` and never attempted, while unrelated subgraphs keep executing.
//! Cancellation is observed between dispatch decisions; in-flight provider
//! calls always run to completion so no resource is left half-made.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::plan::{NodePlan, Plan, PlanKind, StepAction};
use crate::provider::{guarded_call, ProviderClient, ProviderRegistry};
use crate::retry::RetryConfig;
use crate::state::{ResourceRecord, StateStore, StoreError};
use crate::value::Value;
use crate::{Error, Result};

/// Executor tuning knobs
#[derive(Clone, Debug)]
pub struct ExecutorConfig {
    /// Maximum number of concurrently running nodes
    pub concurrency: usize,
    /// Deadline applied to every provider call attempt
    pub provider_deadline: Duration,
    /// Retry policy for transient provider failures
    pub retry: RetryConfig,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            concurrency: crate::DEFAULT_CONCURRENCY,
            provider_deadline: crate::DEFAULT_PROVIDER_DEADLINE,
            retry: RetryConfig::default(),
        }
    }
}

/// Terminal outcome of one node in a pass
#[derive(Clone, Debug, PartialEq)]
pub enum NodeOutcome {
    /// Resource was created
    Created {
        /// Provider-observed outputs
        outputs: Value,
    },
    /// Resource was updated in place
    Updated {
        /// Provider-observed outputs
        outputs: Value,
    },
    /// Resource was replaced with a new identity
    Replaced {
        /// Provider-observed outputs of the new identity
        outputs: Value,
    },
    /// Resource was deleted
    Deleted,
    /// Desired state already matched the record
    NoOp {
        /// Recorded outputs, unchanged
        outputs: Value,
    },
    /// The node's operation failed
    Failed {
        /// Why
        error: String,
    },
    /// Never attempted: a dependency failed, or the pass was cancelled
    Skipped,
}

impl NodeOutcome {
    /// Committed outputs carried by this outcome, if any
    pub fn outputs(&self) -> Option<&Value> {
        match self {
            Self::Created { outputs }
            | Self::Updated { outputs }
            | Self::Replaced { outputs }
            | Self::NoOp { outputs } => Some(outputs),
            _ => None,
        }
    }
}

/// Per-node scheduling state
#[derive(Clone, Debug, PartialEq)]
enum NodeState {
    Pending,
    Ready,
    Running,
    Committed,
    Failed,
    Skipped,
}

/// Why a node's task ended unsuccessfully
enum TaskFailure {
    /// Local to the node; dependents are skipped, siblings continue
    Node(String),
    /// State storage is gone; the whole pass must stop
    Fatal(String),
}

struct TaskSuccess {
    outcome: NodeOutcome,
}

type TaskResult = (String, std::result::Result<TaskSuccess, TaskFailure>);

/// Walks a plan in dependency order through a bounded worker pool
pub struct Executor {
    config: ExecutorConfig,
}

impl Executor {
    /// Create an executor with the given configuration
    pub fn new(config: ExecutorConfig) -> Self {
        Self { config }
    }

    /// Execute a plan and return every node's terminal outcome
    ///
    /// Returns `Err` only for pass-fatal conditions (state storage
    /// unavailable); per-node failures are reported in the outcome map.
    pub async fn execute(
        &self,
        plan: Plan,
        registry: Arc<ProviderRegistry>,
        store: Arc<dyn StateStore>,
        cancel: CancellationToken,
    ) -> Result<BTreeMap<String, NodeOutcome>> {
        let limit = self.config.concurrency.max(1);
        let graph = plan.graph.clone();

        let mut states: BTreeMap<String, NodeState> = plan
            .nodes
            .keys()
            .map(|name| (name.clone(), NodeState::Pending))
            .collect();
        let mut outcomes: BTreeMap<String, NodeOutcome> = BTreeMap::new();
        let mut committed_outputs: BTreeMap<String, Value> = BTreeMap::new();
        let mut deferred: Vec<(String, String, String)> = Vec::new(); // (name, type, old id)
        let mut fatal: Option<String> = None;

        let mut tasks: JoinSet<TaskResult> = JoinSet::new();
        let mut task_names: HashMap<tokio::task::Id, String> = HashMap::new();

        loop {
            // Promote nodes whose dependencies have all committed; NoOp
            // nodes commit on the spot, which can cascade
            loop {
                let mut progressed = false;
                let promotable: Vec<String> = states
                    .iter()
                    .filter(|(name, state)| {
                        **state == NodeState::Pending
                            && graph
                                .get(name)
                                .map(|n| {
                                    n.depends_on
                                        .iter()
                                        .all(|d| states.get(d) == Some(&NodeState::Committed))
                                })
                                .unwrap_or(true)
                    })
                    .map(|(name, _)| name.clone())
                    .collect();
                for name in promotable {
                    progressed = true;
                    if matches!(plan.nodes[&name].kind, PlanKind::NoOp) {
                        let outputs = plan.nodes[&name]
                            .prior
                            .as_ref()
                            .map(|r| r.outputs.clone())
                            .unwrap_or_default();
                        debug!(resource = %name, "No changes");
                        states.insert(name.clone(), NodeState::Committed);
                        committed_outputs.insert(name.clone(), outputs.clone());
                        outcomes.insert(name, NodeOutcome::NoOp { outputs });
                    } else {
                        states.insert(name, NodeState::Ready);
                    }
                }
                if !progressed {
                    break;
                }
            }

            // Dispatch ready nodes, bounded by the pool size; nothing new
            // dispatches once cancellation is observed
            if fatal.is_none() && !cancel.is_cancelled() {
                let ready: Vec<String> = states
                    .iter()
                    .filter(|(_, s)| **s == NodeState::Ready)
                    .map(|(name, _)| name.clone())
                    .collect();
                for name in ready {
                    if tasks.len() >= limit {
                        break;
                    }
                    let Some(node_plan) = plan.nodes.get(&name).cloned() else {
                        continue;
                    };

                    // Strict resolution against committed outputs; every
                    // dependency has committed by the Ready rule
                    let desired = if node_plan
                        .steps
                        .iter()
                        .any(|s| s.action != StepAction::Delete)
                    {
                        let declared = graph
                            .get(&name)
                            .map(|n| n.inputs.clone())
                            .unwrap_or_default();
                        match declared.resolve(&committed_outputs) {
                            Ok(v) => Some(v),
                            Err(e) => {
                                warn!(resource = %name, error = %e, "Reference resolution failed");
                                states.insert(name.clone(), NodeState::Failed);
                                outcomes.insert(
                                    name.clone(),
                                    NodeOutcome::Failed {
                                        error: e.to_string(),
                                    },
                                );
                                skip_dependents(&graph, &name, &mut states, &mut outcomes);
                                continue;
                            }
                        }
                    } else {
                        None
                    };

                    let client = match registry.client_for(&node_plan.type_) {
                        Ok(c) => c,
                        Err(e) => {
                            states.insert(name.clone(), NodeState::Failed);
                            outcomes.insert(
                                name.clone(),
                                NodeOutcome::Failed {
                                    error: e.to_string(),
                                },
                            );
                            skip_dependents(&graph, &name, &mut states, &mut outcomes);
                            continue;
                        }
                    };

                    states.insert(name.clone(), NodeState::Running);
                    let dependencies: Vec<String> = graph
                        .get(&name)
                        .map(|n| n.depends_on.iter().cloned().collect())
                        .unwrap_or_default();
                    let retry = self.config.retry.clone();
                    let deadline = self.config.provider_deadline;
                    let store = Arc::clone(&store);
                    let task_name = name.clone();
                    let handle = tasks.spawn(async move {
                        let result = run_node(
                            node_plan,
                            desired,
                            dependencies,
                            client,
                            store,
                            &retry,
                            deadline,
                        )
                        .await;
                        (task_name, result)
                    });
                    task_names.insert(handle.id(), name);
                }
            }

            if tasks.is_empty() {
                break;
            }

            match tasks.join_next_with_id().await {
                Some(Ok((id, (name, result)))) => {
                    task_names.remove(&id);
                    match result {
                        Ok(success) => {
                            if let Some(outputs) = success.outcome.outputs() {
                                committed_outputs.insert(name.clone(), outputs.clone());
                            }
                            if let Some(step) = plan
                                .nodes
                                .get(&name)
                                .and_then(|n| n.deferred_delete.as_ref())
                            {
                                if let Some(old_id) = &step.resource_id {
                                    deferred.push((
                                        name.clone(),
                                        plan.nodes[&name].type_.clone(),
                                        old_id.clone(),
                                    ));
                                }
                            }
                            states.insert(name.clone(), NodeState::Committed);
                            outcomes.insert(name, success.outcome);
                        }
                        Err(TaskFailure::Node(error)) => {
                            warn!(resource = %name, error = %error, "Resource operation failed");
                            states.insert(name.clone(), NodeState::Failed);
                            outcomes.insert(name.clone(), NodeOutcome::Failed { error });
                            skip_dependents(&graph, &name, &mut states, &mut outcomes);
                        }
                        Err(TaskFailure::Fatal(error)) => {
                            warn!(resource = %name, error = %error, "State storage lost; stopping pass");
                            states.insert(name.clone(), NodeState::Failed);
                            outcomes.insert(
                                name.clone(),
                                NodeOutcome::Failed {
                                    error: error.clone(),
                                },
                            );
                            fatal = Some(error);
                        }
                    }
                }
                Some(Err(join_err)) => {
                    let name = task_names
                        .remove(&join_err.id())
                        .unwrap_or_else(|| "<unknown>".to_string());
                    warn!(resource = %name, error = %join_err, "Resource task aborted");
                    states.insert(name.clone(), NodeState::Failed);
                    outcomes.insert(
                        name.clone(),
                        NodeOutcome::Failed {
                            error: join_err.to_string(),
                        },
                    );
                    skip_dependents(&graph, &name, &mut states, &mut outcomes);
                }
                None => break,
            }
        }

        // Whatever never dispatched is skipped: blocked behind a failure or
        // cut off by cancellation
        for (name, state) in &mut states {
            if matches!(state, NodeState::Pending | NodeState::Ready) {
                *state = NodeState::Skipped;
                outcomes.insert(name.clone(), NodeOutcome::Skipped);
            }
        }

        if let Some(error) = fatal {
            return Err(Error::Store(StoreError::Unavailable(error)));
        }

        // Cleanup: tear down identities replaced create-first, now that
        // their dependents point at the replacements. Skipped entirely on
        // cancellation, since no new dispatch happens after the signal.
        if !cancel.is_cancelled() {
            for (name, type_, old_id) in deferred {
                let all_dependents_committed = graph
                    .dependents_of(&name)
                    .iter()
                    .all(|d| states.get(d) == Some(&NodeState::Committed));
                if !all_dependents_committed {
                    warn!(
                        resource = %name,
                        old_id = %old_id,
                        "Dependents did not all commit; leaving replaced identity in place"
                    );
                    continue;
                }
                let client = match registry.client_for(&type_) {
                    Ok(c) => c,
                    Err(e) => {
                        warn!(resource = %name, error = %e, "No provider for replaced identity");
                        continue;
                    }
                };
                info!(resource = %name, old_id = %old_id, "Deleting replaced identity");
                let result = guarded_call(
                    &self.config.retry,
                    self.config.provider_deadline,
                    &format!("delete replaced {name}"),
                    || client.delete(&type_, &old_id),
                )
                .await;
                if let Err(e) = result {
                    warn!(resource = %name, old_id = %old_id, error = %e, "Replaced identity not deleted");
                    outcomes.insert(
                        name.clone(),
                        NodeOutcome::Failed {
                            error: format!("replacement cleanup failed: {e}"),
                        },
                    );
                }
            }
        } else {
            for (name, _, old_id) in &deferred {
                warn!(
                    resource = %name,
                    old_id = %old_id,
                    "Cancelled before replaced identity cleanup"
                );
            }
        }

        Ok(outcomes)
    }
}

/// Mark every transitive dependent that has not started as skipped
fn skip_dependents(
    graph: &crate::graph::ResourceGraph,
    name: &str,
    states: &mut BTreeMap<String, NodeState>,
    outcomes: &mut BTreeMap<String, NodeOutcome>,
) {
    let mut frontier = vec![name.to_string()];
    while let Some(current) = frontier.pop() {
        for dependent in graph.dependents_of(&current) {
            if matches!(
                states.get(&dependent),
                Some(NodeState::Pending | NodeState::Ready)
            ) {
                debug!(resource = %dependent, failed_dependency = %current, "Skipping dependent");
                states.insert(dependent.clone(), NodeState::Skipped);
                outcomes.insert(dependent.clone(), NodeOutcome::Skipped);
                frontier.push(dependent);
            }
        }
    }
}

/// Execute one node's plan steps in order and commit the result
async fn run_node(
    plan: NodePlan,
    desired: Option<Value>,
    dependencies: Vec<String>,
    client: Arc<dyn ProviderClient>,
    store: Arc<dyn StateStore>,
    retry: &RetryConfig,
    deadline: Duration,
) -> std::result::Result<TaskSuccess, TaskFailure> {
    let name = plan.name.clone();
    // Serial the record write will assert against; cleared when a
    // delete-first step removes the prior record
    let mut expected_serial = plan.prior.as_ref().map(|r| r.serial);
    let mut outputs: Option<Value> = None;

    for step in &plan.steps {
        match step.action {
            StepAction::Delete => {
                if let Some(id) = &step.resource_id {
                    info!(resource = %name, id = %id, "Deleting");
                    guarded_call(retry, deadline, &format!("delete {name}"), || {
                        client.delete(&plan.type_, id)
                    })
                    .await
                    .map_err(|e| TaskFailure::Node(e.to_string()))?;
                } else {
                    // Recorded without an identity: nothing exists to
                    // delete on the provider side
                    warn!(resource = %name, "Record has no identity; dropping state only");
                }
                store
                    .delete(&name)
                    .await
                    .map_err(|e| TaskFailure::Fatal(e.to_string()))?;
                expected_serial = None;
            }
            StepAction::Create => {
                let inputs = desired
                    .clone()
                    .ok_or_else(|| TaskFailure::Node("missing resolved inputs".to_string()))?;
                info!(resource = %name, type_ = %plan.type_, "Creating");
                let observed = guarded_call(retry, deadline, &format!("create {name}"), || {
                    client.create(&plan.type_, &inputs)
                })
                .await
                .map_err(|e| TaskFailure::Node(e.to_string()))?;
                commit_record(
                    &*store,
                    ResourceRecord {
                        name: name.clone(),
                        type_: plan.type_.clone(),
                        serial: expected_serial.map_or(1, |s| s + 1),
                        inputs,
                        outputs: observed.clone(),
                        dependencies: dependencies.clone(),
                    },
                    expected_serial,
                )
                .await?;
                outputs = Some(observed);
            }
            StepAction::Update => {
                let inputs = desired
                    .clone()
                    .ok_or_else(|| TaskFailure::Node("missing resolved inputs".to_string()))?;
                let prior = plan
                    .prior
                    .as_ref()
                    .ok_or_else(|| TaskFailure::Node("update without a record".to_string()))?;
                let id = prior
                    .id()
                    .ok_or_else(|| {
                        TaskFailure::Node("record carries no identity output".to_string())
                    })?
                    .to_string();
                info!(resource = %name, id = %id, "Updating");
                let observed = guarded_call(retry, deadline, &format!("update {name}"), || {
                    client.update(&plan.type_, &id, &prior.inputs, &inputs)
                })
                .await
                .map_err(|e| TaskFailure::Node(e.to_string()))?;
                commit_record(
                    &*store,
                    ResourceRecord {
                        name: name.clone(),
                        type_: plan.type_.clone(),
                        serial: expected_serial.map_or(1, |s| s + 1),
                        inputs,
                        outputs: observed.clone(),
                        dependencies: dependencies.clone(),
                    },
                    expected_serial,
                )
                .await?;
                outputs = Some(observed);
            }
        }
    }

    let outcome = match plan.kind {
        PlanKind::Create => NodeOutcome::Created {
            outputs: outputs.unwrap_or_default(),
        },
        PlanKind::Update { .. } => NodeOutcome::Updated {
            outputs: outputs.unwrap_or_default(),
        },
        PlanKind::Replace { .. } => NodeOutcome::Replaced {
            outputs: outputs.unwrap_or_default(),
        },
        PlanKind::Delete => NodeOutcome::Deleted,
        PlanKind::NoOp => NodeOutcome::NoOp {
            outputs: outputs.unwrap_or_default(),
        },
    };
    Ok(TaskSuccess { outcome })
}

/// Write a record under the optimistic-concurrency contract
///
/// A stale write means another pass committed between our read and this
/// write; re-read once and retry against the fresh serial. A second stale
/// failure fails the node.
async fn commit_record(
    store: &dyn StateStore,
    mut record: ResourceRecord,
    expected_serial: Option<u64>,
) -> std::result::Result<(), TaskFailure> {
    match store.put(record.clone(), expected_serial).await {
        Ok(()) => Ok(()),
        Err(StoreError::StaleWrite { .. }) => {
            warn!(resource = %record.name, "Stale state write; re-reading record");
            let fresh = store
                .get(&record.name)
                .await
                .map_err(|e| TaskFailure::Fatal(e.to_string()))?;
            let expected = fresh.map(|r| r.serial);
            record.serial = expected.map_or(1, |s| s + 1);
            match store.put(record, expected).await {
                Ok(()) => Ok(()),
                Err(e @ StoreError::StaleWrite { .. }) => Err(TaskFailure::Node(e.to_string())),
                Err(StoreError::Unavailable(msg)) => Err(TaskFailure::Fatal(msg)),
                Err(e) => Err(TaskFailure::Node(e.to_string())),
            }
        }
        Err(StoreError::Unavailable(msg)) => Err(TaskFailure::Fatal(msg)),
        Err(e) => Err(TaskFailure::Node(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::graph::{ResourceDeclaration, ResourceGraph};
    use crate::plan::{PlanStep, Planner};
    use crate::provider::{DiffResponse, ProviderError};
    use crate::state::MemoryStore;

    /// Scripted in-process provider. Behavior is driven by marker fields in
    /// the resource inputs: `failCreate` rejects the create, `delayMs`
    /// sleeps before responding. Every call is appended to a log.
    #[derive(Default)]
    struct FakeProvider {
        calls: Mutex<Vec<String>>,
    }

    impl FakeProvider {
        fn log(&self, entry: String) {
            self.calls.lock().unwrap().push(entry);
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        async fn obey_delay(&self, inputs: &Value) {
            if let Some(Value::Number(ms)) = inputs.get("delayMs") {
                if let Some(ms) = ms.as_u64() {
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                }
            }
        }
    }

    #[async_trait]
    impl ProviderClient for FakeProvider {
        async fn diff(
            &self,
            _resource_type: &str,
            prior_inputs: &Value,
            desired_inputs: &Value,
        ) -> std::result::Result<DiffResponse, ProviderError> {
            self.log("diff".to_string());
            if prior_inputs == desired_inputs {
                Ok(DiffResponse::default())
            } else {
                Ok(DiffResponse {
                    changed_paths: vec!["inputs".to_string()],
                    requires_replace: false,
                })
            }
        }

        async fn create(
            &self,
            _resource_type: &str,
            inputs: &Value,
        ) -> std::result::Result<Value, ProviderError> {
            self.obey_delay(inputs).await;
            if inputs.get("failCreate").and_then(Value::as_bool) == Some(true) {
                self.log("create!failed".to_string());
                return Err(ProviderError::rejected("scripted create failure"));
            }
            let name = inputs
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or("unnamed")
                .to_string();
            self.log(format!("create {name}"));
            Ok(Value::map([("id", Value::string(format!("{name}-id")))]))
        }

        async fn update(
            &self,
            _resource_type: &str,
            id: &str,
            _prior_inputs: &Value,
            desired_inputs: &Value,
        ) -> std::result::Result<Value, ProviderError> {
            self.obey_delay(desired_inputs).await;
            self.log(format!("update {id}"));
            Ok(Value::map([("id", Value::string(id))]))
        }

        async fn delete(
            &self,
            _resource_type: &str,
            id: &str,
        ) -> std::result::Result<(), ProviderError> {
            self.log(format!("delete {id}"));
            Ok(())
        }
    }

    fn registry(provider: &Arc<FakeProvider>) -> Arc<ProviderRegistry> {
        let mut registry = ProviderRegistry::new();
        registry.register("test", Arc::clone(provider) as Arc<dyn ProviderClient>);
        Arc::new(registry)
    }

    fn executor() -> Executor {
        Executor::new(ExecutorConfig {
            concurrency: 4,
            provider_deadline: Duration::from_secs(5),
            retry: RetryConfig::none(),
        })
    }

    fn decl(name: &str, inputs: Value, deps: &[&str]) -> ResourceDeclaration {
        ResourceDeclaration::new(name, "test:mod:Thing", inputs)
            .with_depends_on(deps.iter().copied())
    }

    async fn plan_for(
        registry: &ProviderRegistry,
        declarations: &[ResourceDeclaration],
    ) -> Plan {
        let graph = ResourceGraph::from_declarations(declarations).unwrap();
        Planner::new(registry, RetryConfig::none(), Duration::from_secs(5))
            .plan_apply(&graph, &BTreeMap::new())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_failure_skips_transitive_dependents() {
        let provider = Arc::new(FakeProvider::default());
        let registry = registry(&provider);
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());

        // a -> b -> c, a's create fails
        let plan = plan_for(
            &registry,
            &[
                decl(
                    "a",
                    Value::map([("name", Value::string("a")), ("failCreate", Value::from(true))]),
                    &[],
                ),
                decl("b", Value::map([("name", Value::string("b"))]), &["a"]),
                decl("c", Value::map([("name", Value::string("c"))]), &["b"]),
            ],
        )
        .await;

        let outcomes = executor()
            .execute(plan, registry, store.clone(), CancellationToken::new())
            .await
            .unwrap();

        assert!(matches!(outcomes["a"], NodeOutcome::Failed { .. }));
        assert_eq!(outcomes["b"], NodeOutcome::Skipped);
        assert_eq!(outcomes["c"], NodeOutcome::Skipped);
        // b and c never reached the provider
        assert_eq!(provider.calls(), vec!["create!failed"]);
        // Nothing was recorded
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_independent_branch_survives_failure() {
        let provider = Arc::new(FakeProvider::default());
        let registry = registry(&provider);
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());

        let plan = plan_for(
            &registry,
            &[
                decl(
                    "x",
                    Value::map([("name", Value::string("x")), ("failCreate", Value::from(true))]),
                    &[],
                ),
                decl("y", Value::map([("name", Value::string("y"))]), &[]),
            ],
        )
        .await;

        let outcomes = executor()
            .execute(plan, registry, store.clone(), CancellationToken::new())
            .await
            .unwrap();

        assert!(matches!(outcomes["x"], NodeOutcome::Failed { .. }));
        assert!(matches!(outcomes["y"], NodeOutcome::Created { .. }));
        assert!(store.get("y").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_outputs_flow_to_dependents() {
        let provider = Arc::new(FakeProvider::default());
        let registry = registry(&provider);
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());

        let plan = plan_for(
            &registry,
            &[
                decl("cluster", Value::map([("name", Value::string("cluster"))]), &[]),
                decl(
                    "pool",
                    Value::map([
                        ("name", Value::string("pool")),
                        ("clusterId", Value::reference("cluster", "id")),
                    ]),
                    &[],
                ),
            ],
        )
        .await;

        let outcomes = executor()
            .execute(plan, registry, store.clone(), CancellationToken::new())
            .await
            .unwrap();

        assert!(matches!(outcomes["pool"], NodeOutcome::Created { .. }));
        let pool = store.get("pool").await.unwrap().unwrap();
        assert_eq!(
            pool.inputs.get("clusterId"),
            Some(&Value::string("cluster-id"))
        );
        assert!(pool.dependencies.contains(&"cluster".to_string()));
    }

    #[tokio::test]
    async fn test_pre_cancelled_pass_dispatches_nothing() {
        let provider = Arc::new(FakeProvider::default());
        let registry = registry(&provider);
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());

        let plan = plan_for(
            &registry,
            &[decl("a", Value::map([("name", Value::string("a"))]), &[])],
        )
        .await;

        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcomes = executor()
            .execute(plan, registry, store, cancel)
            .await
            .unwrap();

        assert_eq!(outcomes["a"], NodeOutcome::Skipped);
        assert!(provider.calls().is_empty());
    }

    #[tokio::test]
    async fn test_cancellation_lets_in_flight_finish() {
        let provider = Arc::new(FakeProvider::default());
        let registry = registry(&provider);
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());

        // One slot: slow dispatches first, blocked waits behind it
        let plan = plan_for(
            &registry,
            &[
                decl(
                    "slow",
                    Value::map([
                        ("name", Value::string("slow")),
                        ("delayMs", Value::from(80i64)),
                    ]),
                    &[],
                ),
                decl("starved", Value::map([("name", Value::string("starved"))]), &[]),
            ],
        )
        .await;

        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let outcomes = Executor::new(ExecutorConfig {
            concurrency: 1,
            provider_deadline: Duration::from_secs(5),
            retry: RetryConfig::none(),
        })
        .execute(plan, registry, store.clone(), cancel)
        .await
        .unwrap();

        // In-flight create ran to completion and committed
        assert!(matches!(outcomes["slow"], NodeOutcome::Created { .. }));
        assert!(store.get("slow").await.unwrap().is_some());
        // The queued node never dispatched
        assert_eq!(outcomes["starved"], NodeOutcome::Skipped);
        assert_eq!(provider.calls(), vec!["create slow"]);
    }

    #[tokio::test]
    async fn test_deferred_replace_delete_runs_after_dependents() {
        let provider = Arc::new(FakeProvider::default());
        let registry = registry(&provider);
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());

        // Hand-built plan: cluster is replaced create-first, pool updates
        // against it afterwards
        let mut graph = ResourceGraph::from_declarations(&[
            decl("cluster", Value::map([("name", Value::string("cluster"))]), &[]),
            decl("pool", Value::map([("name", Value::string("pool"))]), &["cluster"]),
        ])
        .unwrap();
        graph.ensure_acyclic().unwrap();

        let cluster_record = ResourceRecord {
            name: "cluster".to_string(),
            type_: "test:mod:Thing".to_string(),
            serial: 3,
            inputs: Value::map([("name", Value::string("old-cluster"))]),
            outputs: Value::map([("id", Value::string("old-cluster-id"))]),
            dependencies: vec![],
        };
        let pool_record = ResourceRecord {
            name: "pool".to_string(),
            type_: "test:mod:Thing".to_string(),
            serial: 1,
            inputs: Value::map([("name", Value::string("old-pool"))]),
            outputs: Value::map([("id", Value::string("pool-id"))]),
            dependencies: vec!["cluster".to_string()],
        };
        let store_setup = store.clone();
        store_setup.put(cluster_record.clone(), None).await.unwrap();
        store_setup.put(pool_record.clone(), None).await.unwrap();

        let mut nodes = BTreeMap::new();
        nodes.insert(
            "cluster".to_string(),
            NodePlan {
                name: "cluster".to_string(),
                type_: "test:mod:Thing".to_string(),
                kind: PlanKind::Replace {
                    changed_paths: vec!["name".to_string()],
                    delete_before_create: false,
                },
                steps: vec![PlanStep {
                    action: StepAction::Create,
                    resource_id: None,
                }],
                deferred_delete: Some(PlanStep {
                    action: StepAction::Delete,
                    resource_id: Some("old-cluster-id".to_string()),
                }),
                prior: Some(cluster_record),
            },
        );
        nodes.insert(
            "pool".to_string(),
            NodePlan {
                name: "pool".to_string(),
                type_: "test:mod:Thing".to_string(),
                kind: PlanKind::Update {
                    changed_paths: vec!["name".to_string()],
                },
                steps: vec![PlanStep {
                    action: StepAction::Update,
                    resource_id: None,
                }],
                deferred_delete: None,
                prior: Some(pool_record),
            },
        );

        let outcomes = executor()
            .execute(Plan { nodes, graph }, registry, store.clone(), CancellationToken::new())
            .await
            .unwrap();

        assert!(matches!(outcomes["cluster"], NodeOutcome::Replaced { .. }));
        assert!(matches!(outcomes["pool"], NodeOutcome::Updated { .. }));
        assert_eq!(
            provider.calls(),
            vec!["create cluster", "update pool-id", "delete old-cluster-id"]
        );
        // New identity recorded with an advanced serial
        assert_eq!(store.get("cluster").await.unwrap().unwrap().serial, 4);
    }

    #[tokio::test]
    async fn test_delete_before_create_replace_within_node() {
        let provider = Arc::new(FakeProvider::default());
        let registry = registry(&provider);
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());

        let record = ResourceRecord {
            name: "vpc".to_string(),
            type_: "test:mod:Thing".to_string(),
            serial: 2,
            inputs: Value::map([("name", Value::string("old-vpc"))]),
            outputs: Value::map([("id", Value::string("old-vpc-id"))]),
            dependencies: vec![],
        };
        store.put(record.clone(), None).await.unwrap();

        let graph = ResourceGraph::from_declarations(&[decl(
            "vpc",
            Value::map([("name", Value::string("vpc"))]),
            &[],
        )])
        .unwrap();
        let mut nodes = BTreeMap::new();
        nodes.insert(
            "vpc".to_string(),
            NodePlan {
                name: "vpc".to_string(),
                type_: "test:mod:Thing".to_string(),
                kind: PlanKind::Replace {
                    changed_paths: vec!["name".to_string()],
                    delete_before_create: true,
                },
                steps: vec![
                    PlanStep {
                        action: StepAction::Delete,
                        resource_id: Some("old-vpc-id".to_string()),
                    },
                    PlanStep {
                        action: StepAction::Create,
                        resource_id: None,
                    },
                ],
                deferred_delete: None,
                prior: Some(record),
            },
        );

        let outcomes = executor()
            .execute(Plan { nodes, graph }, registry, store.clone(), CancellationToken::new())
            .await
            .unwrap();

        assert!(matches!(outcomes["vpc"], NodeOutcome::Replaced { .. }));
        assert_eq!(provider.calls(), vec!["delete old-vpc-id", "create vpc"]);
        // Record was re-created from scratch
        assert_eq!(store.get("vpc").await.unwrap().unwrap().serial, 1);
    }

    #[tokio::test]
    async fn test_stale_commit_rereads_and_retries_once() {
        use crate::state::MockStateStore;

        let record = ResourceRecord {
            name: "vpc".to_string(),
            type_: "test:mod:Thing".to_string(),
            serial: 2,
            inputs: Value::Null,
            outputs: Value::Null,
            dependencies: vec![],
        };

        let mut store = MockStateStore::new();
        let mut seq = mockall::Sequence::new();
        store
            .expect_put()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|r, _| {
                Err(StoreError::StaleWrite {
                    name: r.name,
                    expected: Some(1),
                    stored: Some(4),
                })
            });
        store
            .expect_get()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|name| {
                Ok(Some(ResourceRecord {
                    name: name.to_string(),
                    type_: "test:mod:Thing".to_string(),
                    serial: 4,
                    inputs: Value::Null,
                    outputs: Value::Null,
                    dependencies: vec![],
                }))
            });
        store
            .expect_put()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|r, expected| {
                assert_eq!(expected, Some(4));
                assert_eq!(r.serial, 5);
                Ok(())
            });

        let result = commit_record(&store, record, Some(1)).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_second_stale_commit_fails_the_node() {
        use crate::state::MockStateStore;

        let record = ResourceRecord {
            name: "vpc".to_string(),
            type_: "test:mod:Thing".to_string(),
            serial: 2,
            inputs: Value::Null,
            outputs: Value::Null,
            dependencies: vec![],
        };

        let mut store = MockStateStore::new();
        store.expect_put().returning(|r, expected| {
            Err(StoreError::StaleWrite {
                name: r.name,
                expected,
                stored: Some(9),
            })
        });
        store.expect_get().returning(|name| {
            Ok(Some(ResourceRecord {
                name: name.to_string(),
                type_: "test:mod:Thing".to_string(),
                serial: 9,
                inputs: Value::Null,
                outputs: Value::Null,
                dependencies: vec![],
            }))
        });

        let result = commit_record(&store, record, Some(1)).await;
        assert!(matches!(result, Err(TaskFailure::Node(_))));
    }

    #[tokio::test]
    async fn test_batches_overlap_only_independent_nodes() {
        // Sanity: executor honors the same ordering the batches expose
        let graph = ResourceGraph::from_declarations(&[
            decl("a", Value::Null, &[]),
            decl("b", Value::Null, &["a"]),
            decl("x", Value::Null, &[]),
        ])
        .unwrap();
        let batches: Vec<BTreeSet<String>> =
            graph.topological_batches().unwrap().collect();
        assert!(batches[0].contains("a") && batches[0].contains("x"));
        assert!(batches[1].contains("b"));
    }
}
