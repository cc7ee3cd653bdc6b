//! Resource dependency graph
//!
//! Builds an in-memory DAG from resource declarations. Edges come from two
//! sources: explicit `dependsOn` entries, and implicit dependencies found by
//! scanning each declaration's inputs for embedded output references.
//! Scanning happens here, at build time, so that cycle detection sees every
//! edge; references are never resolved lazily during execution planning.
//!
//! The graph is immutable for the duration of a reconcile pass once built.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::value::Value;
use crate::{Error, Result};

/// A caller-supplied desired-state declaration for one resource
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceDeclaration {
    /// Logical name, unique within a pass
    pub name: String,
    /// Resource type identifier, e.g. `"scaleway:k8s:Cluster"`
    #[serde(rename = "type")]
    pub type_: String,
    /// Desired-state payload; may embed output references
    #[serde(default)]
    pub inputs: Value,
    /// Explicit dependencies on other declared resources
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
}

impl ResourceDeclaration {
    /// Create a declaration with no explicit dependencies
    pub fn new(name: impl Into<String>, type_: impl Into<String>, inputs: Value) -> Self {
        Self {
            name: name.into(),
            type_: type_.into(),
            inputs,
            depends_on: Vec::new(),
        }
    }

    /// Add explicit dependencies
    pub fn with_depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }
}

/// A node in the resource graph
///
/// Immutable once the graph is built for a pass. `depends_on` holds the
/// merged explicit and implicit dependency set.
#[derive(Clone, Debug, PartialEq)]
pub struct ResourceNode {
    /// Logical name
    pub name: String,
    /// Resource type identifier
    pub type_: String,
    /// Desired-state payload
    pub inputs: Value,
    /// Names of resources this node depends on
    pub depends_on: BTreeSet<String>,
}

/// DAG of resource nodes and their dependencies
#[derive(Clone, Debug, Default)]
pub struct ResourceGraph {
    nodes: BTreeMap<String, ResourceNode>,
    dependents: BTreeMap<String, BTreeSet<String>>,
}

impl ResourceGraph {
    /// Create an empty graph
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a graph from an ordered sequence of declarations
    ///
    /// Adds every node first, then wires explicit `dependsOn` edges and the
    /// implicit edges discovered from output references in each node's
    /// inputs. Fails on duplicate names or edges to undeclared resources.
    pub fn from_declarations(declarations: &[ResourceDeclaration]) -> Result<Self> {
        let mut graph = Self::new();
        for decl in declarations {
            graph.add_node(ResourceNode {
                name: decl.name.clone(),
                type_: decl.type_.clone(),
                inputs: decl.inputs.clone(),
                depends_on: BTreeSet::new(),
            })?;
        }
        for decl in declarations {
            for dep in &decl.depends_on {
                graph.add_dependency(&decl.name, dep)?;
            }
            let implicit: Vec<String> = decl
                .inputs
                .references()
                .into_iter()
                .map(|r| r.resource.clone())
                .collect();
            for dep in implicit {
                graph.add_dependency(&decl.name, &dep)?;
            }
        }
        Ok(graph)
    }

    /// Add a node to the graph
    ///
    /// Fails if a node with the same name already exists.
    pub fn add_node(&mut self, node: ResourceNode) -> Result<()> {
        if self.nodes.contains_key(&node.name) {
            return Err(Error::validation(format!(
                "duplicate resource name {:?}",
                node.name
            )));
        }
        // Edges carried on the node are re-registered so dependents stay
        // consistent
        let deps: Vec<String> = node.depends_on.iter().cloned().collect();
        let name = node.name.clone();
        self.nodes.insert(
            name.clone(),
            ResourceNode {
                depends_on: BTreeSet::new(),
                ..node
            },
        );
        for dep in deps {
            self.add_dependency(&name, &dep)?;
        }
        Ok(())
    }

    /// Add a dependency edge: `from` depends on `to`
    ///
    /// Both endpoints must already be nodes of the graph.
    pub fn add_dependency(&mut self, from: &str, to: &str) -> Result<()> {
        if !self.nodes.contains_key(to) {
            return Err(Error::validation(format!(
                "resource {from:?} depends on undeclared resource {to:?}"
            )));
        }
        let node = self
            .nodes
            .get_mut(from)
            .ok_or_else(|| Error::validation(format!("unknown resource {from:?}")))?;
        node.depends_on.insert(to.to_string());
        self.dependents
            .entry(to.to_string())
            .or_default()
            .insert(from.to_string());
        Ok(())
    }

    /// Look up a node by name
    pub fn get(&self, name: &str) -> Option<&ResourceNode> {
        self.nodes.get(name)
    }

    /// Iterate all nodes in name order
    pub fn nodes(&self) -> impl Iterator<Item = &ResourceNode> {
        self.nodes.values()
    }

    /// Names of the nodes that depend on `name`
    pub fn dependents_of(&self, name: &str) -> BTreeSet<String> {
        self.dependents.get(name).cloned().unwrap_or_default()
    }

    /// Number of nodes
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True if the graph has no nodes
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Verify the dependency relation is acyclic
    ///
    /// Depth-first traversal with a recursion-stack marker. On failure the
    /// error carries the offending node sequence with the entry node
    /// repeated at the end.
    pub fn ensure_acyclic(&self) -> Result<()> {
        let mut visited = BTreeSet::new();
        let mut stack = Vec::new();
        for name in self.nodes.keys() {
            if !visited.contains(name.as_str()) {
                if let Some(cycle) = self.visit(name, &mut visited, &mut stack) {
                    return Err(Error::cycle(cycle));
                }
            }
        }
        Ok(())
    }

    fn visit(
        &self,
        name: &str,
        visited: &mut BTreeSet<String>,
        stack: &mut Vec<String>,
    ) -> Option<Vec<String>> {
        if let Some(pos) = stack.iter().position(|n| n == name) {
            let mut cycle: Vec<String> = stack[pos..].to_vec();
            cycle.push(name.to_string());
            return Some(cycle);
        }
        if visited.contains(name) {
            return None;
        }
        stack.push(name.to_string());
        if let Some(node) = self.nodes.get(name) {
            for dep in &node.depends_on {
                if let Some(cycle) = self.visit(dep, visited, stack) {
                    return Some(cycle);
                }
            }
        }
        stack.pop();
        visited.insert(name.to_string());
        None
    }

    /// Produce the dependency-ordered batches of this graph
    ///
    /// Each batch contains every node whose dependencies are fully contained
    /// in prior batches, so all members of one batch are safe to execute in
    /// parallel. The sequence is computed lazily, is finite, and is not
    /// restartable across graph mutations. Fails with
    /// [`Error::CycleDetected`] if no topological ordering exists.
    pub fn topological_batches(&self) -> Result<Batches<'_>> {
        self.ensure_acyclic()?;
        let remaining = self
            .nodes
            .iter()
            .map(|(name, node)| (name.clone(), node.depends_on.len()))
            .collect();
        Ok(Batches {
            graph: self,
            remaining,
        })
    }

    /// Build the edge-reversed graph
    ///
    /// Used for destroy ordering: dependents of a resource become its
    /// dependencies, so deletion proceeds leaves-first.
    pub fn reverse(&self) -> ResourceGraph {
        let mut reversed = ResourceGraph::new();
        for node in self.nodes.values() {
            // Infallible: names are unique in self
            let _ = reversed.add_node(ResourceNode {
                name: node.name.clone(),
                type_: node.type_.clone(),
                inputs: node.inputs.clone(),
                depends_on: BTreeSet::new(),
            });
        }
        for node in self.nodes.values() {
            for dep in &node.depends_on {
                let _ = reversed.add_dependency(dep, &node.name);
            }
        }
        reversed
    }
}

/// Lazy iterator over dependency-ordered batches
///
/// Produced by [`ResourceGraph::topological_batches`].
pub struct Batches<'a> {
    graph: &'a ResourceGraph,
    remaining: BTreeMap<String, usize>,
}

impl Iterator for Batches<'_> {
    type Item = BTreeSet<String>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining.is_empty() {
            return None;
        }
        let batch: BTreeSet<String> = self
            .remaining
            .iter()
            .filter(|(_, indegree)| **indegree == 0)
            .map(|(name, _)| name.clone())
            .collect();
        for name in &batch {
            self.remaining.remove(name);
            for dependent in self.graph.dependents_of(name) {
                if let Some(indegree) = self.remaining.get_mut(&dependent) {
                    *indegree -= 1;
                }
            }
        }
        // The acyclicity check in topological_batches guarantees progress
        debug_assert!(!batch.is_empty());
        Some(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decl(name: &str, deps: &[&str]) -> ResourceDeclaration {
        ResourceDeclaration::new(name, "test:mod:Thing", Value::Null)
            .with_depends_on(deps.iter().copied())
    }

    #[test]
    fn test_batches_respect_dependencies() {
        // vpc <- subnet <- cluster, vpc <- gateway
        let graph = ResourceGraph::from_declarations(&[
            decl("vpc", &[]),
            decl("subnet", &["vpc"]),
            decl("cluster", &["subnet"]),
            decl("gateway", &["vpc"]),
        ])
        .unwrap();

        let batches: Vec<_> = graph.topological_batches().unwrap().collect();
        assert_eq!(batches.len(), 3);
        assert!(batches[0].contains("vpc"));
        assert!(batches[1].contains("subnet"));
        assert!(batches[1].contains("gateway"));
        assert!(batches[2].contains("cluster"));

        // Union covers every node exactly once
        let total: usize = batches.iter().map(BTreeSet::len).sum();
        assert_eq!(total, graph.len());
    }

    #[test]
    fn test_implicit_edge_from_output_reference() {
        let pool = ResourceDeclaration::new(
            "pool",
            "test:k8s:NodePool",
            Value::map([("clusterId", Value::reference("cluster", "id"))]),
        );
        let cluster = ResourceDeclaration::new("cluster", "test:k8s:Cluster", Value::Null);

        let graph = ResourceGraph::from_declarations(&[pool, cluster]).unwrap();
        assert!(graph.get("pool").unwrap().depends_on.contains("cluster"));
        assert_eq!(graph.dependents_of("cluster"), BTreeSet::from(["pool".to_string()]));
    }

    #[test]
    fn test_cycle_detected_with_path() {
        let graph = ResourceGraph::from_declarations(&[
            decl("a", &["c"]),
            decl("b", &["a"]),
            decl("c", &["b"]),
        ])
        .unwrap();

        let err = graph.ensure_acyclic().unwrap_err();
        match err {
            Error::CycleDetected { path } => {
                assert_eq!(path.len(), 4);
                assert_eq!(path.first(), path.last());
            }
            other => panic!("expected CycleDetected, got {other}"),
        }
        assert!(graph.topological_batches().is_err());
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let graph = ResourceGraph::from_declarations(&[decl("a", &["a"])]).unwrap();
        assert!(matches!(
            graph.ensure_acyclic(),
            Err(Error::CycleDetected { .. })
        ));
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let result = ResourceGraph::from_declarations(&[decl("a", &[]), decl("a", &[])]);
        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[test]
    fn test_undeclared_dependency_rejected() {
        let result = ResourceGraph::from_declarations(&[decl("a", &["ghost"])]);
        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[test]
    fn test_reverse_flips_edges() {
        let graph =
            ResourceGraph::from_declarations(&[decl("vpc", &[]), decl("subnet", &["vpc"])])
                .unwrap();
        let reversed = graph.reverse();
        assert!(reversed.get("vpc").unwrap().depends_on.contains("subnet"));
        assert!(reversed.get("subnet").unwrap().depends_on.is_empty());
    }

    #[test]
    fn test_empty_graph_yields_no_batches() {
        let graph = ResourceGraph::new();
        assert_eq!(graph.topological_batches().unwrap().count(), 0);
    }
}
