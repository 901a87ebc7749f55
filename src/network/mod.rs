//! Networks: the dependency graph over composed operations.
//!
//! A network is the union of its operations, represented as a directed
//! bipartite graph with OPERATION and DATA nodes. Needs contribute
//! DATA -> OPERATION edges and provides OPERATION -> DATA edges; sideffect
//! dependencies contribute ordering-only edges that never participate in
//! the acyclicity invariant.

use crate::errors::DuplicateOperationError;
use crate::operation::Operation;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// A node of the bipartite dependency graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphNode {
    /// An operation, by name.
    Op(String),
    /// A data name.
    Data(String),
}

/// The class of a dependency edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeKind {
    /// A real data dependency; participates in cycle detection.
    Flow,
    /// An ordering-only edge from a sideffect token.
    Order,
}

/// How composition treats duplicate operation names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MergePolicy {
    /// Duplicate names are an error.
    #[default]
    Append,
    /// Later operations override earlier ones by name.
    Merge,
}

/// The dependency graph over a set of composed operations.
///
/// Networks only grow: composition produces a new network, existing ones
/// are never mutated.
#[derive(Debug)]
pub struct Network {
    name: String,
    uid: Uuid,
    ops: Vec<Arc<Operation>>,
    graph: DiGraph<GraphNode, EdgeKind>,
    op_nodes: HashMap<String, NodeIndex>,
    data_nodes: HashMap<String, NodeIndex>,
}

/// Composes operations into a network, in composition order.
///
/// # Errors
///
/// With [`MergePolicy::Append`], a repeated operation name raises
/// [`DuplicateOperationError`]. [`MergePolicy::Merge`] lets later
/// operations override earlier ones in place.
pub fn compose(
    name: impl Into<String>,
    ops: impl IntoIterator<Item = Operation>,
    policy: MergePolicy,
) -> Result<Network, DuplicateOperationError> {
    compose_shared(name, ops.into_iter().map(Arc::new), policy)
}

/// Composes already-shared operations into a network.
///
/// # Errors
///
/// Same as [`compose`].
pub fn compose_shared(
    name: impl Into<String>,
    ops: impl IntoIterator<Item = Arc<Operation>>,
    policy: MergePolicy,
) -> Result<Network, DuplicateOperationError> {
    let name = name.into();
    let mut ordered: Vec<Arc<Operation>> = Vec::new();
    let mut by_name: HashMap<String, usize> = HashMap::new();

    for op in ops {
        match by_name.get(op.name()) {
            Some(&idx) => match policy {
                MergePolicy::Append => {
                    return Err(DuplicateOperationError {
                        op: op.name().to_string(),
                        network: name,
                    });
                }
                // Override in place: the survivor keeps the position of the
                // first occurrence.
                MergePolicy::Merge => ordered[idx] = op,
            },
            None => {
                by_name.insert(op.name().to_string(), ordered.len());
                ordered.push(op);
            }
        }
    }

    Ok(Network::from_ops(name, ordered))
}

impl Network {
    fn from_ops(name: String, ops: Vec<Arc<Operation>>) -> Self {
        let mut graph = DiGraph::new();
        let mut op_nodes = HashMap::new();
        let mut data_nodes: HashMap<String, NodeIndex> = HashMap::new();

        for op in &ops {
            let op_idx = graph.add_node(GraphNode::Op(op.name().to_string()));
            op_nodes.insert(op.name().to_string(), op_idx);

            for dep in op.needs() {
                let data_idx = *data_nodes
                    .entry(dep.base().to_string())
                    .or_insert_with(|| graph.add_node(GraphNode::Data(dep.base().to_string())));
                let kind = if dep.is_sideffect() {
                    EdgeKind::Order
                } else {
                    EdgeKind::Flow
                };
                graph.add_edge(data_idx, op_idx, kind);
            }

            for dep in op.provides() {
                let data_idx = *data_nodes
                    .entry(dep.base().to_string())
                    .or_insert_with(|| graph.add_node(GraphNode::Data(dep.base().to_string())));
                let kind = if dep.is_sideffect() {
                    EdgeKind::Order
                } else {
                    EdgeKind::Flow
                };
                graph.add_edge(op_idx, data_idx, kind);
            }
        }

        Self {
            name,
            uid: Uuid::new_v4(),
            ops,
            graph,
            op_nodes,
            data_nodes,
        }
    }

    /// The network name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// A stable identity for this network, part of every plan-cache key.
    #[must_use]
    pub fn uid(&self) -> Uuid {
        self.uid
    }

    /// The operations in composition order.
    #[must_use]
    pub fn ops(&self) -> &[Arc<Operation>] {
        &self.ops
    }

    /// Looks up an operation by name.
    #[must_use]
    pub fn op(&self, name: &str) -> Option<&Arc<Operation>> {
        self.op_nodes
            .get(name)
            .and_then(|_| self.ops.iter().find(|op| op.name() == name))
    }

    /// The number of operations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// True when the network holds no operations.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// All data names mentioned by any operation.
    pub fn data_names(&self) -> impl Iterator<Item = &str> {
        self.data_nodes.keys().map(String::as_str)
    }

    /// The underlying bipartite graph.
    #[must_use]
    pub fn graph(&self) -> &DiGraph<GraphNode, EdgeKind> {
        &self.graph
    }

    /// Merges this network with another into a new one.
    ///
    /// The result carries a fresh identity; cached plans of either source
    /// network are unaffected.
    ///
    /// # Errors
    ///
    /// Same duplicate-name behavior as [`compose`].
    pub fn merge_with(
        &self,
        other: &Network,
        policy: MergePolicy,
    ) -> Result<Network, DuplicateOperationError> {
        compose_shared(
            self.name.clone(),
            self.ops.iter().chain(other.ops.iter()).cloned(),
            policy,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modifier::sideffect;
    use crate::operation::{FnBody, ValueMap};

    fn noop(name: &str, needs: &[&str], provides: &[&str]) -> Operation {
        Operation::builder(name)
            .needs(needs.iter().copied())
            .provides(provides.iter().copied())
            .build(FnBody::new(|_: ValueMap| Ok(ValueMap::new())))
            .unwrap()
    }

    #[test]
    fn test_compose_append_rejects_duplicates() {
        let err = compose(
            "net",
            [noop("a", &["x"], &["y"]), noop("a", &["y"], &["z"])],
            MergePolicy::Append,
        )
        .unwrap_err();
        assert_eq!(err.op, "a");
        assert_eq!(err.network, "net");
    }

    #[test]
    fn test_compose_merge_overrides_by_name() {
        let net = compose(
            "net",
            [
                noop("a", &["x"], &["y"]),
                noop("b", &["y"], &["z"]),
                noop("a", &["x"], &["y2"]),
            ],
            MergePolicy::Merge,
        )
        .unwrap();

        assert_eq!(net.len(), 2);
        // Survivor keeps the first occurrence's composition slot.
        assert_eq!(net.ops()[0].name(), "a");
        assert_eq!(net.ops()[0].provides()[0].base(), "y2");
    }

    #[test]
    fn test_graph_shape() {
        let net = compose(
            "net",
            [noop("a", &["x"], &["y"]), noop("b", &["y"], &["z"])],
            MergePolicy::Append,
        )
        .unwrap();

        // 2 op nodes + 3 data nodes, 4 edges.
        assert_eq!(net.graph().node_count(), 5);
        assert_eq!(net.graph().edge_count(), 4);
        let mut names: Vec<&str> = net.data_names().collect();
        names.sort_unstable();
        assert_eq!(names, vec!["x", "y", "z"]);
    }

    #[test]
    fn test_sideffect_edges_are_order_class() {
        let producer = Operation::builder("producer")
            .needs(["x"])
            .provides([sideffect("tick")])
            .build(FnBody::new(|_: ValueMap| Ok(ValueMap::new())))
            .unwrap();
        let consumer = Operation::builder("consumer")
            .needs([sideffect("tick")])
            .provides(["y"])
            .build(FnBody::new(|_: ValueMap| Ok(ValueMap::new())))
            .unwrap();

        let net = compose("net", [producer, consumer], MergePolicy::Append).unwrap();
        let order_edges = net
            .graph()
            .edge_weights()
            .filter(|kind| **kind == EdgeKind::Order)
            .count();
        assert_eq!(order_edges, 2);
    }

    #[test]
    fn test_merge_with_gets_fresh_identity() {
        let net1 = compose("one", [noop("a", &["x"], &["y"])], MergePolicy::Append).unwrap();
        let net2 = compose("two", [noop("b", &["y"], &["z"])], MergePolicy::Append).unwrap();
        let merged = net1.merge_with(&net2, MergePolicy::Append).unwrap();

        assert_eq!(merged.len(), 2);
        assert_ne!(merged.uid(), net1.uid());
        assert_ne!(merged.uid(), net2.uid());
    }
}
