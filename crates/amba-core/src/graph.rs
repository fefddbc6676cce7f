//! # Graph Sink and In-Memory Graph
//!
//! The trackers only ever insert edges. Everything they need from graph
//! storage is the [`GraphSink`] trait; [`Graph`] is the deterministic
//! in-memory implementation used by [`crate::Session`].
//!
//! All data structures use `BTreeMap` for deterministic ordering, so two
//! sessions fed the same events produce byte-identical snapshots.

use crate::Edge;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

// =============================================================================
// GRAPHSINK TRAIT
// =============================================================================

/// Edge-insert handle of a graph store.
///
/// Creating a sink is its constructor, destroying it is its `Drop`. The
/// tracker that owns a sink is the only context that writes to it.
///
/// Implementations must not block: they are called synchronously from the
/// engine's callback thread.
pub trait GraphSink {
    /// Record one observation of the directed edge `from -> to`.
    fn insert_edge(&mut self, from: u64, to: u64);

    /// Record a batch of edges in order.
    fn insert_edges(&mut self, edges: &[Edge]) {
        for edge in edges {
            self.insert_edge(edge.from, edge.to);
        }
    }
}

impl<G: GraphSink + ?Sized> GraphSink for &mut G {
    fn insert_edge(&mut self, from: u64, to: u64) {
        (**self).insert_edge(from, to);
    }
}

// =============================================================================
// EDGE WEIGHT
// =============================================================================

/// Number of times an edge was observed.
/// Uses saturating arithmetic to prevent overflow.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct EdgeWeight(pub u64);

impl EdgeWeight {
    /// Create a new edge weight with the given value.
    #[must_use]
    pub const fn new(weight: u64) -> Self {
        Self(weight)
    }

    /// Increment the edge weight by 1 using saturating arithmetic.
    #[must_use]
    pub const fn increment(self) -> Self {
        Self(self.0.saturating_add(1))
    }

    /// Get the raw weight value.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }
}

// =============================================================================
// GRAPH IMPLEMENTATION
// =============================================================================

/// In-memory directed graph keyed by opaque 64-bit node keys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Graph {
    /// Every node that appears as an edge endpoint.
    nodes: BTreeSet<u64>,

    /// Adjacency list: from_node -> (to_node -> weight)
    edges: BTreeMap<u64, BTreeMap<u64, EdgeWeight>>,

    /// Number of distinct edges.
    edge_count: usize,
}

impl Graph {
    /// Create a new empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the graph has no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Get the total number of nodes.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Get the total number of distinct edges.
    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.edge_count
    }

    /// Check if a node exists in the graph.
    #[must_use]
    pub fn contains_node(&self, node: u64) -> bool {
        self.nodes.contains(&node)
    }

    /// Check if the graph contains an edge.
    #[must_use]
    pub fn contains_edge(&self, from: u64, to: u64) -> bool {
        self.edge_weight(from, to).is_some()
    }

    /// Get the weight of an edge.
    #[must_use]
    pub fn edge_weight(&self, from: u64, to: u64) -> Option<EdgeWeight> {
        self.edges.get(&from)?.get(&to).copied()
    }

    /// Get all successors of a node in deterministic order.
    pub fn neighbors(&self, node: u64) -> impl Iterator<Item = (u64, EdgeWeight)> + '_ {
        self.edges
            .get(&node)
            .into_iter()
            .flat_map(|targets| targets.iter().map(|(k, v)| (*k, *v)))
    }

    /// Get all predecessors of a node in deterministic order.
    pub fn predecessors(&self, node: u64) -> impl Iterator<Item = u64> + '_ {
        self.edges
            .iter()
            .filter(move |(_, targets)| targets.contains_key(&node))
            .map(|(from, _)| *from)
    }

    /// Get all nodes in deterministic order.
    pub fn nodes(&self) -> impl Iterator<Item = u64> + '_ {
        self.nodes.iter().copied()
    }

    /// Get all edges in deterministic order.
    pub fn edges(&self) -> impl Iterator<Item = (u64, u64, EdgeWeight)> + '_ {
        self.edges.iter().flat_map(|(from, targets)| {
            targets
                .iter()
                .map(move |(to, weight)| (*from, *to, *weight))
        })
    }

    /// Take an ordered, serializable copy of the graph.
    #[must_use]
    pub fn snapshot(&self) -> GraphSnapshot {
        GraphSnapshot {
            nodes: self.nodes().collect(),
            edges: self
                .edges()
                .map(|(from, to, weight)| WeightedEdge {
                    from,
                    to,
                    weight: weight.value(),
                })
                .collect(),
        }
    }
}

impl GraphSink for Graph {
    fn insert_edge(&mut self, from: u64, to: u64) {
        self.nodes.insert(from);
        self.nodes.insert(to);

        let targets = self.edges.entry(from).or_default();
        let current = match targets.get(&to) {
            Some(weight) => *weight,
            None => {
                self.edge_count = self.edge_count.saturating_add(1);
                EdgeWeight::new(0)
            }
        };
        targets.insert(to, current.increment());
    }
}

// =============================================================================
// SNAPSHOT
// =============================================================================

/// A weighted edge inside a [`GraphSnapshot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeightedEdge {
    pub from: u64,
    pub to: u64,
    pub weight: u64,
}

/// Ordered copy of a [`Graph`], sent to the external process over IPC.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphSnapshot {
    /// Node keys, ascending.
    pub nodes: Vec<u64>,
    /// Edges ordered by (from, to).
    pub edges: Vec<WeightedEdge>,
}

impl GraphSnapshot {
    /// Number of nodes in the snapshot.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Number of edges in the snapshot.
    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }
}

impl From<&GraphSnapshot> for Graph {
    fn from(snapshot: &GraphSnapshot) -> Self {
        let mut graph = Graph::new();
        graph.nodes.extend(snapshot.nodes.iter().copied());
        for edge in &snapshot.edges {
            graph.nodes.insert(edge.from);
            graph.nodes.insert(edge.to);
            let previous = graph
                .edges
                .entry(edge.from)
                .or_default()
                .insert(edge.to, EdgeWeight::new(edge.weight));
            if previous.is_none() {
                graph.edge_count = graph.edge_count.saturating_add(1);
            }
        }
        graph
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_edge_creates_endpoints() {
        let mut graph = Graph::new();
        assert!(graph.is_empty());

        graph.insert_edge(1, 2);

        assert!(graph.contains_node(1));
        assert!(graph.contains_node(2));
        assert!(graph.contains_edge(1, 2));
        assert!(!graph.contains_edge(2, 1));
        assert_eq!(graph.node_count(), 2);
        assert_eq!(graph.edge_count(), 1);
    }

    #[test]
    fn repeated_edge_increments_weight() {
        let mut graph = Graph::new();
        graph.insert_edge(1, 2);
        graph.insert_edge(1, 2);
        graph.insert_edge(1, 2);

        assert_eq!(graph.edge_weight(1, 2), Some(EdgeWeight::new(3)));
        assert_eq!(graph.edge_count(), 1);
    }

    #[test]
    fn edge_weight_saturates() {
        assert_eq!(EdgeWeight::new(u64::MAX).increment().value(), u64::MAX);
    }

    #[test]
    fn neighbors_in_deterministic_order() {
        let mut graph = Graph::new();
        graph.insert_edge(1, 30);
        graph.insert_edge(1, 20);
        graph.insert_edge(1, 10);

        let neighbors: Vec<_> = graph.neighbors(1).map(|(n, _)| n).collect();
        assert_eq!(neighbors, vec![10, 20, 30]);
    }

    #[test]
    fn predecessors_lists_sources() {
        let mut graph = Graph::new();
        graph.insert_edge(5, 9);
        graph.insert_edge(3, 9);
        graph.insert_edge(3, 4);

        let preds: Vec<_> = graph.predecessors(9).collect();
        assert_eq!(preds, vec![3, 5]);
    }

    #[test]
    fn batch_insert_preserves_order() {
        let mut graph = Graph::new();
        graph.insert_edges(&[Edge::new(0, 1), Edge::new(0, 2), Edge::new(0, 1)]);

        assert_eq!(graph.edge_weight(0, 1), Some(EdgeWeight::new(2)));
        assert_eq!(graph.edge_weight(0, 2), Some(EdgeWeight::new(1)));
    }

    #[test]
    fn snapshot_round_trips_through_graph() {
        let mut graph = Graph::new();
        graph.insert_edge(0, 1);
        graph.insert_edge(1, 2);
        graph.insert_edge(1, 2);

        let snapshot = graph.snapshot();
        assert_eq!(snapshot.node_count(), 3);
        assert_eq!(snapshot.edge_count(), 2);
        assert_eq!(
            snapshot.edges[1],
            WeightedEdge {
                from: 1,
                to: 2,
                weight: 2
            }
        );

        assert_eq!(Graph::from(&snapshot), graph);
    }

    #[test]
    fn sink_through_mutable_reference() {
        fn feed(mut sink: impl GraphSink) {
            sink.insert_edge(7, 8);
        }

        let mut graph = Graph::new();
        feed(&mut graph);
        assert!(graph.contains_edge(7, 8));
    }
}
