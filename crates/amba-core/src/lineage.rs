//! # State-Lineage Tracker
//!
//! Records which engine states were forked from or merged into which.
//!
//! Nodes are lineage slots ([`InternalStateId`]s). The engine mutates its
//! state objects in place, so every fork and merge moves the affected state
//! to a freshly minted slot; the graph stays a DAG even though the engine
//! identifiers repeat.
//!
//! Edges are batched in a pending buffer and written to the sink on
//! [`StateLineageTracker::flush`].

use crate::graph::{Graph, GraphSink};
use crate::registry::IdentityRegistry;
use crate::{Edge, EngineStateId, InternalStateId, StateMetadata};

/// Fork/merge ancestry graph builder.
#[derive(Debug)]
pub struct StateLineageTracker<G = Graph> {
    /// Engine id → current lineage slot.
    registry: IdentityRegistry,
    /// Edges not yet written to the sink.
    pending: Vec<Edge>,
    /// Destination of flushed edges.
    graph: G,
}

impl StateLineageTracker<Graph> {
    /// Create a tracker writing into a fresh in-memory graph.
    #[must_use]
    pub fn new() -> Self {
        Self::with_sink(Graph::new())
    }
}

impl<G: GraphSink + Default> Default for StateLineageTracker<G> {
    fn default() -> Self {
        Self::with_sink(G::default())
    }
}

impl<G: GraphSink> StateLineageTracker<G> {
    /// Create a tracker writing into `graph`.
    pub fn with_sink(graph: G) -> Self {
        Self {
            registry: IdentityRegistry::new(),
            pending: Vec::new(),
            graph,
        }
    }

    /// Handle a "state forked" callback.
    ///
    /// The parent moves to a new slot once, however many children there
    /// are. Each child gets its own slot (a child equal to `parent` takes
    /// the parent's new slot). One edge `parent's old slot -> child slot`
    /// is queued per child; the queued edges are returned.
    ///
    /// An empty `children` list changes nothing.
    ///
    /// # Panics
    ///
    /// Panics if a child slot equals the parent's pre-fork slot.
    pub fn on_fork(&mut self, parent: EngineStateId, children: &[EngineStateId]) -> &[Edge] {
        let start = self.pending.len();
        if children.is_empty() {
            return &self.pending[start..];
        }

        let from = StateMetadata::new(self.registry.get(parent));
        let parent_slot = self.registry.advance(parent);

        for &child in children {
            let to = StateMetadata::new(if child == parent {
                parent_slot
            } else {
                self.registry.advance(child)
            });
            assert_ne!(
                from.lineage_id, to.lineage_id,
                "forked child {child} reuses parent lineage slot"
            );
            self.pending.push(Edge::new(from.node_key(), to.node_key()));
        }

        &self.pending[start..]
    }

    /// Handle a "state merged" callback.
    ///
    /// Both inputs' current slots get an edge into one fresh slot, which
    /// becomes the destination's new slot. The source's slot is retired.
    pub fn on_merge(&mut self, destination: EngineStateId, source: EngineStateId) -> [Edge; 2] {
        let from_destination = StateMetadata::new(self.registry.get(destination));
        let from_source = StateMetadata::new(self.registry.get(source));
        let to = StateMetadata::new(self.registry.advance(destination));

        let edges = [
            Edge::new(from_destination.node_key(), to.node_key()),
            Edge::new(from_source.node_key(), to.node_key()),
        ];
        self.pending.extend_from_slice(&edges);
        edges
    }

    /// Write all queued edges to the sink. Returns how many were written.
    pub fn flush(&mut self) -> usize {
        let flushed = self.pending.len();
        self.graph.insert_edges(&self.pending);
        self.pending.clear();
        flushed
    }

    /// Edges queued since the last flush.
    #[must_use]
    pub fn pending(&self) -> &[Edge] {
        &self.pending
    }

    /// Current lineage slot of `state`, if it was ever referenced.
    #[must_use]
    pub fn lineage_id(&self, state: EngineStateId) -> Option<InternalStateId> {
        self.registry.peek(state)
    }

    /// The sink flushed edges are written to.
    pub fn graph(&self) -> &G {
        &self.graph
    }

    /// Flush and tear the tracker down, keeping the sink.
    pub fn into_graph(mut self) -> G {
        self.flush();
        self.graph
    }
}
