//! # Control-Flow Tracker
//!
//! Rebuilds an assembly-level control-flow graph from "block translated"
//! and "block entered" engine callbacks.
//!
//! Nodes are [`PackedNodeId`]s: (address, generation, state alias). The
//! generation counts how often the engine re-translated the same block
//! under the same state, so loop iterations and self-modified code become
//! distinct nodes while the key still fits in 64 bits.
//!
//! Edges run from the block a state executed last to the block it enters
//! now. A state's first block hangs off the sentinel node 0.

use crate::codec;
use crate::graph::{Graph, GraphSink};
use crate::registry::IdentityRegistry;
use crate::{Edge, EngineStateId, Generation, InternalStateId, PackedNodeId};
use std::collections::BTreeMap;

/// Pre-packing key of the generation counters.
///
/// Combines the full engine id with the full address; distinct from a
/// [`PackedNodeId`], which truncates both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StatePc {
    pub state: EngineStateId,
    pub address: u64,
}

impl StatePc {
    /// Create a new alias.
    #[must_use]
    pub const fn new(state: EngineStateId, address: u64) -> Self {
        Self { state, address }
    }
}

/// Control-flow graph builder.
///
/// Owns its generation counters, its last-seen map, its identity registry
/// and the sink its edges go to. Created empty when the plugin attaches;
/// dropped (never persisted) on detach.
#[derive(Debug)]
pub struct ControlFlowTracker<G = Graph> {
    /// Engine id → internal id used to key `last_seen`.
    registry: IdentityRegistry,
    /// Re-translation count per (engine state, address).
    generations: BTreeMap<StatePc, Generation>,
    /// Last node each internal state executed.
    last_seen: BTreeMap<InternalStateId, PackedNodeId>,
    /// Destination of all emitted edges.
    graph: G,
}

impl ControlFlowTracker<Graph> {
    /// Create a tracker writing into a fresh in-memory graph.
    #[must_use]
    pub fn new() -> Self {
        Self::with_sink(Graph::new())
    }
}

impl<G: GraphSink + Default> Default for ControlFlowTracker<G> {
    fn default() -> Self {
        Self::with_sink(G::default())
    }
}

impl<G: GraphSink> ControlFlowTracker<G> {
    /// Create a tracker writing into `graph`.
    pub fn with_sink(graph: G) -> Self {
        Self {
            registry: IdentityRegistry::new(),
            generations: BTreeMap::new(),
            last_seen: BTreeMap::new(),
            graph,
        }
    }

    /// Handle a "block translated" callback.
    ///
    /// Bumps the generation of the (state, address) alias and returns the
    /// new value. Wraps at 16.
    pub fn on_block_translated(&mut self, state: EngineStateId, address: u64) -> Generation {
        let generation = self
            .generations
            .entry(StatePc::new(state, address))
            .or_default();
        *generation = generation.next();
        *generation
    }

    /// Handle a "block entered" callback.
    ///
    /// Emits `last -> current` into the sink and makes `current` the new
    /// last-seen node of the state. `last` is 0 when the state has not
    /// executed anything yet.
    ///
    /// # Panics
    ///
    /// Panics if `address` is not a sign-extended 48-bit value.
    pub fn on_block_entered(&mut self, state: EngineStateId, address: u64) -> Edge {
        let current = self.node_id(state, address);
        let internal = self.registry.get(state);
        let last = self
            .last_seen
            .insert(internal, current)
            .unwrap_or(PackedNodeId::NONE);

        let edge = Edge::new(last.value(), current.value());
        self.graph.insert_edge(edge.from, edge.to);
        edge
    }

    /// Handle a "state forked" callback.
    ///
    /// Every child other than `parent` moves to a fresh internal id that
    /// starts from the parent's last-seen node, so its first block links
    /// back to the fork point.
    pub fn on_fork(&mut self, parent: EngineStateId, children: &[EngineStateId]) {
        let parent_id = self.registry.get(parent);
        let inherited = self.last_seen.get(&parent_id).copied();

        for &child in children.iter().filter(|&&child| child != parent) {
            let child_id = self.registry.advance(child);
            if let Some(node) = inherited {
                self.last_seen.insert(child_id, node);
            }
        }
    }

    /// Current generation of the (state, address) alias.
    #[must_use]
    pub fn generation(&self, state: EngineStateId, address: u64) -> Generation {
        self.generations
            .get(&StatePc::new(state, address))
            .copied()
            .unwrap_or_default()
    }

    /// Node key a "block entered" callback would produce right now.
    ///
    /// # Panics
    ///
    /// Panics if `address` is not a sign-extended 48-bit value.
    #[must_use]
    pub fn node_id(&self, state: EngineStateId, address: u64) -> PackedNodeId {
        codec::pack(
            address,
            self.generation(state, address),
            state.alias_bits(),
        )
    }

    /// Last node `state` executed, or the sentinel if none.
    #[must_use]
    pub fn last_seen(&self, state: EngineStateId) -> PackedNodeId {
        self.registry
            .peek(state)
            .and_then(|id| self.last_seen.get(&id).copied())
            .unwrap_or(PackedNodeId::NONE)
    }

    /// The sink edges are written to.
    pub fn graph(&self) -> &G {
        &self.graph
    }

    /// Tear the tracker down, keeping the sink.
    pub fn into_graph(self) -> G {
        self.graph
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{pack, unpack};

    const S7: EngineStateId = EngineStateId(7);

    #[test]
    fn first_block_links_from_sentinel() {
        let mut tracker = ControlFlowTracker::new();
        let edge = tracker.on_block_entered(S7, 0x1000);

        assert_eq!(edge.from, 0);
        assert_eq!(edge.to, pack(0x1000, Generation::ZERO, 7).value());
        assert!(tracker.graph().contains_edge(edge.from, edge.to));
    }

    #[test]
    fn consecutive_blocks_link_to_each_other() {
        let mut tracker = ControlFlowTracker::new();
        tracker.on_block_entered(S7, 0x1000);
        let edge = tracker.on_block_entered(S7, 0x1004);

        assert_eq!(edge.from, pack(0x1000, Generation::ZERO, 7).value());
        assert_eq!(edge.to, pack(0x1004, Generation::ZERO, 7).value());
        assert_eq!(tracker.last_seen(S7).value(), edge.to);
    }

    #[test]
    fn retranslation_creates_new_node() {
        let mut tracker = ControlFlowTracker::new();
        tracker.on_block_translated(S7, 0x2000);
        let first = tracker.on_block_entered(S7, 0x2000);
        tracker.on_block_translated(S7, 0x2000);
        let second = tracker.on_block_entered(S7, 0x2000);

        assert_ne!(first.to, second.to);
        assert_eq!(second.from, first.to);
        assert_eq!(unpack(PackedNodeId(second.to)).generation.value(), 2);
    }

    #[test]
    fn generation_wraps_after_sixteen_translations() {
        let mut tracker = ControlFlowTracker::new();
        tracker.on_block_translated(S7, 0x3000);
        let after_one = tracker.node_id(S7, 0x3000);

        for _ in 0..16 {
            tracker.on_block_translated(S7, 0x3000);
        }

        assert_eq!(tracker.node_id(S7, 0x3000), after_one);
    }

    #[test]
    fn generations_are_scoped_per_state() {
        let mut tracker = ControlFlowTracker::new();
        tracker.on_block_translated(S7, 0x1000);

        assert_eq!(tracker.generation(S7, 0x1000).value(), 1);
        assert_eq!(tracker.generation(EngineStateId(8), 0x1000).value(), 0);
        assert_eq!(tracker.generation(S7, 0x1004).value(), 0);
    }

    #[test]
    fn states_keep_separate_predecessors() {
        let mut tracker = ControlFlowTracker::new();
        tracker.on_block_entered(S7, 0x1000);
        let other = tracker.on_block_entered(EngineStateId(8), 0x1000);

        assert_eq!(other.from, 0);
        assert_ne!(other.to, pack(0x1000, Generation::ZERO, 7).value());
    }

    #[test]
    fn forked_child_links_back_to_fork_point() {
        let mut tracker = ControlFlowTracker::new();
        let parent = EngineStateId(0);
        let child = EngineStateId(1);

        let fork_point = tracker.on_block_entered(parent, 0x4000).to;
        tracker.on_fork(parent, &[parent, child]);
        let edge = tracker.on_block_entered(child, 0x4010);

        assert_eq!(edge.from, fork_point);
        assert_eq!(tracker.last_seen(parent).value(), fork_point);
    }

    #[test]
    fn reused_engine_id_starts_from_fork_point_not_old_history() {
        let mut tracker = ControlFlowTracker::new();
        let parent = EngineStateId(0);
        let reused = EngineStateId(1);

        tracker.on_block_entered(reused, 0x9000);
        let fork_point = tracker.on_block_entered(parent, 0x4000).to;
        tracker.on_fork(parent, &[reused]);

        assert_eq!(tracker.last_seen(reused).value(), fork_point);
    }

    #[test]
    #[should_panic(expected = "48-bit packing")]
    fn non_canonical_address_aborts_session() {
        let mut tracker = ControlFlowTracker::new();
        tracker.on_block_entered(S7, 0x0001_0000_0000_0000);
    }
}
