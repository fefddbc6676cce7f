//! # Session Module
//!
//! One engine run, from plugin attach to detach.
//!
//! A `Session` owns both trackers, the set of live engine states and,
//! optionally, the prioritization bridge. Engine callbacks arrive here
//! (directly or as recorded [`EngineEvent`]s) and are fanned out to the
//! trackers that care about them.
//!
//! ## Teardown
//!
//! The bridge is stopped and joined before the trackers and the live-state
//! set are dropped. Graphs are never persisted: [`Session::detach`] hands
//! them back to the caller, otherwise they are discarded.

use crate::bridge::{BridgeConfig, BridgeStats, LiveStates, PrioritizationBridge, Scheduler};
use crate::codec::is_canonical;
use crate::control_flow::ControlFlowTracker;
use crate::graph::Graph;
use crate::ipc::{IpcMessage, IpcTx};
use crate::lineage::StateLineageTracker;
use crate::primitives::{BASIC_BLOCKS_GRAPH, DEFAULT_SOCKET_PATH, SYMBOLIC_STATES_GRAPH};
use crate::{AmbaError, Edge, EngineEvent, EngineStateId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};

// =============================================================================
// LIVE STATES
// =============================================================================

/// Live engine states, shared between the session and the bridge thread.
#[derive(Debug, Clone, Default)]
pub struct SharedLiveStates(Arc<RwLock<BTreeSet<EngineStateId>>>);

impl SharedLiveStates {
    /// Create an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `state` live.
    pub fn insert(&self, state: EngineStateId) {
        self.0
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(state);
    }

    /// Mark `state` gone.
    pub fn remove(&self, state: EngineStateId) {
        self.0
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&state);
    }

    /// Number of live states.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether no state is live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl LiveStates for SharedLiveStates {
    fn live_states(&self) -> BTreeSet<EngineStateId> {
        self.0.read().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Session settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Path of the amba IPC socket.
    pub socket_path: PathBuf,
    /// Prioritization bridge timing.
    pub bridge: BridgeConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            bridge: BridgeConfig::default(),
        }
    }
}

// =============================================================================
// STATUS
// =============================================================================

/// Summary of a session, for logs and the CLI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStatus {
    /// Engine events applied so far.
    pub events_applied: u64,
    /// Nodes in the control-flow graph.
    pub control_flow_nodes: usize,
    /// Edges in the control-flow graph.
    pub control_flow_edges: usize,
    /// Nodes in the state-lineage graph.
    pub lineage_nodes: usize,
    /// Edges in the state-lineage graph.
    pub lineage_edges: usize,
    /// Engine states currently live.
    pub live_states: usize,
    /// Bridge counters, if a bridge is attached.
    pub bridge: Option<BridgeStats>,
}

// =============================================================================
// SESSION
// =============================================================================

/// One instrumented engine run.
#[derive(Debug)]
pub struct Session {
    // Declared first: dropped (and joined) before everything else.
    bridge: Option<PrioritizationBridge>,
    control_flow: ControlFlowTracker,
    lineage: StateLineageTracker,
    live: SharedLiveStates,
    events_applied: u64,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    /// Create a session with empty graphs and no live states.
    #[must_use]
    pub fn new() -> Self {
        Self {
            bridge: None,
            control_flow: ControlFlowTracker::new(),
            lineage: StateLineageTracker::new(),
            live: SharedLiveStates::new(),
            events_applied: 0,
        }
    }

    // =========================================================================
    // EVENTS
    // =========================================================================

    /// Apply one recorded engine event.
    ///
    /// Unlike the direct callbacks, recorded events are checked first: an
    /// address that cannot be packed is rejected instead of aborting.
    pub fn apply(&mut self, event: &EngineEvent) -> Result<(), AmbaError> {
        let address = match event {
            EngineEvent::BlockTranslated { address, .. }
            | EngineEvent::BlockEntered { address, .. } => Some(*address),
            EngineEvent::StateFork { .. } | EngineEvent::StateMerge { .. } => None,
        };
        if let Some(address) = address
            && !is_canonical(address)
        {
            return Err(AmbaError::InvalidEvent(format!(
                "address {address:#x} is not a sign-extended 48-bit value"
            )));
        }

        match event {
            EngineEvent::BlockTranslated { state, address } => {
                self.on_block_translated(*state, *address);
            }
            EngineEvent::BlockEntered { state, address } => {
                self.on_block_entered(*state, *address);
            }
            EngineEvent::StateFork { parent, children } => {
                self.on_state_fork(*parent, children)?;
            }
            EngineEvent::StateMerge {
                destination,
                source,
            } => {
                self.on_state_merge(*destination, *source)?;
            }
        }
        Ok(())
    }

    /// Apply events in order, stopping at the first rejected one.
    pub fn apply_all<'a>(
        &mut self,
        events: impl IntoIterator<Item = &'a EngineEvent>,
    ) -> Result<(), AmbaError> {
        for event in events {
            self.apply(event)?;
        }
        Ok(())
    }

    /// "Block translated" callback.
    pub fn on_block_translated(&mut self, state: EngineStateId, address: u64) {
        let generation = self.control_flow.on_block_translated(state, address);
        tracing::trace!(%state, address, generation = generation.value(), "block translated");
        self.events_applied = self.events_applied.saturating_add(1);
    }

    /// "Block entered" callback.
    ///
    /// # Panics
    ///
    /// Panics if `address` is not a sign-extended 48-bit value.
    pub fn on_block_entered(&mut self, state: EngineStateId, address: u64) -> Edge {
        self.live.insert(state);
        let edge = self.control_flow.on_block_entered(state, address);
        tracing::trace!(%state, from = edge.from, to = edge.to, "block entered");
        self.events_applied = self.events_applied.saturating_add(1);
        edge
    }

    /// "State forked" callback.
    ///
    /// Rejects a fork without children. The lineage edges are flushed to
    /// the graph immediately.
    pub fn on_state_fork(
        &mut self,
        parent: EngineStateId,
        children: &[EngineStateId],
    ) -> Result<(), AmbaError> {
        if children.is_empty() {
            return Err(AmbaError::InvalidEvent(format!(
                "fork of {parent} without children"
            )));
        }

        self.control_flow.on_fork(parent, children);
        let emitted = self.lineage.on_fork(parent, children).len();
        self.lineage.flush();

        self.live.insert(parent);
        for &child in children {
            self.live.insert(child);
        }

        tracing::debug!(%parent, children = children.len(), edges = emitted, "state forked");
        self.events_applied = self.events_applied.saturating_add(1);
        Ok(())
    }

    /// "State merged" callback.
    ///
    /// Rejects merging a state into itself. The source stops being live.
    pub fn on_state_merge(
        &mut self,
        destination: EngineStateId,
        source: EngineStateId,
    ) -> Result<(), AmbaError> {
        if destination == source {
            return Err(AmbaError::InvalidEvent(format!(
                "merge of {source} into itself"
            )));
        }

        let [left, right] = self.lineage.on_merge(destination, source);
        self.lineage.flush();

        self.live.remove(source);
        self.live.insert(destination);

        tracing::debug!(
            %destination,
            %source,
            merged_into = left.to,
            from = ?[left.from, right.from],
            "states merged"
        );
        self.events_applied = self.events_applied.saturating_add(1);
        Ok(())
    }

    // =========================================================================
    // INSPECTION
    // =========================================================================

    /// The control-flow graph built so far.
    #[must_use]
    pub fn control_flow_graph(&self) -> &Graph {
        self.control_flow.graph()
    }

    /// The state-lineage graph built so far.
    #[must_use]
    pub fn lineage_graph(&self) -> &Graph {
        self.lineage.graph()
    }

    /// Shared handle to the live-state set.
    #[must_use]
    pub fn live_states(&self) -> SharedLiveStates {
        self.live.clone()
    }

    /// Summary counters.
    #[must_use]
    pub fn status(&self) -> SessionStatus {
        let cfg = self.control_flow_graph();
        let lineage = self.lineage_graph();
        SessionStatus {
            events_applied: self.events_applied,
            control_flow_nodes: cfg.node_count(),
            control_flow_edges: cfg.edge_count(),
            lineage_nodes: lineage.node_count(),
            lineage_edges: lineage.edge_count(),
            live_states: self.live.len(),
            bridge: self.bridge.as_ref().map(PrioritizationBridge::stats),
        }
    }

    // =========================================================================
    // IPC
    // =========================================================================

    /// Snapshot messages for every non-empty graph.
    #[must_use]
    pub fn snapshots(&self) -> Vec<IpcMessage> {
        [
            (SYMBOLIC_STATES_GRAPH, self.lineage_graph()),
            (BASIC_BLOCKS_GRAPH, self.control_flow_graph()),
        ]
        .into_iter()
        .filter(|(_, graph)| !graph.is_empty())
        .map(|(name, graph)| IpcMessage::GraphSnapshot {
            name: name.to_string(),
            graph: graph.snapshot(),
        })
        .collect()
    }

    /// Send the current snapshots over `tx`. Returns how many were sent.
    pub fn publish<W: Write>(&self, tx: &mut IpcTx<W>) -> Result<usize, AmbaError> {
        let snapshots = self.snapshots();
        for message in &snapshots {
            tx.blocking_send(message)?;
        }
        tracing::debug!(sent = snapshots.len(), "published graph snapshots");
        Ok(snapshots.len())
    }

    /// Start the prioritization bridge on `channel`.
    ///
    /// Fails with `PrioritizationUnsupported` when the scheduler cannot
    /// apply priority sets, and with `BridgeAlreadyAttached` on a second
    /// call.
    pub fn attach_bridge<C>(
        &mut self,
        channel: C,
        scheduler: &dyn Scheduler,
        config: &BridgeConfig,
    ) -> Result<(), AmbaError>
    where
        C: crate::bridge::DirectiveChannel + 'static,
    {
        if self.bridge.is_some() {
            return Err(AmbaError::BridgeAlreadyAttached);
        }
        let engine: Arc<dyn LiveStates> = Arc::new(self.live.clone());
        self.bridge = Some(PrioritizationBridge::spawn(
            channel, engine, scheduler, config,
        )?);
        Ok(())
    }

    /// Connect to the amba socket, attach the bridge to its receiving half
    /// and return the sending half for [`Session::publish`].
    #[cfg(unix)]
    pub fn connect_ipc(
        &mut self,
        config: &SessionConfig,
        scheduler: &dyn Scheduler,
    ) -> Result<IpcTx<std::os::unix::net::UnixStream>, AmbaError> {
        let (tx, rx) = crate::ipc::connect(&config.socket_path, config.bridge.receive_timeout())?;
        self.attach_bridge(rx, scheduler, &config.bridge)?;
        tracing::info!(socket = ?config.socket_path, "connected to amba");
        Ok(tx)
    }

    /// Tear the session down: join the bridge, then return
    /// `(control_flow_graph, lineage_graph)`.
    pub fn detach(mut self) -> (Graph, Graph) {
        if let Some(bridge) = self.bridge.take() {
            let stats = bridge.shutdown();
            tracing::info!(
                cycles = stats.cycles,
                directives = stats.directives,
                "prioritization bridge joined"
            );
        }
        tracing::info!(events = self.events_applied, "session detached");
        (self.control_flow.into_graph(), self.lineage.into_graph())
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{Prioritizer, queue_channel};
    use std::time::Duration;

    const S0: EngineStateId = EngineStateId(0);
    const S1: EngineStateId = EngineStateId(1);

    struct NoPriorities;

    impl Scheduler for NoPriorities {}

    struct Ignore;

    impl Prioritizer for Ignore {
        fn apply_priority_set(&self, _states: &BTreeSet<EngineStateId>) {}
    }

    struct Accepting;

    impl Scheduler for Accepting {
        fn prioritizer(&self) -> Option<Arc<dyn Prioritizer>> {
            Some(Arc::new(Ignore))
        }
    }

    fn fast() -> BridgeConfig {
        BridgeConfig {
            poll_interval_ms: 5,
            receive_timeout_ms: 5,
        }
    }

    #[test]
    fn fork_feeds_both_graphs() {
        let mut session = Session::new();
        session.on_block_entered(S0, 0x1000);
        session.on_state_fork(S0, &[S0, S1]).expect("fork");
        session.on_block_entered(S1, 0x2000);

        let status = session.status();
        assert_eq!(status.lineage_edges, 2);
        assert_eq!(status.control_flow_edges, 2);
        assert_eq!(status.live_states, 2);
        assert_eq!(status.events_applied, 3);
    }

    #[test]
    fn fork_without_children_is_rejected() {
        let mut session = Session::new();
        let result = session.on_state_fork(S0, &[]);
        assert!(matches!(result, Err(AmbaError::InvalidEvent(_))));
        assert_eq!(session.status().events_applied, 0);
    }

    #[test]
    fn merge_into_self_is_rejected() {
        let mut session = Session::new();
        let result = session.on_state_merge(S0, S0);
        assert!(matches!(result, Err(AmbaError::InvalidEvent(_))));
        assert!(session.lineage_graph().is_empty());
    }

    #[test]
    fn merge_retires_source() {
        let mut session = Session::new();
        session.on_state_fork(S0, &[S0, S1]).expect("fork");
        session.on_state_merge(S0, S1).expect("merge");

        let live = session.live_states().live_states();
        assert!(live.contains(&S0));
        assert!(!live.contains(&S1));
        assert_eq!(session.lineage_graph().edge_count(), 4);
    }

    #[test]
    fn apply_dispatches_recorded_events() {
        let mut session = Session::new();
        let events = vec![
            EngineEvent::BlockTranslated {
                state: S0,
                address: 0x1000,
            },
            EngineEvent::BlockEntered {
                state: S0,
                address: 0x1000,
            },
            EngineEvent::StateFork {
                parent: S0,
                children: vec![S0, S1],
            },
        ];
        session.apply_all(&events).expect("apply");
        assert_eq!(session.status().events_applied, 3);
    }

    #[test]
    fn recorded_non_canonical_address_is_rejected() {
        let mut session = Session::new();
        let event = EngineEvent::BlockEntered {
            state: S0,
            address: 0x0000_8000_0000_0000,
        };
        assert!(matches!(
            session.apply(&event),
            Err(AmbaError::InvalidEvent(_))
        ));
        assert!(session.control_flow_graph().is_empty());
    }

    #[test]
    fn snapshots_skip_empty_graphs() {
        let mut session = Session::new();
        assert!(session.snapshots().is_empty());

        session.on_block_entered(S0, 0x1000);
        let snapshots = session.snapshots();
        assert_eq!(snapshots.len(), 1);
        assert!(matches!(
            &snapshots[0],
            IpcMessage::GraphSnapshot { name, .. } if name == BASIC_BLOCKS_GRAPH
        ));
    }

    #[test]
    fn publish_writes_one_frame_per_snapshot() {
        let mut session = Session::new();
        session.on_block_entered(S0, 0x1000);
        session.on_state_fork(S0, &[S0, S1]).expect("fork");

        let mut tx = IpcTx::new(Vec::new());
        assert_eq!(session.publish(&mut tx).expect("publish"), 2);

        let mut rx = crate::ipc::IpcRx::new(std::io::Cursor::new(tx.into_inner()));
        let first = rx.blocking_receive().expect("first");
        assert!(matches!(
            first,
            IpcMessage::GraphSnapshot { name, .. } if name == SYMBOLIC_STATES_GRAPH
        ));
    }

    #[test]
    fn bridge_needs_prioritizing_scheduler() {
        let mut session = Session::new();
        let (_tx, channel) = queue_channel(Duration::from_millis(5));
        let result = session.attach_bridge(channel, &NoPriorities, &fast());
        assert!(matches!(result, Err(AmbaError::PrioritizationUnsupported)));
        assert!(session.status().bridge.is_none());
    }

    #[test]
    fn second_bridge_is_rejected() {
        let mut session = Session::new();
        let (_tx1, first) = queue_channel(Duration::from_millis(5));
        let (_tx2, second) = queue_channel(Duration::from_millis(5));

        session
            .attach_bridge(first, &Accepting, &fast())
            .expect("first bridge");
        let result = session.attach_bridge(second, &Accepting, &fast());
        assert!(matches!(result, Err(AmbaError::BridgeAlreadyAttached)));

        let (cfg, lineage) = session.detach();
        assert!(cfg.is_empty());
        assert!(lineage.is_empty());
    }

    #[test]
    fn config_defaults_to_local_socket() {
        let config = SessionConfig::default();
        assert_eq!(config.socket_path, PathBuf::from("amba-ipc.socket"));
        assert_eq!(config.bridge, BridgeConfig::default());
    }
}
