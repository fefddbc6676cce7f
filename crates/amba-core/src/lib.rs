//! # amba-core
//!
//! Engine-side instrumentation for a multi-path (symbolic) execution
//! engine.
//!
//! The engine reports block translations, block entries, state forks and
//! state merges. This crate turns those callbacks into two graphs:
//!
//! - a **control-flow graph** over packed (address, generation, state)
//!   node keys, built by [`ControlFlowTracker`];
//! - a **state-lineage graph** over internal state ids, built by
//!   [`StateLineageTracker`].
//!
//! It also runs the [`PrioritizationBridge`], a background thread that
//! relays "favor these states" directives from an external process to the
//! engine's scheduler.
//!
//! ## Architectural Constraints
//!
//! - Tracker callbacks are synchronous and never block
//! - Deterministic: `BTreeMap`/`BTreeSet` only, no floats
//! - Exactly one background thread, owned by the bridge
//! - No async runtime, no listening sockets (those live in `apps/amba`)

// =============================================================================
// MODULES
// =============================================================================

pub mod bridge;
pub mod codec;
pub mod control_flow;
pub mod graph;
pub mod ipc;
pub mod lineage;
pub mod primitives;
pub mod registry;
pub mod session;
pub mod types;

// =============================================================================
// RE-EXPORTS: Core Types (from types module)
// =============================================================================

pub use types::{
    AmbaError, Edge, EngineEvent, EngineStateId, Generation, InternalStateId, PackedNodeId,
    StateMetadata, Unpacked,
};

// =============================================================================
// RE-EXPORTS: Graph Tracking
// =============================================================================

pub use codec::{pack, unpack};
pub use control_flow::{ControlFlowTracker, StatePc};
pub use graph::{EdgeWeight, Graph, GraphSink, GraphSnapshot, WeightedEdge};
pub use lineage::StateLineageTracker;
pub use registry::IdentityRegistry;
pub use session::{Session, SessionConfig, SessionStatus, SharedLiveStates};

// =============================================================================
// RE-EXPORTS: IPC & Prioritization
// =============================================================================

pub use bridge::{
    BridgeConfig, BridgeState, BridgeStats, DirectiveChannel, LiveStates, PrioritizationBridge,
    Prioritizer, QueueChannel, Scheduler, queue_channel,
};
pub use ipc::{IpcError, IpcMessage, IpcRx, IpcTx};
