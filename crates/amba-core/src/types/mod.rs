//! # Core Type Definitions
//!
//! This module contains the shared vocabulary of amba-core:
//! - State identifiers (`EngineStateId`, `InternalStateId`)
//! - Packed graph keys (`Generation`, `PackedNodeId`, `Unpacked`)
//! - Graph output (`Edge`, `StateMetadata`)
//! - Engine input (`EngineEvent`)
//! - Error types (`AmbaError`)
//!
//! ## Identity
//!
//! The engine hands out its own state identifiers and reuses them freely.
//! They are never used as long-lived graph keys directly: the trackers map
//! them to `InternalStateId`s through an `IdentityRegistry` first.

use crate::ipc::IpcError;
use crate::primitives::{GENERATION_LIMIT, STATE_LIMIT};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// =============================================================================
// STATE IDENTIFIERS
// =============================================================================

/// Identifier the execution engine assigns to one of its states.
///
/// Opaque and reused by the engine across its own lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EngineStateId(pub i32);

impl EngineStateId {
    /// Low 12 bits of the identifier, as stored in a packed node key.
    ///
    /// Engine ids that differ only above bit 11 collide here.
    #[must_use]
    pub const fn alias_bits(self) -> u16 {
        ((self.0 as u32) % (STATE_LIMIT as u32)) as u16
    }
}

impl fmt::Display for EngineStateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "state#{}", self.0)
    }
}

/// Identifier assigned by amba to one lineage slot of an engine state.
///
/// Allocated from a per-registry counter starting at 0; a given engine
/// state only ever moves to larger values.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct InternalStateId(pub u64);

impl InternalStateId {
    /// Get the raw identifier.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }
}

// =============================================================================
// PACKED NODE KEYS
// =============================================================================

/// 4-bit re-translation counter for one (state, address) pair.
///
/// Wraps silently at 16.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct Generation(u8);

impl Generation {
    /// The first generation.
    pub const ZERO: Self = Self(0);

    /// Create a generation, keeping only the low 4 bits.
    #[must_use]
    pub const fn new(raw: u8) -> Self {
        Self(raw % GENERATION_LIMIT)
    }

    /// The following generation, wrapping from 15 back to 0.
    #[must_use]
    pub const fn next(self) -> Self {
        Self((self.0 + 1) % GENERATION_LIMIT)
    }

    /// Get the raw 4-bit value.
    #[must_use]
    pub const fn value(self) -> u8 {
        self.0
    }
}

/// A 64-bit control-flow graph node key.
///
/// See [`crate::primitives`] for the bit layout. `PackedNodeId(0)` is the
/// "no predecessor" sentinel.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct PackedNodeId(pub u64);

impl PackedNodeId {
    /// The "no predecessor" sentinel.
    pub const NONE: Self = Self(crate::primitives::NO_PREDECESSOR);

    /// Get the raw key.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// Whether this is the "no predecessor" sentinel.
    #[must_use]
    pub const fn is_none(self) -> bool {
        self.0 == crate::primitives::NO_PREDECESSOR
    }
}

impl fmt::Display for PackedNodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

/// The three fields of a [`PackedNodeId`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Unpacked {
    /// Code address, sign-extended from bit 47.
    pub address: u64,
    /// Re-translation generation.
    pub generation: Generation,
    /// Low 12 bits of the engine state identifier.
    pub state: u16,
}

// =============================================================================
// GRAPH OUTPUT
// =============================================================================

/// A directed edge handed to a [`crate::GraphSink`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Edge {
    /// Source node key.
    pub from: u64,
    /// Target node key.
    pub to: u64,
}

impl Edge {
    /// Create a new edge.
    #[must_use]
    pub const fn new(from: u64, to: u64) -> Self {
        Self { from, to }
    }
}

/// Node payload of the state-lineage graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StateMetadata {
    /// The lineage slot this node stands for.
    pub lineage_id: InternalStateId,
}

impl StateMetadata {
    /// Create metadata for a lineage slot.
    #[must_use]
    pub const fn new(lineage_id: InternalStateId) -> Self {
        Self { lineage_id }
    }

    /// The graph key of this node.
    #[must_use]
    pub const fn node_key(&self) -> u64 {
        self.lineage_id.0
    }
}

// =============================================================================
// ENGINE EVENTS
// =============================================================================

/// One callback delivered by the execution engine.
///
/// Recorded event logs are JSON arrays of these, e.g.
/// `{"event": "block_entered", "state": 7, "address": 4096}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    /// The engine translated a block starting at `address`.
    BlockTranslated { state: EngineStateId, address: u64 },
    /// A state started executing the block at `address`.
    BlockEntered { state: EngineStateId, address: u64 },
    /// `parent` split into `children` (which may include `parent` itself).
    StateFork {
        parent: EngineStateId,
        children: Vec<EngineStateId>,
    },
    /// `source` was merged into `destination`.
    StateMerge {
        destination: EngineStateId,
        source: EngineStateId,
    },
}

// =============================================================================
// ERROR TYPES
// =============================================================================

/// Recoverable errors of the amba system.
///
/// Invariant violations (packing round-trip mismatch, lineage id collision)
/// are not represented here: they abort the session with a panic.
#[derive(Debug, Error)]
pub enum AmbaError {
    /// An engine event is malformed (e.g. a fork without children).
    #[error("Invalid engine event: {0}")]
    InvalidEvent(String),

    /// The active scheduler cannot apply priority sets.
    #[error("Active scheduler does not support state prioritization")]
    PrioritizationUnsupported,

    /// The background bridge is already attached to this session.
    #[error("Prioritization bridge already attached")]
    BridgeAlreadyAttached,

    /// The background thread could not be spawned.
    #[error("Thread spawn failed: {0}")]
    ThreadSpawn(String),

    /// IPC channel failure.
    #[error("IPC error: {0}")]
    Ipc(#[from] IpcError),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    IoError(String),

    /// Configuration could not be loaded.
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generation_wraps_at_sixteen() {
        let mut generation = Generation::ZERO;
        for _ in 0..15 {
            generation = generation.next();
        }
        assert_eq!(generation.value(), 15);
        assert_eq!(generation.next(), Generation::ZERO);
    }

    #[test]
    fn generation_new_keeps_low_bits() {
        assert_eq!(Generation::new(17).value(), 1);
        assert_eq!(Generation::new(15).value(), 15);
    }

    #[test]
    fn alias_bits_keep_low_twelve_bits() {
        assert_eq!(EngineStateId(7).alias_bits(), 7);
        assert_eq!(EngineStateId(4095).alias_bits(), 4095);
        assert_eq!(EngineStateId(4096).alias_bits(), 0);
        assert_eq!(EngineStateId(4096 + 42).alias_bits(), 42);
        assert_eq!(EngineStateId(-1).alias_bits(), 4095);
    }

    #[test]
    fn packed_sentinel_is_zero() {
        assert!(PackedNodeId::NONE.is_none());
        assert!(!PackedNodeId(0x1000).is_none());
        assert_eq!(PackedNodeId::default(), PackedNodeId::NONE);
    }

    #[test]
    fn state_metadata_key_is_lineage_id() {
        let meta = StateMetadata::new(InternalStateId(9));
        assert_eq!(meta.node_key(), 9);
    }

    #[test]
    fn engine_event_json_shape() {
        let event: EngineEvent =
            serde_json::from_str(r#"{"event":"block_entered","state":7,"address":4096}"#)
                .expect("parse");
        assert_eq!(
            event,
            EngineEvent::BlockEntered {
                state: EngineStateId(7),
                address: 0x1000
            }
        );

        let fork: EngineEvent =
            serde_json::from_str(r#"{"event":"state_fork","parent":0,"children":[0,1]}"#)
                .expect("parse");
        assert!(matches!(fork, EngineEvent::StateFork { children, .. } if children.len() == 2));
    }

    #[test]
    fn packed_display_is_hex() {
        assert_eq!(PackedNodeId(0x1000).to_string(), "0x0000000000001000");
    }
}
