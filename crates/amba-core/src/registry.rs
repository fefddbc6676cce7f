//! # Identity Registry
//!
//! Maps engine-assigned state identifiers to amba-assigned ones.
//!
//! The engine reuses its identifiers, so they cannot serve as long-lived
//! graph keys. Each registry hands out `InternalStateId`s from its own
//! counter, starting at 0. Entries are created lazily on first reference
//! and never removed.

use crate::{EngineStateId, InternalStateId};
use std::collections::BTreeMap;

/// Engine id → internal id mapping with a next-free counter.
#[derive(Debug, Clone, Default)]
pub struct IdentityRegistry {
    /// Current internal id of every engine state seen so far.
    ids: BTreeMap<EngineStateId, InternalStateId>,
    /// Next internal id to hand out.
    next_id: u64,
}

impl IdentityRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current internal id of `state`, allocating one on first reference.
    pub fn get(&mut self, state: EngineStateId) -> InternalStateId {
        if let Some(&id) = self.ids.get(&state) {
            return id;
        }
        let id = self.mint();
        self.ids.insert(state, id);
        id
    }

    /// Current internal id of `state` without allocating.
    #[must_use]
    pub fn peek(&self, state: EngineStateId) -> Option<InternalStateId> {
        self.ids.get(&state).copied()
    }

    /// Move `state` to a freshly minted internal id and return it.
    ///
    /// The new id is larger than every id handed out before.
    ///
    /// # Panics
    ///
    /// When the 64-bit id space is exhausted; ids are never reused.
    pub fn advance(&mut self, state: EngineStateId) -> InternalStateId {
        let id = self.mint();
        self.ids.insert(state, id);
        id
    }

    /// The id the next allocation will return.
    #[must_use]
    pub fn next_id(&self) -> u64 {
        self.next_id
    }

    /// Number of engine states seen so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Whether no engine state has been referenced yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    fn mint(&mut self) -> InternalStateId {
        assert!(
            self.next_id < u64::MAX,
            "internal state id space exhausted"
        );
        let id = InternalStateId(self.next_id);
        self.next_id += 1;
        id
    }
}
