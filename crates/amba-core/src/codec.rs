//! # Identifier Codec
//!
//! Packs a (code address, generation, state alias) triple into one 64-bit
//! control-flow node key and back.
//!
//! The address field is only 48 bits wide. Target addresses live either
//! near 0 (user space) or near the top of the address space (kernel), so
//! unpacking replicates bit 47 into bits 48..=63 to restore the canonical
//! form.
//!
//! `pack` checks its own output: if unpacking does not reproduce the
//! inputs exactly, the analysis is aborted. Continuing would silently merge
//! unrelated nodes in the graph.

use crate::primitives::{
    ADDRESS_BITS, ADDRESS_MASK, GENERATION_MASK, GENERATION_SHIFT, STATE_MASK, STATE_SHIFT,
};
use crate::{Generation, PackedNodeId, Unpacked};

/// Number of bits above the address field.
const ADDRESS_HIGH_BITS: u32 = u64::BITS - ADDRESS_BITS;

/// Pack an address, generation and state alias into a node key.
///
/// # Panics
///
/// Panics if `address` is not a sign-extended 48-bit value or `state`
/// does not fit in 12 bits.
#[must_use]
pub fn pack(address: u64, generation: Generation, state: u16) -> PackedNodeId {
    let packed = PackedNodeId(
        (address & ADDRESS_MASK)
            | ((u64::from(generation.value()) << GENERATION_SHIFT) & GENERATION_MASK)
            | ((u64::from(state) << STATE_SHIFT) & STATE_MASK),
    );

    let round_trip = unpack(packed);
    assert_eq!(
        round_trip.address, address,
        "address {address:#x} does not survive 48-bit packing"
    );
    assert_eq!(
        round_trip.generation, generation,
        "generation {generation:?} does not survive packing"
    );
    assert_eq!(
        round_trip.state, state,
        "state alias {state} does not fit in the 12-bit state field"
    );

    packed
}

/// Split a node key into its fields.
#[must_use]
pub fn unpack(packed: PackedNodeId) -> Unpacked {
    let raw = packed.value();
    Unpacked {
        address: sign_extend(raw & ADDRESS_MASK),
        generation: Generation::new(((raw & GENERATION_MASK) >> GENERATION_SHIFT) as u8),
        state: ((raw & STATE_MASK) >> STATE_SHIFT) as u16,
    }
}

/// Replicate bit 47 of a 48-bit address into bits 48..=63.
#[must_use]
pub const fn sign_extend(address: u64) -> u64 {
    (((address << ADDRESS_HIGH_BITS) as i64) >> ADDRESS_HIGH_BITS) as u64
}

/// Whether `address` can be packed without loss.
#[must_use]
pub const fn is_canonical(address: u64) -> bool {
    sign_extend(address & ADDRESS_MASK) == address
}
