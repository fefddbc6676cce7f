//! # Fixed Layout and Runtime Constants
//!
//! Compile-time constants shared by the codec, the trackers, the IPC
//! framing and the prioritization bridge.
//!
//! ## Packed Node Key Layout
//!
//! ```text
//!  63          52 51  48 47                                        0
//! ┌──────────────┬──────┬───────────────────────────────────────────┐
//! │ state (12)   │ gen 4│ code address (48, sign-extended on unpack)│
//! └──────────────┴──────┴───────────────────────────────────────────┘
//! ```

// =============================================================================
// PACKED NODE KEY
// =============================================================================

/// Width of the address field. Addresses are sign-extended from bit 47.
pub const ADDRESS_BITS: u32 = 48;

/// Width of the generation field.
pub const GENERATION_BITS: u32 = 4;

/// Width of the state field.
pub const STATE_BITS: u32 = 12;

/// Bit offset of the generation field.
pub const GENERATION_SHIFT: u32 = ADDRESS_BITS;

/// Bit offset of the state field.
pub const STATE_SHIFT: u32 = ADDRESS_BITS + GENERATION_BITS;

/// Mask selecting the address field (bits 0..=47).
pub const ADDRESS_MASK: u64 = 0x0000_FFFF_FFFF_FFFF;

/// Mask selecting the generation field (bits 48..=51).
pub const GENERATION_MASK: u64 = 0x000F_0000_0000_0000;

/// Mask selecting the state field (bits 52..=63).
pub const STATE_MASK: u64 = 0xFFF0_0000_0000_0000;

/// Sign bit of the address field.
pub const ADDRESS_SIGN_BIT: u64 = 1 << (ADDRESS_BITS - 1);

/// Number of distinguishable generations before wrap-around.
pub const GENERATION_LIMIT: u8 = 1 << GENERATION_BITS;

/// Number of distinguishable state aliases in a packed key.
pub const STATE_LIMIT: u16 = 1 << STATE_BITS;

/// Predecessor key meaning "no block executed yet on this state".
pub const NO_PREDECESSOR: u64 = 0;

// =============================================================================
// PRIORITISATION BRIDGE
// =============================================================================

/// Sleep between two bridge poll cycles.
///
/// Also the upper bound on shutdown latency after the stop flag flips.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 200;

/// Maximum time a single directive receive may block.
pub const DEFAULT_RECEIVE_TIMEOUT_MS: u64 = 200;

// =============================================================================
// IPC
// =============================================================================

/// Socket the engine plugin connects to, relative to the working directory.
pub const DEFAULT_SOCKET_PATH: &str = "amba-ipc.socket";

/// Length prefix of every IPC frame (little-endian u32).
pub const FRAME_HEADER_LEN: usize = 4;

/// Largest accepted IPC frame payload (64 MiB).
///
/// Checked against the length prefix before any allocation.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Snapshot name of the state-lineage graph.
pub const SYMBOLIC_STATES_GRAPH: &str = "symbolic states";

/// Snapshot name of the control-flow graph.
pub const BASIC_BLOCKS_GRAPH: &str = "basic blocks";
