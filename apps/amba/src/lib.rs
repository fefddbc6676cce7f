//! # amba
//!
//! Command-line front end for amba-core: event-log replay, packed node id
//! inspection and the external side of the IPC socket.
//!
//! The library target exists so integration tests can drive the commands
//! without spawning the binary.

pub mod cli;
pub mod config;
