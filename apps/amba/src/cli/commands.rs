//! # CLI Command Implementations
//!
//! This module contains the actual implementations of CLI commands.

use crate::config::Config;
use amba_core::codec::is_canonical;
use amba_core::primitives::{GENERATION_LIMIT, STATE_LIMIT};
use amba_core::{
    AmbaError, EngineEvent, EngineStateId, Generation, PackedNodeId, Prioritizer, Scheduler,
    Session, SessionStatus, pack, unpack,
};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

#[cfg(unix)]
use amba_core::ipc::{self, IpcMessage};

// =============================================================================
// FILE SIZE LIMITS
// =============================================================================

/// Maximum size of a recorded event log (100 MB).
const MAX_EVENT_LOG_SIZE: u64 = 100 * 1024 * 1024;

/// Read a file after checking that it is a regular file of bounded size.
fn read_bounded(path: &Path, max_size: u64) -> Result<String, AmbaError> {
    let metadata = std::fs::metadata(path)
        .map_err(|e| AmbaError::IoError(format!("Cannot read '{}': {}", path.display(), e)))?;

    if !metadata.is_file() {
        return Err(AmbaError::IoError(format!(
            "'{}' is not a regular file",
            path.display()
        )));
    }
    if metadata.len() > max_size {
        return Err(AmbaError::IoError(format!(
            "File size {} bytes exceeds maximum allowed {} bytes",
            metadata.len(),
            max_size
        )));
    }

    std::fs::read_to_string(path)
        .map_err(|e| AmbaError::IoError(format!("Cannot read '{}': {}", path.display(), e)))
}

/// Print `value` as pretty JSON.
fn print_json(value: &impl serde::Serialize) -> Result<(), AmbaError> {
    let output = serde_json::to_string_pretty(value)
        .map_err(|e| AmbaError::SerializationError(e.to_string()))?;
    println!("{}", output);
    Ok(())
}

// =============================================================================
// LOGGING SCHEDULER
// =============================================================================

/// Scheduler stand-in for replays: logs every priority set it is given.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingScheduler;

/// Prioritization capability of [`LoggingScheduler`].
#[derive(Debug)]
struct LoggingPrioritizer;

impl Prioritizer for LoggingPrioritizer {
    fn apply_priority_set(&self, states: &BTreeSet<EngineStateId>) {
        let ids: Vec<i32> = states.iter().map(|state| state.0).collect();
        tracing::info!(states = ?ids, "priority set applied");
    }
}

impl Scheduler for LoggingScheduler {
    fn prioritizer(&self) -> Option<Arc<dyn Prioritizer>> {
        Some(Arc::new(LoggingPrioritizer))
    }
}

// =============================================================================
// REPLAY COMMAND
// =============================================================================

/// Parse a recorded event log.
pub fn load_events(file: &Path) -> Result<Vec<EngineEvent>, AmbaError> {
    let content = read_bounded(file, MAX_EVENT_LOG_SIZE)?;
    serde_json::from_str(&content).map_err(|e| {
        AmbaError::SerializationError(format!("Invalid event log '{}': {}", file.display(), e))
    })
}

/// Replay a recorded event log through a fresh session.
///
/// With `publish`, the session connects to that socket for the duration of
/// the replay and sends both graphs before detaching.
pub fn cmd_replay(
    config: &Config,
    json_mode: bool,
    file: &Path,
    publish: Option<&Path>,
) -> Result<SessionStatus, AmbaError> {
    let events = load_events(file)?;
    tracing::info!(events = events.len(), file = ?file, "replaying event log");

    let mut session = Session::new();
    let mut tx = match publish {
        Some(socket) => Some(connect(&mut session, config, socket)?),
        None => None,
    };

    session.apply_all(&events)?;

    #[cfg(unix)]
    if let Some(tx) = tx.as_mut() {
        let sent = session.publish(tx)?;
        tracing::info!(sent, "graph snapshots published");
    }

    // Join the bridge (and its half of the socket) before hanging up.
    let status = session.status();
    let _ = session.detach();
    drop(tx);

    if json_mode {
        print_json(&status)?;
    } else {
        println!("Replay complete");
        println!("  Events applied:     {}", status.events_applied);
        println!(
            "  Control-flow graph: {} nodes, {} edges",
            status.control_flow_nodes, status.control_flow_edges
        );
        println!(
            "  Lineage graph:      {} nodes, {} edges",
            status.lineage_nodes, status.lineage_edges
        );
        println!("  Live states:        {}", status.live_states);
        if let Some(bridge) = status.bridge {
            println!(
                "  Bridge:             {} directives, {} states applied, {} dropped",
                bridge.directives, bridge.states_applied, bridge.states_dropped
            );
        }
    }

    Ok(status)
}

#[cfg(unix)]
fn connect(
    session: &mut Session,
    config: &Config,
    socket: &Path,
) -> Result<ipc::IpcTx<std::os::unix::net::UnixStream>, AmbaError> {
    let mut session_config = config.session.clone();
    session_config.socket_path = socket.to_path_buf();
    session.connect_ipc(&session_config, &LoggingScheduler)
}

#[cfg(not(unix))]
fn connect(_session: &mut Session, _config: &Config, _socket: &Path) -> Result<(), AmbaError> {
    Err(AmbaError::IoError(
        "Unix sockets are not available on this platform".to_string(),
    ))
}

// =============================================================================
// DECODE / PACK COMMANDS
// =============================================================================

/// Print the fields of a packed node id.
pub fn cmd_decode(json_mode: bool, id: u64) -> Result<(), AmbaError> {
    let key = PackedNodeId(id);
    let fields = unpack(key);

    if json_mode {
        print_json(&serde_json::json!({
            "id": id,
            "hex": key.to_string(),
            "address": fields.address,
            "generation": fields.generation.value(),
            "state": fields.state,
            "sentinel": key.is_none(),
        }))
    } else {
        println!("Node {}", key);
        println!("  Address:    {:#018x}", fields.address);
        println!("  Generation: {}", fields.generation.value());
        println!("  State:      {}", fields.state);
        Ok(())
    }
}

/// Print the node id of an (address, generation, state) triple.
pub fn cmd_pack(json_mode: bool, address: u64, generation: u8, state: u16) -> Result<(), AmbaError> {
    if !is_canonical(address) || generation >= GENERATION_LIMIT || state >= STATE_LIMIT {
        return Err(AmbaError::InvalidEvent(format!(
            "({address:#x}, {generation}, {state}) does not fit a packed node id"
        )));
    }

    let key = pack(address, Generation::new(generation), state);

    if json_mode {
        print_json(&serde_json::json!({
            "id": key.value(),
            "hex": key.to_string(),
        }))
    } else {
        println!("{}", key);
        Ok(())
    }
}

// =============================================================================
// LISTEN COMMAND
// =============================================================================

/// Bind `socket`, accept one engine connection, optionally send a
/// prioritization directive, and print every snapshot until the engine
/// disconnects. Returns the number of snapshots received.
///
/// An engine that exits before reading the directive resets the
/// connection; that still counts as a normal disconnect.
#[cfg(unix)]
pub fn cmd_listen(
    json_mode: bool,
    socket: &Path,
    prioritize: Option<&[i32]>,
    receive_timeout: std::time::Duration,
) -> Result<usize, AmbaError> {
    use std::os::unix::fs::FileTypeExt;
    use std::os::unix::net::UnixListener;

    // Leftover from a previous run; anything else at that path is kept.
    if let Ok(metadata) = std::fs::symlink_metadata(socket)
        && metadata.file_type().is_socket()
    {
        std::fs::remove_file(socket).map_err(|e| AmbaError::IoError(e.to_string()))?;
    }

    let listener = UnixListener::bind(socket)
        .map_err(|e| AmbaError::IoError(format!("Cannot bind '{}': {}", socket.display(), e)))?;
    tracing::info!(socket = ?socket, "waiting for engine connection");

    let (stream, _) = listener
        .accept()
        .map_err(|e| AmbaError::IoError(e.to_string()))?;
    let (mut tx, mut rx) = ipc::split(stream, receive_timeout)?;
    tracing::info!("engine connected");

    if let Some(states) = prioritize {
        let directive =
            IpcMessage::PrioritizeStates(states.iter().copied().map(EngineStateId).collect());
        match tx.blocking_send(&directive) {
            Ok(()) => tracing::info!(states = ?states, "prioritization directive sent"),
            Err(e) if e.is_disconnect() => {
                tracing::warn!(error = %e, "engine gone before the directive was sent");
            }
            Err(e) => {
                let _ = std::fs::remove_file(socket);
                return Err(e.into());
            }
        }
    }

    let mut received = 0usize;
    loop {
        match rx.blocking_receive() {
            Ok(IpcMessage::GraphSnapshot { name, graph }) => {
                received = received.saturating_add(1);
                if json_mode {
                    println!(
                        "{}",
                        serde_json::json!({
                            "graph": name,
                            "nodes": graph.node_count(),
                            "edges": graph.edge_count(),
                        })
                    );
                } else {
                    println!(
                        "{}: {} nodes, {} edges",
                        name,
                        graph.node_count(),
                        graph.edge_count()
                    );
                }
            }
            Ok(other) => {
                tracing::debug!(kind = other.kind(), "ignoring message from engine");
            }
            Err(e) if e.is_disconnect() => break,
            Err(e) => {
                let _ = std::fs::remove_file(socket);
                return Err(e.into());
            }
        }
    }

    tracing::info!(snapshots = received, "engine disconnected");
    let _ = std::fs::remove_file(socket);
    Ok(received)
}

#[cfg(not(unix))]
pub fn cmd_listen(
    _json_mode: bool,
    _socket: &Path,
    _prioritize: Option<&[i32]>,
    _receive_timeout: std::time::Duration,
) -> Result<usize, AmbaError> {
    Err(AmbaError::IoError(
        "Unix sockets are not available on this platform".to_string(),
    ))
}
