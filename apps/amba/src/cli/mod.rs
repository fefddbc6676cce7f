//! # amba CLI Module
//!
//! ## Available Commands
//!
//! - `replay` - Run a recorded engine event log through a session
//! - `decode` - Split a packed node id into its fields
//! - `pack` - Build a packed node id
//! - `listen` - Play the external side of the IPC socket

mod commands;

use crate::config::Config;
use amba_core::AmbaError;
use amba_core::codec::is_canonical;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub use commands::*;

// =============================================================================
// CLI STRUCTURE
// =============================================================================

/// amba - control-flow and state-lineage graphs for multi-path execution
#[derive(Parser, Debug)]
#[command(name = "amba")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Only log warnings and errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Path to a TOML configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Output in JSON format (for programmatic access)
    #[arg(long, global = true)]
    pub json_mode: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Replay a recorded engine event log
    Replay {
        /// JSON array of engine events
        #[arg(short, long)]
        file: PathBuf,

        /// Connect to this socket, run the prioritization bridge and
        /// publish both graphs when done
        #[arg(short, long)]
        publish: Option<PathBuf>,
    },

    /// Decode a packed node id (decimal or 0x-prefixed hex)
    Decode {
        /// Packed node id
        #[arg(value_parser = parse_u64)]
        id: u64,
    },

    /// Pack an address, generation and state alias into a node id
    Pack {
        /// Code address (decimal or 0x-prefixed hex), sign-extended 48-bit
        #[arg(short, long, value_parser = parse_address)]
        address: u64,

        /// Re-translation generation (0-15)
        #[arg(short, long, default_value = "0",
              value_parser = clap::value_parser!(u8).range(0..16))]
        generation: u8,

        /// State alias (0-4095)
        #[arg(short, long, value_parser = clap::value_parser!(u16).range(0..4096))]
        state: u16,
    },

    /// Accept one engine connection and print the snapshots it sends
    Listen {
        /// Socket path (defaults to the configured one)
        #[arg(short, long)]
        socket: Option<PathBuf>,

        /// Engine state ids to prioritize, comma-separated
        #[arg(long, value_delimiter = ',', allow_negative_numbers = true)]
        prioritize: Option<Vec<i32>>,
    },
}

// =============================================================================
// ARGUMENT PARSING
// =============================================================================

/// Parse a decimal or `0x`-prefixed hexadecimal `u64`.
pub fn parse_u64(raw: &str) -> Result<u64, String> {
    let raw = raw.trim();
    let parsed = match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(&hex.replace('_', ""), 16),
        None => raw.replace('_', "").parse(),
    };
    parsed.map_err(|e| format!("'{raw}' is not a 64-bit number: {e}"))
}

/// Parse an address that survives 48-bit packing.
pub fn parse_address(raw: &str) -> Result<u64, String> {
    let address = parse_u64(raw)?;
    if !is_canonical(address) {
        return Err(format!(
            "{address:#x} is not a sign-extended 48-bit address"
        ));
    }
    Ok(address)
}

// =============================================================================
// COMMAND EXECUTION
// =============================================================================

/// Execute the CLI with parsed arguments.
pub fn execute(cli: Cli, config: &Config) -> Result<(), AmbaError> {
    let json_mode = cli.json_mode;

    match cli.command {
        Commands::Replay { file, publish } => {
            cmd_replay(config, json_mode, &file, publish.as_deref()).map(|_| ())
        }
        Commands::Decode { id } => cmd_decode(json_mode, id),
        Commands::Pack {
            address,
            generation,
            state,
        } => cmd_pack(json_mode, address, generation, state),
        Commands::Listen { socket, prioritize } => {
            let socket = socket.unwrap_or_else(|| config.session.socket_path.clone());
            cmd_listen(
                json_mode,
                &socket,
                prioritize.as_deref(),
                config.session.bridge.receive_timeout(),
            )
            .map(|_| ())
        }
    }
}
