//! # amba
//!
//! The main binary for amba.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐   IPC socket    ┌──────────────────────────────┐
//! │  engine plugin   │ ─── snapshots ─▶│  amba listen                 │
//! │  (amba-core      │                 │  (external analysis process) │
//! │   Session)       │ ◀── priorities ─│                              │
//! └──────────────────┘                 └──────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```bash
//! # Replay a recorded run
//! amba replay -f events.json
//!
//! # Replay while an external process listens and prioritizes states
//! amba listen --socket /tmp/amba.sock --prioritize 3,42 &
//! amba replay -f events.json --publish /tmp/amba.sock
//!
//! # Inspect node keys
//! amba pack --address 0x1000 --state 7
//! amba decode 0x0070000000001000
//! ```

use amba::cli;
use amba::config::{Config, LogFormat, LoggingConfig};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// =============================================================================
// APPLICATION ENTRY POINT
// =============================================================================

fn main() {
    let cli = cli::Cli::parse();

    // A broken config file is reported with the default subscriber.
    let config = Config::load(cli.config.as_deref());
    let logging = match &config {
        Ok(config) => config.logging.clone(),
        Err(_) => {
            let mut fallback = Config::default();
            fallback.apply_overrides(|key| std::env::var(key).ok());
            fallback.logging
        }
    };
    init_tracing(&logging, cli.verbose, cli.quiet);

    let result = config.and_then(|config| cli::execute(cli, &config));
    if let Err(e) = result {
        tracing::error!("Error: {}", e);
        std::process::exit(1);
    }
}

/// Install the global subscriber. `RUST_LOG` wins over the configured
/// filter; `--verbose`/`--quiet` adjust the configured one.
fn init_tracing(logging: &LoggingConfig, verbose: bool, quiet: bool) {
    let fallback = if verbose {
        "amba=debug".to_string()
    } else if quiet {
        "amba=warn".to_string()
    } else {
        logging.filter.clone()
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| fallback.into());

    match logging.format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}
