//! Tracing/logging initialization.
//!
//! The receiver usually runs headless (tray app, systemd unit), so besides
//! stdout it can append to a log file next to the config.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;

use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::error::Result;

/// Logging options resolved from the command line.
#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    /// Default `RUST_LOG` value when the env-var is not set
    /// (e.g. `"printsalot_receiver=info"`).
    pub default_filter: String,
    /// Emit structured JSON log lines instead of the human-readable format.
    pub json: bool,
    /// Append to this file instead of writing to stdout.
    pub file: Option<PathBuf>,
}

/// Initialise the global tracing subscriber.
pub fn init_tracing(options: &LogOptions) -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| options.default_filter.clone()),
    );

    let writer = match &options.file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            BoxMakeWriter::new(Mutex::new(file))
        }
        None => BoxMakeWriter::new(std::io::stdout),
    };
    let layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(options.file.is_none());

    if options.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(layer.json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(layer)
            .init();
    }
    Ok(())
}
