//! Command-line host for the meshgate engine.
//!
//! Connects to a coordinator behind a serial-to-TCP bridge, keeps the
//! configuration in a snapshot file and drives the engine from a poll thread.

mod host;
mod tcp;

use std::path::PathBuf;

use clap::Parser;
use meshgate_engine::{ConfigError, EngineError, FieldBinding};
use thiserror::Error;

pub use host::*;
pub use tcp::*;

/// Runner failures.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// Settings could not be loaded.
    #[error("settings: {0}")]
    Config(#[from] ConfigError),

    /// The engine failed.
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Output could not be serialized.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The signal handler could not be installed.
    #[error("signal handler: {0}")]
    Signal(#[from] ctrlc::Error),

    /// The poll thread is gone.
    #[error("poll thread stopped")]
    Stopped,
}

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "meshgate")]
#[command(about = "Protocol engine host for a mesh-network coordinator", version)]
pub struct Args {
    /// Coordinator bridge address (host:port).
    #[arg(short, long)]
    pub connect: String,

    /// Engine settings (YAML).
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Configuration snapshot file.
    #[arg(long, default_value = "meshgate.cfg")]
    pub state: PathBuf,

    /// Poll period in milliseconds.
    #[arg(long, default_value_t = 250)]
    pub period_ms: u64,

    /// Driver command to run once started (repeatable).
    #[arg(long = "command", value_name = "LINE")]
    pub commands: Vec<String>,

    /// Stop after this many poll cycles.
    #[arg(long)]
    pub cycles: Option<u64>,

    /// Print every field as JSON on exit.
    #[arg(long)]
    pub dump_fields: bool,

    /// Log every record in hex.
    #[arg(long)]
    pub trace_frames: bool,
}

/// Fields as pretty-printed JSON.
pub fn field_dump(fields: &[FieldBinding]) -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(fields)
}
