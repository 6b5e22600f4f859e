//! QuakeGuard CLI
//!
//! Command-line driver for the quakeguard early-warning pipeline.
//!
//! # Features
//!
//! - **simulate**: Run a scripted scenario through the full pipeline
//! - **wave**: Compute arrival times, warning time and intensity
//! - **config**: Print, write or validate a pipeline configuration
//! - **version**: Display version information
//!
//! # Usage
//!
//! ```bash
//! # Two agencies report the same quake
//! quakeguard simulate feed-merge
//!
//! # Five phones shake within eight seconds
//! quakeguard simulate crowd-quorum --format json
//!
//! # Warning time 120 km from an M6.5
//! quakeguard wave --magnitude 6.5 --distance-km 120 --soil D
//!
//! # Validate a config file
//! quakeguard config check ./quakeguard.json
//! ```

use clap::{Parser, Subcommand, ValueEnum};

pub mod config;
pub mod simulate;
pub mod wave;

/// QuakeGuard Command Line Interface
#[derive(Parser, Debug)]
#[command(name = "quakeguard")]
#[command(author, version, about = "Earthquake detection and early warning")]
#[command(propagate_version = true)]
pub struct Cli {
    /// Command to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a scripted scenario through the pipeline
    Simulate(simulate::SimulateArgs),

    /// Wave arrival and intensity calculator
    Wave(wave::WaveArgs),

    /// Configuration helpers
    #[command(subcommand)]
    Config(config::ConfigCommand),

    /// Display version information
    Version,
}

/// Output format
#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable tables
    #[default]
    Table,
    /// JSON
    Json,
}

/// Shorten a UUID-like id for table display
pub(crate) fn short_id(id: impl std::fmt::Display) -> String {
    id.to_string().chars().take(8).collect()
}
