//! runtracker: command-line front end for the run tracker.
//!
//! Each invocation opens the run store under `~/.runtracker` (or
//! `$RUNTRACKER_HOME`), performs one command and exits. The current run is
//! remembered between invocations by the session marker.
//!
//! ## Subcommands
//!
//! - `start` / `stop`: begin or end the current run
//! - `status`: show the current run
//! - `record`: store one location sample under the current run
//! - `list` / `show`: browse recorded runs
//! - `replay`: record a whole run from a JSON-lines track file

mod commands;
mod logging;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "runtracker")]
#[command(about = "Record runs and the locations visited during them")]
#[command(version)]
struct Cli {
    /// Print machine-readable JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Start a new run
    Start {
        /// Latitude of the current position, used to seed the run
        #[arg(long, requires = "lon", allow_negative_numbers = true)]
        lat: Option<f64>,

        /// Longitude of the current position, used to seed the run
        #[arg(long, requires = "lat", allow_negative_numbers = true)]
        lon: Option<f64>,

        /// Altitude in meters
        #[arg(long, allow_negative_numbers = true)]
        alt: Option<f64>,
    },

    /// Stop the current run
    Stop,

    /// Show the current run and whether tracking is on
    Status,

    /// Record one location sample for the current run
    Record {
        #[arg(long, allow_negative_numbers = true)]
        lat: f64,

        #[arg(long, allow_negative_numbers = true)]
        lon: f64,

        /// Altitude in meters
        #[arg(long, default_value_t = 0.0, allow_negative_numbers = true)]
        alt: f64,

        /// Provider name (defaults to the configured provider)
        #[arg(long)]
        provider: Option<String>,

        /// Fix time in milliseconds since the Unix epoch (defaults to now)
        #[arg(long)]
        timestamp: Option<i64>,
    },

    /// List all runs, oldest first
    List,

    /// Show one run's details
    Show {
        #[arg(value_name = "RUN_ID")]
        id: i64,
    },

    /// Record a new run by replaying a JSON-lines track file
    Replay {
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Pause between samples
        #[arg(long, default_value_t = 0)]
        interval_ms: u64,
    },
}

fn main() {
    let cli = Cli::parse();

    let context = match commands::Context::load() {
        Ok(context) => context,
        Err(e) => {
            eprintln!("runtracker: {e}");
            std::process::exit(1);
        }
    };

    let logging_guard = logging::init(&context.paths.logs_dir());
    if let Some(err) = &context.config_error {
        tracing::warn!(error = %err, "Ignoring unreadable config; using defaults");
    }

    let result = {
        let mut stdout = std::io::stdout().lock();
        commands::run(&context, cli.command, cli.json, &mut stdout)
    };
    if let Err(e) = result {
        tracing::error!(error = %e, "runtracker failed");
        // exit skips destructors; flush the file writer first.
        drop(logging_guard);
        std::process::exit(1);
    }
}
