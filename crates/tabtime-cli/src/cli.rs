//! Command-line argument definitions.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Browser tab time tracker.
///
/// Attributes wall-clock time to the domain of the active browser tab and
/// keeps running per-domain totals.
#[derive(Debug, Parser)]
#[command(name = "tabtime", version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to config file.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the tracking engine, reading browser messages as JSON lines on stdin.
    Run,

    /// Show time spent per domain.
    Report {
        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Delete all tracked time.
    Clear,

    /// Show current tracking status.
    Status,

    /// Control the countdown timer.
    #[command(subcommand)]
    Timer(TimerAction),

    /// Control the stopwatch.
    #[command(subcommand)]
    Stopwatch(StopwatchAction),
}

/// Countdown timer actions.
#[derive(Debug, Clone, Copy, Subcommand)]
pub enum TimerAction {
    /// Show the remaining time.
    Show,
    /// Start or resume the countdown.
    Start,
    /// Pause the countdown.
    Pause,
    /// Stop and return to 25 minutes.
    Reset,
    /// Stop and set a new length.
    Set {
        /// Length in minutes.
        minutes: u32,
    },
}

/// Stopwatch actions.
#[derive(Debug, Clone, Copy, Subcommand)]
pub enum StopwatchAction {
    /// Show the elapsed time.
    Show,
    /// Start or resume.
    Start,
    /// Pause.
    Pause,
    /// Stop and zero.
    Reset,
}
