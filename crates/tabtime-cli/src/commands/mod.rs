//! CLI subcommand implementations.

pub mod clear;
pub mod report;
pub mod run;
pub mod status;
pub mod stopwatch;
pub mod timer;
