//! Status command for showing tracker configuration and totals.

use std::io::Write;

use anyhow::{Context, Result};
use tabtime_core::{AggregateMap, TRACKER_STORAGE_KEY};
use tabtime_db::SqliteStore;

use super::report::format_seconds;
use crate::Config;

pub fn run<W: Write>(writer: &mut W, store: &SqliteStore, config: &Config) -> Result<()> {
    let stored = store
        .get_value(TRACKER_STORAGE_KEY)
        .context("failed to read tracking data")?;
    let aggregate = AggregateMap::from_stored(stored.as_ref());

    writeln!(writer, "Tab time tracker status")?;
    writeln!(writer, "Database: {}", config.database_path.display())?;
    writeln!(
        writer,
        "Tracking on start: {}",
        if config.tracking_enabled { "on" } else { "off" }
    )?;
    writeln!(writer, "Flush interval: {}ms", config.flush_interval().as_millis())?;

    if aggregate.is_empty() {
        writeln!(writer, "No domains tracked.")?;
        return Ok(());
    }

    writeln!(
        writer,
        "Domains tracked: {} ({} total)",
        aggregate.len(),
        format_seconds(aggregate.total())
    )?;
    Ok(())
}
