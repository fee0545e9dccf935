//! Clear command: delete all tracked time.
//!
//! A running engine clears through its own settlement queue (the `clearAll`
//! message of `tabtime run`); this command is for when no engine is running.

use std::io::Write;

use anyhow::{Context, Result};
use tabtime_core::TRACKER_STORAGE_KEY;
use tabtime_db::SqliteStore;

pub fn run<W: Write>(writer: &mut W, store: &SqliteStore) -> Result<()> {
    let removed = store
        .remove_value(TRACKER_STORAGE_KEY)
        .context("failed to clear tracking data")?;
    if removed {
        writeln!(writer, "Tracking data successfully cleared!")?;
    } else {
        writeln!(writer, "No tracking data to clear.")?;
    }
    Ok(())
}
