//! Report command: time spent per domain.

use std::fmt::Write as _;
use std::io::Write;

use anyhow::{Context, Result};
use serde::Serialize;
use tabtime_core::{AggregateMap, TRACKER_STORAGE_KEY};
use tabtime_db::SqliteStore;

const EMPTY_MESSAGE: &str = "No usage data recorded yet. Start browsing!";

/// One row of the JSON report.
#[derive(Debug, Clone, Serialize)]
pub struct DomainEntry {
    pub domain: String,
    pub seconds: f64,
}

/// JSON report.
#[derive(Debug, Clone, Serialize)]
pub struct ReportJson {
    pub domains: Vec<DomainEntry>,
    pub total_seconds: f64,
}

pub fn run<W: Write>(writer: &mut W, store: &SqliteStore, json: bool) -> Result<()> {
    let stored = store
        .get_value(TRACKER_STORAGE_KEY)
        .context("failed to read tracking data")?;
    let aggregate = AggregateMap::from_stored(stored.as_ref());

    if json {
        writeln!(writer, "{}", format_report_json(&aggregate)?)?;
    } else {
        write!(writer, "{}", format_report(&aggregate))?;
    }
    Ok(())
}

/// Formats seconds as `1h 2m 3s`, omitting zero hours and minutes.
#[expect(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    reason = "totals are non-negative and far below u64::MAX seconds"
)]
pub fn format_seconds(seconds: f64) -> String {
    let total = seconds.max(0.0).floor() as u64;
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let secs = total % 60;

    let mut output = String::new();
    if hours > 0 {
        let _ = write!(output, "{hours}h ");
    }
    if minutes > 0 {
        let _ = write!(output, "{minutes}m ");
    }
    let _ = write!(output, "{secs}s");
    output
}

/// Text report: domains with recorded time, largest first, then a total.
pub fn format_report(aggregate: &AggregateMap) -> String {
    let entries = aggregate.ranked();
    if entries.is_empty() {
        return format!("{EMPTY_MESSAGE}\n");
    }

    let width = entries
        .iter()
        .map(|(domain, _)| domain.len())
        .max()
        .unwrap_or(0)
        .max("Total".len());

    let mut output = String::new();
    for (domain, seconds) in &entries {
        let _ = writeln!(output, "{domain:<width$}  {}", format_seconds(*seconds));
    }
    let _ = writeln!(
        output,
        "{:<width$}  {}",
        "Total",
        format_seconds(aggregate.total())
    );
    output
}

/// JSON report including zero entries.
pub fn format_report_json(aggregate: &AggregateMap) -> Result<String> {
    let mut domains: Vec<DomainEntry> = aggregate
        .iter()
        .map(|(domain, seconds)| DomainEntry {
            domain: domain.to_string(),
            seconds,
        })
        .collect();
    domains.sort_by(|a, b| {
        b.seconds
            .total_cmp(&a.seconds)
            .then_with(|| a.domain.cmp(&b.domain))
    });

    let report = ReportJson {
        domains,
        total_seconds: aggregate.total(),
    };
    Ok(serde_json::to_string_pretty(&report)?)
}
