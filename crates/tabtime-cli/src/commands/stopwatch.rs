//! Stopwatch command with state persisted between invocations.

use std::io::Write;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tabtime_core::{KeyValueStore, Stopwatch};

use crate::StopwatchAction;

pub async fn run<W: Write>(
    writer: &mut W,
    store: &dyn KeyValueStore,
    action: StopwatchAction,
    now: DateTime<Utc>,
) -> Result<()> {
    let stopwatch = if let StopwatchAction::Reset = action {
        let mut stopwatch = Stopwatch::default();
        stopwatch
            .reset(store)
            .await
            .context("failed to reset stopwatch")?;
        stopwatch
    } else {
        let mut stopwatch = Stopwatch::restore(store)
            .await
            .context("failed to restore stopwatch (run `tabtime stopwatch reset` to discard it)")?;
        match action {
            StopwatchAction::Start => stopwatch.start(store, now).await,
            StopwatchAction::Pause => stopwatch.pause(store, now).await,
            StopwatchAction::Show | StopwatchAction::Reset => Ok(()),
        }
        .context("failed to update stopwatch")?;
        stopwatch
    };

    let state = if stopwatch.is_running() { "running" } else { "paused" };
    writeln!(writer, "{} ({state})", stopwatch.display(now))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use tabtime_core::MemoryStore;

    use super::*;

    fn t0() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    async fn run_at(store: &MemoryStore, action: StopwatchAction, now: DateTime<Utc>) -> String {
        let mut output = Vec::new();
        run(&mut output, store, action, now).await.unwrap();
        String::from_utf8(output).unwrap()
    }

    #[tokio::test]
    async fn test_stopwatch_across_invocations() {
        let store = MemoryStore::new();

        assert_eq!(
            run_at(&store, StopwatchAction::Start, t0()).await,
            "00:00.00 (running)\n"
        );
        let later = t0() + Duration::milliseconds(61_250);
        assert_eq!(
            run_at(&store, StopwatchAction::Show, later).await,
            "01:01.25 (running)\n"
        );
        assert_eq!(
            run_at(&store, StopwatchAction::Pause, later).await,
            "01:01.25 (paused)\n"
        );
        assert_eq!(
            run_at(&store, StopwatchAction::Show, later + Duration::hours(2)).await,
            "01:01.25 (paused)\n"
        );
        assert_eq!(
            run_at(&store, StopwatchAction::Reset, later).await,
            "00:00.00 (paused)\n"
        );
    }
}
