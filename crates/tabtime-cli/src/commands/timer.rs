//! Timer command: countdown with state persisted between invocations.

use std::io::Write;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tabtime_core::{Countdown, KeyValueStore};

use crate::TimerAction;

pub async fn run<W: Write>(
    writer: &mut W,
    store: &dyn KeyValueStore,
    action: TimerAction,
    now: DateTime<Utc>,
) -> Result<()> {
    let countdown = match action {
        TimerAction::Reset => {
            let mut countdown = Countdown::default();
            countdown.reset(store).await.context("failed to reset timer")?;
            countdown
        }
        TimerAction::Set { minutes } => {
            let mut countdown = Countdown::default();
            countdown
                .set_minutes(store, i64::from(minutes))
                .await
                .context("failed to set timer")?;
            countdown
        }
        TimerAction::Show | TimerAction::Start | TimerAction::Pause => {
            let mut countdown = Countdown::restore(store, now)
                .await
                .context("failed to restore timer (run `tabtime timer reset` to discard it)")?;
            match action {
                TimerAction::Start => countdown.start(store, now).await,
                TimerAction::Pause => countdown.pause(store, now).await,
                _ => Ok(()),
            }
            .context("failed to update timer")?;
            countdown
        }
    };

    let state = if countdown.is_running() { "running" } else { "paused" };
    writeln!(writer, "{} ({state})", countdown.display(now))?;
    Ok(())
}
