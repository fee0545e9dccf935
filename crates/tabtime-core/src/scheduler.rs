//! Periodic flush: ticks the tracker on a fixed period.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::tracker::Tracker;

/// Default flush period.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Drives [`Tracker::tick`] on a fixed period.
///
/// Starting a running scheduler and stopping a stopped one are no-ops.
/// Stopping only prevents future ticks: a tick already in progress runs to
/// completion, and no final settlement is made.
#[derive(Debug)]
pub struct FlushScheduler {
    period: Duration,
    running: Mutex<Option<Running>>,
}

#[derive(Debug)]
struct Running {
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

impl Default for FlushScheduler {
    fn default() -> Self {
        Self::new(DEFAULT_FLUSH_INTERVAL)
    }
}

impl FlushScheduler {
    pub const fn new(period: Duration) -> Self {
        Self {
            period,
            running: Mutex::new(None),
        }
    }

    pub const fn period(&self) -> Duration {
        self.period
    }

    /// Starts ticking `tracker`. Returns `false` if already running.
    pub fn start(&self, tracker: Arc<Tracker>) -> bool {
        let mut running = self.lock();
        if running.is_some() {
            return false;
        }

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(run(tracker, self.period, shutdown.clone()));
        *running = Some(Running { shutdown, handle });
        info!(period_ms = self.period.as_millis(), "flush scheduler started");
        true
    }

    /// Stops future ticks. Returns `false` if not running.
    pub fn stop(&self) -> bool {
        let Some(running) = self.lock().take() else {
            return false;
        };
        running.shutdown.cancel();
        // The task exits on its own after any in-progress tick.
        drop(running.handle);
        info!("flush scheduler stopped");
        true
    }

    pub fn is_running(&self) -> bool {
        self.lock().is_some()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Running>> {
        self.running
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Drop for FlushScheduler {
    fn drop(&mut self) {
        if let Some(running) = self.lock().take() {
            running.shutdown.cancel();
        }
    }
}

async fn run(tracker: Arc<Tracker>, period: Duration, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    // After a suspension, resume the cadence instead of bursting missed ticks.
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            _ = interval.tick() => tracker.tick().await,
        }
    }
    debug!("flush loop exited");
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Duration as ChronoDuration};

    use super::*;
    use crate::clock::ManualClock;
    use crate::host::TabMirror;
    use crate::store::MemoryStore;
    use crate::types::TabId;

    fn tracker_with_clock() -> (Arc<Tracker>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(
            DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
        ));
        let tracker = Tracker::new(
            Arc::new(MemoryStore::new()),
            Arc::new(TabMirror::new()),
            clock.clone(),
        );
        (Arc::new(tracker), clock)
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_settle_periodically() {
        let (tracker, clock) = tracker_with_clock();
        tracker.activate(TabId(1), "https://a.com").await;

        let scheduler = FlushScheduler::default();
        assert!(scheduler.start(tracker.clone()));

        clock.advance(ChronoDuration::seconds(1));
        tokio::time::sleep(Duration::from_millis(1500)).await;

        assert_eq!(tracker.totals().await.unwrap().get("a.com"), Some(1.0));
        scheduler.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_and_stop_are_idempotent() {
        let (tracker, _clock) = tracker_with_clock();
        let scheduler = FlushScheduler::new(Duration::from_millis(250));

        assert!(!scheduler.stop());
        assert!(scheduler.start(tracker.clone()));
        assert!(!scheduler.start(tracker.clone()));
        assert!(scheduler.is_running());

        assert!(scheduler.stop());
        assert!(!scheduler.stop());
        assert!(!scheduler.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_does_not_settle() {
        let (tracker, clock) = tracker_with_clock();
        tracker.activate(TabId(1), "https://a.com").await;

        let scheduler = FlushScheduler::default();
        scheduler.start(tracker.clone());
        scheduler.stop();

        clock.advance(ChronoDuration::seconds(30));
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(tracker.totals().await.unwrap().get("a.com"), None);

        // The unsettled window is picked up by the next explicit tick.
        tracker.tick().await;
        assert_eq!(tracker.totals().await.unwrap().get("a.com"), Some(30.0));
    }
}
