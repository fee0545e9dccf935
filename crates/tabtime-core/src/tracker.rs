//! Attribution state machine.
//!
//! Decides which domain is accruing time and settles elapsed time into the
//! aggregate on every tick and every attribution change.
//!
//! # Settlement
//!
//! A settlement closes the window `[last_settled_at, now]` and credits it to
//! the domain that was current for the whole window. Transitions settle
//! before switching, so a window is never credited to the domain being
//! switched to.
//!
//! Transitions never wait on the store. Under the state lock they hand the
//! window to the [`SettlementQueue`] (which keeps the writes in submission
//! order) and keep its acknowledgement as in flight. Acknowledgements are
//! collected at the next transition or tick, or by [`Tracker::settled`]. A
//! hung store therefore stalls its own settlements but no later event.
//!
//! `last_settled_at` only moves forward once the window ending there has
//! been acknowledged. A window whose write failed is carried for its domain
//! and retried with the next settlement, whatever the domain is by then.
//!
//! # Tracking toggle
//!
//! While tracking is off every transition and tick is dropped. Turning it
//! back on re-queries the host for the active tab instead of resuming the
//! attribution that was current when tracking stopped.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::aggregate::AggregateMap;
use crate::clock::Clock;
use crate::domain;
use crate::host::TabHost;
use crate::settle::{PendingSettlement, SettleError, SettlementQueue};
use crate::store::KeyValueStore;
use crate::types::{DomainKey, TabId};

/// Snapshot of the in-memory attribution.
///
/// Never persisted: after a restart it is rebuilt by asking the host which
/// tab is active.
#[derive(Debug, Clone, PartialEq)]
pub struct AttributionState {
    /// Tab whose URL decides the attribution. Kept even when its URL is
    /// untracked, so a later navigation in that tab is still followed.
    pub tab_id: Option<TabId>,
    /// Domain accruing time; `None` means idle.
    pub domain: Option<DomainKey>,
    /// End of the last acknowledged window of the current attribution.
    pub last_settled_at: DateTime<Utc>,
    /// Windows whose write failed, waiting to be retried.
    pub carried: BTreeMap<DomainKey, f64>,
}

impl AttributionState {
    fn idle(now: DateTime<Utc>) -> Self {
        Self {
            tab_id: None,
            domain: None,
            last_settled_at: now,
            carried: BTreeMap::new(),
        }
    }

    pub const fn is_idle(&self) -> bool {
        self.domain.is_none()
    }
}

/// Position of a window within one attribution.
#[derive(Debug, Clone, Copy)]
struct Window {
    epoch: u64,
    until: DateTime<Utc>,
}

/// A settlement handed to the queue and not yet acknowledged.
#[derive(Debug)]
struct InFlight {
    domain: DomainKey,
    seconds: f64,
    /// `None` for retried carried windows.
    window: Option<Window>,
    ack: PendingSettlement<f64>,
}

#[derive(Debug)]
struct Engine {
    attribution: AttributionState,
    /// Bumped whenever the attribution changes; acknowledgements of older
    /// windows no longer move `last_settled_at`.
    epoch: u64,
    /// End of the last window handed to the queue. The next window starts
    /// here, so no interval is queued twice.
    dispatched_until: DateTime<Utc>,
    in_flight: Vec<InFlight>,
    /// Creation of the aggregate, queued by [`Tracker::start`].
    initializing: Option<PendingSettlement<()>>,
}

impl Engine {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            attribution: AttributionState::idle(now),
            epoch: 0,
            dispatched_until: now,
            in_flight: Vec::new(),
            initializing: None,
        }
    }

    /// Starts a new attribution at `now`.
    fn begin(&mut self, now: DateTime<Utc>) {
        self.epoch += 1;
        self.attribution.last_settled_at = now;
        self.dispatched_until = now;
    }

    /// Moves to `tab_id`/`domain` after settling the current window.
    fn switch(
        &mut self,
        queue: &SettlementQueue,
        now: DateTime<Utc>,
        tab_id: Option<TabId>,
        domain: Option<DomainKey>,
    ) {
        self.settle(queue, now);
        self.attribution.tab_id = tab_id;
        self.attribution.domain = domain;
        self.begin(now);
    }

    /// Queues carried windows and the current window up to `now`.
    fn settle(&mut self, queue: &SettlementQueue, now: DateTime<Utc>) {
        self.collect();

        for (domain, seconds) in std::mem::take(&mut self.attribution.carried) {
            self.dispatch(queue, domain, seconds, None);
        }

        if let Some(domain) = self.attribution.domain.clone() {
            let seconds = elapsed_seconds(self.dispatched_until, now);
            if seconds > 0.0 {
                let window = Window {
                    epoch: self.epoch,
                    until: now,
                };
                self.dispatch(queue, domain, seconds, Some(window));
            }
        }
        self.dispatched_until = now;

        let epoch = self.epoch;
        let current_in_flight = self
            .in_flight
            .iter()
            .any(|f| f.window.is_some_and(|w| w.epoch == epoch));
        if !current_in_flight {
            self.attribution.last_settled_at = now;
        }
    }

    fn dispatch(
        &mut self,
        queue: &SettlementQueue,
        domain: DomainKey,
        seconds: f64,
        window: Option<Window>,
    ) {
        match queue.dispatch(domain.clone(), seconds) {
            Ok(ack) => self.in_flight.push(InFlight {
                domain,
                seconds,
                window,
                ack,
            }),
            Err(e) => self.record(domain, seconds, window, Err(e)),
        }
    }

    /// Records every acknowledgement that has already arrived.
    fn collect(&mut self) {
        if let Some(init) = self.initializing.as_mut() {
            if let Some(result) = init.try_result() {
                log_initialized(&result);
                self.initializing = None;
            }
        }
        for mut flight in std::mem::take(&mut self.in_flight) {
            match flight.ack.try_result() {
                Some(result) => self.record(flight.domain, flight.seconds, flight.window, result),
                None => self.in_flight.push(flight),
            }
        }
    }

    fn record(
        &mut self,
        domain: DomainKey,
        seconds: f64,
        window: Option<Window>,
        result: Result<f64, SettleError>,
    ) {
        match result {
            Ok(total) => debug!(%domain, seconds, total, "settlement acknowledged"),
            Err(e) => {
                warn!(%domain, seconds, error = %e, "carrying unsettled window");
                *self.attribution.carried.entry(domain).or_insert(0.0) += seconds;
            }
        }
        if let Some(window) = window {
            if window.epoch == self.epoch && window.until > self.attribution.last_settled_at {
                self.attribution.last_settled_at = window.until;
            }
        }
    }
}

/// The time-attribution engine.
///
/// One instance owns its attribution, its tracking toggle and its
/// settlement worker; independent instances do not share state. Operations
/// are serialized on an internal lock that is never held across a store or
/// host call.
pub struct Tracker {
    engine: Mutex<Engine>,
    tracking: AtomicBool,
    queue: SettlementQueue,
    host: Arc<dyn TabHost>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for Tracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tracker")
            .field("tracking", &self.is_tracking())
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}

impl Tracker {
    /// Creates an idle tracker with tracking enabled.
    ///
    /// Spawns the settlement worker, so it must be called inside a tokio
    /// runtime.
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        host: Arc<dyn TabHost>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let now = clock.now();
        Self {
            engine: Mutex::new(Engine::new(now)),
            tracking: AtomicBool::new(true),
            queue: SettlementQueue::spawn(store),
            host,
            clock,
        }
    }

    /// Sets the initial value of the tracking toggle.
    #[must_use]
    pub fn with_tracking(self, enabled: bool) -> Self {
        self.tracking.store(enabled, Ordering::SeqCst);
        self
    }

    /// Prepares the aggregate and attributes the currently active tab.
    ///
    /// This is the restart path: nothing from a previous process is resumed.
    /// The aggregate is created ahead of any settlement but not waited for.
    pub async fn start(&self) {
        match self.queue.dispatch_initialize() {
            Ok(ack) => self.engine.lock().await.initializing = Some(ack),
            Err(e) => log_initialized(&Err(e)),
        }
        self.resync().await;
    }

    /// Current value of the tracking toggle.
    pub fn is_tracking(&self) -> bool {
        self.tracking.load(Ordering::SeqCst)
    }

    /// Copy of the current attribution.
    pub async fn attribution(&self) -> AttributionState {
        self.engine.lock().await.attribution.clone()
    }

    /// The user switched to `tab_id`, currently showing `url`.
    pub async fn activate(&self, tab_id: TabId, url: &str) {
        let mut engine = self.engine.lock().await;
        if !self.is_tracking() {
            return;
        }
        let domain = domain::resolve(url);
        debug!(%tab_id, domain = ?domain.as_ref().map(DomainKey::as_str), "activated");
        engine.switch(&self.queue, self.clock.now(), Some(tab_id), domain);
    }

    /// The tracked tab navigated to `url`. Ignored for any other tab.
    pub async fn navigate(&self, tab_id: TabId, url: &str) {
        let mut engine = self.engine.lock().await;
        if !self.is_tracking() || engine.attribution.tab_id != Some(tab_id) {
            return;
        }
        let domain = domain::resolve(url);
        debug!(%tab_id, domain = ?domain.as_ref().map(DomainKey::as_str), "navigated");
        engine.switch(&self.queue, self.clock.now(), Some(tab_id), domain);
    }

    /// `tab_id` was closed or can no longer be found.
    ///
    /// If it is the tracked tab, its time is settled and the tracker goes
    /// idle.
    pub async fn deactivate_on_close(&self, tab_id: TabId) {
        let mut engine = self.engine.lock().await;
        if !self.is_tracking() || engine.attribution.tab_id != Some(tab_id) {
            return;
        }
        debug!(%tab_id, "tracked tab closed");
        engine.switch(&self.queue, self.clock.now(), None, None);
    }

    /// Settles elapsed time for the current domain without switching.
    pub async fn tick(&self) {
        let mut engine = self.engine.lock().await;
        if !self.is_tracking() {
            return;
        }
        engine.settle(&self.queue, self.clock.now());
    }

    /// Turns tracking on or off.
    ///
    /// Turning it off settles the running window and goes idle. Turning it
    /// on starts from the host's live active tab.
    pub async fn set_tracking(&self, enabled: bool) {
        {
            let mut engine = self.engine.lock().await;
            if self.is_tracking() == enabled {
                return;
            }
            let now = self.clock.now();
            if enabled {
                engine.attribution.tab_id = None;
                engine.attribution.domain = None;
                engine.begin(now);
            } else {
                engine.switch(&self.queue, now, None, None);
            }
            self.tracking.store(enabled, Ordering::SeqCst);
        }
        info!(enabled, "tracking toggled");
        if enabled {
            self.resync().await;
        }
    }

    /// Re-attributes from the host's presently active tab.
    pub async fn resync(&self) {
        if !self.is_tracking() {
            return;
        }
        match self.host.active_tab().await {
            Ok(Some(tab)) => self.activate(tab.id, &tab.url).await,
            Ok(None) => debug!("no active tab to attribute"),
            Err(e) => {
                warn!(error = %e, "active tab query failed; going idle");
                self.fall_back_to_idle().await;
            }
        }
    }

    /// Goes idle after an unexpected failure, settling what can be settled.
    pub async fn fall_back_to_idle(&self) {
        let mut engine = self.engine.lock().await;
        let now = self.clock.now();
        if self.is_tracking() {
            engine.switch(&self.queue, now, None, None);
        } else {
            engine.attribution.tab_id = None;
            engine.attribution.domain = None;
            engine.begin(now);
        }
    }

    /// Waits for every settlement queued so far to be acknowledged.
    ///
    /// Failed ones end up in [`AttributionState::carried`]. The state lock
    /// is not held while waiting.
    pub async fn settled(&self) {
        let (initializing, in_flight) = {
            let mut engine = self.engine.lock().await;
            (
                engine.initializing.take(),
                std::mem::take(&mut engine.in_flight),
            )
        };
        if let Some(init) = initializing {
            log_initialized(&init.wait().await);
        }
        let mut outcomes = Vec::with_capacity(in_flight.len());
        for flight in in_flight {
            let result = flight.ack.wait().await;
            outcomes.push((flight.domain, flight.seconds, flight.window, result));
        }

        let mut engine = self.engine.lock().await;
        for (domain, seconds, window, result) in outcomes {
            engine.record(domain, seconds, window, result);
        }
    }

    /// Reads the stored totals, ordered after all queued settlements.
    pub async fn totals(&self) -> Result<AggregateMap, SettleError> {
        self.queue.snapshot().await
    }

    /// Removes all stored totals.
    ///
    /// Settlements queued before the clear are wiped with the rest, and the
    /// current window restarts at the clear.
    pub async fn clear_all(&self) -> Result<(), SettleError> {
        let ack = {
            let mut engine = self.engine.lock().await;
            let ack = self.queue.dispatch_clear()?;
            engine.in_flight.clear();
            engine.attribution.carried.clear();
            engine.begin(self.clock.now());
            ack
        };
        ack.wait().await?;
        info!("tracking data cleared");
        Ok(())
    }
}

fn log_initialized(result: &Result<(), SettleError>) {
    match result {
        Ok(()) => debug!("aggregate initialized"),
        Err(e) => warn!(error = %e, "failed to initialize aggregate"),
    }
}

/// Seconds from `since` to `now`, never negative.
#[expect(
    clippy::cast_precision_loss,
    reason = "millisecond counts stay far below 2^52"
)]
fn elapsed_seconds(since: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    (now - since).num_milliseconds().max(0) as f64 / 1000.0
}
