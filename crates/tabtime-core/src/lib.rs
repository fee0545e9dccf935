//! Core engine for the browser tab time tracker.
//!
//! This crate contains:
//! - Domain resolution: mapping tab URLs to tracking buckets
//! - Attribution: deciding which domain accrues time and settling it
//! - Settlement: serialized read-modify-write of per-domain totals
//! - Scheduling: periodic flushes of the running window
//! - Host adapters: tab queries, tab notifications and status requests
//! - Countdown timer and stopwatch persistence

mod aggregate;
pub mod clock;
pub mod domain;
pub mod host;
pub mod listener;
pub mod scheduler;
pub mod settle;
pub mod store;
pub mod timers;
mod tracker;
mod types;

pub use aggregate::{AggregateMap, TRACKER_STORAGE_KEY};
pub use clock::{Clock, ManualClock, SystemClock};
pub use domain::resolve;
pub use host::{HostError, Tab, TabEvent, TabEventSource, TabHost, TabMirror};
pub use listener::{StatusRequest, TabEventListener, TrackingStatus};
pub use scheduler::{DEFAULT_FLUSH_INTERVAL, FlushScheduler};
pub use settle::{PendingSettlement, SettleError, SettlementQueue};
pub use store::{KeyValueStore, MemoryStore, StoreError};
pub use timers::{Countdown, DEFAULT_COUNTDOWN_SECS, Stopwatch, TimerError};
pub use tracker::{AttributionState, Tracker};
pub use types::{DomainKey, TabId, ValidationError};
