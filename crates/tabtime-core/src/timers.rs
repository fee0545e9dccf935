//! Countdown timer and stopwatch with persisted, restorable state.
//!
//! Neither widget stores a ticking counter. A running countdown persists its
//! target instant and a running stopwatch its start instant, so the displayed
//! time can be derived again after a restart. Instants are stored as epoch
//! milliseconds.

use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use thiserror::Error;

use crate::store::{KeyValueStore, StoreError};

/// Countdown length used until the user picks another one.
pub const DEFAULT_COUNTDOWN_SECS: i64 = 25 * 60;

const T_IS_RUNNING: &str = "tIsRunning";
const T_TARGET_TIME: &str = "tTargetTime";
const T_REMAINING: &str = "tRemaining";

const SW_IS_RUNNING: &str = "swIsRunning";
const SW_START_TIME: &str = "swStartTime";
const SW_ELAPSED_TIME: &str = "swElapsedTime";

/// Timer errors.
#[derive(Debug, Error)]
pub enum TimerError {
    #[error(transparent)]
    Store(#[from] StoreError),
    /// A persisted field has the wrong type.
    #[error("malformed {key}: {value}")]
    Malformed { key: &'static str, value: Value },
}

/// A countdown timer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Countdown {
    running: bool,
    target: Option<DateTime<Utc>>,
    remaining_secs: i64,
}

impl Default for Countdown {
    fn default() -> Self {
        Self {
            running: false,
            target: None,
            remaining_secs: DEFAULT_COUNTDOWN_SECS,
        }
    }
}

impl Countdown {
    /// Rebuilds the countdown from persisted state.
    ///
    /// A running countdown whose target already passed is finished and
    /// persisted as stopped.
    pub async fn restore(store: &dyn KeyValueStore, now: DateTime<Utc>) -> Result<Self, TimerError> {
        let running = read_bool(store, T_IS_RUNNING).await?;
        let target = read_millis(store, T_TARGET_TIME).await?;
        let remaining = read_i64(store, T_REMAINING).await?;

        let mut countdown = Self::default();
        match (running, target) {
            (Some(true), Some(target)) => {
                countdown.running = true;
                countdown.target = Some(target);
                countdown.poll(store, now).await?;
            }
            _ => {
                if let Some(remaining) = remaining.filter(|r| *r > 0) {
                    countdown.remaining_secs = remaining;
                }
            }
        }
        Ok(countdown)
    }

    pub const fn is_running(&self) -> bool {
        self.running
    }

    /// Whole seconds left, rounded up.
    pub fn remaining_secs(&self, now: DateTime<Utc>) -> i64 {
        match (self.running, self.target) {
            (true, Some(target)) => ceil_secs((target - now).num_milliseconds()),
            _ => self.remaining_secs,
        }
    }

    /// Starts counting down from the remaining time. No-op if running.
    pub async fn start(&mut self, store: &dyn KeyValueStore, now: DateTime<Utc>) -> Result<(), TimerError> {
        if self.running {
            return Ok(());
        }
        let target = now + chrono::Duration::seconds(self.remaining_secs);
        self.running = true;
        self.target = Some(target);
        store.set(T_IS_RUNNING, json!(true)).await?;
        store.set(T_TARGET_TIME, json!(target.timestamp_millis())).await?;
        Ok(())
    }

    /// Stops counting and remembers the remaining time.
    pub async fn pause(&mut self, store: &dyn KeyValueStore, now: DateTime<Utc>) -> Result<(), TimerError> {
        self.remaining_secs = self.remaining_secs(now);
        self.running = false;
        self.target = None;
        store.set(T_IS_RUNNING, json!(false)).await?;
        store.set(T_REMAINING, json!(self.remaining_secs)).await?;
        Ok(())
    }

    /// Stops and returns to the default length, forgetting persisted state.
    pub async fn reset(&mut self, store: &dyn KeyValueStore) -> Result<(), TimerError> {
        self.set_length(store, DEFAULT_COUNTDOWN_SECS).await
    }

    /// Stops and sets a new length in minutes, forgetting persisted state.
    pub async fn set_minutes(&mut self, store: &dyn KeyValueStore, minutes: i64) -> Result<(), TimerError> {
        self.set_length(store, minutes.max(0) * 60).await
    }

    /// Finishes the countdown if its target has passed. Returns `true` when
    /// it finished on this call.
    pub async fn poll(&mut self, store: &dyn KeyValueStore, now: DateTime<Utc>) -> Result<bool, TimerError> {
        if !self.running || self.remaining_secs(now) > 0 {
            return Ok(false);
        }
        self.running = false;
        self.target = None;
        self.remaining_secs = 0;
        store.set(T_IS_RUNNING, json!(false)).await?;
        Ok(true)
    }

    /// Remaining time as `MM:SS`.
    pub fn display(&self, now: DateTime<Utc>) -> String {
        let remaining = self.remaining_secs(now);
        format!("{:02}:{:02}", remaining / 60, remaining % 60)
    }

    async fn set_length(&mut self, store: &dyn KeyValueStore, secs: i64) -> Result<(), TimerError> {
        self.running = false;
        self.target = None;
        self.remaining_secs = secs;
        for key in [T_TARGET_TIME, T_IS_RUNNING, T_REMAINING] {
            store.remove(key).await?;
        }
        Ok(())
    }
}

/// A stopwatch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Stopwatch {
    running: bool,
    start: Option<DateTime<Utc>>,
    elapsed_ms: i64,
}

impl Stopwatch {
    /// Rebuilds the stopwatch from persisted state.
    pub async fn restore(store: &dyn KeyValueStore) -> Result<Self, TimerError> {
        let running = read_bool(store, SW_IS_RUNNING).await?;
        let start = read_millis(store, SW_START_TIME).await?;
        let elapsed = read_i64(store, SW_ELAPSED_TIME).await?;

        Ok(match (running, start) {
            (Some(true), Some(start)) => Self {
                running: true,
                start: Some(start),
                elapsed_ms: 0,
            },
            _ => Self {
                elapsed_ms: elapsed.unwrap_or(0).max(0),
                ..Self::default()
            },
        })
    }

    pub const fn is_running(&self) -> bool {
        self.running
    }

    /// Milliseconds on the stopwatch at `now`.
    pub fn elapsed_ms(&self, now: DateTime<Utc>) -> i64 {
        match (self.running, self.start) {
            (true, Some(start)) => (now - start).num_milliseconds().max(0),
            _ => self.elapsed_ms,
        }
    }

    /// Starts or resumes. No-op if running.
    pub async fn start(&mut self, store: &dyn KeyValueStore, now: DateTime<Utc>) -> Result<(), TimerError> {
        if self.running {
            return Ok(());
        }
        let start = now - chrono::Duration::milliseconds(self.elapsed_ms);
        self.running = true;
        self.start = Some(start);
        store.set(SW_IS_RUNNING, json!(true)).await?;
        store.set(SW_START_TIME, json!(start.timestamp_millis())).await?;
        Ok(())
    }

    /// Pauses and remembers the elapsed time. No-op if not running.
    pub async fn pause(&mut self, store: &dyn KeyValueStore, now: DateTime<Utc>) -> Result<(), TimerError> {
        if !self.running {
            return Ok(());
        }
        self.elapsed_ms = self.elapsed_ms(now);
        self.running = false;
        store.set(SW_IS_RUNNING, json!(false)).await?;
        store.set(SW_ELAPSED_TIME, json!(self.elapsed_ms)).await?;
        Ok(())
    }

    /// Stops, zeroes and forgets persisted state.
    pub async fn reset(&mut self, store: &dyn KeyValueStore) -> Result<(), TimerError> {
        *self = Self::default();
        for key in [SW_IS_RUNNING, SW_START_TIME, SW_ELAPSED_TIME] {
            store.remove(key).await?;
        }
        Ok(())
    }

    /// Elapsed time as `MM:SS.cc`.
    pub fn display(&self, now: DateTime<Utc>) -> String {
        let elapsed = self.elapsed_ms(now);
        let total_secs = elapsed / 1000;
        format!(
            "{:02}:{:02}.{:02}",
            total_secs / 60,
            total_secs % 60,
            (elapsed % 1000) / 10
        )
    }
}

fn ceil_secs(ms: i64) -> i64 {
    if ms <= 0 { 0 } else { (ms + 999) / 1000 }
}

async fn read_bool(store: &dyn KeyValueStore, key: &'static str) -> Result<Option<bool>, TimerError> {
    match store.get(key).await? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(b)),
        Some(value) => Err(TimerError::Malformed { key, value }),
    }
}

async fn read_i64(store: &dyn KeyValueStore, key: &'static str) -> Result<Option<i64>, TimerError> {
    match store.get(key).await? {
        None | Some(Value::Null) => Ok(None),
        Some(value) => match value.as_i64() {
            Some(n) => Ok(Some(n)),
            // Whole-valued floats come back from JSON stores that only know doubles.
            #[expect(
                clippy::cast_possible_truncation,
                reason = "epoch milliseconds fit in i64"
            )]
            None => value
                .as_f64()
                .filter(|f| f.is_finite() && f.fract() == 0.0)
                .map(|f| Some(f as i64))
                .ok_or(TimerError::Malformed { key, value }),
        },
    }
}

async fn read_millis(
    store: &dyn KeyValueStore,
    key: &'static str,
) -> Result<Option<DateTime<Utc>>, TimerError> {
    let Some(ms) = read_i64(store, key).await? else {
        return Ok(None);
    };
    DateTime::from_timestamp_millis(ms)
        .map(Some)
        .ok_or(TimerError::Malformed {
            key,
            value: json!(ms),
        })
}
