//! Per-domain running totals.
//!
//! The aggregate is persisted as a single JSON object (`{domain: seconds}`)
//! under [`TRACKER_STORAGE_KEY`]. There is no version field.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::DomainKey;

/// Well-known store key holding the aggregate map.
pub const TRACKER_STORAGE_KEY: &str = "tabUsageTracker";

/// Accumulated seconds per domain.
///
/// Totals only ever grow; the only way to shrink the map is to remove the
/// stored key entirely.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AggregateMap(BTreeMap<String, f64>);

impl AggregateMap {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a map from a stored value, tolerating foreign data.
    ///
    /// Entries with empty keys or values that are not finite, non-negative
    /// numbers are skipped. A missing or non-object value yields an empty map.
    pub fn from_stored(value: Option<&Value>) -> Self {
        let Some(Value::Object(entries)) = value else {
            if let Some(other) = value {
                tracing::warn!(value = %other, "ignoring malformed aggregate");
            }
            return Self::new();
        };

        let mut map = BTreeMap::new();
        for (domain, seconds) in entries {
            match seconds.as_f64() {
                Some(seconds) if !domain.is_empty() && seconds.is_finite() && seconds >= 0.0 => {
                    map.insert(domain.clone(), seconds);
                }
                _ => tracing::warn!(%domain, value = %seconds, "skipping malformed aggregate entry"),
            }
        }
        Self(map)
    }

    /// Converts the map to the JSON value written to the store.
    pub fn to_value(&self) -> Value {
        Value::Object(
            self.0
                .iter()
                .map(|(domain, seconds)| (domain.clone(), Value::from(*seconds)))
                .collect(),
        )
    }

    /// Adds `seconds` to the total for `domain`, creating the entry if needed.
    ///
    /// Negative and non-finite amounts are treated as zero so a total never
    /// decreases.
    pub fn add(&mut self, domain: &DomainKey, seconds: f64) {
        let seconds = if seconds.is_finite() { seconds.max(0.0) } else { 0.0 };
        *self.0.entry(domain.as_str().to_string()).or_insert(0.0) += seconds;
    }

    /// Returns the total for a domain, if recorded.
    pub fn get(&self, domain: &str) -> Option<f64> {
        self.0.get(domain).copied()
    }

    /// Sum of all totals.
    pub fn total(&self) -> f64 {
        self.0.values().sum()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates over all entries in domain order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.0.iter().map(|(domain, seconds)| (domain.as_str(), *seconds))
    }

    /// Entries with time recorded, largest total first.
    ///
    /// Ties are broken by domain name so the order is stable.
    pub fn ranked(&self) -> Vec<(&str, f64)> {
        let mut entries: Vec<_> = self.iter().filter(|(_, seconds)| *seconds > 0.0).collect();
        entries.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        entries
    }
}
