// ── Datapoint state ──
//
// Per-object bookkeeping shared by every protocol: seen/updated
// timestamps and the change-of-value decision, including suppression of
// changes that arrive inside the minimum interval.

pub mod debounce;
pub mod metadata;

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use debounce::{DebounceRule, DebounceTable};
pub use metadata::{EntryMetadata, MetadataTemplate, SourceDescriptor};

/// Decimal places used when no precision is configured.
pub const DEFAULT_COV_PRECISION: u32 = 3;

/// Change-of-value policy for one controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CovPolicy {
    /// Decimal places compared when deciding whether a numeric value moved.
    pub precision: u32,
    /// Shortest gap between two emitted changes.
    pub minimum_interval: Duration,
    /// Per-object precision, first match wins.
    pub overrides: Vec<PrecisionRule>,
}

impl Default for CovPolicy {
    fn default() -> Self {
        Self {
            precision: DEFAULT_COV_PRECISION,
            minimum_interval: Duration::from_secs(30),
            overrides: Vec::new(),
        }
    }
}

impl CovPolicy {
    /// Precision for an object, matched on its name, description or units.
    pub fn precision_for(&self, name: &str, description: &str, units: &str) -> u32 {
        let fields = [name, description, units];
        self.overrides
            .iter()
            .find(|rule| fields.iter().any(|f| f.contains(rule.pattern.as_str())))
            .map_or(self.precision, |rule| rule.precision)
    }
}

/// Objects whose name, description or units contain `pattern` compare
/// values at `precision` decimal places.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrecisionRule {
    pub pattern: String,
    pub precision: u32,
}

/// Comparison key for a value at `precision` decimal places.
///
/// Numbers (and numeric strings) round; anything else compares by its
/// JSON text.
pub fn cov_key(value: &serde_json::Value, precision: u32) -> String {
    let numeric = match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse::<f64>().ok(),
        serde_json::Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    };
    match numeric {
        Some(f) => {
            let places = usize::try_from(precision).unwrap_or(usize::MAX);
            format!("{f:.places$}")
        }
        None => value.to_string(),
    }
}

// ── Observation ─────────────────────────────────────────────────────

/// What a received value means for emission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// First value seen for this datapoint. Recorded, not emitted.
    Initial,
    /// Same value at the configured precision.
    Unchanged,
    /// Changed inside the minimum interval. The caller must keep its
    /// previous property snapshot.
    Suppressed,
    /// Changed and due for emission.
    Changed,
}

impl Observation {
    pub fn should_emit(self) -> bool {
        matches!(self, Self::Changed)
    }
}

// ── CovTracker ──────────────────────────────────────────────────────

/// Seen/updated timestamps for one datapoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CovTracker {
    pub previous_seen: Option<DateTime<Utc>>,
    pub last_seen: Option<DateTime<Utc>>,
    pub last_updated: Option<DateTime<Utc>>,
}

impl CovTracker {
    /// Start tracking an object at discovery time.
    pub fn discovered(now: DateTime<Utc>) -> Self {
        Self {
            previous_seen: Some(now),
            last_seen: Some(now),
            last_updated: None,
        }
    }

    /// Record a poll result whose comparison key moved from `previous`
    /// to `updated`.
    pub fn observe(
        &mut self,
        previous: Option<&str>,
        updated: Option<&str>,
        now: DateTime<Utc>,
        minimum_interval: Duration,
    ) -> Observation {
        let initial = previous.is_none() && updated.is_some();
        if initial {
            self.last_seen = Some(now);
        }

        self.previous_seen = self.last_seen;
        self.last_seen = Some(now);

        let (Some(previous), Some(updated)) = (previous, updated) else {
            return if initial {
                Observation::Initial
            } else {
                Observation::Unchanged
            };
        };
        if previous == updated {
            return Observation::Unchanged;
        }

        if let Some(last) = self.last_updated {
            let elapsed = (now - last).to_std().unwrap_or(Duration::ZERO);
            if elapsed < minimum_interval {
                return Observation::Suppressed;
            }
        }
        self.last_updated = Some(now);
        Observation::Changed
    }

    /// Seconds between the two most recent observations.
    #[allow(clippy::cast_precision_loss, clippy::as_conversions)]
    pub fn time_accuracy(&self) -> f64 {
        match (self.previous_seen, self.last_seen) {
            (Some(prev), Some(last)) => (last - prev).num_milliseconds() as f64 / 1000.0,
            _ => 0.0,
        }
    }
}
