// ── Device-class debounce ──
//
// Some device classes restamp an unchanged sample as new. Sources whose
// identity contains a configured pattern only count as changed when the
// reported sample time moved by at least the rule's window.

use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebounceRule {
    /// Substring matched against the source identity.
    pub pattern: String,
    pub window: Duration,
}

impl DebounceRule {
    pub fn new(pattern: impl Into<String>, window: Duration) -> Self {
        Self {
            pattern: pattern.into(),
            window,
        }
    }

    pub fn matches(&self, source: &str) -> bool {
        source.contains(&self.pattern)
    }
}

/// Debounce rules plus the last accepted sample time per source.
#[derive(Debug, Default)]
pub struct DebounceTable {
    rules: Vec<DebounceRule>,
    accepted: DashMap<String, DateTime<Utc>>,
}

impl DebounceTable {
    pub fn new(rules: Vec<DebounceRule>) -> Self {
        Self {
            rules,
            accepted: DashMap::new(),
        }
    }

    pub fn rules(&self) -> &[DebounceRule] {
        &self.rules
    }

    /// Whether a sample reported at `reported` for `source` is a real
    /// change. Sources without a matching rule always are.
    pub fn is_change(&self, source: &str, reported: DateTime<Utc>) -> bool {
        let Some(rule) = self.rules.iter().find(|r| r.matches(source)) else {
            return true;
        };

        if let Some(stored) = self.accepted.get(source) {
            let gap = (reported - *stored).abs().to_std().unwrap_or(Duration::ZERO);
            if gap < rule.window {
                return false;
            }
        }
        self.accepted.insert(source.to_owned(), reported);
        true
    }
}
