//! Inspection of bus activity for development visibility.
//!
//! Inspectors are notified of three kinds of activity:
//!
//! | Action      | source          | target            | event          |
//! |-------------|-----------------|-------------------|----------------|
//! | `Subscribe` | label           | `"-"`             | pattern        |
//! | `Publish`   | event sender    | `"-"`             | event name     |
//! | `Deliver`   | event sender    | subscriber label  | event name     |
//!
//! Inspectors observe; they cannot veto or alter anything. They run
//! synchronously, on the thread doing the subscribe, publish or drain, so
//! they should be cheap.
//!
//! [`InspectionLog`] records notifications into a bounded buffer, which is
//! handy in tests and in diagnostic tools:
//!
//! ```ignore
//! let log = Arc::new(InspectionLog::new());
//! bus.add_inspector(log.inspector());
//! // ...
//! for record in log.deliveries_of("didNavigate.home") {
//!     println!("{} -> {}", record.source, record.target);
//! }
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::core::{CycleId, Event};

/// Maximum number of records an [`InspectionLog`] retains by default.
const DEFAULT_CAPACITY: usize = 1000;

/// Callback receiving inspections.
pub type Inspector = Arc<dyn Fn(&Inspection<'_>) + Send + Sync>;

// =============================================================================
// Inspection
// =============================================================================

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InspectAction {
    Subscribe,
    Publish,
    Deliver,
}

impl fmt::Display for InspectAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            InspectAction::Subscribe => "subscribe",
            InspectAction::Publish => "publish",
            InspectAction::Deliver => "deliver",
        })
    }
}

/// A single notification handed to inspectors.
#[derive(Debug, Clone, Copy)]
pub struct Inspection<'a> {
    pub action: InspectAction,
    /// Subscriber label for `Subscribe`, event sender otherwise.
    pub source: &'a str,
    /// Receiving subscriber for `Deliver`.
    pub target: &'a str,
    /// Event name, or the pattern for `Subscribe`.
    pub event_name: &'a str,
    /// The pattern the receiving subscription was made for (`Deliver` only).
    pub subscribed_to: Option<&'a str>,
    /// The event itself (`Publish` and `Deliver`).
    pub event: Option<&'a Event>,
    /// Current cycle, if any.
    pub cycle_id: Option<CycleId>,
}

// =============================================================================
// Inspection Log
// =============================================================================

/// Owned copy of an [`Inspection`], with the time it was recorded.
#[derive(Debug, Clone, Serialize)]
pub struct InspectionRecord {
    pub action: InspectAction,
    pub source: String,
    pub target: String,
    pub event_name: String,
    pub subscribed_to: Option<String>,
    pub cycle_id: Option<CycleId>,
    pub recorded_at: DateTime<Utc>,
}

impl InspectionRecord {
    fn from_inspection(inspection: &Inspection<'_>) -> Self {
        Self {
            action: inspection.action,
            source: inspection.source.to_string(),
            target: inspection.target.to_string(),
            event_name: inspection.event_name.to_string(),
            subscribed_to: inspection.subscribed_to.map(str::to_string),
            cycle_id: inspection.cycle_id,
            recorded_at: Utc::now(),
        }
    }
}

/// Thread-safe, bounded record of inspections.
///
/// Keeps the most recent records only; the oldest one is evicted once the
/// capacity is reached.
#[derive(Debug)]
pub struct InspectionLog {
    records: Mutex<VecDeque<InspectionRecord>>,
    capacity: usize,
}

impl Default for InspectionLog {
    fn default() -> Self {
        Self::new()
    }
}

impl InspectionLog {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Creates a log retaining at most `capacity` records.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            records: Mutex::new(VecDeque::with_capacity(capacity.min(DEFAULT_CAPACITY))),
            capacity,
        }
    }

    fn lock_records(&self) -> MutexGuard<'_, VecDeque<InspectionRecord>> {
        // a panicking reader must not take the log down with it
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Records one inspection.
    pub fn record(&self, inspection: &Inspection<'_>) {
        let record = InspectionRecord::from_inspection(inspection);
        let mut records = self.lock_records();
        if records.len() >= self.capacity {
            records.pop_front();
        }
        records.push_back(record);
    }

    /// Returns an inspector that records into this log.
    pub fn inspector(self: &Arc<Self>) -> impl Fn(&Inspection<'_>) + Send + Sync + 'static {
        let log = Arc::clone(self);
        move |inspection: &Inspection<'_>| log.record(inspection)
    }

    /// All retained records, oldest first.
    pub fn entries(&self) -> Vec<InspectionRecord> {
        self.lock_records().iter().cloned().collect()
    }

    /// The `n` most recent records, newest first.
    pub fn recent(&self, n: usize) -> Vec<InspectionRecord> {
        self.lock_records().iter().rev().take(n).cloned().collect()
    }

    /// `Deliver` records for the given event name, in delivery order.
    pub fn deliveries_of(&self, event_name: &str) -> Vec<InspectionRecord> {
        self.lock_records()
            .iter()
            .filter(|r| r.action == InspectAction::Deliver && r.event_name == event_name)
            .cloned()
            .collect()
    }

    /// Records of one action kind, oldest first.
    pub fn of_action(&self, action: InspectAction) -> Vec<InspectionRecord> {
        self.lock_records()
            .iter()
            .filter(|r| r.action == action)
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.lock_records().clear();
    }

    pub fn len(&self) -> usize {
        self.lock_records().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_records().is_empty()
    }

    /// Counts per action kind.
    pub fn stats(&self) -> InspectionStats {
        let records = self.lock_records();
        let count = |action| records.iter().filter(|r| r.action == action).count();
        InspectionStats {
            subscribes: count(InspectAction::Subscribe),
            publishes: count(InspectAction::Publish),
            deliveries: count(InspectAction::Deliver),
        }
    }
}

/// Summary counts of an [`InspectionLog`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InspectionStats {
    pub subscribes: usize,
    pub publishes: usize,
    pub deliveries: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deliver<'a>(event_name: &'a str, target: &'a str) -> Inspection<'a> {
        Inspection {
            action: InspectAction::Deliver,
            source: "AxFlowController",
            target,
            event_name,
            subscribed_to: Some(event_name),
            event: None,
            cycle_id: Some(CycleId::new(1)),
        }
    }

    fn subscribe<'a>(pattern: &'a str, label: &'a str) -> Inspection<'a> {
        Inspection {
            action: InspectAction::Subscribe,
            source: label,
            target: "-",
            event_name: pattern,
            subscribed_to: None,
            event: None,
            cycle_id: None,
        }
    }

    #[test]
    fn test_log_records_in_order() {
        let log = InspectionLog::new();
        log.record(&subscribe("didNavigate", "widget#1"));
        log.record(&deliver("didNavigate.home", "widget#1"));

        let entries = log.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].action, InspectAction::Subscribe);
        assert_eq!(entries[0].source, "widget#1");
        assert_eq!(entries[1].target, "widget#1");
        assert_eq!(entries[1].subscribed_to.as_deref(), Some("didNavigate.home"));
    }

    #[test]
    fn test_log_is_bounded() {
        let log = InspectionLog::with_capacity(3);
        for target in ["a", "b", "c", "d", "e"] {
            log.record(&deliver("x", target));
        }

        assert_eq!(log.len(), 3);
        let targets: Vec<_> = log.entries().into_iter().map(|r| r.target).collect();
        assert_eq!(targets, vec!["c", "d", "e"]);
    }

    #[test]
    fn test_recent_is_newest_first() {
        let log = InspectionLog::new();
        for target in ["a", "b", "c"] {
            log.record(&deliver("x", target));
        }

        let targets: Vec<_> = log.recent(2).into_iter().map(|r| r.target).collect();
        assert_eq!(targets, vec!["c", "b"]);
    }

    #[test]
    fn test_deliveries_of_filters_by_event_and_action() {
        let log = InspectionLog::new();
        log.record(&subscribe("x", "a"));
        log.record(&deliver("x", "a"));
        log.record(&deliver("y", "b"));
        log.record(&deliver("x", "c"));

        let targets: Vec<_> = log
            .deliveries_of("x")
            .into_iter()
            .map(|r| r.target)
            .collect();
        assert_eq!(targets, vec!["a", "c"]);
    }

    #[test]
    fn test_stats_and_clear() {
        let log = Arc::new(InspectionLog::new());
        let inspector = log.inspector();
        inspector(&subscribe("x", "a"));
        inspector(&deliver("x", "a"));
        inspector(&deliver("x", "b"));

        assert_eq!(
            log.stats(),
            InspectionStats {
                subscribes: 1,
                publishes: 0,
                deliveries: 2
            }
        );
        assert_eq!(log.of_action(InspectAction::Subscribe).len(), 1);

        log.clear();
        assert!(log.is_empty());
    }

    #[test]
    fn test_record_serializes_action_lowercase() {
        let log = InspectionLog::new();
        log.record(&subscribe("x", "a"));
        let json = serde_json::to_value(&log.entries()[0]).unwrap();
        assert_eq!(json["action"], "subscribe");
        assert_eq!(json["event_name"], "x");
    }
}
