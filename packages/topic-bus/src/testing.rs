//! Testing utilities for code built on the event bus.
//!
//! # Feature Flag
//!
//! This module is only available with the `testing` feature:
//!
//! ```toml
//! [dev-dependencies]
//! topic-bus = { version = "0.1", features = ["testing"] }
//! ```
//!
//! # Deterministic Scheduling
//!
//! [`ManualScheduler`] queues next-tick tasks and timers instead of running
//! them, so a test decides exactly when the bus drains and when time passes:
//!
//! ```ignore
//! use topic_bus::testing::{ManualScheduler, Recorder};
//!
//! let scheduler = ManualScheduler::new();
//! let bus = EventBus::new(BusConfig::default(), scheduler.clone());
//! let recorder = Recorder::new();
//! bus.subscribe("didSave", &recorder.handler("editor"), "editor")?;
//!
//! let delivery = bus.publish("didSave", json!({}))?;
//! assert!(recorder.take().is_empty()); // nothing delivered yet
//!
//! scheduler.run_until_idle();
//! assert_eq!(recorder.take(), vec!["editor"]);
//! assert!(delivery.now_or_never().is_some());
//! ```

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::core::Handler;
use crate::scheduler::{Scheduler, Task, TimerHandle};

// =============================================================================
// Manual Scheduler
// =============================================================================

#[derive(Default)]
struct ManualState {
    ticks: VecDeque<Task>,
    timers: BTreeMap<(Duration, u64), Task>,
    now: Duration,
    next_timer: u64,
}

/// A scheduler driven by hand, with a virtual clock starting at zero.
///
/// Clones share the same queue and clock. Tasks always run without the
/// internal lock held, so they may schedule further work.
#[derive(Clone, Default)]
pub struct ManualScheduler {
    state: Arc<Mutex<ManualState>>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ManualState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Runs the oldest pending next-tick task. Returns false if there was none.
    pub fn run_next_tick(&self) -> bool {
        let task = self.lock().ticks.pop_front();
        match task {
            Some(task) => {
                task();
                true
            }
            None => false,
        }
    }

    /// Runs next-tick tasks, including newly scheduled ones, until none are
    /// left. Returns how many ran.
    pub fn run_until_idle(&self) -> usize {
        let mut ran = 0;
        while self.run_next_tick() {
            ran += 1;
        }
        ran
    }

    /// Moves the virtual clock forward, firing due timers in deadline order.
    ///
    /// Pending ticks are run to idle before the clock moves and after every
    /// fired timer.
    pub fn advance(&self, by: Duration) {
        self.run_until_idle();
        let target = self.lock().now + by;
        loop {
            let due = {
                let mut state = self.lock();
                let next_key = state
                    .timers
                    .keys()
                    .next()
                    .copied()
                    .filter(|(deadline, _)| *deadline <= target);
                next_key.and_then(|key| {
                    state.now = key.0;
                    state.timers.remove(&key)
                })
            };
            let Some(task) = due else { break };
            task();
            self.run_until_idle();
        }
        self.lock().now = target;
    }

    /// Time elapsed on the virtual clock.
    pub fn now(&self) -> Duration {
        self.lock().now
    }

    pub fn pending_ticks(&self) -> usize {
        self.lock().ticks.len()
    }

    pub fn pending_timers(&self) -> usize {
        self.lock().timers.len()
    }
}

impl Scheduler for ManualScheduler {
    fn next_tick(&self, task: Task) {
        self.lock().ticks.push_back(task);
    }

    fn set_timeout(&self, delay: Duration, task: Task) -> TimerHandle {
        let key = {
            let mut state = self.lock();
            let key = (state.now + delay, state.next_timer);
            state.next_timer += 1;
            state.timers.insert(key, task);
            key
        };
        let state = Arc::downgrade(&self.state);
        TimerHandle::new(move || {
            if let Some(state) = state.upgrade() {
                let removed = state
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .timers
                    .remove(&key);
                // dropped outside the lock; a task may own bus state
                drop(removed);
            }
        })
    }
}

impl fmt::Debug for ManualScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("ManualScheduler")
            .field("now", &state.now)
            .field("ticks", &state.ticks.len())
            .field("timers", &state.timers.len())
            .finish()
    }
}

// =============================================================================
// Recorder
// =============================================================================

/// Shared, ordered log of calls, for asserting delivery order.
#[derive(Clone, Default)]
pub struct Recorder {
    calls: Arc<Mutex<Vec<String>>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<String>> {
        self.calls.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Appends an entry.
    pub fn push(&self, entry: impl Into<String>) {
        self.lock().push(entry.into());
    }

    /// A handler that records `tag` for every event it receives.
    pub fn handler(&self, tag: &str) -> Handler {
        let recorder = self.clone();
        let tag = tag.to_string();
        Handler::new(move |_, _| {
            recorder.push(tag.clone());
            Ok(())
        })
    }

    /// A handler that records `tag:<event name>` for every event it receives.
    pub fn named_handler(&self, tag: &str) -> Handler {
        let recorder = self.clone();
        let tag = tag.to_string();
        Handler::new(move |event, _| {
            recorder.push(format!("{tag}:{}", event.name));
            Ok(())
        })
    }

    /// Returns a copy of all entries.
    pub fn snapshot(&self) -> Vec<String> {
        self.lock().clone()
    }

    /// Returns and clears all entries.
    pub fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.lock())
    }
}

impl fmt::Debug for Recorder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.lock().iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push_task(recorder: &Recorder, entry: &'static str) -> Task {
        let recorder = recorder.clone();
        Box::new(move || recorder.push(entry))
    }

    #[test]
    fn test_ticks_run_in_order_only_when_asked() {
        let scheduler = ManualScheduler::new();
        let recorder = Recorder::new();
        scheduler.next_tick(push_task(&recorder, "a"));
        scheduler.next_tick(push_task(&recorder, "b"));

        assert!(recorder.snapshot().is_empty());
        assert_eq!(scheduler.pending_ticks(), 2);
        assert_eq!(scheduler.run_until_idle(), 2);
        assert_eq!(recorder.take(), vec!["a", "b"]);
    }

    #[test]
    fn test_tasks_may_schedule_more_ticks() {
        let scheduler = ManualScheduler::new();
        let recorder = Recorder::new();
        let inner_scheduler = scheduler.clone();
        let inner_recorder = recorder.clone();
        scheduler.next_tick(Box::new(move || {
            inner_recorder.push("outer");
            inner_scheduler.next_tick(push_task(&inner_recorder, "inner"));
        }));

        assert!(scheduler.run_next_tick());
        assert_eq!(recorder.snapshot(), vec!["outer"]);
        assert_eq!(scheduler.run_until_idle(), 1);
        assert_eq!(recorder.take(), vec!["outer", "inner"]);
    }

    #[test]
    fn test_timers_fire_in_deadline_order() {
        let scheduler = ManualScheduler::new();
        let recorder = Recorder::new();
        let _late = scheduler.set_timeout(Duration::from_millis(30), push_task(&recorder, "late"));
        let _early = scheduler.set_timeout(Duration::from_millis(10), push_task(&recorder, "early"));

        scheduler.advance(Duration::from_millis(9));
        assert!(recorder.snapshot().is_empty());

        scheduler.advance(Duration::from_millis(25));
        assert_eq!(recorder.take(), vec!["early", "late"]);
        assert_eq!(scheduler.now(), Duration::from_millis(34));
    }

    #[test]
    fn test_cancelled_timer_never_fires() {
        let scheduler = ManualScheduler::new();
        let recorder = Recorder::new();
        let handle = scheduler.set_timeout(Duration::from_millis(5), push_task(&recorder, "x"));
        assert_eq!(scheduler.pending_timers(), 1);

        handle.cancel();
        assert_eq!(scheduler.pending_timers(), 0);
        scheduler.advance(Duration::from_secs(1));
        assert!(recorder.snapshot().is_empty());
    }
}
