//! Cooperative scheduling primitives the bus runs on.
//!
//! The bus never spawns work on its own. It asks its [`Scheduler`] for two
//! things:
//!
//! - **next tick**: run a task soon, after the current task has finished.
//!   Every drain of the event queue is one such task.
//! - **timeout**: run a task after a delay, cancellable. The request-will-did
//!   coordinator uses this for its pending reply timeout.
//!
//! [`TokioScheduler`] implements both on a tokio runtime. Tests can inject
//! `testing::ManualScheduler` instead and step through ticks and virtual time
//! by hand.

use std::fmt;
use std::time::Duration;

use tokio::runtime::Handle;

use crate::error::BusError;

/// A unit of deferred work.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Source of next-tick and timeout callbacks.
pub trait Scheduler: Send + Sync + 'static {
    /// Runs `task` after the current task yields.
    ///
    /// Tasks scheduled from the same thread must run in scheduling order.
    fn next_tick(&self, task: Task);

    /// Runs `task` once `delay` has elapsed, unless the returned handle is
    /// cancelled first.
    fn set_timeout(&self, delay: Duration, task: Task) -> TimerHandle;
}

// =============================================================================
// Timer Handle
// =============================================================================

/// Cancels a pending timeout.
///
/// Dropping the handle does **not** cancel the timer.
pub struct TimerHandle {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl TimerHandle {
    /// Creates a handle from a cancellation callback.
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Cancels the timer. Has no effect if it already fired.
    pub fn cancel(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerHandle")
            .field("cancellable", &self.cancel.is_some())
            .finish()
    }
}

// =============================================================================
// Tokio Scheduler
// =============================================================================

/// Scheduler backed by a tokio runtime.
///
/// Next-tick tasks are spawned onto the runtime; timeouts are spawned sleeps
/// that are aborted on cancellation.
#[derive(Clone)]
pub struct TokioScheduler {
    handle: Handle,
}

impl TokioScheduler {
    /// Uses the given runtime.
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Uses the runtime the caller is running on.
    pub fn current() -> Result<Self, BusError> {
        Handle::try_current()
            .map(Self::new)
            .map_err(|_| BusError::NoRuntime)
    }
}

impl Scheduler for TokioScheduler {
    fn next_tick(&self, task: Task) {
        self.handle.spawn(async move { task() });
    }

    fn set_timeout(&self, delay: Duration, task: Task) -> TimerHandle {
        let timer = self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            task();
        });
        let abort = timer.abort_handle();
        TimerHandle::new(move || abort.abort())
    }
}

impl fmt::Debug for TokioScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokioScheduler")
            .field("runtime", &self.handle.runtime_flavor())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_next_tick_runs_after_caller_yields() {
        let scheduler = TokioScheduler::current().unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel();
        scheduler.next_tick(Box::new(move || {
            let _ = tx.send(7);
        }));
        assert_eq!(rx.await.unwrap(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fires_after_delay() {
        let scheduler = TokioScheduler::current().unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let _handle = scheduler.set_timeout(
            Duration::from_millis(100),
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        tokio::time::sleep(Duration::from_millis(99)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(2)).await;
        tokio::task::yield_now().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_timeout_never_fires() {
        let scheduler = TokioScheduler::current().unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let handle = scheduler.set_timeout(
            Duration::from_millis(10),
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        handle.cancel();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_current_without_runtime_fails() {
        assert!(matches!(
            TokioScheduler::current(),
            Err(BusError::NoRuntime)
        ));
    }
}
