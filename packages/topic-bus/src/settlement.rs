//! Settlements: how a publish learns that its event has been delivered.
//!
//! Every queued event carries a [`Settlement`], a one-shot callback the bus
//! fires once the event counts as delivered. For a plain `publish` the
//! callback completes the [`Delivery`] future handed back to the publisher;
//! the request-will-did coordinator installs its own callback instead.
//!
//! # The t / t+1 contract
//!
//! An event published at `t` is delivered at `t+1`. If no subscriber
//! publishes anything during that drain, the settlement fires right after
//! it. If a subscriber does publish, the settlement is carried over and fires
//! together with the settlements of the next drain that ends with an empty
//! queue:
//!
//! ```text
//! publish(a)          drain 1: deliver a ─► subscriber publishes b
//!                              queue not empty → carry [a]
//!                     drain 2: deliver b
//!                              queue empty → settle a, then b
//! ```
//!
//! A publisher can therefore observe same-cycle reactions to its own event
//! before its `Delivery` resolves. [`SettlementLedger`] implements the
//! bookkeeping.

use std::fmt;
use std::future::Future;
use std::mem;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

// =============================================================================
// Settlement
// =============================================================================

/// One-shot completion callback of a queued event.
///
/// Fires exactly once: when settled, or when dropped unsettled (for example
/// because a mediator removed the event, or the bus itself was dropped).
pub struct Settlement {
    on_settle: Option<Box<dyn FnOnce() + Send>>,
}

impl Settlement {
    /// Creates a settlement that runs `on_settle` when it fires.
    pub(crate) fn new(on_settle: impl FnOnce() + Send + 'static) -> Self {
        Self {
            on_settle: Some(Box::new(on_settle)),
        }
    }

    /// Creates a settlement wired to a [`Delivery`] future.
    pub(crate) fn with_delivery() -> (Self, Delivery) {
        let (tx, rx) = oneshot::channel();
        let settlement = Self::new(move || {
            // the publisher may have dropped its Delivery
            let _ = tx.send(());
        });
        (settlement, Delivery { rx })
    }

    /// Fires the settlement.
    pub fn settle(mut self) {
        self.fire();
    }

    fn fire(&mut self) {
        if let Some(on_settle) = self.on_settle.take() {
            on_settle();
        }
    }
}

impl Drop for Settlement {
    fn drop(&mut self) {
        self.fire();
    }
}

impl fmt::Debug for Settlement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Settlement")
            .field("settled", &self.on_settle.is_none())
            .finish()
    }
}

// =============================================================================
// Delivery Future
// =============================================================================

/// Resolves once a published event has been delivered.
///
/// Delivery means every matching subscriber was called, not that every
/// subscriber succeeded; failures go to the bus's error handler. The future
/// never fails.
#[must_use = "a Delivery does nothing unless awaited; drop it to fire and forget"]
pub struct Delivery {
    rx: oneshot::Receiver<()>,
}

impl Future for Delivery {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        // A closed channel means the settlement is gone: nothing left to wait for.
        Pin::new(&mut self.rx).poll(cx).map(|_| ())
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery").finish_non_exhaustive()
    }
}

// =============================================================================
// Settlement Ledger
// =============================================================================

/// Settlements carried across drains until a drain ends with an empty queue.
#[derive(Debug, Default)]
pub(crate) struct SettlementLedger {
    carried: Vec<Settlement>,
}

impl SettlementLedger {
    /// Records the settlements of a finished drain.
    ///
    /// If the queue is empty, returns every carried settlement (oldest first)
    /// followed by this drain's, for the caller to settle. Otherwise keeps
    /// this drain's settlements for later and returns nothing.
    pub fn after_drain(&mut self, drained: Vec<Settlement>, queue_empty: bool) -> Vec<Settlement> {
        if queue_empty {
            let mut due = mem::take(&mut self.carried);
            due.extend(drained);
            due
        } else {
            self.carried.extend(drained);
            Vec::new()
        }
    }

    /// Number of settlements waiting for a quiet drain.
    pub fn carried(&self) -> usize {
        self.carried.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::{Arc, Mutex};

    fn recording(log: &Arc<Mutex<Vec<&'static str>>>, name: &'static str) -> Settlement {
        let log = log.clone();
        Settlement::new(move || log.lock().unwrap().push(name))
    }

    #[test]
    fn test_settlement_fires_once() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let settlement = recording(&log, "a");
        settlement.settle();
        assert_eq!(*log.lock().unwrap(), vec!["a"]);
    }

    #[test]
    fn test_dropped_settlement_fires() {
        let log = Arc::new(Mutex::new(Vec::new()));
        drop(recording(&log, "dropped"));
        assert_eq!(*log.lock().unwrap(), vec!["dropped"]);
    }

    #[test]
    fn test_delivery_resolves_after_settle() {
        let (settlement, mut delivery) = Settlement::with_delivery();
        assert!((&mut delivery).now_or_never().is_none());
        settlement.settle();
        assert!(delivery.now_or_never().is_some());
    }

    #[test]
    fn test_delivery_resolves_when_settlement_dropped() {
        let (settlement, delivery) = Settlement::with_delivery();
        drop(settlement);
        assert!(delivery.now_or_never().is_some());
    }

    #[test]
    fn test_settle_without_listener_is_harmless() {
        let (settlement, delivery) = Settlement::with_delivery();
        drop(delivery);
        settlement.settle();
    }

    #[test]
    fn test_ledger_settles_immediately_on_quiet_drain() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut ledger = SettlementLedger::default();

        let due = ledger.after_drain(vec![recording(&log, "a"), recording(&log, "b")], true);
        assert_eq!(due.len(), 2);
        due.into_iter().for_each(Settlement::settle);
        assert_eq!(*log.lock().unwrap(), vec!["a", "b"]);
        assert_eq!(ledger.carried(), 0);
    }

    #[test]
    fn test_ledger_carries_until_queue_is_empty() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut ledger = SettlementLedger::default();

        assert!(ledger.after_drain(vec![recording(&log, "t1")], false).is_empty());
        assert!(ledger.after_drain(vec![recording(&log, "t2")], false).is_empty());
        assert_eq!(ledger.carried(), 2);
        assert!(log.lock().unwrap().is_empty());

        let due = ledger.after_drain(vec![recording(&log, "t3")], true);
        due.into_iter().for_each(Settlement::settle);
        assert_eq!(*log.lock().unwrap(), vec!["t1", "t2", "t3"]);
        assert_eq!(ledger.carried(), 0);
    }
}
