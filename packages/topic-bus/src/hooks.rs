//! Replaceable hooks: error handler, mediator and inspectors.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use tracing::error;
use uuid::Uuid;

use crate::core::Event;
use crate::error::{panic_message, BusFault};
use crate::inspector::{Inspection, Inspector};
use crate::settlement::Settlement;

/// Receives faults that occur during delivery.
pub type ErrorHandler = Arc<dyn Fn(&BusFault) + Send + Sync>;

/// Rewrites a batch of events right before it is delivered.
///
/// A mediator may reorder, filter, alter or add events. Events it drops count
/// as delivered.
pub type Mediator = Arc<dyn Fn(Vec<QueuedEvent>) -> Vec<QueuedEvent> + Send + Sync>;

// =============================================================================
// Queued Event
// =============================================================================

/// An event waiting in the queue, together with its settlement.
pub struct QueuedEvent {
    /// The event as it will be delivered.
    pub event: Event,
    settlement: Settlement,
}

impl QueuedEvent {
    pub(crate) fn new(event: Event, settlement: Settlement) -> Self {
        Self { event, settlement }
    }

    /// Queues an event nobody waits for.
    ///
    /// Lets a mediator inject additional events into a batch.
    pub fn detached(event: Event) -> Self {
        Self::new(event, Settlement::new(|| {}))
    }

    pub(crate) fn into_parts(self) -> (Event, Settlement) {
        (self.event, self.settlement)
    }
}

impl fmt::Debug for QueuedEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueuedEvent")
            .field("name", &self.event.name)
            .field("cycle_id", &self.event.cycle_id)
            .finish()
    }
}

// =============================================================================
// Hook Set
// =============================================================================

#[derive(Clone)]
pub(crate) struct Hooks {
    pub error_handler: ErrorHandler,
    pub mediator: Option<Mediator>,
    pub inspectors: Vec<Inspector>,
}

impl Hooks {
    pub fn new(bus_id: Uuid) -> Self {
        Self {
            error_handler: default_error_handler(bus_id),
            mediator: None,
            inspectors: Vec::new(),
        }
    }

    /// Calls every inspector. A panicking inspector is logged and skipped.
    pub fn inspect(&self, inspection: &Inspection<'_>) {
        for inspector in &self.inspectors {
            guarded("inspector", || inspector(inspection));
        }
    }

    /// Hands `fault` to the error handler. A panic in the handler is logged.
    pub fn report(&self, fault: &BusFault) {
        guarded("error handler", || (self.error_handler)(fault));
    }
}

/// Runs a hook, containing any panic so delivery can go on.
fn guarded(hook: &'static str, call: impl FnOnce()) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(call)) {
        error!(hook, panic = %panic_message(payload.as_ref()), "bus hook panicked");
    }
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("mediator", &self.mediator.is_some())
            .field("inspectors", &self.inspectors.len())
            .finish()
    }
}

/// Logs faults through `tracing`.
pub(crate) fn default_error_handler(bus_id: Uuid) -> ErrorHandler {
    Arc::new(move |fault: &BusFault| match fault {
        BusFault::SubscriberFailed {
            message,
            error,
            event,
            subscription,
        } => error!(
            bus = %bus_id,
            event = %event.name,
            cycle = %event.cycle_id,
            label = subscription.label(),
            subscribed_to = subscription.pattern(),
            error = %error,
            panicked = error.is_panic(),
            "{message}"
        ),
        BusFault::ReplyTimeout {
            message,
            request,
            sender,
            timeout,
            missing,
        } => error!(
            bus = %bus_id,
            request = %request,
            sender = sender.as_deref().unwrap_or(""),
            timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            missing = ?missing,
            "{message}"
        ),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{CycleId, PublishOptions};
    use crate::inspector::InspectAction;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_detached_event_settles_silently() {
        let event = Event::new("x", CycleId::new(0), json!({}), PublishOptions::default());
        let queued = QueuedEvent::detached(event);
        let (event, settlement) = queued.into_parts();
        assert_eq!(event.name, "x");
        settlement.settle();
    }

    #[test]
    fn test_inspect_calls_every_inspector() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut hooks = Hooks::new(Uuid::new_v4());
        for _ in 0..3 {
            let calls = calls.clone();
            hooks.inspectors.push(Arc::new(move |_: &Inspection<'_>| {
                calls.fetch_add(1, Ordering::SeqCst);
            }));
        }

        hooks.inspect(&Inspection {
            action: InspectAction::Publish,
            source: "",
            target: "-",
            event_name: "x",
            subscribed_to: None,
            event: None,
            cycle_id: None,
        });
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_panicking_hooks_are_contained() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut hooks = Hooks::new(Uuid::new_v4());
        hooks.error_handler = Arc::new(|_: &BusFault| panic!("handler down"));
        hooks.inspectors.push(Arc::new(|_: &Inspection<'_>| panic!("inspector down")));
        let counter = calls.clone();
        hooks.inspectors.push(Arc::new(move |_: &Inspection<'_>| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        hooks.inspect(&Inspection {
            action: InspectAction::Subscribe,
            source: "menu",
            target: "-",
            event_name: "x",
            subscribed_to: None,
            event: None,
            cycle_id: None,
        });
        hooks.report(&BusFault::ReplyTimeout {
            message: "Timeout while waiting for pending didSave on saveRequest.".into(),
            request: "saveRequest".into(),
            sender: None,
            timeout: Duration::from_millis(10),
            missing: vec![],
        });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_default_error_handler_does_not_panic() {
        let handler = default_error_handler(Uuid::new_v4());
        handler(&BusFault::ReplyTimeout {
            message: "Timeout while waiting for pending didSave on saveRequest.".into(),
            request: "saveRequest".into(),
            sender: None,
            timeout: Duration::from_millis(10),
            missing: vec!["editor".into()],
        });
    }
}
