//! The event bus: queue, cycles and delivery.
//!
//! # Guarantees
//!
//! - **Asynchronous delivery**: `publish` only enqueues. Subscribers run on
//!   the next tick of the bus's [`Scheduler`], never inside `publish`.
//! - **Batching**: everything published before a tick fires is delivered in
//!   that tick, in publish order. Events published by subscribers during a
//!   drain go to the next drain.
//! - **Specific first**: within one event, subscribers are called in
//!   descending [`Weight`](crate::Weight) order, ties in subscription order.
//! - **Isolation**: a failing or panicking subscriber is reported to the
//!   error handler and does not affect other subscribers.
//! - **In-memory only**: nothing is persisted, nothing is retried.
//!
//! # Cycles
//!
//! A publish made outside of a delivery opens a new cycle. A publish made by
//! a subscriber while it handles an event joins the cycle of that event. See
//! [`settlement`](crate::settlement) for when the returned [`Delivery`]
//! resolves.
//!
//! # Example
//!
//! ```ignore
//! let bus = EventBus::with_tokio(BusConfig::default())?;
//!
//! bus.on("didChangeLocale", "LocaleManager", |event, _| {
//!     let locale: String = event.payload_as::<Locale>()?.tag;
//!     tracing::info!(%locale, "locale changed");
//!     Ok(())
//! })?;
//!
//! bus.publish("didChangeLocale.default", json!({ "tag": "de_DE" }))?.await;
//! ```

use std::cell::RefCell;
use std::fmt;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use anyhow::Result as AnyResult;
use serde_json::Value;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::config::BusConfig;
use crate::core::{CycleId, Event, Handler, HandlerId, PublishOptions};
use crate::error::{BusError, BusFault, SubscriberError};
use crate::hooks::{ErrorHandler, Hooks, Mediator, QueuedEvent};
use crate::inspector::{InspectAction, Inspection, Inspector};
use crate::registry::Registry;
use crate::scheduler::{Scheduler, TokioScheduler};
use crate::settlement::{Delivery, Settlement, SettlementLedger};
use crate::topic::ensure_topic;
use crate::tree::Subscription;

/// Locks a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// =============================================================================
// Actions
// =============================================================================

/// What a subscriber may do about its own subscription while handling an
/// event.
pub struct Actions<'a> {
    bus: &'a Arc<Inner>,
    subscription: &'a Arc<Subscription>,
}

impl Actions<'_> {
    /// Unsubscribes the handler being called from every pattern.
    ///
    /// The current delivery is unaffected.
    pub fn unsubscribe(&self) {
        self.bus.unsubscribe(self.subscription.handler_id());
    }

    /// The bus delivering the event, for re-entrant publishes.
    pub fn bus(&self) -> EventBus {
        EventBus {
            inner: Arc::clone(self.bus),
        }
    }

    /// The subscription the event was matched against.
    pub fn subscription(&self) -> &Subscription {
        self.subscription
    }
}

// =============================================================================
// Delivering Cycle
// =============================================================================

thread_local! {
    /// Cycles being delivered on this thread, innermost last.
    static DELIVERING: RefCell<Vec<(Uuid, CycleId)>> = const { RefCell::new(Vec::new()) };
}

/// Marks `cycle` of bus `bus` as being delivered on this thread until dropped.
///
/// Drains run synchronously, so only publishes made from inside a delivery
/// see the marker and join its cycle.
struct DeliveringCycle;

impl DeliveringCycle {
    fn enter(bus: Uuid, cycle: CycleId) -> Self {
        DELIVERING.with(|stack| stack.borrow_mut().push((bus, cycle)));
        DeliveringCycle
    }
}

impl Drop for DeliveringCycle {
    fn drop(&mut self) {
        let _ = DELIVERING.try_with(|stack| stack.borrow_mut().pop());
    }
}

/// The cycle `bus` is delivering on the calling thread, if any.
fn delivering_cycle(bus: Uuid) -> Option<CycleId> {
    DELIVERING.with(|stack| {
        stack
            .borrow()
            .iter()
            .rev()
            .find(|(id, _)| *id == bus)
            .map(|(_, cycle)| *cycle)
    })
}

// =============================================================================
// Queue State
// =============================================================================

#[derive(Default)]
struct QueueState {
    events: Vec<QueuedEvent>,
    next_cycle: u64,
    ledger: SettlementLedger,
}

impl QueueState {
    /// Joins `delivering` or opens a new cycle.
    fn cycle_for_publish(&mut self, delivering: Option<CycleId>) -> CycleId {
        if let Some(cycle) = delivering {
            return cycle;
        }
        let cycle = CycleId::new(self.next_cycle);
        self.next_cycle += 1;
        cycle
    }
}

// =============================================================================
// Inner
// =============================================================================

pub(crate) struct Inner {
    id: Uuid,
    config: BusConfig,
    scheduler: Arc<dyn Scheduler>,
    registry: Mutex<Registry>,
    queue: Mutex<QueueState>,
    /// Held for a whole drain so that batches never interleave.
    drain_lock: Mutex<()>,
    hooks: RwLock<Hooks>,
}

impl Inner {
    fn new(config: BusConfig, scheduler: Arc<dyn Scheduler>) -> Self {
        let id = Uuid::new_v4();
        Self {
            id,
            config,
            scheduler,
            registry: Mutex::new(Registry::new()),
            queue: Mutex::new(QueueState::default()),
            drain_lock: Mutex::new(()),
            hooks: RwLock::new(Hooks::new(id)),
        }
    }

    pub(crate) fn id(&self) -> Uuid {
        self.id
    }

    pub(crate) fn config(&self) -> &BusConfig {
        &self.config
    }

    pub(crate) fn scheduler(&self) -> &Arc<dyn Scheduler> {
        &self.scheduler
    }

    fn hooks(&self) -> Hooks {
        self.hooks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn update_hooks(&self, update: impl FnOnce(&mut Hooks)) {
        update(&mut self.hooks.write().unwrap_or_else(PoisonError::into_inner));
    }

    pub(crate) fn report(&self, fault: &BusFault) {
        self.hooks().report(fault);
    }

    // -------------------------------------------------------------------------
    // Subscriptions
    // -------------------------------------------------------------------------

    pub(crate) fn subscribe(&self, pattern: &str, handler: &Handler, label: &str) -> Result<(), BusError> {
        ensure_topic(pattern)?;
        let subscription = lock(&self.registry).subscribe(pattern, handler, label);
        let cycle_id = delivering_cycle(self.id);
        debug!(
            bus = %self.id,
            pattern,
            label,
            handler = %handler.id(),
            weight = %subscription.weight(),
            "subscribed"
        );

        self.hooks().inspect(&Inspection {
            action: InspectAction::Subscribe,
            source: label,
            target: "-",
            event_name: pattern,
            subscribed_to: None,
            event: None,
            cycle_id,
        });
        Ok(())
    }

    pub(crate) fn unsubscribe(&self, handler: HandlerId) -> bool {
        let patterns = lock(&self.registry).unsubscribe(handler);
        if patterns.is_empty() {
            return false;
        }
        debug!(bus = %self.id, %handler, patterns = ?patterns, "unsubscribed");
        true
    }

    // -------------------------------------------------------------------------
    // Publishing
    // -------------------------------------------------------------------------

    pub(crate) fn publish(
        self: &Arc<Self>,
        name: &str,
        payload: Value,
        options: PublishOptions,
        settlement: Settlement,
    ) -> Result<CycleId, BusError> {
        ensure_topic(name)?;
        let cycle_id = lock(&self.queue).cycle_for_publish(delivering_cycle(self.id));
        let event = Event::new(name, cycle_id, payload, options);
        debug!(
            bus = %self.id,
            event = %event.name,
            cycle = %cycle_id,
            sender = event.sender_or_empty(),
            "publishing event"
        );

        self.hooks().inspect(&Inspection {
            action: InspectAction::Publish,
            source: event.sender_or_empty(),
            target: "-",
            event_name: &event.name,
            subscribed_to: None,
            event: Some(&event),
            cycle_id: Some(cycle_id),
        });

        self.enqueue(QueuedEvent::new(event, settlement));
        Ok(cycle_id)
    }

    fn enqueue(self: &Arc<Self>, queued: QueuedEvent) {
        let was_empty = {
            let mut queue = lock(&self.queue);
            let was_empty = queue.events.is_empty();
            queue.events.push(queued);
            was_empty
        };
        if was_empty {
            let bus = Arc::downgrade(self);
            self.scheduler.next_tick(Box::new(move || {
                // a dropped bus settles its queue on drop
                if let Some(bus) = bus.upgrade() {
                    bus.drain();
                }
            }));
        }
    }

    // -------------------------------------------------------------------------
    // Draining
    // -------------------------------------------------------------------------

    fn drain(self: &Arc<Self>) {
        let _draining = lock(&self.drain_lock);
        let batch = mem::take(&mut lock(&self.queue).events);
        debug!(bus = %self.id, events = batch.len(), "draining event queue");

        let mediator = self
            .hooks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .mediator
            .clone();
        let batch = match mediator {
            Some(mediator) => mediator(batch),
            None => batch,
        };

        let mut settlements = Vec::with_capacity(batch.len());
        for queued in batch {
            let (event, settlement) = queued.into_parts();
            self.deliver(&event);
            settlements.push(settlement);
        }

        let due = {
            let mut queue = lock(&self.queue);
            let queue_empty = queue.events.is_empty();
            let due = queue.ledger.after_drain(settlements, queue_empty);
            trace!(
                bus = %self.id,
                settling = due.len(),
                carried = queue.ledger.carried(),
                "drain finished"
            );
            due
        };
        for settlement in due {
            settlement.settle();
        }
    }

    fn deliver(self: &Arc<Self>, event: &Event) {
        let _delivering = DeliveringCycle::enter(self.id, event.cycle_id);
        let recipients = lock(&self.registry).matching(&event.name);
        let hooks = self.hooks();
        trace!(
            bus = %self.id,
            event = %event.name,
            cycle = %event.cycle_id,
            recipients = recipients.len(),
            "delivering event"
        );

        for subscription in &recipients {
            if !event.options.deliver_to_sender && is_sender(event, subscription.label()) {
                continue;
            }

            hooks.inspect(&Inspection {
                action: InspectAction::Deliver,
                source: event.sender_or_empty(),
                target: subscription.label(),
                event_name: &event.name,
                subscribed_to: Some(subscription.pattern()),
                event: Some(event),
                cycle_id: Some(event.cycle_id),
            });

            let actions = Actions {
                bus: self,
                subscription,
            };
            let outcome: std::thread::Result<AnyResult<()>> = panic::catch_unwind(
                AssertUnwindSafe(|| subscription.handler().call(event, &actions)),
            );
            let error = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(error)) => SubscriberError::Failed(error),
                Err(payload) => SubscriberError::from_panic(payload),
            };

            let message = format!(
                "error while calling subscriber \"{}\" for event {} published by \"{}\" (subscribed to: {})",
                subscription.label(),
                event.name,
                event.sender_or_empty(),
                subscription.pattern()
            );
            hooks.report(&BusFault::SubscriberFailed {
                message,
                error,
                event: event.clone(),
                subscription: Arc::clone(subscription),
            });
        }
    }
}

fn is_sender(event: &Event, label: &str) -> bool {
    matches!(event.sender.as_deref(), Some(sender) if !sender.is_empty() && sender == label)
}

// =============================================================================
// Event Bus
// =============================================================================

/// In-process publish/subscribe broker with hierarchical topics.
///
/// Cloning is cheap; clones share the same subscriptions and queue.
#[derive(Clone)]
pub struct EventBus {
    pub(crate) inner: Arc<Inner>,
}

impl EventBus {
    /// Creates a bus driven by the given scheduler.
    pub fn new(config: BusConfig, scheduler: impl Scheduler) -> Self {
        Self {
            inner: Arc::new(Inner::new(config, Arc::new(scheduler))),
        }
    }

    /// Creates a bus driven by the current tokio runtime.
    pub fn with_tokio(config: BusConfig) -> Result<Self, BusError> {
        Ok(Self::new(config, TokioScheduler::current()?))
    }

    /// Starts building a bus with hooks installed up front.
    pub fn builder() -> EventBusBuilder {
        EventBusBuilder::default()
    }

    /// Unique id of this bus, attached to its log lines.
    pub fn id(&self) -> Uuid {
        self.inner.id()
    }

    /// Settings the bus was created with.
    pub fn config(&self) -> &BusConfig {
        self.inner.config()
    }

    /// Subscribes `handler` to every event matching `pattern`.
    ///
    /// `label` names the subscriber in inspections and fault reports, and is
    /// compared with event senders when `deliver_to_sender` is off.
    pub fn subscribe(&self, pattern: &str, handler: &Handler, label: &str) -> Result<(), BusError> {
        self.inner.subscribe(pattern, handler, label)
    }

    /// Wraps `callback` in a new [`Handler`] and subscribes it.
    pub fn on<F>(&self, pattern: &str, label: &str, callback: F) -> Result<Handler, BusError>
    where
        F: Fn(&Event, &Actions<'_>) -> AnyResult<()> + Send + Sync + 'static,
    {
        let handler = Handler::new(callback);
        self.subscribe(pattern, &handler, label)?;
        Ok(handler)
    }

    /// Removes every subscription of `handler`.
    ///
    /// Returns false if the handler was not subscribed.
    pub fn unsubscribe(&self, handler: &Handler) -> bool {
        self.inner.unsubscribe(handler.id())
    }

    /// Publishes an event with default options.
    pub fn publish(&self, name: &str, payload: Value) -> Result<Delivery, BusError> {
        self.publish_with(name, payload, PublishOptions::default())
    }

    /// Publishes an event.
    ///
    /// The returned [`Delivery`] resolves once the event and all events
    /// published in reaction to it during the same drains were delivered.
    pub fn publish_with(
        &self,
        name: &str,
        payload: Value,
        options: PublishOptions,
    ) -> Result<Delivery, BusError> {
        let (settlement, delivery) = Settlement::with_delivery();
        self.inner.publish(name, payload, options, settlement)?;
        Ok(delivery)
    }

    // -------------------------------------------------------------------------
    // Hooks
    // -------------------------------------------------------------------------

    /// Replaces the error handler.
    pub fn set_error_handler<F>(&self, handler: F)
    where
        F: Fn(&BusFault) + Send + Sync + 'static,
    {
        let handler: ErrorHandler = Arc::new(handler);
        self.inner.update_hooks(|hooks| hooks.error_handler = handler);
    }

    /// Replaces the mediator.
    pub fn set_mediator<F>(&self, mediator: F)
    where
        F: Fn(Vec<QueuedEvent>) -> Vec<QueuedEvent> + Send + Sync + 'static,
    {
        let mediator: Mediator = Arc::new(mediator);
        self.inner.update_hooks(|hooks| hooks.mediator = Some(mediator));
    }

    /// Removes the mediator; batches are delivered as queued.
    pub fn clear_mediator(&self) {
        self.inner.update_hooks(|hooks| hooks.mediator = None);
    }

    /// Replaces all inspectors with `inspector`.
    pub fn set_inspector<F>(&self, inspector: F)
    where
        F: Fn(&Inspection<'_>) + Send + Sync + 'static,
    {
        let inspector: Inspector = Arc::new(inspector);
        self.inner.update_hooks(|hooks| hooks.inspectors = vec![inspector]);
    }

    /// Adds an inspector next to the existing ones.
    pub fn add_inspector<F>(&self, inspector: F)
    where
        F: Fn(&Inspection<'_>) + Send + Sync + 'static,
    {
        let inspector: Inspector = Arc::new(inspector);
        self.inner.update_hooks(|hooks| hooks.inspectors.push(inspector));
    }

    // -------------------------------------------------------------------------
    // Diagnostics
    // -------------------------------------------------------------------------

    /// Returns true if `handler` has at least one subscription.
    pub fn is_subscribed(&self, handler: &Handler) -> bool {
        lock(&self.inner.registry).is_subscribed(handler.id())
    }

    /// Number of active subscriptions.
    pub fn subscription_count(&self) -> usize {
        lock(&self.inner.registry).subscription_count()
    }

    /// Number of events waiting for the next drain.
    pub fn queued_len(&self) -> usize {
        lock(&self.inner.queue).events.len()
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("id", &self.inner.id)
            .field("subscriptions", &self.subscription_count())
            .field("queued", &self.queued_len())
            .finish()
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for an [`EventBus`] with hooks installed up front.
#[derive(Default)]
pub struct EventBusBuilder {
    config: BusConfig,
    scheduler: Option<Arc<dyn Scheduler>>,
    error_handler: Option<ErrorHandler>,
    mediator: Option<Mediator>,
    inspectors: Vec<Inspector>,
}

impl EventBusBuilder {
    /// Sets the bus configuration; defaults to [`BusConfig::default`].
    pub fn with_config(mut self, config: BusConfig) -> Self {
        self.config = config;
        self
    }

    /// Uses `scheduler` instead of the current tokio runtime.
    pub fn with_scheduler(mut self, scheduler: impl Scheduler) -> Self {
        self.scheduler = Some(Arc::new(scheduler));
        self
    }

    pub fn with_error_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&BusFault) + Send + Sync + 'static,
    {
        self.error_handler = Some(Arc::new(handler));
        self
    }

    pub fn with_mediator<F>(mut self, mediator: F) -> Self
    where
        F: Fn(Vec<QueuedEvent>) -> Vec<QueuedEvent> + Send + Sync + 'static,
    {
        self.mediator = Some(Arc::new(mediator));
        self
    }

    pub fn with_inspector<F>(mut self, inspector: F) -> Self
    where
        F: Fn(&Inspection<'_>) + Send + Sync + 'static,
    {
        self.inspectors.push(Arc::new(inspector));
        self
    }

    /// Builds the bus.
    ///
    /// Fails with [`BusError::NoRuntime`] if no scheduler was given and the
    /// caller is not inside a tokio runtime.
    pub fn build(self) -> Result<EventBus, BusError> {
        let scheduler: Arc<dyn Scheduler> = match self.scheduler {
            Some(scheduler) => scheduler,
            None => Arc::new(TokioScheduler::current()?),
        };
        let inner = Inner::new(self.config, scheduler);
        {
            let mut hooks = inner.hooks.write().unwrap_or_else(PoisonError::into_inner);
            if let Some(error_handler) = self.error_handler {
                hooks.error_handler = error_handler;
            }
            hooks.mediator = self.mediator;
            hooks.inspectors = self.inspectors;
        }
        Ok(EventBus {
            inner: Arc::new(inner),
        })
    }
}

impl fmt::Debug for EventBusBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBusBuilder")
            .field("config", &self.config)
            .field("scheduler", &self.scheduler.is_some())
            .field("inspectors", &self.inspectors.len())
            .finish()
    }
}
