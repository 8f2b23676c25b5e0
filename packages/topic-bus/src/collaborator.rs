//! Per-collaborator view of a bus.
//!
//! A widget or other component talks to the bus under one identity. Its
//! [`Collaborator`] labels every subscription with that identity, stamps it
//! as the sender of everything it publishes, and remembers its handlers so
//! they can all be removed when the component goes away.
//!
//! ```ignore
//! let widget = bus.widget_collaborator("headline", "id3");
//! widget.on("didChangeLocale", |event, _| render(event))?;
//! widget.publish("didNavigate.home", json!({}))?; // sender: widget.headline#id3
//! // teardown
//! widget.unsubscribe_all();
//! ```

use std::fmt;
use std::sync::Mutex;

use anyhow::Result as AnyResult;
use serde_json::Value;
use tracing::debug;

use crate::bus::{lock, Actions, EventBus};
use crate::core::{Event, Handler, PublishOptions};
use crate::error::BusError;
use crate::request::{GatherOptions, Replies};
use crate::settlement::Delivery;

/// A bus handle acting on behalf of one collaborator.
pub struct Collaborator {
    bus: EventBus,
    id: String,
    handlers: Mutex<Vec<Handler>>,
}

impl EventBus {
    /// Returns a view of this bus acting as `id`.
    pub fn collaborator(&self, id: impl Into<String>) -> Collaborator {
        Collaborator {
            bus: self.clone(),
            id: id.into(),
            handlers: Mutex::new(Vec::new()),
        }
    }

    /// Returns a view acting as `widget.<name>#<instance>`.
    pub fn widget_collaborator(&self, name: &str, instance: &str) -> Collaborator {
        self.collaborator(format!("widget.{name}#{instance}"))
    }
}

impl Collaborator {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Subscribes `handler`, labelled with this collaborator's id.
    pub fn subscribe(&self, pattern: &str, handler: &Handler) -> Result<(), BusError> {
        self.bus.subscribe(pattern, handler, &self.id)?;
        let mut handlers = lock(&self.handlers);
        if !handlers.contains(handler) {
            handlers.push(handler.clone());
        }
        Ok(())
    }

    /// Wraps `callback` in a new handler and subscribes it.
    pub fn on<F>(&self, pattern: &str, callback: F) -> Result<Handler, BusError>
    where
        F: Fn(&Event, &Actions<'_>) -> AnyResult<()> + Send + Sync + 'static,
    {
        let handler = Handler::new(callback);
        self.subscribe(pattern, &handler)?;
        Ok(handler)
    }

    pub fn unsubscribe(&self, handler: &Handler) -> bool {
        lock(&self.handlers).retain(|h| h != handler);
        self.bus.unsubscribe(handler)
    }

    /// Removes every subscription made through this collaborator.
    ///
    /// Returns the number of handlers that were still subscribed.
    pub fn unsubscribe_all(&self) -> usize {
        let handlers = std::mem::take(&mut *lock(&self.handlers));
        let removed = handlers
            .iter()
            .filter(|handler| self.bus.unsubscribe(handler))
            .count();
        debug!(collaborator = %self.id, removed, "unsubscribed collaborator");
        removed
    }

    pub fn publish(&self, name: &str, payload: Value) -> Result<Delivery, BusError> {
        self.publish_with(name, payload, PublishOptions::default())
    }

    /// Publishes with this collaborator as sender unless `options` names one.
    pub fn publish_with(
        &self,
        name: &str,
        payload: Value,
        options: PublishOptions,
    ) -> Result<Delivery, BusError> {
        let options = self.stamp(options);
        self.bus.publish_with(name, payload, options)
    }

    /// Gathers replies with this collaborator as sender unless `options`
    /// names one.
    pub fn publish_and_gather_replies(
        &self,
        name: &str,
        payload: Value,
        mut options: GatherOptions,
    ) -> Result<Replies, BusError> {
        options.publish = self.stamp(options.publish);
        self.bus.publish_and_gather_replies(name, payload, options)
    }

    fn stamp(&self, mut options: PublishOptions) -> PublishOptions {
        if options.sender.is_none() {
            options.sender = Some(self.id.clone());
        }
        options
    }
}

impl fmt::Debug for Collaborator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collaborator")
            .field("id", &self.id)
            .field("handlers", &lock(&self.handlers).len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BusConfig;
    use crate::inspector::InspectionLog;
    use crate::testing::{ManualScheduler, Recorder};
    use futures::FutureExt;
    use serde_json::json;
    use std::sync::Arc;

    fn manual_bus() -> (EventBus, ManualScheduler) {
        let scheduler = ManualScheduler::new();
        (EventBus::new(BusConfig::default(), scheduler.clone()), scheduler)
    }

    fn sender_recorder(bus: &EventBus, pattern: &str) -> Recorder {
        let recorder = Recorder::new();
        let sink = recorder.clone();
        bus.on(pattern, "observer", move |event, _| {
            sink.push(event.sender_or_empty());
            Ok(())
        })
        .unwrap();
        recorder
    }

    #[test]
    fn test_widget_collaborator_id() {
        let (bus, _) = manual_bus();
        assert_eq!(
            bus.widget_collaborator("headline", "id3").id(),
            "widget.headline#id3"
        );
    }

    #[test]
    fn test_publish_stamps_sender_unless_given() {
        let (bus, scheduler) = manual_bus();
        let senders = sender_recorder(&bus, "didNavigate");
        let widget = bus.collaborator("widget.menu#1");

        let _ = widget.publish("didNavigate", json!({}));
        let _ = widget.publish_with(
            "didNavigate",
            json!({}),
            PublishOptions::new().with_sender("explicit"),
        );
        scheduler.run_until_idle();

        assert_eq!(senders.take(), vec!["widget.menu#1", "explicit"]);
    }

    #[test]
    fn test_subscriptions_are_labelled_with_id() {
        let (bus, scheduler) = manual_bus();
        let log = Arc::new(InspectionLog::new());
        bus.set_inspector(log.inspector());
        let widget = bus.collaborator("widget.menu#1");

        widget.on("didNavigate", |_, _| Ok(())).unwrap();
        let _ = bus.publish("didNavigate", json!({}));
        scheduler.run_until_idle();

        let deliveries = log.deliveries_of("didNavigate");
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].target, "widget.menu#1");
    }

    #[test]
    fn test_own_events_can_be_suppressed() {
        let (bus, scheduler) = manual_bus();
        let widget = bus.collaborator("widget.menu#1");
        let recorder = Recorder::new();
        widget
            .subscribe("didNavigate", &recorder.handler("menu"))
            .unwrap();

        let _ = widget.publish_with(
            "didNavigate",
            json!({}),
            PublishOptions::new().deliver_to_sender(false),
        );
        let _ = widget.publish("didNavigate", json!({}));
        scheduler.run_until_idle();

        assert_eq!(recorder.take(), vec!["menu"]);
    }

    #[test]
    fn test_unsubscribe_all_removes_only_own_handlers() {
        let (bus, _) = manual_bus();
        let widget = bus.collaborator("widget.menu#1");
        let shared = Handler::new(|_, _| Ok(()));
        widget.subscribe("a", &shared).unwrap();
        widget.subscribe("b", &shared).unwrap();
        let single = widget.on("c", |_, _| Ok(())).unwrap();
        bus.on("a", "other", |_, _| Ok(())).unwrap();
        assert_eq!(bus.subscription_count(), 4);

        assert!(widget.unsubscribe(&single));
        assert_eq!(widget.unsubscribe_all(), 1);
        assert_eq!(bus.subscription_count(), 1);
        assert_eq!(widget.unsubscribe_all(), 0);
    }

    #[test]
    fn test_gather_replies_as_collaborator() {
        let (bus, scheduler) = manual_bus();
        let senders = sender_recorder(&bus, "saveRequest");
        let page = bus.collaborator("AxPageController");
        let widget = bus.collaborator("widget.editor#1");
        let widget_bus = widget.bus().clone();
        widget
            .on("saveRequest", move |_, _| {
                let _ = widget_bus.publish("didSave", json!({ "sender": "widget.editor#1" }))?;
                Ok(())
            })
            .unwrap();

        let replies = page
            .publish_and_gather_replies("saveRequest", json!({}), GatherOptions::new())
            .unwrap();
        scheduler.run_until_idle();

        assert_eq!(senders.take(), vec!["AxPageController"]);
        let replies = replies.now_or_never().expect("replies should be resolved");
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].sender_or_empty(), "widget.editor#1");
    }
}
