//! Core types: events, cycles, publish options and handlers.
//!
//! # Events
//!
//! An [`Event`] is a named JSON payload plus the metadata the bus attaches
//! when it is published: the cycle it belongs to, its sender and initiator,
//! and the publish options. Handlers receive events by shared reference, so
//! no subscriber can alter what the next subscriber sees.
//!
//! # Handlers
//!
//! A [`Handler`] wraps a callback together with a stable identity. The same
//! handler can be subscribed to several patterns and is unsubscribed from all
//! of them at once:
//!
//! ```ignore
//! let handler = Handler::new(|event, _actions| {
//!     tracing::info!(topic = %event.name, "locale or theme changed");
//!     Ok(())
//! });
//! bus.subscribe("didChangeLocale", &handler, "LocaleManager")?;
//! bus.subscribe("didChangeTheme", &handler, "LocaleManager")?;
//! bus.unsubscribe(&handler);
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::bus::Actions;

// =============================================================================
// Cycles
// =============================================================================

/// Identifier of an event cycle.
///
/// Every event published outside of a delivery opens a new cycle. Events
/// published by a subscriber while it handles an event inherit that event's
/// cycle, so a whole cascade of reactions can be traced back to its origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CycleId(u64);

impl CycleId {
    /// Creates a cycle id from its raw value.
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw value.
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for CycleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Publish Options
// =============================================================================

/// Options for a single publish.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishOptions {
    /// When `false`, subscribers whose label equals the event's sender do not
    /// receive the event. Defaults to `true`.
    pub deliver_to_sender: bool,

    /// Sender of the event. Overrides a `sender` field in the payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            deliver_to_sender: true,
            sender: None,
        }
    }
}

impl PublishOptions {
    /// Options with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether the sender receives its own event.
    pub fn deliver_to_sender(mut self, deliver: bool) -> Self {
        self.deliver_to_sender = deliver;
        self
    }

    /// Sets the sender.
    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }
}

// =============================================================================
// Event
// =============================================================================

/// A published event as seen by subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Full topic the event was published on.
    pub name: String,
    /// Cycle the event belongs to.
    pub cycle_id: CycleId,
    /// Sender of the event, from the options or the payload's `sender` field.
    pub sender: Option<String>,
    /// Initiator of the event, from the payload's `initiator` field.
    pub initiator: Option<String>,
    /// Options the event was published with.
    pub options: PublishOptions,
    /// Event data. Always a JSON object unless the publisher passed another
    /// non-null value.
    pub payload: Value,
}

impl Event {
    pub(crate) fn new(
        name: &str,
        cycle_id: CycleId,
        payload: Value,
        options: PublishOptions,
    ) -> Self {
        let payload = match payload {
            Value::Null => Value::Object(Map::new()),
            other => other,
        };
        let field = |key: &str| payload.get(key).and_then(Value::as_str).map(str::to_owned);
        let sender = options.sender.clone().or_else(|| field("sender"));
        let initiator = field("initiator");

        Self {
            name: name.to_string(),
            cycle_id,
            sender,
            initiator,
            options,
            payload,
        }
    }

    /// Looks up a top-level payload field.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }

    /// Deserializes the payload into a typed value.
    pub fn payload_as<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        T::deserialize(&self.payload)
    }

    /// Returns the sender, or `""` if there is none.
    pub fn sender_or_empty(&self) -> &str {
        self.sender.as_deref().unwrap_or("")
    }
}

// =============================================================================
// Handlers
// =============================================================================

/// Stable identity of a [`Handler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(u64);

impl HandlerId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handler#{}", self.0)
    }
}

type Callback = dyn Fn(&Event, &Actions<'_>) -> Result<()> + Send + Sync;

/// A subscriber callback with an identity.
///
/// Cloning a handler keeps its identity: unsubscribing any clone removes the
/// subscriptions of all of them.
#[derive(Clone)]
pub struct Handler {
    id: HandlerId,
    callback: Arc<Callback>,
}

impl Handler {
    /// Wraps a callback.
    ///
    /// Returning an error (or panicking) reports the failure to the bus's
    /// error handler; other subscribers are unaffected.
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn(&Event, &Actions<'_>) -> Result<()> + Send + Sync + 'static,
    {
        Self {
            id: HandlerId::next(),
            callback: Arc::new(callback),
        }
    }

    /// The handler's identity.
    pub fn id(&self) -> HandlerId {
        self.id
    }

    pub(crate) fn call(&self, event: &Event, actions: &Actions<'_>) -> Result<()> {
        (self.callback)(event, actions)
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handler").field("id", &self.id).finish()
    }
}

impl PartialEq for Handler {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Handler {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Visibility {
        area: String,
        visible: bool,
    }

    #[test]
    fn test_event_reads_sender_and_initiator_from_payload() {
        let event = Event::new(
            "didNavigate",
            CycleId::new(3),
            json!({ "sender": "FlowController", "initiator": "widget.menu#1", "target": "_self" }),
            PublishOptions::default(),
        );
        assert_eq!(event.sender.as_deref(), Some("FlowController"));
        assert_eq!(event.initiator.as_deref(), Some("widget.menu#1"));
        assert_eq!(event.get("target"), Some(&json!("_self")));
        assert_eq!(event.cycle_id.get(), 3);
    }

    #[test]
    fn test_option_sender_overrides_payload_sender() {
        let event = Event::new(
            "didNavigate",
            CycleId::new(0),
            json!({ "sender": "payload" }),
            PublishOptions::new().with_sender("options"),
        );
        assert_eq!(event.sender.as_deref(), Some("options"));
        // the payload itself is left untouched
        assert_eq!(event.get("sender"), Some(&json!("payload")));
    }

    #[test]
    fn test_null_payload_becomes_empty_object() {
        let event = Event::new("x", CycleId::new(0), Value::Null, PublishOptions::default());
        assert_eq!(event.payload, json!({}));
        assert_eq!(event.sender, None);
        assert_eq!(event.sender_or_empty(), "");
    }

    #[test]
    fn test_non_string_sender_is_ignored() {
        let event = Event::new(
            "x",
            CycleId::new(0),
            json!({ "sender": 17 }),
            PublishOptions::default(),
        );
        assert_eq!(event.sender, None);
    }

    #[test]
    fn test_payload_as_typed_value() {
        let event = Event::new(
            "changeAreaVisibilityRequest.content",
            CycleId::new(0),
            json!({ "area": "content", "visible": true }),
            PublishOptions::default(),
        );
        let typed: Visibility = event.payload_as().unwrap();
        assert_eq!(
            typed,
            Visibility {
                area: "content".into(),
                visible: true
            }
        );
    }

    #[test]
    fn test_handler_clones_share_identity() {
        let handler = Handler::new(|_, _| Ok(()));
        let clone = handler.clone();
        let other = Handler::new(|_, _| Ok(()));
        assert_eq!(handler, clone);
        assert_ne!(handler.id(), other.id());
    }

    #[test]
    fn test_publish_options_default_delivers_to_sender() {
        let options = PublishOptions::default();
        assert!(options.deliver_to_sender);
        assert!(!PublishOptions::new().deliver_to_sender(false).deliver_to_sender);
    }
}
