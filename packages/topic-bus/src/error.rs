//! Error types for the bus.
//!
//! Two channels exist and they never mix:
//!
//! - [`BusError`] is returned synchronously for precondition violations
//!   (empty topic, malformed request topic, no runtime). These are programming
//!   mistakes at the call site.
//! - [`BusFault`] is handed to the error handler for everything that goes
//!   wrong *during* delivery: a subscriber failing, or collaborators never
//!   confirming a request. Faults never reach the publisher's
//!   [`Delivery`](crate::Delivery) or [`Replies`](crate::Replies) futures,
//!   which always resolve.
//!
//! # Example
//!
//! ```ignore
//! use topic_bus::{BusFault, EventBus};
//!
//! bus.set_error_handler(|fault: &BusFault| match fault {
//!     BusFault::SubscriberFailed { subscription, error, .. } => {
//!         metrics::count_failure(subscription.label(), error);
//!     }
//!     BusFault::ReplyTimeout { missing, .. } => {
//!         tracing::warn!(?missing, "collaborators did not reply");
//!     }
//! });
//! ```

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::core::Event;
use crate::tree::Subscription;

// =============================================================================
// Precondition Errors
// =============================================================================

/// Precondition violations, reported at the call site.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    /// Topic names and subscription patterns must not be empty.
    #[error("topic name must not be empty")]
    EmptyTopic,

    /// `publish_and_gather_replies` needs a `<x>Request[.suffix]` topic.
    #[error("expected a topic ending with \"Request\" (optionally followed by \".<suffix>\") but got {topic:?}")]
    InvalidRequestTopic {
        /// The rejected topic.
        topic: String,
    },

    /// The tokio scheduler was requested outside of a tokio runtime.
    #[error("no tokio runtime is available to drive the event bus")]
    NoRuntime,
}

// =============================================================================
// Subscriber Errors
// =============================================================================

/// Why a subscriber failed while handling an event.
#[derive(Debug, Error)]
pub enum SubscriberError {
    /// The handler returned an error.
    #[error("{0:#}")]
    Failed(anyhow::Error),

    /// The handler panicked.
    #[error("subscriber panicked: {0}")]
    Panicked(String),
}

impl SubscriberError {
    /// Builds a `Panicked` error from a `catch_unwind` payload.
    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        SubscriberError::Panicked(panic_message(payload.as_ref()))
    }

    /// Returns true if the handler panicked rather than returning an error.
    pub fn is_panic(&self) -> bool {
        matches!(self, SubscriberError::Panicked(_))
    }
}

/// Text of a `catch_unwind` payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

// =============================================================================
// Faults
// =============================================================================

/// A problem observed during delivery, routed to the error handler.
#[derive(Debug)]
pub enum BusFault {
    /// A subscriber returned an error or panicked.
    ///
    /// Delivery to the remaining subscribers continued normally.
    SubscriberFailed {
        /// Human readable summary.
        message: String,
        /// What the subscriber reported.
        error: SubscriberError,
        /// The event being delivered.
        event: Event,
        /// The failing subscription.
        subscription: Arc<Subscription>,
    },

    /// A request gathered `will` replies whose `did` replies never arrived.
    ///
    /// The request's [`Replies`](crate::Replies) resolved with whatever
    /// did replies were collected until then.
    ReplyTimeout {
        /// Human readable summary.
        message: String,
        /// The request topic.
        request: String,
        /// Sender of the request, if any.
        sender: Option<String>,
        /// How long the coordinator waited.
        timeout: Duration,
        /// Senders that announced work with `will` but never sent `did`.
        missing: Vec<String>,
    },
}

impl BusFault {
    /// Human readable summary of the fault.
    pub fn message(&self) -> &str {
        match self {
            BusFault::SubscriberFailed { message, .. } => message,
            BusFault::ReplyTimeout { message, .. } => message,
        }
    }

    /// Name of the event or request the fault relates to.
    pub fn topic(&self) -> &str {
        match self {
            BusFault::SubscriberFailed { event, .. } => &event.name,
            BusFault::ReplyTimeout { request, .. } => request,
        }
    }
}

impl fmt::Display for BusFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusFault::SubscriberFailed { message, error, .. } => {
                write!(f, "{message}: {error}")
            }
            BusFault::ReplyTimeout {
                message, missing, ..
            } => write!(f, "{message} (responses missing from: {})", missing.join(", ")),
        }
    }
}
