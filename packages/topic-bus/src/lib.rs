//! # topic-bus
//!
//! An in-process, asynchronous publish/subscribe broker with hierarchical
//! topics, deterministic delivery order and the request-will-did protocol.
//!
//! ## Core Concepts
//!
//! - **Topics** are dot-separated names such as `didChangeLocale.de_DE`.
//!   A subscription pattern matches its own topic and every longer one; an
//!   empty segment (`.de_DE`, `some..event`) matches any value at that
//!   level, and a dash prefix (`a.e`) matches dash extensions (`a.e-sub`).
//! - **Events** carry a JSON payload. Subscribers receive them by shared
//!   reference on the next tick, most specific pattern first.
//! - **Cycles** group an event with every event published in reaction to it.
//!   A [`Delivery`] resolves once its cycle has quieted down.
//! - **Request-will-did** lets an initiator wait for collaborators that work
//!   asynchronously; see [`EventBus::publish_and_gather_replies`].
//!
//! ## Architecture
//!
//! ```text
//! publish() ──► queue ──(next tick)──► mediator ──► topic tree match
//!                 ▲                                     │
//!                 │                                     ▼
//!                 └──── re-entrant publish ◄──── subscribers (weight order)
//!                                                       │
//!                          settlements ◄── drain ends with empty queue
//! ```
//!
//! ## Guarantees
//!
//! - **Never synchronous**: no subscriber runs inside `publish`.
//! - **FIFO per drain**: events of one drain are delivered in publish order.
//! - **Isolated failures**: subscriber errors and panics go to the error
//!   handler; delivery continues.
//! - **In-memory only**: no persistence, no retries, no cross-process
//!   delivery.
//!
//! ## Example
//!
//! ```ignore
//! use serde_json::json;
//! use topic_bus::{BusConfig, EventBus, GatherOptions};
//!
//! let bus = EventBus::with_tokio(BusConfig::default())?;
//!
//! bus.on("beginLifecycleRequest", "widget.headline#1", |event, actions| {
//!     let bus = actions.bus();
//!     bus.publish("willBeginLifecycle", json!({ "sender": "widget.headline#1" }))?;
//!     tokio::spawn(async move {
//!         load_resources().await;
//!         let _ = bus.publish("didBeginLifecycle", json!({ "sender": "widget.headline#1" }));
//!     });
//!     Ok(())
//! })?;
//!
//! let replies = bus
//!     .publish_and_gather_replies("beginLifecycleRequest", json!({}), GatherOptions::new())?
//!     .await;
//! ```

// Core modules
mod bus;
mod collaborator;
mod config;
mod core;
mod error;
mod hooks;
mod registry;
mod request;
mod tree;

pub mod inspector;
pub mod scheduler;
pub mod settlement;
pub mod topic;

// Testing utilities (feature-gated)
#[cfg(any(test, feature = "testing"))]
pub mod testing;


pub use crate::bus::{Actions, EventBus, EventBusBuilder};
pub use crate::collaborator::Collaborator;
pub use crate::config::{BusConfig, DEFAULT_PENDING_REPLY_TIMEOUT};
pub use crate::core::{CycleId, Event, Handler, HandlerId, PublishOptions};
pub use crate::error::{BusError, BusFault, SubscriberError};
pub use crate::hooks::{ErrorHandler, Mediator, QueuedEvent};
pub use crate::inspector::{InspectAction, Inspection, InspectionLog, InspectionRecord, Inspector};
pub use crate::request::{GatherOptions, Replies};
pub use crate::scheduler::{Scheduler, TimerHandle, TokioScheduler};
pub use crate::settlement::{Delivery, Settlement};
pub use crate::topic::{RequestTopic, Weight};
pub use crate::tree::Subscription;
