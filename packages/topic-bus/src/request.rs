//! The request-will-did protocol.
//!
//! An initiator publishes `<action>Request[.suffix]` and wants to know when
//! every collaborator has dealt with it. Collaborators answer in one of two
//! ways:
//!
//! - **synchronously**: publish `did<Action>[.suffix]` while handling the
//!   request.
//! - **asynchronously**: publish `will<Action>[.suffix]` while handling the
//!   request, then `did<Action>[.suffix]` whenever the work is done. Both
//!   replies must carry the same sender so they can be paired.
//!
//! [`EventBus::publish_and_gather_replies`] publishes the request and
//! resolves with all `did` events once the request was delivered and every
//! `will` was matched by a `did`:
//!
//! ```text
//! initiator            bus                     collaborator (sender "B")
//!     │ doThingRequest  │                               │
//!     ├────────────────►│──────── doThingRequest ──────►│
//!     │                 │◄─────── willDoThing {B} ──────┤
//!     │                 │   pending = [B]               │ (async work)
//!     │                 │◄─────── didDoThing {B} ───────┤
//!     │◄── [didDoThing] │   pending = []                │
//! ```
//!
//! If some `did` never arrives, the pending reply timeout reports a
//! [`BusFault::ReplyTimeout`] to the error handler and the replies gathered
//! so far are returned anyway.

use std::fmt;
use std::future::Future;
use std::mem;
use std::pin::Pin;
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use anyhow::anyhow;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::bus::{lock, EventBus, Inner};
use crate::core::{Event, Handler, HandlerId, PublishOptions};
use crate::error::{BusError, BusFault};
use crate::scheduler::TimerHandle;
use crate::settlement::Settlement;
use crate::topic::RequestTopic;

// =============================================================================
// Options
// =============================================================================

/// Options for [`EventBus::publish_and_gather_replies`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GatherOptions {
    /// Options the request itself is published with.
    pub publish: PublishOptions,
    /// Overrides the bus's pending reply timeout for this request.
    pub pending_reply_timeout: Option<Duration>,
}

impl GatherOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.publish = self.publish.with_sender(sender);
        self
    }

    pub fn deliver_to_sender(mut self, deliver: bool) -> Self {
        self.publish = self.publish.deliver_to_sender(deliver);
        self
    }

    pub fn with_pending_reply_timeout(mut self, timeout: Duration) -> Self {
        self.pending_reply_timeout = Some(timeout);
        self
    }
}

// =============================================================================
// Replies Future
// =============================================================================

/// Resolves with the `did` replies to a request, in arrival order.
///
/// Never fails; a timeout resolves with the replies gathered until then.
#[must_use = "Replies does nothing unless awaited"]
pub struct Replies {
    rx: oneshot::Receiver<Vec<Event>>,
}

impl Future for Replies {
    type Output = Vec<Event>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Vec<Event>> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|replies| replies.unwrap_or_default())
    }
}

impl fmt::Debug for Replies {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Replies").finish_non_exhaustive()
    }
}

// =============================================================================
// Coordinator
// =============================================================================

#[derive(Default)]
struct GatherState {
    pending: Vec<String>,
    replies: Vec<Event>,
    publish_settled: bool,
    finished: bool,
    collectors: Vec<HandlerId>,
    timer: Option<TimerHandle>,
    reply_tx: Option<oneshot::Sender<Vec<Event>>>,
}

/// Bookkeeping of one gathered request.
struct Gather {
    bus: Weak<Inner>,
    topic: RequestTopic,
    sender: Option<String>,
    timeout: Duration,
    state: Mutex<GatherState>,
}

impl Gather {
    fn on_will(&self, event: &Event) -> anyhow::Result<()> {
        let sender = event
            .sender
            .as_deref()
            .filter(|sender| !sender.is_empty())
            .ok_or_else(|| {
                anyhow!(
                    "a {} reply to {} must carry a sender",
                    event.name,
                    self.topic
                )
            })?;

        let mut state = lock(&self.state);
        if !state.finished {
            state.pending.push(sender.to_string());
        }
        Ok(())
    }

    fn on_did(&self, event: &Event) {
        let complete = {
            let mut state = lock(&self.state);
            if state.finished {
                return;
            }
            state.replies.push(event.clone());
            if let Some(sender) = &event.sender {
                if let Some(index) = state.pending.iter().position(|p| p == sender) {
                    state.pending.remove(index);
                }
            }
            state.pending.is_empty() && state.publish_settled
        };
        if complete {
            self.finish();
        }
    }

    fn on_publish_settled(&self) {
        let complete = {
            let mut state = lock(&self.state);
            if state.finished {
                return;
            }
            state.publish_settled = true;
            // no will at all, or every did arrived within the request's cycle
            state.pending.is_empty()
        };
        if complete {
            self.finish();
        }
    }

    fn on_timeout(&self) {
        let missing = {
            let state = lock(&self.state);
            if state.finished || state.pending.is_empty() {
                return;
            }
            state.pending.clone()
        };

        let message = format!(
            "Timeout while waiting for pending {} on {}.",
            self.topic.did_topic(),
            self.topic
        );
        warn!(
            request = %self.topic,
            sender = self.sender.as_deref().unwrap_or(""),
            timeout_ms = u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
            missing = ?missing,
            "pending replies timed out"
        );
        if let Some(bus) = self.bus.upgrade() {
            bus.report(&BusFault::ReplyTimeout {
                message,
                request: self.topic.request().to_string(),
                sender: self.sender.clone(),
                timeout: self.timeout,
                missing,
            });
        }
        self.finish();
    }

    /// Stops the timer, removes the collectors and hands out the replies.
    /// Only the first call has an effect.
    fn finish(&self) {
        let (collectors, timer, reply_tx, replies) = {
            let mut state = lock(&self.state);
            if state.finished {
                return;
            }
            state.finished = true;
            (
                mem::take(&mut state.collectors),
                state.timer.take(),
                state.reply_tx.take(),
                mem::take(&mut state.replies),
            )
        };

        if let Some(timer) = timer {
            timer.cancel();
        }
        if let Some(bus) = self.bus.upgrade() {
            for collector in collectors {
                bus.unsubscribe(collector);
            }
        }
        debug!(request = %self.topic, replies = replies.len(), "gathered replies");
        if let Some(reply_tx) = reply_tx {
            // the initiator may have stopped waiting
            let _ = reply_tx.send(replies);
        }
    }
}

impl EventBus {
    /// Publishes a `<action>Request[.suffix]` event and gathers the
    /// `did<Action>[.suffix]` replies of all collaborators.
    ///
    /// Collaborators that publish `will<Action>[.suffix]` are waited for until
    /// they publish the matching `did`, or until the pending reply timeout
    /// expires. The request's sender, taken from the options or the payload,
    /// labels the internal reply subscriptions.
    ///
    /// Fails synchronously if `name` is not a request topic.
    pub fn publish_and_gather_replies(
        &self,
        name: &str,
        payload: Value,
        options: GatherOptions,
    ) -> Result<Replies, BusError> {
        let topic = RequestTopic::parse(name)?;
        let GatherOptions {
            publish,
            pending_reply_timeout,
        } = options;

        let sender = publish.sender.clone().or_else(|| {
            payload
                .get("sender")
                .and_then(Value::as_str)
                .map(str::to_string)
        });
        let timeout = pending_reply_timeout.unwrap_or(self.config().pending_reply_timeout);
        let label = sender.clone().unwrap_or_default();

        let (reply_tx, rx) = oneshot::channel();
        let gather = Arc::new(Gather {
            bus: Arc::downgrade(&self.inner),
            topic,
            sender,
            timeout,
            state: Mutex::new(GatherState {
                reply_tx: Some(reply_tx),
                ..GatherState::default()
            }),
        });

        let will_collector = {
            let gather = Arc::clone(&gather);
            Handler::new(move |event, _| gather.on_will(event))
        };
        let did_collector = {
            let gather = Arc::clone(&gather);
            Handler::new(move |event, _| {
                gather.on_did(event);
                Ok(())
            })
        };
        lock(&gather.state).collectors = vec![will_collector.id(), did_collector.id()];
        self.subscribe(&gather.topic.will_topic(), &will_collector, &label)?;
        self.subscribe(&gather.topic.did_topic(), &did_collector, &label)?;

        let timer = {
            let gather = Arc::clone(&gather);
            self.inner
                .scheduler()
                .set_timeout(timeout, Box::new(move || gather.on_timeout()))
        };
        {
            let mut state = lock(&gather.state);
            if state.finished {
                drop(state);
                timer.cancel();
            } else {
                state.timer = Some(timer);
            }
        }

        debug!(
            bus = %self.id(),
            request = %gather.topic,
            sender = %label,
            timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            "gathering replies"
        );

        let settlement = {
            let gather = Arc::clone(&gather);
            Settlement::new(move || gather.on_publish_settled())
        };
        if let Err(err) = self.inner.publish(name, payload, publish, settlement) {
            gather.finish();
            return Err(err);
        }

        Ok(Replies { rx })
    }
}
