//! `bus-trace lifecycle`: a simulated page start-up.
//!
//! The page controller gathers `beginLifecycleRequest.default` from a set of
//! widgets. Widgets answer in one of three ways:
//!
//! - **ready**: `didBeginLifecycle.default` right away, within the request cycle
//! - **slow**: `willBeginLifecycle.default`, then `did` after a delay
//! - **silent**: `willBeginLifecycle.default`, then nothing
//!
//! Silent widgets make the request run into the pending reply timeout.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{bail, Result};
use serde::Serialize;
use serde_json::json;
use tokio::time::Instant;
use topic_bus::{BusConfig, BusFault, Collaborator, EventBus, GatherOptions, RequestTopic};

pub const LIFECYCLE_REQUEST: &str = "beginLifecycleRequest.default";
pub const PAGE_CONTROLLER: &str = "AxPageController";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Ready,
    Slow,
    Silent,
}

#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    pub widgets: usize,
    pub slow: usize,
    pub silent: usize,
    /// How long slow widgets take between `will` and `did`.
    pub delay: Duration,
    /// Overrides the bus default when set.
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WidgetSummary {
    pub id: String,
    pub role: Role,
}

#[derive(Debug, Clone, Serialize)]
pub struct LifecycleReport {
    pub widgets: Vec<WidgetSummary>,
    /// Senders of the gathered `did` replies, in arrival order.
    pub replies: Vec<String>,
    /// Widgets that announced work but never finished.
    pub missing: Vec<String>,
    pub faults: Vec<String>,
    pub elapsed_ms: u64,
}

/// Silent widgets come first, then slow ones, the rest are ready.
fn role_of(index: usize, options: &LifecycleOptions) -> Role {
    if index < options.silent {
        Role::Silent
    } else if index < options.silent + options.slow {
        Role::Slow
    } else {
        Role::Ready
    }
}

fn attach_widget(widget: &Collaborator, role: Role, delay: Duration) -> Result<()> {
    let id = widget.id().to_string();
    widget.on("beginLifecycleRequest", move |event, actions| {
        let topic = RequestTopic::parse(&event.name)?;
        let bus = actions.bus();
        let reply = json!({ "sender": id });
        match role {
            Role::Ready => {
                let _ = bus.publish(&topic.did_topic(), reply)?;
            }
            Role::Slow => {
                let _ = bus.publish(&topic.will_topic(), reply.clone())?;
                let did = topic.did_topic();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = bus.publish(&did, reply);
                });
            }
            Role::Silent => {
                let _ = bus.publish(&topic.will_topic(), reply)?;
            }
        }
        Ok(())
    })?;
    Ok(())
}

pub async fn run_lifecycle(config: &BusConfig, options: &LifecycleOptions) -> Result<LifecycleReport> {
    if options.slow + options.silent > options.widgets {
        bail!(
            "--slow ({}) and --silent ({}) together exceed --widgets ({})",
            options.slow,
            options.silent,
            options.widgets
        );
    }

    let bus = EventBus::with_tokio(config.clone())?;
    let faults = Arc::new(Mutex::new(Vec::new()));
    let missing = Arc::new(Mutex::new(Vec::new()));
    {
        let faults = faults.clone();
        let missing = missing.clone();
        bus.set_error_handler(move |fault| {
            if let BusFault::ReplyTimeout { missing: pending, .. } = fault {
                missing
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .extend(pending.iter().cloned());
            }
            faults
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(fault.to_string());
        });
    }

    let mut widgets = Vec::with_capacity(options.widgets);
    let mut summaries = Vec::with_capacity(options.widgets);
    for index in 0..options.widgets {
        let role = role_of(index, options);
        let widget = bus.widget_collaborator(&format!("w{index}"), &format!("id{index}"));
        attach_widget(&widget, role, options.delay)?;
        summaries.push(WidgetSummary {
            id: widget.id().to_string(),
            role,
        });
        widgets.push(widget);
    }

    let mut gather = GatherOptions::new();
    if let Some(timeout) = options.timeout {
        gather = gather.with_pending_reply_timeout(timeout);
    }

    let started = Instant::now();
    let page = bus.collaborator(PAGE_CONTROLLER);
    let replies = page
        .publish_and_gather_replies(LIFECYCLE_REQUEST, json!({}), gather)?
        .await;
    let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

    for widget in &widgets {
        widget.unsubscribe_all();
    }

    tracing::info!(
        replies = replies.len(),
        elapsed_ms,
        "lifecycle request finished"
    );

    let faults = std::mem::take(&mut *faults.lock().unwrap_or_else(PoisonError::into_inner));
    let missing = std::mem::take(&mut *missing.lock().unwrap_or_else(PoisonError::into_inner));
    Ok(LifecycleReport {
        widgets: summaries,
        replies: replies
            .iter()
            .map(|reply| reply.sender_or_empty().to_string())
            .collect(),
        missing,
        faults,
        elapsed_ms,
    })
}
