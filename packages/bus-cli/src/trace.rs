//! `bus-trace match`: which subscriptions receive an event, and in what order.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::json;
use topic_bus::{BusConfig, EventBus, InspectionLog, Weight};

/// One delivery of the traced event.
#[derive(Debug, Clone, Serialize)]
pub struct MatchRow {
    pub order: usize,
    pub label: String,
    pub pattern: String,
    pub segments: u32,
    pub subsegments: u32,
}

/// Subscribes one handler per pattern (labelled `s0`, `s1`, ...), publishes
/// `event` once and returns the recorded deliveries in delivery order.
pub async fn run_match(config: &BusConfig, patterns: &[String], event: &str) -> Result<Vec<MatchRow>> {
    let bus = EventBus::with_tokio(config.clone())?;
    let log = Arc::new(InspectionLog::new());
    bus.set_inspector(log.inspector());

    for (index, pattern) in patterns.iter().enumerate() {
        bus.on(pattern, &format!("s{index}"), |_, _| Ok(()))
            .with_context(|| format!("invalid subscription pattern {pattern:?}"))?;
    }

    bus.publish(event, json!({}))
        .with_context(|| format!("invalid event name {event:?}"))?
        .await;

    let rows = log
        .deliveries_of(event)
        .into_iter()
        .enumerate()
        .map(|(order, record)| {
            let pattern = record.subscribed_to.unwrap_or_default();
            let weight = Weight::of(&pattern);
            MatchRow {
                order: order + 1,
                label: record.target,
                pattern,
                segments: weight.segments,
                subsegments: weight.subsegments,
            }
        })
        .collect();

    tracing::debug!(event, subscriptions = patterns.len(), "traced event");
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patterns(list: &[&str]) -> Vec<String> {
        list.iter().map(|p| p.to_string()).collect()
    }

    #[tokio::test]
    async fn test_most_specific_pattern_first() {
        let rows = run_match(
            &BusConfig::default(),
            &patterns(&["didChangeLocale", "didChangeLocale.de", "didChangeLocale.de-DE", "didSave"]),
            "didChangeLocale.de-DE",
        )
        .await
        .unwrap();

        let order: Vec<&str> = rows.iter().map(|r| r.pattern.as_str()).collect();
        assert_eq!(
            order,
            vec!["didChangeLocale.de-DE", "didChangeLocale.de", "didChangeLocale"]
        );
        assert_eq!(rows[0].label, "s2");
        assert_eq!((rows[0].segments, rows[0].subsegments), (2, 1));
        assert_eq!(rows[2].order, 3);
    }

    #[tokio::test]
    async fn test_no_matching_subscription() {
        let rows = run_match(&BusConfig::default(), &patterns(&["didSave"]), "didNavigate")
            .await
            .unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn test_empty_pattern_is_an_error() {
        let err = run_match(&BusConfig::default(), &patterns(&[""]), "didSave")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("invalid subscription pattern"));
    }
}
