//! Topic grammar.
//!
//! A topic is a dot-separated list of segments. Within a segment, dashes
//! separate sub-segments:
//!
//! ```text
//! didChangeAreaVisibility.content-left.true
//! └──── segment ────────┘ └─ segment ─┘ └──┘
//!                          sub  -  sub
//! ```
//!
//! In a subscription pattern an empty segment is a wildcard (`.event`,
//! `some..event`) and every pattern implicitly ends with a wildcard, so
//! `some.event` also receives `some.event.again`. Subscribing to a dash
//! prefix (`some.event`) receives longer dash extensions (`some.event-again`).

use std::cmp::Ordering;
use std::fmt;

use crate::error::BusError;

/// Separator between topic segments.
pub const PART_SEPARATOR: char = '.';

/// Separator between sub-segments of one segment.
pub const SUB_PART_SEPARATOR: char = '-';

const REQUEST_MARKER: &str = "Request";

/// Rejects empty topic names.
pub(crate) fn ensure_topic(topic: &str) -> Result<(), BusError> {
    if topic.is_empty() {
        return Err(BusError::EmptyTopic);
    }
    Ok(())
}

// =============================================================================
// Subscription Weight
// =============================================================================

/// Specificity of a subscription pattern.
///
/// `segments` counts the non-wildcard segments, `subsegments` the dashes
/// across those segments. Weights compare lexicographically; a heavier
/// subscription is more specific and receives an event before lighter ones.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Weight {
    /// Number of non-empty segments.
    pub segments: u32,
    /// Total number of sub-segment separators in those segments.
    pub subsegments: u32,
}

impl Weight {
    /// Computes the weight of a subscription pattern.
    pub fn of(pattern: &str) -> Self {
        pattern
            .split(PART_SEPARATOR)
            .filter(|part| !part.is_empty())
            .fold(Weight::default(), |mut weight, part| {
                weight.segments += 1;
                weight.subsegments += part.matches(SUB_PART_SEPARATOR).count() as u32;
                weight
            })
    }
}

impl Ord for Weight {
    fn cmp(&self, other: &Self) -> Ordering {
        self.segments
            .cmp(&other.segments)
            .then(self.subsegments.cmp(&other.subsegments))
    }
}

impl PartialOrd for Weight {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Weight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.segments, self.subsegments)
    }
}

/// Candidate child keys for one event segment, longest first.
///
/// A segment without sub-segments yields only itself. `a-b-c` yields
/// `a-b-c`, `a-b`, `a`.
pub(crate) fn dash_prefixes(segment: &str) -> impl Iterator<Item = &str> {
    let mut next = Some(segment);
    std::iter::from_fn(move || {
        let current = next?;
        next = current
            .rfind(SUB_PART_SEPARATOR)
            .map(|index| &current[..index]);
        Some(current)
    })
}

// =============================================================================
// Request Topics
// =============================================================================

/// A parsed `<x>Request[.suffix]` topic.
///
/// `takeActionRequest.now` gathers replies published as
/// `willTakeAction.now` and `didTakeAction.now`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestTopic {
    request: String,
    reply_suffix: String,
}

impl RequestTopic {
    /// Parses a request topic, failing for anything not shaped like
    /// `<first><rest>Request` optionally followed by `.<suffix>`.
    pub fn parse(topic: &str) -> Result<Self, BusError> {
        let invalid = || BusError::InvalidRequestTopic {
            topic: topic.to_string(),
        };

        // The head ends at the last "Request" that is either the end of the
        // topic or directly followed by a non-empty dot suffix.
        let (head, tail) = topic
            .rmatch_indices(REQUEST_MARKER)
            .map(|(index, _)| (&topic[..index], &topic[index + REQUEST_MARKER.len()..]))
            .find(|(head, tail)| {
                !head.is_empty()
                    && (tail.is_empty()
                        || (tail.starts_with(PART_SEPARATOR) && tail.len() > 1))
            })
            .ok_or_else(invalid)?;

        let mut chars = head.chars();
        let first = chars.next().ok_or_else(invalid)?;
        let mut reply_suffix: String = first.to_uppercase().collect();
        reply_suffix.push_str(chars.as_str());
        reply_suffix.push_str(tail);

        Ok(Self {
            request: topic.to_string(),
            reply_suffix,
        })
    }

    /// The request topic as given.
    pub fn request(&self) -> &str {
        &self.request
    }

    /// Topic collaborators announce pending work on.
    pub fn will_topic(&self) -> String {
        format!("will{}", self.reply_suffix)
    }

    /// Topic collaborators confirm completed work on.
    pub fn did_topic(&self) -> String {
        format!("did{}", self.reply_suffix)
    }
}

impl fmt::Display for RequestTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_weight_counts_segments_and_dashes() {
        assert_eq!(
            Weight::of("a.b"),
            Weight {
                segments: 2,
                subsegments: 0
            }
        );
        assert_eq!(
            Weight::of(".b"),
            Weight {
                segments: 1,
                subsegments: 0
            }
        );
        assert_eq!(
            Weight::of("a-x-y..c-d"),
            Weight {
                segments: 2,
                subsegments: 3
            }
        );
        assert_eq!(Weight::of("."), Weight::default());
    }

    #[test]
    fn test_weight_orders_segments_before_subsegments() {
        assert!(Weight::of("a.b") > Weight::of("a-b-c-d"));
        assert!(Weight::of("a-b.c") > Weight::of("a.c"));
        assert!(Weight::of("a.b") > Weight::of(".b"));
        assert_eq!(
            Weight::of("a.b").cmp(&Weight::of("x.y")),
            Ordering::Equal
        );
    }

    #[test]
    fn test_dash_prefixes_longest_first() {
        let prefixes: Vec<_> = dash_prefixes("a-b-c").collect();
        assert_eq!(prefixes, vec!["a-b-c", "a-b", "a"]);

        let plain: Vec<_> = dash_prefixes("plain").collect();
        assert_eq!(plain, vec!["plain"]);
    }

    #[test]
    fn test_request_topic_reply_names() {
        let topic = RequestTopic::parse("doThingRequest").unwrap();
        assert_eq!(topic.will_topic(), "willDoThing");
        assert_eq!(topic.did_topic(), "didDoThing");

        let topic = RequestTopic::parse("changeAreaVisibilityRequest.content").unwrap();
        assert_eq!(topic.will_topic(), "willChangeAreaVisibility.content");
        assert_eq!(topic.did_topic(), "didChangeAreaVisibility.content");
        assert_eq!(topic.request(), "changeAreaVisibilityRequest.content");
    }

    #[test]
    fn test_request_topic_single_letter_head() {
        let topic = RequestTopic::parse("xRequest").unwrap();
        assert_eq!(topic.did_topic(), "didX");
    }

    #[test]
    fn test_request_topic_rejects_malformed_names() {
        for topic in ["doThing", "Request", "doThingRequested", "doThingRequest.", ""] {
            assert!(
                matches!(
                    RequestTopic::parse(topic),
                    Err(BusError::InvalidRequestTopic { .. })
                ),
                "{topic} should be rejected"
            );
        }
    }

    #[test]
    fn test_request_topic_uses_last_request_marker() {
        let topic = RequestTopic::parse("aRequest.xRequest").unwrap();
        assert_eq!(topic.did_topic(), "didARequest.x");

        let topic = RequestTopic::parse("aRequestRequest").unwrap();
        assert_eq!(topic.will_topic(), "willARequest");
    }

    #[test]
    fn test_ensure_topic_rejects_empty() {
        assert!(matches!(ensure_topic(""), Err(BusError::EmptyTopic)));
        assert!(ensure_topic(".").is_ok());
    }
}
