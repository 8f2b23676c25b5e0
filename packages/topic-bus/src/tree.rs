//! Topic tree: a trie over topic segments.
//!
//! Each node maps a segment (or the wildcard) to a child node and holds the
//! subscriptions whose pattern ends at that node. Matching an event name
//! walks the trie once, collecting subscriptions from every node on a
//! matching path:
//!
//! ```text
//! root
//!  ├── "didChangeLocale" ── [LocaleManager]          ← didChangeLocale
//!  │    └── "de_DE" ─────── [widget.i18n#1]          ← didChangeLocale.de_DE
//!  └── * ──────────────────
//!       └── "de_DE" ─────── [Logger]                 ← .de_DE
//! ```
//!
//! Publishing `didChangeLocale.de_DE-formal` visits `didChangeLocale`, then
//! `de_DE-formal` and its dash prefix `de_DE`, and the wildcard branch, so
//! all three subscribers receive it.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use smallvec::SmallVec;

use crate::core::{Handler, HandlerId};
use crate::topic::{dash_prefixes, Weight, PART_SEPARATOR};

/// Matched subscriptions of one event, most specific first.
pub(crate) type Recipients = SmallVec<[Arc<Subscription>; 8]>;

// =============================================================================
// Subscription
// =============================================================================

/// One pattern a handler is subscribed to.
pub struct Subscription {
    pattern: Arc<str>,
    handler: Handler,
    label: Arc<str>,
    weight: Weight,
}

impl Subscription {
    pub(crate) fn new(pattern: &str, handler: Handler, label: &str) -> Self {
        Self {
            pattern: Arc::from(pattern),
            handler,
            label: Arc::from(label),
            weight: Weight::of(pattern),
        }
    }

    /// The pattern as passed to `subscribe`.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// The label given at subscribe time, `""` if none.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Specificity of the pattern.
    pub fn weight(&self) -> Weight {
        self.weight
    }

    /// Identity of the subscribed handler.
    pub fn handler_id(&self) -> HandlerId {
        self.handler.id()
    }

    pub(crate) fn handler(&self) -> &Handler {
        &self.handler
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("pattern", &self.pattern)
            .field("label", &self.label)
            .field("weight", &self.weight)
            .field("handler", &self.handler.id())
            .finish()
    }
}

// =============================================================================
// Tree
// =============================================================================

/// Child key of a node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum NodeKey {
    Wildcard,
    Segment(Box<str>),
}

impl NodeKey {
    fn from_pattern_part(part: &str) -> Self {
        if part.is_empty() {
            NodeKey::Wildcard
        } else {
            NodeKey::Segment(part.into())
        }
    }
}

/// A node of the topic trie.
#[derive(Default)]
pub(crate) struct TopicNode {
    children: HashMap<NodeKey, TopicNode>,
    subscriptions: Vec<Arc<Subscription>>,
}

impl TopicNode {
    /// Adds a subscription at the node addressed by its pattern.
    pub fn insert(&mut self, subscription: Arc<Subscription>) {
        let mut node = self;
        for part in subscription.pattern().split(PART_SEPARATOR) {
            node = node
                .children
                .entry(NodeKey::from_pattern_part(part))
                .or_default();
        }
        node.subscriptions.push(subscription);
    }

    /// Removes every subscription of `handler` stored under `pattern`.
    ///
    /// Returns the number of removed subscriptions. Nodes left without
    /// subscriptions and children are pruned.
    pub fn remove(&mut self, pattern: &str, handler: HandlerId) -> usize {
        let parts: Vec<&str> = pattern.split(PART_SEPARATOR).collect();
        self.remove_at(&parts, handler)
    }

    fn remove_at(&mut self, parts: &[&str], handler: HandlerId) -> usize {
        let Some((first, rest)) = parts.split_first() else {
            let before = self.subscriptions.len();
            self.subscriptions.retain(|s| s.handler_id() != handler);
            return before - self.subscriptions.len();
        };

        let key = NodeKey::from_pattern_part(first);
        let Some(child) = self.children.get_mut(&key) else {
            return 0;
        };
        let removed = child.remove_at(rest, handler);
        if child.is_empty() {
            self.children.remove(&key);
        }
        removed
    }

    fn is_empty(&self) -> bool {
        self.subscriptions.is_empty() && self.children.is_empty()
    }

    /// Collects the subscriptions matching `event_name`, most specific first.
    ///
    /// Ties keep collection order: exact segments before dash prefixes
    /// before wildcards, depth first.
    pub fn matching(&self, event_name: &str) -> Recipients {
        let parts: SmallVec<[&str; 8]> = event_name.split(PART_SEPARATOR).collect();
        let mut found = Recipients::new();
        self.collect(&parts, &mut found);
        // stable: equal weights stay in collection order
        found.sort_by(|a, b| b.weight().cmp(&a.weight()));
        found
    }

    fn collect(&self, parts: &[&str], found: &mut Recipients) {
        found.extend(self.subscriptions.iter().cloned());

        let Some((part, rest)) = parts.split_first() else {
            return;
        };

        for candidate in dash_prefixes(part) {
            if let Some(child) = self.children.get(&NodeKey::Segment(candidate.into())) {
                child.collect(rest, found);
            }
        }

        if let Some(child) = self.children.get(&NodeKey::Wildcard) {
            child.collect(rest, found);
        }
    }

    /// Total number of subscriptions in this subtree.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
            + self
                .children
                .values()
                .map(TopicNode::subscription_count)
                .sum::<usize>()
    }
}

impl fmt::Debug for TopicNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TopicNode")
            .field("subscriptions", &self.subscriptions.len())
            .field("children", &self.children.len())
            .finish()
    }
}
