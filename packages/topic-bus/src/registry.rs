//! Subscription registry: the topic tree plus a reverse index from handler
//! to the patterns it is subscribed to.
//!
//! Both live behind one lock in the bus, so a handler's tree entries and
//! its index entry can never disagree.

use std::collections::HashMap;
use std::sync::Arc;

use crate::core::{Handler, HandlerId};
use crate::tree::{Recipients, Subscription, TopicNode};

#[derive(Debug, Default)]
pub(crate) struct Registry {
    tree: TopicNode,
    owners: HashMap<HandlerId, Vec<Arc<str>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes `handler` to `pattern` and returns the new subscription.
    pub fn subscribe(&mut self, pattern: &str, handler: &Handler, label: &str) -> Arc<Subscription> {
        let subscription = Arc::new(Subscription::new(pattern, handler.clone(), label));
        self.tree.insert(subscription.clone());
        self.owners
            .entry(handler.id())
            .or_default()
            .push(subscription.pattern().into());
        subscription
    }

    /// Removes all subscriptions of `handler`.
    ///
    /// Returns the patterns the handler was subscribed to, empty if it was
    /// not subscribed at all.
    pub fn unsubscribe(&mut self, handler: HandlerId) -> Vec<Arc<str>> {
        let Some(patterns) = self.owners.remove(&handler) else {
            return Vec::new();
        };
        for pattern in &patterns {
            self.tree.remove(pattern, handler);
        }
        patterns
    }

    pub fn matching(&self, event_name: &str) -> Recipients {
        self.tree.matching(event_name)
    }

    pub fn is_subscribed(&self, handler: HandlerId) -> bool {
        self.owners.contains_key(&handler)
    }

    pub fn subscription_count(&self) -> usize {
        self.tree.subscription_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsubscribe_removes_every_pattern_of_handler() {
        let mut registry = Registry::new();
        let handler = Handler::new(|_, _| Ok(()));
        let other = Handler::new(|_, _| Ok(()));

        registry.subscribe("didChangeLocale", &handler, "i18n");
        registry.subscribe("didChangeTheme", &handler, "i18n");
        registry.subscribe("didChangeTheme", &other, "theme");
        assert_eq!(registry.subscription_count(), 3);

        let patterns = registry.unsubscribe(handler.id());
        assert_eq!(patterns.len(), 2);
        assert!(!registry.is_subscribed(handler.id()));
        assert_eq!(registry.subscription_count(), 1);
        assert_eq!(registry.matching("didChangeTheme").len(), 1);
        assert!(registry.matching("didChangeLocale").is_empty());
    }

    #[test]
    fn test_unsubscribe_twice_is_noop() {
        let mut registry = Registry::new();
        let handler = Handler::new(|_, _| Ok(()));
        registry.subscribe("a", &handler, "");

        assert_eq!(registry.unsubscribe(handler.id()).len(), 1);
        assert!(registry.unsubscribe(handler.id()).is_empty());
    }

    #[test]
    fn test_same_pattern_twice_is_delivered_twice_and_removed_once() {
        let mut registry = Registry::new();
        let handler = Handler::new(|_, _| Ok(()));
        registry.subscribe("a", &handler, "twice");
        registry.subscribe("a", &handler, "twice");

        assert_eq!(registry.matching("a").len(), 2);
        registry.unsubscribe(handler.id());
        assert!(registry.matching("a").is_empty());
    }
}
