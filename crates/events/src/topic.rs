//! Topic resolution keyed by aggregate type.

use std::collections::HashMap;

/// Topic used for aggregate types without an explicit route.
pub const DEFAULT_TOPIC: &str = "events.default";

/// Maps aggregate tags (e.g. `"order"`, `"gift"`) to destination topics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicRouter {
    routes: HashMap<String, String>,
    default_topic: String,
}

impl Default for TopicRouter {
    fn default() -> Self {
        Self::empty(DEFAULT_TOPIC)
            .with_route("order", "events.orders")
            .with_route("gift", "events.gifts")
    }
}

impl TopicRouter {
    /// A router with no routes; everything goes to `default_topic`.
    pub fn empty(default_topic: impl Into<String>) -> Self {
        Self {
            routes: HashMap::new(),
            default_topic: default_topic.into(),
        }
    }

    pub fn with_route(mut self, aggregate_type: impl Into<String>, topic: impl Into<String>) -> Self {
        self.routes.insert(aggregate_type.into(), topic.into());
        self
    }

    pub fn resolve(&self, aggregate_type: &str) -> &str {
        self.routes
            .get(aggregate_type)
            .map(String::as_str)
            .unwrap_or(&self.default_topic)
    }

    pub fn default_topic(&self) -> &str {
        &self.default_topic
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_tags_use_fixed_topics() {
        let router = TopicRouter::default();
        assert_eq!(router.resolve("order"), "events.orders");
        assert_eq!(router.resolve("gift"), "events.gifts");
    }

    #[test]
    fn unknown_tags_fall_back_to_default() {
        let router = TopicRouter::default();
        assert_eq!(router.resolve("cart"), DEFAULT_TOPIC);
        assert_eq!(router.resolve(""), DEFAULT_TOPIC);
    }

    #[test]
    fn custom_default_topic() {
        let router = TopicRouter::empty("fallback").with_route("order", "orders");
        assert_eq!(router.resolve("gift"), "fallback");
        assert_eq!(router.resolve("order"), "orders");
    }
}
