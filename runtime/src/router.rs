//! Destination resolution for transport delivery.

use composable_outbox_core::StoredEvent;
use std::collections::HashMap;

/// Maps an event to a transport destination.
///
/// Resolution order:
/// 1. An explicit route for the event's `event_type`
/// 2. `{aggregate-type}-events` when the event has an aggregate type
/// 3. `None`: the transport's default destination (`MessageTransport::publish`)
///
/// # Example
///
/// ```
/// use composable_outbox_runtime::router::TopicRouter;
/// use composable_outbox_core::StoredEvent;
/// use chrono::Utc;
///
/// let router = TopicRouter::new().route("PaymentCaptured.v1", "payments");
///
/// let now = Utc::now();
/// let order = StoredEvent::new("OrderPlaced.v1", "{}", now, now).with_aggregate("order", "o-1");
/// let payment = StoredEvent::new("PaymentCaptured.v1", "{}", now, now);
///
/// assert_eq!(router.resolve(&order).as_deref(), Some("order-events"));
/// assert_eq!(router.resolve(&payment).as_deref(), Some("payments"));
/// ```
#[derive(Debug, Clone)]
pub struct TopicRouter {
    routes: HashMap<String, String>,
    aggregate_topics: bool,
}

impl Default for TopicRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl TopicRouter {
    /// Router with no explicit routes and aggregate topics enabled.
    #[must_use]
    pub fn new() -> Self {
        Self {
            routes: HashMap::new(),
            aggregate_topics: true,
        }
    }

    /// Route every event of `event_type` to `destination`.
    #[must_use]
    pub fn route(mut self, event_type: impl Into<String>, destination: impl Into<String>) -> Self {
        self.routes.insert(event_type.into(), destination.into());
        self
    }

    /// Enable or disable the `{aggregate-type}-events` fallback.
    #[must_use]
    pub const fn with_aggregate_topics(mut self, enabled: bool) -> Self {
        self.aggregate_topics = enabled;
        self
    }

    /// Destination for `event`, or `None` for the transport default.
    #[must_use]
    pub fn resolve(&self, event: &StoredEvent) -> Option<String> {
        if let Some(destination) = self.routes.get(&event.event_type) {
            return Some(destination.clone());
        }

        if self.aggregate_topics {
            return event
                .aggregate_type
                .as_deref()
                .map(|aggregate_type| format!("{}-events", aggregate_type.to_ascii_lowercase()));
        }

        None
    }
}
