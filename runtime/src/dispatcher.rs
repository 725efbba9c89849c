//! In-process event dispatch through an explicit handler registry.
//!
//! [`InProcessPublisher`] is the production [`EventPublisher`]. Handlers are
//! registered per `event_type` at startup; nothing is discovered at runtime.
//! Typed handlers register a decoder together with the handler, so the
//! registry is also the `event_type → decoder` table used to turn a stored
//! payload back into a domain event.
//!
//! # Example
//!
//! ```
//! use composable_outbox_runtime::dispatcher::{HandlerError, InProcessPublisher};
//! use serde::Deserialize;
//!
//! #[derive(Deserialize)]
//! struct OrderPlaced { order_id: String }
//!
//! let mut publisher = InProcessPublisher::new();
//! publisher.subscribe("OrderPlaced.v1", "reserve-stock", |event: OrderPlaced| async move {
//!     if event.order_id.is_empty() {
//!         return Err(HandlerError::failed("empty order id"));
//!     }
//!     Ok(())
//! });
//!
//! assert_eq!(publisher.handler_count("OrderPlaced.v1"), 1);
//! ```

use composable_outbox_core::publisher::{EventPublisher, PublishError};
use composable_outbox_core::{EventError, StoredEvent};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;

/// Boxed future returned by [`EventHandler::handle`].
pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + 'a>>;

/// Error returned by a handler.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// The handler rejected or could not process the event.
    #[error("{0}")]
    Failed(String),

    /// The payload could not be decoded into the handler's event type.
    #[error(transparent)]
    Decode(#[from] EventError),
}

impl HandlerError {
    /// Shorthand for [`HandlerError::Failed`].
    #[must_use]
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed(reason.into())
    }
}

/// A consumer of stored events.
///
/// Handlers must be idempotent: in Hybrid mode the same event can reach a
/// handler from the immediate path and again from the outbox.
pub trait EventHandler: Send + Sync {
    /// Name used in logs and errors.
    fn name(&self) -> &str;

    /// Handle one event.
    fn handle<'a>(&'a self, event: &'a StoredEvent) -> HandlerFuture<'a>;
}

/// Adapter that decodes the payload into `E` before calling a closure.
struct TypedHandler<E, F> {
    name: String,
    handler: F,
    _event: PhantomData<fn() -> E>,
}

impl<E, F, Fut> EventHandler for TypedHandler<E, F>
where
    E: DeserializeOwned + Send + 'static,
    F: Fn(E) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn handle<'a>(&'a self, event: &'a StoredEvent) -> HandlerFuture<'a> {
        Box::pin(async move {
            let decoded = event.decode::<E>()?;
            (self.handler)(decoded).await
        })
    }
}

/// Handler registry implementing [`EventPublisher`].
///
/// Handlers for one event type run sequentially in registration order; the
/// first failure stops dispatch of that event.
#[derive(Default, Clone)]
pub struct InProcessPublisher {
    handlers: HashMap<String, Vec<Arc<dyn EventHandler>>>,
}

impl InProcessPublisher {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a typed handler for `event_type`.
    ///
    /// The payload is decoded as JSON into `E` before `handler` is called.
    pub fn subscribe<E, F, Fut>(
        &mut self,
        event_type: impl Into<String>,
        name: impl Into<String>,
        handler: F,
    ) -> &mut Self
    where
        E: DeserializeOwned + Send + 'static,
        F: Fn(E) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        let handler = TypedHandler {
            name: name.into(),
            handler,
            _event: PhantomData,
        };
        self.subscribe_raw(event_type, Arc::new(handler))
    }

    /// Register a handler that receives the raw [`StoredEvent`].
    pub fn subscribe_raw(
        &mut self,
        event_type: impl Into<String>,
        handler: Arc<dyn EventHandler>,
    ) -> &mut Self {
        let event_type = event_type.into();
        tracing::debug!(
            event_type = %event_type,
            handler = handler.name(),
            "Registered in-process handler"
        );
        self.handlers.entry(event_type).or_default().push(handler);
        self
    }

    /// Number of handlers registered for `event_type`.
    #[must_use]
    pub fn handler_count(&self, event_type: &str) -> usize {
        self.handlers.get(event_type).map_or(0, Vec::len)
    }

    /// Event types that have at least one handler.
    #[must_use]
    pub fn event_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}

impl EventPublisher for InProcessPublisher {
    fn publish<'a>(
        &'a self,
        event: &'a StoredEvent,
    ) -> Pin<Box<dyn Future<Output = Result<(), PublishError>> + Send + 'a>> {
        Box::pin(async move {
            let Some(handlers) = self.handlers.get(&event.event_type) else {
                tracing::trace!(event_type = %event.event_type, "No in-process handlers registered");
                return Ok(());
            };

            for handler in handlers {
                handler.handle(event).await.map_err(|e| match e {
                    HandlerError::Decode(decode) => PublishError::Decode(decode),
                    HandlerError::Failed(reason) => PublishError::HandlerFailed {
                        handler: handler.name().to_string(),
                        event_type: event.event_type.clone(),
                        reason,
                    },
                })?;

                tracing::trace!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    handler = handler.name(),
                    "Event handled in-process"
                );
            }

            Ok(())
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde::{Deserialize, Serialize};
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct OrderPlaced {
        order_id: String,
    }

    fn stored(order_id: &str) -> StoredEvent {
        let now = Utc::now();
        let payload = serde_json::to_string(&OrderPlaced {
            order_id: order_id.to_string(),
        })
        .unwrap();
        StoredEvent::new("OrderPlaced.v1", payload, now, now)
    }

    #[tokio::test]
    async fn typed_handler_receives_decoded_event() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);

        let mut publisher = InProcessPublisher::new();
        publisher.subscribe("OrderPlaced.v1", "collector", move |event: OrderPlaced| {
            let seen = Arc::clone(&seen_clone);
            async move {
                seen.lock().unwrap().push(event.order_id);
                Ok(())
            }
        });

        publisher.publish(&stored("o-1")).await.unwrap();
        assert_eq!(*seen.lock().unwrap(), vec!["o-1".to_string()]);
    }

    #[tokio::test]
    async fn unregistered_type_is_a_no_op() {
        let publisher = InProcessPublisher::new();
        assert!(publisher.publish(&stored("o-1")).await.is_ok());
    }

    #[tokio::test]
    async fn first_failure_stops_remaining_handlers() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let first = Arc::clone(&calls);
        let second = Arc::clone(&calls);

        let mut publisher = InProcessPublisher::new();
        publisher
            .subscribe("OrderPlaced.v1", "failing", move |_: OrderPlaced| {
                let calls = Arc::clone(&first);
                async move {
                    calls.lock().unwrap().push("failing");
                    Err(HandlerError::failed("inventory offline"))
                }
            })
            .subscribe("OrderPlaced.v1", "never-called", move |_: OrderPlaced| {
                let calls = Arc::clone(&second);
                async move {
                    calls.lock().unwrap().push("never-called");
                    Ok(())
                }
            });

        let err = publisher.publish(&stored("o-1")).await.unwrap_err();
        assert!(matches!(
            err,
            PublishError::HandlerFailed { ref handler, ref reason, .. }
                if handler == "failing" && reason == "inventory offline"
        ));
        assert_eq!(*calls.lock().unwrap(), vec!["failing"]);
    }

    #[tokio::test]
    async fn decode_failure_is_reported() {
        #[derive(Deserialize)]
        struct Wrong {
            #[allow(dead_code)]
            amount_cents: u64,
        }

        let mut publisher = InProcessPublisher::new();
        publisher.subscribe("OrderPlaced.v1", "wrong", |_: Wrong| async { Ok(()) });

        let err = publisher.publish(&stored("o-1")).await.unwrap_err();
        assert!(matches!(err, PublishError::Decode(_)));
    }

    #[tokio::test]
    async fn batch_continues_past_failures() {
        let mut publisher = InProcessPublisher::new();
        publisher.subscribe("OrderPlaced.v1", "picky", |event: OrderPlaced| async move {
            if event.order_id == "bad" {
                Err(HandlerError::failed("rejected"))
            } else {
                Ok(())
            }
        });

        let events = vec![stored("a"), stored("bad"), stored("c")];
        let report = publisher.publish_batch(&events).await;

        assert_eq!(report.succeeded, vec![events[0].id, events[2].id]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, events[1].id);
    }

    #[test]
    fn event_types_are_sorted() {
        let mut publisher = InProcessPublisher::new();
        publisher
            .subscribe("b", "h1", |_: serde_json::Value| async { Ok(()) })
            .subscribe("a", "h2", |_: serde_json::Value| async { Ok(()) });
        assert_eq!(publisher.event_types(), vec!["a", "b"]);
    }
}
