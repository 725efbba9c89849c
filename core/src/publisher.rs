//! In-process event dispatch.
//!
//! An [`EventPublisher`] hands events to handlers living in the same process,
//! inside the caller's task. It provides no persistence and no durability: if
//! the process dies mid-dispatch the event is gone unless it was also written
//! to the outbox.
//!
//! The runtime crate provides `InProcessPublisher`, a handler registry keyed by
//! `event_type`.

use crate::event::EventError;
use crate::stored_event::{EventId, StoredEvent};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors raised while dispatching an event in-process.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    /// A handler returned an error.
    #[error("Handler '{handler}' failed for {event_type}: {reason}")]
    HandlerFailed {
        /// Name of the failing handler.
        handler: String,
        /// The event type being dispatched.
        event_type: String,
        /// The handler's error message.
        reason: String,
    },

    /// The payload could not be decoded for a typed handler.
    #[error(transparent)]
    Decode(#[from] EventError),
}

/// Outcome of a batch dispatch or batch publish.
///
/// Each event of the batch lands in exactly one of the two lists, in the order
/// it was attempted.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BatchReport {
    /// Events that were handled successfully.
    pub succeeded: Vec<EventId>,
    /// Events that failed, with the error message.
    pub failed: Vec<(EventId, String)>,
}

impl BatchReport {
    /// Record a success.
    pub fn record_success(&mut self, id: EventId) {
        self.succeeded.push(id);
    }

    /// Record a failure.
    pub fn record_failure(&mut self, id: EventId, error: impl ToString) {
        self.failed.push((id, error.to_string()));
    }

    /// `true` if no event failed.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    /// Number of events attempted.
    #[must_use]
    pub fn total(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }
}

/// Synchronous (awaited-in-caller) dispatch to in-process handlers.
///
/// # Dyn Compatibility
///
/// Uses explicit `Pin<Box<dyn Future>>` returns so it can be shared as
/// `Arc<dyn EventPublisher>` between the event bus and the outbox processor.
pub trait EventPublisher: Send + Sync {
    /// Deliver `event` to every handler registered for its type.
    ///
    /// # Errors
    ///
    /// Returns the first handler error. Handlers after the failing one are not run.
    fn publish<'a>(
        &'a self,
        event: &'a StoredEvent,
    ) -> Pin<Box<dyn Future<Output = Result<(), PublishError>> + Send + 'a>>;

    /// Deliver events in order, continuing past failures.
    fn publish_batch<'a>(
        &'a self,
        events: &'a [StoredEvent],
    ) -> Pin<Box<dyn Future<Output = BatchReport> + Send + 'a>> {
        Box::pin(async move {
            let mut report = BatchReport::default();
            for event in events {
                match self.publish(event).await {
                    Ok(()) => report.record_success(event.id),
                    Err(e) => report.record_failure(event.id, e),
                }
            }
            report
        })
    }
}
