//! Recording [`MessageTransport`] with failure injection.

#![allow(clippy::unwrap_used)]
#![allow(clippy::missing_panics_doc)]

use composable_outbox_core::transport::TransportFuture;
use composable_outbox_core::{DateTime, MessageTransport, TransportError, TransportMessage, Utc};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// A message accepted by [`InMemoryTransport`].
#[derive(Debug, Clone, PartialEq)]
pub struct Delivered {
    /// `None` for the default destination.
    pub destination: Option<String>,
    /// The message.
    pub message: TransportMessage,
    /// Requested delivery time for scheduled publishes.
    pub scheduled_for: Option<DateTime<Utc>>,
}

/// Transport that keeps every accepted message in memory.
///
/// # Example
///
/// ```
/// use composable_outbox_testing::InMemoryTransport;
///
/// let transport = InMemoryTransport::new();
/// transport.fail_next(2);
/// assert!(transport.delivered().is_empty());
/// ```
#[derive(Clone, Default)]
pub struct InMemoryTransport {
    delivered: Arc<Mutex<Vec<Delivered>>>,
    attempts: Arc<AtomicUsize>,
    fail_next: Arc<AtomicUsize>,
    fail_always: Arc<AtomicBool>,
    delay: Arc<Mutex<Option<Duration>>>,
}

impl InMemoryTransport {
    /// Empty transport that accepts everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject the next `count` messages.
    pub fn fail_next(&self, count: usize) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// Reject every message until called again with `false`.
    pub fn fail_always(&self, fail: bool) {
        self.fail_always.store(fail, Ordering::SeqCst);
    }

    /// Sleep this long before answering each call.
    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock().unwrap() = delay;
    }

    /// Every accepted message, in acceptance order.
    #[must_use]
    pub fn delivered(&self) -> Vec<Delivered> {
        self.delivered.lock().unwrap().clone()
    }

    /// Accepted messages only.
    #[must_use]
    pub fn messages(&self) -> Vec<TransportMessage> {
        self.delivered().into_iter().map(|d| d.message).collect()
    }

    /// Accepted messages sent to `destination`.
    #[must_use]
    pub fn sent_to(&self, destination: &str) -> Vec<TransportMessage> {
        self.delivered()
            .into_iter()
            .filter(|d| d.destination.as_deref() == Some(destination))
            .map(|d| d.message)
            .collect()
    }

    /// Calls received, accepted or not.
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    fn accept(
        &self,
        destination: Option<String>,
        message: TransportMessage,
        scheduled_for: Option<DateTime<Utc>>,
    ) -> TransportFuture<'_> {
        Box::pin(async move {
            self.attempts.fetch_add(1, Ordering::SeqCst);

            let delay = *self.delay.lock().unwrap();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }

            let injected = self
                .fail_next
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if injected || self.fail_always.load(Ordering::SeqCst) {
                return Err(TransportError::PublishFailed {
                    destination: destination.unwrap_or_else(|| "default".to_string()),
                    reason: "injected failure".to_string(),
                });
            }

            self.delivered.lock().unwrap().push(Delivered {
                destination,
                message,
                scheduled_for,
            });
            Ok(())
        })
    }
}

impl MessageTransport for InMemoryTransport {
    fn publish(&self, message: TransportMessage) -> TransportFuture<'_> {
        self.accept(None, message, None)
    }

    fn send(&self, destination: &str, message: TransportMessage) -> TransportFuture<'_> {
        if destination.is_empty() {
            return Box::pin(async {
                Err(TransportError::InvalidDestination(
                    "destination must not be empty".to_string(),
                ))
            });
        }
        self.accept(Some(destination.to_string()), message, None)
    }

    fn schedule_publish(
        &self,
        message: TransportMessage,
        when: DateTime<Utc>,
    ) -> TransportFuture<'_> {
        self.accept(None, message, Some(when))
    }
}
