//! Recording in-process handler.

#![allow(clippy::unwrap_used)]
#![allow(clippy::missing_panics_doc)]

use composable_outbox_core::{EventId, StoredEvent};
use composable_outbox_runtime::dispatcher::{EventHandler, HandlerError, HandlerFuture};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Handler that records every event it sees.
///
/// # Example
///
/// ```
/// use composable_outbox_testing::RecordingHandler;
/// use composable_outbox_runtime::dispatcher::InProcessPublisher;
/// use std::sync::Arc;
///
/// let handler = Arc::new(RecordingHandler::new("audit"));
/// let mut publisher = InProcessPublisher::new();
/// publisher.subscribe_raw("OrderPlaced.v1", handler.clone());
///
/// assert_eq!(handler.count(), 0);
/// ```
#[derive(Debug)]
pub struct RecordingHandler {
    name: String,
    seen: Mutex<Vec<StoredEvent>>,
    fail_next: AtomicUsize,
    fail_always: AtomicBool,
}

impl RecordingHandler {
    /// Handler that accepts everything.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            seen: Mutex::new(Vec::new()),
            fail_next: AtomicUsize::new(0),
            fail_always: AtomicBool::new(false),
        }
    }

    /// Handler that rejects everything.
    #[must_use]
    pub fn failing(name: impl Into<String>) -> Self {
        let handler = Self::new(name);
        handler.fail_always.store(true, Ordering::SeqCst);
        handler
    }

    /// Reject the next `count` events.
    pub fn fail_next(&self, count: usize) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// Stop or start rejecting events.
    pub fn fail_always(&self, fail: bool) {
        self.fail_always.store(fail, Ordering::SeqCst);
    }

    /// Accepted events, in order.
    #[must_use]
    pub fn events(&self) -> Vec<StoredEvent> {
        self.seen.lock().unwrap().clone()
    }

    /// Ids of accepted events, in order.
    #[must_use]
    pub fn ids(&self) -> Vec<EventId> {
        self.seen.lock().unwrap().iter().map(|e| e.id).collect()
    }

    /// Number of accepted events.
    #[must_use]
    pub fn count(&self) -> usize {
        self.seen.lock().unwrap().len()
    }
}

impl EventHandler for RecordingHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn handle<'a>(&'a self, event: &'a StoredEvent) -> HandlerFuture<'a> {
        Box::pin(async move {
            let injected = self
                .fail_next
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if injected || self.fail_always.load(Ordering::SeqCst) {
                return Err(HandlerError::failed(format!("{} rejected {}", self.name, event.id)));
            }

            self.seen.lock().unwrap().push(event.clone());
            Ok(())
        })
    }
}

/// Shared handle, for registering the same recorder under several event types.
pub type SharedRecorder = Arc<RecordingHandler>;
