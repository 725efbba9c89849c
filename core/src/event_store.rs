//! Event store trait: the pluggable persistence contract of the outbox.
//!
//! Every storage backend (relational, document, column-family, key-value)
//! implements [`EventStore`]. The outbox processor and the event bus only
//! ever see this trait, so backends are swapped through configuration.
//!
//! # Polling query
//!
//! [`EventStore::get_unpublished`] returns records that are neither published
//! nor permanently failed, oldest `created_at` first. Records whose last attempt
//! failed (`is_failed = true`) are still returned: terminal failure is decided
//! by the processor from `retry_count`, and recorded with
//! [`EventStore::mark_permanently_failed`].
//!
//! # Implementations
//!
//! - `PostgresEventStore` (in `composable-outbox-postgres`): production
//! - `InMemoryEventStore` (in `composable-outbox-testing`): reference implementation and tests
//!
//! # Example
//!
//! ```no_run
//! use composable_outbox_core::event_store::{EventStore, EventStoreError};
//!
//! async fn drain<S: EventStore>(store: &S) -> Result<(), EventStoreError> {
//!     for event in store.get_unpublished(100).await? {
//!         // deliver...
//!         store.mark_published(event.id).await?;
//!     }
//!     Ok(())
//! }
//! ```

use crate::stored_event::{EventId, StoredEvent};
use chrono::{DateTime, Utc};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;

/// Boxed future returned by [`EventStore`] methods.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, EventStoreError>> + Send + 'a>>;

/// Errors that can occur during event store operations.
///
/// This is the storage error of the outbox: on the publish path it is returned
/// to the caller, on the processing path it is logged and the cycle retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventStoreError {
    /// Database query or connection error.
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// The store is temporarily unreachable.
    #[error("Event store unavailable: {0}")]
    Unavailable(String),

    /// No record with this id.
    #[error("Event not found: {0}")]
    EventNotFound(EventId),

    /// A record with this id already exists.
    #[error("Duplicate event id: {0}")]
    DuplicateEvent(EventId),

    /// Failed to convert a row to or from a [`StoredEvent`].
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl EventStoreError {
    /// Whether retrying the same call may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::DatabaseError(_) | Self::Unavailable(_))
    }
}

/// Persistence contract for outbox records.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`; the same store is shared by request
/// handlers (writes) and the background processor (polling and transitions).
///
/// # Dyn Compatibility
///
/// This trait returns `Pin<Box<dyn Future>>` instead of using `async fn` so it
/// can be used as `Arc<dyn EventStore>`.
pub trait EventStore: Send + Sync {
    /// Persist one event.
    ///
    /// # Errors
    ///
    /// - `DuplicateEvent`: an event with the same id already exists
    /// - `DatabaseError` / `Unavailable`: the write did not happen
    fn save_event(&self, event: StoredEvent) -> StoreFuture<'_, ()>;

    /// Persist a batch. Either every event is stored or none is.
    ///
    /// # Errors
    ///
    /// Same as [`EventStore::save_event`]; on error no event of the batch is stored.
    fn save_events(&self, events: Vec<StoredEvent>) -> StoreFuture<'_, ()>;

    /// Up to `batch_size` pending records (`!is_published && !permanently_failed`),
    /// ordered by `created_at` ascending.
    ///
    /// # Errors
    ///
    /// - `DatabaseError` / `Unavailable`: query failed
    fn get_unpublished(&self, batch_size: usize) -> StoreFuture<'_, Vec<StoredEvent>>;

    /// Like [`EventStore::get_unpublished`], but skips records leased by another
    /// owner and leases the returned records to `owner` for `lease`.
    ///
    /// The default implementation performs no leasing and simply returns
    /// [`EventStore::get_unpublished`]; backends that support an atomic
    /// conditional update override it.
    ///
    /// # Errors
    ///
    /// - `DatabaseError` / `Unavailable`: query failed
    fn claim_unpublished(
        &self,
        batch_size: usize,
        owner: &str,
        lease: Duration,
    ) -> StoreFuture<'_, Vec<StoredEvent>> {
        let _ = (owner, lease);
        self.get_unpublished(batch_size)
    }

    /// Mark an event as delivered. A no-op on an already published event.
    ///
    /// # Errors
    ///
    /// - `EventNotFound`: unknown id
    /// - `DatabaseError` / `Unavailable`: update failed
    fn mark_published(&self, id: EventId) -> StoreFuture<'_, ()>;

    /// Record a failed attempt: increments `retry_count`, sets `is_failed`,
    /// stores `error_message`, releases any lease. A no-op on a published event.
    ///
    /// # Errors
    ///
    /// - `EventNotFound`: unknown id
    /// - `DatabaseError` / `Unavailable`: update failed
    fn mark_failed(&self, id: EventId, error_message: String) -> StoreFuture<'_, ()>;

    /// Exclude an event from polling for good. Does not change `retry_count`.
    ///
    /// # Errors
    ///
    /// - `EventNotFound`: unknown id
    /// - `DatabaseError` / `Unavailable`: update failed
    fn mark_permanently_failed(&self, id: EventId, reason: String) -> StoreFuture<'_, ()>;

    /// All events of one aggregate, ordered by `occurred_at` ascending.
    ///
    /// # Errors
    ///
    /// - `DatabaseError` / `Unavailable`: query failed
    fn get_by_aggregate_id(&self, aggregate_id: &str) -> StoreFuture<'_, Vec<StoredEvent>>;

    /// Events with `start <= occurred_at < end`, ordered by `occurred_at` ascending.
    ///
    /// # Errors
    ///
    /// - `DatabaseError` / `Unavailable`: query failed
    fn get_by_time_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreFuture<'_, Vec<StoredEvent>>;

    /// Events of one type, ordered by `occurred_at` ascending.
    ///
    /// # Errors
    ///
    /// - `DatabaseError` / `Unavailable`: query failed
    fn get_by_type(&self, event_type: &str) -> StoreFuture<'_, Vec<StoredEvent>>;

    /// Up to `limit` permanently failed events, oldest `created_at` first.
    ///
    /// # Errors
    ///
    /// - `DatabaseError` / `Unavailable`: query failed
    fn get_permanently_failed(&self, limit: usize) -> StoreFuture<'_, Vec<StoredEvent>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_not_found_error_display() {
        let id = EventId::new();
        let error = EventStoreError::EventNotFound(id);
        let display = format!("{error}");
        assert!(display.contains(&id.to_string()));
    }

    #[test]
    fn unavailable_error_display() {
        let error = EventStoreError::Unavailable("connection refused".to_string());
        assert_eq!(
            format!("{error}"),
            "Event store unavailable: connection refused"
        );
    }
}
