//! In-memory [`EventStore`] for tests and local runs.
//!
//! Records are kept in insertion order behind an `RwLock`, so events with the
//! same `created_at` come back in the order they were saved. Two hooks make
//! failure scenarios easy to drive:
//!
//! - [`InMemoryEventStore::set_unavailable`]: every call fails with `Unavailable`
//! - [`InMemoryEventStore::fail_next_writes`]: the next `n` status writes fail transiently

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap on lock poisoning
#![allow(clippy::missing_panics_doc)]

use composable_outbox_core::environment::{Clock, SystemClock};
use composable_outbox_core::event_store::StoreFuture;
use composable_outbox_core::{DateTime, EventId, EventStore, EventStoreError, StoredEvent, Utc};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// `Vec`-backed event store.
///
/// Clones share the same records, so a test can keep a handle while the
/// processor owns another.
///
/// # Example
///
/// ```
/// use composable_outbox_testing::InMemoryEventStore;
/// use composable_outbox_core::{EventStore, StoredEvent};
/// use chrono::Utc;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = InMemoryEventStore::new();
/// let now = Utc::now();
/// store.save_event(StoredEvent::new("OrderPlaced.v1", "{}", now, now)).await?;
///
/// assert_eq!(store.get_unpublished(10).await?.len(), 1);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct InMemoryEventStore {
    events: Arc<RwLock<Vec<StoredEvent>>>,
    unavailable: Arc<AtomicBool>,
    failing_writes: Arc<AtomicUsize>,
    clock: Arc<dyn Clock>,
}

impl InMemoryEventStore {
    /// Empty store using the system clock for leases and `published_at`.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Empty store using `clock`.
    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            events: Arc::new(RwLock::new(Vec::new())),
            unavailable: Arc::new(AtomicBool::new(false)),
            failing_writes: Arc::new(AtomicUsize::new(0)),
            clock,
        }
    }

    /// Simulate an outage. While set, every call returns `Unavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Make the next `count` status writes (`mark_*`) fail with a transient error.
    pub fn fail_next_writes(&self, count: usize) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    /// Number of stored records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().unwrap().len()
    }

    /// Whether the store holds no record.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.read().unwrap().is_empty()
    }

    /// Snapshot of every record, in insertion order.
    #[must_use]
    pub fn all(&self) -> Vec<StoredEvent> {
        self.events.read().unwrap().clone()
    }

    /// Snapshot of one record.
    #[must_use]
    pub fn get(&self, id: EventId) -> Option<StoredEvent> {
        self.events
            .read()
            .unwrap()
            .iter()
            .find(|e| e.id == id)
            .cloned()
    }

    /// Remove every record.
    pub fn clear(&self) {
        self.events.write().unwrap().clear();
    }

    fn check_available(&self) -> Result<(), EventStoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(EventStoreError::Unavailable(
                "in-memory store marked unavailable".to_string(),
            ));
        }
        Ok(())
    }

    fn check_write(&self) -> Result<(), EventStoreError> {
        self.check_available()?;
        let injected = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(EventStoreError::DatabaseError(
                "injected write failure".to_string(),
            ));
        }
        Ok(())
    }

    fn update<F>(&self, id: EventId, apply: F) -> Result<(), EventStoreError>
    where
        F: FnOnce(&mut StoredEvent),
    {
        self.check_write()?;
        let mut events = self.events.write().unwrap();
        let event = events
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or(EventStoreError::EventNotFound(id))?;
        apply(event);
        Ok(())
    }

    fn query<P>(&self, predicate: P) -> Result<Vec<StoredEvent>, EventStoreError>
    where
        P: Fn(&StoredEvent) -> bool,
    {
        self.check_available()?;
        let mut matching: Vec<StoredEvent> = self
            .events
            .read()
            .unwrap()
            .iter()
            .filter(|e| predicate(e))
            .cloned()
            .collect();
        matching.sort_by_key(|e| e.occurred_at);
        Ok(matching)
    }

    fn pending(events: &[StoredEvent]) -> Vec<usize> {
        let mut indices: Vec<usize> = events
            .iter()
            .enumerate()
            .filter(|(_, e)| e.is_pending())
            .map(|(i, _)| i)
            .collect();
        indices.sort_by_key(|&i| events[i].created_at);
        indices
    }
}

impl Default for InMemoryEventStore {
    fn default() -> Self {
        Self::new()
    }
}

impl EventStore for InMemoryEventStore {
    fn save_event(&self, event: StoredEvent) -> StoreFuture<'_, ()> {
        Box::pin(async move { self.save_events(vec![event]).await })
    }

    fn save_events(&self, batch: Vec<StoredEvent>) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            self.check_available()?;
            let mut events = self.events.write().unwrap();

            for (i, event) in batch.iter().enumerate() {
                let duplicate = events.iter().any(|e| e.id == event.id)
                    || batch[..i].iter().any(|e| e.id == event.id);
                if duplicate {
                    return Err(EventStoreError::DuplicateEvent(event.id));
                }
            }

            events.extend(batch);
            Ok(())
        })
    }

    fn get_unpublished(&self, batch_size: usize) -> StoreFuture<'_, Vec<StoredEvent>> {
        Box::pin(async move {
            self.check_available()?;
            let events = self.events.read().unwrap();
            Ok(Self::pending(&events)
                .into_iter()
                .take(batch_size)
                .map(|i| events[i].clone())
                .collect())
        })
    }

    fn claim_unpublished(
        &self,
        batch_size: usize,
        owner: &str,
        lease: Duration,
    ) -> StoreFuture<'_, Vec<StoredEvent>> {
        let owner = owner.to_string();
        Box::pin(async move {
            self.check_available()?;
            let now = self.clock.now();
            let until = chrono::Duration::from_std(lease)
                .ok()
                .and_then(|lease| now.checked_add_signed(lease))
                .unwrap_or(DateTime::<Utc>::MAX_UTC);

            let mut events = self.events.write().unwrap();
            let claimable: Vec<usize> = Self::pending(&events)
                .into_iter()
                .filter(|&i| !events[i].is_claimed_by_other(&owner, now))
                .take(batch_size)
                .collect();

            Ok(claimable
                .into_iter()
                .map(|i| {
                    let event = &mut events[i];
                    event.claimed_by = Some(owner.clone());
                    event.claimed_until = Some(until);
                    event.clone()
                })
                .collect())
        })
    }

    fn mark_published(&self, id: EventId) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let now = self.clock.now();
            self.update(id, |event| {
                if event.is_published || event.permanently_failed {
                    return;
                }
                event.is_published = true;
                event.published_at = Some(now);
                event.is_failed = false;
                event.claimed_by = None;
                event.claimed_until = None;
            })
        })
    }

    fn mark_failed(&self, id: EventId, error_message: String) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            self.update(id, |event| {
                if event.is_published || event.permanently_failed {
                    return;
                }
                event.retry_count += 1;
                event.is_failed = true;
                event.error_message = Some(error_message);
                event.claimed_by = None;
                event.claimed_until = None;
            })
        })
    }

    fn mark_permanently_failed(&self, id: EventId, reason: String) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            self.update(id, |event| {
                if event.is_published {
                    return;
                }
                event.permanently_failed = true;
                event.is_failed = true;
                event.error_message = Some(reason);
                event.claimed_by = None;
                event.claimed_until = None;
            })
        })
    }

    fn get_by_aggregate_id(&self, aggregate_id: &str) -> StoreFuture<'_, Vec<StoredEvent>> {
        let aggregate_id = aggregate_id.to_string();
        Box::pin(async move {
            self.query(|e| e.aggregate_id.as_deref() == Some(aggregate_id.as_str()))
        })
    }

    fn get_by_time_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreFuture<'_, Vec<StoredEvent>> {
        Box::pin(async move { self.query(|e| e.occurred_at >= start && e.occurred_at < end) })
    }

    fn get_by_type(&self, event_type: &str) -> StoreFuture<'_, Vec<StoredEvent>> {
        let event_type = event_type.to_string();
        Box::pin(async move { self.query(|e| e.event_type == event_type) })
    }

    fn get_permanently_failed(&self, limit: usize) -> StoreFuture<'_, Vec<StoredEvent>> {
        Box::pin(async move {
            self.check_available()?;
            let mut failed: Vec<StoredEvent> = self
                .events
                .read()
                .unwrap()
                .iter()
                .filter(|e| e.permanently_failed)
                .cloned()
                .collect();
            failed.sort_by_key(|e| e.created_at);
            failed.truncate(limit);
            Ok(failed)
        })
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use crate::mocks::ManualClock;

    fn event_at(event_type: &str, created_at: DateTime<Utc>) -> StoredEvent {
        StoredEvent::new(event_type, "{}", created_at, created_at)
    }

    #[tokio::test]
    async fn unpublished_is_oldest_first() {
        let store = InMemoryEventStore::new();
        let now = Utc::now();
        let late = event_at("Late", now);
        let early = event_at("Early", now - chrono::Duration::seconds(5));
        store.save_event(late.clone()).await.unwrap();
        store.save_event(early.clone()).await.unwrap();

        let pending = store.get_unpublished(10).await.unwrap();
        assert_eq!(pending[0].id, early.id);
        assert_eq!(pending[1].id, late.id);
    }

    #[tokio::test]
    async fn failed_events_stay_pending_until_permanently_failed() {
        let store = InMemoryEventStore::new();
        let now = Utc::now();
        let event = event_at("E", now);
        store.save_event(event.clone()).await.unwrap();

        store.mark_failed(event.id, "boom".to_string()).await.unwrap();
        let pending = store.get_unpublished(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].retry_count, 1);
        assert!(pending[0].is_failed);

        store
            .mark_permanently_failed(event.id, "exhausted".to_string())
            .await
            .unwrap();
        assert!(store.get_unpublished(10).await.unwrap().is_empty());
        let failed = store.get_permanently_failed(10).await.unwrap();
        assert_eq!(failed[0].retry_count, 1);
    }

    #[tokio::test]
    async fn mark_published_is_idempotent() {
        let store = InMemoryEventStore::new();
        let now = Utc::now();
        let event = event_at("E", now);
        store.save_event(event.clone()).await.unwrap();

        store.mark_published(event.id).await.unwrap();
        let first = store.get(event.id).expect("stored").published_at;
        store.mark_published(event.id).await.unwrap();

        assert_eq!(store.get(event.id).expect("stored").published_at, first);
    }

    #[tokio::test]
    async fn permanently_failed_is_never_published() {
        let store = InMemoryEventStore::new();
        let event = event_at("E", Utc::now());
        store.save_event(event.clone()).await.unwrap();

        store.mark_permanently_failed(event.id, "cap".into()).await.unwrap();
        store.mark_published(event.id).await.unwrap();
        store.mark_failed(event.id, "late".into()).await.unwrap();

        let saved = store.get(event.id).expect("stored");
        assert!(!saved.is_published);
        assert!(saved.permanently_failed);
        assert_eq!(saved.retry_count, 0);
        assert_eq!(saved.error_message.as_deref(), Some("cap"));
    }

    #[tokio::test]
    async fn unknown_id_is_not_found() {
        let store = InMemoryEventStore::new();
        let id = EventId::new();
        assert_eq!(
            store.mark_published(id).await,
            Err(EventStoreError::EventNotFound(id))
        );
    }

    #[tokio::test]
    async fn batch_with_duplicate_is_rejected_atomically() {
        let store = InMemoryEventStore::new();
        let now = Utc::now();
        let a = event_at("A", now);
        let b = event_at("B", now);
        store.save_event(a.clone()).await.unwrap();

        let result = store.save_events(vec![b, a.clone()]).await;
        assert_eq!(result, Err(EventStoreError::DuplicateEvent(a.id)));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn claims_skip_rows_leased_by_others_until_expiry() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = InMemoryEventStore::with_clock(clock.clone());
        let now = clock.now();
        store.save_event(event_at("E", now)).await.unwrap();

        let first = store
            .claim_unpublished(10, "a", Duration::from_secs(60))
            .await
            .unwrap();
        let second = store
            .claim_unpublished(10, "b", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(first.len(), 1);
        assert!(second.is_empty());

        clock.advance(Duration::from_secs(61));
        let reclaimed = store
            .claim_unpublished(10, "b", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].claimed_by.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn unbounded_lease_saturates_instead_of_overflowing() {
        let store = InMemoryEventStore::new();
        store.save_event(event_at("E", Utc::now())).await.unwrap();

        let claimed = store
            .claim_unpublished(10, "a", Duration::MAX)
            .await
            .unwrap();
        assert_eq!(claimed[0].claimed_until, Some(DateTime::<Utc>::MAX_UTC));

        let other = store
            .claim_unpublished(10, "b", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(other.is_empty());
    }

    #[tokio::test]
    async fn time_range_is_half_open() {
        let store = InMemoryEventStore::new();
        let start = Utc::now();
        let end = start + chrono::Duration::seconds(10);
        let at_start = event_at("Start", start);
        let at_end = event_at("End", end);
        store.save_events(vec![at_start.clone(), at_end]).await.unwrap();

        let found = store.get_by_time_range(start, end).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, at_start.id);
    }

    #[tokio::test]
    async fn outage_fails_every_call() {
        let store = InMemoryEventStore::new();
        store.set_unavailable(true);
        assert!(matches!(
            store.get_unpublished(1).await,
            Err(EventStoreError::Unavailable(_))
        ));
        store.set_unavailable(false);
        assert!(store.get_unpublished(1).await.is_ok());
    }

    #[tokio::test]
    async fn injected_write_failures_are_transient() {
        let store = InMemoryEventStore::new();
        let now = Utc::now();
        let event = event_at("E", now);
        store.save_event(event.clone()).await.unwrap();

        store.fail_next_writes(1);
        let err = store.mark_published(event.id).await.unwrap_err();
        assert!(err.is_transient());
        assert!(store.mark_published(event.id).await.is_ok());
    }
}
