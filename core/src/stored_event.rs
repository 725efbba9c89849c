//! The durable outbox record.
//!
//! A [`StoredEvent`] is the unit of durable state in the outbox: one domain event
//! awaiting delivery, or having completed (or exhausted) delivery.
//!
//! # Lifecycle
//!
//! ```text
//!   save_event            mark_published
//! ─────────────► pending ─────────────────► published
//!                  │  ▲
//!     mark_failed  │  │ next cycle
//!                  ▼  │
//!            attempt failed ──────────────► permanently failed
//!                       retry_count >= max
//! ```
//!
//! Records are created by the publishing operation and mutated only by the
//! outbox processor. The core never deletes them; retention is a housekeeping
//! concern outside this crate.

use crate::environment::Clock;
use crate::event::{DomainEvent, EventError};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Globally unique identifier of a stored event.
///
/// Assigned once at creation and never reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(Uuid);

impl EventId {
    /// Generate a fresh random identifier.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID (used by storage backends when loading rows).
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// The underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// One event in the outbox.
///
/// # Flags
///
/// - `is_failed` reports that the *last attempt* failed. It does not make the
///   record terminal: a record with `is_failed = true` is still fetched by the
///   processor until its `retry_count` reaches the configured cap.
/// - `permanently_failed` is the terminal flag. It is only set once the retry
///   cap is exceeded, and excludes the record from polling for good.
///
/// `is_published` and `permanently_failed` are never both true.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    /// Unique identifier.
    pub id: EventId,

    /// Logical schema tag (e.g. `"OrderPlaced.v1"`), used as the registry key for decoding.
    pub event_type: String,

    /// Serialized event body (JSON). Opaque to the store.
    pub payload: String,

    /// Identifier of the originating entity, if any.
    pub aggregate_id: Option<String>,

    /// Type of the originating entity, if any (e.g. `"order"`).
    pub aggregate_type: Option<String>,

    /// Optional metadata (`correlation_id`, `causation_id`, `user_id`, ...).
    pub metadata: Option<serde_json::Value>,

    /// When the domain event happened.
    pub occurred_at: DateTime<Utc>,

    /// When the record was persisted. Drives FIFO delivery order.
    pub created_at: DateTime<Utc>,

    /// Delivery completed successfully.
    pub is_published: bool,

    /// Set exactly once, when `is_published` becomes true.
    pub published_at: Option<DateTime<Utc>>,

    /// Number of failed delivery attempts.
    pub retry_count: u32,

    /// The most recent delivery attempt failed.
    pub is_failed: bool,

    /// Retry budget exhausted; never polled again.
    pub permanently_failed: bool,

    /// Last failure reason, for diagnostics.
    pub error_message: Option<String>,

    /// Processor currently holding a lease on this record.
    pub claimed_by: Option<String>,

    /// Lease expiry. After this instant another processor may claim the record.
    pub claimed_until: Option<DateTime<Utc>>,
}

impl StoredEvent {
    /// Create a pending record with a fresh id.
    #[must_use]
    pub fn new(
        event_type: impl Into<String>,
        payload: impl Into<String>,
        occurred_at: DateTime<Utc>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: EventId::new(),
            event_type: event_type.into(),
            payload: payload.into(),
            aggregate_id: None,
            aggregate_type: None,
            metadata: None,
            occurred_at,
            created_at,
            is_published: false,
            published_at: None,
            retry_count: 0,
            is_failed: false,
            permanently_failed: false,
            error_message: None,
            claimed_by: None,
            claimed_until: None,
        }
    }

    /// Build a record from a typed domain event.
    ///
    /// The payload is the JSON encoding of `event`. `occurred_at` falls back to
    /// the clock when the event does not carry its own timestamp; `created_at`
    /// always comes from the clock.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Serialization`] if the event cannot be encoded.
    ///
    /// # Examples
    ///
    /// ```
    /// use composable_outbox_core::event::DomainEvent;
    /// use composable_outbox_core::environment::SystemClock;
    /// use composable_outbox_core::stored_event::StoredEvent;
    /// use serde::{Deserialize, Serialize};
    ///
    /// #[derive(Serialize, Deserialize)]
    /// struct OrderPlaced { order_id: String }
    ///
    /// impl DomainEvent for OrderPlaced {
    ///     fn event_type(&self) -> &'static str { "OrderPlaced.v1" }
    ///     fn aggregate_id(&self) -> Option<String> { Some(self.order_id.clone()) }
    ///     fn aggregate_type(&self) -> Option<&'static str> { Some("order") }
    /// }
    ///
    /// let event = OrderPlaced { order_id: "order-1".into() };
    /// let stored = StoredEvent::from_event(&event, &SystemClock).unwrap();
    /// assert_eq!(stored.event_type, "OrderPlaced.v1");
    /// assert_eq!(stored.aggregate_id.as_deref(), Some("order-1"));
    /// ```
    pub fn from_event<E>(event: &E, clock: &dyn Clock) -> Result<Self, EventError>
    where
        E: DomainEvent + Serialize,
    {
        let now = clock.now();
        let payload = event.to_payload()?;

        let mut stored = Self::new(
            event.event_type(),
            payload,
            event.occurred_at().unwrap_or(now),
            now,
        );
        stored.aggregate_id = event.aggregate_id();
        stored.aggregate_type = event.aggregate_type().map(str::to_string);
        Ok(stored)
    }

    /// Attach aggregate correlation.
    #[must_use]
    pub fn with_aggregate(
        mut self,
        aggregate_type: impl Into<String>,
        aggregate_id: impl Into<String>,
    ) -> Self {
        self.aggregate_type = Some(aggregate_type.into());
        self.aggregate_id = Some(aggregate_id.into());
        self
    }

    /// Attach metadata.
    #[must_use]
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Decode the payload into a typed event.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Deserialization`] if the payload does not match `E`.
    pub fn decode<E: DeserializeOwned>(&self) -> Result<E, EventError> {
        serde_json::from_str(&self.payload).map_err(|e| EventError::Deserialization {
            event_type: self.event_type.clone(),
            reason: e.to_string(),
        })
    }

    /// Whether the processor should still pick this record up.
    #[must_use]
    pub const fn is_pending(&self) -> bool {
        !self.is_published && !self.permanently_failed
    }

    /// Whether this record has used up `max_retry_attempts` failed attempts.
    #[must_use]
    pub const fn is_terminally_failed(&self, max_retry_attempts: u32) -> bool {
        self.permanently_failed || self.retry_count >= max_retry_attempts
    }

    /// Whether another owner holds an unexpired lease at `now`.
    #[must_use]
    pub fn is_claimed_by_other(&self, owner: &str, now: DateTime<Utc>) -> bool {
        match (&self.claimed_by, self.claimed_until) {
            (Some(holder), Some(until)) => holder != owner && until > now,
            _ => false,
        }
    }
}

impl fmt::Display for StoredEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "StoredEvent {{ id: {}, type: {}, retries: {} }}",
            self.id, self.event_type, self.retry_count
        )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn sample() -> StoredEvent {
        let now = Utc::now();
        StoredEvent::new("OrderPlaced.v1", r#"{"order_id":"o-1"}"#, now, now)
    }

    #[test]
    fn new_event_is_pending() {
        let event = sample();
        assert!(event.is_pending());
        assert!(!event.is_failed);
        assert_eq!(event.retry_count, 0);
        assert!(event.published_at.is_none());
    }

    #[test]
    fn ids_are_unique() {
        assert_ne!(sample().id, sample().id);
    }

    #[test]
    fn terminal_failure_is_driven_by_retry_count() {
        let mut event = sample();
        event.is_failed = true;
        event.retry_count = 1;
        assert!(!event.is_terminally_failed(2));
        assert!(event.is_pending());

        event.retry_count = 2;
        assert!(event.is_terminally_failed(2));
    }

    #[test]
    fn permanently_failed_is_not_pending() {
        let mut event = sample();
        event.permanently_failed = true;
        assert!(!event.is_pending());
        assert!(event.is_terminally_failed(100));
    }

    #[test]
    fn lease_held_by_other_owner_until_expiry() {
        let now = Utc::now();
        let mut event = sample();
        event.claimed_by = Some("processor-a".to_string());
        event.claimed_until = Some(now + Duration::seconds(30));

        assert!(event.is_claimed_by_other("processor-b", now));
        assert!(!event.is_claimed_by_other("processor-a", now));
        assert!(!event.is_claimed_by_other("processor-b", now + Duration::seconds(31)));
    }

    #[test]
    fn decode_reports_event_type_on_mismatch() {
        #[derive(Debug, Deserialize)]
        struct Other {
            #[allow(dead_code)]
            amount: u64,
        }

        let err = sample().decode::<Other>().unwrap_err();
        assert!(err.to_string().contains("OrderPlaced.v1"));
    }

    #[test]
    fn display_includes_type() {
        let display = format!("{}", sample());
        assert!(display.contains("OrderPlaced.v1"));
    }
}
