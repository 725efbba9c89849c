//! Message transport abstraction for distributed delivery.
//!
//! The outbox processor forwards stored events to a topic or queue through a
//! [`MessageTransport`]. The trait is broker-agnostic: it needs exactly three
//! operations, and the message is a string payload plus a type tag.
//!
//! # Topic Naming Convention
//!
//! When no explicit route exists, the processor sends to `{aggregate-type}-events`:
//! - `order-events` - All events from Order aggregates
//! - `payment-events` - All events from Payment aggregates
//!
//! Events without an aggregate type go through [`MessageTransport::publish`],
//! i.e. to the transport's own default destination.
//!
//! # Implementations
//!
//! - `RedpandaTransport` (in `composable-outbox-redpanda`): Kafka-compatible
//! - `InMemoryTransport` (in `composable-outbox-testing`): records messages for tests

use crate::stored_event::{EventId, StoredEvent};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Boxed future returned by [`MessageTransport`] methods.
pub type TransportFuture<'a> = Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + 'a>>;

/// Errors that can occur while handing a message to the transport.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Failed to connect to the broker.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The broker rejected or did not acknowledge the message.
    #[error("Publish failed for destination '{destination}': {reason}")]
    PublishFailed {
        /// The destination that failed
        destination: String,
        /// The reason for failure
        reason: String,
    },

    /// Destination not found or invalid.
    #[error("Invalid destination: {0}")]
    InvalidDestination(String),

    /// Failed to encode the message.
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    /// The transport does not support scheduling at the requested time.
    #[error("Scheduling failed: {0}")]
    SchedulingFailed(String),
}

/// The message handed to a transport.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TransportMessage {
    /// Id of the originating outbox record. Consumers deduplicate on it.
    pub message_id: EventId,
    /// Type tag.
    pub event_type: String,
    /// JSON payload.
    pub payload: String,
    /// Aggregate id, used as the partition key when present.
    pub aggregate_id: Option<String>,
    /// Aggregate type.
    pub aggregate_type: Option<String>,
    /// Optional metadata.
    pub metadata: Option<serde_json::Value>,
    /// Business timestamp.
    pub occurred_at: DateTime<Utc>,
}

impl TransportMessage {
    /// Partition key: the aggregate id when present, otherwise the event type.
    #[must_use]
    pub fn partition_key(&self) -> &str {
        self.aggregate_id.as_deref().unwrap_or(&self.event_type)
    }
}

impl From<&StoredEvent> for TransportMessage {
    fn from(event: &StoredEvent) -> Self {
        Self {
            message_id: event.id,
            event_type: event.event_type.clone(),
            payload: event.payload.clone(),
            aggregate_id: event.aggregate_id.clone(),
            aggregate_type: event.aggregate_type.clone(),
            metadata: event.metadata.clone(),
            occurred_at: event.occurred_at,
        }
    }
}

/// Distributed delivery contract.
///
/// Delivery is at-least-once: the outbox may hand the same message over more
/// than once, so consumers must deduplicate on `message_id`.
pub trait MessageTransport: Send + Sync {
    /// Publish to the transport's default destination.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::PublishFailed`] if the message was not accepted.
    fn publish(&self, message: TransportMessage) -> TransportFuture<'_>;

    /// Send to a named destination (topic or queue).
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::PublishFailed`] or
    /// [`TransportError::InvalidDestination`] if the message was not accepted.
    fn send(&self, destination: &str, message: TransportMessage) -> TransportFuture<'_>;

    /// Publish to the default destination at or after `when`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::SchedulingFailed`] if the transport cannot
    /// accept the schedule.
    fn schedule_publish(&self, message: TransportMessage, when: DateTime<Utc>)
    -> TransportFuture<'_>;
}
