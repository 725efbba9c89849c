//! Domain event trait and payload encoding.
//!
//! Business operations raise domain events; the outbox stores them as a
//! string payload plus a type tag. This module defines the trait a domain
//! event implements so it can be turned into a [`StoredEvent`](crate::stored_event::StoredEvent).
//!
//! # Encoding
//!
//! Payloads are JSON (`serde_json`). The type tag, not a runtime type lookup,
//! selects the decoder on the way back out: in-process handlers register a
//! decoder per `event_type` at startup.
//!
//! # Example
//!
//! ```
//! use composable_outbox_core::event::DomainEvent;
//! use serde::{Serialize, Deserialize};
//!
//! #[derive(Clone, Debug, Serialize, Deserialize)]
//! enum OrderEvent {
//!     OrderPlaced { order_id: String, total_cents: u64 },
//!     OrderShipped { order_id: String, tracking: String },
//! }
//!
//! impl DomainEvent for OrderEvent {
//!     fn event_type(&self) -> &'static str {
//!         match self {
//!             OrderEvent::OrderPlaced { .. } => "OrderPlaced.v1",
//!             OrderEvent::OrderShipped { .. } => "OrderShipped.v1",
//!         }
//!     }
//!
//!     fn aggregate_id(&self) -> Option<String> {
//!         match self {
//!             OrderEvent::OrderPlaced { order_id, .. }
//!             | OrderEvent::OrderShipped { order_id, .. } => Some(order_id.clone()),
//!         }
//!     }
//!
//!     fn aggregate_type(&self) -> Option<&'static str> {
//!         Some("order")
//!     }
//! }
//! ```

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

/// Error types for event encoding.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventError {
    /// Failed to serialize an event to its payload.
    #[error("Failed to serialize event: {0}")]
    Serialization(String),

    /// Failed to deserialize a payload into the requested type.
    #[error("Failed to deserialize event {event_type}: {reason}")]
    Deserialization {
        /// The type tag of the payload.
        event_type: String,
        /// Underlying decoder message.
        reason: String,
    },
}

/// A domain event that can be written to the outbox.
///
/// # Event Naming Convention
///
/// `event_type()` should return a stable identifier with a version suffix
/// (`"OrderPlaced.v1"`). It is persisted with the record and used to route
/// the event to handlers and transport destinations.
///
/// # Thread Safety
///
/// Events must be `Send + Sync + 'static` so they can cross task boundaries.
pub trait DomainEvent: Send + Sync + 'static {
    /// Stable schema tag for this event.
    fn event_type(&self) -> &'static str;

    /// Identifier of the entity that raised the event.
    fn aggregate_id(&self) -> Option<String> {
        None
    }

    /// Type of the entity that raised the event (e.g. `"order"`).
    ///
    /// Also used to derive the default transport topic (`order-events`).
    fn aggregate_type(&self) -> Option<&'static str> {
        None
    }

    /// Business timestamp. `None` means "now" at the time it is stored.
    fn occurred_at(&self) -> Option<DateTime<Utc>> {
        None
    }

    /// Encode this event as a JSON payload.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Serialization`] if encoding fails.
    fn to_payload(&self) -> Result<String, EventError>
    where
        Self: Serialize,
    {
        serde_json::to_string(self).map_err(|e| EventError::Serialization(e.to_string()))
    }
}
