//! Error taxonomy of the outbox.
//!
//! | Error | Raised when | Surfaces to |
//! |-------|-------------|-------------|
//! | [`EventStoreError`] | store unreachable, constraint violation | publish caller; logged + retried by the processor |
//! | [`DeliveryError`] | a delivery attempt failed or timed out | recorded on the event (`error_message`, `retry_count`) |
//! | [`ConfigurationError`] | durable mode without a store, invalid values | fatal at build time |
//! | [`TerminalFailureError`] | retry cap exceeded | recorded on the event, visible via diagnostic queries |

use crate::event::EventError;
use crate::event_store::EventStoreError;
use crate::publisher::PublishError;
use crate::stored_event::EventId;
use crate::transport::TransportError;
use std::time::Duration;
use thiserror::Error;

/// One delivery attempt failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    /// The transport rejected the message.
    #[error("Transport delivery failed: {0}")]
    Transport(#[from] TransportError),

    /// An in-process handler failed.
    #[error("In-process delivery failed: {0}")]
    Handler(PublishError),

    /// The payload could not be decoded for a typed in-process handler.
    #[error("Payload decoding failed: {0}")]
    Decode(EventError),

    /// The attempt did not finish within the timeout.
    #[error("Delivery timed out after {0:?}")]
    Timeout(Duration),

    /// No delivery target is configured for this event.
    #[error("No delivery target configured for {0}")]
    NoTarget(String),
}

impl From<PublishError> for DeliveryError {
    fn from(error: PublishError) -> Self {
        match error {
            PublishError::Decode(decode) => Self::Decode(decode),
            other => Self::Handler(other),
        }
    }
}

/// Invalid or incomplete configuration. Detected at startup, never at publish time.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    /// A durable delivery mode was selected without an event store.
    #[error("Delivery mode {mode} requires an event store")]
    MissingStore {
        /// The selected mode.
        mode: String,
    },

    /// An immediate delivery mode was selected without an in-process publisher.
    #[error("Delivery mode {mode} requires an event publisher")]
    MissingPublisher {
        /// The selected mode.
        mode: String,
    },

    /// A configuration value is out of range or unparseable.
    #[error("Invalid configuration value for {key}: {reason}")]
    InvalidValue {
        /// The configuration key.
        key: String,
        /// Why the value was rejected.
        reason: String,
    },
}

/// An event exhausted its retry budget.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error(
    "Event {event_id} permanently failed after {retry_count} attempts (max {max_retry_attempts})"
)]
pub struct TerminalFailureError {
    /// The failed event.
    pub event_id: EventId,
    /// Failed attempts recorded.
    pub retry_count: u32,
    /// The configured cap.
    pub max_retry_attempts: u32,
}

/// Any outbox error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OutboxError {
    /// Storage failure.
    #[error(transparent)]
    Storage(#[from] EventStoreError),

    /// Delivery failure.
    #[error(transparent)]
    Delivery(#[from] DeliveryError),

    /// Configuration failure.
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    /// Retry budget exhausted.
    #[error(transparent)]
    TerminalFailure(#[from] TerminalFailureError),

    /// Event encoding failure.
    #[error(transparent)]
    Event(#[from] EventError),
}
