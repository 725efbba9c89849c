//! # Composable Outbox Core
//!
//! Core traits and types for the Composable Outbox event delivery engine.
//!
//! This crate defines the record model and the three capability contracts the
//! engine is built on. It contains no I/O of its own.
//!
//! ## Core Concepts
//!
//! - **[`StoredEvent`](stored_event::StoredEvent)**: the durable outbox record
//! - **[`EventStore`](event_store::EventStore)**: pluggable persistence contract
//! - **[`EventPublisher`](publisher::EventPublisher)**: in-process, in-request dispatch
//! - **[`MessageTransport`](transport::MessageTransport)**: distributed publish/send/schedule
//! - **[`Clock`](environment::Clock)**: injected time source
//!
//! ## Delivery Guarantees
//!
//! - At-least-once: an event may be delivered more than once
//! - Idempotency: consumers deduplicate on the event id
//! - FIFO within a batch, approximate across batches

// Re-export commonly used types
pub use chrono::{DateTime, Utc};

/// Domain event trait and payload encoding
pub mod event;

/// Durable outbox record
pub mod stored_event;

/// Storage contract
pub mod event_store;

/// In-process dispatch contract
pub mod publisher;

/// Distributed transport contract
pub mod transport;

/// Error taxonomy
pub mod error;

/// Environment module - injected dependencies
///
/// Time is the only ambient dependency of the engine; everything else
/// (store, transport, publisher) is passed explicitly.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// # Examples
    ///
    /// ```
    /// use composable_outbox_core::environment::{Clock, SystemClock};
    ///
    /// let clock = SystemClock;
    /// let _now = clock.now();
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Production clock backed by the system time.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}

pub use error::{ConfigurationError, DeliveryError, OutboxError, TerminalFailureError};
pub use event::{DomainEvent, EventError};
pub use event_store::{EventStore, EventStoreError};
pub use publisher::{BatchReport, EventPublisher, PublishError};
pub use stored_event::{EventId, StoredEvent};
pub use transport::{MessageTransport, TransportError, TransportMessage};
