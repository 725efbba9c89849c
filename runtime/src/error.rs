//! Runtime error types.

use composable_outbox_core::{ConfigurationError, DeliveryError, EventError, EventStoreError};
use thiserror::Error;

/// Error returned to [`EventBus`](crate::bus::EventBus) callers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    /// The event could not be persisted. Nothing was written.
    #[error(transparent)]
    Storage(#[from] EventStoreError),

    /// The immediate path failed. In Hybrid mode the event was still persisted.
    #[error(transparent)]
    Delivery(#[from] DeliveryError),

    /// The bus lacks a component needed for this call.
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    /// The domain event could not be encoded.
    #[error(transparent)]
    Event(#[from] EventError),
}

/// Lifecycle errors of the [`OutboxProcessor`](crate::processor::OutboxProcessor).
#[derive(Error, Debug)]
pub enum ProcessorError {
    /// `start` was called while the loop is running.
    #[error("Outbox processor is already running")]
    AlreadyRunning,

    /// `stop` was called on a processor that was not started.
    #[error("Outbox processor is not running")]
    NotRunning,

    /// The background task panicked or was cancelled.
    #[error("Outbox processor task failed: {0}")]
    TaskFailed(#[from] tokio::task::JoinError),
}
