//! Event bus façade.
//!
//! [`EventBus`] is what application code calls after a business operation.
//! Depending on [`DeliveryMode`] it hands the event to in-process handlers,
//! writes it to the outbox, or both:
//!
//! ```text
//!                 ┌───────────────────── publish(event) ─────────────────────┐
//!                 │                                                          │
//!   InMemory:     └─► EventPublisher                                         │
//!   Persistent:   └─────────────────────────► EventStore ──► OutboxProcessor ┘
//!   Hybrid:       └─► EventPublisher ───────► EventStore ──► OutboxProcessor
//! ```
//!
//! In Hybrid mode the immediate path always runs first and the event is
//! persisted even when it fails, so the processor can recover delivery.
//! Components are checked when the bus is built, never at publish time.

use crate::config::{DeliveryMode, OutboxConfig};
use crate::error::BusError;
use crate::metrics::EventBusMetrics;
use crate::processor::{DeliveryTargets, OutboxProcessor};
use composable_outbox_core::environment::{Clock, SystemClock};
use composable_outbox_core::{
    BatchReport, ConfigurationError, DateTime, DeliveryError, DomainEvent, EventPublisher,
    EventStore, MessageTransport, StoredEvent, Utc,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// Builder for [`EventBus`].
#[derive(Default)]
pub struct EventBusBuilder {
    mode: DeliveryMode,
    store: Option<Arc<dyn EventStore>>,
    publisher: Option<Arc<dyn EventPublisher>>,
    transport: Option<Arc<dyn MessageTransport>>,
    clock: Option<Arc<dyn Clock>>,
    immediate_timeout: Option<Duration>,
}

impl EventBusBuilder {
    /// Delivery mode. Defaults to Hybrid.
    #[must_use]
    pub const fn mode(mut self, mode: DeliveryMode) -> Self {
        self.mode = mode;
        self
    }

    /// Outbox store. Required for Persistent and Hybrid.
    #[must_use]
    pub fn store(mut self, store: Arc<dyn EventStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// In-process publisher. Required for InMemory and Hybrid.
    #[must_use]
    pub fn publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Transport used by processors created with [`EventBus::processor`].
    #[must_use]
    pub fn transport(mut self, transport: Arc<dyn MessageTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Clock for `created_at` timestamps. Defaults to [`SystemClock`].
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Bound on the immediate path. A timeout is reported as a delivery failure.
    #[must_use]
    pub const fn immediate_timeout(mut self, timeout: Duration) -> Self {
        self.immediate_timeout = Some(timeout);
        self
    }

    /// Validate and build.
    ///
    /// # Errors
    ///
    /// - [`ConfigurationError::MissingStore`]: Persistent or Hybrid without a store
    /// - [`ConfigurationError::MissingPublisher`]: InMemory or Hybrid without a publisher
    pub fn build(self) -> Result<EventBus, ConfigurationError> {
        if self.mode.persists() && self.store.is_none() {
            return Err(ConfigurationError::MissingStore {
                mode: self.mode.to_string(),
            });
        }
        if self.mode.delivers_immediately() && self.publisher.is_none() {
            return Err(ConfigurationError::MissingPublisher {
                mode: self.mode.to_string(),
            });
        }

        tracing::info!(mode = %self.mode, "Event bus configured");

        Ok(EventBus {
            mode: self.mode,
            store: self.store,
            publisher: self.publisher,
            transport: self.transport,
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            immediate_timeout: self.immediate_timeout,
        })
    }
}

/// Publishes domain events according to the configured [`DeliveryMode`].
///
/// # Example
///
/// ```no_run
/// use composable_outbox_runtime::bus::EventBus;
/// use composable_outbox_runtime::config::DeliveryMode;
/// use composable_outbox_runtime::dispatcher::InProcessPublisher;
/// # use std::sync::Arc;
/// # async fn example(store: Arc<dyn composable_outbox_core::EventStore>) -> Result<(), Box<dyn std::error::Error>> {
/// let bus = EventBus::builder()
///     .mode(DeliveryMode::Hybrid)
///     .store(store)
///     .publisher(Arc::new(InProcessPublisher::new()))
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct EventBus {
    mode: DeliveryMode,
    store: Option<Arc<dyn EventStore>>,
    publisher: Option<Arc<dyn EventPublisher>>,
    transport: Option<Arc<dyn MessageTransport>>,
    clock: Arc<dyn Clock>,
    immediate_timeout: Option<Duration>,
}

impl EventBus {
    /// Start building a bus.
    #[must_use]
    pub fn builder() -> EventBusBuilder {
        EventBusBuilder::default()
    }

    /// The configured mode.
    #[must_use]
    pub const fn mode(&self) -> DeliveryMode {
        self.mode
    }

    /// The outbox store, if any.
    #[must_use]
    pub fn store(&self) -> Option<&Arc<dyn EventStore>> {
        self.store.as_ref()
    }

    /// Wrap a domain event and publish it.
    ///
    /// # Errors
    ///
    /// - [`BusError::Event`]: the event could not be serialized
    /// - otherwise as [`EventBus::publish_stored`]
    pub async fn publish<E>(&self, event: &E) -> Result<StoredEvent, BusError>
    where
        E: DomainEvent + Serialize,
    {
        let stored = StoredEvent::from_event(event, self.clock.as_ref())?;
        self.publish_stored(stored).await
    }

    /// Publish an already wrapped event.
    ///
    /// Returns the record as handed to the store.
    ///
    /// # Errors
    ///
    /// - [`BusError::Storage`]: persisting failed (Persistent, Hybrid)
    /// - [`BusError::Delivery`]: the immediate path failed (InMemory, Hybrid).
    ///   In Hybrid mode the event has been persisted regardless.
    pub async fn publish_stored(&self, event: StoredEvent) -> Result<StoredEvent, BusError> {
        EventBusMetrics::record_publish(self.mode.as_str());

        let immediate_error = if self.mode.delivers_immediately() {
            self.deliver_immediately(&event).await.err()
        } else {
            None
        };

        if self.mode.persists() {
            self.require_store()?.save_event(event.clone()).await?;
            EventBusMetrics::record_saved(1);
            tracing::debug!(
                event_id = %event.id,
                event_type = %event.event_type,
                mode = %self.mode,
                "Event persisted to outbox"
            );
        }

        match immediate_error {
            Some(e) => Err(BusError::Delivery(e)),
            None => Ok(event),
        }
    }

    /// Wrap and publish several domain events in order.
    ///
    /// # Errors
    ///
    /// As [`EventBus::publish_batch`], plus [`BusError::Event`] if any event
    /// fails to serialize (nothing is published in that case).
    pub async fn publish_all<E>(&self, events: &[E]) -> Result<BatchReport, BusError>
    where
        E: DomainEvent + Serialize,
    {
        let stored = events
            .iter()
            .map(|event| StoredEvent::from_event(event, self.clock.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        self.publish_batch(stored).await
    }

    /// Publish events in order with the mode's semantics applied to each.
    ///
    /// A failure on one event does not stop the remaining ones; the report
    /// lists each event's outcome. In Persistent mode the whole batch is
    /// written atomically.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Storage`] only in Persistent mode, when the atomic
    /// batch write fails.
    pub async fn publish_batch(&self, events: Vec<StoredEvent>) -> Result<BatchReport, BusError> {
        let mut report = BatchReport::default();

        if self.mode == DeliveryMode::Persistent {
            let ids: Vec<_> = events.iter().map(|e| e.id).collect();
            let count = events.len();
            self.require_store()?.save_events(events).await?;
            EventBusMetrics::record_saved(count);
            for id in ids {
                EventBusMetrics::record_publish(self.mode.as_str());
                report.record_success(id);
            }
            return Ok(report);
        }

        for event in events {
            let id = event.id;
            match self.publish_stored(event).await {
                Ok(_) => report.record_success(id),
                Err(e) => {
                    tracing::warn!(event_id = %id, error = %e, "Batch publish failed for event");
                    report.record_failure(id, e);
                }
            }
        }

        Ok(report)
    }

    /// Build an outbox processor over this bus's store.
    ///
    /// Targets follow the mode: Persistent delivers to the transport and the
    /// in-process publisher; Hybrid delivers to the transport, or to the
    /// publisher when no transport was given (handlers see the event twice).
    ///
    /// # Errors
    ///
    /// [`ConfigurationError`] if the bus has no store or the config is invalid.
    pub fn processor(&self, config: OutboxConfig) -> Result<OutboxProcessor, ConfigurationError> {
        let store = self
            .store
            .clone()
            .ok_or_else(|| self.missing_store())?;

        let targets = match (self.mode, &self.transport) {
            (DeliveryMode::Hybrid, Some(transport)) => DeliveryTargets::transport(Arc::clone(transport)),
            _ => DeliveryTargets {
                transport: self.transport.clone(),
                publisher: self.publisher.clone(),
                ..DeliveryTargets::default()
            },
        };

        OutboxProcessor::new(store, targets, config)
    }

    /// Events of one aggregate, oldest first.
    ///
    /// # Errors
    ///
    /// [`BusError::Configuration`] without a store, [`BusError::Storage`] on query failure.
    pub async fn get_events_by_aggregate_id(
        &self,
        aggregate_id: &str,
    ) -> Result<Vec<StoredEvent>, BusError> {
        Ok(self.require_store()?.get_by_aggregate_id(aggregate_id).await?)
    }

    /// Events with `start <= occurred_at < end`, oldest first.
    ///
    /// # Errors
    ///
    /// [`BusError::Configuration`] without a store, [`BusError::Storage`] on query failure.
    pub async fn get_events_by_time_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<StoredEvent>, BusError> {
        Ok(self.require_store()?.get_by_time_range(start, end).await?)
    }

    /// Events of one type, oldest first.
    ///
    /// # Errors
    ///
    /// [`BusError::Configuration`] without a store, [`BusError::Storage`] on query failure.
    pub async fn get_events_by_type(&self, event_type: &str) -> Result<Vec<StoredEvent>, BusError> {
        Ok(self.require_store()?.get_by_type(event_type).await?)
    }

    /// Events that exhausted their retries.
    ///
    /// # Errors
    ///
    /// [`BusError::Configuration`] without a store, [`BusError::Storage`] on query failure.
    pub async fn get_permanently_failed(&self, limit: usize) -> Result<Vec<StoredEvent>, BusError> {
        Ok(self.require_store()?.get_permanently_failed(limit).await?)
    }

    async fn deliver_immediately(&self, event: &StoredEvent) -> Result<(), DeliveryError> {
        let Some(publisher) = &self.publisher else {
            return Err(DeliveryError::NoTarget(event.event_type.clone()));
        };

        let result = match self.immediate_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, publisher.publish(event)).await {
                Ok(outcome) => outcome.map_err(DeliveryError::from),
                Err(_) => Err(DeliveryError::Timeout(timeout)),
            },
            None => publisher.publish(event).await.map_err(DeliveryError::from),
        };

        if let Err(e) = &result {
            EventBusMetrics::record_immediate_error();
            tracing::warn!(
                event_id = %event.id,
                event_type = %event.event_type,
                mode = %self.mode,
                error = %e,
                "Immediate delivery failed"
            );
        }
        result
    }

    fn require_store(&self) -> Result<&Arc<dyn EventStore>, ConfigurationError> {
        self.store.as_ref().ok_or_else(|| self.missing_store())
    }

    fn missing_store(&self) -> ConfigurationError {
        ConfigurationError::MissingStore {
            mode: self.mode.to_string(),
        }
    }
}
