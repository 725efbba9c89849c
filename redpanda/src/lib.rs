//! Redpanda message transport for the Composable Outbox.
//!
//! [`RedpandaTransport`] implements `MessageTransport` from
//! `composable-outbox-core` on top of rdkafka, so it works with Redpanda,
//! Apache Kafka, or any other Kafka-compatible broker.
//!
//! # Wire format
//!
//! Each record carries:
//! - **Key**: the message's partition key (aggregate id, else event type), so
//!   events of one aggregate stay ordered within a partition
//! - **Headers**: `event_type` and `message_id`, for routing without decoding
//! - **Payload**: the whole `TransportMessage` as JSON; read it back with [`decode`]
//!
//! # Delivery Semantics
//!
//! The outbox hands a message over at least once. A record acknowledged by the
//! broker but not yet marked published in the store will be sent again after a
//! restart, so consumers must deduplicate on `message_id`.
//!
//! # Example
//!
//! ```no_run
//! use composable_outbox_redpanda::RedpandaTransport;
//! use std::time::Duration;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let transport = RedpandaTransport::builder()
//!     .brokers("localhost:9092")
//!     .default_topic("domain-events")
//!     .producer_acks("all")
//!     .timeout(Duration::from_secs(5))
//!     .build()?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use chrono::{DateTime, Utc};
use composable_outbox_core::transport::{MessageTransport, TransportError, TransportFuture, TransportMessage};
use rdkafka::config::ClientConfig;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use std::time::Duration;

/// Header carrying the event type tag.
pub const EVENT_TYPE_HEADER: &str = "event_type";

/// Header carrying the outbox record id.
pub const MESSAGE_ID_HEADER: &str = "message_id";

/// Topic used by [`MessageTransport::publish`] when none is configured.
pub const DEFAULT_TOPIC: &str = "outbox-events";

/// Decode a record payload produced by [`RedpandaTransport`].
///
/// # Errors
///
/// Returns [`TransportError::SerializationFailed`] if the payload is not a
/// JSON-encoded `TransportMessage`.
pub fn decode(payload: &[u8]) -> Result<TransportMessage, TransportError> {
    serde_json::from_slice(payload).map_err(|e| TransportError::SerializationFailed(e.to_string()))
}

/// Encode a message as a record payload.
///
/// # Errors
///
/// Returns [`TransportError::SerializationFailed`] if encoding fails.
pub fn encode(message: &TransportMessage) -> Result<Vec<u8>, TransportError> {
    serde_json::to_vec(message).map_err(|e| TransportError::SerializationFailed(e.to_string()))
}

/// Kafka-compatible transport.
///
/// Cheap to clone; clones share the underlying producer.
#[derive(Clone)]
pub struct RedpandaTransport {
    producer: FutureProducer,
    brokers: String,
    default_topic: String,
    timeout: Duration,
    max_schedule_delay: Duration,
}

impl std::fmt::Debug for RedpandaTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedpandaTransport")
            .field("brokers", &self.brokers)
            .field("default_topic", &self.default_topic)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl RedpandaTransport {
    /// Create a transport with default settings.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ConnectionFailed`] if the producer cannot be created.
    pub fn new(brokers: &str) -> Result<Self, TransportError> {
        Self::builder().brokers(brokers).build()
    }

    /// Start configuring a transport.
    #[must_use]
    pub fn builder() -> RedpandaTransportBuilder {
        RedpandaTransportBuilder::default()
    }

    /// Bootstrap servers.
    #[must_use]
    pub fn brokers(&self) -> &str {
        &self.brokers
    }

    /// Topic used by `publish`.
    #[must_use]
    pub fn default_topic(&self) -> &str {
        &self.default_topic
    }
}

/// Builder for [`RedpandaTransport`].
#[derive(Default)]
pub struct RedpandaTransportBuilder {
    brokers: Option<String>,
    default_topic: Option<String>,
    producer_acks: Option<String>,
    compression: Option<String>,
    timeout: Option<Duration>,
    client_id: Option<String>,
    max_schedule_delay: Option<Duration>,
}

impl RedpandaTransportBuilder {
    /// Comma-separated broker addresses, e.g. `"localhost:9092"`.
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Topic for messages without an explicit destination.
    ///
    /// Default: `"outbox-events"`
    #[must_use]
    pub fn default_topic(mut self, topic: impl Into<String>) -> Self {
        self.default_topic = Some(topic.into());
        self
    }

    /// Producer acknowledgment mode: `"0"`, `"1"` or `"all"`.
    ///
    /// Default: `"all"`
    #[must_use]
    pub fn producer_acks(mut self, acks: impl Into<String>) -> Self {
        self.producer_acks = Some(acks.into());
        self
    }

    /// Compression codec: `"none"`, `"gzip"`, `"snappy"`, `"lz4"` or `"zstd"`.
    ///
    /// Default: `"none"`
    #[must_use]
    pub fn compression(mut self, compression: impl Into<String>) -> Self {
        self.compression = Some(compression.into());
        self
    }

    /// Time to wait for a broker acknowledgment.
    ///
    /// Default: 5 seconds
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Client id reported to the broker.
    #[must_use]
    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    /// Furthest in the future `schedule_publish` accepts.
    ///
    /// Scheduled messages are held in memory until due, so they do not
    /// survive a restart. Default: 1 hour
    #[must_use]
    pub const fn max_schedule_delay(mut self, delay: Duration) -> Self {
        self.max_schedule_delay = Some(delay);
        self
    }

    /// Create the producer.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ConnectionFailed`] if no brokers are set or
    /// the producer configuration is rejected.
    pub fn build(self) -> Result<RedpandaTransport, TransportError> {
        let brokers = self
            .brokers
            .filter(|b| !b.trim().is_empty())
            .ok_or_else(|| TransportError::ConnectionFailed("Brokers not configured".to_string()))?;
        let timeout = self.timeout.unwrap_or(Duration::from_secs(5));
        let acks = self.producer_acks.as_deref().unwrap_or("all");
        let compression = self.compression.as_deref().unwrap_or("none");

        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", &brokers)
            .set("message.timeout.ms", timeout.as_millis().to_string())
            .set("acks", acks)
            .set("compression.type", compression);
        if let Some(client_id) = &self.client_id {
            config.set("client.id", client_id);
        }

        let producer: FutureProducer = config.create().map_err(|e| {
            TransportError::ConnectionFailed(format!("Failed to create producer: {e}"))
        })?;

        let default_topic = self.default_topic.unwrap_or_else(|| DEFAULT_TOPIC.to_string());

        tracing::info!(
            brokers = %brokers,
            default_topic = %default_topic,
            acks,
            compression,
            "RedpandaTransport created"
        );

        Ok(RedpandaTransport {
            producer,
            brokers,
            default_topic,
            timeout,
            max_schedule_delay: self.max_schedule_delay.unwrap_or(Duration::from_secs(3600)),
        })
    }
}

impl MessageTransport for RedpandaTransport {
    fn publish(&self, message: TransportMessage) -> TransportFuture<'_> {
        Box::pin(async move { produce(&self.producer, &self.default_topic, &message, self.timeout).await })
    }

    fn send(&self, destination: &str, message: TransportMessage) -> TransportFuture<'_> {
        let topic = destination.to_string();
        Box::pin(async move { produce(&self.producer, &topic, &message, self.timeout).await })
    }

    fn schedule_publish(
        &self,
        message: TransportMessage,
        when: DateTime<Utc>,
    ) -> TransportFuture<'_> {
        Box::pin(async move {
            let delay = (when - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            if delay.is_zero() {
                return produce(&self.producer, &self.default_topic, &message, self.timeout).await;
            }
            if delay > self.max_schedule_delay {
                return Err(TransportError::SchedulingFailed(format!(
                    "{when} is more than {:?} away",
                    self.max_schedule_delay
                )));
            }

            // Encode now so a bad message fails the caller, not the timer.
            encode(&message)?;

            let producer = self.producer.clone();
            let topic = self.default_topic.clone();
            let timeout = self.timeout;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if let Err(e) = produce(&producer, &topic, &message, timeout).await {
                    tracing::error!(
                        message_id = %message.message_id,
                        error = %e,
                        "Scheduled publish failed"
                    );
                }
            });

            tracing::debug!(message_id = %message.message_id, %when, "Publish scheduled");
            Ok(())
        })
    }
}

async fn produce(
    producer: &FutureProducer,
    topic: &str,
    message: &TransportMessage,
    timeout: Duration,
) -> Result<(), TransportError> {
    if topic.trim().is_empty() {
        return Err(TransportError::InvalidDestination(topic.to_string()));
    }

    let payload = encode(message)?;
    let message_id = message.message_id.to_string();
    let headers = OwnedHeaders::new()
        .insert(Header {
            key: EVENT_TYPE_HEADER,
            value: Some(message.event_type.as_str()),
        })
        .insert(Header {
            key: MESSAGE_ID_HEADER,
            value: Some(message_id.as_str()),
        });

    let record = FutureRecord::to(topic)
        .payload(&payload)
        .key(message.partition_key())
        .headers(headers);

    match producer.send(record, Timeout::After(timeout)).await {
        Ok((partition, offset)) => {
            metrics::counter!("outbox_redpanda_produced_total").increment(1);
            tracing::debug!(
                topic,
                partition,
                offset,
                message_id = %message.message_id,
                event_type = %message.event_type,
                "Message produced"
            );
            Ok(())
        }
        Err((kafka_error, _)) => {
            metrics::counter!("outbox_redpanda_errors_total").increment(1);
            tracing::warn!(
                topic,
                message_id = %message.message_id,
                error = %kafka_error,
                "Failed to produce message"
            );
            Err(TransportError::PublishFailed {
                destination: topic.to_string(),
                reason: kafka_error.to_string(),
            })
        }
    }
}
