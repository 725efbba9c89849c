//! Integration tests for [`RedpandaTransport`] against a real Kafka instance.
//!
//! # Running These Tests
//!
//! These tests are marked as `#[ignore]` by default because they require
//! Docker and take 15-60 seconds to spin up Kafka.
//!
//! ```bash
//! cargo test -p composable-outbox-redpanda --test integration_tests -- --ignored
//! ```

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use composable_outbox_core::environment::Clock;
use composable_outbox_core::{EventStore, MessageTransport, TransportMessage};
use composable_outbox_redpanda::{EVENT_TYPE_HEADER, MESSAGE_ID_HEADER, RedpandaTransport, decode};
use composable_outbox_runtime::config::OutboxConfig;
use composable_outbox_runtime::processor::{DeliveryTargets, OutboxProcessor};
use composable_outbox_testing::helpers::{order_placed, order_sequence};
use composable_outbox_testing::{InMemoryEventStore, test_clock};
use futures::StreamExt;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Headers, Message};
use std::sync::Arc;
use std::time::Duration;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::kafka::{KAFKA_PORT, Kafka};

// ============================================================================
// Test Fixtures
// ============================================================================

async fn start_kafka() -> (ContainerAsync<Kafka>, String) {
    let kafka = Kafka::default()
        .with_env_var("KAFKA_AUTO_CREATE_TOPICS_ENABLE", "true")
        .start()
        .await
        .expect("Failed to start Kafka container");

    let host = kafka.get_host().await.expect("Failed to get host");
    let port = kafka
        .get_host_port_ipv4(KAFKA_PORT)
        .await
        .expect("Failed to get port");
    let brokers = format!("{host}:{port}");

    wait_for_kafka_ready(&brokers).await;
    (kafka, brokers)
}

/// Produce a warmup record until the broker accepts it.
async fn wait_for_kafka_ready(brokers: &str) {
    let max_attempts = 60;
    for attempt in 1..=max_attempts {
        if let Ok(transport) = RedpandaTransport::builder()
            .brokers(brokers)
            .default_topic("warmup-topic")
            .build()
        {
            let warmup = TransportMessage::from(&order_placed("warmup", test_clock().now()));
            if transport.publish(warmup).await.is_ok() {
                tokio::time::sleep(Duration::from_millis(500)).await;
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(
            attempt != max_attempts,
            "Kafka failed to become ready after {max_attempts} attempts"
        );
    }
}

fn consumer(brokers: &str, group: &str, topic: &str) -> StreamConsumer {
    let consumer: StreamConsumer = ClientConfig::new()
        .set("bootstrap.servers", brokers)
        .set("group.id", group)
        .set("auto.offset.reset", "earliest")
        .set("enable.partition.eof", "false")
        .create()
        .expect("Failed to create consumer");
    consumer.subscribe(&[topic]).expect("Failed to subscribe");
    consumer
}

fn header<'a>(message: &'a BorrowedMessage<'_>, key: &str) -> Option<&'a [u8]> {
    message
        .headers()?
        .iter()
        .find(|h| h.key == key)
        .and_then(|h| h.value)
}

/// Read `count` decoded messages, skipping warmup records.
async fn receive(consumer: &StreamConsumer, count: usize) -> Vec<(Option<Vec<u8>>, TransportMessage)> {
    let mut received = Vec::new();
    tokio::time::timeout(Duration::from_secs(30), async {
        let mut stream = consumer.stream();
        while received.len() < count {
            let Some(result) = stream.next().await else {
                break;
            };
            let message = result.expect("Failed to receive message");
            let decoded = decode(message.payload().expect("payload")).expect("decodable payload");
            if decoded.aggregate_id.as_deref() == Some("warmup") {
                continue;
            }
            assert_eq!(
                header(&message, EVENT_TYPE_HEADER),
                Some(decoded.event_type.as_bytes())
            );
            assert_eq!(
                header(&message, MESSAGE_ID_HEADER),
                Some(decoded.message_id.to_string().as_bytes())
            );
            received.push((message.key().map(<[u8]>::to_vec), decoded));
        }
    })
    .await
    .expect("Timeout waiting for messages");
    received
}

// ============================================================================
// Transport
// ============================================================================

#[tokio::test]
#[ignore = "requires Docker"]
async fn send_delivers_keyed_record_with_headers() {
    let (_kafka, brokers) = start_kafka().await;
    let transport = RedpandaTransport::new(&brokers).unwrap();
    let consumer = consumer(&brokers, "send-test", "order-events");

    let message = TransportMessage::from(&order_placed("order-1", test_clock().now()));
    transport.send("order-events", message.clone()).await.unwrap();

    let received = receive(&consumer, 1).await;
    assert_eq!(received[0].0.as_deref(), Some("order-1".as_bytes()));
    assert_eq!(received[0].1, message);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn publish_uses_the_default_topic() {
    let (_kafka, brokers) = start_kafka().await;
    let transport = RedpandaTransport::builder()
        .brokers(&brokers)
        .default_topic("domain-events")
        .build()
        .unwrap();
    let consumer = consumer(&brokers, "default-topic-test", "domain-events");

    let message = TransportMessage::from(&order_placed("order-1", test_clock().now()));
    transport.publish(message.clone()).await.unwrap();

    let received = receive(&consumer, 1).await;
    assert_eq!(received[0].1.message_id, message.message_id);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn scheduled_publish_arrives_after_the_delay() {
    let (_kafka, brokers) = start_kafka().await;
    let transport = RedpandaTransport::builder()
        .brokers(&brokers)
        .default_topic("scheduled-events")
        .build()
        .unwrap();
    let consumer = consumer(&brokers, "schedule-test", "scheduled-events");

    let message = TransportMessage::from(&order_placed("order-1", test_clock().now()));
    let when = chrono::Utc::now() + chrono::Duration::seconds(1);
    transport.schedule_publish(message.clone(), when).await.unwrap();

    let received = receive(&consumer, 1).await;
    assert_eq!(received[0].1.message_id, message.message_id);
    assert!(chrono::Utc::now() >= when);
}

// ============================================================================
// End to end
// ============================================================================

#[tokio::test]
#[ignore = "requires Docker"]
async fn processor_relays_outbox_to_aggregate_topic() {
    let (_kafka, brokers) = start_kafka().await;
    let transport = RedpandaTransport::new(&brokers).unwrap();
    let consumer = consumer(&brokers, "relay-test", "order-events");

    let store = InMemoryEventStore::new();
    let events = order_sequence(3, test_clock().now());
    store.save_events(events.clone()).await.unwrap();

    let processor = OutboxProcessor::new(
        Arc::new(store.clone()),
        DeliveryTargets::transport(Arc::new(transport)),
        OutboxConfig::default(),
    )
    .unwrap();
    let report = processor.run_cycle().await.unwrap();
    assert_eq!(report.published, 3);

    let received = receive(&consumer, 3).await;
    let mut ids: Vec<_> = received.iter().map(|(_, m)| m.message_id).collect();
    let mut expected: Vec<_> = events.iter().map(|e| e.id).collect();
    ids.sort_by_key(ToString::to_string);
    expected.sort_by_key(ToString::to_string);
    assert_eq!(ids, expected);
    assert!(store.get_unpublished(10).await.unwrap().is_empty());
}
