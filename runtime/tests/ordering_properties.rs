//! Property tests for delivery order and at-least-once accounting.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use composable_outbox_core::environment::Clock;
use composable_outbox_core::{EventStore, StoredEvent};
use composable_outbox_runtime::config::OutboxConfig;
use composable_outbox_runtime::processor::{DeliveryTargets, OutboxProcessor};
use composable_outbox_testing::properties::{creation_offsets, event_type};
use composable_outbox_testing::{InMemoryEventStore, InMemoryTransport, test_clock};
use proptest::prelude::*;
use std::sync::Arc;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Within one batch, delivery follows `created_at`; ties keep insertion order.
    #[test]
    fn batch_delivery_is_fifo_by_created_at(
        offsets in creation_offsets(40),
        kind in event_type(),
    ) {
        let base = test_clock().now();
        let events: Vec<StoredEvent> = offsets
            .iter()
            .map(|ms| {
                let at = base + chrono::Duration::milliseconds(*ms);
                StoredEvent::new(kind.clone(), "{}", at, at)
            })
            .collect();

        let mut expected = events.clone();
        expected.sort_by_key(|e| e.created_at);
        let expected: Vec<_> = expected.iter().map(|e| e.id).collect();

        let delivered = runtime().block_on(async {
            let store = InMemoryEventStore::new();
            let transport = InMemoryTransport::new();
            store.save_events(events).await.unwrap();

            let processor = OutboxProcessor::new(
                Arc::new(store),
                DeliveryTargets::transport(Arc::new(transport.clone())),
                OutboxConfig::default(),
            )
            .unwrap();
            processor.run_cycle().await.unwrap();

            transport.messages().into_iter().map(|m| m.message_id).collect::<Vec<_>>()
        });

        prop_assert_eq!(delivered, expected);
    }

    /// Every saved event is delivered at least once, whatever the failure pattern.
    #[test]
    fn every_event_is_eventually_delivered(
        count in 1_usize..20,
        failures in 0_usize..10,
    ) {
        let base = test_clock().now();
        let events: Vec<StoredEvent> = (0..count)
            .map(|i| {
                let at = base + chrono::Duration::milliseconds(i64::try_from(i).unwrap());
                StoredEvent::new("OrderPlaced.v1", "{}", at, at)
            })
            .collect();

        let (store, transport) = runtime().block_on(async {
            let store = InMemoryEventStore::new();
            let transport = InMemoryTransport::new();
            store.save_events(events.clone()).await.unwrap();
            transport.fail_next(failures);

            // Enough attempts that no event reaches the cap.
            let config = OutboxConfig::default().with_max_retry_attempts(100);
            let processor = OutboxProcessor::new(
                Arc::new(store.clone()),
                DeliveryTargets::transport(Arc::new(transport.clone())),
                config,
            )
            .unwrap();

            for _ in 0..=failures {
                processor.run_cycle().await.unwrap();
            }
            (store, transport)
        });

        for event in &events {
            prop_assert!(store.get(event.id).unwrap().is_published);
            prop_assert!(transport.messages().iter().any(|m| m.message_id == event.id));
        }
    }
}
