//! Integration tests for the outbox processor against the in-memory store.
//!
//! Covers the delivery state machine (publish, retry, terminal failure),
//! FIFO within a batch, timeouts, store outages, bookkeeping retries, row
//! leases between processors, and the start/stop lifecycle.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use composable_outbox_core::environment::Clock;
use composable_outbox_core::{EventStore, EventStoreError, StoredEvent, Utc};
use composable_outbox_runtime::config::OutboxConfig;
use composable_outbox_runtime::dispatcher::InProcessPublisher;
use composable_outbox_runtime::error::ProcessorError;
use composable_outbox_runtime::processor::{DeliveryTargets, OutboxProcessor};
use composable_outbox_runtime::retry::RetryPolicy;
use composable_outbox_runtime::router::TopicRouter;
use composable_outbox_testing::helpers::{init_tracing, order_placed, order_sequence};
use composable_outbox_testing::{
    InMemoryEventStore, InMemoryTransport, ManualClock, RecordingHandler, test_clock,
};
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Test Fixtures
// ============================================================================

fn fast_config() -> OutboxConfig {
    init_tracing();
    OutboxConfig::default()
        .with_processing_interval(Duration::from_millis(20))
        .with_delivery_timeout(Duration::from_millis(200))
        .with_claim_lease(Some(Duration::from_secs(5)))
        .with_bookkeeping_retry(
            RetryPolicy::builder()
                .max_retries(3)
                .initial_delay(Duration::from_millis(1))
                .build(),
        )
        .with_processor_id("test-processor")
}

fn transport_processor(
    store: &InMemoryEventStore,
    transport: &InMemoryTransport,
    config: OutboxConfig,
) -> OutboxProcessor {
    OutboxProcessor::new(
        Arc::new(store.clone()),
        DeliveryTargets::transport(Arc::new(transport.clone())),
        config,
    )
    .expect("valid processor configuration")
}

async fn seed(store: &InMemoryEventStore, count: usize) -> Vec<StoredEvent> {
    let events = order_sequence(count, test_clock().now());
    store.save_events(events.clone()).await.unwrap();
    events
}

/// Poll `check` until it holds or `limit` elapses.
async fn eventually<F>(limit: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

// ============================================================================
// Delivery state machine
// ============================================================================

#[tokio::test]
async fn delivers_pending_events_and_marks_them_published() {
    let store = InMemoryEventStore::new();
    let transport = InMemoryTransport::new();
    let events = seed(&store, 3).await;
    let processor = transport_processor(&store, &transport, fast_config());

    let report = processor.run_cycle().await.unwrap();

    assert_eq!(report.fetched, 3);
    assert_eq!(report.published, 3);
    assert_eq!(report.failed, 0);
    assert!(store.get_unpublished(10).await.unwrap().is_empty());
    for event in &events {
        let stored = store.get(event.id).unwrap();
        assert!(stored.is_published);
        assert!(stored.published_at.is_some());
        assert_eq!(stored.retry_count, 0);
    }
    assert_eq!(transport.sent_to("order-events").len(), 3);
}

#[tokio::test]
async fn transport_message_carries_event_identity() {
    let store = InMemoryEventStore::new();
    let transport = InMemoryTransport::new();
    let events = seed(&store, 1).await;
    let processor = transport_processor(&store, &transport, fast_config());

    processor.run_cycle().await.unwrap();

    let message = &transport.messages()[0];
    assert_eq!(message.message_id, events[0].id);
    assert_eq!(message.event_type, "OrderPlaced.v1");
    assert_eq!(message.payload, events[0].payload);
    assert_eq!(message.partition_key(), "order-0");
}

#[tokio::test]
async fn failed_attempt_is_recorded_and_retried_next_cycle() {
    let store = InMemoryEventStore::new();
    let transport = InMemoryTransport::new();
    let events = seed(&store, 1).await;
    let processor = transport_processor(&store, &transport, fast_config());

    transport.fail_next(1);
    let first = processor.run_cycle().await.unwrap();
    assert_eq!(first.failed, 1);

    let after_failure = store.get(events[0].id).unwrap();
    assert_eq!(after_failure.retry_count, 1);
    assert!(after_failure.is_failed);
    assert!(!after_failure.is_published);
    assert!(after_failure.error_message.unwrap().contains("injected failure"));
    assert_eq!(store.get_unpublished(10).await.unwrap().len(), 1);

    let second = processor.run_cycle().await.unwrap();
    assert_eq!(second.published, 1);
    assert!(store.get(events[0].id).unwrap().is_published);
}

#[tokio::test]
async fn retry_cap_of_two_moves_event_to_terminal_failure() {
    let store = InMemoryEventStore::new();
    let transport = InMemoryTransport::new();
    let events = seed(&store, 1).await;
    let processor =
        transport_processor(&store, &transport, fast_config().with_max_retry_attempts(2));

    transport.fail_always(true);

    assert_eq!(processor.run_cycle().await.unwrap().failed, 1);
    assert_eq!(processor.run_cycle().await.unwrap().failed, 1);
    assert_eq!(store.get(events[0].id).unwrap().retry_count, 2);

    let third = processor.run_cycle().await.unwrap();
    assert_eq!(third.terminally_failed, 1);
    assert_eq!(transport.attempts(), 2, "no third delivery attempt");

    assert!(store.get_unpublished(10).await.unwrap().is_empty());
    let failed = store.get_permanently_failed(10).await.unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].id, events[0].id);
    assert_eq!(failed[0].retry_count, 2);
    assert!(failed[0].is_failed);
    assert!(!failed[0].is_published);

    // Terminal events are never picked up again.
    let fourth = processor.run_cycle().await.unwrap();
    assert_eq!(fourth.fetched, 0);
}

#[tokio::test]
async fn published_events_are_never_redelivered() {
    let store = InMemoryEventStore::new();
    let transport = InMemoryTransport::new();
    seed(&store, 2).await;
    let processor = transport_processor(&store, &transport, fast_config());

    processor.run_cycle().await.unwrap();
    let second = processor.run_cycle().await.unwrap();

    assert_eq!(second.fetched, 0);
    assert_eq!(transport.messages().len(), 2);
}

#[tokio::test]
async fn batch_is_delivered_oldest_first() {
    let store = InMemoryEventStore::new();
    let transport = InMemoryTransport::new();
    let base = test_clock().now();

    let newest = order_placed("c", base + chrono::Duration::seconds(2));
    let oldest = order_placed("a", base);
    let middle = order_placed("b", base + chrono::Duration::seconds(1));
    for event in [&newest, &oldest, &middle] {
        store.save_event(event.clone()).await.unwrap();
    }

    let processor = transport_processor(&store, &transport, fast_config());
    processor.run_cycle().await.unwrap();

    let delivered: Vec<_> = transport.messages().into_iter().map(|m| m.message_id).collect();
    assert_eq!(delivered, vec![oldest.id, middle.id, newest.id]);
}

#[tokio::test]
async fn batch_size_bounds_each_cycle() {
    let store = InMemoryEventStore::new();
    let transport = InMemoryTransport::new();
    seed(&store, 5).await;
    let processor = transport_processor(&store, &transport, fast_config().with_batch_size(2));

    assert_eq!(processor.run_cycle().await.unwrap().fetched, 2);
    assert_eq!(processor.run_cycle().await.unwrap().fetched, 2);
    assert_eq!(processor.run_cycle().await.unwrap().fetched, 1);
    assert_eq!(processor.run_cycle().await.unwrap().fetched, 0);
}

#[tokio::test]
async fn delivery_timeout_counts_as_failed_attempt() {
    let store = InMemoryEventStore::new();
    let transport = InMemoryTransport::new();
    let events = seed(&store, 1).await;
    transport.set_delay(Some(Duration::from_millis(500)));

    let processor = transport_processor(
        &store,
        &transport,
        fast_config().with_delivery_timeout(Duration::from_millis(30)),
    );

    let report = processor.run_cycle().await.unwrap();
    assert_eq!(report.failed, 1);

    let stored = store.get(events[0].id).unwrap();
    assert_eq!(stored.retry_count, 1);
    assert!(stored.error_message.unwrap().contains("timed out"));
}

// ============================================================================
// Targets and routing
// ============================================================================

#[tokio::test]
async fn explicit_route_overrides_aggregate_topic() {
    let store = InMemoryEventStore::new();
    let transport = InMemoryTransport::new();
    seed(&store, 1).await;

    let targets = DeliveryTargets::transport(Arc::new(transport.clone()))
        .with_router(TopicRouter::new().route("OrderPlaced.v1", "orders"));
    let processor = OutboxProcessor::new(Arc::new(store.clone()), targets, fast_config()).unwrap();

    processor.run_cycle().await.unwrap();

    assert_eq!(transport.sent_to("orders").len(), 1);
    assert!(transport.sent_to("order-events").is_empty());
}

#[tokio::test]
async fn in_process_target_reaches_registered_handlers() {
    let store = InMemoryEventStore::new();
    let events = seed(&store, 2).await;
    let handler = Arc::new(RecordingHandler::new("projection"));
    let mut publisher = InProcessPublisher::new();
    publisher.subscribe_raw("OrderPlaced.v1", handler.clone());

    let processor = OutboxProcessor::new(
        Arc::new(store.clone()),
        DeliveryTargets::in_process(Arc::new(publisher)),
        fast_config(),
    )
    .unwrap();

    assert_eq!(processor.run_cycle().await.unwrap().published, 2);
    assert_eq!(handler.ids(), vec![events[0].id, events[1].id]);
}

#[tokio::test]
async fn undecodable_payload_is_a_failed_attempt() {
    #[derive(serde::Deserialize)]
    struct Refund {
        #[allow(dead_code)]
        refund_id: String,
    }

    let store = InMemoryEventStore::new();
    let events = seed(&store, 1).await;
    let mut publisher = InProcessPublisher::new();
    publisher.subscribe("OrderPlaced.v1", "refunds", |_: Refund| async { Ok(()) });

    let processor = OutboxProcessor::new(
        Arc::new(store.clone()),
        DeliveryTargets::in_process(Arc::new(publisher)),
        fast_config(),
    )
    .unwrap();

    assert_eq!(processor.run_cycle().await.unwrap().failed, 1);
    let stored = store.get(events[0].id).unwrap();
    assert_eq!(stored.retry_count, 1);
    assert!(!stored.is_published);
    assert!(
        stored
            .error_message
            .as_deref()
            .unwrap()
            .starts_with("Payload decoding failed")
    );
}

#[tokio::test]
async fn handler_failure_fails_the_attempt_even_if_transport_accepted() {
    let store = InMemoryEventStore::new();
    let transport = InMemoryTransport::new();
    let events = seed(&store, 1).await;
    let handler = Arc::new(RecordingHandler::new("flaky"));
    handler.fail_next(1);
    let mut publisher = InProcessPublisher::new();
    publisher.subscribe_raw("OrderPlaced.v1", handler.clone());

    let processor = OutboxProcessor::new(
        Arc::new(store.clone()),
        DeliveryTargets::both(Arc::new(transport.clone()), Arc::new(publisher)),
        fast_config(),
    )
    .unwrap();

    assert_eq!(processor.run_cycle().await.unwrap().failed, 1);
    assert_eq!(store.get(events[0].id).unwrap().retry_count, 1);

    // At-least-once: the transport sees the event again on the retry.
    assert_eq!(processor.run_cycle().await.unwrap().published, 1);
    assert_eq!(transport.messages().len(), 2);
    assert_eq!(handler.count(), 1);
}

#[test]
fn rejects_empty_targets_and_invalid_config() {
    let store = Arc::new(InMemoryEventStore::new());

    assert!(OutboxProcessor::new(store.clone(), DeliveryTargets::default(), fast_config()).is_err());

    let transport = Arc::new(InMemoryTransport::new());
    assert!(
        OutboxProcessor::new(
            store,
            DeliveryTargets::transport(transport),
            fast_config().with_batch_size(0),
        )
        .is_err()
    );
}

#[test]
fn generates_an_id_when_none_is_configured() {
    let processor = OutboxProcessor::new(
        Arc::new(InMemoryEventStore::new()),
        DeliveryTargets::transport(Arc::new(InMemoryTransport::new())),
        OutboxConfig::default(),
    )
    .unwrap();
    assert!(processor.id().starts_with("outbox-processor-"));
}

// ============================================================================
// Store failures
// ============================================================================

#[tokio::test]
async fn fetch_failure_is_returned_from_run_cycle() {
    let store = InMemoryEventStore::new();
    let transport = InMemoryTransport::new();
    seed(&store, 1).await;
    let processor = transport_processor(&store, &transport, fast_config());

    store.set_unavailable(true);
    let err = processor.run_cycle().await.unwrap_err();
    assert!(matches!(err, EventStoreError::Unavailable(_)));
    assert!(transport.messages().is_empty());
}

#[tokio::test]
async fn outage_pauses_delivery_and_loop_recovers() {
    let store = InMemoryEventStore::new();
    let transport = InMemoryTransport::new();
    let events = seed(&store, 2).await;
    let mut processor = transport_processor(&store, &transport, fast_config());

    store.set_unavailable(true);
    processor.start().unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(processor.is_running(), "loop survives fetch errors");
    assert!(transport.messages().is_empty());

    store.set_unavailable(false);
    let recovered = eventually(Duration::from_secs(2), || {
        events.iter().all(|e| store.get(e.id).is_some_and(|s| s.is_published))
    })
    .await;

    processor.stop().await.unwrap();
    assert!(recovered, "pending events delivered after the outage");
    assert_eq!(transport.messages().len(), 2);
}

#[tokio::test]
async fn transient_bookkeeping_errors_are_retried() {
    let store = InMemoryEventStore::new();
    let transport = InMemoryTransport::new();
    let events = seed(&store, 1).await;
    let processor = transport_processor(&store, &transport, fast_config());

    store.fail_next_writes(2);
    let report = processor.run_cycle().await.unwrap();

    assert_eq!(report.published, 1);
    assert!(store.get(events[0].id).unwrap().is_published);
    assert_eq!(processor.run_cycle().await.unwrap().fetched, 0);
}

#[tokio::test]
async fn exhausted_bookkeeping_retries_leave_event_pending() {
    let store = InMemoryEventStore::new();
    let transport = InMemoryTransport::new();
    let events = seed(&store, 1).await;
    let processor = transport_processor(&store, &transport, fast_config());

    store.fail_next_writes(10);
    processor.run_cycle().await.unwrap();

    // Delivered but not recorded: redelivered later, consumers deduplicate.
    assert!(!store.get(events[0].id).unwrap().is_published);
    assert_eq!(transport.messages().len(), 1);
}

// ============================================================================
// Multiple processors
// ============================================================================

#[tokio::test]
async fn leased_rows_are_not_delivered_by_a_second_processor() {
    let store = InMemoryEventStore::new();
    let slow = InMemoryTransport::new();
    let fast = InMemoryTransport::new();
    seed(&store, 1).await;
    slow.set_delay(Some(Duration::from_millis(150)));

    let first = transport_processor(&store, &slow, fast_config().with_processor_id("first"));
    let second = transport_processor(&store, &fast, fast_config().with_processor_id("second"));

    let (a, b) = tokio::join!(first.run_cycle(), async {
        tokio::time::sleep(Duration::from_millis(30)).await;
        second.run_cycle().await
    });

    assert_eq!(a.unwrap().published, 1);
    assert_eq!(b.unwrap().fetched, 0);
    assert_eq!(slow.messages().len(), 1);
    assert!(fast.messages().is_empty());
}

#[tokio::test]
async fn slow_batch_is_deferred_before_the_lease_expires() {
    let store = InMemoryEventStore::new();
    let slow = InMemoryTransport::new();
    let fast = InMemoryTransport::new();
    seed(&store, 3).await;
    slow.set_delay(Some(Duration::from_millis(150)));

    // One attempt fits in the lease, a second one would not.
    let tight = fast_config()
        .with_delivery_timeout(Duration::from_millis(200))
        .with_claim_lease(Some(Duration::from_millis(250)));
    let first = transport_processor(&store, &slow, tight.clone().with_processor_id("first"));
    let second = transport_processor(&store, &fast, tight.with_processor_id("second"));

    let (a, b) = tokio::join!(first.run_cycle(), async {
        tokio::time::sleep(Duration::from_millis(300)).await;
        second.run_cycle().await
    });
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(a.fetched, 3);
    assert_eq!(a.published, 1);
    assert_eq!(a.deferred, 2);
    assert_eq!(b.published, 2);

    let by_first: Vec<_> = slow.messages().iter().map(|m| m.message_id).collect();
    let by_second: Vec<_> = fast.messages().iter().map(|m| m.message_id).collect();
    assert!(by_first.iter().all(|id| !by_second.contains(id)));
    assert!(store.get_unpublished(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn expired_lease_is_reclaimed() {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let store = InMemoryEventStore::with_clock(clock.clone());
    let transport = InMemoryTransport::new();
    seed(&store, 1).await;

    // A processor that claimed the row and then crashed.
    let claimed = store
        .claim_unpublished(10, "crashed", Duration::from_secs(60))
        .await
        .unwrap();
    assert_eq!(claimed.len(), 1);

    let survivor = transport_processor(&store, &transport, fast_config());
    assert_eq!(survivor.run_cycle().await.unwrap().fetched, 0);

    clock.advance(Duration::from_secs(61));
    assert_eq!(survivor.run_cycle().await.unwrap().published, 1);
}

#[tokio::test]
async fn leasing_can_be_disabled() {
    let store = InMemoryEventStore::new();
    let transport = InMemoryTransport::new();
    seed(&store, 1).await;
    store
        .claim_unpublished(10, "someone-else", Duration::from_secs(60))
        .await
        .unwrap();

    let processor = transport_processor(&store, &transport, fast_config().with_claim_lease(None));
    assert_eq!(processor.run_cycle().await.unwrap().published, 1);
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn start_and_stop_transitions() {
    let store = InMemoryEventStore::new();
    let transport = InMemoryTransport::new();
    let mut processor = transport_processor(&store, &transport, fast_config());

    assert!(!processor.is_running());
    assert!(matches!(processor.stop().await, Err(ProcessorError::NotRunning)));

    processor.start().unwrap();
    assert!(processor.is_running());
    assert!(matches!(processor.start(), Err(ProcessorError::AlreadyRunning)));

    processor.stop().await.unwrap();
    assert!(!processor.is_running());

    // Restartable.
    processor.start().unwrap();
    processor.stop().await.unwrap();
}

#[tokio::test]
async fn concurrent_manual_cycles_do_not_overlap() {
    let store = InMemoryEventStore::new();
    let transport = InMemoryTransport::new();
    seed(&store, 3).await;
    transport.set_delay(Some(Duration::from_millis(30)));
    let processor = transport_processor(&store, &transport, fast_config());

    let (a, b) = tokio::join!(processor.run_cycle(), processor.run_cycle());
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(a.published + b.published, 3);
    assert_eq!(a.fetched.min(b.fetched), 0);
    assert_eq!(transport.messages().len(), 3);
}

#[tokio::test]
async fn manual_cycle_waits_for_the_running_loop() {
    let store = InMemoryEventStore::new();
    let transport = InMemoryTransport::new();
    let events = seed(&store, 2).await;
    transport.set_delay(Some(Duration::from_millis(100)));
    let mut processor = transport_processor(&store, &transport, fast_config());

    processor.start().unwrap();
    tokio::time::sleep(Duration::from_millis(40)).await;
    processor.run_cycle().await.unwrap();

    let delivered = eventually(Duration::from_secs(2), || {
        events
            .iter()
            .all(|e| store.get(e.id).is_some_and(|stored| stored.is_published))
    })
    .await;
    processor.stop().await.unwrap();

    assert!(delivered);
    assert_eq!(transport.messages().len(), 2);
}

#[tokio::test]
async fn stop_interrupts_the_interval_sleep() {
    let store = InMemoryEventStore::new();
    let transport = InMemoryTransport::new();
    let mut processor = transport_processor(
        &store,
        &transport,
        fast_config().with_processing_interval(Duration::from_secs(3600)),
    );

    processor.start().unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let stopped = tokio::time::timeout(Duration::from_secs(1), processor.stop()).await;
    assert!(stopped.is_ok(), "stop returned without waiting for the interval");
}

#[tokio::test]
async fn running_loop_delivers_within_an_interval() {
    let store = InMemoryEventStore::new();
    let transport = InMemoryTransport::new();
    let mut processor = transport_processor(&store, &transport, fast_config());
    processor.start().unwrap();

    let events = seed(&store, 1).await;
    let delivered = eventually(Duration::from_secs(2), || {
        store.get(events[0].id).is_some_and(|e| e.is_published)
    })
    .await;

    processor.stop().await.unwrap();
    assert!(delivered);
    assert_eq!(transport.messages().len(), 1);
}
