//! # Composable Outbox Testing
//!
//! Testing utilities for the Composable Outbox.
//!
//! This crate provides:
//! - [`InMemoryEventStore`]: reference `EventStore` with outage and write-failure injection
//! - [`InMemoryTransport`]: recording `MessageTransport` with failure and latency injection
//! - [`RecordingHandler`]: in-process handler that records what it sees
//! - Deterministic clocks ([`FixedClock`], [`ManualClock`])
//! - Sample events and proptest strategies
//!
//! ## Example
//!
//! ```no_run
//! use composable_outbox_testing::{InMemoryEventStore, InMemoryTransport};
//! use composable_outbox_runtime::config::OutboxConfig;
//! use composable_outbox_runtime::processor::{DeliveryTargets, OutboxProcessor};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = InMemoryEventStore::new();
//! let transport = InMemoryTransport::new();
//!
//! let processor = OutboxProcessor::new(
//!     Arc::new(store.clone()),
//!     DeliveryTargets::transport(Arc::new(transport.clone())),
//!     OutboxConfig::default(),
//! )?;
//!
//! let report = processor.run_cycle().await?;
//! assert_eq!(report.fetched, 0);
//! # Ok(())
//! # }
//! ```

use chrono::{DateTime, Utc};
use composable_outbox_core::environment::Clock;

mod event_store;
mod handlers;
mod transport;

pub use event_store::InMemoryEventStore;
pub use handlers::{RecordingHandler, SharedRecorder};
pub use transport::{Delivered, InMemoryTransport};

/// Mock implementations of Environment traits
pub mod mocks {
    use super::{Clock, DateTime, Utc};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use composable_outbox_testing::mocks::FixedClock;
    /// use composable_outbox_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// let time1 = clock.now();
    /// let time2 = clock.now();
    /// assert_eq!(time1, time2); // Always the same!
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Clock that only moves when told to. Used to expire leases.
    #[derive(Debug)]
    pub struct ManualClock {
        time: Mutex<DateTime<Utc>>,
    }

    impl ManualClock {
        /// Clock stopped at `time`.
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self {
                time: Mutex::new(time),
            }
        }

        /// Move the clock forward.
        ///
        /// # Panics
        ///
        /// Panics if the lock is poisoned or `by` does not fit a `chrono::Duration`.
        #[allow(clippy::unwrap_used, clippy::expect_used)]
        pub fn advance(&self, by: Duration) {
            let delta = chrono::Duration::from_std(by).expect("duration out of range");
            *self.time.lock().unwrap() += delta;
        }
    }

    impl Clock for ManualClock {
        #[allow(clippy::unwrap_used)]
        fn now(&self) -> DateTime<Utc> {
            *self.time.lock().unwrap()
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    ///
    /// # Panics
    ///
    /// This function will panic if the hardcoded timestamp fails to parse,
    /// which should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }
}

/// Test data builders.
pub mod helpers {
    use super::{DateTime, Utc};
    use composable_outbox_core::StoredEvent;

    /// Pending `OrderPlaced.v1` record for aggregate `order_id`, created at `created_at`.
    #[must_use]
    pub fn order_placed(order_id: &str, created_at: DateTime<Utc>) -> StoredEvent {
        let payload = serde_json::json!({ "order_id": order_id }).to_string();
        StoredEvent::new("OrderPlaced.v1", payload, created_at, created_at)
            .with_aggregate("order", order_id)
    }

    /// `count` pending records created one millisecond apart, oldest first.
    #[must_use]
    pub fn order_sequence(count: usize, start: DateTime<Utc>) -> Vec<StoredEvent> {
        (0..count)
            .map(|i| {
                let offset = chrono::Duration::milliseconds(i64::try_from(i).unwrap_or(i64::MAX));
                order_placed(&format!("order-{i}"), start + offset)
            })
            .collect()
    }

    /// Install a `tracing` subscriber honouring `RUST_LOG`. Safe to call repeatedly.
    pub fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }
}

/// Property-based testing utilities using proptest.
pub mod properties {
    use proptest::prelude::*;

    /// Creation offsets in milliseconds, possibly repeated and unordered.
    pub fn creation_offsets(max_len: usize) -> impl Strategy<Value = Vec<i64>> {
        prop::collection::vec(0_i64..10_000, 1..=max_len)
    }

    /// Event type tags drawn from a small vocabulary.
    pub fn event_type() -> impl Strategy<Value = String> {
        prop::sample::select(vec![
            "OrderPlaced.v1".to_string(),
            "OrderShipped.v1".to_string(),
            "PaymentCaptured.v1".to_string(),
        ])
    }
}

pub use mocks::{FixedClock, ManualClock, test_clock};
