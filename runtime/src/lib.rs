//! # Composable Outbox Runtime
//!
//! Runtime of the Composable Outbox event delivery engine.
//!
//! ## Core Components
//!
//! - **[`EventBus`](bus::EventBus)**: façade that delivers immediately, persists to the outbox, or both
//! - **[`OutboxProcessor`](processor::OutboxProcessor)**: background task that drains the outbox
//! - **[`InProcessPublisher`](dispatcher::InProcessPublisher)**: handler registry for in-process delivery
//! - **[`OutboxConfig`](config::OutboxConfig)**: tunables, from code or environment
//!
//! ## Example
//!
//! ```no_run
//! use composable_outbox_runtime::bus::EventBus;
//! use composable_outbox_runtime::config::{DeliveryMode, OutboxConfig};
//! use composable_outbox_runtime::dispatcher::InProcessPublisher;
//! # use std::sync::Arc;
//! # async fn example(
//! #     store: Arc<dyn composable_outbox_core::EventStore>,
//! #     transport: Arc<dyn composable_outbox_core::MessageTransport>,
//! # ) -> Result<(), Box<dyn std::error::Error>> {
//! let config = OutboxConfig::from_env()?;
//!
//! let bus = EventBus::builder()
//!     .mode(config.mode)
//!     .store(store)
//!     .publisher(Arc::new(InProcessPublisher::new()))
//!     .transport(transport)
//!     .build()?;
//!
//! let mut processor = bus.processor(config)?;
//! processor.start()?;
//!
//! // bus.publish(&event).await?;
//!
//! processor.stop().await?;
//! # Ok(())
//! # }
//! ```

/// Event bus façade
pub mod bus;

/// Outbox configuration
pub mod config;

/// In-process dispatch
pub mod dispatcher;

/// Runtime error types
pub mod error;

/// Prometheus metrics for observability
pub mod metrics;

/// Background outbox processor
pub mod processor;

/// Retry logic with exponential backoff
pub mod retry;

/// Transport destination routing
pub mod router;

pub use bus::{EventBus, EventBusBuilder};
pub use config::{DeliveryMode, OutboxConfig, StoreBackend};
pub use dispatcher::{EventHandler, HandlerError, InProcessPublisher};
pub use error::{BusError, ProcessorError};
pub use processor::{CycleReport, DeliveryTargets, OutboxProcessor};
pub use router::TopicRouter;
