//! Background outbox processor.
//!
//! The processor is the only component that turns persisted events into
//! deliveries. It polls the [`EventStore`] on a fixed interval, hands each
//! pending event to its [`DeliveryTargets`], and records the outcome.
//!
//! # Lifecycle
//!
//! ```text
//!            start()                    stop()
//!  Stopped ───────────► Running ───────────────► Stopped
//!                          │
//!                          ▼
//!          ┌──── sleep(processing_interval) ◄───┐
//!          │                                    │
//!          ▼                                    │
//!     claim / fetch ──► deliver each ──► mark ──┘
//! ```
//!
//! Iterations never overlap, including manual [`OutboxProcessor::run_cycle`]
//! calls made while the loop runs. A stop request aborts the sleep immediately; a
//! delivery already in flight finishes, bounded by `delivery_timeout`.
//!
//! # Per-event state machine
//!
//! - `retry_count >= max_retry_attempts`: `mark_permanently_failed`, not delivered
//! - delivery succeeded: `mark_published`
//! - delivery failed or timed out: `mark_failed`, retried next cycle
//!
//! With a claim lease, an attempt only starts if it and its bookkeeping can
//! finish before the lease expires. The rest of the batch stays claimed
//! until expiry and is picked up again by whichever processor claims it next.
//!
//! Delivery is at-least-once. A crash between delivery and `mark_published`
//! redelivers the event, so consumers deduplicate on the event id.

use crate::config::OutboxConfig;
use crate::error::ProcessorError;
use crate::metrics::ProcessorMetrics;
use crate::retry::retry_with_predicate;
use crate::router::TopicRouter;
use composable_outbox_core::{
    ConfigurationError, DeliveryError, EventPublisher, EventStore, EventStoreError,
    MessageTransport, StoredEvent, TerminalFailureError, TransportMessage,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;

/// Where the processor delivers events.
///
/// When both a transport and a publisher are set, an attempt succeeds only if
/// both accept the event. The transport is tried first.
#[derive(Clone, Default)]
pub struct DeliveryTargets {
    /// Distributed transport.
    pub transport: Option<Arc<dyn MessageTransport>>,
    /// In-process handlers.
    pub publisher: Option<Arc<dyn EventPublisher>>,
    /// Destination resolution for the transport.
    pub router: TopicRouter,
}

impl DeliveryTargets {
    /// Deliver to a transport only.
    #[must_use]
    pub fn transport(transport: Arc<dyn MessageTransport>) -> Self {
        Self {
            transport: Some(transport),
            ..Self::default()
        }
    }

    /// Deliver to in-process handlers only.
    #[must_use]
    pub fn in_process(publisher: Arc<dyn EventPublisher>) -> Self {
        Self {
            publisher: Some(publisher),
            ..Self::default()
        }
    }

    /// Deliver to a transport and to in-process handlers.
    #[must_use]
    pub fn both(transport: Arc<dyn MessageTransport>, publisher: Arc<dyn EventPublisher>) -> Self {
        Self {
            transport: Some(transport),
            publisher: Some(publisher),
            router: TopicRouter::default(),
        }
    }

    /// Replace the topic router.
    #[must_use]
    pub fn with_router(mut self, router: TopicRouter) -> Self {
        self.router = router;
        self
    }

    /// Whether no target is configured.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.transport.is_none() && self.publisher.is_none()
    }
}

impl std::fmt::Debug for DeliveryTargets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryTargets")
            .field("transport", &self.transport.is_some())
            .field("publisher", &self.publisher.is_some())
            .field("router", &self.router)
            .finish()
    }
}

/// Outcome of one processing cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Events returned by the store.
    pub fetched: usize,
    /// Events delivered and marked published.
    pub published: usize,
    /// Events whose attempt failed.
    pub failed: usize,
    /// Events moved to terminal failure.
    pub terminally_failed: usize,
    /// Claimed events left untouched because the lease could not cover another attempt.
    pub deferred: usize,
}

/// State shared between the handle and the spawned task.
struct Worker {
    id: String,
    store: Arc<dyn EventStore>,
    targets: DeliveryTargets,
    config: OutboxConfig,
    cycle: Mutex<()>,
}

struct RunningTask {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Polls the outbox and delivers pending events.
///
/// # Example
///
/// ```no_run
/// use composable_outbox_runtime::config::OutboxConfig;
/// use composable_outbox_runtime::processor::{DeliveryTargets, OutboxProcessor};
/// # use std::sync::Arc;
/// # async fn example(
/// #     store: Arc<dyn composable_outbox_core::EventStore>,
/// #     transport: Arc<dyn composable_outbox_core::MessageTransport>,
/// # ) -> Result<(), Box<dyn std::error::Error>> {
/// let mut processor = OutboxProcessor::new(
///     store,
///     DeliveryTargets::transport(transport),
///     OutboxConfig::default(),
/// )?;
///
/// processor.start()?;
/// // ...
/// processor.stop().await?;
/// # Ok(())
/// # }
/// ```
pub struct OutboxProcessor {
    worker: Arc<Worker>,
    running: Option<RunningTask>,
}

impl OutboxProcessor {
    /// Create a stopped processor.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError`] if `config` is invalid or `targets` is empty.
    pub fn new(
        store: Arc<dyn EventStore>,
        targets: DeliveryTargets,
        config: OutboxConfig,
    ) -> Result<Self, ConfigurationError> {
        config.validate()?;
        if targets.is_empty() {
            return Err(ConfigurationError::InvalidValue {
                key: "targets".to_string(),
                reason: "a transport or an event publisher is required".to_string(),
            });
        }

        let id = config
            .processor_id
            .clone()
            .unwrap_or_else(|| format!("outbox-processor-{}", uuid::Uuid::new_v4()));

        Ok(Self {
            worker: Arc::new(Worker {
                id,
                store,
                targets,
                config,
                cycle: Mutex::new(()),
            }),
            running: None,
        })
    }

    /// Processor identity, used as lease owner.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.worker.id
    }

    /// Whether the background task is alive.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running
            .as_ref()
            .is_some_and(|task| !task.handle.is_finished())
    }

    /// Spawn the polling loop on the current tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessorError::AlreadyRunning`] if the loop is already running.
    pub fn start(&mut self) -> Result<(), ProcessorError> {
        if self.is_running() {
            return Err(ProcessorError::AlreadyRunning);
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let worker = Arc::clone(&self.worker);
        let handle = tokio::spawn(worker.run(shutdown_rx));

        tracing::info!(
            processor_id = %self.worker.id,
            interval_ms = self.worker.config.processing_interval.as_millis(),
            batch_size = self.worker.config.batch_size,
            "Outbox processor started"
        );

        self.running = Some(RunningTask { shutdown, handle });
        Ok(())
    }

    /// Signal the loop to stop and wait for it to finish.
    ///
    /// # Errors
    ///
    /// - [`ProcessorError::NotRunning`] if the loop was never started
    /// - [`ProcessorError::TaskFailed`] if the task panicked
    pub async fn stop(&mut self) -> Result<(), ProcessorError> {
        let task = self.running.take().ok_or(ProcessorError::NotRunning)?;

        // The receiver is gone if the task already exited.
        let _ = task.shutdown.send(true);
        task.handle.await?;

        tracing::info!(processor_id = %self.worker.id, "Outbox processor stopped");
        Ok(())
    }

    /// Run one fetch-and-deliver pass.
    ///
    /// Waits for a pass of the background loop to finish first, so passes of
    /// one processor never overlap.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError`] if the fetch fails. Failures of individual
    /// deliveries and of bookkeeping writes are recorded, not returned.
    pub async fn run_cycle(&self) -> Result<CycleReport, EventStoreError> {
        self.worker.run_cycle().await
    }
}

impl Drop for OutboxProcessor {
    fn drop(&mut self) {
        if let Some(task) = self.running.take() {
            let _ = task.shutdown.send(true);
        }
    }
}

impl Worker {
    async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        while !*shutdown.borrow() {
            tokio::select! {
                _ = shutdown.changed() => {
                    tracing::debug!(processor_id = %self.id, "Shutdown signal received");
                    break;
                }
                () = tokio::time::sleep(self.config.processing_interval) => {}
            }

            match self.run_cycle().await {
                Ok(report) if report.fetched > 0 => {
                    tracing::info!(
                        processor_id = %self.id,
                        fetched = report.fetched,
                        published = report.published,
                        failed = report.failed,
                        terminally_failed = report.terminally_failed,
                        deferred = report.deferred,
                        "Outbox cycle completed"
                    );
                }
                Ok(_) => {}
                Err(e) => {
                    ProcessorMetrics::record_fetch_error();
                    tracing::error!(
                        processor_id = %self.id,
                        error = %e,
                        "Failed to fetch unpublished events, retrying next cycle"
                    );
                }
            }
        }
    }

    async fn run_cycle(&self) -> Result<CycleReport, EventStoreError> {
        let _cycle = self.cycle.lock().await;
        let started = Instant::now();
        let batch_size = self.config.batch_size;
        let lease_deadline = self
            .config
            .claim_lease
            .and_then(|lease| started.checked_add(lease));

        let events = match self.config.claim_lease {
            Some(lease) => self.store.claim_unpublished(batch_size, &self.id, lease).await?,
            None => self.store.get_unpublished(batch_size).await?,
        };

        let mut report = CycleReport {
            fetched: events.len(),
            ..CycleReport::default()
        };

        for (position, event) in events.iter().enumerate() {
            if lease_deadline.is_some_and(|deadline| !self.lease_covers_attempt(deadline)) {
                report.deferred = events.len() - position;
                ProcessorMetrics::record_deferred(report.deferred);
                tracing::warn!(
                    processor_id = %self.id,
                    deferred = report.deferred,
                    "Claim lease too short for the rest of the batch, deferring to the next cycle"
                );
                break;
            }

            if event.is_terminally_failed(self.config.max_retry_attempts) {
                self.fail_terminally(event).await;
                report.terminally_failed += 1;
                continue;
            }

            let attempt_started = Instant::now();
            match self.deliver(event).await {
                Ok(()) => {
                    ProcessorMetrics::record_published(&event.event_type, attempt_started.elapsed());
                    tracing::debug!(
                        processor_id = %self.id,
                        event_id = %event.id,
                        event_type = %event.event_type,
                        "Event delivered"
                    );
                    self.bookkeep("mark_published", event, || self.store.mark_published(event.id))
                        .await;
                    report.published += 1;
                }
                Err(e) => {
                    ProcessorMetrics::record_failed(&event.event_type);
                    tracing::warn!(
                        processor_id = %self.id,
                        event_id = %event.id,
                        event_type = %event.event_type,
                        retry_count = event.retry_count + 1,
                        error = %e,
                        "Event delivery failed"
                    );
                    let message = e.to_string();
                    self.bookkeep("mark_failed", event, || {
                        self.store.mark_failed(event.id, message.clone())
                    })
                    .await;
                    report.failed += 1;
                }
            }
        }

        ProcessorMetrics::record_cycle(report.fetched, started.elapsed());
        Ok(report)
    }

    /// Whether an attempt started now, plus its bookkeeping, ends before the lease does.
    fn lease_covers_attempt(&self, deadline: Instant) -> bool {
        let budget = self.config.attempt_budget();
        Instant::now()
            .checked_add(budget)
            .is_some_and(|finish| finish <= deadline)
    }

    async fn fail_terminally(&self, event: &StoredEvent) {
        let terminal = TerminalFailureError {
            event_id: event.id,
            retry_count: event.retry_count,
            max_retry_attempts: self.config.max_retry_attempts,
        };
        ProcessorMetrics::record_terminal_failure(&event.event_type);
        tracing::error!(
            processor_id = %self.id,
            event_id = %event.id,
            event_type = %event.event_type,
            retry_count = event.retry_count,
            last_error = event.error_message.as_deref().unwrap_or(""),
            "Event permanently failed"
        );

        let reason = terminal.to_string();
        self.bookkeep("mark_permanently_failed", event, || {
            self.store.mark_permanently_failed(event.id, reason.clone())
        })
        .await;
    }

    /// One delivery attempt against every configured target.
    async fn deliver(&self, event: &StoredEvent) -> Result<(), DeliveryError> {
        let timeout = self.config.delivery_timeout;
        let mut delivered = false;

        if let Some(transport) = &self.targets.transport {
            let message = TransportMessage::from(event);
            let attempt = match self.targets.router.resolve(event) {
                Some(destination) => transport.send(&destination, message),
                None => transport.publish(message),
            };
            tokio::time::timeout(timeout, attempt)
                .await
                .map_err(|_| DeliveryError::Timeout(timeout))??;
            delivered = true;
        }

        if let Some(publisher) = &self.targets.publisher {
            tokio::time::timeout(timeout, publisher.publish(event))
                .await
                .map_err(|_| DeliveryError::Timeout(timeout))??;
            delivered = true;
        }

        if delivered {
            Ok(())
        } else {
            Err(DeliveryError::NoTarget(event.event_type.clone()))
        }
    }

    /// Retry a status write on transient errors; log if it still fails.
    async fn bookkeep<F, Fut>(&self, operation: &'static str, event: &StoredEvent, write: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), EventStoreError>>,
    {
        let result = retry_with_predicate(
            &self.config.bookkeeping_retry,
            write,
            EventStoreError::is_transient,
        )
        .await;

        if let Err(e) = result {
            ProcessorMetrics::record_bookkeeping_error();
            tracing::error!(
                processor_id = %self.id,
                event_id = %event.id,
                operation,
                error = %e,
                "Failed to record delivery outcome"
            );
        }
    }
}
