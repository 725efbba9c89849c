//! Outbox configuration.
//!
//! [`OutboxConfig`] holds every tunable of the event bus and the outbox
//! processor. It can be built in code with the `with_*` setters or read from
//! the environment with [`OutboxConfig::from_env`].
//!
//! # Environment Variables
//!
//! | Variable | Default | Meaning |
//! |----------|---------|---------|
//! | `OUTBOX_PROCESSING_INTERVAL_SECS` | `10` | Sleep between processor cycles |
//! | `OUTBOX_BATCH_SIZE` | `100` | Events fetched per cycle |
//! | `OUTBOX_MAX_RETRY_ATTEMPTS` | `3` | Failed attempts before terminal failure |
//! | `OUTBOX_DELIVERY_TIMEOUT_SECS` | `30` | Bound on each delivery attempt |
//! | `OUTBOX_CLAIM_LEASE_SECS` | `60` | Row lease per processor, at most `86400`; `0` disables leasing |
//! | `OUTBOX_DELIVERY_MODE` | `hybrid` | `in_memory`, `persistent` or `hybrid` |
//! | `OUTBOX_STORE_BACKEND` | `postgres` | `in_memory` or `postgres` |

use crate::retry::RetryPolicy;
use composable_outbox_core::ConfigurationError;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Upper bound on [`OutboxConfig::claim_lease`].
pub const MAX_CLAIM_LEASE: Duration = Duration::from_secs(24 * 60 * 60);

/// How [`EventBus::publish`](crate::bus::EventBus::publish) delivers an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryMode {
    /// In-process handlers only. No durability.
    InMemory,
    /// Outbox only. Delivered by the processor on its next cycle.
    Persistent,
    /// In-process handlers immediately, and the outbox for the transport.
    #[default]
    Hybrid,
}

impl DeliveryMode {
    /// Stable lowercase name, used in logs and metric labels.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::InMemory => "in_memory",
            Self::Persistent => "persistent",
            Self::Hybrid => "hybrid",
        }
    }

    /// Whether `publish` calls the in-process publisher.
    #[must_use]
    pub const fn delivers_immediately(&self) -> bool {
        matches!(self, Self::InMemory | Self::Hybrid)
    }

    /// Whether `publish` writes to the event store.
    #[must_use]
    pub const fn persists(&self) -> bool {
        matches!(self, Self::Persistent | Self::Hybrid)
    }
}

impl fmt::Display for DeliveryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeliveryMode {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "in_memory" | "inmemory" | "memory" => Ok(Self::InMemory),
            "persistent" => Ok(Self::Persistent),
            "hybrid" => Ok(Self::Hybrid),
            other => Err(invalid("OUTBOX_DELIVERY_MODE", format!("unknown mode '{other}'"))),
        }
    }
}

/// Which [`EventStore`](composable_outbox_core::EventStore) backend to wire up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreBackend {
    /// Process-local store. Not durable; for tests and local runs.
    InMemory,
    /// `PostgreSQL` (`composable-outbox-postgres`).
    #[default]
    Postgres,
}

impl FromStr for StoreBackend {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "in_memory" | "inmemory" | "memory" => Ok(Self::InMemory),
            "postgres" | "postgresql" => Ok(Self::Postgres),
            other => Err(invalid("OUTBOX_STORE_BACKEND", format!("unknown backend '{other}'"))),
        }
    }
}

/// Configuration for the event bus and the outbox processor.
///
/// # Example
///
/// ```
/// use composable_outbox_runtime::config::{DeliveryMode, OutboxConfig};
/// use std::time::Duration;
///
/// let config = OutboxConfig::default()
///     .with_processing_interval(Duration::from_secs(2))
///     .with_max_retry_attempts(5)
///     .with_mode(DeliveryMode::Persistent);
///
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxConfig {
    /// Sleep between processor cycles.
    pub processing_interval: Duration,
    /// Maximum events fetched per cycle.
    pub batch_size: usize,
    /// Failed attempts after which an event is terminally failed.
    pub max_retry_attempts: u32,
    /// Bound on each delivery attempt. A timeout counts as a failed attempt.
    pub delivery_timeout: Duration,
    /// Per-row lease taken by a processor on the events it fetched. `None` disables leasing.
    pub claim_lease: Option<Duration>,
    /// Delivery mode of the event bus.
    pub mode: DeliveryMode,
    /// Storage backend.
    pub store_backend: StoreBackend,
    /// Retry policy for `mark_published` / `mark_failed` writes.
    pub bookkeeping_retry: RetryPolicy,
    /// Stable processor identity used as lease owner. Generated when `None`.
    pub processor_id: Option<String>,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            processing_interval: Duration::from_secs(10),
            batch_size: 100,
            max_retry_attempts: 3,
            delivery_timeout: Duration::from_secs(30),
            claim_lease: Some(Duration::from_secs(60)),
            mode: DeliveryMode::default(),
            store_backend: StoreBackend::default(),
            bookkeeping_retry: RetryPolicy::default(),
            processor_id: None,
        }
    }
}

impl OutboxConfig {
    /// Read configuration from `OUTBOX_*` environment variables.
    ///
    /// Unset variables keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError::InvalidValue`] if a variable cannot be parsed
    /// or the resulting configuration is invalid.
    pub fn from_env() -> Result<Self, ConfigurationError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Same as [`OutboxConfig::from_env`].
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigurationError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(secs) = parse_var::<u64, _>(&lookup, "OUTBOX_PROCESSING_INTERVAL_SECS")? {
            config.processing_interval = Duration::from_secs(secs);
        }
        if let Some(size) = parse_var::<usize, _>(&lookup, "OUTBOX_BATCH_SIZE")? {
            config.batch_size = size;
        }
        if let Some(max) = parse_var::<u32, _>(&lookup, "OUTBOX_MAX_RETRY_ATTEMPTS")? {
            config.max_retry_attempts = max;
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, "OUTBOX_DELIVERY_TIMEOUT_SECS")? {
            config.delivery_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, "OUTBOX_CLAIM_LEASE_SECS")? {
            config.claim_lease = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(mode) = lookup("OUTBOX_DELIVERY_MODE") {
            config.mode = mode.parse()?;
        }
        if let Some(backend) = lookup("OUTBOX_STORE_BACKEND") {
            config.store_backend = backend.parse()?;
        }
        if let Some(id) = lookup("OUTBOX_PROCESSOR_ID") {
            config.processor_id = Some(id);
        }

        config.validate()?;
        Ok(config)
    }

    /// Check value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError::InvalidValue`] naming the offending key.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.batch_size == 0 {
            return Err(invalid("batch_size", "must be greater than 0"));
        }
        if self.max_retry_attempts == 0 {
            return Err(invalid("max_retry_attempts", "must be greater than 0"));
        }
        if self.delivery_timeout.is_zero() {
            return Err(invalid("delivery_timeout", "must be greater than 0"));
        }
        if let Some(lease) = self.claim_lease {
            if lease > MAX_CLAIM_LEASE {
                return Err(invalid("claim_lease", "must be at most 24 hours"));
            }
            if lease < self.attempt_budget() {
                return Err(invalid(
                    "claim_lease",
                    "must cover the delivery timeout plus bookkeeping retry backoff",
                ));
            }
        }
        Ok(())
    }

    /// Longest time one event can hold a claim: a delivery attempt that runs
    /// into the timeout followed by a bookkeeping write that uses every retry.
    #[must_use]
    pub fn attempt_budget(&self) -> Duration {
        self.delivery_timeout
            .saturating_add(self.bookkeeping_retry.max_total_delay())
    }

    /// Set the processing interval.
    #[must_use]
    pub const fn with_processing_interval(mut self, interval: Duration) -> Self {
        self.processing_interval = interval;
        self
    }

    /// Set the batch size.
    #[must_use]
    pub const fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Set the retry cap.
    #[must_use]
    pub const fn with_max_retry_attempts(mut self, max: u32) -> Self {
        self.max_retry_attempts = max;
        self
    }

    /// Set the per-attempt delivery timeout.
    #[must_use]
    pub const fn with_delivery_timeout(mut self, timeout: Duration) -> Self {
        self.delivery_timeout = timeout;
        self
    }

    /// Set (or disable with `None`) the row lease.
    #[must_use]
    pub const fn with_claim_lease(mut self, lease: Option<Duration>) -> Self {
        self.claim_lease = lease;
        self
    }

    /// Set the delivery mode.
    #[must_use]
    pub const fn with_mode(mut self, mode: DeliveryMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the storage backend.
    #[must_use]
    pub const fn with_store_backend(mut self, backend: StoreBackend) -> Self {
        self.store_backend = backend;
        self
    }

    /// Set the bookkeeping retry policy.
    #[must_use]
    pub fn with_bookkeeping_retry(mut self, policy: RetryPolicy) -> Self {
        self.bookkeeping_retry = policy;
        self
    }

    /// Set the processor identity.
    #[must_use]
    pub fn with_processor_id(mut self, id: impl Into<String>) -> Self {
        self.processor_id = Some(id.into());
        self
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Result<Option<T>, ConfigurationError>
where
    T: FromStr,
    T::Err: fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|raw| raw.trim().parse::<T>().map_err(|e| invalid(key, e.to_string())))
        .transpose()
}

fn invalid(key: &str, reason: impl Into<String>) -> ConfigurationError {
    ConfigurationError::InvalidValue {
        key: key.to_string(),
        reason: reason.into(),
    }
}
