//! `PostgreSQL` event store for the Composable Outbox.
//!
//! [`PostgresEventStore`] implements the `EventStore` trait from
//! `composable-outbox-core` on a single `outbox_events` table. It uses sqlx
//! with a connection pool and supports:
//!
//! - Atomic batch inserts (one transaction per batch)
//! - Row leases for concurrent processors (`FOR UPDATE SKIP LOCKED`)
//! - Idempotent status transitions
//!
//! The schema lives in `migrations/0001_create_outbox_events.sql` and can be
//! applied with [`PostgresEventStore::migrate`].
//!
//! # Example
//!
//! ```no_run
//! use composable_outbox_postgres::PostgresEventStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = PostgresEventStore::new("postgres://localhost/app").await?;
//! store.migrate().await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use chrono::{DateTime, Utc};
use composable_outbox_core::event_store::{EventStore, EventStoreError, StoreFuture};
use composable_outbox_core::{EventId, StoredEvent};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use std::time::Duration;
use uuid::Uuid;

/// Schema of the `outbox_events` table.
pub const MIGRATION: &str = include_str!("../migrations/0001_create_outbox_events.sql");

/// Columns selected for every [`StoredEvent`] query.
const COLUMNS: &str = "seq, id, event_type, payload, aggregate_id, aggregate_type, metadata, \
     occurred_at, created_at, is_published, published_at, retry_count, is_failed, \
     permanently_failed, error_message, claimed_by, claimed_until";

/// Postgres unique-violation SQLSTATE.
const UNIQUE_VIOLATION: &str = "23505";

/// `PostgreSQL`-backed outbox store.
///
/// Cheap to clone; clones share the pool.
#[derive(Clone, Debug)]
pub struct PostgresEventStore {
    pool: PgPool,
}

impl PostgresEventStore {
    /// Connect with a pool of up to 10 connections.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::Unavailable`] if the database cannot be reached.
    pub async fn new(database_url: &str) -> Result<Self, EventStoreError> {
        Self::connect(database_url, 10).await
    }

    /// Connect with an explicit pool size.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::Unavailable`] if the database cannot be reached.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, EventStoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await
            .map_err(|e| EventStoreError::Unavailable(e.to_string()))?;

        tracing::info!(max_connections, "Connected to PostgreSQL outbox store");
        Ok(Self { pool })
    }

    /// Wrap an existing pool.
    #[must_use]
    pub const fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying pool, for writing business rows and outbox rows in one transaction.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the `outbox_events` table and its indexes if missing.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::DatabaseError`] if a statement fails.
    pub async fn migrate(&self) -> Result<(), EventStoreError> {
        for statement in MIGRATION.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| map_error("migrate", &e))?;
        }
        tracing::info!("Outbox schema is up to date");
        Ok(())
    }

    /// Insert `event` inside a caller-owned transaction.
    ///
    /// This is the transactional half of the outbox: commit it together with
    /// the business change and the event is durable exactly when the change is.
    ///
    /// # Errors
    ///
    /// - [`EventStoreError::DuplicateEvent`] if the id already exists
    /// - [`EventStoreError::DatabaseError`] on any other failure
    pub async fn save_in_transaction(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        event: &StoredEvent,
    ) -> Result<(), EventStoreError> {
        insert(&mut **tx, event).await
    }

    async fn fetch(
        &self,
        operation: &'static str,
        query: sqlx::query::Query<'_, sqlx::Postgres, sqlx::postgres::PgArguments>,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_error(operation, &e))?;
        rows.iter().map(row_to_event).collect()
    }

    /// Apply a guarded status update; an unmatched row is a no-op if it exists.
    async fn transition(
        &self,
        operation: &'static str,
        id: EventId,
        query: sqlx::query::Query<'_, sqlx::Postgres, sqlx::postgres::PgArguments>,
    ) -> Result<(), EventStoreError> {
        let result = query
            .execute(&self.pool)
            .await
            .map_err(|e| map_error(operation, &e))?;

        if result.rows_affected() > 0 {
            return Ok(());
        }

        let exists: bool = sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM outbox_events WHERE id = $1)")
            .bind(*id.as_uuid())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_error(operation, &e))?;

        if exists {
            tracing::debug!(event_id = %id, operation, "Status transition was a no-op");
            Ok(())
        } else {
            Err(EventStoreError::EventNotFound(id))
        }
    }
}

impl EventStore for PostgresEventStore {
    fn save_event(&self, event: StoredEvent) -> StoreFuture<'_, ()> {
        Box::pin(async move { insert(&self.pool, &event).await })
    }

    fn save_events(&self, events: Vec<StoredEvent>) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            if events.is_empty() {
                return Ok(());
            }

            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|e| map_error("save_events", &e))?;

            for event in &events {
                insert(&mut *tx, event).await?;
            }

            tx.commit().await.map_err(|e| map_error("save_events", &e))?;
            tracing::debug!(count = events.len(), "Saved event batch");
            Ok(())
        })
    }

    fn get_unpublished(&self, batch_size: usize) -> StoreFuture<'_, Vec<StoredEvent>> {
        Box::pin(async move {
            let sql = format!(
                "SELECT {COLUMNS} FROM outbox_events \
                 WHERE NOT is_published AND NOT permanently_failed \
                 ORDER BY created_at, seq LIMIT $1"
            );
            self.fetch("get_unpublished", sqlx::query(&sql).bind(limit(batch_size)))
                .await
        })
    }

    fn claim_unpublished(
        &self,
        batch_size: usize,
        owner: &str,
        lease: Duration,
    ) -> StoreFuture<'_, Vec<StoredEvent>> {
        let owner = owner.to_string();
        Box::pin(async move {
            let sql = format!(
                r"
                WITH claimable AS (
                    SELECT id AS claim_id FROM outbox_events
                    WHERE NOT is_published AND NOT permanently_failed
                      AND (claimed_by IS NULL OR claimed_by = $2
                           OR claimed_until IS NULL OR claimed_until <= now())
                    ORDER BY created_at, seq
                    LIMIT $1
                    FOR UPDATE SKIP LOCKED
                )
                UPDATE outbox_events
                SET claimed_by = $2,
                    claimed_until = now() + make_interval(secs => $3)
                FROM claimable
                WHERE outbox_events.id = claimable.claim_id
                RETURNING {COLUMNS}
                "
            );

            let rows = sqlx::query(&sql)
                .bind(limit(batch_size))
                .bind(&owner)
                .bind(lease.as_secs_f64())
                .fetch_all(&self.pool)
                .await
                .map_err(|e| map_error("claim_unpublished", &e))?;

            // UPDATE ... RETURNING does not preserve the CTE order.
            let mut claimed = rows
                .iter()
                .map(|row| -> Result<(i64, StoredEvent), EventStoreError> {
                    Ok((row.try_get("seq").map_err(decode_error)?, row_to_event(row)?))
                })
                .collect::<Result<Vec<_>, _>>()?;
            claimed.sort_by_key(|(seq, event)| (event.created_at, *seq));

            Ok(claimed.into_iter().map(|(_, event)| event).collect())
        })
    }

    fn mark_published(&self, id: EventId) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let query = sqlx::query(
                r"
                UPDATE outbox_events
                SET is_published = TRUE,
                    published_at = now(),
                    is_failed = FALSE,
                    claimed_by = NULL,
                    claimed_until = NULL
                WHERE id = $1 AND NOT is_published AND NOT permanently_failed
                ",
            )
            .bind(*id.as_uuid());
            self.transition("mark_published", id, query).await
        })
    }

    fn mark_failed(&self, id: EventId, error_message: String) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let query = sqlx::query(
                r"
                UPDATE outbox_events
                SET retry_count = retry_count + 1,
                    is_failed = TRUE,
                    error_message = $2,
                    claimed_by = NULL,
                    claimed_until = NULL
                WHERE id = $1 AND NOT is_published AND NOT permanently_failed
                ",
            )
            .bind(*id.as_uuid())
            .bind(error_message);
            self.transition("mark_failed", id, query).await
        })
    }

    fn mark_permanently_failed(&self, id: EventId, reason: String) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let query = sqlx::query(
                r"
                UPDATE outbox_events
                SET permanently_failed = TRUE,
                    is_failed = TRUE,
                    error_message = $2,
                    claimed_by = NULL,
                    claimed_until = NULL
                WHERE id = $1 AND NOT is_published
                ",
            )
            .bind(*id.as_uuid())
            .bind(reason);
            self.transition("mark_permanently_failed", id, query).await?;

            metrics::counter!("outbox_store_permanently_failed_total").increment(1);
            Ok(())
        })
    }

    fn get_by_aggregate_id(&self, aggregate_id: &str) -> StoreFuture<'_, Vec<StoredEvent>> {
        let aggregate_id = aggregate_id.to_string();
        Box::pin(async move {
            let sql = format!(
                "SELECT {COLUMNS} FROM outbox_events WHERE aggregate_id = $1 ORDER BY occurred_at, seq"
            );
            self.fetch("get_by_aggregate_id", sqlx::query(&sql).bind(aggregate_id))
                .await
        })
    }

    fn get_by_time_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreFuture<'_, Vec<StoredEvent>> {
        Box::pin(async move {
            let sql = format!(
                "SELECT {COLUMNS} FROM outbox_events \
                 WHERE occurred_at >= $1 AND occurred_at < $2 ORDER BY occurred_at, seq"
            );
            self.fetch("get_by_time_range", sqlx::query(&sql).bind(start).bind(end))
                .await
        })
    }

    fn get_by_type(&self, event_type: &str) -> StoreFuture<'_, Vec<StoredEvent>> {
        let event_type = event_type.to_string();
        Box::pin(async move {
            let sql = format!(
                "SELECT {COLUMNS} FROM outbox_events WHERE event_type = $1 ORDER BY occurred_at, seq"
            );
            self.fetch("get_by_type", sqlx::query(&sql).bind(event_type))
                .await
        })
    }

    fn get_permanently_failed(&self, limit_rows: usize) -> StoreFuture<'_, Vec<StoredEvent>> {
        Box::pin(async move {
            let sql = format!(
                "SELECT {COLUMNS} FROM outbox_events WHERE permanently_failed \
                 ORDER BY created_at, seq LIMIT $1"
            );
            self.fetch("get_permanently_failed", sqlx::query(&sql).bind(limit(limit_rows)))
                .await
        })
    }
}

async fn insert<'e, E>(executor: E, event: &StoredEvent) -> Result<(), EventStoreError>
where
    E: sqlx::Executor<'e, Database = sqlx::Postgres>,
{
    let retry_count = i32::try_from(event.retry_count)
        .map_err(|e| EventStoreError::SerializationError(format!("retry_count: {e}")))?;

    sqlx::query(
        r"
        INSERT INTO outbox_events (
            id, event_type, payload, aggregate_id, aggregate_type, metadata,
            occurred_at, created_at, is_published, published_at, retry_count,
            is_failed, permanently_failed, error_message
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
        ",
    )
    .bind(*event.id.as_uuid())
    .bind(&event.event_type)
    .bind(&event.payload)
    .bind(&event.aggregate_id)
    .bind(&event.aggregate_type)
    .bind(&event.metadata)
    .bind(event.occurred_at)
    .bind(event.created_at)
    .bind(event.is_published)
    .bind(event.published_at)
    .bind(retry_count)
    .bind(event.is_failed)
    .bind(event.permanently_failed)
    .bind(&event.error_message)
    .execute(executor)
    .await
    .map_err(|e| match &e {
        sqlx::Error::Database(db) if db.code().as_deref() == Some(UNIQUE_VIOLATION) => {
            EventStoreError::DuplicateEvent(event.id)
        }
        _ => map_error("save_event", &e),
    })?;

    metrics::counter!("outbox_store_inserted_total").increment(1);
    Ok(())
}

fn row_to_event(row: &PgRow) -> Result<StoredEvent, EventStoreError> {
    let retry_count: i32 = row.try_get("retry_count").map_err(decode_error)?;

    Ok(StoredEvent {
        id: EventId::from_uuid(row.try_get::<Uuid, _>("id").map_err(decode_error)?),
        event_type: row.try_get("event_type").map_err(decode_error)?,
        payload: row.try_get("payload").map_err(decode_error)?,
        aggregate_id: row.try_get("aggregate_id").map_err(decode_error)?,
        aggregate_type: row.try_get("aggregate_type").map_err(decode_error)?,
        metadata: row.try_get("metadata").map_err(decode_error)?,
        occurred_at: row.try_get("occurred_at").map_err(decode_error)?,
        created_at: row.try_get("created_at").map_err(decode_error)?,
        is_published: row.try_get("is_published").map_err(decode_error)?,
        published_at: row.try_get("published_at").map_err(decode_error)?,
        retry_count: u32::try_from(retry_count)
            .map_err(|e| EventStoreError::SerializationError(format!("retry_count: {e}")))?,
        is_failed: row.try_get("is_failed").map_err(decode_error)?,
        permanently_failed: row.try_get("permanently_failed").map_err(decode_error)?,
        error_message: row.try_get("error_message").map_err(decode_error)?,
        claimed_by: row.try_get("claimed_by").map_err(decode_error)?,
        claimed_until: row.try_get("claimed_until").map_err(decode_error)?,
    })
}

fn decode_error(e: sqlx::Error) -> EventStoreError {
    EventStoreError::SerializationError(e.to_string())
}

/// Classify a sqlx error. Connection-level failures are `Unavailable`.
fn map_error(operation: &'static str, e: &sqlx::Error) -> EventStoreError {
    metrics::counter!("outbox_store_errors_total", "operation" => operation).increment(1);
    tracing::warn!(operation, error = %e, "Outbox store query failed");

    match e {
        sqlx::Error::Io(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed
        | sqlx::Error::Tls(_) => EventStoreError::Unavailable(e.to_string()),
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            EventStoreError::SerializationError(e.to_string())
        }
        _ => EventStoreError::DatabaseError(e.to_string()),
    }
}

fn limit(rows: usize) -> i64 {
    i64::try_from(rows).unwrap_or(i64::MAX)
}
