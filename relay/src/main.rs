//! Outbox relay.
//!
//! Runs an outbox processor as its own process: it polls the outbox table
//! and forwards pending events to Redpanda until interrupted.
//!
//! # Environment
//!
//! | Variable | Required | Meaning |
//! |----------|----------|---------|
//! | `DATABASE_URL` | with `postgres` backend | PostgreSQL connection string |
//! | `REDPANDA_BROKERS` | yes | Bootstrap servers |
//! | `OUTBOX_DEFAULT_TOPIC` | no | Topic for events without a route or aggregate type |
//! | `OUTBOX_ROUTES` | no | `EventType=topic` pairs, comma-separated |
//! | `OUTBOX_RUN_MIGRATIONS` | no | `false` skips creating the outbox table |
//! | `METRICS_ADDR` | no | Serve Prometheus metrics, e.g. `0.0.0.0:9090` |
//!
//! Processor tuning comes from the `OUTBOX_*` variables read by `OutboxConfig::from_env`.
//!
//! ```bash
//! DATABASE_URL=postgres://localhost/app REDPANDA_BROKERS=localhost:9092 \
//!     RUST_LOG=info outbox-relay
//! ```

use anyhow::{Context, Result, bail};
use composable_outbox_core::EventStore;
use composable_outbox_postgres::PostgresEventStore;
use composable_outbox_redpanda::RedpandaTransport;
use composable_outbox_runtime::config::{OutboxConfig, StoreBackend};
use composable_outbox_runtime::metrics::MetricsServer;
use composable_outbox_runtime::processor::{DeliveryTargets, OutboxProcessor};
use composable_outbox_runtime::router::TopicRouter;
use composable_outbox_testing::InMemoryEventStore;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,composable_outbox=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = OutboxConfig::from_env().context("invalid OUTBOX_* configuration")?;

    if let Ok(addr) = std::env::var("METRICS_ADDR") {
        let addr = addr.parse().context("METRICS_ADDR is not a socket address")?;
        MetricsServer::new(addr).serve()?;
    }

    let store = open_store(&config).await?;

    let brokers = std::env::var("REDPANDA_BROKERS").context("REDPANDA_BROKERS must be set")?;
    let mut transport = RedpandaTransport::builder().brokers(brokers);
    if let Ok(topic) = std::env::var("OUTBOX_DEFAULT_TOPIC") {
        transport = transport.default_topic(topic);
    }
    let transport = Arc::new(transport.build()?);

    let router = parse_routes(&std::env::var("OUTBOX_ROUTES").unwrap_or_default())?;
    let targets = DeliveryTargets::transport(transport).with_router(router);

    let mut processor = OutboxProcessor::new(store, targets, config)?;
    processor.start()?;
    tracing::info!(processor_id = processor.id(), "Outbox relay running");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    tracing::info!("Shutdown requested, finishing current cycle");
    processor.stop().await?;
    tracing::info!("Outbox relay stopped");
    Ok(())
}

async fn open_store(config: &OutboxConfig) -> Result<Arc<dyn EventStore>> {
    match config.store_backend {
        StoreBackend::Postgres => {
            let url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
            let store = PostgresEventStore::new(&url).await?;
            if std::env::var("OUTBOX_RUN_MIGRATIONS").as_deref() != Ok("false") {
                store.migrate().await?;
            }
            Ok(Arc::new(store))
        }
        StoreBackend::InMemory => {
            tracing::warn!("Using the in-memory store: nothing is durable and the outbox starts empty");
            Ok(Arc::new(InMemoryEventStore::new()))
        }
    }
}

/// Parse `OrderPlaced.v1=orders,PaymentCaptured.v1=payments`.
fn parse_routes(routes: &str) -> Result<TopicRouter> {
    let mut router = TopicRouter::new();
    for pair in routes.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let Some((event_type, topic)) = pair.split_once('=') else {
            bail!("OUTBOX_ROUTES entry '{pair}' is not EventType=topic");
        };
        let (event_type, topic) = (event_type.trim(), topic.trim());
        if event_type.is_empty() || topic.is_empty() {
            bail!("OUTBOX_ROUTES entry '{pair}' is not EventType=topic");
        }
        router = router.route(event_type, topic);
    }
    Ok(router)
}
