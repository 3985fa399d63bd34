use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use event_storage::config::{AppConfig, BackendKind};
use event_storage::domain::counter::{self, CounterAggregate, CounterCommandHandler};
use event_storage::event_sourcing::{
    append_event_group, Backend, DurableEventStore, EventStore, GroupOptions, InMemoryEventStore,
    ListAggregateIdsOptions, ScyllaEventTable, StoreError,
};
use event_storage::messaging::{pour_aggregate_ids, InMemoryMessageChannel, PourOptions};
use event_storage::metrics::Metrics;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Default to INFO level, can be overridden with RUST_LOG env var
    // Example: RUST_LOG=debug cargo run
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,event_storage=debug")),
        )
        .init();

    tracing::info!("🚀 Starting event storage demo");

    let config = AppConfig::from_env()?;
    tracing::info!(backend = ?config.backend, "Loaded configuration");

    // === 1. Metrics ===
    let metrics = Arc::new(Metrics::new()?);

    // === 2. Backend ===
    let backend: Backend = match config.backend {
        BackendKind::Memory => InMemoryEventStore::new().with_metrics(metrics.clone()).into(),
        BackendKind::Scylla => {
            let table = ScyllaEventTable::connect(&config.scylla).await?;
            Backend::durable(DurableEventStore::new(table).with_metrics(metrics.clone()))
        }
    };

    let counters: EventStore<CounterAggregate> =
        EventStore::new("counters", backend.clone(), counter::reduce).with_metrics(metrics.clone());
    let handler = CounterCommandHandler::new(counters.clone());

    // === 3. Counter lifecycle ===
    tracing::info!("📝 Demonstrating counter lifecycle");
    let counter_id = uuid::Uuid::now_v7().to_string();
    handler.create(&counter_id).await?;
    for _ in 0..3 {
        handler.increment(&counter_id).await?;
    }
    let counter = handler.decrement(&counter_id).await?;
    tracing::info!(
        aggregate_id = %counter_id,
        version = counter.version,
        count = counter.count,
        "✅ Counter updated"
    );

    counters.save_snapshot(&counter).await?;
    handler.increment(&counter_id).await?;
    let output = counters.get_aggregate(&counter_id, None).await?;
    tracing::info!(
        aggregate_id = %counter_id,
        events_folded = output.event_count,
        count = output.aggregate.map(|c| c.count),
        "✅ Rebuilt from snapshot"
    );

    // A stale writer loses the race
    match counters.append_event(counter::incremented(&counter_id, 2)).await {
        Err(error @ StoreError::EventAlreadyExists { .. }) => {
            tracing::info!(error = %error, "✅ Stale append rejected")
        }
        other => tracing::warn!(
            result = ?other.map(|o| o.event.version),
            "Stale append was not rejected"
        ),
    }

    // === 4. Grouped write (in-memory backend only) ===
    if backend.supports_grouped_writes() {
        let left = uuid::Uuid::now_v7().to_string();
        let right = uuid::Uuid::now_v7().to_string();
        append_event_group(
            GroupOptions::default(),
            vec![
                counters.group_event(counter::created(&left)),
                counters.group_event(counter::created(&right)),
            ],
        )
        .await?;
        tracing::info!(left = %left, right = %right, "✅ Grouped creation committed");
    }

    // === 5. Pour aggregate ids ===
    let (channel, mut receiver) = InMemoryMessageChannel::new("counter-projection", 64);
    let consumer = tokio::spawn(async move {
        let mut received = 0usize;
        while let Some(message) = receiver.recv().await {
            tracing::debug!(
                aggregate_id = %message.aggregate_id,
                "Received aggregate exists message"
            );
            received += 1;
        }
        received
    });

    let report = pour_aggregate_ids(
        &counters,
        &channel,
        PourOptions {
            list_options: ListAggregateIdsOptions::with_limit(2),
            rate_limit: config.pour_rate_limit,
        },
    )
    .await?;
    drop(channel);
    let received = consumer.await?;
    tracing::info!(
        poured = report.poured_aggregate_id_count,
        received = received,
        "📬 Pour finished"
    );

    // === 6. Metrics ===
    tracing::info!("📊 Metrics:\n{}", metrics.render()?);

    tracing::info!("🎉 Demo complete!");
    Ok(())
}
