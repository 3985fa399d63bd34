use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};

use crate::event_sourcing::core::{Aggregate, ListAggregateIdsOptions, StoreError, StoreResult};
use crate::event_sourcing::store::EventStore;

// ============================================================================
// Aggregate Id Pour
// ============================================================================
//
// Walks every page of `list_aggregate_ids` and publishes one
// AggregateExistsMessage per id, e.g. to rebuild a projection. With a rate
// limit of r messages per second the first message goes out at once and the
// next ones are spaced 1000ms / r apart.
//
// ============================================================================

/// "This aggregate exists" notification
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AggregateExistsMessage {
    pub event_store_id: String,
    pub aggregate_id: String,
}

/// Destination of poured messages
#[async_trait]
pub trait MessageChannel: Send + Sync {
    fn channel_name(&self) -> &str;

    async fn publish(&self, message: AggregateExistsMessage) -> StoreResult<()>;
}

/// Channel backed by a tokio mpsc queue
#[derive(Clone)]
pub struct InMemoryMessageChannel {
    name: String,
    sender: mpsc::Sender<AggregateExistsMessage>,
}

impl InMemoryMessageChannel {
    pub fn new(
        name: impl Into<String>,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<AggregateExistsMessage>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (
            Self {
                name: name.into(),
                sender,
            },
            receiver,
        )
    }
}

#[async_trait]
impl MessageChannel for InMemoryMessageChannel {
    fn channel_name(&self) -> &str {
        &self.name
    }

    async fn publish(&self, message: AggregateExistsMessage) -> StoreResult<()> {
        self.sender
            .send(message)
            .await
            .map_err(|_| StoreError::Channel(format!("channel `{}` is closed", self.name)))
    }
}

#[derive(Clone, Debug, Default)]
pub struct PourOptions {
    /// Options of the first page; later pages follow the returned tokens
    pub list_options: ListAggregateIdsOptions,
    /// Messages per second, None for no throttling
    pub rate_limit: Option<f64>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PourReport {
    pub poured_aggregate_id_count: u64,
    pub first_scanned_aggregate: Option<String>,
    pub last_scanned_aggregate: Option<String>,
}

fn publish_period(rate_limit: f64) -> StoreResult<Duration> {
    let invalid = |reason: String| StoreError::InvalidOption {
        option: "rate_limit",
        reason,
    };

    if !(rate_limit.is_finite() && rate_limit > 0.0) {
        return Err(invalid(format!("{} is not a positive number", rate_limit)));
    }
    let period = Duration::try_from_secs_f64(1.0 / rate_limit)
        .map_err(|e| invalid(format!("{} gives no usable period: {}", rate_limit, e)))?;

    // interval() panics on a zero period
    Ok(period.max(Duration::from_nanos(1)))
}

/// Publish one message per aggregate id of `event_store` to `channel`
pub async fn pour_aggregate_ids<A, C>(
    event_store: &EventStore<A>,
    channel: &C,
    options: PourOptions,
) -> StoreResult<PourReport>
where
    A: Aggregate + 'static,
    C: MessageChannel + ?Sized,
{
    let mut ticker = match options.rate_limit {
        Some(rate_limit) => {
            let mut ticker = interval(publish_period(rate_limit)?);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            Some(ticker)
        }
        None => None,
    };

    tracing::info!(
        event_store_id = %event_store.event_store_id(),
        channel = %channel.channel_name(),
        rate_limit = ?options.rate_limit,
        "🚀 Pouring aggregate ids"
    );

    let mut report = PourReport::default();
    let mut list_options = options.list_options;

    loop {
        let page = event_store.list_aggregate_ids(list_options).await?;

        for aggregate_id in page.aggregate_ids {
            if let Some(ticker) = ticker.as_mut() {
                ticker.tick().await;
            }

            channel
                .publish(AggregateExistsMessage {
                    event_store_id: event_store.event_store_id().to_string(),
                    aggregate_id: aggregate_id.clone(),
                })
                .await?;

            report.poured_aggregate_id_count += 1;
            if report.first_scanned_aggregate.is_none() {
                report.first_scanned_aggregate = Some(aggregate_id.clone());
            }
            report.last_scanned_aggregate = Some(aggregate_id);
        }

        match page.next_page_token {
            Some(token) => list_options = ListAggregateIdsOptions::from_page_token(token),
            None => break,
        }
    }

    if let Some(metrics) = event_store.metrics() {
        metrics.record_aggregate_ids_poured(
            event_store.event_store_id(),
            report.poured_aggregate_id_count,
        );
    }

    tracing::info!(
        event_store_id = %event_store.event_store_id(),
        poured = report.poured_aggregate_id_count,
        first = ?report.first_scanned_aggregate,
        last = ?report.last_scanned_aggregate,
        "✅ Pour complete"
    );

    Ok(report)
}
