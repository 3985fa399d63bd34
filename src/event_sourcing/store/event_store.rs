use std::sync::Arc;

use crate::event_sourcing::core::{
    fold_events, Aggregate, AppendContext, AppendOutput, EventDetail, EventDraft,
    ListAggregateIdsOptions, ListAggregateIdsOutput, Reducer, Snapshot, StoreError, StoreResult,
    VersionQuery,
};
use crate::metrics::Metrics;

use super::adapter::EventStorageAdapter;
use super::backend::Backend;
use super::group::GroupedEvent;

// ============================================================================
// Generic Event Store - Aggregate Reconstruction
// ============================================================================
//
// Binds an event store id, a backend and a reducer for one aggregate type.
//
// Type Parameter:
// - `A`: The aggregate type (must implement Aggregate trait)
//
// Responsibilities:
// 1. Rebuild aggregates: latest usable snapshot + the events after it
// 2. Append events under this store's context
// 3. Save and list snapshots
// 4. Bind drafts to this store for grouped writes
//
// ============================================================================

/// Result of rebuilding an aggregate
#[derive(Clone, Debug, PartialEq)]
pub struct AggregateOutput<A> {
    /// None when the aggregate has no events and no snapshot
    pub aggregate: Option<A>,
    pub last_event: Option<EventDetail>,
    /// Events folded during this load (the ones after the snapshot)
    pub event_count: usize,
}

pub struct EventStore<A: Aggregate> {
    event_store_id: String,
    backend: Backend,
    reducer: Arc<dyn Reducer<A>>,
    metrics: Option<Arc<Metrics>>,
}

impl<A: Aggregate> Clone for EventStore<A> {
    fn clone(&self) -> Self {
        Self {
            event_store_id: self.event_store_id.clone(),
            backend: self.backend.clone(),
            reducer: self.reducer.clone(),
            metrics: self.metrics.clone(),
        }
    }
}

impl<A: Aggregate + 'static> EventStore<A> {
    pub fn new<R>(
        event_store_id: impl Into<String>,
        backend: impl Into<Backend>,
        reducer: R,
    ) -> Self
    where
        R: Reducer<A> + 'static,
    {
        Self {
            event_store_id: event_store_id.into(),
            backend: backend.into(),
            reducer: Arc::new(reducer),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn event_store_id(&self) -> &str {
        &self.event_store_id
    }

    pub fn metrics(&self) -> Option<&Arc<Metrics>> {
        self.metrics.as_ref()
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    fn adapter(&self) -> &dyn EventStorageAdapter {
        self.backend.adapter()
    }

    pub fn context(&self) -> AppendContext {
        AppendContext::new(self.event_store_id.clone())
    }

    /// Rebuild an aggregate, optionally as of a past version
    pub async fn get_aggregate(
        &self,
        aggregate_id: &str,
        as_of_version: Option<u64>,
    ) -> StoreResult<AggregateOutput<A>> {
        let snapshot = self.load_snapshot(aggregate_id, as_of_version).await?;

        let mut query = VersionQuery::default();
        query.min_version = snapshot.as_ref().map(|(version, _)| version + 1);
        query.max_version = as_of_version;

        let events = self.adapter().get_events(aggregate_id, query).await?;
        let from_snapshot = snapshot.is_some();
        let seed = snapshot.map(|(_, aggregate)| aggregate);
        let aggregate = self.fold(&events, seed);

        tracing::debug!(
            event_store_id = %self.event_store_id,
            aggregate_id = %aggregate_id,
            from_snapshot = from_snapshot,
            events_folded = events.len(),
            found = aggregate.is_some(),
            "Rebuilt aggregate"
        );
        if let Some(metrics) = &self.metrics {
            metrics.record_aggregate_load(&self.event_store_id, from_snapshot, events.len());
        }

        Ok(AggregateOutput {
            aggregate,
            event_count: events.len(),
            last_event: events.into_iter().last(),
        })
    }

    /// Like `get_aggregate`, but a missing aggregate is an error
    pub async fn get_existing_aggregate(
        &self,
        aggregate_id: &str,
        as_of_version: Option<u64>,
    ) -> StoreResult<(A, AggregateOutput<A>)> {
        let output = self.get_aggregate(aggregate_id, as_of_version).await?;
        match output.aggregate.clone() {
            Some(aggregate) => Ok((aggregate, output)),
            None => Err(StoreError::AggregateNotFound {
                event_store_id: self.event_store_id.clone(),
                aggregate_id: aggregate_id.to_string(),
            }),
        }
    }

    /// Latest snapshot at or below `max_version`, decoded. A snapshot that no
    /// longer decodes is skipped and the aggregate is replayed in full.
    async fn load_snapshot(
        &self,
        aggregate_id: &str,
        max_version: Option<u64>,
    ) -> StoreResult<Option<(u64, A)>> {
        let snapshot = self
            .adapter()
            .get_last_snapshot(aggregate_id, max_version)
            .await?;
        let Some(snapshot) = snapshot else {
            return Ok(None);
        };

        match snapshot.to_aggregate::<A>() {
            Ok(aggregate) => Ok(Some((snapshot.version, aggregate))),
            Err(error) => {
                tracing::warn!(
                    aggregate_id = %aggregate_id,
                    version = snapshot.version,
                    error = %error,
                    "⚠️ Ignoring undecodable snapshot, replaying all events"
                );
                Ok(None)
            }
        }
    }

    pub async fn get_events(
        &self,
        aggregate_id: &str,
        query: VersionQuery,
    ) -> StoreResult<Vec<EventDetail>> {
        self.adapter().get_events(aggregate_id, query).await
    }

    pub async fn append_event(&self, draft: EventDraft) -> StoreResult<AppendOutput> {
        self.adapter().append_event(draft, &self.context()).await
    }

    pub async fn list_aggregate_ids(
        &self,
        options: ListAggregateIdsOptions,
    ) -> StoreResult<ListAggregateIdsOutput> {
        self.adapter().list_aggregate_ids(options).await
    }

    /// Snapshot the given state at its own version
    pub async fn save_snapshot(&self, aggregate: &A) -> StoreResult<Snapshot> {
        let snapshot = Snapshot::from_aggregate(aggregate)?;
        self.adapter().put_snapshot(snapshot.clone()).await?;

        tracing::info!(
            event_store_id = %self.event_store_id,
            aggregate_id = %snapshot.aggregate_id,
            version = snapshot.version,
            "📸 Saved snapshot"
        );
        Ok(snapshot)
    }

    pub async fn list_snapshots(
        &self,
        aggregate_id: &str,
        query: VersionQuery,
    ) -> StoreResult<Vec<Snapshot>> {
        self.adapter().list_snapshots(aggregate_id, query).await
    }

    /// Bind a draft to this store for `append_event_group`
    pub fn group_event(&self, draft: EventDraft) -> GroupedEvent {
        GroupedEvent::new(draft)
            .with_backend(self.backend.clone())
            .with_context(self.context())
    }

    /// Fold events onto a seed with this store's reducer. Nothing is read or
    /// written, so this also simulates an aggregate from arbitrary events.
    pub fn fold(&self, events: &[EventDetail], seed: Option<A>) -> Option<A> {
        fold_events(self.reducer.as_ref(), seed, events)
    }
}
