use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::event_sourcing::core::{
    AppendContext, AppendOutput, Clock, EventDetail, EventDraft, LastEvaluatedAggregate,
    ListAggregateIdsOptions, ListAggregateIdsOutput, PageToken, Snapshot, StoreError, StoreResult,
    SystemClock, VersionQuery,
};
use crate::metrics::Metrics;

use super::adapter::EventStorageAdapter;

// ============================================================================
// In-Memory Event Store - Volatile Backend
// ============================================================================
//
// Reference semantics for the storage contract:
// - Each aggregate owns an append-only Vec of events, kept sorted by version
// - A write lock makes "check version is free, then insert" atomic, which is
//   this backend's conditional write
// - Aggregates are listed by a full scan sorted on initial event timestamp
// - Snapshots are kept per aggregate, keyed by version
//
// Clones share the same underlying state.
//
// ============================================================================

const BACKEND_NAME: &str = "in_memory";

#[derive(Clone)]
pub struct InMemoryEventStore {
    inner: Arc<RwLock<Inner>>,
    clock: Arc<dyn Clock>,
    metrics: Option<Arc<Metrics>>,
}

#[derive(Default)]
pub(crate) struct Inner {
    streams: HashMap<String, Vec<EventDetail>>,
    /// Aggregate ids in the order they were first written
    discovery_order: Vec<String>,
    snapshots: HashMap<String, BTreeMap<u64, Snapshot>>,
}

impl Inner {
    fn insert_stream(&mut self, aggregate_id: &str, events: Vec<EventDetail>) {
        self.discovery_order.push(aggregate_id.to_string());
        self.streams.insert(aggregate_id.to_string(), events);
    }

    fn remove_stream(&mut self, aggregate_id: &str) {
        self.streams.remove(aggregate_id);
        self.discovery_order.retain(|id| id != aggregate_id);
    }
}

/// A write applied by this store, with what is needed to undo it
#[derive(Clone, Debug)]
pub(crate) struct AppliedWrite {
    pub event: EventDetail,
    /// Event overwritten by a forced write
    pub replaced: Option<EventDetail>,
}

impl Default for InMemoryEventStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner::default())),
            clock: Arc::new(SystemClock),
            metrics: None,
        }
    }

    /// Seed the store with already-stamped events, e.g. test fixtures
    pub fn with_initial_events(events: impl IntoIterator<Item = EventDetail>) -> Self {
        let mut inner = Inner::default();

        for event in events {
            match inner.streams.get_mut(&event.aggregate_id) {
                Some(stream) => {
                    let position =
                        stream.partition_point(|existing| existing.version < event.version);
                    stream.insert(position, event);
                }
                None => {
                    let aggregate_id = event.aggregate_id.clone();
                    inner.insert_stream(&aggregate_id, vec![event]);
                }
            }
        }

        Self {
            inner: Arc::new(RwLock::new(inner)),
            clock: Arc::new(SystemClock),
            metrics: None,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub(crate) fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Copy of every stream, keyed by aggregate id
    pub async fn all_events(&self) -> BTreeMap<String, Vec<EventDetail>> {
        let inner = self.inner.read().await;
        inner
            .streams
            .iter()
            .map(|(id, events)| (id.clone(), events.clone()))
            .collect()
    }

    /// Version of the most recent event, None for an unknown aggregate
    pub async fn head_version(&self, aggregate_id: &str) -> Option<u64> {
        let inner = self.inner.read().await;
        inner
            .streams
            .get(aggregate_id)
            .and_then(|events| events.last())
            .map(|event| event.version)
    }

    /// Conditional insert of a stamped event
    pub(crate) async fn write_event(
        &self,
        event: EventDetail,
        context: &AppendContext,
    ) -> StoreResult<AppliedWrite> {
        let mut inner = self.inner.write().await;

        let Some(stream) = inner.streams.get_mut(&event.aggregate_id) else {
            let aggregate_id = event.aggregate_id.clone();
            inner.insert_stream(&aggregate_id, vec![event.clone()]);
            return Ok(AppliedWrite { event, replaced: None });
        };

        match stream.binary_search_by_key(&event.version, |existing| existing.version) {
            Ok(position) if context.force => {
                let replaced = std::mem::replace(&mut stream[position], event.clone());
                tracing::warn!(
                    aggregate_id = %event.aggregate_id,
                    version = event.version,
                    "Forced overwrite of existing event"
                );
                Ok(AppliedWrite { event, replaced: Some(replaced) })
            }
            Ok(_) => Err(StoreError::EventAlreadyExists {
                event_store_id: context.event_store_id.clone(),
                aggregate_id: event.aggregate_id,
                version: event.version,
            }),
            Err(position) => {
                stream.insert(position, event.clone());
                Ok(AppliedWrite { event, replaced: None })
            }
        }
    }

    /// Undo a write made by `write_event`.
    ///
    /// Only succeeds if the written event is still exactly what this store
    /// holds at that position: the stream head for an insert, the same
    /// version slot for a forced overwrite. Returns false, leaving the
    /// stream untouched, when another writer got there first.
    pub(crate) async fn revert_write(&self, applied: &AppliedWrite) -> bool {
        let mut inner = self.inner.write().await;
        let aggregate_id = applied.event.aggregate_id.as_str();

        let Some(stream) = inner.streams.get_mut(aggregate_id) else {
            return false;
        };

        match &applied.replaced {
            Some(previous) => {
                match stream.iter_mut().find(|event| event.version == applied.event.version) {
                    Some(slot) if *slot == applied.event => {
                        *slot = previous.clone();
                        true
                    }
                    _ => false,
                }
            }
            None => {
                if stream.last() != Some(&applied.event) {
                    tracing::error!(
                        aggregate_id = %aggregate_id,
                        expected_version = applied.event.version,
                        head_version = ?stream.last().map(|event| event.version),
                        "Aggregate head moved, cannot revert grouped write"
                    );
                    return false;
                }

                stream.pop();
                if stream.is_empty() {
                    inner.remove_stream(aggregate_id);
                }
                true
            }
        }
    }

    pub(crate) fn metrics(&self) -> Option<&Arc<Metrics>> {
        self.metrics.as_ref()
    }

    /// Block every reader and writer of this store until the guard drops
    #[cfg(test)]
    pub(crate) async fn hold_write_lock(&self) -> tokio::sync::OwnedRwLockWriteGuard<Inner> {
        self.inner.clone().write_owned().await
    }

    pub(crate) fn record_append(&self, outcome: &StoreResult<AppliedWrite>) {
        if let Some(metrics) = &self.metrics {
            match outcome {
                Ok(_) => metrics.record_event_appended(BACKEND_NAME),
                Err(error) if error.is_conflict() => metrics.record_append_conflict(BACKEND_NAME),
                Err(_) => {}
            }
        }
    }
}

#[async_trait]
impl EventStorageAdapter for InMemoryEventStore {
    fn backend_name(&self) -> &'static str {
        BACKEND_NAME
    }

    async fn get_events(
        &self,
        aggregate_id: &str,
        query: VersionQuery,
    ) -> StoreResult<Vec<EventDetail>> {
        let inner = self.inner.read().await;
        let events = match inner.streams.get(aggregate_id) {
            Some(stream) => query.apply(stream.iter().cloned(), |event| event.version),
            None => Vec::new(),
        };

        tracing::debug!(
            aggregate_id = %aggregate_id,
            event_count = events.len(),
            "Loaded events"
        );
        Ok(events)
    }

    async fn append_event(
        &self,
        draft: EventDraft,
        context: &AppendContext,
    ) -> StoreResult<AppendOutput> {
        draft.validate()?;

        // Stamped here rather than by the caller, so a retried call gets a
        // fresh timestamp
        let event = draft.stamp(self.clock.now());
        let outcome = self.write_event(event, context).await;
        self.record_append(&outcome);

        match outcome {
            Ok(applied) => {
                tracing::info!(
                    aggregate_id = %applied.event.aggregate_id,
                    version = applied.event.version,
                    event_type = %applied.event.event_type,
                    "Appended event"
                );
                Ok(AppendOutput { event: applied.event })
            }
            Err(error) => {
                tracing::warn!(error = %error, "Append rejected");
                Err(error)
            }
        }
    }

    async fn list_aggregate_ids(
        &self,
        options: ListAggregateIdsOptions,
    ) -> StoreResult<ListAggregateIdsOutput> {
        let (limit, after, before, reverse, cursor) = match options.take_page_token()? {
            None => (
                options.limit,
                options.initial_event_after,
                options.initial_event_before,
                options.reverse,
                None,
            ),
            Some(PageToken::FullScan {
                limit,
                initial_event_after,
                initial_event_before,
                reverse,
                last_evaluated,
            }) => (
                Some(limit),
                initial_event_after,
                initial_event_before,
                reverse,
                Some(last_evaluated),
            ),
            Some(PageToken::Remote { .. }) => {
                return Err(StoreError::PaginationToken(
                    "token was issued by a durable backend".to_string(),
                ))
            }
        };

        if limit == Some(0) {
            return Err(StoreError::UnsupportedListOption {
                backend: BACKEND_NAME,
                option: "limit = 0",
            });
        }

        let mut entries: Vec<(String, DateTime<Utc>)> = {
            let inner = self.inner.read().await;
            inner
                .discovery_order
                .iter()
                .filter_map(|aggregate_id| {
                    let initial_event = inner.streams.get(aggregate_id)?.first()?;
                    Some((aggregate_id.clone(), initial_event.timestamp))
                })
                .collect()
        };

        // Stable: ties keep discovery order
        entries.sort_by_key(|(_, timestamp)| *timestamp);

        entries.retain(|(_, timestamp)| {
            after.map_or(true, |after| *timestamp >= after)
                && before.map_or(true, |before| *timestamp <= before)
        });

        if reverse {
            entries.reverse();
        }

        if let Some(cursor) = &cursor {
            let start = match entries.iter().position(|(id, _)| *id == cursor.aggregate_id) {
                Some(index) => index + 1,
                // Cursor aggregate is gone (rolled back): resume by position
                None => entries
                    .iter()
                    .position(|(_, timestamp)| {
                        if reverse {
                            *timestamp < cursor.initial_event_timestamp
                        } else {
                            *timestamp > cursor.initial_event_timestamp
                        }
                    })
                    .unwrap_or(entries.len()),
            };
            entries.drain(..start);
        }

        // Decided after bound filtering and cursor skipping, before slicing
        let has_next_page = limit.map_or(false, |limit| entries.len() > limit as usize);
        if let Some(limit) = limit {
            entries.truncate(limit as usize);
        }

        let next_page_token = match (has_next_page, limit, entries.last()) {
            (true, Some(limit), Some((aggregate_id, timestamp))) => Some(
                PageToken::FullScan {
                    limit,
                    initial_event_after: after,
                    initial_event_before: before,
                    reverse,
                    last_evaluated: LastEvaluatedAggregate {
                        aggregate_id: aggregate_id.clone(),
                        initial_event_timestamp: *timestamp,
                    },
                }
                .marshal()?,
            ),
            _ => None,
        };

        tracing::debug!(
            aggregate_count = entries.len(),
            has_next_page = has_next_page,
            "Listed aggregate ids"
        );

        Ok(ListAggregateIdsOutput {
            aggregate_ids: entries.into_iter().map(|(aggregate_id, _)| aggregate_id).collect(),
            next_page_token,
        })
    }

    async fn put_snapshot(&self, snapshot: Snapshot) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        tracing::debug!(
            aggregate_id = %snapshot.aggregate_id,
            version = snapshot.version,
            "Stored snapshot"
        );
        inner
            .snapshots
            .entry(snapshot.aggregate_id.clone())
            .or_default()
            .insert(snapshot.version, snapshot);

        if let Some(metrics) = &self.metrics {
            metrics.record_snapshot_written(BACKEND_NAME);
        }
        Ok(())
    }

    async fn list_snapshots(
        &self,
        aggregate_id: &str,
        query: VersionQuery,
    ) -> StoreResult<Vec<Snapshot>> {
        let inner = self.inner.read().await;
        Ok(match inner.snapshots.get(aggregate_id) {
            Some(snapshots) => {
                query.apply(snapshots.values().cloned(), |snapshot| snapshot.version)
            }
            None => Vec::new(),
        })
    }
}
