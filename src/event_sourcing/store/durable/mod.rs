// ============================================================================
// Durable Event Store - Storage Contract on a Single Sparse Table
// ============================================================================
//
// Maps the storage contract onto an EventTable:
// - append_event -> conditional insert; "row exists" -> EventAlreadyExists
// - get_events / list_snapshots -> range query on one partition
// - list_aggregate_ids -> paged query on the initial-event index (ordered
//   by initial event timestamp), the table's native resume key re-wrapped
//   in a PageToken together with the reverse flag it belongs to
//
// ============================================================================

pub mod scylla_table;
pub mod table;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::event_sourcing::core::{
    AppendContext, AppendOutput, Clock, EventDetail, EventDraft, ListAggregateIdsOptions,
    ListAggregateIdsOutput, PageToken, Snapshot, StoreError, StoreResult, SystemClock,
    VersionQuery,
};
use crate::event_sourcing::store::adapter::EventStorageAdapter;
use crate::metrics::Metrics;

pub use scylla_table::ScyllaEventTable;
pub use table::{
    format_timestamp, snapshot_partition_key, EventTable, IndexPage, MalformedRow, TableRow,
};

pub struct DurableEventStore<T: EventTable> {
    table: T,
    clock: Arc<dyn Clock>,
    metrics: Option<Arc<Metrics>>,
}

impl<T: EventTable> DurableEventStore<T> {
    pub fn new(table: T) -> Self {
        Self {
            table,
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

    pub fn table(&self) -> &T {
        &self.table
    }
}

// ============================================================================
// Row mapping
// ============================================================================

fn event_to_row(event: &EventDetail) -> StoreResult<TableRow> {
    Ok(TableRow {
        partition_key: event.aggregate_id.clone(),
        version: event.version,
        event_type: Some(event.event_type.clone()),
        timestamp: Some(format_timestamp(&event.timestamp)),
        payload: event.payload.as_ref().map(serde_json::to_string).transpose()?,
        metadata: event.metadata.as_ref().map(serde_json::to_string).transpose()?,
        is_initial_event: event.is_initial_event().then_some(1),
        aggregate: None,
    })
}

fn required<'a>(
    row: &'a TableRow,
    value: &'a Option<String>,
    column: &'static str,
) -> StoreResult<&'a str> {
    value.as_deref().ok_or_else(|| {
        StoreError::backend(MalformedRow {
            partition_key: row.partition_key.clone(),
            version: row.version,
            column,
        })
    })
}

fn row_to_event(row: &TableRow) -> StoreResult<EventDetail> {
    let timestamp = required(row, &row.timestamp, "timestamp")?;
    let timestamp = DateTime::parse_from_rfc3339(timestamp)
        .map_err(StoreError::backend)?
        .with_timezone(&Utc);

    Ok(EventDetail {
        aggregate_id: row.partition_key.clone(),
        version: row.version,
        event_type: required(row, &row.event_type, "event_type")?.to_string(),
        timestamp,
        payload: row.payload.as_deref().map(serde_json::from_str).transpose()?,
        metadata: row.metadata.as_deref().map(serde_json::from_str).transpose()?,
    })
}

fn row_to_snapshot(aggregate_id: &str, row: &TableRow) -> StoreResult<Snapshot> {
    Ok(Snapshot {
        aggregate_id: aggregate_id.to_string(),
        version: row.version,
        state: serde_json::from_str(required(row, &row.aggregate, "aggregate")?)?,
    })
}

#[async_trait]
impl<T: EventTable> EventStorageAdapter for DurableEventStore<T> {
    fn backend_name(&self) -> &'static str {
        self.table.backend_name()
    }

    async fn get_events(
        &self,
        aggregate_id: &str,
        query: VersionQuery,
    ) -> StoreResult<Vec<EventDetail>> {
        let rows = self.table.query_partition(aggregate_id, query).await?;
        let events = rows.iter().map(row_to_event).collect::<StoreResult<Vec<_>>>()?;

        tracing::debug!(
            aggregate_id = %aggregate_id,
            event_count = events.len(),
            backend = self.backend_name(),
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

        let event = draft.stamp(self.clock.now());
        let applied = self.table.insert_if_absent(event_to_row(&event)?).await?;

        if !applied {
            tracing::warn!(
                aggregate_id = %event.aggregate_id,
                version = event.version,
                event_store_id = %context.event_store_id,
                "Conditional insert rejected, version already taken"
            );
            if let Some(metrics) = &self.metrics {
                metrics.record_append_conflict(self.backend_name());
            }
            return Err(StoreError::EventAlreadyExists {
                event_store_id: context.event_store_id.clone(),
                aggregate_id: event.aggregate_id,
                version: event.version,
            });
        }

        tracing::info!(
            aggregate_id = %event.aggregate_id,
            version = event.version,
            event_type = %event.event_type,
            "✅ Appended event to event table"
        );
        if let Some(metrics) = &self.metrics {
            metrics.record_event_appended(self.backend_name());
        }

        Ok(AppendOutput { event })
    }

    async fn list_aggregate_ids(
        &self,
        options: ListAggregateIdsOptions,
    ) -> StoreResult<ListAggregateIdsOutput> {
        let (limit, reverse, paging_state) = match options.take_page_token()? {
            Some(PageToken::Remote {
                limit,
                reverse,
                paging_state,
            }) => (Some(limit), reverse, Some(paging_state)),
            Some(PageToken::FullScan { .. }) => {
                return Err(StoreError::PaginationToken(
                    "token was issued by an in-memory backend".to_string(),
                ))
            }
            None => {
                let unsupported = if options.initial_event_after.is_some() {
                    Some("initial_event_after")
                } else if options.initial_event_before.is_some() {
                    Some("initial_event_before")
                } else {
                    None
                };

                if let Some(option) = unsupported {
                    return Err(StoreError::UnsupportedListOption {
                        backend: self.backend_name(),
                        option,
                    });
                }

                (options.limit, options.reverse, None)
            }
        };

        if limit == Some(0) {
            return Err(StoreError::UnsupportedListOption {
                backend: self.backend_name(),
                option: "limit = 0",
            });
        }

        let page = self
            .table
            .query_initial_events(limit, reverse, paging_state)
            .await?;

        let next_page_token = match (limit, page.paging_state) {
            (Some(limit), Some(paging_state)) => Some(
                PageToken::Remote {
                    limit,
                    reverse,
                    paging_state,
                }
                .marshal()?,
            ),
            _ => None,
        };

        tracing::debug!(
            aggregate_count = page.aggregate_ids.len(),
            reverse = reverse,
            has_next_page = next_page_token.is_some(),
            "Listed aggregate ids from initial event index"
        );

        Ok(ListAggregateIdsOutput {
            aggregate_ids: page.aggregate_ids,
            next_page_token,
        })
    }

    async fn put_snapshot(&self, snapshot: Snapshot) -> StoreResult<()> {
        let row = TableRow {
            partition_key: snapshot_partition_key(&snapshot.aggregate_id),
            version: snapshot.version,
            aggregate: Some(serde_json::to_string(&snapshot.state)?),
            ..TableRow::default()
        };
        self.table.upsert(row).await?;

        tracing::debug!(
            aggregate_id = %snapshot.aggregate_id,
            version = snapshot.version,
            "Stored snapshot"
        );
        if let Some(metrics) = &self.metrics {
            metrics.record_snapshot_written(self.backend_name());
        }
        Ok(())
    }

    async fn list_snapshots(
        &self,
        aggregate_id: &str,
        query: VersionQuery,
    ) -> StoreResult<Vec<Snapshot>> {
        let rows = self
            .table
            .query_partition(&snapshot_partition_key(aggregate_id), query)
            .await?;

        rows.iter().map(|row| row_to_snapshot(aggregate_id, row)).collect()
    }
}


// ============================================================================
// Tests (against an in-process table)
// ============================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::event_sourcing::core::ManualClock;
    use crate::event_sourcing::store::InMemoryEventStore;
    use chrono::TimeZone;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    /// In-process EventTable. The initial-event index is ordered by
    /// (timestamp text, partition key) and its resume key is the next entry.
    #[derive(Default)]
    pub(crate) struct MemoryTable {
        rows: Mutex<BTreeMap<(String, u64), TableRow>>,
        initial_events: Mutex<Vec<(String, String)>>,
    }

    impl MemoryTable {
        pub(crate) fn row(&self, partition_key: &str, version: u64) -> Option<TableRow> {
            let rows = self.rows.lock().unwrap();
            rows.get(&(partition_key.to_string(), version)).cloned()
        }
    }

    fn resume_key(entry: &(String, String)) -> Vec<u8> {
        format!("{}\n{}", entry.0, entry.1).into_bytes()
    }

    fn parse_resume_key(state: Vec<u8>) -> (String, String) {
        let text = String::from_utf8(state).unwrap();
        let (timestamp, aggregate_id) = text.split_once('\n').unwrap();
        (timestamp.to_string(), aggregate_id.to_string())
    }

    #[async_trait]
    impl EventTable for MemoryTable {
        fn backend_name(&self) -> &'static str {
            "memory_table"
        }

        async fn insert_if_absent(&self, row: TableRow) -> StoreResult<bool> {
            let mut rows = self.rows.lock().unwrap();
            let key = (row.partition_key.clone(), row.version);
            if rows.contains_key(&key) {
                return Ok(false);
            }
            if row.is_initial_event == Some(1) {
                let timestamp = row.timestamp.clone().unwrap_or_default();
                let entry = (timestamp, row.partition_key.clone());
                let mut index = self.initial_events.lock().unwrap();
                let position = index.partition_point(|existing| *existing < entry);
                index.insert(position, entry);
            }
            rows.insert(key, row);
            Ok(true)
        }

        async fn upsert(&self, row: TableRow) -> StoreResult<()> {
            let mut rows = self.rows.lock().unwrap();
            rows.insert((row.partition_key.clone(), row.version), row);
            Ok(())
        }

        async fn query_partition(
            &self,
            partition_key: &str,
            query: VersionQuery,
        ) -> StoreResult<Vec<TableRow>> {
            let rows = self.rows.lock().unwrap();
            let partition = rows
                .iter()
                .filter(|((key, _), _)| key == partition_key)
                .map(|(_, row)| row.clone());
            Ok(query.apply(partition, |row| row.version))
        }

        async fn query_initial_events(
            &self,
            page_size: Option<u32>,
            reverse: bool,
            paging_state: Option<Vec<u8>>,
        ) -> StoreResult<IndexPage> {
            let mut entries = self.initial_events.lock().unwrap().clone();
            if reverse {
                entries.reverse();
            }
            if let Some(from) = paging_state.map(parse_resume_key) {
                entries.retain(|entry| if reverse { *entry <= from } else { *entry >= from });
            }

            let (page, rest) = match page_size {
                Some(page_size) => {
                    let rest = entries.split_off(entries.len().min(page_size as usize));
                    (entries, rest)
                }
                None => (entries, Vec::new()),
            };

            Ok(IndexPage {
                aggregate_ids: page.into_iter().map(|(_, aggregate_id)| aggregate_id).collect(),
                paging_state: rest.first().map(resume_key),
            })
        }
    }

    fn at(year: i32, month: u32, day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(year, month, day, 0, 0, 0).unwrap()
    }

    fn context() -> AppendContext {
        AppendContext::new("counters")
    }

    /// Durable store whose clock the test moves
    fn store_with_clock() -> (DurableEventStore<MemoryTable>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(at(2021, 1, 1)));
        let store = DurableEventStore::new(MemoryTable::default()).with_clock(clock.clone());
        (store, clock)
    }

    async fn collect_pages<S: EventStorageAdapter>(
        store: &S,
        first: ListAggregateIdsOptions,
    ) -> Vec<String> {
        let mut page = store.list_aggregate_ids(first).await.unwrap();
        let mut collected = page.aggregate_ids;
        while let Some(token) = page.next_page_token {
            page = store
                .list_aggregate_ids(ListAggregateIdsOptions::from_page_token(token))
                .await
                .unwrap();
            collected.extend(page.aggregate_ids);
        }
        collected
    }

    #[tokio::test]
    async fn test_append_writes_sparse_row_with_initial_flag() {
        let (store, _clock) = store_with_clock();

        store
            .append_event(
                EventDraft::new("A", 1, "CREATED").with_payload(serde_json::json!({ "count": 0 })),
                &context(),
            )
            .await
            .unwrap();
        store
            .append_event(EventDraft::new("A", 2, "INCREMENTED"), &context())
            .await
            .unwrap();

        let initial = store.table().row("A", 1).unwrap();
        assert_eq!(initial.is_initial_event, Some(1));
        assert_eq!(initial.timestamp.as_deref(), Some("2021-01-01T00:00:00.000000000Z"));
        assert_eq!(initial.payload.as_deref(), Some(r#"{"count":0}"#));
        assert!(initial.aggregate.is_none());

        let second = store.table().row("A", 2).unwrap();
        assert_eq!(second.is_initial_event, None);
        assert_eq!(second.payload, None);
    }

    #[tokio::test]
    async fn test_conditional_insert_failure_is_a_conflict() {
        let store = DurableEventStore::new(MemoryTable::default());
        let first = store
            .append_event(EventDraft::new("A", 1, "CREATED"), &context())
            .await
            .unwrap();

        let result = store.append_event(EventDraft::new("A", 1, "OTHER"), &context()).await;
        assert!(matches!(
            result,
            Err(StoreError::EventAlreadyExists { ref aggregate_id, version: 1, .. })
                if aggregate_id == "A"
        ));

        let events = store.get_events("A", VersionQuery::default()).await.unwrap();
        assert_eq!(events, vec![first.event]);

        // The rejected write left no second index entry behind
        let ids = store.list_aggregate_ids(ListAggregateIdsOptions::default()).await.unwrap();
        assert_eq!(ids.aggregate_ids, vec!["A"]);
    }

    #[tokio::test]
    async fn test_events_round_trip_through_rows() {
        let store = DurableEventStore::new(MemoryTable::default());
        let mut appended = Vec::new();
        for version in 1..=3 {
            let draft = EventDraft::new("A", version, "EVENT_TYPE")
                .with_metadata(serde_json::json!({ "user": "u-1" }))
                .with_timestamp(at(2021, 1, version as u32));
            appended.push(store.append_event(draft, &context()).await.unwrap().event);
        }

        let all = store.get_events("A", VersionQuery::default()).await.unwrap();
        assert_eq!(all, appended);

        let latest = store
            .get_events("A", VersionQuery::default().reversed().limit(1))
            .await
            .unwrap();
        assert_eq!(latest, vec![appended[2].clone()]);

        assert!(store.get_events("B", VersionQuery::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_snapshots_live_in_their_own_partition() {
        let store = DurableEventStore::new(MemoryTable::default());
        store
            .append_event(EventDraft::new("A", 1, "CREATED"), &context())
            .await
            .unwrap();

        for version in [1u64, 3] {
            store
                .put_snapshot(Snapshot {
                    aggregate_id: "A".to_string(),
                    version,
                    state: serde_json::json!({ "version": version }),
                })
                .await
                .unwrap();
        }

        assert!(store.table().row("A#snapshot", 3).is_some());
        let last = store.get_last_snapshot("A", None).await.unwrap().unwrap();
        assert_eq!(last.aggregate_id, "A");
        assert_eq!(last.version, 3);
        assert_eq!(store.get_last_snapshot("A", Some(2)).await.unwrap().unwrap().version, 1);

        // Snapshot rows are never listed as events or aggregates
        assert_eq!(store.get_events("A", VersionQuery::default()).await.unwrap().len(), 1);
        let ids = store.list_aggregate_ids(ListAggregateIdsOptions::default()).await.unwrap();
        assert_eq!(ids.aggregate_ids, vec!["A"]);
    }

    #[tokio::test]
    async fn test_paginates_initial_event_index_without_repeats_or_gaps() {
        let (store, clock) = store_with_clock();
        for index in 1..=5 {
            let id = format!("agg-{}", index);
            clock.set(at(2021, 1, index));
            store
                .append_event(EventDraft::new(id.clone(), 1, "CREATED"), &context())
                .await
                .unwrap();
            store
                .append_event(EventDraft::new(id, 2, "INCREMENTED"), &context())
                .await
                .unwrap();
        }

        let first = store
            .list_aggregate_ids(ListAggregateIdsOptions::with_limit(2))
            .await
            .unwrap();
        assert_eq!(first.aggregate_ids, vec!["agg-1", "agg-2"]);

        let token = first.next_page_token.unwrap();
        assert!(matches!(
            PageToken::unmarshal(&token).unwrap(),
            PageToken::Remote { limit: 2, reverse: false, .. }
        ));

        let collected = collect_pages(&store, ListAggregateIdsOptions::with_limit(2)).await;
        assert_eq!(collected, vec!["agg-1", "agg-2", "agg-3", "agg-4", "agg-5"]);
    }

    #[tokio::test]
    async fn test_listing_follows_discovery_time_not_id() {
        let (store, clock) = store_with_clock();
        for (id, year) in [("c", 2021), ("a", 2022), ("b", 2023)] {
            clock.set(at(year, 1, 1));
            store
                .append_event(EventDraft::new(id, 1, "CREATED"), &context())
                .await
                .unwrap();
        }

        let output = store.list_aggregate_ids(ListAggregateIdsOptions::default()).await.unwrap();
        assert_eq!(output.aggregate_ids, vec!["c", "a", "b"]);
        assert!(output.next_page_token.is_none());

        let paged = collect_pages(&store, ListAggregateIdsOptions::with_limit(1)).await;
        assert_eq!(paged, vec!["c", "a", "b"]);
    }

    #[tokio::test]
    async fn test_reverse_listing_is_the_exact_reverse_of_forward() {
        let (store, clock) = store_with_clock();
        for (offset, id) in ["d", "b", "e", "a", "c"].iter().enumerate() {
            clock.set(at(2021, 1, 1) + chrono::Duration::hours(offset as i64));
            store
                .append_event(EventDraft::new(*id, 1, "CREATED"), &context())
                .await
                .unwrap();
        }

        let forward = collect_pages(&store, ListAggregateIdsOptions::default()).await;
        let mut backward =
            collect_pages(&store, ListAggregateIdsOptions::with_limit(2).reversed()).await;
        assert_eq!(backward, vec!["c", "a", "e", "b", "d"]);

        backward.reverse();
        assert_eq!(backward, forward);

        let first = store
            .list_aggregate_ids(ListAggregateIdsOptions::with_limit(2).reversed())
            .await
            .unwrap();
        assert!(matches!(
            PageToken::unmarshal(&first.next_page_token.unwrap()).unwrap(),
            PageToken::Remote { reverse: true, .. }
        ));
    }

    #[tokio::test]
    async fn test_durable_and_in_memory_listings_agree() {
        let (durable, durable_clock) = store_with_clock();
        let in_memory_clock = Arc::new(ManualClock::new(at(2021, 1, 1)));
        let in_memory = InMemoryEventStore::new().with_clock(in_memory_clock.clone());

        for (id, year) in [("c", 2021), ("a", 2022), ("b", 2023)] {
            durable_clock.set(at(year, 1, 1));
            in_memory_clock.set(at(year, 1, 1));
            let draft = EventDraft::new(id, 1, "CREATED");
            durable.append_event(draft.clone(), &context()).await.unwrap();
            in_memory.append_event(draft, &context()).await.unwrap();
        }

        for options in [
            ListAggregateIdsOptions::default(),
            ListAggregateIdsOptions::with_limit(2),
            ListAggregateIdsOptions::default().reversed(),
            ListAggregateIdsOptions::with_limit(2).reversed(),
        ] {
            assert_eq!(
                collect_pages(&durable, options.clone()).await,
                collect_pages(&in_memory, options).await
            );
        }
    }

    #[tokio::test]
    async fn test_rejects_bounds_without_a_range_index() {
        let store = DurableEventStore::new(MemoryTable::default());

        for options in [
            ListAggregateIdsOptions::default().initial_event_after(at(2021, 1, 1)),
            ListAggregateIdsOptions::default().initial_event_before(at(2021, 1, 1)),
            ListAggregateIdsOptions::with_limit(0),
        ] {
            assert!(matches!(
                store.list_aggregate_ids(options).await,
                Err(StoreError::UnsupportedListOption { .. })
            ));
        }
    }

    #[tokio::test]
    async fn test_rejects_ambiguous_and_foreign_tokens() {
        let store = DurableEventStore::new(MemoryTable::default());

        let remote = PageToken::Remote {
            limit: 2,
            reverse: false,
            paging_state: b"2021-01-01T00:00:00.000000000Z\nagg-3".to_vec(),
        }
        .marshal()
        .unwrap();
        let mut ambiguous = ListAggregateIdsOptions::from_page_token(remote);
        ambiguous.limit = Some(3);
        assert!(matches!(
            store.list_aggregate_ids(ambiguous).await,
            Err(StoreError::PaginationToken(_))
        ));

        let in_memory = InMemoryEventStore::new();
        for id in ["a", "b"] {
            in_memory
                .append_event(EventDraft::new(id, 1, "CREATED"), &context())
                .await
                .unwrap();
        }
        let foreign = in_memory
            .list_aggregate_ids(ListAggregateIdsOptions::with_limit(1))
            .await
            .unwrap()
            .next_page_token
            .unwrap();
        assert!(matches!(
            store
                .list_aggregate_ids(ListAggregateIdsOptions::from_page_token(foreign))
                .await,
            Err(StoreError::PaginationToken(_))
        ));
    }

    #[tokio::test]
    async fn test_malformed_row_is_a_backend_error() {
        let store = DurableEventStore::new(MemoryTable::default());
        store
            .table()
            .upsert(TableRow {
                partition_key: "A".to_string(),
                version: 1,
                ..TableRow::default()
            })
            .await
            .unwrap();

        let result = store.get_events("A", VersionQuery::default()).await;
        assert!(matches!(result, Err(StoreError::Backend(_))));
    }
}
