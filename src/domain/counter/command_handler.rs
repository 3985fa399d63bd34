use crate::event_sourcing::core::{EventDraft, StoreResult};
use crate::event_sourcing::store::EventStore;
use crate::utils::retry::{retry_on_conflict, RetryConfig};

use super::aggregate::{reduce, CounterAggregate};
use super::events::{created, decremented, incremented};

// ============================================================================
// Counter Command Handler
// ============================================================================
//
// Orchestrates: Load → Next Event → Conditional Append
//
// A lost race on the next version surfaces as EventAlreadyExists; the
// handler reloads and tries again under its RetryConfig.
//
// ============================================================================

pub struct CounterCommandHandler {
    event_store: EventStore<CounterAggregate>,
    retry: RetryConfig,
}

impl CounterCommandHandler {
    pub fn new(event_store: EventStore<CounterAggregate>) -> Self {
        Self {
            event_store,
            retry: RetryConfig::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn event_store(&self) -> &EventStore<CounterAggregate> {
        &self.event_store
    }

    pub async fn create(&self, aggregate_id: &str) -> StoreResult<CounterAggregate> {
        let output = self.event_store.append_event(created(aggregate_id)).await?;
        Ok(reduce(None, &output.event))
    }

    pub async fn increment(&self, aggregate_id: &str) -> StoreResult<CounterAggregate> {
        self.apply(aggregate_id, |id, version| incremented(id, version)).await
    }

    pub async fn decrement(&self, aggregate_id: &str) -> StoreResult<CounterAggregate> {
        self.apply(aggregate_id, |id, version| decremented(id, version)).await
    }

    async fn apply<F>(&self, aggregate_id: &str, next_event: F) -> StoreResult<CounterAggregate>
    where
        F: Fn(&str, u64) -> EventDraft,
    {
        let next_event = &next_event;

        retry_on_conflict(self.retry.clone(), |attempt| async move {
            let (counter, _) = self.event_store.get_existing_aggregate(aggregate_id, None).await?;

            tracing::debug!(
                aggregate_id = %aggregate_id,
                version = counter.version,
                attempt = attempt,
                "Applying counter command"
            );

            let output = self
                .event_store
                .append_event(next_event(aggregate_id, counter.version + 1))
                .await?;
            Ok(reduce(Some(counter), &output.event))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_sourcing::core::VersionQuery;
    use crate::event_sourcing::store::durable::tests::MemoryTable;
    use crate::event_sourcing::store::durable::table::SNAPSHOT_PK_SUFFIX;
    use crate::event_sourcing::store::durable::{EventTable, IndexPage, TableRow};
    use crate::event_sourcing::store::{Backend, DurableEventStore, InMemoryEventStore};
    use crate::event_sourcing::StoreError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::sync::Barrier;

    fn handler() -> CounterCommandHandler {
        CounterCommandHandler::new(EventStore::new("counters", InMemoryEventStore::new(), reduce))
    }

    #[tokio::test]
    async fn test_create_increment_decrement() {
        let handler = handler();

        let counter = handler.create("A").await.unwrap();
        assert_eq!((counter.version, counter.count), (1, 0));

        handler.increment("A").await.unwrap();
        handler.increment("A").await.unwrap();
        let counter = handler.decrement("A").await.unwrap();
        assert_eq!((counter.version, counter.count), (4, 1));

        let stored = handler.event_store().get_aggregate("A", None).await.unwrap();
        assert_eq!(stored.aggregate, Some(counter));
    }

    #[tokio::test]
    async fn test_commands_on_missing_counter_fail() {
        let handler = handler();
        assert!(matches!(
            handler.increment("missing").await,
            Err(StoreError::AggregateNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_create_twice_conflicts() {
        let handler = handler();
        handler.create("A").await.unwrap();
        assert!(handler.create("A").await.unwrap_err().is_conflict());
    }

    /// Event table that holds the first `rendezvous` event loads of an
    /// aggregate at a barrier, so every writer reads the same head
    struct RendezvousTable {
        inner: MemoryTable,
        barrier: Barrier,
        remaining: AtomicUsize,
        rejected: AtomicUsize,
    }

    impl RendezvousTable {
        fn new(rendezvous: usize) -> Self {
            Self {
                inner: MemoryTable::default(),
                barrier: Barrier::new(rendezvous),
                remaining: AtomicUsize::new(rendezvous),
                rejected: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl EventTable for RendezvousTable {
        fn backend_name(&self) -> &'static str {
            "rendezvous_table"
        }

        async fn insert_if_absent(&self, row: TableRow) -> StoreResult<bool> {
            let applied = self.inner.insert_if_absent(row).await?;
            if !applied {
                self.rejected.fetch_add(1, Ordering::SeqCst);
            }
            Ok(applied)
        }

        async fn upsert(&self, row: TableRow) -> StoreResult<()> {
            self.inner.upsert(row).await
        }

        async fn query_partition(
            &self,
            partition_key: &str,
            query: VersionQuery,
        ) -> StoreResult<Vec<TableRow>> {
            let rows = self.inner.query_partition(partition_key, query).await?;
            let is_event_load = !partition_key.ends_with(SNAPSHOT_PK_SUFFIX);
            let held = is_event_load
                && self
                    .remaining
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok();
            if held {
                self.barrier.wait().await;
            }
            Ok(rows)
        }

        async fn query_initial_events(
            &self,
            page_size: Option<u32>,
            reverse: bool,
            paging_state: Option<Vec<u8>>,
        ) -> StoreResult<IndexPage> {
            self.inner.query_initial_events(page_size, reverse, paging_state).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_increments_retry_on_conflict() {
        let table = Arc::new(RendezvousTable::new(2));
        let store = EventStore::new(
            "counters",
            Backend::durable(DurableEventStore::new(table.clone())),
            reduce,
        );
        let handler = CounterCommandHandler::new(store).with_retry(RetryConfig::aggressive());
        handler.create("A").await.unwrap();

        // Both writers load version 1, so one of them loses the race to version 2
        let (first, second) = tokio::join!(handler.increment("A"), handler.increment("A"));
        let mut versions = vec![first.unwrap().version, second.unwrap().version];
        versions.sort();
        assert_eq!(versions, vec![2, 3]);
        assert_eq!(table.rejected.load(Ordering::SeqCst), 1);

        let counter = handler
            .event_store()
            .get_aggregate("A", None)
            .await
            .unwrap()
            .aggregate
            .unwrap();
        assert_eq!((counter.version, counter.count), (3, 2));
    }
}
