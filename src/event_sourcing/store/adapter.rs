use async_trait::async_trait;

use crate::event_sourcing::core::{
    AppendContext, AppendOutput, EventDetail, EventDraft, ListAggregateIdsOptions,
    ListAggregateIdsOutput, Snapshot, StoreResult, VersionQuery,
};

// ============================================================================
// Storage Adapter Contract
// ============================================================================
//
// The capability interface every backend implements. Application code only
// sees this trait, so the in-memory and durable backends must behave the
// same for every operation:
//
// - get_events: ascending unless reversed, limit applied after ordering,
//   unknown aggregate -> empty vec
// - append_event: conditional insert on (aggregate_id, version), the only
//   concurrency control; a taken version -> EventAlreadyExists
// - list_aggregate_ids: one entry per aggregate (its version 1 event),
//   paginated with opaque tokens
// - snapshots: optional; an absent snapshot means "replay from version 1"
//
// ============================================================================

#[async_trait]
pub trait EventStorageAdapter: Send + Sync {
    /// Short backend name used in logs and metric labels
    fn backend_name(&self) -> &'static str;

    async fn get_events(
        &self,
        aggregate_id: &str,
        query: VersionQuery,
    ) -> StoreResult<Vec<EventDetail>>;

    async fn append_event(
        &self,
        draft: EventDraft,
        context: &AppendContext,
    ) -> StoreResult<AppendOutput>;

    async fn list_aggregate_ids(
        &self,
        options: ListAggregateIdsOptions,
    ) -> StoreResult<ListAggregateIdsOutput>;

    async fn put_snapshot(&self, snapshot: Snapshot) -> StoreResult<()>;

    async fn get_last_snapshot(
        &self,
        aggregate_id: &str,
        max_version: Option<u64>,
    ) -> StoreResult<Option<Snapshot>> {
        let mut query = VersionQuery::default().reversed().limit(1);
        query.max_version = max_version;
        Ok(self.list_snapshots(aggregate_id, query).await?.into_iter().next())
    }

    async fn list_snapshots(
        &self,
        aggregate_id: &str,
        query: VersionQuery,
    ) -> StoreResult<Vec<Snapshot>>;
}
