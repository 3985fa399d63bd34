use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use std::sync::Arc;

use crate::event_sourcing::core::{StoreResult, VersionQuery};

// ============================================================================
// Durable Table Abstraction
// ============================================================================
//
// One sparse table holds both event rows and snapshot rows:
//
//   partition key  aggregate_id   ("<id>#snapshot" for snapshot rows)
//   clustering key version
//   event columns  event_type, timestamp, payload, metadata
//   index column   is_initial_event (1 on version 1 rows only)
//   snapshot col   aggregate
//
// Aggregate discovery pages over an initial-event index holding one entry
// per aggregate, ordered by (initial event timestamp, aggregate_id).
// Timestamps are fixed-width UTC text, so text order is time order.
//
// ============================================================================

pub const EVENT_TABLE_PK: &str = "aggregate_id";
pub const EVENT_TABLE_SK: &str = "version";
pub const EVENT_TABLE_IS_INITIAL_EVENT_KEY: &str = "is_initial_event";
pub const SNAPSHOT_PK_SUFFIX: &str = "#snapshot";

/// Fixed-width RFC 3339 text (nanoseconds, `Z` suffix) of a timestamp
pub fn format_timestamp(timestamp: &DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Partition key of an aggregate's snapshot rows
pub fn snapshot_partition_key(aggregate_id: &str) -> String {
    format!("{}{}", aggregate_id, SNAPSHOT_PK_SUFFIX)
}

/// A row of the event table. Columns a row kind does not use are None.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TableRow {
    pub partition_key: String,
    pub version: u64,
    pub event_type: Option<String>,
    /// `format_timestamp` text
    pub timestamp: Option<String>,
    /// JSON text
    pub payload: Option<String>,
    /// JSON text
    pub metadata: Option<String>,
    pub is_initial_event: Option<i32>,
    /// JSON text of the snapshotted aggregate
    pub aggregate: Option<String>,
}

/// One page of the initial-event index
#[derive(Clone, Debug, Default, PartialEq)]
pub struct IndexPage {
    pub aggregate_ids: Vec<String>,
    /// Native resume key, None when the index is exhausted
    pub paging_state: Option<Vec<u8>>,
}

/// A row is missing a column its kind requires
#[derive(Debug, thiserror::Error)]
#[error("Row {partition_key}/{version} is missing column `{column}`")]
pub struct MalformedRow {
    pub partition_key: String,
    pub version: u64,
    pub column: &'static str,
}

/// Operations the durable backend needs from its table
#[async_trait]
pub trait EventTable: Send + Sync {
    fn backend_name(&self) -> &'static str;

    /// Conditional insert: write only if no row exists at
    /// (partition_key, version). Returns whether the row was written. A
    /// written initial event is also entered in the initial-event index.
    async fn insert_if_absent(&self, row: TableRow) -> StoreResult<bool>;

    /// Unconditional write, overwriting any existing row
    async fn upsert(&self, row: TableRow) -> StoreResult<()>;

    /// Rows of one partition, filtered, ordered and limited as `query` says
    async fn query_partition(
        &self,
        partition_key: &str,
        query: VersionQuery,
    ) -> StoreResult<Vec<TableRow>>;

    /// Aggregate ids from the initial-event index, oldest first unless
    /// `reverse`. With a page size, returns at most that many ids plus a
    /// resume key; without, returns them all. A resume key is only valid
    /// with the `reverse` flag it was issued for.
    async fn query_initial_events(
        &self,
        page_size: Option<u32>,
        reverse: bool,
        paging_state: Option<Vec<u8>>,
    ) -> StoreResult<IndexPage>;
}

#[async_trait]
impl<T: EventTable + ?Sized> EventTable for Arc<T> {
    fn backend_name(&self) -> &'static str {
        (**self).backend_name()
    }

    async fn insert_if_absent(&self, row: TableRow) -> StoreResult<bool> {
        (**self).insert_if_absent(row).await
    }

    async fn upsert(&self, row: TableRow) -> StoreResult<()> {
        (**self).upsert(row).await
    }

    async fn query_partition(
        &self,
        partition_key: &str,
        query: VersionQuery,
    ) -> StoreResult<Vec<TableRow>> {
        (**self).query_partition(partition_key, query).await
    }

    async fn query_initial_events(
        &self,
        page_size: Option<u32>,
        reverse: bool,
        paging_state: Option<Vec<u8>>,
    ) -> StoreResult<IndexPage> {
        (**self).query_initial_events(page_size, reverse, paging_state).await
    }
}
