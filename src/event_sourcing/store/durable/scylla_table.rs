use async_trait::async_trait;
use futures_util::TryStreamExt;
use scylla::client::session::Session;
use scylla::client::session_builder::SessionBuilder;
use scylla::response::{PagingState, PagingStateResponse};
use scylla::statement::prepared::PreparedStatement;
use scylla::value::{CqlValue, Row};
use std::sync::Arc;

use super::table::{
    EventTable, IndexPage, MalformedRow, TableRow, EVENT_TABLE_IS_INITIAL_EVENT_KEY,
    EVENT_TABLE_PK, EVENT_TABLE_SK,
};
use crate::config::ScyllaConfig;
use crate::event_sourcing::core::{StoreError, StoreResult, VersionQuery};

// ============================================================================
// ScyllaDB Event Table
// ============================================================================
//
// Realizes EventTable on one ScyllaDB table:
// - insert_if_absent -> INSERT ... IF NOT EXISTS (lightweight transaction)
// - query_partition  -> clustering range on `version`, ASC or DESC
// - query_initial_events -> companion table `<table>_initial_events`,
//   one partition clustered by (timestamp, aggregate_id), read ASC or DESC
//   and paged with the driver's PagingState
//
// The index entry is written after the conditional insert of a version 1
// row succeeds, so a rejected insert never adds an entry.
//
// ============================================================================

const BACKEND_NAME: &str = "scylla";
const INITIAL_EVENTS_SUFFIX: &str = "_initial_events";

fn initial_events_table(table: &str) -> String {
    format!("{}{}", table, INITIAL_EVENTS_SUFFIX)
}

type RowColumns = (
    String,
    i64,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<i32>,
    Option<String>,
);

#[derive(Debug, thiserror::Error)]
#[error("`{0}` is not a valid CQL identifier")]
pub struct InvalidIdentifier(String);

fn validate_identifier(name: &str) -> StoreResult<()> {
    let mut chars = name.chars();
    let valid = name.len() <= 48
        && chars.next().map_or(false, |c| c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');

    if valid {
        Ok(())
    } else {
        Err(StoreError::backend(InvalidIdentifier(name.to_string())))
    }
}

fn to_cql_version(version: u64) -> StoreResult<i64> {
    i64::try_from(version).map_err(StoreError::backend)
}

fn from_columns(columns: RowColumns) -> StoreResult<TableRow> {
    let (
        partition_key,
        version,
        event_type,
        timestamp,
        payload,
        metadata,
        is_initial_event,
        aggregate,
    ) = columns;
    Ok(TableRow {
        partition_key,
        version: u64::try_from(version).map_err(StoreError::backend)?,
        event_type,
        timestamp,
        payload,
        metadata,
        is_initial_event,
        aggregate,
    })
}

/// The prepared statements of one event table
struct Statements {
    insert_if_absent: PreparedStatement,
    upsert: PreparedStatement,
    select_ascending: PreparedStatement,
    select_descending: PreparedStatement,
    insert_initial_event: PreparedStatement,
    select_initial_events_ascending: PreparedStatement,
    select_initial_events_descending: PreparedStatement,
}

pub struct ScyllaEventTable {
    session: Arc<Session>,
    table: String,
    statements: Statements,
}

impl ScyllaEventTable {
    /// Connect, create keyspace and schema if missing, prepare statements
    pub async fn connect(config: &ScyllaConfig) -> StoreResult<Self> {
        validate_identifier(&config.keyspace)?;

        tracing::info!(nodes = ?config.nodes, "Connecting to ScyllaDB...");
        let mut builder = SessionBuilder::new();
        for node in &config.nodes {
            builder = builder.known_node(node);
        }
        let session = builder.build().await.map_err(StoreError::backend)?;

        session
            .query_unpaged(
                format!(
                    "CREATE KEYSPACE IF NOT EXISTS {} WITH REPLICATION = \
                     {{'class': 'SimpleStrategy', 'replication_factor': {}}}",
                    config.keyspace, config.replication_factor
                ),
                &[],
            )
            .await
            .map_err(StoreError::backend)?;

        session
            .use_keyspace(&config.keyspace, false)
            .await
            .map_err(StoreError::backend)?;

        Self::with_session(Arc::new(session), &config.event_table).await
    }

    /// Use an existing session whose keyspace is already selected
    pub async fn with_session(session: Arc<Session>, table: &str) -> StoreResult<Self> {
        validate_identifier(table)?;
        validate_identifier(&initial_events_table(table))?;
        create_schema(&session, table).await?;
        let statements = prepare_statements(&session, table).await?;

        tracing::info!(table = %table, "✅ Event table ready");

        Ok(Self {
            session,
            table: table.to_string(),
            statements,
        })
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn table_name(&self) -> &str {
        &self.table
    }

    fn select_initial_events(&self, reverse: bool) -> &PreparedStatement {
        if reverse {
            &self.statements.select_initial_events_descending
        } else {
            &self.statements.select_initial_events_ascending
        }
    }

    async fn drain_initial_events(&self, reverse: bool) -> StoreResult<Vec<String>> {
        let rows: Vec<(String,)> = self
            .session
            .execute_iter(self.select_initial_events(reverse).clone(), (1i32,))
            .await
            .map_err(StoreError::backend)?
            .rows_stream::<(String,)>()
            .map_err(StoreError::backend)?
            .try_collect()
            .await
            .map_err(StoreError::backend)?;

        Ok(rows.into_iter().map(|(aggregate_id,)| aggregate_id).collect())
    }
}

async fn create_schema(session: &Session, table: &str) -> StoreResult<()> {
    session
        .query_unpaged(
            format!(
                "CREATE TABLE IF NOT EXISTS {table} (
                    {pk} text,
                    {sk} bigint,
                    event_type text,
                    timestamp text,
                    payload text,
                    metadata text,
                    {initial} int,
                    aggregate text,
                    PRIMARY KEY ({pk}, {sk})
                ) WITH CLUSTERING ORDER BY ({sk} ASC)",
                table = table,
                pk = EVENT_TABLE_PK,
                sk = EVENT_TABLE_SK,
                initial = EVENT_TABLE_IS_INITIAL_EVENT_KEY,
            ),
            &[],
        )
        .await
        .map_err(StoreError::backend)?;

    session
        .query_unpaged(
            format!(
                "CREATE TABLE IF NOT EXISTS {index} (
                    {initial} int,
                    timestamp text,
                    {pk} text,
                    PRIMARY KEY ({initial}, timestamp, {pk})
                ) WITH CLUSTERING ORDER BY (timestamp ASC, {pk} ASC)",
                index = initial_events_table(table),
                initial = EVENT_TABLE_IS_INITIAL_EVENT_KEY,
                pk = EVENT_TABLE_PK,
            ),
            &[],
        )
        .await
        .map_err(StoreError::backend)?;

    Ok(())
}

async fn prepare_statements(session: &Session, table: &str) -> StoreResult<Statements> {
    let columns = format!(
        "{pk}, {sk}, event_type, timestamp, payload, metadata, {initial}, aggregate",
        pk = EVENT_TABLE_PK,
        sk = EVENT_TABLE_SK,
        initial = EVENT_TABLE_IS_INITIAL_EVENT_KEY,
    );
    let select = |order: &str| {
        format!(
            "SELECT {columns} FROM {table} WHERE {pk} = ? AND {sk} >= ? AND {sk} <= ? \
             ORDER BY {sk} {order} LIMIT ?",
            columns = columns,
            table = table,
            pk = EVENT_TABLE_PK,
            sk = EVENT_TABLE_SK,
            order = order,
        )
    };

    let index = initial_events_table(table);
    let select_initial_events = |order: &str| {
        format!(
            "SELECT {pk} FROM {index} WHERE {initial} = ? ORDER BY timestamp {order}",
            pk = EVENT_TABLE_PK,
            index = index,
            initial = EVENT_TABLE_IS_INITIAL_EVENT_KEY,
            order = order,
        )
    };

    let insert = format!(
        "INSERT INTO {table} ({columns}) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        table = table,
        columns = columns,
    );

    Ok(Statements {
        insert_if_absent: session
            .prepare(format!("{} IF NOT EXISTS", insert))
            .await
            .map_err(StoreError::backend)?,
        upsert: session.prepare(insert).await.map_err(StoreError::backend)?,
        select_ascending: session
            .prepare(select("ASC"))
            .await
            .map_err(StoreError::backend)?,
        select_descending: session
            .prepare(select("DESC"))
            .await
            .map_err(StoreError::backend)?,
        insert_initial_event: session
            .prepare(format!(
                "INSERT INTO {index} ({initial}, timestamp, {pk}) VALUES (?, ?, ?)",
                index = index,
                initial = EVENT_TABLE_IS_INITIAL_EVENT_KEY,
                pk = EVENT_TABLE_PK,
            ))
            .await
            .map_err(StoreError::backend)?,
        select_initial_events_ascending: session
            .prepare(select_initial_events("ASC"))
            .await
            .map_err(StoreError::backend)?,
        select_initial_events_descending: session
            .prepare(select_initial_events("DESC"))
            .await
            .map_err(StoreError::backend)?,
    })
}

fn row_values(row: TableRow) -> StoreResult<RowColumns> {
    Ok((
        row.partition_key,
        to_cql_version(row.version)?,
        row.event_type,
        row.timestamp,
        row.payload,
        row.metadata,
        row.is_initial_event,
        row.aggregate,
    ))
}

#[async_trait]
impl EventTable for ScyllaEventTable {
    fn backend_name(&self) -> &'static str {
        BACKEND_NAME
    }

    async fn insert_if_absent(&self, row: TableRow) -> StoreResult<bool> {
        let index_entry = match row.is_initial_event {
            Some(1) => {
                let timestamp = row.timestamp.clone().ok_or_else(|| {
                    StoreError::backend(MalformedRow {
                        partition_key: row.partition_key.clone(),
                        version: row.version,
                        column: "timestamp",
                    })
                })?;
                Some((timestamp, row.partition_key.clone()))
            }
            _ => None,
        };

        let result = self
            .session
            .execute_unpaged(&self.statements.insert_if_absent, row_values(row)?)
            .await
            .map_err(StoreError::backend)?;

        // The LWT result row starts with the `[applied]` column
        let applied = result
            .into_rows_result()
            .map_err(StoreError::backend)?
            .maybe_first_row::<Row>()
            .map_err(StoreError::backend)?
            .map_or(false, |row| {
                matches!(row.columns.first(), Some(Some(CqlValue::Boolean(true))))
            });

        if let (true, Some((timestamp, aggregate_id))) = (applied, index_entry) {
            self.session
                .execute_unpaged(
                    &self.statements.insert_initial_event,
                    (1i32, timestamp, aggregate_id),
                )
                .await
                .map_err(StoreError::backend)?;
        }

        Ok(applied)
    }

    async fn upsert(&self, row: TableRow) -> StoreResult<()> {
        self.session
            .execute_unpaged(&self.statements.upsert, row_values(row)?)
            .await
            .map_err(StoreError::backend)?;
        Ok(())
    }

    async fn query_partition(
        &self,
        partition_key: &str,
        query: VersionQuery,
    ) -> StoreResult<Vec<TableRow>> {
        // CQL rejects LIMIT 0
        if query.limit == Some(0) {
            return Ok(Vec::new());
        }

        let statement = if query.reverse {
            &self.statements.select_descending
        } else {
            &self.statements.select_ascending
        };
        let min_version = to_cql_version(query.min_version.unwrap_or(0))?;
        let max_version = query.max_version.map(to_cql_version).transpose()?.unwrap_or(i64::MAX);
        let limit = query
            .limit
            .map_or(i32::MAX, |limit| i32::try_from(limit).unwrap_or(i32::MAX));

        let result = self
            .session
            .execute_unpaged(statement, (partition_key, min_version, max_version, limit))
            .await
            .map_err(StoreError::backend)?;

        let rows_result = match result.into_rows_result() {
            Ok(rows) => rows,
            Err(_) => return Ok(Vec::new()),
        };

        let mut rows = Vec::new();
        for columns in rows_result.rows::<RowColumns>().map_err(StoreError::backend)? {
            rows.push(from_columns(columns.map_err(StoreError::backend)?)?);
        }
        Ok(rows)
    }

    async fn query_initial_events(
        &self,
        page_size: Option<u32>,
        reverse: bool,
        paging_state: Option<Vec<u8>>,
    ) -> StoreResult<IndexPage> {
        let Some(page_size) = page_size else {
            return Ok(IndexPage {
                aggregate_ids: self.drain_initial_events(reverse).await?,
                paging_state: None,
            });
        };

        let mut statement = self.select_initial_events(reverse).clone();
        statement.set_page_size(i32::try_from(page_size).unwrap_or(i32::MAX));

        let paging_state = match paging_state {
            Some(bytes) => PagingState::new_from_raw_bytes(bytes),
            None => PagingState::start(),
        };

        let (result, paging_response) = self
            .session
            .execute_single_page(&statement, (1i32,), paging_state)
            .await
            .map_err(StoreError::backend)?;

        let mut aggregate_ids = Vec::new();
        if let Ok(rows_result) = result.into_rows_result() {
            for row in rows_result.rows::<(String,)>().map_err(StoreError::backend)? {
                let (aggregate_id,) = row.map_err(StoreError::backend)?;
                aggregate_ids.push(aggregate_id);
            }
        }

        let paging_state = match paging_response {
            PagingStateResponse::HasMorePages { state } => {
                state.as_bytes_slice().map(|bytes| bytes.to_vec())
            }
            PagingStateResponse::NoMorePages => None,
        };

        tracing::debug!(
            table = %self.table,
            page_size = page_size,
            reverse = reverse,
            returned = aggregate_ids.len(),
            has_more = paging_state.is_some(),
            "Fetched page of initial event index"
        );

        Ok(IndexPage {
            aggregate_ids,
            paging_state,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifier_validation() {
        assert!(validate_identifier("events").is_ok());
        assert!(validate_identifier("event_storage_2").is_ok());
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("2events").is_err());
        assert!(validate_identifier("events; DROP TABLE x").is_err());
        assert!(validate_identifier(&"a".repeat(49)).is_err());
    }

    #[test]
    fn test_index_table_name_must_also_fit() {
        assert_eq!(initial_events_table("events"), "events_initial_events");
        assert!(validate_identifier(&initial_events_table(&"a".repeat(33))).is_ok());
        assert!(validate_identifier(&initial_events_table(&"a".repeat(34))).is_err());
    }

    #[test]
    fn test_row_columns_round_trip_version() {
        let row = TableRow {
            partition_key: "A".to_string(),
            version: 7,
            event_type: Some("CREATED".to_string()),
            is_initial_event: None,
            ..TableRow::default()
        };
        let columns = row_values(row.clone()).unwrap();
        assert_eq!(columns.1, 7);
        assert_eq!(from_columns(columns).unwrap(), row);
    }

    #[test]
    fn test_out_of_range_versions_are_backend_errors() {
        assert!(matches!(to_cql_version(u64::MAX), Err(StoreError::Backend(_))));

        let columns: RowColumns = ("A".to_string(), -1, None, None, None, None, None, None);
        assert!(matches!(from_columns(columns), Err(StoreError::Backend(_))));
    }
}
