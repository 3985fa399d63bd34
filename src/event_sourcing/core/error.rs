// ============================================================================
// Event Storage Errors
// ============================================================================
//
// Every failure the storage core can report. Nothing here is retried
// internally: callers branch on the variant (re-fetch-and-retry on a
// conflict, abort on a rollback failure).
//
// ============================================================================

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Optimistic concurrency conflict: the `(aggregate_id, version)` row exists
    #[error(
        "Event already exists for aggregate {aggregate_id} at version {version} \
         in event store {event_store_id}"
    )]
    EventAlreadyExists {
        event_store_id: String,
        aggregate_id: String,
        version: u64,
    },

    #[error("Aggregate {aggregate_id} not found in event store {event_store_id}")]
    AggregateNotFound {
        event_store_id: String,
        aggregate_id: String,
    },

    /// A grouped write was rejected before any event was written
    #[error(
        "Event group event #{index} for aggregate {aggregate_id} at version {version} \
         is invalid: {reason}"
    )]
    GroupValidation {
        index: usize,
        aggregate_id: String,
        version: u64,
        reason: String,
    },

    /// A partially applied group could not be compensated
    #[error(
        "Unable to revert partially pushed event group at aggregate {aggregate_id} \
         version {version}. Original error: {source}"
    )]
    GroupRollbackFailure {
        aggregate_id: String,
        version: u64,
        #[source]
        source: Box<StoreError>,
    },

    #[error("Invalid page token: {0}")]
    PaginationToken(String),

    #[error("List option `{option}` is not supported by the {backend} backend")]
    UnsupportedListOption {
        backend: &'static str,
        option: &'static str,
    },

    #[error("Invalid event for aggregate {aggregate_id:?} at version {version}: {reason}")]
    InvalidEvent {
        aggregate_id: String,
        version: u64,
        reason: &'static str,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Storage backend error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("Message channel error: {0}")]
    Channel(String),

    /// A caller option is out of range
    #[error("Invalid option `{option}`: {reason}")]
    InvalidOption { option: &'static str, reason: String },
}

impl StoreError {
    /// Wrap a driver error
    pub fn backend<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Backend(Box::new(error))
    }

    /// True for a version conflict, the only error a caller should retry
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::EventAlreadyExists { .. })
    }

    pub fn is_rollback_failure(&self) -> bool {
        matches!(self, Self::GroupRollbackFailure { .. })
    }
}
