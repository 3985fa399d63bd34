// ============================================================================
// Event Sourcing Core - Backend-Agnostic Model
// ============================================================================
//
// Types shared by every storage backend:
// - Events and drafts (event.rs)
// - Aggregates, reducers and snapshots (aggregate.rs)
// - Listing options and page tokens (pagination.rs)
// - Timestamp sources (clock.rs)
// - The error taxonomy (error.rs)
//
// ============================================================================

pub mod aggregate;
pub mod clock;
pub mod error;
pub mod event;
pub mod pagination;

pub use aggregate::{fold_events, Aggregate, Reducer, Snapshot};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{StoreError, StoreResult};
pub use event::{AppendContext, AppendOutput, EventDetail, EventDraft, INITIAL_EVENT_VERSION};
pub use pagination::{
    LastEvaluatedAggregate, ListAggregateIdsOptions, ListAggregateIdsOutput, PageToken,
    VersionQuery,
};
