// ============================================================================
// Messaging - publishing aggregate ids to downstream consumers
// ============================================================================

pub mod pour;

pub use pour::{
    pour_aggregate_ids, AggregateExistsMessage, InMemoryMessageChannel, MessageChannel, PourOptions,
    PourReport,
};
