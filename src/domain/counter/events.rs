use crate::event_sourcing::core::{EventDraft, INITIAL_EVENT_VERSION};

// ============================================================================
// Counter Events
// ============================================================================

pub const CREATED: &str = "CREATED";
pub const INCREMENTED: &str = "INCREMENTED";
pub const DECREMENTED: &str = "DECREMENTED";

pub fn created(aggregate_id: impl Into<String>) -> EventDraft {
    EventDraft::new(aggregate_id, INITIAL_EVENT_VERSION, CREATED)
}

pub fn incremented(aggregate_id: impl Into<String>, version: u64) -> EventDraft {
    EventDraft::new(aggregate_id, version, INCREMENTED)
}

pub fn decremented(aggregate_id: impl Into<String>, version: u64) -> EventDraft {
    EventDraft::new(aggregate_id, version, DECREMENTED)
}
