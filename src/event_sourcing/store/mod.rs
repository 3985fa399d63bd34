// ============================================================================
// Event Sourcing Store - Generic Persistence Layer
// ============================================================================
//
// Storage adapter contract, its two backends, grouped writes across
// backends, and the aggregate reconstruction engine on top.
//
// ============================================================================

pub mod adapter;
pub mod backend;
pub mod durable;
pub mod event_store;
pub mod group;
pub mod in_memory;

pub use adapter::EventStorageAdapter;
pub use backend::Backend;
pub use durable::{DurableEventStore, EventTable, ScyllaEventTable};
pub use event_store::{AggregateOutput, EventStore};
pub use group::{append_event_group, GroupOptions, GroupedEvent};
pub use in_memory::InMemoryEventStore;
