use std::sync::Arc;

use super::adapter::EventStorageAdapter;
use super::in_memory::InMemoryEventStore;

/// The set of storage backends an event store can be bound to.
///
/// Grouped writes need to know which backend they are talking to (they
/// compensate through backend internals), so the backend is a closed enum
/// rather than a bare trait object.
#[derive(Clone)]
pub enum Backend {
    InMemory(InMemoryEventStore),
    /// Any durable adapter, e.g. `DurableEventStore<ScyllaEventTable>`
    Durable(Arc<dyn EventStorageAdapter>),
}

impl Backend {
    pub fn durable<A>(adapter: A) -> Self
    where
        A: EventStorageAdapter + 'static,
    {
        Self::Durable(Arc::new(adapter))
    }

    pub fn adapter(&self) -> &dyn EventStorageAdapter {
        match self {
            Self::InMemory(store) => store,
            Self::Durable(adapter) => adapter.as_ref(),
        }
    }

    /// Whether the backend can take part in `append_event_group`
    pub fn supports_grouped_writes(&self) -> bool {
        match self {
            Self::InMemory(_) => true,
            // Conditional writes cannot be batched across partitions
            Self::Durable(_) => false,
        }
    }

    pub fn name(&self) -> &'static str {
        self.adapter().backend_name()
    }
}

impl From<InMemoryEventStore> for Backend {
    fn from(store: InMemoryEventStore) -> Self {
        Self::InMemory(store)
    }
}
