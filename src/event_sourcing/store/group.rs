use chrono::{DateTime, Utc};

use crate::event_sourcing::core::{
    AppendContext, AppendOutput, EventDetail, EventDraft, StoreError, StoreResult,
};

use super::backend::Backend;
use super::in_memory::{AppliedWrite, InMemoryEventStore};

// ============================================================================
// Grouped Event Append - cross-aggregate pseudo-transaction
// ============================================================================
//
// Writes events for several aggregates (possibly in several stores) as one
// logical unit. The in-memory backend has no multi-row transaction, so the
// group is made all-or-nothing by compensation:
//
// 1. Validate every intent (backend, context, draft) and unify timestamps
//    before anything is written
// 2. Append in submission order
// 3. On the first failure, undo the applied writes in reverse order. If an
//    undo finds the aggregate head moved (a concurrent writer appended on
//    top), stop and report GroupRollbackFailure wrapping the original error
//
// Readers may observe a group half-applied; there is no read isolation.
//
// ============================================================================

/// One event of a group, bound to the backend and context it is written with
#[derive(Clone)]
pub struct GroupedEvent {
    pub backend: Option<Backend>,
    pub event: EventDraft,
    pub context: Option<AppendContext>,
}

impl GroupedEvent {
    pub fn new(event: EventDraft) -> Self {
        Self {
            backend: None,
            event,
            context: None,
        }
    }

    pub fn with_backend(mut self, backend: impl Into<Backend>) -> Self {
        self.backend = Some(backend.into());
        self
    }

    pub fn with_context(mut self, context: AppendContext) -> Self {
        self.context = Some(context);
        self
    }
}

/// Options shared by every event of a group
#[derive(Clone, Copy, Debug, Default)]
pub struct GroupOptions {
    pub force: bool,
}

/// Validated intent, ready to be written
struct PreparedWrite {
    store: InMemoryEventStore,
    draft: EventDraft,
    context: AppendContext,
}

/// Validation failure of intent `index`, naming the event it carries
fn invalid(index: usize, event: &EventDraft, reason: impl Into<String>) -> StoreError {
    StoreError::GroupValidation {
        index,
        aggregate_id: event.aggregate_id.clone(),
        version: event.version,
        reason: reason.into(),
    }
}

/// Append a group of events all-or-nothing
pub async fn append_event_group(
    options: GroupOptions,
    intents: Vec<GroupedEvent>,
) -> StoreResult<Vec<AppendOutput>> {
    // Pass 1: validate and find the single caller-supplied timestamp
    let mut prepared = Vec::with_capacity(intents.len());
    let mut supplied_timestamp: Option<(usize, DateTime<Utc>)> = None;

    for (index, intent) in intents.into_iter().enumerate() {
        let store = match intent.backend {
            Some(Backend::InMemory(store)) => store,
            Some(backend) => {
                return Err(invalid(
                    index,
                    &intent.event,
                    format!("the {} backend does not support grouped writes", backend.name()),
                ))
            }
            None => {
                return Err(invalid(
                    index,
                    &intent.event,
                    "event is not connected to a storage backend",
                ))
            }
        };

        let Some(context) = intent.context else {
            return Err(invalid(index, &intent.event, "event misses context"));
        };

        intent.event.validate()?;

        if let Some(timestamp) = intent.event.timestamp {
            match supplied_timestamp {
                None => supplied_timestamp = Some((index, timestamp)),
                Some((first_index, first_timestamp)) if first_timestamp != timestamp => {
                    return Err(invalid(
                        index,
                        &intent.event,
                        format!(
                            "event has timestamp {} but event #{} has timestamp {}",
                            timestamp.to_rfc3339(),
                            first_index,
                            first_timestamp.to_rfc3339()
                        ),
                    ));
                }
                Some(_) => {}
            }
        }

        prepared.push(PreparedWrite {
            store,
            draft: intent.event,
            context: AppendContext {
                force: context.force || options.force,
                ..context
            },
        });
    }

    let Some(first) = prepared.first() else {
        return Ok(Vec::new());
    };

    // Pass 2: one timestamp for every event of the group
    let timestamp = match supplied_timestamp {
        Some((_, timestamp)) => timestamp,
        None => first.store.clock().now(),
    };
    let metrics = first.store.metrics().cloned();
    let event_count = prepared.len();

    let mut applied: Vec<(InMemoryEventStore, AppliedWrite)> = Vec::with_capacity(event_count);

    for write in prepared {
        let event: EventDetail = write.draft.stamp(timestamp);
        let outcome = write.store.write_event(event, &write.context).await;
        write.store.record_append(&outcome);

        match outcome {
            Ok(applied_write) => applied.push((write.store, applied_write)),
            Err(error) => {
                tracing::warn!(
                    error = %error,
                    applied_count = applied.len(),
                    "Event group append failed, reverting applied events"
                );

                let error = revert(applied, error).await;
                if let Some(metrics) = &metrics {
                    let outcome = if error.is_rollback_failure() {
                        "rollback_failed"
                    } else {
                        "rolled_back"
                    };
                    metrics.record_event_group(outcome);
                }
                return Err(error);
            }
        }
    }

    tracing::info!(
        event_count = event_count,
        timestamp = %timestamp.to_rfc3339(),
        "✅ Appended event group"
    );
    if let Some(metrics) = &metrics {
        metrics.record_event_group("committed");
    }

    Ok(applied
        .into_iter()
        .map(|(_, applied_write)| AppendOutput { event: applied_write.event })
        .collect())
}

/// Undo applied writes, newest first. Returns the error to surface.
async fn revert(
    applied: Vec<(InMemoryEventStore, AppliedWrite)>,
    error: StoreError,
) -> StoreError {
    for (store, applied_write) in applied.iter().rev() {
        if !store.revert_write(applied_write).await {
            tracing::error!(
                aggregate_id = %applied_write.event.aggregate_id,
                version = applied_write.event.version,
                original_error = %error,
                "💀 Unable to revert partially pushed event group"
            );
            return StoreError::GroupRollbackFailure {
                aggregate_id: applied_write.event.aggregate_id.clone(),
                version: applied_write.event.version,
                source: Box::new(error),
            };
        }
    }

    error
}
