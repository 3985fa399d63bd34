use serde::{Deserialize, Serialize};

use crate::event_sourcing::core::{Aggregate, EventDetail};

use super::events::{CREATED, DECREMENTED, INCREMENTED};

// ============================================================================
// Counter Aggregate - Domain Logic
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CounterAggregate {
    pub aggregate_id: String,
    pub version: u64,
    pub count: i64,
}

impl Aggregate for CounterAggregate {
    fn aggregate_id(&self) -> &str {
        &self.aggregate_id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Reducer: CREATED zeroes the count, INCREMENTED and DECREMENTED move it by
/// one. Unknown event types only advance the version.
pub fn reduce(state: Option<CounterAggregate>, event: &EventDetail) -> CounterAggregate {
    let count = state.map_or(0, |counter| counter.count);

    let count = match event.event_type.as_str() {
        CREATED => 0,
        INCREMENTED => count + 1,
        DECREMENTED => count - 1,
        _ => count,
    };

    CounterAggregate {
        aggregate_id: event.aggregate_id.clone(),
        version: event.version,
        count,
    }
}
