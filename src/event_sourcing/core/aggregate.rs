use serde::{de::DeserializeOwned, Deserialize, Serialize};

use super::error::StoreResult;
use super::event::EventDetail;

// ============================================================================
// Aggregate Pattern - Event Sourcing Core
// ============================================================================
//
// Key Principles:
// 1. State is derived from events (never stored as the source of truth)
// 2. Folding is sequential, in ascending version order
// 3. Snapshots are a cache of a fold result, never authoritative
//
// ============================================================================

/// An event-sourced aggregate: the fold of an aggregate's events
pub trait Aggregate: Serialize + DeserializeOwned + Clone + Send + Sync {
    fn aggregate_id(&self) -> &str;

    /// Version of the last event folded into this state
    fn version(&self) -> u64;
}

/// Caller-supplied fold step.
///
/// `state` is `None` for the very first event of an aggregate (there is no
/// seed state before it) and the previous result afterwards.
pub trait Reducer<A>: Send + Sync {
    fn reduce(&self, state: Option<A>, event: &EventDetail) -> A;
}

impl<A, F> Reducer<A> for F
where
    F: Fn(Option<A>, &EventDetail) -> A + Send + Sync,
{
    fn reduce(&self, state: Option<A>, event: &EventDetail) -> A {
        self(state, event)
    }
}

/// Fold `events` into `seed`, in the order given
pub fn fold_events<'a, A, R, I>(reducer: &R, seed: Option<A>, events: I) -> Option<A>
where
    R: Reducer<A> + ?Sized,
    I: IntoIterator<Item = &'a EventDetail>,
{
    events
        .into_iter()
        .fold(seed, |state, event| Some(reducer.reduce(state, event)))
}

// ============================================================================
// Snapshot
// ============================================================================

/// Cached aggregate state at a known version
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub aggregate_id: String,
    pub version: u64,
    pub state: serde_json::Value,
}

impl Snapshot {
    pub fn from_aggregate<A: Aggregate>(aggregate: &A) -> StoreResult<Self> {
        Ok(Self {
            aggregate_id: aggregate.aggregate_id().to_string(),
            version: aggregate.version(),
            state: serde_json::to_value(aggregate)?,
        })
    }

    pub fn to_aggregate<A: Aggregate>(&self) -> StoreResult<A> {
        Ok(serde_json::from_value(self.state.clone())?)
    }
}
