use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::{StoreError, StoreResult};

// ============================================================================
// Event Detail - the immutable stored fact
// ============================================================================
//
// An event belongs to exactly one aggregate and is identified by
// (aggregate_id, version). Versions start at 1 and grow by one; the version 1
// event is the aggregate's "initial event" and is what aggregate discovery
// (list_aggregate_ids) is built on.
//
// ============================================================================

/// Version of the event that creates an aggregate
pub const INITIAL_EVENT_VERSION: u64 = 1;

/// A stored event
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EventDetail {
    pub aggregate_id: String,
    pub version: u64,
    #[serde(rename = "type")]
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl EventDetail {
    pub fn is_initial_event(&self) -> bool {
        self.version == INITIAL_EVENT_VERSION
    }

    /// Strip the timestamp, e.g. to re-submit a stored event as a draft
    pub fn into_draft(self) -> EventDraft {
        EventDraft {
            aggregate_id: self.aggregate_id,
            version: self.version,
            event_type: self.event_type,
            timestamp: Some(self.timestamp),
            payload: self.payload,
            metadata: self.metadata,
        }
    }
}

// ============================================================================
// Event Draft - an event that has not been written yet
// ============================================================================

/// An event as submitted by a caller. The timestamp is optional: storage
/// adapters stamp it at the moment of the write when absent.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EventDraft {
    pub aggregate_id: String,
    pub version: u64,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl EventDraft {
    pub fn new(
        aggregate_id: impl Into<String>,
        version: u64,
        event_type: impl Into<String>,
    ) -> Self {
        Self {
            aggregate_id: aggregate_id.into(),
            version,
            event_type: event_type.into(),
            timestamp: None,
            payload: None,
            metadata: None,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Reject drafts that can never be stored
    pub fn validate(&self) -> StoreResult<()> {
        if self.aggregate_id.is_empty() {
            return Err(StoreError::InvalidEvent {
                aggregate_id: self.aggregate_id.clone(),
                version: self.version,
                reason: "aggregate id must not be empty",
            });
        }

        if self.version < INITIAL_EVENT_VERSION {
            return Err(StoreError::InvalidEvent {
                aggregate_id: self.aggregate_id.clone(),
                version: self.version,
                reason: "version must be at least 1",
            });
        }

        Ok(())
    }

    /// Turn the draft into a stored event, keeping a caller-supplied
    /// timestamp and falling back to `write_time` otherwise
    pub fn stamp(self, write_time: DateTime<Utc>) -> EventDetail {
        EventDetail {
            aggregate_id: self.aggregate_id,
            version: self.version,
            event_type: self.event_type,
            timestamp: self.timestamp.unwrap_or(write_time),
            payload: self.payload,
            metadata: self.metadata,
        }
    }
}

// ============================================================================
// Append Context
// ============================================================================

/// Per-event context passed to an append
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AppendContext {
    /// Identity of the logical event store owning the aggregate
    pub event_store_id: String,
    /// Overwrite an existing version instead of failing. Testing escape
    /// hatch, honoured by the in-memory backend only.
    pub force: bool,
}

impl AppendContext {
    pub fn new(event_store_id: impl Into<String>) -> Self {
        Self {
            event_store_id: event_store_id.into(),
            force: false,
        }
    }

    pub fn forced(mut self) -> Self {
        self.force = true;
        self
    }
}

/// Result of a successful append
#[derive(Clone, Debug, PartialEq)]
pub struct AppendOutput {
    pub event: EventDetail,
}
