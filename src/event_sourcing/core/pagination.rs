use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::{StoreError, StoreResult};

// ============================================================================
// Version range queries (events and snapshots)
// ============================================================================

/// Range/order/limit applied to an aggregate's events or snapshots
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VersionQuery {
    pub min_version: Option<u64>,
    pub max_version: Option<u64>,
    pub reverse: bool,
    pub limit: Option<usize>,
}

impl VersionQuery {
    pub fn min_version(mut self, version: u64) -> Self {
        self.min_version = Some(version);
        self
    }

    pub fn max_version(mut self, version: u64) -> Self {
        self.max_version = Some(version);
        self
    }

    pub fn reversed(mut self) -> Self {
        self.reverse = true;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn contains(&self, version: u64) -> bool {
        self.min_version.map_or(true, |min| version >= min)
            && self.max_version.map_or(true, |max| version <= max)
    }

    /// Filter, order and cap items that are already sorted by ascending
    /// version. The limit is applied after ordering.
    pub fn apply<T>(
        &self,
        ascending: impl IntoIterator<Item = T>,
        version_of: impl Fn(&T) -> u64,
    ) -> Vec<T> {
        let mut items: Vec<T> = ascending
            .into_iter()
            .filter(|item| self.contains(version_of(item)))
            .collect();

        if self.reverse {
            items.reverse();
        }

        if let Some(limit) = self.limit {
            items.truncate(limit);
        }

        items
    }
}

// ============================================================================
// Aggregate id listing
// ============================================================================

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ListAggregateIdsOptions {
    pub limit: Option<u32>,
    /// Inclusive lower bound on the initial event timestamp
    pub initial_event_after: Option<DateTime<Utc>>,
    /// Inclusive upper bound on the initial event timestamp
    pub initial_event_before: Option<DateTime<Utc>>,
    pub reverse: bool,
    /// Token returned by a previous page. Carries the whole query, so it
    /// cannot be combined with any other option.
    pub page_token: Option<String>,
}

impl ListAggregateIdsOptions {
    pub fn with_limit(limit: u32) -> Self {
        Self {
            limit: Some(limit),
            ..Self::default()
        }
    }

    pub fn from_page_token(page_token: impl Into<String>) -> Self {
        Self {
            page_token: Some(page_token.into()),
            ..Self::default()
        }
    }

    pub fn initial_event_after(mut self, timestamp: DateTime<Utc>) -> Self {
        self.initial_event_after = Some(timestamp);
        self
    }

    pub fn initial_event_before(mut self, timestamp: DateTime<Utc>) -> Self {
        self.initial_event_before = Some(timestamp);
        self
    }

    pub fn reversed(mut self) -> Self {
        self.reverse = true;
        self
    }

    /// Decode the incoming token, rejecting it when fresh query options were
    /// passed alongside
    pub fn take_page_token(&self) -> StoreResult<Option<PageToken>> {
        let Some(raw) = &self.page_token else {
            return Ok(None);
        };

        if self.limit.is_some()
            || self.initial_event_after.is_some()
            || self.initial_event_before.is_some()
            || self.reverse
        {
            return Err(StoreError::PaginationToken(
                "a page token cannot be combined with limit, bounds or reverse options".to_string(),
            ));
        }

        PageToken::unmarshal(raw).map(Some)
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ListAggregateIdsOutput {
    pub aggregate_ids: Vec<String>,
    /// Absent on the last page
    pub next_page_token: Option<String>,
}

// ============================================================================
// Page Token
// ============================================================================
//
// One tagged variant per pagination strategy, serialized through a single
// versioned envelope (JSON, then URL-safe base64). A token produced by one
// backend fails to decode as the other backend's variant instead of being
// misread.
//
// ============================================================================

const PAGE_TOKEN_FORMAT_VERSION: u8 = 1;

/// Position of the last aggregate returned by a full scan
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LastEvaluatedAggregate {
    pub aggregate_id: String,
    pub initial_event_timestamp: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum PageToken {
    /// Native resume key of the durable table's paged index query
    #[serde(rename_all = "camelCase")]
    Remote {
        limit: u32,
        #[serde(default)]
        reverse: bool,
        paging_state: Vec<u8>,
    },

    /// Cursor over the in-memory full scan
    #[serde(rename_all = "camelCase")]
    FullScan {
        limit: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        initial_event_after: Option<DateTime<Utc>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        initial_event_before: Option<DateTime<Utc>>,
        #[serde(default)]
        reverse: bool,
        last_evaluated: LastEvaluatedAggregate,
    },
}

#[derive(Serialize, Deserialize)]
struct TokenEnvelope {
    v: u8,
    token: PageToken,
}

impl PageToken {
    pub fn marshal(&self) -> StoreResult<String> {
        let envelope = TokenEnvelope {
            v: PAGE_TOKEN_FORMAT_VERSION,
            token: self.clone(),
        };
        Ok(URL_SAFE_NO_PAD.encode(serde_json::to_vec(&envelope)?))
    }

    pub fn unmarshal(raw: &str) -> StoreResult<Self> {
        let bytes = URL_SAFE_NO_PAD
            .decode(raw)
            .map_err(|e| StoreError::PaginationToken(format!("not base64: {}", e)))?;

        let envelope: TokenEnvelope = serde_json::from_slice(&bytes)
            .map_err(|e| StoreError::PaginationToken(format!("malformed token: {}", e)))?;

        if envelope.v != PAGE_TOKEN_FORMAT_VERSION {
            return Err(StoreError::PaginationToken(format!(
                "unsupported token format version {}",
                envelope.v
            )));
        }

        Ok(envelope.token)
    }

    pub fn limit(&self) -> u32 {
        match self {
            Self::Remote { limit, .. } | Self::FullScan { limit, .. } => *limit,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn full_scan_token() -> PageToken {
        PageToken::FullScan {
            limit: 1,
            initial_event_after: Some(Utc.with_ymd_and_hms(2021, 2, 1, 0, 0, 0).unwrap()),
            initial_event_before: None,
            reverse: true,
            last_evaluated: LastEvaluatedAggregate {
                aggregate_id: "A".to_string(),
                initial_event_timestamp: Utc.with_ymd_and_hms(2022, 1, 1, 0, 0, 0).unwrap(),
            },
        }
    }

    #[test]
    fn test_tokens_round_trip() {
        let remote = PageToken::Remote {
            limit: 2,
            reverse: true,
            paging_state: vec![0, 1, 254, 255],
        };
        for token in [remote, full_scan_token()] {
            let raw = token.marshal().unwrap();
            assert_eq!(PageToken::unmarshal(&raw).unwrap(), token);
        }
    }

    #[test]
    fn test_garbage_token_is_rejected() {
        assert!(matches!(
            PageToken::unmarshal("not a token!"),
            Err(StoreError::PaginationToken(_))
        ));

        let not_json = URL_SAFE_NO_PAD.encode(b"{\"v\":1");
        assert!(matches!(
            PageToken::unmarshal(&not_json),
            Err(StoreError::PaginationToken(_))
        ));
    }

    #[test]
    fn test_unknown_format_version_is_rejected() {
        let raw = URL_SAFE_NO_PAD.encode(
            br#"{"v":9,"token":{"kind":"remote","limit":2,"pagingState":[1]}}"#,
        );
        assert!(matches!(
            PageToken::unmarshal(&raw),
            Err(StoreError::PaginationToken(message)) if message.contains("version 9")
        ));
    }

    #[test]
    fn test_token_with_fresh_limit_is_ambiguous() {
        let raw = full_scan_token().marshal().unwrap();
        let mut options = ListAggregateIdsOptions::from_page_token(raw);
        assert!(options.take_page_token().unwrap().is_some());

        options.limit = Some(5);
        assert!(matches!(
            options.take_page_token(),
            Err(StoreError::PaginationToken(_))
        ));
    }

    #[test]
    fn test_version_query_applies_limit_after_ordering() {
        let versions = vec![1u64, 2, 3, 4];

        let query = VersionQuery::default().min_version(2).reversed().limit(2);
        assert_eq!(query.apply(versions.clone(), |v| *v), vec![4, 3]);

        let query = VersionQuery::default().max_version(2);
        assert_eq!(query.apply(versions, |v| *v), vec![1, 2]);
    }
}
