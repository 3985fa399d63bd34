use std::env;

// ============================================================================
// Application Configuration
// ============================================================================
//
// Read once from the environment at startup:
//
//   EVENT_STORE_BACKEND   memory | scylla            (default: memory)
//   SCYLLA_NODES          comma separated host:port  (default: 127.0.0.1:9042)
//   SCYLLA_KEYSPACE                                  (default: event_storage)
//   SCYLLA_EVENT_TABLE                               (default: events)
//   POUR_RATE_LIMIT       messages per second, unset = unthrottled
//
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Unknown event store backend `{0}` (expected `memory` or `scylla`)")]
    UnknownBackend(String),

    #[error("Invalid value `{value}` for {key}: {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Memory,
    Scylla,
}

impl std::str::FromStr for BackendKind {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "memory" | "in_memory" => Ok(Self::Memory),
            "scylla" | "scylladb" => Ok(Self::Scylla),
            other => Err(ConfigError::UnknownBackend(other.to_string())),
        }
    }
}

/// Connection and schema settings for the ScyllaDB event table
#[derive(Debug, Clone, PartialEq)]
pub struct ScyllaConfig {
    pub nodes: Vec<String>,
    pub keyspace: String,
    pub event_table: String,
    pub replication_factor: u32,
}

impl Default for ScyllaConfig {
    fn default() -> Self {
        Self {
            nodes: vec!["127.0.0.1:9042".to_string()],
            keyspace: "event_storage".to_string(),
            event_table: "events".to_string(),
            replication_factor: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub backend: BackendKind,
    pub scylla: ScyllaConfig,
    pub pour_rate_limit: Option<f64>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Memory,
            scylla: ScyllaConfig::default(),
            pour_rate_limit: None,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from any key lookup; unset keys keep defaults
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(backend) = lookup("EVENT_STORE_BACKEND") {
            config.backend = backend.parse()?;
        }

        if let Some(nodes) = lookup("SCYLLA_NODES") {
            let nodes: Vec<String> = nodes
                .split(',')
                .map(str::trim)
                .filter(|node| !node.is_empty())
                .map(str::to_string)
                .collect();
            if nodes.is_empty() {
                return Err(ConfigError::InvalidValue {
                    key: "SCYLLA_NODES",
                    value: String::new(),
                    reason: "at least one node is required".to_string(),
                });
            }
            config.scylla.nodes = nodes;
        }

        if let Some(keyspace) = lookup("SCYLLA_KEYSPACE") {
            config.scylla.keyspace = keyspace;
        }

        if let Some(table) = lookup("SCYLLA_EVENT_TABLE") {
            config.scylla.event_table = table;
        }

        if let Some(rate) = lookup("POUR_RATE_LIMIT") {
            let parsed: f64 = rate.trim().parse().map_err(|e: std::num::ParseFloatError| {
                ConfigError::InvalidValue {
                    key: "POUR_RATE_LIMIT",
                    value: rate.clone(),
                    reason: e.to_string(),
                }
            })?;
            if !(parsed.is_finite() && parsed > 0.0) {
                return Err(ConfigError::InvalidValue {
                    key: "POUR_RATE_LIMIT",
                    value: rate,
                    reason: "must be a positive number".to_string(),
                });
            }
            config.pour_rate_limit = Some(parsed);
        }

        Ok(config)
    }
}
