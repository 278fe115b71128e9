//! Domain and context configuration.

use std::time::Duration;

use rowgraph_core::{Error, Result};
use serde::{Deserialize, Serialize};

/// Which merge policy a context starts with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergePolicyKind {
    /// Accept every externally arrived change.
    #[default]
    AcceptAll,
    /// Keep local state; ignore external updates and deletes.
    KeepLocal,
}

/// Configuration shared by every context of one domain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DomainConfig {
    /// Maximum number of key values in one disjoint-by-id prefetch qualifier.
    pub max_id_qualifier_size: usize,
    /// Maximum number of cached snapshots.
    pub snapshot_cache_size: usize,
    /// Snapshot lifetime in seconds.
    pub snapshot_expiration_secs: u64,
    /// Share one snapshot cache between all root contexts.
    pub shared_cache: bool,
}

impl Default for DomainConfig {
    fn default() -> Self {
        Self {
            max_id_qualifier_size: 10_000,
            snapshot_cache_size: 10_000,
            snapshot_expiration_secs: 2 * 60 * 60,
            shared_cache: true,
        }
    }
}

impl DomainConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from JSON; absent fields keep their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| Error::Config(rowgraph_core::ConfigError {
                message: "invalid domain configuration".to_string(),
                source: Some(Box::new(e)),
            }))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_id_qualifier_size == 0 {
            return Err(Error::config("max_id_qualifier_size must be positive"));
        }
        if self.snapshot_cache_size == 0 {
            return Err(Error::config("snapshot_cache_size must be positive"));
        }
        if self.snapshot_expiration_secs == 0 {
            return Err(Error::config("snapshot_expiration_secs must be positive"));
        }
        Ok(())
    }

    #[must_use]
    pub fn max_id_qualifier_size(mut self, n: usize) -> Self {
        self.max_id_qualifier_size = n;
        self
    }

    #[must_use]
    pub fn snapshot_cache_size(mut self, n: usize) -> Self {
        self.snapshot_cache_size = n;
        self
    }

    #[must_use]
    pub fn snapshot_expiration(mut self, expiration: Duration) -> Self {
        self.snapshot_expiration_secs = expiration.as_secs();
        self
    }

    #[must_use]
    pub fn shared_cache(mut self, shared: bool) -> Self {
        self.shared_cache = shared;
        self
    }

    pub fn expiration(&self) -> Duration {
        Duration::from_secs(self.snapshot_expiration_secs)
    }
}

/// Per-context behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Run mandatory-property checks and validators before commit.
    pub validate_on_commit: bool,
    /// Receive snapshot events from the shared cache.
    pub subscribe_to_snapshot_events: bool,
    pub merge_policy: MergePolicyKind,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            validate_on_commit: true,
            subscribe_to_snapshot_events: true,
            merge_policy: MergePolicyKind::AcceptAll,
        }
    }
}

impl ContextConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| {
            Error::Config(rowgraph_core::ConfigError {
                message: "invalid context configuration".to_string(),
                source: Some(Box::new(e)),
            })
        })
    }

    #[must_use]
    pub fn validate_on_commit(mut self, validate: bool) -> Self {
        self.validate_on_commit = validate;
        self
    }

    #[must_use]
    pub fn subscribe_to_snapshot_events(mut self, subscribe: bool) -> Self {
        self.subscribe_to_snapshot_events = subscribe;
        self
    }

    #[must_use]
    pub fn merge_policy(mut self, kind: MergePolicyKind) -> Self {
        self.merge_policy = kind;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_defaults() {
        let config = DomainConfig::default();
        assert_eq!(config.max_id_qualifier_size, 10_000);
        assert_eq!(config.snapshot_cache_size, 10_000);
        assert_eq!(config.expiration(), Duration::from_secs(7200));
        assert!(config.shared_cache);
    }

    #[test]
    fn test_domain_from_json_keeps_defaults() {
        let config = DomainConfig::from_json(r#"{"max_id_qualifier_size": 3}"#).unwrap();
        assert_eq!(config.max_id_qualifier_size, 3);
        assert_eq!(config.snapshot_cache_size, 10_000);
    }

    #[test]
    fn test_zero_sizes_rejected() {
        let err = DomainConfig::from_json(r#"{"snapshot_cache_size": 0}"#).unwrap_err();
        assert!(err.is_fatal_mapping());
        assert!(DomainConfig::new().max_id_qualifier_size(0).validate().is_err());
        assert!(DomainConfig::from_json("not json").is_err());
    }

    #[test]
    fn test_zero_expiration_rejected() {
        let err = DomainConfig::from_json(r#"{"snapshot_expiration_secs": 0}"#).unwrap_err();
        assert!(err.to_string().contains("snapshot_expiration_secs"));
        assert!(DomainConfig::new().snapshot_expiration(Duration::from_millis(500)).validate().is_err());
        assert!(DomainConfig::new().snapshot_expiration(Duration::from_secs(1)).validate().is_ok());
    }

    #[test]
    fn test_context_config_builder_and_json() {
        let config = ContextConfig::new()
            .validate_on_commit(false)
            .merge_policy(MergePolicyKind::KeepLocal);
        assert!(!config.validate_on_commit);
        let parsed = ContextConfig::from_json(r#"{"merge_policy": "keep_local"}"#).unwrap();
        assert_eq!(parsed.merge_policy, MergePolicyKind::KeepLocal);
        assert!(parsed.subscribe_to_snapshot_events);
    }
}
