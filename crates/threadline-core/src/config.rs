use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_MAX_DEPTH, DEFAULT_RELAYS, MAX_EVENTS_PER_LEVEL, MAX_ROOT_WALK_DEPTH, PAGE_SIZE,
    RELAY_BUDGET_MS, ROOT_CACHE_CAPACITY, TREE_IDLE_SECS, TREE_MAX_AGE_SECS,
    UNIFIED_QUERY_TIMEOUT_MS, WORKER_TIMEOUT_MS,
};

/// NIP-10 conventions that events in the wild do not always honour.
///
/// Both default to on, matching what mainstream clients do. Turning them off
/// makes the engine stricter with malformed or adversarial events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ThreadPolicy {
    /// Treat the last unmarked `e` tag as the direct parent when no tag
    /// carries a marker (deprecated positional scheme).
    pub legacy_positional_parent: bool,
    /// Accept a `root` marker as the conversation root even when the root
    /// note itself cannot be fetched.
    pub trust_root_marker: bool,
}

impl Default for ThreadPolicy {
    fn default() -> Self {
        Self {
            legacy_positional_parent: true,
            trust_root_marker: true,
        }
    }
}

/// Engine configuration, loadable from a camelCase JSON file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    pub relays: Vec<String>,
    pub policy: ThreadPolicy,
    pub relay_budget_ms: u64,
    pub unified_query_timeout_ms: u64,
    pub page_size: usize,
    pub max_events_per_level: usize,
    pub default_max_depth: usize,
    pub worker_timeout_ms: u64,
    pub max_root_walk_depth: usize,
    pub root_cache_capacity: usize,
    pub tree_max_age_secs: u64,
    pub tree_idle_secs: u64,
    /// Directory for persisted trees. `None` keeps them in memory for the
    /// lifetime of the process.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            relays: DEFAULT_RELAYS.iter().map(|r| r.to_string()).collect(),
            policy: ThreadPolicy::default(),
            relay_budget_ms: RELAY_BUDGET_MS,
            unified_query_timeout_ms: UNIFIED_QUERY_TIMEOUT_MS,
            page_size: PAGE_SIZE,
            max_events_per_level: MAX_EVENTS_PER_LEVEL,
            default_max_depth: DEFAULT_MAX_DEPTH,
            worker_timeout_ms: WORKER_TIMEOUT_MS,
            max_root_walk_depth: MAX_ROOT_WALK_DEPTH,
            root_cache_capacity: ROOT_CACHE_CAPACITY,
            tree_max_age_secs: TREE_MAX_AGE_SECS,
            tree_idle_secs: TREE_IDLE_SECS,
            data_dir: None,
        }
    }
}

impl EngineConfig {
    /// Load config from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_json(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to deserialize engine config")
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize engine config")
    }

    pub fn relay_budget(&self) -> Duration {
        Duration::from_millis(self.relay_budget_ms)
    }

    pub fn unified_query_timeout(&self) -> Duration {
        Duration::from_millis(self.unified_query_timeout_ms)
    }

    pub fn worker_timeout(&self) -> Duration {
        Duration::from_millis(self.worker_timeout_ms)
    }

    pub fn tree_max_age(&self) -> Duration {
        Duration::from_secs(self.tree_max_age_secs)
    }

    pub fn tree_idle(&self) -> Duration {
        Duration::from_secs(self.tree_idle_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_json_yields_defaults() {
        let config = EngineConfig::from_json("{}").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert!(config.policy.legacy_positional_parent);
        assert!(config.policy.trust_root_marker);
    }

    #[test]
    fn test_parse_partial_config() {
        let json = r#"{
            "relays": ["wss://relay.example.com"],
            "relayBudgetMs": 1500,
            "policy": { "legacyPositionalParent": false },
            "dataDir": "/tmp/threadline"
        }"#;
        let config = EngineConfig::from_json(json).unwrap();
        assert_eq!(config.relays, vec!["wss://relay.example.com".to_string()]);
        assert_eq!(config.relay_budget(), Duration::from_millis(1500));
        assert!(!config.policy.legacy_positional_parent);
        // Unspecified policy fields keep their defaults
        assert!(config.policy.trust_root_marker);
        assert_eq!(config.data_dir, Some(PathBuf::from("/tmp/threadline")));
        assert_eq!(config.page_size, PAGE_SIZE);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("threadline.json");
        std::fs::write(&path, r#"{"defaultMaxDepth": 2}"#).unwrap();

        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.default_max_depth, 2);
    }

    #[test]
    fn test_load_missing_file_reports_path() {
        let err = EngineConfig::load(Path::new("/nonexistent/threadline.json")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/threadline.json"));
    }
}
