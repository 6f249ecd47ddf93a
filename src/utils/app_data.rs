use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

const APP_NAME: &str = "fxagg";
const CONFIG_FILE: &str = "config.json";

/// What to do when a query exceeds its time budget
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeoutPolicy {
    /// Return whatever rows were produced so far
    #[default]
    Return,
    /// Fail the whole query
    Fail,
}

/// Engine-wide limits and defaults, threaded into every request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum `offset + limit` for search requests
    #[serde(default = "default_max_search_results")]
    pub max_search_results: u64,

    /// Maximum `offset + limit` for aggregate requests
    #[serde(default = "default_max_aggregate_results")]
    pub max_aggregate_results: u64,

    /// Query dialect used when the request does not name one
    #[serde(default = "default_dialect")]
    pub default_dialect: u32,

    /// Per-query time budget in milliseconds (0 disables the check)
    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,

    #[serde(default)]
    pub timeout_policy: TimeoutPolicy,

    /// Upper bound for a cursor's MAXIDLE
    #[serde(default = "default_cursor_max_idle_ms")]
    pub cursor_max_idle_ms: u64,

    /// Rows returned per cursor read when COUNT is not given
    #[serde(default = "default_cursor_read_size")]
    pub cursor_read_size: usize,

    /// Maximum number of live cursors
    #[serde(default = "default_cursor_max_count")]
    pub cursor_max_count: usize,

    /// Default factor for the BM25STD.TANH scorer
    #[serde(default = "default_bm25std_tanh_factor")]
    pub bm25std_tanh_factor: u64,

    /// Scoring function used when SCORER is not given
    #[serde(default = "default_scorer")]
    pub default_scorer: String,
}

fn default_max_search_results() -> u64 {
    1_000_000
}

fn default_max_aggregate_results() -> u64 {
    u64::MAX
}

fn default_dialect() -> u32 {
    1
}

fn default_query_timeout_ms() -> u64 {
    500
}

fn default_cursor_max_idle_ms() -> u64 {
    300_000
}

fn default_cursor_read_size() -> usize {
    1000
}

fn default_cursor_max_count() -> usize {
    128
}

fn default_bm25std_tanh_factor() -> u64 {
    4
}

fn default_scorer() -> String {
    "TFIDF".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_search_results: default_max_search_results(),
            max_aggregate_results: default_max_aggregate_results(),
            default_dialect: default_dialect(),
            query_timeout_ms: default_query_timeout_ms(),
            timeout_policy: TimeoutPolicy::default(),
            cursor_max_idle_ms: default_cursor_max_idle_ms(),
            cursor_read_size: default_cursor_read_size(),
            cursor_max_count: default_cursor_max_count(),
            bm25std_tanh_factor: default_bm25std_tanh_factor(),
            default_scorer: default_scorer(),
        }
    }
}

impl EngineConfig {
    /// Load config from the app config directory, or return default if not found
    pub fn load_default() -> Result<Self> {
        let config_path = get_config_path()?;
        Self::load(&config_path)
    }

    /// Load config from an explicit path, or return default if it does not exist
    pub fn load(config_path: &Path) -> Result<Self> {
        if config_path.exists() {
            let content = fs::read_to_string(config_path)
                .with_context(|| format!("Failed to read config file {}", config_path.display()))?;
            let config: EngineConfig =
                serde_json::from_str(&content).context("Failed to parse config file")?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save config to the given path
    pub fn save(&self, config_path: &Path) -> Result<()> {
        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(config_path, content).context("Failed to write config file")?;
        Ok(())
    }
}

/// Get the path to the config file
pub fn get_config_path() -> Result<PathBuf> {
    let base = dirs::config_dir().context("Could not determine config directory")?;
    Ok(base.join(APP_NAME).join(CONFIG_FILE))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::load(&dir.path().join("nope.json")).unwrap();
        assert_eq!(config.max_search_results, 1_000_000);
        assert_eq!(config.timeout_policy, TimeoutPolicy::Return);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"max_search_results": 50, "timeout_policy": "fail"}"#).unwrap();

        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.max_search_results, 50);
        assert_eq!(config.timeout_policy, TimeoutPolicy::Fail);
        assert_eq!(config.default_dialect, 1);
        assert_eq!(config.cursor_read_size, 1000);
    }

    #[test]
    fn test_save_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub").join("config.json");
        let mut config = EngineConfig::default();
        config.query_timeout_ms = 0;
        config.save(&path).unwrap();

        let loaded = EngineConfig::load(&path).unwrap();
        assert_eq!(loaded.query_timeout_ms, 0);
    }
}
