//! ClubSync configuration system.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{ClubSyncError, Result};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClubSyncConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub runner: RunnerConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default = "default_sources")]
    pub sources: BTreeMap<String, SourceConfig>,
}

impl ClubSyncConfig {
    /// Load config from the default path (~/.clubsync/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::with_default_sources())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ClubSyncError::Configuration(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| ClubSyncError::Configuration(format!("Failed to parse config: {e}")))?;
        Ok(config)
    }

    /// Save config to the default path.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::default_path())
    }

    /// Save config to the given path.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self).map_err(|e| {
            ClubSyncError::Configuration(format!("Failed to serialize config: {e}"))
        })?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the ClubSync home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".clubsync")
    }

    /// Defaults plus the built-in data sources.
    pub fn with_default_sources() -> Self {
        Self {
            sources: default_sources(),
            ..Self::default()
        }
    }

    /// Look up the endpoint settings for a platform.
    pub fn source(&self, platform: &str) -> Result<&SourceConfig> {
        self.sources.get(platform).ok_or_else(|| {
            ClubSyncError::Configuration(format!("No data source configured for '{platform}'"))
        })
    }
}

/// Trigger loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,
    /// The loop stops itself after this many failed ticks in a row.
    #[serde(default = "default_max_consecutive_errors")]
    pub max_consecutive_errors: u32,
    /// Let the runner pre-enqueue its own next execution.
    #[serde(default = "bool_true")]
    pub self_schedule: bool,
}

fn bool_true() -> bool { true }
fn default_tick_interval() -> u64 { 60 }
fn default_max_consecutive_errors() -> u32 { 5 }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval(),
            max_consecutive_errors: default_max_consecutive_errors(),
            self_schedule: true,
        }
    }
}

/// Job queue settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay")]
    pub base_delay_secs: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: u32,
    #[serde(default = "default_job_timeout")]
    pub job_timeout_secs: u64,
}

fn default_workers() -> usize { 2 }
fn default_max_attempts() -> u32 { 3 }
fn default_base_delay() -> u64 { 30 }
fn default_multiplier() -> u32 { 2 }
fn default_job_timeout() -> u64 { 600 }

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            max_attempts: default_max_attempts(),
            base_delay_secs: default_base_delay(),
            multiplier: default_multiplier(),
            job_timeout_secs: default_job_timeout(),
        }
    }
}

/// Task runner settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Report `partial` instead of `error` when some entities were
    /// collected before a fetch failure.
    #[serde(default = "bool_true")]
    pub partial_on_prior_success: bool,
    /// Wall-clock budget for one run, fetch retries included. When it runs
    /// out the run is recorded as failed with the counts collected so far.
    #[serde(default = "default_run_timeout")]
    pub run_timeout_secs: u64,
}

fn default_run_timeout() -> u64 { 540 }

impl RunnerConfig {
    /// Same settings with the run budget kept below a queue job timeout,
    /// leaving a tenth of it for writing the execution record.
    pub fn capped_to(&self, job_timeout_secs: u64) -> Self {
        let ceiling = job_timeout_secs - job_timeout_secs / 10;
        Self {
            run_timeout_secs: self.run_timeout_secs.min(ceiling).max(1),
            ..self.clone()
        }
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            partial_on_prior_success: true,
            run_timeout_secs: default_run_timeout(),
        }
    }
}

/// Response cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_ttl")]
    pub ttl_secs: u64,
}

fn default_cache_ttl() -> u64 { 300 }

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_cache_ttl(),
        }
    }
}

/// Storage settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

fn default_db_path() -> String { "~/.clubsync/clubsync.db".into() }

impl StorageConfig {
    /// Database path with `~` expanded.
    pub fn resolved_db_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.db_path).to_string())
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

/// Endpoint layout of one external platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub base_url: String,
    /// Path template with `{name}`.
    #[serde(default = "default_lookup_path")]
    pub lookup_path: String,
    /// Path template with `{key}` and `{task_type}`.
    #[serde(default = "default_items_path")]
    pub items_path: String,
    /// Minimum spacing between requests to this platform.
    #[serde(default = "default_min_interval")]
    pub min_interval_ms: u64,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub user_agent: Option<String>,
    /// JSON pointer to the item array, per task type. Missing = document root.
    #[serde(default)]
    pub items_pointers: BTreeMap<String, String>,
}

fn default_lookup_path() -> String { "/clubs/{name}".into() }
fn default_items_path() -> String { "/clubs/{key}/{task_type}".into() }
fn default_min_interval() -> u64 { 250 }
fn default_timeout() -> u64 { 30 }

impl SourceConfig {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            lookup_path: default_lookup_path(),
            items_path: default_items_path(),
            min_interval_ms: default_min_interval(),
            timeout_secs: default_timeout(),
            user_agent: None,
            items_pointers: BTreeMap::new(),
        }
    }

    /// Placeholders are filled with percent-encoded path segments.
    pub fn lookup_url(&self, name: &str) -> String {
        format!(
            "{}{}",
            self.base_url.trim_end_matches('/'),
            self.lookup_path.replace("{name}", &urlencoding::encode(name))
        )
    }

    pub fn items_url(&self, key: &str, task_type: &str) -> String {
        format!(
            "{}{}",
            self.base_url.trim_end_matches('/'),
            self.items_path
                .replace("{key}", &urlencoding::encode(key))
                .replace("{task_type}", &urlencoding::encode(task_type))
        )
    }

    /// JSON pointer for a task type ("" = root).
    pub fn items_pointer(&self, task_type: &str) -> &str {
        self.items_pointers
            .get(task_type)
            .map(String::as_str)
            .unwrap_or("")
    }
}

fn default_sources() -> BTreeMap<String, SourceConfig> {
    let mut chesscom = SourceConfig::new("https://api.chess.com/pub");
    chesscom.lookup_path = "/club/{name}".into();
    chesscom.items_path = "/club/{key}/{task_type}".into();
    chesscom.items_pointers.insert("members".into(), "/all_time".into());
    chesscom.items_pointers.insert("matches".into(), "/finished".into());
    chesscom.min_interval_ms = 1000;

    let mut sources = BTreeMap::new();
    sources.insert("chesscom".to_string(), chesscom);
    sources
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ClubSyncConfig::with_default_sources();
        assert_eq!(config.scheduler.tick_interval_secs, 60);
        assert_eq!(config.scheduler.max_consecutive_errors, 5);
        assert_eq!(config.queue.max_attempts, 3);
        assert_eq!(config.cache.ttl_secs, 300);
        assert!(config.source("chesscom").is_ok());
    }

    #[test]
    fn test_config_missing_fields_use_defaults() {
        let config: ClubSyncConfig = toml::from_str("").unwrap();
        assert_eq!(config.queue.workers, 2);
        assert_eq!(config.queue.multiplier, 2);
        assert!(config.runner.partial_on_prior_success);
        assert_eq!(config.runner.run_timeout_secs, 540);
        assert!(config.sources.contains_key("chesscom"));
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            [scheduler]
            tick_interval_secs = 15

            [queue]
            workers = 4
            job_timeout_secs = 120

            [sources.lichess]
            base_url = "https://lichess.org/api/"
            lookup_path = "/team/{name}"
            items_path = "/team/{key}/{task_type}"
            min_interval_ms = 500

            [sources.lichess.items_pointers]
            arena = "/tournaments"
        "#;

        let config: ClubSyncConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.scheduler.tick_interval_secs, 15);
        assert_eq!(config.scheduler.max_consecutive_errors, 5);
        assert_eq!(config.queue.workers, 4);

        let lichess = config.source("lichess").unwrap();
        assert_eq!(lichess.lookup_url("my-team"), "https://lichess.org/api/team/my-team");
        assert_eq!(
            lichess.items_url("my-team", "arena"),
            "https://lichess.org/api/team/my-team/arena"
        );
        assert_eq!(lichess.items_pointer("arena"), "/tournaments");
        assert_eq!(lichess.items_pointer("members"), "");
        assert!(config.source("unknown").is_err());
    }

    #[test]
    fn test_run_budget_stays_inside_job_timeout() {
        let runner = RunnerConfig::default();
        assert_eq!(runner.capped_to(600).run_timeout_secs, 540);
        assert_eq!(runner.capped_to(120).run_timeout_secs, 108);
        assert_eq!(runner.capped_to(3600).run_timeout_secs, 540);
        assert_eq!(runner.capped_to(0).run_timeout_secs, 1);

        let strict = RunnerConfig {
            partial_on_prior_success: false,
            ..RunnerConfig::default()
        };
        assert!(!strict.capped_to(600).partial_on_prior_success);
    }

    #[test]
    fn test_url_placeholders_are_percent_encoded() {
        let source = SourceConfig::new("https://api.example.com/pub/");
        assert_eq!(
            source.lookup_url("chess club/42?x"),
            "https://api.example.com/pub/clubs/chess%20club%2F42%3Fx"
        );
        assert_eq!(
            source.items_url("a b", "members"),
            "https://api.example.com/pub/clubs/a%20b/members"
        );
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let mut config = ClubSyncConfig::with_default_sources();
        config.queue.workers = 7;
        config.save_to(&path).unwrap();

        let loaded = ClubSyncConfig::load_from(&path).unwrap();
        assert_eq!(loaded.queue.workers, 7);
        assert_eq!(loaded.sources, config.sources);
    }

    #[test]
    fn test_db_path_expands_tilde() {
        let storage = StorageConfig::default();
        let path = storage.resolved_db_path();
        assert!(!path.to_string_lossy().starts_with('~'));
        assert!(path.ends_with("clubsync.db"));
    }
}
