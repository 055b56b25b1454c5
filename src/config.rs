//! Configuration management for mangacrawl using the prefer crate.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::models::{RateConfig, Source, SourceType};
use crate::queue::QueueConfig;
use crate::repository::GuardMode;

/// Default cap on listing pages per crawl.
pub const DEFAULT_MAX_LIST_PAGES: u32 = 50;

/// Application settings.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Base data directory.
    pub data_dir: PathBuf,
    /// Database filename.
    pub database_filename: String,
    /// Directory for downloaded page images.
    pub artifacts_dir: PathBuf,
    /// Default user agent; sources may override it.
    pub user_agent: Option<String>,
    /// Request timeout in seconds.
    pub request_timeout: u64,
    /// Workers per lane = multiplier × CPU count.
    pub worker_multiplier: usize,
    /// Deliveries per command before it is dead-lettered.
    pub max_attempts: u32,
    /// Backoff before the first retry, doubled per further attempt.
    pub retry_base_delay_ms: u64,
    pub poll_interval_ms: u64,
    pub guard_mode: GuardMode,
    pub max_list_pages: u32,
}

impl Default for Settings {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")))
            .join("mangacrawl");

        Self {
            artifacts_dir: data_dir.join("pages"),
            data_dir,
            database_filename: "mangacrawl.db".to_string(),
            user_agent: None,
            request_timeout: 30,
            worker_multiplier: 2,
            max_attempts: 3,
            retry_base_delay_ms: 5_000,
            poll_interval_ms: 1_000,
            guard_mode: GuardMode::PerAggregate,
            max_list_pages: DEFAULT_MAX_LIST_PAGES,
        }
    }
}

impl Settings {
    /// Create settings with a custom data directory.
    pub fn with_data_dir(data_dir: PathBuf) -> Self {
        Self {
            artifacts_dir: data_dir.join("pages"),
            data_dir,
            ..Default::default()
        }
    }

    /// Get the full path to the database.
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(&self.database_filename)
    }

    /// Ensure all directories exist.
    pub fn ensure_directories(&self) -> std::io::Result<()> {
        fs::create_dir_all(&self.data_dir)?;
        fs::create_dir_all(&self.artifacts_dir)?;
        Ok(())
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            worker_multiplier: self.worker_multiplier.max(1),
            max_attempts: self.max_attempts.max(1),
            retry_base_delay: Duration::from_millis(self.retry_base_delay_ms),
            poll_interval: Duration::from_millis(self.poll_interval_ms.max(10)),
        }
    }
}

/// One `sources.<id>` entry of the config file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, prefer::FromValue)]
pub struct SourceConfig {
    /// Site layout family (`madara` or `mangastream`).
    #[serde(rename = "type")]
    #[prefer(rename = "type")]
    pub source_type: String,
    #[serde(default)]
    #[prefer(default)]
    pub name: Option<String>,
    pub base_url: String,
    /// Listing entry point; defaults to the base URL.
    #[serde(default)]
    #[prefer(default)]
    pub search_url: Option<String>,
    #[serde(default)]
    #[prefer(default)]
    pub active: Option<bool>,
    #[serde(default)]
    #[prefer(default)]
    pub requests_per_minute: Option<u32>,
    #[serde(default)]
    #[prefer(default)]
    pub requests_per_hour: Option<u32>,
    #[serde(default)]
    #[prefer(default)]
    pub delay_between_requests_ms: Option<u64>,
    #[serde(default)]
    #[prefer(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    #[prefer(default)]
    pub proxy: Option<String>,
    /// "impersonate" picks a browser user agent.
    #[serde(default)]
    #[prefer(default)]
    pub user_agent: Option<String>,
    /// Seconds between scheduled crawls; unset disables scheduling.
    #[serde(default)]
    #[prefer(default)]
    pub schedule_interval_secs: Option<u64>,
    #[serde(default)]
    #[prefer(default)]
    pub max_pages: Option<u32>,
}

impl SourceConfig {
    /// Build the source row. `None` when the type is not recognized.
    pub fn to_source(&self, id: &str) -> Option<Source> {
        let source_type = SourceType::from_str(&self.source_type)?;
        let defaults = RateConfig::default();
        let rate = RateConfig {
            requests_per_minute: self
                .requests_per_minute
                .unwrap_or(defaults.requests_per_minute),
            requests_per_hour: self.requests_per_hour.unwrap_or(defaults.requests_per_hour),
            delay_between_requests_ms: self
                .delay_between_requests_ms
                .unwrap_or(defaults.delay_between_requests_ms),
        };

        let mut source = Source::new(
            id.to_string(),
            source_type,
            self.name.clone().unwrap_or_else(|| id.to_string()),
            self.base_url.trim().to_string(),
        )
        .with_rate(rate);
        source.is_active = self.active.unwrap_or(true);
        source.search_url = self.search_url.clone();
        source.headers = self.headers.clone();
        source.proxy = self.proxy.clone();
        source.user_agent = self.user_agent.clone();
        Some(source)
    }

    pub fn schedule_interval(&self) -> Option<Duration> {
        self.schedule_interval_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}

/// Configuration file structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Target directory for data.
    #[serde(default)]
    pub target: Option<String>,
    /// Database filename.
    #[serde(default)]
    pub database: Option<String>,
    /// Directory for page images (defaults to `<target>/pages`).
    #[serde(default)]
    pub artifacts_dir: Option<String>,
    #[serde(default)]
    pub user_agent: Option<String>,
    /// Request timeout in seconds.
    #[serde(default)]
    pub request_timeout: Option<u64>,
    #[serde(default)]
    pub worker_multiplier: Option<usize>,
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub retry_base_delay_ms: Option<u64>,
    /// `per_aggregate` (default) or `global`.
    #[serde(default)]
    pub write_guard: Option<String>,
    #[serde(default)]
    pub max_list_pages: Option<u32>,
    /// Source definitions keyed by source id.
    #[serde(default)]
    pub sources: HashMap<String, SourceConfig>,
}

impl Config {
    /// Load configuration using prefer crate.
    /// Automatically discovers mangacrawl config files in standard locations.
    pub async fn load() -> Self {
        match prefer::load("mangacrawl").await {
            Ok(pref_config) => {
                let target: Option<String> = pref_config.get("target").ok();
                let database: Option<String> = pref_config.get("database").ok();
                let artifacts_dir: Option<String> = pref_config.get("artifacts_dir").ok();
                let user_agent: Option<String> = pref_config.get("user_agent").ok();
                let request_timeout: Option<u64> = pref_config.get("request_timeout").ok();
                let worker_multiplier: Option<usize> =
                    pref_config.get("worker_multiplier").ok();
                let max_attempts: Option<u32> = pref_config.get("max_attempts").ok();
                let retry_base_delay_ms: Option<u64> =
                    pref_config.get("retry_base_delay_ms").ok();
                let write_guard: Option<String> = pref_config.get("write_guard").ok();
                let max_list_pages: Option<u32> = pref_config.get("max_list_pages").ok();
                let sources: HashMap<String, SourceConfig> =
                    pref_config.get("sources").unwrap_or_default();

                Config {
                    target,
                    database,
                    artifacts_dir,
                    user_agent,
                    request_timeout,
                    worker_multiplier,
                    max_attempts,
                    retry_base_delay_ms,
                    write_guard,
                    max_list_pages,
                    sources,
                }
            }
            Err(_) => {
                // No config file found, use defaults
                Self::default()
            }
        }
    }

    /// Apply configuration to settings.
    pub fn apply_to_settings(&self, settings: &mut Settings) {
        if let Some(ref target) = self.target {
            let path = shellexpand::tilde(target);
            settings.data_dir = PathBuf::from(path.as_ref());
            settings.artifacts_dir = settings.data_dir.join("pages");
        }
        if let Some(ref dir) = self.artifacts_dir {
            settings.artifacts_dir = PathBuf::from(shellexpand::tilde(dir).as_ref());
        }
        if let Some(ref database) = self.database {
            settings.database_filename = database.clone();
        }
        if let Some(ref user_agent) = self.user_agent {
            settings.user_agent = Some(user_agent.clone());
        }
        if let Some(timeout) = self.request_timeout {
            settings.request_timeout = timeout;
        }
        if let Some(multiplier) = self.worker_multiplier {
            settings.worker_multiplier = multiplier;
        }
        if let Some(attempts) = self.max_attempts {
            settings.max_attempts = attempts;
        }
        if let Some(delay) = self.retry_base_delay_ms {
            settings.retry_base_delay_ms = delay;
        }
        if let Some(ref mode) = self.write_guard {
            match GuardMode::from_str(mode) {
                Some(mode) => settings.guard_mode = mode,
                None => warn!(value = %mode, "unknown write_guard mode, keeping default"),
            }
        }
        if let Some(pages) = self.max_list_pages {
            settings.max_list_pages = pages.max(1);
        }
    }

    /// Sources declared in the config file, sorted by id.
    ///
    /// Entries with an unknown type are skipped with a warning.
    pub fn configured_sources(&self) -> Vec<(Source, &SourceConfig)> {
        let mut ids: Vec<&String> = self.sources.keys().collect();
        ids.sort();
        ids.into_iter()
            .filter_map(|id| {
                let entry = &self.sources[id];
                match entry.to_source(id) {
                    Some(source) => Some((source, entry)),
                    None => {
                        warn!(source_id = %id, source_type = %entry.source_type, "unknown source type");
                        None
                    }
                }
            })
            .collect()
    }
}

/// Load settings from configuration (async version).
pub async fn load_settings() -> (Config, Settings) {
    let config = Config::load().await;
    let mut settings = Settings::default();
    config.apply_to_settings(&mut settings);
    (config, settings)
}
