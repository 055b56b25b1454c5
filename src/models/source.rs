//! Content sources and their crawl rules.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Site layout family; selects the crawler implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    /// WordPress sites running the Madara manga theme.
    Madara,
    /// Themesia "MangaStream"/MangaReader theme sites.
    MangaStream,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Madara => "madara",
            SourceType::MangaStream => "mangastream",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "madara" => Some(SourceType::Madara),
            "mangastream" | "mangareader" | "themesia" => Some(SourceType::MangaStream),
            _ => None,
        }
    }
}

/// Request budget for a single source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateConfig {
    /// Maximum requests in any rolling 60 second window (0 = unlimited).
    pub requests_per_minute: u32,
    /// Maximum requests in any rolling hour (0 = unlimited).
    pub requests_per_hour: u32,
    /// Minimum spacing between two requests.
    pub delay_between_requests_ms: u64,
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 30,
            requests_per_hour: 1000,
            delay_between_requests_ms: 1000,
        }
    }
}

/// A configured origin site.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    pub id: String,
    pub name: String,
    pub base_url: String,
    pub source_type: SourceType,
    pub is_active: bool,
    pub rate: RateConfig,
    /// Extra request headers sent to this source.
    pub headers: HashMap<String, String>,
    /// Proxy URL (http, https or socks5).
    pub proxy: Option<String>,
    /// User agent override; "impersonate" picks a browser user agent.
    pub user_agent: Option<String>,
    /// Default entry point for list discovery.
    pub search_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_crawled_at: Option<DateTime<Utc>>,
}

impl Source {
    pub fn new(id: String, source_type: SourceType, name: String, base_url: String) -> Self {
        Self {
            id,
            name,
            base_url,
            source_type,
            is_active: true,
            rate: RateConfig::default(),
            headers: HashMap::new(),
            proxy: None,
            user_agent: None,
            search_url: None,
            created_at: Utc::now(),
            last_crawled_at: None,
        }
    }

    pub fn with_rate(mut self, rate: RateConfig) -> Self {
        self.rate = rate;
        self
    }

    /// URL the list stage starts from when the trigger doesn't name one.
    pub fn list_entry_url(&self) -> String {
        self.search_url
            .clone()
            .unwrap_or_else(|| self.base_url.clone())
    }
}
