//! Crawler capability set and the registry that picks one per source.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use regex::Regex;
use scraper::{ElementRef, Selector};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use url::Url;

use super::http_client::{HttpClientFactory, SourceFetcher};
use super::madara::MadaraCrawler;
use super::mangastream::MangaStreamCrawler;
use super::rate_limiter::RateLimiter;
use crate::error::{CrawlError, Result};
use crate::models::{Source, SourceType};

/// One manga entry on a listing page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MangaListing {
    pub url: String,
    pub title: String,
    pub source_manga_id: String,
}

/// A parsed listing page.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MangaListPage {
    pub items: Vec<MangaListing>,
    /// Whether the page links to a following page.
    pub has_next: bool,
}

/// One chapter entry on a manga page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChapterListing {
    pub url: String,
    pub title: String,
    pub source_chapter_id: Option<String>,
    pub number: Option<f64>,
}

impl ChapterListing {
    /// Dedup key: native id, else the chapter URL.
    pub fn key(&self) -> String {
        self.source_chapter_id
            .clone()
            .unwrap_or_else(|| self.url.clone())
    }
}

/// Metadata and chapter list of a manga page.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MangaDetail {
    pub source_manga_id: String,
    pub title: String,
    pub alt_titles: Vec<String>,
    pub author: Option<String>,
    pub status: Option<String>,
    pub description: Option<String>,
    pub cover_url: Option<String>,
    pub genres: Vec<String>,
    /// Oldest chapter first.
    pub chapters: Vec<ChapterListing>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChapterDetail {
    pub title: Option<String>,
    pub number: Option<f64>,
}

/// Fetch and parse operations for one family of site layouts.
///
/// Fetches go through the rate limiter; parsers are pure functions of their
/// input.
#[async_trait]
pub trait Crawler: Send + Sync {
    fn supported_source_type(&self) -> SourceType;

    fn can_crawl(&self, source: &Source) -> bool {
        source.source_type == self.supported_source_type()
            && source.is_active
            && !source.base_url.trim().is_empty()
    }

    /// Best-effort GET of the base URL. Never fails.
    async fn test_connection(&self, source: &Source) -> bool;

    async fn fetch_html(
        &self,
        source: &Source,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<String>;

    async fn fetch_bytes(
        &self,
        source: &Source,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>>;

    /// Resolve `href` against the source's base URL.
    fn build_full_url(&self, source: &Source, href: &str) -> String {
        resolve_url(&source.base_url, href)
    }

    /// URL of listing page `page` (1-based).
    fn list_page_url(&self, base_search_url: &str, page: u32) -> String;

    fn parse_manga_list(&self, source: &Source, html: &str) -> Result<MangaListPage>;

    fn parse_manga_detail(&self, source: &Source, url: &str, html: &str) -> Result<MangaDetail>;

    fn parse_chapter_detail(&self, source: &Source, url: &str, html: &str)
        -> Result<ChapterDetail>;

    /// Page image URLs in reading order.
    fn parse_chapter_pages(&self, source: &Source, html: &str) -> Result<Vec<String>>;
}

/// Maps source types to crawler implementations.
#[derive(Clone, Default)]
pub struct CrawlerRegistry {
    crawlers: HashMap<SourceType, Arc<dyn Crawler>>,
}

impl CrawlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in site crawlers sharing one fetcher.
    pub fn with_defaults(factory: Arc<dyn HttpClientFactory>, limiter: RateLimiter) -> Self {
        let fetcher = SourceFetcher::new(factory, limiter);
        let mut registry = Self::new();
        registry.register(Arc::new(MadaraCrawler::new(fetcher.clone())));
        registry.register(Arc::new(MangaStreamCrawler::new(fetcher)));
        registry
    }

    /// Add a crawler, replacing any previous one for the same type.
    pub fn register(&mut self, crawler: Arc<dyn Crawler>) {
        self.crawlers.insert(crawler.supported_source_type(), crawler);
    }

    /// The crawler able to handle `source`.
    pub fn resolve(&self, source: &Source) -> Result<Arc<dyn Crawler>> {
        self.crawlers
            .get(&source.source_type)
            .filter(|c| c.can_crawl(source))
            .cloned()
            .ok_or_else(|| CrawlError::NoCrawler(source.id.clone()))
    }

    pub fn source_types(&self) -> Vec<SourceType> {
        let mut types: Vec<_> = self.crawlers.keys().copied().collect();
        types.sort_by_key(|t| t.as_str());
        types
    }
}

/// Resolve a possibly relative link. Absolute URLs are returned unchanged.
pub fn resolve_url(base: &str, href: &str) -> String {
    let href = href.trim();
    if href.starts_with("http://") || href.starts_with("https://") {
        return href.to_string();
    }
    Url::parse(base)
        .and_then(|b| b.join(href))
        .map(|u| u.to_string())
        .unwrap_or_else(|_| href.to_string())
}

/// Last non-empty path segment of a URL.
pub fn slug_from_url(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    parsed
        .path_segments()?
        .filter(|s| !s.is_empty())
        .next_back()
        .map(|s| s.to_string())
}

/// Chapter number from text such as "Chapter 12.5 - Title".
pub fn parse_chapter_number(text: &str) -> Option<f64> {
    static CHAPTER_NUMBER: OnceLock<Option<Regex>> = OnceLock::new();
    let re = CHAPTER_NUMBER
        .get_or_init(|| Regex::new(r"(?i)(?:chapter|ch\.?|episode)\s*([0-9]+(?:\.[0-9]+)?)").ok())
        .as_ref()?;
    re.captures(text)?.get(1)?.as_str().parse().ok()
}

pub(crate) fn selector(css: &str) -> Result<Selector> {
    Selector::parse(css).map_err(|e| CrawlError::parse(format!("bad selector {css}: {e}")))
}

/// Whitespace-normalized text content of an element.
pub(crate) fn element_text(element: ElementRef<'_>) -> String {
    element
        .text()
        .flat_map(|t| t.split_whitespace())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Lazy-loaded image source, falling back to `src`.
pub(crate) fn image_source(element: ElementRef<'_>) -> Option<String> {
    ["data-src", "data-lazy-src", "data-cfsrc", "src"]
        .iter()
        .filter_map(|attr| element.value().attr(attr))
        .map(str::trim)
        .find(|v| !v.is_empty() && !v.starts_with("data:"))
        .map(|v| v.to_string())
}
