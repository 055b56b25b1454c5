//! Source crawlers and the rate-limited transport they share.

pub mod crawler;
pub mod http_client;
pub mod madara;
pub mod mangastream;
pub mod rate_limiter;

pub use crawler::{
    resolve_url, slug_from_url, ChapterDetail, ChapterListing, Crawler, CrawlerRegistry,
    MangaDetail, MangaListPage, MangaListing,
};
pub use http_client::{resolve_user_agent, DefaultClientFactory, HttpClientFactory, SourceFetcher};
pub use madara::MadaraCrawler;
pub use mangastream::MangaStreamCrawler;
pub use rate_limiter::{RateLimiter, SourceStats};
