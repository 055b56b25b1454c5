//! Domain models.

mod content;
mod crawl_job;
mod source;

pub use content::{Chapter, Manga, Page};
pub use crawl_job::{CrawlJob, CrawlJobKind, CrawlJobLog, CrawlJobStatus, LogLevel};
pub use source::{RateConfig, Source, SourceType};
