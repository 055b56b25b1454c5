//! Crawl pipeline: stage commands and the orchestrator that executes them.

pub mod commands;
pub mod orchestrator;
mod stages;

pub use commands::{
    Command, CrawlAllMangasChapters, CrawlChapter, CrawlManga, CrawlMangaList, CrawlPage, Lane,
    TriggerCrawl,
};
pub use orchestrator::CrawlJobOrchestrator;
