//! Messages carried by the queue.
//!
//! Commands are serialized as internally tagged JSON. Every field is required
//! unless it is an `Option`; `skip_existing` defaults to `true`.

use serde::{Deserialize, Serialize};

use crate::error::Result;

fn default_true() -> bool {
    true
}

/// Independent queue partitions, each served by its own workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lane {
    /// Stage commands of crawl runs.
    Crawl,
    /// Triggers and other background work.
    Default,
}

impl Lane {
    pub const ALL: [Lane; 2] = [Lane::Crawl, Lane::Default];

    pub fn as_str(&self) -> &'static str {
        match self {
            Lane::Crawl => "crawl",
            Lane::Default => "default",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "crawl" => Some(Lane::Crawl),
            "default" => Some(Lane::Default),
            _ => None,
        }
    }
}

/// Paginate a listing and emit one [`CrawlManga`] per discovered manga.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrawlMangaList {
    pub source_id: String,
    pub crawl_job_id: String,
    pub base_search_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_pages: Option<u32>,
}

/// Fetch a manga page, upsert the manga and emit its chapters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrawlManga {
    pub source_id: String,
    pub crawl_job_id: String,
    pub manga_url: String,
    pub manga_title: String,
    #[serde(default = "default_true")]
    pub skip_existing: bool,
}

/// Emit chapter crawls for the mangas already stored for a source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrawlAllMangasChapters {
    pub source_id: String,
    pub crawl_job_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_mangas: Option<u32>,
    #[serde(default = "default_true")]
    pub skip_existing: bool,
}

/// Fetch a chapter, upsert it and emit its page crawl.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrawlChapter {
    pub source_id: String,
    pub crawl_job_id: String,
    pub manga_id: String,
    pub chapter_url: String,
    pub chapter_title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_chapter_id: Option<String>,
    #[serde(default = "default_true")]
    pub skip_existing: bool,
}

impl CrawlChapter {
    /// Dedup key of the chapter within its manga.
    pub fn chapter_key(&self) -> &str {
        self.source_chapter_id.as_deref().unwrap_or(&self.chapter_url)
    }
}

/// Fetch page image URLs of a chapter and download missing images.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrawlPage {
    pub source_id: String,
    pub crawl_job_id: String,
    pub chapter_id: String,
    pub chapter_url: String,
    #[serde(default = "default_true")]
    pub skip_existing: bool,
}

/// Start a full crawl of a source (scheduler output).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerCrawl {
    pub source_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_pages: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    CrawlMangaList(CrawlMangaList),
    CrawlManga(CrawlManga),
    CrawlAllMangasChapters(CrawlAllMangasChapters),
    CrawlChapter(CrawlChapter),
    CrawlPage(CrawlPage),
    TriggerCrawl(TriggerCrawl),
}

impl Command {
    pub fn command_type(&self) -> &'static str {
        match self {
            Command::CrawlMangaList(_) => "crawl_manga_list",
            Command::CrawlManga(_) => "crawl_manga",
            Command::CrawlAllMangasChapters(_) => "crawl_all_mangas_chapters",
            Command::CrawlChapter(_) => "crawl_chapter",
            Command::CrawlPage(_) => "crawl_page",
            Command::TriggerCrawl(_) => "trigger_crawl",
        }
    }

    pub fn lane(&self) -> Lane {
        match self {
            Command::TriggerCrawl(_) => Lane::Default,
            _ => Lane::Crawl,
        }
    }

    pub fn source_id(&self) -> &str {
        match self {
            Command::CrawlMangaList(c) => &c.source_id,
            Command::CrawlManga(c) => &c.source_id,
            Command::CrawlAllMangasChapters(c) => &c.source_id,
            Command::CrawlChapter(c) => &c.source_id,
            Command::CrawlPage(c) => &c.source_id,
            Command::TriggerCrawl(c) => &c.source_id,
        }
    }

    /// The job a stage command belongs to; triggers have none.
    pub fn crawl_job_id(&self) -> Option<&str> {
        match self {
            Command::CrawlMangaList(c) => Some(&c.crawl_job_id),
            Command::CrawlManga(c) => Some(&c.crawl_job_id),
            Command::CrawlAllMangasChapters(c) => Some(&c.crawl_job_id),
            Command::CrawlChapter(c) => Some(&c.crawl_job_id),
            Command::CrawlPage(c) => Some(&c.crawl_job_id),
            Command::TriggerCrawl(_) => None,
        }
    }

    /// Whether this command is a job's first stage.
    pub fn is_root(&self) -> bool {
        matches!(
            self,
            Command::CrawlMangaList(_) | Command::CrawlAllMangasChapters(_)
        )
    }

    /// Short description for job logs.
    pub fn describe(&self) -> String {
        match self {
            Command::CrawlMangaList(c) => format!("manga list {}", c.base_search_url),
            Command::CrawlManga(c) => format!("manga \"{}\" ({})", c.manga_title, c.manga_url),
            Command::CrawlAllMangasChapters(c) => format!("chapter refresh of {}", c.source_id),
            Command::CrawlChapter(c) => {
                format!("chapter \"{}\" ({})", c.chapter_title, c.chapter_url)
            }
            Command::CrawlPage(c) => format!("pages of {}", c.chapter_url),
            Command::TriggerCrawl(c) => format!("crawl trigger for {}", c.source_id),
        }
    }

    pub fn to_payload(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_payload(payload: &str) -> Result<Self> {
        Ok(serde_json::from_str(payload)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CrawlError;

    #[test]
    fn payload_is_tagged_json() {
        let cmd = Command::CrawlManga(CrawlManga {
            source_id: "src".into(),
            crawl_job_id: "job".into(),
            manga_url: "https://src.example/manga/a/".into(),
            manga_title: "A".into(),
            skip_existing: false,
        });
        let payload = cmd.to_payload().unwrap();
        let value: serde_json::Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(value["type"], "crawl_manga");
        assert_eq!(value["skip_existing"], false);
        assert_eq!(Command::from_payload(&payload).unwrap(), cmd);
    }

    #[test]
    fn skip_existing_defaults_to_true() {
        let cmd = Command::from_payload(
            r#"{"type":"crawl_page","source_id":"s","crawl_job_id":"j","chapter_id":"c","chapter_url":"u"}"#,
        )
        .unwrap();
        match cmd {
            Command::CrawlPage(page) => assert!(page.skip_existing),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn missing_required_field_is_rejected() {
        let err = Command::from_payload(r#"{"type":"crawl_manga_list","source_id":"s"}"#)
            .unwrap_err();
        assert!(matches!(err, CrawlError::InvalidPayload(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn lanes_and_metadata() {
        let trigger = Command::TriggerCrawl(TriggerCrawl {
            source_id: "s".into(),
            max_pages: None,
        });
        assert_eq!(trigger.lane(), Lane::Default);
        assert_eq!(trigger.crawl_job_id(), None);

        let list = Command::CrawlMangaList(CrawlMangaList {
            source_id: "s".into(),
            crawl_job_id: "j".into(),
            base_search_url: "https://s.example/manga/".into(),
            max_pages: Some(2),
        });
        assert_eq!(list.lane(), Lane::Crawl);
        assert!(list.is_root());
        assert_eq!(list.crawl_job_id(), Some("j"));
        assert_eq!(list.command_type(), "crawl_manga_list");
        assert_eq!(Lane::from_str(list.lane().as_str()), Some(Lane::Crawl));
    }

    #[test]
    fn chapter_key_falls_back_to_url() {
        let mut chapter = CrawlChapter {
            source_id: "s".into(),
            crawl_job_id: "j".into(),
            manga_id: "m".into(),
            chapter_url: "https://s.example/c/1".into(),
            chapter_title: "1".into(),
            source_chapter_id: None,
            skip_existing: true,
        };
        assert_eq!(chapter.chapter_key(), "https://s.example/c/1");
        chapter.source_chapter_id = Some("c-1".into());
        assert_eq!(chapter.chapter_key(), "c-1");
    }
}
