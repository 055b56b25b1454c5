//! Crawl runs and their append-only logs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CrawlJobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl CrawlJobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CrawlJobStatus::Pending => "pending",
            CrawlJobStatus::Running => "running",
            CrawlJobStatus::Completed => "completed",
            CrawlJobStatus::Failed => "failed",
            CrawlJobStatus::Cancelled => "cancelled",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(CrawlJobStatus::Pending),
            "running" => Some(CrawlJobStatus::Running),
            "completed" => Some(CrawlJobStatus::Completed),
            "failed" => Some(CrawlJobStatus::Failed),
            "cancelled" => Some(CrawlJobStatus::Cancelled),
            _ => None,
        }
    }

    /// Terminal states are never left.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CrawlJobStatus::Completed | CrawlJobStatus::Failed | CrawlJobStatus::Cancelled
        )
    }
}

/// What the root command of a job does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CrawlJobKind {
    /// Full discovery starting from the source's list pages.
    MangaList,
    /// Chapter refresh over mangas already in the catalog.
    ChapterRefresh,
}

impl CrawlJobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CrawlJobKind::MangaList => "manga_list",
            CrawlJobKind::ChapterRefresh => "chapter_refresh",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "manga_list" => Some(CrawlJobKind::MangaList),
            "chapter_refresh" => Some(CrawlJobKind::ChapterRefresh),
            _ => None,
        }
    }
}

/// One orchestration run against a source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlJob {
    pub id: String,
    pub source_id: String,
    pub kind: CrawlJobKind,
    pub status: CrawlJobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Commands settled so far (success, skip or failure).
    pub processed: u32,
    /// Commands dispatched so far.
    pub total: u32,
    pub errors: u32,
    /// Set when the root command was abandoned.
    pub root_failed: bool,
}

impl CrawlJob {
    pub fn new(source_id: String, kind: CrawlJobKind) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            source_id,
            kind,
            status: CrawlJobStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            processed: 0,
            total: 0,
            errors: 0,
            root_failed: false,
        }
    }

    /// No dispatched command is still outstanding.
    pub fn is_settled(&self) -> bool {
        self.total > 0 && self.processed >= self.total
    }

    /// Status a settled job finishes with.
    pub fn terminal_status(&self) -> CrawlJobStatus {
        if self.root_failed {
            CrawlJobStatus::Failed
        } else {
            CrawlJobStatus::Completed
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "info" => Some(LogLevel::Info),
            "warning" => Some(LogLevel::Warning),
            "error" => Some(LogLevel::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlJobLog {
    pub id: Option<i32>,
    pub crawl_job_id: String,
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

impl CrawlJobLog {
    pub fn new(crawl_job_id: &str, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            id: None,
            crawl_job_id: crawl_job_id.to_string(),
            timestamp: Utc::now(),
            level,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_job_is_pending_and_unsettled() {
        let job = CrawlJob::new("src".into(), CrawlJobKind::MangaList);
        assert_eq!(job.status, CrawlJobStatus::Pending);
        assert!(!job.is_settled());
    }

    #[test]
    fn root_failure_decides_terminal_status() {
        let mut job = CrawlJob::new("src".into(), CrawlJobKind::MangaList);
        job.total = 3;
        job.processed = 3;
        job.errors = 2;
        assert!(job.is_settled());
        assert_eq!(job.terminal_status(), CrawlJobStatus::Completed);

        job.root_failed = true;
        assert_eq!(job.terminal_status(), CrawlJobStatus::Failed);
    }

    #[test]
    fn status_strings_round_trip() {
        for status in [
            CrawlJobStatus::Pending,
            CrawlJobStatus::Running,
            CrawlJobStatus::Completed,
            CrawlJobStatus::Failed,
            CrawlJobStatus::Cancelled,
        ] {
            assert_eq!(CrawlJobStatus::from_str(status.as_str()), Some(status));
        }
    }
}
