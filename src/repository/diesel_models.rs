//! Diesel ORM models for database tables.
//!
//! These models provide compile-time type checking for database operations.
//! Timestamps are stored as RFC 3339 text, flags as integers.

use diesel::prelude::*;

use crate::schema;

/// Source record from the database.
#[derive(Queryable, Selectable, Identifiable, Insertable, Debug, Clone)]
#[diesel(table_name = schema::sources)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct SourceRecord {
    pub id: String,
    pub source_type: String,
    pub name: String,
    pub base_url: String,
    pub is_active: i32,
    pub requests_per_minute: i32,
    pub requests_per_hour: i32,
    pub delay_between_requests_ms: i64,
    pub headers: String,
    pub proxy: Option<String>,
    pub user_agent: Option<String>,
    pub search_url: Option<String>,
    pub created_at: String,
    pub last_crawled_at: Option<String>,
}

/// Crawl job record from the database.
#[derive(Queryable, Selectable, Identifiable, Insertable, Debug, Clone)]
#[diesel(table_name = schema::crawl_jobs)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct CrawlJobRecord {
    pub id: String,
    pub source_id: String,
    pub kind: String,
    pub status: String,
    pub created_at: String,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
    pub processed: i32,
    pub total: i32,
    pub errors: i32,
    pub root_failed: i32,
}

/// Crawl job log entry from the database.
#[derive(Queryable, Selectable, Identifiable, Debug, Clone)]
#[diesel(table_name = schema::crawl_job_logs)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct CrawlJobLogRecord {
    pub id: i32,
    pub crawl_job_id: String,
    pub timestamp: String,
    pub level: String,
    pub message: String,
}

/// New log entry for insertion.
#[derive(Insertable, Debug)]
#[diesel(table_name = schema::crawl_job_logs)]
pub struct NewCrawlJobLog {
    pub crawl_job_id: String,
    pub timestamp: String,
    pub level: String,
    pub message: String,
}

/// Manga record from the database.
#[derive(Queryable, Selectable, Identifiable, Insertable, Debug, Clone)]
#[diesel(table_name = schema::mangas)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct MangaRecord {
    pub id: String,
    pub source_id: String,
    pub source_manga_id: String,
    pub url: String,
    pub title: String,
    pub alt_titles: String,
    pub author: Option<String>,
    pub status: Option<String>,
    pub description: Option<String>,
    pub cover_url: Option<String>,
    pub genres: String,
    pub is_active: i32,
    pub created_at: String,
    pub updated_at: String,
}

/// Chapter record from the database.
#[derive(Queryable, Selectable, Identifiable, Insertable, Debug, Clone)]
#[diesel(table_name = schema::chapters)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct ChapterRecord {
    pub id: String,
    pub manga_id: String,
    pub source_id: String,
    pub source_chapter_id: String,
    pub url: String,
    pub title: String,
    pub number: Option<f64>,
    pub is_active: i32,
    pub created_at: String,
    pub updated_at: String,
}

/// Page record from the database.
#[derive(Queryable, Selectable, Identifiable, Insertable, Debug, Clone)]
#[diesel(table_name = schema::pages)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct PageRecord {
    pub id: String,
    pub chapter_id: String,
    pub number: i32,
    pub image_url: String,
    pub is_downloaded: i32,
    pub local_path: Option<String>,
    pub content_hash: Option<String>,
    pub is_active: i32,
    pub created_at: String,
    pub updated_at: String,
}

/// Queued command record from the database.
#[derive(Queryable, Selectable, Identifiable, Debug, Clone)]
#[diesel(table_name = schema::queued_commands)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct QueuedCommandRecord {
    pub id: i32,
    pub lane: String,
    pub command_type: String,
    pub payload: String,
    pub status: String,
    pub attempts: i32,
    pub max_attempts: i32,
    pub last_error: Option<String>,
    pub available_at_ms: i64,
    pub locked_by: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// New queued command for insertion.
#[derive(Insertable, Debug)]
#[diesel(table_name = schema::queued_commands)]
pub struct NewQueuedCommand {
    pub lane: String,
    pub command_type: String,
    pub payload: String,
    pub status: String,
    pub attempts: i32,
    pub max_attempts: i32,
    pub available_at_ms: i64,
    pub created_at: String,
    pub updated_at: String,
}
