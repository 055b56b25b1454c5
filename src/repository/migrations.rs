//! Idempotent table bootstrap.

use diesel::connection::SimpleConnection;

use super::diesel_pool::{run_blocking, DieselError, SqlitePool};

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS sources (
        id TEXT PRIMARY KEY NOT NULL,
        source_type TEXT NOT NULL,
        name TEXT NOT NULL,
        base_url TEXT NOT NULL,
        is_active INTEGER NOT NULL DEFAULT 1,
        requests_per_minute INTEGER NOT NULL DEFAULT 30,
        requests_per_hour INTEGER NOT NULL DEFAULT 1000,
        delay_between_requests_ms BIGINT NOT NULL DEFAULT 1000,
        headers TEXT NOT NULL DEFAULT '{}',
        proxy TEXT,
        user_agent TEXT,
        search_url TEXT,
        created_at TEXT NOT NULL,
        last_crawled_at TEXT
    );

    CREATE TABLE IF NOT EXISTS crawl_jobs (
        id TEXT PRIMARY KEY NOT NULL,
        source_id TEXT NOT NULL REFERENCES sources(id),
        kind TEXT NOT NULL,
        status TEXT NOT NULL,
        created_at TEXT NOT NULL,
        started_at TEXT,
        finished_at TEXT,
        processed INTEGER NOT NULL DEFAULT 0,
        total INTEGER NOT NULL DEFAULT 0,
        errors INTEGER NOT NULL DEFAULT 0,
        root_failed INTEGER NOT NULL DEFAULT 0
    );

    CREATE TABLE IF NOT EXISTS crawl_job_logs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        crawl_job_id TEXT NOT NULL REFERENCES crawl_jobs(id),
        timestamp TEXT NOT NULL,
        level TEXT NOT NULL,
        message TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS mangas (
        id TEXT PRIMARY KEY NOT NULL,
        source_id TEXT NOT NULL REFERENCES sources(id),
        source_manga_id TEXT NOT NULL,
        url TEXT NOT NULL,
        title TEXT NOT NULL,
        alt_titles TEXT NOT NULL DEFAULT '[]',
        author TEXT,
        status TEXT,
        description TEXT,
        cover_url TEXT,
        genres TEXT NOT NULL DEFAULT '[]',
        is_active INTEGER NOT NULL DEFAULT 1,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        UNIQUE(source_id, source_manga_id)
    );

    CREATE TABLE IF NOT EXISTS chapters (
        id TEXT PRIMARY KEY NOT NULL,
        manga_id TEXT NOT NULL REFERENCES mangas(id),
        source_id TEXT NOT NULL,
        source_chapter_id TEXT NOT NULL,
        url TEXT NOT NULL,
        title TEXT NOT NULL,
        number DOUBLE,
        is_active INTEGER NOT NULL DEFAULT 1,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        UNIQUE(manga_id, source_chapter_id)
    );

    CREATE TABLE IF NOT EXISTS pages (
        id TEXT PRIMARY KEY NOT NULL,
        chapter_id TEXT NOT NULL REFERENCES chapters(id),
        number INTEGER NOT NULL,
        image_url TEXT NOT NULL,
        is_downloaded INTEGER NOT NULL DEFAULT 0,
        local_path TEXT,
        content_hash TEXT,
        is_active INTEGER NOT NULL DEFAULT 1,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        UNIQUE(chapter_id, number)
    );

    CREATE TABLE IF NOT EXISTS queued_commands (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        lane TEXT NOT NULL,
        command_type TEXT NOT NULL,
        payload TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending',
        attempts INTEGER NOT NULL DEFAULT 0,
        max_attempts INTEGER NOT NULL DEFAULT 3,
        last_error TEXT,
        available_at_ms BIGINT NOT NULL,
        locked_by TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_crawl_jobs_source_status
        ON crawl_jobs(source_id, status);
    CREATE INDEX IF NOT EXISTS idx_crawl_job_logs_job_time
        ON crawl_job_logs(crawl_job_id, timestamp);
    CREATE INDEX IF NOT EXISTS idx_chapters_manga
        ON chapters(manga_id);
    CREATE INDEX IF NOT EXISTS idx_queued_commands_claim
        ON queued_commands(lane, status, available_at_ms);
"#;

/// Create all tables and indexes that don't exist yet.
pub async fn init_schema(pool: &SqlitePool) -> Result<(), DieselError> {
    run_blocking(pool.clone(), |conn| conn.batch_execute(SCHEMA)).await
}
