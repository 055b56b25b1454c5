//! SQLite persistence: the storage collaborator of the pipeline.

pub mod diesel_content;
pub mod diesel_crawl_job;
pub mod diesel_models;
pub mod diesel_pool;
pub mod diesel_queue;
pub mod diesel_source;
pub mod migrations;
pub mod write_guard;

use chrono::{DateTime, SecondsFormat, Utc};

pub use diesel_content::DieselContentRepository;
pub use diesel_crawl_job::DieselCrawlJobRepository;
pub use diesel_pool::{create_diesel_pool, create_diesel_pool_from_url, run_blocking, SqlitePool};
pub use diesel_queue::DieselQueueStore;
pub use diesel_source::DieselSourceRepository;
pub use write_guard::{GuardMode, WriteGuard};

/// Format a timestamp so that text ordering matches time ordering.
pub fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a stored timestamp, falling back to now for corrupt values.
pub fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

pub fn parse_datetime_opt(s: Option<String>) -> Option<DateTime<Utc>> {
    s.and_then(|s| {
        DateTime::parse_from_rfc3339(&s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
    })
}

/// Whether a Diesel error is a UNIQUE constraint violation.
pub fn is_unique_violation(err: &diesel::result::Error) -> bool {
    matches!(
        err,
        diesel::result::Error::DatabaseError(
            diesel::result::DatabaseErrorKind::UniqueViolation,
            _
        )
    )
}

/// All repositories sharing one pool.
#[derive(Clone)]
pub struct Repositories {
    pub sources: DieselSourceRepository,
    pub jobs: DieselCrawlJobRepository,
    pub content: DieselContentRepository,
}

impl Repositories {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            sources: DieselSourceRepository::new(pool.clone()),
            jobs: DieselCrawlJobRepository::new(pool.clone()),
            content: DieselContentRepository::new(pool),
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::models::{Source, SourceType};

    /// Fresh database in a temp dir with all tables created.
    pub async fn setup_test_db() -> (SqlitePool, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        let pool = create_diesel_pool(&db_path).unwrap();
        migrations::init_schema(&pool).await.unwrap();
        (pool, dir)
    }

    pub async fn insert_source(pool: &SqlitePool, id: &str) -> Source {
        let source = Source::new(
            id.to_string(),
            SourceType::Madara,
            format!("Source {id}"),
            format!("https://{id}.example"),
        );
        DieselSourceRepository::new(pool.clone())
            .save(&source)
            .await
            .unwrap();
        source
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn formatted_timestamps_sort_chronologically() {
        let a = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 9).unwrap();
        let b = a + chrono::Duration::milliseconds(500);
        let c = a + chrono::Duration::seconds(1);
        let mut texts = vec![format_datetime(&c), format_datetime(&a), format_datetime(&b)];
        texts.sort();
        assert_eq!(
            texts,
            vec![format_datetime(&a), format_datetime(&b), format_datetime(&c)]
        );
        assert_eq!(parse_datetime(&format_datetime(&b)), b);
    }
}
