//! Diesel-based source repository for SQLite.

use chrono::{DateTime, Utc};
use diesel::prelude::*;

use super::diesel_models::SourceRecord;
use super::diesel_pool::{run_blocking, DieselError, SqlitePool};
use super::{format_datetime, parse_datetime, parse_datetime_opt};
use crate::models::{RateConfig, Source, SourceType};
use crate::schema::sources;

/// Convert a database record to a domain model.
impl From<SourceRecord> for Source {
    fn from(record: SourceRecord) -> Self {
        Source {
            source_type: SourceType::from_str(&record.source_type).unwrap_or(SourceType::Madara),
            rate: RateConfig {
                requests_per_minute: record.requests_per_minute.max(0) as u32,
                requests_per_hour: record.requests_per_hour.max(0) as u32,
                delay_between_requests_ms: record.delay_between_requests_ms.max(0) as u64,
            },
            headers: serde_json::from_str(&record.headers).unwrap_or_default(),
            is_active: record.is_active != 0,
            created_at: parse_datetime(&record.created_at),
            last_crawled_at: parse_datetime_opt(record.last_crawled_at),
            id: record.id,
            name: record.name,
            base_url: record.base_url,
            proxy: record.proxy,
            user_agent: record.user_agent,
            search_url: record.search_url,
        }
    }
}

impl From<&Source> for SourceRecord {
    fn from(source: &Source) -> Self {
        SourceRecord {
            id: source.id.clone(),
            source_type: source.source_type.as_str().to_string(),
            name: source.name.clone(),
            base_url: source.base_url.clone(),
            is_active: source.is_active as i32,
            requests_per_minute: source.rate.requests_per_minute as i32,
            requests_per_hour: source.rate.requests_per_hour as i32,
            delay_between_requests_ms: source.rate.delay_between_requests_ms as i64,
            headers: serde_json::to_string(&source.headers).unwrap_or_else(|_| "{}".to_string()),
            proxy: source.proxy.clone(),
            user_agent: source.user_agent.clone(),
            search_url: source.search_url.clone(),
            created_at: format_datetime(&source.created_at),
            last_crawled_at: source.last_crawled_at.as_ref().map(format_datetime),
        }
    }
}

/// Diesel-based source repository with compile-time query checking.
#[derive(Clone)]
pub struct DieselSourceRepository {
    pool: SqlitePool,
}

impl DieselSourceRepository {
    /// Create a new Diesel source repository with an existing pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Get a source by ID.
    pub async fn get(&self, id: &str) -> Result<Option<Source>, DieselError> {
        let id = id.to_string();
        let pool = self.pool.clone();

        run_blocking(pool, move |conn| {
            sources::table
                .find(&id)
                .first::<SourceRecord>(conn)
                .optional()
        })
        .await
        .map(|opt| opt.map(Source::from))
    }

    /// Get all sources.
    pub async fn get_all(&self) -> Result<Vec<Source>, DieselError> {
        let pool = self.pool.clone();

        run_blocking(pool, move |conn| {
            sources::table
                .order(sources::id.asc())
                .load::<SourceRecord>(conn)
        })
        .await
        .map(|records| records.into_iter().map(Source::from).collect())
    }

    /// Save a source (insert or update using ON CONFLICT).
    ///
    /// `created_at` and `last_crawled_at` of an existing row are preserved.
    pub async fn save(&self, source: &Source) -> Result<(), DieselError> {
        let record = SourceRecord::from(source);
        let pool = self.pool.clone();

        run_blocking(pool, move |conn| {
            diesel::insert_into(sources::table)
                .values(&record)
                .on_conflict(sources::id)
                .do_update()
                .set((
                    sources::source_type.eq(&record.source_type),
                    sources::name.eq(&record.name),
                    sources::base_url.eq(&record.base_url),
                    sources::is_active.eq(record.is_active),
                    sources::requests_per_minute.eq(record.requests_per_minute),
                    sources::requests_per_hour.eq(record.requests_per_hour),
                    sources::delay_between_requests_ms.eq(record.delay_between_requests_ms),
                    sources::headers.eq(&record.headers),
                    sources::proxy.eq(&record.proxy),
                    sources::user_agent.eq(&record.user_agent),
                    sources::search_url.eq(&record.search_url),
                ))
                .execute(conn)?;
            Ok(())
        })
        .await
    }

    /// Check if a source exists.
    pub async fn exists(&self, id: &str) -> Result<bool, DieselError> {
        let id = id.to_string();
        let pool = self.pool.clone();

        run_blocking(pool, move |conn| {
            use diesel::dsl::count_star;
            let count: i64 = sources::table
                .filter(sources::id.eq(&id))
                .select(count_star())
                .first(conn)?;
            Ok(count > 0)
        })
        .await
    }

    /// Enable or disable crawling of a source.
    pub async fn set_active(&self, id: &str, active: bool) -> Result<bool, DieselError> {
        let id = id.to_string();
        let pool = self.pool.clone();

        run_blocking(pool, move |conn| {
            let rows = diesel::update(sources::table.find(&id))
                .set(sources::is_active.eq(active as i32))
                .execute(conn)?;
            Ok(rows > 0)
        })
        .await
    }

    /// Update last crawled timestamp.
    pub async fn update_last_crawled(
        &self,
        id: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<(), DieselError> {
        let id = id.to_string();
        let ts = format_datetime(&timestamp);
        let pool = self.pool.clone();

        run_blocking(pool, move |conn| {
            diesel::update(sources::table.find(&id))
                .set(sources::last_crawled_at.eq(Some(&ts)))
                .execute(conn)?;
            Ok(())
        })
        .await
    }
}
