//! Diesel-based crawl job and job log repository.

use chrono::{DateTime, Utc};
use diesel::prelude::*;

use super::diesel_models::{CrawlJobLogRecord, CrawlJobRecord, NewCrawlJobLog};
use super::diesel_pool::{run_blocking, DieselError, SqlitePool};
use super::{format_datetime, parse_datetime, parse_datetime_opt};
use crate::models::{CrawlJob, CrawlJobKind, CrawlJobLog, CrawlJobStatus, LogLevel};
use crate::schema::{crawl_job_logs, crawl_jobs};

const ACTIVE_STATUSES: [&str; 2] = ["pending", "running"];

impl From<CrawlJobRecord> for CrawlJob {
    fn from(record: CrawlJobRecord) -> Self {
        CrawlJob {
            kind: CrawlJobKind::from_str(&record.kind).unwrap_or(CrawlJobKind::MangaList),
            status: CrawlJobStatus::from_str(&record.status).unwrap_or(CrawlJobStatus::Failed),
            created_at: parse_datetime(&record.created_at),
            started_at: parse_datetime_opt(record.started_at),
            finished_at: parse_datetime_opt(record.finished_at),
            processed: record.processed.max(0) as u32,
            total: record.total.max(0) as u32,
            errors: record.errors.max(0) as u32,
            root_failed: record.root_failed != 0,
            id: record.id,
            source_id: record.source_id,
        }
    }
}

impl From<&CrawlJob> for CrawlJobRecord {
    fn from(job: &CrawlJob) -> Self {
        CrawlJobRecord {
            id: job.id.clone(),
            source_id: job.source_id.clone(),
            kind: job.kind.as_str().to_string(),
            status: job.status.as_str().to_string(),
            created_at: format_datetime(&job.created_at),
            started_at: job.started_at.as_ref().map(format_datetime),
            finished_at: job.finished_at.as_ref().map(format_datetime),
            processed: job.processed as i32,
            total: job.total as i32,
            errors: job.errors as i32,
            root_failed: job.root_failed as i32,
        }
    }
}

impl From<CrawlJobLogRecord> for CrawlJobLog {
    fn from(record: CrawlJobLogRecord) -> Self {
        CrawlJobLog {
            id: Some(record.id),
            level: LogLevel::from_str(&record.level).unwrap_or(LogLevel::Info),
            timestamp: parse_datetime(&record.timestamp),
            crawl_job_id: record.crawl_job_id,
            message: record.message,
        }
    }
}

/// Counter deltas applied to a job in one transaction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobProgress {
    /// Newly dispatched commands (added to `total`).
    pub dispatched: i32,
    /// Settled commands (added to `processed`).
    pub settled: i32,
    pub errors: i32,
    pub root_failed: bool,
}

/// Diesel-based crawl job repository.
#[derive(Clone)]
pub struct DieselCrawlJobRepository {
    pool: SqlitePool,
}

impl DieselCrawlJobRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a new job.
    pub async fn create(&self, job: &CrawlJob) -> Result<(), DieselError> {
        let record = CrawlJobRecord::from(job);
        let pool = self.pool.clone();

        run_blocking(pool, move |conn| {
            diesel::insert_into(crawl_jobs::table)
                .values(&record)
                .execute(conn)?;
            Ok(())
        })
        .await
    }

    pub async fn get(&self, id: &str) -> Result<Option<CrawlJob>, DieselError> {
        let id = id.to_string();
        let pool = self.pool.clone();

        run_blocking(pool, move |conn| {
            crawl_jobs::table
                .find(&id)
                .first::<CrawlJobRecord>(conn)
                .optional()
        })
        .await
        .map(|opt| opt.map(CrawlJob::from))
    }

    /// Most recent jobs first, optionally for one source.
    pub async fn list(
        &self,
        source_id: Option<&str>,
        limit: u32,
    ) -> Result<Vec<CrawlJob>, DieselError> {
        let source_id = source_id.map(|s| s.to_string());
        let limit = limit as i64;
        let pool = self.pool.clone();

        run_blocking(pool, move |conn| {
            let mut query = crawl_jobs::table
                .order(crawl_jobs::created_at.desc())
                .limit(limit)
                .into_boxed();
            if let Some(ref sid) = source_id {
                query = query.filter(crawl_jobs::source_id.eq(sid));
            }
            query.load::<CrawlJobRecord>(conn)
        })
        .await
        .map(|records| records.into_iter().map(CrawlJob::from).collect())
    }

    /// Jobs still pending or running, optionally for one source.
    pub async fn find_active(&self, source_id: Option<&str>) -> Result<Vec<CrawlJob>, DieselError> {
        let source_id = source_id.map(|s| s.to_string());
        let pool = self.pool.clone();

        run_blocking(pool, move |conn| {
            let mut query = crawl_jobs::table
                .filter(crawl_jobs::status.eq_any(ACTIVE_STATUSES))
                .order(crawl_jobs::created_at.asc())
                .into_boxed();
            if let Some(ref sid) = source_id {
                query = query.filter(crawl_jobs::source_id.eq(sid));
            }
            query.load::<CrawlJobRecord>(conn)
        })
        .await
        .map(|records| records.into_iter().map(CrawlJob::from).collect())
    }

    /// Move a pending job to running and count its root commands.
    pub async fn mark_running(
        &self,
        id: &str,
        root_commands: i32,
        started_at: DateTime<Utc>,
    ) -> Result<bool, DieselError> {
        let id = id.to_string();
        let started = format_datetime(&started_at);
        let pool = self.pool.clone();

        run_blocking(pool, move |conn| {
            let rows = diesel::update(
                crawl_jobs::table
                    .filter(crawl_jobs::id.eq(&id))
                    .filter(crawl_jobs::status.eq(CrawlJobStatus::Pending.as_str())),
            )
            .set((
                crawl_jobs::status.eq(CrawlJobStatus::Running.as_str()),
                crawl_jobs::started_at.eq(Some(&started)),
                crawl_jobs::total.eq(crawl_jobs::total + root_commands),
            ))
            .execute(conn)?;
            Ok(rows > 0)
        })
        .await
    }

    /// Apply counter deltas and return the updated job.
    pub async fn apply_progress(
        &self,
        id: &str,
        progress: JobProgress,
    ) -> Result<Option<CrawlJob>, DieselError> {
        let id = id.to_string();
        let pool = self.pool.clone();

        run_blocking(pool, move |conn| {
            conn.transaction::<_, DieselError, _>(|conn| {
                let target = crawl_jobs::table.filter(crawl_jobs::id.eq(&id));
                diesel::update(target)
                    .set((
                        crawl_jobs::total.eq(crawl_jobs::total + progress.dispatched),
                        crawl_jobs::processed.eq(crawl_jobs::processed + progress.settled),
                        crawl_jobs::errors.eq(crawl_jobs::errors + progress.errors),
                    ))
                    .execute(conn)?;
                if progress.root_failed {
                    diesel::update(target)
                        .set(crawl_jobs::root_failed.eq(1))
                        .execute(conn)?;
                }
                crawl_jobs::table
                    .find(&id)
                    .first::<CrawlJobRecord>(conn)
                    .optional()
            })
        })
        .await
        .map(|opt| opt.map(CrawlJob::from))
    }

    /// Move an active job to a terminal status.
    ///
    /// Returns false when the job was already terminal.
    pub async fn finish(
        &self,
        id: &str,
        status: CrawlJobStatus,
        finished_at: DateTime<Utc>,
    ) -> Result<bool, DieselError> {
        let id = id.to_string();
        let finished = format_datetime(&finished_at);
        let pool = self.pool.clone();

        run_blocking(pool, move |conn| {
            let rows = diesel::update(
                crawl_jobs::table
                    .filter(crawl_jobs::id.eq(&id))
                    .filter(crawl_jobs::status.eq_any(ACTIVE_STATUSES)),
            )
            .set((
                crawl_jobs::status.eq(status.as_str()),
                crawl_jobs::finished_at.eq(Some(&finished)),
            ))
            .execute(conn)?;
            Ok(rows > 0)
        })
        .await
    }

    /// Append a log entry.
    pub async fn append_log(&self, log: &CrawlJobLog) -> Result<(), DieselError> {
        let new_log = NewCrawlJobLog {
            crawl_job_id: log.crawl_job_id.clone(),
            timestamp: format_datetime(&log.timestamp),
            level: log.level.as_str().to_string(),
            message: log.message.clone(),
        };
        let pool = self.pool.clone();

        run_blocking(pool, move |conn| {
            diesel::insert_into(crawl_job_logs::table)
                .values(&new_log)
                .execute(conn)?;
            Ok(())
        })
        .await
    }

    /// Log entries of a job ordered by timestamp.
    pub async fn logs(&self, job_id: &str) -> Result<Vec<CrawlJobLog>, DieselError> {
        let job_id = job_id.to_string();
        let pool = self.pool.clone();

        run_blocking(pool, move |conn| {
            crawl_job_logs::table
                .filter(crawl_job_logs::crawl_job_id.eq(&job_id))
                .order((crawl_job_logs::timestamp.asc(), crawl_job_logs::id.asc()))
                .load::<CrawlJobLogRecord>(conn)
        })
        .await
        .map(|records| records.into_iter().map(CrawlJobLog::from).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::test_support::{insert_source, setup_test_db};

    #[tokio::test]
    async fn counters_and_finish() {
        let (pool, _dir) = setup_test_db().await;
        insert_source(&pool, "src").await;
        let repo = DieselCrawlJobRepository::new(pool);

        let job = CrawlJob::new("src".to_string(), CrawlJobKind::MangaList);
        repo.create(&job).await.unwrap();
        assert!(repo.mark_running(&job.id, 1, Utc::now()).await.unwrap());
        // Only a pending job can start.
        assert!(!repo.mark_running(&job.id, 1, Utc::now()).await.unwrap());

        let updated = repo
            .apply_progress(
                &job.id,
                JobProgress {
                    dispatched: 2,
                    settled: 1,
                    ..Default::default()
                },
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!((updated.processed, updated.total), (1, 3));
        assert_eq!(updated.status, CrawlJobStatus::Running);

        let updated = repo
            .apply_progress(
                &job.id,
                JobProgress {
                    settled: 2,
                    errors: 1,
                    ..Default::default()
                },
            )
            .await
            .unwrap()
            .unwrap();
        assert!(updated.is_settled());
        assert_eq!(updated.errors, 1);
        assert!(!updated.root_failed);

        assert!(repo
            .finish(&job.id, CrawlJobStatus::Completed, Utc::now())
            .await
            .unwrap());
        assert!(!repo
            .finish(&job.id, CrawlJobStatus::Failed, Utc::now())
            .await
            .unwrap());
        let done = repo.get(&job.id).await.unwrap().unwrap();
        assert_eq!(done.status, CrawlJobStatus::Completed);
        assert!(done.finished_at.is_some());
        assert!(repo.find_active(Some("src")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn logs_come_back_in_timestamp_order() {
        let (pool, _dir) = setup_test_db().await;
        insert_source(&pool, "src").await;
        let repo = DieselCrawlJobRepository::new(pool);
        let job = CrawlJob::new("src".to_string(), CrawlJobKind::MangaList);
        repo.create(&job).await.unwrap();

        let mut late = CrawlJobLog::new(&job.id, LogLevel::Error, "second");
        late.timestamp = Utc::now() + chrono::Duration::seconds(5);
        let early = CrawlJobLog::new(&job.id, LogLevel::Info, "first");
        repo.append_log(&late).await.unwrap();
        repo.append_log(&early).await.unwrap();

        let logs = repo.logs(&job.id).await.unwrap();
        let messages: Vec<_> = logs.iter().map(|l| l.message.as_str()).collect();
        assert_eq!(messages, vec!["first", "second"]);
        assert_eq!(logs[1].level, LogLevel::Error);
    }
}
