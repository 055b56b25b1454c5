//! Durable command queue backed by the `queued_commands` table.
//!
//! Rows move `pending -> running -> (deleted | pending | dead)`. Claims run
//! inside an immediate transaction so two workers never take the same row.

use chrono::Utc;
use diesel::prelude::*;

use super::diesel_models::{NewQueuedCommand, QueuedCommandRecord};
use super::diesel_pool::{run_blocking, DieselError, SqlitePool};
use super::format_datetime;
use crate::schema::queued_commands;

const STATUS_PENDING: &str = "pending";
const STATUS_RUNNING: &str = "running";
const STATUS_DEAD: &str = "dead";

/// A claimed queue row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedCommand {
    pub id: i32,
    pub lane: String,
    pub command_type: String,
    pub payload: String,
    /// Attempts including the current one.
    pub attempts: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
}

impl From<QueuedCommandRecord> for QueuedCommand {
    fn from(record: QueuedCommandRecord) -> Self {
        QueuedCommand {
            id: record.id,
            lane: record.lane,
            command_type: record.command_type,
            payload: record.payload,
            attempts: record.attempts.max(0) as u32,
            max_attempts: record.max_attempts.max(0) as u32,
            last_error: record.last_error,
        }
    }
}

/// A command waiting to be written to the queue.
#[derive(Debug, Clone)]
pub struct NewCommand {
    pub lane: String,
    pub command_type: String,
    pub payload: String,
}

#[derive(Clone)]
pub struct DieselQueueStore {
    pool: SqlitePool,
}

impl DieselQueueStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Append commands in order; all or none are written.
    pub async fn enqueue(
        &self,
        commands: Vec<NewCommand>,
        max_attempts: u32,
        available_at_ms: i64,
    ) -> Result<usize, DieselError> {
        if commands.is_empty() {
            return Ok(0);
        }
        let now = format_datetime(&Utc::now());
        let rows: Vec<NewQueuedCommand> = commands
            .into_iter()
            .map(|c| NewQueuedCommand {
                lane: c.lane,
                command_type: c.command_type,
                payload: c.payload,
                status: STATUS_PENDING.to_string(),
                attempts: 0,
                max_attempts: max_attempts as i32,
                available_at_ms,
                created_at: now.clone(),
                updated_at: now.clone(),
            })
            .collect();
        let pool = self.pool.clone();

        run_blocking(pool, move |conn| {
            conn.transaction::<_, DieselError, _>(|conn| {
                let mut written = 0;
                for row in &rows {
                    written += diesel::insert_into(queued_commands::table)
                        .values(row)
                        .execute(conn)?;
                }
                Ok(written)
            })
        })
        .await
    }

    /// Atomically claim the oldest available command of a lane.
    pub async fn claim(
        &self,
        lane: &str,
        worker_id: &str,
        now_ms: i64,
    ) -> Result<Option<QueuedCommand>, DieselError> {
        let lane = lane.to_string();
        let worker_id = worker_id.to_string();
        let now = format_datetime(&Utc::now());
        let pool = self.pool.clone();

        run_blocking(pool, move |conn| {
            conn.immediate_transaction::<_, DieselError, _>(|conn| {
                let record: Option<QueuedCommandRecord> = queued_commands::table
                    .filter(queued_commands::lane.eq(&lane))
                    .filter(queued_commands::status.eq(STATUS_PENDING))
                    .filter(queued_commands::available_at_ms.le(now_ms))
                    .order(queued_commands::id.asc())
                    .first(conn)
                    .optional()?;

                let Some(record) = record else {
                    return Ok(None);
                };

                diesel::update(queued_commands::table.find(record.id))
                    .set((
                        queued_commands::status.eq(STATUS_RUNNING),
                        queued_commands::attempts.eq(queued_commands::attempts + 1),
                        queued_commands::locked_by.eq(Some(&worker_id)),
                        queued_commands::updated_at.eq(&now),
                    ))
                    .execute(conn)?;

                let mut claimed = QueuedCommand::from(record);
                claimed.attempts += 1;
                Ok(Some(claimed))
            })
        })
        .await
    }

    /// Remove a finished command.
    pub async fn ack(&self, id: i32) -> Result<(), DieselError> {
        let pool = self.pool.clone();

        run_blocking(pool, move |conn| {
            diesel::delete(queued_commands::table.find(id)).execute(conn)?;
            Ok(())
        })
        .await
    }

    /// Put a failed command back for another attempt.
    pub async fn retry(
        &self,
        id: i32,
        error: &str,
        available_at_ms: i64,
    ) -> Result<(), DieselError> {
        let error = error.to_string();
        let now = format_datetime(&Utc::now());
        let pool = self.pool.clone();

        run_blocking(pool, move |conn| {
            diesel::update(queued_commands::table.find(id))
                .set((
                    queued_commands::status.eq(STATUS_PENDING),
                    queued_commands::last_error.eq(Some(&error)),
                    queued_commands::available_at_ms.eq(available_at_ms),
                    queued_commands::locked_by.eq(None::<String>),
                    queued_commands::updated_at.eq(&now),
                ))
                .execute(conn)?;
            Ok(())
        })
        .await
    }

    /// Park a command that will not be retried.
    pub async fn dead(&self, id: i32, error: &str) -> Result<(), DieselError> {
        let error = error.to_string();
        let now = format_datetime(&Utc::now());
        let pool = self.pool.clone();

        run_blocking(pool, move |conn| {
            diesel::update(queued_commands::table.find(id))
                .set((
                    queued_commands::status.eq(STATUS_DEAD),
                    queued_commands::last_error.eq(Some(&error)),
                    queued_commands::locked_by.eq(None::<String>),
                    queued_commands::updated_at.eq(&now),
                ))
                .execute(conn)?;
            Ok(())
        })
        .await
    }

    /// Drop every pending and running command. Dead rows are kept.
    pub async fn purge(&self) -> Result<usize, DieselError> {
        let pool = self.pool.clone();

        run_blocking(pool, move |conn| {
            diesel::delete(
                queued_commands::table
                    .filter(queued_commands::status.eq_any([STATUS_PENDING, STATUS_RUNNING])),
            )
            .execute(conn)
        })
        .await
    }

    /// Pending commands, optionally for one lane.
    pub async fn pending_count(&self, lane: Option<&str>) -> Result<i64, DieselError> {
        let lane = lane.map(|l| l.to_string());
        let pool = self.pool.clone();

        run_blocking(pool, move |conn| {
            let mut query = queued_commands::table
                .filter(queued_commands::status.eq(STATUS_PENDING))
                .into_boxed();
            if let Some(ref lane) = lane {
                query = query.filter(queued_commands::lane.eq(lane));
            }
            query.count().get_result(conn)
        })
        .await
    }

    pub async fn dead_count(&self) -> Result<i64, DieselError> {
        let pool = self.pool.clone();

        run_blocking(pool, move |conn| {
            queued_commands::table
                .filter(queued_commands::status.eq(STATUS_DEAD))
                .count()
                .get_result(conn)
        })
        .await
    }

    /// Pending commands of a lane in claim order, without claiming them.
    pub async fn peek(&self, lane: &str, limit: u32) -> Result<Vec<QueuedCommand>, DieselError> {
        let lane = lane.to_string();
        let pool = self.pool.clone();

        run_blocking(pool, move |conn| {
            queued_commands::table
                .filter(queued_commands::lane.eq(&lane))
                .filter(queued_commands::status.eq(STATUS_PENDING))
                .order(queued_commands::id.asc())
                .limit(limit as i64)
                .load::<QueuedCommandRecord>(conn)
        })
        .await
        .map(|records| records.into_iter().map(QueuedCommand::from).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::test_support::setup_test_db;

    fn cmd(lane: &str, n: u32) -> NewCommand {
        NewCommand {
            lane: lane.to_string(),
            command_type: "test".to_string(),
            payload: format!("{{\"n\":{n}}}"),
        }
    }

    #[tokio::test]
    async fn claim_is_fifo_per_lane() {
        let (pool, _dir) = setup_test_db().await;
        let store = DieselQueueStore::new(pool);
        store
            .enqueue(vec![cmd("crawl", 1), cmd("default", 2), cmd("crawl", 3)], 3, 0)
            .await
            .unwrap();

        let first = store.claim("crawl", "w1", 10).await.unwrap().unwrap();
        let second = store.claim("crawl", "w2", 10).await.unwrap().unwrap();
        assert_eq!(first.payload, "{\"n\":1}");
        assert_eq!(second.payload, "{\"n\":3}");
        assert_eq!(first.attempts, 1);
        assert!(store.claim("crawl", "w1", 10).await.unwrap().is_none());
        assert_eq!(store.pending_count(Some("default")).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn retry_respects_availability() {
        let (pool, _dir) = setup_test_db().await;
        let store = DieselQueueStore::new(pool);
        store.enqueue(vec![cmd("crawl", 1)], 3, 0).await.unwrap();

        let claimed = store.claim("crawl", "w", 0).await.unwrap().unwrap();
        store.retry(claimed.id, "boom", 5_000).await.unwrap();
        assert!(store.claim("crawl", "w", 4_999).await.unwrap().is_none());

        let again = store.claim("crawl", "w", 5_000).await.unwrap().unwrap();
        assert_eq!(again.attempts, 2);
        assert_eq!(again.last_error.as_deref(), Some("boom"));

        store.dead(again.id, "gave up").await.unwrap();
        assert_eq!(store.dead_count().await.unwrap(), 1);
        assert_eq!(store.pending_count(None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn purge_drops_pending_and_running() {
        let (pool, _dir) = setup_test_db().await;
        let store = DieselQueueStore::new(pool);
        store
            .enqueue((1..=5).map(|n| cmd("crawl", n)).collect(), 3, 0)
            .await
            .unwrap();
        let claimed = store.claim("crawl", "w", 0).await.unwrap().unwrap();
        store.ack(claimed.id).await.unwrap();
        store.claim("crawl", "w", 0).await.unwrap().unwrap();

        assert_eq!(store.purge().await.unwrap(), 4);
        assert_eq!(store.pending_count(None).await.unwrap(), 0);
        assert!(store.peek("crawl", 10).await.unwrap().is_empty());
    }
}
