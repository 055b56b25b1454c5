//! Durable command queue with lanes and a worker pool.
//!
//! Delivery is at-least-once: a claimed row stays `running` until the handler
//! returns. Failures are retried with exponential backoff up to
//! `max_attempts`; exhausted or non-retryable commands are dead-lettered and
//! handed to [`CommandHandler::abandon`].
//!
//! Pending work is purged once at startup, before any worker runs, so a
//! command whose completion state is unknown after a crash is never replayed.

mod worker;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{CrawlError, Result};
use crate::pipeline::commands::{Command, Lane};
use crate::repository::diesel_queue::{NewCommand, QueuedCommand};
use crate::repository::DieselQueueStore;

use worker::Worker;

/// Executes delivered commands.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, command: &Command, cancel: &CancellationToken) -> Result<()>;

    /// Called once when a command is dead-lettered.
    async fn abandon(&self, command: &Command, error: &CrawlError);
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Workers per lane = multiplier × available parallelism.
    pub worker_multiplier: usize,
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles for each further one.
    pub retry_base_delay: Duration,
    /// Idle workers re-check the queue this often.
    pub poll_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            worker_multiplier: 2,
            max_attempts: 3,
            retry_base_delay: Duration::from_secs(5),
            poll_interval: Duration::from_secs(1),
        }
    }
}

impl QueueConfig {
    pub fn workers_per_lane(&self) -> usize {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        (self.worker_multiplier * cores).max(1)
    }

    /// Backoff before attempt `attempts + 1`.
    pub fn retry_delay(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(16);
        self.retry_base_delay.saturating_mul(1u32 << exponent)
    }
}

/// What happened to a claimed command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Completed,
    Retrying,
    DeadLettered,
    /// Interrupted by cancellation; the row is left for the startup purge.
    Interrupted,
}

/// Queue front end shared by producers and workers.
#[derive(Clone)]
pub struct JobQueueAdapter {
    store: DieselQueueStore,
    config: QueueConfig,
    signals: Arc<HashMap<Lane, Notify>>,
    purged: Arc<AtomicBool>,
}

impl JobQueueAdapter {
    pub fn new(store: DieselQueueStore, config: QueueConfig) -> Self {
        let signals = Lane::ALL.into_iter().map(|l| (l, Notify::new())).collect();
        Self {
            store,
            config,
            signals: Arc::new(signals),
            purged: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub async fn enqueue(&self, command: &Command) -> Result<()> {
        self.enqueue_many(std::slice::from_ref(command)).await?;
        Ok(())
    }

    /// Enqueue in order; either all commands are stored or none.
    pub async fn enqueue_many(&self, commands: &[Command]) -> Result<usize> {
        if commands.is_empty() {
            return Ok(0);
        }
        let rows = commands
            .iter()
            .map(|c| {
                Ok(NewCommand {
                    lane: c.lane().as_str().to_string(),
                    command_type: c.command_type().to_string(),
                    payload: c.to_payload()?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let written = self
            .store
            .enqueue(rows, self.config.max_attempts, now_ms())
            .await?;

        for lane in Lane::ALL {
            if commands.iter().any(|c| c.lane() == lane) {
                self.wake(lane);
            }
        }
        debug!(count = written, "enqueued commands");
        Ok(written)
    }

    /// Drop every pending and running command across all lanes.
    pub async fn purge_all_queues(&self) -> Result<usize> {
        let removed = self.store.purge().await?;
        self.purged.store(true, Ordering::SeqCst);
        if removed > 0 {
            warn!(removed, "purged commands left over from a previous run");
        } else {
            info!("queue purge found nothing to remove");
        }
        Ok(removed)
    }

    /// Spawn the worker pool. Requires a prior [`purge_all_queues`](Self::purge_all_queues).
    pub fn start(
        &self,
        handler: Arc<dyn CommandHandler>,
        shutdown: CancellationToken,
    ) -> Result<Vec<JoinHandle<()>>> {
        if !self.purged.load(Ordering::SeqCst) {
            return Err(CrawlError::Queue(
                "queues must be purged before workers start".to_string(),
            ));
        }

        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "localhost".to_string());
        let per_lane = self.config.workers_per_lane();

        let mut handles = Vec::with_capacity(per_lane * Lane::ALL.len());
        for lane in Lane::ALL {
            for n in 0..per_lane {
                let worker = Worker {
                    id: format!("{host}-{}-{n}", lane.as_str()),
                    lane,
                    queue: self.clone(),
                    handler: handler.clone(),
                };
                handles.push(tokio::spawn(worker.run(shutdown.clone())));
            }
        }
        info!(workers_per_lane = per_lane, "queue workers started");
        Ok(handles)
    }

    /// Claim and execute one command from `lane`.
    ///
    /// Returns `None` when nothing was available.
    pub async fn process_next(
        &self,
        lane: Lane,
        handler: &dyn CommandHandler,
        worker_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<Delivery>> {
        let Some(row) = self.store.claim(lane.as_str(), worker_id, now_ms()).await? else {
            return Ok(None);
        };

        let command = match Command::from_payload(&row.payload) {
            Ok(command) => command,
            Err(e) => {
                error!(
                    id = row.id,
                    command_type = %row.command_type,
                    error = %e,
                    "undecodable command dead-lettered"
                );
                self.store.dead(row.id, &e.to_string()).await?;
                return Ok(Some(Delivery::DeadLettered));
            }
        };

        match handler.handle(&command, cancel).await {
            Ok(()) => {
                self.store.ack(row.id).await?;
                Ok(Some(Delivery::Completed))
            }
            Err(CrawlError::Cancelled) => {
                debug!(id = row.id, "command interrupted by cancellation");
                Ok(Some(Delivery::Interrupted))
            }
            Err(e) => self.fail(&row, &command, e, handler).await.map(Some),
        }
    }

    async fn fail(
        &self,
        row: &QueuedCommand,
        command: &Command,
        err: CrawlError,
        handler: &dyn CommandHandler,
    ) -> Result<Delivery> {
        if err.is_retryable() && row.attempts < row.max_attempts {
            let delay = self.config.retry_delay(row.attempts);
            warn!(
                id = row.id,
                command = %command.describe(),
                attempt = row.attempts,
                max_attempts = row.max_attempts,
                ?delay,
                error = %err,
                "command failed, will retry"
            );
            let available_at = now_ms() + delay.as_millis() as i64;
            self.store.retry(row.id, &err.to_string(), available_at).await?;
            if delay.is_zero() {
                self.wake(command.lane());
            }
            return Ok(Delivery::Retrying);
        }

        error!(
            id = row.id,
            command = %command.describe(),
            attempts = row.attempts,
            error = %err,
            "command dead-lettered"
        );
        self.store.dead(row.id, &err.to_string()).await?;
        handler.abandon(command, &err).await;
        Ok(Delivery::DeadLettered)
    }

    /// Process commands inline until no lane has work available now.
    pub async fn drain(
        &self,
        handler: &dyn CommandHandler,
        cancel: &CancellationToken,
    ) -> Result<usize> {
        let mut processed = 0;
        loop {
            let mut progressed = false;
            for lane in Lane::ALL {
                if cancel.is_cancelled() {
                    return Err(CrawlError::Cancelled);
                }
                if self.process_next(lane, handler, "inline", cancel).await?.is_some() {
                    processed += 1;
                    progressed = true;
                }
            }
            if !progressed {
                return Ok(processed);
            }
        }
    }

    pub async fn pending_count(&self, lane: Option<Lane>) -> Result<i64> {
        Ok(self.store.pending_count(lane.map(|l| l.as_str())).await?)
    }

    pub async fn dead_count(&self) -> Result<i64> {
        Ok(self.store.dead_count().await?)
    }

    /// Pending commands of a lane in delivery order.
    pub async fn peek(&self, lane: Lane, limit: u32) -> Result<Vec<Command>> {
        let rows = self.store.peek(lane.as_str(), limit).await?;
        rows.iter()
            .map(|row| Command::from_payload(&row.payload))
            .collect()
    }

    fn wake(&self, lane: Lane) {
        if let Some(signal) = self.signals.get(&lane) {
            signal.notify_waiters();
        }
    }

    async fn wait_for_work(&self, lane: Lane) {
        match self.signals.get(&lane) {
            Some(signal) => {
                tokio::select! {
                    _ = signal.notified() => {}
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
            }
            None => tokio::time::sleep(self.config.poll_interval).await,
        }
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::commands::{CrawlPage, TriggerCrawl};
    use crate::repository::test_support::setup_test_db;
    use std::sync::Mutex as StdMutex;

    /// Fails the first `failures` deliveries with the given error kind.
    struct ScriptedHandler {
        failures: StdMutex<u32>,
        retryable: bool,
        handled: StdMutex<Vec<String>>,
        abandoned: StdMutex<Vec<String>>,
    }

    impl ScriptedHandler {
        fn new(failures: u32, retryable: bool) -> Self {
            Self {
                failures: StdMutex::new(failures),
                retryable,
                handled: StdMutex::new(Vec::new()),
                abandoned: StdMutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl CommandHandler for ScriptedHandler {
        async fn handle(&self, command: &Command, _cancel: &CancellationToken) -> Result<()> {
            self.handled.lock().unwrap().push(command.command_type().to_string());
            let mut failures = self.failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(if self.retryable {
                    CrawlError::HttpStatus {
                        url: "https://s.example".into(),
                        status: 502,
                    }
                } else {
                    CrawlError::parse("layout changed")
                });
            }
            Ok(())
        }

        async fn abandon(&self, command: &Command, _error: &CrawlError) {
            self.abandoned.lock().unwrap().push(command.describe());
        }
    }

    fn page_command(n: u32) -> Command {
        Command::CrawlPage(CrawlPage {
            source_id: "s".into(),
            crawl_job_id: "j".into(),
            chapter_id: format!("c{n}"),
            chapter_url: format!("https://s.example/c/{n}"),
            skip_existing: true,
        })
    }

    async fn queue() -> (JobQueueAdapter, tempfile::TempDir) {
        let (pool, dir) = setup_test_db().await;
        let config = QueueConfig {
            retry_base_delay: Duration::ZERO,
            ..Default::default()
        };
        (JobQueueAdapter::new(DieselQueueStore::new(pool), config), dir)
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let (queue, _dir) = queue().await;
        let handler = ScriptedHandler::new(2, true);
        let cancel = CancellationToken::new();
        queue.enqueue(&page_command(1)).await.unwrap();

        let processed = queue.drain(&handler, &cancel).await.unwrap();
        assert_eq!(processed, 3);
        assert_eq!(handler.handled.lock().unwrap().len(), 3);
        assert!(handler.abandoned.lock().unwrap().is_empty());
        assert_eq!(queue.pending_count(None).await.unwrap(), 0);
        assert_eq!(queue.dead_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn exhausted_commands_are_dead_lettered() {
        let (queue, _dir) = queue().await;
        let handler = ScriptedHandler::new(10, true);
        let cancel = CancellationToken::new();
        queue.enqueue(&page_command(1)).await.unwrap();

        queue.drain(&handler, &cancel).await.unwrap();
        assert_eq!(handler.handled.lock().unwrap().len(), 3);
        assert_eq!(handler.abandoned.lock().unwrap().len(), 1);
        assert_eq!(queue.dead_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn parse_errors_are_not_retried() {
        let (queue, _dir) = queue().await;
        let handler = ScriptedHandler::new(1, false);
        let cancel = CancellationToken::new();
        queue.enqueue(&page_command(1)).await.unwrap();

        let delivery = queue
            .process_next(Lane::Crawl, &handler, "w", &cancel)
            .await
            .unwrap();
        assert_eq!(delivery, Some(Delivery::DeadLettered));
        assert_eq!(handler.abandoned.lock().unwrap().len(), 1);
        assert_eq!(queue.pending_count(None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn lanes_are_independent() {
        let (queue, _dir) = queue().await;
        let handler = ScriptedHandler::new(0, true);
        let cancel = CancellationToken::new();
        queue
            .enqueue_many(&[
                page_command(1),
                Command::TriggerCrawl(TriggerCrawl {
                    source_id: "s".into(),
                    max_pages: None,
                }),
            ])
            .await
            .unwrap();

        queue.process_next(Lane::Default, &handler, "w", &cancel).await.unwrap();
        assert_eq!(*handler.handled.lock().unwrap(), vec!["trigger_crawl"]);
        assert_eq!(queue.pending_count(Some(Lane::Crawl)).await.unwrap(), 1);
        assert_eq!(queue.pending_count(Some(Lane::Default)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn purge_clears_unacked_commands_and_gates_start() {
        let (queue, _dir) = queue().await;
        let handler: Arc<dyn CommandHandler> = Arc::new(ScriptedHandler::new(0, true));
        let shutdown = CancellationToken::new();

        assert!(matches!(
            queue.start(handler.clone(), shutdown.clone()),
            Err(CrawlError::Queue(_))
        ));

        let commands: Vec<_> = (1..=5).map(page_command).collect();
        queue.enqueue_many(&commands).await.unwrap();
        assert_eq!(queue.pending_count(None).await.unwrap(), 5);

        assert_eq!(queue.purge_all_queues().await.unwrap(), 5);
        assert_eq!(queue.pending_count(None).await.unwrap(), 0);

        let handles = queue.start(handler, shutdown.clone()).unwrap();
        assert!(!handles.is_empty());
        shutdown.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[test]
    fn backoff_doubles() {
        let config = QueueConfig {
            retry_base_delay: Duration::from_secs(5),
            ..Default::default()
        };
        assert_eq!(config.retry_delay(1), Duration::from_secs(5));
        assert_eq!(config.retry_delay(2), Duration::from_secs(10));
        assert!(config.workers_per_lane() >= 2);
    }
}
