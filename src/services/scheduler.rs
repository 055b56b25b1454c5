//! Recurring crawl triggers.
//!
//! Each scheduled source gets a task that enqueues a [`TriggerCrawl`] on the
//! default lane every interval. The trigger handler skips sources that still
//! have an active job, so a slow crawl is never doubled up.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::Result;
use crate::pipeline::commands::{Command, TriggerCrawl};
use crate::queue::JobQueueAdapter;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleEntry {
    pub source_id: String,
    pub interval: Duration,
    pub max_pages: Option<u32>,
}

pub struct Scheduler {
    queue: JobQueueAdapter,
    entries: Vec<ScheduleEntry>,
}

impl Scheduler {
    pub fn new(queue: JobQueueAdapter) -> Self {
        Self {
            queue,
            entries: Vec::new(),
        }
    }

    /// Schedule a source. Zero intervals are ignored.
    pub fn add(&mut self, entry: ScheduleEntry) {
        if entry.interval.is_zero() {
            return;
        }
        self.entries.retain(|e| e.source_id != entry.source_id);
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[ScheduleEntry] {
        &self.entries
    }

    /// Spawn one timer task per entry. The first trigger fires after one
    /// full interval.
    pub fn start(self, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        if !self.entries.is_empty() {
            info!(sources = self.entries.len(), "crawl scheduler starting");
        }
        self.entries
            .into_iter()
            .map(|entry| {
                let queue = self.queue.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(run_entry(queue, entry, shutdown))
            })
            .collect()
    }
}

async fn run_entry(queue: JobQueueAdapter, entry: ScheduleEntry, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(entry.interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {
                if let Err(e) = fire(&queue, &entry).await {
                    error!(source_id = %entry.source_id, error = %e, "failed to enqueue crawl trigger");
                }
            }
        }
    }
    debug!(source_id = %entry.source_id, "schedule stopped");
}

async fn fire(queue: &JobQueueAdapter, entry: &ScheduleEntry) -> Result<()> {
    queue
        .enqueue(&Command::TriggerCrawl(TriggerCrawl {
            source_id: entry.source_id.clone(),
            max_pages: entry.max_pages,
        }))
        .await?;
    debug!(source_id = %entry.source_id, "crawl trigger enqueued");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::commands::Lane;
    use crate::queue::QueueConfig;
    use crate::repository::test_support::setup_test_db;
    use crate::repository::DieselQueueStore;

    fn entry(source_id: &str, ms: u64) -> ScheduleEntry {
        ScheduleEntry {
            source_id: source_id.to_string(),
            interval: Duration::from_millis(ms),
            max_pages: Some(1),
        }
    }

    #[tokio::test]
    async fn entries_are_deduplicated_per_source() {
        let (pool, _dir) = setup_test_db().await;
        let queue = JobQueueAdapter::new(DieselQueueStore::new(pool), QueueConfig::default());
        let mut scheduler = Scheduler::new(queue);
        scheduler.add(entry("a", 1000));
        scheduler.add(entry("a", 2000));
        scheduler.add(entry("b", 0));
        assert_eq!(scheduler.entries(), &[entry("a", 2000)]);
    }

    #[tokio::test]
    async fn triggers_land_on_the_default_lane() {
        let (pool, _dir) = setup_test_db().await;
        let queue = JobQueueAdapter::new(DieselQueueStore::new(pool), QueueConfig::default());
        let mut scheduler = Scheduler::new(queue.clone());
        scheduler.add(entry("a", 40));

        let shutdown = CancellationToken::new();
        let handles = scheduler.start(shutdown.clone());
        tokio::time::sleep(Duration::from_millis(150)).await;
        shutdown.cancel();
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(queue.pending_count(Some(Lane::Crawl)).await.unwrap(), 0);
        let triggers = queue.peek(Lane::Default, 10).await.unwrap();
        assert!(!triggers.is_empty());
        assert!(triggers
            .iter()
            .all(|c| matches!(c, Command::TriggerCrawl(t) if t.source_id == "a")));
    }
}
