//! Process wiring: storage, crawlers, queue, orchestrator and scheduler.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{Config, Settings};
use crate::error::{CrawlError, Result};
use crate::models::{CrawlJob, Source};
use crate::pipeline::CrawlJobOrchestrator;
use crate::queue::{CommandHandler, JobQueueAdapter};
use crate::repository::{
    create_diesel_pool, migrations, DieselQueueStore, Repositories, SqlitePool, WriteGuard,
};
use crate::scrapers::{CrawlerRegistry, DefaultClientFactory, HttpClientFactory, RateLimiter};
use crate::services::{ArtifactStore, ScheduleEntry, Scheduler};

/// Everything a running process needs.
pub struct CrawlRuntime {
    pub settings: Settings,
    pub pool: SqlitePool,
    pub repos: Repositories,
    pub limiter: RateLimiter,
    pub queue: JobQueueAdapter,
    pub orchestrator: Arc<CrawlJobOrchestrator>,
    schedules: Vec<ScheduleEntry>,
    shutdown: CancellationToken,
}

impl CrawlRuntime {
    /// Open storage and build components without touching the queue.
    ///
    /// Suitable for read-only commands; use [`bootstrap`](Self::bootstrap)
    /// before running workers.
    pub async fn open(settings: Settings, config: &Config) -> Result<Self> {
        settings.ensure_directories()?;
        let pool = create_diesel_pool(&settings.database_path())?;
        migrations::init_schema(&pool).await?;
        let repos = Repositories::new(pool.clone());

        let mut schedules = Vec::new();
        for (source, entry) in config.configured_sources() {
            repos.sources.save(&source).await?;
            if let Some(interval) = entry.schedule_interval() {
                schedules.push(ScheduleEntry {
                    source_id: source.id.clone(),
                    interval,
                    max_pages: entry.max_pages,
                });
            }
        }

        let factory: Arc<dyn HttpClientFactory> = Arc::new(DefaultClientFactory::new(
            Duration::from_secs(settings.request_timeout),
            settings.user_agent.clone(),
        ));
        let limiter = RateLimiter::new();
        let registry = CrawlerRegistry::with_defaults(factory, limiter.clone());
        Ok(Self::assemble(settings, pool, registry, limiter, schedules))
    }

    /// Open the runtime and make it safe to start workers: purge leftover
    /// queue work, then close the jobs it belonged to.
    pub async fn bootstrap(settings: Settings, config: &Config) -> Result<Self> {
        let runtime = Self::open(settings, config).await?;
        runtime.prepare().await?;
        Ok(runtime)
    }

    /// Build a runtime around an existing pool and registry.
    pub fn assemble(
        settings: Settings,
        pool: SqlitePool,
        registry: CrawlerRegistry,
        limiter: RateLimiter,
        schedules: Vec<ScheduleEntry>,
    ) -> Self {
        let repos = Repositories::new(pool.clone());
        let queue = JobQueueAdapter::new(DieselQueueStore::new(pool.clone()), settings.queue_config());
        let orchestrator = CrawlJobOrchestrator::new(
            repos.clone(),
            registry,
            queue.clone(),
            WriteGuard::new(settings.guard_mode),
            ArtifactStore::new(settings.artifacts_dir.clone()),
        )
        .with_max_list_pages(settings.max_list_pages);

        Self {
            settings,
            pool,
            repos,
            limiter,
            queue,
            orchestrator: Arc::new(orchestrator),
            schedules,
            shutdown: CancellationToken::new(),
        }
    }

    /// Startup purge followed by recovery of interrupted jobs.
    pub async fn prepare(&self) -> Result<()> {
        let purged = self.queue.purge_all_queues().await?;
        let recovered = self.orchestrator.recover_interrupted_jobs().await?;
        info!(purged, recovered, "runtime prepared");
        Ok(())
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Spawn queue workers and, if requested, the crawl scheduler.
    pub fn start(&self, with_scheduler: bool) -> Result<Vec<JoinHandle<()>>> {
        let handler: Arc<dyn CommandHandler> = self.orchestrator.clone();
        let mut handles = self.queue.start(handler, self.shutdown.clone())?;

        if with_scheduler {
            let mut scheduler = Scheduler::new(self.queue.clone());
            for entry in &self.schedules {
                scheduler.add(entry.clone());
            }
            handles.extend(scheduler.start(self.shutdown.clone()));
        }
        Ok(handles)
    }

    /// Stop workers and wait for them to exit.
    pub async fn stop(&self, handles: Vec<JoinHandle<()>>) {
        self.shutdown.cancel();
        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                warn!(error = %e, "worker task ended abnormally");
            }
        }
    }

    pub async fn source(&self, source_id: &str) -> Result<Source> {
        self.repos
            .sources
            .get(source_id)
            .await?
            .ok_or_else(|| CrawlError::SourceNotFound(source_id.to_string()))
    }

    /// Poll a job until it reaches a terminal status.
    pub async fn wait_for_job(
        &self,
        job_id: &str,
        poll: Duration,
        cancel: &CancellationToken,
    ) -> Result<CrawlJob> {
        loop {
            let job = self
                .repos
                .jobs
                .get(job_id)
                .await?
                .ok_or_else(|| CrawlError::JobNotFound(job_id.to_string()))?;
            if job.status.is_terminal() {
                return Ok(job);
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(CrawlError::Cancelled),
                _ = tokio::time::sleep(poll) => {}
            }
        }
    }
}
