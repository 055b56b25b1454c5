//! Crawl job lifecycle.
//!
//! A job moves `Pending -> Running` when its root command is enqueued and is
//! finalized once every dispatched command has settled (`processed ==
//! total`). Children are always counted into `total` before their parent is
//! counted into `processed`, so a job never completes while work is still in
//! flight. Only the root command can fail a job; descendant failures are
//! logged and counted.

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::commands::{Command, CrawlAllMangasChapters, CrawlMangaList, TriggerCrawl};
use crate::config::DEFAULT_MAX_LIST_PAGES;
use crate::error::{CrawlError, Result};
use crate::models::{CrawlJob, CrawlJobKind, CrawlJobLog, CrawlJobStatus, LogLevel, Source};
use crate::queue::{CommandHandler, JobQueueAdapter};
use crate::repository::diesel_crawl_job::JobProgress;
use crate::repository::{Repositories, WriteGuard};
use crate::scrapers::CrawlerRegistry;
use crate::services::ArtifactStore;

/// Result of one stage execution.
pub(super) struct StageOutcome {
    pub children: Vec<Command>,
    pub level: LogLevel,
    pub message: String,
}

impl StageOutcome {
    pub fn info(message: impl Into<String>, children: Vec<Command>) -> Self {
        Self {
            children,
            level: LogLevel::Info,
            message: message.into(),
        }
    }

    /// Nothing new to ingest.
    pub fn skipped(message: impl Into<String>) -> Self {
        Self {
            children: Vec::new(),
            level: LogLevel::Warning,
            message: message.into(),
        }
    }
}

/// Drives crawl jobs and executes their stage commands.
#[derive(Clone)]
pub struct CrawlJobOrchestrator {
    pub(super) repos: Repositories,
    pub(super) registry: CrawlerRegistry,
    pub(super) queue: JobQueueAdapter,
    pub(super) guard: WriteGuard,
    pub(super) artifacts: ArtifactStore,
    pub(super) max_list_pages: u32,
}

impl CrawlJobOrchestrator {
    pub fn new(
        repos: Repositories,
        registry: CrawlerRegistry,
        queue: JobQueueAdapter,
        guard: WriteGuard,
        artifacts: ArtifactStore,
    ) -> Self {
        Self {
            repos,
            registry,
            queue,
            guard,
            artifacts,
            max_list_pages: DEFAULT_MAX_LIST_PAGES,
        }
    }

    pub fn with_max_list_pages(mut self, max_list_pages: u32) -> Self {
        self.max_list_pages = max_list_pages.max(1);
        self
    }

    pub fn repositories(&self) -> &Repositories {
        &self.repos
    }

    pub fn registry(&self) -> &CrawlerRegistry {
        &self.registry
    }

    pub fn queue(&self) -> &JobQueueAdapter {
        &self.queue
    }

    /// Start a full discovery crawl from the source's list pages.
    pub async fn start_crawl_all_mangas(
        &self,
        source_id: &str,
        max_pages: Option<u32>,
        cancel: &CancellationToken,
    ) -> Result<CrawlJob> {
        self.launch_list_crawl(source_id, max_pages, false, cancel)
            .await
    }

    /// With `exclusive`, refuses with [`CrawlError::ActiveJob`] when the
    /// source already has an active job.
    async fn launch_list_crawl(
        &self,
        source_id: &str,
        max_pages: Option<u32>,
        exclusive: bool,
        cancel: &CancellationToken,
    ) -> Result<CrawlJob> {
        let source = self.crawlable_source(source_id, cancel).await?;
        let job = CrawlJob::new(source.id.clone(), CrawlJobKind::MangaList);
        let root = Command::CrawlMangaList(CrawlMangaList {
            source_id: source.id.clone(),
            crawl_job_id: job.id.clone(),
            base_search_url: source.list_entry_url(),
            max_pages,
        });
        self.launch(job, root, exclusive, cancel).await
    }

    /// Re-crawl chapters of the mangas already stored for a source.
    pub async fn start_refresh_chapters(
        &self,
        source_id: &str,
        max_mangas: Option<u32>,
        skip_existing: bool,
        cancel: &CancellationToken,
    ) -> Result<CrawlJob> {
        let source = self.crawlable_source(source_id, cancel).await?;
        let job = CrawlJob::new(source.id.clone(), CrawlJobKind::ChapterRefresh);
        let root = Command::CrawlAllMangasChapters(CrawlAllMangasChapters {
            source_id: source.id.clone(),
            crawl_job_id: job.id.clone(),
            max_mangas,
            skip_existing,
        });
        self.launch(job, root, false, cancel).await
    }

    /// Cancel an active job. Dispatched commands still run but fan out no
    /// further work.
    ///
    /// Returns false when the job had already finished.
    pub async fn cancel_job(&self, job_id: &str) -> Result<bool> {
        let cancel = CancellationToken::new();
        let key = WriteGuard::job_key(job_id);
        let cancelled = self
            .guard
            .run(&key, &cancel, async {
                if self.repos.jobs.get(job_id).await?.is_none() {
                    return Err(CrawlError::JobNotFound(job_id.to_string()));
                }
                let changed = self
                    .repos
                    .jobs
                    .finish(job_id, CrawlJobStatus::Cancelled, Utc::now())
                    .await?;
                if changed {
                    self.repos
                        .jobs
                        .append_log(&CrawlJobLog::new(
                            job_id,
                            LogLevel::Warning,
                            "job cancelled; queued commands will not fan out",
                        ))
                        .await?;
                }
                Ok(changed)
            })
            .await?;

        if cancelled {
            info!(job_id, "crawl job cancelled");
        }
        Ok(cancelled)
    }

    /// Close jobs left active by a previous process.
    ///
    /// Must run after the queue purge: their outstanding commands are gone,
    /// so they could never settle.
    pub async fn recover_interrupted_jobs(&self) -> Result<usize> {
        let cancel = CancellationToken::new();
        let mut recovered = 0;
        for job in self.repos.jobs.find_active(None).await? {
            let key = WriteGuard::job_key(&job.id);
            let closed = self
                .guard
                .run(&key, &cancel, async {
                    let closed = self
                        .repos
                        .jobs
                        .finish(&job.id, CrawlJobStatus::Cancelled, Utc::now())
                        .await?;
                    if closed {
                        self.repos
                            .jobs
                            .append_log(&CrawlJobLog::new(
                                &job.id,
                                LogLevel::Warning,
                                format!(
                                    "interrupted by restart after {}/{} commands; pending work was purged",
                                    job.processed, job.total
                                ),
                            ))
                            .await?;
                    }
                    Ok(closed)
                })
                .await?;
            if closed {
                warn!(job_id = %job.id, source_id = %job.source_id, "closed interrupted crawl job");
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    async fn load_source(&self, source_id: &str, cancel: &CancellationToken) -> Result<Source> {
        let key = WriteGuard::source_key(source_id);
        self.guard
            .run(&key, cancel, async {
                self.repos
                    .sources
                    .get(source_id)
                    .await?
                    .ok_or_else(|| CrawlError::SourceNotFound(source_id.to_string()))
            })
            .await
    }

    async fn load_job(&self, job_id: &str, cancel: &CancellationToken) -> Result<Option<CrawlJob>> {
        let key = WriteGuard::job_key(job_id);
        self.guard
            .run(&key, cancel, async { Ok(self.repos.jobs.get(job_id).await?) })
            .await
    }

    async fn crawlable_source(&self, source_id: &str, cancel: &CancellationToken) -> Result<Source> {
        let source = self.load_source(source_id, cancel).await?;
        self.registry.resolve(&source)?;
        Ok(source)
    }

    /// Job rows are opened under the source key so the active-job check and
    /// the insert are atomic.
    async fn launch(
        &self,
        job: CrawlJob,
        root: Command,
        exclusive: bool,
        cancel: &CancellationToken,
    ) -> Result<CrawlJob> {
        let source_key = WriteGuard::source_key(&job.source_id);
        self.guard
            .run(&source_key, cancel, async {
                if exclusive {
                    let active = self.repos.jobs.find_active(Some(job.source_id.as_str())).await?;
                    if let Some(existing) = active.first() {
                        return Err(CrawlError::ActiveJob {
                            source_id: job.source_id.clone(),
                            job_id: existing.id.clone(),
                        });
                    }
                }
                self.repos.jobs.create(&job).await?;
                self.repos
                    .jobs
                    .append_log(&CrawlJobLog::new(
                        &job.id,
                        LogLevel::Info,
                        format!("started: {}", root.describe()),
                    ))
                    .await?;
                self.repos.jobs.mark_running(&job.id, 1, Utc::now()).await?;
                Ok(())
            })
            .await?;

        let key = WriteGuard::job_key(&job.id);
        if let Err(e) = self.queue.enqueue(&root).await {
            error!(job_id = %job.id, error = %e, "failed to enqueue root command");
            let abort = CancellationToken::new();
            self.guard
                .run(&key, &abort, async {
                    self.repos
                        .jobs
                        .append_log(&CrawlJobLog::new(
                            &job.id,
                            LogLevel::Error,
                            format!("could not enqueue root command: {e}"),
                        ))
                        .await?;
                    self.repos
                        .jobs
                        .finish(&job.id, CrawlJobStatus::Failed, Utc::now())
                        .await?;
                    Ok(())
                })
                .await?;
            return Err(e);
        }

        info!(
            job_id = %job.id,
            source_id = %job.source_id,
            kind = job.kind.as_str(),
            "crawl job started"
        );
        self.load_job(&job.id, cancel)
            .await?
            .ok_or_else(|| CrawlError::JobNotFound(job.id.clone()))
    }

    /// Execute a stage command of `job_id` and account for it.
    async fn run_stage(
        &self,
        job_id: &str,
        command: &Command,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let Some(job) = self.load_job(job_id, cancel).await? else {
            warn!(job_id, command = %command.describe(), "dropping command of unknown job");
            return Ok(());
        };
        if matches!(job.status, CrawlJobStatus::Completed | CrawlJobStatus::Failed) {
            debug!(job_id, command = %command.describe(), "dropping command of finished job");
            return Ok(());
        }

        let source = self.load_source(command.source_id(), cancel).await?;

        let mut outcome = self.execute_stage(&source, command, cancel).await?;

        if !outcome.children.is_empty() && self.is_cancelled(job_id, cancel).await? {
            let suppressed = outcome.children.len();
            outcome.children.clear();
            self.append_log(
                job_id,
                LogLevel::Warning,
                format!(
                    "{}: job cancelled, suppressed {suppressed} follow-up commands",
                    command.describe()
                ),
                cancel,
            )
            .await?;
        }

        self.dispatch(job_id, &outcome.children, cancel).await?;
        self.settle(
            job_id,
            JobProgress {
                settled: 1,
                ..Default::default()
            },
            Some(CrawlJobLog::new(job_id, outcome.level, outcome.message)),
            cancel,
        )
        .await
    }

    async fn is_cancelled(&self, job_id: &str, cancel: &CancellationToken) -> Result<bool> {
        Ok(self
            .load_job(job_id, cancel)
            .await?
            .is_some_and(|job| job.status == CrawlJobStatus::Cancelled))
    }

    /// Count children into `total`, then enqueue them.
    async fn dispatch(
        &self,
        job_id: &str,
        children: &[Command],
        cancel: &CancellationToken,
    ) -> Result<()> {
        if children.is_empty() {
            return Ok(());
        }
        let count = children.len() as i32;
        let key = WriteGuard::job_key(job_id);
        self.guard
            .run(&key, cancel, async {
                self.repos
                    .jobs
                    .apply_progress(
                        job_id,
                        JobProgress {
                            dispatched: count,
                            ..Default::default()
                        },
                    )
                    .await?;

                if let Err(e) = self.queue.enqueue_many(children).await {
                    self.repos
                        .jobs
                        .apply_progress(
                            job_id,
                            JobProgress {
                                dispatched: -count,
                                ..Default::default()
                            },
                        )
                        .await?;
                    return Err(e);
                }
                Ok(())
            })
            .await
    }

    /// Apply counter deltas and finalize the job once it has settled.
    async fn settle(
        &self,
        job_id: &str,
        progress: JobProgress,
        log: Option<CrawlJobLog>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let key = WriteGuard::job_key(job_id);
        let finished = self
            .guard
            .run(&key, cancel, async {
                if let Some(log) = &log {
                    self.repos.jobs.append_log(log).await?;
                }
                let Some(job) = self.repos.jobs.apply_progress(job_id, progress).await? else {
                    return Ok(None);
                };
                if job.status != CrawlJobStatus::Running || !job.is_settled() {
                    return Ok(None);
                }

                let status = job.terminal_status();
                let now = Utc::now();
                if !self.repos.jobs.finish(job_id, status, now).await? {
                    return Ok(None);
                }
                let summary = format!(
                    "finished {}: {} commands, {} errors",
                    status.as_str(),
                    job.processed,
                    job.errors
                );
                let level = if status == CrawlJobStatus::Failed {
                    LogLevel::Error
                } else {
                    LogLevel::Info
                };
                self.repos
                    .jobs
                    .append_log(&CrawlJobLog::new(job_id, level, summary))
                    .await?;
                if status == CrawlJobStatus::Completed {
                    self.repos
                        .sources
                        .update_last_crawled(&job.source_id, now)
                        .await?;
                }
                Ok(Some((job, status)))
            })
            .await?;

        if let Some((job, status)) = finished {
            info!(
                job_id,
                source_id = %job.source_id,
                status = status.as_str(),
                processed = job.processed,
                errors = job.errors,
                "crawl job finished"
            );
        }
        Ok(())
    }

    pub(super) async fn append_log(
        &self,
        job_id: &str,
        level: LogLevel,
        message: String,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let key = WriteGuard::job_key(job_id);
        self.guard
            .run(&key, cancel, async {
                Ok(self
                    .repos
                    .jobs
                    .append_log(&CrawlJobLog::new(job_id, level, message))
                    .await?)
            })
            .await
    }

    async fn handle_trigger(&self, trigger: &TriggerCrawl, cancel: &CancellationToken) -> Result<()> {
        match self
            .launch_list_crawl(&trigger.source_id, trigger.max_pages, true, cancel)
            .await
        {
            Ok(_) => Ok(()),
            Err(CrawlError::ActiveJob { source_id, job_id }) => {
                info!(%source_id, %job_id, "skipping scheduled crawl: a job is already active");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl CommandHandler for CrawlJobOrchestrator {
    async fn handle(&self, command: &Command, cancel: &CancellationToken) -> Result<()> {
        match command {
            Command::TriggerCrawl(trigger) => self.handle_trigger(trigger, cancel).await,
            _ => match command.crawl_job_id() {
                Some(job_id) => self.run_stage(job_id, command, cancel).await,
                None => Ok(()),
            },
        }
    }

    async fn abandon(&self, command: &Command, err: &CrawlError) {
        let Some(job_id) = command.crawl_job_id() else {
            error!(command = %command.describe(), error = %err, "background command abandoned");
            return;
        };

        let root = command.is_root();
        let progress = JobProgress {
            settled: 1,
            errors: 1,
            root_failed: root,
            ..Default::default()
        };
        let log = CrawlJobLog::new(
            job_id,
            LogLevel::Error,
            format!("{} failed: {err}", command.describe()),
        );
        let cancel = CancellationToken::new();
        if let Err(e) = self.settle(job_id, progress, Some(log), &cancel).await {
            error!(job_id, error = %e, "failed to record abandoned command");
        }
    }
}
