use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use mangacrawl::config::{load_settings, Settings};
use mangacrawl::models::{CrawlJob, CrawlJobStatus};
use mangacrawl::runtime::CrawlRuntime;
use mangacrawl::scrapers::Crawler;
use mangacrawl::CrawlError;

#[derive(Parser, Debug)]
#[command(name = "mangacrawl", version, about = "Rate-limited manga catalog crawler")]
struct Cli {
    /// Data directory (overrides the config file)
    #[arg(long, global = true, env = "MANGACRAWL_DATA")]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run queue workers and the crawl scheduler until interrupted
    Serve,

    /// Crawl a source from its listing pages and wait for the job to finish
    Crawl {
        source: String,
        /// Listing pages to walk
        #[arg(long)]
        max_pages: Option<u32>,
    },

    /// Re-crawl chapters of mangas already in the catalog
    Refresh {
        source: String,
        #[arg(long)]
        max_mangas: Option<u32>,
        /// Re-fetch chapters and pages that were already ingested
        #[arg(long)]
        force: bool,
    },

    /// List configured sources
    Sources,

    /// Check that a source is reachable
    Test { source: String },

    /// List recent crawl jobs
    Jobs {
        #[arg(long)]
        source: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },

    /// Show the log of a crawl job
    Logs { job: String },

    /// Cancel an active crawl job
    Cancel { job: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("mangacrawl=info")),
        )
        .init();

    let cli = Cli::parse();
    let (config, mut settings) = load_settings().await;
    if let Some(dir) = cli.data_dir {
        settings = override_data_dir(settings, dir);
    }

    match cli.command {
        Commands::Serve => {
            let runtime = CrawlRuntime::bootstrap(settings, &config)
                .await
                .context("failed to start runtime")?;
            let handles = runtime.start(true)?;
            info!("serving; press Ctrl-C to stop");
            tokio::signal::ctrl_c()
                .await
                .context("failed to listen for Ctrl-C")?;
            info!("shutting down");
            runtime.stop(handles).await;
        }
        Commands::Crawl { source, max_pages } => {
            let runtime = CrawlRuntime::bootstrap(settings, &config).await?;
            let handles = runtime.start(false)?;
            let cancel = runtime.shutdown_token();
            let job = runtime
                .orchestrator
                .start_crawl_all_mangas(&source, max_pages, &cancel)
                .await
                .with_context(|| format!("failed to start crawl of {source}"))?;
            let outcome = follow_job(&runtime, &job).await;
            runtime.stop(handles).await;
            print_job_summary(&outcome?);
        }
        Commands::Refresh {
            source,
            max_mangas,
            force,
        } => {
            let runtime = CrawlRuntime::bootstrap(settings, &config).await?;
            let handles = runtime.start(false)?;
            let cancel = runtime.shutdown_token();
            let job = runtime
                .orchestrator
                .start_refresh_chapters(&source, max_mangas, !force, &cancel)
                .await
                .with_context(|| format!("failed to start refresh of {source}"))?;
            let outcome = follow_job(&runtime, &job).await;
            runtime.stop(handles).await;
            print_job_summary(&outcome?);
        }
        Commands::Sources => {
            let runtime = CrawlRuntime::open(settings, &config).await?;
            let sources = runtime.repos.sources.get_all().await?;
            if sources.is_empty() {
                println!("No sources configured.");
            }
            for source in sources {
                let mangas = runtime.repos.content.count_mangas(&source.id).await?;
                println!(
                    "{:<20} {:<12} {:<8} {:>6} mangas  {}/min {}/h {}ms  {}",
                    source.id,
                    source.source_type.as_str(),
                    if source.is_active { "active" } else { "inactive" },
                    mangas,
                    source.rate.requests_per_minute,
                    source.rate.requests_per_hour,
                    source.rate.delay_between_requests_ms,
                    source.base_url
                );
            }
        }
        Commands::Test { source } => {
            let runtime = CrawlRuntime::open(settings, &config).await?;
            let source = runtime.source(&source).await?;
            let crawler = runtime.orchestrator.registry().resolve(&source)?;
            if crawler.test_connection(&source).await {
                println!("{}: reachable ({})", source.id, source.base_url);
            } else {
                println!("{}: unreachable ({})", source.id, source.base_url);
                std::process::exit(1);
            }
        }
        Commands::Jobs { source, limit } => {
            let runtime = CrawlRuntime::open(settings, &config).await?;
            let jobs = runtime.repos.jobs.list(source.as_deref(), limit).await?;
            if jobs.is_empty() {
                println!("No crawl jobs.");
            }
            for job in jobs {
                println!(
                    "{}  {:<16} {:<15} {:<10} {:>5}/{:<5} errors {:<4} {}",
                    job.id,
                    job.source_id,
                    job.kind.as_str(),
                    job.status.as_str(),
                    job.processed,
                    job.total,
                    job.errors,
                    job.created_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
        }
        Commands::Logs { job } => {
            let runtime = CrawlRuntime::open(settings, &config).await?;
            if runtime.repos.jobs.get(&job).await?.is_none() {
                return Err(CrawlError::JobNotFound(job).into());
            }
            for entry in runtime.repos.jobs.logs(&job).await? {
                println!(
                    "{} {:<7} {}",
                    entry.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
                    entry.level.as_str().to_uppercase(),
                    entry.message
                );
            }
        }
        Commands::Cancel { job } => {
            let runtime = CrawlRuntime::open(settings, &config).await?;
            if runtime.orchestrator.cancel_job(&job).await? {
                println!("Cancelled {job}");
            } else {
                println!("{job} already finished");
            }
        }
    }

    Ok(())
}

fn override_data_dir(mut settings: Settings, dir: PathBuf) -> Settings {
    settings.artifacts_dir = dir.join("pages");
    settings.data_dir = dir;
    settings
}

/// Wait for a job, cancelling it on Ctrl-C.
async fn follow_job(runtime: &CrawlRuntime, job: &CrawlJob) -> Result<CrawlJob> {
    info!(job_id = %job.id, "waiting for crawl job; Ctrl-C cancels");
    let stop = CancellationToken::new();
    let wait = runtime.wait_for_job(&job.id, Duration::from_millis(500), &stop);
    tokio::pin!(wait);

    tokio::select! {
        finished = &mut wait => Ok(finished?),
        _ = tokio::signal::ctrl_c() => {
            runtime.orchestrator.cancel_job(&job.id).await?;
            let job = runtime
                .repos
                .jobs
                .get(&job.id)
                .await?
                .ok_or_else(|| CrawlError::JobNotFound(job.id.clone()))?;
            Ok(job)
        }
    }
}

fn print_job_summary(job: &CrawlJob) {
    println!(
        "Job {} {}: {}/{} commands, {} errors",
        job.id,
        job.status.as_str(),
        job.processed,
        job.total,
        job.errors
    );
    if job.status == CrawlJobStatus::Failed {
        std::process::exit(1);
    }
}
