//! End-to-end pipeline runs against a scripted in-memory site.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use mangacrawl::config::Settings;
use mangacrawl::models::{
    CrawlJob, CrawlJobKind, CrawlJobStatus, LogLevel, Manga, Source, SourceType,
};
use mangacrawl::pipeline::{Command, CrawlChapter, CrawlPage, Lane};
use mangacrawl::queue::Delivery;
use mangacrawl::repository::{create_diesel_pool, migrations};
use mangacrawl::runtime::CrawlRuntime;
use mangacrawl::scrapers::{
    slug_from_url, ChapterDetail, ChapterListing, Crawler, CrawlerRegistry, MangaDetail,
    MangaListPage, MangaListing, RateLimiter,
};
use mangacrawl::{CrawlError, Result};

const BASE: &str = "https://fake.example";
const LIST: &str = "https://fake.example/list";
const PNG: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0];

/// Serves canned line-based documents:
/// `manga <url> <title>`, `next`, `title <t>`, `chapter <url> <title>`,
/// `image <url>` and `broken`.
#[derive(Default)]
struct FakeCrawler {
    documents: Mutex<HashMap<String, String>>,
    /// Remaining 503 responses per URL.
    flaky: Mutex<HashMap<String, u32>>,
    fetches: Mutex<HashMap<String, usize>>,
}

impl FakeCrawler {
    fn serve(&self, url: &str, body: impl Into<String>) {
        self.documents
            .lock()
            .unwrap()
            .insert(url.to_string(), body.into());
    }

    fn fail_times(&self, url: &str, times: u32) {
        self.flaky.lock().unwrap().insert(url.to_string(), times);
    }

    fn listing(&self, page: u32, slugs: &[&str], next: bool) {
        let mut body: Vec<String> = slugs
            .iter()
            .map(|s| format!("manga {BASE}/manga/{s}/ {}", s.to_uppercase()))
            .collect();
        if next {
            body.push("next".into());
        }
        self.serve(&format!("{LIST}?page={page}"), body.join("\n"));
    }

    /// A manga with `chapters` chapters of `images` pages each.
    fn manga(&self, slug: &str, chapters: u32, images: u32) {
        let mut body = vec![format!("title {}", slug.to_uppercase())];
        for c in 1..=chapters {
            let chapter_url = format!("{BASE}/manga/{slug}/chapter-{c}/");
            body.push(format!("chapter {chapter_url} Chapter {c}"));
            let pages: Vec<String> = (1..=images)
                .map(|p| format!("image https://cdn.fake.example/{slug}/{c}/{p}.png"))
                .collect();
            self.serve(
                &chapter_url,
                format!("heading {} Chapter {c}\n{}", slug.to_uppercase(), pages.join("\n")),
            );
        }
        self.serve(&format!("{BASE}/manga/{slug}/"), body.join("\n"));
    }

    fn fetch_count(&self, url: &str) -> usize {
        self.fetches.lock().unwrap().get(url).copied().unwrap_or(0)
    }

    fn image_fetches(&self) -> usize {
        self.fetches
            .lock()
            .unwrap()
            .iter()
            .filter(|(url, _)| url.starts_with("https://cdn."))
            .map(|(_, n)| n)
            .sum()
    }

    fn record(&self, url: &str) -> Result<()> {
        *self
            .fetches
            .lock()
            .unwrap()
            .entry(url.to_string())
            .or_default() += 1;
        let mut flaky = self.flaky.lock().unwrap();
        if let Some(remaining) = flaky.get_mut(url) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(CrawlError::HttpStatus {
                    url: url.to_string(),
                    status: 503,
                });
            }
        }
        Ok(())
    }
}

fn fields(line: &str) -> (&str, &str, &str) {
    let mut parts = line.trim().splitn(3, ' ');
    (
        parts.next().unwrap_or_default(),
        parts.next().unwrap_or_default(),
        parts.next().unwrap_or_default(),
    )
}

#[async_trait]
impl Crawler for FakeCrawler {
    fn supported_source_type(&self) -> SourceType {
        SourceType::Madara
    }

    async fn test_connection(&self, _source: &Source) -> bool {
        true
    }

    async fn fetch_html(
        &self,
        _source: &Source,
        url: &str,
        _cancel: &CancellationToken,
    ) -> Result<String> {
        self.record(url)?;
        self.documents
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| CrawlError::HttpStatus {
                url: url.to_string(),
                status: 404,
            })
    }

    async fn fetch_bytes(
        &self,
        _source: &Source,
        url: &str,
        _cancel: &CancellationToken,
    ) -> Result<Vec<u8>> {
        self.record(url)?;
        Ok(PNG.to_vec())
    }

    fn list_page_url(&self, base_search_url: &str, page: u32) -> String {
        format!("{base_search_url}?page={page}")
    }

    fn parse_manga_list(&self, _source: &Source, html: &str) -> Result<MangaListPage> {
        let mut page = MangaListPage::default();
        for line in html.lines() {
            match fields(line) {
                ("manga", url, title) => page.items.push(MangaListing {
                    url: url.to_string(),
                    title: title.to_string(),
                    source_manga_id: slug_from_url(url).unwrap(),
                }),
                ("next", _, _) => page.has_next = true,
                _ => {}
            }
        }
        Ok(page)
    }

    fn parse_manga_detail(&self, _source: &Source, url: &str, html: &str) -> Result<MangaDetail> {
        if html.contains("broken") {
            return Err(CrawlError::parse(format!("unexpected layout at {url}")));
        }
        let mut detail = MangaDetail {
            source_manga_id: slug_from_url(url).unwrap(),
            ..Default::default()
        };
        for line in html.lines() {
            match fields(line) {
                ("title", first, rest) => detail.title = format!("{first} {rest}").trim().into(),
                ("chapter", url, title) => detail.chapters.push(ChapterListing {
                    url: url.to_string(),
                    title: title.to_string(),
                    source_chapter_id: None,
                    number: None,
                }),
                _ => {}
            }
        }
        Ok(detail)
    }

    fn parse_chapter_detail(
        &self,
        _source: &Source,
        _url: &str,
        html: &str,
    ) -> Result<ChapterDetail> {
        let title = html
            .lines()
            .find_map(|l| l.strip_prefix("heading "))
            .map(str::to_string);
        Ok(ChapterDetail {
            number: title.as_deref().and_then(mangacrawl::scrapers::crawler::parse_chapter_number),
            title,
        })
    }

    fn parse_chapter_pages(&self, _source: &Source, html: &str) -> Result<Vec<String>> {
        Ok(html
            .lines()
            .filter_map(|l| l.strip_prefix("image "))
            .map(str::to_string)
            .collect())
    }
}

struct Harness {
    runtime: CrawlRuntime,
    site: Arc<FakeCrawler>,
    cancel: CancellationToken,
    _dir: TempDir,
}

impl Harness {
    async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = Settings::with_data_dir(dir.path().to_path_buf());
        settings.retry_base_delay_ms = 0;
        settings.ensure_directories().unwrap();

        let pool = create_diesel_pool(&settings.database_path()).unwrap();
        migrations::init_schema(&pool).await.unwrap();

        let site = Arc::new(FakeCrawler::default());
        let mut registry = CrawlerRegistry::new();
        registry.register(site.clone());

        let runtime = CrawlRuntime::assemble(settings, pool, registry, RateLimiter::new(), vec![]);
        let mut source = Source::new("fake".into(), SourceType::Madara, "Fake".into(), BASE.into());
        source.search_url = Some(LIST.into());
        runtime.repos.sources.save(&source).await.unwrap();
        runtime.prepare().await.unwrap();

        Self {
            runtime,
            site,
            cancel: CancellationToken::new(),
            _dir: dir,
        }
    }

    async fn crawl(&self, max_pages: Option<u32>) -> CrawlJob {
        self.runtime
            .orchestrator
            .start_crawl_all_mangas("fake", max_pages, &self.cancel)
            .await
            .unwrap()
    }

    async fn drain(&self) -> usize {
        self.runtime
            .queue
            .drain(self.runtime.orchestrator.as_ref(), &self.cancel)
            .await
            .unwrap()
    }

    async fn step(&self) -> Option<Delivery> {
        self.runtime
            .queue
            .process_next(Lane::Crawl, self.runtime.orchestrator.as_ref(), "test", &self.cancel)
            .await
            .unwrap()
    }

    async fn job(&self, id: &str) -> CrawlJob {
        self.runtime.repos.jobs.get(id).await.unwrap().unwrap()
    }

    async fn manga(&self, slug: &str) -> Manga {
        self.runtime
            .repos
            .content
            .find_manga("fake", slug)
            .await
            .unwrap()
            .unwrap()
    }

    /// (mangas, chapters, pages, downloaded pages) stored for the source.
    async fn catalog(&self) -> (usize, usize, usize, usize) {
        let content = &self.runtime.repos.content;
        let mangas = content.list_active_mangas("fake", None).await.unwrap();
        let (mut chapters, mut pages, mut downloaded) = (0, 0, 0);
        for manga in &mangas {
            for chapter in content.chapters_for_manga(&manga.id).await.unwrap() {
                chapters += 1;
                for page in content.pages_for_chapter(&chapter.id).await.unwrap() {
                    pages += 1;
                    if page.is_downloaded {
                        downloaded += 1;
                    }
                }
            }
        }
        (mangas.len(), chapters, pages, downloaded)
    }
}

#[tokio::test]
async fn list_stage_emits_one_command_per_manga_in_discovery_order() {
    let h = Harness::new().await;
    h.site.listing(1, &["a", "b", "c"], true);
    h.site.listing(2, &["c", "d", "e"], true);
    h.site.listing(3, &["f"], false);

    let job = h.crawl(Some(2)).await;
    assert_eq!(h.step().await, Some(Delivery::Completed));

    let queued = h.runtime.queue.peek(Lane::Crawl, 20).await.unwrap();
    let titles: Vec<&str> = queued
        .iter()
        .map(|c| match c {
            Command::CrawlManga(m) => m.manga_title.as_str(),
            other => panic!("unexpected command {other:?}"),
        })
        .collect();
    assert_eq!(titles, vec!["A", "B", "C", "D", "E"]);
    assert_eq!(h.site.fetch_count(&format!("{LIST}?page=3")), 0);

    let job = h.job(&job.id).await;
    assert_eq!(job.status, CrawlJobStatus::Running);
    assert_eq!(job.total, 6);
    assert_eq!(job.processed, 1);
}

#[tokio::test]
async fn full_crawl_completes_and_replay_adds_nothing() {
    let h = Harness::new().await;
    h.site.listing(1, &["a", "b"], false);
    h.site.manga("a", 2, 2);
    h.site.manga("b", 2, 2);

    let job = h.crawl(None).await;
    h.drain().await;

    let job = h.job(&job.id).await;
    assert_eq!(job.status, CrawlJobStatus::Completed);
    assert_eq!(job.total, 11);
    assert_eq!(job.processed, 11);
    assert_eq!(job.errors, 0);
    assert!(job.finished_at.is_some());
    assert_eq!(h.catalog().await, (2, 4, 8, 8));
    assert_eq!(h.site.image_fetches(), 8);

    let source = h.runtime.source("fake").await.unwrap();
    assert!(source.last_crawled_at.is_some());

    let page = &h
        .runtime
        .repos
        .content
        .pages_for_chapter(
            &h.runtime
                .repos
                .content
                .chapters_for_manga(&h.manga("a").await.id)
                .await
                .unwrap()[0]
                .id,
        )
        .await
        .unwrap()[0];
    let path = h.runtime.settings.artifacts_dir.join(page.local_path.as_ref().unwrap());
    assert_eq!(std::fs::read(path).unwrap(), PNG);

    // Second run: every manga is known and has no new chapters.
    let again = h.crawl(None).await;
    h.drain().await;
    let again = h.job(&again.id).await;
    assert_eq!(again.status, CrawlJobStatus::Completed);
    assert_eq!(again.total, 3);
    assert_eq!(h.catalog().await, (2, 4, 8, 8));
    assert_eq!(h.site.image_fetches(), 8);

    let logs = h.runtime.repos.jobs.logs(&again.id).await.unwrap();
    assert!(logs
        .iter()
        .any(|l| l.level == LogLevel::Warning && l.message.contains("no new chapters")));
}

#[tokio::test]
async fn forced_refresh_refetches_without_duplicating_rows() {
    let h = Harness::new().await;
    h.site.listing(1, &["a"], false);
    h.site.manga("a", 2, 3);
    h.crawl(None).await;
    h.drain().await;
    assert_eq!(h.catalog().await, (1, 2, 6, 6));

    let refresh = h
        .runtime
        .orchestrator
        .start_refresh_chapters("fake", None, false, &h.cancel)
        .await
        .unwrap();
    h.drain().await;

    let refresh = h.job(&refresh.id).await;
    assert_eq!(refresh.status, CrawlJobStatus::Completed);
    assert_eq!(refresh.total, 1 + 1 + 2 + 2);
    assert_eq!(h.catalog().await, (1, 2, 6, 6));
    assert_eq!(h.site.image_fetches(), 12);

    // Skipping refresh walks the manga but stops there.
    let skipping = h
        .runtime
        .orchestrator
        .start_refresh_chapters("fake", None, true, &h.cancel)
        .await
        .unwrap();
    h.drain().await;
    assert_eq!(h.job(&skipping.id).await.total, 2);
    assert_eq!(h.site.image_fetches(), 12);
}

#[tokio::test]
async fn one_broken_manga_does_not_fail_the_refresh() {
    let h = Harness::new().await;
    h.site.manga("m1", 1, 1);
    h.site.serve(&format!("{BASE}/manga/m2/"), "broken");
    for slug in ["m1", "m2"] {
        let manga = Manga::new(
            "fake".into(),
            slug.into(),
            format!("{BASE}/manga/{slug}/"),
            slug.to_uppercase(),
        );
        h.runtime.repos.content.upsert_manga(&manga).await.unwrap();
    }

    let job = h
        .runtime
        .orchestrator
        .start_refresh_chapters("fake", None, true, &h.cancel)
        .await
        .unwrap();
    h.drain().await;

    let job = h.job(&job.id).await;
    assert_eq!(job.status, CrawlJobStatus::Completed);
    assert!(!job.root_failed);
    assert_eq!(job.errors, 1);
    assert_eq!(job.processed, job.total);
    assert_eq!(h.catalog().await, (2, 1, 1, 1));
    // Parse errors are not retried.
    assert_eq!(h.site.fetch_count(&format!("{BASE}/manga/m2/")), 1);
    assert_eq!(h.runtime.queue.dead_count().await.unwrap(), 1);

    let logs = h.runtime.repos.jobs.logs(&job.id).await.unwrap();
    let errors: Vec<_> = logs.iter().filter(|l| l.level == LogLevel::Error).collect();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].message.contains("unexpected layout"));
}

#[tokio::test]
async fn transient_failures_are_retried_to_success() {
    let h = Harness::new().await;
    h.site.listing(1, &["a"], false);
    h.site.manga("a", 1, 1);
    h.site.fail_times(&format!("{BASE}/manga/a/"), 2);

    let job = h.crawl(None).await;
    h.drain().await;

    let job = h.job(&job.id).await;
    assert_eq!(job.status, CrawlJobStatus::Completed);
    assert_eq!(job.errors, 0);
    assert_eq!(h.site.fetch_count(&format!("{BASE}/manga/a/")), 3);
    assert_eq!(h.catalog().await, (1, 1, 1, 1));
}

#[tokio::test]
async fn exhausted_root_fails_the_job() {
    let h = Harness::new().await;
    h.site.listing(1, &["a"], false);
    h.site.fail_times(&format!("{LIST}?page=1"), 10);

    let job = h.crawl(None).await;
    h.drain().await;

    let job = h.job(&job.id).await;
    assert_eq!(job.status, CrawlJobStatus::Failed);
    assert!(job.root_failed);
    assert_eq!(h.site.fetch_count(&format!("{LIST}?page=1")), 3);
    assert_eq!(h.catalog().await, (0, 0, 0, 0));
}

#[tokio::test]
async fn restart_purges_work_and_a_fresh_crawl_converges() {
    let h = Harness::new().await;
    h.site.listing(1, &["a", "b", "c", "d", "e"], false);
    for slug in ["a", "b", "c", "d", "e"] {
        h.site.manga(slug, 1, 1);
    }

    let interrupted = h.crawl(None).await;
    h.step().await; // list
    h.step().await; // manga a
    assert_eq!(h.runtime.queue.pending_count(None).await.unwrap(), 5);

    // Simulated restart.
    h.runtime.prepare().await.unwrap();
    assert_eq!(h.runtime.queue.pending_count(None).await.unwrap(), 0);
    let interrupted = h.job(&interrupted.id).await;
    assert_eq!(interrupted.status, CrawlJobStatus::Cancelled);
    let (mangas, chapters, _, _) = h.catalog().await;
    assert_eq!((mangas, chapters), (1, 0));

    let fresh = h.crawl(None).await;
    h.drain().await;
    assert_eq!(h.job(&fresh.id).await.status, CrawlJobStatus::Completed);
    assert_eq!(h.catalog().await, (5, 5, 5, 5));
    assert_eq!(h.site.image_fetches(), 5);
}

#[tokio::test]
async fn cancelled_job_suppresses_fan_out() {
    let h = Harness::new().await;
    h.site.listing(1, &["a", "b"], false);
    h.site.manga("a", 1, 1);
    h.site.manga("b", 1, 1);

    let job = h.crawl(None).await;
    assert!(h.runtime.orchestrator.cancel_job(&job.id).await.unwrap());
    h.drain().await;

    let job = h.job(&job.id).await;
    assert_eq!(job.status, CrawlJobStatus::Cancelled);
    assert_eq!(job.total, 1);
    assert_eq!(job.processed, 1);
    assert_eq!(h.runtime.queue.pending_count(None).await.unwrap(), 0);
    assert_eq!(h.catalog().await, (0, 0, 0, 0));

    let logs = h.runtime.repos.jobs.logs(&job.id).await.unwrap();
    assert!(logs.iter().any(|l| l.message.contains("suppressed 2")));
}

#[tokio::test]
async fn replayed_chapter_and_page_commands_change_nothing() {
    let h = Harness::new().await;
    h.site.listing(1, &["a"], false);
    h.site.manga("a", 1, 2);
    h.crawl(None).await;
    h.drain().await;
    assert_eq!(h.catalog().await, (1, 1, 2, 2));

    let manga = h.manga("a").await;
    let chapter = h.runtime.repos.content.chapters_for_manga(&manga.id).await.unwrap()[0].clone();
    let chapter_fetches = h.site.fetch_count(&chapter.url);

    // A running job to carry the redelivered commands.
    let host = CrawlJob::new("fake".into(), CrawlJobKind::ChapterRefresh);
    h.runtime.repos.jobs.create(&host).await.unwrap();
    h.runtime
        .repos
        .jobs
        .mark_running(&host.id, 10, chrono::Utc::now())
        .await
        .unwrap();

    let crawl_chapter = Command::CrawlChapter(CrawlChapter {
        source_id: "fake".into(),
        crawl_job_id: host.id.clone(),
        manga_id: manga.id.clone(),
        chapter_url: chapter.url.clone(),
        chapter_title: chapter.title.clone(),
        source_chapter_id: None,
        skip_existing: true,
    });
    let crawl_page = Command::CrawlPage(CrawlPage {
        source_id: "fake".into(),
        crawl_job_id: host.id.clone(),
        chapter_id: chapter.id.clone(),
        chapter_url: chapter.url.clone(),
        skip_existing: true,
    });
    h.runtime
        .queue
        .enqueue_many(&[
            crawl_chapter.clone(),
            crawl_chapter,
            crawl_page.clone(),
            crawl_page,
        ])
        .await
        .unwrap();
    assert_eq!(h.drain().await, 4);

    assert_eq!(h.catalog().await, (1, 1, 2, 2));
    assert_eq!(h.site.image_fetches(), 2);
    // Only the page stage re-reads the chapter to list its images.
    assert_eq!(h.site.fetch_count(&chapter.url), chapter_fetches + 2);

    let host = h.job(&host.id).await;
    assert_eq!(host.status, CrawlJobStatus::Running);
    assert_eq!((host.processed, host.errors), (4, 0));
    let logs = h.runtime.repos.jobs.logs(&host.id).await.unwrap();
    assert_eq!(
        logs.iter()
            .filter(|l| l.message.contains("already ingested"))
            .count(),
        2
    );
}

#[tokio::test]
async fn retried_page_stage_keeps_images_already_stored() {
    let h = Harness::new().await;
    h.site.listing(1, &["a"], false);
    h.site.manga("a", 1, 3);
    h.site.fail_times("https://cdn.fake.example/a/1/2.png", 1);

    let job = h.crawl(None).await;
    h.drain().await;

    let job = h.job(&job.id).await;
    assert_eq!(job.status, CrawlJobStatus::Completed);
    assert_eq!(job.errors, 0);
    assert_eq!(h.catalog().await, (1, 1, 3, 3));
    assert_eq!(h.site.fetch_count("https://cdn.fake.example/a/1/1.png"), 1);
    assert_eq!(h.site.fetch_count("https://cdn.fake.example/a/1/2.png"), 2);
    assert_eq!(h.site.fetch_count("https://cdn.fake.example/a/1/3.png"), 1);
}

#[tokio::test]
async fn forced_refresh_retires_dropped_pages_and_chapters() {
    let h = Harness::new().await;
    h.site.listing(1, &["a"], false);
    h.site.manga("a", 2, 3);
    h.crawl(None).await;
    h.drain().await;
    assert_eq!(h.catalog().await, (1, 2, 6, 6));

    // The source now lists one chapter with two images.
    h.site.manga("a", 1, 2);
    let refresh = h
        .runtime
        .orchestrator
        .start_refresh_chapters("fake", None, false, &h.cancel)
        .await
        .unwrap();
    h.drain().await;

    assert_eq!(h.job(&refresh.id).await.status, CrawlJobStatus::Completed);
    assert_eq!(h.catalog().await, (1, 1, 2, 2));
    let manga = h.manga("a").await;
    let chapters = h.runtime.repos.content.chapters_for_manga(&manga.id).await.unwrap();
    assert!(chapters[0].url.ends_with("/chapter-1/"));
    let numbers: Vec<i32> = h
        .runtime
        .repos
        .content
        .pages_for_chapter(&chapters[0].id)
        .await
        .unwrap()
        .iter()
        .map(|p| p.number)
        .collect();
    assert_eq!(numbers, vec![1, 2]);

    let logs = h.runtime.repos.jobs.logs(&refresh.id).await.unwrap();
    assert!(logs.iter().any(|l| l.message.contains("1 retired")));

    // A skipping refresh sees no new chapters and fetches no images.
    let skipping = h
        .runtime
        .orchestrator
        .start_refresh_chapters("fake", None, true, &h.cancel)
        .await
        .unwrap();
    h.drain().await;
    assert_eq!(h.job(&skipping.id).await.total, 2);
    assert_eq!(h.catalog().await, (1, 1, 2, 2));
}

#[tokio::test]
async fn chapter_without_images_is_a_parse_failure() {
    let h = Harness::new().await;
    h.site.listing(1, &["a"], false);
    h.site.manga("a", 1, 0);

    let job = h.crawl(None).await;
    h.drain().await;

    let job = h.job(&job.id).await;
    assert_eq!(job.status, CrawlJobStatus::Completed);
    assert_eq!(job.errors, 1);
    assert_eq!(h.catalog().await, (1, 1, 0, 0));

    let logs = h.runtime.repos.jobs.logs(&job.id).await.unwrap();
    assert!(logs
        .iter()
        .any(|l| l.level == LogLevel::Error && l.message.contains("no page images")));
    assert!(!logs.iter().any(|l| l.message.contains("already downloaded")));
    assert_eq!(h.runtime.queue.dead_count().await.unwrap(), 1);
}
