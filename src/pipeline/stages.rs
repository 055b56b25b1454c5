//! Execution of the individual stage commands.
//!
//! Each stage fetches through the source's crawler, persists under the write
//! guard and returns the child commands it wants dispatched. Stages are safe
//! to replay: rows are upserted by their dedup keys.

use std::collections::HashSet;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::commands::{
    Command, CrawlAllMangasChapters, CrawlChapter, CrawlManga, CrawlMangaList, CrawlPage,
};
use super::orchestrator::{CrawlJobOrchestrator, StageOutcome};
use crate::error::{CrawlError, Result};
use crate::models::{Chapter, Manga, Page, Source};
use crate::repository::WriteGuard;
use crate::scrapers::crawler::parse_chapter_number;
use crate::scrapers::Crawler;

impl CrawlJobOrchestrator {
    pub(super) async fn execute_stage(
        &self,
        source: &Source,
        command: &Command,
        cancel: &CancellationToken,
    ) -> Result<StageOutcome> {
        let crawler = self.registry.resolve(source)?;
        let crawler = crawler.as_ref();
        match command {
            Command::CrawlMangaList(cmd) => {
                self.crawl_manga_list(crawler, source, cmd, cancel).await
            }
            Command::CrawlManga(cmd) => self.crawl_manga(crawler, source, cmd, cancel).await,
            Command::CrawlAllMangasChapters(cmd) => {
                self.crawl_all_mangas_chapters(cmd, cancel).await
            }
            Command::CrawlChapter(cmd) => self.crawl_chapter(crawler, source, cmd, cancel).await,
            Command::CrawlPage(cmd) => self.crawl_page(crawler, source, cmd, cancel).await,
            Command::TriggerCrawl(_) => Err(CrawlError::Queue(
                "trigger is not a stage command".to_string(),
            )),
        }
    }

    async fn crawl_manga_list(
        &self,
        crawler: &dyn Crawler,
        source: &Source,
        cmd: &CrawlMangaList,
        cancel: &CancellationToken,
    ) -> Result<StageOutcome> {
        let max_pages = cmd.max_pages.unwrap_or(self.max_list_pages).max(1);
        let mut seen = HashSet::new();
        let mut children = Vec::new();
        let mut pages_read = 0;

        for page in 1..=max_pages {
            if cancel.is_cancelled() {
                return Err(CrawlError::Cancelled);
            }
            let url = crawler.list_page_url(&cmd.base_search_url, page);
            let html = crawler.fetch_html(source, &url, cancel).await?;
            let listing = crawler.parse_manga_list(source, &html)?;
            let page_items = listing.items.len();
            pages_read = page;
            debug!(source_id = %source.id, page, items = page_items, "parsed listing page");

            for item in listing.items {
                if !seen.insert(item.source_manga_id.clone()) {
                    continue;
                }
                children.push(Command::CrawlManga(CrawlManga {
                    source_id: cmd.source_id.clone(),
                    crawl_job_id: cmd.crawl_job_id.clone(),
                    manga_url: item.url,
                    manga_title: item.title,
                    skip_existing: true,
                }));
            }

            if !listing.has_next || page_items == 0 {
                break;
            }
        }

        if children.is_empty() {
            return Ok(StageOutcome::skipped(format!(
                "no mangas found on {} ({pages_read} pages)",
                cmd.base_search_url
            )));
        }
        Ok(StageOutcome::info(
            format!(
                "discovered {} mangas across {pages_read} listing pages",
                children.len()
            ),
            children,
        ))
    }

    async fn crawl_manga(
        &self,
        crawler: &dyn Crawler,
        source: &Source,
        cmd: &CrawlManga,
        cancel: &CancellationToken,
    ) -> Result<StageOutcome> {
        let html = crawler.fetch_html(source, &cmd.manga_url, cancel).await?;
        let detail = crawler.parse_manga_detail(source, &cmd.manga_url, &html)?;

        let title = if detail.title.is_empty() {
            cmd.manga_title.clone()
        } else {
            detail.title.clone()
        };
        let mut manga = Manga::new(
            cmd.source_id.clone(),
            detail.source_manga_id.clone(),
            cmd.manga_url.clone(),
            title,
        );
        manga.alt_titles = detail.alt_titles.clone();
        manga.author = detail.author.clone();
        manga.status = detail.status.clone();
        manga.description = detail.description.clone();
        manga.cover_url = detail.cover_url.clone();
        manga.genres = detail.genres.clone();

        let listed: Vec<String> = detail.chapters.iter().map(|c| c.key()).collect();
        let key = WriteGuard::manga_key(&manga.source_id, &manga.source_manga_id);
        let (stored, known, retired) = self
            .guard
            .run(&key, cancel, async {
                let upserted = self.repos.content.upsert_manga(&manga).await?;
                let known = if !upserted.created && cmd.skip_existing {
                    self.repos.content.chapter_keys(&upserted.row.id).await?
                } else {
                    HashSet::new()
                };
                // An empty chapter list never retires anything.
                let retired = if !cmd.skip_existing && !listed.is_empty() {
                    self.repos
                        .content
                        .retire_missing_chapters(&upserted.row.id, &listed)
                        .await?
                } else {
                    0
                };
                Ok((upserted, known, retired))
            })
            .await?;

        let manga = stored.row;
        if retired > 0 {
            info!(manga_id = %manga.id, retired, "retired chapters no longer listed");
        }
        let children: Vec<Command> = detail
            .chapters
            .iter()
            .filter(|chapter| !known.contains(&chapter.key()))
            .map(|chapter| {
                Command::CrawlChapter(CrawlChapter {
                    source_id: cmd.source_id.clone(),
                    crawl_job_id: cmd.crawl_job_id.clone(),
                    manga_id: manga.id.clone(),
                    chapter_url: chapter.url.clone(),
                    chapter_title: chapter.title.clone(),
                    source_chapter_id: chapter.source_chapter_id.clone(),
                    skip_existing: cmd.skip_existing,
                })
            })
            .collect();

        if children.is_empty() && !stored.created {
            return Ok(StageOutcome::skipped(format!(
                "manga \"{}\" has no new chapters ({} known)",
                manga.title,
                detail.chapters.len()
            )));
        }

        let state = if stored.created { "new" } else { "updated" };
        let mut message = format!(
            "{state} manga \"{}\": {} of {} chapters queued",
            manga.title,
            children.len(),
            detail.chapters.len()
        );
        if retired > 0 {
            message.push_str(&format!(", {retired} retired"));
        }
        Ok(StageOutcome::info(message, children))
    }

    async fn crawl_all_mangas_chapters(
        &self,
        cmd: &CrawlAllMangasChapters,
        cancel: &CancellationToken,
    ) -> Result<StageOutcome> {
        let key = WriteGuard::source_key(&cmd.source_id);
        let mangas = self
            .guard
            .run(&key, cancel, async {
                Ok(self
                    .repos
                    .content
                    .list_active_mangas(&cmd.source_id, cmd.max_mangas)
                    .await?)
            })
            .await?;

        if mangas.is_empty() {
            return Ok(StageOutcome::skipped(format!(
                "no stored mangas to refresh for {}",
                cmd.source_id
            )));
        }

        let children: Vec<Command> = mangas
            .into_iter()
            .map(|manga| {
                Command::CrawlManga(CrawlManga {
                    source_id: cmd.source_id.clone(),
                    crawl_job_id: cmd.crawl_job_id.clone(),
                    manga_url: manga.url,
                    manga_title: manga.title,
                    skip_existing: cmd.skip_existing,
                })
            })
            .collect();

        Ok(StageOutcome::info(
            format!("refreshing chapters of {} mangas", children.len()),
            children,
        ))
    }

    async fn crawl_chapter(
        &self,
        crawler: &dyn Crawler,
        source: &Source,
        cmd: &CrawlChapter,
        cancel: &CancellationToken,
    ) -> Result<StageOutcome> {
        let chapter_key = cmd.chapter_key();

        if cmd.skip_existing {
            let key = WriteGuard::chapter_key(&cmd.manga_id, chapter_key);
            let existing = self
                .guard
                .run(&key, cancel, async {
                    Ok(self
                        .repos
                        .content
                        .find_chapter(&cmd.manga_id, chapter_key)
                        .await?)
                })
                .await?;
            if let Some(existing) = existing {
                let key = WriteGuard::pages_key(&existing.id);
                let pages = self
                    .guard
                    .run(&key, cancel, async {
                        Ok(self.repos.content.pages_for_chapter(&existing.id).await?)
                    })
                    .await?;
                if !pages.is_empty() && pages.iter().all(|p| p.is_downloaded) {
                    return Ok(StageOutcome::skipped(format!(
                        "chapter \"{}\" already ingested ({} pages)",
                        existing.title,
                        pages.len()
                    )));
                }
            }
        }

        let html = crawler.fetch_html(source, &cmd.chapter_url, cancel).await?;
        let detail = crawler.parse_chapter_detail(source, &cmd.chapter_url, &html)?;

        let title = detail
            .title
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| cmd.chapter_title.clone());
        let mut chapter = Chapter::new(
            cmd.manga_id.clone(),
            cmd.source_id.clone(),
            chapter_key.to_string(),
            cmd.chapter_url.clone(),
            title,
        );
        chapter.number = detail
            .number
            .or_else(|| parse_chapter_number(&cmd.chapter_title));

        let key = WriteGuard::chapter_key(&chapter.manga_id, &chapter.source_chapter_id);
        let stored = self
            .guard
            .run(&key, cancel, async {
                Ok(self.repos.content.upsert_chapter(&chapter).await?)
            })
            .await?;

        let chapter = stored.row;
        let child = Command::CrawlPage(CrawlPage {
            source_id: cmd.source_id.clone(),
            crawl_job_id: cmd.crawl_job_id.clone(),
            chapter_id: chapter.id.clone(),
            chapter_url: chapter.url.clone(),
            skip_existing: cmd.skip_existing,
        });

        let state = if stored.created { "new" } else { "updated" };
        Ok(StageOutcome::info(
            format!("{state} chapter \"{}\"", chapter.title),
            vec![child],
        ))
    }

    async fn crawl_page(
        &self,
        crawler: &dyn Crawler,
        source: &Source,
        cmd: &CrawlPage,
        cancel: &CancellationToken,
    ) -> Result<StageOutcome> {
        let html = crawler.fetch_html(source, &cmd.chapter_url, cancel).await?;
        let image_urls = crawler.parse_chapter_pages(source, &html)?;
        if image_urls.is_empty() {
            return Err(CrawlError::parse(format!(
                "no page images found on {}",
                cmd.chapter_url
            )));
        }

        let key = WriteGuard::pages_key(&cmd.chapter_id);
        let (pages, retired): (Vec<Page>, usize) = self
            .guard
            .run(&key, cancel, async {
                let mut stored = Vec::with_capacity(image_urls.len());
                for (index, url) in image_urls.iter().enumerate() {
                    let page = Page::new(cmd.chapter_id.clone(), index as i32 + 1, url.clone());
                    stored.push(self.repos.content.upsert_page(&page).await?.row);
                }
                let retired = self
                    .repos
                    .content
                    .retire_pages_after(&cmd.chapter_id, stored.len())
                    .await?;
                Ok((stored, retired))
            })
            .await?;

        let mut downloaded = 0;
        let mut present = 0;
        for page in &pages {
            if cmd.skip_existing && self.already_stored(page).await {
                present += 1;
                continue;
            }
            if cancel.is_cancelled() {
                return Err(CrawlError::Cancelled);
            }

            let bytes = crawler.fetch_bytes(source, &page.image_url, cancel).await?;
            let artifact = self
                .artifacts
                .save(&cmd.source_id, &cmd.chapter_id, page.number, &bytes)
                .await?;
            self.guard
                .run(&key, cancel, async {
                    Ok(self
                        .repos
                        .content
                        .mark_page_downloaded(
                            &page.id,
                            &artifact.relative_path,
                            &artifact.content_hash,
                        )
                        .await?)
                })
                .await?;
            downloaded += 1;
        }

        info!(
            source_id = %cmd.source_id,
            chapter_id = %cmd.chapter_id,
            pages = pages.len(),
            downloaded,
            present,
            retired,
            "chapter pages stored"
        );

        if downloaded == 0 {
            return Ok(StageOutcome::skipped(format!(
                "all {} pages of {} already downloaded",
                pages.len(),
                cmd.chapter_url
            )));
        }
        Ok(StageOutcome::info(
            format!(
                "{} pages of {}: {downloaded} downloaded, {present} already present",
                pages.len(),
                cmd.chapter_url
            ),
            Vec::new(),
        ))
    }

    async fn already_stored(&self, page: &Page) -> bool {
        match (&page.local_path, page.is_downloaded) {
            (Some(path), true) => self.artifacts.exists(path).await,
            _ => false,
        }
    }
}
