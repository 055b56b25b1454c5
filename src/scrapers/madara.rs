//! Crawler for WordPress sites running the Madara manga theme.

use async_trait::async_trait;
use scraper::{ElementRef, Html};
use tokio_util::sync::CancellationToken;

use super::crawler::{
    element_text, image_source, parse_chapter_number, selector, slug_from_url, ChapterDetail,
    ChapterListing, Crawler, MangaDetail, MangaListPage, MangaListing,
};
use super::http_client::SourceFetcher;
use crate::error::{CrawlError, Result};
use crate::models::{Source, SourceType};

pub struct MadaraCrawler {
    fetcher: SourceFetcher,
}

impl MadaraCrawler {
    pub fn new(fetcher: SourceFetcher) -> Self {
        Self { fetcher }
    }
}

#[async_trait]
impl Crawler for MadaraCrawler {
    fn supported_source_type(&self) -> SourceType {
        SourceType::Madara
    }

    async fn test_connection(&self, source: &Source) -> bool {
        self.fetcher.probe(source).await
    }

    async fn fetch_html(
        &self,
        source: &Source,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<String> {
        self.fetcher.get_text(source, url, cancel).await
    }

    async fn fetch_bytes(
        &self,
        source: &Source,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>> {
        self.fetcher.get_bytes(source, url, cancel).await
    }

    /// `/manga/` -> `/manga/page/2/`, keeping any query string.
    fn list_page_url(&self, base_search_url: &str, page: u32) -> String {
        if base_search_url.contains("{page}") {
            return base_search_url.replace("{page}", &page.to_string());
        }
        if page <= 1 {
            return base_search_url.to_string();
        }
        let (path, query) = match base_search_url.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (base_search_url, None),
        };
        let mut url = format!("{}/page/{page}/", path.trim_end_matches('/'));
        if let Some(query) = query {
            url.push('?');
            url.push_str(query);
        }
        url
    }

    fn parse_manga_list(&self, source: &Source, html: &str) -> Result<MangaListPage> {
        let document = Html::parse_document(html);
        let link_sel = selector(".post-title a")?;
        let next_sel = selector(".nav-previous a, a.nextpostslink, .wp-pagenavi a.next")?;

        let mut page = MangaListPage::default();
        for link in document.select(&link_sel) {
            let Some(href) = link.value().attr("href") else {
                continue;
            };
            let url = self.build_full_url(source, href);
            if page.items.iter().any(|item| item.url == url) {
                continue;
            }
            let title = element_text(link);
            let source_manga_id = slug_from_url(&url).unwrap_or_else(|| url.clone());
            page.items.push(MangaListing {
                url,
                title,
                source_manga_id,
            });
        }
        page.has_next = document.select(&next_sel).next().is_some();
        Ok(page)
    }

    fn parse_manga_detail(&self, source: &Source, url: &str, html: &str) -> Result<MangaDetail> {
        let document = Html::parse_document(html);

        let title = document
            .select(&selector(".post-title h1, .post-title h3")?)
            .next()
            .map(own_text)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| CrawlError::parse(format!("no title on {url}")))?;

        let mut detail = MangaDetail {
            source_manga_id: slug_from_url(url).unwrap_or_else(|| url.to_string()),
            title,
            ..Default::default()
        };

        let item_sel = selector(".post-content_item")?;
        let heading_sel = selector(".summary-heading")?;
        let content_sel = selector(".summary-content")?;
        for item in document.select(&item_sel) {
            let heading = item
                .select(&heading_sel)
                .next()
                .map(element_text)
                .unwrap_or_default()
                .to_lowercase();
            let Some(content) = item.select(&content_sel).next().map(element_text) else {
                continue;
            };
            if heading.starts_with("alternative") {
                detail.alt_titles = content
                    .split([',', ';'])
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect();
            } else if heading.starts_with("status") && !content.is_empty() {
                detail.status = Some(content);
            }
        }

        detail.author = document
            .select(&selector(".author-content a")?)
            .map(element_text)
            .reduce(|a, b| format!("{a}, {b}"));
        detail.genres = document
            .select(&selector(".genres-content a")?)
            .map(element_text)
            .filter(|g| !g.is_empty())
            .collect();
        detail.description = document
            .select(&selector(".description-summary .summary__content, .summary__content")?)
            .next()
            .map(element_text)
            .filter(|d| !d.is_empty());
        detail.cover_url = document
            .select(&selector(".summary_image img")?)
            .next()
            .and_then(image_source)
            .map(|src| self.build_full_url(source, &src));

        // The theme lists newest first.
        let chapter_sel = selector("li.wp-manga-chapter > a")?;
        let mut chapters: Vec<ChapterListing> = Vec::new();
        for link in document.select(&chapter_sel) {
            let Some(href) = link.value().attr("href") else {
                continue;
            };
            let url = self.build_full_url(source, href);
            if chapters.iter().any(|c| c.url == url) {
                continue;
            }
            let title = element_text(link);
            chapters.push(ChapterListing {
                number: parse_chapter_number(&title),
                url,
                title,
                source_chapter_id: None,
            });
        }
        chapters.reverse();
        detail.chapters = chapters;

        Ok(detail)
    }

    fn parse_chapter_detail(
        &self,
        _source: &Source,
        url: &str,
        html: &str,
    ) -> Result<ChapterDetail> {
        let document = Html::parse_document(html);
        let title = document
            .select(&selector("#chapter-heading, .breadcrumb li.active")?)
            .next()
            .map(element_text)
            .filter(|t| !t.is_empty());

        let number = title
            .as_deref()
            .and_then(parse_chapter_number)
            .or_else(|| slug_from_url(url).and_then(|s| parse_chapter_number(&s.replace('-', " "))));

        Ok(ChapterDetail { title, number })
    }

    fn parse_chapter_pages(&self, source: &Source, html: &str) -> Result<Vec<String>> {
        let document = Html::parse_document(html);
        let images: Vec<String> = document
            .select(&selector(".reading-content img")?)
            .filter_map(image_source)
            .map(|src| self.build_full_url(source, &src))
            .collect();

        if images.is_empty() {
            return Err(CrawlError::parse("no page images in .reading-content"));
        }
        Ok(images)
    }
}

/// Text of direct text children; skips badge spans inside headings.
fn own_text(element: ElementRef<'_>) -> String {
    let own: String = element
        .children()
        .filter_map(|node| node.value().as_text().map(|t| t.to_string()))
        .collect::<Vec<_>>()
        .join(" ");
    let own = own.split_whitespace().collect::<Vec<_>>().join(" ");
    if own.is_empty() {
        element_text(element)
    } else {
        own
    }
}
