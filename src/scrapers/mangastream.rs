//! Crawler for Themesia "MangaStream" reader theme sites.

use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;
use scraper::Html;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use super::crawler::{
    element_text, image_source, parse_chapter_number, selector, slug_from_url, ChapterDetail,
    ChapterListing, Crawler, MangaDetail, MangaListPage, MangaListing,
};
use super::http_client::SourceFetcher;
use crate::error::{CrawlError, Result};
use crate::models::{Source, SourceType};

pub struct MangaStreamCrawler {
    fetcher: SourceFetcher,
}

impl MangaStreamCrawler {
    pub fn new(fetcher: SourceFetcher) -> Self {
        Self { fetcher }
    }
}

#[async_trait]
impl Crawler for MangaStreamCrawler {
    fn supported_source_type(&self) -> SourceType {
        SourceType::MangaStream
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

    /// Sets the `page` query parameter.
    fn list_page_url(&self, base_search_url: &str, page: u32) -> String {
        if base_search_url.contains("{page}") {
            return base_search_url.replace("{page}", &page.to_string());
        }
        let Ok(mut url) = Url::parse(base_search_url) else {
            let sep = if base_search_url.contains('?') { '&' } else { '?' };
            return format!("{base_search_url}{sep}page={page}");
        };
        let pairs: Vec<(String, String)> = url
            .query_pairs()
            .filter(|(k, _)| *k != "page")
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        {
            let mut query = url.query_pairs_mut();
            query.clear();
            for (k, v) in &pairs {
                query.append_pair(k, v);
            }
            query.append_pair("page", &page.to_string());
        }
        url.to_string()
    }

    fn parse_manga_list(&self, source: &Source, html: &str) -> Result<MangaListPage> {
        let document = Html::parse_document(html);
        let link_sel = selector(".listupd .bs .bsx a")?;
        let title_sel = selector(".tt")?;
        let next_sel = selector(".hpage a.r, .pagination a.next")?;

        let mut page = MangaListPage::default();
        for link in document.select(&link_sel) {
            let Some(href) = link.value().attr("href") else {
                continue;
            };
            let url = self.build_full_url(source, href);
            if page.items.iter().any(|item| item.url == url) {
                continue;
            }
            let title = link
                .value()
                .attr("title")
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .or_else(|| link.select(&title_sel).next().map(element_text))
                .unwrap_or_else(|| element_text(link));
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
            .select(&selector("h1.entry-title")?)
            .next()
            .map(element_text)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| CrawlError::parse(format!("no title on {url}")))?;

        let mut detail = MangaDetail {
            source_manga_id: slug_from_url(url).unwrap_or_else(|| url.to_string()),
            title,
            ..Default::default()
        };

        detail.alt_titles = document
            .select(&selector(".seriestualt, .alternative")?)
            .next()
            .map(element_text)
            .map(|alt| {
                alt.split([',', ';'])
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        // Info rows look like `<div class="imptdt">Status <i>Ongoing</i></div>`.
        let row_sel = selector(".tsinfo .imptdt")?;
        let value_sel = selector("i, a")?;
        for row in document.select(&row_sel) {
            let label = element_text(row).to_lowercase();
            let Some(value) = row.select(&value_sel).next().map(element_text) else {
                continue;
            };
            if value.is_empty() {
                continue;
            }
            if label.starts_with("status") {
                detail.status = Some(value);
            } else if label.starts_with("author") {
                detail.author = Some(value);
            }
        }

        detail.genres = document
            .select(&selector(".mgen a")?)
            .map(element_text)
            .filter(|g| !g.is_empty())
            .collect();
        detail.description = document
            .select(&selector(".entry-content[itemprop=description], .entry-content")?)
            .next()
            .map(element_text)
            .filter(|d| !d.is_empty());
        detail.cover_url = document
            .select(&selector(".thumb img")?)
            .next()
            .and_then(image_source)
            .map(|src| self.build_full_url(source, &src));

        let item_sel = selector("#chapterlist li")?;
        let link_sel = selector("a")?;
        let num_sel = selector(".chapternum")?;
        let mut chapters: Vec<ChapterListing> = Vec::new();
        for item in document.select(&item_sel) {
            let Some(link) = item.select(&link_sel).next() else {
                continue;
            };
            let Some(href) = link.value().attr("href") else {
                continue;
            };
            let url = self.build_full_url(source, href);
            if chapters.iter().any(|c| c.url == url) {
                continue;
            }
            let title = item
                .select(&num_sel)
                .next()
                .map(element_text)
                .unwrap_or_else(|| element_text(link));
            let number = item
                .value()
                .attr("data-num")
                .and_then(|n| n.trim().parse::<f64>().ok())
                .or_else(|| parse_chapter_number(&title));
            chapters.push(ChapterListing {
                url,
                title,
                source_chapter_id: None,
                number,
            });
        }
        // Newest first on the page.
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
            .select(&selector("h1.entry-title")?)
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
        let mut images: Vec<String> = document
            .select(&selector("#readerarea img")?)
            .filter_map(image_source)
            .map(|src| self.build_full_url(source, &src))
            .collect();

        // Reader pages often render images from a script payload instead.
        if images.is_empty() {
            images = reader_script_images(html)
                .into_iter()
                .map(|src| self.build_full_url(source, &src))
                .collect();
            debug!(count = images.len(), "images from ts_reader payload");
        }

        if images.is_empty() {
            return Err(CrawlError::parse("no page images in #readerarea"));
        }
        Ok(images)
    }
}

/// Image URLs from `ts_reader.run({...})`: the first source's image list.
fn reader_script_images(html: &str) -> Vec<String> {
    static TS_READER: OnceLock<Option<Regex>> = OnceLock::new();
    let Some(re) = TS_READER
        .get_or_init(|| Regex::new(r"(?s)ts_reader\.run\((\{.*?\})\);").ok())
        .as_ref()
    else {
        return Vec::new();
    };
    let Some(payload) = re.captures(html).and_then(|c| c.get(1)) else {
        return Vec::new();
    };
    let Ok(value) = serde_json::from_str::<serde_json::Value>(payload.as_str()) else {
        return Vec::new();
    };
    value["sources"][0]["images"]
        .as_array()
        .map(|images| {
            images
                .iter()
                .filter_map(|v| v.as_str())
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scrapers::http_client::DefaultClientFactory;
    use crate::scrapers::rate_limiter::RateLimiter;
    use std::sync::Arc;

    fn crawler() -> MangaStreamCrawler {
        MangaStreamCrawler::new(SourceFetcher::new(
            Arc::new(DefaultClientFactory::default()),
            RateLimiter::new(),
        ))
    }

    fn source() -> Source {
        Source::new(
            "ms".into(),
            SourceType::MangaStream,
            "MS".into(),
            "https://ms.example".into(),
        )
    }

    #[test]
    fn pagination_urls() {
        let c = crawler();
        assert_eq!(
            c.list_page_url("https://ms.example/manga/?order=update", 2),
            "https://ms.example/manga/?order=update&page=2"
        );
        assert_eq!(
            c.list_page_url("https://ms.example/manga/?page=5&order=az", 1),
            "https://ms.example/manga/?order=az&page=1"
        );
    }

    #[test]
    fn parses_listing() {
        let html = r#"
            <div class="listupd">
              <div class="bs"><div class="bsx"><a href="/manga/gamma/" title="Gamma"><div class="tt">Gamma</div></a></div></div>
              <div class="bs"><div class="bsx"><a href="/manga/delta/"><div class="tt"> Delta </div></a></div></div>
            </div>
            <div class="hpage"><a class="r" href="?page=2">Next</a></div>
        "#;
        let page = crawler().parse_manga_list(&source(), html).unwrap();
        let titles: Vec<_> = page.items.iter().map(|i| i.title.as_str()).collect();
        assert_eq!(titles, vec!["Gamma", "Delta"]);
        assert_eq!(page.items[1].url, "https://ms.example/manga/delta/");
        assert!(page.has_next);

        let last = crawler()
            .parse_manga_list(&source(), r#"<div class="listupd"></div>"#)
            .unwrap();
        assert!(last.items.is_empty());
        assert!(!last.has_next);
    }

    #[test]
    fn parses_detail() {
        let html = r#"
            <div class="thumb"><img src="https://ms.example/c.webp"></div>
            <h1 class="entry-title">Gamma</h1>
            <span class="alternative">G, Gamma Ray</span>
            <div class="tsinfo">
              <div class="imptdt">Status <i>Completed</i></div>
              <div class="imptdt">Author <i>Someone</i></div>
            </div>
            <div class="mgen"><a>Drama</a><a>Romance</a></div>
            <div class="entry-content" itemprop="description"><p>Synopsis.</p></div>
            <div id="chapterlist"><ul>
              <li data-num="10"><a href="/gamma-chapter-10/"><span class="chapternum">Chapter 10</span></a></li>
              <li data-num="9.5"><a href="/gamma-chapter-9-5/"><span class="chapternum">Chapter 9.5</span></a></li>
            </ul></div>
        "#;
        let detail = crawler()
            .parse_manga_detail(&source(), "https://ms.example/manga/gamma/", html)
            .unwrap();
        assert_eq!(detail.title, "Gamma");
        assert_eq!(detail.alt_titles, vec!["G", "Gamma Ray"]);
        assert_eq!(detail.status.as_deref(), Some("Completed"));
        assert_eq!(detail.author.as_deref(), Some("Someone"));
        assert_eq!(detail.genres, vec!["Drama", "Romance"]);
        assert_eq!(detail.description.as_deref(), Some("Synopsis."));
        assert_eq!(detail.chapters[0].number, Some(9.5));
        assert_eq!(detail.chapters[1].url, "https://ms.example/gamma-chapter-10/");
    }

    #[test]
    fn pages_fall_back_to_reader_script() {
        let html = r#"
            <h1 class="entry-title">Gamma Chapter 10</h1>
            <div id="readerarea"></div>
            <script>ts_reader.run({"prevUrl":"","sources":[{"source":"Server 1","images":["https://cdn.ms/1.jpg","https://cdn.ms/2.jpg"]}]});</script>
        "#;
        let c = crawler();
        let pages = c.parse_chapter_pages(&source(), html).unwrap();
        assert_eq!(pages, vec!["https://cdn.ms/1.jpg", "https://cdn.ms/2.jpg"]);
        let detail = c
            .parse_chapter_detail(&source(), "https://ms.example/gamma-chapter-10/", html)
            .unwrap();
        assert_eq!(detail.number, Some(10.0));

        let direct = r#"<div id="readerarea"><img src="/p/1.png"><img src="/p/2.png"></div>"#;
        assert_eq!(
            c.parse_chapter_pages(&source(), direct).unwrap(),
            vec!["https://ms.example/p/1.png", "https://ms.example/p/2.png"]
        );
    }
}
