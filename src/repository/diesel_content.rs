//! Diesel-based catalog repository: mangas, chapters and pages.
//!
//! Every row is upserted by its natural key so that replaying a stage
//! command never duplicates catalog entries.

use std::collections::HashSet;

use chrono::Utc;
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;

use super::diesel_models::{ChapterRecord, MangaRecord, PageRecord};
use super::diesel_pool::{run_blocking, DieselError, SqlitePool};
use super::{format_datetime, is_unique_violation, parse_datetime};
use crate::models::{Chapter, Manga, Page};
use crate::schema::{chapters, mangas, pages};

impl From<MangaRecord> for Manga {
    fn from(record: MangaRecord) -> Self {
        Manga {
            alt_titles: serde_json::from_str(&record.alt_titles).unwrap_or_default(),
            genres: serde_json::from_str(&record.genres).unwrap_or_default(),
            is_active: record.is_active != 0,
            created_at: parse_datetime(&record.created_at),
            updated_at: parse_datetime(&record.updated_at),
            id: record.id,
            source_id: record.source_id,
            source_manga_id: record.source_manga_id,
            url: record.url,
            title: record.title,
            author: record.author,
            status: record.status,
            description: record.description,
            cover_url: record.cover_url,
        }
    }
}

impl From<&Manga> for MangaRecord {
    fn from(manga: &Manga) -> Self {
        MangaRecord {
            id: manga.id.clone(),
            source_id: manga.source_id.clone(),
            source_manga_id: manga.source_manga_id.clone(),
            url: manga.url.clone(),
            title: manga.title.clone(),
            alt_titles: serde_json::to_string(&manga.alt_titles)
                .unwrap_or_else(|_| "[]".to_string()),
            author: manga.author.clone(),
            status: manga.status.clone(),
            description: manga.description.clone(),
            cover_url: manga.cover_url.clone(),
            genres: serde_json::to_string(&manga.genres).unwrap_or_else(|_| "[]".to_string()),
            is_active: manga.is_active as i32,
            created_at: format_datetime(&manga.created_at),
            updated_at: format_datetime(&manga.updated_at),
        }
    }
}

impl From<ChapterRecord> for Chapter {
    fn from(record: ChapterRecord) -> Self {
        Chapter {
            is_active: record.is_active != 0,
            created_at: parse_datetime(&record.created_at),
            updated_at: parse_datetime(&record.updated_at),
            id: record.id,
            manga_id: record.manga_id,
            source_id: record.source_id,
            source_chapter_id: record.source_chapter_id,
            url: record.url,
            title: record.title,
            number: record.number,
        }
    }
}

impl From<&Chapter> for ChapterRecord {
    fn from(chapter: &Chapter) -> Self {
        ChapterRecord {
            id: chapter.id.clone(),
            manga_id: chapter.manga_id.clone(),
            source_id: chapter.source_id.clone(),
            source_chapter_id: chapter.source_chapter_id.clone(),
            url: chapter.url.clone(),
            title: chapter.title.clone(),
            number: chapter.number,
            is_active: chapter.is_active as i32,
            created_at: format_datetime(&chapter.created_at),
            updated_at: format_datetime(&chapter.updated_at),
        }
    }
}

impl From<PageRecord> for Page {
    fn from(record: PageRecord) -> Self {
        Page {
            is_downloaded: record.is_downloaded != 0,
            is_active: record.is_active != 0,
            created_at: parse_datetime(&record.created_at),
            updated_at: parse_datetime(&record.updated_at),
            id: record.id,
            chapter_id: record.chapter_id,
            number: record.number,
            image_url: record.image_url,
            local_path: record.local_path,
            content_hash: record.content_hash,
        }
    }
}

impl From<&Page> for PageRecord {
    fn from(page: &Page) -> Self {
        PageRecord {
            id: page.id.clone(),
            chapter_id: page.chapter_id.clone(),
            number: page.number,
            image_url: page.image_url.clone(),
            is_downloaded: page.is_downloaded as i32,
            local_path: page.local_path.clone(),
            content_hash: page.content_hash.clone(),
            is_active: page.is_active as i32,
            created_at: format_datetime(&page.created_at),
            updated_at: format_datetime(&page.updated_at),
        }
    }
}

/// Result of an upsert: the stored row and whether it was newly inserted.
#[derive(Debug, Clone)]
pub struct Upserted<T> {
    pub row: T,
    pub created: bool,
}

/// Diesel-based catalog repository.
#[derive(Clone)]
pub struct DieselContentRepository {
    pool: SqlitePool,
}

impl DieselContentRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    // ========================================================================
    // Mangas
    // ========================================================================

    /// Find a manga by its native identifier within a source.
    pub async fn find_manga(
        &self,
        source_id: &str,
        source_manga_id: &str,
    ) -> Result<Option<Manga>, DieselError> {
        let source_id = source_id.to_string();
        let source_manga_id = source_manga_id.to_string();
        let pool = self.pool.clone();

        run_blocking(pool, move |conn| {
            find_manga_record(conn, &source_id, &source_manga_id)
        })
        .await
        .map(|opt| opt.map(Manga::from))
    }

    pub async fn get_manga(&self, id: &str) -> Result<Option<Manga>, DieselError> {
        let id = id.to_string();
        let pool = self.pool.clone();

        run_blocking(pool, move |conn| {
            mangas::table.find(&id).first::<MangaRecord>(conn).optional()
        })
        .await
        .map(|opt| opt.map(Manga::from))
    }

    /// Insert a manga or refresh the metadata of the existing row.
    ///
    /// The existing row keeps its id and `created_at`.
    pub async fn upsert_manga(&self, manga: &Manga) -> Result<Upserted<Manga>, DieselError> {
        let mut record = MangaRecord::from(manga);
        record.updated_at = format_datetime(&Utc::now());
        let pool = self.pool.clone();

        run_blocking(pool, move |conn| {
            if let Some(existing) =
                find_manga_record(conn, &record.source_id, &record.source_manga_id)?
            {
                return update_manga(conn, &existing.id, &record).map(|row| Upserted {
                    row,
                    created: false,
                });
            }

            let inserted = diesel::insert_into(mangas::table)
                .values(&record)
                .execute(conn);
            match inserted {
                Ok(_) => Ok(Upserted {
                    row: record,
                    created: true,
                }),
                // Lost an insert race: fall back to updating the winner.
                Err(e) if is_unique_violation(&e) => {
                    let existing =
                        find_manga_record(conn, &record.source_id, &record.source_manga_id)?
                            .ok_or(e)?;
                    update_manga(conn, &existing.id, &record).map(|row| Upserted {
                        row,
                        created: false,
                    })
                }
                Err(e) => Err(e),
            }
        })
        .await
        .map(|u| Upserted {
            row: Manga::from(u.row),
            created: u.created,
        })
    }

    /// Active mangas of a source in insertion order.
    pub async fn list_active_mangas(
        &self,
        source_id: &str,
        limit: Option<u32>,
    ) -> Result<Vec<Manga>, DieselError> {
        let source_id = source_id.to_string();
        let pool = self.pool.clone();

        run_blocking(pool, move |conn| {
            let mut query = mangas::table
                .filter(mangas::source_id.eq(&source_id))
                .filter(mangas::is_active.eq(1))
                .order((mangas::created_at.asc(), mangas::id.asc()))
                .into_boxed();
            if let Some(limit) = limit {
                query = query.limit(limit as i64);
            }
            query.load::<MangaRecord>(conn)
        })
        .await
        .map(|records| records.into_iter().map(Manga::from).collect())
    }

    pub async fn count_mangas(&self, source_id: &str) -> Result<i64, DieselError> {
        let source_id = source_id.to_string();
        let pool = self.pool.clone();

        run_blocking(pool, move |conn| {
            mangas::table
                .filter(mangas::source_id.eq(&source_id))
                .count()
                .get_result(conn)
        })
        .await
    }

    // ========================================================================
    // Chapters
    // ========================================================================

    pub async fn find_chapter(
        &self,
        manga_id: &str,
        source_chapter_id: &str,
    ) -> Result<Option<Chapter>, DieselError> {
        let manga_id = manga_id.to_string();
        let source_chapter_id = source_chapter_id.to_string();
        let pool = self.pool.clone();

        run_blocking(pool, move |conn| {
            find_chapter_record(conn, &manga_id, &source_chapter_id)
        })
        .await
        .map(|opt| opt.map(Chapter::from))
    }

    /// Insert a chapter or refresh the existing row with the same key.
    pub async fn upsert_chapter(
        &self,
        chapter: &Chapter,
    ) -> Result<Upserted<Chapter>, DieselError> {
        let mut record = ChapterRecord::from(chapter);
        record.updated_at = format_datetime(&Utc::now());
        let pool = self.pool.clone();

        run_blocking(pool, move |conn| {
            if let Some(existing) =
                find_chapter_record(conn, &record.manga_id, &record.source_chapter_id)?
            {
                return update_chapter(conn, &existing.id, &record).map(|row| Upserted {
                    row,
                    created: false,
                });
            }

            let inserted = diesel::insert_into(chapters::table)
                .values(&record)
                .execute(conn);
            match inserted {
                Ok(_) => Ok(Upserted {
                    row: record,
                    created: true,
                }),
                Err(e) if is_unique_violation(&e) => {
                    let existing =
                        find_chapter_record(conn, &record.manga_id, &record.source_chapter_id)?
                            .ok_or(e)?;
                    update_chapter(conn, &existing.id, &record).map(|row| Upserted {
                        row,
                        created: false,
                    })
                }
                Err(e) => Err(e),
            }
        })
        .await
        .map(|u| Upserted {
            row: Chapter::from(u.row),
            created: u.created,
        })
    }

    /// Keys of the active chapters stored for a manga.
    pub async fn chapter_keys(&self, manga_id: &str) -> Result<HashSet<String>, DieselError> {
        let manga_id = manga_id.to_string();
        let pool = self.pool.clone();

        run_blocking(pool, move |conn| {
            chapters::table
                .filter(chapters::manga_id.eq(&manga_id))
                .filter(chapters::is_active.eq(1))
                .select(chapters::source_chapter_id)
                .load::<String>(conn)
        })
        .await
        .map(|keys| keys.into_iter().collect())
    }

    /// Active chapters of a manga.
    pub async fn chapters_for_manga(&self, manga_id: &str) -> Result<Vec<Chapter>, DieselError> {
        let manga_id = manga_id.to_string();
        let pool = self.pool.clone();

        run_blocking(pool, move |conn| {
            chapters::table
                .filter(chapters::manga_id.eq(&manga_id))
                .filter(chapters::is_active.eq(1))
                .order((chapters::created_at.asc(), chapters::id.asc()))
                .load::<ChapterRecord>(conn)
        })
        .await
        .map(|records| records.into_iter().map(Chapter::from).collect())
    }

    pub async fn count_chapters(&self, manga_id: &str) -> Result<i64, DieselError> {
        let manga_id = manga_id.to_string();
        let pool = self.pool.clone();

        run_blocking(pool, move |conn| {
            chapters::table
                .filter(chapters::manga_id.eq(&manga_id))
                .filter(chapters::is_active.eq(1))
                .count()
                .get_result(conn)
        })
        .await
    }

    /// Retire active chapters of a manga whose key is not in `keep`.
    pub async fn retire_missing_chapters(
        &self,
        manga_id: &str,
        keep: &[String],
    ) -> Result<usize, DieselError> {
        let manga_id = manga_id.to_string();
        let keep = keep.to_vec();
        let now = format_datetime(&Utc::now());
        let pool = self.pool.clone();

        run_blocking(pool, move |conn| {
            diesel::update(
                chapters::table
                    .filter(chapters::manga_id.eq(&manga_id))
                    .filter(chapters::is_active.eq(1))
                    .filter(chapters::source_chapter_id.ne_all(keep)),
            )
            .set((chapters::is_active.eq(0), chapters::updated_at.eq(&now)))
            .execute(conn)
        })
        .await
    }

    // ========================================================================
    // Pages
    // ========================================================================

    /// Active pages of a chapter in reading order.
    pub async fn pages_for_chapter(&self, chapter_id: &str) -> Result<Vec<Page>, DieselError> {
        let chapter_id = chapter_id.to_string();
        let pool = self.pool.clone();

        run_blocking(pool, move |conn| {
            pages::table
                .filter(pages::chapter_id.eq(&chapter_id))
                .filter(pages::is_active.eq(1))
                .order(pages::number.asc())
                .load::<PageRecord>(conn)
        })
        .await
        .map(|records| records.into_iter().map(Page::from).collect())
    }

    /// Insert a page or update the image URL of the existing one.
    ///
    /// A changed image URL resets the download state.
    pub async fn upsert_page(&self, page: &Page) -> Result<Upserted<Page>, DieselError> {
        let record = PageRecord::from(page);
        let now = format_datetime(&Utc::now());
        let pool = self.pool.clone();

        run_blocking(pool, move |conn| {
            conn.transaction::<_, DieselError, _>(|conn| {
                let existing = pages::table
                    .filter(pages::chapter_id.eq(&record.chapter_id))
                    .filter(pages::number.eq(record.number))
                    .first::<PageRecord>(conn)
                    .optional()?;

                match existing {
                    Some(existing)
                        if existing.image_url == record.image_url && existing.is_active != 0 =>
                    {
                        Ok(Upserted {
                            row: existing,
                            created: false,
                        })
                    }
                    Some(existing) if existing.image_url == record.image_url => {
                        diesel::update(pages::table.find(&existing.id))
                            .set((pages::is_active.eq(1), pages::updated_at.eq(&now)))
                            .execute(conn)?;
                        let row = pages::table.find(&existing.id).first::<PageRecord>(conn)?;
                        Ok(Upserted {
                            row,
                            created: false,
                        })
                    }
                    Some(existing) => {
                        diesel::update(pages::table.find(&existing.id))
                            .set((
                                pages::image_url.eq(&record.image_url),
                                pages::is_downloaded.eq(0),
                                pages::local_path.eq(None::<String>),
                                pages::content_hash.eq(None::<String>),
                                pages::is_active.eq(1),
                                pages::updated_at.eq(&now),
                            ))
                            .execute(conn)?;
                        let row = pages::table.find(&existing.id).first::<PageRecord>(conn)?;
                        Ok(Upserted {
                            row,
                            created: false,
                        })
                    }
                    None => {
                        diesel::insert_into(pages::table)
                            .values(&record)
                            .execute(conn)?;
                        Ok(Upserted {
                            row: record,
                            created: true,
                        })
                    }
                }
            })
        })
        .await
        .map(|u| Upserted {
            row: Page::from(u.row),
            created: u.created,
        })
    }

    /// Retire pages numbered past `count`: the chapter now has fewer images.
    pub async fn retire_pages_after(
        &self,
        chapter_id: &str,
        count: usize,
    ) -> Result<usize, DieselError> {
        let chapter_id = chapter_id.to_string();
        let now = format_datetime(&Utc::now());
        let pool = self.pool.clone();

        run_blocking(pool, move |conn| {
            diesel::update(
                pages::table
                    .filter(pages::chapter_id.eq(&chapter_id))
                    .filter(pages::number.gt(count as i32))
                    .filter(pages::is_active.eq(1)),
            )
            .set((pages::is_active.eq(0), pages::updated_at.eq(&now)))
            .execute(conn)
        })
        .await
    }

    /// Record a stored image for a page.
    pub async fn mark_page_downloaded(
        &self,
        page_id: &str,
        local_path: &str,
        content_hash: &str,
    ) -> Result<(), DieselError> {
        let page_id = page_id.to_string();
        let local_path = local_path.to_string();
        let content_hash = content_hash.to_string();
        let now = format_datetime(&Utc::now());
        let pool = self.pool.clone();

        run_blocking(pool, move |conn| {
            diesel::update(pages::table.find(&page_id))
                .set((
                    pages::is_downloaded.eq(1),
                    pages::local_path.eq(Some(&local_path)),
                    pages::content_hash.eq(Some(&content_hash)),
                    pages::updated_at.eq(&now),
                ))
                .execute(conn)?;
            Ok(())
        })
        .await
    }
}

fn find_manga_record(
    conn: &mut SqliteConnection,
    source_id: &str,
    source_manga_id: &str,
) -> Result<Option<MangaRecord>, DieselError> {
    mangas::table
        .filter(mangas::source_id.eq(source_id))
        .filter(mangas::source_manga_id.eq(source_manga_id))
        .first::<MangaRecord>(conn)
        .optional()
}

fn update_manga(
    conn: &mut SqliteConnection,
    id: &str,
    record: &MangaRecord,
) -> Result<MangaRecord, DieselError> {
    diesel::update(mangas::table.find(id))
        .set((
            mangas::url.eq(&record.url),
            mangas::title.eq(&record.title),
            mangas::alt_titles.eq(&record.alt_titles),
            mangas::author.eq(&record.author),
            mangas::status.eq(&record.status),
            mangas::description.eq(&record.description),
            mangas::cover_url.eq(&record.cover_url),
            mangas::genres.eq(&record.genres),
            mangas::is_active.eq(1),
            mangas::updated_at.eq(&record.updated_at),
        ))
        .execute(conn)?;
    mangas::table.find(id).first::<MangaRecord>(conn)
}

fn find_chapter_record(
    conn: &mut SqliteConnection,
    manga_id: &str,
    source_chapter_id: &str,
) -> Result<Option<ChapterRecord>, DieselError> {
    chapters::table
        .filter(chapters::manga_id.eq(manga_id))
        .filter(chapters::source_chapter_id.eq(source_chapter_id))
        .first::<ChapterRecord>(conn)
        .optional()
}

fn update_chapter(
    conn: &mut SqliteConnection,
    id: &str,
    record: &ChapterRecord,
) -> Result<ChapterRecord, DieselError> {
    diesel::update(chapters::table.find(id))
        .set((
            chapters::url.eq(&record.url),
            chapters::title.eq(&record.title),
            chapters::number.eq(record.number),
            chapters::is_active.eq(1),
            chapters::updated_at.eq(&record.updated_at),
        ))
        .execute(conn)?;
    chapters::table.find(id).first::<ChapterRecord>(conn)
}
