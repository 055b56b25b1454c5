//! Catalog rows: mangas, chapters and pages.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A manga series as known to one source.
///
/// Deduplicated by `(source_id, source_manga_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manga {
    pub id: String,
    pub source_id: String,
    pub source_manga_id: String,
    pub url: String,
    pub title: String,
    pub alt_titles: Vec<String>,
    pub author: Option<String>,
    pub status: Option<String>,
    pub description: Option<String>,
    pub cover_url: Option<String>,
    pub genres: Vec<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Manga {
    pub fn new(source_id: String, source_manga_id: String, url: String, title: String) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            source_id,
            source_manga_id,
            url,
            title,
            alt_titles: Vec::new(),
            author: None,
            status: None,
            description: None,
            cover_url: None,
            genres: Vec::new(),
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Deduplicated by `(manga_id, source_chapter_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chapter {
    pub id: String,
    pub manga_id: String,
    pub source_id: String,
    /// Native chapter id, or the chapter URL when the source has none.
    pub source_chapter_id: String,
    pub url: String,
    pub title: String,
    pub number: Option<f64>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Chapter {
    pub fn new(
        manga_id: String,
        source_id: String,
        source_chapter_id: String,
        url: String,
        title: String,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            manga_id,
            source_id,
            source_chapter_id,
            url,
            title,
            number: None,
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }
}

/// One page image of a chapter; deduplicated by `(chapter_id, number)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page {
    pub id: String,
    pub chapter_id: String,
    /// 1-based reading order.
    pub number: i32,
    pub image_url: String,
    pub is_downloaded: bool,
    /// Path of the stored image, relative to the artifacts directory.
    pub local_path: Option<String>,
    pub content_hash: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Page {
    pub fn new(chapter_id: String, number: i32, image_url: String) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            chapter_id,
            number,
            image_url,
            is_downloaded: false,
            local_path: None,
            content_hash: None,
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }
}
