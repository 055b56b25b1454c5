//! On-disk storage for downloaded page images.
//!
//! Files live under `<root>/<source>/<chapter>/<NNNN>.<ext>`; the extension
//! is sniffed from the bytes. Paths handed back are relative to the root.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::Result;

/// A stored image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredArtifact {
    pub relative_path: String,
    /// Lowercase hex SHA-256 of the bytes.
    pub content_hash: String,
    pub size: usize,
}

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute path of a stored artifact.
    pub fn resolve(&self, relative_path: &str) -> PathBuf {
        self.root.join(relative_path)
    }

    pub async fn exists(&self, relative_path: &str) -> bool {
        tokio::fs::try_exists(self.resolve(relative_path))
            .await
            .unwrap_or(false)
    }

    /// Write a page image, replacing any previous file for the same page.
    pub async fn save(
        &self,
        source_id: &str,
        chapter_id: &str,
        number: i32,
        bytes: &[u8],
    ) -> Result<StoredArtifact> {
        let extension = infer::get(bytes)
            .map(|kind| kind.extension())
            .unwrap_or("bin");
        let relative = format!(
            "{}/{}/{:04}.{}",
            sanitize(source_id),
            sanitize(chapter_id),
            number,
            extension
        );
        let path = self.resolve(&relative);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Write then rename so readers never see a partial file.
        let partial = path.with_extension(format!("{extension}.part"));
        tokio::fs::write(&partial, bytes).await?;
        tokio::fs::rename(&partial, &path).await?;

        let content_hash = content_hash(bytes);
        debug!(path = %relative, size = bytes.len(), "stored page image");
        Ok(StoredArtifact {
            relative_path: relative,
            content_hash,
            size: bytes.len(),
        })
    }
}

pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

fn sanitize(segment: &str) -> String {
    segment
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const PNG_HEADER: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0];

    #[tokio::test]
    async fn saves_with_sniffed_extension() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());

        let stored = store.save("src", "chap-1", 3, PNG_HEADER).await.unwrap();
        assert_eq!(stored.relative_path, "src/chap-1/0003.png");
        assert_eq!(stored.size, PNG_HEADER.len());
        assert_eq!(stored.content_hash.len(), 64);
        assert!(store.exists(&stored.relative_path).await);

        let other = store.save("src", "chap-1", 4, b"not an image").await.unwrap();
        assert!(other.relative_path.ends_with("0004.bin"));
        assert_ne!(other.content_hash, stored.content_hash);
    }

    #[tokio::test]
    async fn overwrites_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());

        store.save("s", "c", 1, b"first").await.unwrap();
        let second = store.save("s", "c", 1, b"second").await.unwrap();
        let on_disk = tokio::fs::read(store.resolve(&second.relative_path)).await.unwrap();
        assert_eq!(on_disk, b"second");
    }

    #[test]
    fn path_segments_are_sanitized() {
        assert_eq!(sanitize("a/../b"), "a____b");
        assert_eq!(content_hash(b""), "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855");
    }
}
