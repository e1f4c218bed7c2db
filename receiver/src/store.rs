//! On-disk chunk persistence for one session.

use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::warn;

/// First index whose name no longer fits the four-digit padding.
pub const LEXICAL_ORDER_LIMIT: usize = 10_000;

/// Writes `chunk_0000.<ext>`, `chunk_0001.<ext>`, ... in arrival order.
///
/// Numbering is per store, so every session starts at zero. Zero padding
/// keeps lexical and arrival order identical for the first
/// [`LEXICAL_ORDER_LIMIT`] chunks; past that, `chunk_10000` sorts before
/// `chunk_9999` and only the ordered paths in [`paths`](Self::paths) (and
/// the completion record) reflect arrival order. There is no index file.
#[derive(Debug)]
pub struct ChunkStore {
    // ---
    dir: PathBuf,
    extension: String,
    paths: Vec<PathBuf>,
    total_bytes: u64,
}

impl ChunkStore {
    // ---
    /// Creates `dir` (and parents) if needed.
    ///
    /// # Errors
    ///
    /// Returns error if the directory cannot be created.
    pub async fn create(dir: impl Into<PathBuf>, extension: &str) -> std::io::Result<Self> {
        // ---
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            extension: extension.trim_start_matches('.').to_string(),
            paths: Vec::new(),
            total_bytes: 0,
        })
    }

    pub fn dir(&self) -> &Path {
        // ---
        &self.dir
    }

    /// Path the chunk with `index` is written to.
    pub fn chunk_path(&self, index: usize) -> PathBuf {
        // ---
        self.dir.join(format!("chunk_{:04}.{}", index, self.extension))
    }

    /// Writes `payload` as the next chunk and returns its path.
    pub async fn persist(&mut self, payload: &[u8]) -> std::io::Result<PathBuf> {
        // ---
        let index = self.paths.len();
        if index == LEXICAL_ORDER_LIMIT {
            warn!(
                "{} chunks in {}: file names no longer sort in arrival order",
                index,
                self.dir.display()
            );
        }
        let path = self.chunk_path(index);
        fs::write(&path, payload).await?;
        self.total_bytes += payload.len() as u64;
        self.paths.push(path.clone());
        Ok(path)
    }

    pub fn len(&self) -> usize {
        // ---
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        // ---
        self.paths.is_empty()
    }

    /// Persisted chunk paths, oldest first.
    pub fn paths(&self) -> &[PathBuf] {
        // ---
        &self.paths
    }

    pub fn total_bytes(&self) -> u64 {
        // ---
        self.total_bytes
    }

    pub fn into_parts(self) -> (PathBuf, Vec<PathBuf>, u64) {
        // ---
        (self.dir, self.paths, self.total_bytes)
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[tokio::test]
    async fn numbers_chunks_in_arrival_order() {
        // ---
        let tmp = tempfile::tempdir().unwrap();
        let mut store = ChunkStore::create(tmp.path().join("out"), ".mp3").await.unwrap();

        let first = store.persist(b"abc").await.unwrap();
        let second = store.persist(b"defgh").await.unwrap();

        assert_eq!(first.file_name().unwrap(), "chunk_0000.mp3");
        assert_eq!(second.file_name().unwrap(), "chunk_0001.mp3");
        assert_eq!(store.len(), 2);
        assert_eq!(store.total_bytes(), 8);
        assert_eq!(std::fs::read(&second).unwrap(), b"defgh");
    }

    #[tokio::test]
    async fn zero_padding_sorts_lexically() {
        // ---
        let tmp = tempfile::tempdir().unwrap();
        let store = ChunkStore::create(tmp.path(), "wav").await.unwrap();

        let mut names: Vec<String> = [12, 3, 100, 7]
            .iter()
            .map(|&i| store.chunk_path(i).display().to_string())
            .collect();
        names.sort();
        let expected: Vec<String> = [3, 7, 12, 100]
            .iter()
            .map(|&i| store.chunk_path(i).display().to_string())
            .collect();
        assert_eq!(names, expected);
    }

    #[tokio::test]
    async fn names_past_the_padding_keep_every_digit() {
        // ---
        let tmp = tempfile::tempdir().unwrap();
        let store = ChunkStore::create(tmp.path(), "wav").await.unwrap();

        let last_padded = store.chunk_path(LEXICAL_ORDER_LIMIT - 1);
        let first_wide = store.chunk_path(LEXICAL_ORDER_LIMIT);
        assert_eq!(last_padded.file_name().unwrap(), "chunk_9999.wav");
        assert_eq!(first_wide.file_name().unwrap(), "chunk_10000.wav");
        // Lexical order breaks here; arrival order lives in paths()
        assert!(first_wide < last_padded);
    }
}
