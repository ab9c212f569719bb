//! NoteCache: a consumed interface (spec §4.2).
//!
//! The engine does not own the cache; it assumes a refresh is triggered
//! implicitly and re-reads on mtime mismatch. `FsNoteCache` is the default,
//! TTL-bound implementation used when no external cache is wired in; an
//! enclosing service with its own file-watcher-backed cache can implement
//! `NoteCache` directly instead.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
pub struct CachedNote {
    pub path: PathBuf,
    pub bytes: String,
    pub mtime: SystemTime,
}

#[async_trait]
pub trait NoteCache: Send + Sync {
    /// All currently indexed notes below the vault root.
    async fn get_all(&self) -> std::io::Result<Vec<CachedNote>>;
    /// Force the next read to re-read `path` from disk.
    async fn invalidate(&self, path: &Path);
    /// Used after a commit that touched many files.
    async fn invalidate_all(&self);
}

/// Default NoteCache: a TTL-bound snapshot of the vault, refreshed by walking
/// the directory tree on expiry.
pub struct FsNoteCache {
    vault_path: PathBuf,
    ttl: Duration,
    snapshot: RwLock<Option<(SystemTime, Vec<CachedNote>)>>,
}

impl FsNoteCache {
    pub fn new(vault_path: PathBuf, ttl: Duration) -> Self {
        Self {
            vault_path,
            ttl,
            snapshot: RwLock::new(None),
        }
    }

    async fn refresh(&self) -> std::io::Result<Vec<CachedNote>> {
        let mut notes = Vec::new();
        collect_markdown_notes(&self.vault_path, &mut notes).await?;
        Ok(notes)
    }
}

async fn collect_markdown_notes(dir: &Path, out: &mut Vec<CachedNote>) -> std::io::Result<()> {
    let mut entries = tokio::fs::read_dir(dir).await?;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let file_name = entry.file_name();
        let name = file_name.to_string_lossy();

        if name.starts_with('.') {
            continue;
        }

        let file_type = entry.file_type().await?;
        if file_type.is_dir() {
            Box::pin(collect_markdown_notes(&path, out)).await?;
        } else if file_type.is_file() && name.ends_with(".md") {
            let bytes = tokio::fs::read_to_string(&path).await?;
            let mtime = entry.metadata().await?.modified()?;
            out.push(CachedNote { path, bytes, mtime });
        }
    }

    Ok(())
}

#[async_trait]
impl NoteCache for FsNoteCache {
    async fn get_all(&self) -> std::io::Result<Vec<CachedNote>> {
        {
            let guard = self.snapshot.read().await;
            if let Some((fetched_at, notes)) = guard.as_ref() {
                if fetched_at.elapsed().unwrap_or(Duration::MAX) < self.ttl {
                    return Ok(notes.clone());
                }
            }
        }

        let notes = self.refresh().await?;
        let mut guard = self.snapshot.write().await;
        *guard = Some((SystemTime::now(), notes.clone()));
        Ok(notes)
    }

    async fn invalidate(&self, _path: &Path) {
        // The snapshot isn't keyed per-file; dropping it forces a full
        // refresh on the next access. Good enough for a cache whose whole
        // point is a short TTL, not per-path precision.
        *self.snapshot.write().await = None;
    }

    async fn invalidate_all(&self) {
        *self.snapshot.write().await = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn lists_markdown_files_recursively() {
        let dir = TempDir::new().unwrap();
        tokio::fs::write(dir.path().join("a.md"), "A").await.unwrap();
        tokio::fs::create_dir(dir.path().join("sub")).await.unwrap();
        tokio::fs::write(dir.path().join("sub/b.md"), "B").await.unwrap();
        tokio::fs::write(dir.path().join("ignore.txt"), "nope").await.unwrap();

        let cache = FsNoteCache::new(dir.path().to_path_buf(), Duration::from_secs(60));
        let mut notes = cache.get_all().await.unwrap();
        notes.sort_by(|a, b| a.path.cmp(&b.path));

        assert_eq!(notes.len(), 2);
        assert!(notes[0].path.ends_with("a.md"));
        assert!(notes[1].path.ends_with("sub/b.md"));
    }

    #[tokio::test]
    async fn skips_hidden_entries() {
        let dir = TempDir::new().unwrap();
        tokio::fs::write(dir.path().join("visible.md"), "V").await.unwrap();
        tokio::fs::write(dir.path().join(".hidden.md"), "H").await.unwrap();

        let cache = FsNoteCache::new(dir.path().to_path_buf(), Duration::from_secs(60));
        let notes = cache.get_all().await.unwrap();

        assert_eq!(notes.len(), 1);
        assert!(notes[0].path.ends_with("visible.md"));
    }

    #[tokio::test]
    async fn invalidate_all_forces_refresh() {
        let dir = TempDir::new().unwrap();
        let cache = FsNoteCache::new(dir.path().to_path_buf(), Duration::from_secs(60));
        cache.get_all().await.unwrap();

        tokio::fs::write(dir.path().join("new.md"), "N").await.unwrap();
        cache.invalidate_all().await;

        let notes = cache.get_all().await.unwrap();
        assert_eq!(notes.len(), 1);
    }
}
