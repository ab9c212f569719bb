//! WALManager: durable append/scan/delete of WAL entries (spec §4.5).

use crate::error::RenameError;
use crate::manifest::Manifest;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::fs;
use tokio::io::AsyncWriteExt;

pub struct WalEntry {
    pub manifest: Manifest,
    pub path: PathBuf,
    pub age: Duration,
}

pub struct WALManager {
    wal_dir: PathBuf,
}

impl WALManager {
    pub fn new(wal_dir: PathBuf) -> Self {
        Self { wal_dir }
    }

    pub fn wal_dir(&self) -> &Path {
        &self.wal_dir
    }

    /// Serialize `manifest`, write it atomically (temp file with O_EXCL, then
    /// rename), and fsync the containing directory so the entry survives a
    /// crash immediately after this call returns.
    pub async fn write_wal(&self, manifest: &Manifest) -> Result<PathBuf, RenameError> {
        fs::create_dir_all(&self.wal_dir).await?;
        let path = self.wal_dir.join(manifest.wal_file_name());

        let body = serde_json::to_vec_pretty(manifest).map_err(|e| RenameError::TransactionFailed {
            phase: "prepare".to_string(),
            reason: format!("failed to serialize manifest: {e}"),
        })?;

        let temp_path = self.wal_dir.join(format!(".{}.tmp", random_suffix()));
        write_exclusive(&temp_path, &body).await?;
        fs::rename(&temp_path, &path).await?;
        sync_dir(&self.wal_dir).await?;

        Ok(path)
    }

    /// List WAL files older than `quiescence`, parsing each. Malformed files
    /// are logged and skipped rather than aborting the scan.
    pub async fn scan_pending(&self, quiescence: Duration) -> Result<Vec<WalEntry>, RenameError> {
        Ok(self
            .scan_all()
            .await?
            .into_iter()
            .filter(|entry| entry.age >= quiescence)
            .collect())
    }

    /// List and parse every WAL file regardless of age, including ones
    /// written moments ago by a still-live transaction. Used by
    /// `scan_pending` (after filtering by quiescence) and by
    /// `TransactionManager::plan` to detect an in-flight transaction already
    /// targeting the same destination (spec §4.6: "hash collision with
    /// another in-flight transaction"). Malformed files are logged and
    /// skipped rather than aborting the scan.
    pub async fn scan_all(&self) -> Result<Vec<WalEntry>, RenameError> {
        let mut entries = Vec::new();

        let mut dir = match fs::read_dir(&self.wal_dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(entries),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            let name = entry.file_name();
            if !name.to_string_lossy().ends_with(".wal.json") {
                continue;
            }

            let metadata = match entry.metadata().await {
                Ok(m) => m,
                Err(_) => continue,
            };
            let modified = metadata.modified().unwrap_or_else(|_| SystemTime::now());
            let age = modified.elapsed().unwrap_or(Duration::ZERO);

            match fs::read(&path).await {
                Ok(bytes) => match serde_json::from_slice::<Manifest>(&bytes) {
                    Ok(manifest) => entries.push(WalEntry { manifest, path, age }),
                    Err(e) => {
                        tracing::warn!(wal_path = %path.display(), error = %e, "malformed WAL file, skipping");
                    }
                },
                Err(e) => {
                    tracing::warn!(wal_path = %path.display(), error = %e, "failed to read WAL file, skipping");
                }
            }
        }

        Ok(entries)
    }

    /// Failure to delete is logged, not fatal -- a stray WAL is picked up
    /// again by the next boot recovery pass.
    pub async fn delete_wal(&self, path: &Path) {
        if let Err(e) = fs::remove_file(path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(wal_path = %path.display(), error = %e, "failed to delete WAL file");
            }
        }
    }

    pub fn resolve_path(&self, manifest: &Manifest) -> PathBuf {
        self.wal_dir.join(manifest.wal_file_name())
    }
}

async fn write_exclusive(path: &Path, bytes: &[u8]) -> Result<(), RenameError> {
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    Ok(())
}

async fn sync_dir(dir: &Path) -> Result<(), RenameError> {
    let dir_handle = fs::File::open(dir).await?;
    dir_handle.sync_all().await?;
    Ok(())
}

fn random_suffix() -> String {
    let bytes: [u8; 8] = rand::random();
    hex::encode(bytes)
}
