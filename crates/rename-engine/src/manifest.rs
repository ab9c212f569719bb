//! The durable, on-disk description of an in-progress rename (spec §3).
//!
//! A `Manifest` is both the WAL payload (serialized as-is) and the in-memory
//! record `TransactionManager` mutates as phases complete. The on-disk WAL
//! itself is never rewritten mid-transaction (§4.6); progress is tracked only
//! in the in-memory copy and reconstructed from filesystem state during
//! boot recovery.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManifestPhase {
    Prepare,
    Committing,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NoteRenameEntry {
    pub from: PathBuf,
    pub to: PathBuf,
    pub sha256_before: String,
    /// Pre-image copy of `from`, staged during `prepare` so rollback can
    /// restore it even after the final rename has happened.
    pub staged_path: Option<PathBuf>,
    pub completed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkUpdateEntry {
    pub path: PathBuf,
    pub sha256_before: String,
    /// Post-image (rewritten content) staged during `prepare`, installed over
    /// `path` atomically at commit.
    pub staged_path: Option<PathBuf>,
    /// Pre-image copy of `path`'s original content, staged alongside the
    /// post-image so a later rollback can restore it after commit has
    /// already overwritten `path`.
    pub pre_image_staged_path: Option<PathBuf>,
    pub replacements: usize,
    pub completed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub correlation_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub vault_path: PathBuf,
    pub phase: ManifestPhase,
    pub operation: String,
    pub note_rename: NoteRenameEntry,
    pub link_updates: Vec<LinkUpdateEntry>,
    pub total_operations: usize,
    pub pid: u32,
}

impl Manifest {
    /// `<yyyy-mm-ddThh-mm-ss-sssZ>-rename-<uuid>.wal.json` (spec §6.2).
    pub fn wal_file_name(&self) -> String {
        let safe_timestamp = self.timestamp.format("%Y-%m-%dT%H-%M-%S-%3fZ");
        format!("{safe_timestamp}-rename-{}.wal.json", self.correlation_id)
    }
}
