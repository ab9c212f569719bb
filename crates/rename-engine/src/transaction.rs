//! TransactionManager: the plan/prepare/commit/rollback/cleanup state machine
//! that makes a rename crash-safe (spec §4.6).

use crate::cancel::CancellationToken;
use crate::error::RenameError;
use crate::manifest::{LinkUpdateEntry, Manifest, ManifestPhase, NoteRenameEntry};
use crate::updater::Rewrite;
use crate::wal::WALManager;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tokio::fs;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Idle,
    Planned,
    Prepared,
    Committed,
    Cleaned,
    RollingBack,
    RolledBack,
}

impl TransactionState {
    /// States from which a boot-recovery pass can still make progress by
    /// rolling back, as opposed to ones that mean nothing was ever staged.
    pub fn is_recoverable(self) -> bool {
        matches!(self, TransactionState::Prepared | TransactionState::RollingBack)
    }
}

/// Drives one rename through `IDLE → PLANNED → PREPARED → COMMITTED →
/// CLEANED`, with a `PREPARED ↘ ROLLING_BACK → ROLLED_BACK` branch on
/// failure (spec §4.6). Each `TransactionManager` is single-use -- the
/// coordinator constructs a fresh one per `rename_note` call -- except for
/// boot recovery, which constructs one directly against a WAL entry loaded
/// from disk and calls `rollback` without ever calling `plan`/`prepare`
/// locally; `rollback` accepts `Idle` as a starting state for exactly that
/// case.
pub struct TransactionManager {
    vault_path: PathBuf,
    wal: WALManager,
    state: StdMutex<TransactionState>,
}

impl TransactionManager {
    pub fn new(vault_path: PathBuf, wal: WALManager) -> Self {
        Self {
            vault_path,
            wal,
            state: StdMutex::new(TransactionState::Idle),
        }
    }

    fn require_state(&self, allowed: &[TransactionState]) -> Result<TransactionState, RenameError> {
        let current = *self.state.lock().unwrap();
        if !allowed.contains(&current) {
            return Err(RenameError::TransactionFailed {
                phase: "state".to_string(),
                reason: format!("expected transaction state in {allowed:?}, found {current:?}"),
            });
        }
        Ok(current)
    }

    fn set_state(&self, next: TransactionState) {
        *self.state.lock().unwrap() = next;
    }

    /// Validate `old_path`/`new_path`, read the current note and every
    /// referencing file's pre-image hash, and assemble an in-memory manifest.
    /// Nothing is written to disk yet.
    pub async fn plan(
        &self,
        old_path: &Path,
        new_path: &Path,
        rewrites: &HashMap<PathBuf, Rewrite>,
        correlation_id: Uuid,
        cancel: Option<&CancellationToken>,
    ) -> Result<Manifest, RenameError> {
        self.require_state(&[TransactionState::Idle])?;

        if cancel.is_some_and(CancellationToken::is_cancelled) {
            return Err(RenameError::TransactionFailed {
                phase: "plan".to_string(),
                reason: "cancelled".to_string(),
            });
        }

        if old_path == new_path {
            return Err(RenameError::InvalidInput {
                reason: "source and destination paths are identical".to_string(),
            });
        }
        if new_path.extension().and_then(|e| e.to_str()) != Some("md") {
            return Err(RenameError::DestinationInvalid {
                path: new_path.to_path_buf(),
                reason: "destination must have a .md extension".to_string(),
            });
        }
        for path in [old_path, new_path] {
            if !path.starts_with(&self.vault_path) {
                return Err(RenameError::InvalidInput {
                    reason: format!("{} is outside the vault", path.display()),
                });
            }
        }
        if fs::try_exists(new_path).await? {
            return Err(RenameError::DestinationInvalid {
                path: new_path.to_path_buf(),
                reason: "destination already exists".to_string(),
            });
        }

        // Spec §4.6: "hash collision with another in-flight transaction (same
        // new_path)" fails plan(). A staged file never appears at new_path
        // until commit (invariant I2), so `try_exists` above can't catch two
        // concurrent renames targeting the same destination -- only the WAL
        // directory can.
        let in_flight = self.wal.scan_all().await?;
        if let Some(existing) = in_flight
            .iter()
            .find(|entry| entry.manifest.note_rename.to == new_path)
        {
            return Err(RenameError::TransactionFailed {
                phase: "plan".to_string(),
                reason: format!(
                    "another in-flight transaction ({}) already targets {}",
                    existing.manifest.correlation_id,
                    new_path.display()
                ),
            });
        }

        let note_bytes = read_with_retry(old_path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                RenameError::SourceNotFound {
                    path: old_path.to_path_buf(),
                }
            } else {
                RenameError::from(e)
            }
        })?;
        let note_rename = NoteRenameEntry {
            from: old_path.to_path_buf(),
            to: new_path.to_path_buf(),
            sha256_before: sha256_hex(&note_bytes),
            staged_path: None,
            completed: false,
        };

        let mut paths: Vec<&PathBuf> = rewrites.keys().collect();
        paths.sort();

        let mut link_updates = Vec::with_capacity(paths.len());
        for path in paths {
            let rewrite = &rewrites[path];
            link_updates.push(LinkUpdateEntry {
                path: path.clone(),
                sha256_before: sha256_hex(rewrite.original.as_bytes()),
                staged_path: None,
                pre_image_staged_path: None,
                replacements: rewrite.replacements,
                completed: false,
            });
        }

        let total_operations = 1 + link_updates.len();

        let manifest = Manifest {
            correlation_id,
            timestamp: chrono::Utc::now(),
            vault_path: self.vault_path.clone(),
            phase: ManifestPhase::Prepare,
            operation: "rename_note".to_string(),
            note_rename,
            link_updates,
            total_operations,
            pid: std::process::id(),
        };

        self.set_state(TransactionState::Planned);
        Ok(manifest)
    }

    /// Stage every file this transaction will touch, then durably write the
    /// WAL. For each link update both the rewritten post-image and a copy of
    /// the original pre-image are staged -- the post-image is installed at
    /// commit, the pre-image is what `rollback` restores from if that install
    /// has to be undone after the fact.
    ///
    /// Staged paths are deterministic from `correlation_id` alone (see
    /// `staged_path`), so the manifest can be fully populated and the WAL
    /// written *before* a single byte of staged content exists on disk. That
    /// ordering is what keeps the invariant "either the WAL for a rename
    /// exists, or every staged file for it is absent" true even if a write
    /// fails partway through the loop below: any staged file the loop did
    /// manage to write before the failure is named in the already-durable
    /// WAL, so a crash here is recoverable, and an in-process early return
    /// cleans those same files up itself (via `discard_staged`) rather than
    /// leaving them orphaned with no WAL to explain them.
    pub async fn prepare(
        &self,
        manifest: &mut Manifest,
        rewrites: &HashMap<PathBuf, Rewrite>,
        cancel: Option<&CancellationToken>,
    ) -> Result<PathBuf, RenameError> {
        self.require_state(&[TransactionState::Planned])?;

        if cancel.is_some_and(CancellationToken::is_cancelled) {
            return Err(RenameError::TransactionFailed {
                phase: "prepare".to_string(),
                reason: "cancelled before staging began".to_string(),
            });
        }

        for entry in &manifest.link_updates {
            if !rewrites.contains_key(&entry.path) {
                return Err(RenameError::TransactionFailed {
                    phase: "prepare".to_string(),
                    reason: format!("no staged rewrite for {}", entry.path.display()),
                });
            }
        }

        let note_staged = self.staged_path(manifest.correlation_id, "note-preimage");
        manifest.note_rename.staged_path = Some(note_staged.clone());

        let mut entry_paths = Vec::with_capacity(manifest.link_updates.len());
        for (index, entry) in manifest.link_updates.iter_mut().enumerate() {
            let post_staged = self.staged_path(manifest.correlation_id, &format!("link-{index}-post"));
            let pre_staged = self.staged_path(manifest.correlation_id, &format!("link-{index}-pre"));
            entry.staged_path = Some(post_staged.clone());
            entry.pre_image_staged_path = Some(pre_staged.clone());
            entry_paths.push((post_staged, pre_staged));
        }

        manifest.phase = ManifestPhase::Prepare;
        let wal_path = self.wal.write_wal(manifest).await?;

        let mut written: Vec<PathBuf> = Vec::new();

        macro_rules! abort {
            ($err:expr) => {{
                discard_staged(&written).await;
                self.wal.delete_wal(&wal_path).await;
                return Err($err);
            }};
        }

        let note_bytes = match read_with_retry(&manifest.note_rename.from).await {
            Ok(bytes) => bytes,
            Err(e) => abort!(e.into()),
        };
        if let Err(e) = fs::write(&note_staged, &note_bytes).await {
            abort!(e.into());
        }
        written.push(note_staged);

        for (index, (post_staged, pre_staged)) in entry_paths.into_iter().enumerate() {
            if cancel.is_some_and(CancellationToken::is_cancelled) {
                abort!(RenameError::TransactionFailed {
                    phase: "prepare".to_string(),
                    reason: "cancelled during staging".to_string(),
                });
            }

            let rewrite = &rewrites[&manifest.link_updates[index].path];

            if let Err(e) = fs::write(&post_staged, rewrite.updated.as_bytes()).await {
                abort!(e.into());
            }
            written.push(post_staged);

            if let Err(e) = fs::write(&pre_staged, rewrite.original.as_bytes()).await {
                abort!(e.into());
            }
            written.push(pre_staged);
        }

        self.set_state(TransactionState::Prepared);
        Ok(wal_path)
    }

    /// Install every staged post-image, verifying each file's current hash
    /// against the pre-image hash recorded at `plan` time before touching it.
    /// A mismatch triggers an automatic rollback of whatever already
    /// committed and surfaces `HashMismatch` to the caller; any other I/O
    /// failure mid-commit rolls back the same way but surfaces as
    /// `PartialFailure` once at least one entry had already been installed,
    /// or the raw error otherwise (spec §4.6: "on any failure, transition to
    /// ROLLING_BACK").
    pub async fn commit(&self, manifest: &mut Manifest, wal_path: &Path) -> Result<(), RenameError> {
        self.require_state(&[TransactionState::Prepared])?;
        manifest.phase = ManifestPhase::Committing;

        for index in 0..manifest.link_updates.len() {
            let (path, expected, staged_path) = {
                let entry = &manifest.link_updates[index];
                (entry.path.clone(), entry.sha256_before.clone(), entry.staged_path.clone())
            };
            let staged_path = match staged_path {
                Some(p) => p,
                None => {
                    return self
                        .abort_commit(
                            manifest,
                            wal_path,
                            RenameError::TransactionFailed {
                                phase: "commit".to_string(),
                                reason: "link update missing staged post-image".to_string(),
                            },
                        )
                        .await;
                }
            };

            let current = match read_with_retry(&path).await {
                Ok(bytes) => bytes,
                Err(e) => return self.abort_commit(manifest, wal_path, e.into()).await,
            };
            let actual = sha256_hex(&current);
            if actual != expected {
                return self
                    .abort_commit(manifest, wal_path, RenameError::HashMismatch { path, expected, actual })
                    .await;
            }

            if let Err(e) = fs::rename(&staged_path, &path).await {
                return self.abort_commit(manifest, wal_path, e.into()).await;
            }
            manifest.link_updates[index].completed = true;
        }

        let current = match read_with_retry(&manifest.note_rename.from).await {
            Ok(bytes) => bytes,
            Err(e) => return self.abort_commit(manifest, wal_path, e.into()).await,
        };
        let actual = sha256_hex(&current);
        if actual != manifest.note_rename.sha256_before {
            let path = manifest.note_rename.from.clone();
            let expected = manifest.note_rename.sha256_before.clone();
            return self
                .abort_commit(manifest, wal_path, RenameError::HashMismatch { path, expected, actual })
                .await;
        }

        if let Err(e) = fs::rename(&manifest.note_rename.from, &manifest.note_rename.to).await {
            return self.abort_commit(manifest, wal_path, e.into()).await;
        }
        manifest.note_rename.completed = true;

        self.set_state(TransactionState::Committed);
        Ok(())
    }

    /// Roll back a commit that failed partway through, then decide which
    /// error code reaches the caller: a hash mismatch is always reported as
    /// `HashMismatch` (it names the specific cause), but any other failure
    /// that hit after at least one link update was already installed is
    /// reclassified as `PartialFailure` so the caller knows rollback, not
    /// just failure, happened. Rollback itself failing takes priority over
    /// both -- it returns `Unrecoverable`.
    async fn abort_commit(
        &self,
        manifest: &mut Manifest,
        wal_path: &Path,
        cause: RenameError,
    ) -> Result<(), RenameError> {
        let completed = manifest.link_updates.iter().filter(|e| e.completed).count();
        self.rollback(manifest, wal_path).await?;

        if matches!(cause, RenameError::HashMismatch { .. }) || completed == 0 {
            Err(cause)
        } else {
            Err(RenameError::PartialFailure {
                completed,
                total: manifest.total_operations,
            })
        }
    }

    /// Undo whatever has already been committed.
    ///
    /// The on-disk WAL is never rewritten mid-transaction (§4.6), so every
    /// `Manifest` this method sees -- whether it's the in-memory copy
    /// `commit` is still holding, or one freshly parsed from disk by
    /// `BootRecovery` after a crash -- has every `completed` flag exactly as
    /// `prepare` wrote it: `false`. Branching on `completed` would therefore
    /// always take the "nothing happened yet" path, even when `commit` had
    /// already installed some post-images before crashing. Progress is
    /// reconstructed from the filesystem instead:
    ///
    /// - a link update's staged post-image file still existing means
    ///   `commit` never got to it (it consumes that file with `fs::rename`
    ///   the moment it installs it) -- nothing to restore, just discard the
    ///   staged copies.
    /// - the staged post-image being gone, with the target's current hash no
    ///   longer matching `sha256_before`, means `commit` already installed it
    ///   -- restore the pre-image from `pre_image_staged_path`.
    /// - likewise for the note rename: `from` missing with `to` holding the
    ///   pre-image hash means the final rename already happened.
    ///
    /// If a restoration fails partway through, the WAL is deliberately left
    /// in place and `Unrecoverable` is returned so boot recovery (or an
    /// operator) gets another chance.
    pub async fn rollback(&self, manifest: &mut Manifest, wal_path: &Path) -> Result<(), RenameError> {
        self.require_state(&[
            TransactionState::Idle,
            TransactionState::Prepared,
            TransactionState::RollingBack,
        ])?;
        self.set_state(TransactionState::RollingBack);

        let mut failed = false;

        for entry in &manifest.link_updates {
            let post_staged_exists = match &entry.staged_path {
                Some(p) => fs::try_exists(p).await.unwrap_or(false),
                None => false,
            };

            if !post_staged_exists {
                let current_hash = read_with_retry(&entry.path).await.ok().map(|b| sha256_hex(&b));
                let was_installed = current_hash.as_deref() != Some(entry.sha256_before.as_str());

                if was_installed {
                    match &entry.pre_image_staged_path {
                        Some(pre) if fs::try_exists(pre).await.unwrap_or(false) => {
                            if fs::rename(pre, &entry.path).await.is_err() {
                                failed = true;
                            }
                        }
                        _ => failed = true,
                    }
                }
            }

            if let Some(post) = &entry.staged_path {
                let _ = fs::remove_file(post).await;
            }
            if let Some(pre) = &entry.pre_image_staged_path {
                let _ = fs::remove_file(pre).await;
            }
        }

        let from_exists = fs::try_exists(&manifest.note_rename.from).await.unwrap_or(false);
        if !from_exists {
            let to_matches = match read_with_retry(&manifest.note_rename.to).await {
                Ok(bytes) => sha256_hex(&bytes) == manifest.note_rename.sha256_before,
                Err(_) => false,
            };

            if to_matches {
                if fs::rename(&manifest.note_rename.to, &manifest.note_rename.from).await.is_err() {
                    failed = true;
                }
            } else {
                match &manifest.note_rename.staged_path {
                    Some(staged) if fs::try_exists(staged).await.unwrap_or(false) => {
                        if fs::rename(staged, &manifest.note_rename.from).await.is_err() {
                            failed = true;
                        }
                    }
                    _ => failed = true,
                }
            }
        }
        if let Some(staged) = &manifest.note_rename.staged_path {
            let _ = fs::remove_file(staged).await;
        }

        if failed {
            // Stay in RollingBack: a later retry (another boot recovery pass,
            // or an operator) may still be able to finish the job.
            return Err(RenameError::Unrecoverable {
                correlation_id: manifest.correlation_id,
                wal_path: wal_path.to_path_buf(),
            });
        }

        self.wal.delete_wal(wal_path).await;
        self.set_state(TransactionState::RolledBack);
        Ok(())
    }

    /// Success path: drop any staged files the commit loop didn't already
    /// consume (pre-image copies) and remove the WAL.
    pub async fn cleanup(&self, manifest: &Manifest, wal_path: &Path) {
        if let Err(e) = self.require_state(&[TransactionState::Committed]) {
            tracing::warn!(error = %e, "cleanup called from an unexpected transaction state");
        }

        for entry in &manifest.link_updates {
            if let Some(pre) = &entry.pre_image_staged_path {
                let _ = fs::remove_file(pre).await;
            }
        }
        if let Some(staged) = &manifest.note_rename.staged_path {
            let _ = fs::remove_file(staged).await;
        }
        self.wal.delete_wal(wal_path).await;
        self.set_state(TransactionState::Cleaned);
    }

    fn staged_path(&self, correlation_id: Uuid, suffix: &str) -> PathBuf {
        self.vault_path.join(format!(".mcp-staged-{correlation_id}-{suffix}"))
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Remove every staged file in `paths` that exists, ignoring errors -- used
/// to unwind a `prepare()` that failed partway through staging.
async fn discard_staged(paths: &[PathBuf]) {
    for path in paths {
        let _ = fs::remove_file(path).await;
    }
}

/// Read a file, retrying a transient failure (a concurrent cloud-sync writer
/// holding the file busy, or briefly missing it mid-swap) with exponential
/// backoff. Bounded at 3 attempts and 500ms of total sleep (spec §5
/// "Cloud-sync resilience").
async fn read_with_retry(path: &Path) -> std::io::Result<Vec<u8>> {
    const MAX_ATTEMPTS: u32 = 3;
    const MAX_TOTAL_DELAY: Duration = Duration::from_millis(500);

    let mut delay = Duration::from_millis(50);
    let mut total_delay = Duration::ZERO;
    let mut attempt = 0;

    loop {
        attempt += 1;
        match fs::read(path).await {
            Ok(bytes) => return Ok(bytes),
            Err(e) if attempt < MAX_ATTEMPTS && is_transient(&e) && total_delay + delay <= MAX_TOTAL_DELAY => {
                tokio::time::sleep(delay).await;
                total_delay += delay;
                delay *= 2;
            }
            Err(e) => return Err(e),
        }
    }
}

fn is_transient(e: &std::io::Error) -> bool {
    matches!(e.kind(), std::io::ErrorKind::NotFound | std::io::ErrorKind::ResourceBusy)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn rewrite_for(original: &str, updated: &str) -> Rewrite {
        Rewrite {
            original: original.to_string(),
            updated: updated.to_string(),
            replacements: 1,
        }
    }

    #[tokio::test]
    async fn plan_rejects_identical_paths() {
        let dir = TempDir::new().unwrap();
        let wal = WALManager::new(dir.path().join(".wal"));
        let txn = TransactionManager::new(dir.path().to_path_buf(), wal);
        let path = dir.path().join("a.md");
        fs::write(&path, "content").await.unwrap();

        let result = txn.plan(&path, &path, &HashMap::new(), Uuid::new_v4(), None).await;
        assert!(matches!(result, Err(RenameError::InvalidInput { .. })));
    }

    #[tokio::test]
    async fn plan_rejects_existing_destination() {
        let dir = TempDir::new().unwrap();
        let wal = WALManager::new(dir.path().join(".wal"));
        let txn = TransactionManager::new(dir.path().to_path_buf(), wal);
        let from = dir.path().join("a.md");
        let to = dir.path().join("b.md");
        fs::write(&from, "content").await.unwrap();
        fs::write(&to, "other").await.unwrap();

        let result = txn.plan(&from, &to, &HashMap::new(), Uuid::new_v4(), None).await;
        assert!(matches!(result, Err(RenameError::DestinationInvalid { .. })));
    }

    #[tokio::test]
    async fn plan_rejects_destination_of_in_flight_transaction() {
        let dir = TempDir::new().unwrap();
        let wal_manager = WALManager::new(dir.path().join(".wal"));
        let first = TransactionManager::new(dir.path().to_path_buf(), wal_manager);

        let from_a = dir.path().join("a.md");
        let from_b = dir.path().join("b.md");
        let to = dir.path().join("target.md");
        fs::write(&from_a, "A").await.unwrap();
        fs::write(&from_b, "B").await.unwrap();

        let mut manifest_a = first.plan(&from_a, &to, &HashMap::new(), Uuid::new_v4(), None).await.unwrap();
        first.prepare(&mut manifest_a, &HashMap::new(), None).await.unwrap();

        let wal_manager = WALManager::new(dir.path().join(".wal"));
        let second = TransactionManager::new(dir.path().to_path_buf(), wal_manager);
        let result = second.plan(&from_b, &to, &HashMap::new(), Uuid::new_v4(), None).await;
        assert!(matches!(result, Err(RenameError::TransactionFailed { .. })));
    }

    #[tokio::test]
    async fn commit_before_prepare_is_rejected() {
        let dir = TempDir::new().unwrap();
        let wal_manager = WALManager::new(dir.path().join(".wal"));
        let txn = TransactionManager::new(dir.path().to_path_buf(), wal_manager);

        let from = dir.path().join("source.md");
        let to = dir.path().join("target.md");
        fs::write(&from, "# Source").await.unwrap();

        let mut manifest = txn.plan(&from, &to, &HashMap::new(), Uuid::new_v4(), None).await.unwrap();
        let wal_path = dir.path().join(".wal").join(manifest.wal_file_name());

        let result = txn.commit(&mut manifest, &wal_path).await;
        assert!(matches!(result, Err(RenameError::TransactionFailed { .. })));
    }

    #[tokio::test]
    async fn prepare_twice_is_rejected() {
        let dir = TempDir::new().unwrap();
        let wal_manager = WALManager::new(dir.path().join(".wal"));
        let txn = TransactionManager::new(dir.path().to_path_buf(), wal_manager);

        let from = dir.path().join("source.md");
        let to = dir.path().join("target.md");
        fs::write(&from, "# Source").await.unwrap();

        let mut manifest = txn.plan(&from, &to, &HashMap::new(), Uuid::new_v4(), None).await.unwrap();
        txn.prepare(&mut manifest, &HashMap::new(), None).await.unwrap();

        let result = txn.prepare(&mut manifest, &HashMap::new(), None).await;
        assert!(matches!(result, Err(RenameError::TransactionFailed { .. })));
    }

    #[tokio::test]
    async fn full_lifecycle_commits_and_cleans_up() {
        let dir = TempDir::new().unwrap();
        let wal_manager = WALManager::new(dir.path().join(".wal"));
        let txn = TransactionManager::new(dir.path().to_path_buf(), wal_manager);

        let from = dir.path().join("source.md");
        let to = dir.path().join("target.md");
        let referencer = dir.path().join("ref.md");
        fs::write(&from, "# Source").await.unwrap();
        fs::write(&referencer, "[[source]]").await.unwrap();

        let mut rewrites = HashMap::new();
        rewrites.insert(referencer.clone(), rewrite_for("[[source]]", "[[target]]"));

        let correlation_id = Uuid::new_v4();
        let mut manifest = txn.plan(&from, &to, &rewrites, correlation_id, None).await.unwrap();
        let wal_path = txn.prepare(&mut manifest, &rewrites, None).await.unwrap();
        assert!(wal_path.exists());

        txn.commit(&mut manifest, &wal_path).await.unwrap();
        assert!(to.exists());
        assert!(!from.exists());
        assert_eq!(fs::read_to_string(&referencer).await.unwrap(), "[[target]]");

        txn.cleanup(&manifest, &wal_path).await;
        assert!(!wal_path.exists());
    }

    #[tokio::test]
    async fn commit_detects_hash_mismatch_and_rolls_back() {
        let dir = TempDir::new().unwrap();
        let wal_manager = WALManager::new(dir.path().join(".wal"));
        let txn = TransactionManager::new(dir.path().to_path_buf(), wal_manager);

        let from = dir.path().join("source.md");
        let to = dir.path().join("target.md");
        let referencer = dir.path().join("ref.md");
        fs::write(&from, "# Source").await.unwrap();
        fs::write(&referencer, "[[source]]").await.unwrap();

        let mut rewrites = HashMap::new();
        rewrites.insert(referencer.clone(), rewrite_for("[[source]]", "[[target]]"));

        let correlation_id = Uuid::new_v4();
        let mut manifest = txn.plan(&from, &to, &rewrites, correlation_id, None).await.unwrap();
        let wal_path = txn.prepare(&mut manifest, &rewrites, None).await.unwrap();

        // Someone edits the referencer after prepare but before commit.
        fs::write(&referencer, "[[source]] edited").await.unwrap();

        let result = txn.commit(&mut manifest, &wal_path).await;
        assert!(matches!(result, Err(RenameError::HashMismatch { .. })));
        assert_eq!(fs::read_to_string(&referencer).await.unwrap(), "[[source]] edited");
        assert!(from.exists());
        assert!(!to.exists());
        assert!(!wal_path.exists());
    }

    /// Two referencers; the second goes missing between `prepare` and
    /// `commit` (simulating an out-of-band delete, not a content change).
    /// The first referencer's post-image is already installed by the time
    /// that read fails, so this is distinct from a hash mismatch: the
    /// caller should see `PartialFailure`, and both referencers should end
    /// up restored to their pre-images after rollback.
    #[tokio::test]
    async fn commit_reports_partial_failure_on_mid_commit_io_error() {
        let dir = TempDir::new().unwrap();
        let wal_manager = WALManager::new(dir.path().join(".wal"));
        let txn = TransactionManager::new(dir.path().to_path_buf(), wal_manager);

        let from = dir.path().join("source.md");
        let to = dir.path().join("target.md");
        let ref_a = dir.path().join("ref-a.md");
        let ref_b = dir.path().join("ref-b.md");
        fs::write(&from, "# Source").await.unwrap();
        fs::write(&ref_a, "[[source]]").await.unwrap();
        fs::write(&ref_b, "[[source]]").await.unwrap();

        let mut rewrites = HashMap::new();
        rewrites.insert(ref_a.clone(), rewrite_for("[[source]]", "[[target]]"));
        rewrites.insert(ref_b.clone(), rewrite_for("[[source]]", "[[target]]"));

        let correlation_id = Uuid::new_v4();
        let mut manifest = txn.plan(&from, &to, &rewrites, correlation_id, None).await.unwrap();
        let wal_path = txn.prepare(&mut manifest, &rewrites, None).await.unwrap();

        // manifest.link_updates is sorted by path; ref-a sorts before ref-b.
        assert_eq!(manifest.link_updates[0].path, ref_a);
        fs::remove_file(&ref_b).await.unwrap();

        let result = txn.commit(&mut manifest, &wal_path).await;
        match result {
            Err(RenameError::PartialFailure { completed, total }) => {
                assert_eq!(completed, 1);
                assert_eq!(total, 3);
            }
            other => panic!("expected PartialFailure, got {other:?}"),
        }

        assert_eq!(fs::read_to_string(&ref_a).await.unwrap(), "[[source]]");
        assert!(from.exists());
        assert!(!to.exists());
        assert!(!wal_path.exists());
    }

    /// Reproduces the crash window from spec §8 scenario 4: `commit` installs
    /// the first (and only) link update's post-image, then crashes before
    /// renaming the note itself. Recovery loads the WAL fresh from disk --
    /// exactly like `BootRecovery` does -- so this only passes if `rollback`
    /// reconstructs progress from the filesystem instead of trusting
    /// `completed` (which is `false` in every on-disk WAL, always).
    #[tokio::test]
    async fn rollback_after_reload_restores_partially_committed_referencer() {
        let dir = TempDir::new().unwrap();
        let wal_dir = dir.path().join(".wal");
        let wal_manager = WALManager::new(wal_dir.clone());
        let txn = TransactionManager::new(dir.path().to_path_buf(), wal_manager);

        let from = dir.path().join("source.md");
        let to = dir.path().join("target.md");
        let referencer = dir.path().join("ref.md");
        fs::write(&from, "# Source").await.unwrap();
        fs::write(&referencer, "[[source]]").await.unwrap();

        let mut rewrites = HashMap::new();
        rewrites.insert(referencer.clone(), rewrite_for("[[source]]", "[[target]]"));

        let correlation_id = Uuid::new_v4();
        let mut manifest = txn.plan(&from, &to, &rewrites, correlation_id, None).await.unwrap();
        let wal_path = txn.prepare(&mut manifest, &rewrites, None).await.unwrap();

        // Simulate commit() installing the link update's post-image and then
        // crashing before it ever reaches the note rename. The on-disk WAL
        // is untouched -- it still says completed: false everywhere.
        let staged_post = manifest.link_updates[0].staged_path.clone().unwrap();
        fs::rename(&staged_post, &referencer).await.unwrap();
        assert_eq!(fs::read_to_string(&referencer).await.unwrap(), "[[target]]");

        // Restart: reload the manifest exactly as BootRecovery would, from
        // the untouched on-disk WAL, with a brand new TransactionManager.
        let reloaded_bytes = fs::read(&wal_path).await.unwrap();
        let mut reloaded_manifest: Manifest = serde_json::from_slice(&reloaded_bytes).unwrap();
        assert!(!reloaded_manifest.link_updates[0].completed);
        assert!(!reloaded_manifest.note_rename.completed);

        let recovery_txn = TransactionManager::new(dir.path().to_path_buf(), WALManager::new(wal_dir.clone()));
        recovery_txn.rollback(&mut reloaded_manifest, &wal_path).await.unwrap();

        assert_eq!(fs::read_to_string(&referencer).await.unwrap(), "[[source]]");
        assert!(from.exists());
        assert!(!to.exists());
        assert!(!wal_path.exists());
    }

    #[tokio::test]
    async fn cancelled_plan_is_rejected_before_any_read() {
        let dir = TempDir::new().unwrap();
        let wal_manager = WALManager::new(dir.path().join(".wal"));
        let txn = TransactionManager::new(dir.path().to_path_buf(), wal_manager);

        let from = dir.path().join("source.md");
        let to = dir.path().join("target.md");
        fs::write(&from, "# Source").await.unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = txn.plan(&from, &to, &HashMap::new(), Uuid::new_v4(), Some(&cancel)).await;
        assert!(matches!(result, Err(RenameError::TransactionFailed { .. })));
    }

    /// A cancellation observed before any staging I/O begins must leave no
    /// staged files and no WAL behind.
    #[tokio::test]
    async fn cancelled_prepare_stages_nothing() {
        let dir = TempDir::new().unwrap();
        let wal_dir = dir.path().join(".wal");
        let wal_manager = WALManager::new(wal_dir.clone());
        let txn = TransactionManager::new(dir.path().to_path_buf(), wal_manager);

        let from = dir.path().join("source.md");
        let to = dir.path().join("target.md");
        let ref_a = dir.path().join("ref-a.md");
        fs::write(&from, "# Source").await.unwrap();
        fs::write(&ref_a, "[[source]]").await.unwrap();

        let mut rewrites = HashMap::new();
        rewrites.insert(ref_a.clone(), rewrite_for("[[source]]", "[[target]]"));

        let mut manifest = txn.plan(&from, &to, &rewrites, Uuid::new_v4(), None).await.unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = txn.prepare(&mut manifest, &rewrites, Some(&cancel)).await;

        assert!(matches!(result, Err(RenameError::TransactionFailed { .. })));
        assert!(!dir.path().join(format!(".mcp-staged-{}-note-preimage", manifest.correlation_id)).exists());
        assert!(!dir.path().join(format!(".mcp-staged-{}-link-0-post", manifest.correlation_id)).exists());
        assert_eq!(tokio::fs::read_dir(&wal_dir).await.unwrap().next_entry().await.unwrap(), None);
    }

    #[tokio::test]
    async fn prepare_cleans_up_staged_files_when_a_write_fails_midway() {
        let dir = TempDir::new().unwrap();
        let wal_dir = dir.path().join(".wal");
        let wal_manager = WALManager::new(wal_dir.clone());
        let txn = TransactionManager::new(dir.path().to_path_buf(), wal_manager);

        let from = dir.path().join("source.md");
        let to = dir.path().join("target.md");
        let ref_a = dir.path().join("ref-a.md");
        fs::write(&from, "# Source").await.unwrap();
        fs::write(&ref_a, "[[source]]").await.unwrap();

        let mut rewrites = HashMap::new();
        rewrites.insert(ref_a.clone(), rewrite_for("[[source]]", "[[target]]"));

        let correlation_id = Uuid::new_v4();
        let mut manifest = txn.plan(&from, &to, &rewrites, correlation_id, None).await.unwrap();

        // Delete the source note after plan() hashed it, so prepare()'s own
        // read of it fails after the WAL has already been written.
        fs::remove_file(&from).await.unwrap();

        let result = txn.prepare(&mut manifest, &rewrites, None).await;
        assert!(result.is_err());
        assert_eq!(tokio::fs::read_dir(&wal_dir).await.unwrap().next_entry().await.unwrap(), None);
        assert!(!dir.path().join(format!(".mcp-staged-{correlation_id}-note-preimage")).exists());
    }
}
