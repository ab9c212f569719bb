//! RenameCoordinator: the public surface (spec §4.7).
//!
//! Wraps scan → update → plan → prepare → commit → cleanup behind one
//! `rename_note` call, and keeps a short-lived idempotency cache so a retry
//! carrying the same correlation id after a successful rename returns the
//! original result instead of re-running (and failing, since the source no
//! longer exists under its old name).

use crate::cache::{FsNoteCache, NoteCache};
use crate::cancel::CancellationToken;
use crate::config::EngineConfig;
use crate::error::RenameError;
use crate::transaction::TransactionManager;
use crate::updater::{LinkUpdater, UpdateResult};
use crate::wal::WALManager;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct RenameInput {
    pub old_path: PathBuf,
    pub new_path: PathBuf,
    pub update_links: bool,
    pub case_sensitive: bool,
    pub correlation_id: Option<Uuid>,
    /// Checked between `plan`/`prepare`; ignored once `commit` begins
    /// (spec §5 "Cancellation"). `None` means this rename can't be
    /// cancelled.
    pub cancellation: Option<CancellationToken>,
}

/// Every error `rename_note` returns carries the `correlation_id` it was
/// called (or generated a new one) with, so a caller can retry the same
/// correlation id after a failure and have somewhere to look it up (spec §9).
#[derive(Debug)]
pub struct RenameFailure {
    pub correlation_id: Uuid,
    pub error: RenameError,
}

impl std::fmt::Display for RenameFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "rename {} failed: {}", self.correlation_id, self.error)
    }
}

impl std::error::Error for RenameFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenameMetrics {
    pub scan_ms: u64,
    pub prepare_ms: u64,
    pub commit_ms: u64,
    pub total_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenameOutput {
    pub correlation_id: Uuid,
    pub old_path: PathBuf,
    pub new_path: PathBuf,
    pub links_updated: usize,
    pub references_found: usize,
    pub duration_ms: u64,
    pub metrics: RenameMetrics,
    pub warnings: Vec<String>,
}

pub struct RenameCoordinator {
    vault_path: PathBuf,
    cache: Arc<dyn NoteCache>,
    wal: WALManager,
    idempotency: Mutex<HashMap<Uuid, RenameOutput>>,
}

impl RenameCoordinator {
    pub fn new(config: &EngineConfig) -> Self {
        let cache: Arc<dyn NoteCache> = Arc::new(FsNoteCache::new(
            config.vault_path.clone(),
            Duration::from_secs(config.cache_ttl_secs),
        ));
        Self {
            vault_path: config.vault_path.clone(),
            cache,
            wal: WALManager::new(config.wal_dir.clone()),
            idempotency: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_cache(config: &EngineConfig, cache: Arc<dyn NoteCache>) -> Self {
        Self {
            vault_path: config.vault_path.clone(),
            cache,
            wal: WALManager::new(config.wal_dir.clone()),
            idempotency: Mutex::new(HashMap::new()),
        }
    }

    pub async fn rename_note(&self, input: RenameInput) -> Result<RenameOutput, RenameFailure> {
        let correlation_id = input.correlation_id.unwrap_or_else(Uuid::new_v4);
        let cancel = input.cancellation.clone();

        if let Some(cached) = self.idempotency.lock().await.get(&correlation_id) {
            tracing::info!(%correlation_id, "returning cached result for repeated correlation id");
            return Ok(cached.clone());
        }

        let fail = |error: RenameError| RenameFailure { correlation_id, error };

        let started = Instant::now();
        let old_path = normalize_within_vault(&self.vault_path, &input.old_path).map_err(fail)?;
        let new_path = normalize_within_vault(&self.vault_path, &input.new_path).map_err(fail)?;

        let old_name = note_stem(&old_path).map_err(fail)?;
        let new_name = note_stem(&new_path).map_err(fail)?;

        let (update_result, rewrites): (UpdateResult, HashMap<PathBuf, crate::updater::Rewrite>) =
            if input.update_links {
                let updater = LinkUpdater::new(Arc::clone(&self.cache));
                updater
                    .update_vault(&old_name, &new_name, input.case_sensitive)
                    .await
                    .map_err(fail)?
            } else {
                (
                    UpdateResult {
                        updated_count: 0,
                        total_references: 0,
                        failed_files: Vec::new(),
                        scan_time_ms: 0,
                        update_time_ms: 0,
                        is_ambiguous: false,
                    },
                    HashMap::new(),
                )
            };

        let mut warnings: Vec<String> = Vec::new();
        if update_result.is_ambiguous {
            warnings.push(format!(
                "'{old_name}' resolves to more than one note in the vault; only {} was renamed",
                old_path.display()
            ));
        }
        for failed in &update_result.failed_files {
            warnings.push(format!("could not read {} while scanning for links", failed.display()));
        }

        let txn = TransactionManager::new(self.vault_path.clone(), WALManager::new(self.wal.wal_dir().to_path_buf()));
        let mut manifest = txn
            .plan(&old_path, &new_path, &rewrites, correlation_id, cancel.as_ref())
            .await
            .map_err(fail)?;

        let prepare_started = Instant::now();
        let wal_path = txn
            .prepare(&mut manifest, &rewrites, cancel.as_ref())
            .await
            .map_err(fail)?;
        let prepare_ms = prepare_started.elapsed().as_millis() as u64;

        if cancel.as_ref().is_some_and(CancellationToken::is_cancelled) {
            txn.rollback(&mut manifest, &wal_path).await.map_err(fail)?;
            return Err(fail(RenameError::TransactionFailed {
                phase: "commit".to_string(),
                reason: "cancelled before commit started".to_string(),
            }));
        }

        let commit_started = Instant::now();
        match txn.commit(&mut manifest, &wal_path).await {
            Ok(()) => {
                txn.cleanup(&manifest, &wal_path).await;
            }
            Err(e) => return Err(fail(e)),
        }
        let commit_ms = commit_started.elapsed().as_millis() as u64;

        self.cache.invalidate_all().await;

        let total_ms = started.elapsed().as_millis() as u64;
        let output = RenameOutput {
            correlation_id,
            old_path,
            new_path,
            links_updated: update_result.updated_count,
            references_found: update_result.total_references,
            duration_ms: total_ms,
            metrics: RenameMetrics {
                scan_ms: update_result.scan_time_ms,
                prepare_ms,
                commit_ms,
                total_ms,
            },
            warnings,
        };

        self.idempotency
            .lock()
            .await
            .insert(correlation_id, output.clone());

        tracing::info!(
            %correlation_id,
            links_updated = output.links_updated,
            duration_ms = output.duration_ms,
            "rename committed"
        );

        Ok(output)
    }
}

fn normalize_within_vault(vault_path: &std::path::Path, path: &std::path::Path) -> Result<PathBuf, RenameError> {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        vault_path.join(path)
    };
    if !joined.starts_with(vault_path) {
        return Err(RenameError::InvalidInput {
            reason: format!("{} is outside the vault", joined.display()),
        });
    }
    if joined.extension().and_then(|e| e.to_str()) != Some("md") {
        return Err(RenameError::InvalidInput {
            reason: format!("{} must have a .md extension", joined.display()),
        });
    }
    Ok(joined)
}

fn note_stem(path: &std::path::Path) -> Result<String, RenameError> {
    path.file_stem()
        .and_then(|s| s.to_str())
        .map(|s| s.to_string())
        .ok_or_else(|| RenameError::InvalidInput {
            reason: format!("{} has no file stem", path.display()),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config_for(dir: &TempDir) -> EngineConfig {
        EngineConfig {
            vault_path: dir.path().to_path_buf(),
            wal_dir: dir.path().join(".wal"),
            quiescence_secs: 60,
            cache_ttl_secs: 0,
        }
    }

    #[tokio::test]
    async fn renames_note_and_updates_referencer() {
        let dir = TempDir::new().unwrap();
        tokio::fs::write(dir.path().join("source.md"), "# Source").await.unwrap();
        tokio::fs::write(dir.path().join("ref.md"), "[[source]]").await.unwrap();

        let coordinator = RenameCoordinator::new(&config_for(&dir));
        let output = coordinator
            .rename_note(RenameInput {
                old_path: PathBuf::from("source.md"),
                new_path: PathBuf::from("target.md"),
                update_links: true,
                case_sensitive: false,
                correlation_id: None,
                cancellation: None,
            })
            .await
            .unwrap();

        assert_eq!(output.links_updated, 1);
        assert!(dir.path().join("target.md").exists());
        assert!(!dir.path().join("source.md").exists());
        assert_eq!(
            tokio::fs::read_to_string(dir.path().join("ref.md")).await.unwrap(),
            "[[target]]"
        );
    }

    #[tokio::test]
    async fn repeated_correlation_id_returns_cached_result() {
        let dir = TempDir::new().unwrap();
        tokio::fs::write(dir.path().join("source.md"), "# Source").await.unwrap();

        let coordinator = RenameCoordinator::new(&config_for(&dir));
        let correlation_id = Uuid::new_v4();
        let input = RenameInput {
            old_path: PathBuf::from("source.md"),
            new_path: PathBuf::from("target.md"),
            update_links: false,
            case_sensitive: false,
            correlation_id: Some(correlation_id),
            cancellation: None,
        };

        let first = coordinator.rename_note(input.clone()).await.unwrap();
        let second = coordinator.rename_note(input).await.unwrap();

        assert_eq!(first.correlation_id, second.correlation_id);
        assert_eq!(second.new_path, dir.path().join("target.md"));
    }

    #[tokio::test]
    async fn ambiguous_target_surfaces_a_warning() {
        let dir = TempDir::new().unwrap();
        tokio::fs::create_dir(dir.path().join("a")).await.unwrap();
        tokio::fs::create_dir(dir.path().join("b")).await.unwrap();
        tokio::fs::write(dir.path().join("a/duplicate.md"), "A").await.unwrap();
        tokio::fs::write(dir.path().join("b/duplicate.md"), "B").await.unwrap();
        tokio::fs::write(dir.path().join("ref.md"), "[[duplicate]]").await.unwrap();

        let coordinator = RenameCoordinator::new(&config_for(&dir));
        let output = coordinator
            .rename_note(RenameInput {
                old_path: PathBuf::from("a/duplicate.md"),
                new_path: PathBuf::from("a/renamed.md"),
                update_links: true,
                case_sensitive: false,
                correlation_id: None,
                cancellation: None,
            })
            .await
            .unwrap();

        assert!(dir.path().join("a/renamed.md").exists());
        assert!(!output.warnings.is_empty());
        assert!(output.warnings[0].contains("more than one note"));
    }

    #[tokio::test]
    async fn rejects_non_md_destination() {
        let dir = TempDir::new().unwrap();
        tokio::fs::write(dir.path().join("source.md"), "# Source").await.unwrap();

        let coordinator = RenameCoordinator::new(&config_for(&dir));
        let result = coordinator
            .rename_note(RenameInput {
                old_path: PathBuf::from("source.md"),
                new_path: PathBuf::from("target.txt"),
                update_links: false,
                case_sensitive: false,
                correlation_id: None,
                cancellation: None,
            })
            .await;

        assert!(matches!(result, Err(RenameFailure { error: RenameError::InvalidInput { .. }, .. })));
    }

    #[tokio::test]
    async fn failure_carries_the_correlation_id_back_to_the_caller() {
        let dir = TempDir::new().unwrap();
        tokio::fs::write(dir.path().join("source.md"), "# Source").await.unwrap();

        let coordinator = RenameCoordinator::new(&config_for(&dir));
        let correlation_id = Uuid::new_v4();
        let result = coordinator
            .rename_note(RenameInput {
                old_path: PathBuf::from("source.md"),
                new_path: PathBuf::from("target.txt"),
                update_links: false,
                case_sensitive: false,
                correlation_id: Some(correlation_id),
                cancellation: None,
            })
            .await;

        let failure = result.unwrap_err();
        assert_eq!(failure.correlation_id, correlation_id);
        assert!(matches!(failure.error, RenameError::InvalidInput { .. }));
    }

    #[tokio::test]
    async fn case_sensitive_input_only_renames_the_exact_case_referencer() {
        let dir = TempDir::new().unwrap();
        tokio::fs::write(dir.path().join("source.md"), "# Source").await.unwrap();
        tokio::fs::write(dir.path().join("ref-upper.md"), "[[SOURCE]]").await.unwrap();
        tokio::fs::write(dir.path().join("ref-lower.md"), "[[source]]").await.unwrap();

        let coordinator = RenameCoordinator::new(&config_for(&dir));
        let output = coordinator
            .rename_note(RenameInput {
                old_path: PathBuf::from("source.md"),
                new_path: PathBuf::from("target.md"),
                update_links: true,
                case_sensitive: true,
                correlation_id: None,
                cancellation: None,
            })
            .await
            .unwrap();

        assert_eq!(output.links_updated, 1);
        assert_eq!(
            tokio::fs::read_to_string(dir.path().join("ref-upper.md")).await.unwrap(),
            "[[SOURCE]]"
        );
        assert_eq!(
            tokio::fs::read_to_string(dir.path().join("ref-lower.md")).await.unwrap(),
            "[[target]]"
        );
    }

    #[tokio::test]
    async fn cancellation_before_commit_aborts_and_leaves_the_vault_untouched() {
        let dir = TempDir::new().unwrap();
        tokio::fs::write(dir.path().join("source.md"), "# Source").await.unwrap();
        tokio::fs::write(dir.path().join("ref.md"), "[[source]]").await.unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();

        let coordinator = RenameCoordinator::new(&config_for(&dir));
        let result = coordinator
            .rename_note(RenameInput {
                old_path: PathBuf::from("source.md"),
                new_path: PathBuf::from("target.md"),
                update_links: true,
                case_sensitive: false,
                correlation_id: None,
                cancellation: Some(cancel),
            })
            .await;

        assert!(matches!(result, Err(RenameFailure { error: RenameError::TransactionFailed { .. }, .. })));
        assert!(dir.path().join("source.md").exists());
        assert!(!dir.path().join("target.md").exists());
        assert_eq!(
            tokio::fs::read_to_string(dir.path().join("ref.md")).await.unwrap(),
            "[[source]]"
        );
    }
}
