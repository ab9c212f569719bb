//! BootRecovery: rolls back orphaned transactions left behind by a crash
//! (spec §4.8). Runs once at startup and never aborts the boot sequence --
//! failures are logged and counted, not propagated.

use crate::transaction::TransactionManager;
use crate::wal::WALManager;
use std::time::Duration;

#[derive(Debug, Default, Clone, Copy)]
pub struct RecoveryReport {
    pub recovered: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Scan `wal_dir` for every WAL entry and roll back the ones older than
/// `quiescence`. A WAL younger than the quiescence window is assumed to
/// belong to a transaction that is still legitimately in flight (another
/// live process may own it) and is left alone, counted as `skipped` rather
/// than silently dropped.
pub async fn recover_pending(wal_dir: std::path::PathBuf, quiescence_secs: u64) -> RecoveryReport {
    let wal_manager = WALManager::new(wal_dir);
    let mut report = RecoveryReport::default();
    let quiescence = Duration::from_secs(quiescence_secs);

    let all = match wal_manager.scan_all().await {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!(error = %e, "failed to scan WAL directory during boot recovery");
            return report;
        }
    };

    let (pending, young): (Vec<_>, Vec<_>) = all.into_iter().partition(|entry| entry.age >= quiescence);

    for entry in &young {
        tracing::info!(
            correlation_id = %entry.manifest.correlation_id,
            wal_path = %entry.path.display(),
            age_secs = entry.age.as_secs(),
            "WAL younger than quiescence window, leaving for a still-live process"
        );
    }
    report.skipped = young.len();

    for mut entry in pending {
        let vault_path = entry.manifest.vault_path.clone();
        let txn = TransactionManager::new(vault_path, WALManager::new(wal_manager.wal_dir().to_path_buf()));

        match txn.rollback(&mut entry.manifest, &entry.path).await {
            Ok(()) => {
                tracing::info!(
                    correlation_id = %entry.manifest.correlation_id,
                    wal_path = %entry.path.display(),
                    "recovered orphaned transaction"
                );
                report.recovered += 1;
            }
            Err(e) => {
                tracing::error!(
                    correlation_id = %entry.manifest.correlation_id,
                    wal_path = %entry.path.display(),
                    error = %e,
                    "failed to recover orphaned transaction, leaving WAL in place"
                );
                report.failed += 1;
            }
        }
    }

    report
}
