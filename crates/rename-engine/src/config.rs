//! Configuration loading for the rename engine.
//!
//! Mirrors the prior MCP server's `Config::from_env()`: one required
//! environment variable for the vault root (tilde-expanded), and a handful of
//! tunables with sane defaults. No process-wide singleton — `EngineConfig` is
//! constructed once and passed explicitly into `RenameCoordinator`.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} is not set")]
    MissingEnv(&'static str),
    #[error("{0} is not a valid integer: {1}")]
    InvalidInt(&'static str, std::num::ParseIntError),
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Absolute vault root. All note paths are resolved relative to it.
    pub vault_path: PathBuf,
    /// Directory holding WAL files, one per in-flight transaction.
    pub wal_dir: PathBuf,
    /// Minimum age a WAL must reach before boot recovery treats it as orphaned.
    pub quiescence_secs: u64,
    /// TTL for the default filesystem-backed NoteCache.
    pub cache_ttl_secs: u64,
}

impl EngineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let vault_path = expand_tilde(&env_var_required("VAULT_RENAME_VAULT_PATH")?);

        let wal_dir = match std::env::var("VAULT_RENAME_WAL_DIR") {
            Ok(raw) => expand_tilde(&raw),
            Err(_) => vault_path.join(".rename-wal"),
        };

        let quiescence_secs = env_var_or_default("VAULT_RENAME_QUIESCENCE_SECS", 60)?;
        let cache_ttl_secs = env_var_or_default("VAULT_RENAME_CACHE_TTL_SECS", 5)?;

        Ok(Self {
            vault_path,
            wal_dir,
            quiescence_secs,
            cache_ttl_secs,
        })
    }
}

fn env_var_required(name: &'static str) -> Result<String, ConfigError> {
    std::env::var(name).map_err(|_| ConfigError::MissingEnv(name))
}

fn env_var_or_default(name: &'static str, default: u64) -> Result<u64, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw.parse().map_err(|e| ConfigError::InvalidInt(name, e)),
        Err(_) => Ok(default),
    }
}

fn expand_tilde(raw: &str) -> PathBuf {
    if let Some(rest) = raw.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expand_tilde_leaves_absolute_paths_alone() {
        assert_eq!(expand_tilde("/vault"), PathBuf::from("/vault"));
    }

    #[test]
    fn expand_tilde_joins_home_dir() {
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_tilde("~/vault"), home.join("vault"));
        }
    }
}
