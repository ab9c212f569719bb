//! Path resolution and frontmatter parsing utilities for Obsidian-style vaults.
//!
//! These are pure functions with no I/O beyond the single vault-root-join
//! helper; the rename engine's transaction manager is responsible for the
//! actual filesystem calls.

mod frontmatter;

pub use frontmatter::{
    frontmatter_byte_range, parse_frontmatter, split_frontmatter, Frontmatter, ParsedNote,
};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// A normalized note reference
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoteRef {
    /// The path without extension: "knowledge/Note"
    pub path: String,
    /// Just the note name: "Note"
    pub name: String,
}

/// Normalize a note reference (strip `[[brackets]]` and a `.md` extension).
///
/// Accepts:
/// - Plain name: "Note"
/// - Path: "knowledge/Note"
/// - Wiki link: "[[knowledge/Note]]"
/// - With .md: "knowledge/Note.md"
pub fn normalize_note_reference(note_ref: &str) -> NoteRef {
    let mut normalized = note_ref.trim();

    if normalized.starts_with("[[") && normalized.ends_with("]]") && normalized.len() >= 4 {
        normalized = &normalized[2..normalized.len() - 2];
    }

    let path = normalized
        .strip_suffix(".md")
        .unwrap_or(normalized);

    let name = path.rsplit('/').next().unwrap_or(path).to_string();

    NoteRef {
        path: path.to_string(),
        name,
    }
}

/// Validate that a relative path is safe (no directory traversal).
pub fn validate_relative_path(path: &str) -> Result<String, PathValidationError> {
    let clean_path = path.strip_prefix('/').unwrap_or(path);

    if clean_path.split('/').any(|segment| segment == "..") {
        return Err(PathValidationError::DirectoryTraversal);
    }

    if clean_path.starts_with('/') {
        return Err(PathValidationError::AbsolutePath);
    }

    Ok(clean_path.to_string())
}

/// Ensure .md extension on note paths
pub fn ensure_markdown_extension(note_path: &str) -> String {
    if note_path.ends_with(".md") {
        note_path.to_string()
    } else {
        format!("{}.md", note_path)
    }
}

/// Join a caller-supplied relative note path onto a vault root, rejecting any
/// path that would resolve outside the vault (spec: "the engine rejects
/// traversal outside the vault").
///
/// Unlike [`validate_relative_path`], this also rejects absolute paths
/// outright (an absolute path naming a location outside the vault is not a
/// "leading slash to strip", it is a different location entirely).
pub fn resolve_within_vault(vault_path: &Path, relative: &str) -> Result<PathBuf, PathValidationError> {
    if Path::new(relative).is_absolute() {
        return Err(PathValidationError::AbsolutePath);
    }
    let clean = validate_relative_path(relative)?;
    Ok(vault_path.join(clean))
}

#[derive(Debug, Clone, PartialEq)]
pub enum PathValidationError {
    DirectoryTraversal,
    AbsolutePath,
}

impl std::fmt::Display for PathValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PathValidationError::DirectoryTraversal => {
                write!(f, "Path contains directory traversal")
            }
            PathValidationError::AbsolutePath => write!(f, "Path is absolute"),
        }
    }
}

impl std::error::Error for PathValidationError {}
