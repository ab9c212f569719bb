//! LinkScanner: scans the vault for references to a target note name.

use crate::cache::NoteCache;
use crate::error::RenameError;
use obsidian_fs::frontmatter_byte_range;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use wiki_links::{code_fence_ranges, in_ranges, parse_wiki_links};

#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub case_sensitive: bool,
    pub include_embeds: bool,
    pub skip_code_blocks: bool,
    pub skip_frontmatter: bool,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            case_sensitive: false,
            include_embeds: true,
            skip_code_blocks: true,
            skip_frontmatter: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reference {
    pub source_path: PathBuf,
    pub source_note: String,
    pub target_note: String,
    pub link_text: String,
    pub line: usize,
    pub column: usize,
    pub alias: Option<String>,
    pub heading: Option<String>,
    pub block: Option<String>,
    pub is_embed: bool,
    pub is_ambiguous: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanResult {
    pub target_note: String,
    pub total_references: usize,
    pub scanned_notes: usize,
    pub references: Vec<Reference>,
    pub scan_time_ms: u64,
    pub used_cache: bool,
}

pub struct LinkScanner {
    cache: Arc<dyn NoteCache>,
}

impl LinkScanner {
    pub fn new(cache: Arc<dyn NoteCache>) -> Self {
        Self { cache }
    }

    pub async fn scan_vault(
        &self,
        target_name: &str,
        options: &ScanOptions,
    ) -> Result<ScanResult, RenameError> {
        validate_target_name(target_name)?;

        let started = Instant::now();
        let notes = self.cache.get_all().await?;

        let normalized_target = normalize_key(target_name, options.case_sensitive);
        let is_ambiguous = count_matching_stems(&notes, &normalized_target, options.case_sensitive) > 1;

        let mut references = Vec::new();

        for note in &notes {
            let source_note = note_stem(&note.path);
            let content = &note.bytes;

            let mut excluded: Vec<(usize, usize)> = Vec::new();
            if options.skip_code_blocks {
                excluded.extend(code_fence_ranges(content));
            }
            if options.skip_frontmatter {
                if let Some(range) = frontmatter_byte_range(content) {
                    excluded.push(range);
                }
            }

            for link in parse_wiki_links(content) {
                if link.is_embed && !options.include_embeds {
                    continue;
                }
                if in_ranges(link.start, &excluded) {
                    continue;
                }
                if normalize_key(link.name(), options.case_sensitive) != normalized_target {
                    continue;
                }

                let (line, column) = line_column_at(content, link.start);

                references.push(Reference {
                    source_path: note.path.clone(),
                    source_note: source_note.clone(),
                    target_note: target_name.to_string(),
                    link_text: content[link.start..link.end].to_string(),
                    line,
                    column,
                    alias: link.alias.clone(),
                    heading: link.header.clone(),
                    block: link.block_id.clone(),
                    is_embed: link.is_embed,
                    is_ambiguous,
                });
            }
        }

        Ok(ScanResult {
            target_note: target_name.to_string(),
            total_references: references.len(),
            scanned_notes: notes.len(),
            references,
            scan_time_ms: started.elapsed().as_millis() as u64,
            used_cache: true,
        })
    }
}

fn validate_target_name(target_name: &str) -> Result<(), RenameError> {
    if target_name.trim().is_empty() {
        return Err(RenameError::InvalidInput {
            reason: "target name must not be empty".to_string(),
        });
    }
    if target_name.chars().any(|c| matches!(c, '#' | '|' | '[' | ']')) {
        return Err(RenameError::InvalidInput {
            reason: format!(
                "target name '{target_name}' contains reserved wikilink characters"
            ),
        });
    }
    Ok(())
}

fn count_matching_stems(
    notes: &[crate::cache::CachedNote],
    normalized_target: &str,
    case_sensitive: bool,
) -> usize {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for note in notes {
        let key = normalize_key(&note_stem(&note.path), case_sensitive);
        *counts.entry(key).or_insert(0) += 1;
    }
    counts.get(normalized_target).copied().unwrap_or(0)
}

fn normalize_key(name: &str, case_sensitive: bool) -> String {
    if case_sensitive {
        name.to_string()
    } else {
        name.to_lowercase()
    }
}

fn note_stem(path: &std::path::Path) -> String {
    path.file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_string()
}

/// 1-based line and column (UTF-8 code-point boundaries) of `offset` within `content`.
fn line_column_at(content: &str, offset: usize) -> (usize, usize) {
    let mut line = 1usize;
    let mut col = 1usize;
    for ch in content[..offset].chars() {
        if ch == '\n' {
            line += 1;
            col = 1;
        } else {
            col += 1;
        }
    }
    (line, col)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::FsNoteCache;
    use std::time::Duration;
    use tempfile::TempDir;

    async fn scanner_over(dir: &TempDir) -> LinkScanner {
        let cache = Arc::new(FsNoteCache::new(dir.path().to_path_buf(), Duration::from_secs(60)));
        LinkScanner::new(cache)
    }

    #[tokio::test]
    async fn finds_basic_reference() {
        let dir = TempDir::new().unwrap();
        tokio::fs::write(dir.path().join("source.md"), "# S").await.unwrap();
        tokio::fs::write(dir.path().join("ref.md"), "See [[source]].").await.unwrap();

        let scanner = scanner_over(&dir).await;
        let result = scanner
            .scan_vault("source", &ScanOptions::default())
            .await
            .unwrap();

        assert_eq!(result.total_references, 1);
        assert_eq!(result.references[0].source_note, "ref");
        assert!(!result.references[0].is_ambiguous);
    }

    #[tokio::test]
    async fn excludes_code_fenced_references() {
        let dir = TempDir::new().unwrap();
        tokio::fs::write(
            dir.path().join("ref.md"),
            "[[src]] outside\n```\n[[src]] inside\n```\n",
        )
        .await
        .unwrap();

        let scanner = scanner_over(&dir).await;
        let result = scanner.scan_vault("src", &ScanOptions::default()).await.unwrap();

        assert_eq!(result.total_references, 1);
        assert_eq!(result.references[0].line, 1);
    }

    #[tokio::test]
    async fn scans_frontmatter_by_default() {
        let dir = TempDir::new().unwrap();
        tokio::fs::write(
            dir.path().join("ref.md"),
            "---\nrelated: [[src]]\n---\nbody",
        )
        .await
        .unwrap();

        let scanner = scanner_over(&dir).await;
        let result = scanner.scan_vault("src", &ScanOptions::default()).await.unwrap();

        assert_eq!(result.total_references, 1);
    }

    #[tokio::test]
    async fn marks_ambiguous_targets() {
        let dir = TempDir::new().unwrap();
        tokio::fs::create_dir(dir.path().join("a")).await.unwrap();
        tokio::fs::create_dir(dir.path().join("b")).await.unwrap();
        tokio::fs::write(dir.path().join("a/duplicate.md"), "A").await.unwrap();
        tokio::fs::write(dir.path().join("b/duplicate.md"), "B").await.unwrap();
        tokio::fs::write(dir.path().join("ref.md"), "[[duplicate]]").await.unwrap();

        let scanner = scanner_over(&dir).await;
        let result = scanner
            .scan_vault("duplicate", &ScanOptions::default())
            .await
            .unwrap();

        assert!(result.references[0].is_ambiguous);
    }

    #[tokio::test]
    async fn rejects_empty_target() {
        let dir = TempDir::new().unwrap();
        let scanner = scanner_over(&dir).await;
        let result = scanner.scan_vault("", &ScanOptions::default()).await;
        assert!(matches!(result, Err(RenameError::InvalidInput { .. })));
    }

    #[tokio::test]
    async fn rejects_reserved_characters() {
        let dir = TempDir::new().unwrap();
        let scanner = scanner_over(&dir).await;
        let result = scanner.scan_vault("foo#bar", &ScanOptions::default()).await;
        assert!(matches!(result, Err(RenameError::InvalidInput { .. })));
    }

    #[tokio::test]
    async fn embed_only_reference_is_found() {
        let dir = TempDir::new().unwrap();
        tokio::fs::write(dir.path().join("self.md"), "![[self]]").await.unwrap();

        let scanner = scanner_over(&dir).await;
        let result = scanner.scan_vault("self", &ScanOptions::default()).await.unwrap();

        assert_eq!(result.total_references, 1);
        assert!(result.references[0].is_embed);
    }
}
