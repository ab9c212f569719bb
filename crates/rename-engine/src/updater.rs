//! LinkUpdater: rewrites wikilink targets while preserving everything else
//! byte-for-byte (aliases, headings, block refs, embed markers, frontmatter
//! structure).

use crate::cache::NoteCache;
use crate::error::RenameError;
use crate::scanner::{LinkScanner, ScanOptions};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use wiki_links::{code_fence_ranges, in_ranges, parse_wiki_links};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateResult {
    pub updated_count: usize,
    pub total_references: usize,
    pub failed_files: Vec<PathBuf>,
    pub scan_time_ms: u64,
    pub update_time_ms: u64,
    /// True when the target name resolved to more than one note in the
    /// vault (spec §3 "ambiguous target"); the rename still proceeds, but
    /// `RenameCoordinator` surfaces this as a warning.
    pub is_ambiguous: bool,
}

/// A staged rewrite for one file: its original bytes, the rewritten bytes,
/// and how many wikilink targets changed.
#[derive(Debug, Clone)]
pub struct Rewrite {
    pub original: String,
    pub updated: String,
    pub replacements: usize,
}

pub struct LinkUpdater {
    cache: Arc<dyn NoteCache>,
}

impl LinkUpdater {
    pub fn new(cache: Arc<dyn NoteCache>) -> Self {
        Self { cache }
    }

    /// Rewrite every wikilink in `content` whose target name equals `old_name`
    /// to target `new_name` instead. Only the target capture is replaced;
    /// everything else -- alias, heading, block id, embed marker, and all
    /// surrounding bytes -- passes through unchanged.
    ///
    /// Name comparison is case-insensitive unless `case_sensitive` is set,
    /// matching `ScanOptions.case_sensitive` (spec §4.7's `rename_note`
    /// input defaults this to `false`).
    ///
    /// Occurrences inside fenced code blocks are never rewritten (I6); this
    /// mirrors `LinkScanner`'s own `skip_code_blocks` default rather than
    /// taking it as a parameter, since updating a link the scanner would
    /// never have reported as a reference would violate I4/I6 together.
    pub fn update_note_links(
        content: &str,
        old_name: &str,
        new_name: &str,
        case_sensitive: bool,
    ) -> (String, usize) {
        let old_key = normalize_key(old_name, case_sensitive);
        let fences = code_fence_ranges(content);
        let mut result = String::with_capacity(content.len());
        let mut cursor = 0;
        let mut replacements = 0;

        for link in parse_wiki_links(content) {
            if normalize_key(link.name(), case_sensitive) != old_key {
                continue;
            }
            if in_ranges(link.start, &fences) {
                continue;
            }

            let (target_start, target_end) = link.target_range;
            result.push_str(&content[cursor..target_start]);
            result.push_str(new_name);
            cursor = target_end;
            replacements += 1;
        }

        result.push_str(&content[cursor..]);
        (result, replacements)
    }

    /// Scan the vault for references to `old_name`, then compute (but do not
    /// write) the rewritten content for every file that has at least one.
    /// Callers that need a transactional rename stage these rewrites into a
    /// `Manifest` instead of writing them directly.
    pub async fn update_vault(
        &self,
        old_name: &str,
        new_name: &str,
        case_sensitive: bool,
    ) -> Result<(UpdateResult, HashMap<PathBuf, Rewrite>), RenameError> {
        let started = Instant::now();
        let scanner = LinkScanner::new(Arc::clone(&self.cache));
        let options = ScanOptions {
            case_sensitive,
            skip_frontmatter: false,
            ..ScanOptions::default()
        };
        let scan = scanner.scan_vault(old_name, &options).await?;
        let scan_time_ms = scan.scan_time_ms;
        let is_ambiguous = scan.references.iter().any(|r| r.is_ambiguous);

        let mut files: Vec<PathBuf> = scan
            .references
            .iter()
            .map(|r| r.source_path.clone())
            .collect();
        files.sort();
        files.dedup();

        let mut rewrites = HashMap::new();
        let mut failed_files = Vec::new();

        for path in files {
            match tokio::fs::read_to_string(&path).await {
                Ok(original) => {
                    let (updated, replacements) =
                        Self::update_note_links(&original, old_name, new_name, case_sensitive);
                    if replacements > 0 {
                        rewrites.insert(
                            path,
                            Rewrite {
                                original,
                                updated,
                                replacements,
                            },
                        );
                    }
                }
                Err(_) => failed_files.push(path),
            }
        }

        let result = UpdateResult {
            updated_count: rewrites.len(),
            total_references: scan.total_references,
            failed_files,
            scan_time_ms,
            update_time_ms: started.elapsed().as_millis() as u64,
            is_ambiguous,
        };

        Ok((result, rewrites))
    }
}

fn normalize_key(name: &str, case_sensitive: bool) -> String {
    if case_sensitive {
        name.to_string()
    } else {
        name.to_lowercase()
    }
}
