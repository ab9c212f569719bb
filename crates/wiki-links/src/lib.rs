//! Parser for Obsidian-style wiki links.
//!
//! Supports:
//! - Basic links: `[[Note]]`
//! - Aliases: `[[Note|Display Text]]`
//! - Headers: `[[Note#Header]]`
//! - Block references: `[[Note#^block-id]]`
//! - Embeds: `![[Note]]`
//! - Paths: `[[folder/Note]]`
//!
//! The grammar is defined exactly once, as a single compiled [`regex::Regex`],
//! so every caller (a vault-wide scan, a single-file rewrite) sees identical
//! matching behavior. There is no second, hand-rolled parser anywhere else in
//! this crate or its consumers.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// A wiki link found in markdown content, with byte offsets into the source.
///
/// Offsets are byte indices (not codepoint or line-relative), matching
/// `str`'s own indexing so callers can slice the original content directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WikiLink {
    /// The raw target text exactly as written, e.g. "folder/Note" or "Note.md"
    pub target: String,
    /// Header reference if present: "Header Section"
    pub header: Option<String>,
    /// Block ID if present: "block-123"
    pub block_id: Option<String>,
    /// Display alias if present: "my custom text"
    pub alias: Option<String>,
    /// Whether this is an embed (`![[...]]`)
    pub is_embed: bool,
    /// Byte offset of the first character of the match (the `!` if embed, else `[`)
    pub start: usize,
    /// Byte offset one past the closing `]]`
    pub end: usize,
    /// Byte range of the target capture within the source, for in-place rewrites
    pub target_range: (usize, usize),
}

impl WikiLink {
    /// Split the target into (parent, name, extension), the way `Path::parent`,
    /// `Path::file_stem`, and `Path::extension` would.
    pub fn target_parts(&self) -> (Option<&str>, &str, Option<&str>) {
        split_target(&self.target)
    }

    /// Just the note name this link targets, ignoring any folder prefix or extension.
    pub fn name(&self) -> &str {
        self.target_parts().1
    }

    /// Returns alias if present, otherwise the target name.
    pub fn display_name(&self) -> &str {
        self.alias.as_deref().unwrap_or_else(|| self.name())
    }
}

/// Split a wikilink target string into (parent, name, extension).
pub fn split_target(target: &str) -> (Option<&str>, &str, Option<&str>) {
    let target = target.trim();

    let (parent, file_name) = match target.rfind('/') {
        Some(slash_pos) => (Some(&target[..slash_pos]), &target[slash_pos + 1..]),
        None => (None, target),
    };

    let (name, extension) = match file_name.rfind('.') {
        Some(dot_pos) if dot_pos > 0 => (&file_name[..dot_pos], Some(&file_name[dot_pos + 1..])),
        _ => (file_name, None),
    };

    (parent, name, extension)
}

/// The single compiled wikilink pattern shared by every scanner and updater
/// in this workspace (the grammar is defined exactly once).
///
/// Named groups: `embed`, `target`, `block`, `header`, `alias`. `block` and
/// `header` are mutually exclusive per the canonical wire format (`#^id` vs
/// `#Heading`); `alias`, when present, always follows the final `|`.
///
/// `target` only excludes `|`, `#`, and the two-character sequence `]]` --
/// not a bare `]` -- per the grammar. The `regex` crate has no lookahead, so
/// this is built from an alternation (`\][^\]]`) that swallows a lone `]`
/// together with the character after it instead of asserting on it.
fn wikilink_regex() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"(?P<embed>!)?\[\[(?P<target>(?:[^|#\]]|\][^\]])+)(?:#\^(?P<block>[^|\]]+)|#(?P<header>[^|\]]+))?(?:\|(?P<alias>[^\]]+))?\]\]",
        )
        .expect("wikilink pattern is a static, well-formed regex")
    })
}

/// Parse all wiki links from markdown content, in source order.
///
/// This does not know about code fences or frontmatter; callers that need to
/// exclude those regions (as a vault rename does) filter the returned links
/// by byte offset against ranges from [`code_fence_ranges`] or
/// `obsidian_fs::frontmatter_byte_range`.
pub fn parse_wiki_links(content: &str) -> Vec<WikiLink> {
    wikilink_regex()
        .captures_iter(content)
        .map(|caps| {
            let whole = caps.get(0).expect("group 0 always matches");
            let target = caps.name("target").expect("target is a required group");
            WikiLink {
                target: target.as_str().to_string(),
                header: caps.name("header").map(|m| m.as_str().to_string()),
                block_id: caps.name("block").map(|m| m.as_str().to_string()),
                alias: caps.name("alias").map(|m| m.as_str().to_string()),
                is_embed: caps.name("embed").is_some(),
                start: whole.start(),
                end: whole.end(),
                target_range: (target.start(), target.end()),
            }
        })
        .collect()
}

/// A byte range, inclusive of fence delimiter lines, that scanners and
/// updaters must skip when excluding code blocks.
///
/// Recognizes fenced code blocks opened with three or more backticks or
/// tildes on their own line (up to 3 leading spaces, per CommonMark), closed
/// by a fence of the same character and at least the same length, also on
/// its own line. An unterminated fence runs to the end of the file, matching
/// how Markdown renderers treat it.
pub fn code_fence_ranges(content: &str) -> Vec<(usize, usize)> {
    let mut ranges = Vec::new();
    let mut open: Option<(usize, char, usize)> = None; // (start_offset, fence_char, fence_len)
    let mut offset = 0;

    for line in content.split_inclusive('\n') {
        let trimmed = line.trim_end_matches(['\n', '\r']);
        let fence = fence_marker(trimmed);

        match (&open, fence) {
            (None, Some((ch, len))) => {
                open = Some((offset, ch, len));
            }
            (Some((_, open_ch, open_len)), Some((ch, len)))
                if ch == *open_ch && len >= *open_len =>
            {
                let (start, _, _) = open.take().unwrap();
                ranges.push((start, offset + line.len()));
            }
            _ => {}
        }

        offset += line.len();
    }

    if let Some((start, _, _)) = open {
        ranges.push((start, content.len()));
    }

    ranges
}

/// If `line` (already stripped of its trailing newline) is a fence delimiter
/// on its own, returns the fence character and run length.
fn fence_marker(line: &str) -> Option<(char, usize)> {
    let trimmed = line.trim_start_matches(' ');
    if line.len() - trimmed.len() > 3 {
        return None;
    }
    let ch = trimmed.chars().next()?;
    if ch != '`' && ch != '~' {
        return None;
    }
    let run_len = trimmed.chars().take_while(|&c| c == ch).count();
    if run_len < 3 {
        return None;
    }
    let rest = &trimmed[run_len..];
    if ch == '`' && rest.contains('`') {
        // backtick fences can't carry a backtick in their info string
        return None;
    }
    Some((ch, run_len))
}

/// Returns true if `offset` falls inside any of `ranges` (half-open `[start, end)`).
pub fn in_ranges(offset: usize, ranges: &[(usize, usize)]) -> bool {
    ranges
        .iter()
        .any(|&(start, end)| offset >= start && offset < end)
}

/// Extract all unique note names from wiki links in content.
pub fn extract_linked_notes(content: &str) -> Vec<String> {
    let links = parse_wiki_links(content);
    let mut seen = std::collections::HashSet::new();
    let mut result = Vec::new();

    for link in links {
        let name = link.name().to_string();
        if seen.insert(name.clone()) {
            result.push(name);
        }
    }

    result
}
