//! YAML frontmatter parsing for Obsidian notes
//!
//! Parses the YAML frontmatter block at the start of markdown files:
//! ```markdown
//! ---
//! title: My Note
//! tags: [rust, wasm]
//! ---
//!
//! Note content here...
//! ```

use serde_json::Value as JsonValue;
use std::collections::HashMap;

/// Parsed frontmatter as a map of string keys to JSON values.
/// Using JSON values allows flexible typing (strings, numbers, arrays, objects).
pub type Frontmatter = HashMap<String, JsonValue>;

/// A parsed note with frontmatter separated from content.
///
/// The `content` field borrows from `raw` to avoid unnecessary allocation.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedNote<'a> {
    /// The frontmatter key-value pairs, if present
    pub frontmatter: Option<Frontmatter>,
    /// The note content after the frontmatter (borrows from raw)
    pub content: &'a str,
    /// The raw file content (frontmatter + content)
    pub raw: &'a str,
}

/// Split a note into frontmatter YAML string and content, without parsing the YAML.
///
/// Returns (frontmatter_yaml, content) where frontmatter_yaml is None if
/// no valid frontmatter block was found.
pub fn split_frontmatter(raw: &str) -> (Option<&str>, &str) {
    // Frontmatter must start at the very beginning with ---
    if !raw.starts_with("---") {
        return (None, raw);
    }

    // Find the closing ---
    let after_opening = &raw[3..];

    // Skip the newline after opening ---
    let content_start = if after_opening.starts_with('\n') {
        &after_opening[1..]
    } else if after_opening.starts_with("\r\n") {
        &after_opening[2..]
    } else {
        // No newline after opening --- means invalid frontmatter
        return (None, raw);
    };

    // Find closing --- (must be at start of line)
    if let Some(close_pos) = find_closing_delimiter(content_start) {
        let yaml = &content_start[..close_pos];
        let after_close = &content_start[close_pos + 3..];

        // Skip newline after closing ---
        let content = if after_close.starts_with('\n') {
            &after_close[1..]
        } else if after_close.starts_with("\r\n") {
            &after_close[2..]
        } else {
            after_close
        };

        (Some(yaml), content)
    } else {
        // No closing delimiter found
        (None, raw)
    }
}

/// Byte range of the frontmatter block within `raw`, delimiters included.
///
/// Returns `None` when there is no valid frontmatter block (matching
/// `split_frontmatter`'s own notion of validity: `---` on line 1, a matching
/// closing `---` on its own line). Callers that need to exclude or include
/// the frontmatter region when scanning for wikilinks use this range instead
/// of re-parsing, so the boundary logic stays in one place (invariant I5).
pub fn frontmatter_byte_range(raw: &str) -> Option<(usize, usize)> {
    let (yaml, _content) = split_frontmatter(raw);
    yaml?;

    // Recompute the end offset the same way split_frontmatter did, since it
    // only returns slices, not offsets.
    let after_opening = &raw[3..];
    let content_start_offset = if after_opening.starts_with("\r\n") {
        5
    } else if after_opening.starts_with('\n') {
        4
    } else {
        return None;
    };
    let content_start = &raw[content_start_offset..];
    let close_pos = find_closing_delimiter(content_start)?;
    let close_end = content_start_offset + close_pos + 3;
    let end = if raw[close_end..].starts_with("\r\n") {
        close_end + 2
    } else if raw[close_end..].starts_with('\n') {
        close_end + 1
    } else {
        close_end
    };
    Some((0, end))
}

/// Find the position of the closing --- delimiter (must be at start of line)
fn find_closing_delimiter(s: &str) -> Option<usize> {
    let mut pos = 0;
    for line in s.lines() {
        if line == "---" || line == "---\r" {
            return Some(pos);
        }
        pos += line.len() + 1; // +1 for newline
    }
    None
}

/// Parse a note's raw content into frontmatter and content.
///
/// The frontmatter is parsed as YAML and converted to a HashMap with JSON values.
/// The returned `ParsedNote` borrows from the input string.
pub fn parse_frontmatter(raw: &str) -> ParsedNote<'_> {
    let (yaml_str, content) = split_frontmatter(raw);

    let frontmatter = yaml_str.and_then(|yaml| {
        // Parse YAML to serde_yaml::Value, then convert to JSON Value
        serde_yaml::from_str::<serde_yaml::Value>(yaml)
            .ok()
            .and_then(yaml_to_json_map)
    });

    ParsedNote {
        frontmatter,
        content,
        raw,
    }
}

/// Convert a YAML value to a JSON HashMap (for the top-level frontmatter)
fn yaml_to_json_map(yaml: serde_yaml::Value) -> Option<Frontmatter> {
    match yaml {
        serde_yaml::Value::Mapping(map) => {
            let mut result = HashMap::new();
            for (k, v) in map {
                if let serde_yaml::Value::String(key) = k {
                    result.insert(key, yaml_to_json(v));
                }
            }
            if result.is_empty() {
                None
            } else {
                Some(result)
            }
        }
        _ => None,
    }
}

/// Convert a YAML value to a JSON value
fn yaml_to_json(yaml: serde_yaml::Value) -> JsonValue {
    match yaml {
        serde_yaml::Value::Null => JsonValue::Null,
        serde_yaml::Value::Bool(b) => JsonValue::Bool(b),
        serde_yaml::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                JsonValue::Number(i.into())
            } else if let Some(f) = n.as_f64() {
                serde_json::Number::from_f64(f)
                    .map(JsonValue::Number)
                    .unwrap_or(JsonValue::Null)
            } else {
                JsonValue::Null
            }
        }
        serde_yaml::Value::String(s) => JsonValue::String(s),
        serde_yaml::Value::Sequence(seq) => {
            JsonValue::Array(seq.into_iter().map(yaml_to_json).collect())
        }
        serde_yaml::Value::Mapping(map) => {
            let obj: serde_json::Map<String, JsonValue> = map
                .into_iter()
                .filter_map(|(k, v)| {
                    if let serde_yaml::Value::String(key) = k {
                        Some((key, yaml_to_json(v)))
                    } else {
                        None
                    }
                })
                .collect();
            JsonValue::Object(obj)
        }
        serde_yaml::Value::Tagged(tagged) => yaml_to_json(tagged.value),
    }
}
