//! Markdown note model and parser.
//!
//! A note is one markdown file: frontmatter, title, date, tags, and
//! outgoing links. Unreadable or invalid-encoding files are reported as
//! "not found" so indexing callers can drop them from the pass without
//! aborting the batch.

use chrono::NaiveDate;
use std::fs;
use std::path::Path;
use std::time::UNIX_EPOCH;

use crate::error::{NotedownError, Result};
use crate::ident::{content_hash, normalize_path};

/// Kind of outgoing link found in a note body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    /// `[[target]]` or `[[target|display]]`
    Wiki,
    /// `[text](target)`
    Markdown,
}

/// An outgoing link from a note.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoteLink {
    pub target: String,
    pub kind: LinkKind,
    /// True for markdown links with http/https/mailto schemes.
    pub external: bool,
}

/// One markdown file in the index.
#[derive(Debug, Clone)]
pub struct Note {
    /// Relative path, normalized to forward slashes. Primary key.
    pub path: String,
    pub title: String,
    pub date: Option<NaiveDate>,
    /// First path segment, or `@alias` for linked content.
    pub notebook: String,
    pub tags: Vec<String>,
    pub links: Vec<NoteLink>,
    pub content_hash: String,
    /// Raw content, cached for search and grep-style queries.
    pub content: String,
    /// Filesystem mtime, seconds since the epoch.
    pub mtime: i64,
    /// True when the note lives outside the notes root (linked file).
    pub external: bool,
    /// Alias of the linked-file registration that owns this note.
    pub source_alias: Option<String>,
    /// Frontmatter `notodo: true` excludes this note's todos from queries.
    pub exclude_todos: bool,
}

/// Frontmatter fields the indexer cares about.
#[derive(Debug, Default, Clone)]
pub struct Frontmatter {
    pub title: Option<String>,
    pub date: Option<NaiveDate>,
    pub tags: Vec<String>,
    pub exclude_todos: bool,
}

/// Split a `---`-delimited frontmatter block from the body.
///
/// Returns `(frontmatter_yaml, body)`. A file without frontmatter yields
/// `(None, whole_content)`.
#[must_use]
pub fn split_frontmatter(content: &str) -> (Option<&str>, &str) {
    let Some(rest) = content.strip_prefix("---") else {
        return (None, content);
    };
    let Some(rest) = rest.strip_prefix('\n').or_else(|| rest.strip_prefix("\r\n")) else {
        return (None, content);
    };

    // Scan byte offsets for the closing fence; lines() would drop the
    // `\r` of CRLF files and skew the arithmetic.
    let mut offset = 0;
    while offset < rest.len() {
        let line_end = rest[offset..].find('\n').map_or(rest.len(), |i| offset + i);
        let line = &rest[offset..line_end];
        if line.trim_end() == "---" {
            let body = rest.get(line_end + 1..).unwrap_or("");
            return (Some(&rest[..offset]), body);
        }
        offset = line_end + 1;
    }
    (None, content)
}

/// Parse the frontmatter YAML block.
///
/// Malformed YAML returns `None` so the caller treats the file as a
/// parse-skip rather than a fatal error.
#[must_use]
pub fn parse_frontmatter(yaml: &str) -> Option<Frontmatter> {
    let value: serde_yaml::Value = serde_yaml::from_str(yaml).ok()?;
    let map = value.as_mapping()?;

    let mut fm = Frontmatter::default();

    if let Some(title) = map.get("title").and_then(serde_yaml::Value::as_str) {
        fm.title = Some(title.trim().to_string());
    }
    if let Some(date) = map.get("date").and_then(serde_yaml::Value::as_str) {
        // Datetime strings are accepted by taking the date prefix.
        fm.date = parse_date_prefix(date);
    }
    if let Some(tags) = map.get("tags") {
        fm.tags = parse_tag_value(tags);
    }
    if let Some(notodo) = map.get("notodo").and_then(serde_yaml::Value::as_bool) {
        fm.exclude_todos = notodo;
    }

    Some(fm)
}

fn parse_date_prefix(s: &str) -> Option<NaiveDate> {
    let s = s.trim();
    let prefix = if s.len() >= 10 { &s[..10] } else { s };
    NaiveDate::parse_from_str(prefix, "%Y-%m-%d").ok()
}

/// Frontmatter `tags` accepts a YAML sequence or a comma-separated string.
fn parse_tag_value(value: &serde_yaml::Value) -> Vec<String> {
    let mut tags = Vec::new();
    match value {
        serde_yaml::Value::Sequence(seq) => {
            for item in seq {
                if let Some(s) = item.as_str() {
                    push_tag(&mut tags, s);
                }
            }
        }
        serde_yaml::Value::String(s) => {
            for part in s.split(',') {
                push_tag(&mut tags, part);
            }
        }
        _ => {}
    }
    tags
}

/// Lowercase, dedup, preserve first-seen order.
fn push_tag(tags: &mut Vec<String>, raw: &str) {
    let tag = raw.trim().trim_start_matches('#').to_lowercase();
    if !tag.is_empty() && !tags.iter().any(|t| t == &tag) {
        tags.push(tag);
    }
}

/// Extract inline `#tag` tokens from a body.
///
/// A tag token starts at `#` preceded by start-of-line or whitespace and
/// runs over alphanumerics, `-`, `_`, and `/`.
#[must_use]
pub fn inline_tags(body: &str) -> Vec<String> {
    let mut tags = Vec::new();
    let bytes = body.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'#' && (i == 0 || bytes[i - 1].is_ascii_whitespace()) {
            let start = i + 1;
            let mut end = start;
            while end < bytes.len() {
                let c = bytes[end];
                if c.is_ascii_alphanumeric() || c == b'-' || c == b'_' || c == b'/' {
                    end += 1;
                } else {
                    break;
                }
            }
            // Require a leading letter so markdown headings ("# Title")
            // and issue refs ("#123") are not tags.
            if end > start && bytes[start].is_ascii_alphabetic() {
                push_tag(&mut tags, &body[start..end]);
            }
            i = end;
        } else {
            i += 1;
        }
    }
    tags
}

/// Extract wiki and markdown links from a body.
#[must_use]
pub fn extract_links(body: &str) -> Vec<NoteLink> {
    let mut links = Vec::new();

    // [[target]] and [[target|display]]
    let mut rest = body;
    while let Some(start) = rest.find("[[") {
        let after = &rest[start + 2..];
        if let Some(end) = after.find("]]") {
            let inner = &after[..end];
            let target = inner.split('|').next().unwrap_or(inner).trim();
            if !target.is_empty() {
                links.push(NoteLink {
                    target: target.to_string(),
                    kind: LinkKind::Wiki,
                    external: false,
                });
            }
            rest = &after[end + 2..];
        } else {
            break;
        }
    }

    // [text](target) - skip images and wiki forms already consumed
    let bytes = body.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'[' && (i == 0 || bytes[i - 1] != b'[') && bytes.get(i + 1) != Some(&b'[') {
            if let Some(close) = body[i..].find("](") {
                let target_start = i + close + 2;
                if let Some(end) = body[target_start..].find(')') {
                    let target = body[target_start..target_start + end].trim();
                    if !target.is_empty() {
                        let external = target.starts_with("http://")
                            || target.starts_with("https://")
                            || target.starts_with("mailto:");
                        links.push(NoteLink {
                            target: target.to_string(),
                            kind: LinkKind::Markdown,
                            external,
                        });
                    }
                    i = target_start + end + 1;
                    continue;
                }
            }
        }
        i += 1;
    }

    links
}

/// First `# ` heading in the body, if any.
fn first_h1(body: &str) -> Option<&str> {
    let mut in_fence = false;
    for line in body.lines() {
        if line.trim_start().starts_with("```") {
            in_fence = !in_fence;
            continue;
        }
        if in_fence {
            continue;
        }
        if let Some(title) = line.strip_prefix("# ") {
            let title = title.trim();
            if !title.is_empty() {
                return Some(title);
            }
        }
    }
    None
}

/// `YYYY-MM-DD` prefix embedded in a filename stem.
fn date_from_filename(stem: &str) -> Option<NaiveDate> {
    if stem.len() < 10 {
        return None;
    }
    NaiveDate::parse_from_str(&stem[..10], "%Y-%m-%d").ok()
}

/// Parse a note from disk.
///
/// `rel_path` is the store key (normalized); `abs_path` is where the file
/// lives. Returns `Ok(None)` for unreadable or non-UTF-8 files so the
/// caller can skip them.
///
/// # Errors
/// Returns `NotedownError::Io` only for metadata failures on a file that
/// was readable; missing files and encoding problems are `Ok(None)`.
pub fn parse_note(
    rel_path: &str,
    abs_path: &Path,
    external: bool,
    source_alias: Option<&str>,
) -> Result<Option<Note>> {
    let bytes = match fs::read(abs_path) {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::debug!(path = %abs_path.display(), error = %e, "Skipping unreadable note");
            return Ok(None);
        }
    };
    let Ok(content) = String::from_utf8(bytes) else {
        tracing::debug!(path = %abs_path.display(), "Skipping non-UTF-8 note");
        return Ok(None);
    };

    let metadata = fs::metadata(abs_path).map_err(|e| NotedownError::Io { source: e })?;
    let mtime = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map_or(0, |d| d.as_secs() as i64);

    Ok(Some(parse_note_content(rel_path, &content, mtime, external, source_alias)))
}

/// Parse note structure from already-loaded content.
#[must_use]
pub fn parse_note_content(
    rel_path: &str,
    content: &str,
    mtime: i64,
    external: bool,
    source_alias: Option<&str>,
) -> Note {
    let path = normalize_path(rel_path);
    let (yaml, body) = split_frontmatter(content);
    let fm = yaml.and_then(parse_frontmatter).unwrap_or_default();

    let stem = Path::new(&path)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(path.as_str())
        .to_string();

    // Title resolution: frontmatter -> first H1 -> filename stem.
    let title = fm
        .title
        .clone()
        .or_else(|| first_h1(body).map(String::from))
        .unwrap_or_else(|| stem.clone());

    // Date resolution: frontmatter -> filename-embedded -> none.
    let date = fm.date.or_else(|| date_from_filename(&stem));

    let mut tags = fm.tags.clone();
    for tag in inline_tags(body) {
        push_tag(&mut tags, &tag);
    }

    let notebook = match source_alias {
        Some(alias) => format!("@{alias}"),
        None => path.split('/').next().unwrap_or(&path).to_string(),
    };

    Note {
        content_hash: content_hash(content),
        links: extract_links(body),
        title,
        date,
        notebook,
        tags,
        content: content.to_string(),
        mtime,
        external,
        source_alias: source_alias.map(String::from),
        exclude_todos: fm.exclude_todos,
        path,
    }
}

/// Frontmatter-declared tags only, for todo tag inheritance.
///
/// Inline body tags are deliberately not inherited by todos; only the
/// frontmatter `tags:` key is.
#[must_use]
pub fn frontmatter_tags(content: &str) -> Vec<String> {
    let (yaml, _) = split_frontmatter(content);
    yaml.and_then(parse_frontmatter).map(|fm| fm.tags).unwrap_or_default()
}
