//! Todo model and line-oriented todo parser.
//!
//! The parser walks a markdown file line by line, maintaining a code-fence
//! toggle, an indent stack for parent/child nesting, the current section
//! label, and the most recent todo for details/attachment capture. Todos
//! inside fenced code blocks are never recognized.

use chrono::NaiveDate;

use crate::dates::{self, Due};
use crate::ident::todo_id;

/// Tri-state todo status from the checkbox marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TodoStatus {
    /// `- [ ]`
    Pending,
    /// `- [^]`
    InProgress,
    /// `- [x]` / `- [X]`
    Completed,
}

impl TodoStatus {
    /// Marker character written back into the source file.
    #[must_use]
    pub const fn marker(self) -> char {
        match self {
            Self::Pending => ' ',
            Self::InProgress => '^',
            Self::Completed => 'x',
        }
    }

    /// Status name used in the store and JSON output.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
        }
    }

    /// Parse a stored status name.
    #[must_use]
    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }
}

/// Todo priority, 1 highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    High = 1,
    Medium = 2,
    Low = 3,
}

impl Priority {
    #[must_use]
    pub fn from_level(level: u8) -> Option<Self> {
        match level {
            1 => Some(Self::High),
            2 => Some(Self::Medium),
            3 => Some(Self::Low),
            _ => None,
        }
    }

    #[must_use]
    pub const fn level(self) -> u8 {
        self as u8
    }
}

/// Where a todo came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TodoSource {
    /// Normalized path of the source file.
    pub path: String,
    /// True when the source lives outside the notes root.
    pub external: bool,
    /// Alias of the linked-file registration, when external.
    pub alias: Option<String>,
}

impl TodoSource {
    /// Internal note source.
    #[must_use]
    pub fn note(path: &str) -> Self {
        Self { path: crate::ident::normalize_path(path), external: false, alias: None }
    }

    /// Linked external source.
    #[must_use]
    pub fn linked(path: &str, alias: &str) -> Self {
        Self {
            path: crate::ident::normalize_path(path),
            external: true,
            alias: Some(alias.to_string()),
        }
    }
}

/// One checkbox line, with metadata and hierarchy.
#[derive(Debug, Clone)]
pub struct Todo {
    /// Content-derived id: hash of normalized source path + cleaned content.
    pub id: String,
    /// Content with `@due`, `@priority`, and `#tag` markers stripped.
    pub cleaned: String,
    /// Original line content after the checkbox marker.
    pub raw: String,
    pub status: TodoStatus,
    pub source: TodoSource,
    /// 1-based line number in the source file. Best-effort; re-resolved by
    /// content match when stale.
    pub line: usize,
    /// Preserved across re-indexing by id lookup.
    pub created_date: Option<NaiveDate>,
    /// Set on first transition into completed, cleared on un-complete.
    pub completed_date: Option<NaiveDate>,
    pub due: Option<Due>,
    pub priority: Option<Priority>,
    /// Inline tags plus inherited frontmatter tags, deduplicated.
    pub tags: Vec<String>,
    /// Nearest preceding heading or colon-label.
    pub section: Option<String>,
    pub parent_id: Option<String>,
    /// Ids of directly nested child todos.
    pub children: Vec<String>,
    /// Indented free-text lines following the todo, newline-joined.
    pub details: Option<String>,
    /// Values of `@attach:` lines under this todo.
    pub attachments: Vec<String>,
}

/// Checkbox marker parsed off the front of a line, with its indent.
struct CheckboxLine<'a> {
    indent: usize,
    status: TodoStatus,
    rest: &'a str,
}

/// Try to parse `- [ ]` / `- [x]` / `- [X]` / `- [^]` with leading indent.
fn parse_checkbox(line: &str) -> Option<CheckboxLine<'_>> {
    let trimmed = line.trim_start();
    let indent = line.len() - trimmed.len();
    let rest = trimmed.strip_prefix("- [")?;
    let mut chars = rest.chars();
    let marker = chars.next()?;
    let status = match marker {
        ' ' => TodoStatus::Pending,
        'x' | 'X' => TodoStatus::Completed,
        '^' => TodoStatus::InProgress,
        _ => return None,
    };
    let rest = chars.as_str().strip_prefix(']')?;
    Some(CheckboxLine { indent, status, rest: rest.trim_start() })
}

/// Metadata pulled off one todo line.
struct LineMeta {
    cleaned: String,
    due: Option<Due>,
    priority: Option<Priority>,
    tags: Vec<String>,
}

/// Strip a `@name(arg)` marker, returning the argument if present.
fn take_marker(text: &mut String, name: &str) -> Option<String> {
    let pattern = format!("@{name}(");
    let start = text.find(&pattern)?;
    let arg_start = start + pattern.len();
    let end = text[arg_start..].find(')')?;
    let arg = text[arg_start..arg_start + end].trim().to_string();
    text.replace_range(start..arg_start + end + 1, " ");
    Some(arg)
}

/// Strip inline `#tag` tokens from the text, collecting them lowercased.
fn take_tags(text: &mut String) -> Vec<String> {
    let tags = crate::note::inline_tags(text);
    if tags.is_empty() {
        return tags;
    }

    let mut out = String::with_capacity(text.len());
    let bytes = text.as_bytes();
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
            if end > start && bytes[start].is_ascii_alphabetic() {
                i = end;
                continue;
            }
        }
        // Advance a full UTF-8 sequence at a time.
        let ch_len = text[i..].chars().next().map_or(1, char::len_utf8);
        out.push_str(&text[i..i + ch_len]);
        i += ch_len;
    }
    *text = out;
    tags
}

fn extract_meta(raw: &str) -> LineMeta {
    let mut text = raw.to_string();

    let due = take_marker(&mut text, "due").and_then(|expr| dates::parse_expr(&expr));
    let priority = take_marker(&mut text, "priority")
        .and_then(|arg| arg.parse::<u8>().ok())
        .and_then(Priority::from_level);
    let tags = take_tags(&mut text);

    let cleaned = text.split_whitespace().collect::<Vec<_>>().join(" ");
    LineMeta { cleaned, due, priority, tags }
}

/// Parse metadata against an explicit anchor date, for deterministic tests.
#[cfg(test)]
fn extract_meta_at(raw: &str, today: NaiveDate) -> LineMeta {
    let mut text = raw.to_string();
    let due = take_marker(&mut text, "due").and_then(|expr| dates::parse_expr_at(&expr, today));
    let priority = take_marker(&mut text, "priority")
        .and_then(|arg| arg.parse::<u8>().ok())
        .and_then(Priority::from_level);
    let tags = take_tags(&mut text);
    let cleaned = text.split_whitespace().collect::<Vec<_>>().join(" ");
    LineMeta { cleaned, due, priority, tags }
}

/// Parse a checkbox line into its status and cleaned content, for
/// line-match verification during write-back.
#[must_use]
pub fn checkbox_cleaned(line: &str) -> Option<(TodoStatus, String)> {
    let checkbox = parse_checkbox(line)?;
    let meta = extract_meta(checkbox.rest);
    Some((checkbox.status, meta.cleaned))
}

/// Rewrite a checkbox line's status marker, preserving everything else.
#[must_use]
pub fn set_marker(line: &str, status: TodoStatus) -> Option<String> {
    let trimmed = line.trim_start();
    let indent = &line[..line.len() - trimmed.len()];
    parse_checkbox(line)?;
    let open = trimmed.find('[')?;
    let close = trimmed[open..].find(']')? + open;
    Some(format!(
        "{indent}{}{}{}",
        &trimmed[..=open],
        status.marker(),
        &trimmed[close..]
    ))
}

/// Heading text if the line is a markdown heading (`#` through `######`).
fn heading_text(line: &str) -> Option<&str> {
    let hashes = line.bytes().take_while(|&b| b == b'#').count();
    if hashes == 0 || hashes > 6 {
        return None;
    }
    line[hashes..].strip_prefix(' ').map(str::trim).filter(|t| !t.is_empty())
}

/// Parse all todos in a file's content.
///
/// `inherited_tags` are the note's frontmatter tags; they are unioned into
/// every todo's tag set. Line numbers are 1-based over the full file,
/// including any frontmatter block.
#[must_use]
pub fn parse_todos(content: &str, source: &TodoSource, inherited_tags: &[String]) -> Vec<Todo> {
    let mut todos: Vec<Todo> = Vec::new();

    let mut in_fence = false;
    let mut section: Option<String> = None;
    let mut seen_title_heading = false;
    // (indent, index into todos)
    let mut stack: Vec<(usize, usize)> = Vec::new();
    let mut current: Option<usize> = None;
    let mut current_indent: usize = 0;
    let mut details_buf: Vec<String> = Vec::new();

    // Skip the frontmatter block without losing line numbering.
    let fm_lines = frontmatter_line_count(content);

    for (idx, line) in content.lines().enumerate() {
        let line_no = idx + 1;
        if idx < fm_lines {
            continue;
        }

        let trimmed = line.trim_start();

        if trimmed.starts_with("```") {
            in_fence = !in_fence;
            continue;
        }
        if in_fence {
            continue;
        }

        if let Some(checkbox) = parse_checkbox(line) {
            flush_details(&mut todos, current, &mut details_buf);

            let meta = extract_meta(checkbox.rest);
            let mut tags: Vec<String> = inherited_tags.to_vec();
            for tag in &meta.tags {
                if !tags.contains(tag) {
                    tags.push(tag.clone());
                }
            }

            while stack.last().is_some_and(|&(indent, _)| indent >= checkbox.indent) {
                stack.pop();
            }
            let parent_idx = stack.last().map(|&(_, i)| i);

            let todo = Todo {
                id: todo_id(&source.path, &meta.cleaned),
                cleaned: meta.cleaned,
                raw: checkbox.rest.to_string(),
                status: checkbox.status,
                source: source.clone(),
                line: line_no,
                created_date: None,
                completed_date: None,
                due: meta.due,
                priority: meta.priority,
                tags,
                section: section.clone(),
                parent_id: parent_idx.map(|i| todos[i].id.clone()),
                children: Vec::new(),
                details: None,
                attachments: Vec::new(),
            };

            let idx = todos.len();
            if let Some(p) = parent_idx {
                let child_id = todo.id.clone();
                todos[p].children.push(child_id);
            }
            todos.push(todo);
            stack.push((checkbox.indent, idx));
            current = Some(idx);
            current_indent = checkbox.indent;
            continue;
        }

        if let Some(title) = heading_text(trimmed) {
            if !line.starts_with(|c: char| c.is_whitespace()) {
                flush_details(&mut todos, current, &mut details_buf);
                if seen_title_heading {
                    section = Some(title.to_string());
                } else {
                    // First heading is the note's own title, not a section.
                    seen_title_heading = true;
                }
                current = None;
                stack.clear();
                continue;
            }
        }

        if let Some(value) = trimmed.strip_prefix("@attach:") {
            if let Some(cur) = current {
                let value = value.trim();
                if !value.is_empty() {
                    todos[cur].attachments.push(value.to_string());
                }
            }
            continue;
        }

        if trimmed.is_empty() {
            continue;
        }

        // Colon-label pseudo-heading: non-indented line ending in ':'.
        if !line.starts_with(|c: char| c.is_whitespace()) && trimmed.ends_with(':') {
            flush_details(&mut todos, current, &mut details_buf);
            section = Some(trimmed.trim_end_matches(':').trim().to_string());
            current = None;
            stack.clear();
            continue;
        }

        // Details: strictly deeper indent than the current todo's line.
        if current.is_some() {
            let indent = line.len() - trimmed.len();
            if indent > current_indent {
                details_buf.push(line.trim_end().to_string());
            }
        }
    }

    flush_details(&mut todos, current, &mut details_buf);
    todos
}

fn flush_details(todos: &mut [Todo], current: Option<usize>, buf: &mut Vec<String>) {
    if buf.is_empty() {
        return;
    }
    if let Some(cur) = current {
        todos[cur].details = Some(buf.join("\n"));
    }
    buf.clear();
}

/// Number of leading lines occupied by a frontmatter block, including both
/// `---` fences. Zero when no frontmatter is present.
fn frontmatter_line_count(content: &str) -> usize {
    let mut lines = content.lines();
    if lines.next().map(str::trim_end) != Some("---") {
        return 0;
    }
    for (idx, line) in lines.enumerate() {
        if line.trim_end() == "---" {
            return idx + 2;
        }
    }
    0
}
