//! Fuzzy date expression parsing for `@due(...)` markers and filters.
//!
//! Accepts both relative expressions ("tomorrow", "friday", "next week",
//! "in 3 days") and absolute ISO dates/datetimes. Relative expressions
//! resolve against an explicit anchor date so parsing stays deterministic
//! in tests.

use chrono::{Datelike, Duration, Local, NaiveDate, NaiveDateTime, NaiveTime, Weekday};

/// A resolved due date, optionally carrying a time component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Due {
    pub date: NaiveDate,
    pub time: Option<NaiveTime>,
}

impl Due {
    /// The instant used for overdue comparisons: midnight when no time
    /// component was given.
    #[must_use]
    pub fn datetime(&self) -> NaiveDateTime {
        self.date.and_time(self.time.unwrap_or(NaiveTime::MIN))
    }
}

/// Parse a due-date expression against today's local date.
#[must_use]
pub fn parse_expr(expr: &str) -> Option<Due> {
    parse_expr_at(expr, Local::now().date_naive())
}

/// Parse a due-date expression against an explicit anchor date.
///
/// Supported forms, case-insensitive:
/// - ISO date: `2025-01-20`
/// - ISO datetime: `2025-01-20 14:30` or `2025-01-20T14:30`
/// - `today`, `tomorrow`, `yesterday`
/// - weekday names (`friday`), resolving to the next occurrence strictly
///   after the anchor
/// - `next <weekday>` (one week beyond the plain weekday form)
/// - `next week` (anchor + 7 days)
/// - `in N days` / `N days`
///
/// Any form may carry a trailing `HH:MM` time component.
#[must_use]
pub fn parse_expr_at(expr: &str, today: NaiveDate) -> Option<Due> {
    let expr = expr.trim();
    if expr.is_empty() {
        return None;
    }

    // Absolute datetime forms first; they embed their own time component.
    for fmt in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(expr, fmt) {
            return Some(Due { date: dt.date(), time: Some(dt.time()) });
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(expr, "%Y-%m-%d") {
        return Some(Due { date, time: None });
    }

    // Relative forms, with an optional trailing HH:MM.
    let lower = expr.to_lowercase();
    let (word, time) = split_trailing_time(&lower);

    let date = match word {
        "today" => Some(today),
        "tomorrow" => Some(today + Duration::days(1)),
        "yesterday" => Some(today - Duration::days(1)),
        "next week" => Some(today + Duration::days(7)),
        _ => {
            if let Some(weekday) = parse_weekday(word) {
                Some(next_weekday(today, weekday))
            } else if let Some(rest) = word.strip_prefix("next ") {
                parse_weekday(rest).map(|wd| next_weekday(today, wd) + Duration::days(7))
            } else {
                parse_day_offset(word).map(|days| today + Duration::days(days))
            }
        }
    }?;

    Some(Due { date, time })
}

/// Split a trailing `HH:MM` component off a relative expression.
fn split_trailing_time(expr: &str) -> (&str, Option<NaiveTime>) {
    if let Some((head, tail)) = expr.rsplit_once(' ') {
        if let Ok(time) = NaiveTime::parse_from_str(tail, "%H:%M") {
            return (head.trim_end(), Some(time));
        }
    }
    (expr, None)
}

fn parse_weekday(word: &str) -> Option<Weekday> {
    match word {
        "monday" | "mon" => Some(Weekday::Mon),
        "tuesday" | "tue" => Some(Weekday::Tue),
        "wednesday" | "wed" => Some(Weekday::Wed),
        "thursday" | "thu" => Some(Weekday::Thu),
        "friday" | "fri" => Some(Weekday::Fri),
        "saturday" | "sat" => Some(Weekday::Sat),
        "sunday" | "sun" => Some(Weekday::Sun),
        _ => None,
    }
}

/// Next occurrence of `weekday` strictly after `today`.
fn next_weekday(today: NaiveDate, weekday: Weekday) -> NaiveDate {
    let ahead = (7 + weekday.num_days_from_monday() as i64
        - today.weekday().num_days_from_monday() as i64)
        % 7;
    let ahead = if ahead == 0 { 7 } else { ahead };
    today + Duration::days(ahead)
}

/// `in N days` / `N days` forms.
fn parse_day_offset(word: &str) -> Option<i64> {
    let rest = word.strip_prefix("in ").unwrap_or(word);
    let rest = rest.strip_suffix(" days").or_else(|| rest.strip_suffix(" day"))?;
    rest.trim().parse::<i64>().ok()
}
