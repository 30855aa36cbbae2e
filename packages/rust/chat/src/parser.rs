//! WhatsApp text export parser.
//!
//! Parses the bracketed export format:
//! - `[1/15/24, 9:05:12 AM] ~ Sender Name: message text` starts a message
//! - `[1/15/24, 9:06 AM] ~ Sender joined using this group's invite link` is a
//!   system notice (no `Sender:` body) and is dropped
//! - any other line continues the previous message

use std::path::{Path, PathBuf};
use std::str::Lines;
use std::sync::LazyLock;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use regex::Regex;
use tracing::{debug, info, trace};

use chatkb_shared::{ChatKbError, DateOrder, Result};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// One message as it appeared in an export, before any filtering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    /// Human-readable name of the export file this came from.
    pub source: String,
    /// Sender label exactly as exported (leading `~` removed).
    pub sender: String,
    /// Parsed timestamp, `None` when the stamp is not a valid calendar date.
    pub timestamp: Option<NaiveDateTime>,
    /// Date string as written in the export (e.g. `1/15/24`).
    pub date: String,
    /// Time string as written in the export (e.g. `9:05:12 AM`).
    pub time: String,
    /// Message body; continuation lines are joined with `\n`.
    pub text: String,
}

impl RawMessage {
    /// The stamp as it appeared between the brackets.
    pub fn stamp(&self) -> String {
        format!("{}, {}", self.date, self.time)
    }
}

// ---------------------------------------------------------------------------
// Regex patterns (compiled once)
// ---------------------------------------------------------------------------

/// Matches `[date, time] rest`.
static PREFIX_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^\[(\d{1,2}/\d{1,2}/\d{2,4}),\s+(\d{1,2}:\d{2}(?::\d{2})?(?:\s*[AaPp][Mm])?)\]\s*(.*)$",
    )
    .expect("prefix regex")
});

/// Matches `Sender: text` after the prefix.
static SENDER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([^:]+):\s?(.*)$").expect("sender regex"));

/// Splits a time string into hour, minute, optional second and optional meridiem.
static TIME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d{1,2}):(\d{2})(?::(\d{2}))?(?:\s*([AaPp])[Mm])?$").expect("time regex")
});

// ---------------------------------------------------------------------------
// Line classification
// ---------------------------------------------------------------------------

enum Line<'a> {
    Message(RawMessage),
    System,
    Continuation(&'a str),
}

/// Direction marks and bidi isolates that exports sprinkle around names.
fn is_invisible(c: char) -> bool {
    matches!(
        c,
        '\u{200e}' | '\u{200f}' | '\u{202a}'..='\u{202e}' | '\u{2066}'..='\u{2069}' | '\u{feff}'
    )
}

fn clean_sender(raw: &str) -> String {
    raw.trim_matches(|c: char| c == '~' || c.is_whitespace() || is_invisible(c))
        .to_string()
}

fn classify_line<'a>(line: &'a str, source: &str, order: DateOrder) -> Line<'a> {
    let line = line.trim_start_matches(is_invisible);

    let Some(caps) = PREFIX_RE.captures(line) else {
        return Line::Continuation(line);
    };

    let date = caps[1].to_string();
    let time = caps[2].to_string();
    let body = caps[3].trim_start_matches(|c: char| c == '~' || c.is_whitespace() || is_invisible(c));

    let Some(body_caps) = SENDER_RE.captures(body) else {
        return Line::System;
    };

    let sender = clean_sender(&body_caps[1]);
    if sender.is_empty() {
        return Line::System;
    }

    Line::Message(RawMessage {
        source: source.to_string(),
        timestamp: parse_timestamp(&date, &time, order),
        sender,
        date,
        time,
        text: body_caps[2].trim().to_string(),
    })
}

/// Parse the bracketed date and time into a timestamp.
pub fn parse_timestamp(date: &str, time: &str, order: DateOrder) -> Option<NaiveDateTime> {
    let mut parts = date.split('/').map(|p| p.parse::<u32>().ok());
    let (first, second, year) = (parts.next()??, parts.next()??, parts.next()??);
    let (month, day) = match order {
        DateOrder::Mdy => (first, second),
        DateOrder::Dmy => (second, first),
    };
    let year = if year < 100 { 2000 + year } else { year };
    let date = NaiveDate::from_ymd_opt(i32::try_from(year).ok()?, month, day)?;

    let caps = TIME_RE.captures(time.trim())?;
    let mut hour: u32 = caps[1].parse().ok()?;
    let minute: u32 = caps[2].parse().ok()?;
    let second: u32 = caps.get(3).map_or(Some(0), |m| m.as_str().parse().ok())?;

    if let Some(meridiem) = caps.get(4) {
        if hour == 0 || hour > 12 {
            return None;
        }
        let pm = meridiem.as_str().eq_ignore_ascii_case("p");
        hour = match (hour, pm) {
            (12, false) => 0,
            (12, true) => 12,
            (h, true) => h + 12,
            (h, false) => h,
        };
    }

    let time = NaiveTime::from_hms_opt(hour, minute, second)?;
    Some(NaiveDateTime::new(date, time))
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

/// Lazy parser over the text of one export file.
///
/// Yields messages in file order. A parser cannot be rewound; build a new
/// one to parse the same text again.
pub struct ExportParser<'a> {
    lines: Lines<'a>,
    source: String,
    order: DateOrder,
    pending: Option<RawMessage>,
    dropped: usize,
}

impl<'a> ExportParser<'a> {
    pub fn new(text: &'a str, source: impl Into<String>, order: DateOrder) -> Self {
        Self {
            lines: text.lines(),
            source: source.into(),
            order,
            pending: None,
            dropped: 0,
        }
    }

    /// Lines discarded so far (system notices and orphan continuations).
    pub fn dropped_lines(&self) -> usize {
        self.dropped
    }
}

impl Iterator for ExportParser<'_> {
    type Item = RawMessage;

    fn next(&mut self) -> Option<RawMessage> {
        for line in self.lines.by_ref() {
            match classify_line(line, &self.source, self.order) {
                Line::Message(msg) => {
                    if let Some(prev) = self.pending.replace(msg) {
                        return Some(prev);
                    }
                }
                Line::System => {
                    self.dropped += 1;
                    trace!(line, "dropping system notice");
                    if let Some(prev) = self.pending.take() {
                        return Some(prev);
                    }
                }
                Line::Continuation(text) => {
                    let text = text.trim();
                    if text.is_empty() {
                        continue;
                    }
                    match self.pending.as_mut() {
                        Some(msg) => {
                            if !msg.text.is_empty() {
                                msg.text.push('\n');
                            }
                            msg.text.push_str(text);
                        }
                        None => {
                            self.dropped += 1;
                            trace!(line = text, "dropping line outside any message");
                        }
                    }
                }
            }
        }
        self.pending.take()
    }
}

// ---------------------------------------------------------------------------
// Multi-file entry points
// ---------------------------------------------------------------------------

/// Display name for an export file: its stem with underscores as spaces.
pub fn source_name(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().replace('_', " "))
        .unwrap_or_else(|| path.display().to_string())
}

/// Parse one export text completely.
pub fn parse_export(text: &str, source: &str, order: DateOrder) -> Vec<RawMessage> {
    let mut parser = ExportParser::new(text, source, order);
    let messages: Vec<RawMessage> = parser.by_ref().collect();
    debug!(
        source,
        messages = messages.len(),
        dropped_lines = parser.dropped_lines(),
        "parsed export"
    );
    messages
}

/// Concatenate per-file sequences, then re-order by timestamp when every
/// message has one. The sort is stable, so ties keep file order.
pub fn combine(files: Vec<Vec<RawMessage>>) -> Vec<RawMessage> {
    let mut all: Vec<RawMessage> = files.into_iter().flatten().collect();
    if all.iter().all(|m| m.timestamp.is_some()) {
        all.sort_by_key(|m| m.timestamp);
    } else {
        debug!("some timestamps are invalid, keeping file order");
    }
    all
}

/// Read and parse every export file in order.
///
/// Bytes that are not valid UTF-8 are replaced rather than rejected; an
/// unreadable file is an error.
pub fn parse_exports(paths: &[PathBuf], order: DateOrder) -> Result<Vec<RawMessage>> {
    let mut files = Vec::with_capacity(paths.len());

    for path in paths {
        let bytes = std::fs::read(path).map_err(|e| ChatKbError::io(path, e))?;
        let text = String::from_utf8_lossy(&bytes);
        let source = source_name(path);
        let messages = parse_export(&text, &source, order);
        info!(path = %path.display(), %source, messages = messages.len(), "parsed export file");
        files.push(messages);
    }

    Ok(combine(files))
}
