//! Per-conversation history records and range queries
//!
//! A history line is `ts|sender|kind|content` where `kind` is one of
//! `TEXT`, `FILE`, `DOWNLOAD` and `content` runs to the end of the line
//! (it may contain spaces and pipes). Query responses renumber matches
//! from 1 and prefix each content with its byte length:
//! `seq|sender|ts|kind|len|content`.

use chrono::{Local, NaiveDateTime, TimeZone};

use crate::current_timestamp;

/// One persisted history record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    /// Seconds since the Unix epoch at save time
    pub ts: i64,
    pub sender: String,
    pub kind: String,
    pub content: String,
}

impl MessageRecord {
    /// Parse a stored line; malformed lines yield `None` and are skipped
    /// by readers
    pub fn parse(line: &str) -> Option<Self> {
        let mut parts = line.splitn(4, '|');
        let ts = parts.next()?.parse::<i64>().ok()?;
        let sender = parts.next()?.to_string();
        let kind = parts.next()?.to_string();
        let content = parts.next()?.to_string();
        Some(Self {
            ts,
            sender,
            kind,
            content,
        })
    }

    /// The stored wire form (no terminator)
    pub fn to_line(&self) -> String {
        format!("{}|{}|{}|{}", self.ts, self.sender, self.kind, self.content)
    }

    /// The query-response form for the given 1-based sequence number
    pub fn to_response_line(&self, seq: usize) -> String {
        format!(
            "{}|{}|{}|{}|{}|{}",
            seq,
            self.sender,
            self.ts,
            self.kind,
            self.content.len(),
            self.content
        )
    }
}

/// Inclusive time range; a zero bound is unbounded on that side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub begin: i64,
    pub end: i64,
}

impl TimeRange {
    /// Parse the two bound arguments of a `HISTORY` command
    pub fn parse(begin: &str, end: &str) -> Self {
        Self {
            begin: parse_bound(begin),
            end: parse_bound(end),
        }
    }

    pub fn contains(&self, ts: i64) -> bool {
        (self.begin == 0 || ts >= self.begin) && (self.end == 0 || ts <= self.end)
    }
}

/// Parse one timestamp bound. Accepted forms: empty or `0` (unbounded),
/// pure integer seconds, `YYYY-MM-DD HH:MM[:SS]`, `YYYY-MM-DDTHH:MM[:SS]`
/// (local time). Anything unparseable falls back to "now".
pub fn parse_bound(input: &str) -> i64 {
    let input = input.trim();
    if input.is_empty() {
        return 0;
    }
    if input.bytes().all(|b| b.is_ascii_digit()) {
        return input.parse().unwrap_or(0);
    }
    // Tolerate the ISO8601 'T' separator
    let normalized = input.replace(['T', 't'], " ");
    parse_datetime(&normalized).unwrap_or_else(current_timestamp)
}

fn parse_datetime(s: &str) -> Option<i64> {
    let naive = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M"))
        .ok()?;
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.timestamp())
}

/// Keep the records inside the range, preserving file (chronological)
/// order
pub fn select_range(records: Vec<MessageRecord>, range: &TimeRange) -> Vec<MessageRecord> {
    records
        .into_iter()
        .filter(|r| range.contains(r.ts))
        .collect()
}
