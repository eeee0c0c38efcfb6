//! Raw lookup record -> sink schema. Pure; absent fields get fixed defaults.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};

use crate::{NormalizedRecord, RawRecord};

/// Size limit of a single rich-text field on the sink.
pub const MAX_CHUNK_CHARS: usize = 2000;

pub const NO_TITLE: &str = "No Title";
pub const NO_HEADER: &str = "No Header";
pub const NO_FOOTER: &str = "No Footer";
pub const NO_JOURNAL: &str = "No Name";
pub const NO_PROCESS: &str = "No Process";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransformOptions {
    pub semicolons_to_newlines: bool,
    pub max_chunk_chars: usize,
}

impl Default for TransformOptions {
    fn default() -> Self {
        Self {
            semicolons_to_newlines: true,
            max_chunk_chars: MAX_CHUNK_CHARS,
        }
    }
}

pub fn normalize_record(raw: &RawRecord, options: &TransformOptions) -> NormalizedRecord {
    let mut body = publication_body(raw);
    if options.semicolons_to_newlines {
        body = body.replace(';', "\n");
    }
    let journal = raw.journal.clone().unwrap_or_default();

    NormalizedRecord {
        journal_name: or_default(journal.name.as_deref(), NO_JOURNAL),
        treated_at: journal.treated_at.as_deref().and_then(parse_treated_at),
        treated_at_raw: journal.treated_at,
        published_at: journal.published_at,
        process_number: or_default(raw.process_number.as_deref(), NO_PROCESS),
        publication_chunks: chunk_text(&body, options.max_chunk_chars),
        title: or_default(raw.title.as_deref(), NO_TITLE),
        header: or_default(raw.header.as_deref(), NO_HEADER),
        footer: or_default(raw.footer.as_deref(), NO_FOOTER),
        publication_number: raw.publication_number,
        file_number: raw.file_number,
        relationship_code: raw.relationship_code,
    }
}

/// Reference date, title, header, text and footer joined by single spaces,
/// then trimmed. Missing parts contribute an empty string.
pub fn publication_body(raw: &RawRecord) -> String {
    [
        raw.reference_date.as_deref(),
        raw.title.as_deref(),
        raw.header.as_deref(),
        raw.text.as_deref(),
        raw.footer.as_deref(),
    ]
    .map(Option::unwrap_or_default)
    .join(" ")
    .trim()
    .to_string()
}

/// Split into consecutive pieces of at most `max_chars` characters.
/// Concatenating the pieces yields `text` again; empty text yields no pieces.
pub fn chunk_text(text: &str, max_chars: usize) -> Vec<String> {
    let limit = max_chars.max(1);
    let mut chunks = Vec::with_capacity(text.len() / limit + 1);
    let mut start = 0;
    let mut count = 0;
    for (idx, _) in text.char_indices() {
        if count == limit {
            chunks.push(text[start..idx].to_string());
            start = idx;
            count = 0;
        }
        count += 1;
    }
    if start < text.len() {
        chunks.push(text[start..].to_string());
    }
    chunks
}

/// Accepts RFC 3339, naive ISO date-times and plain dates. Naive values are
/// read as UTC.
pub fn parse_treated_at(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, fmt) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

fn or_default(value: Option<&str>, fallback: &str) -> String {
    match value {
        Some(v) if !v.trim().is_empty() => v.to_string(),
        _ => fallback.to_string(),
    }
}
