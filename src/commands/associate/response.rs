//! Recovery parser for oracle output.
//!
//! Oracle responses are supposed to be a bare JSON array but in practice
//! arrive wrapped in markdown fences, preceded by commentary, or with raw
//! newlines inside string values. Parsing is layered accordingly, and a
//! response that defeats every layer yields an empty list rather than
//! aborting the book.

use super::*;

pub(super) fn extract_associations(raw: &str) -> Vec<OracleRecord> {
    for candidate in candidate_payloads(raw) {
        if let Some(records) = parse_array(&candidate) {
            return sanitize(records);
        }
        if let Some(repaired) = escape_raw_newlines_in_strings(&candidate)
            && let Some(records) = parse_array(&repaired)
        {
            debug!("oracle payload parsed after newline repair");
            return sanitize(records);
        }
    }
    warn!(preview = %bounded_prefix(raw, 400), "unable to parse oracle response; treating it as empty");
    Vec::new()
}

/// Payloads to try, most specific first: each fenced code block (and the
/// first balanced array inside it), the first balanced array in the whole
/// text, then the text itself.
fn candidate_payloads(raw: &str) -> Vec<String> {
    let mut candidates = Vec::new();
    if let Ok(fence) = Regex::new(r"(?s)```(?:json)?\s*(.*?)```") {
        for captures in fence.captures_iter(raw) {
            if let Some(body) = captures.get(1) {
                candidates.push(body.as_str().to_string());
                if let Some(slice) = balanced_array_slice(body.as_str()) {
                    candidates.push(slice.to_string());
                }
            }
        }
    }
    if let Some(slice) = balanced_array_slice(raw) {
        candidates.push(slice.to_string());
    }
    candidates.push(raw.to_string());
    candidates
}

fn parse_array(candidate: &str) -> Option<Vec<OracleRecord>> {
    let trimmed = candidate.trim();
    if !trimmed.starts_with('[') {
        return None;
    }
    serde_json::from_str(trimmed).ok()
}

fn sanitize(records: Vec<OracleRecord>) -> Vec<OracleRecord> {
    let before = records.len();
    let records: Vec<OracleRecord> = records
        .into_iter()
        .filter(|record| !record.image_filename.trim().is_empty())
        .collect();
    if records.len() < before {
        warn!(
            dropped = before - records.len(),
            "oracle records without an image filename dropped"
        );
    }
    records
}

/// Finds the first `[` and walks bytes to its balanced closing bracket,
/// honoring JSON string and escape state. Brackets are ASCII, so slicing at
/// these offsets always lands on a char boundary.
fn balanced_array_slice(text: &str) -> Option<&str> {
    let bytes = text.as_bytes();
    let open = bytes.iter().position(|&b| b == b'[')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (index, &byte) in bytes.iter().enumerate().skip(open) {
        if in_string {
            if escaped {
                escaped = false;
            } else if byte == b'\\' {
                escaped = true;
            } else if byte == b'"' {
                in_string = false;
            }
            continue;
        }
        match byte {
            b'"' => in_string = true,
            b'[' => depth += 1,
            b']' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[open..=index]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Escapes raw newlines that appear inside JSON string values. Returns None
/// when nothing needed repair, so the caller does not re-parse an unchanged
/// payload.
fn escape_raw_newlines_in_strings(text: &str) -> Option<String> {
    let mut out = String::with_capacity(text.len());
    let mut in_string = false;
    let mut escaped = false;
    let mut changed = false;
    for c in text.chars() {
        if in_string {
            if escaped {
                escaped = false;
                out.push(c);
                continue;
            }
            match c {
                '\\' => {
                    escaped = true;
                    out.push(c);
                }
                '"' => {
                    in_string = false;
                    out.push(c);
                }
                '\n' => {
                    out.push_str("\\n");
                    changed = true;
                }
                '\r' => {
                    out.push_str("\\r");
                    changed = true;
                }
                _ => out.push(c),
            }
        } else {
            if c == '"' {
                in_string = true;
            }
            out.push(c);
        }
    }
    changed.then_some(out)
}
