//! Filename → canonical document id.
//!
//! The `.pdf` suffix is stripped (case-insensitively), the rest is
//! lower-cased, and every run of characters outside `[0-9a-z]` collapses
//! to a single `-`. Filenames differing only in case or punctuation style
//! therefore share an id; callers rely on that for deduplication.
//!
//! Empty input (and a bare `".pdf"`) normalizes to the empty string.

use crate::models::DocumentId;

const PDF_SUFFIX: &str = ".pdf";

/// Normalize a raw filename into a [`DocumentId`]. Total and idempotent.
pub fn normalize(raw_name: &str) -> DocumentId {
    let stem = strip_pdf_suffix(raw_name);
    let mut out = String::with_capacity(stem.len());
    let mut in_run = false;

    for c in stem.chars().flat_map(char::to_lowercase) {
        if c.is_ascii_alphanumeric() {
            out.push(c);
            in_run = false;
        } else if !in_run {
            out.push('-');
            in_run = true;
        }
    }

    out
}

/// Strip a trailing `.pdf` in any letter case.
pub fn strip_pdf_suffix(raw_name: &str) -> &str {
    let split = raw_name.len().saturating_sub(PDF_SUFFIX.len());
    match raw_name.get(split..) {
        Some(tail) if tail.eq_ignore_ascii_case(PDF_SUFFIX) => &raw_name[..split],
        _ => raw_name,
    }
}
