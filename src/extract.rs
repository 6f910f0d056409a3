//! Per-page text extraction for uploaded documents.
//!
//! Callers supply bytes + content-type; this module returns one UTF-8
//! string per page, in page order. Extraction failures are errors, never
//! panics, so an upload can be rejected without taking the process down.

use std::path::Path;

pub const MIME_PDF: &str = "application/pdf";

#[derive(Debug)]
pub enum ExtractError {
    UnsupportedContentType(String),
    Pdf(String),
}

impl std::fmt::Display for ExtractError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExtractError::UnsupportedContentType(ct) => {
                write!(f, "unsupported content-type: {}", ct)
            }
            ExtractError::Pdf(e) => write!(f, "PDF extraction failed: {}", e),
        }
    }
}

impl std::error::Error for ExtractError {}

/// Extract page texts from binary content.
pub fn extract_pages(bytes: &[u8], content_type: &str) -> Result<Vec<String>, ExtractError> {
    match content_type {
        MIME_PDF => extract_pdf_pages(bytes),
        _ => Err(ExtractError::UnsupportedContentType(
            content_type.to_string(),
        )),
    }
}

/// Guess the content-type from a filename extension.
pub fn content_type_for(name: &str) -> Option<&'static str> {
    let ext = Path::new(name).extension()?.to_str()?;
    if ext.eq_ignore_ascii_case("pdf") {
        Some(MIME_PDF)
    } else {
        None
    }
}

fn extract_pdf_pages(bytes: &[u8]) -> Result<Vec<String>, ExtractError> {
    pdf_extract::extract_text_from_mem_by_pages(bytes).map_err(|e| ExtractError::Pdf(e.to_string()))
}
