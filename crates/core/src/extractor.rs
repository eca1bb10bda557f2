use crate::error::IngestError;
use lopdf::Document;
use std::path::Path;
use tracing::debug;

/// Extracted text for a single page. Page numbers are 1-based, matching how
/// papers cite their own pages.
#[derive(Debug, Clone)]
pub struct PageText {
    pub number: u32,
    pub text: String,
}

/// Pulls per-page text out of a PDF. Pages whose text layer is empty or
/// unreadable are kept with empty text so page numbering stays dense; the
/// chunker simply produces nothing for them.
pub fn extract_page_texts(path: &Path) -> Result<Vec<PageText>, IngestError> {
    let document =
        Document::load(path).map_err(|error| IngestError::PdfParse(error.to_string()))?;

    let mut pages = Vec::new();
    for (&page_number, _) in document.get_pages().iter() {
        let text = match document.extract_text(&[page_number]) {
            Ok(text) => normalize_extracted(&text),
            Err(error) => {
                debug!(
                    page = page_number,
                    %error,
                    "page text extraction failed; continuing with empty page"
                );
                String::new()
            }
        };
        pages.push(PageText {
            number: page_number,
            text,
        });
    }

    pages.sort_by_key(|page| page.number);
    Ok(pages)
}

/// Collapses the extractor's artifacts: stray carriage returns, runs of
/// blank lines, and trailing whitespace per line.
fn normalize_extracted(raw: &str) -> String {
    let mut lines = Vec::new();
    let mut blank_run = 0usize;
    for line in raw.replace('\r', "\n").lines() {
        let trimmed = line.trim_end();
        if trimmed.is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        lines.push(trimmed.to_string());
    }
    lines.join("\n").trim().to_string()
}
