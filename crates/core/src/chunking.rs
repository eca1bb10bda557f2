use crate::error::IngestError;
use crate::models::ChunkRecord;
use regex::Regex;

/// Chunking knobs. Windows are measured in characters, not bytes, so
/// multi-byte symbols (Greek, math) never split a window mid-character.
#[derive(Debug, Clone, Copy)]
pub struct ChunkingOptions {
    pub max_chars: usize,
    pub overlap_chars: usize,
}

impl Default for ChunkingOptions {
    fn default() -> Self {
        Self {
            max_chars: 1_400,
            overlap_chars: 200,
        }
    }
}

const SECTION_HEADING_PATTERN: &str =
    r"(?i)^(?:\d+(?:\.\d+)*\s+)?(abstract|introduction|methods?|results?|discussion|conclusions?|references)\b";

/// Infers `(char_offset, section_name)` spans from headings inside one page.
/// Pages are the chunking scope; headings are never inferred across pages.
pub fn infer_section_spans(text: &str) -> Result<Vec<(usize, String)>, IngestError> {
    let heading_re = Regex::new(SECTION_HEADING_PATTERN)?;
    let mut spans = Vec::new();
    let mut offset = 0usize;

    for line in text.split_inclusive('\n') {
        let trimmed = line.trim();
        if !trimmed.is_empty() {
            if let Some(captures) = heading_re.captures(trimmed) {
                if let Some(name) = captures.get(1) {
                    spans.push((offset, title_case(name.as_str())));
                }
            }
        }
        offset += line.chars().count();
    }

    Ok(spans)
}

fn title_case(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    }
}

/// Section-aware chunking of one page's extracted text.
///
/// Chunk ids are the chunk's index within the page, assigned in text order;
/// identical input text always reproduces identical ids, which is what keeps
/// re-ingestion idempotent at the citation level.
pub fn chunk_page(
    doc_id: i64,
    page_num: u32,
    text: &str,
    options: ChunkingOptions,
) -> Result<Vec<ChunkRecord>, IngestError> {
    if options.max_chars == 0 {
        return Err(IngestError::InvalidArgument(
            "max_chars must be positive".to_string(),
        ));
    }
    if options.overlap_chars >= options.max_chars {
        return Err(IngestError::InvalidArgument(format!(
            "overlap {} must be smaller than window {}",
            options.overlap_chars, options.max_chars
        )));
    }

    let chars: Vec<char> = text.chars().collect();
    let total = chars.len();
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }

    let mut spans = infer_section_spans(text)?;
    if spans.is_empty() {
        spans.push((0, String::new()));
    }

    let mut segments = Vec::with_capacity(spans.len());
    for (index, (start, name)) in spans.iter().enumerate() {
        let end = spans
            .get(index + 1)
            .map(|(next_start, _)| *next_start)
            .unwrap_or(total);
        let section = if name.is_empty() {
            None
        } else {
            Some(name.clone())
        };
        segments.push((*start, end, section));
    }

    // Text before the first heading still gets chunked, without a section.
    if let Some(&(first_start, _, _)) = segments.first() {
        if first_start > 0 {
            segments.insert(0, (0, first_start, None));
        }
    }

    let mut chunks = Vec::new();
    let mut chunk_id: u32 = 0;

    for (seg_start, seg_end, section_name) in segments {
        let mut cursor = seg_start;
        while cursor < seg_end {
            let window_end = (cursor + options.max_chars).min(seg_end);
            let window: String = chars[cursor..window_end].iter().collect();
            let trimmed = window.trim();
            if trimmed.is_empty() {
                break;
            }

            chunks.push(ChunkRecord {
                doc_id,
                page_num,
                chunk_id,
                section_name: section_name.clone(),
                text: trimmed.to_string(),
                offset_start: cursor as u32,
                offset_end: window_end as u32,
            });
            chunk_id += 1;

            if window_end >= seg_end {
                break;
            }
            cursor = seg_start.max(window_end - options.overlap_chars);
        }
    }

    Ok(chunks)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_ids_are_page_scoped_indices() -> Result<(), IngestError> {
        let options = ChunkingOptions {
            max_chars: 40,
            overlap_chars: 8,
        };
        let text = "Introduction\nA first passage about the survey design and cadence. \
                    A second passage about detector noise properties.";

        let chunks = chunk_page(3, 2, text, options)?;
        assert!(chunks.len() > 1);
        for (index, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.chunk_id, index as u32);
            assert_eq!(chunk.doc_id, 3);
            assert_eq!(chunk.page_num, 2);
        }
        Ok(())
    }

    #[test]
    fn identical_text_reproduces_identical_chunks() -> Result<(), IngestError> {
        let text = "Results\nThe temperature inversion was observed at dawn on both nights.";
        let first = chunk_page(1, 1, text, ChunkingOptions::default())?;
        let second = chunk_page(1, 1, text, ChunkingOptions::default())?;
        assert_eq!(first.len(), second.len());
        for (left, right) in first.iter().zip(second.iter()) {
            assert_eq!(left.chunk_id, right.chunk_id);
            assert_eq!(left.text, right.text);
        }
        Ok(())
    }

    #[test]
    fn section_names_follow_headings() -> Result<(), IngestError> {
        let text = "Abstract\nWe report a detection.\nResults\nThe flux doubled.";
        let chunks = chunk_page(1, 1, text, ChunkingOptions::default())?;
        let sections: Vec<_> = chunks
            .iter()
            .filter_map(|chunk| chunk.section_name.clone())
            .collect();
        assert!(sections.contains(&"Abstract".to_string()));
        assert!(sections.contains(&"Results".to_string()));
        Ok(())
    }

    #[test]
    fn preamble_before_first_heading_is_kept() -> Result<(), IngestError> {
        let text = "Draft title line\nIntroduction\nBody of the introduction section.";
        let chunks = chunk_page(1, 1, text, ChunkingOptions::default())?;
        assert!(chunks[0].section_name.is_none());
        assert!(chunks[0].text.starts_with("Draft title line"));
        Ok(())
    }

    #[test]
    fn empty_page_yields_no_chunks() -> Result<(), IngestError> {
        let chunks = chunk_page(1, 1, "   \n  ", ChunkingOptions::default())?;
        assert!(chunks.is_empty());
        Ok(())
    }

    #[test]
    fn rejects_overlap_wider_than_window() {
        let options = ChunkingOptions {
            max_chars: 10,
            overlap_chars: 10,
        };
        assert!(chunk_page(1, 1, "text", options).is_err());
    }
}
