use crate::citation::{bracketed_spans, Citation};
use crate::error::{PolicyViolation, QueryError};
use crate::generator::INSUFFICIENT_EVIDENCE_ANSWER;
use crate::metadata::MetadataStore;
use crate::models::{DraftAnswer, EvidenceSet, FinalAnswer, ResolvedCitation};

/// Returns true when `text` contains no characters from common non-English
/// scripts. Greek is allowed for scientific notation; symbols and math pass.
pub fn is_english_script(text: &str) -> bool {
    !text.chars().any(is_blocked_script_char)
}

fn is_blocked_script_char(c: char) -> bool {
    matches!(c,
        '\u{4e00}'..='\u{9fff}'   // CJK Unified Ideographs
        | '\u{3040}'..='\u{30ff}' // Hiragana/Katakana
        | '\u{ac00}'..='\u{d7af}' // Hangul
        | '\u{0400}'..='\u{04ff}' // Cyrillic
        | '\u{0600}'..='\u{06ff}' // Arabic
        | '\u{0900}'..='\u{097f}' // Devanagari
        | '\u{0e00}'..='\u{0e7f}' // Thai
        | '\u{0590}'..='\u{05ff}' // Hebrew
    )
}

/// English-only gate for any outward-facing text surface. The draft is
/// discarded on failure, never stripped or sanitized.
pub fn enforce_english(text: &str) -> Result<&str, PolicyViolation> {
    if is_english_script(text) {
        Ok(text)
    } else {
        Err(PolicyViolation::Language)
    }
}

/// Validates a draft answer against the language and citation policies.
///
/// Per draft the checks run in a fixed order (script, then citations, then
/// the per-sentence rule); the first failure rejects the whole answer. There
/// is no partial acceptance.
pub struct PolicyGuard<'a> {
    metadata: &'a MetadataStore,
}

impl<'a> PolicyGuard<'a> {
    pub fn new(metadata: &'a MetadataStore) -> Self {
        Self { metadata }
    }

    pub fn enforce(
        &self,
        draft: &DraftAnswer,
        evidence: &EvidenceSet,
    ) -> Result<FinalAnswer, QueryError> {
        enforce_english(&draft.text).map_err(QueryError::Policy)?;

        // The fixed no-evidence answer is the one citation-free output the
        // pipeline may emit.
        if draft.text.trim() == INSUFFICIENT_EVIDENCE_ANSWER {
            return Ok(FinalAnswer {
                text: draft.text.clone(),
                resolved_citations: Vec::new(),
            });
        }

        let supplied = evidence.supplied_citations();
        let mut resolved: Vec<ResolvedCitation> = Vec::new();

        for span in bracketed_spans(&draft.text) {
            let citation = Citation::parse(span).ok_or_else(|| {
                PolicyViolation::Citation(format!("malformed citation token {span}"))
            })?;
            if !supplied.contains(&citation) {
                return Err(PolicyViolation::Citation(format!(
                    "citation {citation} was not part of the supplied evidence"
                ))
                .into());
            }
            let unit = self.metadata.resolve(&citation)?.ok_or_else(|| {
                PolicyViolation::Citation(format!("citation {citation} does not resolve"))
            })?;
            if !resolved.contains(&unit) {
                resolved.push(unit);
            }
        }

        for sentence in split_sentences(&draft.text) {
            if sentence.requires_citation() && sentence.citation_count == 0 {
                return Err(PolicyViolation::Citation(format!(
                    "sentence lacks a citation: {:?}",
                    sentence.preview()
                ))
                .into());
            }
        }

        Ok(FinalAnswer {
            text: draft.text.clone(),
            resolved_citations: resolved,
        })
    }
}

#[derive(Debug)]
struct Sentence<'a> {
    text: &'a str,
    terminator: Option<char>,
    citation_count: usize,
}

impl Sentence<'_> {
    /// The per-sentence citation rule applies to declarative sentences only:
    /// terminated by '.' or '!' and carrying at least three alphabetic words.
    /// Short labels, headings and interrogatives are exempt.
    fn requires_citation(&self) -> bool {
        if !matches!(self.terminator, Some('.') | Some('!')) {
            return false;
        }
        let word_count = self
            .text
            .split_whitespace()
            .filter(|word| word.chars().any(|c| c.is_ascii_alphabetic()))
            .count();
        word_count >= 3
    }

    fn preview(&self) -> String {
        let trimmed = self.text.trim();
        if trimmed.len() <= 60 {
            trimmed.to_string()
        } else {
            let cut = trimmed
                .char_indices()
                .take_while(|(index, _)| *index < 60)
                .last()
                .map(|(index, c)| index + c.len_utf8())
                .unwrap_or(0);
            format!("{}...", &trimmed[..cut])
        }
    }
}

/// Splits text into sentences at '.', '!' or '?' boundaries. Citation groups
/// immediately following a terminator are absorbed into the preceding
/// sentence, so "Claim. [1:2:3]" counts as a cited sentence.
fn split_sentences(text: &str) -> Vec<Sentence<'_>> {
    let mut sentences = Vec::new();
    let bytes = text.as_bytes();
    let mut start = 0usize;
    let mut index = 0usize;

    while index < bytes.len() {
        let byte = bytes[index];
        if byte == b'.' || byte == b'!' || byte == b'?' {
            // A '.' inside a decimal ("3.5 Jy") or after an abbreviation
            // ("e.g.") does not end the sentence.
            if byte == b'.' && (within_number(bytes, index) || ends_abbreviation(&text[start..index]))
            {
                index += 1;
                continue;
            }
            let terminator = byte as char;
            let mut end = index + 1;

            // Absorb trailing whitespace and citation tokens.
            loop {
                let mut cursor = end;
                while cursor < bytes.len() && (bytes[cursor] == b' ' || bytes[cursor] == b'\t') {
                    cursor += 1;
                }
                if cursor < bytes.len() && bytes[cursor] == b'[' {
                    match text[cursor..].find(']') {
                        Some(close) if Citation::parse(&text[cursor..=cursor + close]).is_some() => {
                            end = cursor + close + 1;
                            continue;
                        }
                        _ => break,
                    }
                }
                break;
            }

            push_sentence(&mut sentences, &text[start..end], Some(terminator));
            start = end;
            index = end;
        } else {
            index += 1;
        }
    }

    if start < text.len() {
        push_sentence(&mut sentences, &text[start..], None);
    }

    sentences
}

fn within_number(bytes: &[u8], index: usize) -> bool {
    index > 0
        && index + 1 < bytes.len()
        && bytes[index - 1].is_ascii_digit()
        && bytes[index + 1].is_ascii_digit()
}

/// True when the text up to (but excluding) a '.' ends in an abbreviation:
/// either a single letter ("e.g." is seen letter by letter) or a short form
/// common in scientific prose.
fn ends_abbreviation(prefix: &str) -> bool {
    const ABBREVIATIONS: [&str; 6] = ["e.g", "i.e", "cf", "vs", "fig", "eq"];
    let Some(last_word) = prefix.split_whitespace().next_back() else {
        return false;
    };
    if last_word.len() == 1 && last_word.chars().all(|c| c.is_ascii_alphabetic()) {
        return true;
    }
    ABBREVIATIONS
        .iter()
        .any(|abbr| last_word.eq_ignore_ascii_case(abbr))
}

fn push_sentence<'a>(sentences: &mut Vec<Sentence<'a>>, raw: &'a str, terminator: Option<char>) {
    if raw.trim().is_empty() {
        return;
    }
    let citation_count = crate::citation::extract_citations(raw).len();
    sentences.push(Sentence {
        text: raw,
        terminator,
        citation_count,
    });
}
