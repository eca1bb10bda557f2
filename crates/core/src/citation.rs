use serde::{Deserialize, Serialize};
use std::fmt;

/// A citation token ties generated text back to a citable unit.
///
/// Wire format: `[doc_id:page:unit_id]`: three non-negative integers,
/// colon-separated, square brackets, no internal whitespace. Downstream
/// validators parse this literally, so rendering must be bit-exact.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Citation {
    pub doc_id: i64,
    pub page_num: u32,
    pub unit_id: u32,
}

impl Citation {
    pub fn new(doc_id: i64, page_num: u32, unit_id: u32) -> Self {
        Self {
            doc_id,
            page_num,
            unit_id,
        }
    }

    /// Parses a single token of the exact form `[d:p:u]`. Any deviation
    /// (whitespace, signs, missing field) is rejected.
    pub fn parse(token: &str) -> Option<Self> {
        let inner = token.strip_prefix('[')?.strip_suffix(']')?;
        let mut fields = inner.split(':');
        // Each field parses into its exact target type; a value that would
        // overflow is rejected rather than truncated.
        let doc_id: i64 = parse_field(fields.next()?)?;
        let page_num: u32 = parse_field(fields.next()?)?;
        let unit_id: u32 = parse_field(fields.next()?)?;
        if fields.next().is_some() {
            return None;
        }
        Some(Self {
            doc_id,
            page_num,
            unit_id,
        })
    }
}

impl fmt::Display for Citation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}:{}:{}]", self.doc_id, self.page_num, self.unit_id)
    }
}

fn parse_field<T: std::str::FromStr>(field: &str) -> Option<T> {
    if field.is_empty() || !field.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    field.parse().ok()
}

/// Scans `text` for every well-formed citation token, in order of appearance,
/// duplicates included. Bracketed spans that are not exactly `[d:p:u]` are
/// skipped; the policy guard treats those as invalid separately.
pub fn extract_citations(text: &str) -> Vec<Citation> {
    scan_bracketed(text)
        .filter_map(|span| Citation::parse(span))
        .collect()
}

/// Returns every bracketed span (`[` through matching `]`) in the text.
/// Used by the policy guard to flag malformed pseudo-citations.
pub fn bracketed_spans(text: &str) -> Vec<&str> {
    scan_bracketed(text).collect()
}

fn scan_bracketed(text: &str) -> impl Iterator<Item = &str> {
    let bytes = text.as_bytes();
    let mut spans = Vec::new();
    let mut start = None;

    for (index, byte) in bytes.iter().enumerate() {
        match byte {
            b'[' => start = Some(index),
            b']' => {
                if let Some(open) = start.take() {
                    spans.push(&text[open..=index]);
                }
            }
            _ => {}
        }
    }

    spans.into_iter()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_exact_wire_format() {
        let citation = Citation::new(3, 2, 5);
        assert_eq!(citation.to_string(), "[3:2:5]");
        assert_eq!(Citation::parse("[3:2:5]"), Some(citation));
    }

    #[test]
    fn rejects_malformed_tokens() {
        assert_eq!(Citation::parse("[3:2]"), None);
        assert_eq!(Citation::parse("[3:2:5:9]"), None);
        assert_eq!(Citation::parse("[3: 2:5]"), None);
        assert_eq!(Citation::parse("[-3:2:5]"), None);
        assert_eq!(Citation::parse("[a:b:c]"), None);
        assert_eq!(Citation::parse("3:2:5"), None);
    }

    #[test]
    fn rejects_out_of_range_fields_instead_of_truncating() {
        // 2^32 + 1 must not wrap around to page 1.
        assert_eq!(Citation::parse("[1:4294967297:5]"), None);
        assert_eq!(Citation::parse("[1:2:4294967296]"), None);
        assert_eq!(Citation::parse("[99999999999999999999:2:5]"), None);
    }

    #[test]
    fn extracts_tokens_in_order() {
        let text = "Observed inversion [3:2:5]. See figure [3:2:0] and [1:1:2].";
        let found = extract_citations(text);
        assert_eq!(
            found,
            vec![
                Citation::new(3, 2, 5),
                Citation::new(3, 2, 0),
                Citation::new(1, 1, 2)
            ]
        );
    }

    #[test]
    fn bracketed_spans_include_non_citations() {
        let spans = bracketed_spans("valid [1:2:3] and bogus [see ref]");
        assert_eq!(spans, vec!["[1:2:3]", "[see ref]"]);
    }
}
