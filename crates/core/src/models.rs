use crate::citation::Citation;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub doc_id: i64,
    pub file_path: String,
    pub file_name: String,
    pub file_hash: String,
    pub num_pages: u32,
    pub ingested_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageRecord {
    pub doc_id: i64,
    pub page_num: u32,
    pub extracted_text: Option<String>,
    pub rendered_image_path: Option<String>,
}

/// The smallest text-citable unit. `chunk_id` is the chunk's index within its
/// page; the `(doc_id, page_num, chunk_id)` triple is unique system-wide.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub doc_id: i64,
    pub page_num: u32,
    pub chunk_id: u32,
    pub section_name: Option<String>,
    pub text: String,
    pub offset_start: u32,
    pub offset_end: u32,
}

impl ChunkRecord {
    pub fn citation(&self) -> Citation {
        Citation::new(self.doc_id, self.page_num, self.chunk_id)
    }
}

/// Derived text produced by the captioning collaborator. Absent entirely when
/// captioning is unavailable; the figure then degrades to OCR-only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FigureEnrichment {
    pub caption: String,
    pub entities: Vec<String>,
    pub bullets: Vec<String>,
}

/// The smallest figure-citable unit, keyed by `(doc_id, page_num, figure_id)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FigureRecord {
    pub doc_id: i64,
    pub page_num: u32,
    pub figure_id: u32,
    pub image_path: String,
    pub ocr_text: Option<String>,
    pub enrichment: Option<FigureEnrichment>,
}

impl FigureRecord {
    pub fn citation(&self) -> Citation {
        Citation::new(self.doc_id, self.page_num, self.figure_id)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum CitationKind {
    Chunk,
    Figure,
}

/// A citation token resolved against the metadata store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResolvedCitation {
    pub kind: CitationKind,
    pub doc_id: i64,
    pub page_num: u32,
    pub unit_id: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EvidencePayload {
    /// A chunk hit from the text index.
    Text(ChunkRecord),
    /// A page-level visual hit; grounds an image-level claim, not a chunk.
    VisualPage { doc_id: i64, page_num: u32 },
    /// A figure attached as auxiliary evidence for a visual page hit.
    Figure(FigureRecord),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceItem {
    pub score: f64,
    pub payload: EvidencePayload,
}

impl EvidenceItem {
    /// Citation tokens this item supplies to the generator. Visual page hits
    /// are not themselves citable; only their attached figures are.
    pub fn citations(&self) -> Vec<Citation> {
        match &self.payload {
            EvidencePayload::Text(chunk) => vec![chunk.citation()],
            EvidencePayload::VisualPage { .. } => Vec::new(),
            EvidencePayload::Figure(figure) => vec![figure.citation()],
        }
    }

    pub(crate) fn sort_key(&self) -> (i64, u32, u32, u8) {
        match &self.payload {
            EvidencePayload::Text(chunk) => (chunk.doc_id, chunk.page_num, chunk.chunk_id, 0),
            EvidencePayload::VisualPage { doc_id, page_num } => (*doc_id, *page_num, 0, 1),
            EvidencePayload::Figure(figure) => {
                (figure.doc_id, figure.page_num, figure.figure_id, 2)
            }
        }
    }
}

/// The bounded, ranked, per-query evidence collection. Built fresh per query
/// and never persisted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvidenceSet {
    pub items: Vec<EvidenceItem>,
}

impl EvidenceSet {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// The set of citation tokens the generator is allowed to emit.
    pub fn supplied_citations(&self) -> HashSet<Citation> {
        self.items
            .iter()
            .flat_map(EvidenceItem::citations)
            .collect()
    }

    pub fn text_chunks(&self) -> impl Iterator<Item = &ChunkRecord> {
        self.items.iter().filter_map(|item| match &item.payload {
            EvidencePayload::Text(chunk) => Some(chunk),
            _ => None,
        })
    }

    pub fn figures(&self) -> impl Iterator<Item = &FigureRecord> {
        self.items.iter().filter_map(|item| match &item.payload {
            EvidencePayload::Figure(figure) => Some(figure),
            _ => None,
        })
    }
}

/// Raw generator output; `raw_citations` come from scanning `text` and are
/// untrusted until the policy guard validates them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DraftAnswer {
    pub text: String,
    pub raw_citations: Vec<Citation>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalAnswer {
    pub text: String,
    pub resolved_citations: Vec<ResolvedCitation>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(doc_id: i64, page_num: u32, chunk_id: u32) -> ChunkRecord {
        ChunkRecord {
            doc_id,
            page_num,
            chunk_id,
            section_name: None,
            text: "body".to_string(),
            offset_start: 0,
            offset_end: 4,
        }
    }

    #[test]
    fn visual_page_hits_supply_no_citations() {
        let set = EvidenceSet {
            items: vec![
                EvidenceItem {
                    score: 0.9,
                    payload: EvidencePayload::Text(chunk(3, 2, 5)),
                },
                EvidenceItem {
                    score: 0.4,
                    payload: EvidencePayload::VisualPage {
                        doc_id: 1,
                        page_num: 7,
                    },
                },
            ],
        };

        let supplied = set.supplied_citations();
        assert_eq!(supplied.len(), 1);
        assert!(supplied.contains(&Citation::new(3, 2, 5)));
    }
}
