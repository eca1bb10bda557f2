use crate::config::RetrievalConfig;
use crate::error::QueryError;
use crate::metadata::MetadataStore;
use crate::models::{EvidenceItem, EvidencePayload, EvidenceSet};
use crate::traits::{EmbeddingService, PageHit, TextHit, TextIndex, VisualIndex};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Queries the text and visual indices in parallel and fuses their hits into
/// one bounded, deterministically ordered evidence set.
///
/// The query path is read-only: no store is written while a question is being
/// answered, so cancellation at any await point needs no cleanup.
pub struct HybridRetriever<E, T, V> {
    embedder: E,
    text_index: T,
    visual_index: V,
    metadata: Arc<MetadataStore>,
    config: RetrievalConfig,
    index_timeout: Duration,
}

impl<E, T, V> HybridRetriever<E, T, V>
where
    E: EmbeddingService,
    T: TextIndex,
    V: VisualIndex,
{
    pub fn new(
        embedder: E,
        text_index: T,
        visual_index: V,
        metadata: Arc<MetadataStore>,
        config: RetrievalConfig,
        index_timeout: Duration,
    ) -> Self {
        Self {
            embedder,
            text_index,
            visual_index,
            metadata,
            config,
            index_timeout,
        }
    }

    pub async fn retrieve(
        &self,
        question: &str,
        k_text: usize,
        k_visual: usize,
    ) -> Result<EvidenceSet, QueryError> {
        if question.trim().is_empty() {
            return Err(QueryError::Request("question is empty".to_string()));
        }

        let millis = self.index_timeout.as_millis() as u64;
        let query_vector = self.embedder.embed(question).await?;

        let text_lookup = async {
            tokio::time::timeout(
                self.index_timeout,
                self.text_index.search(&query_vector, k_text),
            )
            .await
            .map_err(|_elapsed| QueryError::Timeout {
                what: "text index lookup",
                millis,
            })?
        };

        // Visual retrieval degrades to empty on failure or timeout; it is an
        // optional collaborator, not a load-bearing one.
        let visual_lookup = async {
            match tokio::time::timeout(
                self.index_timeout,
                self.visual_index.score_pages(question, k_visual),
            )
            .await
            {
                Ok(Ok(hits)) => hits,
                Ok(Err(error)) => {
                    warn!(%error, "visual retrieval failed; continuing with text-only evidence");
                    Vec::new()
                }
                Err(_elapsed) => {
                    warn!(millis, "visual retrieval timed out; continuing with text-only evidence");
                    Vec::new()
                }
            }
        };

        let (text_hits, visual_hits) = tokio::join!(text_lookup, visual_lookup);
        let text_hits = text_hits?;

        debug!(
            text_hits = text_hits.len(),
            visual_hits = visual_hits.len(),
            "index lookups complete"
        );

        self.fuse(text_hits, visual_hits)
    }

    /// Weighted reciprocal-rank fusion. Rank-based normalization sidesteps the
    /// incomparable score scales of the two indices; ordering is fully
    /// deterministic (fused score desc, then doc_id, page, unit_id).
    fn fuse(
        &self,
        mut text_hits: Vec<TextHit>,
        mut visual_hits: Vec<PageHit>,
    ) -> Result<EvidenceSet, QueryError> {
        text_hits.sort_by(|left, right| {
            right
                .score
                .total_cmp(&left.score)
                .then_with(|| (left.doc_id, left.page_num, left.chunk_id).cmp(&(
                    right.doc_id,
                    right.page_num,
                    right.chunk_id,
                )))
        });
        visual_hits.sort_by(|left, right| {
            right
                .score
                .total_cmp(&left.score)
                .then_with(|| (left.doc_id, left.page_num).cmp(&(right.doc_id, right.page_num)))
        });

        let mut items: Vec<EvidenceItem> = Vec::new();

        for (position, hit) in text_hits.iter().enumerate() {
            let fused = rrf_score(self.config.w_text, self.config.rrf_k, position);
            // The index may lag the metadata store; a failed join means the
            // chunk is not yet citable, so it is dropped, not an error.
            let Some(chunk) = self.metadata.chunk(&crate::citation::Citation::new(
                hit.doc_id,
                hit.page_num,
                hit.chunk_id,
            ))?
            else {
                debug!(
                    doc_id = hit.doc_id,
                    page_num = hit.page_num,
                    chunk_id = hit.chunk_id,
                    "text hit has no metadata row yet; skipping"
                );
                continue;
            };
            items.push(EvidenceItem {
                score: fused,
                payload: EvidencePayload::Text(chunk),
            });
        }

        for (position, hit) in visual_hits.iter().enumerate() {
            let fused = rrf_score(self.config.w_visual, self.config.rrf_k, position);
            items.push(EvidenceItem {
                score: fused,
                payload: EvidencePayload::VisualPage {
                    doc_id: hit.doc_id,
                    page_num: hit.page_num,
                },
            });
            // A visual hit grounds an image-level claim; the page's figures
            // are the citable units backing it.
            for figure in self.metadata.figures_for_page(hit.doc_id, hit.page_num)? {
                items.push(EvidenceItem {
                    score: fused,
                    payload: EvidencePayload::Figure(figure),
                });
            }
        }

        items.sort_by(|left, right| {
            right
                .score
                .total_cmp(&left.score)
                .then_with(|| left.sort_key().cmp(&right.sort_key()))
        });
        items.truncate(self.config.max_evidence_items);

        Ok(EvidenceSet { items })
    }
}

fn rrf_score(weight: f64, rrf_k: f64, position: usize) -> f64 {
    weight * (1.0 / (rrf_k + position as f64 + 1.0))
}
