use crate::error::{IngestError, QueryError};
use crate::models::{ChunkRecord, FigureEnrichment};
use async_trait::async_trait;
use std::path::Path;

/// A text-index hit: identifiers plus the backend's similarity score. The
/// retriever joins identifiers back against the metadata store; the index
/// itself owns only vectors.
#[derive(Debug, Clone)]
pub struct TextHit {
    pub doc_id: i64,
    pub page_num: u32,
    pub chunk_id: u32,
    pub score: f64,
}

/// A page-level visual hit. No sub-page localization.
#[derive(Debug, Clone)]
pub struct PageHit {
    pub doc_id: i64,
    pub page_num: u32,
    pub score: f64,
}

#[async_trait]
pub trait EmbeddingService: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, QueryError>;
}

#[async_trait]
pub trait TextIndex: Send + Sync {
    async fn index_chunks(
        &self,
        chunks: &[ChunkRecord],
        embeddings: &[Vec<f32>],
    ) -> Result<(), QueryError>;

    async fn search(&self, query_vector: &[f32], top_k: usize)
        -> Result<Vec<TextHit>, QueryError>;
}

/// Visual page retrieval. Implementations are selected once at startup; when
/// the collaborator is absent the stub keeps call sites uniform by returning
/// empty results, so degraded mode needs no branching at the call site.
#[async_trait]
pub trait VisualIndex: Send + Sync {
    /// Whether a real backend is bound. Stubs report false so callers can log
    /// the degraded-mode condition once.
    fn is_available(&self) -> bool;

    async fn index_pages(
        &self,
        doc_id: i64,
        page_image_paths: &[String],
    ) -> Result<(), QueryError>;

    async fn score_pages(&self, question: &str, top_k: usize)
        -> Result<Vec<PageHit>, QueryError>;
}

#[async_trait]
pub trait GenerationService: Send + Sync {
    async fn complete(&self, system_prompt: &str, user_prompt: &str)
        -> Result<String, QueryError>;
}

#[async_trait]
pub trait OcrService: Send + Sync {
    async fn extract_text(&self, image_path: &Path) -> Result<String, IngestError>;
}

/// Figure captioning. Returning `Ok(None)` means the collaborator declined or
/// produced unusable output; the figure stays OCR-only.
#[async_trait]
pub trait Captioner: Send + Sync {
    async fn caption(&self, image_path: &Path) -> Result<Option<FigureEnrichment>, IngestError>;
}
