pub mod chunking;
pub mod citation;
pub mod config;
pub mod error;
pub mod extractor;
pub mod generator;
pub mod ingest;
pub mod metadata;
pub mod models;
pub mod orchestrator;
pub mod policy;
pub mod retriever;
pub mod services;
pub mod stores;
pub mod traits;

pub use chunking::{chunk_page, infer_section_spans, ChunkingOptions};
pub use citation::{extract_citations, Citation};
pub use config::AppConfig;
pub use error::{
    ConfigError, IngestError, PolicyViolation, QueryError, LANGUAGE_POLICY_MESSAGE,
};
pub use extractor::{extract_page_texts, PageText};
pub use generator::{AnswerGenerator, ANSWER_SYSTEM_PROMPT, INSUFFICIENT_EVIDENCE_ANSWER};
pub use ingest::{
    digest_file, discover_pdf_files, index_document_text, index_document_visual, IngestOptions,
    IngestOutcome, IngestPipeline, IngestReport, SkippedPdf,
};
pub use metadata::{IndexStage, MetadataStore};
pub use models::{
    ChunkRecord, CitationKind, DocumentRecord, DraftAnswer, EvidenceItem, EvidencePayload,
    EvidenceSet, FigureEnrichment, FigureRecord, FinalAnswer, PageRecord, ResolvedCitation,
};
pub use orchestrator::QueryCoordinator;
pub use policy::{enforce_english, is_english_script, PolicyGuard};
pub use retriever::HybridRetriever;
pub use services::{
    HttpCaptioner, HttpEmbedder, HttpGenerator, HttpOcr, NoOpCaptioner, NoOpOcr,
};
pub use stores::{HttpVisualIndex, QdrantTextIndex, StubVisualIndex};
pub use traits::{
    Captioner, EmbeddingService, GenerationService, OcrService, PageHit, TextHit, TextIndex,
    VisualIndex,
};
