use crate::chunking::{chunk_page, ChunkingOptions};
use crate::error::IngestError;
use crate::extractor::extract_page_texts;
use crate::metadata::{IndexStage, MetadataStore};
use crate::models::{FigureRecord, PageRecord};
use crate::traits::{Captioner, EmbeddingService, OcrService, TextIndex, VisualIndex};
use regex::Regex;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

pub fn discover_pdf_files(folder: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();

    for entry in WalkDir::new(folder)
        .into_iter()
        .filter_map(|item| item.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }

        let is_pdf = entry
            .path()
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"));

        if is_pdf {
            files.push(entry.path().to_path_buf());
        }
    }

    files.sort_unstable();
    files
}

pub fn digest_file(path: &Path) -> Result<String, IngestError> {
    let bytes = fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("{:x}", hasher.finalize()))
}

#[derive(Debug, Clone, Default)]
pub struct IngestOptions {
    /// Re-ingest even when the file hash is unchanged.
    pub force: bool,
    /// Root directory of rendered page images, one subdirectory per document
    /// stem holding `p{page}.png` files.
    pub pages_dir: Option<PathBuf>,
    /// Root directory of figure crops, one subdirectory per document stem
    /// holding `p{page}_f{id}.png` files.
    pub figures_dir: Option<PathBuf>,
    pub chunking: ChunkingOptions,
}

#[derive(Debug)]
pub enum IngestOutcome {
    /// File hash unchanged and already ingested.
    Skipped { doc_id: i64 },
    Ingested {
        doc_id: i64,
        pages: usize,
        chunks: usize,
        figures: usize,
    },
}

/// Extraction-to-metadata pipeline for one corpus. Indexing into the text and
/// visual backends is a separate stage (`index_document_text` /
/// `index_document_visual`) so each can be retried independently.
pub struct IngestPipeline<O, C> {
    metadata: Arc<MetadataStore>,
    ocr: O,
    captioner: C,
    options: IngestOptions,
}

impl<O, C> IngestPipeline<O, C>
where
    O: OcrService,
    C: Captioner,
{
    pub fn new(metadata: Arc<MetadataStore>, ocr: O, captioner: C, options: IngestOptions) -> Self {
        Self {
            metadata,
            ocr,
            captioner,
            options,
        }
    }

    /// Ingests one PDF: pages, chunks and figures land in the metadata store
    /// under a `doc_id` that is stable across re-ingestion of the same path.
    pub async fn ingest_pdf(&self, path: &Path) -> Result<IngestOutcome, IngestError> {
        let file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| {
                IngestError::MissingFileName(format!("path missing filename: {}", path.display()))
            })?
            .to_string();
        let file_path = path.to_string_lossy().to_string();
        let file_hash = digest_file(path)?;

        if !self.options.force {
            if let Some(existing) = self.metadata.get_document_by_path(&file_path)? {
                if existing.file_hash == file_hash && existing.ingested_at.is_some() {
                    debug!(doc_id = existing.doc_id, file = %file_name, "unchanged; skipping");
                    return Ok(IngestOutcome::Skipped {
                        doc_id: existing.doc_id,
                    });
                }
            }
        }

        let pages = extract_page_texts(path)?;
        let document =
            self.metadata
                .upsert_document(&file_path, &file_name, &file_hash, pages.len() as u32)?;
        let doc_id = document.doc_id;
        let stem = document_stem(path);

        let mut chunk_total = 0usize;
        for page in &pages {
            let rendered = self
                .options
                .pages_dir
                .as_ref()
                .map(|root| root.join(&stem).join(format!("p{}.png", page.number)))
                .filter(|candidate| candidate.is_file())
                .map(|candidate| candidate.to_string_lossy().to_string());

            self.metadata.upsert_page(&PageRecord {
                doc_id,
                page_num: page.number,
                extracted_text: Some(page.text.clone()),
                rendered_image_path: rendered,
            })?;

            let chunks = chunk_page(doc_id, page.number, &page.text, self.options.chunking)?;
            chunk_total += chunks.len();
            self.metadata.replace_chunks(doc_id, page.number, &chunks)?;
        }

        let figure_total = match &self.options.figures_dir {
            Some(root) => self.ingest_figures(doc_id, &root.join(&stem)).await?,
            None => 0,
        };

        self.metadata.mark_ingested(doc_id)?;
        info!(
            doc_id,
            file = %file_name,
            pages = pages.len(),
            chunks = chunk_total,
            figures = figure_total,
            "document ingested"
        );

        Ok(IngestOutcome::Ingested {
            doc_id,
            pages: pages.len(),
            chunks: chunk_total,
            figures: figure_total,
        })
    }

    /// Scans a per-document figure directory for `p{page}_f{id}.png` crops and
    /// enriches each through OCR and captioning. A failing collaborator
    /// degrades the figure rather than the ingestion.
    async fn ingest_figures(&self, doc_id: i64, figure_dir: &Path) -> Result<usize, IngestError> {
        if !figure_dir.is_dir() {
            return Ok(0);
        }
        let name_re = Regex::new(r"^p(\d+)_f(\d+)\.png$")?;

        let mut crops = Vec::new();
        for entry in fs::read_dir(figure_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(captures) = name_re.captures(name) else {
                continue;
            };
            let page_num: u32 = captures[1].parse().map_err(|_| {
                IngestError::InvalidArgument(format!("figure page out of range: {name}"))
            })?;
            let figure_id: u32 = captures[2].parse().map_err(|_| {
                IngestError::InvalidArgument(format!("figure id out of range: {name}"))
            })?;
            crops.push((page_num, figure_id, entry.path()));
        }
        crops.sort_unstable_by_key(|(page_num, figure_id, _)| (*page_num, *figure_id));

        for (page_num, figure_id, image_path) in &crops {
            let ocr_text = match self.ocr.extract_text(image_path).await {
                Ok(text) if text.is_empty() => None,
                Ok(text) => Some(text),
                Err(error) => {
                    warn!(doc_id, page = page_num, %error, "figure OCR failed; storing without transcript");
                    None
                }
            };
            let enrichment = match self.captioner.caption(image_path).await {
                Ok(enrichment) => enrichment,
                Err(error) => {
                    warn!(doc_id, page = page_num, %error, "figure captioning failed; storing OCR-only");
                    None
                }
            };

            self.metadata.upsert_figure(&FigureRecord {
                doc_id,
                page_num: *page_num,
                figure_id: *figure_id,
                image_path: image_path.to_string_lossy().to_string(),
                ocr_text,
                enrichment,
            })?;
        }

        Ok(crops.len())
    }

    /// Best-effort ingestion over every PDF found under `folder`. A broken
    /// file is reported and skipped; it never aborts the corpus.
    pub async fn ingest_folder(&self, folder: &Path) -> Result<IngestReport, IngestError> {
        let files = discover_pdf_files(folder);
        if files.is_empty() {
            return Err(IngestError::InvalidArgument(format!(
                "no pdf files found in {}",
                folder.display()
            )));
        }

        let mut outcomes = Vec::new();
        let mut skipped_files = Vec::new();
        for path in files {
            match self.ingest_pdf(&path).await {
                Ok(outcome) => outcomes.push(outcome),
                Err(error) => {
                    warn!(file = %path.display(), %error, "ingestion failed; skipping file");
                    skipped_files.push(SkippedPdf {
                        path,
                        reason: error.to_string(),
                    });
                }
            }
        }

        Ok(IngestReport {
            outcomes,
            skipped_files,
        })
    }
}

pub struct SkippedPdf {
    pub path: PathBuf,
    pub reason: String,
}

pub struct IngestReport {
    pub outcomes: Vec<IngestOutcome>,
    pub skipped_files: Vec<SkippedPdf>,
}

fn document_stem(path: &Path) -> String {
    path.file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or("document")
        .to_string()
}

/// Embeds a document's chunks and writes them to the text index. Skips work
/// when the current file hash is already text-indexed, unless forced.
pub async fn index_document_text<E, T>(
    metadata: &MetadataStore,
    embedder: &E,
    text_index: &T,
    doc_id: i64,
    force: bool,
) -> Result<usize, IngestError>
where
    E: EmbeddingService,
    T: TextIndex,
{
    if !force && metadata.is_indexed(doc_id, IndexStage::Text)? {
        debug!(doc_id, "text index up to date; skipping");
        return Ok(0);
    }

    let chunks = metadata.chunks_for_document(doc_id)?;
    if chunks.is_empty() {
        metadata.mark_text_indexed(doc_id)?;
        return Ok(0);
    }

    let mut embeddings = Vec::with_capacity(chunks.len());
    for chunk in &chunks {
        embeddings.push(embedder.embed(&chunk.text).await?);
    }
    text_index.index_chunks(&chunks, &embeddings).await?;
    metadata.mark_text_indexed(doc_id)?;
    info!(doc_id, chunks = chunks.len(), "text index updated");
    Ok(chunks.len())
}

/// Submits a document's rendered page images to the visual index. With no
/// rendered pages (or a stub index) this marks the stage done and moves on.
pub async fn index_document_visual<V>(
    metadata: &MetadataStore,
    visual_index: &V,
    doc_id: i64,
    force: bool,
) -> Result<usize, IngestError>
where
    V: VisualIndex,
{
    if !force && metadata.is_indexed(doc_id, IndexStage::Visual)? {
        debug!(doc_id, "visual index up to date; skipping");
        return Ok(0);
    }

    let page_images: Vec<String> = metadata
        .pages(doc_id)?
        .into_iter()
        .filter_map(|page| page.rendered_image_path)
        .collect();

    if page_images.is_empty() {
        debug!(doc_id, "no rendered pages; visual stage has nothing to do");
        metadata.mark_visual_indexed(doc_id)?;
        return Ok(0);
    }

    visual_index.index_pages(doc_id, &page_images).await?;
    metadata.mark_visual_indexed(doc_id)?;
    info!(doc_id, pages = page_images.len(), "visual index updated");
    Ok(page_images.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{NoOpCaptioner, NoOpOcr};
    use std::fs::{self, File};
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn discover_pdf_files_is_recursive() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let base = dir.path();
        let nested = base.join("nested");
        fs::create_dir(&nested)?;

        File::create(base.join("a.pdf")).and_then(|mut file| file.write_all(b"%PDF-1.4\n%fake"))?;
        File::create(nested.join("b.pdf"))
            .and_then(|mut file| file.write_all(b"%PDF-1.4\n%fake"))?;

        let files = discover_pdf_files(base);
        assert_eq!(files.len(), 2);
        Ok(())
    }

    #[test]
    fn checksum_is_reproducible() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let file_path = dir.path().join("a.pdf");
        fs::write(&file_path, b"abc")?;

        let first = digest_file(&file_path)?;
        let second = digest_file(&file_path)?;
        assert_eq!(first, second);
        Ok(())
    }

    #[tokio::test]
    async fn ingest_folder_fails_without_pdfs() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let pipeline = IngestPipeline::new(
            Arc::new(MetadataStore::open_in_memory()?),
            NoOpOcr,
            NoOpCaptioner,
            IngestOptions::default(),
        );
        assert!(pipeline.ingest_folder(dir.path()).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn broken_pdfs_are_reported_not_fatal() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        fs::write(dir.path().join("unreadable.pdf"), b"%PDF-1.4\n%broken")?;

        let pipeline = IngestPipeline::new(
            Arc::new(MetadataStore::open_in_memory()?),
            NoOpOcr,
            NoOpCaptioner,
            IngestOptions::default(),
        );
        let report = pipeline.ingest_folder(dir.path()).await?;
        assert!(report.outcomes.is_empty());
        assert_eq!(report.skipped_files.len(), 1);
        assert_eq!(
            report.skipped_files[0]
                .path
                .file_name()
                .and_then(|name| name.to_str()),
            Some("unreadable.pdf")
        );
        Ok(())
    }

    #[tokio::test]
    async fn figure_crops_follow_naming_convention() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let figure_dir = dir.path().join("paper");
        fs::create_dir(&figure_dir)?;
        fs::write(figure_dir.join("p2_f0.png"), b"fake png")?;
        fs::write(figure_dir.join("p2_f1.png"), b"fake png")?;
        fs::write(figure_dir.join("notes.txt"), b"ignored")?;

        let store = Arc::new(MetadataStore::open_in_memory()?);
        let doc = store.upsert_document("/corpus/paper.pdf", "paper.pdf", "hash", 3)?;
        let pipeline = IngestPipeline::new(
            Arc::clone(&store),
            NoOpOcr,
            NoOpCaptioner,
            IngestOptions::default(),
        );

        let count = pipeline.ingest_figures(doc.doc_id, &figure_dir).await?;
        assert_eq!(count, 2);

        let figures = store.figures_for_page(doc.doc_id, 2)?;
        assert_eq!(figures.len(), 2);
        assert_eq!(figures[0].figure_id, 0);
        assert!(figures[0].ocr_text.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn failing_captioner_degrades_figures_to_ocr_only(
    ) -> Result<(), Box<dyn std::error::Error>> {
        use crate::models::FigureEnrichment;
        use crate::traits::Captioner;
        use async_trait::async_trait;

        struct FailingCaptioner;

        #[async_trait]
        impl Captioner for FailingCaptioner {
            async fn caption(
                &self,
                _image_path: &std::path::Path,
            ) -> Result<Option<FigureEnrichment>, IngestError> {
                Err(IngestError::InvalidArgument(
                    "caption endpoint unreachable".to_string(),
                ))
            }
        }

        let dir = tempdir()?;
        let figure_dir = dir.path().join("paper");
        fs::create_dir(&figure_dir)?;
        fs::write(figure_dir.join("p1_f0.png"), b"fake png")?;

        let store = Arc::new(MetadataStore::open_in_memory()?);
        let doc = store.upsert_document("/corpus/paper.pdf", "paper.pdf", "hash", 1)?;
        let pipeline = IngestPipeline::new(
            Arc::clone(&store),
            NoOpOcr,
            FailingCaptioner,
            IngestOptions::default(),
        );

        let count = pipeline.ingest_figures(doc.doc_id, &figure_dir).await?;
        assert_eq!(count, 1);

        let figures = store.figures_for_page(doc.doc_id, 1)?;
        assert_eq!(figures.len(), 1);
        assert!(figures[0].enrichment.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn text_indexing_skips_when_hash_unchanged() -> Result<(), Box<dyn std::error::Error>> {
        use crate::models::ChunkRecord;
        use crate::traits::{TextHit, TextIndex};
        use async_trait::async_trait;
        use std::sync::atomic::{AtomicUsize, Ordering};

        struct CountingIndex {
            calls: AtomicUsize,
        }

        #[async_trait]
        impl TextIndex for &CountingIndex {
            async fn index_chunks(
                &self,
                _chunks: &[ChunkRecord],
                _embeddings: &[Vec<f32>],
            ) -> Result<(), crate::error::QueryError> {
                self.calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }

            async fn search(
                &self,
                _query_vector: &[f32],
                _top_k: usize,
            ) -> Result<Vec<TextHit>, crate::error::QueryError> {
                Ok(Vec::new())
            }
        }

        struct FixedEmbedder;

        #[async_trait]
        impl crate::traits::EmbeddingService for FixedEmbedder {
            async fn embed(&self, _text: &str) -> Result<Vec<f32>, crate::error::QueryError> {
                Ok(vec![0.1, 0.2])
            }
        }

        let store = MetadataStore::open_in_memory()?;
        let doc = store.upsert_document("/corpus/paper.pdf", "paper.pdf", "hash", 1)?;
        store.replace_chunks(
            doc.doc_id,
            1,
            &[ChunkRecord {
                doc_id: doc.doc_id,
                page_num: 1,
                chunk_id: 0,
                section_name: None,
                text: "body".to_string(),
                offset_start: 0,
                offset_end: 4,
            }],
        )?;

        let index = CountingIndex {
            calls: AtomicUsize::new(0),
        };
        index_document_text(&store, &FixedEmbedder, &&index, doc.doc_id, false).await?;
        index_document_text(&store, &FixedEmbedder, &&index, doc.doc_id, false).await?;
        assert_eq!(index.calls.load(Ordering::SeqCst), 1);

        index_document_text(&store, &FixedEmbedder, &&index, doc.doc_id, true).await?;
        assert_eq!(index.calls.load(Ordering::SeqCst), 2);
        Ok(())
    }
}
