use async_trait::async_trait;
use chrono::Utc;
use clap::{Parser, Subcommand};
use pdf_rag_core::{
    index_document_text, index_document_visual, AppConfig, Captioner, FigureEnrichment,
    HttpCaptioner, HttpEmbedder, HttpGenerator, HttpOcr, HttpVisualIndex, IngestError,
    IngestOptions, IngestOutcome, IngestPipeline, MetadataStore, NoOpCaptioner, NoOpOcr, OcrService,
    PageHit, QdrantTextIndex, QueryCoordinator, QueryError, StubVisualIndex, VisualIndex,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "pdf-rag", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Configuration file (JSON); missing file means built-in defaults.
    #[arg(long, env = "PDF_RAG_CONFIG", default_value = "config.json")]
    config: PathBuf,

    /// Qdrant base URL
    #[arg(long, env = "QDRANT_URL", default_value = "http://localhost:6333")]
    qdrant_url: String,

    /// Qdrant collection
    #[arg(long, env = "QDRANT_COLLECTION", default_value = "pdf_chunks")]
    qdrant_collection: String,

    /// Embedding vector dimension (must match the embedding model).
    #[arg(long, env = "EMBEDDING_DIM", default_value = "1024")]
    embedding_dim: usize,

    /// OpenAI-compatible endpoint serving the embedding model.
    #[arg(long, env = "EMBEDDING_URL", default_value = "http://localhost:8001")]
    embedding_url: String,

    /// OpenAI-compatible endpoint serving the answer model.
    #[arg(long, env = "GENERATION_URL", default_value = "http://localhost:8000")]
    generation_url: String,

    /// Visual page-retrieval service; omit to run text-only.
    #[arg(long, env = "VISUAL_URL")]
    visual_url: Option<String>,

    /// OCR service for figure crops; omit to skip transcripts.
    #[arg(long, env = "OCR_URL")]
    ocr_url: Option<String>,

    /// Vision endpoint for figure captioning; omit to skip enrichment.
    #[arg(long, env = "CAPTION_URL")]
    caption_url: Option<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Ingest a folder of PDFs into the metadata store.
    Ingest {
        /// Folder that contains PDFs recursively.
        #[arg(long)]
        folder: String,
        /// Re-ingest files whose hash is unchanged.
        #[arg(long, default_value_t = false)]
        force: bool,
        /// Skip figure captioning even when a caption endpoint is set.
        #[arg(long, default_value_t = false)]
        disable_vlm: bool,
        /// Root of rendered page images (overrides the config path).
        #[arg(long)]
        pages_dir: Option<PathBuf>,
        /// Root of figure crops (overrides the config path).
        #[arg(long)]
        figures_dir: Option<PathBuf>,
    },
    /// Push ingested documents into the text and visual indices.
    Index {
        /// Re-index documents whose hash is already indexed.
        #[arg(long, default_value_t = false)]
        force: bool,
        #[arg(long, default_value_t = false)]
        skip_text: bool,
        #[arg(long, default_value_t = false)]
        skip_visual: bool,
    },
    /// Ask a question; the answer is citation-checked before printing.
    Query {
        #[arg(long)]
        question: String,
        /// Emit the answer and resolved citations as JSON.
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Probe the metadata store and retrieval backends.
    Health,
}

/// Visual retrieval is optional; the binding is decided once at startup and
/// stays fixed for the process lifetime.
enum VisualBackend {
    Http(HttpVisualIndex),
    Stub(StubVisualIndex),
}

#[async_trait]
impl VisualIndex for VisualBackend {
    fn is_available(&self) -> bool {
        match self {
            VisualBackend::Http(index) => index.is_available(),
            VisualBackend::Stub(index) => index.is_available(),
        }
    }

    async fn index_pages(&self, doc_id: i64, page_image_paths: &[String]) -> Result<(), QueryError> {
        match self {
            VisualBackend::Http(index) => index.index_pages(doc_id, page_image_paths).await,
            VisualBackend::Stub(index) => index.index_pages(doc_id, page_image_paths).await,
        }
    }

    async fn score_pages(&self, question: &str, top_k: usize) -> Result<Vec<PageHit>, QueryError> {
        match self {
            VisualBackend::Http(index) => index.score_pages(question, top_k).await,
            VisualBackend::Stub(index) => index.score_pages(question, top_k).await,
        }
    }
}

enum OcrBackend {
    Http(HttpOcr),
    NoOp(NoOpOcr),
}

#[async_trait]
impl OcrService for OcrBackend {
    async fn extract_text(&self, image_path: &Path) -> Result<String, IngestError> {
        match self {
            OcrBackend::Http(service) => service.extract_text(image_path).await,
            OcrBackend::NoOp(service) => service.extract_text(image_path).await,
        }
    }
}

enum CaptionBackend {
    Http(HttpCaptioner),
    NoOp(NoOpCaptioner),
}

#[async_trait]
impl Captioner for CaptionBackend {
    async fn caption(&self, image_path: &Path) -> Result<Option<FigureEnrichment>, IngestError> {
        match self {
            CaptionBackend::Http(service) => service.caption(image_path).await,
            CaptionBackend::NoOp(service) => service.caption(image_path).await,
        }
    }
}

fn visual_backend(visual_url: Option<&str>, vlm_model: &str) -> VisualBackend {
    match visual_url {
        Some(url) => VisualBackend::Http(HttpVisualIndex::new(url, vlm_model)),
        None => {
            warn!("no visual retrieval service configured; running text-only");
            VisualBackend::Stub(StubVisualIndex)
        }
    }
}


#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app_version = env!("CARGO_PKG_VERSION");

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer())
        .init();

    // Destructure once; `command` is consumed by the match below while the
    // endpoint flags stay usable in every arm.
    let Cli {
        command,
        config: config_path,
        qdrant_url,
        qdrant_collection,
        embedding_dim,
        embedding_url,
        generation_url,
        visual_url,
        ocr_url,
        caption_url,
    } = Cli::parse();

    // Config is a startup gate: a non-English output language or a missing
    // model identifier must fail here, never at query time.
    let config = AppConfig::load(&config_path)?;

    info!(
        version = app_version,
        started_at = %Utc::now().to_rfc3339(),
        "pdf-rag boot"
    );

    let metadata = Arc::new(MetadataStore::open(Path::new(&config.paths.sqlite_path))?);

    match command {
        Command::Ingest {
            folder,
            force,
            disable_vlm,
            pages_dir,
            figures_dir,
        } => {
            let ocr = match &ocr_url {
                Some(url) => OcrBackend::Http(HttpOcr::new(url)),
                None => OcrBackend::NoOp(NoOpOcr),
            };
            let captioner = match (&caption_url, disable_vlm) {
                (Some(url), false) => {
                    CaptionBackend::Http(HttpCaptioner::new(url, &config.models.vlm_model))
                }
                _ => CaptionBackend::NoOp(NoOpCaptioner),
            };

            let options = IngestOptions {
                force,
                pages_dir: Some(pages_dir.unwrap_or_else(|| PathBuf::from(&config.paths.pages_dir))),
                figures_dir: Some(
                    figures_dir.unwrap_or_else(|| PathBuf::from(&config.paths.figures_dir)),
                ),
                chunking: Default::default(),
            };

            let pipeline = IngestPipeline::new(Arc::clone(&metadata), ocr, captioner, options);
            let report = pipeline.ingest_folder(Path::new(&folder)).await?;

            for skipped in &report.skipped_files {
                warn!(path = %skipped.path.display(), reason = %skipped.reason, "skipped pdf");
            }
            let (mut ingested, mut unchanged) = (0usize, 0usize);
            for outcome in &report.outcomes {
                match outcome {
                    IngestOutcome::Ingested { .. } => ingested += 1,
                    IngestOutcome::Skipped { .. } => unchanged += 1,
                }
            }
            println!(
                "{ingested} document(s) ingested, {unchanged} unchanged, {} skipped",
                report.skipped_files.len()
            );
        }
        Command::Index {
            force,
            skip_text,
            skip_visual,
        } => {
            let embedder = HttpEmbedder::new(&embedding_url, &config.models.text_embedding_model);
            let text_index =
                QdrantTextIndex::new(&qdrant_url, &qdrant_collection, embedding_dim);
            text_index.ensure_collection().await?;
            let visual_index = visual_backend(visual_url.as_deref(), &config.models.vlm_model);

            let documents = metadata.documents()?;
            let mut chunk_total = 0usize;
            let mut page_total = 0usize;
            for document in &documents {
                if document.ingested_at.is_none() {
                    continue;
                }
                if !skip_text {
                    chunk_total += index_document_text(
                        &metadata,
                        &embedder,
                        &text_index,
                        document.doc_id,
                        force,
                    )
                    .await?;
                }
                if !skip_visual {
                    page_total += index_document_visual(
                        &metadata,
                        &visual_index,
                        document.doc_id,
                        force,
                    )
                    .await?;
                }
            }
            println!(
                "{} document(s) visited: {chunk_total} chunks embedded, {page_total} pages submitted",
                documents.len()
            );
        }
        Command::Query { question, json } => {
            let embedder = HttpEmbedder::new(&embedding_url, &config.models.text_embedding_model);
            let text_index =
                QdrantTextIndex::new(&qdrant_url, &qdrant_collection, embedding_dim);
            let visual_index = visual_backend(visual_url.as_deref(), &config.models.vlm_model);
            let generation = HttpGenerator::new(&generation_url, &config.models.llm_model);

            let coordinator = QueryCoordinator::new(
                &config,
                embedder,
                text_index,
                visual_index,
                generation,
                Arc::clone(&metadata),
            );

            let answer = coordinator.answer(&question).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&answer)?);
            } else {
                println!("{}", answer.text);
                if !answer.resolved_citations.is_empty() {
                    println!();
                    println!("citations:");
                    for citation in &answer.resolved_citations {
                        println!(
                            "  [{}:{}:{}] ({:?})",
                            citation.doc_id, citation.page_num, citation.unit_id, citation.kind
                        );
                    }
                }
            }
        }
        Command::Health => {
            let documents = metadata.documents()?;
            println!("metadata store: ok ({} document(s))", documents.len());

            let text_index =
                QdrantTextIndex::new(&qdrant_url, &qdrant_collection, embedding_dim);
            match text_index.ensure_collection().await {
                Ok(()) => println!("text index: ok"),
                Err(error) => println!("text index: unreachable ({error})"),
            }

            let visual_index = visual_backend(visual_url.as_deref(), &config.models.vlm_model);
            if visual_index.is_available() {
                println!("visual index: configured");
            } else {
                println!("visual index: not configured (text-only mode)");
            }
        }
    }

    Ok(())
}
