use crate::config::AppConfig;
use crate::error::QueryError;
use crate::generator::AnswerGenerator;
use crate::metadata::MetadataStore;
use crate::models::FinalAnswer;
use crate::policy::PolicyGuard;
use crate::retriever::HybridRetriever;
use crate::traits::{EmbeddingService, GenerationService, TextIndex, VisualIndex};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Wires retrieval, generation and policy enforcement into the single query
/// entry point. Every answer that leaves this type has passed the language
/// gate and carries only citations that resolve against the metadata store
/// and were supplied as evidence.
pub struct QueryCoordinator<E, T, V, G> {
    retriever: HybridRetriever<E, T, V>,
    generator: AnswerGenerator<G>,
    metadata: Arc<MetadataStore>,
    text_top_k: usize,
    visual_top_k: usize,
}

impl<E, T, V, G> QueryCoordinator<E, T, V, G>
where
    E: EmbeddingService,
    T: TextIndex,
    V: VisualIndex,
    G: GenerationService,
{
    pub fn new(
        config: &AppConfig,
        embedder: E,
        text_index: T,
        visual_index: V,
        generation_service: G,
        metadata: Arc<MetadataStore>,
    ) -> Self {
        let retriever = HybridRetriever::new(
            embedder,
            text_index,
            visual_index,
            Arc::clone(&metadata),
            config.retrieval.clone(),
            Duration::from_millis(config.timeouts.index_lookup_ms),
        );
        let generator = AnswerGenerator::new(
            generation_service,
            Duration::from_millis(config.timeouts.generation_ms),
        );
        Self {
            retriever,
            generator,
            metadata,
            text_top_k: config.retrieval.text_top_k,
            visual_top_k: config.retrieval.visual_top_k,
        }
    }

    /// Retrieve, generate, enforce. A policy violation surfaces as an error;
    /// the draft is never silently rewritten to pass.
    pub async fn answer(&self, question: &str) -> Result<FinalAnswer, QueryError> {
        let evidence = self
            .retriever
            .retrieve(question, self.text_top_k, self.visual_top_k)
            .await?;
        debug!(evidence_items = evidence.len(), "retrieval complete");

        let draft = self.generator.generate(question, &evidence).await?;

        let guard = PolicyGuard::new(&self.metadata);
        let answer = guard.enforce(&draft, &evidence)?;
        info!(
            citations = answer.resolved_citations.len(),
            "answer passed policy enforcement"
        );
        Ok(answer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PolicyViolation;
    use crate::generator::INSUFFICIENT_EVIDENCE_ANSWER;
    use crate::models::{ChunkRecord, CitationKind};
    use crate::stores::StubVisualIndex;
    use crate::traits::TextHit;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeEmbedder;

    #[async_trait]
    impl EmbeddingService for FakeEmbedder {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>, QueryError> {
            Ok(vec![0.5, 0.5])
        }
    }

    #[derive(Default)]
    struct FakeTextIndex {
        hits: Vec<TextHit>,
    }

    #[async_trait]
    impl TextIndex for FakeTextIndex {
        async fn index_chunks(
            &self,
            _chunks: &[ChunkRecord],
            _embeddings: &[Vec<f32>],
        ) -> Result<(), QueryError> {
            Ok(())
        }

        async fn search(
            &self,
            _query_vector: &[f32],
            _top_k: usize,
        ) -> Result<Vec<TextHit>, QueryError> {
            Ok(self.hits.clone())
        }
    }

    struct FakeGenerator {
        reply: String,
        calls: AtomicUsize,
    }

    impl FakeGenerator {
        fn new(reply: &str) -> Self {
            Self {
                reply: reply.to_string(),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl GenerationService for &FakeGenerator {
        async fn complete(
            &self,
            _system_prompt: &str,
            _user_prompt: &str,
        ) -> Result<String, QueryError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.reply.clone())
        }
    }

    fn seeded_store() -> Arc<MetadataStore> {
        let store = MetadataStore::open_in_memory().expect("store");
        store
            .upsert_document("/corpus/paper.pdf", "paper.pdf", "hash", 4)
            .expect("doc");
        store
            .replace_chunks(
                1,
                2,
                &[ChunkRecord {
                    doc_id: 1,
                    page_num: 2,
                    chunk_id: 5,
                    section_name: Some("Results".to_string()),
                    text: "A temperature inversion was observed at dawn.".to_string(),
                    offset_start: 0,
                    offset_end: 45,
                }],
            )
            .expect("chunks");
        Arc::new(store)
    }

    fn single_hit() -> Vec<TextHit> {
        vec![TextHit {
            doc_id: 1,
            page_num: 2,
            chunk_id: 5,
            score: 0.9,
        }]
    }

    fn coordinator(
        store: Arc<MetadataStore>,
        hits: Vec<TextHit>,
        generator: &FakeGenerator,
    ) -> QueryCoordinator<FakeEmbedder, FakeTextIndex, StubVisualIndex, &FakeGenerator> {
        QueryCoordinator::new(
            &AppConfig::default(),
            FakeEmbedder,
            FakeTextIndex { hits },
            StubVisualIndex,
            generator,
            store,
        )
    }

    #[tokio::test]
    async fn cited_answer_passes_end_to_end() {
        let store = seeded_store();
        let fake = FakeGenerator::new("The inversion formed shortly before dawn [1:2:5].");
        let coordinator = coordinator(store, single_hit(), &fake);

        let answer = coordinator.answer("When did it form?").await.expect("answer");
        assert_eq!(answer.resolved_citations.len(), 1);
        assert_eq!(answer.resolved_citations[0].kind, CitationKind::Chunk);
        assert_eq!(
            (answer.resolved_citations[0].doc_id, answer.resolved_citations[0].page_num),
            (1, 2)
        );
    }

    #[tokio::test]
    async fn uncited_claims_are_rejected() {
        let store = seeded_store();
        let fake = FakeGenerator::new("The inversion formed shortly before dawn.");
        let coordinator = coordinator(store, single_hit(), &fake);

        let error = coordinator
            .answer("When did it form?")
            .await
            .expect_err("rejected");
        assert!(matches!(
            error,
            QueryError::Policy(PolicyViolation::Citation(_))
        ));
    }

    #[tokio::test]
    async fn unsupplied_citations_are_rejected() {
        let store = seeded_store();
        // [1:2:5] resolves in the store, but this query's retrieval produced
        // only an orphan hit, so the token was never supplied as evidence.
        let fake = FakeGenerator::new("A claim citing unseen evidence [1:2:5].");
        let hits = vec![TextHit {
            doc_id: 42,
            page_num: 1,
            chunk_id: 0,
            score: 0.9,
        }];
        let coordinator = coordinator(store, hits, &fake);

        let error = coordinator
            .answer("What happened?")
            .await
            .expect_err("rejected");
        assert!(matches!(
            error,
            QueryError::Policy(PolicyViolation::Citation(_))
        ));
    }

    #[tokio::test]
    async fn empty_retrieval_answers_without_generation() {
        let store = seeded_store();
        let fake = FakeGenerator::new("unused");
        let coordinator = coordinator(store, Vec::new(), &fake);

        let answer = coordinator.answer("Unanswerable?").await.expect("answer");
        assert_eq!(answer.text, INSUFFICIENT_EVIDENCE_ANSWER);
        assert!(answer.resolved_citations.is_empty());
        assert_eq!(fake.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn non_english_draft_is_rejected() {
        let store = seeded_store();
        let fake = FakeGenerator::new("夜明けに逆転層が観測された [1:2:5].");
        let coordinator = coordinator(store, single_hit(), &fake);

        let error = coordinator
            .answer("When did it form?")
            .await
            .expect_err("rejected");
        assert!(matches!(
            error,
            QueryError::Policy(PolicyViolation::Language)
        ));
    }
}
