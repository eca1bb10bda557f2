use crate::citation::extract_citations;
use crate::error::QueryError;
use crate::models::{DraftAnswer, EvidenceSet, FigureRecord};
use crate::policy::enforce_english;
use crate::traits::GenerationService;
use std::fmt::Write as _;
use std::time::Duration;
use tracing::debug;

/// Returned without invoking the generation service when retrieval produced
/// nothing. Citations are never fabricated from an empty evidence set.
pub const INSUFFICIENT_EVIDENCE_ANSWER: &str =
    "Insufficient evidence to answer the question from the ingested corpus.";

pub const ANSWER_SYSTEM_PROMPT: &str = "\
You are a senior scientific research assistant.
You MUST follow these rules:
- Output English only.
- Use only the provided evidence.
- Do not hallucinate.
- Every factual claim must have a citation.
- Use citation formats exactly:
  - Text: [doc_id:page:chunk_id]
  - Figure: [doc_id:page:figure_id]
- Cite only tokens that appear in the evidence below.
- If evidence is insufficient, explicitly say so.
";

/// Builds the generation request from an evidence set and invokes the
/// generation service exactly once per query. Retries, if any, belong to the
/// service collaborator, not this layer.
pub struct AnswerGenerator<G> {
    service: G,
    timeout: Duration,
}

impl<G> AnswerGenerator<G>
where
    G: GenerationService,
{
    pub fn new(service: G, timeout: Duration) -> Self {
        Self { service, timeout }
    }

    pub async fn generate(
        &self,
        question: &str,
        evidence: &EvidenceSet,
    ) -> Result<DraftAnswer, QueryError> {
        if evidence.is_empty() {
            debug!("evidence set empty; short-circuiting without a generation call");
            return Ok(DraftAnswer {
                text: INSUFFICIENT_EVIDENCE_ANSWER.to_string(),
                raw_citations: Vec::new(),
            });
        }

        let user_prompt = build_user_prompt(question, evidence).map_err(QueryError::Policy)?;

        let millis = self.timeout.as_millis() as u64;
        let text = tokio::time::timeout(
            self.timeout,
            self.service.complete(ANSWER_SYSTEM_PROMPT, &user_prompt),
        )
        .await
        .map_err(|_elapsed| QueryError::Timeout {
            what: "generation call",
            millis,
        })??;

        let raw_citations = extract_citations(&text);
        Ok(DraftAnswer {
            text,
            raw_citations,
        })
    }
}

/// Renders the evidence set with explicit citation tokens. Evidence text
/// passes the English gate before it is embedded in a prompt: the language
/// invariant is global, not generation-specific.
fn build_user_prompt(
    question: &str,
    evidence: &EvidenceSet,
) -> Result<String, crate::error::PolicyViolation> {
    let mut text_evidence = String::new();
    for chunk in evidence.text_chunks() {
        let _ = writeln!(
            text_evidence,
            "- {} {}",
            chunk.citation(),
            enforce_english(&chunk.text)?
        );
    }
    if text_evidence.is_empty() {
        text_evidence.push_str("(No text evidence available.)\n");
    }

    let mut figure_evidence = String::new();
    for figure in evidence.figures() {
        figure_evidence.push_str(&format_figure_evidence(figure)?);
    }
    if figure_evidence.is_empty() {
        figure_evidence.push_str("(No figure evidence available.)\n");
    }

    Ok(format!(
        "Question:\n{question}\n\n\
         Evidence (text chunks):\n{text_evidence}\n\
         Evidence (figures):\n{figure_evidence}\n\
         Write the answer with this format:\n\
         1) Final answer\n\
         2) Evidence list (bulleted, each bullet includes citations)\n\
         3) Relevant figures (caption + explanation + citations)\n"
    ))
}

fn format_figure_evidence(
    figure: &FigureRecord,
) -> Result<String, crate::error::PolicyViolation> {
    let caption = figure
        .enrichment
        .as_ref()
        .map(|enrichment| enrichment.caption.as_str())
        .unwrap_or("");
    let ocr = figure.ocr_text.as_deref().unwrap_or("");

    let mut block = format!(
        "- {} caption: {}\n  OCR: {}\n",
        figure.citation(),
        enforce_english(caption)?,
        enforce_english(ocr)?
    );

    let bullets = figure
        .enrichment
        .as_ref()
        .map(|enrichment| enrichment.bullets.as_slice())
        .unwrap_or(&[]);
    if bullets.is_empty() {
        block.push_str("  - (No VLM bullets available.)\n");
    } else {
        for bullet in bullets {
            let _ = writeln!(block, "  - {}", enforce_english(bullet)?);
        }
    }
    Ok(block)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::citation::Citation;
    use crate::models::{ChunkRecord, EvidenceItem, EvidencePayload, FigureEnrichment};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

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
            user_prompt: &str,
        ) -> Result<String, QueryError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            assert!(user_prompt.starts_with("Question:"));
            Ok(self.reply.clone())
        }
    }

    fn chunk_item() -> EvidenceItem {
        EvidenceItem {
            score: 0.9,
            payload: EvidencePayload::Text(ChunkRecord {
                doc_id: 3,
                page_num: 2,
                chunk_id: 5,
                section_name: Some("Results".to_string()),
                text: "temperature inversion observed".to_string(),
                offset_start: 0,
                offset_end: 30,
            }),
        }
    }

    fn figure_item() -> EvidenceItem {
        EvidenceItem {
            score: 0.5,
            payload: EvidencePayload::Figure(FigureRecord {
                doc_id: 3,
                page_num: 2,
                figure_id: 0,
                image_path: "figures/p2_f0.png".to_string(),
                ocr_text: Some("altitude vs temperature".to_string()),
                enrichment: Some(FigureEnrichment {
                    caption: "Vertical temperature profile.".to_string(),
                    entities: vec!["temperature".to_string()],
                    bullets: vec!["Inversion layer near 2 km.".to_string()],
                }),
            }),
        }
    }

    #[tokio::test]
    async fn empty_evidence_short_circuits_without_a_call() {
        let fake = FakeGenerator::new("unused");
        let generator = AnswerGenerator::new(&fake, Duration::from_secs(5));

        let draft = generator
            .generate("What was observed?", &EvidenceSet::default())
            .await
            .expect("short circuit");

        assert_eq!(draft.text, INSUFFICIENT_EVIDENCE_ANSWER);
        assert!(draft.raw_citations.is_empty());
        assert_eq!(fake.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn generates_once_and_extracts_citations() {
        let fake = FakeGenerator::new("An inversion was observed near the summit [3:2:5].");
        let generator = AnswerGenerator::new(&fake, Duration::from_secs(5));
        let evidence = EvidenceSet {
            items: vec![chunk_item()],
        };

        let draft = generator
            .generate("What was observed?", &evidence)
            .await
            .expect("draft");

        assert_eq!(draft.raw_citations, vec![Citation::new(3, 2, 5)]);
        assert_eq!(fake.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn prompt_enumerates_tokens_and_figures() {
        let evidence = EvidenceSet {
            items: vec![chunk_item(), figure_item()],
        };
        let prompt = build_user_prompt("What was observed?", &evidence).expect("prompt");

        assert!(prompt.contains("- [3:2:5] temperature inversion observed"));
        assert!(prompt.contains("- [3:2:0] caption: Vertical temperature profile."));
        assert!(prompt.contains("  - Inversion layer near 2 km."));
    }

    #[test]
    fn non_english_evidence_fails_the_prompt_gate() {
        let mut item = chunk_item();
        if let EvidencePayload::Text(chunk) = &mut item.payload {
            chunk.text = "観測された逆転層".to_string();
        }
        let evidence = EvidenceSet { items: vec![item] };
        assert!(build_user_prompt("q", &evidence).is_err());
    }
}
