use crate::error::QueryError;
use crate::traits::{PageHit, VisualIndex};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

/// Page-level visual retrieval backed by a remote late-interaction scoring
/// service (ColPali-style). Scores whole pages; no sub-page localization.
pub struct HttpVisualIndex {
    endpoint: String,
    model: String,
    client: Client,
}

#[derive(Debug, Deserialize)]
struct ScoredPage {
    doc_id: i64,
    page_num: u32,
    score: f64,
}

#[derive(Debug, Deserialize)]
struct ScorePagesResponse {
    #[serde(default)]
    pages: Vec<ScoredPage>,
}

impl HttpVisualIndex {
    pub fn new(endpoint: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            model: model.into(),
            client: Client::new(),
        }
    }
}

#[async_trait]
impl VisualIndex for HttpVisualIndex {
    fn is_available(&self) -> bool {
        true
    }

    async fn index_pages(
        &self,
        doc_id: i64,
        page_image_paths: &[String],
    ) -> Result<(), QueryError> {
        if page_image_paths.is_empty() {
            return Ok(());
        }
        let response = self
            .client
            .post(format!("{}/index_pages", self.endpoint))
            .json(&json!({
                "model": self.model,
                "doc_id": doc_id,
                "pages": page_image_paths,
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(QueryError::BackendResponse {
                backend: "visual-index".to_string(),
                details: response.status().to_string(),
            });
        }
        Ok(())
    }

    async fn score_pages(
        &self,
        question: &str,
        top_k: usize,
    ) -> Result<Vec<PageHit>, QueryError> {
        let response = self
            .client
            .post(format!("{}/score_pages", self.endpoint))
            .json(&json!({
                "model": self.model,
                "query": question,
                "top_k": top_k,
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(QueryError::BackendResponse {
                backend: "visual-index".to_string(),
                details: response.status().to_string(),
            });
        }

        let parsed: ScorePagesResponse = response.json().await?;
        Ok(parsed
            .pages
            .into_iter()
            .map(|page| PageHit {
                doc_id: page.doc_id,
                page_num: page.page_num,
                score: page.score,
            })
            .collect())
    }
}

/// Stand-in bound at startup when no visual retrieval service is configured.
/// Keeps call sites uniform: queries return empty results and log the
/// degraded-mode condition instead of erroring.
#[derive(Debug, Default, Clone, Copy)]
pub struct StubVisualIndex;

#[async_trait]
impl VisualIndex for StubVisualIndex {
    fn is_available(&self) -> bool {
        false
    }

    async fn index_pages(
        &self,
        doc_id: i64,
        page_image_paths: &[String],
    ) -> Result<(), QueryError> {
        warn!(
            doc_id,
            pages = page_image_paths.len(),
            "visual indexing skipped: no visual retrieval service configured"
        );
        Ok(())
    }

    async fn score_pages(
        &self,
        _question: &str,
        _top_k: usize,
    ) -> Result<Vec<PageHit>, QueryError> {
        warn!("visual retrieval unavailable; returning no page candidates");
        Ok(Vec::new())
    }
}
