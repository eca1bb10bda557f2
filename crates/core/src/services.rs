use crate::error::{IngestError, QueryError};
use crate::models::FigureEnrichment;
use crate::policy::enforce_english;
use crate::traits::{Captioner, EmbeddingService, GenerationService, OcrService};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use reqwest::Client;
use serde_json::{json, Value};
use std::path::Path;
use tracing::warn;

/// Text embedding via an OpenAI-compatible `/v1/embeddings` endpoint.
pub struct HttpEmbedder {
    endpoint: String,
    model: String,
    client: Client,
}

impl HttpEmbedder {
    pub fn new(endpoint: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            model: model.into(),
            client: Client::new(),
        }
    }
}

#[async_trait]
impl EmbeddingService for HttpEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, QueryError> {
        let response = self
            .client
            .post(format!("{}/v1/embeddings", self.endpoint))
            .json(&json!({ "model": self.model, "input": text }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(QueryError::BackendResponse {
                backend: "embedding".to_string(),
                details: response.status().to_string(),
            });
        }

        let parsed: Value = response.json().await?;
        let embedding = parsed
            .pointer("/data/0/embedding")
            .and_then(Value::as_array)
            .ok_or_else(|| QueryError::BackendResponse {
                backend: "embedding".to_string(),
                details: "response missing data[0].embedding".to_string(),
            })?
            .iter()
            .filter_map(Value::as_f64)
            .map(|value| value as f32)
            .collect::<Vec<_>>();

        if embedding.is_empty() {
            return Err(QueryError::BackendResponse {
                backend: "embedding".to_string(),
                details: "empty embedding vector".to_string(),
            });
        }
        Ok(embedding)
    }
}

/// Answer generation via an OpenAI-compatible `/v1/chat/completions`
/// endpoint. Greedy decoding; retries belong to the serving layer, not here.
pub struct HttpGenerator {
    endpoint: String,
    model: String,
    client: Client,
}

impl HttpGenerator {
    pub fn new(endpoint: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            model: model.into(),
            client: Client::new(),
        }
    }
}

#[async_trait]
impl GenerationService for HttpGenerator {
    async fn complete(
        &self,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<String, QueryError> {
        let response = self
            .client
            .post(format!("{}/v1/chat/completions", self.endpoint))
            .json(&json!({
                "model": self.model,
                "temperature": 0.0,
                "messages": [
                    { "role": "system", "content": system_prompt },
                    { "role": "user", "content": user_prompt },
                ],
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(QueryError::Generation(format!(
                "generation endpoint returned {}",
                response.status()
            )));
        }

        let parsed: Value = response.json().await?;
        let text = parsed
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                QueryError::Generation("response missing choices[0].message.content".to_string())
            })?;
        Ok(text.trim().to_string())
    }
}

/// OCR over figure crops via a remote endpoint taking base64 image payloads.
pub struct HttpOcr {
    endpoint: String,
    client: Client,
}

impl HttpOcr {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            client: Client::new(),
        }
    }
}

#[async_trait]
impl OcrService for HttpOcr {
    async fn extract_text(&self, image_path: &Path) -> Result<String, IngestError> {
        let bytes = tokio::fs::read(image_path).await?;
        let response = self
            .client
            .post(format!("{}/ocr", self.endpoint))
            .json(&json!({ "image_base64": STANDARD.encode(bytes) }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(IngestError::InvalidArgument(format!(
                "OCR endpoint returned {}",
                response.status()
            )));
        }

        let parsed: Value = response.json().await?;
        Ok(parsed
            .pointer("/text")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .trim()
            .to_string())
    }
}

/// Bound when no OCR collaborator is configured: figures get no transcript.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpOcr;

#[async_trait]
impl OcrService for NoOpOcr {
    async fn extract_text(&self, _image_path: &Path) -> Result<String, IngestError> {
        Ok(String::new())
    }
}

const CAPTION_PROMPT: &str = "\
You are an expert scientific assistant. Analyze the figure and output ONLY valid JSON.
JSON schema:
{
  \"caption\": \"Concise technical caption (1-2 sentences).\",
  \"entities\": [\"List of detected scientific entities, symbols, variables, instruments.\"],
  \"bullets\": [\"3-5 bullet points describing what the figure shows scientifically.\"]
}
Rules:
- English only.
- Be precise and technical.
- Do not include markdown.
";

/// Figure captioning via an OpenAI-compatible vision endpoint. Model output
/// that is not valid JSON (or not English) degrades the figure to OCR-only
/// rather than failing ingestion.
pub struct HttpCaptioner {
    endpoint: String,
    model: String,
    client: Client,
}

impl HttpCaptioner {
    pub fn new(endpoint: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            model: model.into(),
            client: Client::new(),
        }
    }
}

#[async_trait]
impl Captioner for HttpCaptioner {
    async fn caption(&self, image_path: &Path) -> Result<Option<FigureEnrichment>, IngestError> {
        let bytes = tokio::fs::read(image_path).await?;
        let data_url = format!("data:image/png;base64,{}", STANDARD.encode(bytes));

        let response = self
            .client
            .post(format!("{}/v1/chat/completions", self.endpoint))
            .json(&json!({
                "model": self.model,
                "temperature": 0.0,
                "messages": [{
                    "role": "user",
                    "content": [
                        { "type": "text", "text": CAPTION_PROMPT },
                        { "type": "image_url", "image_url": { "url": data_url } },
                    ],
                }],
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            warn!(
                status = %response.status(),
                path = %image_path.display(),
                "captioning endpoint failed; keeping figure OCR-only"
            );
            return Ok(None);
        }

        let parsed: Value = response.json().await?;
        let Some(text) = parsed
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
        else {
            warn!(path = %image_path.display(), "captioning response had no content");
            return Ok(None);
        };

        match parse_enrichment(text) {
            Some(enrichment) => Ok(Some(enrichment)),
            None => {
                warn!(
                    path = %image_path.display(),
                    "captioner returned unusable output; keeping figure OCR-only"
                );
                Ok(None)
            }
        }
    }
}

/// Extracts the first JSON object from model output and validates it against
/// the enrichment schema and the English gate.
fn parse_enrichment(text: &str) -> Option<FigureEnrichment> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    let parsed: Value = serde_json::from_str(&text[start..=end]).ok()?;

    let caption = parsed.pointer("/caption")?.as_str()?.trim().to_string();
    let string_list = |key: &str| -> Vec<String> {
        parsed
            .pointer(key)
            .and_then(Value::as_array)
            .map(|values| {
                values
                    .iter()
                    .filter_map(Value::as_str)
                    .map(|value| value.trim().to_string())
                    .collect()
            })
            .unwrap_or_default()
    };
    let entities = string_list("/entities");
    let bullets = string_list("/bullets");

    if enforce_english(&caption).is_err()
        || entities.iter().any(|entry| enforce_english(entry).is_err())
        || bullets.iter().any(|entry| enforce_english(entry).is_err())
    {
        return None;
    }

    Some(FigureEnrichment {
        caption,
        entities,
        bullets,
    })
}

/// Bound when figure captioning is disabled or unconfigured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpCaptioner;

#[async_trait]
impl Captioner for NoOpCaptioner {
    async fn caption(&self, _image_path: &Path) -> Result<Option<FigureEnrichment>, IngestError> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_enrichment_from_noisy_output() {
        let raw = "Sure, here is the JSON:\n{\"caption\": \"Light curve of the source.\",\
                   \"entities\": [\"flux\", \"MJD\"], \"bullets\": [\"Brightness declines.\"]}";
        let enrichment = parse_enrichment(raw).expect("parsed");
        assert_eq!(enrichment.caption, "Light curve of the source.");
        assert_eq!(enrichment.entities, vec!["flux", "MJD"]);
    }

    #[test]
    fn rejects_non_json_and_non_english_output() {
        assert!(parse_enrichment("no json here").is_none());
        assert!(parse_enrichment("{\"caption\": \"光度曲線\"}").is_none());
    }

    #[tokio::test]
    async fn noop_captioner_yields_no_enrichment() {
        let enrichment = NoOpCaptioner
            .caption(Path::new("figure.png"))
            .await
            .expect("ok");
        assert!(enrichment.is_none());
    }
}
