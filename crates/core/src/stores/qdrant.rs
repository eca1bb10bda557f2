use crate::error::QueryError;
use crate::models::ChunkRecord;
use crate::traits::{TextHit, TextIndex};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};

/// Persistent nearest-neighbour store over chunk embeddings, backed by a
/// Qdrant collection. The index owns vectors only; chunk identity travels in
/// the point payload and is joined back against the metadata store.
pub struct QdrantTextIndex {
    endpoint: String,
    collection: String,
    client: Client,
    vector_size: usize,
}

impl QdrantTextIndex {
    pub fn new(
        endpoint: impl Into<String>,
        collection: impl Into<String>,
        vector_size: usize,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            collection: collection.into(),
            client: Client::new(),
            vector_size,
        }
    }

    pub async fn ensure_collection(&self) -> Result<(), QueryError> {
        let response = self
            .client
            .put(format!("{}/collections/{}", self.endpoint, self.collection))
            .json(&json!({
                "vectors": { "size": self.vector_size, "distance": "Cosine" }
            }))
            .send()
            .await?;

        // 409 means the collection already exists, which is fine.
        if !response.status().is_success() && response.status().as_u16() != 409 {
            return Err(QueryError::BackendResponse {
                backend: "qdrant".to_string(),
                details: response.status().to_string(),
            });
        }
        Ok(())
    }
}

/// Stable point id for a chunk triple; packing keeps re-ingestion idempotent
/// at the index level. Holds only for doc_id below 2^32 and page/chunk ids
/// below 2^16; `index_chunks` rejects anything larger before packing.
fn point_id(chunk: &ChunkRecord) -> u64 {
    ((chunk.doc_id as u64) << 32) | ((chunk.page_num as u64) << 16) | chunk.chunk_id as u64
}

fn fits_point_id(chunk: &ChunkRecord) -> bool {
    (0..=u32::MAX as i64).contains(&chunk.doc_id)
        && chunk.page_num <= u16::MAX as u32
        && chunk.chunk_id <= u16::MAX as u32
}

#[async_trait]
impl TextIndex for QdrantTextIndex {
    async fn index_chunks(
        &self,
        chunks: &[ChunkRecord],
        embeddings: &[Vec<f32>],
    ) -> Result<(), QueryError> {
        if chunks.len() != embeddings.len() {
            return Err(QueryError::Request(format!(
                "embedding count {} doesn't match chunk count {}",
                embeddings.len(),
                chunks.len()
            )));
        }

        let points = chunks
            .iter()
            .zip(embeddings.iter())
            .map(|(chunk, embedding)| {
                if !fits_point_id(chunk) {
                    return Err(QueryError::Request(format!(
                        "chunk {} exceeds point id packing limits",
                        chunk.citation()
                    )));
                }
                if embedding.len() != self.vector_size {
                    return Err(QueryError::Request(format!(
                        "embedding dimension {} != {}",
                        embedding.len(),
                        self.vector_size
                    )));
                }
                Ok(json!({
                    "id": point_id(chunk),
                    "vector": embedding,
                    "payload": {
                        "doc_id": chunk.doc_id,
                        "page_num": chunk.page_num,
                        "chunk_id": chunk.chunk_id,
                        "section_name": chunk.section_name,
                    },
                }))
            })
            .collect::<Result<Vec<_>, QueryError>>()?;

        if points.is_empty() {
            return Ok(());
        }

        let response = self
            .client
            .put(format!(
                "{}/collections/{}/points?wait=true",
                self.endpoint, self.collection
            ))
            .json(&json!({ "points": points }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(QueryError::BackendResponse {
                backend: "qdrant".to_string(),
                details: response.status().to_string(),
            });
        }
        Ok(())
    }

    async fn search(
        &self,
        query_vector: &[f32],
        top_k: usize,
    ) -> Result<Vec<TextHit>, QueryError> {
        if query_vector.len() != self.vector_size {
            return Err(QueryError::Request(format!(
                "query vector dim {} is not {}",
                query_vector.len(),
                self.vector_size
            )));
        }

        let response = self
            .client
            .post(format!(
                "{}/collections/{}/points/search",
                self.endpoint, self.collection
            ))
            .json(&json!({
                "vector": query_vector,
                "limit": top_k,
                "with_payload": true,
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(QueryError::BackendResponse {
                backend: "qdrant".to_string(),
                details: response.status().to_string(),
            });
        }

        let parsed: Value = response.json().await?;
        let raw_hits = parsed
            .pointer("/result")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut hits = Vec::new();
        for raw in raw_hits {
            let doc_id = raw.pointer("/payload/doc_id").and_then(Value::as_i64);
            let page_num = raw.pointer("/payload/page_num").and_then(Value::as_u64);
            let chunk_id = raw.pointer("/payload/chunk_id").and_then(Value::as_u64);
            let score = raw.pointer("/score").and_then(Value::as_f64).unwrap_or(0.0);

            // Skip points with incomplete payloads rather than failing the
            // whole query; the metadata join would drop them anyway.
            let (Some(doc_id), Some(page_num), Some(chunk_id)) = (doc_id, page_num, chunk_id)
            else {
                continue;
            };

            hits.push(TextHit {
                doc_id,
                page_num: page_num as u32,
                chunk_id: chunk_id as u32,
                score,
            });
        }

        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn point_ids_are_stable_and_distinct() {
        let chunk = |page_num, chunk_id| ChunkRecord {
            doc_id: 3,
            page_num,
            chunk_id,
            section_name: None,
            text: String::new(),
            offset_start: 0,
            offset_end: 0,
        };

        assert_eq!(point_id(&chunk(2, 5)), point_id(&chunk(2, 5)));
        assert_ne!(point_id(&chunk(2, 5)), point_id(&chunk(2, 6)));
        assert_ne!(point_id(&chunk(2, 5)), point_id(&chunk(3, 5)));
    }

    #[tokio::test]
    async fn rejects_identifiers_outside_packing_limits() {
        let index = QdrantTextIndex::new("http://localhost:6333", "chunks", 2);
        let oversized = ChunkRecord {
            doc_id: 1,
            page_num: 65_536,
            chunk_id: 0,
            section_name: None,
            text: String::new(),
            offset_start: 0,
            offset_end: 0,
        };

        let error = index
            .index_chunks(&[oversized], &[vec![0.1, 0.2]])
            .await
            .expect_err("rejected before any request");
        assert!(matches!(error, QueryError::Request(_)));
    }
}
