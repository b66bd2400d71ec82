use crate::config::RetryPolicy;
use crate::http::{rejection, send_retrying, send_with_retry};
use crate::traits::{check_parallel_lengths, VectorIndex};
use crate::{ChunkMetadata, RetrievalHit, ServiceError, WriteMode};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

pub struct QdrantStore {
    endpoint: String,
    collection: String,
    client: Client,
    vector_size: usize,
    write_mode: WriteMode,
    retry: RetryPolicy,
}

impl QdrantStore {
    pub fn new(
        endpoint: impl Into<String>,
        collection: impl Into<String>,
        vector_size: usize,
        write_mode: WriteMode,
    ) -> Self {
        Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            collection: collection.into(),
            client: Client::new(),
            vector_size,
            write_mode,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn collection_url(&self) -> String {
        format!("{}/collections/{}", self.endpoint, self.collection)
    }

    /// Creates the collection with cosine distance unless it already exists.
    pub async fn ensure_collection(&self) -> Result<(), ServiceError> {
        let url = self.collection_url();
        let existing = send_retrying("qdrant", self.retry, || self.client.get(&url)).await?;
        if existing.status().is_success() {
            return Ok(());
        }
        if existing.status() != StatusCode::NOT_FOUND {
            return Err(rejection("qdrant", existing).await);
        }

        let body = json!({
            "vectors": { "size": self.vector_size, "distance": "Cosine" }
        });
        send_with_retry("qdrant", self.retry, || self.client.put(&url).json(&body)).await?;
        info!(collection = %self.collection, vector_size = self.vector_size, "created qdrant collection");
        Ok(())
    }

    fn point_id(&self, chunk_id: &str) -> Uuid {
        match self.write_mode {
            WriteMode::Upsert => Uuid::new_v5(&Uuid::NAMESPACE_OID, chunk_id.as_bytes()),
            WriteMode::Append => Uuid::new_v4(),
        }
    }

    fn build_points(
        &self,
        ids: &[String],
        texts: &[String],
        embeddings: &[Vec<f32>],
        metadatas: &[ChunkMetadata],
    ) -> Result<Vec<Value>, ServiceError> {
        check_parallel_lengths(ids, texts, embeddings, metadatas)?;

        ids.iter()
            .zip(texts)
            .zip(embeddings)
            .zip(metadatas)
            .map(|(((id, text), embedding), metadata)| {
                if embedding.len() != self.vector_size {
                    return Err(ServiceError::Request(format!(
                        "embedding dimension {} != {}",
                        embedding.len(),
                        self.vector_size
                    )));
                }

                Ok(json!({
                    "id": self.point_id(id).to_string(),
                    "vector": embedding,
                    "payload": {
                        "chunk_id": id,
                        "text": text,
                        "source": metadata.source,
                        "chunk": metadata.chunk,
                    },
                }))
            })
            .collect()
    }
}

#[async_trait]
impl VectorIndex for QdrantStore {
    async fn add(
        &self,
        ids: &[String],
        texts: &[String],
        embeddings: &[Vec<f32>],
        metadatas: &[ChunkMetadata],
    ) -> Result<(), ServiceError> {
        let points = self.build_points(ids, texts, embeddings, metadatas)?;
        if points.is_empty() {
            return Ok(());
        }

        let url = format!("{}/points?wait=true", self.collection_url());
        let body = json!({ "points": points });
        send_with_retry("qdrant", self.retry, || self.client.put(&url).json(&body)).await?;
        Ok(())
    }

    async fn query(&self, embedding: &[f32], k: usize) -> Result<Vec<RetrievalHit>, ServiceError> {
        if embedding.len() != self.vector_size {
            return Err(ServiceError::Request(format!(
                "query vector dim {} is not {}",
                embedding.len(),
                self.vector_size
            )));
        }

        let url = format!("{}/points/search", self.collection_url());
        let body = json!({
            "vector": embedding,
            "limit": k,
            "with_payload": true,
        });
        let response = send_with_retry("qdrant", self.retry, || self.client.post(&url).json(&body)).await?;

        let parsed: Value = response.json().await?;
        parse_search_hits(&parsed)
    }

    async fn count(&self) -> Result<usize, ServiceError> {
        let url = format!("{}/points/count", self.collection_url());
        let body = json!({ "exact": true });
        let response = send_with_retry("qdrant", self.retry, || self.client.post(&url).json(&body)).await?;

        let parsed: Value = response.json().await?;
        parsed
            .pointer("/result/count")
            .and_then(Value::as_u64)
            .map(|count| count as usize)
            .ok_or_else(|| ServiceError::backend("qdrant", "count response without result.count"))
    }
}

fn parse_search_hits(parsed: &Value) -> Result<Vec<RetrievalHit>, ServiceError> {
    let hits = parsed
        .pointer("/result")
        .and_then(Value::as_array)
        .ok_or_else(|| ServiceError::backend("qdrant", "search response without result array"))?;

    let mut result = Vec::with_capacity(hits.len());
    for hit in hits {
        let text = hit
            .pointer("/payload/text")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let source = hit
            .pointer("/payload/source")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let chunk = hit
            .pointer("/payload/chunk")
            .and_then(Value::as_u64)
            .unwrap_or_default() as usize;

        result.push(RetrievalHit {
            text,
            metadata: ChunkMetadata { source, chunk },
        });
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::canned::{serve, Canned};

    fn store(write_mode: WriteMode) -> QdrantStore {
        QdrantStore::new("http://localhost:6333/", "company_docs", 2, write_mode)
    }

    fn batch() -> (Vec<String>, Vec<String>, Vec<Vec<f32>>, Vec<ChunkMetadata>) {
        (
            vec!["faq.txt::chunk_0".to_string()],
            vec!["Office hours are 9 to 5.".to_string()],
            vec![vec![0.6, 0.8]],
            vec![ChunkMetadata {
                source: "faq.txt".to_string(),
                chunk: 0,
            }],
        )
    }

    #[test]
    fn upsert_points_have_deterministic_ids_and_full_payload() -> Result<(), ServiceError> {
        let store = store(WriteMode::Upsert);
        let (ids, texts, embeddings, metadatas) = batch();

        let first = store.build_points(&ids, &texts, &embeddings, &metadatas)?;
        let second = store.build_points(&ids, &texts, &embeddings, &metadatas)?;

        assert_eq!(first[0]["id"], second[0]["id"]);
        assert_eq!(first[0]["payload"]["chunk_id"], "faq.txt::chunk_0");
        assert_eq!(first[0]["payload"]["source"], "faq.txt");
        assert_eq!(first[0]["payload"]["chunk"], 0);
        assert_eq!(store.collection_url(), "http://localhost:6333/collections/company_docs");
        Ok(())
    }

    #[test]
    fn append_points_get_fresh_ids() -> Result<(), ServiceError> {
        let store = store(WriteMode::Append);
        let (ids, texts, embeddings, metadatas) = batch();

        let first = store.build_points(&ids, &texts, &embeddings, &metadatas)?;
        let second = store.build_points(&ids, &texts, &embeddings, &metadatas)?;
        assert_ne!(first[0]["id"], second[0]["id"]);
        Ok(())
    }

    #[test]
    fn wrong_dimension_is_rejected_before_sending() {
        let store = store(WriteMode::Upsert);
        let (ids, texts, _, metadatas) = batch();
        let result = store.build_points(&ids, &texts, &[vec![1.0, 0.0, 0.0]], &metadatas);
        assert!(matches!(result, Err(ServiceError::Request(_))));
    }

    #[test]
    fn search_response_maps_to_ranked_hits() -> Result<(), ServiceError> {
        let response = json!({
            "result": [
                { "id": "a", "score": 0.9, "payload": { "text": "first", "source": "a.pdf", "chunk": 3 } },
                { "id": "b", "score": 0.4, "payload": { "text": "second", "source": "b.docx", "chunk": 0 } }
            ]
        });

        let hits = parse_search_hits(&response)?;
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].text, "first");
        assert_eq!(hits[0].source_label(), "a.pdf (chunk 3)");
        assert_eq!(hits[1].metadata.source, "b.docx");
        Ok(())
    }

    #[test]
    fn search_response_without_result_is_an_error() {
        assert!(parse_search_hits(&json!({ "status": "error" })).is_err());
    }

    fn store_at(base: &str) -> QdrantStore {
        QdrantStore::new(base, "company_docs", 2, WriteMode::Upsert).with_retry(RetryPolicy {
            max_retries: 1,
            base_delay: std::time::Duration::ZERO,
        })
    }

    #[tokio::test]
    async fn missing_collection_is_created_after_a_transient_lookup_failure() -> Result<(), Box<dyn std::error::Error>> {
        let (base, seen, server) = serve(vec![
            Canned::json("503 Service Unavailable", "warming up"),
            Canned::json("404 Not Found", r#"{"status":{"error":"Not found"}}"#),
            Canned::json("200 OK", r#"{"result":true,"status":"ok"}"#),
        ])
        .await?;

        store_at(&base).ensure_collection().await?;

        server.await?;
        assert_eq!(
            seen.lock().map(|seen| seen.clone()).unwrap_or_default(),
            vec![
                "GET /collections/company_docs".to_string(),
                "GET /collections/company_docs".to_string(),
                "PUT /collections/company_docs".to_string(),
            ]
        );
        Ok(())
    }

    #[tokio::test]
    async fn lookup_rejection_keeps_the_response_body() -> Result<(), Box<dyn std::error::Error>> {
        let (base, _seen, _server) = serve(vec![Canned::json(
            "403 Forbidden",
            r#"{"status":{"error":"missing api key"}}"#,
        )])
        .await?;

        match store_at(&base).ensure_collection().await {
            Err(ServiceError::BackendResponse { details, .. }) => {
                assert!(details.starts_with("403"));
                assert!(details.contains("missing api key"));
            }
            other => panic!("expected a backend error, got {other:?}"),
        }
        Ok(())
    }
}
