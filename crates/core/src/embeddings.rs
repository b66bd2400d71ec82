use crate::config::OpenAiConfig;
use crate::error::ServiceError;
use crate::http::send_with_retry;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const DEFAULT_NGRAM_DIMENSIONS: usize = 128;

/// Turns texts into vectors of one shared, fixed dimension.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// One vector per input, in input order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ServiceError>;

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>, ServiceError> {
        self.embed_batch(&[text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| ServiceError::Request("embedder returned no vector".to_string()))
    }
}

/// Offline embedder hashing character trigrams into L2-normalised buckets.
#[derive(Debug, Clone, Copy)]
pub struct CharacterNgramEmbedder {
    pub dimensions: usize,
}

impl Default for CharacterNgramEmbedder {
    fn default() -> Self {
        Self {
            dimensions: DEFAULT_NGRAM_DIMENSIONS,
        }
    }
}

impl CharacterNgramEmbedder {
    pub fn embed(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0f32; self.dimensions.max(1)];
        let lowered = text.to_lowercase();
        let chars: Vec<char> = lowered.chars().collect();

        if chars.is_empty() {
            return vector;
        }

        for window in chars.windows(3) {
            let token = window.iter().collect::<String>();
            let mut hash = 1469598103934665603u64;
            for byte in token.bytes() {
                hash ^= byte as u64;
                hash = hash.wrapping_mul(1099511628211);
            }
            let bucket = (hash % vector.len() as u64) as usize;
            vector[bucket] += 1.0;
        }

        let magnitude = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
        if magnitude > 0.0 {
            for value in &mut vector {
                *value /= magnitude;
            }
        }

        vector
    }
}

#[async_trait]
impl Embedder for CharacterNgramEmbedder {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ServiceError> {
        Ok(texts.iter().map(|text| self.embed(text)).collect())
    }
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingItem>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingItem {
    index: usize,
    embedding: Vec<f32>,
}

/// Client for an OpenAI-compatible `/embeddings` endpoint.
pub struct OpenAiEmbedder {
    config: OpenAiConfig,
    client: Client,
}

impl OpenAiEmbedder {
    pub fn new(config: OpenAiConfig) -> Self {
        Self {
            config,
            client: Client::new(),
        }
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ServiceError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let url = self.config.endpoint("embeddings");
        let body = EmbeddingRequest {
            model: &self.config.embedding_model,
            input: texts,
        };
        debug!(model = %self.config.embedding_model, inputs = texts.len(), "embedding request");

        let response = send_with_retry("embeddings", self.config.retry, || {
            let request = self.client.post(&url).json(&body);
            match &self.config.api_key {
                Some(key) => request.bearer_auth(key),
                None => request,
            }
        })
        .await?;

        let parsed: EmbeddingResponse = response.json().await?;
        order_embeddings(parsed.data, texts.len())
    }
}

/// Restores input order and checks that every input got a vector of one dimension.
fn order_embeddings(
    mut items: Vec<EmbeddingItem>,
    expected: usize,
) -> Result<Vec<Vec<f32>>, ServiceError> {
    if items.len() != expected {
        return Err(ServiceError::backend(
            "embeddings",
            format!("expected {expected} vectors, got {}", items.len()),
        ));
    }

    items.sort_by_key(|item| item.index);
    let vectors: Vec<Vec<f32>> = items.into_iter().map(|item| item.embedding).collect();

    if let Some(first) = vectors.first() {
        let dimension = first.len();
        if vectors.iter().any(|vector| vector.len() != dimension) {
            return Err(ServiceError::backend(
                "embeddings",
                "vectors have inconsistent dimensions",
            ));
        }
    }

    Ok(vectors)
}
