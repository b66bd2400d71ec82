use crate::embeddings::Embedder;
use crate::traits::VectorIndex;
use crate::{RetrievalHit, ServiceError};
use std::sync::Arc;
use tracing::debug;

pub const DEFAULT_TOP_K: usize = 5;

/// Embeds a question and asks the index for its nearest chunks.
#[derive(Clone)]
pub struct Retriever {
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
}

impl Retriever {
    pub fn new(embedder: Arc<dyn Embedder>, index: Arc<dyn VectorIndex>) -> Self {
        Self { embedder, index }
    }

    /// Up to `k` hits, most similar first, in the index's own ranking.
    pub async fn retrieve(&self, query: &str, k: usize) -> Result<Vec<RetrievalHit>, ServiceError> {
        if k == 0 {
            return Ok(Vec::new());
        }

        let query_vector = self.embedder.embed_query(query).await?;
        let mut hits = self.index.query(&query_vector, k).await?;
        hits.truncate(k);
        debug!(k, hits = hits.len(), "retrieved");
        Ok(hits)
    }
}
