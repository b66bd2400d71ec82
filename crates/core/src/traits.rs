use crate::{ChunkMetadata, RetrievalHit, ServiceError};
use async_trait::async_trait;

/// Narrow contract of the persistent vector store.
///
/// `add` takes parallel sequences with one entry per record; `query` returns
/// at most `k` hits ranked most similar first by the backend's own metric.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn add(
        &self,
        ids: &[String],
        texts: &[String],
        embeddings: &[Vec<f32>],
        metadatas: &[ChunkMetadata],
    ) -> Result<(), ServiceError>;

    async fn query(&self, embedding: &[f32], k: usize) -> Result<Vec<RetrievalHit>, ServiceError>;

    async fn count(&self) -> Result<usize, ServiceError>;
}

pub(crate) fn check_parallel_lengths(
    ids: &[String],
    texts: &[String],
    embeddings: &[Vec<f32>],
    metadatas: &[ChunkMetadata],
) -> Result<(), ServiceError> {
    let expected = ids.len();
    if texts.len() != expected || embeddings.len() != expected || metadatas.len() != expected {
        return Err(ServiceError::Request(format!(
            "add needs parallel sequences: ids={} texts={} embeddings={} metadatas={}",
            ids.len(),
            texts.len(),
            embeddings.len(),
            metadatas.len()
        )));
    }
    Ok(())
}
