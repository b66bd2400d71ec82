use crate::chunking::ChunkingConfig;
use serde::{Deserialize, Serialize};

/// A slice of one document's text, numbered from zero in document order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub source: String,
    pub index: usize,
    pub text: String,
}

impl Chunk {
    pub fn id(&self) -> String {
        chunk_id(&self.source, self.index)
    }

    pub fn metadata(&self) -> ChunkMetadata {
        ChunkMetadata {
            source: self.source.clone(),
            chunk: self.index,
        }
    }
}

/// Stable identifier of a chunk: `<source>::chunk_<index>`.
pub fn chunk_id(source: &str, index: usize) -> String {
    format!("{source}::chunk_{index}")
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub source: String,
    pub chunk: usize,
}

/// One ranked result of a similarity query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalHit {
    pub text: String,
    pub metadata: ChunkMetadata,
}

impl RetrievalHit {
    /// `<source> (chunk <n>)`
    pub fn source_label(&self) -> String {
        format!("{} (chunk {})", self.metadata.source, self.metadata.chunk)
    }
}

/// How an index treats an add whose id already exists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteMode {
    #[default]
    Upsert,
    Append,
}

/// What the ingestion pipeline does when a single file fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FailurePolicy {
    #[default]
    SkipAndReport,
    Abort,
}

#[derive(Debug, Clone)]
pub struct IngestionOptions {
    pub chunking: ChunkingConfig,
    pub batch_size: usize,
    pub max_pages: Option<usize>,
    pub failure_policy: FailurePolicy,
}

impl Default for IngestionOptions {
    fn default() -> Self {
        Self {
            chunking: ChunkingConfig::default(),
            batch_size: 64,
            max_pages: None,
            failure_policy: FailurePolicy::default(),
        }
    }
}
