pub mod answer;
pub mod chunking;
pub mod config;
pub mod context;
pub mod embeddings;
pub mod error;
pub mod extractor;
pub mod generation;
mod http;
pub mod ingest;
pub mod models;
pub mod retrieval;
pub mod stores;
pub mod structured;
pub mod traits;

pub use answer::{Answer, AnswerGenerator, AnswerOptions, StreamEvent, SYSTEM_PROMPT};
pub use chunking::{build_chunks, chunk_text, ChunkingConfig, DEFAULT_CHUNK_OVERLAP, DEFAULT_CHUNK_SIZE};
pub use config::{parse_base_url, OpenAiConfig, RetryPolicy};
pub use context::{build_context, numbered_sources, source_labels};
pub use embeddings::{CharacterNgramEmbedder, Embedder, OpenAiEmbedder};
pub use error::{IngestError, ServiceError};
pub use extractor::{extract_text, DocumentKind, LopdfExtractor, PdfExtractor};
pub use generation::{ChatMessage, ChatModel, ChatRequest, OpenAiChatModel, TokenStream};
pub use ingest::{
    discover_supported_files, FileOutcome, IngestedFile, IngestionPipeline, IngestionReport,
    SkipReason, SkippedFile,
};
pub use models::{
    chunk_id, Chunk, ChunkMetadata, FailurePolicy, IngestionOptions, RetrievalHit,
    WriteMode,
};
pub use retrieval::{Retriever, DEFAULT_TOP_K};
pub use stores::{LocalVectorIndex, QdrantStore};
pub use structured::{parse_answer, AnswerFormat, ParsedAnswer};
pub use traits::VectorIndex;
