use crate::chunking::build_chunks;
use crate::embeddings::Embedder;
use crate::extractor::{extract_text, DocumentKind};
use crate::traits::VectorIndex;
use crate::{ChunkMetadata, FailurePolicy, IngestError, IngestionOptions, ServiceError};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Supported files directly inside `folder`, sorted by path.
pub fn discover_supported_files(folder: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();

    for entry in WalkDir::new(folder)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|item| item.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }

        if DocumentKind::from_path(entry.path()).is_some() {
            files.push(entry.path().to_path_buf());
        } else {
            debug!(path = %entry.path().display(), "ignoring unsupported file");
        }
    }

    files.sort_unstable();
    files
}

pub fn digest_file(path: &Path) -> Result<String, IngestError> {
    let bytes = fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("{:x}", hasher.finalize()))
}

#[derive(Debug, Clone)]
pub struct IngestedFile {
    pub path: PathBuf,
    pub source: String,
    pub checksum: String,
    pub chunk_ids: Vec<String>,
    pub batches: usize,
}

impl IngestedFile {
    pub fn chunk_count(&self) -> usize {
        self.chunk_ids.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    UnsupportedType,
    NoText,
    Failed(String),
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnsupportedType => f.write_str("unsupported file type"),
            Self::NoText => f.write_str("no text extracted (scanned or empty?)"),
            Self::Failed(reason) => f.write_str(reason),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SkippedFile {
    pub path: PathBuf,
    pub reason: SkipReason,
}

#[derive(Debug, Clone)]
pub enum FileOutcome {
    Ingested(IngestedFile),
    Skipped(SkippedFile),
}

#[derive(Debug, Clone)]
pub struct IngestionReport {
    pub ingested: Vec<IngestedFile>,
    pub skipped: Vec<SkippedFile>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl IngestionReport {
    fn start() -> Self {
        let now = Utc::now();
        Self {
            ingested: Vec::new(),
            skipped: Vec::new(),
            started_at: now,
            finished_at: now,
        }
    }

    fn record(&mut self, outcome: FileOutcome) {
        match outcome {
            FileOutcome::Ingested(file) => self.ingested.push(file),
            FileOutcome::Skipped(file) => self.skipped.push(file),
        }
    }

    fn finish(mut self) -> Self {
        self.finished_at = Utc::now();
        self
    }

    pub fn total_chunks(&self) -> usize {
        self.ingested.iter().map(IngestedFile::chunk_count).sum()
    }
}

/// Reader -> chunker -> embedder -> index, one file at a time, one batch at a time.
pub struct IngestionPipeline {
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    options: IngestionOptions,
}

impl IngestionPipeline {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorIndex>,
        options: IngestionOptions,
    ) -> Self {
        Self {
            embedder,
            index,
            options,
        }
    }

    pub fn options(&self) -> &IngestionOptions {
        &self.options
    }

    /// Ingests a single file or every supported file directly inside a directory.
    pub async fn ingest_path(&self, path: &Path) -> Result<IngestionReport, IngestError> {
        if path.is_dir() {
            return self.ingest_directory(path).await;
        }
        if !path.is_file() {
            return Err(IngestError::InvalidArgument(format!(
                "path does not exist: {}",
                path.display()
            )));
        }

        self.validate()?;
        let mut report = IngestionReport::start();
        self.ingest_isolated(path, &mut report).await?;
        Ok(report.finish())
    }

    pub async fn ingest_directory(&self, folder: &Path) -> Result<IngestionReport, IngestError> {
        self.validate()?;
        let files = discover_supported_files(folder);

        if files.is_empty() {
            return Err(IngestError::InvalidArgument(format!(
                "no supported files found in {}",
                folder.display()
            )));
        }

        let mut report = IngestionReport::start();
        for path in files {
            self.ingest_isolated(&path, &mut report).await?;
        }

        let report = report.finish();
        info!(
            folder = %folder.display(),
            files = report.ingested.len(),
            skipped = report.skipped.len(),
            chunks = report.total_chunks(),
            "directory ingested"
        );
        Ok(report)
    }

    async fn ingest_isolated(&self, path: &Path, report: &mut IngestionReport) -> Result<(), IngestError> {
        match self.ingest_file(path).await {
            Ok(outcome) => report.record(outcome),
            Err(error) if self.options.failure_policy == FailurePolicy::SkipAndReport => {
                warn!(path = %path.display(), %error, "file failed, continuing");
                report.skipped.push(SkippedFile {
                    path: path.to_path_buf(),
                    reason: SkipReason::Failed(error.to_string()),
                });
            }
            Err(error) => return Err(error),
        }
        Ok(())
    }

    /// Ingests one file. Unsupported types and empty extractions are skipped, not errors.
    pub async fn ingest_file(&self, path: &Path) -> Result<FileOutcome, IngestError> {
        let source = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| IngestError::MissingFileName(path.display().to_string()))?
            .to_string();

        let Some(kind) = DocumentKind::from_path(path) else {
            warn!(file = %source, "skipping unsupported file type");
            return Ok(skipped(path, SkipReason::UnsupportedType));
        };

        info!(path = %path.display(), "reading");
        let (text, checksum) = read_blocking(path.to_path_buf(), kind, self.options.max_pages).await?;
        if text.is_empty() {
            warn!(file = %source, "no text extracted (scanned or empty?)");
            return Ok(skipped(path, SkipReason::NoText));
        }

        let chunks = build_chunks(&source, &text, self.options.chunking);
        info!(file = %source, chunks = chunks.len(), "chunked");

        let mut chunk_ids = Vec::with_capacity(chunks.len());
        let mut batches = 0;
        for batch in chunks.chunks(self.options.batch_size) {
            let ids: Vec<String> = batch.iter().map(|chunk| chunk.id()).collect();
            let texts: Vec<String> = batch.iter().map(|chunk| chunk.text.clone()).collect();
            let metadatas: Vec<ChunkMetadata> = batch.iter().map(|chunk| chunk.metadata()).collect();

            let embeddings = self.embedder.embed_batch(&texts).await?;
            if embeddings.len() != texts.len() {
                return Err(ServiceError::Request(format!(
                    "embedder returned {} vectors for {} chunks",
                    embeddings.len(),
                    texts.len()
                ))
                .into());
            }
            self.index.add(&ids, &texts, &embeddings, &metadatas).await?;

            let first = batch.first().map(|chunk| chunk.index).unwrap_or_default();
            let last = batch.last().map(|chunk| chunk.index).unwrap_or_default();
            info!(file = %source, first, last, "embedded and stored chunks");

            chunk_ids.extend(ids);
            batches += 1;
        }

        info!(file = %source, "done ingesting");
        Ok(FileOutcome::Ingested(IngestedFile {
            path: path.to_path_buf(),
            source,
            checksum,
            chunk_ids,
            batches,
        }))
    }

    fn validate(&self) -> Result<(), IngestError> {
        self.options.chunking.validate()?;
        if self.options.batch_size == 0 {
            return Err(IngestError::InvalidArgument(
                "batch_size must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

fn skipped(path: &Path, reason: SkipReason) -> FileOutcome {
    FileOutcome::Skipped(SkippedFile {
        path: path.to_path_buf(),
        reason,
    })
}

/// Extracted text and SHA-256 checksum, both read off the async runtime.
async fn read_blocking(
    path: PathBuf,
    kind: DocumentKind,
    max_pages: Option<usize>,
) -> Result<(String, String), IngestError> {
    tokio::task::spawn_blocking(move || {
        let text = extract_text(&path, kind, max_pages)?;
        let checksum = digest_file(&path)?;
        Ok((text, checksum))
    })
    .await
    .map_err(|error| IngestError::Io(std::io::Error::other(error)))?
}
