use crate::error::IngestError;
use crate::models::Chunk;

pub const DEFAULT_CHUNK_SIZE: usize = 800;
pub const DEFAULT_CHUNK_OVERLAP: usize = 150;

/// Character-window chunking parameters. Sizes count `char`s, not bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkingConfig {
    pub chunk_size: usize,
    pub overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            overlap: DEFAULT_CHUNK_OVERLAP,
        }
    }
}

impl ChunkingConfig {
    pub fn new(chunk_size: usize, overlap: usize) -> Result<Self, IngestError> {
        let config = Self {
            chunk_size,
            overlap,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), IngestError> {
        if self.chunk_size == 0 {
            return Err(IngestError::InvalidChunkConfig(
                "chunk_size must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Overlap clamped so that every window advances by at least one char.
    pub fn effective_overlap(&self) -> usize {
        self.overlap.min(self.chunk_size.saturating_sub(1))
    }
}

/// Splits `text` into overlapping fixed-size windows.
///
/// The input is trimmed first, each window is trimmed and empty windows are
/// dropped. Consecutive windows share `overlap` characters.
pub fn chunk_text(text: &str, config: ChunkingConfig) -> Vec<String> {
    let text = text.trim();
    if text.is_empty() {
        return Vec::new();
    }

    let chunk_size = config.chunk_size.max(1);
    let overlap = config.effective_overlap();
    let chars: Vec<char> = text.chars().collect();
    let total = chars.len();

    let mut chunks = Vec::new();
    let mut start = 0;

    while start < total {
        let end = (start + chunk_size).min(total);
        let piece: String = chars[start..end].iter().collect();
        let piece = piece.trim();
        if !piece.is_empty() {
            chunks.push(piece.to_string());
        }

        if end == total {
            break;
        }

        let next = end.saturating_sub(overlap);
        start = if next <= start { end } else { next };
    }

    chunks
}

/// Chunks a document's text and attaches source and position.
pub fn build_chunks(source: &str, text: &str, config: ChunkingConfig) -> Vec<Chunk> {
    chunk_text(text, config)
        .into_iter()
        .enumerate()
        .map(|(index, text)| Chunk {
            source: source.to_string(),
            index,
            text,
        })
        .collect()
}
