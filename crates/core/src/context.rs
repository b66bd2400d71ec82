//! Numbered context blocks for the generation prompt.
//!
//! Hit `i` (1-based, retrieval order) is rendered as `[i] <text>`. Provenance
//! never enters the block itself, otherwise the model echoes it into the
//! answer; callers attach sources separately with the same numbering.

use crate::RetrievalHit;

pub fn build_context(hits: &[RetrievalHit]) -> String {
    hits.iter()
        .enumerate()
        .map(|(i, hit)| format!("[{}] {}", i + 1, hit.text))
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// `[i] <source> (chunk <n>)` for each hit, numbered like the context block.
pub fn numbered_sources(hits: &[RetrievalHit]) -> Vec<String> {
    hits.iter()
        .enumerate()
        .map(|(i, hit)| format!("[{}] {}", i + 1, hit.source_label()))
        .collect()
}

/// `<source> (chunk <n>)` for each hit, in retrieval order.
pub fn source_labels(hits: &[RetrievalHit]) -> Vec<String> {
    hits.iter().map(RetrievalHit::source_label).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ChunkMetadata;

    fn hit(text: &str, source: &str, chunk: usize) -> RetrievalHit {
        RetrievalHit {
            text: text.to_string(),
            metadata: ChunkMetadata {
                source: source.to_string(),
                chunk,
            },
        }
    }

    fn sample_hits() -> Vec<RetrievalHit> {
        vec![
            hit("Tuition is billed monthly.", "pricing.pdf", 4),
            hit("Refunds within 14 days.", "policies.docx", 0),
            hit("Classes run Monday to Friday.", "schedule.txt", 2),
        ]
    }

    #[test]
    fn blocks_are_numbered_in_input_order() {
        let context = build_context(&sample_hits());

        assert_eq!(
            context,
            "[1] Tuition is billed monthly.\n\n[2] Refunds within 14 days.\n\n[3] Classes run Monday to Friday."
        );
    }

    #[test]
    fn provenance_stays_out_of_the_context() {
        let context = build_context(&sample_hits());

        assert!(!context.contains("Source:"));
        assert!(!context.contains("Chunk:"));
        assert!(!context.contains("pricing.pdf"));
    }

    #[test]
    fn sources_share_the_context_numbering() {
        let hits = sample_hits();
        assert_eq!(
            numbered_sources(&hits),
            vec![
                "[1] pricing.pdf (chunk 4)",
                "[2] policies.docx (chunk 0)",
                "[3] schedule.txt (chunk 2)"
            ]
        );
        assert_eq!(source_labels(&hits)[1], "policies.docx (chunk 0)");
    }

    #[test]
    fn no_hits_means_empty_context() {
        assert_eq!(build_context(&[]), "");
        assert!(numbered_sources(&[]).is_empty());
    }
}
