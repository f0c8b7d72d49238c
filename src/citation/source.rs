//! Source-name extraction, per source spec §4.5.1: a five-tier confidence
//! chain over a chunk's metadata and text, matching the reliability order
//! documented there (metadata > alt-keys > text marker > document-index
//! reverse lookup > fallback list).

use crate::types::{Chunk, ChunkMetadata};
use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;

static SOURCE_MARKER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[Source\s+\d+:\s*([^\]]+?)(?:\s*\(Page\s+\d+\))?\]").expect("source marker regex is valid")
});
static TRAILING_PAGE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s*\(Page\s+\d+\)").expect("trailing page regex is valid"));

/// Basename-only normalization: the store never persists a chunk's original
/// path, only display names, but callers may hand us one anyway.
fn normalize_source(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.contains('/') || trimmed.contains('\\') {
        trimmed
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or(trimmed)
            .to_string()
    } else {
        trimmed.to_string()
    }
}

fn is_usable(candidate: &str) -> bool {
    !candidate.is_empty() && candidate != "Unknown"
}

/// Resolved source name plus the confidence tier it was extracted at.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceResolution {
    pub source: String,
    pub confidence: f32,
}

/// Reverse-lookup table from a chunk's `chunk_index` to the document it
/// belongs to, analogous to the teacher's `document_index` dict. Built once
/// per query from the index router / ingestion metadata; `None` when no such
/// mapping is available (the majority of call sites).
pub type DocumentIndex = HashMap<String, Vec<usize>>;

/// Run the five-tier chain against one chunk's metadata and text.
/// `fallback_sources` is the last-resort candidate list (e.g. every source
/// name seen elsewhere in the same result set).
pub fn extract_source(
    metadata: &ChunkMetadata,
    chunk_text: &str,
    document_index: Option<&DocumentIndex>,
    fallback_sources: &[String],
) -> SourceResolution {
    // Tier 1.0: primary metadata key.
    if let Some(raw) = &metadata.source {
        let source = normalize_source(raw);
        if is_usable(&source) {
            return SourceResolution { source, confidence: 1.0 };
        }
    }

    // Tier 0.7: alternate metadata keys, checked in a fixed order.
    for alt in [
        &metadata.document_name,
        &metadata.file_name,
        &metadata.filename,
        &metadata.doc_name,
    ] {
        if let Some(raw) = alt {
            let source = normalize_source(raw);
            if is_usable(&source) {
                return SourceResolution { source, confidence: 0.7 };
            }
        }
    }

    // Tier 0.5: `[Source N: name (Page P)]` marker embedded in chunk text.
    if let Some(caps) = SOURCE_MARKER_RE.captures(chunk_text) {
        let raw = caps.get(1).map(|m| m.as_str()).unwrap_or("").trim();
        let without_page = TRAILING_PAGE_RE.replace(raw, "");
        let source = normalize_source(&without_page);
        if is_usable(&source) {
            return SourceResolution { source, confidence: 0.5 };
        }
    }

    // Tier 0.3: reverse lookup of this chunk's index in a document_index map.
    if let (Some(index), Some(chunk_index)) = (document_index, metadata.chunk_index) {
        for (doc_id, chunk_indices) in index {
            if chunk_indices.contains(&chunk_index) {
                let source = normalize_source(doc_id);
                if is_usable(&source) {
                    return SourceResolution { source, confidence: 0.3 };
                }
            }
        }
    }

    // Tier 0.1: caller-supplied fallback list, first usable entry wins.
    for candidate in fallback_sources {
        let trimmed = candidate.trim();
        if is_usable(trimmed) {
            let source = normalize_source(trimmed);
            if is_usable(&source) {
                return SourceResolution { source, confidence: 0.1 };
            }
        }
    }

    SourceResolution {
        source: "Unknown".to_string(),
        confidence: 0.0,
    }
}

/// Convenience wrapper over [`extract_source`] for a full [`Chunk`], using
/// the chunk's own `source` field as the first fallback candidate.
pub fn extract_source_for_chunk(
    chunk: &Chunk,
    document_index: Option<&DocumentIndex>,
    fallback_sources: &[String],
) -> SourceResolution {
    let mut fallbacks = fallback_sources.to_vec();
    fallbacks.push(chunk.source.clone());
    extract_source(&chunk.metadata, &chunk.text, document_index, &fallbacks)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> ChunkMetadata {
        ChunkMetadata::default()
    }

    #[test]
    fn metadata_source_wins_at_full_confidence() {
        let mut m = meta();
        m.source = Some("handbook.pdf".to_string());
        m.document_name = Some("other.pdf".to_string());
        let res = extract_source(&m, "irrelevant text", None, &[]);
        assert_eq!(res.source, "handbook.pdf");
        assert_eq!(res.confidence, 1.0);
    }

    #[test]
    fn path_valued_source_is_reduced_to_basename() {
        let mut m = meta();
        m.source = Some("/data/docs/handbook.pdf".to_string());
        let res = extract_source(&m, "", None, &[]);
        assert_eq!(res.source, "handbook.pdf");
    }

    #[test]
    fn alt_key_used_when_primary_absent() {
        let mut m = meta();
        m.file_name = Some("report.docx".to_string());
        let res = extract_source(&m, "", None, &[]);
        assert_eq!(res.source, "report.docx");
        assert_eq!(res.confidence, 0.7);
    }

    #[test]
    fn text_marker_extracted_and_trailing_page_stripped() {
        let m = meta();
        let text = "[Source 2: manual.pdf (Page 4)] some content here";
        let res = extract_source(&m, text, None, &[]);
        assert_eq!(res.source, "manual.pdf");
        assert_eq!(res.confidence, 0.5);
    }

    #[test]
    fn document_index_reverse_lookup() {
        let mut m = meta();
        m.chunk_index = Some(42);
        let mut idx: DocumentIndex = HashMap::new();
        idx.insert("contract.pdf".to_string(), vec![10, 42, 99]);
        let res = extract_source(&m, "", Some(&idx), &[]);
        assert_eq!(res.source, "contract.pdf");
        assert_eq!(res.confidence, 0.3);
    }

    #[test]
    fn fallback_list_used_last() {
        let m = meta();
        let res = extract_source(&m, "", None, &["Unknown".to_string(), "notes.pdf".to_string()]);
        assert_eq!(res.source, "notes.pdf");
        assert_eq!(res.confidence, 0.1);
    }

    #[test]
    fn nothing_resolves_to_unknown_zero_confidence() {
        let m = meta();
        let res = extract_source(&m, "", None, &[]);
        assert_eq!(res.source, "Unknown");
        assert_eq!(res.confidence, 0.0);
    }
}
