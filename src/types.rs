//! Core data model: chunks, citations, document-index mapping, and the
//! metadata filter shared by the vector and lexical backends.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A page-level character range within a document's linearized text,
/// populated by the (out-of-scope) ingestion pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageBlock {
    pub page: u32,
    pub start_char: usize,
    pub end_char: usize,
    #[serde(default)]
    pub block_type: String,
}

/// Bounding box + page + index for a chunk that originated from image OCR.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImageRef {
    pub page: u32,
    pub image_index: u32,
    #[serde(default)]
    pub bbox: Option<[f32; 4]>,
}

/// Dynamic per-chunk metadata. The source system stores these either as
/// top-level document fields or nested under a `metadata` object; callers
/// constructing a [`Chunk`] from a wire record should probe both shapes
/// (see [`ChunkMetadata::from_probe`]) and canonicalize to this struct on
/// write, per the "dynamic dictionary access → tagged variant" design note.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub source: Option<String>,
    pub document_name: Option<String>,
    pub file_name: Option<String>,
    pub filename: Option<String>,
    pub doc_name: Option<String>,
    pub page: Option<u32>,
    /// Ingestion's own confidence in `page`, when it supplied one.
    pub page_confidence: Option<f32>,
    pub source_page: Option<u32>,
    pub chunk_index: Option<usize>,
    pub start_char: Option<usize>,
    pub end_char: Option<usize>,
    pub image_ref: Option<ImageRef>,
    pub image_page: Option<u32>,
    pub image_index: Option<u32>,
    pub custom: HashMap<String, String>,
}

impl ChunkMetadata {
    /// Probe a JSON value for metadata fields at the top level, falling
    /// back to a nested `metadata` object for any field not found at the
    /// top level. Tolerates either shape being present on read, per the
    /// persisted-state contract.
    pub fn from_probe(value: &serde_json::Value) -> Self {
        let nested = value.get("metadata");
        let field = |key: &str| -> Option<serde_json::Value> {
            value
                .get(key)
                .or_else(|| nested.and_then(|m| m.get(key)))
                .cloned()
        };
        let as_str = |key: &str| field(key).and_then(|v| v.as_str().map(|s| s.to_string()));
        let as_u32 = |key: &str| field(key).and_then(|v| v.as_u64()).map(|n| n as u32);
        let as_usize = |key: &str| field(key).and_then(|v| v.as_u64()).map(|n| n as usize);
        let as_f32 = |key: &str| field(key).and_then(|v| v.as_f64()).map(|n| n as f32);

        let image_ref = field("image_ref").and_then(|v| serde_json::from_value(v).ok());

        Self {
            source: as_str("source"),
            document_name: as_str("document_name"),
            file_name: as_str("file_name"),
            filename: as_str("filename"),
            doc_name: as_str("doc_name"),
            page: as_u32("page"),
            page_confidence: as_f32("page_confidence"),
            source_page: as_u32("source_page"),
            chunk_index: as_usize("chunk_index"),
            start_char: as_usize("start_char"),
            end_char: as_usize("end_char"),
            image_ref,
            image_page: as_u32("image_page"),
            image_index: as_u32("image_index"),
            custom: HashMap::new(),
        }
    }
}

/// A retrievable unit of text, as produced by the (out-of-scope) ingestion
/// pipeline and served back by the vector/lexical store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub text: String,
    pub vector: Vec<f32>,
    /// Basename of the originating document (no path separators).
    pub source: String,
    pub document_id: String,
    /// 1-based canonical page for this chunk. Set to 1 with
    /// `page_confidence = 0.1` when unknown.
    pub page: u32,
    pub start_char: usize,
    pub end_char: usize,
    pub chunk_index: usize,
    pub language: String,
    pub content_type: ContentType,
    #[serde(default)]
    pub page_blocks: Vec<PageBlock>,
    pub image_ref: Option<ImageRef>,
    pub text_english: Option<String>,
    #[serde(default)]
    pub metadata: ChunkMetadata,
}

impl Chunk {
    pub fn is_image_ocr(&self) -> bool {
        self.content_type == ContentType::ImageOcr
            || self.text.contains("<!-- image -->")
            || self.image_ref.is_some()
            || self.metadata.image_index.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    Text,
    ImageOcr,
}

impl ContentType {
    /// The content type as displayed on a citation — collapses to "image"
    /// whenever the chunk shows any OCR/image signal, per §4.5.4.
    pub fn display(self, is_image_like: bool) -> &'static str {
        if is_image_like || self == ContentType::ImageOcr {
            "image"
        } else {
            "text"
        }
    }
}

/// How a citation's page number was ultimately resolved. Ordered roughly by
/// descending reliability; used for debugging and for the end-to-end test
/// assertions in §8 of the specification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageExtractionMethod {
    TextMarker,
    Metadata,
    CharPosition,
    ImageMetadata,
    Heuristic,
    Fallback,
}

/// A query-time citation. Never persisted — built fresh for each response
/// and discarded once returned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Citation {
    pub id: usize,
    pub source: String,
    pub document_id: String,
    pub page: u32,
    pub snippet: String,
    pub full_text: String,
    pub similarity_score: Option<f32>,
    pub rerank_score: Option<f32>,
    pub similarity_percentage: f32,
    pub source_confidence: f32,
    pub page_confidence: f32,
    pub page_extraction_method: PageExtractionMethod,
    pub content_type: ContentTypeLabel,
    pub image_ref: Option<ImageRef>,
    pub chunk_index: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentTypeLabel {
    Text,
    Image,
}

/// A chunk plus its retrieval-time score, the unit of currency between C2/C3
/// and the reranker/citation builder.
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    /// Fused similarity score from hybrid search (RRF or weighted fusion).
    pub similarity_score: Option<f32>,
    /// Cross-encoder score, populated only after reranking.
    pub rerank_score: Option<f32>,
    /// Heuristic exact/partial phrase match score computed by the fanout
    /// (§4.3); `0.0` until C3 computes it.
    pub phrase_match_score: f32,
    /// Monotonic arrival order, used as the final sort tiebreaker.
    pub arrival_order: usize,
}

impl ScoredChunk {
    pub fn new(chunk: Chunk, similarity_score: Option<f32>, arrival_order: usize) -> Self {
        Self {
            chunk,
            similarity_score,
            rerank_score: None,
            phrase_match_score: 0.0,
            arrival_order,
        }
    }
}

/// Optional metadata predicate applied to both the vector and lexical
/// sub-queries, keeping candidate counts symmetric across the two lists.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetadataFilter {
    pub source: Option<String>,
    pub document_id: Option<String>,
    pub date_from: Option<i64>,
    pub date_to: Option<i64>,
    pub custom: Option<HashMap<String, String>>,
}

impl MetadataFilter {
    pub fn is_empty(&self) -> bool {
        self.source.is_none()
            && self.document_id.is_none()
            && self.date_from.is_none()
            && self.date_to.is_none()
            && self.custom.as_ref().map(|c| c.is_empty()).unwrap_or(true)
    }

    /// A stable string used as part of the cache key — order-independent
    /// over the `custom` map so two equivalent filters hash identically.
    pub fn stable_key(&self) -> String {
        let mut custom: Vec<(&String, &String)> = self
            .custom
            .as_ref()
            .map(|c| c.iter().collect())
            .unwrap_or_default();
        custom.sort_by(|a, b| a.0.cmp(b.0));
        format!(
            "{:?}|{:?}|{:?}|{:?}|{:?}",
            self.source, self.document_id, self.date_from, self.date_to, custom
        )
    }
}

/// Maps a document's display name to its physical vector-store index (and,
/// separately, its image-OCR index if one exists). Owned exclusively by the
/// core; read-mostly, replaced atomically on ingestion events.
#[derive(Debug, Clone, Default)]
pub struct DocumentIndexEntry {
    pub text_index: String,
    pub image_index: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_filter_stable_key_ignores_custom_map_order() {
        let mut a = MetadataFilter::default();
        a.custom = Some(HashMap::from([
            ("x".to_string(), "1".to_string()),
            ("y".to_string(), "2".to_string()),
        ]));
        let mut b = MetadataFilter::default();
        b.custom = Some(HashMap::from([
            ("y".to_string(), "2".to_string()),
            ("x".to_string(), "1".to_string()),
        ]));
        assert_eq!(a.stable_key(), b.stable_key());
    }

    #[test]
    fn chunk_metadata_probes_both_top_level_and_nested_shapes() {
        let top_level = serde_json::json!({"source": "handbook.pdf", "page": 5});
        let m = ChunkMetadata::from_probe(&top_level);
        assert_eq!(m.source.as_deref(), Some("handbook.pdf"));
        assert_eq!(m.page, Some(5));

        let nested = serde_json::json!({"metadata": {"source": "handbook.pdf", "page": 7}});
        let m = ChunkMetadata::from_probe(&nested);
        assert_eq!(m.source.as_deref(), Some("handbook.pdf"));
        assert_eq!(m.page, Some(7));
    }
}
