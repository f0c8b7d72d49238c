//! C5 — Citation Builder: constructs a query-time [`crate::types::Citation`]
//! from a retrieved chunk, per source spec §4.5. Split into the same three
//! concerns the teacher's mixins cover — source attribution, page
//! resolution, snippet generation — plus content-type labeling.
//!
//! Citation post-processing (deduplication, relevance ranking) lives in
//! [`crate::assembler`], since it operates on the full result set the
//! answer assembler produces rather than on one chunk at a time.

pub mod content_type;
pub mod page;
pub mod snippet;
pub mod source;

use crate::types::{Chunk, Citation, MetadataFilter, ScoredChunk};
use source::DocumentIndex;

/// Everything a single citation build needs beyond the scored chunk itself.
pub struct CitationContext<'a> {
    pub query: &'a str,
    pub document_index: Option<&'a DocumentIndex>,
    pub fallback_sources: &'a [String],
    pub doc_pages: Option<u32>,
    pub snippet_max_length: usize,
    pub embed: &'a dyn Fn(&str) -> Option<Vec<f32>>,
}

/// Build a citation from one scored chunk, running the source, page, and
/// snippet tier chains and tagging content type per §4.5.4.
pub fn build_citation(id: usize, scored: &ScoredChunk, ctx: &CitationContext) -> Citation {
    let chunk = &scored.chunk;
    let source_res = source::extract_source_for_chunk(chunk, ctx.document_index, ctx.fallback_sources);

    let page_block_texts: Vec<(u32, String)> = Vec::new(); // ingestion does not currently persist block text alongside page_blocks
    let page_res = page::extract_page_number(
        &chunk.metadata,
        &chunk.text,
        &chunk.page_blocks,
        &page_block_texts,
        ctx.doc_pages,
    );

    let snippet_source = effective_snippet_text(chunk, ctx.query);
    let snippet = snippet::generate_context_snippet(&snippet_source, ctx.query, ctx.snippet_max_length, ctx.embed);

    let content_type = content_type::label_for_chunk(chunk);
    let image_ref = content_type::image_ref_for_citation(chunk);

    Citation {
        id,
        source: source_res.source,
        document_id: chunk.document_id.clone(),
        page: page_res.page,
        snippet,
        full_text: chunk.text.clone(),
        similarity_score: scored.similarity_score,
        rerank_score: scored.rerank_score,
        similarity_percentage: 0.0, // assigned by the assembler's ranking pass
        source_confidence: source_res.confidence,
        page_confidence: page_res.confidence,
        page_extraction_method: page_res.method,
        content_type,
        image_ref,
        chunk_index: Some(chunk.chunk_index),
    }
}

/// Prefer the chunk's English translation over its native text when the
/// query itself is English and a translation is present, per the
/// cross-language snippet preference of source spec §4.5.3.
fn effective_snippet_text(chunk: &Chunk, query: &str) -> String {
    let looks_english = query.chars().all(|c| c.is_ascii());
    if looks_english {
        if let Some(english) = &chunk.text_english {
            if english.len() > 50 {
                return english.clone();
            }
        }
    }
    chunk.text.clone()
}

/// Build the `MetadataFilter` a citation builder's caller would apply to
/// restrict a document-scoped query, forwarding to the search executor's
/// own helper so both sides of the seam stay in lockstep.
pub fn filter_for_document(document_id: &str) -> MetadataFilter {
    MetadataFilter { document_id: Some(document_id.to_string()), ..Default::default() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ContentType, ContentTypeLabel};

    fn chunk() -> Chunk {
        Chunk {
            id: "c1".to_string(),
            text: "--- Page 4 ---\nThe quick brown fox jumps over the lazy dog.".to_string(),
            vector: vec![],
            source: "handbook.pdf".to_string(),
            document_id: "doc-1".to_string(),
            page: 0,
            start_char: 0,
            end_char: 50,
            chunk_index: 3,
            language: "eng".to_string(),
            content_type: ContentType::Text,
            page_blocks: vec![],
            image_ref: None,
            text_english: None,
            metadata: Default::default(),
        }
    }

    #[test]
    fn build_citation_uses_text_marker_page_and_metadata_source() {
        let mut c = chunk();
        c.metadata.source = Some("handbook.pdf".to_string());
        let scored = ScoredChunk::new(c, Some(0.9), 0);
        let ctx = CitationContext {
            query: "quick brown fox",
            document_index: None,
            fallback_sources: &[],
            doc_pages: None,
            snippet_max_length: 500,
            embed: &|_| None,
        };
        let citation = build_citation(1, &scored, &ctx);
        assert_eq!(citation.source, "handbook.pdf");
        assert_eq!(citation.page, 4);
        assert_eq!(citation.content_type, ContentTypeLabel::Text);
        assert!(citation.snippet.contains("fox"));
    }
}
