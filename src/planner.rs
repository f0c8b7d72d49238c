//! C6 — Query Planner: classifies an incoming question and decides the
//! retrieval strategy before C2/C3 ever run, per source spec §4.6.
//!
//! Four independent signals are extracted from the raw question text:
//! an occurrence-search term (which bypasses retrieval/LLM generation
//! entirely, see [`find_all_occurrences`]), a summary/overview expansion
//! (widens `k` and enables agentic decomposition), a contact-query flag
//! (disables reranking so a relevant chunk is never dropped), and a
//! document-scope narrowing (fuzzy-matches document names mentioned in
//! the question). Agentic decomposition itself is delegated to the
//! crate's [`crate::query_decomposer`] module, generalized here
//! from "always split" to "split only when the planner calls for it".

use crate::assembler::{char_ceil, char_floor};
use crate::config::PlannerConfig;
use crate::query_decomposer::{decompose_query, DecomposedQuery};
use crate::types::{Chunk, Citation, ContentTypeLabel, ImageRef, PageExtractionMethod};
use std::sync::LazyLock;

static QUOTED_RE: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r#""([^"]+)""#).expect("quoted phrase regex is valid"));
static OCCURRENCES_OF_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"(?i)(?:all\s+)?occurrences?\s+of\s+(.+)$").expect("occurrences-of regex is valid")
});
static WHERE_DOES_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"(?i)where\s+(?:does|do)\s+(.+?)\s+(?:appear|occur|show\s+up)\b")
        .expect("where-does regex is valid")
});
static FIND_ALL_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"(?i)(?:find|show\s+me)\s+all\s+(.+)$").expect("find-all regex is valid")
});

/// Substrings that, if present, mean a question is an ordinary RAG question
/// even though it might otherwise look like an occurrence search — exact
/// exclusion list of `_detect_occurrence_query`.
const OCCURRENCE_EXCLUSIONS: &[&str] = &[
    "what is",
    "what are",
    "how does",
    "how do",
    "explain",
    "describe",
    "tell me about",
    "information about",
    "details about",
    "schematic",
    "diagram",
    "image",
    "picture",
    "figure",
    "contact",
    "email",
    "phone",
    "address",
    "number",
    "in the document",
    "in document",
    "document me",
    "btaein",
    "batao",
    "kya hai",
];

/// Substrings that mark a contact-info lookup; reranking is disabled for
/// these since dropping a chunk could hide the answer.
const CONTACT_MARKERS: &[&str] = &["contact", "email", "phone", "address"];

/// Exact keyword list of `_detect_and_expand_query`.
const SUMMARY_KEYWORDS: &[&str] = &[
    "summary",
    "summarize",
    "overview",
    "what is this document about",
    "what does this document contain",
    "what is in this document",
    "tell me about",
    "describe",
    "explain this document",
    "what are the main points",
    "key points",
    "highlights",
    "what is the document about",
    "document summary",
];

/// Detect an explicit "find all occurrences of X" style question and pull
/// out the search term, or `None` if this is an ordinary question. Mirrors
/// `_detect_occurrence_query`: an exclusion list takes priority over every
/// positive pattern, since generic questions ("what is the phone number")
/// would otherwise false-positive on word overlap.
pub fn detect_occurrence_query(question: &str) -> Option<String> {
    let q = question.trim();
    if q.is_empty() {
        return None;
    }
    let ql = q.to_lowercase();

    if OCCURRENCE_EXCLUSIONS.iter().any(|e| ql.contains(e)) {
        return None;
    }

    if let Some(cap) = QUOTED_RE.captures(q) {
        let term = cap.get(1)?.as_str().trim();
        if !term.is_empty() && ["occurrence", "find all", "show me all", "highlight"].iter().any(|t| ql.contains(t)) {
            return Some(term.to_string());
        }
    }

    if let Some(cap) = OCCURRENCES_OF_RE.captures(&ql) {
        let term = cap.get(1)?.as_str().trim();
        if !term.is_empty() {
            return Some(term.to_string());
        }
    }

    if let Some(cap) = WHERE_DOES_RE.captures(&ql) {
        let term = cap.get(1)?.as_str().trim();
        if !term.is_empty() {
            return Some(term.to_string());
        }
    }

    if let Some(cap) = FIND_ALL_RE.captures(&ql) {
        let term = cap.get(1)?.as_str().trim();
        if !term.is_empty() {
            return Some(term.to_string());
        }
    }

    None
}

/// `true` if the question is a contact-info lookup (email/phone/address),
/// in which case the caller should disable reranking.
pub fn is_contact_query(question: &str) -> bool {
    let ql = question.to_lowercase();
    CONTACT_MARKERS.iter().any(|m| ql.contains(m))
}

/// Result of summary-query detection: whether the question was recognized
/// as a summary/overview request, the (possibly expanded) query text to
/// retrieve with, and a raised `k` when expansion applied.
#[derive(Debug, Clone, PartialEq)]
pub struct SummaryExpansion {
    pub is_summary: bool,
    pub query: String,
    pub suggested_k: Option<usize>,
}

/// Detect a summary/overview question and expand it with aspect hints so
/// retrieval surfaces broader document coverage, per `_detect_and_expand_query`.
pub fn detect_and_expand_query(question: &str, default_k: usize, config: &PlannerConfig) -> SummaryExpansion {
    let ql = question.to_lowercase();
    let is_summary = SUMMARY_KEYWORDS.iter().any(|k| ql.contains(k));
    if !is_summary {
        return SummaryExpansion { is_summary: false, query: question.to_string(), suggested_k: None };
    }

    let expanded = format!(
        "{question} Include: overview, introduction, key points, main topics, important information, highlights, main themes, primary content"
    );
    let suggested_k = ((default_k as f32) * config.summary_k_multiplier) as usize;
    let suggested_k = suggested_k.max(config.summary_min_k);
    SummaryExpansion { is_summary: true, query: expanded, suggested_k: Some(suggested_k) }
}

fn base_name(doc_name: &str) -> String {
    match doc_name.rsplit_once('.') {
        Some((stem, _ext)) => stem.to_lowercase(),
        None => doc_name.to_lowercase(),
    }
}

fn significant_words(base: &str) -> Vec<&str> {
    base.split(|c: char| c == ' ' || c == '_' || c == '-' || c == '.')
        .filter(|w| w.len() > 1)
        .collect()
}

/// Fuzzy-detect mentions of specific document names in a question, so the
/// planner can narrow `active_sources` automatically. Mirrors
/// `_detect_document_in_question`: longer names are matched first so
/// "VUORMAR MK" wins over the shorter "VUORMAR" when both are available,
/// and a later subset match is discarded once a longer name already
/// covers it.
pub fn detect_document_in_question(question: &str, available_docs: &[String]) -> Option<Vec<String>> {
    if question.is_empty() || available_docs.is_empty() {
        return None;
    }
    let ql = question.to_lowercase();

    let mut sorted_docs: Vec<&String> = available_docs.iter().collect();
    sorted_docs.sort_by_key(|d| std::cmp::Reverse(d.len()));

    let mut detected: Vec<String> = Vec::new();
    for doc_name in sorted_docs {
        let base = base_name(doc_name);
        let doc_lower = doc_name.to_lowercase();

        let direct_match = ql.contains(&base) || ql.contains(&doc_lower.replace(".pdf", ""));
        if direct_match {
            let already_matched = detected
                .iter()
                .any(|d| base_name(d).contains(&base) && d.len() > doc_name.len());
            if !already_matched {
                detected.push(doc_name.clone());
                continue;
            }
        }

        let words = significant_words(&base);
        if words.len() >= 2 {
            let all_present = words.iter().all(|w| ql.contains(w));
            if all_present && !detected.contains(doc_name) {
                detected.push(doc_name.clone());
            }
        }
    }

    if detected.len() > 1 {
        let filtered: Vec<String> = detected
            .iter()
            .filter(|doc| {
                let base = base_name(doc);
                !detected
                    .iter()
                    .any(|other| other != *doc && base_name(other).contains(&base) && other.len() > doc.len())
            })
            .cloned()
            .collect();
        if !filtered.is_empty() {
            detected = filtered;
        }
    }

    if detected.is_empty() {
        None
    } else {
        Some(detected)
    }
}

/// The planner's full verdict for one question: what kind of query this
/// is, what to actually retrieve with, and which downstream switches to
/// flip. Built by [`plan_query`]; consumed by the top-level engine.
#[derive(Debug, Clone)]
pub struct QueryPlan {
    pub occurrence_term: Option<String>,
    pub retrieval_query: String,
    pub suggested_k: Option<usize>,
    pub disable_reranking: bool,
    pub scoped_documents: Option<Vec<String>>,
    pub decomposition: Option<DecomposedQuery>,
}

impl QueryPlan {
    pub fn is_occurrence_query(&self) -> bool {
        self.occurrence_term.is_some()
    }
}

/// Run every classification pass over a question and assemble the plan the
/// engine should act on. Agentic decomposition only runs when the caller
/// says it's enabled (summary queries force it on, per §4.6).
pub fn plan_query(
    question: &str,
    default_k: usize,
    config: &PlannerConfig,
    available_docs: &[String],
    agentic_enabled: bool,
) -> QueryPlan {
    let scoped_documents = detect_document_in_question(question, available_docs);

    if let Some(term) = detect_occurrence_query(question) {
        return QueryPlan {
            occurrence_term: Some(term),
            retrieval_query: question.to_string(),
            suggested_k: None,
            disable_reranking: true,
            scoped_documents,
            decomposition: None,
        };
    }

    let disable_reranking = is_contact_query(question);
    let summary = detect_and_expand_query(question, default_k, config);
    let agentic_forced = summary.is_summary;

    let decomposition = if agentic_enabled && (agentic_forced || question.split_whitespace().count() >= 5) {
        let mut decomposed = decompose_query(&summary.query);
        decomposed.sub_queries.truncate(config.max_sub_queries.max(1));
        if decomposed.sub_queries.len() > 1 {
            Some(decomposed)
        } else {
            None
        }
    } else {
        None
    };

    QueryPlan {
        occurrence_term: None,
        retrieval_query: summary.query,
        suggested_k: summary.suggested_k,
        disable_reranking,
        scoped_documents,
        decomposition,
    }
}

/// One located match of an occurrence-search term within a candidate chunk.
#[derive(Debug, Clone)]
struct Occurrence {
    source: String,
    document_id: String,
    page: u32,
    snippet: String,
    image_index: Option<u32>,
    start_char: Option<usize>,
}

/// The full result of an occurrence search: a human-readable answer, a
/// citation per match, and the set of sources that contributed at least
/// one match.
#[derive(Debug, Clone)]
pub struct OccurrenceResult {
    pub answer: String,
    pub citations: Vec<Citation>,
    pub sources: Vec<String>,
    pub truncated: bool,
}

/// Enumerate every occurrence of `term` across `candidates`, skipping LLM
/// generation entirely per §4.6. Whole-word match for a single token,
/// substring match for a multi-word phrase, both case-insensitive.
pub fn find_all_occurrences(
    term: &str,
    candidates: &[Chunk],
    default_source: &str,
    max_results: usize,
    context_chars: usize,
) -> OccurrenceResult {
    let term_clean = term.trim();
    if term_clean.is_empty() {
        return OccurrenceResult {
            answer: "Please provide a word or phrase to find.".to_string(),
            citations: vec![],
            sources: vec![],
            truncated: false,
        };
    }

    let pattern = if term_clean.contains(' ') {
        regex::RegexBuilder::new(&regex::escape(term_clean)).case_insensitive(true).build()
    } else {
        regex::RegexBuilder::new(&format!(r"\b{}\b", regex::escape(term_clean))).case_insensitive(true).build()
    };
    let pattern = match pattern {
        Ok(p) => p,
        Err(_) => {
            return OccurrenceResult {
                answer: "Please provide a word or phrase to find.".to_string(),
                citations: vec![],
                sources: vec![],
                truncated: false,
            }
        }
    };

    let mut occurrences: Vec<Occurrence> = Vec::new();
    for chunk in candidates {
        let text = &chunk.text;
        for m in pattern.find_iter(text) {
            let start = char_floor(text, m.start().saturating_sub(context_chars));
            let end = char_ceil(text, (m.end() + context_chars).min(text.len()));
            let snippet = text[start..end].replace('\n', " ").trim().to_string();

            let page = chunk.metadata.source_page.or(chunk.metadata.page).unwrap_or(chunk.page).max(1);
            let image_index = chunk
                .image_ref
                .as_ref()
                .map(|r| r.image_index)
                .or(chunk.metadata.image_index);
            let source = chunk.metadata.source.clone().unwrap_or_else(|| chunk.source.clone());

            occurrences.push(Occurrence {
                source,
                document_id: chunk.document_id.clone(),
                page,
                snippet,
                image_index,
                start_char: Some(m.start()),
            });
        }
    }

    occurrences.sort_by_key(|o| (o.page, o.image_index.unwrap_or(u32::MAX), o.start_char.unwrap_or(usize::MAX)));

    let truncated = occurrences.len() > max_results;
    if truncated {
        occurrences.truncate(max_results);
    }

    let source_name = occurrences
        .first()
        .map(|o| o.source.clone())
        .unwrap_or_else(|| default_source.to_string());

    let answer = build_occurrence_answer(term_clean, &source_name, &occurrences, truncated);

    let mut sources: Vec<String> = occurrences.iter().map(|o| o.source.clone()).collect();
    sources.sort();
    sources.dedup();
    if sources.is_empty() {
        sources.push(source_name.clone());
    }

    let citations: Vec<Citation> = occurrences
        .iter()
        .enumerate()
        .map(|(idx, occ)| {
            let is_image = occ.image_index.is_some() || occ.snippet.contains("<!-- image -->");
            Citation {
                id: idx + 1,
                source: occ.source.clone(),
                document_id: occ.document_id.clone(),
                page: occ.page,
                snippet: occ.snippet.clone(),
                full_text: occ.snippet.clone(),
                similarity_score: None,
                rerank_score: None,
                similarity_percentage: 0.0,
                source_confidence: 1.0,
                page_confidence: 1.0,
                page_extraction_method: PageExtractionMethod::Metadata,
                content_type: if is_image { ContentTypeLabel::Image } else { ContentTypeLabel::Text },
                image_ref: is_image.then(|| ImageRef { page: occ.page, image_index: occ.image_index.unwrap_or(0), bbox: None }),
                chunk_index: None,
            }
        })
        .collect();

    OccurrenceResult { answer, citations, sources, truncated }
}

/// Build the human-readable answer for an occurrence search, per
/// `_build_occurrence_answer`. Unlike [`crate::citation::content_type::display_location`],
/// this *does* surface the raw image index — this is a plain text listing
/// of search hits, not a `Citation`'s displayed location, so there is no
/// misleading per-document numbering concern here.
fn build_occurrence_answer(term: &str, source: &str, occurrences: &[Occurrence], truncated: bool) -> String {
    let total = occurrences.len();
    let mut header = format!("Found {total} occurrence(s) of '{term}' in {source}.");
    if truncated {
        header.push_str(" (Results truncated.)");
    }

    let mut lines = vec![header, String::new()];
    for occ in occurrences {
        let mut loc_parts = vec![format!("Page {}", occ.page)];
        if let Some(idx) = occ.image_index {
            loc_parts.push(format!("Image {idx}"));
        }
        let loc = loc_parts.join(" | ");
        if occ.snippet.is_empty() {
            lines.push(format!("- {loc}"));
        } else {
            lines.push(format!("- {loc}: {}", occ.snippet));
        }
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChunkMetadata, ContentType};

    fn cfg() -> PlannerConfig {
        PlannerConfig {
            max_sub_queries: 3,
            chunks_per_subquery: 10,
            max_total_chunks: 30,
            max_occurrence_results: 200,
            occurrence_context_chars: 80,
            summary_k_multiplier: 2.0,
            summary_min_k: 20,
        }
    }

    #[test]
    fn quoted_occurrence_query_extracts_term() {
        let term = detect_occurrence_query(r#"find all occurrences of "SKU-4412""#);
        assert_eq!(term.as_deref(), Some("SKU-4412"));
    }

    #[test]
    fn where_does_pattern_extracts_term() {
        let term = detect_occurrence_query("where does the term liability appear");
        assert_eq!(term.as_deref(), Some("the term liability"));
    }

    #[test]
    fn exclusion_wins_over_positive_pattern() {
        assert_eq!(detect_occurrence_query("what is the phone number"), None);
        assert_eq!(detect_occurrence_query("tell me about the contact information"), None);
    }

    #[test]
    fn plain_question_is_not_an_occurrence_query() {
        assert_eq!(detect_occurrence_query("what is the leave policy"), None);
    }

    #[test]
    fn contact_query_detected_by_keyword() {
        assert!(is_contact_query("what is the contact email"));
        assert!(!is_contact_query("what is the leave policy"));
    }

    #[test]
    fn summary_query_expands_and_raises_k() {
        let result = detect_and_expand_query("give me a summary of this document", 10, &cfg());
        assert!(result.is_summary);
        assert!(result.query.contains("Include: overview"));
        assert_eq!(result.suggested_k, Some(20));
    }

    #[test]
    fn summary_k_multiplier_wins_when_above_floor() {
        let result = detect_and_expand_query("summarize this", 50, &cfg());
        assert_eq!(result.suggested_k, Some(100));
    }

    #[test]
    fn longer_document_name_wins_over_substring() {
        let docs = vec!["VUORMAR.pdf".to_string(), "VUORMAR MK.pdf".to_string()];
        let detected = detect_document_in_question("what is in VUORMAR MK?", &docs).unwrap();
        assert_eq!(detected, vec!["VUORMAR MK.pdf".to_string()]);
    }

    #[test]
    fn multi_word_name_requires_all_words_present() {
        let docs = vec!["Employee Handbook.pdf".to_string()];
        assert!(detect_document_in_question("what is the handbook policy", &docs).is_none());
        assert!(detect_document_in_question("what is in employee handbook", &docs).is_some());
    }

    fn chunk(text: &str, page: u32) -> Chunk {
        Chunk {
            id: "c".to_string(),
            text: text.to_string(),
            vector: vec![],
            source: "catalog.pdf".to_string(),
            document_id: "doc-1".to_string(),
            page,
            start_char: 0,
            end_char: text.len(),
            chunk_index: 0,
            language: "eng".to_string(),
            content_type: ContentType::Text,
            page_blocks: vec![],
            image_ref: None,
            text_english: None,
            metadata: ChunkMetadata { source_page: Some(page), ..Default::default() },
        }
    }

    #[test]
    fn find_all_occurrences_sorts_by_page_then_position() {
        let chunks = vec![
            chunk("the part SKU-4412 is on page seventeen, again SKU-4412 here", 17),
            chunk("SKU-4412 appears on page two", 2),
        ];
        let result = find_all_occurrences("SKU-4412", &chunks, "catalog.pdf", 200, 20);
        assert_eq!(result.citations.len(), 3);
        assert_eq!(result.citations.iter().map(|c| c.page).collect::<Vec<_>>(), vec![2, 17, 17]);
        assert!(result.answer.contains("Found 3 occurrence(s) of 'SKU-4412' in catalog.pdf."));
        assert!(!result.truncated);
    }

    #[test]
    fn find_all_occurrences_truncates_at_max_results() {
        let chunks = vec![chunk("aaa bbb aaa bbb aaa bbb aaa", 1)];
        let result = find_all_occurrences("aaa", &chunks, "doc.pdf", 2, 5);
        assert_eq!(result.citations.len(), 2);
        assert!(result.truncated);
    }

    #[test]
    fn single_token_match_is_whole_word() {
        let chunks = vec![chunk("attendance attendances attend", 1)];
        let result = find_all_occurrences("attend", &chunks, "doc.pdf", 200, 10);
        assert_eq!(result.citations.len(), 1);
    }

    #[test]
    fn occurrence_context_window_does_not_panic_on_multibyte_text() {
        // "p\u{e1}gina" (Spanish) and transliterated Hindi text surround the
        // match; an 80-char context window computed in raw byte offsets
        // would land mid-codepoint and panic when sliced.
        let filler = "p\u{e1}gina describe el procedimiento \u{930}\u{947}\u{916}\u{93e}\u{902}\u{915}\u{928} ";
        let text = format!("{}{}{}", filler.repeat(3), "SKU-4412", filler.repeat(3));
        let chunks = vec![chunk(&text, 1)];
        let result = find_all_occurrences("SKU-4412", &chunks, "doc.pdf", 200, 80);
        assert_eq!(result.citations.len(), 1);
        assert!(result.citations[0].snippet.contains("SKU-4412"));
    }
}
