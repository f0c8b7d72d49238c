//! Page-number extraction and cross-validation, per source spec §4.5.2: a
//! priority chain of roughly a dozen signals (explicit text markers, image
//! metadata, character-position overlap, page_blocks text similarity,
//! metadata fields, and a page-1 fallback), each tagged with a
//! [`crate::types::PageExtractionMethod`] and a confidence in `[0, 1]`.

use crate::types::{ChunkMetadata, PageBlock, PageExtractionMethod};
use regex::Regex;
use std::sync::LazyLock;

const MIN_PAGE: u32 = 1;
const MAX_PAGE: u32 = 10_000;

static PAGE_MARKER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)---\s*Page\s+(\d+)\s*---").expect("page marker regex is valid"));
static SOURCE_PAGE_PATTERN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)Source:.*?Page\s+(\d+)").expect("source page pattern regex is valid"));
static IMAGE_PAGE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"(?i)Image\s+\d+\s+on\s+[Pp]age\s+(\d+)").unwrap(),
        Regex::new(r"(?i)Imagen\s+\d+\s+(?:en\s+)?[Pp][áa]gina\s+(\d+)").unwrap(),
        Regex::new(r"(?is)Fig(?:ure)?\s*\d+.*?[Pp]age\s+(\d+)").unwrap(),
        Regex::new(r"(?is)[Pp]age\s+(\d+).*?Image\s+\d+").unwrap(),
    ]
});
static PAGE_REF_START_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^[Pp]age\s+(\d+)").expect("page ref start regex is valid"));
static FOOTER_PAGE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"[-\u{2013}\u{2014}]\s*(\d+)\s*[-\u{2013}\u{2014}]").unwrap(),
        Regex::new(r"(?i)\bp(?:g|age)?\.?\s*(\d+)\b").unwrap(),
        Regex::new(r"(?i)\bp[áa]gina\s+(\d+)\b").unwrap(),
    ]
});
static TEXT_MARKER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)---\s*Page\s+(\d+)\s*---").expect("text marker regex is valid"));
static NAME_PREFIXED_PAGE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?im)(\w+)\s+Page\s+(\d+)").expect("name-prefixed page regex is valid"));
static STANDALONE_PAGE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)(?:^|\n)\s*Page\s+(\d+)(?:\s|$|\.|,|;|:)").expect("standalone page regex is valid")
});
static PAGE_OF_Y_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)Page\s+(\d+)(?:\s+of\s+\d+|\s*/\s*\d+)").expect("page-of-y regex is valid"));
static PAGE_RANGE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)Pages?\s+(\d+)[-\s]+(\d+)").expect("page range regex is valid"));

fn in_range(page: u32) -> bool {
    (MIN_PAGE..=MAX_PAGE).contains(&page)
}

/// `doc_pages == 0 or None` means the total page count is unknown; only
/// reject a candidate when the document's page count is known and positive.
fn within_document(page: u32, doc_pages: Option<u32>) -> bool {
    if !in_range(page) {
        return false;
    }
    match doc_pages {
        Some(total) if total > 0 => page <= total,
        _ => true,
    }
}

/// Resolved page plus the confidence and method used, matching the shape
/// the teacher's `_extract_page_number` returns as a tuple.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PageResolution {
    pub page: u32,
    pub confidence: f32,
    pub method: PageExtractionMethod,
}

/// Character-overlap page lookup: the page whose block overlaps the
/// chunk's `[start_char, end_char)` range the most, requiring >10% overlap
/// of the chunk's own span.
pub fn page_from_char_position(
    start_char: Option<usize>,
    end_char: Option<usize>,
    page_blocks: &[PageBlock],
) -> Option<u32> {
    let start_char = start_char?;
    if page_blocks.is_empty() {
        return None;
    }
    let chunk_end = end_char.unwrap_or(start_char + 500);
    let chunk_size = chunk_end.saturating_sub(start_char);
    if chunk_size == 0 {
        return None;
    }

    let mut best: Option<(u32, usize, f32)> = None; // (page, overlap_chars, overlap_ratio)
    for block in page_blocks {
        let overlap_start = start_char.max(block.start_char);
        let overlap_end = chunk_end.min(block.end_char);
        if overlap_start >= overlap_end {
            continue;
        }
        let overlap_chars = overlap_end - overlap_start;
        let overlap_ratio = overlap_chars as f32 / chunk_size as f32;

        match &mut best {
            Some((page, chars, ratio)) if *page == block.page => {
                *chars += overlap_chars;
                if overlap_ratio > *ratio {
                    *ratio = overlap_ratio;
                }
            }
            Some((page, chars, ratio)) if (overlap_chars, overlap_ratio) > (*chars, *ratio) => {
                *page = block.page;
                *chars = overlap_chars;
                *ratio = overlap_ratio;
            }
            Some(_) => {}
            None => best = Some((block.page, overlap_chars, overlap_ratio)),
        }
    }

    best.filter(|(_, _, ratio)| *ratio > 0.1).map(|(page, _, _)| page)
}

/// Cross-validate a proposed page against up to four corroborating signals
/// (`source_page` metadata, `page` metadata, character-position match,
/// explicit text marker). Two or more agreeing signals boost confidence by
/// 0.1 above the strongest; a single signal returns its own confidence;
/// none at all still returns the candidate, at confidence 0.5.
pub fn validate_page_assignment(
    page: u32,
    metadata: &ChunkMetadata,
    chunk_text: &str,
    page_blocks: &[PageBlock],
) -> f32 {
    let mut signals: Vec<f32> = Vec::new();

    if let Some(source_page) = metadata.source_page {
        if source_page == page {
            signals.push(1.0);
        }
    }
    if let Some(meta_page) = metadata.page {
        if meta_page == page {
            signals.push(0.8);
        }
    }
    if metadata.start_char.is_some() && !page_blocks.is_empty() {
        if let Some(from_pos) = page_from_char_position(metadata.start_char, metadata.end_char, page_blocks) {
            if from_pos == page {
                signals.push(1.0);
            }
        }
    }
    if let Some(caps) = TEXT_MARKER_RE.captures(chunk_text) {
        if let Some(marker_page) = caps.get(1).and_then(|m| m.as_str().parse::<u32>().ok()) {
            if marker_page == page {
                signals.push(0.6);
            }
        }
    }

    match signals.len() {
        0 => 0.5,
        1 => signals[0],
        _ => {
            let max_conf = signals.iter().cloned().fold(f32::MIN, f32::max);
            (max_conf + 0.1).min(1.0)
        }
    }
}

fn first_group_u32(re: &Regex, text: &str) -> Option<u32> {
    re.captures(text)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<u32>().ok())
}

/// Text-based fallback used when no character positions are available:
/// Jaccard word-overlap between the chunk's first 100/200 chars and each
/// page block's (or nested block's) text, requiring similarity > 0.30.
fn page_from_block_text_similarity(chunk_text: &str, page_blocks: &[(u32, String)]) -> Option<u32> {
    let preview = chunk_text.trim();
    if preview.is_empty() {
        return None;
    }
    let chunk_words: std::collections::HashSet<String> = preview
        .chars()
        .take(100)
        .collect::<String>()
        .to_lowercase()
        .split_whitespace()
        .map(|s| s.to_string())
        .collect();
    if chunk_words.is_empty() {
        return None;
    }

    let mut best: Option<(u32, f32)> = None;
    for (page, text) in page_blocks {
        let block_words: std::collections::HashSet<String> = text
            .chars()
            .take(200)
            .collect::<String>()
            .to_lowercase()
            .split_whitespace()
            .map(|s| s.to_string())
            .collect();
        if block_words.is_empty() {
            continue;
        }
        let overlap = chunk_words.intersection(&block_words).count();
        let union = chunk_words.union(&block_words).count();
        let similarity = if union > 0 { overlap as f32 / union as f32 } else { 0.0 };
        if similarity > 0.3 && best.map(|(_, s)| similarity > s).unwrap_or(true) {
            best = Some((*page, similarity));
        }
    }
    best.map(|(page, _)| page)
}

/// Full priority chain: text markers > "Source: ... Page X" > image-page
/// patterns > image metadata > character position > page_blocks text
/// similarity > source_page/page metadata (cross-validated) > assorted
/// "Page X" text patterns > chunk_index interpolation > any-field fallback
/// > page 1 at lowest confidence.
pub fn extract_page_number(
    metadata: &ChunkMetadata,
    chunk_text: &str,
    page_blocks: &[PageBlock],
    page_block_texts: &[(u32, String)],
    doc_pages: Option<u32>,
) -> PageResolution {
    // Priority 1: explicit "--- Page X ---" marker, first occurrence wins.
    if let Some(first) = PAGE_MARKER_RE.captures_iter(chunk_text).next() {
        if let Some(page) = first.get(1).and_then(|m| m.as_str().parse::<u32>().ok()) {
            if within_document(page, doc_pages) {
                return PageResolution { page, confidence: 0.98, method: PageExtractionMethod::TextMarker };
            }
        }
    }

    // Priority 2: "Source: ... Page X" pattern.
    if let Some(page) = first_group_u32(&SOURCE_PAGE_PATTERN_RE, chunk_text) {
        if within_document(page, doc_pages) {
            return PageResolution { page, confidence: 0.95, method: PageExtractionMethod::TextMarker };
        }
    }

    let has_image = metadata.image_ref.is_some()
        || metadata.image_index.is_some()
        || chunk_text.contains("<!-- image -->");

    if has_image {
        for pattern in IMAGE_PAGE_PATTERNS.iter() {
            let window: String = chunk_text.chars().take(500).collect();
            if let Some(page) = first_group_u32(pattern, &window) {
                if within_document(page, doc_pages) {
                    return PageResolution { page, confidence: 0.95, method: PageExtractionMethod::ImageMetadata };
                }
            }
        }

        let head: String = chunk_text.chars().take(100).collect();
        if let Some(page) = first_group_u32(&PAGE_REF_START_RE, &head) {
            if within_document(page, doc_pages) {
                return PageResolution { page, confidence: 0.9, method: PageExtractionMethod::ImageMetadata };
            }
        }

        let tail_chars: Vec<char> = chunk_text.chars().collect();
        let tail_start = tail_chars.len().saturating_sub(200);
        let tail: String = tail_chars[tail_start..].iter().collect();
        for pattern in FOOTER_PAGE_PATTERNS.iter() {
            if let Some(page) = first_group_u32(pattern, &tail) {
                if within_document(page, doc_pages) {
                    return PageResolution { page, confidence: 0.85, method: PageExtractionMethod::ImageMetadata };
                }
            }
        }
    }

    if let Some(image_ref) = &metadata.image_ref {
        if image_ref.page > 0 && within_document(image_ref.page, doc_pages) {
            let is_early = metadata.start_char.map(|s| s < 2000).unwrap_or(false) || image_ref.image_index <= 1;
            if image_ref.page > 1 {
                return PageResolution { page: image_ref.page, confidence: 0.8, method: PageExtractionMethod::ImageMetadata };
            } else if is_early {
                return PageResolution { page: 1, confidence: 0.75, method: PageExtractionMethod::ImageMetadata };
            }
        }
    }
    if let Some(image_page) = metadata.image_page {
        if within_document(image_page, doc_pages) {
            if image_page > 1 {
                return PageResolution { page: image_page, confidence: 0.8, method: PageExtractionMethod::ImageMetadata };
            } else if metadata.start_char.map(|s| s < 2000).unwrap_or(false) {
                return PageResolution { page: 1, confidence: 0.75, method: PageExtractionMethod::ImageMetadata };
            }
        }
    }

    // Priority: character-position matching, highest accuracy for text content.
    if metadata.start_char.is_some() && !page_blocks.is_empty() {
        if let Some(page) = page_from_char_position(metadata.start_char, metadata.end_char, page_blocks) {
            if within_document(page, doc_pages) {
                return PageResolution { page, confidence: 1.0, method: PageExtractionMethod::CharPosition };
            }
        }
    }

    if let Some(source_page) = metadata.source_page {
        if within_document(source_page, doc_pages) {
            let validated = validate_page_assignment(source_page, metadata, chunk_text, page_blocks);
            let confidence = if validated >= 0.8 { validated } else { 1.0 };
            return PageResolution { page: source_page, confidence, method: PageExtractionMethod::Metadata };
        }
    }

    if !page_blocks.is_empty() || !page_block_texts.is_empty() {
        let from_text = if metadata.start_char.is_some() {
            page_from_char_position(metadata.start_char, metadata.end_char, page_blocks)
        } else {
            None
        }
        .or_else(|| page_from_block_text_similarity(chunk_text, page_block_texts));

        if let Some(page) = from_text {
            if within_document(page, doc_pages) {
                let validated = validate_page_assignment(page, metadata, chunk_text, page_blocks);
                return PageResolution { page, confidence: validated.max(0.9), method: PageExtractionMethod::Metadata };
            }
        }
    }

    if let Some(page) = metadata.page {
        if within_document(page, doc_pages) {
            let validated = validate_page_assignment(page, metadata, chunk_text, page_blocks);
            return PageResolution { page, confidence: validated, method: PageExtractionMethod::Metadata };
        }
    }

    if let Some(page) = first_group_u32(&TEXT_MARKER_RE, chunk_text) {
        if within_document(page, doc_pages) {
            return PageResolution { page, confidence: 0.6, method: PageExtractionMethod::TextMarker };
        }
    }

    if let Some(caps) = NAME_PREFIXED_PAGE_RE.captures(chunk_text) {
        if let Some(page) = caps.get(2).and_then(|m| m.as_str().parse::<u32>().ok()) {
            if doc_pages.map(|total| page <= total).unwrap_or(true) && in_range(page) {
                return PageResolution { page, confidence: 0.5, method: PageExtractionMethod::Heuristic };
            }
        }
    }

    if let Some(page) = first_group_u32(&STANDALONE_PAGE_RE, chunk_text) {
        if within_document(page, doc_pages) {
            return PageResolution { page, confidence: 0.4, method: PageExtractionMethod::Heuristic };
        }
    }

    if let Some(page) = first_group_u32(&PAGE_OF_Y_RE, chunk_text) {
        if within_document(page, doc_pages) {
            return PageResolution { page, confidence: 0.4, method: PageExtractionMethod::Heuristic };
        }
    }

    if let Some(page) = first_group_u32(&PAGE_RANGE_RE, chunk_text) {
        if within_document(page, doc_pages) {
            return PageResolution { page, confidence: 0.4, method: PageExtractionMethod::Heuristic };
        }
    }

    if let (Some(chunk_index), false) = (metadata.chunk_index, page_blocks.is_empty()) {
        let total_chunks = page_blocks.len();
        if total_chunks > 0 {
            let denom = doc_pages.unwrap_or(1).max(1);
            let estimated = ((chunk_index as f32 / total_chunks.max(1) as f32) * denom as f32) as u32 + 1;
            let estimated = estimated.min(denom);
            if within_document(estimated, doc_pages) {
                return PageResolution { page: estimated, confidence: 0.3, method: PageExtractionMethod::Heuristic };
            }
        }
    }

    if let Some(page) = metadata.page.or(metadata.source_page).or(metadata.image_page) {
        if within_document(page, doc_pages) {
            return PageResolution { page, confidence: 0.2, method: PageExtractionMethod::Fallback };
        }
    }

    PageResolution { page: 1, confidence: 0.1, method: PageExtractionMethod::Fallback }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> ChunkMetadata {
        ChunkMetadata::default()
    }

    fn block(page: u32, start: usize, end: usize) -> PageBlock {
        PageBlock { page, start_char: start, end_char: end, block_type: String::new() }
    }

    #[test]
    fn text_marker_wins_at_highest_confidence() {
        let m = meta();
        let text = "--- Page 7 ---\nSome body text.";
        let res = extract_page_number(&m, text, &[], &[], None);
        assert_eq!(res.page, 7);
        assert_eq!(res.method, PageExtractionMethod::TextMarker);
        assert!((res.confidence - 0.98).abs() < 1e-6);
    }

    #[test]
    fn image_footer_tail_does_not_panic_on_multibyte_text() {
        let mut m = meta();
        m.image_index = Some(0);
        // Multibyte filler so that a naive `len() - 200` byte slice lands
        // mid-codepoint; the footer marker sits at the very end.
        let filler = "p\u{e1}gina ".repeat(40);
        let text = format!("{filler}- 12 -");
        let res = extract_page_number(&m, &text, &[], &[], None);
        assert_eq!(res.page, 12);
        assert_eq!(res.method, PageExtractionMethod::ImageMetadata);
    }

    #[test]
    fn char_position_overlap_picks_max_overlap_page() {
        let mut m = meta();
        m.start_char = Some(100);
        m.end_char = Some(200);
        let blocks = vec![block(3, 0, 150), block(4, 150, 300)];
        let page = page_from_char_position(m.start_char, m.end_char, &blocks);
        assert_eq!(page, Some(4));
    }

    #[test]
    fn char_position_requires_more_than_10_percent_overlap() {
        let blocks = vec![block(5, 990, 1000)];
        let page = page_from_char_position(Some(0), Some(1000), &blocks);
        assert_eq!(page, None);
    }

    #[test]
    fn page_exceeding_doc_pages_is_rejected_when_doc_pages_known() {
        let mut m = meta();
        m.page = Some(50);
        let res = extract_page_number(&m, "no markers here", &[], &[], Some(10));
        assert_ne!(res.page, 50);
    }

    #[test]
    fn zero_doc_pages_does_not_reject_candidate() {
        let mut m = meta();
        m.page = Some(50);
        let res = extract_page_number(&m, "no markers here", &[], &[], Some(0));
        assert_eq!(res.page, 50);
    }

    #[test]
    fn no_signal_falls_back_to_page_one() {
        let m = meta();
        let res = extract_page_number(&m, "body text with nothing useful", &[], &[], None);
        assert_eq!(res.page, 1);
        assert_eq!(res.method, PageExtractionMethod::Fallback);
        assert!((res.confidence - 0.1).abs() < 1e-6);
    }

    #[test]
    fn validate_page_assignment_boosts_when_two_signals_agree() {
        let mut m = meta();
        m.source_page = Some(5);
        m.page = Some(5);
        let confidence = validate_page_assignment(5, &m, "", &[]);
        assert!((confidence - 1.0).abs() < 1e-6);
    }

    #[test]
    fn validate_page_assignment_single_signal_returns_its_confidence() {
        let mut m = meta();
        m.page = Some(5);
        let confidence = validate_page_assignment(5, &m, "", &[]);
        assert!((confidence - 0.8).abs() < 1e-6);
    }

    #[test]
    fn validate_page_assignment_no_signal_returns_midpoint() {
        let m = meta();
        let confidence = validate_page_assignment(5, &m, "", &[]);
        assert!((confidence - 0.5).abs() < 1e-6);
    }
}
