//! Citation snippet generation, per source spec §4.5.3: semantic
//! sentence-scoring against the query (cosine similarity + bounded keyword
//! overlap boost) with a keyword-position-centered fallback when semantic
//! scoring is unavailable or too weak, matching the teacher's cross-encoder
//! input preparation style in `reranking/cross_encoder.rs` for batching
//! embedding calls.

use regex::Regex;
use std::collections::HashSet;
use std::sync::LazyLock;

static PAGE_MARKER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)---\s*Page\s+\d+\s*---\s*\n?").expect("page marker regex is valid"));
static WORD_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b\w+\b").expect("word regex is valid"));

const STOP_WORDS: &[&str] = &[
    "the", "a", "an", "and", "or", "but", "in", "on", "at", "to", "for", "of", "with", "by", "is",
    "are", "was", "were", "be", "been", "have", "has", "had", "do", "does", "did", "will", "would",
    "should", "could", "may", "might", "must", "can", "about", "tell", "me", "what", "when",
    "where", "who", "why", "how",
];

/// English + Spanish stopword list used for query-keyword extraction. Kept
/// separate from the smaller [`STOP_WORDS`] list used inline by the
/// keyword-position fallback, mirroring the teacher's two distinct stopword
/// sets for the two call sites.
const KEYWORD_STOP_WORDS: &[&str] = &[
    "a", "an", "the", "is", "are", "was", "were", "be", "been", "being", "have", "has", "had",
    "do", "does", "did", "will", "would", "could", "should", "may", "might", "must", "shall",
    "can", "need", "dare", "ought", "used", "to", "of", "in", "for", "on", "with", "at", "by",
    "from", "as", "into", "through", "during", "before", "after", "above", "below", "between",
    "under", "again", "further", "then", "once", "here", "there", "when", "where", "why", "how",
    "all", "each", "few", "more", "most", "other", "some", "such", "no", "nor", "not", "only",
    "own", "same", "so", "than", "too", "very", "just", "and", "but", "if", "or", "because",
    "until", "while", "although", "what", "which", "who", "whom", "this", "that", "these",
    "those", "am", "it", "its", "i", "me", "my", "myself", "we", "our", "ours", "you", "your",
    "he", "him", "his", "she", "her", "they", "them", "about", "also", "any", "both", "get",
    "got", "out", "up", "down", "off", "over",
    "el", "la", "los", "las", "un", "una", "unos", "unas", "de", "del", "en", "y", "o", "al",
    "con", "por", "para", "como", "su", "sus", "este", "esta", "estos", "estas", "lo", "le",
    "les", "te", "se", "nos", "os", "mi", "tu", "ti", "que", "qu\u{e9}", "es", "son", "fue",
    "era", "ser", "estar", "han", "hab\u{ed}a", "habia", "todo", "todos", "toda", "todas",
];

/// Cosine similarity between two equal-length embedding vectors. Returns
/// `0.0` on dimension mismatch or a zero-norm vector, mirroring the
/// teacher's defensive handling in the cross-encoder's sigmoid path.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a > 0.0 && norm_b > 0.0 {
        dot / (norm_a * norm_b)
    } else {
        0.0
    }
}

/// Word-overlap similarity (Jaccard over whitespace-split tokens), the
/// fallback used when embeddings are unavailable.
fn word_overlap_similarity(text1: &str, text2: &str) -> f32 {
    let words1: HashSet<&str> = text1.split_whitespace().collect();
    let words2: HashSet<&str> = text2.split_whitespace().collect();
    if words1.is_empty() || words2.is_empty() {
        return 0.0;
    }
    let intersection = words1.intersection(&words2).count();
    let union = words1.union(&words2).count();
    if union > 0 { intersection as f32 / union as f32 } else { 0.0 }
}

/// `keyword[..min(5, len-1)]`, the fixed-length prefix used for stem-based
/// fuzzy matching of keywords longer than 4 characters.
fn keyword_stem(keyword: &str) -> &str {
    let stem_len = keyword.len().saturating_sub(1).min(5).max(1);
    &keyword[..stem_len]
}

/// Split `text` into sentences at whitespace that follows a `.`/`!`/`?` and
/// is itself followed by an uppercase letter (heuristically skips
/// abbreviations and mid-sentence decimals like "3.5"). The `regex` crate
/// carries no look-around support, so boundaries are found by scanning
/// char-by-char instead of with a look-behind/look-ahead pattern.
fn split_into_sentences_at_capitals(text: &str) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    let mut sentences = Vec::new();
    let mut start = 0usize;
    let mut i = 0usize;
    while i < chars.len() {
        if matches!(chars[i], '.' | '!' | '?') {
            let mut j = i + 1;
            let mut saw_space = false;
            while j < chars.len() && chars[j].is_whitespace() {
                saw_space = true;
                j += 1;
            }
            if saw_space && j < chars.len() && chars[j].is_uppercase() {
                let sentence: String = chars[start..i + 1].iter().collect();
                let trimmed = sentence.trim();
                if !trimmed.is_empty() {
                    sentences.push(trimmed.to_string());
                }
                start = j;
                i = j;
                continue;
            }
        }
        i += 1;
    }
    if start < chars.len() {
        let tail: String = chars[start..].iter().collect();
        let trimmed = tail.trim();
        if !trimmed.is_empty() {
            sentences.push(trimmed.to_string());
        }
    }
    sentences
}

/// Split `text` into sentences at any run of whitespace immediately
/// preceded by `.`/`!`/`?`, regardless of what follows — the unconditional
/// counterpart of [`split_into_sentences_at_capitals`].
fn split_into_sentences_simple(text: &str) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    let mut sentences = Vec::new();
    let mut start = 0usize;
    let mut i = 0usize;
    while i < chars.len() {
        if matches!(chars[i], '.' | '!' | '?') {
            let mut j = i + 1;
            let mut saw_space = false;
            while j < chars.len() && chars[j].is_whitespace() {
                saw_space = true;
                j += 1;
            }
            if saw_space {
                let sentence: String = chars[start..i + 1].iter().collect();
                let trimmed = sentence.trim();
                if !trimmed.is_empty() {
                    sentences.push(trimmed.to_string());
                }
                start = j;
                i = j;
                continue;
            }
        }
        i += 1;
    }
    if start < chars.len() {
        let tail: String = chars[start..].iter().collect();
        let trimmed = tail.trim();
        if !trimmed.is_empty() {
            sentences.push(trimmed.to_string());
        }
    }
    sentences
}

/// Score each sentence by `embed(sentence) . embed(query)` cosine similarity
/// plus a keyword-overlap boost capped at 0.2, select sentences
/// highest-score-first until `max_length` is exhausted.
fn extract_semantic_snippet(
    text: &str,
    query: &str,
    max_length: usize,
    embed: &dyn Fn(&str) -> Option<Vec<f32>>,
) -> Option<String> {
    let sentences: Vec<String> = split_into_sentences_at_capitals(text)
        .into_iter()
        .filter(|s| s.len() > 5)
        .collect();
    if sentences.is_empty() {
        return None;
    }

    let query_words: HashSet<String> = WORD_RE
        .find_iter(&query.to_lowercase())
        .map(|m| m.as_str().to_string())
        .collect();
    let query_embedding = embed(query);

    let mut scored: Vec<(f32, f32, String)> = Vec::new();
    for sentence in &sentences {
        if sentence.len() < 10 {
            continue;
        }
        let similarity = match (&query_embedding, embed(sentence)) {
            (Some(q), Some(s)) => cosine_similarity(q, &s),
            _ => word_overlap_similarity(&sentence.to_lowercase(), &query.to_lowercase()),
        };

        let sentence_words: HashSet<String> =
            WORD_RE.find_iter(&sentence.to_lowercase()).map(|m| m.as_str().to_string()).collect();
        let overlap = query_words.intersection(&sentence_words).count();
        let keyword_boost = (overlap as f32 * 0.05).min(0.2);
        let combined = (similarity + keyword_boost).min(1.0);
        scored.push((combined, similarity, sentence.clone()));
    }
    if scored.is_empty() {
        return None;
    }

    scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal).then(
        b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal),
    ));

    let mut selected = Vec::new();
    let mut total_length = 0usize;
    for (_, _, sentence) in &scored {
        if total_length + sentence.len() + 1 <= max_length {
            total_length += sentence.len() + 1;
            selected.push(sentence.clone());
        } else {
            let remaining = max_length.saturating_sub(total_length + 3);
            if remaining > 50 && sentence.len() > remaining {
                let truncated = &sentence[..remaining];
                if let Some(idx) = truncated.rfind('.') {
                    let partial = &truncated[..idx];
                    if partial.len() > 30 {
                        selected.push(format!("{partial}..."));
                    }
                }
            }
            break;
        }
    }

    if selected.is_empty() {
        return Some(scored[0].2.chars().take(max_length).collect());
    }
    let mut snippet = selected.join(" ");
    if total_length < text.len() {
        snippet.push_str("...");
    }
    Some(snippet)
}

/// Keyword- or position-scored sentence selection, used when semantic
/// scoring is unavailable. Falls back further to sentence position (earlier
/// sentences score slightly higher).
fn extract_sentences_snippet(
    text: &str,
    max_length: usize,
    keywords: &[String],
    query: Option<&str>,
    embed: &dyn Fn(&str) -> Option<Vec<f32>>,
) -> String {
    let sentences = split_into_sentences_simple(text);
    if sentences.is_empty() {
        let mut snippet: String = text.chars().take(max_length).collect();
        if text.len() > max_length {
            snippet.push_str("...");
        }
        return snippet;
    }

    let mut scored: Vec<(f32, String)> = Vec::new();

    if let Some(query) = query {
        if let Some(query_embedding) = embed(query) {
            for sentence in &sentences {
                if sentence.len() < 10 {
                    continue;
                }
                if let Some(sentence_embedding) = embed(sentence) {
                    scored.push((cosine_similarity(&query_embedding, &sentence_embedding), sentence.clone()));
                }
            }
        }
    }

    if scored.is_empty() && !keywords.is_empty() {
        for sentence in &sentences {
            if sentence.len() < 10 {
                continue;
            }
            let lower = sentence.to_lowercase();
            let mut score = 0.0;
            for keyword in keywords {
                if lower.contains(keyword.as_str()) {
                    score += 1.0;
                } else if keyword.len() > 4 {
                    if lower.contains(keyword_stem(keyword)) {
                        score += 0.5;
                    }
                }
            }
            if score > 0.0 {
                scored.push((score, sentence.clone()));
            }
        }
    }

    if scored.is_empty() {
        let total = sentences.len().max(1);
        for (idx, sentence) in sentences.iter().enumerate() {
            if sentence.len() >= 10 {
                let position_score = 1.0 - (idx as f32 / total as f32) * 0.3;
                scored.push((position_score, sentence.clone()));
            }
        }
    }

    scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

    let mut selected = Vec::new();
    let mut total_length = 0usize;
    for (_, sentence) in &scored {
        let with_space_len = sentence.len() + 1;
        if total_length + with_space_len <= max_length {
            selected.push(sentence.clone());
            total_length += with_space_len;
        } else {
            let remaining = max_length.saturating_sub(total_length);
            if remaining > 50 && sentence.len() > remaining {
                let truncated = &sentence[..remaining];
                let partial = match truncated.rfind('.') {
                    Some(idx) => format!("{}.", &truncated[..idx]),
                    None => truncated.to_string(),
                };
                selected.push(partial);
            }
            break;
        }
    }

    if !selected.is_empty() {
        let mut snippet = selected.join(" ");
        if total_length < text.len() {
            snippet.push_str("...");
        }
        return snippet;
    }

    if let Some((_, best)) = scored.first() {
        let mut snippet: String = best.chars().take(max_length).collect();
        if best.len() > max_length {
            snippet.push_str("...");
        }
        return snippet;
    }

    let mut snippet: String = sentences.iter().take(3).cloned().collect::<Vec<_>>().join(" ");
    snippet.truncate(max_length.min(snippet.len()));
    if text.len() > max_length {
        snippet.push_str("...");
    }
    snippet
}

/// Keyword-position-centered extraction: locates every query-keyword match
/// (exact and stem-prefix for keywords longer than 4 chars), centers a
/// `max_length`-wide window on the median match position, and snaps the
/// window edges to the nearest sentence boundary within 100/50 chars.
fn extract_keyword_centered_snippet(text: &str, query_keywords: &[String], max_length: usize) -> Option<String> {
    let text_lower = text.to_lowercase();
    let mut positions = Vec::new();

    for keyword in query_keywords {
        let mut start = 0;
        while let Some(pos) = text_lower[start..].find(keyword.as_str()) {
            positions.push(start + pos);
            start += pos + 1;
            if start >= text_lower.len() {
                break;
            }
        }

        if keyword.len() > 4 {
            let stem = keyword_stem(keyword);
            let mut start = 0;
            while let Some(pos) = text_lower[start..].find(stem) {
                let abs = start + pos;
                let before_ok = abs == 0 || !text_lower.as_bytes()[abs - 1].is_ascii_alphanumeric();
                let after_idx = abs + stem.len();
                let after_ok = after_idx >= text_lower.len() || !text_lower.as_bytes()[after_idx].is_ascii_alphanumeric();
                if before_ok && after_ok {
                    positions.push(abs);
                }
                start = abs + 1;
                if start >= text_lower.len() {
                    break;
                }
            }
        }
    }

    if positions.is_empty() {
        return None;
    }
    positions.sort_unstable();
    let center_pos = positions[positions.len() / 2];

    let mut start_pos = center_pos.saturating_sub(max_length / 2);
    let mut end_pos = (start_pos + max_length).min(text.len());

    if start_pos > 0 {
        let search_start = start_pos.saturating_sub(100);
        let window = &text[search_start..start_pos];
        if let Some(rel) = window.rfind(['.', '!', '?']) {
            let sentence_end = search_start + rel;
            if sentence_end + 50 > start_pos {
                start_pos = sentence_end + 1;
                while start_pos < text.len() && text.as_bytes()[start_pos].is_ascii_whitespace() {
                    start_pos += 1;
                }
            }
        }
    }

    if end_pos < text.len() {
        let window_start = end_pos.saturating_sub(50);
        let window_end = (end_pos + 50).min(text.len());
        let window = &text[window_start..window_end];
        if let Some(rel) = window.find(['.', '!', '?']) {
            let sentence_end = window_start + rel;
            if sentence_end + 50 > end_pos {
                end_pos = sentence_end + 1;
            }
        }
    }

    let mut snippet = text[start_pos..end_pos].trim().to_string();
    if start_pos > 0 {
        snippet = format!("...{snippet}");
    }
    if end_pos < text.len() {
        snippet.push_str("...");
    }
    Some(snippet)
}

/// Extract content-bearing keywords from a query: strips English + Spanish
/// stopwords, keeps words longer than 2 chars, and adds skip-gram two-word
/// phrases that allow matching e.g. "procedimiento degasado" against
/// "procedimiento de degasado" in the source text.
pub fn extract_query_keywords(query: &str) -> Vec<String> {
    let lower = query.to_lowercase();
    let words: Vec<String> = WORD_RE.find_iter(&lower).map(|m| m.as_str().to_string()).collect();

    let mut keywords: Vec<String> =
        words.iter().filter(|w| !KEYWORD_STOP_WORDS.contains(&w.as_str()) && w.len() > 2).cloned().collect();

    for i in 0..words.len() {
        if KEYWORD_STOP_WORDS.contains(&words[i].as_str()) {
            continue;
        }
        for skip in 1..4 {
            if let Some(next_word) = words.get(i + skip) {
                if !KEYWORD_STOP_WORDS.contains(&next_word.as_str()) {
                    keywords.push(format!("{} {}", words[i], next_word));
                    break;
                }
            } else {
                break;
            }
        }
    }

    keywords
}

/// Fuzzy word match: exact substring first, then (for words 4+ chars) a
/// character-set-overlap prefilter followed by a Levenshtein-ratio check
/// via [`strsim`], matching typo tolerance like "attedece" ~ "attendance".
pub fn fuzzy_match(word: &str, text_lower: &str, threshold: f32) -> bool {
    let word_lower = word.to_lowercase();
    if text_lower.contains(&word_lower) {
        return true;
    }
    if word_lower.len() < 4 {
        return false;
    }
    let threshold = if word_lower.len() < 6 { threshold.max(0.80) } else { threshold };

    let word_chars: HashSet<char> = word_lower.chars().collect();
    let text_words: HashSet<&str> = WORD_RE
        .find_iter(text_lower)
        .map(|m| m.as_str())
        .filter(|w| w.len() >= 4 && w.chars().all(|c| c.is_ascii_alphabetic()))
        .collect();

    for candidate in text_words {
        let len_diff = (candidate.len() as i64 - word_lower.len() as i64).abs();
        if len_diff > 2 {
            continue;
        }
        let candidate_chars: HashSet<char> = candidate.chars().collect();
        let common = word_chars.intersection(&candidate_chars).count();
        let min_common = (word_chars.len().min(candidate_chars.len()) as f32 * 0.5).ceil() as usize;
        if common < min_common {
            continue;
        }
        let ratio = strsim::normalized_levenshtein(&word_lower, candidate) as f32;
        if ratio >= threshold {
            return true;
        }
    }
    false
}

/// Build the final citation snippet: strip page markers, return the chunk
/// verbatim if already short enough, otherwise run semantic scoring and
/// fall back through keyword-position-centered extraction to plain
/// sentence scoring. `embed` is the caller's embedding closure (typically
/// backed by an [`crate::traits::EmbeddingProvider`]); passing a closure
/// that always returns `None` degrades gracefully to the word-overlap and
/// keyword paths, matching the teacher's `except: pass` fallback chain.
pub fn generate_context_snippet(
    chunk_text: &str,
    query: &str,
    max_length: usize,
    embed: &dyn Fn(&str) -> Option<Vec<f32>>,
) -> String {
    let cleaned = PAGE_MARKER_RE.replace_all(chunk_text, "").trim().to_string();
    let cleaned = if cleaned.is_empty() { chunk_text.to_string() } else { cleaned };

    if cleaned.chars().count() <= max_length {
        return cleaned;
    }

    if let Some(semantic) = extract_semantic_snippet(&cleaned, query, max_length, embed) {
        if semantic.len() > 50 {
            return semantic;
        }
    }

    let query_keywords = extract_query_keywords(query);
    if query_keywords.is_empty() {
        return extract_sentences_snippet(&cleaned, max_length, &[], Some(query), embed);
    }

    match extract_keyword_centered_snippet(&cleaned, &query_keywords, max_length) {
        Some(snippet) => snippet,
        None => extract_sentences_snippet(&cleaned, max_length, &query_keywords, Some(query), embed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_chunk_returned_verbatim() {
        let text = "A short sentence.";
        let snippet = generate_context_snippet(text, "query", 500, &|_| None);
        assert_eq!(snippet, text);
    }

    #[test]
    fn page_markers_are_stripped() {
        let text = "--- Page 3 ---\nBody content follows here with plenty of words to exceed the short cutoff easily.";
        let snippet = generate_context_snippet(text, "body", 500, &|_| None);
        assert!(!snippet.contains("Page 3"));
    }

    #[test]
    fn cosine_similarity_identical_vectors_is_one() {
        let v = vec![0.3, 0.4, 0.5];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn cosine_similarity_mismatched_dims_is_zero() {
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
    }

    #[test]
    fn keyword_extraction_strips_stopwords_and_adds_skipgrams() {
        let keywords = extract_query_keywords("what is the procedimiento de degasado");
        assert!(keywords.iter().any(|k| k == "procedimiento degasado" || k == "procedimiento"));
        assert!(!keywords.iter().any(|k| k == "the"));
    }

    #[test]
    fn fuzzy_match_tolerates_single_typo() {
        assert!(fuzzy_match("attedece", "the attendance record is here", 0.8));
    }

    #[test]
    fn fuzzy_match_rejects_short_words_without_exact_hit() {
        assert!(!fuzzy_match("cat", "the dog ran", 0.8));
    }

    #[test]
    fn keyword_centered_snippet_centers_on_median_match() {
        let text = "aaa ".repeat(50) + "needle here" + &" bbb".repeat(50);
        let keywords = vec!["needle".to_string()];
        let snippet = extract_keyword_centered_snippet(&text, &keywords, 60);
        assert!(snippet.is_some());
        assert!(snippet.unwrap().contains("needle"));
    }

    #[test]
    fn split_at_capitals_breaks_only_before_uppercase() {
        let text = "The doc says v3.5. Page two starts here.";
        let sentences = split_into_sentences_at_capitals(text);
        assert_eq!(sentences, vec!["The doc says v3.5.", "Page two starts here."]);
    }

    #[test]
    fn split_at_capitals_does_not_break_mid_decimal() {
        // The dot inside "v3.5" is not followed by whitespace, so it is
        // never a candidate split point regardless of what follows.
        let text = "Version v3.5 shipped today.";
        let sentences = split_into_sentences_at_capitals(text);
        assert_eq!(sentences, vec!["Version v3.5 shipped today."]);
    }

    #[test]
    fn split_simple_breaks_on_every_terminator() {
        let text = "one. two! three?";
        let sentences = split_into_sentences_simple(text);
        assert_eq!(sentences, vec!["one.", "two!", "three?"]);
    }

    #[test]
    fn sentence_split_does_not_panic_on_multibyte_text() {
        let text = "La p\u{e1}gina describe el procedimiento. \u{930}\u{947}\u{916}\u{93e}\u{902}\u{915}\u{928} ज़रूरी है। Next sentence.";
        let a = split_into_sentences_at_capitals(text);
        let b = split_into_sentences_simple(text);
        assert!(!a.is_empty());
        assert!(!b.is_empty());
    }
}
