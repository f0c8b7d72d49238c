//! C3 — Multi-Index Fanout: executes a search across N indexes concurrently
//! and returns a globally ranked union. Built on [`crate::search::executor::SearchExecutor`],
//! bounded by a `tokio::sync::Semaphore` the way the teacher bounds
//! concurrent shard work in `rag_engine.rs::search_comprehensive`.

use crate::search::executor::SearchExecutor;
use crate::types::{MetadataFilter, ScoredChunk};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::warn;

/// Small fixed multilingual stopword list for `phrase_match_score`; not
/// meant to be exhaustive, only enough to avoid boosting common function
/// words like "the"/"and"/"de"/"la".
const STOPWORDS: &[&str] = &[
    "the", "a", "an", "of", "in", "on", "at", "to", "for", "and", "or", "is", "are", "was", "were",
    "be", "been", "this", "that", "these", "those", "it", "its", "with", "as", "by", "from",
    "le", "la", "les", "de", "des", "du", "un", "une", "et", "el", "los", "las", "y", "der", "die",
    "das", "und",
];

fn content_words(query: &str) -> Vec<String> {
    query
        .split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase())
        .filter(|w| w.len() > 2 && !STOPWORDS.contains(&w.as_str()))
        .collect()
}

/// Heuristic exact/partial phrase match score over a chunk's content,
/// per source spec §4.3: full phrase +10, adjacent bigram +3, near bigram
/// (≤1 intervening word) +1.5, individual word (word-boundary) +0.5.
pub fn phrase_match_score(query: &str, content: &str) -> f32 {
    let words = content_words(query);
    if words.is_empty() {
        return 0.0;
    }
    let content_lower = content.to_lowercase();
    let mut score = 0.0;

    let full_phrase = words.join(" ");
    if content_lower.contains(&full_phrase) {
        score += 10.0;
    }

    for pair in words.windows(2) {
        let adjacent = format!("{} {}", pair[0], pair[1]);
        if content_lower.contains(&adjacent) {
            score += 3.0;
        } else {
            // near-bigram: the two words appear with at most one
            // intervening word between them, in order.
            let near = format!(r"\b{}\s+\w+\s+{}\b", regex::escape(&pair[0]), regex::escape(&pair[1]));
            if let Ok(re) = regex::Regex::new(&near) {
                if re.is_match(&content_lower) {
                    score += 1.5;
                }
            }
        }
    }

    for word in &words {
        let boundary = format!(r"\b{}\b", regex::escape(word));
        if let Ok(re) = regex::Regex::new(&boundary) {
            if re.is_match(&content_lower) {
                score += 0.5;
            }
        }
    }

    score
}

fn dedup_key(text: &str) -> u64 {
    let prefix: String = text.chars().take(100).collect();
    let mut hasher = DefaultHasher::new();
    prefix.hash(&mut hasher);
    hasher.finish()
}

pub struct FanoutConfig {
    pub max_workers: usize,
}

pub struct MultiIndexFanout {
    executor: Arc<SearchExecutor>,
    config: FanoutConfig,
    arrival_counter: AtomicUsize,
}

impl MultiIndexFanout {
    pub fn new(executor: Arc<SearchExecutor>, config: FanoutConfig) -> Self {
        Self {
            executor,
            config,
            arrival_counter: AtomicUsize::new(0),
        }
    }

    /// Execute a hybrid search across `index_ids` concurrently and return a
    /// globally ranked, deduplicated union capped at `k`.
    #[allow(clippy::too_many_arguments)]
    pub async fn search_across(
        &self,
        query_text: &str,
        query_vector: &[f32],
        index_ids: &[String],
        k: usize,
        semantic_weight: f32,
        keyword_weight: f32,
        filter: Option<MetadataFilter>,
        alternate_query: Option<String>,
    ) -> Vec<ScoredChunk> {
        if index_ids.is_empty() {
            return Vec::new();
        }

        let per_shard_k = k.max(10);
        let concurrency = index_ids.len().min(self.config.max_workers);
        let semaphore = Arc::new(Semaphore::new(concurrency));

        let mut tasks = Vec::with_capacity(index_ids.len());
        for index_id in index_ids {
            let semaphore = semaphore.clone();
            let executor = self.executor.clone();
            let index_id = index_id.clone();
            let query_text = query_text.to_string();
            let query_vector = query_vector.to_vec();
            let filter = filter.clone();
            let alternate_query = alternate_query.clone();

            tasks.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                let result = executor
                    .hybrid_search(
                        &index_id,
                        &query_text,
                        &query_vector,
                        per_shard_k,
                        semantic_weight,
                        keyword_weight,
                        filter,
                        alternate_query,
                        None,
                    )
                    .await;
                (index_id, result)
            }));
        }

        let mut union: Vec<ScoredChunk> = Vec::new();
        let mut seen: HashSet<u64> = HashSet::new();

        for task in tasks {
            match task.await {
                Ok((_index_id, Ok(chunks))) => {
                    for mut scored in chunks {
                        let key = dedup_key(&scored.chunk.text);
                        if !seen.insert(key) {
                            continue;
                        }
                        scored.phrase_match_score = phrase_match_score(query_text, &scored.chunk.text);
                        scored.arrival_order = self.arrival_counter.fetch_add(1, Ordering::Relaxed);
                        union.push(scored);
                    }
                }
                Ok((index_id, Err(err))) => {
                    warn!(index = %index_id, error = %err, "shard search failed, contributing zero results");
                }
                Err(join_err) => {
                    warn!(error = %join_err, "shard task panicked, contributing zero results");
                }
            }
        }

        // Two-key global sort: phrase_match_score desc, then fused score
        // desc, ties broken by arrival order.
        union.sort_by(|a, b| {
            b.phrase_match_score
                .partial_cmp(&a.phrase_match_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    let a_score = a.similarity_score.unwrap_or(0.0);
                    let b_score = b.similarity_score.unwrap_or(0.0);
                    b_score.partial_cmp(&a_score).unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| a.arrival_order.cmp(&b.arrival_order))
        });

        union.truncate(k);
        union
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phrase_match_score_rewards_exact_phrase() {
        let score = phrase_match_score("annual revenue growth", "The annual revenue growth was strong.");
        assert!(score >= 10.0);
    }

    #[test]
    fn phrase_match_score_rewards_adjacent_bigram() {
        let score = phrase_match_score("quarterly earnings report", "Our quarterly earnings exceeded expectations.");
        assert!(score >= 3.0);
        assert!(score < 10.0);
    }

    #[test]
    fn phrase_match_score_ignores_stopwords() {
        let score_a = phrase_match_score("the of and", "nothing relevant here");
        assert_eq!(score_a, 0.0);
    }

    #[test]
    fn phrase_match_score_zero_when_no_words_present() {
        let score = phrase_match_score("completely unrelated terms", "something else entirely");
        assert_eq!(score, 0.0);
    }

    #[test]
    fn dedup_key_is_stable_for_shared_prefix() {
        let a = "Exact same first hundred characters of content that is shared across two different chunks from different shards.";
        let b = format!("{} but then diverges wildly after the shared prefix ends right here.", &a[..100]);
        assert_eq!(dedup_key(a), dedup_key(&b));
    }
}
