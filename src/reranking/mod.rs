pub mod cross_encoder;

pub use cross_encoder::CrossEncoderReranker;

use crate::traits::{RerankScore, Reranker};
use crate::types::ScoredChunk;
use anyhow::Result;
use async_trait::async_trait;
use tracing::warn;

/// Adapts the blocking ONNX-backed [`CrossEncoderReranker`] to the
/// [`Reranker`] trait by running inference on a blocking thread, the way
/// the teacher keeps `ort::Session::run` off the async executor in
/// `embeddings/e5.rs`.
#[async_trait]
impl Reranker for CrossEncoderReranker {
    async fn rerank(&self, query: &str, passages: &[String]) -> Result<Vec<RerankScore>> {
        let candidates: Vec<(String, String)> = passages
            .iter()
            .enumerate()
            .map(|(i, text)| (i.to_string(), text.clone()))
            .collect();
        let query = query.to_string();
        let top_k = candidates.len();

        // CrossEncoderReranker holds `Arc<Mutex<Session>>`/`Arc<Tokenizer>`
        // internally, so cloning it keeps the blocking closure `'static`
        // cheaply.
        let session = self.clone();
        tokio::task::spawn_blocking(move || session.rerank_batch(&query, &candidates, top_k))
            .await
            .map_err(|e| anyhow::anyhow!("reranker task panicked: {e}"))??
            .into_iter()
            .map(|(id, score)| {
                id.parse::<usize>()
                    .map(|id| RerankScore { id, score })
                    .map_err(|e| anyhow::anyhow!("unexpected candidate id {id}: {e}"))
            })
            .collect()
    }
}

/// Apply the C4 reranking policy from source spec §4.4: score `candidates`
/// against `query`, sort by `rerank_score` descending, and truncate to
/// `top_k`. On reranker unavailability or error, log and fall back to
/// passing the input order through, truncated to `top_k` — a chunk
/// disappearing because of a model outage is worse than an unreranked one.
pub async fn apply_reranking(
    reranker: &dyn Reranker,
    query: &str,
    mut candidates: Vec<ScoredChunk>,
    top_k: usize,
) -> Vec<ScoredChunk> {
    let passages: Vec<String> = candidates.iter().map(|c| c.chunk.text.clone()).collect();

    match reranker.rerank(query, &passages).await {
        Ok(scores) => {
            for score in scores {
                if let Some(candidate) = candidates.get_mut(score.id) {
                    candidate.rerank_score = Some(score.score);
                }
            }
            candidates.sort_by(|a, b| {
                let a_score = a.rerank_score.unwrap_or(0.0);
                let b_score = b.rerank_score.unwrap_or(0.0);
                b_score.partial_cmp(&a_score).unwrap_or(std::cmp::Ordering::Equal)
            });
            candidates.truncate(top_k);
            candidates
        }
        Err(err) => {
            warn!(error = %err, "reranker unavailable, passing through input order");
            candidates.truncate(top_k);
            candidates
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Chunk, ContentType};
    use async_trait::async_trait;

    struct FailingReranker;

    #[async_trait]
    impl Reranker for FailingReranker {
        async fn rerank(&self, _query: &str, _passages: &[String]) -> Result<Vec<RerankScore>> {
            Err(anyhow::anyhow!("model unavailable"))
        }
    }

    struct StubReranker;

    #[async_trait]
    impl Reranker for StubReranker {
        async fn rerank(&self, _query: &str, passages: &[String]) -> Result<Vec<RerankScore>> {
            Ok(passages
                .iter()
                .enumerate()
                .map(|(id, text)| RerankScore { id, score: if text.contains("match") { 0.9 } else { 0.1 } })
                .collect())
        }
    }

    fn scored(id: &str, text: &str, order: usize) -> ScoredChunk {
        ScoredChunk::new(
            Chunk {
                id: id.to_string(),
                text: text.to_string(),
                vector: vec![],
                source: "doc.pdf".to_string(),
                document_id: "doc-1".to_string(),
                page: 1,
                start_char: 0,
                end_char: text.len(),
                chunk_index: 0,
                language: "eng".to_string(),
                content_type: ContentType::Text,
                page_blocks: vec![],
                image_ref: None,
                text_english: None,
                metadata: Default::default(),
            },
            Some(0.5),
            order,
        )
    }

    #[tokio::test]
    async fn reranker_error_falls_back_to_input_order_truncated() {
        let candidates = vec![scored("a", "one", 0), scored("b", "two", 1), scored("c", "three", 2)];
        let result = apply_reranking(&FailingReranker, "query", candidates, 2).await;
        assert_eq!(result.len(), 2);
        assert_eq!(result[0].chunk.id, "a");
        assert_eq!(result[1].chunk.id, "b");
    }

    #[tokio::test]
    async fn reranker_success_sorts_by_score_and_truncates() {
        let candidates = vec![
            scored("a", "no match here", 0),
            scored("b", "exact match here", 1),
            scored("c", "no match either", 2),
        ];
        let result = apply_reranking(&StubReranker, "query", candidates, 1).await;
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].chunk.id, "b");
        assert_eq!(result[0].rerank_score, Some(0.9));
    }
}
