//! Search executor: single-index hybrid search (vector + lexical + RRF)
//! with a process-local TTL cache and dimension validation. Built over the
//! [`crate::traits::VectorStore`] seam so the fusion/caching/validation
//! logic here is exercised against an in-memory fake in tests.

use crate::cache::TtlCache;
use crate::config::SearchConfig;
use crate::error::{RetrievalError, RetrievalResult};
use crate::search::hybrid::{reciprocal_rank_fusion, HybridSource};
use crate::traits::{LexicalQuery, VectorQuery, VectorStore};
use crate::types::{ChunkMetadata, MetadataFilter, ScoredChunk};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

pub struct SearchExecutor {
    store: Arc<dyn VectorStore>,
    config: SearchConfig,
    cache: TtlCache<String, Vec<ScoredChunk>>,
    arrival_counter: AtomicUsize,
}

impl SearchExecutor {
    pub fn new(store: Arc<dyn VectorStore>, config: SearchConfig, cache_capacity: usize, cache_ttl: std::time::Duration) -> Self {
        Self {
            store,
            config,
            cache: TtlCache::new(cache_capacity, cache_ttl),
            arrival_counter: AtomicUsize::new(0),
        }
    }

    fn next_arrival(&self) -> usize {
        self.arrival_counter.fetch_add(1, Ordering::Relaxed)
    }

    fn cache_key(
        &self,
        index_name: &str,
        query_text: &str,
        k: usize,
        semantic_weight: f32,
        filter: Option<&MetadataFilter>,
        min_score: Option<f32>,
    ) -> String {
        let mut hasher = DefaultHasher::new();
        index_name.hash(&mut hasher);
        query_text.hash(&mut hasher);
        k.hash(&mut hasher);
        semantic_weight.to_bits().hash(&mut hasher);
        filter.map(|f| f.stable_key()).unwrap_or_default().hash(&mut hasher);
        min_score.map(|s| s.to_bits()).unwrap_or(0).hash(&mut hasher);
        format!("{index_name}:{:x}", hasher.finish())
    }

    /// Verify the embedding provider's output dimension matches the index's
    /// configured vector dimension before the first read/write. Returns
    /// `Ok(())` if the index does not exist yet (nothing to validate
    /// against). `auto_recreate` deletes and recreates the index with
    /// `expected_dimension` on mismatch rather than failing.
    pub async fn validate_dimension(
        &self,
        index_name: &str,
        expected_dimension: usize,
        auto_recreate: bool,
    ) -> RetrievalResult<()> {
        let actual = self
            .store
            .index_dimension(index_name)
            .await
            .map_err(|e| RetrievalError::backend("vector_store", e))?;

        let Some(actual) = actual else {
            return Ok(());
        };

        if actual == expected_dimension {
            return Ok(());
        }

        if auto_recreate {
            warn!(
                index = index_name,
                expected = expected_dimension,
                actual,
                "dimension mismatch, recreating index"
            );
            self.store
                .delete_index(index_name)
                .await
                .map_err(|e| RetrievalError::backend("vector_store", e))?;
            self.store
                .ensure_index(index_name, expected_dimension)
                .await
                .map_err(|e| RetrievalError::backend("vector_store", e))?;
            return Ok(());
        }

        Err(RetrievalError::DimensionMismatch {
            expected: expected_dimension,
            actual,
        })
    }

    /// Drop every cached entry for `index_id`, or every cached entry if
    /// `index_id` is `None`. Called by ingestion after a write.
    pub fn invalidate(&self, index_id: Option<&str>) {
        match index_id {
            Some(id) => {
                let prefix = format!("{id}:");
                self.cache.invalidate_matching(|k| k.starts_with(&prefix));
            }
            None => self.cache.invalidate_all(),
        }
    }

    /// Semantic-only fallback, also used directly when a caller only wants
    /// vector similarity.
    pub async fn similarity_search(
        &self,
        index_name: &str,
        query_vector: &[f32],
        k: usize,
        filter: Option<MetadataFilter>,
    ) -> RetrievalResult<Vec<ScoredChunk>> {
        let query = VectorQuery {
            vector: query_vector.to_vec(),
            fetch_k: k,
            ef_search: self.config.ef_search,
            min_score: None,
            filter,
        };
        let hits = self
            .store
            .vector_search(index_name, &query)
            .await
            .map_err(|e| RetrievalError::backend("vector_store", e))?;

        Ok(hits
            .into_iter()
            .take(k)
            .map(|hit| ScoredChunk::new(hit.chunk, Some(hit.score), self.next_arrival()))
            .collect())
    }

    pub async fn count(&self, index_name: &str) -> RetrievalResult<usize> {
        self.store
            .count(index_name)
            .await
            .map_err(|e| RetrievalError::backend("vector_store", e))
    }

    /// Hybrid vector + lexical search fused by Reciprocal Rank Fusion.
    #[allow(clippy::too_many_arguments)]
    pub async fn hybrid_search(
        &self,
        index_name: &str,
        query_text: &str,
        query_vector: &[f32],
        k: usize,
        semantic_weight: f32,
        keyword_weight: f32,
        filter: Option<MetadataFilter>,
        alternate_query: Option<String>,
        min_score: Option<f32>,
    ) -> RetrievalResult<Vec<ScoredChunk>> {
        let key = self.cache_key(index_name, query_text, k, semantic_weight, filter.as_ref(), min_score);
        if let Some(cached) = self.cache.get(&key) {
            debug!(index = index_name, "search executor cache hit");
            return Ok(cached);
        }

        // Step 1: normalize weights so they sum to 1.
        let total = semantic_weight + keyword_weight;
        let (semantic_weight, keyword_weight) = if total > 0.0 {
            (semantic_weight / total, keyword_weight / total)
        } else {
            (0.5, 0.5)
        };

        let fetch_k = k * self.config.candidate_multiplier;
        let vector_query = VectorQuery {
            vector: query_vector.to_vec(),
            fetch_k,
            ef_search: self.config.ef_search,
            min_score,
            filter: filter.clone(),
        };
        let lexical_query = LexicalQuery {
            text: query_text.to_string(),
            alternate_text: alternate_query,
            fetch_k,
            filter: filter.clone(),
            boost_phrase_slop1: self.config.boost_phrase_slop1,
            boost_phrase_slop3: self.config.boost_phrase_slop3,
            boost_fuzzy_multi_match: self.config.boost_fuzzy_multi_match,
            boost_alt_phrase_slop2: self.config.boost_alt_phrase_slop2,
            boost_alt_multi_match: self.config.boost_alt_multi_match,
        };

        // Step 3: try the batched multi-search; fall back to sequential,
        // then to semantic-only on total failure.
        let (vector_hits, lexical_hits) = match self
            .store
            .multi_search(index_name, &vector_query, &lexical_query)
            .await
        {
            Ok(result) => result,
            Err(batch_err) => {
                warn!(index = index_name, error = %batch_err, "multi-search failed, falling back to sequential");
                let vector_result = self.store.vector_search(index_name, &vector_query).await;
                let lexical_result = self.store.lexical_search(index_name, &lexical_query).await;
                match (vector_result, lexical_result) {
                    (Ok(v), Ok(l)) => (v, l),
                    (Ok(v), Err(lex_err)) => {
                        warn!(index = index_name, error = %lex_err, "lexical leg failed, semantic-only fallback");
                        (v, Vec::new())
                    }
                    (Err(vec_err), _) => {
                        return Err(RetrievalError::backend("vector_store", vec_err));
                    }
                }
            }
        };

        let mut by_id: std::collections::HashMap<String, crate::traits::StoreHit> = std::collections::HashMap::new();
        let vector_ranked: Vec<(String, f32)> = vector_hits
            .iter()
            .map(|h| {
                by_id.entry(h.chunk.id.clone()).or_insert_with(|| h.clone());
                (h.chunk.id.clone(), h.score)
            })
            .collect();
        let lexical_ranked: Vec<(String, f32)> = lexical_hits
            .iter()
            .map(|h| {
                by_id.entry(h.chunk.id.clone()).or_insert_with(|| h.clone());
                (h.chunk.id.clone(), h.score)
            })
            .collect();

        // Steps 4-5: fuse by RRF and take the top-k.
        let fused = reciprocal_rank_fusion(
            &vector_ranked,
            &lexical_ranked,
            self.config.rrf_k,
            semantic_weight,
            keyword_weight,
            k,
        );

        let results: Vec<ScoredChunk> = fused
            .into_iter()
            .filter_map(|(id, score, _source): (String, f32, HybridSource)| {
                by_id.remove(&id).map(|hit| ScoredChunk::new(hit.chunk, Some(score), self.next_arrival()))
            })
            .collect();

        self.cache.insert(key, results.clone());
        Ok(results)
    }
}

/// Build the `MetadataFilter` used by both sub-queries from a chunk's own
/// metadata probe, mirroring the "symmetric candidate counts" design note.
pub fn filter_from_metadata(metadata: &ChunkMetadata) -> MetadataFilter {
    MetadataFilter {
        source: metadata.source.clone(),
        document_id: None,
        date_from: None,
        date_to: None,
        custom: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::StoreHit;
    use crate::types::{Chunk, ContentType};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    struct FakeStore {
        vector_hits: HashMap<String, Vec<StoreHit>>,
        lexical_hits: HashMap<String, Vec<StoreHit>>,
        dimension: Option<usize>,
        calls: Mutex<usize>,
    }

    fn chunk(id: &str, text: &str) -> Chunk {
        Chunk {
            id: id.to_string(),
            text: text.to_string(),
            vector: vec![0.0; 4],
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
        }
    }

    #[async_trait]
    impl VectorStore for FakeStore {
        async fn vector_search(&self, index_name: &str, _query: &VectorQuery) -> anyhow::Result<Vec<StoreHit>> {
            *self.calls.lock() += 1;
            Ok(self.vector_hits.get(index_name).cloned().unwrap_or_default())
        }

        async fn lexical_search(&self, index_name: &str, _query: &LexicalQuery) -> anyhow::Result<Vec<StoreHit>> {
            Ok(self.lexical_hits.get(index_name).cloned().unwrap_or_default())
        }

        async fn delete_by_document(&self, _index_name: &str, _document_id: &str) -> anyhow::Result<()> {
            Ok(())
        }

        async fn ensure_index(&self, _index_name: &str, _dimension: usize) -> anyhow::Result<()> {
            Ok(())
        }

        async fn delete_index(&self, _index_name: &str) -> anyhow::Result<()> {
            Ok(())
        }

        async fn index_exists(&self, _index_name: &str) -> anyhow::Result<bool> {
            Ok(true)
        }

        async fn index_dimension(&self, _index_name: &str) -> anyhow::Result<Option<usize>> {
            Ok(self.dimension)
        }

        async fn count(&self, index_name: &str) -> anyhow::Result<usize> {
            Ok(self.vector_hits.get(index_name).map(|v| v.len()).unwrap_or(0))
        }

        async fn all_chunks(&self, index_name: &str) -> anyhow::Result<Vec<Chunk>> {
            Ok(self
                .vector_hits
                .get(index_name)
                .map(|hits| hits.iter().map(|h| h.chunk.clone()).collect())
                .unwrap_or_default())
        }
    }

    fn default_search_config() -> SearchConfig {
        crate::config::RetrievalConfig::default().search
    }

    #[tokio::test]
    async fn hybrid_search_fuses_and_caches() {
        let mut vector_hits = HashMap::new();
        vector_hits.insert(
            "idx".to_string(),
            vec![
                StoreHit { chunk: chunk("a", "alpha"), score: 0.9 },
                StoreHit { chunk: chunk("b", "beta"), score: 0.8 },
            ],
        );
        let mut lexical_hits = HashMap::new();
        lexical_hits.insert(
            "idx".to_string(),
            vec![StoreHit { chunk: chunk("b", "beta"), score: 5.0 }],
        );

        let store = Arc::new(FakeStore {
            vector_hits,
            lexical_hits,
            dimension: Some(4),
            calls: Mutex::new(0),
        });
        let executor = SearchExecutor::new(store.clone(), default_search_config(), 10, std::time::Duration::from_secs(60));

        let results = executor
            .hybrid_search("idx", "beta", &[0.0; 4], 2, 0.5, 0.5, None, None, None)
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
        // "b" appears in both lists, so it should rank first.
        assert_eq!(results[0].chunk.id, "b");

        // Second call should hit the cache rather than calling the store again.
        let calls_before = *store.calls.lock();
        let _ = executor
            .hybrid_search("idx", "beta", &[0.0; 4], 2, 0.5, 0.5, None, None, None)
            .await
            .unwrap();
        assert_eq!(*store.calls.lock(), calls_before);
    }

    #[tokio::test]
    async fn dimension_mismatch_without_auto_recreate_errors() {
        let store = Arc::new(FakeStore {
            vector_hits: HashMap::new(),
            lexical_hits: HashMap::new(),
            dimension: Some(384),
            calls: Mutex::new(0),
        });
        let executor = SearchExecutor::new(store, default_search_config(), 10, std::time::Duration::from_secs(60));
        let result = executor.validate_dimension("idx", 768, false).await;
        assert!(matches!(result, Err(RetrievalError::DimensionMismatch { expected: 768, actual: 384 })));
    }

    #[tokio::test]
    async fn invalidate_clears_only_matching_index_prefix() {
        let mut vector_hits = HashMap::new();
        vector_hits.insert("idx-a".to_string(), vec![StoreHit { chunk: chunk("a", "alpha"), score: 0.9 }]);
        let store = Arc::new(FakeStore {
            vector_hits,
            lexical_hits: HashMap::new(),
            dimension: Some(4),
            calls: Mutex::new(0),
        });
        let executor = SearchExecutor::new(store, default_search_config(), 10, std::time::Duration::from_secs(60));
        let _ = executor
            .hybrid_search("idx-a", "alpha", &[0.0; 4], 1, 0.5, 0.5, None, None, None)
            .await
            .unwrap();
        executor.invalidate(Some("idx-a"));
        assert_eq!(executor.cache.len(), 0);
    }
}
