//! The top-level retrieval engine: composes the index router, search
//! executor, multi-index fanout, reranker, citation builder, query planner
//! and answer assembler into the single
//! `query()`/`find_all_occurrences()`/`search_images()` entry point, as a
//! pipeline over the injected [`VectorStore`]/[`EmbeddingProvider`]/
//! [`LlmProvider`]/[`Reranker`] seams.

use crate::assembler::AnswerAssembler;
use crate::citation::{self, CitationContext};
use crate::config::RetrievalConfig;
use crate::error::{RetrievalError, RetrievalResult};
use crate::fanout::{FanoutConfig, MultiIndexFanout};
use crate::planner::{self, QueryPlan};
use crate::reranking::apply_reranking;
use crate::router::IndexRouter;
use crate::search::executor::SearchExecutor;
use crate::traits::{EmbeddingProvider, LlmProvider, Reranker, VectorStore};
use crate::types::{Chunk, Citation, ScoredChunk};
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Instant;
use tracing::warn;

/// Per-query knobs. Any `None`/zero field falls back to the engine's
/// configured default.
#[derive(Debug, Clone)]
pub struct QueryOptions {
    pub k: usize,
    /// Document display names to restrict the search to; empty searches
    /// every registered document.
    pub active_sources: Vec<String>,
    pub semantic_weight: Option<f32>,
    pub keyword_weight: Option<f32>,
    pub use_agentic_rag: bool,
    pub rerank_top_k: Option<usize>,
    /// Chat-completion model override, passed straight to the LLM provider.
    pub model: Option<String>,
    /// Cross-language phrase to also match against in the lexical leg.
    pub alternate_query: Option<String>,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            k: 0,
            active_sources: Vec::new(),
            semantic_weight: None,
            keyword_weight: None,
            use_agentic_rag: true,
            rerank_top_k: None,
            model: None,
            alternate_query: None,
        }
    }
}

/// Final shape of one `query()`/`find_all_occurrences()` call.
#[derive(Debug, Clone)]
pub struct Response {
    pub answer: String,
    /// Distinct source document names the citations came from.
    pub sources: Vec<String>,
    pub citations: Vec<Citation>,
    pub num_chunks_used: usize,
    pub response_time_ms: u128,
    pub context_tokens: usize,
    pub response_tokens: usize,
    pub total_tokens: usize,
    /// Sub-questions the planner decomposed this query into, empty unless
    /// agentic decomposition fired.
    pub sub_queries: Vec<String>,
}

/// Split `text` into candidate sentences at whitespace following a
/// `.`/`!`/`?`. The `regex` crate has no look-around support, so this scans
/// char-by-char instead of using a look-behind pattern.
fn split_sentences(text: &str) -> Vec<String> {
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
                if !sentence.trim().is_empty() {
                    sentences.push(sentence);
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
        if !tail.trim().is_empty() {
            sentences.push(tail);
        }
    }
    sentences
}

fn content_hash(text: &str) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    let prefix: String = text.chars().take(100).collect();
    prefix.hash(&mut hasher);
    hasher.finish()
}

pub struct RetrievalEngine {
    router: IndexRouter,
    store: Arc<dyn VectorStore>,
    fanout: MultiIndexFanout,
    executor: Arc<SearchExecutor>,
    embeddings: Arc<dyn EmbeddingProvider>,
    reranker: Option<Arc<dyn Reranker>>,
    assembler: AnswerAssembler<dyn LlmProvider>,
    config: RetrievalConfig,
}

impl RetrievalEngine {
    pub fn new(
        config: RetrievalConfig,
        store: Arc<dyn VectorStore>,
        embeddings: Arc<dyn EmbeddingProvider>,
        llm: Arc<dyn LlmProvider>,
        reranker: Option<Arc<dyn Reranker>>,
    ) -> Self {
        let executor = Arc::new(SearchExecutor::new(
            store.clone(),
            config.search.clone(),
            config.cache.capacity,
            config.cache.ttl(),
        ));
        let fanout = MultiIndexFanout::new(
            executor.clone(),
            FanoutConfig { max_workers: config.search.max_fanout_workers },
        );
        let assembler = AnswerAssembler::new(llm, config.assembler.clone());

        Self {
            router: IndexRouter::new(),
            store,
            fanout,
            executor,
            embeddings,
            reranker,
            assembler,
            config,
        }
    }

    /// The index router, exposed so the (out-of-scope) ingestion pipeline
    /// can register documents as they're indexed.
    pub fn router(&self) -> &IndexRouter {
        &self.router
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    /// Answer a question end to end: plan, retrieve, (maybe) rerank, build
    /// citations, and assemble a final answer — or short-circuit into the
    /// occurrence-search path when the question asks to enumerate a term.
    pub async fn query(&self, question: &str, options: QueryOptions) -> RetrievalResult<Response> {
        let start = Instant::now();

        let available_docs = self.router.document_names();
        let default_k = if options.k > 0 { options.k } else { self.config.search.default_k };
        let agentic_enabled = options.use_agentic_rag && self.config.features.enable_agentic_rag;
        let plan = planner::plan_query(question, default_k, &self.config.planner, &available_docs, agentic_enabled);

        let base_index_ids = self.router.resolve(&options.active_sources);
        if base_index_ids.is_empty() {
            return Err(RetrievalError::EmptySelection);
        }
        let index_ids = match &plan.scoped_documents {
            Some(scoped) => {
                let narrowed = self.router.resolve(scoped);
                if narrowed.is_empty() { base_index_ids } else { narrowed }
            }
            None => base_index_ids,
        };

        if plan.is_occurrence_query() {
            return self.answer_occurrence(&plan, &index_ids, start).await;
        }

        let semantic_weight = options.semantic_weight.unwrap_or(self.config.search.hybrid_alpha);
        let keyword_weight = options.keyword_weight.unwrap_or(1.0 - self.config.search.hybrid_alpha);
        let should_rerank =
            !plan.disable_reranking && self.config.features.enable_reranking && self.reranker.is_some();
        let rerank_top_k = options.rerank_top_k.unwrap_or(default_k);

        let sub_queries: Vec<String> =
            plan.decomposition.as_ref().map(|d| d.sub_queries.clone()).unwrap_or_default();

        let mut candidates = if sub_queries.is_empty() {
            self.retrieve_single(&plan, &index_ids, default_k, should_rerank, semantic_weight, keyword_weight, &options)
                .await?
        } else {
            self.retrieve_decomposed(&sub_queries, &index_ids, should_rerank, semantic_weight, keyword_weight, &options)
                .await?
        };

        if should_rerank {
            if let Some(reranker) = &self.reranker {
                candidates = apply_reranking(reranker.as_ref(), question, candidates, rerank_top_k).await;
            }
        } else {
            candidates.truncate(rerank_top_k);
        }

        let citations = self.build_citations(question, &candidates).await;

        let assembled = self
            .assembler
            .assemble(question, citations, options.model.as_deref())
            .await
            .map_err(|e| RetrievalError::backend("llm_provider", e))?;

        let mut sources: Vec<String> = assembled.citations.iter().map(|c| c.source.clone()).collect();
        sources.sort();
        sources.dedup();

        Ok(Response {
            answer: assembled.answer,
            sources,
            num_chunks_used: assembled.citations.len(),
            citations: assembled.citations,
            context_tokens: assembled.context_tokens,
            response_tokens: assembled.response_tokens,
            total_tokens: assembled.context_tokens + assembled.response_tokens,
            sub_queries,
            response_time_ms: start.elapsed().as_millis(),
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn retrieve_single(
        &self,
        plan: &QueryPlan,
        index_ids: &[String],
        default_k: usize,
        should_rerank: bool,
        semantic_weight: f32,
        keyword_weight: f32,
        options: &QueryOptions,
    ) -> RetrievalResult<Vec<ScoredChunk>> {
        let query_text = &plan.retrieval_query;
        let query_vector = self
            .embeddings
            .embed_query(query_text)
            .await
            .map_err(|e| RetrievalError::backend("embedding_provider", e))?;

        let base_k = plan.suggested_k.unwrap_or(default_k);
        let fetch_k = if should_rerank { base_k * self.config.rerank.expansion_multiplier } else { base_k };

        Ok(self
            .fanout
            .search_across(
                query_text,
                &query_vector,
                index_ids,
                fetch_k,
                semantic_weight,
                keyword_weight,
                None,
                options.alternate_query.clone(),
            )
            .await)
    }

    /// Retrieve each sub-query independently, merging into a single
    /// deduplicated pool capped at `planner.max_total_chunks`, per §4.6's
    /// agentic decomposition path.
    async fn retrieve_decomposed(
        &self,
        sub_queries: &[String],
        index_ids: &[String],
        should_rerank: bool,
        semantic_weight: f32,
        keyword_weight: f32,
        options: &QueryOptions,
    ) -> RetrievalResult<Vec<ScoredChunk>> {
        let per_subquery_k = self.config.planner.chunks_per_subquery;
        let max_total = self.config.planner.max_total_chunks;
        let mut merged: Vec<ScoredChunk> = Vec::new();
        let mut seen: HashSet<u64> = HashSet::new();

        for sub_query in sub_queries {
            let query_vector = self
                .embeddings
                .embed_query(sub_query)
                .await
                .map_err(|e| RetrievalError::backend("embedding_provider", e))?;
            let fetch_k =
                if should_rerank { per_subquery_k * self.config.rerank.expansion_multiplier } else { per_subquery_k };

            let results = self
                .fanout
                .search_across(
                    sub_query,
                    &query_vector,
                    index_ids,
                    fetch_k,
                    semantic_weight,
                    keyword_weight,
                    None,
                    options.alternate_query.clone(),
                )
                .await;

            for scored in results {
                if seen.insert(content_hash(&scored.chunk.text)) {
                    merged.push(scored);
                }
            }
            if merged.len() >= max_total {
                break;
            }
        }

        merged.truncate(max_total);
        Ok(merged)
    }

    /// Skip the reranker and LLM entirely and enumerate every occurrence of
    /// the detected term across the scoped indexes, per §4.6.
    async fn answer_occurrence(
        &self,
        plan: &QueryPlan,
        index_ids: &[String],
        start: Instant,
    ) -> RetrievalResult<Response> {
        let term = plan.occurrence_term.clone().unwrap_or_default();

        let mut chunks: Vec<Chunk> = Vec::new();
        for index_id in index_ids {
            let shard = self
                .store
                .all_chunks(index_id)
                .await
                .map_err(|e| RetrievalError::backend("vector_store", e))?;
            chunks.extend(shard);
        }

        let default_source = chunks.first().map(|c| c.source.clone()).unwrap_or_else(|| "document".to_string());
        let result = planner::find_all_occurrences(
            &term,
            &chunks,
            &default_source,
            self.config.planner.max_occurrence_results,
            self.config.planner.occurrence_context_chars,
        );

        let mut sources = result.sources;
        sources.sort();
        sources.dedup();

        Ok(Response {
            answer: result.answer,
            num_chunks_used: result.citations.len(),
            citations: result.citations,
            sources,
            context_tokens: 0,
            response_tokens: 0,
            total_tokens: 0,
            sub_queries: Vec::new(),
            response_time_ms: start.elapsed().as_millis(),
        })
    }

    /// Enumerate every occurrence of `term`, independent of `query()`'s own
    /// occurrence-query detection — used when a caller already knows it
    /// wants an exhaustive scan rather than a generated answer.
    pub async fn find_all_occurrences(
        &self,
        term: &str,
        active_sources: &[String],
        max_results: usize,
    ) -> RetrievalResult<Response> {
        let start = Instant::now();
        let index_ids = self.router.resolve(active_sources);
        if index_ids.is_empty() {
            return Err(RetrievalError::EmptySelection);
        }

        let mut chunks: Vec<Chunk> = Vec::new();
        for index_id in &index_ids {
            let shard = self
                .store
                .all_chunks(index_id)
                .await
                .map_err(|e| RetrievalError::backend("vector_store", e))?;
            chunks.extend(shard);
        }
        let default_source = chunks.first().map(|c| c.source.clone()).unwrap_or_else(|| "document".to_string());
        let result = planner::find_all_occurrences(
            term,
            &chunks,
            &default_source,
            max_results.max(1),
            self.config.planner.occurrence_context_chars,
        );

        let mut sources = result.sources;
        sources.sort();
        sources.dedup();

        Ok(Response {
            answer: result.answer,
            num_chunks_used: result.citations.len(),
            citations: result.citations,
            sources,
            context_tokens: 0,
            response_tokens: 0,
            total_tokens: 0,
            sub_queries: Vec::new(),
            response_time_ms: start.elapsed().as_millis(),
        })
    }

    /// Hybrid search restricted to each active source's image-OCR index,
    /// returning citations rather than an assembled answer since there is
    /// no generation step on this path.
    pub async fn search_images(&self, query: &str, active_sources: &[String], k: usize) -> RetrievalResult<Vec<Citation>> {
        let image_index_ids = self.router.resolve_images(active_sources);
        if image_index_ids.is_empty() {
            return Err(RetrievalError::EmptySelection);
        }

        let query_vector = self
            .embeddings
            .embed_query(query)
            .await
            .map_err(|e| RetrievalError::backend("embedding_provider", e))?;
        let semantic_weight = self.config.search.hybrid_alpha;
        let keyword_weight = 1.0 - semantic_weight;

        let candidates = self
            .fanout
            .search_across(query, &query_vector, &image_index_ids, k.max(1), semantic_weight, keyword_weight, None, None)
            .await;

        Ok(self.build_citations(query, &candidates).await)
    }

    /// Drop cached search results for one document (by resolving it back to
    /// its physical index), or every cached result when `document_id` is
    /// `None`. Called by the (out-of-scope) ingestion pipeline after a write.
    pub fn invalidate_cache(&self, document_id: Option<&str>) {
        match document_id {
            Some(doc) => {
                for index_id in self.router.resolve(&[doc.to_string()]) {
                    self.executor.invalidate(Some(&index_id));
                }
            }
            None => self.executor.invalidate(None),
        }
    }

    async fn build_citations(&self, query: &str, candidates: &[ScoredChunk]) -> Vec<Citation> {
        if candidates.is_empty() {
            return Vec::new();
        }

        let embedding_cache = self.precompute_snippet_embeddings(query, candidates).await;
        let fallback_sources: Vec<String> = candidates.iter().map(|c| c.chunk.source.clone()).collect();
        let embed = |text: &str| embedding_cache.get(text).cloned();

        candidates
            .iter()
            .enumerate()
            .map(|(i, scored)| {
                let ctx = CitationContext {
                    query,
                    document_index: None,
                    fallback_sources: &fallback_sources,
                    doc_pages: None,
                    snippet_max_length: 500,
                    embed: &embed,
                };
                citation::build_citation(i + 1, scored, &ctx)
            })
            .collect()
    }

    /// The citation snippet generator's semantic scoring takes a
    /// synchronous `Fn(&str) -> Option<Vec<f32>>` closure, but embedding
    /// providers are async. Batch-embed the query plus every candidate
    /// sentence up front with one `embed_documents` call, then hand the
    /// citation builder a synchronous lookup over the resulting cache —
    /// any text that didn't make the batch (or whose embedding failed)
    /// just falls back to the keyword-centered snippet path.
    async fn precompute_snippet_embeddings(
        &self,
        query: &str,
        candidates: &[ScoredChunk],
    ) -> HashMap<String, Vec<f32>> {
        let mut texts: Vec<String> = vec![query.to_string()];
        for scored in candidates {
            for sentence in split_sentences(&scored.chunk.text) {
                let trimmed = sentence.trim();
                if trimmed.len() > 5 {
                    texts.push(trimmed.to_string());
                }
            }
        }
        texts.sort();
        texts.dedup();

        match self.embeddings.embed_documents(&texts).await {
            Ok(vectors) if vectors.len() == texts.len() => texts.into_iter().zip(vectors).collect(),
            Ok(_) => {
                warn!("embedding provider returned a mismatched batch size, skipping snippet cache");
                HashMap::new()
            }
            Err(err) => {
                warn!(error = %err, "snippet embedding precompute failed, falling back to keyword snippets");
                HashMap::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::{
        ChatCompletion, ChatMessage, GenerationConfig, LexicalQuery, RerankScore, StoreHit, TokenUsage, VectorQuery,
    };
    use crate::types::{ChunkMetadata, ContentType};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn chunk(id: &str, source: &str, text: &str) -> Chunk {
        Chunk {
            id: id.to_string(),
            text: text.to_string(),
            vector: vec![0.1, 0.2],
            source: source.to_string(),
            document_id: source.to_string(),
            page: 1,
            start_char: 0,
            end_char: text.len(),
            chunk_index: 0,
            language: "eng".to_string(),
            content_type: ContentType::Text,
            page_blocks: vec![],
            image_ref: None,
            text_english: None,
            metadata: ChunkMetadata { source: Some(source.to_string()), ..Default::default() },
        }
    }

    struct FakeStore {
        chunks: Vec<Chunk>,
    }

    #[async_trait]
    impl VectorStore for FakeStore {
        async fn vector_search(&self, _index_name: &str, query: &VectorQuery) -> anyhow::Result<Vec<StoreHit>> {
            Ok(self
                .chunks
                .iter()
                .take(query.fetch_k)
                .map(|c| StoreHit { chunk: c.clone(), score: 0.9 })
                .collect())
        }

        async fn lexical_search(&self, _index_name: &str, query: &LexicalQuery) -> anyhow::Result<Vec<StoreHit>> {
            Ok(self
                .chunks
                .iter()
                .filter(|c| c.text.to_lowercase().contains(&query.text.to_lowercase()))
                .map(|c| StoreHit { chunk: c.clone(), score: 5.0 })
                .collect())
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
            Ok(Some(2))
        }

        async fn count(&self, _index_name: &str) -> anyhow::Result<usize> {
            Ok(self.chunks.len())
        }

        async fn all_chunks(&self, _index_name: &str) -> anyhow::Result<Vec<Chunk>> {
            Ok(self.chunks.clone())
        }
    }

    struct FakeEmbeddings;

    #[async_trait]
    impl EmbeddingProvider for FakeEmbeddings {
        async fn embed_query(&self, _text: &str) -> anyhow::Result<Vec<f32>> {
            Ok(vec![0.1, 0.2])
        }

        async fn embed_documents(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|_| vec![0.1, 0.2]).collect())
        }

        fn dimension(&self) -> usize {
            2
        }
    }

    struct FakeLlm {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl LlmProvider for FakeLlm {
        async fn chat(&self, _messages: &[ChatMessage], _config: &GenerationConfig) -> anyhow::Result<ChatCompletion> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ChatCompletion {
                content: "The quarterly revenue grew according to the filing.".to_string(),
                usage: TokenUsage { prompt_tokens: 100, completion_tokens: 12 },
            })
        }
    }

    fn engine(chunks: Vec<Chunk>) -> RetrievalEngine {
        let mut config = RetrievalConfig::default();
        config.features.enable_reranking = false;
        config.features.enable_agentic_rag = false;
        let store: Arc<dyn VectorStore> = Arc::new(FakeStore { chunks });
        let embeddings: Arc<dyn EmbeddingProvider> = Arc::new(FakeEmbeddings);
        let llm: Arc<dyn LlmProvider> = Arc::new(FakeLlm { calls: AtomicUsize::new(0) });
        RetrievalEngine::new(config, store, embeddings, llm, None)
    }

    #[tokio::test]
    async fn query_with_no_registered_documents_is_empty_selection() {
        let engine = engine(vec![chunk("c1", "a.pdf", "Some quarterly revenue text.")]);
        let err = engine.query("what is the revenue?", QueryOptions::default()).await.unwrap_err();
        assert!(matches!(err, RetrievalError::EmptySelection));
    }

    #[tokio::test]
    async fn query_returns_an_assembled_answer_with_citations() {
        let engine = engine(vec![chunk("c1", "filing.pdf", "The quarterly revenue grew substantially this year.")]);
        engine.router().register("filing.pdf", "idx-filing");

        let response = engine.query("What was the quarterly revenue?", QueryOptions::default()).await.unwrap();
        assert!(!response.citations.is_empty());
        assert_eq!(response.sources, vec!["filing.pdf".to_string()]);
        assert!(response.answer.contains("revenue"));
    }

    #[tokio::test]
    async fn occurrence_query_skips_llm_and_reranker() {
        let engine = engine(vec![
            chunk("c1", "catalog.pdf", "The part SKU-4412 appears here."),
            chunk("c2", "catalog.pdf", "Another mention of SKU-4412 shows up."),
        ]);
        engine.router().register("catalog.pdf", "idx-catalog");

        let response = engine
            .query("find all occurrences of SKU-4412", QueryOptions::default())
            .await
            .unwrap();
        assert_eq!(response.citations.len(), 2);
        assert!(response.answer.contains("Found 2 occurrence(s) of 'SKU-4412'"));
        assert_eq!(response.context_tokens, 0);
        assert_eq!(response.response_tokens, 0);
    }

    #[tokio::test]
    async fn invalidate_cache_for_unknown_document_is_a_noop() {
        let engine = engine(vec![chunk("c1", "a.pdf", "text")]);
        engine.invalidate_cache(Some("unregistered.pdf"));
        engine.invalidate_cache(None);
    }
}
