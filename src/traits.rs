//! The four external interfaces the retrieval core is built against:
//! [`VectorStore`], [`EmbeddingProvider`], [`LlmProvider`] and [`Reranker`].
//!
//! Each generalizes a concrete teacher abstraction — `EmbeddingModel`
//! (`embeddings/mod.rs`), the `LLMProvider` trait (`llm/mod.rs`,
//! `llm/external.rs`) and the implicit reranker contract in
//! `reranking/cross_encoder.rs` — into dependency-injected seams so the
//! engine can be exercised against in-memory fakes in tests. Trait methods
//! keep returning `anyhow::Result`, matching the teacher's own provider
//! traits; the engine converts failures into [`crate::error::RetrievalError`]
//! at the public boundary.

use crate::types::{Chunk, MetadataFilter};
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A single k-NN or lexical hit returned by a [`VectorStore`] sub-query,
/// before fusion.
#[derive(Debug, Clone)]
pub struct StoreHit {
    pub chunk: Chunk,
    /// Backend-native score: cosine/L2 similarity for vector hits, BM25-like
    /// relevance for lexical hits. Not yet comparable across the two lists —
    /// fusion (RRF) operates on rank, not this raw value.
    pub score: f32,
}

/// One leg of the batched multi-search issued by the search executor (§4.2
/// step 2): either the k-NN vector leg or the lexical leg with its boost
/// schedule already applied by the backend.
#[derive(Debug, Clone)]
pub struct VectorQuery {
    pub vector: Vec<f32>,
    pub fetch_k: usize,
    pub ef_search: usize,
    pub min_score: Option<f32>,
    pub filter: Option<MetadataFilter>,
}

#[derive(Debug, Clone)]
pub struct LexicalQuery {
    pub text: String,
    /// Present for cross-language retrieval; adds the alternate-language
    /// phrase/multi-match clauses per §4.2.
    pub alternate_text: Option<String>,
    pub fetch_k: usize,
    pub filter: Option<MetadataFilter>,
    pub boost_phrase_slop1: f32,
    pub boost_phrase_slop3: f32,
    pub boost_fuzzy_multi_match: f32,
    pub boost_alt_phrase_slop2: f32,
    pub boost_alt_multi_match: f32,
}

/// Backing store for one document's chunks: k-NN vector search, lexical
/// search, and the mutations ingestion performs. The core never talks to
/// LanceDB/Tantivy directly outside of the one adapter implementing this
/// trait (`storage::LanceTantivyStore`).
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// k-NN vector search against `index_name`'s `vector_field`.
    async fn vector_search(&self, index_name: &str, query: &VectorQuery) -> Result<Vec<StoreHit>>;

    /// Lexical `multi_match`/`match_phrase` search against `index_name`.
    async fn lexical_search(&self, index_name: &str, query: &LexicalQuery) -> Result<Vec<StoreHit>>;

    /// Issue the vector and lexical legs as a single batched multi-search
    /// call where the backend supports it. The default implementation runs
    /// them concurrently with `tokio::try_join!`, which is the fallback
    /// path described in §4.2 step 3 for backends without native batching.
    async fn multi_search(
        &self,
        index_name: &str,
        vector_query: &VectorQuery,
        lexical_query: &LexicalQuery,
    ) -> Result<(Vec<StoreHit>, Vec<StoreHit>)> {
        tokio::try_join!(
            self.vector_search(index_name, vector_query),
            self.lexical_search(index_name, lexical_query)
        )
    }

    /// Delete every chunk whose `document_id` matches, used on re-ingestion
    /// and document removal.
    async fn delete_by_document(&self, index_name: &str, document_id: &str) -> Result<()>;

    /// Create `index_name` with the given vector dimension if absent.
    async fn ensure_index(&self, index_name: &str, dimension: usize) -> Result<()>;

    async fn delete_index(&self, index_name: &str) -> Result<()>;

    async fn index_exists(&self, index_name: &str) -> Result<bool>;

    /// The `knn_vector` dimension the index was created with, if it exists.
    /// Used by the search executor's dimension-validation check.
    async fn index_dimension(&self, index_name: &str) -> Result<Option<usize>>;

    /// Total chunk count, used by the planner's occurrence-query path to
    /// decide whether a source has been indexed at all.
    async fn count(&self, index_name: &str) -> Result<usize>;

    /// Return every chunk for `index_name`, in storage order. Used by
    /// `find_all_occurrences` (§4.6), which must scan full chunk text rather
    /// than similarity-ranked candidates.
    async fn all_chunks(&self, index_name: &str) -> Result<Vec<Chunk>>;
}

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed_query(&self, text: &str) -> Result<Vec<f32>>;

    async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    fn dimension(&self) -> usize;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: usize,
    pub stop: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
}

#[derive(Debug, Clone)]
pub struct ChatCompletion {
    pub content: String,
    pub usage: TokenUsage,
}

#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn chat(&self, messages: &[ChatMessage], config: &GenerationConfig) -> Result<ChatCompletion>;
}

/// Cross-encoder score for one (query, passage) pair, keyed by the passage's
/// position in the batch the reranker was given.
#[derive(Debug, Clone)]
pub struct RerankScore {
    pub id: usize,
    pub score: f32,
}

#[async_trait]
pub trait Reranker: Send + Sync {
    /// Score every passage against `query`; the caller sorts and truncates.
    /// Scores must be in `[0, 1]` per §4.4's contract.
    async fn rerank(&self, query: &str, passages: &[String]) -> Result<Vec<RerankScore>>;
}
