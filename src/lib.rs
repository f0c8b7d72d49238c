//! Retrieval core: hybrid (vector + lexical) search across a sharded set of
//! per-document indexes, cross-encoder reranking, citation extraction with
//! validated page numbers, query planning, and grounded answer assembly.
//!
//! The pieces are independently testable against the seams in [`traits`]:
//! [`router`] resolves document names to physical index handles, [`search`]
//! runs hybrid vector+lexical queries with reciprocal-rank fusion,
//! [`fanout`] spreads a query across multiple indexes concurrently,
//! [`reranking`] re-scores candidates with a cross-encoder,
//! [`citation`] builds source/page/snippet citation chains, [`planner`]
//! classifies and decomposes incoming queries, and [`assembler`] packs
//! context and invokes an LLM to produce the final grounded answer.
//! [`engine::RetrievalEngine`] wires all of this into a single
//! `query()` / `find_all_occurrences()` / `search_images()` entry point.

pub mod assembler;
pub mod cache;
pub mod citation;
pub mod config;
pub mod engine;
pub mod error;
pub mod fanout;
pub mod llm_provider;
pub mod planner;
pub mod query_decomposer;
pub mod reranking;
pub mod router;
pub mod search;
pub mod storage;
pub mod traits;
pub mod types;

pub use config::RetrievalConfig;
pub use engine::{QueryOptions, Response, RetrievalEngine};
pub use error::{RetrievalError, RetrievalResult};
pub use traits::{EmbeddingProvider, LlmProvider, Reranker, VectorStore};
pub use types::{
    Chunk, ChunkMetadata, Citation, ContentType, MetadataFilter, PageBlock, ScoredChunk,
};
