//! Typed error taxonomy for the retrieval core.
//!
//! Every public operation returns [`RetrievalResult<T>`] rather than the
//! teacher crate's blanket `anyhow::Result`. Internal helpers that just need
//! ad-hoc context (parsing a config file, walking a directory) may still use
//! `anyhow` the way the rest of the corpus does; at the public seams of
//! `router`, `search`, `fanout`, `reranking`, `citation`, `planner` and
//! `assembler` we convert into one of the variants below.

use thiserror::Error;

pub type RetrievalResult<T> = std::result::Result<T, RetrievalError>;

#[derive(Debug, Error)]
pub enum RetrievalError {
    /// Missing credentials, invalid store endpoint, invalid index name. Fatal at startup.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Embedding dimension does not match the index's configured dimension.
    #[error("embedding dimension mismatch: index expects {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Vector store, embedding provider, or LLM unreachable.
    #[error("{backend} unavailable: {source}")]
    BackendUnavailable {
        backend: &'static str,
        #[source]
        source: anyhow::Error,
    },

    /// No known indexes for the requested active sources.
    #[error("no indexes resolved for the requested document selection")]
    EmptySelection,

    /// Context exceeded the token budget. Always recovered via truncation
    /// internally (see `assembler::context`); this variant exists so the
    /// condition is testable, not because it is ever surfaced to a caller.
    #[error("context of {actual} tokens exceeds budget of {limit}")]
    Oversize { limit: usize, actual: usize },

    /// Page out of range, source unresolvable, or similar non-fatal
    /// attribute validation. Handled inline with confidence degradation;
    /// constructing this variant is for tests and internal bookkeeping.
    #[error("validation failed for {field}: {reason}")]
    Validation { field: &'static str, reason: String },
}

impl RetrievalError {
    pub fn backend(backend: &'static str, source: impl Into<anyhow::Error>) -> Self {
        Self::BackendUnavailable {
            backend,
            source: source.into(),
        }
    }
}
